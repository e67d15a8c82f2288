//! Page manipulation over raw document bytes.
//!
//! Everything here is a pure function of its inputs: split and append take the
//! current bytes and hand back new bytes plus the page geometry the caller needs
//! for its page rows. Identical inputs produce identical output, so storing the
//! result under a content derived key is idempotent.
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};

use crate::error::DocumentError;

pub const PDF_MIME: &str = "application/pdf";
pub const PNG_MIME: &str = "image/png";
pub const JPEG_MIME: &str = "image/jpeg";

// US Letter, used when a page tree carries no MediaBox at all
const DEFAULT_PAGE_SIZE: (f32, f32) = (612.0, 792.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Image,
}

impl SourceKind {
    pub fn from_mime(mime_type: &str) -> Result<Self, DocumentError> {
        match mime_type {
            PDF_MIME => Ok(SourceKind::Pdf),
            PNG_MIME | JPEG_MIME => Ok(SourceKind::Image),
            other => Err(DocumentError::InvalidType(format!(
                "{other} is not a supported document type"
            ))),
        }
    }

    pub fn extension(mime_type: &str) -> &'static str {
        match mime_type {
            PDF_MIME => "pdf",
            PNG_MIME => "png",
            JPEG_MIME => "jpg",
            _ => "bin",
        }
    }
}

/// Inclusive, 1-indexed page range.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    #[n(0)]
    pub from: u32,
    #[n(1)]
    pub to: u32,
}

impl PageRange {
    pub fn new(from: u32, to: u32) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, page: u32) -> bool {
        self.from <= page && page <= self.to
    }
}

/// Checks a split request against the source page count.
pub fn validate_ranges(ranges: &[PageRange], page_count: u32) -> Result<(), DocumentError> {
    if page_count < 2 {
        return Err(DocumentError::Validation(format!(
            "a document needs at least 2 pages to be split, it has {page_count}"
        )));
    }
    if ranges.len() < 2 {
        return Err(DocumentError::Validation(format!(
            "a split needs at least 2 page ranges, got {}",
            ranges.len()
        )));
    }
    for range in ranges {
        if range.from < 1 || range.from > range.to || range.to > page_count {
            return Err(DocumentError::Validation(format!(
                "page range {}-{} is outside 1-{page_count} or reversed",
                range.from, range.to
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageInfo {
    pub number: u32,
    pub width: f32,
    pub height: f32,
    pub fingerprint: String,
}

/// A file to append.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SplitPart {
    pub range: PageRange,
    pub bytes: Vec<u8>,
    pub pages: Vec<PageInfo>,
}

#[derive(Debug, Clone)]
pub struct AppendedDocument {
    pub bytes: Vec<u8>,
    /// Geometry of the new pages only, numbered in their final position
    pub added: Vec<PageInfo>,
    pub total_pages: u32,
}

/// Page geometry of an uploaded file. Raster images are a single page.
pub fn describe(mime_type: &str, bytes: &[u8]) -> Result<Vec<PageInfo>, DocumentError> {
    match SourceKind::from_mime(mime_type)? {
        SourceKind::Pdf => {
            let document = Document::load_mem(bytes).map_err(|e| {
                DocumentError::InvalidType(format!("file is not a readable PDF: {e}"))
            })?;
            describe_pdf(&document)
        }
        SourceKind::Image => {
            let image = image::load_from_memory(bytes).map_err(|e| {
                DocumentError::InvalidType(format!("file is not a readable image: {e}"))
            })?;
            Ok(vec![PageInfo {
                number: 1,
                width: image.width() as f32,
                height: image.height() as f32,
                fingerprint: sha256::digest(bytes),
            }])
        }
    }
}

pub fn page_count(bytes: &[u8]) -> Result<u32, DocumentError> {
    let document = load_stored(bytes)?;
    Ok(document.get_pages().len() as u32)
}

/// Copies each range of `bytes` into a document of its own.
pub fn split(bytes: &[u8], ranges: &[PageRange]) -> Result<Vec<SplitPart>, DocumentError> {
    let source = load_stored(bytes)?;
    let page_count = source.get_pages().len() as u32;
    validate_ranges(ranges, page_count)?;

    let mut parts = Vec::with_capacity(ranges.len());
    for range in ranges {
        let mut part = source.clone();
        let dropped: Vec<u32> = (1..=page_count).filter(|p| !range.contains(*p)).collect();
        part.delete_pages(&dropped);
        part.prune_objects();

        let pages = describe_pdf(&part)?;
        parts.push(SplitPart {
            range: *range,
            bytes: save(&mut part)?,
            pages,
        });
    }
    Ok(parts)
}

/// Appends every file to the end of `bytes`, rasterised images becoming one page each.
pub fn append(bytes: &[u8], files: &[SourceFile]) -> Result<AppendedDocument, DocumentError> {
    let mut target = load_stored(bytes)?;
    let before = target.get_pages().len() as u32;
    let pages_id = root_pages_id(&target)?;

    for file in files {
        match SourceKind::from_mime(&file.mime_type)? {
            SourceKind::Pdf => graft_pdf(&mut target, pages_id, file)?,
            SourceKind::Image => add_image_page(&mut target, pages_id, file)?,
        }
    }

    let all = describe_pdf(&target)?;
    let total_pages = all.len() as u32;
    let added = all.into_iter().filter(|p| p.number > before).collect();
    Ok(AppendedDocument {
        bytes: save(&mut target)?,
        added,
        total_pages,
    })
}

fn load_stored(bytes: &[u8]) -> Result<Document, DocumentError> {
    Document::load_mem(bytes)
        .map_err(|e| DocumentError::Storage(format!("stored document is not a readable PDF: {e}")))
}

fn save(document: &mut Document) -> Result<Vec<u8>, DocumentError> {
    let mut buffer = Vec::new();
    document
        .save_to(&mut buffer)
        .map_err(|e| DocumentError::Internal(format!("failed to write PDF: {e}")))?;
    Ok(buffer)
}

fn pdf_error(e: lopdf::Error) -> DocumentError {
    DocumentError::Internal(format!("malformed PDF structure: {e}"))
}

fn describe_pdf(document: &Document) -> Result<Vec<PageInfo>, DocumentError> {
    let mut pages = Vec::new();
    for (number, page_id) in document.get_pages() {
        let (width, height) = media_box(document, page_id);
        let content = document.get_page_content(page_id).unwrap_or_default();
        let mut material = content;
        material.extend_from_slice(format!("{width}x{height}").as_bytes());
        pages.push(PageInfo {
            number,
            width,
            height,
            fingerprint: sha256::digest(material.as_slice()),
        });
    }
    Ok(pages)
}

// MediaBox is inheritable, so walk up the page tree until one is found.
fn media_box(document: &Document, page_id: ObjectId) -> (f32, f32) {
    let mut current = Some(page_id);
    while let Some(id) = current {
        let Ok(node) = document.get_dictionary(id) else {
            break;
        };
        if let Some(size) = node
            .get(b"MediaBox")
            .ok()
            .and_then(|boxed| resolve(document, boxed).as_array().ok())
            .and_then(|values| box_size(values))
        {
            return size;
        }
        current = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    DEFAULT_PAGE_SIZE
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => document.get_object(*id).unwrap_or(object),
        _ => object,
    }
}

fn box_size(values: &[Object]) -> Option<(f32, f32)> {
    let numbers: Vec<f32> = values.iter().filter_map(number).collect();
    match numbers.as_slice() {
        [x0, y0, x1, y1] => Some(((x1 - x0).abs(), (y1 - y0).abs())),
        _ => None,
    }
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}

fn root_pages_id(document: &Document) -> Result<ObjectId, DocumentError> {
    let catalog_id = document
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(pdf_error)?;
    document
        .get_dictionary(catalog_id)
        .and_then(|catalog| catalog.get(b"Pages"))
        .and_then(Object::as_reference)
        .map_err(pdf_error)
}

fn attach_kid(
    document: &mut Document,
    pages_id: ObjectId,
    kid: ObjectId,
    page_count: i64,
) -> Result<(), DocumentError> {
    let pages = document.get_dictionary_mut(pages_id).map_err(pdf_error)?;
    let count = pages.get(b"Count").and_then(Object::as_i64).unwrap_or(0);
    match pages.get_mut(b"Kids").and_then(Object::as_array_mut) {
        Ok(kids) => kids.push(Object::Reference(kid)),
        Err(_) => pages.set("Kids", vec![Object::Reference(kid)]),
    }
    pages.set("Count", count + page_count);
    Ok(())
}

// Moves the whole page tree of `file` under the target's root Pages node.
fn graft_pdf(
    target: &mut Document,
    pages_id: ObjectId,
    file: &SourceFile,
) -> Result<(), DocumentError> {
    let mut source = Document::load_mem(&file.bytes).map_err(|e| {
        DocumentError::InvalidType(format!("{} is not a readable PDF: {e}", file.file_name))
    })?;
    source.renumber_objects_with(target.max_id + 1);

    let added_pages = source.get_pages().len() as i64;
    let catalog_id = source
        .objects
        .iter()
        .find(|(_, object)| is_catalog(object))
        .map(|(id, _)| *id)
        .ok_or_else(|| {
            DocumentError::InvalidType(format!("{} has no document catalog", file.file_name))
        })?;
    let source_pages_id = source
        .get_dictionary(catalog_id)
        .and_then(|catalog| catalog.get(b"Pages"))
        .and_then(Object::as_reference)
        .map_err(pdf_error)?;

    for (id, object) in std::mem::take(&mut source.objects) {
        if id != catalog_id {
            target.objects.insert(id, object);
        }
    }
    target.max_id = target.max_id.max(source.max_id);

    target
        .get_dictionary_mut(source_pages_id)
        .map_err(pdf_error)?
        .set("Parent", pages_id);
    attach_kid(target, pages_id, source_pages_id, added_pages)
}

fn is_catalog(object: &Object) -> bool {
    object
        .as_dict()
        .and_then(|dict| dict.get(b"Type"))
        .and_then(Object::as_name)
        .map(|name| name == b"Catalog")
        .unwrap_or(false)
}

fn add_image_page(
    target: &mut Document,
    pages_id: ObjectId,
    file: &SourceFile,
) -> Result<(), DocumentError> {
    let decoded = image::load_from_memory(&file.bytes).map_err(|e| {
        DocumentError::InvalidType(format!("{} is not a readable image: {e}", file.file_name))
    })?;
    let pixels = decoded.to_rgb8();
    let (width, height) = pixels.dimensions();

    let mut raster = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        },
        pixels.into_raw(),
    );
    // uncompressed output is still valid
    let _ = raster.compress();
    let image_id = target.add_object(raster);

    let drawing = format!("q {width} 0 0 {height} 0 0 cm /Im0 Do Q");
    let content_id = target.add_object(Stream::new(Dictionary::new(), drawing.into_bytes()));

    let page_id = target.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), (width as i64).into(), (height as i64).into()],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! {
                "Im0" => image_id,
            },
        },
    });
    attach_kid(target, pages_id, page_id, 1)
}
