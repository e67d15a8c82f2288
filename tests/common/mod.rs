//! Fixtures shared by the integration tests
#![allow(dead_code)]

use anyhow::Context;
use chrono::{NaiveDate, TimeZone, Utc};
use ledger_intake::{
    blob::{BlobStore, SledBlobStore},
    clock::ManualClock,
    collaborators::{Actor, RateTable},
    document::{NewDocument, ProcessingDocument},
    extraction::{ExtractionContext, ExtractionOptions, Extractor, Proposal},
    pages::{JPEG_MIME, PDF_MIME, PNG_MIME, SourceFile},
    revision::{LineItemInput, RevisionHeader},
    service::{DocumentService, DocumentServiceBuilder},
    types::{Amount, CalendarDate},
    DocumentError, Preconditions,
};
use lopdf::{Document, Object, Stream, dictionary};
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};

pub const TENANT: &str = "tenant-1";
pub const COMPANY: &str = "company-1";

/// A PDF with `pages` Letter pages, each carrying its own page number as text.
pub fn make_pdf(pages: u32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    for number in 1..=pages {
        let content = format!("BT /F1 24 Tf 100 700 Td (Page {number}) Tj ET");
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

pub fn make_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

pub fn make_jpeg(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([20, 120, 220]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)
        .unwrap();
    buf
}

pub fn png_file(name: &str, width: u32, height: u32) -> SourceFile {
    SourceFile {
        file_name: name.to_string(),
        mime_type: PNG_MIME.to_string(),
        bytes: make_png(width, height),
    }
}

pub fn jpeg_file(name: &str, width: u32, height: u32) -> SourceFile {
    SourceFile {
        file_name: name.to_string(),
        mime_type: JPEG_MIME.to_string(),
        bytes: make_jpeg(width, height),
    }
}

/// Error code of a failed call, or "OK".
pub fn code<T>(result: Result<T, DocumentError>) -> &'static str {
    match result {
        Ok(_) => "OK",
        Err(e) => e.code().as_str(),
    }
}

pub fn date(y: i32, m: u32, d: u32) -> CalendarDate {
    CalendarDate(NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

/// EUR 100.00 invoice from Acme Supplies, one line, no tax.
pub fn invoice_proposal() -> Proposal {
    Proposal {
        header: RevisionHeader {
            vendor_name: Some("Acme Supplies".into()),
            document_number: Some("INV-1001".into()),
            issue_date: Some(date(2024, 3, 1)),
            due_date: Some(date(2024, 3, 31)),
            currency: Some("EUR".into()),
            subtotal: Some(Amount(dec!(100.00))),
            tax: Some(Amount(dec!(0.00))),
            total: Some(Amount(dec!(100.00))),
        },
        line_items: vec![
            LineItemInput::new(1)
                .set_description("Widgets")
                .set_quantity(dec!(4))
                .set_unit_price(dec!(25.00))
                .set_amount(dec!(100.00)),
        ],
        evidence: vec![],
        bundle_ranges: vec![],
        model: Some("scripted".into()),
    }
}

/// Extractor that replays scripted outcomes, then falls back to a fixed proposal.
pub struct ScriptedExtractor {
    script: Mutex<VecDeque<Result<Proposal, String>>>,
    fallback: Proposal,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new(fallback: Proposal) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, outcome: Result<Proposal, String>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Extractor for ScriptedExtractor {
    fn submit(&self, _bytes: &[u8], _context: &ExtractionContext) -> anyhow::Result<Proposal> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(proposal)) => Ok(proposal),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Sled blob store that counts writes.
pub struct CountingBlobStore {
    inner: SledBlobStore,
    puts: AtomicUsize,
}

impl CountingBlobStore {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl BlobStore for CountingBlobStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, DocumentError> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), DocumentError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, bytes)
    }
}

pub struct Harness {
    _dir: TempDir,
    pub service: DocumentService,
    pub clock: Arc<ManualClock>,
    pub extractor: Arc<ScriptedExtractor>,
    pub blobs: Arc<dyn BlobStore>,
    pub blob_writes: Arc<CountingBlobStore>,
    pub actor: Actor,
}

impl Harness {
    pub fn new() -> anyhow::Result<Self> {
        Self::with(|builder| builder)
    }

    /// Builds a service over a fresh database, letting the test adjust the builder.
    pub fn with(
        adjust: impl FnOnce(DocumentServiceBuilder) -> DocumentServiceBuilder,
    ) -> anyhow::Result<Self> {
        let dir = tempdir()?;
        let db = Arc::new(sled::open(dir.path().join("intake.db"))?);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let extractor = Arc::new(ScriptedExtractor::new(invoice_proposal()));
        let blob_writes = Arc::new(CountingBlobStore {
            inner: SledBlobStore::open(&db)?,
            puts: AtomicUsize::new(0),
        });
        let blobs: Arc<dyn BlobStore> = blob_writes.clone();
        let rates = RateTable::new().pin(
            "EUR",
            "USD",
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            dec!(1.35),
        );

        let builder = DocumentService::builder(db, extractor.clone())
            .with_clock(clock.clone())
            .with_blob_store(blobs.clone())
            .with_exchange_rates(Arc::new(rates));
        let service = adjust(builder).build().context("service failed to build")?;

        Ok(Self {
            _dir: dir,
            service,
            clock,
            extractor,
            blobs,
            blob_writes,
            actor: Actor::new("alice"),
        })
    }

    pub fn upload(&self, file_name: &str, mime_type: &str, bytes: Vec<u8>) -> anyhow::Result<ProcessingDocument> {
        let document = self.service.upload_document(
            &self.actor,
            NewDocument {
                tenant_id: TENANT.into(),
                company_id: COMPANY.into(),
                file_name: file_name.into(),
                mime_type: mime_type.into(),
                bytes,
            },
        )?;
        Ok(document)
    }

    pub fn upload_pdf(&self, pages: u32) -> anyhow::Result<ProcessingDocument> {
        self.upload("scan.pdf", PDF_MIME, make_pdf(pages))
    }

    /// Uploads, extracts and returns the document with its first draft revision id.
    pub fn extracted_draft(&self) -> anyhow::Result<(ProcessingDocument, String)> {
        let document = self.upload_pdf(1)?;
        let ticket = self.service.trigger_extraction(
            &self.actor,
            &document.id,
            &ExtractionOptions::default(),
            &Preconditions::none(),
        )?;
        let report = self
            .service
            .process_extraction_job(&ticket.value.job_id)
            .context("extraction job failed")?;
        let revision_id = report
            .revision_id
            .context("extraction produced no revision")?;
        let document = self.service.get_document(&self.actor, &document.id)?;
        Ok((document, revision_id))
    }

    pub fn lock_version(&self, document_id: &str) -> anyhow::Result<u64> {
        Ok(self.service.get_document(&self.actor, document_id)?.lock_version)
    }
}
