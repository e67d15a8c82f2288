//! Revisions of a document's extracted data, their line items and validation.
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeSet;

use crate::error::DocumentError;
use crate::types::{Amount, CalendarDate, Rate, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Approved,
    #[n(2)]
    Superseded,
}

impl RevisionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RevisionStatus::Draft => "DRAFT",
            RevisionStatus::Approved => "APPROVED",
            RevisionStatus::Superseded => "SUPERSEDED",
        }
    }
}

impl std::fmt::Display for RevisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationStatus {
    #[n(0)]
    #[default]
    Valid,
    #[n(1)]
    Warning,
    #[n(2)]
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStatus::Valid => "VALID",
            ValidationStatus::Warning => "WARNING",
            ValidationStatus::Invalid => "INVALID",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    #[n(0)]
    Error,
    #[n(1)]
    Warning,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    #[n(0)]
    pub field: String,
    #[n(1)]
    pub code: String,
    #[n(2)]
    pub severity: Severity,
    #[n(3)]
    pub message: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    #[n(0)]
    pub status: ValidationStatus,
    #[n(1)]
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn has_code(&self, code: &str) -> bool {
        self.issues.iter().any(|issue| issue.code == code)
    }
}

/// Where a revision's data came from.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionSource {
    #[n(0)]
    Extraction,
    #[n(1)]
    Edit,
}

/// Provenance of one extracted field.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct FieldEvidence {
    #[n(0)]
    pub field: String,
    #[n(1)]
    pub page: Option<u32>,
    #[n(2)]
    pub snippet: Option<String>,
    #[n(3)]
    pub confidence: Option<f64>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Default)]
pub struct RevisionHeader {
    #[n(0)]
    pub vendor_name: Option<String>,
    #[n(1)]
    pub document_number: Option<String>,
    #[n(2)]
    pub issue_date: Option<CalendarDate>,
    #[n(3)]
    pub due_date: Option<CalendarDate>,
    #[n(4)]
    pub currency: Option<String>,
    #[n(5)]
    pub subtotal: Option<Amount>,
    #[n(6)]
    pub tax: Option<Amount>,
    #[n(7)]
    pub total: Option<Amount>,
}

/// Home currency values fixed at approval. Each `*_overridden` flag records that
/// the approver supplied a value that differs from the computed one.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct HomeAmounts {
    #[n(0)]
    pub currency: String,
    #[n(1)]
    pub exchange_rate: Rate,
    #[n(2)]
    pub rate_source: String,
    #[n(3)]
    pub rate_date: Option<CalendarDate>,
    #[n(4)]
    pub subtotal: Option<Amount>,
    #[n(5)]
    pub subtotal_overridden: bool,
    #[n(6)]
    pub tax: Option<Amount>,
    #[n(7)]
    pub tax_overridden: bool,
    #[n(8)]
    pub equivalent: Option<Amount>,
    #[n(9)]
    pub equivalent_overridden: bool,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Default)]
pub struct LineItem {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub line_no: u32,
    #[n(2)]
    pub description: Option<String>,
    #[n(3)]
    pub quantity: Option<Amount>,
    #[n(4)]
    pub unit_price: Option<Amount>,
    #[n(5)]
    pub amount: Option<Amount>,
    #[n(6)]
    pub tax_amount: Option<Amount>,
    #[n(7)]
    pub tax_code: Option<String>,
    #[n(8)]
    pub account_code: Option<String>,
    #[n(9)]
    pub home_amount: Option<Amount>,
    #[n(10)]
    pub home_amount_overridden: bool,
    #[n(11)]
    pub home_tax_amount: Option<Amount>,
    #[n(12)]
    pub home_tax_overridden: bool,
}

pub fn line_item_id(revision_id: &str, line_no: u32) -> String {
    format!("{revision_id}:{line_no}")
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DocumentRevision {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub revision_number: u32,
    #[n(3)]
    pub status: RevisionStatus,
    #[n(4)]
    pub source: RevisionSource,
    #[n(5)]
    pub based_on: Option<String>,
    #[n(6)]
    pub header: RevisionHeader,
    #[n(7)]
    pub counterparty_contact_id: Option<String>,
    #[n(8)]
    pub line_items: Vec<LineItem>,
    #[n(9)]
    pub home: Option<HomeAmounts>,
    #[n(10)]
    pub validation: ValidationReport,
    #[n(11)]
    pub evidence: Vec<FieldEvidence>,
    #[n(12)]
    pub created_by: String,
    #[n(13)]
    pub reason: Option<String>,
    #[n(14)]
    pub created_at: TimeStamp<Utc>,
    #[n(15)]
    pub updated_at: TimeStamp<Utc>,
    #[n(16)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(17)]
    pub approved_by: Option<String>,
}

impl DocumentRevision {
    pub fn ensure_draft(&self) -> Result<(), DocumentError> {
        if self.status != RevisionStatus::Draft {
            return Err(DocumentError::InvalidState(format!(
                "revision {} is {} and can no longer be edited",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Deletes then upserts line items, keeping them ordered by line number.
    pub fn apply_line_changes(
        &mut self,
        upserts: &[LineItemInput],
        deletes: &[u32],
    ) -> Result<(), DocumentError> {
        for line_no in deletes {
            let before = self.line_items.len();
            self.line_items.retain(|item| item.line_no != *line_no);
            if self.line_items.len() == before {
                return Err(DocumentError::Validation(format!(
                    "line {line_no} does not exist on revision {}",
                    self.id
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for input in upserts {
            if input.line_no == 0 {
                return Err(DocumentError::Validation(
                    "line numbers start at 1".to_string(),
                ));
            }
            if !seen.insert(input.line_no) {
                return Err(DocumentError::Validation(format!(
                    "line {} appears twice in one update",
                    input.line_no
                )));
            }
            let item = input.to_line_item(&self.id);
            match self
                .line_items
                .iter_mut()
                .find(|existing| existing.line_no == input.line_no)
            {
                Some(existing) => *existing = item,
                None => self.line_items.push(item),
            }
        }
        self.line_items.sort_by_key(|item| item.line_no);
        Ok(())
    }

    /// Copies header and lines into a new draft. Home values are recomputed at approval.
    pub fn derive_draft(
        &self,
        id: &str,
        revision_number: u32,
        created_by: &str,
        reason: Option<String>,
        now: TimeStamp<Utc>,
    ) -> DocumentRevision {
        let line_items = self
            .line_items
            .iter()
            .map(|item| LineItem {
                id: line_item_id(id, item.line_no),
                home_amount: None,
                home_amount_overridden: false,
                home_tax_amount: None,
                home_tax_overridden: false,
                ..item.clone()
            })
            .collect();

        DocumentRevision {
            id: id.to_string(),
            document_id: self.document_id.clone(),
            revision_number,
            status: RevisionStatus::Draft,
            source: RevisionSource::Edit,
            based_on: Some(self.id.clone()),
            header: self.header.clone(),
            counterparty_contact_id: self.counterparty_contact_id.clone(),
            line_items,
            home: None,
            validation: ValidationReport::default(),
            evidence: self.evidence.clone(),
            created_by: created_by.to_string(),
            reason,
            created_at: now.clone(),
            updated_at: now,
            approved_at: None,
            approved_by: None,
        }
    }
}

/// Replacement content for one line, addressed by line number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineItemInput {
    pub line_no: u32,
    pub description: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
    pub tax_code: Option<String>,
    pub account_code: Option<String>,
}

impl LineItemInput {
    pub fn new(line_no: u32) -> Self {
        Self {
            line_no,
            ..Self::default()
        }
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
    pub fn set_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }
    pub fn set_unit_price(mut self, price: Decimal) -> Self {
        self.unit_price = Some(price);
        self
    }
    pub fn set_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }
    pub fn set_tax_amount(mut self, tax: Decimal) -> Self {
        self.tax_amount = Some(tax);
        self
    }
    pub fn set_account_code(mut self, code: &str) -> Self {
        self.account_code = Some(code.to_string());
        self
    }

    pub fn to_line_item(&self, revision_id: &str) -> LineItem {
        LineItem {
            id: line_item_id(revision_id, self.line_no),
            line_no: self.line_no,
            description: self.description.clone(),
            quantity: self.quantity.map(Amount),
            unit_price: self.unit_price.map(Amount),
            amount: self.amount.map(Amount),
            tax_amount: self.tax_amount.map(Amount),
            tax_code: self.tax_code.clone(),
            account_code: self.account_code.clone(),
            ..LineItem::default()
        }
    }
}

/// Header changes. `None` leaves a field alone, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevisionPatch {
    pub vendor_name: Option<Option<String>>,
    pub document_number: Option<Option<String>>,
    pub issue_date: Option<Option<CalendarDate>>,
    pub due_date: Option<Option<CalendarDate>>,
    pub currency: Option<Option<String>>,
    pub subtotal: Option<Option<Decimal>>,
    pub tax: Option<Option<Decimal>>,
    pub total: Option<Option<Decimal>>,
    pub counterparty_contact_id: Option<Option<String>>,
}

impl RevisionPatch {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_vendor_name(mut self, name: &str) -> Self {
        self.vendor_name = Some(Some(name.to_string()));
        self
    }
    pub fn set_document_number(mut self, number: &str) -> Self {
        self.document_number = Some(Some(number.to_string()));
        self
    }
    pub fn set_issue_date(mut self, date: CalendarDate) -> Self {
        self.issue_date = Some(Some(date));
        self
    }
    pub fn set_due_date(mut self, date: CalendarDate) -> Self {
        self.due_date = Some(Some(date));
        self
    }
    pub fn set_currency(mut self, currency: &str) -> Self {
        self.currency = Some(Some(currency.to_string()));
        self
    }
    pub fn set_subtotal(mut self, amount: Decimal) -> Self {
        self.subtotal = Some(Some(amount));
        self
    }
    pub fn set_tax(mut self, amount: Decimal) -> Self {
        self.tax = Some(Some(amount));
        self
    }
    pub fn set_total(mut self, amount: Decimal) -> Self {
        self.total = Some(Some(amount));
        self
    }
    pub fn set_counterparty_contact(mut self, contact_id: &str) -> Self {
        self.counterparty_contact_id = Some(Some(contact_id.to_string()));
        self
    }
    pub fn clear_due_date(mut self) -> Self {
        self.due_date = Some(None);
        self
    }

    pub fn apply(&self, revision: &mut DocumentRevision) {
        let header = &mut revision.header;
        if let Some(value) = &self.vendor_name {
            header.vendor_name = value.clone();
        }
        if let Some(value) = &self.document_number {
            header.document_number = value.clone();
        }
        if let Some(value) = self.issue_date {
            header.issue_date = value;
        }
        if let Some(value) = self.due_date {
            header.due_date = value;
        }
        if let Some(value) = &self.currency {
            header.currency = value.as_ref().map(|c| c.trim().to_uppercase());
        }
        if let Some(value) = self.subtotal {
            header.subtotal = value.map(Amount);
        }
        if let Some(value) = self.tax {
            header.tax = value.map(Amount);
        }
        if let Some(value) = self.total {
            header.total = value.map(Amount);
        }
        if let Some(value) = &self.counterparty_contact_id {
            revision.counterparty_contact_id = value.clone();
        }
    }
}

/// Checks arithmetic and completeness without touching the revision.
pub fn validate(revision: &DocumentRevision, tolerance: Decimal) -> ValidationReport {
    let header = &revision.header;
    let mut issues = Vec::new();
    let mut issue = |field: &str, code: &str, severity: Severity, message: String| {
        issues.push(ValidationIssue {
            field: field.to_string(),
            code: code.to_string(),
            severity,
            message,
        })
    };

    match header.currency.as_deref() {
        None => issue(
            "currency",
            "REQUIRED",
            Severity::Error,
            "currency is required".to_string(),
        ),
        Some(code) if !is_currency_code(code) => issue(
            "currency",
            "INVALID_CURRENCY",
            Severity::Error,
            format!("{code} is not a three letter currency code"),
        ),
        Some(_) => {}
    }

    if header.total.is_none() {
        issue(
            "total",
            "REQUIRED",
            Severity::Error,
            "total is required".to_string(),
        );
    }

    if let (Some(subtotal), Some(total)) = (header.subtotal, header.total) {
        let tax = header.tax.map(Amount::value).unwrap_or_default();
        let checked = subtotal
            .value()
            .checked_add(tax)
            .and_then(|expected| beyond(expected, total.value(), tolerance).map(|off| (expected, off)));
        match checked {
            Some((_, false)) => {}
            Some((expected, true)) => issue(
                "total",
                "TOTAL_MISMATCH",
                Severity::Error,
                format!(
                    "subtotal {} plus tax {tax} is {expected}, total is {}",
                    subtotal.value(),
                    total.value()
                ),
            ),
            None => issue(
                "total",
                "OUT_OF_RANGE",
                Severity::Error,
                "subtotal, tax and total cannot be compared without overflow".to_string(),
            ),
        }
    }

    if header.vendor_name.as_deref().is_none_or(|v| v.trim().is_empty()) {
        issue(
            "vendor_name",
            "MISSING_FIELD",
            Severity::Warning,
            "vendor name is missing".to_string(),
        );
    }
    if header
        .document_number
        .as_deref()
        .is_none_or(|v| v.trim().is_empty())
    {
        issue(
            "document_number",
            "MISSING_FIELD",
            Severity::Warning,
            "document number is missing".to_string(),
        );
    }
    if header.issue_date.is_none() {
        issue(
            "issue_date",
            "MISSING_FIELD",
            Severity::Warning,
            "issue date is missing".to_string(),
        );
    }

    if let (Some(issued), Some(due)) = (header.issue_date, header.due_date) {
        if due < issued {
            issue(
                "due_date",
                "DUE_BEFORE_ISSUE",
                Severity::Warning,
                format!("due date {} is before issue date {}", due.date(), issued.date()),
            );
        }
    }

    if let Some(subtotal) = header.subtotal {
        let amounts: Vec<Decimal> = revision
            .line_items
            .iter()
            .filter_map(|item| item.amount.map(Amount::value))
            .collect();
        if !amounts.is_empty() {
            let checked = amounts
                .iter()
                .try_fold(Decimal::ZERO, |acc, amount| acc.checked_add(*amount))
                .and_then(|sum| beyond(sum, subtotal.value(), tolerance).map(|off| (sum, off)));
            match checked {
                Some((_, false)) => {}
                Some((sum, true)) => issue(
                    "line_items",
                    "LINES_SUBTOTAL_MISMATCH",
                    Severity::Warning,
                    format!(
                        "line amounts sum to {sum}, subtotal is {}",
                        subtotal.value()
                    ),
                ),
                None => issue(
                    "line_items",
                    "OUT_OF_RANGE",
                    Severity::Error,
                    "line amounts overflow when summed".to_string(),
                ),
            }
        }
    }

    for item in &revision.line_items {
        if let (Some(quantity), Some(price), Some(amount)) =
            (item.quantity, item.unit_price, item.amount)
        {
            let field = format!("line_items[{}].amount", item.line_no);
            let checked = quantity
                .value()
                .checked_mul(price.value())
                .and_then(|expected| beyond(expected, amount.value(), tolerance).map(|off| (expected, off)));
            match checked {
                Some((_, false)) => {}
                Some((expected, true)) => issue(
                    &field,
                    "LINE_AMOUNT_MISMATCH",
                    Severity::Warning,
                    format!(
                        "line {}: {} x {} is {expected}, amount is {}",
                        item.line_no,
                        quantity.value(),
                        price.value(),
                        amount.value()
                    ),
                ),
                None => issue(
                    &field,
                    "OUT_OF_RANGE",
                    Severity::Error,
                    format!(
                        "line {}: {} x {} overflows",
                        item.line_no,
                        quantity.value(),
                        price.value()
                    ),
                ),
            }
        }
    }

    let status = if issues.iter().any(|i| i.severity == Severity::Error) {
        ValidationStatus::Invalid
    } else if issues.is_empty() {
        ValidationStatus::Valid
    } else {
        ValidationStatus::Warning
    };

    ValidationReport { status, issues }
}

/// Whether `a` and `b` are further apart than `tolerance`; `None` on overflow.
fn beyond(a: Decimal, b: Decimal, tolerance: Decimal) -> Option<bool> {
    a.checked_sub(b).map(|diff| diff.abs() > tolerance)
}

fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}
