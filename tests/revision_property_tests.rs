//! Property-based tests for revisions, validation and home currency conversion
//!
//! Amounts are money: a rounding or override rule that only holds for the
//! handful of numbers in the unit tests is not good enough.

mod common;

use common::*;
use ledger_intake::{
    currency::{reconcile, round2},
    revision::{
        DocumentRevision, LineItemInput, RevisionHeader, RevisionPatch, RevisionSource,
        RevisionStatus, Severity, ValidationReport, ValidationStatus, validate,
    },
    revisions::ApprovalInput,
    types::{Amount, TimeStamp},
    Preconditions,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// These property tests cover:
//
// 1. Rounding - two decimals, never more than half a cent away
// 2. Override flag - set exactly when the supplied value is further than the tolerance
// 3. Validation - deterministic, and the status follows the worst issue
// 4. Line edits - results stay ordered by line number without duplicates
// 5. Guarded mutations - lock_version grows by one per accepted write and at
//    most one revision is ever APPROVED

/// Strategy for amounts in cents, as a two decimal Decimal
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (-10_000_000i64..10_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

/// Strategy for exchange rates with four decimals, 0.0001 to 500
fn rate_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..5_000_000).prop_map(|r| Decimal::new(r, 4))
}

fn currency_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("EUR".to_string())),
        Just(Some("USD".to_string())),
        Just(Some("usd".to_string())),
        Just(Some("EURO".to_string())),
    ]
}

fn header_strategy() -> impl Strategy<Value = RevisionHeader> {
    (
        prop::option::of("[A-Za-z ]{0,12}"),
        prop::option::of("[A-Z0-9-]{0,8}"),
        currency_strategy(),
        prop::option::of(0i64..100_000),
        prop::option::of(0i64..10_000),
        prop::option::of(0i64..110_000),
    )
        .prop_map(|(vendor, number, currency, subtotal, tax, total)| RevisionHeader {
            vendor_name: vendor,
            document_number: number,
            issue_date: Some(date(2024, 3, 1)),
            due_date: Some(date(2024, 3, 31)),
            currency,
            subtotal: subtotal.map(|c| Amount(Decimal::new(c, 2))),
            tax: tax.map(|c| Amount(Decimal::new(c, 2))),
            total: total.map(|c| Amount(Decimal::new(c, 2))),
        })
}

fn line_input_strategy() -> impl Strategy<Value = LineItemInput> {
    (1u32..12, 0i64..50_000).prop_map(|(line_no, cents)| {
        LineItemInput::new(line_no).set_amount(Decimal::new(cents, 2))
    })
}

fn blank_revision(header: RevisionHeader) -> DocumentRevision {
    let now = TimeStamp::new();
    DocumentRevision {
        id: "rev_prop".into(),
        document_id: "doc_prop".into(),
        revision_number: 1,
        status: RevisionStatus::Draft,
        source: RevisionSource::Edit,
        based_on: None,
        header,
        counterparty_contact_id: None,
        line_items: vec![],
        home: None,
        validation: ValidationReport::default(),
        evidence: vec![],
        created_by: "prop".into(),
        reason: None,
        created_at: now.clone(),
        updated_at: now,
        approved_at: None,
        approved_by: None,
    }
}

proptest! {
    #[test]
    fn conversion_rounds_to_cents(amount in amount_strategy(), rate in rate_strategy()) {
        let exact = amount * rate;
        let rounded = round2(exact);
        prop_assert!(rounded.scale() <= 2);
        prop_assert!((rounded - exact).abs() <= dec!(0.005));
    }

    #[test]
    fn override_flag_follows_the_tolerance(
        computed in amount_strategy(),
        drift_cents in -500i64..500,
    ) {
        let supplied = computed + Decimal::new(drift_cents, 2);
        let value = reconcile(computed, Some(supplied), dec!(0.009));
        prop_assert_eq!(value.value, supplied);
        prop_assert_eq!(value.overridden, drift_cents != 0);

        let untouched = reconcile(computed, None, dec!(0.009));
        prop_assert_eq!(untouched.value, computed);
        prop_assert!(!untouched.overridden);
    }

    #[test]
    fn validation_is_deterministic(header in header_strategy()) {
        let revision = blank_revision(header);
        let first = validate(&revision, dec!(0.01));
        let second = validate(&revision, dec!(0.01));
        prop_assert_eq!(&first, &second);

        let has_error = first.issues.iter().any(|i| i.severity == Severity::Error);
        match first.status {
            ValidationStatus::Invalid => prop_assert!(has_error),
            ValidationStatus::Warning => prop_assert!(!has_error && !first.issues.is_empty()),
            ValidationStatus::Valid => prop_assert!(first.issues.is_empty()),
        }
    }

    #[test]
    fn line_edits_stay_ordered(inputs in prop::collection::vec(line_input_strategy(), 0..10)) {
        let mut revision = blank_revision(RevisionHeader::default());
        let mut seen = std::collections::BTreeSet::new();
        let unique: Vec<LineItemInput> = inputs
            .into_iter()
            .filter(|input| seen.insert(input.line_no))
            .collect();

        revision.apply_line_changes(&unique, &[]).unwrap();
        let numbers: Vec<u32> = revision.line_items.iter().map(|l| l.line_no).collect();
        let expected: Vec<u32> = seen.into_iter().collect();
        prop_assert_eq!(numbers, expected);
        for item in &revision.line_items {
            prop_assert_eq!(&item.id, &format!("rev_prop:{}", item.line_no));
        }
    }
}

/// One step a reviewer may take against a document.
#[derive(Debug, Clone)]
enum Step {
    Edit { stale: bool, cents: i64 },
    Approve { stale: bool },
    Rotate { degrees: u16 },
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (any::<bool>(), 1i64..1_000_000).prop_map(|(stale, cents)| Step::Edit { stale, cents }),
        any::<bool>().prop_map(|stale| Step::Approve { stale }),
        prop::sample::select(vec![0u16, 90, 180, 270, 45]).prop_map(|degrees| Step::Rotate { degrees }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn guarded_writes_bump_the_version_once(steps in prop::collection::vec(step_strategy(), 1..12)) {
        let h = Harness::new().unwrap();
        let (document, _) = h.extracted_draft().unwrap();
        let mut expected_version = document.lock_version;

        for step in steps {
            let current = h.lock_version(&document.id).unwrap();
            prop_assert_eq!(current, expected_version);
            let version = |stale: bool| if stale { current.saturating_sub(1) } else { current };

            let accepted = match step {
                Step::Edit { stale, cents } => {
                    let amount = Decimal::new(cents, 2);
                    let result = h.service.create_revision(
                        &h.actor,
                        &document.id,
                        None,
                        &RevisionPatch::new().set_subtotal(amount).set_total(amount),
                        None,
                        &Preconditions::if_match(version(stale)),
                    );
                    result.is_ok()
                }
                Step::Approve { stale } => {
                    let latest = h
                        .service
                        .list_revisions(&h.actor, &document.id)
                        .unwrap()
                        .into_iter()
                        .last()
                        .unwrap();
                    h.service
                        .approve_revision(
                            &h.actor,
                            &document.id,
                            &latest.id,
                            &ApprovalInput::default(),
                            &Preconditions::if_match(version(stale)),
                        )
                        .is_ok()
                }
                Step::Rotate { degrees } => h
                    .service
                    .update_page_rotation(
                        &h.actor,
                        &document.id,
                        1,
                        degrees,
                        &Preconditions::none(),
                    )
                    .is_ok(),
            };
            if accepted {
                expected_version += 1;
            }

            let revisions = h.service.list_revisions(&h.actor, &document.id).unwrap();
            let approved: Vec<&DocumentRevision> = revisions
                .iter()
                .filter(|r| r.status == RevisionStatus::Approved)
                .collect();
            prop_assert!(approved.len() <= 1);

            let reloaded = h.service.get_document(&h.actor, &document.id).unwrap();
            prop_assert_eq!(
                reloaded.current_revision_id.as_deref(),
                approved.first().map(|r| r.id.as_str())
            );
        }
        prop_assert_eq!(h.lock_version(&document.id).unwrap(), expected_version);
    }
}
