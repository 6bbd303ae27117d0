//! Core domain model and field coercion rules for propload.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "propload-core";

/// Yes/No/Unknown flag. Absent or unrecognized input is always `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TriState {
    Yes,
    No,
    #[default]
    Unknown,
}

impl TriState {
    pub const ALL: [TriState; 3] = [TriState::Yes, TriState::No, TriState::Unknown];

    pub fn as_str(self) -> &'static str {
        match self {
            TriState::Yes => "Yes",
            TriState::No => "No",
            TriState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TriState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parent listing row. `(property_title, address)` is the natural key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Property {
    pub property_title: Option<String>,
    pub address: Option<String>,
    pub market: Option<String>,
    pub flood: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub property_type: Option<String>,
    pub highway: Option<String>,
    pub train: Option<String>,
    pub tax_rate: Option<Decimal>,
    pub sqft_basement: Option<i64>,
    pub htw: TriState,
    pub pool: TriState,
    pub commercial: TriState,
    pub water: Option<String>,
    pub sewage: Option<String>,
    pub year_built: Option<i64>,
    pub sqft_mu: Option<i64>,
    pub sqft_total: Option<i64>,
    pub parking: Option<String>,
    pub bed: Option<i64>,
    pub bath: Option<i64>,
    pub basement_yes_no: TriState,
    pub layout: Option<String>,
    pub rent_restricted: TriState,
    pub neighborhood_rating: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub subdivision: Option<String>,
    pub taxes: Option<Decimal>,
    pub net_yield: Option<Decimal>,
    pub irr: Option<Decimal>,
    pub school_average: Option<Decimal>,
}

/// Deal-workflow extension of a property, stored one-to-one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Leads {
    pub reviewed_status: Option<String>,
    pub most_recent_status: Option<String>,
    pub source: Option<String>,
    pub occupancy: Option<String>,
    pub final_reviewer: Option<String>,
    pub selling_reason: Option<String>,
    pub seller_retained_broker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Valuation {
    pub list_price: Option<Decimal>,
    pub previous_rent: Option<Decimal>,
    pub zestimate: Option<Decimal>,
    pub arv: Option<Decimal>,
    pub expected_rent: Option<Decimal>,
    pub rent_zestimate: Option<Decimal>,
    pub low_fmr: Option<Decimal>,
    pub high_fmr: Option<Decimal>,
    pub redfin_value: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hoa {
    pub hoa_amount: Option<Decimal>,
    pub hoa_flag: TriState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rehab {
    pub underwriting_rehab: Option<Decimal>,
    pub rehab_calculation: Option<Decimal>,
    pub paint: Option<String>,
    pub flooring_flag: TriState,
    pub foundation_flag: TriState,
    pub roof_flag: TriState,
    pub hvac_flag: TriState,
    pub kitchen_flag: TriState,
    pub bathroom_flag: TriState,
    pub appliances_flag: TriState,
    pub windows_flag: TriState,
    pub landscaping_flag: TriState,
    pub trashout_flag: TriState,
}

/// Fully coerced input record: a property plus everything loaded alongside it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub property: Property,
    pub leads: Leads,
    pub valuations: Vec<Valuation>,
    pub hoas: Vec<Hoa>,
    pub rehabs: Vec<Rehab>,
}

impl PropertyRecord {
    pub fn natural_key(&self) -> NaturalKey<'_> {
        NaturalKey {
            property_title: self.property.property_title.as_deref(),
            address: self.property.address.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaturalKey<'a> {
    pub property_title: Option<&'a str>,
    pub address: Option<&'a str>,
}

impl NaturalKey<'_> {
    /// SQL `=` never matches NULL, so a key with a missing part can't dedup.
    pub fn is_complete(&self) -> bool {
        self.property_title.is_some() && self.address.is_some()
    }
}

impl fmt::Display for NaturalKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {}",
            self.property_title.unwrap_or("<untitled>"),
            self.address.unwrap_or("<no address>")
        )
    }
}

fn digit_run() -> &'static Regex {
    static DIGIT_RUN: OnceLock<Regex> = OnceLock::new();
    DIGIT_RUN.get_or_init(|| Regex::new("[0-9]+").expect("digit run pattern compiles"))
}

fn truncate_float(value: f64) -> Option<i64> {
    let truncated = value.trunc();
    if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated < i64::MAX as f64 {
        Some(truncated as i64)
    } else {
        None
    }
}

/// Integer from a native number or the first digit run of a string.
///
/// `"12,000 sqft"` becomes `12000`; floats truncate toward zero; strings with
/// no digits, null and compound values are absent.
pub fn coerce_integer(raw: &JsonValue) -> Option<i64> {
    match raw {
        JsonValue::Bool(b) => Some(i64::from(*b)),
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate_float)),
        JsonValue::String(s) => {
            let without_separators = s.replace(',', "");
            digit_run()
                .find(&without_separators)
                .and_then(|m| m.as_str().parse::<i64>().ok())
        }
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

fn parse_exact_decimal(text: &str) -> Option<Decimal> {
    Decimal::from_str_exact(text)
        .ok()
        .or_else(|| Decimal::from_scientific(text).ok())
}

/// Keeps digits, `.` and every `-`. A dash after the first kept character
/// (`"$1,200-$1,500"`) makes the retry fail instead of gluing a range together.
fn strip_to_numeric(text: &str) -> String {
    text.chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.' || *ch == '-')
        .collect()
}

/// Exact decimal from a number or loosely formatted string such as `"$12,345.67"`.
pub fn coerce_decimal(raw: &JsonValue) -> Option<Decimal> {
    match raw {
        JsonValue::Number(n) => parse_exact_decimal(&n.to_string()),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Some(value) = parse_exact_decimal(trimmed) {
                return Some(value);
            }
            let cleaned = strip_to_numeric(trimmed);
            if matches!(cleaned.as_str(), "" | "." | "-" | "-.") {
                return None;
            }
            parse_exact_decimal(&cleaned)
        }
        JsonValue::Null | JsonValue::Bool(_) | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

/// Yes/No/Unknown from common spreadsheet spellings. Never fails.
pub fn coerce_tristate(raw: &JsonValue) -> TriState {
    let text = match raw {
        JsonValue::String(s) => s.trim().to_lowercase(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => return TriState::Unknown,
    };
    match text.as_str() {
        "yes" | "y" | "true" | "1" => TriState::Yes,
        "no" | "n" | "false" | "0" => TriState::No,
        _ => TriState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn integer_extracts_first_digit_run() {
        assert_eq!(coerce_integer(&json!("5649 sqft")), Some(5649));
        assert_eq!(coerce_integer(&json!("12,000")), Some(12000));
        assert_eq!(coerce_integer(&json!("built 1987, renovated 2004")), Some(1987));
        assert_eq!(coerce_integer(&json!("3.5")), Some(3));
    }

    #[test]
    fn integer_accepts_native_numbers() {
        assert_eq!(coerce_integer(&json!(4)), Some(4));
        assert_eq!(coerce_integer(&json!(-7)), Some(-7));
        assert_eq!(coerce_integer(&json!(2.9)), Some(2));
        assert_eq!(coerce_integer(&json!(-2.9)), Some(-2));
        assert_eq!(coerce_integer(&json!(true)), Some(1));
    }

    #[test]
    fn integer_absent_without_digits() {
        assert_eq!(coerce_integer(&JsonValue::Null), None);
        assert_eq!(coerce_integer(&json!("")), None);
        assert_eq!(coerce_integer(&json!("n/a")), None);
        assert_eq!(coerce_integer(&json!({"v": 1})), None);
        assert_eq!(coerce_integer(&json!("99999999999999999999999")), None);
    }

    #[test]
    fn decimal_parses_currency_strings() {
        assert_eq!(coerce_decimal(&json!("$12,345.67")), Some(dec("12345.67")));
        assert_eq!(coerce_decimal(&json!("150")), Some(dec("150")));
        assert_eq!(coerce_decimal(&json!(" 0.0125 ")), Some(dec("0.0125")));
        assert_eq!(coerce_decimal(&json!("-$45.10")), Some(dec("-45.10")));
        assert_eq!(coerce_decimal(&json!("1.5e3")), Some(dec("1500")));
    }

    #[test]
    fn decimal_preserves_input_scale() {
        let value = coerce_decimal(&json!("1200.50")).unwrap();
        assert_eq!(value.scale(), 2);
        assert_eq!(value.to_string(), "1200.50");
        assert_eq!(coerce_decimal(&json!(0.1)), Some(dec("0.1")));
    }

    #[test]
    fn decimal_absent_for_empty_or_garbage() {
        assert_eq!(coerce_decimal(&json!("")), None);
        assert_eq!(coerce_decimal(&json!("   ")), None);
        assert_eq!(coerce_decimal(&json!("abc")), None);
        assert_eq!(coerce_decimal(&json!("$.")), None);
        assert_eq!(coerce_decimal(&json!("1.2.3")), None);
        assert_eq!(coerce_decimal(&JsonValue::Null), None);
        assert_eq!(coerce_decimal(&json!(true)), None);
    }

    #[test]
    fn decimal_ranges_and_inner_dashes_are_absent() {
        assert_eq!(coerce_decimal(&json!("$1,200-$1,500")), None);
        assert_eq!(coerce_decimal(&json!("12-34 USD")), None);
        assert_eq!(coerce_decimal(&json!("1,500 - 2,000")), None);
        assert_eq!(coerce_decimal(&json!("n/a - tbd")), None);
        assert_eq!(coerce_decimal(&json!("- $45")), Some(dec("-45")));
    }

    #[test]
    fn tristate_synonyms() {
        for yes in ["yes", "Y", " TRUE ", "1"] {
            assert_eq!(coerce_tristate(&json!(yes)), TriState::Yes, "{yes}");
        }
        for no in ["no", "n", "False", "0"] {
            assert_eq!(coerce_tristate(&json!(no)), TriState::No, "{no}");
        }
        assert_eq!(coerce_tristate(&json!(true)), TriState::Yes);
        assert_eq!(coerce_tristate(&json!(0)), TriState::No);
        assert_eq!(coerce_tristate(&json!("maybe")), TriState::Unknown);
        assert_eq!(coerce_tristate(&json!("")), TriState::Unknown);
        assert_eq!(coerce_tristate(&JsonValue::Null), TriState::Unknown);
        assert_eq!(coerce_tristate(&json!([1])), TriState::Unknown);
    }

    #[test]
    fn natural_key_completeness() {
        let mut record = PropertyRecord::default();
        assert!(!record.natural_key().is_complete());
        record.property.property_title = Some("A".into());
        record.property.address = Some("1 Main St".into());
        assert!(record.natural_key().is_complete());
        assert_eq!(record.natural_key().to_string(), "A @ 1 Main St");
    }

    proptest! {
        #[test]
        fn integer_coercion_is_idempotent_on_native_integers(n in any::<i64>()) {
            let once = coerce_integer(&json!(n));
            prop_assert_eq!(once, Some(n));
            prop_assert_eq!(coerce_integer(&json!(once)), once);
        }

        #[test]
        fn integer_coercion_is_idempotent_on_numeric_text(text in "[0-9][0-9,]{0,11}( sqft)?") {
            let once = coerce_integer(&json!(text));
            let twice = coerce_integer(&json!(once));
            prop_assert_eq!(twice, once);
        }

        #[test]
        fn tristate_is_total(text in ".*") {
            let flag = coerce_tristate(&json!(text));
            prop_assert!(TriState::ALL.contains(&flag));
        }
    }
}
