//! Record shape tables and the coerce-and-check routine that turns raw listing
//! JSON into typed [`PropertyRecord`] values.

use std::collections::HashMap;
use std::fmt;

use propload_core::{
    coerce_decimal, coerce_integer, coerce_tristate, Hoa, Leads, Property, PropertyRecord, Rehab,
    TriState, Valuation,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "propload-records";

pub const VALUATION_KEY: &str = "Valuation";
pub const HOA_KEY: &str = "HOA";
pub const REHAB_KEY: &str = "Rehab";

/// Coercion applied to one declared field before it is type-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// String or absent; numbers are stringified, booleans become `True`/`False`.
    Text,
    Integer,
    Decimal,
    /// Number or numeric string.
    Float,
    TriState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub rule: Rule,
}

const fn field(name: &'static str, rule: Rule) -> FieldSpec {
    FieldSpec { name, rule }
}

/// Scalar fields of the top-level listing object, leads fields included.
pub const PROPERTY_FIELDS: &[FieldSpec] = &[
    field("Property_Title", Rule::Text),
    field("Address", Rule::Text),
    field("Reviewed_Status", Rule::Text),
    field("Most_Recent_Status", Rule::Text),
    field("Source", Rule::Text),
    field("Market", Rule::Text),
    field("Occupancy", Rule::Text),
    field("Flood", Rule::Text),
    field("Street_Address", Rule::Text),
    field("City", Rule::Text),
    field("State", Rule::Text),
    field("Zip", Rule::Text),
    field("Property_Type", Rule::Text),
    field("Highway", Rule::Text),
    field("Train", Rule::Text),
    field("Tax_Rate", Rule::Decimal),
    field("SQFT_Basement", Rule::Integer),
    field("HTW", Rule::TriState),
    field("Pool", Rule::TriState),
    field("Commercial", Rule::TriState),
    field("Water", Rule::Text),
    field("Sewage", Rule::Text),
    field("Year_Built", Rule::Integer),
    field("SQFT_MU", Rule::Integer),
    field("SQFT_Total", Rule::Integer),
    field("Parking", Rule::Text),
    field("Bed", Rule::Integer),
    field("Bath", Rule::Integer),
    field("BasementYesNo", Rule::TriState),
    field("Layout", Rule::Text),
    field("Net_Yield", Rule::Decimal),
    field("IRR", Rule::Decimal),
    field("Rent_Restricted", Rule::TriState),
    field("Neighborhood_Rating", Rule::Integer),
    field("Latitude", Rule::Float),
    field("Longitude", Rule::Float),
    field("Subdivision", Rule::Text),
    field("Taxes", Rule::Decimal),
    field("Selling_Reason", Rule::Text),
    field("Seller_Retained_Broker", Rule::Text),
    field("Final_Reviewer", Rule::Text),
    field("School_Average", Rule::Decimal),
];

pub const VALUATION_FIELDS: &[FieldSpec] = &[
    field("List_Price", Rule::Decimal),
    field("Previous_Rent", Rule::Decimal),
    field("Zestimate", Rule::Decimal),
    field("ARV", Rule::Decimal),
    field("Expected_Rent", Rule::Decimal),
    field("Rent_Zestimate", Rule::Decimal),
    field("Low_FMR", Rule::Decimal),
    field("High_FMR", Rule::Decimal),
    field("Redfin_Value", Rule::Decimal),
];

pub const HOA_FIELDS: &[FieldSpec] = &[field("HOA", Rule::Decimal), field("HOA_Flag", Rule::TriState)];

pub const REHAB_FIELDS: &[FieldSpec] = &[
    field("Underwriting_Rehab", Rule::Decimal),
    field("Rehab_Calculation", Rule::Decimal),
    field("Paint", Rule::Text),
    field("Flooring_Flag", Rule::TriState),
    field("Foundation_Flag", Rule::TriState),
    field("Roof_Flag", Rule::TriState),
    field("HVAC_Flag", Rule::TriState),
    field("Kitchen_Flag", Rule::TriState),
    field("Bathroom_Flag", Rule::TriState),
    field("Appliances_Flag", Rule::TriState),
    field("Windows_Flag", Rule::TriState),
    field("Landscaping_Flag", Rule::TriState),
    field("Trashout_Flag", Rule::TriState),
];

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(Option<String>),
    Integer(Option<i64>),
    Decimal(Option<Decimal>),
    Float(Option<f64>),
    Flag(TriState),
}

/// One offending field, addressed by path (`Valuation[1].ARV`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{} invalid field(s): {}", .errors.len(), join_errors(.errors))]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn coerce_float(raw: &JsonValue) -> Result<Option<f64>, String> {
    match raw {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => Ok(n.as_f64()),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            match trimmed.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Some(v)),
                _ => Err(format!("expected a number, found {trimmed:?}")),
            }
        }
        other => Err(format!("expected a number, found {}", json_kind(other))),
    }
}

/// Apply `rule` to one raw value. Only structurally impossible input fails.
pub fn coerce_field(rule: Rule, raw: &JsonValue) -> Result<FieldValue, String> {
    if rule == Rule::TriState {
        return Ok(FieldValue::Flag(coerce_tristate(raw)));
    }
    if matches!(raw, JsonValue::Array(_) | JsonValue::Object(_)) {
        return Err(format!("expected a scalar, found {}", json_kind(raw)));
    }
    match rule {
        Rule::Text => Ok(FieldValue::Text(match raw {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(if *b { "True" } else { "False" }.to_string()),
            _ => None,
        })),
        Rule::Integer => Ok(FieldValue::Integer(coerce_integer(raw))),
        Rule::Decimal => Ok(FieldValue::Decimal(coerce_decimal(raw))),
        Rule::Float => coerce_float(raw).map(FieldValue::Float),
        Rule::TriState => Ok(FieldValue::Flag(coerce_tristate(raw))),
    }
}

/// Coerced values of one object, drained field by field while building a typed struct.
#[derive(Debug, Default)]
struct CoercedFields {
    values: HashMap<&'static str, FieldValue>,
}

impl CoercedFields {
    fn text(&mut self, name: &str) -> Option<String> {
        match self.values.remove(name) {
            Some(FieldValue::Text(v)) => v,
            _ => None,
        }
    }

    fn integer(&mut self, name: &str) -> Option<i64> {
        match self.values.remove(name) {
            Some(FieldValue::Integer(v)) => v,
            _ => None,
        }
    }

    fn decimal(&mut self, name: &str) -> Option<Decimal> {
        match self.values.remove(name) {
            Some(FieldValue::Decimal(v)) => v,
            _ => None,
        }
    }

    fn float(&mut self, name: &str) -> Option<f64> {
        match self.values.remove(name) {
            Some(FieldValue::Float(v)) => v,
            _ => None,
        }
    }

    fn flag(&mut self, name: &str) -> TriState {
        match self.values.remove(name) {
            Some(FieldValue::Flag(v)) => v,
            _ => TriState::Unknown,
        }
    }
}

fn coerce_shape(
    specs: &[FieldSpec],
    object: &Map<String, JsonValue>,
    path_prefix: &str,
    errors: &mut Vec<FieldError>,
) -> CoercedFields {
    let mut fields = CoercedFields::default();
    for spec in specs {
        let raw = object.get(spec.name).unwrap_or(&JsonValue::Null);
        match coerce_field(spec.rule, raw) {
            Ok(value) => {
                fields.values.insert(spec.name, value);
            }
            Err(reason) => errors.push(FieldError {
                field: format!("{path_prefix}{}", spec.name),
                reason,
            }),
        }
    }
    fields
}

fn coerce_collection<T>(
    object: &Map<String, JsonValue>,
    key: &str,
    specs: &[FieldSpec],
    build: fn(&mut CoercedFields) -> T,
    errors: &mut Vec<FieldError>,
) -> Vec<T> {
    let items = match object.get(key) {
        None | Some(JsonValue::Null) => return Vec::new(),
        Some(JsonValue::Array(items)) => items,
        Some(other) => {
            errors.push(FieldError {
                field: key.to_string(),
                reason: format!("expected an array, found {}", json_kind(other)),
            });
            return Vec::new();
        }
    };

    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let JsonValue::Object(entry) = item else {
            errors.push(FieldError {
                field: format!("{key}[{index}]"),
                reason: format!("expected an object, found {}", json_kind(item)),
            });
            continue;
        };
        let mut fields = coerce_shape(specs, entry, &format!("{key}[{index}]."), errors);
        out.push(build(&mut fields));
    }
    out
}

fn build_property(f: &mut CoercedFields) -> Property {
    Property {
        property_title: f.text("Property_Title"),
        address: f.text("Address"),
        market: f.text("Market"),
        flood: f.text("Flood"),
        street_address: f.text("Street_Address"),
        city: f.text("City"),
        state: f.text("State"),
        zip: f.text("Zip"),
        property_type: f.text("Property_Type"),
        highway: f.text("Highway"),
        train: f.text("Train"),
        tax_rate: f.decimal("Tax_Rate"),
        sqft_basement: f.integer("SQFT_Basement"),
        htw: f.flag("HTW"),
        pool: f.flag("Pool"),
        commercial: f.flag("Commercial"),
        water: f.text("Water"),
        sewage: f.text("Sewage"),
        year_built: f.integer("Year_Built"),
        sqft_mu: f.integer("SQFT_MU"),
        sqft_total: f.integer("SQFT_Total"),
        parking: f.text("Parking"),
        bed: f.integer("Bed"),
        bath: f.integer("Bath"),
        basement_yes_no: f.flag("BasementYesNo"),
        layout: f.text("Layout"),
        rent_restricted: f.flag("Rent_Restricted"),
        neighborhood_rating: f.integer("Neighborhood_Rating"),
        latitude: f.float("Latitude"),
        longitude: f.float("Longitude"),
        subdivision: f.text("Subdivision"),
        taxes: f.decimal("Taxes"),
        net_yield: f.decimal("Net_Yield"),
        irr: f.decimal("IRR"),
        school_average: f.decimal("School_Average"),
    }
}

fn build_leads(f: &mut CoercedFields) -> Leads {
    Leads {
        reviewed_status: f.text("Reviewed_Status"),
        most_recent_status: f.text("Most_Recent_Status"),
        source: f.text("Source"),
        occupancy: f.text("Occupancy"),
        final_reviewer: f.text("Final_Reviewer"),
        selling_reason: f.text("Selling_Reason"),
        seller_retained_broker: f.text("Seller_Retained_Broker"),
    }
}

fn build_valuation(f: &mut CoercedFields) -> Valuation {
    Valuation {
        list_price: f.decimal("List_Price"),
        previous_rent: f.decimal("Previous_Rent"),
        zestimate: f.decimal("Zestimate"),
        arv: f.decimal("ARV"),
        expected_rent: f.decimal("Expected_Rent"),
        rent_zestimate: f.decimal("Rent_Zestimate"),
        low_fmr: f.decimal("Low_FMR"),
        high_fmr: f.decimal("High_FMR"),
        redfin_value: f.decimal("Redfin_Value"),
    }
}

fn build_hoa(f: &mut CoercedFields) -> Hoa {
    Hoa {
        hoa_amount: f.decimal("HOA"),
        hoa_flag: f.flag("HOA_Flag"),
    }
}

fn build_rehab(f: &mut CoercedFields) -> Rehab {
    Rehab {
        underwriting_rehab: f.decimal("Underwriting_Rehab"),
        rehab_calculation: f.decimal("Rehab_Calculation"),
        paint: f.text("Paint"),
        flooring_flag: f.flag("Flooring_Flag"),
        foundation_flag: f.flag("Foundation_Flag"),
        roof_flag: f.flag("Roof_Flag"),
        hvac_flag: f.flag("HVAC_Flag"),
        kitchen_flag: f.flag("Kitchen_Flag"),
        bathroom_flag: f.flag("Bathroom_Flag"),
        appliances_flag: f.flag("Appliances_Flag"),
        windows_flag: f.flag("Windows_Flag"),
        landscaping_flag: f.flag("Landscaping_Flag"),
        trashout_flag: f.flag("Trashout_Flag"),
    }
}

/// Validate one raw listing. Every offending field is reported; nothing is
/// partially accepted.
pub fn validate_record(raw: &JsonValue) -> Result<PropertyRecord, ValidationError> {
    let JsonValue::Object(object) = raw else {
        return Err(ValidationError {
            errors: vec![FieldError {
                field: "<record>".to_string(),
                reason: format!("expected an object, found {}", json_kind(raw)),
            }],
        });
    };

    let mut errors = Vec::new();
    let mut fields = coerce_shape(PROPERTY_FIELDS, object, "", &mut errors);
    let valuations = coerce_collection(object, VALUATION_KEY, VALUATION_FIELDS, build_valuation, &mut errors);
    let hoas = coerce_collection(object, HOA_KEY, HOA_FIELDS, build_hoa, &mut errors);
    let rehabs = coerce_collection(object, REHAB_KEY, REHAB_FIELDS, build_rehab, &mut errors);

    if !errors.is_empty() {
        return Err(ValidationError { errors });
    }

    Ok(PropertyRecord {
        property: build_property(&mut fields),
        leads: build_leads(&mut fields),
        valuations,
        hoas,
        rehabs,
    })
}

/// Best-effort title for log lines about records that may not validate.
pub fn raw_title(raw: &JsonValue) -> Option<&str> {
    raw.get("Property_Title").and_then(JsonValue::as_str)
}
