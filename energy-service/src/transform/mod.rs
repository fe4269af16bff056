use std::str::FromStr;

use bigdecimal::BigDecimal;
use energy_client::{domain::quantity_fits, EnergyRecord};
use serde_json::{Map, Value};
use time::{
    format_description::well_known::{Iso8601, Rfc3339},
    OffsetDateTime, PrimitiveDateTime,
};

pub const SITE_ID: &str = "site_id";
pub const TIMESTAMP: &str = "timestamp";
pub const ENERGY_GENERATED_KWH: &str = "energy_generated_kwh";
pub const ENERGY_CONSUMED_KWH: &str = "energy_consumed_kwh";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("reading must be a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` must be a string")]
    NotAString(&'static str),
    #[error("field `site_id` must not be empty")]
    EmptySiteId,
    #[error("`{0}` is not an ISO-8601 date-time")]
    InvalidTimestamp(String),
    #[error("field `{0}` must be a number")]
    NotANumber(&'static str),
    #[error("field `{0}` is not representable as a decimal")]
    OutOfRange(&'static str),
    #[error("field `{0}` exceeds the stored decimal precision")]
    TooPrecise(&'static str),
}

impl ValidationError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotAnObject => "not_an_object",
            Self::MissingField(_) => "missing_field",
            Self::NotAString(_) | Self::NotANumber(_) => "wrong_type",
            Self::EmptySiteId => "empty_site_id",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::OutOfRange(_) | Self::TooPrecise(_) => "out_of_range",
        }
    }
}

/// A reading whose shape has been checked, with quantities already exact.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedReading {
    pub site_id: String,
    pub timestamp: OffsetDateTime,
    pub energy_generated_kwh: BigDecimal,
    pub energy_consumed_kwh: BigDecimal,
}

impl ValidatedReading {
    pub fn classify(self, processed_at: OffsetDateTime) -> EnergyRecord {
        EnergyRecord::classified(
            self.site_id,
            self.timestamp,
            self.energy_generated_kwh,
            self.energy_consumed_kwh,
            processed_at,
        )
    }
}

/// Pure validation of one raw reading.
///
/// Rules:
/// - `site_id` is a non-blank string.
/// - `timestamp` is an ISO-8601 date-time; without an offset it is read as UTC.
/// - both energy fields are JSON numbers (strings and booleans are rejected)
///   that the store keeps without rounding.
///
/// This is the only place a JSON number becomes a `BigDecimal`; the conversion
/// goes through the number's shortest decimal text so `0.1` stays `0.1`.
pub fn validate_reading(raw: &Value) -> Result<ValidatedReading, ValidationError> {
    let obj = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    let site_id = required_str(obj, SITE_ID)?;
    if site_id.trim().is_empty() {
        return Err(ValidationError::EmptySiteId);
    }
    let timestamp = parse_timestamp(required_str(obj, TIMESTAMP)?)?;

    Ok(ValidatedReading {
        site_id: site_id.to_string(),
        timestamp,
        energy_generated_kwh: required_decimal(obj, ENERGY_GENERATED_KWH)?,
        energy_consumed_kwh: required_decimal(obj, ENERGY_CONSUMED_KWH)?,
    })
}

/// Parse an ISO-8601 instant and normalise it to UTC.
pub fn parse_timestamp(text: &str) -> Result<OffsetDateTime, ValidationError> {
    let text = text.trim();
    OffsetDateTime::parse(text, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(text, &Iso8601::DEFAULT))
        .or_else(|_| PrimitiveDateTime::parse(text, &Iso8601::DEFAULT).map(PrimitiveDateTime::assume_utc))
        .map(|ts| ts.to_offset(time::UtcOffset::UTC))
        .map_err(|_| ValidationError::InvalidTimestamp(text.to_string()))
}

fn required<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(v) => Ok(v),
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ValidationError> {
    required(obj, field)?
        .as_str()
        .ok_or(ValidationError::NotAString(field))
}

fn required_decimal(obj: &Map<String, Value>, field: &'static str) -> Result<BigDecimal, ValidationError> {
    match required(obj, field)? {
        Value::Number(n) => {
            let value = BigDecimal::from_str(&n.to_string()).map_err(|_| ValidationError::OutOfRange(field))?;
            if !quantity_fits(&value) {
                return Err(ValidationError::TooPrecise(field));
            }
            Ok(value)
        }
        _ => Err(ValidationError::NotANumber(field)),
    }
}
