use bigdecimal::BigDecimal;
use serde::Serialize;
use time::OffsetDateTime;

use super::classifier::classify;

/// Fractional digits a stored quantity keeps.
pub const QUANTITY_SCALE: i64 = 12;
/// Significant digits a stored quantity keeps.
pub const QUANTITY_PRECISION: i64 = 38;

/// Whether `value` is stored without rounding.
///
/// One integer digit is held back so the net of two accepted quantities fits
/// as well.
pub fn quantity_fits(value: &BigDecimal) -> bool {
    let value = value.normalized();
    let fraction_digits = value.fractional_digit_count();
    let integer_digits = value.digits() as i64 - fraction_digits;
    fraction_digits <= QUANTITY_SCALE && integer_digits < QUANTITY_PRECISION - QUANTITY_SCALE
}

/// One classified meter reading, identified by `(site_id, timestamp)`.
///
/// The derived fields are only ever produced by [`EnergyRecord::classified`],
/// so a record never carries a net value or anomaly flag that disagrees with
/// its raw quantities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyRecord {
    site_id: String,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    energy_generated_kwh: BigDecimal,
    energy_consumed_kwh: BigDecimal,
    net_energy_kwh: BigDecimal,
    anomaly: bool,
    #[serde(with = "time::serde::rfc3339")]
    processed_at: OffsetDateTime,
}

impl EnergyRecord {
    pub fn classified(
        site_id: impl Into<String>,
        timestamp: OffsetDateTime,
        energy_generated_kwh: BigDecimal,
        energy_consumed_kwh: BigDecimal,
        processed_at: OffsetDateTime,
    ) -> Self {
        let c = classify(&energy_generated_kwh, &energy_consumed_kwh);
        Self {
            site_id: site_id.into(),
            timestamp: timestamp.to_offset(time::UtcOffset::UTC),
            energy_generated_kwh,
            energy_consumed_kwh,
            net_energy_kwh: c.net_energy_kwh,
            anomaly: c.anomaly,
            processed_at: processed_at.to_offset(time::UtcOffset::UTC),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn energy_generated_kwh(&self) -> &BigDecimal {
        &self.energy_generated_kwh
    }

    pub fn energy_consumed_kwh(&self) -> &BigDecimal {
        &self.energy_consumed_kwh
    }

    pub fn net_energy_kwh(&self) -> &BigDecimal {
        &self.net_energy_kwh
    }

    pub fn anomaly(&self) -> bool {
        self.anomaly
    }

    pub fn processed_at(&self) -> OffsetDateTime {
        self.processed_at
    }
}
