use bigdecimal::BigDecimal;

/// Upper plausibility bound for either raw quantity, in kWh per reporting interval.
pub const ANOMALY_CEILING_KWH: i32 = 1000;

/// Fields derived from a reading's two raw quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub net_energy_kwh: BigDecimal,
    pub anomaly: bool,
}

/// Derive net energy and the anomaly flag for one reading.
///
/// Rules:
/// - net is the exact difference `generated - consumed`, never clamped.
/// - a reading is anomalous when either quantity is negative or above
///   [`ANOMALY_CEILING_KWH`].
///
/// Total over all inputs; shape validation happens before this is called.
pub fn classify(generated: &BigDecimal, consumed: &BigDecimal) -> Classification {
    let zero = BigDecimal::from(0);
    let ceiling = BigDecimal::from(ANOMALY_CEILING_KWH);

    let anomaly = *generated < zero
        || *consumed < zero
        || *generated > ceiling
        || *consumed > ceiling;

    Classification {
        net_energy_kwh: generated - consumed,
        anomaly,
    }
}
