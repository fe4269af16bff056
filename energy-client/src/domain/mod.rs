pub mod classifier;
pub mod energy_record;

pub use classifier::{classify, Classification, ANOMALY_CEILING_KWH};
pub use energy_record::{quantity_fits, EnergyRecord, QUANTITY_PRECISION, QUANTITY_SCALE};
