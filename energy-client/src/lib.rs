pub mod db;
pub mod domain;
pub mod query;

pub use db::{EnergyStore, MemoryStore, QuestDbStore, RangeQuery, StoreError};
pub use domain::{classify, Classification, EnergyRecord};
pub use query::QueryService;
