pub mod rollup;
pub mod service;

pub use rollup::RollupPolicy;
pub use service::{AggregationService, PlantStatus, Recorded, RollupOutcome};
