pub mod cycle;
pub mod health;
pub mod pattern;
pub mod point;

pub use cycle::{CollectionCycleResult, CycleOutcome, DropReason};
pub use health::{ComponentHealth, HealthState, HealthStatus};
pub use pattern::{KeyPattern, PatternError};
pub use point::{fields, tags, DataPoint, DataType, ParseVariantError, Quality, RawRecord, Source, Tags};
