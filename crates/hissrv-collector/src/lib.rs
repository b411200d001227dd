pub mod batcher;
pub mod collector;
pub mod source;
pub mod transform;

pub use batcher::Batcher;
pub use collector::{Collector, CollectorError};
pub use source::{KeyScan, MemorySource, RedisSource, ScanPage, SourceError, SourceReader};
pub use transform::{KeyShape, ModelKind, PointTransformer, Transformed};
