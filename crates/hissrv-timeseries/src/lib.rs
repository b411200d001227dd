pub mod cleanup;
pub mod error;
pub mod influx;
pub mod memory;
pub mod query;
pub mod statistics;
pub mod store;
pub mod writer;

pub use cleanup::{CleanupManager, CleanupPolicy, CleanupStats};
pub use error::StoreError;
pub use influx::InfluxStore;
pub use memory::MemoryStore;
pub use query::{
    Aggregation, LatestRequest, QueryEngine, QueryError, QueryRequest, QueryResult, RangeInfo,
    StatisticsBucket, StatisticsRequest, StatisticsResult, ValidationError,
};
pub use statistics::{rollup_measurement, RollupPolicy, StatisticsManager, StatisticsReport};
pub use store::{
    AggregateQuery, BucketStats, MeasurementSummary, RangeQuery, SeriesFilter, TimeRange,
    TimeSeriesStore,
};
pub use writer::{StoreHealth, WriteError, Writer};
