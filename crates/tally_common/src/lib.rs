//! Shared types, validation and storage for the Tally analytics backend.

pub mod batch;
pub mod canonical;
pub mod report;
pub mod store;
pub mod validate;

pub use batch::{BatchItem, DailyAggregate, DailyMeta, DailyTotals, IngestBatch, MetricFamily};
pub use canonical::{canonical_key, canonical_tool_key};
pub use store::{
    AggregateStore, ApplyOutcome, BatchApplication, CounterDelta, DayRange, RangeError,
};
pub use validate::{parse_batch, ValidationError};
