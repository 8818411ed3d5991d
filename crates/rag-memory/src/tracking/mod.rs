//! Retrieval operation tracking and analytics
pub mod operation_tracker;

pub use operation_tracker::{
    build_record, operation_source, percentile, OperationMetrics, OperationTracker, TrackingHandle,
};
