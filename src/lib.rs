pub mod aggregator;
pub mod allocator;
pub mod collaboration;
pub mod config;
pub mod engine;
pub mod error;
pub mod expander;
pub mod joiner;
pub mod model;
pub mod period;
pub mod pivot;
pub mod schema;
pub mod sink;
pub mod source;

pub use config::{ReportPlan, TableConfig, TableKind};
pub use engine::{run, AttributionEngine};
pub use error::{AttributionError, Result};
pub use pivot::Table;
pub use source::{CsvSource, DataSource, FrameSource, SourceData};
