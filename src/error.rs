use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error("Schema error in {relation}: {message}")]
    Schema { relation: String, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Missing join key at {stage}: actor '{actor_id}' on unit '{unit_id}' has no attribute record")]
    MissingJoinKey {
        stage: &'static str,
        actor_id: String,
        unit_id: String,
    },

    #[error("Zero eligible actors at {stage}: unit '{unit_id}' reached allocation with an empty actor set")]
    ZeroEligibleActors { stage: &'static str, unit_id: String },

    #[error("Conservation violation at {stage}: {subject} sums to {actual}, expected {expected}")]
    ConservationViolation {
        stage: &'static str,
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Ambiguous bucket overlap: category '{category}' is both a named row and part of All Other")]
    AmbiguousBucketOverlap { category: String },

    #[error("Incomplete buckets for column {column}: rows sum to {actual}, total is {expected}")]
    IncompleteBuckets {
        column: String,
        expected: String,
        actual: String,
    },

    #[error("Table '{table}' failed: {source}")]
    Table {
        table: String,
        #[source]
        source: Box<AttributionError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for AttributionError {
    fn from(err: polars::error::PolarsError) -> Self {
        AttributionError::Polars(err.to_string())
    }
}

impl AttributionError {
    pub fn schema(relation: impl Into<String>, message: impl Into<String>) -> Self {
        AttributionError::Schema {
            relation: relation.into(),
            message: message.into(),
        }
    }

    /// Wrap a failure with the title of the table being built.
    pub fn in_table(self, table: impl Into<String>) -> Self {
        AttributionError::Table {
            table: table.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, AttributionError>;
