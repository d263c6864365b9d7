//! Explicit relation schemas.
//!
//! Every relation that crosses a stage boundary (source input, expander output,
//! allocator output) is described here and validated against its polars frame, so
//! malformed input fails fast with the relation, column and row that broke it.

use crate::error::{AttributionError, Result};
use polars::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
}

impl ColumnType {
    fn accepts(&self, dtype: &DataType) -> bool {
        match self {
            ColumnType::Text => matches!(dtype, DataType::String),
            ColumnType::Integer => dtype.is_integer(),
            ColumnType::Float => dtype.is_float(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnType,
    pub nullable: bool,
}

const fn column(name: &'static str, kind: ColumnType, nullable: bool) -> ColumnSpec {
    ColumnSpec { name, kind, nullable }
}

#[derive(Debug, Clone, Copy)]
pub struct RelationSchema {
    pub relation: &'static str,
    pub columns: &'static [ColumnSpec],
}

pub const ACTOR_ID: &str = "actor_id";
pub const UNIT_ID: &str = "unit_id";
pub const PERIOD: &str = "period";
pub const DIMENSION: &str = "dimension";
pub const VALUE: &str = "value";
pub const CATEGORY: &str = "category";
pub const FRACTION: &str = "fraction";

pub const EVENTS: RelationSchema = RelationSchema {
    relation: "contribution_events",
    columns: &[
        column(ACTOR_ID, ColumnType::Text, false),
        column(UNIT_ID, ColumnType::Text, false),
        column(PERIOD, ColumnType::Integer, false),
    ],
};

pub const ACTORS: RelationSchema = RelationSchema {
    relation: "actor_attributes",
    columns: &[
        column(ACTOR_ID, ColumnType::Text, false),
        column("country", ColumnType::Text, true),
        column("sector", ColumnType::Text, true),
        column("organization", ColumnType::Text, true),
    ],
};

pub const EXPANDED_ATTRIBUTES: RelationSchema = RelationSchema {
    relation: "expanded_attributes",
    columns: &[
        column(ACTOR_ID, ColumnType::Text, false),
        column(DIMENSION, ColumnType::Text, false),
        column(VALUE, ColumnType::Text, false),
    ],
};

pub const CREDITS: RelationSchema = RelationSchema {
    relation: "attribute_credits",
    columns: &[
        column(UNIT_ID, ColumnType::Text, false),
        column(ACTOR_ID, ColumnType::Text, false),
        column(CATEGORY, ColumnType::Text, false),
        column(PERIOD, ColumnType::Integer, false),
        column(FRACTION, ColumnType::Float, false),
    ],
};

impl RelationSchema {
    /// Check presence, type and nullability of every declared column.
    pub fn validate(&self, df: &DataFrame) -> Result<()> {
        for def in self.columns {
            let series = df.column(def.name).map_err(|_| {
                AttributionError::schema(
                    self.relation,
                    format!(
                        "missing column '{}' (found: {})",
                        def.name,
                        df.get_column_names().join(", ")
                    ),
                )
            })?;

            // An all-null column comes back from readers as Null dtype; accept it
            // where nulls are allowed.
            let all_null = matches!(series.dtype(), DataType::Null);
            if !(def.kind.accepts(series.dtype()) || (def.nullable && all_null)) {
                return Err(AttributionError::schema(
                    self.relation,
                    format!(
                        "column '{}' has type {}, expected {}",
                        def.name,
                        series.dtype(),
                        def.kind.name()
                    ),
                ));
            }

            if !def.nullable && series.null_count() > 0 {
                let mask = series.is_null();
                let row = (&mask)
                    .into_iter()
                    .position(|v| v == Some(true))
                    .unwrap_or_default();
                return Err(AttributionError::schema(
                    self.relation,
                    format!("column '{}' is null at row {}", def.name, row),
                ));
            }
        }
        Ok(())
    }
}

/// Read a validated text column, keeping nulls as `None`.
pub fn text_column(df: &DataFrame, relation: &str, name: &str) -> Result<Vec<Option<String>>> {
    let series = df
        .column(name)
        .map_err(|_| AttributionError::schema(relation, format!("missing column '{}'", name)))?;
    if matches!(series.dtype(), DataType::Null) {
        return Ok(vec![None; series.len()]);
    }
    let values = series
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect();
    Ok(values)
}

/// Read a validated, non-nullable text column.
pub fn required_text_column(df: &DataFrame, relation: &str, name: &str) -> Result<Vec<String>> {
    text_column(df, relation, name)?
        .into_iter()
        .enumerate()
        .map(|(row, v)| {
            v.ok_or_else(|| {
                AttributionError::schema(relation, format!("column '{}' is null at row {}", name, row))
            })
        })
        .collect()
}

/// Read a validated integer column as `i64`.
pub fn integer_column(df: &DataFrame, relation: &str, name: &str) -> Result<Vec<i64>> {
    let series = df
        .column(name)
        .map_err(|_| AttributionError::schema(relation, format!("missing column '{}'", name)))?
        .cast(&DataType::Int64)?;
    series
        .i64()?
        .into_iter()
        .enumerate()
        .map(|(row, v)| {
            v.ok_or_else(|| {
                AttributionError::schema(relation, format!("column '{}' is null at row {}", name, row))
            })
        })
        .collect()
}
