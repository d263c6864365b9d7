//! Attribute Expander
//!
//! Normalizes delimiter-separated, multi-valued attribute fields into atomic
//! (actor, dimension, value) rows. Every actor ends up with at least one value per
//! dimension: an empty field becomes the dimension's missing sentinel.

use crate::error::Result;
use crate::model::{ActorId, ActorRecord, Dimension};
use crate::schema::{self, EXPANDED_ATTRIBUTES};
use polars::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const DEFAULT_DELIMITER: &str = ";";

/// Per-dimension label substituted for empty or absent attribute fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissingLabels {
    pub country: String,
    pub sector: String,
    pub organization: String,
}

impl Default for MissingLabels {
    fn default() -> Self {
        Self {
            country: "Missing Country".to_string(),
            sector: "Missing Sector".to_string(),
            organization: "Missing Organization".to_string(),
        }
    }
}

impl MissingLabels {
    pub fn label(&self, dimension: Dimension) -> &str {
        match dimension {
            Dimension::Country => &self.country,
            Dimension::Sector => &self.sector,
            Dimension::Organization => &self.organization,
        }
    }

    pub fn is_missing(&self, dimension: Dimension, value: &str) -> bool {
        self.label(dimension) == value
    }
}

/// Deduplicated values of one actor, per dimension, in first-encountered order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorValues {
    values: BTreeMap<Dimension, Vec<String>>,
}

impl ActorValues {
    /// Values for an actor absent from the attribute relation: the sentinel in every dimension.
    pub fn missing(labels: &MissingLabels) -> Self {
        let values = Dimension::ALL
            .into_iter()
            .map(|d| (d, vec![labels.label(d).to_string()]))
            .collect();
        Self { values }
    }

    pub fn get(&self, dimension: Dimension) -> &[String] {
        self.values
            .get(&dimension)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// One output row of the expander.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRow {
    pub actor_id: ActorId,
    pub dimension: Dimension,
    pub value: String,
}

/// Expanded attribute relation, indexed by actor id.
#[derive(Debug, Clone)]
pub struct ExpandedAttributes {
    actors: HashMap<ActorId, ActorValues>,
    order: Vec<ActorId>,
    labels: MissingLabels,
}

impl ExpandedAttributes {
    pub fn get(&self, actor_id: &str) -> Option<&ActorValues> {
        self.actors.get(actor_id)
    }

    pub fn contains(&self, actor_id: &str) -> bool {
        self.actors.contains_key(actor_id)
    }

    pub fn labels(&self) -> &MissingLabels {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Long-format rows in actor first-appearance order, then dimension order.
    pub fn rows(&self) -> Vec<AttributeRow> {
        let mut rows = Vec::new();
        for actor_id in &self.order {
            let Some(values) = self.actors.get(actor_id) else {
                continue;
            };
            for dimension in Dimension::ALL {
                for value in values.get(dimension) {
                    rows.push(AttributeRow {
                        actor_id: actor_id.clone(),
                        dimension,
                        value: value.clone(),
                    });
                }
            }
        }
        rows
    }

    /// Export as a frame matching [`EXPANDED_ATTRIBUTES`].
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let rows = self.rows();
        let actor_ids: Vec<&str> = rows.iter().map(|r| r.actor_id.as_str()).collect();
        let dimensions: Vec<&str> = rows.iter().map(|r| r.dimension.column()).collect();
        let values: Vec<&str> = rows.iter().map(|r| r.value.as_str()).collect();

        let df = DataFrame::new(vec![
            Series::new(schema::ACTOR_ID, actor_ids),
            Series::new(schema::DIMENSION, dimensions),
            Series::new(schema::VALUE, values),
        ])?;
        EXPANDED_ATTRIBUTES.validate(&df)?;
        Ok(df)
    }
}

pub struct AttributeExpander {
    splitter: Regex,
    labels: MissingLabels,
}

impl AttributeExpander {
    /// `delimiter` is a regular expression, so `[;|]` splits on either character.
    pub fn new(delimiter: &str, labels: MissingLabels) -> Result<Self> {
        Ok(Self {
            splitter: Regex::new(delimiter)?,
            labels,
        })
    }

    /// Split a raw field into trimmed, non-empty labels, keeping duplicates.
    fn tokens<'a>(&self, raw: Option<&'a str>) -> Vec<&'a str> {
        match raw {
            Some(raw) => self
                .splitter
                .split(raw)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Normalize one field: trim, dedupe exact matches, fall back to the sentinel.
    pub fn split_field(&self, raw: Option<&str>, dimension: Dimension) -> Vec<String> {
        let mut values: Vec<String> = Vec::new();
        push_unique(&mut values, self.tokens(raw));
        self.finish_values(values, dimension)
    }

    fn finish_values(&self, values: Vec<String>, dimension: Dimension) -> Vec<String> {
        let sentinel = self.labels.label(dimension);
        let mut resolved: Vec<String> = values.into_iter().filter(|v| v != sentinel).collect();
        if resolved.is_empty() {
            resolved.push(sentinel.to_string());
        }
        resolved
    }

    /// Expand a batch of raw records. Repeated records for one actor are merged.
    pub fn expand(&self, records: &[ActorRecord]) -> ExpandedAttributes {
        let mut raw: HashMap<ActorId, BTreeMap<Dimension, Vec<String>>> = HashMap::new();
        let mut order = Vec::new();

        for record in records {
            let entry = raw.entry(record.actor_id.clone()).or_insert_with(|| {
                order.push(record.actor_id.clone());
                BTreeMap::new()
            });
            for dimension in Dimension::ALL {
                let slot = entry.entry(dimension).or_default();
                push_unique(slot, self.tokens(record.field(dimension)));
            }
        }

        let actors: HashMap<ActorId, ActorValues> = raw
            .into_iter()
            .map(|(actor_id, mut per_dim)| {
                let values = Dimension::ALL
                    .into_iter()
                    .map(|d| {
                        let collected = per_dim.remove(&d).unwrap_or_default();
                        (d, self.finish_values(collected, d))
                    })
                    .collect();
                (actor_id, ActorValues { values })
            })
            .collect();

        debug!(
            records = records.len(),
            actors = actors.len(),
            "expanded actor attributes"
        );

        ExpandedAttributes {
            actors,
            order,
            labels: self.labels.clone(),
        }
    }
}

fn push_unique(values: &mut Vec<String>, tokens: Vec<&str>) {
    for token in tokens {
        if !values.iter().any(|v| v == token) {
            values.push(token.to_string());
        }
    }
}
