//! Data Source
//!
//! Yields the two input relations (contribution events and raw actor attributes)
//! as validated polars frames, then lowers them into domain records. Events are
//! deduplicated upstream: one row per (actor, unit) at the minimum period.

use crate::error::{AttributionError, Result};
use crate::model::{ActorRecord, ContributionEvent, Dimension, Period};
use crate::schema::{self, ColumnType, RelationSchema, ACTORS, EVENTS};
use csv::ReaderBuilder;
use polars::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Input snapshot for one run. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct SourceData {
    pub events: Vec<ContributionEvent>,
    pub actors: Vec<ActorRecord>,
}

impl SourceData {
    pub fn new(events: Vec<ContributionEvent>, actors: Vec<ActorRecord>) -> Self {
        Self { events, actors }
    }

    /// Validate both frames, collapse duplicate events and lower to records.
    pub fn from_frames(events: &DataFrame, actors: &DataFrame) -> Result<Self> {
        let deduped = dedup_events(events)?;
        let data = Self {
            events: events_from_frame(&deduped)?,
            actors: actors_from_frame(actors)?,
        };
        info!(
            raw_events = events.height(),
            events = data.events.len(),
            actor_records = data.actors.len(),
            "loaded source data"
        );
        Ok(data)
    }
}

pub trait DataSource {
    fn name(&self) -> &str;

    fn load(&self) -> Result<SourceData>;
}

/// Keep the minimum period per (actor_id, unit_id), in first-appearance order.
pub fn dedup_events(events: &DataFrame) -> Result<DataFrame> {
    EVENTS.validate(events)?;
    let deduped = events
        .clone()
        .lazy()
        .group_by_stable([col(schema::ACTOR_ID), col(schema::UNIT_ID)])
        .agg([col(schema::PERIOD).min()])
        .collect()?;
    debug!(
        before = events.height(),
        after = deduped.height(),
        "deduplicated contribution events"
    );
    Ok(deduped)
}

pub fn events_from_frame(df: &DataFrame) -> Result<Vec<ContributionEvent>> {
    EVENTS.validate(df)?;
    let actor_ids = schema::required_text_column(df, EVENTS.relation, schema::ACTOR_ID)?;
    let unit_ids = schema::required_text_column(df, EVENTS.relation, schema::UNIT_ID)?;
    let periods = schema::integer_column(df, EVENTS.relation, schema::PERIOD)?;

    actor_ids
        .into_iter()
        .zip(unit_ids)
        .zip(periods)
        .enumerate()
        .map(|(row, ((actor_id, unit_id), period))| {
            let period = Period::try_from(period).map_err(|_| {
                AttributionError::schema(
                    EVENTS.relation,
                    format!("period {} at row {} is out of range", period, row),
                )
            })?;
            Ok(ContributionEvent {
                actor_id,
                unit_id,
                period,
            })
        })
        .collect()
}

pub fn actors_from_frame(df: &DataFrame) -> Result<Vec<ActorRecord>> {
    ACTORS.validate(df)?;
    let actor_ids = schema::required_text_column(df, ACTORS.relation, schema::ACTOR_ID)?;
    let mut fields = Vec::with_capacity(Dimension::ALL.len());
    for dimension in Dimension::ALL {
        fields.push(schema::text_column(df, ACTORS.relation, dimension.column())?);
    }

    let records = actor_ids
        .into_iter()
        .enumerate()
        .map(|(row, actor_id)| ActorRecord {
            actor_id,
            country: fields[0][row].clone(),
            sector: fields[1][row].clone(),
            organization: fields[2][row].clone(),
        })
        .collect();
    Ok(records)
}

/// Read a CSV file into a frame typed by `relation`. Blank cells become nulls;
/// columns the relation does not declare are ignored.
pub fn read_csv_frame(path: &Path, relation: &RelationSchema) -> Result<DataFrame> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let positions = relation
        .columns
        .iter()
        .map(|def| {
            headers.iter().position(|h| h == def.name).ok_or_else(|| {
                AttributionError::schema(
                    relation.relation,
                    format!("{} has no '{}' column", path.display(), def.name),
                )
            })
        })
        .collect::<Result<Vec<usize>>>()?;

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); relation.columns.len()];
    for record in reader.records() {
        let record = record?;
        for (slot, index) in cells.iter_mut().zip(&positions) {
            let cell = record.get(*index).map(str::trim).filter(|c| !c.is_empty());
            slot.push(cell.map(str::to_string));
        }
    }

    let mut series = Vec::with_capacity(relation.columns.len());
    for (def, values) in relation.columns.iter().zip(cells) {
        let column = match def.kind {
            ColumnType::Text => Series::new(def.name, values),
            ColumnType::Integer => Series::new(def.name, parse_cells::<i64>(relation, def.name, values)?),
            ColumnType::Float => Series::new(def.name, parse_cells::<f64>(relation, def.name, values)?),
        };
        series.push(column);
    }
    let df = DataFrame::new(series)?;
    debug!(path = %path.display(), rows = df.height(), relation = relation.relation, "read csv");
    Ok(df)
}

fn parse_cells<T: std::str::FromStr>(
    relation: &RelationSchema,
    name: &str,
    values: Vec<Option<String>>,
) -> Result<Vec<Option<T>>> {
    values
        .into_iter()
        .enumerate()
        .map(|(row, cell)| match cell {
            None => Ok(None),
            Some(text) => text.parse::<T>().map(Some).map_err(|_| {
                AttributionError::schema(
                    relation.relation,
                    format!("column '{}' at row {} is not numeric: '{}'", name, row, text),
                )
            }),
        })
        .collect()
}

/// Events and actor attributes read from two CSV files.
pub struct CsvSource {
    events: PathBuf,
    actors: PathBuf,
}

impl CsvSource {
    pub fn new(events: impl Into<PathBuf>, actors: impl Into<PathBuf>) -> Self {
        Self {
            events: events.into(),
            actors: actors.into(),
        }
    }
}

impl DataSource for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn load(&self) -> Result<SourceData> {
        let events = read_csv_frame(&self.events, &EVENTS)?;
        let actors = read_csv_frame(&self.actors, &ACTORS)?;
        SourceData::from_frames(&events, &actors)
    }
}

/// In-memory polars frames, already shaped like the input relations.
pub struct FrameSource {
    events: DataFrame,
    actors: DataFrame,
}

impl FrameSource {
    pub fn new(events: DataFrame, actors: DataFrame) -> Self {
        Self { events, actors }
    }
}

impl DataSource for FrameSource {
    fn name(&self) -> &str {
        "frames"
    }

    fn load(&self) -> Result<SourceData> {
        SourceData::from_frames(&self.events, &self.actors)
    }
}
