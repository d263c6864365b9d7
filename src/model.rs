//! Domain types shared by every stage of the attribution pipeline.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ActorId = String;
pub type UnitId = String;

/// Periods are integer years.
pub type Period = i32;

/// A categorical attribute type an actor can hold several values of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Country,
    Sector,
    Organization,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Country, Dimension::Sector, Dimension::Organization];

    /// Column name of this dimension in the actor attribute relation.
    pub fn column(&self) -> &'static str {
        match self {
            Dimension::Country => "country",
            Dimension::Sector => "sector",
            Dimension::Organization => "organization",
        }
    }

    /// Title-cased name used as a table row header.
    pub fn header(&self) -> &'static str {
        match self {
            Dimension::Country => "Country",
            Dimension::Sector => "Sector",
            Dimension::Organization => "Organization",
        }
    }

    pub fn from_column(name: &str) -> Option<Dimension> {
        Dimension::ALL.into_iter().find(|d| d.column() == name)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// One actor acting on one unit, stamped with the period of that contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionEvent {
    pub actor_id: ActorId,
    pub unit_id: UnitId,
    pub period: Period,
}

impl ContributionEvent {
    pub fn new(actor_id: impl Into<String>, unit_id: impl Into<String>, period: Period) -> Self {
        Self {
            actor_id: actor_id.into(),
            unit_id: unit_id.into(),
            period,
        }
    }
}

/// Raw attribute record as supplied by the data source. Each field is a
/// delimiter-separated list of labels and may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub actor_id: ActorId,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl ActorRecord {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            ..Default::default()
        }
    }

    pub fn with(mut self, dimension: Dimension, raw: impl Into<String>) -> Self {
        let raw = Some(raw.into());
        match dimension {
            Dimension::Country => self.country = raw,
            Dimension::Sector => self.sector = raw,
            Dimension::Organization => self.organization = raw,
        }
        self
    }

    pub fn field(&self, dimension: Dimension) -> Option<&str> {
        match dimension {
            Dimension::Country => self.country.as_deref(),
            Dimension::Sector => self.sector.as_deref(),
            Dimension::Organization => self.organization.as_deref(),
        }
    }
}

/// Share of one unit's credit held by one actor for one value (or one crossed
/// value tuple, aligned with the table's dimensions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeCredit {
    pub unit_id: UnitId,
    pub actor_id: ActorId,
    pub values: Vec<String>,
    pub period: Period,
    pub fraction: Decimal,
}

/// Summed credit of one category in one period (`None` for the overall column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySummary {
    pub category: String,
    pub period: Option<Period>,
    pub total: Decimal,
}
