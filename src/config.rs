//! Report configuration.
//!
//! A `ReportPlan` is a JSON document listing every table to build. Each
//! `TableConfig` parameterizes one run of the engine: dimensions, row selection,
//! join policy, cohort policy and column layout.

use crate::aggregator::{RowSelection, TopN};
use crate::collaboration::CollaborationMode;
use crate::error::{AttributionError, Result};
use crate::expander::{MissingLabels, DEFAULT_DELIMITER};
use crate::joiner::JoinPolicy;
use crate::model::Dimension;
use crate::period::{CohortPolicy, PeriodGrouping};
use crate::pivot::ColumnLayout;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

fn default_delimiter() -> String {
    DEFAULT_DELIMITER.to_string()
}

fn default_true() -> bool {
    true
}

/// What a table measures and how its rows are laid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableKind {
    /// Fractional credit by category of one dimension, or of two crossed dimensions.
    Credit {
        dimensions: Vec<Dimension>,
        #[serde(default)]
        rows: RowSelection,
        #[serde(default)]
        label_header: Option<String>,
        #[serde(default)]
        total_label: Option<String>,
    },
    /// Global total, focal total, secondary categories within the focal value,
    /// then the primary dimension's missing total.
    FocalBreakdown {
        primary: Dimension,
        secondary: Dimension,
        focal: String,
        #[serde(default)]
        top_n: TopN,
    },
    /// Unit counts of total units and of collaborations matching `mode`.
    Collaboration {
        dimension: Dimension,
        focal: String,
        mode: CollaborationMode,
        #[serde(default)]
        top_partners: Option<TopN>,
    },
    /// Distinct-unit counts of canonical value pairs.
    PairCounts {
        dimension: Dimension,
        #[serde(default)]
        top_n: TopN,
        #[serde(default = "default_true")]
        require_multiple_actors: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub title: String,
    /// Section of the output document the sink places this table in.
    pub section: String,
    #[serde(flatten)]
    pub kind: TableKind,
    #[serde(default)]
    pub join_policy: JoinPolicy,
    /// Dimension the outer-with-gate policy checks; defaults to the first dimension.
    #[serde(default)]
    pub gate_dimension: Option<Dimension>,
    #[serde(default)]
    pub cohort: CohortPolicy,
    #[serde(default)]
    pub period_grouping: PeriodGrouping,
    pub columns: ColumnLayout,
    /// Run conservation and completeness checks; any failure aborts the table.
    #[serde(default)]
    pub validate: bool,
}

impl TableConfig {
    /// Dimensions credit is allocated over, in table order.
    pub fn dimensions(&self) -> Vec<Dimension> {
        match &self.kind {
            TableKind::Credit { dimensions, .. } => dimensions.clone(),
            TableKind::FocalBreakdown {
                primary, secondary, ..
            } => vec![*primary, *secondary],
            TableKind::Collaboration { dimension, .. } | TableKind::PairCounts { dimension, .. } => {
                vec![*dimension]
            }
        }
    }

    pub fn gate(&self) -> Dimension {
        self.gate_dimension
            .or_else(|| self.dimensions().first().copied())
            .unwrap_or(Dimension::Country)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(AttributionError::Config(format!("table '{}': {}", self.title, msg)));

        if self.title.trim().is_empty() {
            return Err(AttributionError::Config("table title must not be empty".to_string()));
        }
        crate::sink::check_section(&self.section)?;
        self.columns.validate()?;

        let dimensions = self.dimensions();
        match &self.kind {
            TableKind::Credit { dimensions, rows, .. } => {
                if dimensions.is_empty() || dimensions.len() > 2 {
                    return fail(format!("expected one or two dimensions, got {}", dimensions.len()));
                }
                if dimensions.len() == 2 && dimensions[0] == dimensions[1] {
                    return fail(format!("cannot cross {} with itself", dimensions[0]));
                }
                if let RowSelection::Explicit { categories, total_label } = rows {
                    let unique: HashSet<&String> = categories.iter().collect();
                    if unique.len() != categories.len() {
                        return fail("explicit categories contain duplicates".to_string());
                    }
                    if let Some(label) = total_label.as_ref().filter(|l| unique.contains(l)) {
                        return fail(format!("total label '{}' is also a listed category", label));
                    }
                }
            }
            TableKind::FocalBreakdown {
                primary,
                secondary,
                focal,
                ..
            } => {
                if primary == secondary {
                    return fail(format!("cannot break {} down by itself", primary));
                }
                if focal.trim().is_empty() {
                    return fail("focal value must not be empty".to_string());
                }
            }
            TableKind::Collaboration { focal, .. } => {
                if focal.trim().is_empty() {
                    return fail("focal value must not be empty".to_string());
                }
            }
            TableKind::PairCounts { .. } => {}
        }

        if let PeriodGrouping::UnitAndValue(d) = self.period_grouping {
            if !dimensions.contains(&d) {
                return fail(format!("period grouping dimension {} is not a table dimension", d));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPlan {
    /// Regular expression separating labels inside an attribute field.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub missing_labels: MissingLabels,
    pub tables: Vec<TableConfig>,
}

impl ReportPlan {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AttributionError::Config(format!("failed to read plan {}: {}", path.display(), e))
        })?;
        let plan = Self::from_json(&content)?;
        tracing::info!(path = %path.display(), tables = plan.tables.len(), "loaded report plan");
        Ok(plan)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let plan: ReportPlan = serde_json::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.delimiter.is_empty() {
            return Err(AttributionError::Config("delimiter must not be empty".to_string()));
        }
        let mut sections = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !sections.insert(table.section.as_str()) {
                return Err(AttributionError::Config(format!(
                    "section '{}' is used by more than one table",
                    table.section
                )));
            }
        }
        Ok(())
    }
}
