//! Aggregator / Bucketizer
//!
//! Sums credit rows by (category, column) in partitions, reduces the partials, and
//! folds the long tail of categories into a fixed Top-N + "All Other" + "Missing"
//! display with an independently computed "Total" row.

use crate::error::{AttributionError, Result};
use crate::model::{CategorySummary, Period};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

pub const ALL_OTHER: &str = "All Other";
pub const DEFAULT_TOTAL_LABEL: &str = "Total";

/// Number of credit rows summed per partition before the reduce step.
pub const PARTITION_SIZE: usize = 4096;

/// `Some(period)` for a period column, `None` for the single overall column.
pub type ColumnKey = Option<Period>;

pub fn column_name(column: ColumnKey) -> String {
    match column {
        Some(period) => period.to_string(),
        None => "overall".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TopNRepr", into = "TopNRepr")]
pub enum TopN {
    All,
    Count(usize),
}

impl Default for TopN {
    fn default() -> Self {
        TopN::All
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TopNRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<TopNRepr> for TopN {
    type Error = String;

    fn try_from(repr: TopNRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            TopNRepr::Count(n) => Ok(TopN::Count(n)),
            TopNRepr::Keyword(k) if k.eq_ignore_ascii_case("all") => Ok(TopN::All),
            TopNRepr::Keyword(k) => Err(format!("top_n must be an integer or \"all\", got \"{}\"", k)),
        }
    }
}

impl From<TopN> for TopNRepr {
    fn from(top_n: TopN) -> Self {
        match top_n {
            TopN::All => TopNRepr::Keyword("all".to_string()),
            TopN::Count(n) => TopNRepr::Count(n),
        }
    }
}

/// How the named rows of a table are chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowSelection {
    /// Rank by overall total; optionally fold the remainder into "All Other".
    TopN(TopN),
    /// Fixed, ordered category list headed by an optional sum row.
    Explicit {
        categories: Vec<String>,
        #[serde(default)]
        total_label: Option<String>,
    },
}

impl Default for RowSelection {
    fn default() -> Self {
        RowSelection::TopN(TopN::All)
    }
}

/// Partially reduced category sums. Merging is exact and order-independent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialTotals {
    sums: BTreeMap<String, CategoryTotals>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CategoryTotals {
    by_column: BTreeMap<ColumnKey, Decimal>,
    overall: Decimal,
    first_seen: usize,
    missing: bool,
}

impl CategoryTotals {
    fn absorb(&mut self, other: CategoryTotals) {
        for (column, value) in other.by_column {
            *self.by_column.entry(column).or_insert(Decimal::ZERO) += value;
        }
        self.overall += other.overall;
        self.first_seen = self.first_seen.min(other.first_seen);
        self.missing |= other.missing;
    }
}

impl PartialTotals {
    pub fn add(
        &mut self,
        category: &str,
        is_missing: bool,
        column: ColumnKey,
        fraction: Decimal,
        ordinal: usize,
    ) {
        if !self.sums.contains_key(category) {
            let fresh = CategoryTotals {
                first_seen: ordinal,
                ..Default::default()
            };
            self.sums.insert(category.to_string(), fresh);
        }
        if let Some(totals) = self.sums.get_mut(category) {
            *totals.by_column.entry(column).or_insert(Decimal::ZERO) += fraction;
            totals.overall += fraction;
            totals.first_seen = totals.first_seen.min(ordinal);
            totals.missing |= is_missing;
        }
    }

    pub fn merge(mut self, other: PartialTotals) -> PartialTotals {
        for (category, totals) in other.sums {
            match self.sums.get_mut(&category) {
                Some(existing) => existing.absorb(totals),
                None => {
                    self.sums.insert(category, totals);
                }
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.sums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    pub fn is_missing(&self, category: &str) -> bool {
        self.sums.get(category).is_some_and(|t| t.missing)
    }

    /// Categories in first-encountered order.
    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<(&str, usize)> = self
            .sums
            .iter()
            .map(|(c, t)| (c.as_str(), t.first_seen))
            .collect();
        categories.sort_by_key(|(_, o)| *o);
        categories.into_iter().map(|(c, _)| c).collect()
    }

    pub fn overall(&self, category: &str) -> Decimal {
        self.sums.get(category).map(|t| t.overall).unwrap_or(Decimal::ZERO)
    }

    pub fn by_column(&self, category: &str) -> BTreeMap<ColumnKey, Decimal> {
        self.sums
            .get(category)
            .map(|t| t.by_column.clone())
            .unwrap_or_default()
    }

    /// Per-column sum over every category.
    pub fn column_sums(&self) -> BTreeMap<ColumnKey, Decimal> {
        let mut sums = BTreeMap::new();
        for totals in self.sums.values() {
            for (column, value) in &totals.by_column {
                *sums.entry(*column).or_insert(Decimal::ZERO) += *value;
            }
        }
        sums
    }

    /// Long (category, column, total) rows in first-encountered category order.
    pub fn summaries(&self) -> Vec<CategorySummary> {
        self.categories()
            .into_iter()
            .flat_map(move |category| {
                self.sums.get(category).into_iter().flat_map(move |totals| {
                    totals.by_column.iter().map(move |(period, total)| CategorySummary {
                        category: category.to_string(),
                        period: *period,
                        total: *total,
                    })
                })
            })
            .collect()
    }

    /// Non-missing categories by overall total descending; ties by first encounter.
    pub fn ranked(&self) -> Vec<&str> {
        let mut ranked: Vec<(&str, Decimal, usize)> = self
            .sums
            .iter()
            .filter(|(_, t)| !t.missing)
            .map(|(c, t)| (c.as_str(), t.overall, t.first_seen))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        ranked.into_iter().map(|(c, _, _)| c).collect()
    }
}

/// Classified credit: category label, missing flag, column, fraction.
pub type Classified = (String, bool, ColumnKey, Decimal);

/// Partition `items`, sum each partition, then reduce.
///
/// `classify` returns `None` for items that do not belong in the table. Ordinals are
/// global item positions, so the first-encountered order survives any partitioning.
pub fn aggregate<T, F>(items: &[T], partition_size: usize, classify: F) -> PartialTotals
where
    F: Fn(&T) -> Vec<Classified>,
{
    let size = partition_size.max(1);
    let totals = items
        .chunks(size)
        .enumerate()
        .map(|(chunk, part)| {
            let mut partial = PartialTotals::default();
            for (offset, item) in part.iter().enumerate() {
                for (category, is_missing, column, fraction) in classify(item) {
                    partial.add(&category, is_missing, column, fraction, chunk * size + offset);
                }
            }
            partial
        })
        .fold(PartialTotals::default(), PartialTotals::merge);
    debug!(
        items = items.len(),
        categories = totals.len(),
        "aggregated partial totals"
    );
    totals
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Total,
    Named,
    AllOther,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRow {
    pub label: String,
    pub kind: BucketKind,
    pub values: BTreeMap<ColumnKey, Decimal>,
}

impl BucketRow {
    pub fn new(label: impl Into<String>, kind: BucketKind) -> Self {
        Self {
            label: label.into(),
            kind,
            values: BTreeMap::new(),
        }
    }

    pub fn with_values(mut self, values: BTreeMap<ColumnKey, Decimal>) -> Self {
        self.values = values;
        self
    }

    fn add_all(&mut self, values: &BTreeMap<ColumnKey, Decimal>) {
        for (column, value) in values {
            *self.values.entry(*column).or_insert(Decimal::ZERO) += *value;
        }
    }
}

pub struct Bucketizer<'a> {
    selection: &'a RowSelection,
    missing_label: &'a str,
    total_label: &'a str,
}

impl<'a> Bucketizer<'a> {
    pub fn new(selection: &'a RowSelection, missing_label: &'a str, total_label: &'a str) -> Self {
        Self {
            selection,
            missing_label,
            total_label,
        }
    }

    /// Build the display rows. `grand_total`, when given, becomes the leading Total row.
    pub fn bucketize(
        &self,
        totals: &PartialTotals,
        grand_total: Option<&BTreeMap<ColumnKey, Decimal>>,
    ) -> Result<Vec<BucketRow>> {
        let rows = match self.selection {
            RowSelection::TopN(top_n) => self.top_n_rows(totals, *top_n, grand_total)?,
            RowSelection::Explicit {
                categories,
                total_label,
            } => explicit_rows(totals, categories, total_label.as_deref()),
        };
        check_unique_labels(rows.iter().map(|r| r.label.as_str()))?;
        Ok(rows)
    }

    fn top_n_rows(
        &self,
        totals: &PartialTotals,
        top_n: TopN,
        grand_total: Option<&BTreeMap<ColumnKey, Decimal>>,
    ) -> Result<Vec<BucketRow>> {
        let ranked = totals.ranked();
        let cut = match top_n {
            TopN::All => ranked.len(),
            TopN::Count(n) => n.min(ranked.len()),
        };
        let (named, other) = ranked.split_at(cut);
        check_disjoint(named, other)?;

        let mut rows = Vec::new();
        if let Some(grand_total) = grand_total {
            rows.push(BucketRow::new(self.total_label, BucketKind::Total).with_values(grand_total.clone()));
        }
        for category in named {
            rows.push(BucketRow::new(*category, BucketKind::Named).with_values(totals.by_column(category)));
        }
        if let TopN::Count(_) = top_n {
            let mut all_other = BucketRow::new(ALL_OTHER, BucketKind::AllOther);
            for category in other {
                all_other.add_all(&totals.by_column(category));
            }
            rows.push(all_other);
        }
        let mut missing = BucketRow::new(self.missing_label, BucketKind::Missing);
        for category in totals.categories() {
            if totals.is_missing(category) {
                missing.add_all(&totals.by_column(category));
            }
        }
        rows.push(missing);

        debug!(
            named = named.len(),
            folded = other.len(),
            "bucketized categories"
        );
        Ok(rows)
    }
}

fn explicit_rows(totals: &PartialTotals, categories: &[String], total_label: Option<&str>) -> Vec<BucketRow> {
    let mut rows: Vec<BucketRow> = categories
        .iter()
        .map(|c| BucketRow::new(c.as_str(), BucketKind::Named).with_values(totals.by_column(c)))
        .collect();
    if let Some(label) = total_label {
        let mut total = BucketRow::new(label, BucketKind::Total);
        for row in &rows {
            total.add_all(&row.values);
        }
        rows.insert(0, total);
    }
    rows
}

/// A category can never be both named and folded into "All Other".
pub fn check_disjoint(named: &[&str], other: &[&str]) -> Result<()> {
    let named: HashSet<&str> = named.iter().copied().collect();
    match other.iter().find(|c| named.contains(*c)) {
        Some(category) => Err(AttributionError::AmbiguousBucketOverlap {
            category: category.to_string(),
        }),
        None => Ok(()),
    }
}

/// A category named like a total, "All Other" or missing row cannot share its display row.
pub fn check_unique_labels<'r>(labels: impl IntoIterator<Item = &'r str>) -> Result<()> {
    let mut seen = HashSet::new();
    match labels.into_iter().find(|label| !seen.insert(*label)) {
        Some(label) => Err(AttributionError::AmbiguousBucketOverlap {
            category: label.to_string(),
        }),
        None => Ok(()),
    }
}

/// Check that the non-total rows reproduce the Total row in every column.
pub fn check_completeness(rows: &[BucketRow]) -> Result<()> {
    let Some(total) = rows.iter().find(|r| r.kind == BucketKind::Total) else {
        return Ok(());
    };
    let mut sums: BTreeMap<ColumnKey, Decimal> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.kind != BucketKind::Total) {
        for (column, value) in &row.values {
            *sums.entry(*column).or_insert(Decimal::ZERO) += *value;
        }
    }
    let columns: BTreeSet<ColumnKey> = sums.keys().chain(total.values.keys()).copied().collect();
    let tolerance = crate::allocator::conservation_tolerance();
    for column in columns {
        let expected = total.values.get(&column).copied().unwrap_or(Decimal::ZERO);
        let actual = sums.get(&column).copied().unwrap_or(Decimal::ZERO);
        if (expected - actual).abs() > tolerance {
            return Err(AttributionError::IncompleteBuckets {
                column: column_name(column),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}
