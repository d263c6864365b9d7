//! Attribution Engine
//!
//! Runs one `TableConfig` end to end: join, resolve periods, allocate credit,
//! aggregate, bucketize and pivot. Attributes are expanded once per engine and
//! shared by every table; each table run is otherwise independent and either
//! returns a complete table or fails.

use crate::aggregator::{
    aggregate, check_completeness, check_unique_labels, BucketKind, BucketRow, Bucketizer,
    Classified, ColumnKey, RowSelection, TopN, DEFAULT_TOTAL_LABEL, PARTITION_SIZE,
};
use crate::allocator::{check_conservation, Allocation, CreditAllocator};
use crate::collaboration::{pair_counts, CollaborationClassifier, CollaborationMode};
use crate::config::{ReportPlan, TableConfig, TableKind};
use crate::error::Result;
use crate::expander::{AttributeExpander, ExpandedAttributes, MissingLabels, DEFAULT_DELIMITER};
use crate::joiner::ContributionJoiner;
use crate::model::{AttributeCredit, ContributionEvent, Dimension};
use crate::period::{PeriodGrouping, PeriodResolver, ResolvedUnit};
use crate::pivot::{pivot, pivot_buckets, ColumnLayout, LongRow, Table};
use crate::sink::ReportSink;
use crate::source::SourceData;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, info_span};
use uuid::Uuid;

/// Row label of a crossed table's combined missing category.
pub const CROSSED_MISSING: &str = "Missing";
pub const TOTAL_REPOS: &str = "Total Repos";
pub const COLLABORATIONS: &str = "Collaborations";
pub const GLOBAL_TOTAL: &str = "Total (Global)";

/// Build one table with default delimiter and missing labels.
pub fn run(config: &TableConfig, data: &SourceData) -> Result<Table> {
    AttributionEngine::new(data, DEFAULT_DELIMITER, MissingLabels::default())?.run(config)
}

pub struct AttributionEngine<'a> {
    events: &'a [ContributionEvent],
    attributes: ExpandedAttributes,
    labels: MissingLabels,
    partition_size: usize,
}

impl<'a> AttributionEngine<'a> {
    pub fn new(data: &'a SourceData, delimiter: &str, labels: MissingLabels) -> Result<Self> {
        let expander = AttributeExpander::new(delimiter, labels.clone())?;
        let attributes = expander.expand(&data.actors);
        Ok(Self {
            events: &data.events,
            attributes,
            labels,
            partition_size: PARTITION_SIZE,
        })
    }

    pub fn for_plan(data: &'a SourceData, plan: &ReportPlan) -> Result<Self> {
        Self::new(data, &plan.delimiter, plan.missing_labels.clone())
    }

    /// Override the aggregation partition size. Results do not depend on it.
    pub fn with_partition_size(mut self, partition_size: usize) -> Self {
        self.partition_size = partition_size.max(1);
        self
    }

    pub fn attributes(&self) -> &ExpandedAttributes {
        &self.attributes
    }

    pub fn run(&self, config: &TableConfig) -> Result<Table> {
        let run_id = Uuid::new_v4();
        let span = info_span!("table", title = %config.title, run_id = %run_id);
        let _guard = span.enter();

        let table = self.build(config).map_err(|e| e.in_table(&config.title))?;
        info!(
            rows = table.rows.len(),
            columns = table.columns.len(),
            "built table"
        );
        Ok(table)
    }

    /// Build every table of `plan` and hand each to `sink`. The first failure
    /// aborts the plan before `finish`, so file sinks write nothing.
    pub fn run_plan(&self, plan: &ReportPlan, sink: &mut dyn ReportSink) -> Result<usize> {
        plan.validate()?;
        for config in &plan.tables {
            let table = self.run(config)?;
            sink.write_table(&config.section, &table)?;
        }
        sink.finish()?;
        info!(tables = plan.tables.len(), "report plan complete");
        Ok(plan.tables.len())
    }

    /// Joined and period-resolved units for `config`.
    pub fn resolve_units(&self, config: &TableConfig) -> Result<Vec<ResolvedUnit>> {
        let joiner = ContributionJoiner::new(&self.attributes, config.join_policy, config.gate());
        let joined = joiner.join(self.events)?;
        Ok(PeriodResolver::new(config.cohort).resolve(&joined.units))
    }

    /// Credit allocation behind a credit or focal-breakdown table.
    pub fn allocation(&self, config: &TableConfig) -> Result<Allocation> {
        let units = self.resolve_units(config)?;
        CreditAllocator::new(config.dimensions(), config.period_grouping).allocate(&units)
    }

    fn build(&self, config: &TableConfig) -> Result<Table> {
        config.validate()?;
        match &config.kind {
            TableKind::Credit {
                dimensions,
                rows,
                label_header,
                total_label,
            } => {
                let header = label_header
                    .clone()
                    .unwrap_or_else(|| dimensions.iter().map(|d| d.header()).collect::<Vec<_>>().join(" / "));
                let total_label = total_label.as_deref().unwrap_or(DEFAULT_TOTAL_LABEL);
                self.credit_table(config, dimensions, rows, &header, total_label)
            }
            TableKind::FocalBreakdown {
                primary,
                secondary,
                focal,
                top_n,
            } => self.focal_table(config, *primary, *secondary, focal, *top_n),
            TableKind::Collaboration {
                dimension,
                focal,
                mode,
                top_partners,
            } => self.collaboration_table(config, *dimension, focal, *mode, *top_partners),
            TableKind::PairCounts {
                dimension,
                top_n,
                require_multiple_actors,
            } => self.pair_table(config, *dimension, *top_n, *require_multiple_actors),
        }
    }

    fn validated_allocation(&self, config: &TableConfig) -> Result<Allocation> {
        let allocation = self.allocation(config)?;
        if config.validate {
            check_conservation(&allocation)?;
        }
        Ok(allocation)
    }

    /// Per-period completeness only holds when every credit row carries the
    /// unit's period; value-grouped tables are checked on the overall layout.
    fn check_buckets(&self, config: &TableConfig, rows: &[BucketRow]) -> Result<()> {
        let comparable = config.period_grouping == PeriodGrouping::Unit
            || config.columns == ColumnLayout::Overall;
        if config.validate && comparable {
            check_completeness(rows)?;
        }
        Ok(())
    }

    fn category(&self, dimensions: &[Dimension], credit: &AttributeCredit) -> (String, bool) {
        let missing = dimensions
            .iter()
            .zip(&credit.values)
            .any(|(d, v)| self.labels.is_missing(*d, v));
        match (dimensions, missing) {
            ([_], _) => (credit.values.join(" / "), missing),
            (_, true) => (CROSSED_MISSING.to_string(), true),
            (_, false) => (credit.values.join(" / "), false),
        }
    }

    fn credit_table(
        &self,
        config: &TableConfig,
        dimensions: &[Dimension],
        rows: &RowSelection,
        header: &str,
        total_label: &str,
    ) -> Result<Table> {
        let allocation = self.validated_allocation(config)?;
        let layout = &config.columns;

        let totals = aggregate(&allocation.credits, self.partition_size, |c| {
            match layout.column_for(c.period) {
                Some(column) => {
                    let (category, missing) = self.category(dimensions, c);
                    vec![(category, missing, column, c.fraction)]
                }
                None => Vec::new(),
            }
        });
        let grand_total = grand_total(&allocation, layout);

        let missing_label = match dimensions {
            [single] => self.labels.label(*single),
            _ => CROSSED_MISSING,
        };
        let buckets = Bucketizer::new(rows, missing_label, total_label).bucketize(&totals, Some(&grand_total))?;
        self.check_buckets(config, &buckets)?;
        Ok(pivot_buckets(&config.title, header, &buckets, layout))
    }

    fn focal_table(
        &self,
        config: &TableConfig,
        primary: Dimension,
        secondary: Dimension,
        focal: &str,
        top_n: TopN,
    ) -> Result<Table> {
        let allocation = self.validated_allocation(config)?;
        let layout = &config.columns;

        let within_focal = aggregate(&allocation.credits, self.partition_size, |c| {
            match (c.values[0] == focal, layout.column_for(c.period)) {
                (true, Some(column)) => vec![(
                    c.values[1].clone(),
                    self.labels.is_missing(secondary, &c.values[1]),
                    column,
                    c.fraction,
                )],
                _ => Vec::new(),
            }
        });
        let primary_missing = self.labels.label(primary);
        let missing_totals = aggregate(&allocation.credits, self.partition_size, |c| {
            match (self.labels.is_missing(primary, &c.values[0]), layout.column_for(c.period)) {
                (true, Some(column)) => vec![(primary_missing.to_string(), true, column, c.fraction)],
                _ => Vec::new(),
            }
        });

        let focal_total = within_focal.column_sums();
        let focal_label = format!("Total ({})", focal);
        let selection = RowSelection::TopN(top_n);
        let secondary_rows = Bucketizer::new(&selection, self.labels.label(secondary), &focal_label)
            .bucketize(&within_focal, Some(&focal_total))?;
        self.check_buckets(config, &secondary_rows)?;

        let mut rows = Vec::with_capacity(secondary_rows.len() + 2);
        rows.push(BucketRow::new(GLOBAL_TOTAL, BucketKind::Total).with_values(grand_total(&allocation, layout)));
        rows.extend(secondary_rows);
        rows.push(
            BucketRow::new(format!("Total ({})", primary_missing), BucketKind::Total)
                .with_values(missing_totals.column_sums()),
        );
        check_unique_labels(rows.iter().map(|r| r.label.as_str()))?;
        Ok(pivot_buckets(&config.title, secondary.header(), &rows, layout))
    }

    fn collaboration_table(
        &self,
        config: &TableConfig,
        dimension: Dimension,
        focal: &str,
        mode: CollaborationMode,
        top_partners: Option<TopN>,
    ) -> Result<Table> {
        let units = self.resolve_units(config)?;
        let layout = &config.columns;
        let classifier = CollaborationClassifier::new(dimension, focal, &self.labels);
        let column_of = |u: &ResolvedUnit| u.first_period.and_then(|p| layout.column_for(p));

        let one = |row: usize, column: ColumnKey| LongRow {
            row,
            column,
            value: Decimal::ONE,
        };
        let mut long = Vec::new();
        let mut qualifying = Vec::new();
        for unit in &units {
            let Some(column) = column_of(unit) else {
                continue;
            };
            long.push(one(0, column));
            if classifier.qualifies(unit, mode) {
                long.push(one(1, column));
                qualifying.push(unit);
            }
        }
        debug!(
            units = units.len(),
            collaborations = qualifying.len(),
            mode = ?mode,
            "classified collaborations"
        );

        let mut order = vec![vec![TOTAL_REPOS.to_string()], vec![COLLABORATIONS.to_string()]];
        if let (CollaborationMode::FocalWithOther, Some(top_n)) = (mode, top_partners) {
            let partners = aggregate(&qualifying, self.partition_size, |unit| {
                let unit: &ResolvedUnit = unit;
                let column = column_of(unit);
                classifier
                    .partners(unit)
                    .into_iter()
                    .filter_map(|p| column.map(|c| (p.to_string(), false, c, Decimal::ONE)))
                    .collect::<Vec<Classified>>()
            });
            let ranked = partners.ranked();
            let cut = match top_n {
                TopN::All => ranked.len(),
                TopN::Count(n) => n.min(ranked.len()),
            };
            for partner in &ranked[..cut] {
                let row = order.len();
                for (column, value) in partners.by_column(partner) {
                    long.push(LongRow { row, column, value });
                }
                order.push(vec![partner.to_string()]);
            }
        }
        check_unique_labels(order.iter().flat_map(|labels| labels.first()).map(String::as_str))?;

        Ok(pivot(&config.title, vec![dimension.header().to_string()], &long, &order, layout))
    }

    fn pair_table(
        &self,
        config: &TableConfig,
        dimension: Dimension,
        top_n: TopN,
        require_multiple_actors: bool,
    ) -> Result<Table> {
        let units = self.resolve_units(config)?;
        let layout = &config.columns;
        let counts = pair_counts(&units, dimension, &self.labels, require_multiple_actors, |u| {
            u.first_period.and_then(|p| layout.column_for(p))
        });

        // BTreeMap order is lexicographic, so a stable sort by count keeps it for ties.
        let mut ranked: Vec<(&(String, String), usize)> = counts
            .iter()
            .map(|(pair, by_column)| (pair, by_column.values().sum()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        if let TopN::Count(n) = top_n {
            ranked.truncate(n);
        }
        debug!(pairs = counts.len(), kept = ranked.len(), "ranked pairs");

        let mut long = Vec::new();
        let mut order: Vec<Vec<String>> = Vec::with_capacity(ranked.len());
        for (pair, _) in ranked {
            let row = order.len();
            for (column, count) in &counts[pair] {
                long.push(LongRow {
                    row,
                    column: *column,
                    value: Decimal::from(*count),
                });
            }
            order.push(vec![pair.0.clone(), pair.1.clone()]);
        }

        let header = dimension.header();
        let headers = vec![format!("{} A", header), format!("{} B", header)];
        Ok(pivot(&config.title, headers, &long, &order, layout))
    }
}

/// Sum of pre-split actor credits per column; the independent Total row.
fn grand_total(allocation: &Allocation, layout: &ColumnLayout) -> BTreeMap<ColumnKey, Decimal> {
    let mut totals = BTreeMap::new();
    for (period, credit) in allocation.grand_total_by_period() {
        if let Some(column) = layout.column_for(period) {
            *totals.entry(column).or_insert(Decimal::ZERO) += credit;
        }
    }
    totals
}
