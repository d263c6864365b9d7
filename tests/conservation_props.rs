//! Randomized checks of credit conservation, bucket completeness and
//! partition independence over synthetic contribution snapshots.

use codev_attribution::aggregator::{RowSelection, TopN};
use codev_attribution::allocator::{check_conservation, split_exact, CREDIT_SCALE};
use codev_attribution::config::{TableConfig, TableKind};
use codev_attribution::engine::AttributionEngine;
use codev_attribution::expander::MissingLabels;
use codev_attribution::joiner::JoinPolicy;
use codev_attribution::model::{ActorRecord, ContributionEvent, Dimension};
use codev_attribution::period::{CohortPolicy, PeriodGrouping};
use codev_attribution::pivot::ColumnLayout;
use codev_attribution::source::SourceData;
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

const COUNTRIES: &[&str] = &["United States", "Canada", "Germany", "Japan", "Brazil"];
const SECTORS: &[&str] = &["Academic", "Industry", "Government"];

fn field(pool: &'static [&'static str]) -> impl Strategy<Value = Option<String>> {
    prop::collection::vec(prop::sample::select(pool), 0..4).prop_map(|labels| {
        if labels.is_empty() {
            None
        } else {
            Some(labels.join(";"))
        }
    })
}

fn snapshot() -> impl Strategy<Value = SourceData> {
    let events = prop::collection::vec((0usize..8, 0usize..6, 2015i32..2020), 1..40);
    let actors = prop::collection::vec((field(COUNTRIES), field(SECTORS)), 8);
    (events, actors).prop_map(|(events, actors)| {
        let events = events
            .into_iter()
            .map(|(actor, unit, period)| {
                ContributionEvent::new(format!("a{}", actor), format!("u{}", unit), period)
            })
            .collect();
        let actors = actors
            .into_iter()
            .enumerate()
            .map(|(i, (country, sector))| ActorRecord {
                actor_id: format!("a{}", i),
                country,
                sector,
                organization: None,
            })
            .collect();
        SourceData::new(events, actors)
    })
}

fn config(dimensions: Vec<Dimension>, top_n: usize, cohort: CohortPolicy) -> TableConfig {
    TableConfig {
        title: "props".to_string(),
        section: "props".to_string(),
        kind: TableKind::Credit {
            dimensions,
            rows: RowSelection::TopN(TopN::Count(top_n)),
            label_header: None,
            total_label: None,
        },
        join_policy: JoinPolicy::Inner,
        gate_dimension: None,
        cohort,
        period_grouping: PeriodGrouping::Unit,
        columns: ColumnLayout::Periods { start: 2015, end: 2019 },
        validate: true,
    }
}

fn cohort() -> impl Strategy<Value = CohortPolicy> {
    prop_oneof![Just(CohortPolicy::Unrestricted), Just(CohortPolicy::EarliestCohort)]
}

fn dimensions() -> impl Strategy<Value = Vec<Dimension>> {
    prop_oneof![
        Just(vec![Dimension::Country]),
        Just(vec![Dimension::Sector]),
        Just(vec![Dimension::Country, Dimension::Sector]),
    ]
}

proptest! {
    #[test]
    fn split_exact_sums_to_input(quanta in 1i64..1_000_000_000, parts in 1usize..50) {
        let total = Decimal::new(quanta, CREDIT_SCALE);
        let shares = split_exact(total, parts);
        prop_assert_eq!(shares.len(), parts);
        prop_assert_eq!(shares.iter().copied().sum::<Decimal>(), total);
        let max = shares.iter().max().copied().unwrap_or_default();
        let min = shares.iter().min().copied().unwrap_or_default();
        prop_assert!(max - min <= Decimal::new(1, CREDIT_SCALE));
    }

    #[test]
    fn every_unit_conserves_one_unit_of_credit(
        data in snapshot(),
        dims in dimensions(),
        cohort in cohort(),
    ) {
        let engine = AttributionEngine::new(&data, ";", MissingLabels::default()).unwrap();
        let config = config(dims, 2, cohort);
        let allocation = engine.allocation(&config).unwrap();
        prop_assert!(check_conservation(&allocation).is_ok());

        let units: BTreeSet<&str> = data.events.iter().map(|e| e.unit_id.as_str()).collect();
        let mut per_unit: BTreeMap<&str, Decimal> = BTreeMap::new();
        for c in &allocation.credits {
            *per_unit.entry(c.unit_id.as_str()).or_insert(Decimal::ZERO) += c.fraction;
        }
        prop_assert_eq!(per_unit.len(), units.len());
        prop_assert!(per_unit.values().all(|total| *total == Decimal::ONE));
    }

    #[test]
    fn tables_are_complete_and_partition_independent(
        data in snapshot(),
        dims in dimensions(),
        cohort in cohort(),
        top_n in 0usize..5,
        partition in 1usize..16,
    ) {
        let config = config(dims, top_n, cohort);
        let whole = AttributionEngine::new(&data, ";", MissingLabels::default())
            .unwrap()
            .run(&config);
        prop_assert!(whole.is_ok(), "table failed: {:?}", whole.as_ref().err());
        let split = AttributionEngine::new(&data, ";", MissingLabels::default())
            .unwrap()
            .with_partition_size(partition)
            .run(&config)
            .unwrap();
        prop_assert_eq!(whole.unwrap(), split);
    }
}
