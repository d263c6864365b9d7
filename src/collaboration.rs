//! Collaboration Classifier
//!
//! Decides which units count as cross-category collaborations and produces
//! canonical unordered pair counts for co-development tables.

use crate::expander::MissingLabels;
use crate::model::Dimension;
use crate::period::ResolvedUnit;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationMode {
    /// The focal value together with at least one other value.
    FocalWithOther,
    /// At least two non-focal values; the focal value may also be present.
    NonFocalAny,
    /// At least two non-focal values and no focal value at all.
    NonFocalExcludingFocal,
}

pub struct CollaborationClassifier<'a> {
    dimension: Dimension,
    focal: &'a str,
    labels: &'a MissingLabels,
}

impl<'a> CollaborationClassifier<'a> {
    pub fn new(dimension: Dimension, focal: &'a str, labels: &'a MissingLabels) -> Self {
        Self {
            dimension,
            focal,
            labels,
        }
    }

    /// Distinct non-missing values held by the unit's eligible actors, sorted.
    pub fn distinct_values<'u>(&self, unit: &'u ResolvedUnit) -> BTreeSet<&'u str> {
        distinct_values(unit, self.dimension, self.labels)
    }

    /// At least two distinct actors and two distinct non-missing values.
    pub fn is_collaboration(&self, unit: &ResolvedUnit) -> bool {
        distinct_actors(unit) >= 2 && self.distinct_values(unit).len() >= 2
    }

    pub fn qualifies(&self, unit: &ResolvedUnit, mode: CollaborationMode) -> bool {
        if !self.is_collaboration(unit) {
            return false;
        }
        let values = self.distinct_values(unit);
        let has_focal = values.contains(self.focal);
        let non_focal = values.iter().filter(|v| **v != self.focal).count();
        match mode {
            CollaborationMode::FocalWithOther => has_focal && non_focal >= 1,
            CollaborationMode::NonFocalAny => non_focal >= 2,
            CollaborationMode::NonFocalExcludingFocal => !has_focal && non_focal >= 2,
        }
    }

    /// Non-focal values of a unit that collaborates with the focal value.
    pub fn partners<'u>(&self, unit: &'u ResolvedUnit) -> Vec<&'u str> {
        if !self.qualifies(unit, CollaborationMode::FocalWithOther) {
            return Vec::new();
        }
        self.distinct_values(unit)
            .into_iter()
            .filter(|v| *v != self.focal)
            .collect()
    }
}

pub fn distinct_actors(unit: &ResolvedUnit) -> usize {
    unit.eligible
        .iter()
        .map(|a| a.actor_id.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

pub fn distinct_values<'u>(
    unit: &'u ResolvedUnit,
    dimension: Dimension,
    labels: &MissingLabels,
) -> BTreeSet<&'u str> {
    unit.eligible
        .iter()
        .flat_map(|a| a.values.get(dimension))
        .map(String::as_str)
        .filter(|v| !labels.is_missing(dimension, v))
        .collect()
}

/// All 2-combinations of a sorted value set; each pair is ordered `(lesser, greater)`.
pub fn canonical_pairs<'v>(values: &BTreeSet<&'v str>) -> Vec<(&'v str, &'v str)> {
    values.iter().copied().tuple_combinations().collect()
}

/// Number of distinct units producing each canonical pair, keyed by an arbitrary
/// per-unit column (period or overall).
pub fn pair_counts<'u, K, F>(
    units: &'u [ResolvedUnit],
    dimension: Dimension,
    labels: &MissingLabels,
    require_multiple_actors: bool,
    column: F,
) -> BTreeMap<(String, String), BTreeMap<K, usize>>
where
    K: Ord + Clone,
    F: Fn(&'u ResolvedUnit) -> Option<K>,
{
    let mut counts: BTreeMap<(String, String), BTreeMap<K, usize>> = BTreeMap::new();
    for unit in units {
        if require_multiple_actors && distinct_actors(unit) < 2 {
            continue;
        }
        let Some(key) = column(unit) else {
            continue;
        };
        let values = distinct_values(unit, dimension, labels);
        for (a, b) in canonical_pairs(&values) {
            *counts
                .entry((a.to_string(), b.to_string()))
                .or_default()
                .entry(key.clone())
                .or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::{AttributeExpander, DEFAULT_DELIMITER};
    use crate::joiner::JoinedActor;
    use crate::model::{ActorRecord, Period};

    fn unit(id: &str, actors: &[(&str, &str)]) -> ResolvedUnit {
        let expander = AttributeExpander::new(DEFAULT_DELIMITER, MissingLabels::default()).unwrap();
        let records: Vec<ActorRecord> = actors
            .iter()
            .map(|(a, c)| ActorRecord::new(*a).with(Dimension::Country, *c))
            .collect();
        let attrs = expander.expand(&records);
        let eligible: Vec<JoinedActor> = actors
            .iter()
            .map(|(a, _)| JoinedActor {
                actor_id: a.to_string(),
                first_period: 2015,
                values: attrs.get(a).unwrap().clone(),
                matched: true,
            })
            .collect();
        ResolvedUnit {
            unit_id: id.to_string(),
            first_period: Some(2015),
            total_actors: eligible.len(),
            eligible,
        }
    }

    #[test]
    fn test_collaboration_needs_two_actors_and_two_values() {
        let labels = MissingLabels::default();
        let c = CollaborationClassifier::new(Dimension::Country, "United States", &labels);
        assert!(c.is_collaboration(&unit("u", &[("a1", "United States"), ("a2", "Canada")])));
        assert!(!c.is_collaboration(&unit("u", &[("a1", "United States;Canada")])));
        assert!(!c.is_collaboration(&unit("u", &[("a1", "Canada"), ("a2", "Canada")])));
        assert!(!c.is_collaboration(&unit("u", &[("a1", "Canada"), ("a2", "")])));
    }

    #[test]
    fn test_three_predicate_sets() {
        let labels = MissingLabels::default();
        let c = CollaborationClassifier::new(Dimension::Country, "United States", &labels);
        let us_ca = unit("u1", &[("a1", "United States"), ("a2", "Canada")]);
        let us_ca_de = unit("u2", &[("a1", "United States"), ("a2", "Canada"), ("a3", "Germany")]);
        let ca_de = unit("u3", &[("a1", "Canada"), ("a2", "Germany")]);

        use CollaborationMode::*;
        assert!(c.qualifies(&us_ca, FocalWithOther));
        assert!(!c.qualifies(&us_ca, NonFocalAny));
        assert!(!c.qualifies(&us_ca, NonFocalExcludingFocal));

        assert!(c.qualifies(&us_ca_de, FocalWithOther));
        assert!(c.qualifies(&us_ca_de, NonFocalAny));
        assert!(!c.qualifies(&us_ca_de, NonFocalExcludingFocal));

        assert!(!c.qualifies(&ca_de, FocalWithOther));
        assert!(c.qualifies(&ca_de, NonFocalAny));
        assert!(c.qualifies(&ca_de, NonFocalExcludingFocal));

        assert_eq!(c.partners(&us_ca_de), vec!["Canada", "Germany"]);
    }

    #[test]
    fn test_pair_is_canonical_and_counted_once_per_unit() {
        let labels = MissingLabels::default();
        let units = vec![
            unit("u1", &[("a1", "United States"), ("a2", "Canada")]),
            unit("u2", &[("a1", "Canada"), ("a2", "United States;Canada")]),
        ];
        let counts = pair_counts(&units, Dimension::Country, &labels, true, |_| Some(()));
        assert_eq!(counts.len(), 1);
        let key = ("Canada".to_string(), "United States".to_string());
        assert_eq!(counts[&key][&()], 2);
        assert!(!counts.contains_key(&("United States".to_string(), "Canada".to_string())));
    }

    #[test]
    fn test_pairs_by_period_and_single_actor_policy() {
        let labels = MissingLabels::default();
        let units = vec![unit("u1", &[("a1", "Canada;Mexico")])];
        let strict = pair_counts(&units, Dimension::Country, &labels, true, |u| u.first_period);
        assert!(strict.is_empty());
        let loose = pair_counts(&units, Dimension::Country, &labels, false, |u| u.first_period);
        let key = ("Canada".to_string(), "Mexico".to_string());
        assert_eq!(loose[&key].get(&(2015 as Period)), Some(&1));
    }
}
