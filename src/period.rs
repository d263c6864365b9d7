//! Period Resolver
//!
//! Determines each unit's minimum observed period and, under the earliest-cohort
//! policy, narrows the actor set used for crediting to the actors that were active
//! in that period.

use crate::joiner::{JoinedActor, JoinedUnit};
use crate::model::{Dimension, Period, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortPolicy {
    /// Credit every actor on the unit.
    #[default]
    Unrestricted,
    /// Credit only actors whose first period on the unit is the unit's first period.
    EarliestCohort,
}

/// Which key a credit row's period is the minimum over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodGrouping {
    #[default]
    Unit,
    /// Minimum over the unit's eligible actors holding the credited value.
    UnitAndValue(Dimension),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUnit {
    pub unit_id: UnitId,
    /// `None` only for a unit without actors, which allocation rejects.
    pub first_period: Option<Period>,
    /// Actors credited for this unit.
    pub eligible: Vec<JoinedActor>,
    /// Actors on the unit before cohort restriction.
    pub total_actors: usize,
}

impl ResolvedUnit {
    /// Minimum first period per value of `dimension` among eligible actors.
    /// Several values may share the minimum; no tie-break is applied.
    pub fn first_period_by_value(&self, dimension: Dimension) -> BTreeMap<&str, Period> {
        let mut firsts: BTreeMap<&str, Period> = BTreeMap::new();
        for actor in &self.eligible {
            for value in actor.values.get(dimension) {
                firsts
                    .entry(value.as_str())
                    .and_modify(|p| *p = (*p).min(actor.first_period))
                    .or_insert(actor.first_period);
            }
        }
        firsts
    }
}

pub struct PeriodResolver {
    cohort: CohortPolicy,
}

impl PeriodResolver {
    pub fn new(cohort: CohortPolicy) -> Self {
        Self { cohort }
    }

    pub fn resolve_unit(&self, unit: &JoinedUnit) -> ResolvedUnit {
        let first_period = unit.actors.iter().map(|a| a.first_period).min();
        let eligible: Vec<JoinedActor> = match (self.cohort, first_period) {
            (CohortPolicy::EarliestCohort, Some(first)) => unit
                .actors
                .iter()
                .filter(|a| a.first_period == first)
                .cloned()
                .collect(),
            _ => unit.actors.clone(),
        };

        ResolvedUnit {
            unit_id: unit.unit_id.clone(),
            first_period,
            eligible,
            total_actors: unit.actors.len(),
        }
    }

    pub fn resolve(&self, units: &[JoinedUnit]) -> Vec<ResolvedUnit> {
        let resolved: Vec<ResolvedUnit> = units.iter().map(|u| self.resolve_unit(u)).collect();
        let excluded: usize = resolved
            .iter()
            .map(|u| u.total_actors - u.eligible.len())
            .sum();
        debug!(
            units = resolved.len(),
            cohort = ?self.cohort,
            excluded_actors = excluded,
            "resolved unit periods"
        );
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::{ActorValues, MissingLabels};

    fn actor(id: &str, first_period: Period) -> JoinedActor {
        JoinedActor {
            actor_id: id.to_string(),
            first_period,
            values: ActorValues::missing(&MissingLabels::default()),
            matched: true,
        }
    }

    fn unit() -> JoinedUnit {
        JoinedUnit {
            unit_id: "u1".to_string(),
            actors: vec![actor("a2", 2016), actor("a1", 2015), actor("a3", 2015)],
        }
    }

    #[test]
    fn test_unrestricted_keeps_all_actors() {
        let resolved = PeriodResolver::new(CohortPolicy::Unrestricted).resolve_unit(&unit());
        assert_eq!(resolved.first_period, Some(2015));
        assert_eq!(resolved.eligible.len(), 3);
    }

    #[test]
    fn test_earliest_cohort_restricts_to_first_period_actors() {
        let resolved = PeriodResolver::new(CohortPolicy::EarliestCohort).resolve_unit(&unit());
        assert_eq!(resolved.first_period, Some(2015));
        let ids: Vec<&str> = resolved.eligible.iter().map(|a| a.actor_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a3"]);
        assert_eq!(resolved.total_actors, 3);
    }

    #[test]
    fn test_empty_unit_has_no_period() {
        let empty = JoinedUnit {
            unit_id: "u0".to_string(),
            actors: vec![],
        };
        let resolved = PeriodResolver::new(CohortPolicy::EarliestCohort).resolve_unit(&empty);
        assert_eq!(resolved.first_period, None);
        assert!(resolved.eligible.is_empty());
    }

    #[test]
    fn test_first_period_by_value_shares_ties() {
        let resolved = PeriodResolver::new(CohortPolicy::Unrestricted).resolve_unit(&unit());
        let firsts = resolved.first_period_by_value(Dimension::Organization);
        // every actor carries the sentinel, so it takes the unit minimum
        assert_eq!(firsts.get("Missing Organization"), Some(&2015));
    }

    #[test]
    fn test_grouping_deserializes() {
        let g: PeriodGrouping = serde_json::from_str(r#"{"unit_and_value":"organization"}"#).unwrap();
        assert_eq!(g, PeriodGrouping::UnitAndValue(Dimension::Organization));
        let u: PeriodGrouping = serde_json::from_str(r#""unit""#).unwrap();
        assert_eq!(u, PeriodGrouping::Unit);
    }
}
