//! Contribution Joiner
//!
//! Joins contribution events to expanded attributes by actor id and applies the
//! unit-inclusion policy of the table being built.

use crate::error::{AttributionError, Result};
use crate::expander::{ActorValues, ExpandedAttributes};
use crate::model::{ActorId, ContributionEvent, Dimension, Period, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

const STAGE: &str = "contribution joiner";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Drop actors without attributes; drop units left with no actor.
    #[default]
    Inner,
    /// Keep unmatched actors under the missing sentinel, but drop a unit unless at
    /// least one of its actors resolves a non-missing value in the gate dimension.
    OuterWithGate,
    /// Abort on the first event whose actor has no attribute record.
    Strict,
}

/// An actor's membership on one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedActor {
    pub actor_id: ActorId,
    /// First period this actor contributed to the unit.
    pub first_period: Period,
    pub values: ActorValues,
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedUnit {
    pub unit_id: UnitId,
    pub actors: Vec<JoinedActor>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub events: usize,
    pub unmatched_events: usize,
    pub units_seen: usize,
    pub units_kept: usize,
    pub units_dropped: usize,
}

#[derive(Debug, Clone)]
pub struct JoinOutput {
    pub units: Vec<JoinedUnit>,
    pub stats: JoinStats,
}

pub struct ContributionJoiner<'a> {
    attributes: &'a ExpandedAttributes,
    policy: JoinPolicy,
    gate: Dimension,
}

impl<'a> ContributionJoiner<'a> {
    pub fn new(attributes: &'a ExpandedAttributes, policy: JoinPolicy, gate: Dimension) -> Self {
        Self {
            attributes,
            policy,
            gate,
        }
    }

    /// Group events into units (first-appearance order) and resolve each actor.
    pub fn join(&self, events: &[ContributionEvent]) -> Result<JoinOutput> {
        let mut stats = JoinStats {
            events: events.len(),
            ..Default::default()
        };

        // unit -> (actor -> min period), both in first-appearance order
        let mut unit_index: HashMap<&str, usize> = HashMap::new();
        let mut member_index: HashMap<(usize, &str), usize> = HashMap::new();
        let mut grouped: Vec<(&str, Vec<(&str, Period)>)> = Vec::new();

        for event in events {
            let matched = self.attributes.contains(&event.actor_id);
            if !matched {
                stats.unmatched_events += 1;
                match self.policy {
                    JoinPolicy::Strict => {
                        return Err(AttributionError::MissingJoinKey {
                            stage: STAGE,
                            actor_id: event.actor_id.clone(),
                            unit_id: event.unit_id.clone(),
                        });
                    }
                    JoinPolicy::Inner => {
                        // Still register the unit so it is counted as seen and dropped.
                        unit_slot(&mut unit_index, &mut grouped, &event.unit_id);
                        continue;
                    }
                    JoinPolicy::OuterWithGate => {}
                }
            }

            let slot = unit_slot(&mut unit_index, &mut grouped, &event.unit_id);
            let members = &mut grouped[slot].1;
            match member_index.get(&(slot, event.actor_id.as_str())) {
                Some(&position) => {
                    let period = &mut members[position].1;
                    *period = (*period).min(event.period);
                }
                None => {
                    member_index.insert((slot, event.actor_id.as_str()), members.len());
                    members.push((event.actor_id.as_str(), event.period));
                }
            }
        }

        stats.units_seen = grouped.len();
        let labels = self.attributes.labels();
        let mut units = Vec::with_capacity(grouped.len());

        for (unit_id, members) in grouped {
            let actors: Vec<JoinedActor> = members
                .into_iter()
                .map(|(actor_id, first_period)| match self.attributes.get(actor_id) {
                    Some(values) => JoinedActor {
                        actor_id: actor_id.to_string(),
                        first_period,
                        values: values.clone(),
                        matched: true,
                    },
                    None => JoinedActor {
                        actor_id: actor_id.to_string(),
                        first_period,
                        values: ActorValues::missing(labels),
                        matched: false,
                    },
                })
                .collect();

            if !self.retain(&actors) {
                debug!(unit_id, policy = ?self.policy, "dropping unit at join");
                stats.units_dropped += 1;
                continue;
            }

            units.push(JoinedUnit {
                unit_id: unit_id.to_string(),
                actors,
            });
        }

        stats.units_kept = units.len();
        if stats.unmatched_events > 0 {
            warn!(
                unmatched_events = stats.unmatched_events,
                policy = ?self.policy,
                "events reference actors without attribute records"
            );
        }
        debug!(
            events = stats.events,
            units_kept = stats.units_kept,
            units_dropped = stats.units_dropped,
            "joined contributions"
        );

        Ok(JoinOutput { units, stats })
    }

    fn retain(&self, actors: &[JoinedActor]) -> bool {
        if actors.is_empty() {
            return false;
        }
        match self.policy {
            JoinPolicy::Inner | JoinPolicy::Strict => true,
            JoinPolicy::OuterWithGate => {
                let labels = self.attributes.labels();
                actors.iter().any(|a| {
                    a.values
                        .get(self.gate)
                        .iter()
                        .any(|v| !labels.is_missing(self.gate, v))
                })
            }
        }
    }
}

fn unit_slot<'e>(
    index: &mut HashMap<&'e str, usize>,
    grouped: &mut Vec<(&'e str, Vec<(&'e str, Period)>)>,
    unit_id: &'e str,
) -> usize {
    *index.entry(unit_id).or_insert_with(|| {
        grouped.push((unit_id, Vec::new()));
        grouped.len() - 1
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::{AttributeExpander, MissingLabels, DEFAULT_DELIMITER};
    use crate::model::ActorRecord;

    fn attributes() -> ExpandedAttributes {
        let records = vec![
            ActorRecord::new("a1").with(Dimension::Country, "US"),
            ActorRecord::new("a2"),
        ];
        AttributeExpander::new(DEFAULT_DELIMITER, MissingLabels::default())
            .unwrap()
            .expand(&records)
    }

    fn events() -> Vec<ContributionEvent> {
        vec![
            ContributionEvent::new("a1", "u1", 2016),
            ContributionEvent::new("a1", "u1", 2015),
            ContributionEvent::new("ghost", "u1", 2015),
            ContributionEvent::new("ghost", "u2", 2017),
            ContributionEvent::new("a2", "u3", 2018),
            ContributionEvent::new("ghost", "u3", 2018),
        ]
    }

    #[test]
    fn test_inner_drops_unmatched_actors_and_empty_units() {
        let attrs = attributes();
        let out = ContributionJoiner::new(&attrs, JoinPolicy::Inner, Dimension::Country)
            .join(&events())
            .unwrap();
        let ids: Vec<&str> = out.units.iter().map(|u| u.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u3"]);
        assert_eq!(out.units[0].actors.len(), 1);
        assert_eq!(out.units[0].actors[0].first_period, 2015);
        assert_eq!(out.stats.units_dropped, 1);
        assert_eq!(out.stats.unmatched_events, 3);
    }

    #[test]
    fn test_outer_with_gate_keeps_unmatched_under_sentinel() {
        let attrs = attributes();
        let out = ContributionJoiner::new(&attrs, JoinPolicy::OuterWithGate, Dimension::Country)
            .join(&events())
            .unwrap();
        // u2 has only a ghost, u3 only a2 (missing country) and a ghost: both fail the gate.
        assert_eq!(out.units.len(), 1);
        let u1 = &out.units[0];
        assert_eq!(u1.actors.len(), 2);
        let ghost = u1.actors.iter().find(|a| a.actor_id == "ghost").unwrap();
        assert!(!ghost.matched);
        assert_eq!(ghost.values.get(Dimension::Country), ["Missing Country"]);
    }

    #[test]
    fn test_strict_raises_missing_join_key() {
        let attrs = attributes();
        let err = ContributionJoiner::new(&attrs, JoinPolicy::Strict, Dimension::Country)
            .join(&events())
            .unwrap_err();
        match err {
            AttributionError::MissingJoinKey { actor_id, unit_id, .. } => {
                assert_eq!(actor_id, "ghost");
                assert_eq!(unit_id, "u1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wide_unit_keeps_actor_order_and_min_period() {
        let records: Vec<ActorRecord> = (0..20_000)
            .map(|i| ActorRecord::new(format!("a{}", i)).with(Dimension::Country, "US"))
            .collect();
        let attrs = AttributeExpander::new(DEFAULT_DELIMITER, MissingLabels::default())
            .unwrap()
            .expand(&records);
        let mut events: Vec<ContributionEvent> = (0..20_000)
            .map(|i| ContributionEvent::new(format!("a{}", i), "u1", 2016))
            .collect();
        events.extend((0..20_000).rev().map(|i| ContributionEvent::new(format!("a{}", i), "u1", 2015)));

        let started = std::time::Instant::now();
        let out = ContributionJoiner::new(&attrs, JoinPolicy::Inner, Dimension::Country)
            .join(&events)
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));

        let actors = &out.units[0].actors;
        assert_eq!(actors.len(), 20_000);
        assert_eq!(actors[0].actor_id, "a0");
        assert_eq!(actors[19_999].actor_id, "a19999");
        assert!(actors.iter().all(|a| a.first_period == 2015));
    }
}
