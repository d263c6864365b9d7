//! Fractional Credit Allocator
//!
//! Each eligible actor on a unit receives `1 / |N(u)|` of the unit's credit; each
//! actor's credit is then split evenly across its values in the table's dimension,
//! or across the full cross product of its values when two dimensions are crossed.
//!
//! Credit is fixed-point: every split hands out whole quanta of `10^-CREDIT_SCALE`
//! and gives the leftover quanta to the first parts, so a split always sums exactly
//! to what was split and downstream sums do not depend on evaluation order.

use crate::error::{AttributionError, Result};
use crate::model::{ActorId, AttributeCredit, Dimension, Period, UnitId};
use crate::period::{PeriodGrouping, ResolvedUnit};
use crate::schema::{self, CREDITS};
use itertools::Itertools;
use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;
use tracing::debug;

const STAGE: &str = "credit allocator";

/// Decimal places of the credit quantum.
pub const CREDIT_SCALE: u32 = 12;

/// Maximum deviation tolerated by the conservation check.
pub fn conservation_tolerance() -> Decimal {
    Decimal::new(1, 9)
}

/// Split `total` into `parts` shares that sum exactly to `total`.
///
/// `total` must be a whole number of quanta. Returns an empty vector for zero parts.
pub fn split_exact(total: Decimal, parts: usize) -> Vec<Decimal> {
    if parts == 0 {
        return Vec::new();
    }
    let quantum = Decimal::new(1, CREDIT_SCALE);
    let divisor = Decimal::from(parts);
    let base = (total / divisor).round_dp_with_strategy(CREDIT_SCALE, RoundingStrategy::ToZero);
    let leftover = ((total - base * divisor) / quantum)
        .round()
        .to_usize()
        .unwrap_or(0);
    (0..parts)
        .map(|i| if i < leftover { base + quantum } else { base })
        .collect()
}

/// Credit of one actor on one unit, before any per-value split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorCredit {
    pub unit_id: UnitId,
    pub actor_id: ActorId,
    pub period: Period,
    pub credit: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub actor_credits: Vec<ActorCredit>,
    pub credits: Vec<AttributeCredit>,
}

impl Allocation {
    pub fn extend(&mut self, other: Allocation) {
        self.actor_credits.extend(other.actor_credits);
        self.credits.extend(other.credits);
    }

    /// Independent grand total per unit period, from pre-split actor credits.
    pub fn grand_total_by_period(&self) -> BTreeMap<Period, Decimal> {
        let mut totals = BTreeMap::new();
        for ac in &self.actor_credits {
            *totals.entry(ac.period).or_insert(Decimal::ZERO) += ac.credit;
        }
        totals
    }

    /// Export as a frame matching [`CREDITS`]. Fractions are widened to f64 for display.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let unit_ids: Vec<&str> = self.credits.iter().map(|c| c.unit_id.as_str()).collect();
        let actor_ids: Vec<&str> = self.credits.iter().map(|c| c.actor_id.as_str()).collect();
        let categories: Vec<String> = self.credits.iter().map(|c| c.values.join(" / ")).collect();
        let periods: Vec<i64> = self.credits.iter().map(|c| c.period as i64).collect();
        let fractions: Vec<f64> = self
            .credits
            .iter()
            .map(|c| c.fraction.to_f64().unwrap_or(f64::NAN))
            .collect();

        let df = DataFrame::new(vec![
            Series::new(schema::UNIT_ID, unit_ids),
            Series::new(schema::ACTOR_ID, actor_ids),
            Series::new(schema::CATEGORY, categories),
            Series::new(schema::PERIOD, periods),
            Series::new(schema::FRACTION, fractions),
        ])?;
        CREDITS.validate(&df)?;
        Ok(df)
    }
}

pub struct CreditAllocator {
    dimensions: Vec<Dimension>,
    grouping: PeriodGrouping,
}

impl CreditAllocator {
    pub fn new(dimensions: Vec<Dimension>, grouping: PeriodGrouping) -> Self {
        Self {
            dimensions,
            grouping,
        }
    }

    /// Allocate one unit. Pure: depends only on the unit.
    pub fn allocate_unit(&self, unit: &ResolvedUnit) -> Result<Allocation> {
        let first_period = match unit.first_period {
            Some(p) if !unit.eligible.is_empty() => p,
            _ => {
                return Err(AttributionError::ZeroEligibleActors {
                    stage: STAGE,
                    unit_id: unit.unit_id.clone(),
                })
            }
        };

        let value_firsts = match self.grouping {
            PeriodGrouping::UnitAndValue(d) => Some((d, unit.first_period_by_value(d))),
            PeriodGrouping::Unit => None,
        };
        let grouping_index = value_firsts
            .as_ref()
            .and_then(|(d, _)| self.dimensions.iter().position(|x| x == d));

        let mut actors: Vec<_> = unit.eligible.iter().collect();
        actors.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));
        actors.dedup_by(|a, b| a.actor_id == b.actor_id);

        let shares = split_exact(Decimal::ONE, actors.len());
        let mut allocation = Allocation::default();

        for (actor, credit) in actors.into_iter().zip(shares) {
            allocation.actor_credits.push(ActorCredit {
                unit_id: unit.unit_id.clone(),
                actor_id: actor.actor_id.clone(),
                period: first_period,
                credit,
            });

            let tuples: Vec<Vec<String>> = self
                .dimensions
                .iter()
                .map(|d| actor.values.get(*d).to_vec())
                .multi_cartesian_product()
                .collect();

            for (fraction, values) in split_exact(credit, tuples.len()).into_iter().zip(tuples) {
                let period = match (&value_firsts, grouping_index) {
                    (Some((_, firsts)), Some(i)) => firsts
                        .get(values[i].as_str())
                        .copied()
                        .unwrap_or(first_period),
                    _ => first_period,
                };
                allocation.credits.push(AttributeCredit {
                    unit_id: unit.unit_id.clone(),
                    actor_id: actor.actor_id.clone(),
                    values,
                    period,
                    fraction,
                });
            }
        }

        Ok(allocation)
    }

    pub fn allocate(&self, units: &[ResolvedUnit]) -> Result<Allocation> {
        let mut allocation = Allocation::default();
        for unit in units {
            allocation.extend(self.allocate_unit(unit)?);
        }
        debug!(
            units = units.len(),
            actor_credits = allocation.actor_credits.len(),
            credit_rows = allocation.credits.len(),
            dimensions = ?self.dimensions,
            "allocated fractional credit"
        );
        Ok(allocation)
    }
}

/// Check that every unit sums to one and every actor's split sums to its credit.
pub fn check_conservation(allocation: &Allocation) -> Result<()> {
    let tolerance = conservation_tolerance();

    let mut by_unit: BTreeMap<&str, Decimal> = BTreeMap::new();
    let mut by_actor: BTreeMap<(&str, &str), Decimal> = BTreeMap::new();
    for ac in &allocation.actor_credits {
        *by_unit.entry(ac.unit_id.as_str()).or_insert(Decimal::ZERO) += ac.credit;
        by_actor.insert((ac.unit_id.as_str(), ac.actor_id.as_str()), ac.credit);
    }

    for (unit_id, total) in &by_unit {
        if (*total - Decimal::ONE).abs() > tolerance {
            return Err(AttributionError::ConservationViolation {
                stage: STAGE,
                subject: format!("unit '{}'", unit_id),
                expected: Decimal::ONE.to_string(),
                actual: total.to_string(),
            });
        }
    }

    let mut split: BTreeMap<(&str, &str), Decimal> = BTreeMap::new();
    for c in &allocation.credits {
        *split
            .entry((c.unit_id.as_str(), c.actor_id.as_str()))
            .or_insert(Decimal::ZERO) += c.fraction;
    }
    for (key, credit) in &by_actor {
        let actual = split.get(key).copied().unwrap_or(Decimal::ZERO);
        if (actual - *credit).abs() > tolerance {
            return Err(AttributionError::ConservationViolation {
                stage: STAGE,
                subject: format!("actor '{}' on unit '{}'", key.1, key.0),
                expected: credit.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::{AttributeExpander, MissingLabels, DEFAULT_DELIMITER};
    use crate::joiner::JoinedActor;
    use crate::model::ActorRecord;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn resolved(actors: &[(&str, &str, &str, Period)]) -> ResolvedUnit {
        let expander = AttributeExpander::new(DEFAULT_DELIMITER, MissingLabels::default()).unwrap();
        let records: Vec<ActorRecord> = actors
            .iter()
            .map(|(id, country, sector, _)| {
                ActorRecord::new(*id)
                    .with(Dimension::Country, *country)
                    .with(Dimension::Sector, *sector)
            })
            .collect();
        let attrs = expander.expand(&records);
        let eligible: Vec<JoinedActor> = actors
            .iter()
            .map(|(id, _, _, p)| JoinedActor {
                actor_id: id.to_string(),
                first_period: *p,
                values: attrs.get(id).unwrap().clone(),
                matched: true,
            })
            .collect();
        ResolvedUnit {
            unit_id: "U1".to_string(),
            first_period: eligible.iter().map(|a| a.first_period).min(),
            total_actors: eligible.len(),
            eligible,
        }
    }

    fn value_total(allocation: &Allocation, value: &str) -> Decimal {
        allocation
            .credits
            .iter()
            .filter(|c| c.values[0] == value)
            .map(|c| c.fraction)
            .sum()
    }

    #[test]
    fn test_split_exact_conserves() {
        let parts = split_exact(Decimal::ONE, 3);
        assert_eq!(parts.iter().copied().sum::<Decimal>(), Decimal::ONE);
        assert_eq!(parts[0], dec("0.333333333334"));
        assert_eq!(parts[2], dec("0.333333333333"));
        assert!(split_exact(Decimal::ONE, 0).is_empty());
    }

    #[test]
    fn test_worked_example() {
        let unit = resolved(&[("a1", "US", "", 2015), ("a2", "US;CA", "", 2015)]);
        let allocator = CreditAllocator::new(vec![Dimension::Country], PeriodGrouping::Unit);
        let allocation = allocator.allocate_unit(&unit).unwrap();

        assert_eq!(allocation.actor_credits[0].credit, dec("0.5"));
        assert_eq!(allocation.actor_credits[1].credit, dec("0.5"));
        assert_eq!(value_total(&allocation, "US"), dec("0.75"));
        assert_eq!(value_total(&allocation, "CA"), dec("0.25"));
        check_conservation(&allocation).unwrap();
    }

    #[test]
    fn test_crossed_dimensions_use_full_cross_product() {
        let unit = resolved(&[("a1", "US;CA", "Academic;Industry", 2015)]);
        let allocator = CreditAllocator::new(
            vec![Dimension::Country, Dimension::Sector],
            PeriodGrouping::Unit,
        );
        let allocation = allocator.allocate_unit(&unit).unwrap();
        assert_eq!(allocation.credits.len(), 4);
        for c in &allocation.credits {
            assert_eq!(c.fraction, dec("0.25"));
        }
        let pairs: Vec<String> = allocation.credits.iter().map(|c| c.values.join("/")).collect();
        assert!(pairs.contains(&"CA/Industry".to_string()));
        assert!(pairs.contains(&"US/Academic".to_string()));
    }

    #[test]
    fn test_missing_country_gets_full_credit() {
        let unit = resolved(&[("a1", "   ", "", 2015)]);
        let allocator = CreditAllocator::new(vec![Dimension::Country], PeriodGrouping::Unit);
        let allocation = allocator.allocate_unit(&unit).unwrap();
        assert_eq!(allocation.credits.len(), 1);
        assert_eq!(allocation.credits[0].values, vec!["Missing Country"]);
        assert_eq!(allocation.credits[0].fraction, Decimal::ONE);
    }

    #[test]
    fn test_zero_eligible_actors_raises() {
        let unit = ResolvedUnit {
            unit_id: "U9".to_string(),
            first_period: None,
            eligible: vec![],
            total_actors: 0,
        };
        let allocator = CreditAllocator::new(vec![Dimension::Country], PeriodGrouping::Unit);
        match allocator.allocate_unit(&unit) {
            Err(AttributionError::ZeroEligibleActors { unit_id, .. }) => assert_eq!(unit_id, "U9"),
            other => panic!("expected ZeroEligibleActors, got {:?}", other),
        }
    }

    #[test]
    fn test_unit_and_value_grouping_stamps_value_first_period() {
        let unit = resolved(&[("a1", "US", "", 2015), ("a2", "CA", "", 2017)]);
        let allocator = CreditAllocator::new(
            vec![Dimension::Country],
            PeriodGrouping::UnitAndValue(Dimension::Country),
        );
        let allocation = allocator.allocate_unit(&unit).unwrap();
        let ca = allocation.credits.iter().find(|c| c.values[0] == "CA").unwrap();
        let us = allocation.credits.iter().find(|c| c.values[0] == "US").unwrap();
        assert_eq!(ca.period, 2017);
        assert_eq!(us.period, 2015);
        assert!(allocation.actor_credits.iter().all(|ac| ac.period == 2015));
    }

    #[test]
    fn test_conservation_violation_is_reported() {
        let mut allocation = Allocation::default();
        allocation.actor_credits.push(ActorCredit {
            unit_id: "U1".to_string(),
            actor_id: "a1".to_string(),
            period: 2015,
            credit: dec("0.9"),
        });
        let err = check_conservation(&allocation).unwrap_err().to_string();
        assert!(err.contains("unit 'U1'"));
    }

    #[test]
    fn test_export_matches_schema() {
        let unit = resolved(&[("a1", "US;CA", "", 2015)]);
        let allocator = CreditAllocator::new(vec![Dimension::Country], PeriodGrouping::Unit);
        let df = allocator.allocate_unit(&unit).unwrap().to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
    }
}
