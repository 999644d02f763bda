//! Derived ratio measurements over aggregated counts.
//!
//! Counts are first summed over sort pools (and tubes) of one sample so that a
//! denominator reflects the whole sample. Each frequency definition then
//! divides its numerator gate by its denominator gate per sample.

use crate::aggregate::sum_values;
use crate::category::{FileType, RunKind};
use crate::field_record::SampleType;
use crate::gate_table::ratio;
use crate::gates::{FrequencyQuery, ValueType};
use crate::measurement::AggregatedMeasurement;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Sample identity with pool and hashtag removed.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct FrequencyIdentity {
    pub run_purpose: RunKind,
    pub file_type: FileType,
    pub ptid: String,
    pub group: u32,
    pub weeks: i32,
    pub visit_id: String,
    pub probe_set: String,
    pub sample_type: SampleType,
    pub run_date: NaiveDate,
}

impl FrequencyIdentity {
    pub fn of(row: &AggregatedMeasurement) -> Self {
        let k = &row.key;
        Self {
            run_purpose: k.run_purpose,
            file_type: k.file_type,
            ptid: k.ptid.clone(),
            group: k.group,
            weeks: k.weeks,
            visit_id: k.visit_id.clone(),
            probe_set: k.probe_set.clone(),
            sample_type: k.sample_type,
            run_date: k.run_date,
        }
    }
}

impl fmt::Display for FrequencyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {}",
            self.run_purpose,
            self.file_type,
            self.ptid,
            self.visit_id,
            self.probe_set,
            self.sample_type,
            self.run_date.format("%Y-%m-%d")
        )
    }
}

/// Count of one gate summed over the pools of one sample.
#[derive(Clone, Debug, PartialEq)]
pub struct PooledCount {
    pub value: Option<f64>,
    pub pools: BTreeSet<String>,
}

pub type PooledCounts = BTreeMap<(FrequencyIdentity, String), PooledCount>;

pub fn collapse_pools(rows: &[AggregatedMeasurement]) -> PooledCounts {
    let mut grouped: BTreeMap<(FrequencyIdentity, String), (Vec<Option<f64>>, BTreeSet<String>)> =
        BTreeMap::new();
    for row in rows.iter().filter(|r| r.key.value_type == ValueType::Count) {
        let entry = grouped
            .entry((FrequencyIdentity::of(row), row.key.gate.clone()))
            .or_default();
        entry.0.push(row.value);
        entry.1.extend(row.key.sort_pool.clone());
    }
    grouped
        .into_iter()
        .map(|(key, (values, pools))| {
            (
                key,
                PooledCount {
                    value: sum_values(values),
                    pools,
                },
            )
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrequencyMeasurement {
    pub identity: FrequencyIdentity,
    /// `numerator/denominator` gate label.
    pub gate: String,
    /// Sort pools summed into the numerator and denominator.
    pub pools: Vec<String>,
    pub easy_name: String,
    pub verbose_name: Option<String>,
    pub numerator: Option<f64>,
    pub denominator: Option<f64>,
    pub value: Option<f64>,
}

/// One row per sample identity, one value per definition.
#[derive(Clone, Debug, PartialEq)]
pub struct WideRow {
    pub identity: FrequencyIdentity,
    pub pools: Vec<String>,
    pub values: Vec<Option<f64>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrequencyTable {
    pub columns: Vec<String>,
    pub rows: Vec<WideRow>,
    pub measurements: Vec<FrequencyMeasurement>,
}

impl FrequencyTable {
    pub fn value(&self, identity: &FrequencyIdentity, column: &str) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|r| &r.identity == identity)
            .and_then(|r| r.values[col])
    }
}

pub struct FrequencyCalculator<'a> {
    definitions: &'a [FrequencyQuery],
}

impl<'a> FrequencyCalculator<'a> {
    pub fn new(definitions: &'a [FrequencyQuery]) -> Self {
        Self { definitions }
    }

    pub fn compute(&self, rows: &[AggregatedMeasurement]) -> FrequencyTable {
        if self.definitions.is_empty() || rows.is_empty() {
            info!(
                definitions = self.definitions.len(),
                rows = rows.len(),
                "no frequencies to compute"
            );
            return FrequencyTable {
                columns: self.definitions.iter().map(|d| d.easy_name.clone()).collect(),
                ..Default::default()
            };
        }
        let pooled = collapse_pools(rows);
        let mut identities: BTreeMap<&FrequencyIdentity, BTreeSet<&String>> = BTreeMap::new();
        for ((identity, _), count) in &pooled {
            identities.entry(identity).or_default().extend(count.pools.iter());
        }

        let mut measurements = vec![];
        let mut wide = vec![];
        for (identity, pools) in identities {
            let pools: Vec<String> = pools.into_iter().cloned().collect();
            let mut values = Vec::with_capacity(self.definitions.len());
            for def in self.definitions {
                let m = self.measure(&pooled, identity, &pools, def);
                values.push(m.value);
                measurements.push(m);
            }
            wide.push(WideRow {
                identity: identity.clone(),
                pools,
                values,
            });
        }
        info!(
            samples = wide.len(),
            definitions = self.definitions.len(),
            "frequencies computed"
        );
        FrequencyTable {
            columns: self.definitions.iter().map(|d| d.easy_name.clone()).collect(),
            rows: wide,
            measurements,
        }
    }

    fn measure(
        &self,
        pooled: &PooledCounts,
        identity: &FrequencyIdentity,
        pools: &[String],
        def: &FrequencyQuery,
    ) -> FrequencyMeasurement {
        let lookup = |gate: &str| {
            pooled
                .get(&(identity.clone(), gate.to_string()))
                .and_then(|c| c.value)
        };
        let numerator = lookup(&def.numerator_gate);
        let denominator = lookup(&def.denominator_gate);
        let value = ratio(numerator, denominator);
        match (numerator, denominator) {
            (Some(_), Some(d)) if d == 0.0 => {
                warn!(
                    sample = %identity,
                    frequency = %def.easy_name,
                    "zero denominator, frequency left empty"
                )
            }
            (Some(_), None) => {
                warn!(
                    sample = %identity,
                    frequency = %def.easy_name,
                    gate = %def.denominator_gate,
                    "missing denominator, frequency left empty"
                )
            }
            (None, _) => {
                debug!(
                    sample = %identity,
                    frequency = %def.easy_name,
                    gate = %def.numerator_gate,
                    "no numerator"
                )
            }
            _ => {}
        }
        FrequencyMeasurement {
            identity: identity.clone(),
            gate: def.gate_label(),
            pools: pools.to_vec(),
            easy_name: def.easy_name.clone(),
            verbose_name: def.verbose_name.clone(),
            numerator,
            denominator,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::aggregate::tests::{count_row, sort_record};
    use crate::gates::tests::sample_catalog;
    use proptest::prelude::*;

    fn counts(
        pool: &str,
        p4: Option<f64>,
        p5: Option<f64>,
    ) -> Vec<crate::measurement::RawMeasurement> {
        vec![
            count_row(sort_record("G002-001_V091", "T1", pool, "a"), "P4", "igg_b_cells", p4),
            count_row(sort_record("G002-001_V091", "T1", pool, "a"), "P5", "epitope_specific", p5),
        ]
    }

    #[test]
    fn test_pools_are_summed_before_division() {
        let mut raw = counts("P1", Some(600.0), Some(60.0));
        raw.extend(counts("P2", Some(400.0), Some(40.0)));
        let aggregated = aggregate(raw).unwrap();
        let catalog = sample_catalog();
        let table = FrequencyCalculator::new(catalog.frequencies()).compute(&aggregated);

        assert_eq!(table.columns, vec!["epitope_specific_of_igg"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].pools, vec!["P1", "P2"]);
        assert_eq!(table.rows[0].values, vec![Some(0.1)]);
        assert_eq!(table.measurements[0].denominator, Some(1000.0));
        assert_eq!(table.measurements[0].gate, "P5/P4");
        assert_eq!(table.measurements[0].pools, vec!["P1", "P2"]);
    }

    #[test]
    fn test_zero_or_missing_denominator_is_empty() {
        let aggregated = aggregate(counts("P1", Some(0.0), Some(5.0))).unwrap();
        let catalog = sample_catalog();
        let table = FrequencyCalculator::new(catalog.frequencies()).compute(&aggregated);
        assert_eq!(table.rows[0].values, vec![None]);

        let aggregated = aggregate(counts("P1", None, Some(5.0))).unwrap();
        let table = FrequencyCalculator::new(catalog.frequencies()).compute(&aggregated);
        assert_eq!(table.rows[0].values, vec![None]);
    }

    #[test]
    fn test_no_definitions_gives_empty_table() {
        let aggregated = aggregate(counts("P1", Some(1.0), Some(1.0))).unwrap();
        let table = FrequencyCalculator::new(&[]).compute(&aggregated);
        assert!(table.rows.is_empty());
        assert!(table.columns.is_empty());
    }

    proptest! {
        #[test]
        fn prop_frequency_is_exact_ratio(n in 1.0f64..1.0e6, d in 1.0f64..1.0e6) {
            let aggregated = aggregate(counts("P1", Some(d), Some(n))).unwrap();
            let catalog = sample_catalog();
            let table = FrequencyCalculator::new(catalog.frequencies()).compute(&aggregated);
            let identity = table.rows[0].identity.clone();
            prop_assert_eq!(table.value(&identity, "epitope_specific_of_igg"), Some(n / d));
        }
    }
}
