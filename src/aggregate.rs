//! Collapse measurements of split export files (`_a`, `_b`, ...) into one row
//! per logical sample and gate.

use crate::error::{PipelineError, PipelineResult};
use crate::gates::ValueType;
use crate::measurement::{AggregatedMeasurement, CanonicalKey, RawMeasurement, UniquenessKey};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Sum of the non-null values, added in ascending order so that the result
/// does not depend on input order. All-null input gives `None`.
pub fn sum_values(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let mut present: Vec<f64> = values.into_iter().flatten().collect();
    if present.is_empty() {
        return None;
    }
    present.sort_by(f64::total_cmp);
    Some(present.into_iter().sum())
}

/// Single distinct non-null value of a descriptive column within one group.
fn consensus(
    key: &CanonicalKey,
    column: &str,
    rows: &[RawMeasurement],
    value: impl Fn(&RawMeasurement) -> Option<&String>,
) -> PipelineResult<Option<String>> {
    let distinct: BTreeSet<&String> = rows.iter().filter_map(&value).collect();
    if distinct.len() > 1 {
        let details = rows
            .iter()
            .filter_map(|r| value(r).map(|v| format!("{} = '{v}'", r.file_path.display())))
            .join("; ");
        return Err(PipelineError::AggregationInconsistency {
            key: key.to_string(),
            details: format!("conflicting {column}: {details}"),
        });
    }
    Ok(distinct.into_iter().next().cloned())
}

fn collapse(key: CanonicalKey, rows: Vec<RawMeasurement>) -> PipelineResult<AggregatedMeasurement> {
    if key.value_type == ValueType::Frequency && rows.len() > 1 {
        return Err(PipelineError::AggregationInconsistency {
            key: key.to_string(),
            details: format!(
                "a frequency cannot be summed over {} split files: {}",
                rows.len(),
                rows.iter().map(|r| r.file_path.display()).join(", ")
            ),
        });
    }
    let branch = consensus(&key, "branch", &rows, |r| r.branch.as_ref())?;
    let easy_name = consensus(&key, "easy_name", &rows, |r| r.easy_name.as_ref())?;
    let notes = consensus(&key, "notes", &rows, |r| r.notes.as_ref())?;
    let verbose_name = consensus(&key, "verbose_name", &rows, |r| r.verbose_name.as_ref())?;

    let file_subsets: Vec<String> = rows
        .iter()
        .map(|r| r.record.file_subset().to_string())
        .sorted()
        .collect();
    if let Some(subset) = file_subsets.iter().duplicates().next() {
        return Err(PipelineError::AggregationInconsistency {
            key: key.to_string(),
            details: format!("file subset '{subset}' appears more than once"),
        });
    }
    let value = sum_values(rows.iter().map(|r| r.value));
    let file_paths = rows.into_iter().map(|r| r.file_path).collect();

    Ok(AggregatedMeasurement {
        key,
        value,
        file_subsets,
        file_paths,
        branch,
        easy_name,
        notes,
        verbose_name,
    })
}

/// One aggregated row per canonical key, ordered by key. Path lists keep
/// input order.
pub fn aggregate(rows: Vec<RawMeasurement>) -> PipelineResult<Vec<AggregatedMeasurement>> {
    if rows.is_empty() {
        info!("no measurements to aggregate");
        return Ok(vec![]);
    }
    let raw_count = rows.len();
    let mut groups: BTreeMap<CanonicalKey, Vec<RawMeasurement>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.canonical_key()).or_default().push(row);
    }

    let aggregated = groups
        .into_iter()
        .map(|(key, rows)| collapse(key, rows))
        .collect::<PipelineResult<Vec<_>>>()?;
    check_uniqueness(&aggregated)?;

    let split = aggregated.iter().filter(|a| a.file_subsets.len() > 1).count();
    info!(
        raw = raw_count,
        aggregated = aggregated.len(),
        split_samples = split,
        "split files aggregated"
    );
    Ok(aggregated)
}

/// At most one aggregated row per uniqueness key. A second row means two
/// distinct exports (other sort id, software or extension) claim the same
/// measurement.
pub fn check_uniqueness(rows: &[AggregatedMeasurement]) -> PipelineResult<()> {
    let mut seen: BTreeMap<UniquenessKey, &AggregatedMeasurement> = BTreeMap::new();
    for row in rows {
        let key = row.key.uniqueness_key();
        if let Some(first) = seen.get(&key) {
            return Err(PipelineError::AggregationInconsistency {
                key: key.to_string(),
                details: format!(
                    "duplicate measurement from [{}] and [{}]",
                    first.file_paths.iter().map(|p| p.display()).join(", "),
                    row.file_paths.iter().map(|p| p.display()).join(", ")
                ),
            });
        }
        debug!(key = %key, "unique");
        seen.insert(key, row);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::field_record::FieldRecord;
    use crate::field_record::tests::clinical_summary_schema;
    use crate::registry::tests::sample_registry;
    use proptest::prelude::*;
    use std::path::PathBuf;

    pub(crate) fn sort_record(
        ptid_visit: &str,
        tube: &str,
        pool: &str,
        subset: &str,
    ) -> FieldRecord {
        let name = format!(
            "Sort_230412_A1B_{ptid_visit}_eODGT8_PBMC_FlowJo_Sort_{tube}_{pool}_HT1_{subset}.csv"
        );
        clinical_summary_schema()
            .parse_file_name(&name, &sample_registry())
            .unwrap()
    }

    pub(crate) fn count_row(
        record: FieldRecord,
        gate: &str,
        easy_name: &str,
        value: Option<f64>,
    ) -> RawMeasurement {
        let file_path = PathBuf::from(format!("{}_{}.csv", record.sort_id(), record.file_subset()));
        RawMeasurement {
            record,
            gate: gate.to_string(),
            phenotype: None,
            branch: Some("B cells".to_string()),
            easy_name: Some(easy_name.to_string()),
            verbose_name: None,
            notes: None,
            value_type: ValueType::Count,
            file_path,
            value,
        }
    }

    fn split_row(subset: &str, value: f64) -> RawMeasurement {
        count_row(
            sort_record("G002-001_V091", "T1", "P1", subset),
            "P5",
            "epitope_specific",
            Some(value),
        )
    }

    #[test]
    fn test_split_files_are_summed() {
        let rows = vec![split_row("b", 30.0), split_row("a", 120.0)];
        let aggregated = aggregate(rows).unwrap();
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].value, Some(150.0));
        assert_eq!(aggregated[0].file_subsets, vec!["a", "b"]);
        assert_eq!(
            aggregated[0].file_paths,
            vec![PathBuf::from("A1B_b.csv"), PathBuf::from("A1B_a.csv")]
        );
        assert_eq!(aggregated[0].branch.as_deref(), Some("B cells"));
    }

    #[test]
    fn test_null_values_are_ignored_in_sum() {
        assert_eq!(sum_values([None, Some(2.0), None]), Some(2.0));
        assert_eq!(sum_values([None, None]), None);
    }

    #[test]
    fn test_conflicting_descriptive_field_is_rejected() {
        let mut b = split_row("b", 30.0);
        b.branch = Some("T cells".to_string());
        let err = aggregate(vec![split_row("a", 120.0), b]).unwrap_err();
        match err {
            PipelineError::AggregationInconsistency { details, .. } => {
                assert!(details.contains("branch"));
                assert!(details.contains("T cells"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_duplicate_subset_is_rejected() {
        let err = aggregate(vec![split_row("a", 1.0), split_row("a", 2.0)]).unwrap_err();
        assert!(matches!(err, PipelineError::AggregationInconsistency { .. }));
    }

    #[test]
    fn test_other_sort_id_violates_uniqueness() {
        let record = clinical_summary_schema()
            .parse_file_name(
                "Sort_230412_Z9Z_G002-001_V091_eODGT8_PBMC_FlowJo_Sort_T1_P1_HT1_a.csv",
                &sample_registry(),
            )
            .unwrap();
        let other = count_row(record, "P5", "epitope_specific", Some(5.0));
        let err = aggregate(vec![split_row("a", 120.0), other]).unwrap_err();
        match err {
            PipelineError::AggregationInconsistency { details, .. } => {
                assert!(details.contains("duplicate"))
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_different_tubes_stay_separate() {
        let rows = vec![
            split_row("a", 120.0),
            count_row(
                sort_record("G002-001_V091", "T2", "P1", "a"),
                "P5",
                "epitope_specific",
                Some(7.0),
            ),
        ];
        assert_eq!(aggregate(rows).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_input_gives_empty_output() {
        assert!(aggregate(vec![]).unwrap().is_empty());
    }

    fn values_and_order() -> impl Strategy<Value = (Vec<f64>, Vec<usize>)> {
        prop::collection::vec(0.0f64..1.0e6, 1..8).prop_flat_map(|values| {
            let order: Vec<usize> = (0..values.len()).collect();
            (Just(values), Just(order).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn prop_sum_is_order_independent((values, order) in values_and_order()) {
            let subsets: Vec<String> = (0..values.len())
                .map(|i| char::from(b'a' + i as u8).to_string())
                .collect();
            let forward: Vec<RawMeasurement> = values
                .iter()
                .zip(&subsets)
                .map(|(v, s)| split_row(s, *v))
                .collect();
            let shuffled: Vec<RawMeasurement> = order.iter().map(|i| forward[*i].clone()).collect();

            let a = aggregate(forward).unwrap();
            let b = aggregate(shuffled).unwrap();
            prop_assert_eq!(a.len(), 1);
            prop_assert_eq!(a[0].value, b[0].value);
            prop_assert_eq!(&a[0].file_subsets, &b[0].file_subsets);
        }
    }
}
