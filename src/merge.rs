//! Outer join of flow output with a sequencing manifest.
//!
//! Flow data decides which samples exist: a manifest identity with no flow
//! sample is fatal, a flow sample with no manifest row is kept with empty
//! sequencing columns and a warning.

use crate::aggregate::sum_values;
use crate::category::{FileType, RunKind};
use crate::dates::parse_manifest_date;
use crate::error::{PipelineError, PipelineResult};
use crate::field_record::SampleType;
use crate::gates::ValueType;
use crate::measurement::{AggregatedMeasurement, SampleIdentity};
use csv::{ReaderBuilder, Trim};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MANIFEST_IDENTITY_COLUMNS: [&str; 9] = [
    "ptid",
    "group",
    "weeks",
    "visit_id",
    "probe_set",
    "sample_type",
    "sorted_date",
    "pool_number",
    "hashtag",
];

pub const MISSING_SENTINELS: &[&str] = &["", "NA", "N/A", "nan", "NaN", "None", "null"];

/// Trimmed value, `None` for a missing-value sentinel. Backslash path
/// separators become `/`.
pub fn normalize_cell(value: &str) -> Option<String> {
    let value = value.trim();
    if MISSING_SENTINELS.contains(&value) {
        return None;
    }
    Some(value.replace('\\', "/"))
}

/// `3`, `03`, `3.0` or `P3` with prefix `P` give `P3`, the form the
/// filename grammar accepts.
pub fn normalize_prefixed(value: &str, prefix: &str) -> Result<Option<String>, String> {
    let Some(value) = normalize_cell(value) else {
        return Ok(None);
    };
    let digits = value
        .strip_prefix(prefix)
        .or_else(|| value.strip_suffix(".0"))
        .unwrap_or(&value);
    match digits.parse::<u8>() {
        Ok(n @ 1..=99) if digits.chars().all(|c| c.is_ascii_digit()) => {
            Ok(Some(format!("{prefix}{n}")))
        }
        _ => Err(format!("'{prefix}' followed by 1-99, or the bare number")),
    }
}

fn parse_integer(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|v| v.fract() == 0.0)
            .map(|v| v as i64)
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct ManifestRow {
    pub identity: SampleIdentity,
    pub extras: Vec<Option<String>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SequencingManifest {
    pub path: PathBuf,
    pub extra_columns: Vec<String>,
    pub rows: Vec<ManifestRow>,
}

impl SequencingManifest {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_text(path, &text)
    }

    pub fn from_text(path: &Path, text: &str) -> PipelineResult<Self> {
        let file = path.display().to_string();
        let format_error = |reason: String| PipelineError::TableFormat {
            path: path.to_path_buf(),
            reason,
        };
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .from_reader(text.as_bytes());
        let headers: Vec<String> = rdr
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut index = BTreeMap::new();
        for column in MANIFEST_IDENTITY_COLUMNS {
            let i = headers
                .iter()
                .position(|h| h == column)
                .ok_or_else(|| format_error(format!("missing required column '{column}'")))?;
            index.insert(column, i);
        }
        let extra_idx: Vec<usize> = (0..headers.len())
            .filter(|i| !index.values().any(|j| j == i))
            .collect();
        let extra_columns = extra_idx.iter().map(|i| headers[*i].clone()).collect();

        let mut rows = vec![];
        let mut seen = BTreeSet::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let cell = |column: &str| record.get(index[column]).unwrap_or_default();
            let required = |column: &'static str, accepted: &str| {
                normalize_cell(cell(column))
                    .ok_or_else(|| PipelineError::field(&file, column, cell(column), accepted))
            };
            let invalid = |column: &'static str, accepted: &str| {
                PipelineError::field(&file, column, cell(column), accepted)
            };

            let ptid = required("ptid", "a participant id")?;
            let group = required("group", "a group number")?
                .parse::<u32>()
                .map_err(|_| invalid("group", "a group number"))?;
            let weeks = parse_integer(&required("weeks", "a whole number of weeks")?)
                .and_then(|w| i32::try_from(w).ok())
                .ok_or_else(|| invalid("weeks", "a whole number of weeks"))?;
            let visit_id = required("visit_id", "a visit id")?;
            let probe_set = required("probe_set", "a probe set")?;
            let sample_type = required("sample_type", "PBMC or LFNA").and_then(|s| {
                SampleType::parse(&s).ok_or_else(|| invalid("sample_type", "PBMC or LFNA"))
            })?;
            let run_date = parse_manifest_date(&required("sorted_date", "a date")?)
                .ok_or_else(|| invalid("sorted_date", "YYMMDD, YYYYMMDD or YYYY-MM-DD"))?;
            let sort_pool = normalize_prefixed(cell("pool_number"), "P")
                .map_err(|a| invalid("pool_number", &a))?;
            let hashtag =
                normalize_prefixed(cell("hashtag"), "HT").map_err(|a| invalid("hashtag", &a))?;

            let identity = SampleIdentity {
                ptid,
                group,
                weeks,
                visit_id,
                probe_set,
                sample_type,
                run_date,
                sort_pool,
                hashtag,
            };
            if !seen.insert(identity.clone()) {
                return Err(format_error(format!(
                    "line {}: identity {identity} appears more than once",
                    line + 2
                )));
            }
            let extras = extra_idx
                .iter()
                .map(|i| normalize_cell(record.get(*i).unwrap_or_default()))
                .collect();
            rows.push(ManifestRow { identity, extras });
        }
        Ok(Self {
            path: path.to_path_buf(),
            extra_columns,
            rows,
        })
    }
}

/// Sort-run `Sort` acquisitions pivoted to one row per sample, one column per
/// count gate. Tubes of the same sample are summed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowTable {
    pub columns: Vec<String>,
    pub rows: BTreeMap<SampleIdentity, Vec<Option<f64>>>,
}

impl FlowTable {
    /// Fails when two different gates resolve to the same column name, since
    /// their counts would otherwise be summed into one cell.
    pub fn from_aggregated(rows: &[AggregatedMeasurement]) -> PipelineResult<Self> {
        let sort_rows: Vec<&AggregatedMeasurement> = rows
            .iter()
            .filter(|r| {
                r.key.run_purpose == RunKind::Sort
                    && r.key.file_type == FileType::Sort
                    && r.key.value_type == ValueType::Count
            })
            .collect();
        let mut gate_by_column: BTreeMap<&str, &str> = BTreeMap::new();
        for &row in &sort_rows {
            let gate = gate_by_column
                .entry(row.column_name())
                .or_insert(&row.key.gate);
            if *gate != row.key.gate {
                return Err(PipelineError::AggregationInconsistency {
                    key: format!("flow column '{}'", row.column_name()),
                    details: format!("gates '{gate}' and '{}' share the column", row.key.gate),
                });
            }
        }
        let columns: Vec<String> = gate_by_column.keys().map(|c| c.to_string()).collect();

        let mut cells: BTreeMap<SampleIdentity, Vec<Vec<Option<f64>>>> = BTreeMap::new();
        for row in sort_rows {
            let values = cells
                .entry(row.key.identity())
                .or_insert_with(|| vec![vec![]; columns.len()]);
            if let Ok(col) = columns.binary_search_by(|c| c.as_str().cmp(row.column_name())) {
                values[col].push(row.value);
            }
        }
        let rows = cells
            .into_iter()
            .map(|(identity, values)| (identity, values.into_iter().map(sum_values).collect()))
            .collect();
        Ok(Self { columns, rows })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergedRow {
    pub identity: SampleIdentity,
    pub flow: Vec<Option<f64>>,
    /// `None` when the manifest has no row for this sample.
    pub sequencing: Option<Vec<Option<String>>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedTable {
    pub flow_columns: Vec<String>,
    pub sequencing_columns: Vec<String>,
    pub rows: Vec<MergedRow>,
    pub flow_without_sequencing: usize,
}

pub struct SequenceFlowMerger;

impl SequenceFlowMerger {
    pub fn merge(flow: &FlowTable, manifest: &SequencingManifest) -> PipelineResult<MergedTable> {
        let missing: Vec<String> = manifest
            .rows
            .iter()
            .filter(|r| !flow.rows.contains_key(&r.identity))
            .map(|r| r.identity.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::MissingIdentity {
                count: missing.len(),
                identities: missing,
            });
        }

        let by_identity: BTreeMap<&SampleIdentity, &ManifestRow> =
            manifest.rows.iter().map(|r| (&r.identity, r)).collect();
        let mut unmatched = 0;
        let rows: Vec<MergedRow> = flow
            .rows
            .iter()
            .map(|(identity, values)| {
                let sequencing = by_identity.get(identity).map(|r| r.extras.clone());
                if sequencing.is_none() {
                    unmatched += 1;
                    warn!(sample = %identity, "flow sample has no sequencing manifest row");
                }
                MergedRow {
                    identity: identity.clone(),
                    flow: values.clone(),
                    sequencing,
                }
            })
            .collect();

        info!(
            samples = rows.len(),
            manifest_rows = manifest.rows.len(),
            without_sequencing = unmatched,
            "flow and sequencing merged"
        );
        Ok(MergedTable {
            flow_columns: flow.columns.clone(),
            sequencing_columns: manifest.extra_columns.clone(),
            rows,
            flow_without_sequencing: unmatched,
        })
    }
}
