//! Files written at the end of a run: the long measurement table as Parquet
//! and CSV, the wide frequency and merged tables as CSV, and a JSON summary.

use crate::category::{FileType, RunKind};
use crate::error::{PipelineError, PipelineResult};
use crate::field_record::SampleType;
use crate::frequency::{FrequencyMeasurement, FrequencyTable};
use crate::gates::ValueType;
use crate::measurement::{AggregatedMeasurement, SampleIdentity};
use crate::merge::MergedTable;
use arrow::array::{ArrayRef, Date32Array, Float64Array, Int32Array, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Date32Type, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use itertools::Itertools;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const MEASUREMENTS_FILE: &str = "measurements_long.parquet";
pub const MEASUREMENTS_CSV_FILE: &str = "measurements_long.csv";
pub const FREQUENCIES_FILE: &str = "frequencies_wide.csv";
pub const MERGED_FILE: &str = "flow_sequencing_merged.csv";
pub const SUMMARY_FILE: &str = "run_summary.json";

const IDENTITY_HEADER: [&str; 9] = [
    "ptid",
    "group",
    "weeks",
    "visit_id",
    "probe_set",
    "sample_type",
    "run_date",
    "sort_pool",
    "hashtag",
];

/// One row of the long table. Frequency rows have no sort id, software, tube
/// or hashtag; their `sort_pool` lists the summed pools.
#[derive(Debug, Serialize)]
struct LongRow<'a> {
    run_purpose: RunKind,
    run_date: NaiveDate,
    sort_id: Option<&'a str>,
    ptid: &'a str,
    group: u32,
    weeks: i32,
    visit_id: &'a str,
    probe_set: &'a str,
    sample_type: SampleType,
    sort_software: Option<&'a str>,
    file_type: FileType,
    sample_tube: Option<&'a str>,
    sort_pool: Option<String>,
    hashtag: Option<&'a str>,
    gate: &'a str,
    phenotype: Option<&'a str>,
    branch: Option<&'a str>,
    easy_name: Option<&'a str>,
    verbose_name: Option<&'a str>,
    notes: Option<&'a str>,
    value_type: ValueType,
    value: Option<f64>,
    file_subsets: String,
    file_paths: String,
}

impl<'a> From<&'a AggregatedMeasurement> for LongRow<'a> {
    fn from(m: &'a AggregatedMeasurement) -> Self {
        let k = &m.key;
        Self {
            run_purpose: k.run_purpose,
            run_date: k.run_date,
            sort_id: Some(&k.sort_id),
            ptid: &k.ptid,
            group: k.group,
            weeks: k.weeks,
            visit_id: &k.visit_id,
            probe_set: &k.probe_set,
            sample_type: k.sample_type,
            sort_software: Some(&k.sort_software),
            file_type: k.file_type,
            sample_tube: k.sample_tube.as_deref(),
            sort_pool: k.sort_pool.clone(),
            hashtag: k.hashtag.as_deref(),
            gate: &k.gate,
            phenotype: k.phenotype.as_deref(),
            branch: m.branch.as_deref(),
            easy_name: m.easy_name.as_deref(),
            verbose_name: m.verbose_name.as_deref(),
            notes: m.notes.as_deref(),
            value_type: k.value_type,
            value: m.value,
            file_subsets: m.file_subsets.join(";"),
            file_paths: m.file_paths.iter().map(|p| p.display()).join(";"),
        }
    }
}

impl<'a> From<&'a FrequencyMeasurement> for LongRow<'a> {
    fn from(m: &'a FrequencyMeasurement) -> Self {
        let id = &m.identity;
        Self {
            run_purpose: id.run_purpose,
            run_date: id.run_date,
            sort_id: None,
            ptid: &id.ptid,
            group: id.group,
            weeks: id.weeks,
            visit_id: &id.visit_id,
            probe_set: &id.probe_set,
            sample_type: id.sample_type,
            sort_software: None,
            file_type: id.file_type,
            sample_tube: None,
            sort_pool: (!m.pools.is_empty()).then(|| m.pools.join(";")),
            hashtag: None,
            gate: &m.gate,
            phenotype: None,
            branch: None,
            easy_name: Some(&m.easy_name),
            verbose_name: m.verbose_name.as_deref(),
            notes: None,
            value_type: ValueType::Frequency,
            value: m.value,
            file_subsets: String::new(),
            file_paths: String::new(),
        }
    }
}

/// Count rows followed by frequency rows.
fn long_rows<'a>(
    counts: &'a [AggregatedMeasurement],
    frequencies: &'a [FrequencyMeasurement],
) -> Vec<LongRow<'a>> {
    counts
        .iter()
        .map(LongRow::from)
        .chain(frequencies.iter().map(LongRow::from))
        .collect()
}

fn long_schema() -> Schema {
    let text = |name: &str, nullable: bool| Field::new(name, DataType::Utf8, nullable);
    Schema::new(vec![
        text("run_purpose", false),
        Field::new("run_date", DataType::Date32, false),
        text("sort_id", true),
        text("ptid", false),
        Field::new("group", DataType::UInt32, false),
        Field::new("weeks", DataType::Int32, false),
        text("visit_id", false),
        text("probe_set", false),
        text("sample_type", false),
        text("sort_software", true),
        text("file_type", false),
        text("sample_tube", true),
        text("sort_pool", true),
        text("hashtag", true),
        text("gate", false),
        text("phenotype", true),
        text("branch", true),
        text("easy_name", true),
        text("verbose_name", true),
        text("notes", true),
        text("value_type", false),
        Field::new("value", DataType::Float64, true),
        text("file_subsets", false),
        text("file_paths", false),
    ])
}

fn long_batch(rows: &[LongRow<'_>]) -> PipelineResult<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.run_purpose.token()),
        )),
        Arc::new(Date32Array::from_iter_values(
            rows.iter().map(|r| Date32Type::from_naive_date(r.run_date)),
        )),
        Arc::new(rows.iter().map(|r| r.sort_id).collect::<StringArray>()),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.ptid))),
        Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.group))),
        Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.weeks))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.visit_id))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.probe_set))),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.sample_type.as_str()),
        )),
        Arc::new(rows.iter().map(|r| r.sort_software).collect::<StringArray>()),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.file_type.as_str()),
        )),
        Arc::new(rows.iter().map(|r| r.sample_tube).collect::<StringArray>()),
        Arc::new(rows.iter().map(|r| r.sort_pool.as_deref()).collect::<StringArray>()),
        Arc::new(rows.iter().map(|r| r.hashtag).collect::<StringArray>()),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.gate))),
        Arc::new(rows.iter().map(|r| r.phenotype).collect::<StringArray>()),
        Arc::new(rows.iter().map(|r| r.branch).collect::<StringArray>()),
        Arc::new(rows.iter().map(|r| r.easy_name).collect::<StringArray>()),
        Arc::new(rows.iter().map(|r| r.verbose_name).collect::<StringArray>()),
        Arc::new(rows.iter().map(|r| r.notes).collect::<StringArray>()),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.value_type.as_str()),
        )),
        Arc::new(rows.iter().map(|r| r.value).collect::<Float64Array>()),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.file_subsets.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.file_paths.as_str()),
        )),
    ];
    Ok(RecordBatch::try_new(Arc::new(long_schema()), columns)?)
}

fn writer(path: &Path) -> PipelineResult<csv::Writer<fs::File>> {
    let file = fs::File::create(path).map_err(|e| PipelineError::io(path, e))?;
    Ok(csv::Writer::from_writer(file))
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn identity_cells(identity: &SampleIdentity) -> Vec<String> {
    vec![
        identity.ptid.clone(),
        identity.group.to_string(),
        identity.weeks.to_string(),
        identity.visit_id.clone(),
        identity.probe_set.clone(),
        identity.sample_type.to_string(),
        identity.run_date.format("%Y-%m-%d").to_string(),
        identity.sort_pool.clone().unwrap_or_default(),
        identity.hashtag.clone().unwrap_or_default(),
    ]
}

/// Long table as Parquet: one row per sample, gate and value type.
pub fn write_measurements(
    path: &Path,
    counts: &[AggregatedMeasurement],
    frequencies: &[FrequencyMeasurement],
) -> PipelineResult<()> {
    let batch = long_batch(&long_rows(counts, frequencies))?;
    let file = fs::File::create(path).map_err(|e| PipelineError::io(path, e))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    debug!(path = %path.display(), rows = batch.num_rows(), "long table written");
    Ok(())
}

/// The same long table as CSV, for spreadsheet users.
pub fn write_measurements_csv(
    path: &Path,
    counts: &[AggregatedMeasurement],
    frequencies: &[FrequencyMeasurement],
) -> PipelineResult<()> {
    let mut wtr = writer(path)?;
    for row in long_rows(counts, frequencies) {
        wtr.serialize(row)?;
    }
    wtr.flush().map_err(|e| PipelineError::io(path, e))
}

pub fn write_frequencies(path: &Path, table: &FrequencyTable) -> PipelineResult<()> {
    let mut wtr = writer(path)?;
    let mut header: Vec<String> = [
        "run_purpose",
        "file_type",
        "ptid",
        "group",
        "weeks",
        "visit_id",
        "probe_set",
        "sample_type",
        "run_date",
        "sort_pools",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend(table.columns.iter().cloned());
    wtr.write_record(&header)?;

    for row in &table.rows {
        let id = &row.identity;
        let mut record = vec![
            id.run_purpose.to_string(),
            id.file_type.to_string(),
            id.ptid.clone(),
            id.group.to_string(),
            id.weeks.to_string(),
            id.visit_id.clone(),
            id.probe_set.clone(),
            id.sample_type.to_string(),
            id.run_date.format("%Y-%m-%d").to_string(),
            row.pools.join(";"),
        ];
        record.extend(row.values.iter().copied().map(cell));
        wtr.write_record(&record)?;
    }
    wtr.flush().map_err(|e| PipelineError::io(path, e))
}

pub fn write_merged(path: &Path, table: &MergedTable) -> PipelineResult<()> {
    let mut wtr = writer(path)?;
    let mut header: Vec<String> = IDENTITY_HEADER.iter().map(|s| s.to_string()).collect();
    header.extend(table.flow_columns.iter().cloned());
    header.extend(table.sequencing_columns.iter().cloned());
    header.push("has_sequencing".to_string());
    wtr.write_record(&header)?;

    let empty = vec![None; table.sequencing_columns.len()];
    for row in &table.rows {
        let mut record = identity_cells(&row.identity);
        record.extend(row.flow.iter().copied().map(cell));
        record.extend(
            row.sequencing
                .as_ref()
                .unwrap_or(&empty)
                .iter()
                .map(|v| v.clone().unwrap_or_default()),
        );
        record.push(row.sequencing.is_some().to_string());
        wtr.write_record(&record)?;
    }
    wtr.flush().map_err(|e| PipelineError::io(path, e))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> PipelineResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).map_err(|e| PipelineError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::aggregate::tests::{count_row, sort_record};
    use crate::frequency::FrequencyCalculator;
    use crate::gates::tests::sample_catalog;
    use arrow::array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    fn split_counts() -> Vec<AggregatedMeasurement> {
        let rows = ["a", "b"]
            .into_iter()
            .zip([(1000.0, 120.0), (200.0, 30.0)])
            .flat_map(|(subset, (p4, p5))| {
                let record = sort_record("G002-001_V091", "T1", "P1", subset);
                vec![
                    count_row(record.clone(), "P4", "igg_b_cells", Some(p4)),
                    count_row(record, "P5", "epitope_specific", Some(p5)),
                ]
            })
            .collect();
        aggregate(rows).unwrap()
    }

    #[test]
    fn test_long_table_lists_subsets_and_paths() {
        let aggregated = split_counts();
        let td = tempdir().unwrap();
        let path = td.path().join(MEASUREMENTS_CSV_FILE);
        write_measurements_csv(&path, &aggregated, &[]).unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        let records: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        let col = |name: &str| headers.iter().position(|h| h == name).unwrap();
        let record = records.iter().find(|r| &r[col("gate")] == "P5").unwrap();
        assert_eq!(&record[col("value")], "150.0");
        assert_eq!(&record[col("file_subsets")], "a;b");
        assert_eq!(&record[col("run_date")], "2023-04-12");
        assert_eq!(&record[col("sample_type")], "PBMC");
        assert_eq!(&record[col("value_type")], "count");
        assert_eq!(&record[col("notes")], "");
    }

    #[test]
    fn test_parquet_long_table_holds_counts_and_frequencies() {
        let aggregated = split_counts();
        let catalog = sample_catalog();
        let frequencies = FrequencyCalculator::new(catalog.frequencies()).compute(&aggregated);
        let td = tempdir().unwrap();
        let path = td.path().join(MEASUREMENTS_FILE);
        write_measurements(&path, &aggregated, &frequencies.measurements).unwrap();

        let file = fs::File::open(&path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        let batch = &batches[0];
        assert_eq!(batches.len(), 1);
        assert_eq!(batch.num_rows(), 3);
        let schema = batch.schema();
        assert_eq!(
            schema.field_with_name("run_date").unwrap().data_type(),
            &DataType::Date32
        );

        let strings = |name: &str| {
            batch
                .column_by_name(name)
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .clone()
        };
        let values = batch
            .column_by_name("value")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .clone();
        let gates = strings("gate");
        let value_types = strings("value_type");
        let sort_ids = strings("sort_id");

        let freq = (0..batch.num_rows())
            .find(|i| value_types.value(*i) == "frequency")
            .unwrap();
        assert_eq!(gates.value(freq), "P5/P4");
        assert_eq!(values.value(freq), 0.125);
        assert_eq!(strings("sort_pool").value(freq), "P1");
        assert!(sort_ids.is_null(freq));

        let p5 = (0..batch.num_rows()).find(|i| gates.value(*i) == "P5").unwrap();
        assert_eq!(value_types.value(p5), "count");
        assert_eq!(values.value(p5), 150.0);
        assert_eq!(sort_ids.value(p5), "A1B");
    }
}
