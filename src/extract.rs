//! Resolve gate queries against population summary tables.

use crate::error::PipelineResult;
use crate::gate_table::TableCache;
use crate::gates::GateQuery;
use crate::measurement::RawMeasurement;
use crate::scheme::PopulationSortFile;
use rayon::prelude::*;
use std::path::Path;
use tracing::{debug, info};

pub struct GateMeasurementExtractor<'a> {
    cache: &'a TableCache,
}

impl<'a> GateMeasurementExtractor<'a> {
    pub fn new(cache: &'a TableCache) -> Self {
        Self { cache }
    }

    /// Value of one query in one table. Missing or ambiguous gates are errors.
    pub fn resolve(&self, path: &Path, query: &GateQuery) -> PipelineResult<Option<f64>> {
        let table = self.cache.table_for(path)?;
        match query {
            GateQuery::Count(q) => table.count(&q.gate),
            GateQuery::Frequency(q) => table.frequency(
                (&q.numerator_gate, q.numerator_parent.as_deref()),
                (&q.denominator_gate, q.denominator_parent.as_deref()),
            ),
        }
    }

    pub fn measure(
        &self,
        file: &PopulationSortFile,
        query: &GateQuery,
    ) -> PipelineResult<RawMeasurement> {
        let value = self.resolve(&file.path, query)?;
        let (phenotype, branch, easy_name, verbose_name, notes) = match query {
            GateQuery::Count(q) => (
                q.phenotype.clone(),
                q.branch.clone(),
                q.easy_name.clone(),
                None,
                q.notes.clone(),
            ),
            GateQuery::Frequency(q) => (
                None,
                None,
                Some(q.easy_name.clone()),
                q.verbose_name.clone(),
                None,
            ),
        };
        Ok(RawMeasurement {
            record: file.record.clone(),
            gate: query.gate_label(),
            phenotype,
            branch,
            easy_name,
            verbose_name,
            notes,
            value_type: query.value_type(),
            file_path: file.path.clone(),
            value,
        })
    }

    /// Every query against one file, in query order.
    pub fn measure_file(
        &self,
        file: &PopulationSortFile,
        queries: &[GateQuery],
    ) -> PipelineResult<Vec<RawMeasurement>> {
        let rows = queries
            .iter()
            .map(|q| self.measure(file, q))
            .collect::<PipelineResult<Vec<_>>>()?;
        debug!(path = %file.path.display(), rows = rows.len(), "extracted gates");
        Ok(rows)
    }
}

/// Extract all queries from all files on a fixed-size worker pool. Output is
/// in file order, then query order, regardless of scheduling. `threads` of
/// `None` lets rayon pick the pool size.
pub fn extract_all(
    files: &[PopulationSortFile],
    queries: &[GateQuery],
    cache: &TableCache,
    threads: Option<usize>,
) -> PipelineResult<Vec<RawMeasurement>> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = threads.filter(|n| *n > 0) {
        builder = builder.num_threads(n);
    }
    let pool = builder.build()?;
    let extractor = GateMeasurementExtractor::new(cache);

    let per_file = pool.install(|| {
        files
            .par_iter()
            .map(|file| extractor.measure_file(file, queries))
            .collect::<PipelineResult<Vec<_>>>()
    })?;
    let rows: Vec<RawMeasurement> = per_file.into_iter().flatten().collect();
    info!(
        files = files.len(),
        queries = queries.len(),
        rows = rows.len(),
        tables_loaded = cache.loads(),
        cache_hits = cache.hits(),
        "gate extraction finished"
    );
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::field_record::tests::clinical_summary_schema;
    use crate::gates::tests::sample_catalog;
    use crate::gates::ValueType;
    use crate::registry::tests::sample_registry;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const TABLE: &str = "Sample export\n\nPopulation,Parent Name,#Events\nLymphocytes,All Events,5000\nP4,Lymphocytes,1000\nP5,P4,120\n";

    fn sort_file(dir: &Path, subset: &str, table: &str) -> PopulationSortFile {
        let name = format!(
            "Sort_230412_A1B_G002-001_V091_eODGT8_PBMC_FlowJo_Sort_T1_P1_HT1_{subset}.csv"
        );
        let path: PathBuf = dir.join(&name);
        fs::write(&path, table).unwrap();
        let schema = clinical_summary_schema();
        PopulationSortFile {
            record: schema.parse_file_name(&name, &sample_registry()).unwrap(),
            path,
            category: schema.category(),
        }
    }

    #[test]
    fn test_measure_count_carries_metadata() {
        let td = tempdir().unwrap();
        let file = sort_file(td.path(), "a", TABLE);
        let cache = TableCache::new();
        let extractor = GateMeasurementExtractor::new(&cache);
        let catalog = sample_catalog();
        let query = &catalog.extraction_queries()[1];
        let row = extractor.measure(&file, query).unwrap();
        assert_eq!(row.gate, "P5");
        assert_eq!(row.value, Some(120.0));
        assert_eq!(row.value_type, ValueType::Count);
        assert_eq!(row.easy_name.as_deref(), Some("epitope_specific"));
        assert_eq!(row.branch.as_deref(), Some("B cells"));
        assert_eq!(row.record.weeks(), -5);
    }

    #[test]
    fn test_measure_frequency_query() {
        let td = tempdir().unwrap();
        let file = sort_file(td.path(), "a", TABLE);
        let cache = TableCache::new();
        let extractor = GateMeasurementExtractor::new(&cache);
        let query = GateQuery::Frequency(sample_catalog().frequencies()[0].clone());
        let row = extractor.measure(&file, &query).unwrap();
        assert_eq!(row.gate, "P5/P4");
        assert_eq!(row.value, Some(0.12));
        assert_eq!(row.value_type, ValueType::Frequency);
    }

    #[test]
    fn test_extract_all_is_ordered_and_cached() {
        let td = tempdir().unwrap();
        let files = vec![
            sort_file(td.path(), "a", TABLE),
            sort_file(td.path(), "b", &TABLE.replace("120", "30")),
        ];
        let cache = TableCache::new();
        let queries = sample_catalog().extraction_queries();
        let rows = extract_all(&files, &queries, &cache, Some(2)).unwrap();
        let values: Vec<_> = rows.iter().map(|r| (r.record.file_subset(), r.value)).collect();
        assert_eq!(
            values,
            vec![
                ("a", Some(1000.0)),
                ("a", Some(120.0)),
                ("b", Some(1000.0)),
                ("b", Some(30.0)),
            ]
        );
        assert_eq!(cache.loads(), 2);
        assert_eq!(cache.hits(), 2);
    }

    #[test]
    fn test_missing_gate_aborts_extraction() {
        let td = tempdir().unwrap();
        let files = vec![sort_file(td.path(), "a", &TABLE.replace("P5,P4,120\n", ""))];
        let cache = TableCache::new();
        let err = extract_all(&files, &sample_catalog().extraction_queries(), &cache, Some(1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::GateNotFound { ref gate, .. } if gate == "P5"));
    }
}
