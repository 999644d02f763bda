//! One pipeline run: configuration, validation, extraction, aggregation,
//! frequencies, merge and output.

use crate::aggregate::aggregate;
use crate::error::{PipelineError, PipelineResult};
use crate::extract::extract_all;
use crate::frequency::FrequencyCalculator;
use crate::gate_table::TableCache;
use crate::gates::GateCatalog;
use crate::merge::{FlowTable, SequenceFlowMerger, SequencingManifest};
use crate::output;
use crate::registry::ParticipantRegistry;
use crate::scheme::SchemeValidator;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sortflow_protocol::PipelineConfigFile;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const VERSION: &str = env!("SORTFLOW_DISPLAY_VERSION");

/// Resolved run configuration; every path is usable as is.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub trial_name: String,
    pub probe_sets: Vec<String>,
    pub root: PathBuf,
    pub enrollment: PathBuf,
    pub visits: PathBuf,
    pub count_gates: PathBuf,
    pub frequencies: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub threads: Option<usize>,
    pub output_dir: PathBuf,
}

fn resolve(base_dir: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw.trim());
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let file: PipelineConfigFile = serde_json::from_str(&text)?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_config_file(file, &base)
    }

    /// Relative paths are taken relative to `base_dir`.
    pub fn from_config_file(file: PipelineConfigFile, base_dir: &Path) -> PipelineResult<Self> {
        let required = |value: &Option<String>, name: &str| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(|v| resolve(base_dir, v))
                .ok_or_else(|| PipelineError::Config(format!("inputs.{name} is required")))
        };
        let optional = |value: &Option<String>| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(|v| resolve(base_dir, v))
        };
        if file.trial.name.trim().is_empty() {
            return Err(PipelineError::Config("trial.name is empty".to_string()));
        }
        if file.trial.probe_sets.is_empty() {
            return Err(PipelineError::Config("trial.probe_sets is empty".to_string()));
        }
        Ok(Self {
            trial_name: file.trial.name.trim().to_string(),
            probe_sets: file.trial.probe_sets.clone(),
            root: required(&file.inputs.root, "root")?,
            enrollment: required(&file.inputs.enrollment, "enrollment")?,
            visits: required(&file.inputs.visits, "visits")?,
            count_gates: required(&file.inputs.count_gates, "count_gates")?,
            frequencies: optional(&file.inputs.frequencies),
            manifest: optional(&file.inputs.manifest),
            threads: file.extraction.threads,
            output_dir: resolve(base_dir, &file.output.dir),
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trial: String,
    pub root: PathBuf,
    pub leaves_by_category: BTreeMap<String, usize>,
    pub population_summaries: usize,
    pub skipped_documents: usize,
    pub raw_measurements: usize,
    pub aggregated_measurements: usize,
    pub split_samples: usize,
    pub frequency_samples: usize,
    pub merged_samples: Option<usize>,
    pub flow_without_sequencing: Option<usize>,
    pub tables_loaded: usize,
    pub cache_hits: usize,
    pub outputs: Vec<PathBuf>,
}

pub fn run(config: &PipelineConfig) -> PipelineResult<RunSummary> {
    let started_at = Utc::now();
    info!(
        version = VERSION,
        trial = %config.trial_name,
        root = %config.root.display(),
        "pipeline run started"
    );

    let registry = ParticipantRegistry::from_json_files(&config.enrollment, &config.visits)?;
    let catalog = GateCatalog::from_json_files(&config.count_gates, config.frequencies.as_deref())?;
    info!(
        participants = registry.participant_count(),
        count_gates = catalog.counts().len(),
        frequencies = catalog.frequencies().len(),
        "configuration loaded"
    );

    let validator =
        SchemeValidator::new(&config.root, &config.trial_name, &config.probe_sets, &registry);
    let scheme = validator.validate()?;

    let cache = TableCache::new();
    let raw = extract_all(
        &scheme.population_summaries,
        &catalog.extraction_queries(),
        &cache,
        config.threads,
    )?;
    let raw_measurements = raw.len();
    let aggregated = aggregate(raw)?;
    let frequencies = FrequencyCalculator::new(catalog.frequencies()).compute(&aggregated);

    let merged = match &config.manifest {
        Some(path) => {
            let manifest = SequencingManifest::load(path)?;
            let flow = FlowTable::from_aggregated(&aggregated)?;
            Some(SequenceFlowMerger::merge(&flow, &manifest)?)
        }
        None => {
            info!("no sequencing manifest configured, skipping merge");
            None
        }
    };

    fs::create_dir_all(&config.output_dir).map_err(|e| PipelineError::io(&config.output_dir, e))?;
    let mut outputs = vec![];
    let measurements_path = config.output_dir.join(output::MEASUREMENTS_FILE);
    output::write_measurements(&measurements_path, &aggregated, &frequencies.measurements)?;
    outputs.push(measurements_path);
    let measurements_csv_path = config.output_dir.join(output::MEASUREMENTS_CSV_FILE);
    output::write_measurements_csv(
        &measurements_csv_path,
        &aggregated,
        &frequencies.measurements,
    )?;
    outputs.push(measurements_csv_path);
    let frequencies_path = config.output_dir.join(output::FREQUENCIES_FILE);
    output::write_frequencies(&frequencies_path, &frequencies)?;
    outputs.push(frequencies_path);
    if let Some(merged) = &merged {
        let merged_path = config.output_dir.join(output::MERGED_FILE);
        output::write_merged(&merged_path, merged)?;
        outputs.push(merged_path);
    }

    let summary_path = config.output_dir.join(output::SUMMARY_FILE);
    outputs.push(summary_path.clone());
    let summary = RunSummary {
        version: VERSION.to_string(),
        started_at,
        finished_at: Utc::now(),
        trial: config.trial_name.clone(),
        root: config.root.clone(),
        leaves_by_category: scheme.leaves_by_category.clone(),
        population_summaries: scheme.population_summaries.len(),
        skipped_documents: scheme.skipped_documents.len(),
        raw_measurements,
        aggregated_measurements: aggregated.len(),
        split_samples: aggregated.iter().filter(|a| a.file_subsets.len() > 1).count(),
        frequency_samples: frequencies.rows.len(),
        merged_samples: merged.as_ref().map(|m| m.rows.len()),
        flow_without_sequencing: merged.as_ref().map(|m| m.flow_without_sequencing),
        tables_loaded: cache.loads(),
        cache_hits: cache.hits(),
        outputs,
    };
    output::write_json(&summary_path, &summary)?;
    info!(output = %config.output_dir.display(), "pipeline run finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_relative_paths_resolve_against_config_dir() {
        let td = tempdir().unwrap();
        let path = td.path().join("sortflow.json");
        fs::write(
            &path,
            r#"{
  "inputs": {
    "root": "data/G002",
    "enrollment": "config/enrollment.json",
    "visits": "/abs/visits.json",
    "count_gates": "config/gates.json",
    "manifest": ""
  },
  "extraction": {"threads": 4}
}"#,
        )
        .unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.root, td.path().join("data/G002"));
        assert_eq!(config.visits, PathBuf::from("/abs/visits.json"));
        assert_eq!(config.frequencies, None);
        assert_eq!(config.manifest, None);
        assert_eq!(config.threads, Some(4));
        assert_eq!(config.trial_name, "G002");
        assert_eq!(config.output_dir, td.path().join("sortflow_output"));
    }

    #[test]
    fn test_missing_required_input() {
        let err = PipelineConfig::from_config_file(PipelineConfigFile::default(), Path::new("."))
            .unwrap_err();
        assert!(err.to_string().contains("inputs.root"));
    }
}
