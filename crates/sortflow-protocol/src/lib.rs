//! Machine-readable input contracts shared by the sortflow library and its
//! command-line driver.
//!
//! Everything in here is plain serde data. Validation and conversion into the
//! typed, immutable runtime structures happens in the `sortflow` crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_TRIAL_NAME: &str = "G002";
pub const DEFAULT_OUTPUT_DIR: &str = "sortflow_output";
pub const DEFAULT_PROBE_SETS: &[&str] = &["eODGT8", "Core-g28v2", "N332-GT5"];

/// One count-gate definition from the gate configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountGateSpec {
    pub gate: String,
    #[serde(default)]
    pub phenotype: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub easy_name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// One ratio definition. Parents are optional because the frequency
/// calculator aligns aggregated rows by gate label only; the extractor needs
/// them when the ratio is resolved directly from one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencySpec {
    pub numerator_gate: String,
    #[serde(default)]
    pub numerator_parent: Option<String>,
    pub denominator_gate: String,
    #[serde(default)]
    pub denominator_parent: Option<String>,
    pub easy_name: String,
    #[serde(default)]
    pub verbose_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentEntry {
    pub ptid: String,
    pub group: u32,
}

/// Participant-to-group enrollment registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentFile {
    pub participants: Vec<EnrollmentEntry>,
}

/// Group-specific visit-id to study-week tables. Group keys are strings in
/// JSON (`"1"`, `"2"`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitTablesFile {
    pub groups: BTreeMap<String, BTreeMap<String, i32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialSettings {
    pub name: String,
    pub probe_sets: Vec<String>,
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_TRIAL_NAME.to_string(),
            probe_sets: DEFAULT_PROBE_SETS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Input locations. Relative paths are resolved against the directory that
/// holds the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPaths {
    pub root: Option<String>,
    pub enrollment: Option<String>,
    pub visits: Option<String>,
    pub count_gates: Option<String>,
    pub frequencies: Option<String>,
    pub manifest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Size of the extraction worker pool; `None` uses the rayon default.
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub dir: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: DEFAULT_OUTPUT_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfigFile {
    pub trial: TrialSettings,
    pub inputs: InputPaths,
    pub extraction: ExtractionSettings,
    pub output: OutputSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_sections() {
        let cfg: PipelineConfigFile =
            serde_json::from_str(r#"{"inputs": {"root": "data/G002"}}"#).unwrap();
        assert_eq!(cfg.trial.name, "G002");
        assert_eq!(cfg.trial.probe_sets.len(), 3);
        assert_eq!(cfg.inputs.root.as_deref(), Some("data/G002"));
        assert_eq!(cfg.output.dir, DEFAULT_OUTPUT_DIR);
        assert!(cfg.extraction.threads.is_none());
    }

    #[test]
    fn test_visit_tables_parse() {
        let visits: VisitTablesFile =
            serde_json::from_str(r#"{"groups": {"1": {"V091": -5, "V201": 8}}}"#).unwrap();
        assert_eq!(visits.groups["1"]["V091"], -5);
    }

    #[test]
    fn test_frequency_spec_optional_parents() {
        let spec: FrequencySpec = serde_json::from_str(
            r#"{"numerator_gate": "P5", "denominator_gate": "P4", "easy_name": "epitope_specific"}"#,
        )
        .unwrap();
        assert!(spec.numerator_parent.is_none());
        assert!(spec.verbose_name.is_none());
    }
}
