//! Gate and frequency definitions, parsed once into an immutable catalog.

use crate::error::{PipelineError, PipelineResult};
use serde::Serialize;
use sortflow_protocol::{CountGateSpec, FrequencySpec};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Count,
    Frequency,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Frequency => "frequency",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CountQuery {
    pub gate: String,
    pub phenotype: Option<String>,
    pub branch: Option<String>,
    pub easy_name: Option<String>,
    pub notes: Option<String>,
}

impl CountQuery {
    /// Report column of this gate: the easy name when configured, else the gate.
    pub fn column_name(&self) -> &str {
        self.easy_name.as_deref().unwrap_or(&self.gate)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FrequencyQuery {
    pub numerator_gate: String,
    pub numerator_parent: Option<String>,
    pub denominator_gate: String,
    pub denominator_parent: Option<String>,
    pub easy_name: String,
    pub verbose_name: Option<String>,
}

impl FrequencyQuery {
    /// Gate label of a ratio, `"{numerator}/{denominator}"`.
    pub fn gate_label(&self) -> String {
        format!("{}/{}", self.numerator_gate, self.denominator_gate)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum GateQuery {
    Count(CountQuery),
    Frequency(FrequencyQuery),
}

impl GateQuery {
    pub fn value_type(&self) -> ValueType {
        match self {
            GateQuery::Count(_) => ValueType::Count,
            GateQuery::Frequency(_) => ValueType::Frequency,
        }
    }

    pub fn gate_label(&self) -> String {
        match self {
            GateQuery::Count(q) => q.gate.clone(),
            GateQuery::Frequency(q) => q.gate_label(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl TryFrom<CountGateSpec> for CountQuery {
    type Error = PipelineError;

    fn try_from(spec: CountGateSpec) -> PipelineResult<Self> {
        let gate = spec.gate.trim().to_string();
        if gate.is_empty() {
            return Err(PipelineError::Config("count gate with empty name".to_string()));
        }
        Ok(Self {
            gate,
            phenotype: non_empty(spec.phenotype),
            branch: non_empty(spec.branch),
            easy_name: non_empty(spec.easy_name),
            notes: non_empty(spec.notes),
        })
    }
}

impl TryFrom<FrequencySpec> for FrequencyQuery {
    type Error = PipelineError;

    fn try_from(spec: FrequencySpec) -> PipelineResult<Self> {
        let numerator_gate = spec.numerator_gate.trim().to_string();
        let denominator_gate = spec.denominator_gate.trim().to_string();
        let easy_name = spec.easy_name.trim().to_string();
        if numerator_gate.is_empty() || denominator_gate.is_empty() || easy_name.is_empty() {
            return Err(PipelineError::Config(format!(
                "frequency definition '{}' needs numerator_gate, denominator_gate and easy_name",
                spec.easy_name
            )));
        }
        Ok(Self {
            numerator_gate,
            numerator_parent: non_empty(spec.numerator_parent),
            denominator_gate,
            denominator_parent: non_empty(spec.denominator_parent),
            easy_name,
            verbose_name: non_empty(spec.verbose_name),
        })
    }
}

/// All declarative gate inputs of one run.
#[derive(Clone, Debug, Default)]
pub struct GateCatalog {
    counts: Vec<CountQuery>,
    frequencies: Vec<FrequencyQuery>,
}

impl GateCatalog {
    pub fn new(counts: Vec<CountQuery>, frequencies: Vec<FrequencyQuery>) -> PipelineResult<Self> {
        let mut seen = HashSet::new();
        for q in &counts {
            if !seen.insert(q.gate.as_str()) {
                return Err(PipelineError::Config(format!(
                    "count gate '{}' is defined more than once",
                    q.gate
                )));
            }
        }
        let mut columns: HashMap<&str, &str> = HashMap::new();
        for q in &counts {
            if let Some(other) = columns.insert(q.column_name(), q.gate.as_str()) {
                return Err(PipelineError::Config(format!(
                    "count gates '{other}' and '{}' both report as column '{}'",
                    q.gate,
                    q.column_name()
                )));
            }
        }
        let mut names = HashSet::new();
        for f in &frequencies {
            if !names.insert(f.easy_name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "frequency '{}' is defined more than once",
                    f.easy_name
                )));
            }
            for gate in [&f.numerator_gate, &f.denominator_gate] {
                if !seen.contains(gate.as_str()) {
                    return Err(PipelineError::Config(format!(
                        "frequency '{}' uses gate '{gate}', which is not a configured count gate",
                        f.easy_name
                    )));
                }
            }
        }
        Ok(Self {
            counts,
            frequencies,
        })
    }

    pub fn from_json_str(counts_json: &str, frequencies_json: &str) -> PipelineResult<Self> {
        let count_specs: Vec<CountGateSpec> = serde_json::from_str(counts_json)?;
        let frequency_specs: Vec<FrequencySpec> = serde_json::from_str(frequencies_json)?;
        let counts = count_specs
            .into_iter()
            .map(CountQuery::try_from)
            .collect::<PipelineResult<Vec<_>>>()?;
        let frequencies = frequency_specs
            .into_iter()
            .map(FrequencyQuery::try_from)
            .collect::<PipelineResult<Vec<_>>>()?;
        Self::new(counts, frequencies)
    }

    /// Load count gates and, when given, frequency definitions.
    pub fn from_json_files(
        counts_path: &Path,
        frequencies_path: Option<&Path>,
    ) -> PipelineResult<Self> {
        let counts =
            fs::read_to_string(counts_path).map_err(|e| PipelineError::io(counts_path, e))?;
        let frequencies = match frequencies_path {
            Some(path) => fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?,
            None => "[]".to_string(),
        };
        Self::from_json_str(&counts, &frequencies)
    }

    pub fn counts(&self) -> &[CountQuery] {
        &self.counts
    }

    pub fn frequencies(&self) -> &[FrequencyQuery] {
        &self.frequencies
    }

    /// Queries resolved per file during extraction.
    pub fn extraction_queries(&self) -> Vec<GateQuery> {
        self.counts.iter().cloned().map(GateQuery::Count).collect()
    }
}
