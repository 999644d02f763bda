//! Measurement rows and the keys used to group them.

use crate::category::{FileType, RunKind};
use crate::field_record::{FieldRecord, SampleType};
use crate::gates::ValueType;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Cross-dataset join key between flow output and sequencing manifests.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct SampleIdentity {
    pub ptid: String,
    pub group: u32,
    pub weeks: i32,
    pub visit_id: String,
    pub probe_set: String,
    pub sample_type: SampleType,
    pub run_date: NaiveDate,
    pub sort_pool: Option<String>,
    pub hashtag: Option<String>,
}

impl SampleIdentity {
    pub fn of(record: &FieldRecord) -> Self {
        Self {
            ptid: record.ptid().to_string(),
            group: record.group(),
            weeks: record.weeks(),
            visit_id: record.visit_id().to_string(),
            probe_set: record.probe_set().to_string(),
            sample_type: record.sample_type(),
            run_date: record.run_date(),
            sort_pool: record.sort_pool().map(str::to_string),
            hashtag: record.hashtag().map(str::to_string),
        }
    }
}

impl fmt::Display for SampleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (group {}, {} / week {}) {} {} {} pool {} hashtag {}",
            self.ptid,
            self.group,
            self.visit_id,
            self.weeks,
            self.probe_set,
            self.sample_type,
            self.run_date.format("%Y-%m-%d"),
            self.sort_pool.as_deref().unwrap_or("-"),
            self.hashtag.as_deref().unwrap_or("-"),
        )
    }
}

/// Identity of one logical sample/gate combination: every record field except
/// the file subset, plus the gate. Path, value and descriptive fields are not
/// part of it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct CanonicalKey {
    pub run_purpose: RunKind,
    pub run_date: NaiveDate,
    pub sort_id: String,
    pub ptid: String,
    pub group: u32,
    pub weeks: i32,
    pub visit_id: String,
    pub probe_set: String,
    pub sample_type: SampleType,
    pub sort_software: String,
    pub file_type: FileType,
    pub sample_tube: Option<String>,
    pub sort_pool: Option<String>,
    pub hashtag: Option<String>,
    pub extension: String,
    pub gate: String,
    pub phenotype: Option<String>,
    pub value_type: ValueType,
}

impl CanonicalKey {
    pub fn identity(&self) -> SampleIdentity {
        SampleIdentity {
            ptid: self.ptid.clone(),
            group: self.group,
            weeks: self.weeks,
            visit_id: self.visit_id.clone(),
            probe_set: self.probe_set.clone(),
            sample_type: self.sample_type,
            run_date: self.run_date,
            sort_pool: self.sort_pool.clone(),
            hashtag: self.hashtag.clone(),
        }
    }

    /// Key that must be unique after aggregation: the sample identity plus
    /// acquisition and gate, ignoring sort id, software and extension. Two
    /// surviving rows here mean two different source files claim the same
    /// measurement.
    pub fn uniqueness_key(&self) -> UniquenessKey {
        UniquenessKey {
            run_purpose: self.run_purpose,
            identity: self.identity(),
            file_type: self.file_type,
            sample_tube: self.sample_tube.clone(),
            gate: self.gate.clone(),
            phenotype: self.phenotype.clone(),
            value_type: self.value_type,
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{} {} tube {}] gate {} ({})",
            self.run_purpose,
            self.sort_id,
            self.identity(),
            self.file_type,
            self.sort_software,
            self.sample_tube.as_deref().unwrap_or("-"),
            self.gate,
            self.value_type
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UniquenessKey {
    pub run_purpose: RunKind,
    pub identity: SampleIdentity,
    pub file_type: FileType,
    pub sample_tube: Option<String>,
    pub gate: String,
    pub phenotype: Option<String>,
    pub value_type: ValueType,
}

impl fmt::Display for UniquenessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{} tube {}] gate {} ({})",
            self.run_purpose,
            self.identity,
            self.file_type,
            self.sample_tube.as_deref().unwrap_or("-"),
            self.gate,
            self.value_type
        )
    }
}

/// One (file, gate query) result.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMeasurement {
    pub record: FieldRecord,
    pub gate: String,
    pub phenotype: Option<String>,
    pub branch: Option<String>,
    pub easy_name: Option<String>,
    pub verbose_name: Option<String>,
    pub notes: Option<String>,
    pub value_type: ValueType,
    pub file_path: PathBuf,
    pub value: Option<f64>,
}

impl RawMeasurement {
    pub fn canonical_key(&self) -> CanonicalKey {
        let r = &self.record;
        CanonicalKey {
            run_purpose: r.run_purpose(),
            run_date: r.run_date(),
            sort_id: r.sort_id().to_string(),
            ptid: r.ptid().to_string(),
            group: r.group(),
            weeks: r.weeks(),
            visit_id: r.visit_id().to_string(),
            probe_set: r.probe_set().to_string(),
            sample_type: r.sample_type(),
            sort_software: r.sort_software().to_string(),
            file_type: r.file_type(),
            sample_tube: r.sample_tube().map(str::to_string),
            sort_pool: r.sort_pool().map(str::to_string),
            hashtag: r.hashtag().map(str::to_string),
            extension: r.extension().to_ascii_lowercase(),
            gate: self.gate.clone(),
            phenotype: self.phenotype.clone(),
            value_type: self.value_type,
        }
    }
}

/// One CanonicalKey's raw rows collapsed into one.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregatedMeasurement {
    pub key: CanonicalKey,
    pub value: Option<f64>,
    pub file_subsets: Vec<String>,
    pub file_paths: Vec<PathBuf>,
    pub branch: Option<String>,
    pub easy_name: Option<String>,
    pub notes: Option<String>,
    pub verbose_name: Option<String>,
}

impl AggregatedMeasurement {
    /// Report column name: the easy name when configured, else the gate.
    pub fn column_name(&self) -> &str {
        self.easy_name.as_deref().unwrap_or(&self.key.gate)
    }
}
