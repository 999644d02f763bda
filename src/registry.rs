//! Participant enrollment registry and group-specific visit tables.

use crate::error::{PipelineError, PipelineResult};
use sortflow_protocol::{EnrollmentFile, VisitTablesFile};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Lookup tables used to derive `group` and `weeks` for a leaf record.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    group_by_ptid: HashMap<String, u32>,
    visits_by_group: BTreeMap<u32, BTreeMap<String, i32>>,
}

impl ParticipantRegistry {
    pub fn from_parts(enrollment: EnrollmentFile, visits: VisitTablesFile) -> PipelineResult<Self> {
        let mut group_by_ptid = HashMap::new();
        for entry in enrollment.participants {
            let ptid = entry.ptid.trim().to_string();
            if let Some(previous) = group_by_ptid.insert(ptid.clone(), entry.group) {
                if previous != entry.group {
                    return Err(PipelineError::Config(format!(
                        "participant '{ptid}' is enrolled in both group {previous} and group {}",
                        entry.group
                    )));
                }
            }
        }

        let mut visits_by_group = BTreeMap::new();
        for (group_key, table) in visits.groups {
            let group = group_key.trim().parse::<u32>().map_err(|_| {
                PipelineError::Config(format!("visit table group '{group_key}' is not a number"))
            })?;
            visits_by_group.insert(group, table);
        }

        for (ptid, group) in &group_by_ptid {
            if !visits_by_group.contains_key(group) {
                return Err(PipelineError::Config(format!(
                    "participant '{ptid}' is enrolled in group {group}, which has no visit table"
                )));
            }
        }

        Ok(Self {
            group_by_ptid,
            visits_by_group,
        })
    }

    pub fn from_json_str(enrollment_json: &str, visits_json: &str) -> PipelineResult<Self> {
        let enrollment: EnrollmentFile = serde_json::from_str(enrollment_json)?;
        let visits: VisitTablesFile = serde_json::from_str(visits_json)?;
        Self::from_parts(enrollment, visits)
    }

    pub fn from_json_files(enrollment_path: &Path, visits_path: &Path) -> PipelineResult<Self> {
        let enrollment = fs::read_to_string(enrollment_path)
            .map_err(|e| PipelineError::io(enrollment_path, e))?;
        let visits =
            fs::read_to_string(visits_path).map_err(|e| PipelineError::io(visits_path, e))?;
        Self::from_json_str(&enrollment, &visits)
    }

    pub fn group_of(&self, ptid: &str) -> Option<u32> {
        self.group_by_ptid.get(ptid).copied()
    }

    pub fn contains_ptid(&self, ptid: &str) -> bool {
        self.group_by_ptid.contains_key(ptid)
    }

    pub fn weeks_for(&self, group: u32, visit_id: &str) -> Option<i32> {
        self.visits_by_group
            .get(&group)
            .and_then(|table| table.get(visit_id))
            .copied()
    }

    /// Accepted visit ids for one group, sorted.
    pub fn visit_ids(&self, group: u32) -> Vec<&str> {
        self.visits_by_group
            .get(&group)
            .map(|table| table.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn visit_table(&self, group: u32) -> Option<&BTreeMap<String, i32>> {
        self.visits_by_group.get(&group)
    }

    pub fn participant_count(&self) -> usize {
        self.group_by_ptid.len()
    }
}
