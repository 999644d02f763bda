//! Leaf filename grammar and the validated [`FieldRecord`] it decodes to.
//!
//! Construction is three explicit phases:
//! 1. tokens are normalized and checked position by position into [`RawFields`],
//! 2. `group` and `weeks` are derived from `(ptid, visit_id)`,
//! 3. one immutable [`FieldRecord`] is built from both.
//!
//! No partially valid record is ever returned.

use crate::category::{FileType, LeafCategory, RunKind};
use crate::dates::{DateStyle, format_run_date, parse_run_date};
use crate::error::{PipelineError, PipelineResult};
use crate::registry::ParticipantRegistry;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt;

pub const TOKEN_DELIMITER: char = '_';

/// Token inserted where the grammar omits the tube for Presort/Control files.
pub const TUBE_PLACEHOLDER: &str = "NA";

lazy_static! {
    static ref SORT_ID_RE: Regex = Regex::new(r"^[A-Za-z0-9]{3}$").expect("sort id regex");
    static ref VISIT_ID_RE: Regex = Regex::new(r"^V\d{3}$").expect("visit id regex");
    // Numbered tokens carry no leading zero so `P3` and manifest pool `3` agree.
    static ref TUBE_RE: Regex = Regex::new(r"^T[1-9]\d?$").expect("tube regex");
    static ref POOL_RE: Regex = Regex::new(r"^P[1-9]\d?$").expect("pool regex");
    static ref HASHTAG_RE: Regex = Regex::new(r"^HT[1-9]\d?$").expect("hashtag regex");
    static ref SUBSET_RE: Regex = Regex::new(r"^[a-z]$").expect("subset regex");
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub enum SampleType {
    #[serde(rename = "PBMC")]
    Pbmc,
    #[serde(rename = "LFNA")]
    Lfna,
}

impl SampleType {
    pub const ALL: [SampleType; 2] = [SampleType::Pbmc, SampleType::Lfna];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pbmc => "PBMC",
            Self::Lfna => "LFNA",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == text)
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const SORT_SOFTWARE: &[&str] = &["DiVa", "FlowJo"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Field {
    RunPurpose,
    RunDate,
    SortId,
    Ptid,
    VisitId,
    ProbeSet,
    SampleType,
    SortSoftware,
    FileType,
    SampleTube,
    SortPool,
    Hashtag,
    FileSubset,
    Extension,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Self::RunPurpose => "run_purpose",
            Self::RunDate => "run_date",
            Self::SortId => "sort_id",
            Self::Ptid => "ptid",
            Self::VisitId => "visit_id",
            Self::ProbeSet => "probe_set",
            Self::SampleType => "sample_type",
            Self::SortSoftware => "sort_software",
            Self::FileType => "file_type",
            Self::SampleTube => "sample_tube",
            Self::SortPool => "sort_pool",
            Self::Hashtag => "hashtag",
            Self::FileSubset => "file_subset",
            Self::Extension => "extension",
        }
    }
}

#[derive(Clone, Debug)]
enum Rule {
    Fixed(&'static str),
    Pattern {
        regex: &'static Regex,
        accepted: &'static str,
    },
    /// Like `Pattern`, but also admits [`TUBE_PLACEHOLDER`].
    Tube,
    OneOf(Vec<String>),
    /// Case-insensitive membership, used for extensions.
    OneOfIgnoreCase(Vec<String>),
    Date,
    Enrolled,
}

impl Rule {
    /// Returns the accepted form on failure.
    fn check(&self, value: &str, registry: &ParticipantRegistry) -> Result<(), String> {
        match self {
            Rule::Fixed(expected) => {
                if value == *expected {
                    Ok(())
                } else {
                    Err(format!("'{expected}'"))
                }
            }
            Rule::Pattern { regex, accepted } => {
                if regex.is_match(value) {
                    Ok(())
                } else {
                    Err(accepted.to_string())
                }
            }
            Rule::Tube => {
                if value == TUBE_PLACEHOLDER || TUBE_RE.is_match(value) {
                    Ok(())
                } else {
                    Err("'T' followed by 1-99 without leading zero".to_string())
                }
            }
            Rule::OneOf(values) => {
                if values.iter().any(|v| v == value) {
                    Ok(())
                } else {
                    Err(format!("one of {}", values.join(", ")))
                }
            }
            Rule::OneOfIgnoreCase(values) => {
                if values.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                    Ok(())
                } else {
                    Err(format!("one of {}", values.join(", ")))
                }
            }
            Rule::Date => parse_run_date(value)
                .map(|_| ())
                .ok_or_else(|| "a YYMMDD or YYYYMMDD date".to_string()),
            Rule::Enrolled => {
                if registry.contains_ptid(value) {
                    Ok(())
                } else {
                    Err(format!(
                        "a ptid enrolled in the participant registry ({} participants)",
                        registry.participant_count()
                    ))
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
struct Slot {
    field: Field,
    rule: Rule,
}

/// Positionally validated but not yet derived tokens.
#[derive(Clone, Debug, Default)]
pub struct RawFields {
    pub run_purpose: String,
    pub run_date: String,
    pub sort_id: String,
    pub ptid: String,
    pub visit_id: String,
    pub probe_set: String,
    pub sample_type: String,
    pub sort_software: String,
    pub file_type: String,
    pub sample_tube: Option<String>,
    pub sort_pool: Option<String>,
    pub hashtag: Option<String>,
    pub file_subset: String,
    pub extension: String,
}

impl RawFields {
    fn set(&mut self, field: Field, value: String) {
        match field {
            Field::RunPurpose => self.run_purpose = value,
            Field::RunDate => self.run_date = value,
            Field::SortId => self.sort_id = value,
            Field::Ptid => self.ptid = value,
            Field::VisitId => self.visit_id = value,
            Field::ProbeSet => self.probe_set = value,
            Field::SampleType => self.sample_type = value,
            Field::SortSoftware => self.sort_software = value,
            Field::FileType => self.file_type = value,
            Field::SampleTube => self.sample_tube = Some(value),
            Field::SortPool => self.sort_pool = Some(value),
            Field::Hashtag => self.hashtag = Some(value),
            Field::FileSubset => self.file_subset = value,
            Field::Extension => self.extension = value,
        }
    }
}

/// Decoded metadata of one leaf file.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct FieldRecord {
    run_purpose: RunKind,
    run_date: NaiveDate,
    #[serde(skip)]
    run_date_style: DateStyle,
    sort_id: String,
    ptid: String,
    group: u32,
    weeks: i32,
    visit_id: String,
    probe_set: String,
    sample_type: SampleType,
    sort_software: String,
    file_type: FileType,
    sample_tube: Option<String>,
    sort_pool: Option<String>,
    hashtag: Option<String>,
    file_subset: String,
    extension: String,
}

impl FieldRecord {
    pub fn run_purpose(&self) -> RunKind {
        self.run_purpose
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    pub fn sort_id(&self) -> &str {
        &self.sort_id
    }

    pub fn ptid(&self) -> &str {
        &self.ptid
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn weeks(&self) -> i32 {
        self.weeks
    }

    pub fn visit_id(&self) -> &str {
        &self.visit_id
    }

    pub fn probe_set(&self) -> &str {
        &self.probe_set
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    pub fn sort_software(&self) -> &str {
        &self.sort_software
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn sample_tube(&self) -> Option<&str> {
        self.sample_tube.as_deref()
    }

    pub fn sort_pool(&self) -> Option<&str> {
        self.sort_pool.as_deref()
    }

    pub fn hashtag(&self) -> Option<&str> {
        self.hashtag.as_deref()
    }

    pub fn file_subset(&self) -> &str {
        &self.file_subset
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }
}

/// Derive `(group, weeks)` from an enrolled ptid and a visit id. A visit that
/// is not in the participant's own group table is rejected with that group's
/// accepted ids.
pub fn derive_group_and_weeks(
    registry: &ParticipantRegistry,
    file: &str,
    ptid: &str,
    visit_id: &str,
) -> PipelineResult<(u32, i32)> {
    let group = registry.group_of(ptid).ok_or_else(|| {
        PipelineError::field(
            file,
            Field::Ptid.name(),
            ptid,
            "a ptid enrolled in the participant registry",
        )
    })?;
    let visit_error = || {
        PipelineError::field(
            file,
            Field::VisitId.name(),
            visit_id,
            format!(
                "one of {} (group {group})",
                registry.visit_ids(group).join(", ")
            ),
        )
    };
    if !VISIT_ID_RE.is_match(visit_id) {
        return Err(visit_error());
    }
    let weeks = registry.weeks_for(group, visit_id).ok_or_else(visit_error)?;
    Ok((group, weeks))
}

/// Split `stem_a_b.ext` into `["stem", "a", "b"]` and `"ext"`.
pub fn split_file_name(file_name: &str) -> (Vec<String>, String) {
    let (stem, extension) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext),
        None => (file_name, ""),
    };
    let tokens = stem
        .split(TOKEN_DELIMITER)
        .map(|s| s.to_string())
        .collect();
    (tokens, extension.to_string())
}

/// Filename grammar of one leaf category.
#[derive(Clone, Debug)]
pub struct LeafSchema {
    category: LeafCategory,
    slots: Vec<Slot>,
    extension_rule: Rule,
}

impl LeafSchema {
    pub fn for_category(category: LeafCategory, probe_sets: &[String]) -> Self {
        let run_kind = category.run_kind();
        let mut slots = vec![
            Slot {
                field: Field::RunPurpose,
                rule: Rule::Fixed(run_kind.token()),
            },
            Slot {
                field: Field::RunDate,
                rule: Rule::Date,
            },
            Slot {
                field: Field::SortId,
                rule: Rule::Pattern {
                    regex: &*SORT_ID_RE,
                    accepted: "3 alphanumeric characters",
                },
            },
            Slot {
                field: Field::Ptid,
                rule: Rule::Enrolled,
            },
            Slot {
                field: Field::VisitId,
                rule: Rule::Pattern {
                    regex: &*VISIT_ID_RE,
                    accepted: "'V' followed by 3 digits",
                },
            },
            Slot {
                field: Field::ProbeSet,
                rule: Rule::OneOf(probe_sets.to_vec()),
            },
            Slot {
                field: Field::SampleType,
                rule: Rule::OneOf(
                    SampleType::ALL
                        .iter()
                        .map(|t| t.as_str().to_string())
                        .collect(),
                ),
            },
            Slot {
                field: Field::SortSoftware,
                rule: Rule::OneOf(SORT_SOFTWARE.iter().map(|s| s.to_string()).collect()),
            },
            Slot {
                field: Field::FileType,
                rule: Rule::OneOf(
                    category
                        .file_types()
                        .iter()
                        .map(|t| t.as_str().to_string())
                        .collect(),
                ),
            },
        ];
        if category.has_sort_tokens() {
            slots.push(Slot {
                field: Field::SampleTube,
                rule: Rule::Tube,
            });
            slots.push(Slot {
                field: Field::SortPool,
                rule: Rule::Pattern {
                    regex: &*POOL_RE,
                    accepted: "'P' followed by 1-99 without leading zero",
                },
            });
            slots.push(Slot {
                field: Field::Hashtag,
                rule: Rule::Pattern {
                    regex: &*HASHTAG_RE,
                    accepted: "'HT' followed by 1-99 without leading zero",
                },
            });
        }
        slots.push(Slot {
            field: Field::FileSubset,
            rule: Rule::Pattern {
                regex: &*SUBSET_RE,
                accepted: "one lower-case letter",
            },
        });
        let extension_rule = Rule::OneOfIgnoreCase(
            category
                .leaf_dir()
                .extensions()
                .iter()
                .map(|e| e.to_string())
                .collect(),
        );
        Self {
            category,
            slots,
            extension_rule,
        }
    }

    pub fn category(&self) -> LeafCategory {
        self.category
    }

    /// Number of tokens a complete filename carries, extension included.
    pub fn field_count(&self) -> usize {
        self.slots.len() + 1
    }

    fn position_of(&self, field: Field) -> Option<usize> {
        self.slots.iter().position(|s| s.field == field)
    }

    /// Insert the tube placeholder when the grammar omits it. Returns whether
    /// a placeholder was synthesized.
    fn normalize(&self, tokens: &mut Vec<String>) -> bool {
        let (Some(tube_pos), Some(type_pos)) = (
            self.position_of(Field::SampleTube),
            self.position_of(Field::FileType),
        ) else {
            return false;
        };
        if tokens.len() + 1 != self.slots.len() || type_pos >= tube_pos {
            return false;
        }
        let omits = tokens
            .get(type_pos)
            .and_then(|t| FileType::parse(t))
            .is_some_and(FileType::omits_tube);
        if omits {
            tokens.insert(tube_pos, TUBE_PLACEHOLDER.to_string());
        }
        omits
    }

    pub fn parse_file_name(
        &self,
        file_name: &str,
        registry: &ParticipantRegistry,
    ) -> PipelineResult<FieldRecord> {
        let (tokens, extension) = split_file_name(file_name);
        self.parse_tokens(file_name, tokens, &extension, registry)
    }

    pub fn parse_tokens(
        &self,
        file: &str,
        tokens: Vec<String>,
        extension: &str,
        registry: &ParticipantRegistry,
    ) -> PipelineResult<FieldRecord> {
        let raw = self.check_tokens(file, tokens, extension, registry)?;
        let (group, weeks) = derive_group_and_weeks(registry, file, &raw.ptid, &raw.visit_id)?;
        build_record(file, raw, group, weeks)
    }

    /// Phase one: count check, normalization and per-position rules.
    pub fn check_tokens(
        &self,
        file: &str,
        mut tokens: Vec<String>,
        extension: &str,
        registry: &ParticipantRegistry,
    ) -> PipelineResult<RawFields> {
        let synthesized = self.normalize(&mut tokens);
        if tokens.len() != self.slots.len() {
            let given = tokens.len() + 1;
            return Err(PipelineError::TokenCount {
                file: file.to_string(),
                given,
                expected: self.field_count(),
                missing_or_extra: if given < self.field_count() {
                    "missing"
                } else {
                    "extra"
                },
                tokens,
            });
        }

        let mut raw = RawFields::default();
        for (slot, token) in self.slots.iter().zip(tokens) {
            slot.rule.check(&token, registry).map_err(|accepted| {
                PipelineError::field(file, slot.field.name(), &token, accepted)
            })?;
            raw.set(slot.field, token);
        }
        self.extension_rule
            .check(extension, registry)
            .map_err(|accepted| {
                PipelineError::field(file, Field::Extension.name(), extension, accepted)
            })?;
        raw.set(Field::Extension, extension.to_string());

        if self.category.has_sort_tokens() {
            check_tube_presence(file, &mut raw, synthesized)?;
        }
        Ok(raw)
    }

    /// Write a record back as filename tokens, extension last.
    pub fn tokens_for(&self, record: &FieldRecord) -> Vec<String> {
        let mut out = Vec::with_capacity(self.field_count());
        for slot in &self.slots {
            let token = match slot.field {
                Field::RunPurpose => Some(record.run_purpose.token().to_string()),
                Field::RunDate => Some(format_run_date(record.run_date, record.run_date_style)),
                Field::SortId => Some(record.sort_id.clone()),
                Field::Ptid => Some(record.ptid.clone()),
                Field::VisitId => Some(record.visit_id.clone()),
                Field::ProbeSet => Some(record.probe_set.clone()),
                Field::SampleType => Some(record.sample_type.as_str().to_string()),
                Field::SortSoftware => Some(record.sort_software.clone()),
                Field::FileType => Some(record.file_type.as_str().to_string()),
                Field::SampleTube => record.sample_tube.clone(),
                Field::SortPool => record.sort_pool.clone(),
                Field::Hashtag => record.hashtag.clone(),
                Field::FileSubset => Some(record.file_subset.clone()),
                Field::Extension => None,
            };
            out.extend(token);
        }
        out.push(record.extension.clone());
        out
    }

    pub fn file_name_for(&self, record: &FieldRecord) -> String {
        let mut tokens = self.tokens_for(record);
        let extension = tokens.pop().unwrap_or_default();
        let delimiter = TOKEN_DELIMITER.to_string();
        format!("{}.{extension}", tokens.join(delimiter.as_str()))
    }
}

/// Sort-run Presort/Control/Packing files carry no tube; every other sort
/// file must carry one.
fn check_tube_presence(file: &str, raw: &mut RawFields, synthesized: bool) -> PipelineResult<()> {
    let omits = FileType::parse(&raw.file_type).is_some_and(FileType::omits_tube);
    let tube = raw.sample_tube.take();
    match (omits, synthesized, tube) {
        (true, true, _) => Ok(()),
        (true, false, Some(tube)) => Err(PipelineError::field(
            file,
            Field::SampleTube.name(),
            tube,
            format!("no tube token for {} files", raw.file_type),
        )),
        (false, _, Some(tube)) if tube != TUBE_PLACEHOLDER => {
            raw.sample_tube = Some(tube);
            Ok(())
        }
        (_, _, tube) => Err(PipelineError::field(
            file,
            Field::SampleTube.name(),
            tube.unwrap_or_default(),
            "'T' followed by 1-99 without leading zero",
        )),
    }
}

/// Phase three: one immutable record from checked tokens and derived values.
fn build_record(file: &str, raw: RawFields, group: u32, weeks: i32) -> PipelineResult<FieldRecord> {
    let run_purpose = RunKind::from_token(&raw.run_purpose).ok_or_else(|| {
        PipelineError::field(file, Field::RunPurpose.name(), &raw.run_purpose, "Sort or Prescreen")
    })?;
    let (run_date, run_date_style) = parse_run_date(&raw.run_date).ok_or_else(|| {
        PipelineError::field(
            file,
            Field::RunDate.name(),
            &raw.run_date,
            "a YYMMDD or YYYYMMDD date",
        )
    })?;
    let sample_type = SampleType::parse(&raw.sample_type).ok_or_else(|| {
        PipelineError::field(file, Field::SampleType.name(), &raw.sample_type, "PBMC or LFNA")
    })?;
    let file_type = FileType::parse(&raw.file_type).ok_or_else(|| {
        PipelineError::field(
            file,
            Field::FileType.name(),
            &raw.file_type,
            "a known file type",
        )
    })?;
    Ok(FieldRecord {
        run_purpose,
        run_date,
        run_date_style,
        sort_id: raw.sort_id,
        ptid: raw.ptid,
        group,
        weeks,
        visit_id: raw.visit_id,
        probe_set: raw.probe_set,
        sample_type,
        sort_software: raw.sort_software,
        file_type,
        sample_tube: raw.sample_tube,
        sort_pool: raw.sort_pool,
        hashtag: raw.hashtag,
        file_subset: raw.file_subset,
        extension: raw.extension,
    })
}
