//! Directory grammar of a trial export tree.
//!
//! ```text
//! <Trial>/{Prescreens|Sorts}/<RunContainer>/{ClinicalSamples|ControlSamples|PackingSamples}/<LeafDir>/<file>.<ext>
//! ```
//!
//! Every path below the root is classified into one [`PathClass`]. A path with
//! no class aborts the run unless it is a documentation file.

use crate::category::{LeafCategory, LeafDir, RunKind, SampleContainer};
use crate::dates::parse_run_date;
use crate::error::{PipelineError, PipelineResult};
use crate::field_record::{FieldRecord, LeafSchema};
use crate::registry::ParticipantRegistry;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const DOCUMENTATION_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "md", "txt"];

lazy_static! {
    static ref RUN_CONTAINER_RE: Regex =
        Regex::new(r"^(Sort|Prescreen)_RunDate(\d{6})_UploadDate(\d{6})$")
            .expect("run container regex");
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunContainer {
    pub run_kind: RunKind,
    pub run_date: NaiveDate,
    pub upload_date: NaiveDate,
}

impl RunContainer {
    /// Parse a run container directory name under a run-kind directory.
    pub fn parse(name: &str, expected: RunKind) -> Result<Self, String> {
        let accepted = format!("{}_RunDate<YYMMDD>_UploadDate<YYMMDD>", expected.token());
        let caps = RUN_CONTAINER_RE
            .captures(name)
            .ok_or_else(|| format!("run container '{name}' is not {accepted}"))?;
        let run_kind = RunKind::from_token(&caps[1])
            .filter(|k| *k == expected)
            .ok_or_else(|| format!("run container '{name}' is not {accepted}"))?;
        let date = |i: usize| {
            parse_run_date(&caps[i])
                .map(|(d, _)| d)
                .ok_or_else(|| format!("run container '{name}' has invalid date '{}'", &caps[i]))
        };
        let run_date = date(2)?;
        let upload_date = date(3)?;
        if upload_date < run_date {
            return Err(format!(
                "run container '{name}' was uploaded before it was run"
            ));
        }
        Ok(Self {
            run_kind,
            run_date,
            upload_date,
        })
    }
}

/// Grammar position of one path.
#[derive(Clone, Debug, PartialEq)]
pub enum PathClass {
    TrialRoot,
    RunKindDir(RunKind),
    RunContainer(RunContainer),
    SampleContainer {
        run: RunContainer,
        container: SampleContainer,
    },
    LeafDir(LeafCategory),
    Leaf {
        run: RunContainer,
        category: LeafCategory,
        file_name: String,
    },
}

/// Classify a tuple of path segments starting at the trial directory.
pub fn classify(segments: &[&str], is_dir: bool, trial_name: &str) -> Result<PathClass, String> {
    let run_kind = |name: &str| {
        RunKind::from_dir_name(name).ok_or_else(|| {
            format!(
                "'{name}' is not {} or {}",
                RunKind::Prescreen.dir_name(),
                RunKind::Sort.dir_name()
            )
        })
    };
    let container = |name: &str| {
        SampleContainer::from_dir_name(name).ok_or_else(|| {
            let names: Vec<&str> = SampleContainer::ALL.iter().map(|c| c.dir_name()).collect();
            format!("'{name}' is not one of {}", names.join(", "))
        })
    };
    let category = |kind: RunKind, container: SampleContainer, leaf: &str| {
        let leaf_dir = LeafDir::from_dir_name(leaf)
            .ok_or_else(|| format!("'{leaf}' is not a known leaf directory"))?;
        LeafCategory::new(kind, container, leaf_dir).ok_or_else(|| {
            format!(
                "'{leaf}' is not allowed under {}/{}",
                kind.dir_name(),
                container.dir_name()
            )
        })
    };

    if let Some(trial) = segments.first() {
        if *trial != trial_name {
            return Err(format!("trial directory '{trial}' is not '{trial_name}'"));
        }
    }

    match (segments, is_dir) {
        ([_], true) => Ok(PathClass::TrialRoot),
        ([_, kind], true) => Ok(PathClass::RunKindDir(run_kind(kind)?)),
        ([_, kind, run], true) => Ok(PathClass::RunContainer(RunContainer::parse(
            run,
            run_kind(kind)?,
        )?)),
        ([_, kind, run, sample], true) => {
            let kind = run_kind(kind)?;
            let run = RunContainer::parse(run, kind)?;
            let container = container(sample)?;
            if LeafCategory::all()
                .iter()
                .all(|c| c.run_kind() != kind || c.container() != container)
            {
                return Err(format!(
                    "'{sample}' is not allowed under {}",
                    kind.dir_name()
                ));
            }
            Ok(PathClass::SampleContainer { run, container })
        }
        ([_, kind, run, sample, leaf], true) => {
            let kind = run_kind(kind)?;
            RunContainer::parse(run, kind)?;
            Ok(PathClass::LeafDir(category(kind, container(sample)?, leaf)?))
        }
        ([_, kind, run, sample, leaf, file], false) => {
            let kind = run_kind(kind)?;
            let run = RunContainer::parse(run, kind)?;
            Ok(PathClass::Leaf {
                run,
                category: category(kind, container(sample)?, leaf)?,
                file_name: file.to_string(),
            })
        }
        (_, true) => Err(format!("unexpected directory at depth {}", segments.len())),
        (_, false) => Err(format!("unexpected file at depth {}", segments.len())),
    }
}

fn is_documentation(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            DOCUMENTATION_EXTENSIONS
                .iter()
                .any(|d| d.eq_ignore_ascii_case(ext))
        })
}

fn accepts_extension(category: LeafCategory, path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            category
                .leaf_dir()
                .extensions()
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext))
        })
}

/// A validated population summary leaf and its table path.
#[derive(Clone, Debug, PartialEq)]
pub struct PopulationSortFile {
    pub record: FieldRecord,
    pub path: PathBuf,
    pub category: LeafCategory,
}

#[derive(Clone, Debug, Default)]
pub struct SchemeReport {
    pub population_summaries: Vec<PopulationSortFile>,
    /// Validated leaves per category label, population summaries included.
    pub leaves_by_category: BTreeMap<String, usize>,
    pub skipped_documents: Vec<PathBuf>,
    pub directories: usize,
}

impl SchemeReport {
    pub fn leaf_count(&self) -> usize {
        self.leaves_by_category.values().sum()
    }
}

pub struct SchemeValidator<'a> {
    root: PathBuf,
    trial_name: String,
    registry: &'a ParticipantRegistry,
    schemas: HashMap<LeafCategory, LeafSchema>,
}

impl<'a> SchemeValidator<'a> {
    pub fn new(
        root: impl Into<PathBuf>,
        trial_name: &str,
        probe_sets: &[String],
        registry: &'a ParticipantRegistry,
    ) -> Self {
        let schemas = LeafCategory::all()
            .into_iter()
            .map(|c| (c, LeafSchema::for_category(c, probe_sets)))
            .collect();
        Self {
            root: root.into(),
            trial_name: trial_name.to_string(),
            registry,
            schemas,
        }
    }

    /// Walk the whole tree; the first violation aborts.
    pub fn validate(&self) -> PipelineResult<SchemeReport> {
        if !self.root.is_dir() {
            return Err(PipelineError::SchemeMismatch {
                path: self.root.clone(),
                reason: "root is not a directory".to_string(),
            });
        }
        let base = self.root.parent().unwrap_or_else(|| Path::new(""));
        let mut report = SchemeReport::default();

        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry?;
            let path = entry.path();
            let is_dir = entry.file_type().is_dir();
            let segments = path_segments(base, path)?;

            match classify(&segments, is_dir, &self.trial_name) {
                Ok(PathClass::Leaf { category, .. })
                    if is_documentation(path) && !accepts_extension(category, path) =>
                {
                    debug!(path = %path.display(), "skipping documentation file");
                    report.skipped_documents.push(path.to_path_buf());
                }
                Ok(PathClass::Leaf {
                    run,
                    category,
                    file_name,
                }) => {
                    let record = self.validate_leaf(&run, category, &file_name)?;
                    debug!(path = %path.display(), category = %category, "validated leaf");
                    *report
                        .leaves_by_category
                        .entry(category.label())
                        .or_insert(0) += 1;
                    if category.is_population_summary() {
                        report.population_summaries.push(PopulationSortFile {
                            record,
                            path: path.to_path_buf(),
                            category,
                        });
                    }
                }
                Ok(_) => report.directories += 1,
                Err(_) if !is_dir && is_documentation(path) => {
                    debug!(path = %path.display(), "skipping documentation file");
                    report.skipped_documents.push(path.to_path_buf());
                }
                Err(reason) => {
                    return Err(PipelineError::SchemeMismatch {
                        path: path.to_path_buf(),
                        reason,
                    });
                }
            }
        }

        info!(
            root = %self.root.display(),
            leaves = report.leaf_count(),
            population_summaries = report.population_summaries.len(),
            skipped_documents = report.skipped_documents.len(),
            "directory scheme validated"
        );
        Ok(report)
    }

    fn validate_leaf(
        &self,
        run: &RunContainer,
        category: LeafCategory,
        file_name: &str,
    ) -> PipelineResult<FieldRecord> {
        let schema = self.schemas.get(&category).ok_or_else(|| {
            PipelineError::Config(format!("no filename schema for {category}"))
        })?;
        let record = schema.parse_file_name(file_name, self.registry)?;
        if record.run_date() != run.run_date {
            return Err(PipelineError::field(
                file_name,
                "run_date",
                record.run_date().format("%y%m%d").to_string(),
                format!(
                    "the run container date {}",
                    run.run_date.format("%y%m%d")
                ),
            ));
        }
        Ok(record)
    }
}

fn path_segments<'p>(base: &Path, path: &'p Path) -> PipelineResult<Vec<&'p str>> {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .map(|c| {
            c.as_os_str().to_str().ok_or_else(|| PipelineError::SchemeMismatch {
                path: path.to_path_buf(),
                reason: "path is not valid UTF-8".to_string(),
            })
        })
        .collect()
}
