//! Directory-level vocabulary of the export tree.
//!
//! A leaf category is the combination of run kind, sample container and leaf
//! directory. Only the combinations listed in [`LeafCategory::all`] exist;
//! everything else is rejected when the category is constructed.

use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub enum RunKind {
    Prescreen,
    Sort,
}

impl RunKind {
    pub const ALL: [RunKind; 2] = [RunKind::Prescreen, RunKind::Sort];

    /// Name of the directory holding all runs of this kind.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Prescreen => "Prescreens",
            Self::Sort => "Sorts",
        }
    }

    /// Prefix of run container names and first filename token.
    pub fn token(self) -> &'static str {
        match self {
            Self::Prescreen => "Prescreen",
            Self::Sort => "Sort",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.dir_name() == name)
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.token() == token)
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum SampleContainer {
    Clinical,
    Control,
    Packing,
}

impl SampleContainer {
    pub const ALL: [SampleContainer; 3] = [
        SampleContainer::Clinical,
        SampleContainer::Control,
        SampleContainer::Packing,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Clinical => "ClinicalSamples",
            Self::Control => "ControlSamples",
            Self::Packing => "PackingSamples",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.dir_name() == name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum LeafDir {
    PopulationSummaries,
    FcsFiles,
    Screenshots,
    SortReports,
    PackingLists,
}

impl LeafDir {
    pub const ALL: [LeafDir; 5] = [
        LeafDir::PopulationSummaries,
        LeafDir::FcsFiles,
        LeafDir::Screenshots,
        LeafDir::SortReports,
        LeafDir::PackingLists,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::PopulationSummaries => "PopulationSummaries",
            Self::FcsFiles => "FCSFiles",
            Self::Screenshots => "Screenshots",
            Self::SortReports => "SortReports",
            Self::PackingLists => "PackingLists",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.dir_name() == name)
    }

    /// Accepted file extensions, lower case.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::PopulationSummaries => &["csv"],
            Self::FcsFiles => &["fcs"],
            Self::Screenshots => &["png", "jpg", "jpeg"],
            Self::SortReports => &["pdf"],
            Self::PackingLists => &["csv", "xlsx"],
        }
    }
}

/// Acquisition kind encoded in the `file_type` filename token.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub enum FileType {
    Sort,
    Presort,
    Control,
    Prescreen,
    Packing,
}

impl FileType {
    pub const ALL: [FileType; 5] = [
        FileType::Sort,
        FileType::Presort,
        FileType::Control,
        FileType::Prescreen,
        FileType::Packing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sort => "Sort",
            Self::Presort => "Presort",
            Self::Control => "Control",
            Self::Prescreen => "Prescreen",
            Self::Packing => "Packing",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == text)
    }

    /// Sort-run acquisitions of this kind are recorded without a tube token.
    pub fn omits_tube(self) -> bool {
        matches!(self, Self::Presort | Self::Control | Self::Packing)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct LeafCategory {
    run_kind: RunKind,
    container: SampleContainer,
    leaf_dir: LeafDir,
}

impl LeafCategory {
    pub fn new(run_kind: RunKind, container: SampleContainer, leaf_dir: LeafDir) -> Option<Self> {
        use LeafDir::*;
        use SampleContainer::*;
        let allowed = match (run_kind, container) {
            (RunKind::Sort, Clinical) | (RunKind::Sort, Control) => matches!(
                leaf_dir,
                PopulationSummaries | FcsFiles | Screenshots | SortReports
            ),
            (RunKind::Sort, Packing) => leaf_dir == PackingLists,
            (RunKind::Prescreen, Clinical) | (RunKind::Prescreen, Control) => {
                matches!(leaf_dir, PopulationSummaries | FcsFiles | Screenshots)
            }
            (RunKind::Prescreen, Packing) => false,
        };
        allowed.then_some(Self {
            run_kind,
            container,
            leaf_dir,
        })
    }

    /// Every category the grammar admits.
    pub fn all() -> Vec<Self> {
        let mut out = vec![];
        for run_kind in RunKind::ALL {
            for container in SampleContainer::ALL {
                for leaf_dir in LeafDir::ALL {
                    if let Some(category) = Self::new(run_kind, container, leaf_dir) {
                        out.push(category);
                    }
                }
            }
        }
        out
    }

    pub fn run_kind(&self) -> RunKind {
        self.run_kind
    }

    pub fn container(&self) -> SampleContainer {
        self.container
    }

    pub fn leaf_dir(&self) -> LeafDir {
        self.leaf_dir
    }

    pub fn file_types(&self) -> &'static [FileType] {
        match (self.run_kind, self.container) {
            (RunKind::Sort, SampleContainer::Clinical) => &[FileType::Sort, FileType::Presort],
            (RunKind::Sort, SampleContainer::Control) => &[FileType::Control],
            (RunKind::Sort, SampleContainer::Packing) => &[FileType::Packing],
            (RunKind::Prescreen, SampleContainer::Clinical) => &[FileType::Prescreen],
            (RunKind::Prescreen, SampleContainer::Control) => &[FileType::Control],
            (RunKind::Prescreen, SampleContainer::Packing) => &[],
        }
    }

    /// Sort runs carry tube, pool and hashtag tokens; prescreens carry none.
    pub fn has_sort_tokens(&self) -> bool {
        self.run_kind == RunKind::Sort
    }

    pub fn is_population_summary(&self) -> bool {
        self.leaf_dir == LeafDir::PopulationSummaries
    }

    pub fn label(&self) -> String {
        format!(
            "{}/{}/{}",
            self.run_kind.dir_name(),
            self.container.dir_name(),
            self.leaf_dir.dir_name()
        )
    }
}

impl fmt::Display for LeafCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
