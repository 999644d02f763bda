use std::path::PathBuf;
use thiserror::Error;

/// Every failure the pipeline can raise. All of them abort the run; the only
/// recoverable condition (a flow sample without sequencing data) is reported
/// as a warning by the merger and never becomes an error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("path '{path}' does not match the directory grammar: {reason}")]
    SchemeMismatch { path: PathBuf, reason: String },

    #[error("'{file}' has {given} name parts, expected {expected} ({missing_or_extra} parts); tokens: {tokens:?}")]
    TokenCount {
        file: String,
        given: usize,
        expected: usize,
        missing_or_extra: &'static str,
        tokens: Vec<String>,
    },

    #[error("'{file}': invalid {field} '{given}', accepted: {accepted}")]
    FieldValidation {
        file: String,
        field: &'static str,
        given: String,
        accepted: String,
    },

    #[error("inconsistent aggregation for {key}: {details}")]
    AggregationInconsistency { key: String, details: String },

    #[error("no header row starting with 'Population' found in '{0}'")]
    HeaderNotFound(PathBuf),

    #[error("gate table '{path}' is malformed: {reason}")]
    TableFormat { path: PathBuf, reason: String },

    #[error("gate '{gate}' not found in '{path}'")]
    GateNotFound { path: PathBuf, gate: String },

    #[error("gate '{gate}' appears {count} times in '{path}'; qualify it with a parent")]
    GateAmbiguous {
        path: PathBuf,
        gate: String,
        count: usize,
    },

    #[error("{count} sequencing manifest identities have no flow data: {identities:?}")]
    MissingIdentity {
        count: usize,
        identities: Vec<String>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn field(
        file: impl Into<String>,
        field: &'static str,
        given: impl Into<String>,
        accepted: impl Into<String>,
    ) -> Self {
        PipelineError::FieldValidation {
            file: file.into(),
            field,
            given: given.into(),
            accepted: accepted.into(),
        }
    }
}

impl From<walkdir::Error> for PipelineError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
        let source = err
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("directory walk loop detected"));
        PipelineError::Io { path, source }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
