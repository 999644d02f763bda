//! Validation and measurement pipeline for flow-cytometry sort exports of a
//! clinical trial.
//!
//! A run walks one trial export tree, decodes every leaf filename into a
//! [`field_record::FieldRecord`], extracts gate counts from the population
//! summary tables, sums split acquisitions, derives frequencies and joins the
//! result with a sequencing manifest.

pub mod aggregate;
pub mod category;
pub mod dates;
pub mod error;
pub mod extract;
pub mod field_record;
pub mod frequency;
pub mod gate_table;
pub mod gates;
pub mod measurement;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod scheme;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::{PipelineConfig, RunSummary, run};
