//! Population summary tables exported by the analysis software.
//!
//! A table starts with an arbitrary preamble. The header is the first line
//! whose first cell is `Population` (any case); everything above it is
//! skipped.

use crate::error::{PipelineError, PipelineResult};
use csv::{ReaderBuilder, Trim};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

pub const POPULATION_COLUMN: &str = "Population";
pub const PARENT_COLUMN: &str = "Parent Name";
pub const COUNT_COLUMNS: &[&str] = &["#Events", "# Events", "Events", "Count"];
const MISSING_CELLS: &[&str] = &["", "nan", "na", "n/a", "-"];

#[derive(Clone, Debug, PartialEq)]
pub struct GateRow {
    pub population: String,
    pub parent: Option<String>,
    pub count: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct GateTable {
    path: PathBuf,
    rows: Vec<GateRow>,
}

fn clean_cell(cell: &str) -> &str {
    cell.trim()
        .trim_start_matches('\u{feff}')
        .trim_matches('"')
        .trim()
}

/// Index of the header line, which is also the number of preamble lines to
/// skip when loading the table.
pub fn find_header_line(text: &str) -> Option<usize> {
    text.lines().position(|line| {
        let first = line.split(',').next().unwrap_or_default();
        clean_cell(first).eq_ignore_ascii_case("population")
    })
}

fn parse_count(path: &Path, population: &str, cell: &str) -> PipelineResult<Option<f64>> {
    let cell = clean_cell(cell);
    if MISSING_CELLS.iter().any(|m| m.eq_ignore_ascii_case(cell)) {
        return Ok(None);
    }
    cell.replace(',', "")
        .parse::<f64>()
        .map(Some)
        .map_err(|_| PipelineError::TableFormat {
            path: path.to_path_buf(),
            reason: format!("count '{cell}' of population '{population}' is not a number"),
        })
}

impl GateTable {
    pub fn from_text(path: &Path, text: &str, skip_rows: usize) -> PipelineResult<Self> {
        let offset: usize = text
            .split_inclusive('\n')
            .take(skip_rows)
            .map(str::len)
            .sum();
        let body = &text[offset.min(text.len())..];
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(body.as_bytes());

        let headers = rdr.headers()?.clone();
        let first = headers.get(0).map(clean_cell).unwrap_or_default();
        if !first.eq_ignore_ascii_case(POPULATION_COLUMN) {
            return Err(PipelineError::HeaderNotFound(path.to_path_buf()));
        }
        let parent_col = headers
            .iter()
            .position(|h| clean_cell(h).eq_ignore_ascii_case(PARENT_COLUMN));
        let count_col = headers
            .iter()
            .position(|h| {
                let h = clean_cell(h);
                COUNT_COLUMNS.iter().any(|c| c.eq_ignore_ascii_case(h))
            })
            .ok_or_else(|| PipelineError::TableFormat {
                path: path.to_path_buf(),
                reason: format!(
                    "no count column, expected one of {}",
                    COUNT_COLUMNS.join(", ")
                ),
            })?;

        let mut rows = vec![];
        for record in rdr.records() {
            let record = record?;
            let population = clean_cell(record.get(0).unwrap_or_default()).to_string();
            if population.is_empty() {
                continue;
            }
            let parent = parent_col
                .and_then(|i| record.get(i))
                .map(clean_cell)
                .filter(|p| !p.is_empty())
                .map(str::to_string);
            let count = parse_count(path, &population, record.get(count_col).unwrap_or_default())?;
            rows.push(GateRow {
                population,
                parent,
                count,
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            rows,
        })
    }

    pub fn load(path: &Path, skip_rows: usize) -> PipelineResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_text(path, &text, skip_rows)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> &[GateRow] {
        &self.rows
    }

    /// Find the single row for a population, optionally restricted to one
    /// parent.
    pub fn row(&self, population: &str, parent: Option<&str>) -> PipelineResult<&GateRow> {
        let matches: Vec<&GateRow> = self
            .rows
            .iter()
            .filter(|r| r.population == population)
            .filter(|r| parent.is_none() || r.parent.as_deref() == parent)
            .collect();
        match matches.as_slice() {
            [row] => Ok(row),
            [] => Err(PipelineError::GateNotFound {
                path: self.path.clone(),
                gate: match parent {
                    Some(parent) => format!("{population} (parent {parent})"),
                    None => population.to_string(),
                },
            }),
            many => Err(PipelineError::GateAmbiguous {
                path: self.path.clone(),
                gate: population.to_string(),
                count: many.len(),
            }),
        }
    }

    pub fn count(&self, gate: &str) -> PipelineResult<Option<f64>> {
        Ok(self.row(gate, None)?.count)
    }

    /// Numerator count over denominator count. A zero or missing denominator
    /// yields no value.
    pub fn frequency(
        &self,
        numerator: (&str, Option<&str>),
        denominator: (&str, Option<&str>),
    ) -> PipelineResult<Option<f64>> {
        let num = self.row(numerator.0, numerator.1)?.count;
        let den = self.row(denominator.0, denominator.1)?.count;
        Ok(ratio(num, den))
    }
}

/// Shared ratio policy: null numerator, null denominator or zero denominator
/// give `None`.
pub fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 => Some(n / d),
        _ => None,
    }
}

/// Memoized table reads for one pipeline run, keyed by (path, skip rows).
#[derive(Debug, Default)]
pub struct TableCache {
    header_lines: RwLock<HashMap<PathBuf, usize>>,
    tables: RwLock<HashMap<(PathBuf, usize), Arc<GateTable>>>,
    loads: AtomicUsize,
    hits: AtomicUsize,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header_line(&self, path: &Path) -> PipelineResult<usize> {
        if let Some(line) = self
            .header_lines
            .read()
            .ok()
            .and_then(|m| m.get(path).copied())
        {
            return Ok(line);
        }
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let line = find_header_line(&text)
            .ok_or_else(|| PipelineError::HeaderNotFound(path.to_path_buf()))?;
        if let Ok(mut m) = self.header_lines.write() {
            m.insert(path.to_path_buf(), line);
        }
        Ok(line)
    }

    pub fn table(&self, path: &Path, skip_rows: usize) -> PipelineResult<Arc<GateTable>> {
        let key = (path.to_path_buf(), skip_rows);
        if let Some(table) = self.tables.read().ok().and_then(|m| m.get(&key).cloned()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(table);
        }
        let table = Arc::new(GateTable::load(path, skip_rows)?);
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), skip_rows, rows = table.rows.len(), "loaded gate table");
        if let Ok(mut m) = self.tables.write() {
            // Another worker may have loaded the same table meanwhile; keep the first.
            return Ok(m.entry(key).or_insert(table).clone());
        }
        Ok(table)
    }

    /// Header discovery followed by a memoized load.
    pub fn table_for(&self, path: &Path) -> PipelineResult<Arc<GateTable>> {
        let skip_rows = self.header_line(path)?;
        self.table(path, skip_rows)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TABLE: &str = "FlowJo export\nExperiment: G002 sort\n,,\nPopulation,Parent Name,#Events,%Parent\nLymphocytes,All Events,5000,50\nP4,Lymphocytes,1000,20\nP5,P4,120,12\nP6,P4,,\n";

    #[test]
    fn test_header_discovery() {
        assert_eq!(find_header_line(TABLE), Some(3));
        assert_eq!(find_header_line("\"population\",x\n"), Some(0));
        assert_eq!(find_header_line("a,b\nc,d\n"), None);
    }

    #[test]
    fn test_count_and_frequency() {
        let table = GateTable::from_text(Path::new("t.csv"), TABLE, 3).unwrap();
        assert_eq!(table.rows().len(), 4);
        assert_eq!(table.count("P5").unwrap(), Some(120.0));
        assert_eq!(table.count("P6").unwrap(), None);
        let freq = table
            .frequency(("P5", Some("P4")), ("P4", Some("Lymphocytes")))
            .unwrap();
        assert_eq!(freq, Some(0.12));
    }

    #[test]
    fn test_missing_gate_is_fatal() {
        let table = GateTable::from_text(Path::new("t.csv"), TABLE, 3).unwrap();
        assert!(matches!(
            table.count("P9"),
            Err(PipelineError::GateNotFound { .. })
        ));
        assert!(matches!(
            table.frequency(("P5", Some("Lymphocytes")), ("P4", None)),
            Err(PipelineError::GateNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_population_is_ambiguous() {
        let text = "Population,Parent Name,#Events\nQ1,P4,10\nQ1,P7,20\n";
        let table = GateTable::from_text(Path::new("t.csv"), text, 0).unwrap();
        assert!(matches!(
            table.count("Q1"),
            Err(PipelineError::GateAmbiguous { count: 2, .. })
        ));
        assert_eq!(table.row("Q1", Some("P7")).unwrap().count, Some(20.0));
    }

    #[test]
    fn test_zero_denominator_is_null() {
        assert_eq!(ratio(Some(3.0), Some(0.0)), None);
        assert_eq!(ratio(None, Some(2.0)), None);
        assert_eq!(ratio(Some(3.0), Some(2.0)), Some(1.5));
    }

    #[test]
    fn test_cache_memoizes_by_path_and_skip() {
        let td = tempdir().unwrap();
        let path = td.path().join("summary.csv");
        fs::write(&path, TABLE).unwrap();
        let cache = TableCache::new();
        let a = cache.table_for(&path).unwrap();
        let b = cache.table_for(&path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.loads(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_header_not_found() {
        let td = tempdir().unwrap();
        let path = td.path().join("broken.csv");
        fs::write(&path, "just,a,preamble\n").unwrap();
        let cache = TableCache::new();
        assert!(matches!(
            cache.table_for(&path),
            Err(PipelineError::HeaderNotFound(_))
        ));
    }
}
