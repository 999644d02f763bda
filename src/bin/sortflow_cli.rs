use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use sortflow::gate_table::TableCache;
use sortflow::pipeline::{self, PipelineConfig, VERSION};
use sortflow::registry::ParticipantRegistry;
use sortflow::scheme::SchemeValidator;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "sortflow.json";

fn usage() {
    eprintln!(
        "Usage:\n  \
  sortflow_cli --version\n  \
  sortflow_cli [--config PATH] run [--root DIR] [--output DIR]\n  \
  sortflow_cli [--config PATH] validate [--root DIR]\n  \
  sortflow_cli table PATH\n\n  \
  Log verbosity follows RUST_LOG, e.g. RUST_LOG=sortflow=debug"
    );
}

#[derive(Serialize)]
struct ValidationSummary {
    root: PathBuf,
    leaves_by_category: BTreeMap<String, usize>,
    population_summaries: Vec<PathBuf>,
    skipped_documents: Vec<PathBuf>,
}

#[derive(Serialize)]
struct TableSummary<'a> {
    path: &'a Path,
    header_line: usize,
    rows: Vec<TableRow<'a>>,
}

#[derive(Serialize)]
struct TableRow<'a> {
    population: &'a str,
    parent: Option<&'a str>,
    count: Option<f64>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn parse_global_config_arg(args: &[String]) -> (String, usize) {
    if args.len() >= 3 && args[1] == "--config" {
        return (args[2].clone(), 3);
    }
    (DEFAULT_CONFIG_PATH.to_string(), 1)
}

/// Apply `--root` and `--output` overrides that follow the command.
fn apply_overrides(config: &mut PipelineConfig, args: &[String]) -> Result<()> {
    let mut rest = args.iter();
    while let Some(flag) = rest.next() {
        let value = rest
            .next()
            .ok_or_else(|| anyhow!("missing value for {flag}"))?;
        match flag.as_str() {
            "--root" => config.root = PathBuf::from(value),
            "--output" => config.output_dir = PathBuf::from(value),
            other => bail!("unknown option '{other}'"),
        }
    }
    Ok(())
}

fn load_config(path: &str, overrides: &[String]) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_file(Path::new(path))
        .with_context(|| format!("could not load config '{path}'"))?;
    apply_overrides(&mut config, overrides)?;
    Ok(config)
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sortflow=info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        bail!("missing command");
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("sortflow {VERSION}");
        return Ok(());
    }

    let (config_path, cmd_idx) = parse_global_config_arg(&args);
    if args.len() <= cmd_idx {
        usage();
        bail!("missing command");
    }
    let command = &args[cmd_idx];
    let rest = &args[cmd_idx + 1..];

    match command.as_str() {
        "run" => {
            let config = load_config(&config_path, rest)?;
            let summary = pipeline::run(&config)?;
            print_json(&summary)
        }
        "validate" => {
            let config = load_config(&config_path, rest)?;
            let registry =
                ParticipantRegistry::from_json_files(&config.enrollment, &config.visits)?;
            let report = SchemeValidator::new(
                &config.root,
                &config.trial_name,
                &config.probe_sets,
                &registry,
            )
            .validate()?;
            print_json(&ValidationSummary {
                root: config.root.clone(),
                leaves_by_category: report.leaves_by_category,
                population_summaries: report
                    .population_summaries
                    .into_iter()
                    .map(|f| f.path)
                    .collect(),
                skipped_documents: report.skipped_documents,
            })
        }
        "table" => {
            let Some(path) = rest.first() else {
                usage();
                bail!("missing path for table");
            };
            let path = Path::new(path);
            let cache = TableCache::new();
            let header_line = cache.header_line(path)?;
            let table = cache.table(path, header_line)?;
            print_json(&TableSummary {
                path,
                header_line,
                rows: table
                    .rows()
                    .iter()
                    .map(|r| TableRow {
                        population: &r.population,
                        parent: r.parent.as_deref(),
                        count: r.count,
                    })
                    .collect(),
            })
        }
        other => {
            usage();
            bail!("unknown command '{other}'")
        }
    }
}
