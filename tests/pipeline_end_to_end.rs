use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use sortflow::{PipelineConfig, PipelineError, run};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

const RUN_DIR: &str = "G002/Sorts/Sort_RunDate230412_UploadDate230415";

const ENROLLMENT: &str = r#"{"participants": [
  {"ptid": "G002-001", "group": 1},
  {"ptid": "G002-002", "group": 1},
  {"ptid": "G002-101", "group": 2}
]}"#;

const VISITS: &str = r#"{"groups": {
  "1": {"V091": -5, "V201": 8, "V301": 16},
  "2": {"V092": -4, "V202": 10}
}}"#;

const GATES: &str = r#"[
  {"gate": "P4", "phenotype": "CD19+ IgG+", "branch": "B cells", "easy_name": "igg_b_cells"},
  {"gate": "P5", "phenotype": "eOD+ KO-", "branch": "B cells", "easy_name": "epitope_specific"}
]"#;

const FREQUENCIES: &str = r#"[
  {"numerator_gate": "P5", "denominator_gate": "P4", "easy_name": "epitope_specific_of_igg"}
]"#;

const MANIFEST_HEADER: &str =
    "ptid,group,weeks,visit_id,probe_set,sample_type,sorted_date,pool_number,hashtag,airr_file";

fn write(base: &Path, rel: &str, text: &str) {
    let path = base.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn table(p4: u32, p5: u32) -> String {
    format!(
        "FlowJo table export\nKeywords: $FIL\n\nPopulation,Parent Name,#Events,%Parent\nLymphocytes,All Events,20000,40\nP4,Lymphocytes,{p4},5\nP5,P4,{p5},10\n"
    )
}

fn summary(file: &str, p4: u32, p5: u32) -> (String, String) {
    let container = if file.contains("_Control_") {
        "ControlSamples"
    } else {
        "ClinicalSamples"
    };
    (
        format!("{RUN_DIR}/{container}/PopulationSummaries/{file}"),
        table(p4, p5),
    )
}

/// A trial tree with one split acquisition, a second participant, a control
/// and a documentation file, plus every configuration input.
fn fixture(manifest_rows: &[&str]) -> (TempDir, PathBuf) {
    let td = tempdir().unwrap();
    let base = td.path();
    for (rel, text) in [
        summary("Sort_230412_A1B_G002-001_V091_eODGT8_PBMC_FlowJo_Sort_T1_P1_HT1_a.csv", 1000, 120),
        summary("Sort_230412_A1B_G002-001_V091_eODGT8_PBMC_FlowJo_Sort_T1_P1_HT1_b.csv", 200, 30),
        summary("Sort_230412_A1B_G002-101_V202_eODGT8_PBMC_FlowJo_Sort_T1_P2_HT3_a.csv", 500, 50),
        summary("Sort_230412_A1B_G002-002_V201_eODGT8_PBMC_FlowJo_Control_P1_HT2_a.csv", 100, 1),
    ] {
        write(base, &rel, &text);
    }
    write(base, "G002/README.md", "Upload notes");
    write(
        base,
        &format!(
            "{RUN_DIR}/ClinicalSamples/FCSFiles/Sort_230412_A1B_G002-001_V091_eODGT8_PBMC_DiVa_Sort_T1_P1_HT1_a.fcs"
        ),
        "FCS3.1",
    );

    write(base, "config/enrollment.json", ENROLLMENT);
    write(base, "config/visits.json", VISITS);
    write(base, "config/gates.json", GATES);
    write(base, "config/frequencies.json", FREQUENCIES);
    let mut manifest = MANIFEST_HEADER.to_string();
    for row in manifest_rows {
        manifest.push('\n');
        manifest.push_str(row);
    }
    write(base, "sequencing/manifest.csv", &manifest);
    write(
        base,
        "sortflow.json",
        r#"{
  "trial": {"name": "G002"},
  "inputs": {
    "root": "G002",
    "enrollment": "config/enrollment.json",
    "visits": "config/visits.json",
    "count_gates": "config/gates.json",
    "frequencies": "config/frequencies.json",
    "manifest": "sequencing/manifest.csv"
  },
  "extraction": {"threads": 2},
  "output": {"dir": "out"}
}"#,
    );
    let config_path = base.join("sortflow.json");
    (td, config_path)
}

fn read_csv(path: &Path) -> Vec<std::collections::HashMap<String, String>> {
    let mut rdr = csv::Reader::from_path(path).unwrap();
    let headers = rdr.headers().unwrap().clone();
    rdr.records()
        .map(|r| {
            let r = r.unwrap();
            headers
                .iter()
                .zip(r.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect()
        })
        .collect()
}

#[test]
fn split_files_are_summed_and_merged() {
    let (td, config_path) = fixture(&[
        "G002-001,1,-5,V091,eODGT8,PBMC,2023-04-12,1,HT1,C:\\airr\\s1.tsv",
    ]);
    let config = PipelineConfig::from_file(&config_path).unwrap();
    let summary = run(&config).unwrap();

    assert_eq!(summary.population_summaries, 4);
    assert_eq!(summary.skipped_documents, 1);
    assert_eq!(summary.split_samples, 2);
    assert_eq!(summary.merged_samples, Some(2));
    assert_eq!(summary.flow_without_sequencing, Some(1));
    assert_eq!(summary.tables_loaded, 4);

    let out = td.path().join("out");
    let long = read_csv(&out.join("measurements_long.csv"));
    assert_eq!(long.len(), 9);
    let p5 = long
        .iter()
        .find(|r| r["ptid"] == "G002-001" && r["gate"] == "P5")
        .unwrap();
    assert_eq!(p5["value"], "150.0");
    assert_eq!(p5["file_subsets"], "a;b");
    assert_eq!(p5["weeks"], "-5");
    assert_eq!(p5["group"], "1");

    let control = long
        .iter()
        .find(|r| r["file_type"] == "Control" && r["gate"] == "P5")
        .unwrap();
    assert_eq!(control["sample_tube"], "");
    assert_eq!(control["ptid"], "G002-002");

    let frequency_rows: Vec<_> = long
        .iter()
        .filter(|r| r["value_type"] == "frequency")
        .collect();
    assert_eq!(frequency_rows.len(), 3);
    assert!(frequency_rows.iter().all(|r| r["gate"] == "P5/P4"));
    let split_frequency = frequency_rows
        .iter()
        .find(|r| r["ptid"] == "G002-001")
        .unwrap();
    assert_eq!(split_frequency["value"], "0.125");
    assert_eq!(split_frequency["easy_name"], "epitope_specific_of_igg");
    assert_eq!(split_frequency["sort_pool"], "P1");
    assert_eq!(split_frequency["sort_id"], "");

    let parquet = fs::File::open(out.join("measurements_long.parquet")).unwrap();
    let rows: usize = ParquetRecordBatchReaderBuilder::try_new(parquet)
        .unwrap()
        .build()
        .unwrap()
        .map(|batch| batch.unwrap().num_rows())
        .sum();
    assert_eq!(rows, 9);

    let wide = read_csv(&out.join("frequencies_wide.csv"));
    assert_eq!(wide.len(), 3);
    let freq = wide
        .iter()
        .find(|r| r["ptid"] == "G002-001" && r["file_type"] == "Sort")
        .unwrap();
    assert_eq!(freq["epitope_specific_of_igg"], "0.125");
    assert_eq!(freq["sort_pools"], "P1");

    let merged = read_csv(&out.join("flow_sequencing_merged.csv"));
    assert_eq!(merged.len(), 2);
    let with_seq = merged.iter().find(|r| r["ptid"] == "G002-001").unwrap();
    assert_eq!(with_seq["airr_file"], "C:/airr/s1.tsv");
    assert_eq!(with_seq["epitope_specific"], "150");
    assert_eq!(with_seq["has_sequencing"], "true");
    let without = merged.iter().find(|r| r["ptid"] == "G002-101").unwrap();
    assert_eq!(without["airr_file"], "");
    assert_eq!(without["has_sequencing"], "false");

    assert!(out.join("run_summary.json").is_file());
}

#[test]
fn unknown_visit_lists_the_participants_group() {
    let (td, config_path) = fixture(&[]);
    write(
        td.path(),
        &format!(
            "{RUN_DIR}/ClinicalSamples/PopulationSummaries/Sort_230412_A1B_G002-001_V999_eODGT8_PBMC_FlowJo_Sort_T1_P1_HT1_a.csv"
        ),
        &table(1, 1),
    );
    let config = PipelineConfig::from_file(&config_path).unwrap();
    match run(&config) {
        Err(PipelineError::FieldValidation {
            field,
            given,
            accepted,
            ..
        }) => {
            assert_eq!(field, "visit_id");
            assert_eq!(given, "V999");
            assert!(accepted.contains("V091, V201, V301"));
            assert!(!accepted.contains("V092"));
        }
        other => panic!("expected a visit id error, got {other:?}"),
    }
}

#[test]
fn manifest_row_without_flow_sample_is_fatal() {
    let (_td, config_path) = fixture(&[
        "G002-001,1,-5,V091,eODGT8,PBMC,230412,P1,HT1,a.tsv",
        "G002-001,1,8,V201,eODGT8,PBMC,230412,P1,HT1,b.tsv",
    ]);
    let config = PipelineConfig::from_file(&config_path).unwrap();
    assert!(matches!(
        run(&config),
        Err(PipelineError::MissingIdentity { count: 1, .. })
    ));
}

#[test]
fn stray_file_aborts_the_run() {
    let (td, config_path) = fixture(&[]);
    write(td.path(), &format!("{RUN_DIR}/ClinicalSamples/notes.csv"), "x");
    let config = PipelineConfig::from_file(&config_path).unwrap();
    assert!(matches!(
        run(&config),
        Err(PipelineError::SchemeMismatch { .. })
    ));
}
