use std::path::{Path, PathBuf};

use mcf_core::Identity;
use mcf_sync::{reconcile, ReconcileConfig, ReconcilePipeline, SortOrder};
use serde_json::Value;

fn corpus_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample-corpus")
}

fn sample_config(output_dir: &Path) -> ReconcileConfig {
    let root = corpus_root();
    ReconcileConfig {
        master_dirs: vec![root.join("master")],
        compare_dirs: vec![root.join("compare")],
        output_dir: output_dir.to_path_buf(),
        ..ReconcileConfig::default()
    }
}

fn snapshot() -> Value {
    let path = corpus_root().join("snapshot.json");
    serde_json::from_str(&std::fs::read_to_string(&path).expect("read snapshot")).expect("parse snapshot")
}

#[test]
fn sample_corpus_matches_snapshot() {
    let out = tempfile::tempdir().expect("tempdir");
    let outcome = reconcile(&sample_config(out.path())).expect("reconcile");
    let expected = snapshot();

    let expected_missing: Vec<Identity> =
        serde_json::from_value(expected["missing"].clone()).expect("missing list");
    assert_eq!(outcome.missing, expected_missing);

    let stats = &expected["stats"];
    assert_eq!(outcome.stats.total_master as u64, stats["total_master"]);
    assert_eq!(outcome.stats.unique_master as u64, stats["unique_master"]);
    assert_eq!(outcome.stats.total_compare as u64, stats["total_compare"]);
    assert_eq!(outcome.stats.unique_compare as u64, stats["unique_compare"]);
    assert_eq!(outcome.stats.filtered_compare as u64, stats["filtered_compare"]);
    assert_eq!(outcome.stats.missing as u64, stats["missing"]);
    assert_eq!(outcome.stats.processed_files, 5);
    assert_eq!(outcome.stats.failed_files, 0);

    let neha = outcome
        .duplicates
        .compare_phone
        .iter()
        .find(|e| e.key == "9000011111")
        .expect("neha frequency");
    assert_eq!(neha.count, 2);
    assert_eq!(outcome.duplicates.missing_name[0].key, "ankit");
    assert_eq!(outcome.duplicates.missing_name[0].count, 2);
}

#[test]
fn sample_corpus_phone_order_without_renaming() {
    let out = tempfile::tempdir().expect("tempdir");
    let config = ReconcileConfig {
        sort: SortOrder::Phone,
        unique_names: false,
        ..sample_config(out.path())
    };
    let outcome = reconcile(&config).expect("reconcile");
    let phones: Vec<&str> = outcome.missing.iter().map(|i| i.phone.as_str()).collect();
    assert_eq!(
        phones,
        vec![
            "7000000002",
            "7000000003",
            "7011223344",
            "8888812345",
            "9000011111",
            "9811122233",
            "+14155550100",
        ]
    );
    assert!(outcome.missing.iter().all(|i| !i.name.ends_with(')')));
}

#[tokio::test]
async fn sample_corpus_run_writes_a_complete_run_directory() {
    let out = tempfile::tempdir().expect("tempdir");
    let summary = ReconcilePipeline::new(sample_config(out.path()))
        .run_once()
        .await
        .expect("run");

    let run_dir = PathBuf::from(&summary.run_dir);
    let vcf = std::fs::read_to_string(run_dir.join("missing.vcf")).expect("vcf");
    assert_eq!(vcf.matches("BEGIN:VCARD").count(), 7);
    assert!(vcf.contains("FN:Ankit (1)\r\n"));

    let duplicates = std::fs::read_to_string(run_dir.join("duplicates.md")).expect("md");
    assert!(duplicates.contains("- 9000011111: 2"));
    assert!(duplicates.contains("- ankit: 2"));

    let summary_json: Value = serde_json::from_str(
        &std::fs::read_to_string(run_dir.join("run_summary.json")).expect("summary"),
    )
    .expect("parse summary");
    assert_eq!(summary_json["status"], "completed");
    assert_eq!(summary_json["stats"]["missing"], 7);
}
