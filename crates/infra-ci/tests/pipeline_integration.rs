//! Integration tests for the matrix pipeline with MemoryEngine.

use infra_ci::fakes::{EngineCall, MemoryEngine};
use infra_ci::{ClangBuild, EntryStage, MatrixPipeline, MatrixReport, PipelineOptions, SourceBuilder};
use infra_core::{
    BuildSpec, CompilerKind, InfraError, Matrix, PublishConfig, RecipeOptions, TriggerContext,
    TriggerEvent,
};
use std::path::PathBuf;
use std::sync::Arc;

fn publish_config() -> PublishConfig {
    PublishConfig::new("ghcr.io", "org", "infra-containers-devcontainer")
}

fn pipeline(engine: Arc<MemoryEngine>, options: PipelineOptions) -> MatrixPipeline {
    MatrixPipeline::new(engine, publish_config(), RecipeOptions::default(), options)
}

async fn run_builtin(engine: Arc<MemoryEngine>, trigger: TriggerContext) -> MatrixReport {
    let matrix = Matrix::builtin();
    let specs: Vec<BuildSpec> = matrix.for_trigger(trigger.event).cloned().collect();
    pipeline(engine, PipelineOptions::default())
        .run(specs, &trigger, &matrix.digest())
        .await
}

/// Test: a main-branch push builds and publishes every declared tag
#[tokio::test]
async fn test_main_push_publishes_production_tags() {
    let engine = Arc::new(MemoryEngine::new());
    let report = run_builtin(engine.clone(), TriggerContext::main(TriggerEvent::Push)).await;

    assert!(report.success, "Matrix should succeed");
    assert_eq!(report.entries.len(), 4, "p2996 does not run on push");
    assert_eq!(report.passed_count(), 4);

    let pushed = engine.pushed();
    assert_eq!(pushed.len(), 6);
    assert!(pushed.contains(&"ghcr.io/org/infra-containers-devcontainer-gcc:14".to_string()));
    assert!(pushed.contains(&"ghcr.io/org/infra-containers-devcontainer-gcc:latest".to_string()));
    assert!(pushed.contains(&"ghcr.io/org/infra-containers-devcontainer-clang:latest".to_string()));
    assert!(!pushed.iter().any(|r| r.contains("staging")));
}

/// Test: a pull request publishes one staging tag per entry
#[tokio::test]
async fn test_pull_request_publishes_staging_tags_only() {
    let engine = Arc::new(MemoryEngine::new());
    let report = run_builtin(engine.clone(), TriggerContext::pull_request("42")).await;

    assert!(report.success);
    assert_eq!(report.entries.len(), 5);
    for entry in &report.entries {
        assert_eq!(entry.pushed.len(), 1);
        assert_eq!(entry.stage, EntryStage::Done);
    }

    let pushed = engine.pushed();
    assert!(pushed.contains(&"ghcr.io/org/infra-containers-devcontainer-staging:gcc-14-42".to_string()));
    assert!(pushed
        .contains(&"ghcr.io/org/infra-containers-devcontainer-staging:clang-p2996-trunk-42".to_string()));
    assert!(pushed.iter().all(|r| r.contains("-staging:")));
}

/// Test: one failing build leaves its siblings untouched
#[tokio::test]
async fn test_failed_entry_is_isolated() {
    let engine = Arc::new(MemoryEngine::new().fail_build("clang:19"));
    let report = run_builtin(engine.clone(), TriggerContext::main(TriggerEvent::Push)).await;

    assert!(!report.success);
    assert_eq!(report.failed_count(), 1);
    assert_eq!(report.passed_count(), 3);

    let failed = report.entries.iter().find(|e| !e.passed()).unwrap();
    assert_eq!(failed.spec.label(), "clang-19");
    assert_eq!(failed.stage, EntryStage::Build);
    assert!(failed.pushed.is_empty());
    assert!(failed.error.as_deref().unwrap().contains("failed to solve"));

    assert!(!engine
        .pushed()
        .iter()
        .any(|r| r.ends_with("-clang:19")));
}

/// Test: a failed push fails only that entry
#[tokio::test]
async fn test_publish_failure_is_isolated() {
    let engine = Arc::new(
        MemoryEngine::new().fail_push("ghcr.io/org/infra-containers-devcontainer-gcc:13"),
    );
    let report = run_builtin(engine.clone(), TriggerContext::main(TriggerEvent::Push)).await;

    assert_eq!(report.failed_count(), 1);
    let failed = report.entries.iter().find(|e| !e.passed()).unwrap();
    assert_eq!(failed.stage, EntryStage::Publish);
    // the image stays built
    assert!(engine
        .built()
        .iter()
        .any(|b| b.tags == vec!["localhost/infra-containers/gcc:13".to_string()]));
}

/// Test: references pushed before a failing push stay in the outcome
#[tokio::test]
async fn test_partial_publish_is_reported() {
    let engine = Arc::new(
        MemoryEngine::new().fail_push("ghcr.io/org/infra-containers-devcontainer-gcc:latest"),
    );
    let outcome = pipeline(engine.clone(), PipelineOptions::default())
        .run_entry(
            BuildSpec::new(CompilerKind::Gcc, "14", &["14", "latest"]),
            &TriggerContext::main(TriggerEvent::Push),
        )
        .await;

    assert!(!outcome.passed());
    assert_eq!(outcome.stage, EntryStage::Publish);
    assert_eq!(
        outcome.pushed,
        vec!["ghcr.io/org/infra-containers-devcontainer-gcc:14".to_string()]
    );
    assert_eq!(engine.pushed(), outcome.pushed);
}

/// Test: the p2996 Containerfile registers its repository before installing
#[tokio::test]
async fn test_p2996_containerfile_adds_repository_first() {
    let engine = Arc::new(MemoryEngine::new());
    let spec = BuildSpec::new(CompilerKind::ClangP2996, "trunk", &["trunk"]);
    let outcome = pipeline(engine.clone(), PipelineOptions::default())
        .run_entry(spec, &TriggerContext::main(TriggerEvent::Schedule))
        .await;
    assert!(outcome.passed(), "entry failed: {:?}", outcome.error);

    let built = engine.built();
    let containerfile = &built[0].containerfile;
    let add = containerfile.find("eselect repository add clang-p2996").unwrap();
    let install = containerfile.find("emerge").unwrap();
    assert!(add < install);
}

/// Test: --no-push builds without touching the registry
#[tokio::test]
async fn test_no_push_skips_publish() {
    let engine = Arc::new(MemoryEngine::new());
    let options = PipelineOptions {
        push: false,
        jobs: 1,
        ..PipelineOptions::default()
    };
    let matrix = Matrix::builtin();
    let trigger = TriggerContext::main(TriggerEvent::Push);
    let report = pipeline(engine.clone(), options)
        .run(matrix.for_trigger(trigger.event).cloned(), &trigger, &matrix.digest())
        .await;

    assert!(report.success);
    assert!(engine.pushed().is_empty());
    assert_eq!(engine.built().len(), 4);
    assert!(report.entries.iter().all(|e| !e.references.is_empty()));
}

/// Test: a configuration error stops the entry before any build
#[tokio::test]
async fn test_missing_change_id_fails_before_build() {
    let engine = Arc::new(MemoryEngine::new());
    let trigger = TriggerContext {
        event: TriggerEvent::WorkflowDispatch,
        is_main_branch: false,
        change_id: None,
    };
    let outcome = pipeline(engine.clone(), PipelineOptions::default())
        .run_entry(BuildSpec::new(CompilerKind::Gcc, "14", &["14"]), &trigger)
        .await;

    assert_eq!(outcome.stage, EntryStage::Resolve);
    assert!(!outcome.passed());
    assert!(engine.built().is_empty());
}

/// Test: the report round-trips through its JSON file
#[tokio::test]
async fn test_report_written_as_json() {
    let engine = Arc::new(MemoryEngine::new());
    let report = run_builtin(engine, TriggerContext::pull_request("7")).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    report.write_json(&path).unwrap();

    let loaded: MatrixReport =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(loaded.run_id, report.run_id);
    assert_eq!(loaded.entries.len(), report.entries.len());
    assert_eq!(loaded.matrix_digest, Matrix::builtin().digest());
}

/// Test: the devcontainer needs its Clang base image
#[tokio::test]
async fn test_devcontainer_requires_base_image() {
    let engine = Arc::new(MemoryEngine::new());
    let builder = SourceBuilder::new(engine.clone(), PathBuf::from("."));

    let err = builder.build_devcontainer(21, "").await.unwrap_err();
    assert!(matches!(err, InfraError::Configuration(_)));
    assert!(err.to_string().contains("clang-ubuntu:21"));
    assert!(engine.built().is_empty());
}

/// Test: build_all builds Clang then the devcontainer on top of it
#[tokio::test]
async fn test_build_all_chains_images() {
    let engine = Arc::new(MemoryEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let builder = SourceBuilder::new(engine.clone(), dir.path().to_path_buf());

    let tags = builder.build_all(&ClangBuild::new(21)).await.unwrap();
    assert_eq!(
        tags,
        vec!["clang-ubuntu:21".to_string(), "devcontainer-clang:21".to_string()]
    );

    let built = engine.built();
    assert_eq!(built[0].build_args["LLVM_GIT_REF"], "llvmorg-21.1.2");
    assert_eq!(built[0].build_args["NUM_JOBS"], "4");
    assert_eq!(built[1].build_args["CLANG_BASE_IMAGE"], "clang-ubuntu:21");
}

/// Test: a failed Clang build stops build_all
#[tokio::test]
async fn test_build_all_stops_on_clang_failure() {
    let engine = Arc::new(MemoryEngine::new().fail_build("clang-ubuntu"));
    let builder = SourceBuilder::new(engine.clone(), PathBuf::from("."));

    assert!(builder.build_all(&ClangBuild::new(20)).await.is_err());
    assert!(!engine
        .calls()
        .iter()
        .any(|c| matches!(c, EngineCall::ImageExists(_))));
}
