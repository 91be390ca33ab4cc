use milvus_stack::lifecycle::{self, StackError};
use milvus_stack::stack::milvus_standalone;
use service_orchestrator::mock::MockRuntime;
use service_orchestrator::{
    FailureKind, OrchestratorSettings, RunPhase, RunResult, ServiceId, ServiceState,
};
use std::io::Write;
use std::time::Duration;
use tokio::time;

/// Stack runs to completion against the mock runtime and Milvus receives
/// both dependencies' endpoints and MinIO's credentials.
#[tokio::test(start_paused = true)]
async fn test_stack_up_propagates_endpoints_and_credentials() {
    let runtime = MockRuntime::new();
    for id in ["etcd", "minio", "milvus"] {
        runtime.expect_service(id);
    }

    let summary = lifecycle::up(
        runtime.clone(),
        OrchestratorSettings::default(),
        milvus_standalone(),
        time::sleep(Duration::from_secs(120)),
        Duration::from_secs(30),
    )
    .await
    .expect("stack should prepare");

    assert_eq!(summary.result, RunResult::Success);
    assert_eq!(summary.status.phase, RunPhase::Stopped);

    let config = runtime.config_for("milvus").expect("milvus was started");
    assert_eq!(config.get("ETCD_ENDPOINTS"), Some("127.0.0.1:2379"));
    assert_eq!(config.get("MINIO_ADDRESS"), Some("127.0.0.1:9000"));
    assert_eq!(config.get("MINIO_ACCESS_KEY_ID"), Some("minioadmin"));
    assert_eq!(config.get("MINIO_SECRET_ACCESS_KEY"), Some("minioadmin"));

    let stops = runtime.stop_order();
    assert_eq!(stops.first(), Some(&ServiceId::from("milvus")));
    assert_eq!(stops.len(), 3);
    runtime.verify();
}

/// MinIO never becomes healthy: Milvus is never launched and the run
/// reports MinIO alone.
#[tokio::test(start_paused = true)]
async fn test_unhealthy_object_store_blocks_milvus() {
    let runtime = MockRuntime::new();
    runtime.expect_service("minio").always_unhealthy();

    let summary = lifecycle::up(
        runtime.clone(),
        OrchestratorSettings::default(),
        milvus_standalone(),
        time::sleep(Duration::from_secs(3600)),
        Duration::ZERO,
    )
    .await
    .expect("stack should prepare");

    match &summary.result {
        RunResult::PartialFailure(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].service.as_str(), "minio");
            assert_eq!(failures[0].kind, FailureKind::Probe);
        }
        other => panic!("expected partial failure, got {other}"),
    }
    assert_eq!(runtime.start_count("minio"), 4);
    assert_eq!(runtime.start_count("milvus"), 0);
    assert_eq!(summary.status.state_of("milvus"), Some(ServiceState::Pending));

    let err = summary.into_result().unwrap_err();
    assert!(matches!(err, StackError::Unhealthy(_)));
    assert!(err.to_string().contains("minio"));
}

#[test]
fn test_builtin_stack_plan() {
    let (_, services) = lifecycle::load_stack(None).unwrap();
    let plan = lifecycle::validate(&services).unwrap();

    assert_eq!(plan.stages().len(), 2);
    assert_eq!(plan.stage_of(&ServiceId::from("etcd")), Some(0));
    assert_eq!(plan.stage_of(&ServiceId::from("minio")), Some(0));
    assert_eq!(plan.stage_of(&ServiceId::from("milvus")), Some(1));
}

#[test]
fn test_custom_manifest_with_cycle_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
services:
  - id: etcd
    dependsOn: [milvus]
    start: {{ command: etcd }}
  - id: milvus
    dependsOn: [etcd]
    start: {{ command: milvus }}
"#
    )
    .unwrap();

    let (_, services) = lifecycle::load_stack(Some(file.path())).unwrap();
    let err = lifecycle::validate(&services).unwrap_err();
    assert!(err.to_string().starts_with("cyclic dependency"), "{err}");
}
