//! # Milvus Standalone Stack
//!
//! The three services Milvus standalone needs, defined twice: in code with
//! the descriptor builder, and as the YAML manifest shipped with the binary.
//! Both definitions describe the same stack.
//!
//! ```text
//! stage 1: [etcd, minio]
//! stage 2: [milvus]      <- ETCD_ENDPOINTS, MINIO_ADDRESS, MINIO_ACCESS_KEY_ID,
//!                           MINIO_SECRET_ACCESS_KEY
//! ```

use service_orchestrator::{HealthCheck, ServiceDescriptor};
use std::time::Duration;

/// Manifest embedded in the binary, used when no `--manifest` is given.
pub const BUILTIN_MANIFEST: &str = include_str!("../manifests/milvus-standalone.yaml");

fn command_probe(command: &str, args: &[&str]) -> HealthCheck {
    HealthCheck::command(command, args.iter().copied())
        .interval(Duration::from_secs(30))
        .timeout(Duration::from_secs(20))
        .thresholds(1, 3)
}

pub fn etcd() -> ServiceDescriptor {
    ServiceDescriptor::builder("etcd")
        .command("etcd")
        .args([
            "--advertise-client-urls=http://127.0.0.1:2379",
            "--listen-client-urls=http://0.0.0.0:2379",
            "--data-dir=/etcd",
        ])
        .env("ETCD_AUTO_COMPACTION_MODE", "revision")
        .env("ETCD_AUTO_COMPACTION_RETENTION", "1000")
        .env("ETCD_QUOTA_BACKEND_BYTES", "4294967296")
        .env("ETCD_SNAPSHOT_COUNT", "50000")
        .port("client", 2379, 2379)
        .output("endpoint", "127.0.0.1:2379")
        .health_check(command_probe("etcdctl", &["endpoint", "health"]))
        .build()
}

pub fn minio() -> ServiceDescriptor {
    ServiceDescriptor::builder("minio")
        .command("minio")
        .args(["server", "/minio_data", "--console-address", ":9001"])
        .env("MINIO_ACCESS_KEY", "minioadmin")
        .env("MINIO_SECRET_KEY", "minioadmin")
        .port("api", 9000, 9000)
        .port("console", 9001, 9001)
        .output("endpoint", "127.0.0.1:9000")
        .output("accessKey", "minioadmin")
        .output("secretKey", "minioadmin")
        .health_check(command_probe(
            "curl",
            &["-f", "http://localhost:9000/minio/health/live"],
        ))
        .build()
}

pub fn milvus() -> ServiceDescriptor {
    ServiceDescriptor::builder("milvus")
        .depends_on("etcd")
        .depends_on("minio")
        .command("milvus")
        .args(["run", "standalone"])
        .port("grpc", 19530, 19530)
        .port("metrics", 9091, 9091)
        .reference("ETCD_ENDPOINTS", "etcd", "endpoint")
        .reference("MINIO_ADDRESS", "minio", "endpoint")
        .reference("MINIO_ACCESS_KEY_ID", "minio", "accessKey")
        .reference("MINIO_SECRET_ACCESS_KEY", "minio", "secretKey")
        .output("endpoint", "127.0.0.1:19530")
        .health_check(
            command_probe("curl", &["-f", "http://localhost:9091/healthz"])
                .start_period(Duration::from_secs(90)),
        )
        .build()
}

pub fn milvus_standalone() -> Vec<ServiceDescriptor> {
    vec![etcd(), minio(), milvus()]
}
