//! # Milvus Stack
//!
//! Milvus standalone, etcd and MinIO run as one orchestrated stack.
//!
//! - **[stack]**: the service descriptors and the built-in YAML manifest.
//! - **[lifecycle]**: loading, validating and running a stack.
//!
//! The binary in `main.rs` wraps these in a small CLI (`plan`, `validate`,
//! `up`).

pub mod lifecycle;
pub mod stack;
