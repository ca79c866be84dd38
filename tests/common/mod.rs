// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice,
    dead_code
)]

//! Common test utilities shared across test targets
//!
//! In-memory stand-ins for the Kubernetes API and the database members, plus
//! builders for deployments and a harness that runs inspection ticks.
//!
//! # Usage
//!
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```

mod fake_kube;
mod fixtures;

pub use fake_cluster::*;
pub use fake_kube::*;
pub use fixtures::*;
