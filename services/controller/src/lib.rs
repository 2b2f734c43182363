//! cronscale controller library.
//!
//! This crate primarily ships a `cronscale-controller` binary, but the
//! reconcile core is exposed as a library for integration testing and reuse.
//!
//! ## Components
//!
//! - **Schedule**: cron expression evaluation (`schedule`)
//! - **Job**: ephemeral evaluation job submission and observation (`job`)
//! - **Parse**: job output to replica count (`parse`)
//! - **Scaler**: idempotent scale target convergence (`scaler`)
//! - **Status**: bounded, version-checked status persistence (`status`)
//! - **Reconciler**: the per-policy scheduling state machine (`reconciler`)
//! - **Worker**: periodic dispatcher serializing reconciles per policy (`worker`)

pub mod cluster;
pub mod config;
pub mod job;
pub mod parse;
pub mod reconciler;
pub mod scaler;
pub mod schedule;
pub mod status;
pub mod worker;
