//! # teld-core
//!
//! Core library for teld, a telemetry relay daemon that sits between many
//! short-lived instrumented application processes and a remote ingestion
//! service.
//!
//! This crate holds everything that does not touch the network or the
//! process tree:
//!
//! - **Reservoirs**: bounded in-memory samplers with per-kind replacement
//!   rules ([`reservoir`])
//! - **Harvest state**: the per-application reservoir bundle, its atomic
//!   swap, and payload reduction ([`harvest`])
//! - **Configuration**: the key=value settings model shared by the config
//!   file, `--define`, and the CLI ([`config`])
//! - **Process roles**: the progenitor/watcher/worker spawn chain state
//!   ([`role`]) and the environment-vector helper used to re-exec ([`env`])
//! - **Exit status**: the monotonic process-wide exit code ([`exit`])

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod encode;
pub mod env;
pub mod exit;
pub mod harvest;
pub mod identity;
pub mod reservoir;
pub mod role;
pub mod version;

pub use config::Config;
pub use harvest::{Harvest, HarvestBatch, HarvestLimits};
pub use identity::AppIdentity;
pub use role::Role;
