//! teld daemon library.
//!
//! The binary in `main.rs` is a thin shell over this crate: flag handling
//! and role dispatch live there, everything with behaviour worth testing
//! lives here.
//!
//! # Modules
//!
//! - [`protocol`]: length-prefixed framing and the wire message set
//! - [`listener`]: bind-address parsing and the accept loop
//! - [`connection`]: per-connection protocol driver
//! - [`apps`]: application table and per-application entries
//! - [`scheduler`]: per-application harvest driver
//! - [`collector`]: ingestion service client
//! - [`pidfile`]: single-daemon interlock
//! - [`supervise`]: progenitor re-exec and the watcher respawn loop
//! - [`worker`]: the worker role runtime

pub mod apps;
pub mod cli;
pub mod collector;
pub mod connection;
pub mod listener;
pub mod log;
pub mod pidfile;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod supervise;
pub mod utilization;
pub mod worker;
