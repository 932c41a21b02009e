//! Daemon process roles.
//!
//! The daemon runs as a chain of three processes. The progenitor re-execs
//! itself in a new session and exits so the daemon can outlive whatever
//! application process spawned it; the watcher supervises workers; the
//! worker binds the listener and runs the harvest.

use std::fmt;

/// Environment variable used to select the role of a respawned process.
///
/// Set by the progenitor (to `watcher`) and by the watcher (to `worker`)
/// when re-executing the daemon binary. Unset or unrecognised values select
/// the progenitor role.
pub const ROLE_ENV_VAR: &str = "NEW_RELIC_DAEMON_ROLE";

/// A `Role` determines how the current daemon process behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// A process whose sole responsibility is to respawn itself in a new
    /// session and exit. This ensures the daemon does not keep a
    /// controlling TTY and can outlive its original parent, which is what
    /// we want when an instrumented application spawns the daemon
    /// opportunistically. For that reason it is the default.
    #[default]
    Progenitor,

    /// A process that spawns and supervises workers. When a worker dies
    /// unexpectedly, the watcher logs the failure and spawns a new worker.
    Watcher,

    /// A process that binds the listener, accumulates observations, and
    /// executes the harvest.
    Worker,
}

impl Role {
    /// Parse a role name. Matching is case-insensitive; anything other
    /// than `watcher` or `worker` selects the progenitor.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "watcher" => Self::Watcher,
            "worker" => Self::Worker,
            _ => Self::Progenitor,
        }
    }

    /// Resolve the effective role for this process.
    ///
    /// The foreground flag always wins: a foreground daemon is its own
    /// worker and there is no supervision chain. Otherwise the role comes
    /// from `env_value` (the value of [`ROLE_ENV_VAR`], if set).
    #[must_use]
    pub fn resolve(foreground: bool, env_value: Option<&str>) -> Self {
        if foreground {
            return Self::Worker;
        }
        env_value.map_or(Self::Progenitor, Self::from_name)
    }

    /// Resolve the role from the real process environment.
    #[must_use]
    pub fn from_environment() -> Self {
        match std::env::var(ROLE_ENV_VAR) {
            Ok(value) => Self::from_name(&value),
            Err(_) => Self::Progenitor,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Progenitor => "progenitor",
            Self::Watcher => "watcher",
            Self::Worker => "worker",
        };
        f.write_str(name)
    }
}
