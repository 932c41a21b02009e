//! Command-line handling.
//!
//! Settings precedence, lowest to highest: built-in defaults, the
//! configuration file, command-line flags, `--define` overrides. Flags are
//! parsed twice so they beat file values regardless of position.
//!
//! A legacy short-flag set is still accepted: when the modern parse fails,
//! the same arguments are retried against the legacy set with a
//! deprecation notice. If both fail, the modern error is the one reported.

use clap::error::ErrorKind;
use clap::Parser;
use teld_core::config::{Config, LogLevel};
use teld_core::role::{Role, ROLE_ENV_VAR};

/// Printed when the legacy short flags are used.
const LEGACY_NOTICE: &str = "\
Warning!

You are using legacy command-line flags. These flags will be removed in a
future version:

[-p pidfile]
[-d level]
[-l logfile]
[-P port]
[-b SSL-certificate-bundle]
[-S SSL-certificate-path]
[-x proxy]
[-a auditlog]
[-A]

Please use the flags listed by --help instead.
";

/// A terminal outcome of flag handling: print `message`, exit with `code`.
#[derive(Debug)]
pub struct CliExit {
    /// Process exit code: 1 for bad invocations, 2 for help.
    pub code: i32,
    /// Text for stderr.
    pub message: String,
}

impl CliExit {
    fn invalid(message: String) -> Self {
        Self { code: 1, message }
    }
}

/// The resolved invocation: effective settings plus print-and-exit modes.
#[derive(Debug)]
pub struct Invocation {
    /// Effective daemon settings, role included.
    pub cfg: Config,
    /// `-v`/`--version` was given.
    pub print_version: bool,
    /// `--utilization` was given.
    pub print_utilization: bool,
}

/// Modern flag set.
#[derive(Parser, Debug, Default)]
#[command(
    name = "teld",
    about = "Telemetry relay daemon",
    disable_version_flag = true
)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', value_name = "config-file")]
    config: Option<String>,

    /// Listen on the given ip:port or socket file path
    #[arg(long, value_name = "addr")]
    addr: Option<String>,

    /// Listen on the given port or socket file path (deprecated, use --addr)
    #[arg(long, value_name = "port")]
    port: Option<String>,

    /// Proxy credentials for reaching the ingestion service
    #[arg(long, value_name = "url")]
    proxy: Option<String>,

    /// Path to the process id file
    #[arg(long, value_name = "file")]
    pidfile: Option<String>,

    /// Do not create a pid file even when a path is configured
    #[arg(long = "no-pidfile")]
    no_pidfile: bool,

    /// Path to the log file
    #[arg(long, value_name = "file")]
    logfile: Option<String>,

    /// Log level (error, warning, info or debug)
    #[arg(long, value_name = "level")]
    loglevel: Option<LogLevel>,

    /// Path to the audit file
    #[arg(long, value_name = "file")]
    auditlog: Option<String>,

    /// Path to a root CA certificate bundle
    #[arg(long, value_name = "file")]
    cafile: Option<String>,

    /// Path to a directory of root CA certificates
    #[arg(long, value_name = "dir")]
    capath: Option<String>,

    /// Set a setting (as in the config file) to a value; takes precedence
    /// over config file settings
    #[arg(long = "define", value_name = "setting=value")]
    defines: Vec<String>,

    /// Remain in the foreground
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Mark this daemon as spawned by an instrumented process
    #[arg(long)]
    agent: bool,

    /// Print host facts as JSON and exit
    #[arg(long)]
    utilization: bool,

    /// Print version information and exit
    #[arg(short = 'v', long)]
    version: bool,
}

/// Legacy short-flag set.
#[derive(Parser, Debug, Default)]
#[command(name = "teld", disable_version_flag = true, disable_help_flag = true)]
struct LegacyArgs {
    #[arg(short = 'c')]
    config: Option<String>,

    #[arg(short = 'p')]
    pidfile: Option<String>,

    #[arg(short = 'd')]
    loglevel: Option<LogLevel>,

    #[arg(short = 'l')]
    logfile: Option<String>,

    #[arg(short = 'P')]
    port: Option<String>,

    #[arg(short = 'b')]
    cafile: Option<String>,

    #[arg(short = 'S')]
    capath: Option<String>,

    #[arg(short = 'x')]
    proxy: Option<String>,

    #[arg(short = 'a')]
    auditlog: Option<String>,

    #[arg(short = 'A')]
    agent: bool,

    #[arg(short = 'f')]
    foreground: bool,

    // Present so a watcher-spawned worker can pass it through even when
    // the rest of the invocation is legacy.
    #[arg(long = "no-pidfile")]
    no_pidfile: bool,
}

impl Args {
    fn apply(&self, cfg: &mut Config) -> Result<(), CliExit> {
        if let Some(v) = &self.addr {
            cfg.bind_addr.clone_from(v);
        }
        if let Some(v) = &self.port {
            cfg.bind_port.clone_from(v);
        }
        if let Some(v) = &self.proxy {
            cfg.proxy.clone_from(v);
        }
        if let Some(v) = &self.pidfile {
            cfg.pidfile.clone_from(v);
        }
        if let Some(v) = &self.logfile {
            cfg.logfile.clone_from(v);
        }
        if let Some(v) = self.loglevel {
            cfg.loglevel = v;
        }
        if let Some(v) = &self.auditlog {
            cfg.auditlog.clone_from(v);
        }
        if let Some(v) = &self.cafile {
            cfg.ca_file.clone_from(v);
        }
        if let Some(v) = &self.capath {
            cfg.ca_path.clone_from(v);
        }
        if self.no_pidfile {
            cfg.no_pidfile = true;
        }
        if self.foreground {
            cfg.foreground = true;
        }
        if self.agent {
            cfg.agent = true;
        }
        // Defines are inline config lines with the highest precedence.
        for define in &self.defines {
            cfg.apply_define(define)
                .map_err(|e| CliExit::invalid(format!("invalid configuration: {e}")))?;
        }
        Ok(())
    }
}

impl LegacyArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(v) = &self.pidfile {
            cfg.pidfile.clone_from(v);
        }
        if let Some(v) = self.loglevel {
            cfg.loglevel = v;
        }
        if let Some(v) = &self.logfile {
            cfg.logfile.clone_from(v);
        }
        if let Some(v) = &self.port {
            cfg.bind_port.clone_from(v);
        }
        if let Some(v) = &self.cafile {
            cfg.ca_file.clone_from(v);
        }
        if let Some(v) = &self.capath {
            cfg.ca_path.clone_from(v);
        }
        if let Some(v) = &self.proxy {
            cfg.proxy.clone_from(v);
        }
        if let Some(v) = &self.auditlog {
            cfg.auditlog.clone_from(v);
        }
        if self.agent {
            cfg.agent = true;
        }
        if self.foreground {
            cfg.foreground = true;
        }
        if self.no_pidfile {
            cfg.no_pidfile = true;
        }
    }
}

/// Resolve the invocation from `argv` (including the program name) and the
/// role environment value.
///
/// # Errors
///
/// Returns a [`CliExit`] for help (`code` 2) and for invalid invocations
/// or configuration (`code` 1).
pub fn configure_from(argv: &[String], role_env: Option<&str>) -> Result<Invocation, CliExit> {
    match Args::try_parse_from(argv) {
        Ok(args) => {
            let mut cfg = Config::default();
            parse_config_file(&mut cfg, args.config.as_deref())?;
            args.apply(&mut cfg)?;
            Ok(Invocation {
                print_version: args.version,
                print_utilization: args.utilization,
                cfg: finish(cfg, role_env),
            })
        }
        Err(err) if err.kind() == ErrorKind::DisplayHelp => Err(CliExit {
            code: 2,
            message: err.to_string(),
        }),
        Err(modern_err) => {
            // Maybe a legacy invocation. Parse against a fresh config; if
            // that fails too, the modern error is the one worth reporting.
            let Ok(legacy) = LegacyArgs::try_parse_from(argv) else {
                return Err(CliExit::invalid(modern_err.to_string()));
            };
            eprint!("{LEGACY_NOTICE}");

            let mut cfg = Config::default();
            parse_config_file(&mut cfg, legacy.config.as_deref())?;
            legacy.apply(&mut cfg);
            Ok(Invocation {
                print_version: false,
                print_utilization: false,
                cfg: finish(cfg, role_env),
            })
        }
    }
}

/// Resolve the invocation from the real process arguments and environment.
///
/// # Errors
///
/// See [`configure_from`].
pub fn configure() -> Result<Invocation, CliExit> {
    let argv: Vec<String> = std::env::args().collect();
    let role_env = std::env::var(ROLE_ENV_VAR).ok();
    configure_from(&argv, role_env.as_deref())
}

fn parse_config_file(cfg: &mut Config, path: Option<&str>) -> Result<(), CliExit> {
    if let Some(path) = path {
        cfg.parse_file(path)
            .map_err(|e| CliExit::invalid(format!("invalid configuration: {e}")))?;
    }
    Ok(())
}

fn finish(mut cfg: Config, role_env: Option<&str>) -> Config {
    cfg.role = Role::resolve(cfg.foreground, role_env);

    if !cfg.bind_port.is_empty() {
        eprintln!("--port is deprecated, use --addr instead");
        if cfg.bind_port.parse::<u16>().is_ok() {
            cfg.bind_addr = format!("127.0.0.1:{}", cfg.bind_port);
        } else {
            // Non-numeric values pass through untouched so socket paths
            // keep working through the legacy flag.
            cfg.bind_addr.clone_from(&cfg.bind_port);
        }
    }

    cfg
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("teld")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_modern_flags_apply() {
        let inv = configure_from(&argv(&["--addr", "7878", "--loglevel", "debug"]), None).unwrap();
        assert_eq!(inv.cfg.bind_addr, "7878");
        assert_eq!(inv.cfg.loglevel, LogLevel::Debug);
        assert_eq!(inv.cfg.role, Role::Progenitor);
    }

    #[test]
    fn test_role_precedence() {
        // Foreground wins over the environment variable.
        let inv = configure_from(&argv(&["-f"]), Some("watcher")).unwrap();
        assert_eq!(inv.cfg.role, Role::Worker);

        let inv = configure_from(&argv(&[]), Some("watcher")).unwrap();
        assert_eq!(inv.cfg.role, Role::Watcher);

        let inv = configure_from(&argv(&[]), None).unwrap();
        assert_eq!(inv.cfg.role, Role::Progenitor);
    }

    #[test]
    fn test_port_fallback_numeric() {
        let inv = configure_from(&argv(&["--port", "9000"]), None).unwrap();
        assert_eq!(inv.cfg.bind_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_port_fallback_socket_path() {
        // Deliberate legacy behaviour: a non-numeric port is assigned to
        // the bind address verbatim, accepting socket paths.
        let inv = configure_from(&argv(&["--port", "/tmp/relay.sock"]), None).unwrap();
        assert_eq!(inv.cfg.bind_addr, "/tmp/relay.sock");
    }

    #[test]
    fn test_legacy_flags_accepted() {
        let inv = configure_from(
            &argv(&["-p", "/run/teld.pid", "-d", "debug", "-P", "8821"]),
            None,
        )
        .unwrap();
        assert_eq!(inv.cfg.pidfile, "/run/teld.pid");
        assert_eq!(inv.cfg.loglevel, LogLevel::Debug);
        assert_eq!(inv.cfg.bind_addr, "127.0.0.1:8821");
    }

    #[test]
    fn test_both_parses_failing_reports_modern_error() {
        let err = configure_from(&argv(&["--bogus-flag"]), None).unwrap_err();
        assert_eq!(err.code, 1);
        assert!(err.message.contains("--bogus-flag"));
    }

    #[test]
    fn test_help_exits_two() {
        let err = configure_from(&argv(&["--help"]), None).unwrap_err();
        assert_eq!(err.code, 2);
        assert!(err.message.contains("--addr"));
    }

    #[test]
    fn test_flags_beat_file_and_defines_beat_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "loglevel = warning\naddr = 1111").unwrap();
        let path = file.path().display().to_string();

        let inv = configure_from(
            &argv(&[
                "-c",
                &path,
                "--addr",
                "2222",
                "--define",
                "loglevel=error",
            ]),
            None,
        )
        .unwrap();
        // Flag beats file.
        assert_eq!(inv.cfg.bind_addr, "2222");
        // Define beats everything.
        assert_eq!(inv.cfg.loglevel, LogLevel::Error);
        assert_eq!(inv.cfg.config_file, path);
    }

    #[test]
    fn test_version_and_utilization_modes() {
        assert!(configure_from(&argv(&["-v"]), None).unwrap().print_version);
        assert!(
            configure_from(&argv(&["--utilization"]), None)
                .unwrap()
                .print_utilization
        );
    }
}
