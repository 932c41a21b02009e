//! Daemon version information.

/// Base semantic version, taken from the crate manifest.
pub const NUMBER: &str = env!("CARGO_PKG_VERSION");

/// Full version string as rendered in the banner and `--version` output.
///
/// A build tag can be injected at compile time through the
/// `TELD_BUILD_TAG` environment variable.
#[must_use]
pub fn full() -> String {
    match option_env!("TELD_BUILD_TAG") {
        Some(tag) if !tag.is_empty() => format!("{NUMBER}+{tag}"),
        _ => NUMBER.to_string(),
    }
}
