//! Application identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The tuple that identifies one logical application.
///
/// Two connections presenting the same identity share a single application
/// entry inside the daemon; observations from both are merged into the same
/// reservoirs and harvested together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppIdentity {
    /// Account license key.
    pub license: String,

    /// Application names. The first is the primary name; any further
    /// entries are rollup names.
    pub app_names: Vec<String>,

    /// Whether the reporting library runs in high-security mode.
    pub high_security: bool,

    /// Language of the reporting instrumentation library.
    pub language: String,

    /// Version of the reporting instrumentation library.
    pub agent_version: String,
}

impl AppIdentity {
    /// The primary (first) application name, or the empty string when the
    /// name list is empty.
    #[must_use]
    pub fn primary_name(&self) -> &str {
        self.app_names.first().map_or("", String::as_str)
    }

    /// The license key reduced to its last four characters, for logging.
    #[must_use]
    pub fn redacted_license(&self) -> String {
        let tail: String = self
            .license
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("..{tail}")
    }
}

impl fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [license={}]",
            self.primary_name(),
            self.redacted_license()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> AppIdentity {
        AppIdentity {
            license: "0123456789abcdef0123456789abcdef01234567".into(),
            app_names: vec![name.into()],
            high_security: false,
            language: "php".into(),
            agent_version: "9.0.0".into(),
        }
    }

    #[test]
    fn test_display_redacts_license() {
        let rendered = identity("shop").to_string();
        assert_eq!(rendered, "shop [license=..4567]");
        assert!(!rendered.contains("0123456789abcdef"));
    }

    #[test]
    fn test_identity_distinguishes_high_security() {
        let a = identity("shop");
        let mut b = identity("shop");
        b.high_security = true;
        assert_ne!(a, b);
    }
}
