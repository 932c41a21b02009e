//! Environment-vector helper.
//!
//! Wraps a list of `KEY=VALUE` strings as produced by [`std::env::vars`]
//! so the supervision code can adjust a child environment before re-exec.

/// A list of environment variables in `KEY=VALUE` form.
#[derive(Debug, Clone, Default)]
pub struct Environment(Vec<String>);

impl Environment {
    /// Capture the environment of the current process.
    #[must_use]
    pub fn capture() -> Self {
        Self(std::env::vars().map(|(k, v)| format!("{k}={v}")).collect())
    }

    /// Returns the index of the first entry whose key is `key`.
    #[must_use]
    pub fn index(&self, key: &str) -> Option<usize> {
        self.0.iter().position(|entry| {
            entry
                .split_once('=')
                .is_some_and(|(entry_key, _)| entry_key == key)
        })
    }

    /// Set the value of the variable named `key`, appending it if absent.
    pub fn set(&mut self, key: &str, value: &str) {
        let entry = format!("{key}={value}");
        match self.index(key) {
            Some(i) => self.0[i] = entry,
            None => self.0.push(entry),
        }
    }

    /// Iterate over the entries as `(key, value)` pairs.
    ///
    /// Entries without an `=` separator are skipped; they cannot be passed
    /// to a child process meaningfully.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().filter_map(|entry| entry.split_once('='))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no entries are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
