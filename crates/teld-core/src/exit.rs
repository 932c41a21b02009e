//! Process-wide exit status.
//!
//! Failures are reported from several places at once: the supervision
//! chain, the pid-file interlock, and the worker runtime. Each reports a
//! code here; the stored value only ever increases, and `main` reads it
//! exactly once before exiting.

use std::sync::{Mutex, PoisonError};

static EXIT_STATUS: Mutex<i32> = Mutex::new(0);

/// Raise the process exit status to `code`.
///
/// The stored value is the maximum of all codes reported so far, so a
/// later, milder failure can never mask an earlier, worse one.
pub fn set(code: i32) {
    let mut status = EXIT_STATUS.lock().unwrap_or_else(PoisonError::into_inner);
    if code > *status {
        *status = code;
    }
}

/// Read the current exit status.
#[must_use]
pub fn get() -> i32 {
    *EXIT_STATUS.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_reports_keep_maximum() {
        let handles: Vec<_> = [3, 1, 2, 1, 3, 0]
            .into_iter()
            .map(|code| std::thread::spawn(move || set(code)))
            .collect();
        for handle in handles {
            handle.join().expect("reporter panicked");
        }
        assert_eq!(get(), 3);

        // A lower report afterwards does not regress the status.
        set(1);
        assert_eq!(get(), 3);
    }
}
