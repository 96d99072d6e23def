//! Unsolicited-line handler registry: a list of `(regex, handler)` pairs
//! tested in registration order, first match wins. Patterns are compiled
//! once at install time and dispatch never affects in-flight commands.

use regex::{Captures, Regex};

pub type Handler = Box<dyn Fn(&Captures) + Send + Sync>;

struct Entry {
    pattern: Regex,
    handler: Handler,
}

#[derive(Default)]
pub struct UnsolicitedRegistry {
    entries: Vec<Entry>,
}

impl UnsolicitedRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Compile `pattern` and register `handler` for it. Panics on an
    /// invalid pattern, matching the teacher's "compile once at
    /// handler-install time" contract — a malformed pattern is a
    /// programmer error, not a runtime condition.
    pub fn register(&mut self, pattern: &str, handler: Handler) {
        let compiled = Regex::new(pattern).expect("unsolicited pattern must compile");
        self.entries.push(Entry { pattern: compiled, handler });
    }

    pub fn unregister_all(&mut self) {
        self.entries.clear();
    }

    /// Dispatch one received line. Returns true if a handler matched.
    pub fn dispatch(&self, line: &str) -> bool {
        for entry in &self.entries {
            if let Some(captures) = entry.pattern.captures(line) {
                (entry.handler)(&captures);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn first_match_wins() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut reg = UnsolicitedRegistry::new();

        let h1 = hits.clone();
        reg.register(r"^%STATCM: (\d+)", Box::new(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        }));
        let h2 = hits.clone();
        reg.register(r"^%STATCM:", Box::new(move |_| {
            h2.fetch_add(10, Ordering::SeqCst);
        }));

        assert!(reg.dispatch("%STATCM: 4"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_matching_line_returns_false() {
        let reg = UnsolicitedRegistry::new();
        assert!(!reg.dispatch("anything"));
    }
}
