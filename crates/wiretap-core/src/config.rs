//! Immutable core settings shared by the emitter and every plugin crate
//! (spec.md §6, §9 design note on "global settings").
//!
//! The reference threads one global mutable `AppSettings` through every
//! package; that doesn't fit a crate split cleanly, so a single
//! [`CoreConfig`] is built once from CLI flags in the binary and passed by
//! reference into plugin constructors instead.

use std::time::Duration;

/// How the emitter routes a message to one or more outputs (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitMode {
    /// Write to every output.
    #[default]
    Broadcast,
    /// Write to exactly one output, chosen round robin.
    RoundRobin,
    /// Write to exactly one output, chosen by `FNV-1a-32(uuid[0..20]) % N`.
    SessionSticky,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Caps `Message.data` length on read (spec.md §4.2 step 1).
    pub copy_buffer_size: usize,
    /// Reformats chunked/compressed HTTP bodies before fan-out.
    pub prettify_http: bool,
    /// Fan-out policy; `SessionSticky` additionally requires session
    /// recognition to be meaningful (falls back to `RoundRobin` without it).
    pub split_output: SplitMode,
    /// TTL-bounded filtered-request tracking window (spec.md §4.2 step 3).
    pub filtered_request_ttl: Duration,
    /// Soft cap on the filtered-request set's total byte size.
    pub filtered_request_cap_bytes: usize,
    /// Process exits this long after the last message is processed, if set.
    pub exit_after: Option<Duration>,
    /// Log verbosity, 0-3 (spec.md §7).
    pub verbose: u8,
    /// Enables periodic `GorStat` reporting on outputs that support it.
    pub stats: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            copy_buffer_size: 5 * 1024 * 1024,
            prettify_http: false,
            split_output: SplitMode::default(),
            filtered_request_ttl: Duration::from_secs(60),
            filtered_request_cap_bytes: 200 * 1024 * 1024,
            exit_after: None,
            verbose: 0,
            stats: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.copy_buffer_size, 5 * 1024 * 1024);
        assert_eq!(cfg.filtered_request_ttl, Duration::from_secs(60));
        assert_eq!(cfg.split_output, SplitMode::Broadcast);
    }
}
