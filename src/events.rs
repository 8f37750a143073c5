//! Machine-parseable progress events
//!
//! One JSON object per line on stdout. An external watchdog tails these to
//! see liveness during multi-minute compilations and lock waits; nothing in
//! the pipeline reads them back.

use serde::Serialize;

/// Progress event stream entries, tagged by `phase`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Event {
    /// Still waiting on another process's lock
    WaitLock { class: String, held_for_s: u64 },

    /// A lock older than its timeout was deleted and claimed
    LockReclaimed { class: String, held_for_s: u64 },

    /// Heartbeat from a long-running generation subprocess
    Progress { name: String, elapsed_s: u64 },
}

impl Event {
    pub fn wait_lock(class: &str, held_for_s: u64) -> Self {
        Self::WaitLock {
            class: class.to_string(),
            held_for_s,
        }
    }

    pub fn lock_reclaimed(class: &str, held_for_s: u64) -> Self {
        Self::LockReclaimed {
            class: class.to_string(),
            held_for_s,
        }
    }

    pub fn progress(name: &str, elapsed_s: u64) -> Self {
        Self::Progress {
            name: name.to_string(),
            elapsed_s,
        }
    }
}

/// Print an event as a single JSON line.
///
/// Serialization of these variants cannot fail; a hypothetical failure is
/// dropped rather than interrupting the stage that emitted it.
pub fn emit(event: &Event) {
    if let Ok(line) = serde_json::to_string(event) {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_lock_shape() {
        let value = serde_json::to_value(Event::wait_lock("deep_gemm", 42)).unwrap();
        assert_eq!(value["phase"], "wait_lock");
        assert_eq!(value["class"], "deep_gemm");
        assert_eq!(value["held_for_s"], 42);
    }

    #[test]
    fn reclaim_shape() {
        let value = serde_json::to_value(Event::lock_reclaimed("moe_tune", 700)).unwrap();
        assert_eq!(value["phase"], "lock_reclaimed");
        assert_eq!(value["held_for_s"], 700);
    }

    #[test]
    fn heartbeat_shape() {
        let value = serde_json::to_value(Event::progress("deep_gemm", 120)).unwrap();
        assert_eq!(value["phase"], "progress");
        assert_eq!(value["name"], "deep_gemm");
        assert_eq!(value["elapsed_s"], 120);
    }
}
