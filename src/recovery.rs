use std::time::{Duration, Instant};

use tracing::warn;

use crate::{
    machine::{MAIN_TAPE_POINTER, Q_PROCESSING},
    pointer::{self, PointerClass},
    workspace::Workspace,
};

/// Supervisor-side policies layered over the kernel. None of this runs inside
/// the tick loop; a supervisor samples registers and tape between runs and
/// decides whether to re-arm.

/// A halt is only credible when the tape tail shows work actually happened.
pub const EVIDENCE_MARKERS: &[&str] = &[
    "[EXEC RESULT",
    "[EXEC ERROR",
    "[DISCIPLINE ERROR]",
    "Verification",
    "REPORT",
];

/// Bytes of tape tail the evidence gate examines.
pub const EVIDENCE_WINDOW: usize = 4_096;

pub const RECOVERY_NOTE: &str =
    "[SYSTEM RECOVERY] The machine was re-armed by its supervisor. Continue the task.";

pub fn halt_evidence_present(tape: &str) -> bool {
    let start = tape.len().saturating_sub(EVIDENCE_WINDOW);
    let mut cut = start;
    while cut < tape.len() && !tape.is_char_boundary(cut) {
        cut += 1;
    }
    let tail = &tape[cut..];
    EVIDENCE_MARKERS.iter().any(|marker| tail.contains(marker))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    /// Evidence found: let the halt stand.
    Pass,
    /// Re-arm to the processing state and append the note to the tape.
    Rearm { q: String, note: String },
    /// Attempt budget exhausted: surface a timeout failure.
    Exhausted,
}

/// Caps how many times an evidence-free halt is bounced back to work.
#[derive(Debug)]
pub struct EvidenceGate {
    attempts: u32,
    max_attempts: u32,
}

impl EvidenceGate {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    pub fn review(&mut self, tape: &str) -> GateVerdict {
        if halt_evidence_present(tape) {
            return GateVerdict::Pass;
        }
        if self.attempts >= self.max_attempts {
            return GateVerdict::Exhausted;
        }
        self.attempts += 1;
        warn!(attempt = self.attempts, "halt without evidence, re-arming");
        GateVerdict::Rearm {
            q: Q_PROCESSING.to_string(),
            note: RECOVERY_NOTE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub q: String,
    pub d: String,
    pub note: String,
}

/// Repairs an unusable head pointer: empty, illegal, escaping the workspace,
/// or parked on a directory. Healthy pointers (including shell/url/sys ones)
/// return `None`.
pub fn repair_pointer(workspace: &Workspace, d: &str) -> Option<Repair> {
    let broken = match pointer::classify(d) {
        PointerClass::Invalid => true,
        PointerClass::File => match workspace.resolve(d) {
            Ok(path) => path.is_dir(),
            Err(_) => true,
        },
        _ => false,
    };
    if !broken {
        return None;
    }
    warn!(pointer = d, "repairing unusable head pointer");
    Some(Repair {
        q: Q_PROCESSING.to_string(),
        d: MAIN_TAPE_POINTER.to_string(),
        note: format!(
            "[SYSTEM RECOVERY] Head pointer {:?} was unusable; reset to {}.",
            d, MAIN_TAPE_POINTER
        ),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallVerdict {
    Healthy,
    /// Append the recovery note and count an attempt.
    Recover(String),
    TimedOut,
}

/// Heartbeat over the kernel's `last_state_change` timestamp.
#[derive(Debug)]
pub struct StallProbe {
    stall_after: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl StallProbe {
    pub fn new(stall_after: Duration, max_attempts: u32) -> Self {
        Self {
            stall_after,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn poke(&mut self, last_state_change: Instant) -> StallVerdict {
        if last_state_change.elapsed() < self.stall_after {
            return StallVerdict::Healthy;
        }
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            return StallVerdict::TimedOut;
        }
        StallVerdict::Recover(RECOVERY_NOTE.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn evidence_markers_satisfy_the_gate() {
        assert!(halt_evidence_present("did things\n[EXEC RESULT for `make`]: ok\n"));
        assert!(halt_evidence_present("…\nVerification: all tests green\n"));
        assert!(!halt_evidence_present("I am done, trust me\n"));
    }

    #[test]
    fn evidence_outside_the_window_does_not_count() {
        let mut tape = String::from("[EXEC RESULT for `make`]: ok\n");
        tape.push_str(&"padding\n".repeat(EVIDENCE_WINDOW));
        assert!(!halt_evidence_present(&tape));
    }

    #[test]
    fn gate_rearms_then_exhausts() {
        let mut gate = EvidenceGate::new(2);
        assert!(matches!(gate.review("no proof"), GateVerdict::Rearm { .. }));
        assert!(matches!(gate.review("no proof"), GateVerdict::Rearm { .. }));
        assert_eq!(gate.review("no proof"), GateVerdict::Exhausted);
        // evidence still passes after exhaustion
        assert_eq!(gate.review("[EXEC RESULT x]"), GateVerdict::Pass);
    }

    #[test]
    fn repairs_only_broken_pointers() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        ws.boot().unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        assert!(repair_pointer(&ws, "garbage ptr").is_some());
        assert!(repair_pointer(&ws, "./a/../b").is_some());
        assert!(repair_pointer(&ws, "/etc/passwd").is_some());
        assert!(repair_pointer(&ws, "./subdir").is_some());

        assert!(repair_pointer(&ws, "./MAIN_TAPE.md").is_none());
        assert!(repair_pointer(&ws, "./not_yet_created.txt").is_none());
        assert!(repair_pointer(&ws, "$ ls").is_none());
        assert!(repair_pointer(&ws, "sys://error_recovery").is_none());
    }

    #[test]
    fn stall_probe_counts_attempts() {
        let mut probe = StallProbe::new(Duration::from_secs(0), 1);
        let stale = Instant::now() - Duration::from_secs(10);
        assert!(matches!(probe.poke(stale), StallVerdict::Recover(_)));
        assert_eq!(probe.poke(stale), StallVerdict::TimedOut);

        let mut healthy = StallProbe::new(Duration::from_secs(3600), 1);
        assert_eq!(healthy.poke(Instant::now()), StallVerdict::Healthy);
    }
}
