use tracing::warn;

use crate::{
    halt,
    machine::{Transition, HALT, MAIN_TAPE_POINTER, NO_WRITE},
    pointer::{self, PointerClass},
};

/// States carrying this marker may write to MAIN_TAPE.md.
pub const ALLOW_MAIN_TAPE_WRITE: &str = "[ALLOW_MAIN_TAPE_WRITE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCode {
    InvalidPointer,
    InvalidPointerClass,
}

impl TrapCode {
    pub fn tag(self) -> &'static str {
        match self {
            TrapCode::InvalidPointer => "INVALID_POINTER",
            TrapCode::InvalidPointerClass => "INVALID_POINTER_CLASS",
        }
    }

    pub fn pointer_code(self) -> &'static str {
        match self {
            TrapCode::InvalidPointer => "invalid_pointer",
            TrapCode::InvalidPointerClass => "invalid_pointer_class",
        }
    }
}

/// Non-trap advisories: the transition was rewritten but the loop continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    HaltNormalized,
    MainTapeWriteBlocked,
}

#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub current_state: &'a str,
    pub current_pointer: &'a str,
}

#[derive(Debug, Clone)]
pub struct GuardOutcome {
    pub transition: Transition,
    pub trapped: bool,
    pub issues: Vec<Issue>,
}

/// Validates a candidate transition against the current machine position.
/// Violations are never thrown: a trap is a data-level rewrite routing the
/// head to `sys://trap/<code>` with the previous state preserved.
pub fn check(candidate: Transition, ctx: &GuardContext) -> GuardOutcome {
    let mut issues = Vec::new();

    // 1. pointer legality
    let raw_d = candidate.d_next.clone();
    let d_next = pointer::normalize(&raw_d);
    if pointer::classify(&d_next) == PointerClass::Invalid {
        return trap(TrapCode::InvalidPointer, &raw_d, ctx);
    }

    let wants_main_tape_write = candidate.q_next.contains(ALLOW_MAIN_TAPE_WRITE);
    let mut t = Transition::new(candidate.q_next, candidate.s_prime, d_next);

    // 2. halt canonicalization
    if halt::is_halt_like(&t.q_next) || t.d_next == HALT {
        if t.q_next != HALT || t.d_next != HALT {
            issues.push(Issue::HaltNormalized);
        }
        t = halt::canonical(&t.s_prime);
    }

    // 3. main-tape write protection. The allow marker is read off the
    // pre-canonical state so a final halting report can still land on the
    // tape. A blocked halt keeps q = HALT (the halt tuple stays canonical);
    // only non-halt states take the prefix.
    if pointer::normalize(ctx.current_pointer) == MAIN_TAPE_POINTER
        && t.s_prime != NO_WRITE
        && !wants_main_tape_write
    {
        t.s_prime = NO_WRITE.to_string();
        if t.q_next != HALT {
            t.q_next = format!("[GUARD_BLOCKED:MAIN_TAPE_WRITE] {}", t.q_next);
        }
        issues.push(Issue::MainTapeWriteBlocked);
        warn!(pointer = ctx.current_pointer, "blocked main-tape write");
    }

    // 4. pointer class coherence: once halted, the head may not leave
    if pointer::classify(ctx.current_pointer) == PointerClass::Halt
        && pointer::classify(&t.d_next) != PointerClass::Halt
    {
        return trap(TrapCode::InvalidPointerClass, &t.d_next, ctx);
    }

    GuardOutcome {
        transition: t,
        trapped: false,
        issues,
    }
}

fn trap(code: TrapCode, offending: &str, ctx: &GuardContext) -> GuardOutcome {
    warn!(code = code.tag(), pointer = offending, "trapped transition");
    let q_next = format!(
        "[TRAP:{}] rejected pointer {:?} [PREV_Q] {}",
        code.tag(),
        offending,
        ctx.current_state
    );
    GuardOutcome {
        transition: Transition::new(q_next, NO_WRITE, pointer::trap(code.pointer_code())),
        trapped: true,
        issues: Vec::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx<'a>(q: &'a str, d: &'a str) -> GuardContext<'a> {
        GuardContext {
            current_state: q,
            current_pointer: d,
        }
    }

    #[test]
    fn halt_variant_is_normalized() {
        let out = check(
            Transition::new("HALT_COMPLETE", NO_WRITE, "./MAIN_TAPE.md"),
            &ctx("q_3: VERIFYING", "./state.txt"),
        );
        assert!(!out.trapped);
        assert_eq!(out.transition, Transition::new("HALT", NO_WRITE, "HALT"));
        assert_eq!(out.issues, vec![Issue::HaltNormalized]);
    }

    #[test]
    fn canonical_halt_passes_clean() {
        let out = check(
            Transition::new("HALT", NO_WRITE, "HALT"),
            &ctx("q_3: VERIFYING", "./state.txt"),
        );
        assert!(!out.trapped);
        assert!(out.issues.is_empty());
        assert_eq!(out.transition, Transition::new("HALT", NO_WRITE, "HALT"));
    }

    #[test]
    fn invalid_pointer_traps() {
        let out = check(
            Transition::new("q_2: NEXT", NO_WRITE, "not a pointer ???"),
            &ctx("q_1: WORKING", "./MAIN_TAPE.md"),
        );
        assert!(out.trapped);
        assert_eq!(out.transition.d_next, "sys://trap/invalid_pointer");
        assert!(out.transition.q_next.starts_with("[TRAP:INVALID_POINTER]"));
        assert!(out.transition.q_next.contains("[PREV_Q] q_1: WORKING"));
    }

    #[test]
    fn main_tape_write_is_blocked() {
        let out = check(
            Transition::new("q_2: RECORDING", "overwrite", "./result.txt"),
            &ctx("q_1: WORKING", "./MAIN_TAPE.md"),
        );
        assert!(!out.trapped);
        assert_eq!(out.transition.s_prime, NO_WRITE);
        assert_eq!(out.transition.d_next, "./result.txt");
        assert!(out
            .transition
            .q_next
            .starts_with("[GUARD_BLOCKED:MAIN_TAPE_WRITE]"));
        assert_eq!(out.issues, vec![Issue::MainTapeWriteBlocked]);
    }

    #[test]
    fn allow_marker_lets_main_tape_writes_through() {
        let out = check(
            Transition::new(
                "q_2: REPORTING [ALLOW_MAIN_TAPE_WRITE]",
                "final report",
                "./MAIN_TAPE.md",
            ),
            &ctx("q_1: WORKING", "./MAIN_TAPE.md"),
        );
        assert!(!out.trapped);
        assert_eq!(out.transition.s_prime, "final report");
        assert!(out.issues.is_empty());
    }

    #[test]
    fn bare_main_tape_pointer_is_still_protected() {
        let out = check(
            Transition::new("q_2: NEXT", "sneaky", "./elsewhere.txt"),
            &ctx("q_1: WORKING", "MAIN_TAPE.md"),
        );
        assert_eq!(out.transition.s_prime, NO_WRITE);
        assert_eq!(out.issues, vec![Issue::MainTapeWriteBlocked]);
    }

    #[test]
    fn blocked_halt_stays_canonical() {
        let out = check(
            Transition::new("HALT", "last words", "HALT"),
            &ctx("q_9: DONE", "./MAIN_TAPE.md"),
        );
        assert!(!out.trapped);
        assert_eq!(out.transition.q_next, "HALT");
        assert_eq!(out.transition.d_next, "HALT");
        assert_eq!(out.transition.s_prime, NO_WRITE);
        assert_eq!(out.issues, vec![Issue::MainTapeWriteBlocked]);
    }

    #[test]
    fn halting_report_with_allow_marker_writes_and_halts() {
        let out = check(
            Transition::new("HALT_DONE [ALLOW_MAIN_TAPE_WRITE]", "report", "HALT"),
            &ctx("q_9: DONE", "./MAIN_TAPE.md"),
        );
        assert!(!out.trapped);
        assert_eq!(out.transition.q_next, "HALT");
        assert_eq!(out.transition.s_prime, "report");
        assert_eq!(out.issues, vec![Issue::HaltNormalized]);
    }

    #[test]
    fn head_cannot_leave_halt_class() {
        let out = check(
            Transition::new("q_1: RESTARTING", NO_WRITE, "./MAIN_TAPE.md"),
            &ctx("HALT", "HALT"),
        );
        assert!(out.trapped);
        assert_eq!(out.transition.d_next, "sys://trap/invalid_pointer_class");
        assert!(out
            .transition
            .q_next
            .starts_with("[TRAP:INVALID_POINTER_CLASS]"));
    }

    #[test]
    fn normalization_is_idempotent_on_halt() {
        let first = check(
            Transition::new("HALT_EARLY", NO_WRITE, "./x.txt"),
            &ctx("q", "./x.txt"),
        );
        let second = check(first.transition.clone(), &ctx("q", "./x.txt"));
        assert_eq!(first.transition, second.transition);
        assert!(second.issues.is_empty());
    }
}
