use serde::{Deserialize, Serialize};

/// Canonical `s_prime` value meaning "do not alter the current cell".
pub const NO_WRITE: &str = "👆";

/// Register defaults written on first boot.
pub const Q_BOOT: &str = "q_0: SYSTEM_BOOTING";
pub const Q_PROCESSING: &str = "q_1: PROCESSING_USER_REQUEST";

/// Canonical halt value for both registers.
pub const HALT: &str = "HALT";

/// State the cycle breaker forces when the oracle keeps emitting the same
/// transition verbatim.
pub const FATAL_DEBUG: &str = "FATAL_DEBUG";

pub const MAIN_TAPE: &str = "MAIN_TAPE.md";
pub const MAIN_TAPE_POINTER: &str = "./MAIN_TAPE.md";

/// One step of the transition function: next state, the write to apply to the
/// *current* cell, and the next head position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub q_next: String,
    pub s_prime: String,
    pub d_next: String,
}

impl Transition {
    pub fn new(
        q_next: impl Into<String>,
        s_prime: impl Into<String>,
        d_next: impl Into<String>,
    ) -> Self {
        Self {
            q_next: q_next.into(),
            s_prime: s_prime.into(),
            d_next: d_next.into(),
        }
    }

    pub fn is_no_write(&self) -> bool {
        self.s_prime == NO_WRITE
    }

    /// First line of the state, used as the "state head" for fingerprints and
    /// for status displays.
    pub fn state_head(&self) -> &str {
        self.q_next.lines().next().unwrap_or("")
    }
}
