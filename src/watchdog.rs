use std::collections::VecDeque;

use tracing::warn;

use crate::pointer::ERROR_RECOVERY;

pub const DEFAULT_WINDOW: usize = 12;
pub const DEFAULT_CONSECUTIVE: u32 = 4;
pub const DEFAULT_WINDOW_REPEATS: u32 = 6;

const FINGERPRINT_STATE_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    ConsecutiveRepeat,
    WindowRepeat,
}

impl Reason {
    pub fn tag(self) -> &'static str {
        match self {
            Reason::ConsecutiveRepeat => "consecutive_repeat",
            Reason::WindowRepeat => "window_repeat",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub triggered: bool,
    pub reason: Option<Reason>,
    pub fingerprint: String,
    pub total_triggers: u32,
}

/// Detects the machine spinning on the same `(pointer, state-head)` pair,
/// either back-to-back or smeared across a short window. Triggering resets
/// all memory so counting starts fresh.
#[derive(Debug)]
pub struct Watchdog {
    window_size: usize,
    consecutive_threshold: u32,
    window_threshold: u32,

    window: VecDeque<String>,
    last: Option<String>,
    consecutive: u32,
    triggers: u32,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CONSECUTIVE, DEFAULT_WINDOW_REPEATS)
    }
}

impl Watchdog {
    pub fn new(window_size: usize, consecutive_threshold: u32, window_threshold: u32) -> Self {
        Self {
            window_size,
            consecutive_threshold,
            window_threshold,
            window: VecDeque::with_capacity(window_size),
            last: None,
            consecutive: 0,
            triggers: 0,
        }
    }

    /// `<pointer>|<first line of state>`, state head capped at 160 chars.
    pub fn fingerprint(pointer: &str, state: &str) -> String {
        let head: String = state
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .chars()
            .take(FINGERPRINT_STATE_CHARS)
            .collect();
        format!("{}|{}", pointer, head)
    }

    pub fn inspect(&mut self, pointer: &str, state: &str) -> Decision {
        let fingerprint = Self::fingerprint(pointer, state);

        self.consecutive = match &self.last {
            Some(last) if *last == fingerprint => self.consecutive + 1,
            _ => 1,
        };
        self.last = Some(fingerprint.clone());

        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(fingerprint.clone());
        let repeats = self.window.iter().filter(|f| **f == fingerprint).count() as u32;

        let reason = if self.consecutive >= self.consecutive_threshold {
            Some(Reason::ConsecutiveRepeat)
        } else if repeats >= self.window_threshold {
            Some(Reason::WindowRepeat)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.triggers += 1;
            warn!(reason = reason.tag(), %fingerprint, "watchdog triggered");
            self.reset_counters();
            Decision {
                triggered: true,
                reason: Some(reason),
                fingerprint,
                total_triggers: self.triggers,
            }
        } else {
            Decision {
                triggered: false,
                reason: None,
                fingerprint,
                total_triggers: self.triggers,
            }
        }
    }

    pub fn reset_counters(&mut self) {
        self.window.clear();
        self.last = None;
        self.consecutive = 0;
    }

    pub fn total_triggers(&self) -> u32 {
        self.triggers
    }
}

/// Multi-line banner the kernel installs as `q` on trigger. The head pointer
/// goes to `sys://error_recovery` alongside it.
pub fn recovery_state(reason: Reason, fingerprint: &str, previous_q: &str) -> String {
    format!(
        "[WATCHDOG_RECOVERY:{}]\n\
         The machine has repeated the same (pointer, state) step too many times.\n\
         Repeated fingerprint: {}\n\
         Choose a different pointer or a different approach; do not re-emit the repeated step.\n\
         The head has been moved to {}.\n\
         [PREV_Q] {}",
        reason.tag(),
        fingerprint,
        ERROR_RECOVERY,
        previous_q
    )
}
