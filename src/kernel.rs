use std::{collections::VecDeque, fs, io, sync::Arc, time::Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    actions::{self, Action},
    config::Config,
    discipline,
    error::EngineError,
    guard::{self, GuardContext},
    halt,
    machine::{Transition, FATAL_DEBUG, HALT, MAIN_TAPE_POINTER},
    manifold::{Manifold, SpanEdit},
    oracle::Oracle,
    pointer::{self, ERROR_RECOVERY},
    runtime::RuntimeEvent,
    watchdog::{self, Watchdog},
    workspace::Workspace,
};

pub const BREAKER_RING: usize = 20;
pub const BREAKER_THRESHOLD: usize = 10;

const DISCIPLINE_ERROR_MARKER: &str = "[DISCIPLINE ERROR] The transition neither wrote, \
nor used the no-write marker 👆, nor halted. Emit 👆 to leave the cell alone, a write or \
structured action, or q_next=HALT with d_next=HALT.";

const ORACLE_INVALID_MARKER: &str = "[DISCIPLINE ERROR] The oracle failed to produce a \
valid transition record. Output exactly one {\"q_next\", \"s_prime\", \"d_next\"} object.";

// tracks verbatim repeats of raw oracle output, distinct from the watchdog's
// fingerprint heuristics
struct CycleBreaker {
    ring: VecDeque<String>,
}

impl CycleBreaker {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(BREAKER_RING),
        }
    }

    // returns how many entries in the ring now match this output
    fn push(&mut self, t: &Transition) -> usize {
        let key = format!("{}\u{1f}{}\u{1f}{}", t.q_next, t.s_prime, t.d_next);
        if self.ring.len() == BREAKER_RING {
            self.ring.pop_front();
        }
        self.ring.push_back(key.clone());
        self.ring.iter().filter(|k| **k == key).count()
    }

    fn reset(&mut self) {
        self.ring.clear();
    }
}

/// One machine: registers in memory mirroring the on-disk pair, the manifold,
/// the oracle, and the two loop-breaker mechanisms. Strictly sequential; the
/// registers are persisted at the end of every tick, making the previous
/// tick the crash-recovery point.
pub struct TickKernel {
    workspace: Arc<Workspace>,
    manifold: Manifold,
    oracle: Arc<dyn Oracle>,
    config: Config,
    watchdog: Watchdog,
    breaker: CycleBreaker,
    events: broadcast::Sender<RuntimeEvent>,
    q: String,
    d: String,
    ticks: u64,
    last_state_change: Instant,
}

impl TickKernel {
    /// Loads registers from the workspace; `Workspace::boot` must have run.
    pub fn new(
        workspace: Arc<Workspace>,
        oracle: Arc<dyn Oracle>,
        config: Config,
        events: broadcast::Sender<RuntimeEvent>,
    ) -> io::Result<Self> {
        let q = workspace.read_q()?;
        let d = workspace.read_d()?;
        let manifold = Manifold::new(workspace.clone(), &config);
        Ok(Self {
            workspace,
            manifold,
            oracle,
            config,
            watchdog: Watchdog::default(),
            breaker: CycleBreaker::new(),
            events,
            q,
            d,
            ticks: 0,
            last_state_change: Instant::now(),
        })
    }

    pub fn q(&self) -> &str {
        &self.q
    }

    pub fn d(&self) -> &str {
        &self.d
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// For supervisor stall probes; updated whenever the state head changes.
    pub fn last_state_change(&self) -> Instant {
        self.last_state_change
    }

    pub fn halted(&self) -> bool {
        halt::is_halt_like(&self.q) && self.d == HALT
    }

    /// Runs ticks until the machine halts or a structural error aborts the
    /// run. Classified failures never surface here; they land on the tape.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        loop {
            if self.tick().await? {
                info!(ticks = self.ticks, "machine halted");
                return Ok(());
            }
        }
    }

    /// One tick: observe, collapse, guard, act, persist. Returns true once
    /// the machine is halted.
    pub async fn tick(&mut self) -> Result<bool, EngineError> {
        let s = self.manifold.observe(&self.d).await?;
        if self.halted() {
            return Ok(true);
        }

        let doc = discipline::load(&self.config);
        let raw = match self.oracle.collapse(&doc, &self.q, &s, &self.d).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "oracle call failed, surfacing to the current cell");
                self.note_cell(ORACLE_INVALID_MARKER)?;
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                return Ok(false);
            }
        };
        debug!(tick = self.ticks, q_next = raw.state_head(), d_next = %raw.d_next, "oracle transition");

        // the breaker watches raw oracle output and fires regardless of what
        // the guard or watchdog make of the transition; a machine stuck in a
        // verbatim loop of trapped transitions still gets broken here
        let identical = self.breaker.push(&raw);
        if identical >= BREAKER_THRESHOLD {
            warn!(identical, "cycle breaker tripped");
            let note = format!(
                "[INSANITY LOOP DETECTED: the last {} oracle outputs were identical. Forcing {}.]",
                identical, FATAL_DEBUG
            );
            self.note_cell(&note)?;
            self.breaker.reset();
            let d_current = self.d.clone();
            self.advance(FATAL_DEBUG.to_string(), d_current)?;
            return Err(EngineError::InsanityLoop(identical));
        }

        // tag-grammar shim: <STATE>/<GOTO> carry the transition when present
        let parsed = if raw.is_no_write() {
            Vec::new()
        } else {
            actions::parse(&raw.s_prime)
        };
        let mut candidate = raw.clone();
        for action in &parsed {
            match action {
                Action::State(q_next) => candidate.q_next = q_next.clone(),
                Action::Goto(d_next) => candidate.d_next = d_next.clone(),
                _ => {}
            }
        }

        let outcome = guard::check(
            candidate,
            &GuardContext {
                current_state: &self.q,
                current_pointer: &self.d,
            },
        );
        for issue in &outcome.issues {
            debug!(?issue, "guard advisory");
        }

        if outcome.trapped {
            let t = outcome.transition;
            self.advance(t.q_next, t.d_next)?;
            return Ok(false);
        }

        // side effects on the *current* cell, in textual order; the head
        // moves only after they are applied
        if !outcome.transition.is_no_write() {
            self.apply(&raw.s_prime, &parsed).await?;
        }
        if raw.s_prime.trim().is_empty()
            && !raw.is_no_write()
            && outcome.transition.q_next != HALT
        {
            self.note_cell(DISCIPLINE_ERROR_MARKER)?;
        }

        let t = outcome.transition;
        let decision = self.watchdog.inspect(&t.d_next, &t.q_next);
        if decision.triggered {
            let banner = watchdog::recovery_state(
                decision.reason.expect("triggered decision carries a reason"),
                &decision.fingerprint,
                &self.q,
            );
            self.advance(banner, ERROR_RECOVERY.to_string())?;
            return Ok(false);
        }

        let halted = t.q_next == HALT && t.d_next == HALT;
        self.advance(t.q_next, t.d_next)?;
        Ok(halted)
    }

    async fn apply(&mut self, s_prime: &str, parsed: &[Action]) -> Result<(), EngineError> {
        // a tagless payload is one free-form append, applied verbatim
        if let [Action::Write(text)] = parsed {
            if text == s_prime.trim() {
                self.manifold.interfere(&self.d, text)?;
                return Ok(());
            }
        }

        for action in parsed {
            match action {
                Action::Write(text) => {
                    self.manifold.append(&self.d, text, true)?;
                }
                Action::Erase { start, end } => {
                    self.span_edit_feedback(self.manifold.erase(&self.d, *start, *end)?)?;
                }
                Action::Replace {
                    start,
                    end,
                    payload,
                } => {
                    self.span_edit_feedback(
                        self.manifold.replace(&self.d, *start, *end, payload)?,
                    )?;
                }
                Action::Exec(cmd) => {
                    let outcome = self.manifold.exec(cmd).await;
                    let marker = outcome.result_marker(cmd);
                    self.manifold.append(&self.d, &marker, true)?;
                }
                Action::Goto(_) | Action::State(_) => {}
            }
        }
        Ok(())
    }

    // advisory markers originating in the kernel itself respect the same
    // main-tape protection the guard applies to oracle writes
    fn note_cell(&self, note: &str) -> Result<(), EngineError> {
        if pointer::normalize(&self.d) == MAIN_TAPE_POINTER
            && !self.q.contains(guard::ALLOW_MAIN_TAPE_WRITE)
        {
            debug!(note, "dropping kernel marker aimed at the protected tape");
            return Ok(());
        }
        self.manifold.append(&self.d, note, true)?;
        Ok(())
    }

    fn span_edit_feedback(&mut self, edit: SpanEdit) -> Result<(), EngineError> {
        if edit == SpanEdit::RomViolation {
            let marker = format!(
                "[ROM VIOLATION: lines 1-{} are in-ink and cannot be erased or replaced]",
                self.manifold.rom_lines()
            );
            self.manifold.append(&self.d, &marker, true)?;
        }
        Ok(())
    }

    // persist q, then d, then broadcast; the in-memory registers follow the
    // disk so a crash at any point replays from a consistent pair
    fn advance(&mut self, q_next: String, d_next: String) -> Result<(), EngineError> {
        if self.q.lines().next() != q_next.lines().next() {
            self.last_state_change = Instant::now();
        }
        self.workspace.write_q(&q_next)?;
        self.workspace.write_d(&d_next)?;
        self.q = q_next;
        self.d = d_next;
        self.ticks += 1;

        let _ = self.events.send(RuntimeEvent::State {
            q: self.q.clone(),
            d: self.d.clone(),
        });
        if let Ok(tape) = fs::read_to_string(self.workspace.tape_path()) {
            let _ = self.events.send(RuntimeEvent::Tape(tape));
        }
        Ok(())
    }
}
