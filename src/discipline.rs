use std::fs;

use tracing::warn;

use crate::config::Config;

/// Fixed machine-protocol preamble sent on every oracle call, after the
/// discipline document. The numbered rules are the contract the guard
/// enforces; restating them keeps an undisciplined oracle short-leashed.
pub const MACHINE_PROTOCOL: &str = "\
MACHINE PROTOCOL
1. You are the transition function of a Turing-style machine. You are stateless: everything you know is in CURRENT_STATE_Q, CURRENT_POINTER_D, and CURRENT_OBSERVATION_S below.
2. Respond with exactly one transition: {\"q_next\": ..., \"s_prime\": ..., \"d_next\": ...}.
3. s_prime is applied to the CURRENT pointer, not to d_next. To write somewhere else, first navigate there (one tick), then write (next tick).
4. Emit the literal marker 👆 as s_prime when you do not want to alter the current cell.
5. Writes to ./MAIN_TAPE.md are rejected unless q_next carries [ALLOW_MAIN_TAPE_WRITE]. Use it only for final reports.
6. When a requirement says to copy something exactly, copy it byte for byte; never paraphrase content you were told to preserve.
7. d_next must be one of: HALT, sys://error_recovery, ./relative/path, /absolute/path inside the workspace, http(s)://url, or `$ command`. Anything else is trapped.
8. Never use `..` in a path. The workspace boundary is absolute.
9. s_prime may carry structured spans: <WRITE>…</WRITE>, <ERASE start=\"a\" end=\"b\"/>, <REPLACE start=\"a\" end=\"b\">…</REPLACE>, <EXEC>cmd</EXEC>. Line bounds are 1-based and inclusive.
10. To stop, emit q_next = HALT and d_next = HALT together. Nothing else halts the machine.
";

/// Default discipline used when no PROMPT_FILE is configured. Deliberately
/// the variant that includes the CURRENT_POINTER_D block.
pub const DEFAULT_DISCIPLINE: &str = "\
You are an autonomous engineering agent operating a filesystem workspace.

Work in small, verifiable steps. Read before you write. Run commands to check
your work and read their output before claiming success. Record progress and
intermediate notes in scratch files, not in your state string. The state
string q is your working register: keep its first line a short machine-ish
label like `q_2: RUNNING_TESTS` so progress is visible.

When the observation shows a truncation marker, the file is over budget:
shrink it with <ERASE> or <REPLACE> before doing anything else there.

Finish by writing a final report to ./MAIN_TAPE.md (with
[ALLOW_MAIN_TAPE_WRITE] in q_next), then halt.
";

/// Loads the discipline document. Re-read every tick so an operator can edit
/// the prompt file mid-run; any failure falls back to the built-in default.
pub fn load(config: &Config) -> String {
    match &config.prompt_file {
        Some(path) => match fs::read_to_string(path) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!(path = %path.display(), "prompt file is empty, using built-in discipline");
                DEFAULT_DISCIPLINE.to_string()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "prompt file unreadable, using built-in discipline");
                DEFAULT_DISCIPLINE.to_string()
            }
        },
        None => DEFAULT_DISCIPLINE.to_string(),
    }
}
