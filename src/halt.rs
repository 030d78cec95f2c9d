use crate::machine::{Transition, HALT};

/// Marker a state can carry to request a halt without being the literal word.
pub const HALT_MARKER: &str = "[HALT]";

/// Recognizes every halt spelling the oracle has been observed to emit:
/// the exact literal, the structural marker, or a whole-word `HALT` with an
/// optional `_SUFFIX`.
pub fn is_halt_like(q: &str) -> bool {
    let q = q.trim();
    if q == HALT || q.contains(HALT_MARKER) {
        return true;
    }
    contains_halt_word(q)
}

// whole-word HALT, optionally followed by _ and [A-Z0-9]+
fn contains_halt_word(q: &str) -> bool {
    let bytes = q.as_bytes();
    let mut start = 0;
    while let Some(found) = q[start..].find(HALT) {
        let at = start + found;
        let before_ok = at == 0 || !is_word_byte(bytes[at - 1]);
        if before_ok {
            let mut end = at + HALT.len();
            if end < bytes.len() && bytes[end] == b'_' {
                let suffix_start = end + 1;
                let mut cursor = suffix_start;
                while cursor < bytes.len()
                    && (bytes[cursor].is_ascii_uppercase() || bytes[cursor].is_ascii_digit())
                {
                    cursor += 1;
                }
                if cursor > suffix_start {
                    end = cursor;
                }
            }
            let after_ok = end == bytes.len() || !is_word_byte(bytes[end]);
            if after_ok {
                return true;
            }
        }
        start = at + HALT.len();
    }
    false
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// The one shape a halt is allowed to take. Idempotent: canonicalizing a
/// canonical transition changes nothing.
pub fn canonical(s_prime: &str) -> Transition {
    Transition::new(HALT, s_prime, HALT)
}
