pub mod api;
pub mod scripted;

use async_trait::async_trait;

use crate::machine::Transition;

/// The transition function δ. Stateless: each call carries the discipline,
/// the full state, the observation, and the pointer; nothing is remembered
/// between calls, which is what makes the engine resumable.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn collapse(
        &self,
        discipline: &str,
        q: &str,
        s: &str,
        d: &str,
    ) -> anyhow::Result<Transition>;
}

/// Single user message sent per call: discipline, machine protocol, then the
/// three labeled blocks.
pub fn compose_prompt(discipline: &str, q: &str, s: &str, d: &str) -> String {
    format!(
        "{}\n\n{}\nCURRENT_POINTER_D:\n{}\n\nCURRENT_STATE_Q:\n{}\n\nCURRENT_OBSERVATION_S:\n{}\n",
        discipline.trim_end(),
        crate::discipline::MACHINE_PROTOCOL,
        d,
        q,
        s
    )
}

/// Extracts a transition from raw oracle output. Tries the text verbatim,
/// then the first balanced JSON object after stripping code fences. Returns
/// `None` for anything that fails validation (missing `s_prime` included).
pub fn parse_transition(raw: &str) -> Option<Transition> {
    if let Some(t) = parse_json(raw) {
        return Some(t);
    }
    let stripped = strip_fences(raw);
    let object = balanced_object(&stripped)?;
    parse_json(object)
}

fn parse_json(s: &str) -> Option<Transition> {
    let value: serde_json::Value = serde_json::from_str(s.trim()).ok()?;
    let q_next = value.get("q_next")?.as_str()?.to_string();
    let s_prime = value.get("s_prime")?.as_str()?.to_string();
    let d_next = value.get("d_next")?.as_str()?.to_string();
    if q_next.is_empty() || d_next.is_empty() {
        return None;
    }
    Some(Transition {
        q_next,
        s_prime,
        d_next,
    })
}

fn strip_fences(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

// first balanced {...}, tracking JSON string context so braces in values
// don't truncate the object
fn balanced_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
