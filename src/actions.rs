/// Structured spans the oracle can embed in `s_prime`. Parsed in textual
/// order; plain text between tags is an ordinary append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Write(String),
    Erase { start: usize, end: usize },
    Replace { start: usize, end: usize, payload: String },
    Exec(String),
    Goto(String),
    State(String),
}

/// Scans `s_prime` into an ordered action sequence. A payload with no tags is
/// one free-form `Write`. Tags with unparseable integer bounds are dropped;
/// malformed tag syntax falls back to plain text.
pub fn parse(s_prime: &str) -> Vec<Action> {
    let mut out = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while cursor < s_prime.len() {
        let Some(at) = find_candidate(s_prime, cursor) else {
            break;
        };
        match parse_tag(s_prime, at) {
            Some((action, next)) => {
                push_text(&mut out, &s_prime[text_start..at]);
                if let Some(action) = action {
                    out.push(action);
                }
                text_start = next;
                cursor = next;
            }
            // not actually a tag: keep it as text and move on
            None => cursor = at + 1,
        }
    }
    push_text(&mut out, &s_prime[text_start..]);
    out
}

fn push_text(out: &mut Vec<Action>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        out.push(Action::Write(text.to_string()));
    }
}

const TAG_STARTS: &[&str] = &["<WRITE>", "<ERASE", "<REPLACE", "<EXEC>", "<GOTO", "<STATE>"];

fn find_candidate(s: &str, from: usize) -> Option<usize> {
    TAG_STARTS
        .iter()
        .filter_map(|t| s[from..].find(t).map(|p| from + p))
        .min()
}

// returns (action-or-dropped, position after the tag), or None when the text
// at `at` is not a well-formed tag
fn parse_tag(s: &str, at: usize) -> Option<(Option<Action>, usize)> {
    let rest = &s[at..];
    if rest.starts_with("<WRITE>") {
        let (payload, next) = paired_body(rest, "<WRITE>", "</WRITE>")?;
        return Some((Some(Action::Write(payload.to_string())), at + next));
    }
    if rest.starts_with("<EXEC>") {
        let (payload, next) = paired_body(rest, "<EXEC>", "</EXEC>")?;
        let cmd = payload.trim();
        let action = (!cmd.is_empty()).then(|| Action::Exec(cmd.to_string()));
        return Some((action, at + next));
    }
    if rest.starts_with("<STATE>") {
        let (payload, next) = paired_body(rest, "<STATE>", "</STATE>")?;
        let state = payload.trim();
        let action = (!state.is_empty()).then(|| Action::State(state.to_string()));
        return Some((action, at + next));
    }
    if rest.starts_with("<ERASE") {
        let close = rest.find("/>")?;
        let head = &rest["<ERASE".len()..close];
        let action = match (attr_usize(head, "start"), attr_usize(head, "end")) {
            (Some(start), Some(end)) => Some(Action::Erase { start, end }),
            _ => None,
        };
        return Some((action, at + close + "/>".len()));
    }
    if rest.starts_with("<GOTO") {
        let close = rest.find("/>")?;
        let head = &rest["<GOTO".len()..close];
        let action = attr_str(head, "path")
            .filter(|p| !p.is_empty())
            .map(|p| Action::Goto(p.to_string()));
        return Some((action, at + close + "/>".len()));
    }
    if rest.starts_with("<REPLACE") {
        let head_close = rest.find('>')?;
        if rest[..head_close].contains('/') {
            return None;
        }
        let head = &rest["<REPLACE".len()..head_close];
        let body_start = head_close + 1;
        let body_end = rest[body_start..].find("</REPLACE>")? + body_start;
        let next = body_end + "</REPLACE>".len();
        let action = match (attr_usize(head, "start"), attr_usize(head, "end")) {
            (Some(start), Some(end)) => Some(Action::Replace {
                start,
                end,
                payload: rest[body_start..body_end].to_string(),
            }),
            _ => None,
        };
        return Some((action, at + next));
    }
    None
}

fn paired_body<'a>(rest: &'a str, open: &str, close: &str) -> Option<(&'a str, usize)> {
    let body_start = open.len();
    let body_end = rest[body_start..].find(close)? + body_start;
    Some((&rest[body_start..body_end], body_end + close.len()))
}

// attribute values are double-quoted; integer parses are strict
fn attr_str<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", name);
    let start = head.find(&needle)? + needle.len();
    let end = head[start..].find('"')? + start;
    Some(&head[start..end])
}

fn attr_usize(head: &str, name: &str) -> Option<usize> {
    attr_str(head, name)?.trim().parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_text_is_one_write() {
        assert_eq!(
            parse("just some text"),
            vec![Action::Write("just some text".to_string())]
        );
        assert_eq!(parse("   \n "), vec![]);
    }

    #[test]
    fn tags_parse_in_textual_order() {
        let payload = "note\n<EXEC>make build</EXEC>\n<ERASE start=\"3\" end=\"5\"/>\n<WRITE>done</WRITE>";
        assert_eq!(
            parse(payload),
            vec![
                Action::Write("note".to_string()),
                Action::Exec("make build".to_string()),
                Action::Erase { start: 3, end: 5 },
                Action::Write("done".to_string()),
            ]
        );
    }

    #[test]
    fn replace_keeps_payload_verbatim() {
        let payload = "<REPLACE start=\"2\" end=\"4\">\nnew line a\nnew line b\n</REPLACE>";
        assert_eq!(
            parse(payload),
            vec![Action::Replace {
                start: 2,
                end: 4,
                payload: "\nnew line a\nnew line b\n".to_string(),
            }]
        );
    }

    #[test]
    fn goto_and_state_carry_the_tag_grammar() {
        let payload = "<STATE>q_2: NEXT</STATE><GOTO path=\"./notes.txt\"/>";
        assert_eq!(
            parse(payload),
            vec![
                Action::State("q_2: NEXT".to_string()),
                Action::Goto("./notes.txt".to_string()),
            ]
        );
    }

    #[test]
    fn bad_bounds_are_dropped_silently() {
        assert_eq!(parse("<ERASE start=\"x\" end=\"5\"/>"), vec![]);
        assert_eq!(parse("<ERASE start=\"1\"/>"), vec![]);
        assert_eq!(
            parse("<REPLACE start=\"a\" end=\"b\">body</REPLACE>"),
            vec![]
        );
    }

    #[test]
    fn unclosed_tags_fall_back_to_text() {
        assert_eq!(
            parse("<WRITE>never closed"),
            vec![Action::Write("<WRITE>never closed".to_string())]
        );
        assert_eq!(
            parse("<EXEC>half open"),
            vec![Action::Write("<EXEC>half open".to_string())]
        );
    }

    #[test]
    fn unknown_tags_are_text() {
        assert_eq!(
            parse("<NOTE>hello</NOTE>"),
            vec![Action::Write("<NOTE>hello</NOTE>".to_string())]
        );
    }
}
