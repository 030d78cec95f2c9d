use crate::machine::HALT;

pub const ERROR_RECOVERY: &str = "sys://error_recovery";
pub const TRAP_PREFIX: &str = "sys://trap/";

/// Every pointer the oracle can emit falls into exactly one class; `Invalid`
/// is what the guard traps on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerClass {
    Halt,
    Trap,
    System,
    Shell,
    Url,
    File,
    Invalid,
}

pub fn trap(code: &str) -> String {
    format!("{}{}", TRAP_PREFIX, code)
}

pub fn trap_code(d: &str) -> Option<&str> {
    d.strip_prefix(TRAP_PREFIX).filter(|c| !c.is_empty())
}

/// Command line behind a shell pointer (`$ cmd` or `tty://target`).
pub fn shell_command(d: &str) -> Option<&str> {
    if let Some(cmd) = d.strip_prefix("$ ") {
        return Some(cmd.trim()).filter(|c| !c.is_empty());
    }
    if let Some(target) = d.strip_prefix("tty://") {
        return Some(target.trim()).filter(|c| !c.is_empty());
    }
    None
}

/// Cleans up the junk LLMs wrap around pointers: whitespace, trailing commas,
/// quote/bracket pairs. Bare `name.ext` is rewritten to `./name.ext`.
pub fn normalize(raw: &str) -> String {
    let mut s = raw.trim();

    loop {
        let before = s;
        s = s.trim_end_matches(',').trim();
        for (open, close) in [('"', '"'), ('\'', '\''), ('`', '`'), ('[', ']'), ('<', '>')] {
            if s.len() >= 2 && s.starts_with(open) && s.ends_with(close) {
                s = s[open.len_utf8()..s.len() - close.len_utf8()].trim();
            }
        }
        if s == before {
            break;
        }
    }

    if bare_file_candidate(s) {
        return format!("./{}", s);
    }
    s.to_string()
}

fn bare_file_candidate(s: &str) -> bool {
    !s.is_empty()
        && s != HALT
        && !s.starts_with("./")
        && !s.starts_with('/')
        && !s.starts_with("$ ")
        && !s.starts_with("sys://")
        && !s.starts_with("tty://")
        && !s.starts_with("http://")
        && !s.starts_with("https://")
        && !s.contains("..")
        && !s.chars().any(char::is_whitespace)
        && (s.contains('.') || s.contains('/'))
}

/// Classifies an already-normalized pointer.
pub fn classify(d: &str) -> PointerClass {
    if d == HALT {
        return PointerClass::Halt;
    }
    if trap_code(d).is_some() {
        return PointerClass::Trap;
    }
    if d == ERROR_RECOVERY {
        return PointerClass::System;
    }
    if shell_command(d).is_some() {
        return PointerClass::Shell;
    }
    if d.starts_with("http://") || d.starts_with("https://") {
        return PointerClass::Url;
    }
    // path traversal is never legal, in any position
    if d.contains("..") {
        return PointerClass::Invalid;
    }
    if let Some(rel) = d.strip_prefix("./") {
        if !rel.is_empty() {
            return PointerClass::File;
        }
    }
    if d.len() > 1 && d.starts_with('/') {
        return PointerClass::File;
    }
    PointerClass::Invalid
}
