use std::{
    fs::{self, File},
    io::{self, ErrorKind, Read, Seek, SeekFrom, Write},
    path::Path,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{process::Command, time::timeout};
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::EngineError,
    pointer::{self, PointerClass},
    workspace::Workspace,
};

/// Sentinel slice for a file pointer with nothing behind it.
pub const FILE_NOT_FOUND: &str = "[FILE_NOT_FOUND]";

const SILENT_SUCCESS: &str = "Silent Success";

/// The sole adapter between the abstract pointer space and the physical
/// world: files, subprocesses, URLs, and the synthetic `sys://` cells.
pub struct Manifold {
    workspace: Arc<Workspace>,
    exec_timeout: Duration,
    max_stdout: usize,
    slice_lines: usize,
    slice_head: usize,
    slice_tail: usize,
    rom_lines: usize,
    http: reqwest::Client,
}

/// Result of a span edit; everything but `Applied` leaves the file untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanEdit {
    Applied,
    OutOfBounds,
    RomViolation,
    NotAFile,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub elapsed: Duration,
}

impl ExecOutcome {
    /// Slice form shown when a shell pointer is observed.
    pub fn slice(&self) -> String {
        if self.timed_out {
            return format!("[COMMAND TIMED OUT after {}s]", self.elapsed.as_secs());
        }
        if self.success {
            self.output.clone()
        } else {
            format!(
                "[EXEC ERROR exit={}]\n{}",
                self.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                self.output
            )
        }
    }

    /// Marker appended to the current cell for an `<EXEC>` action.
    pub fn result_marker(&self, cmd: &str) -> String {
        let head: String = cmd.chars().take(20).collect();
        let ellipsis = if cmd.chars().count() > 20 { "…" } else { "" };
        if self.timed_out {
            format!(
                "[EXEC ERROR for `{}{}`]: [COMMAND TIMED OUT after {}s]",
                head,
                ellipsis,
                self.elapsed.as_secs()
            )
        } else if self.success {
            let out = self.output.trim();
            let out = if out.is_empty() { SILENT_SUCCESS } else { out };
            format!("[EXEC RESULT for `{}{}`]: {}", head, ellipsis, out)
        } else {
            format!(
                "[EXEC ERROR for `{}{}` exit={}]: {}",
                head,
                ellipsis,
                self.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                self.output.trim()
            )
        }
    }
}

impl Manifold {
    pub fn new(workspace: Arc<Workspace>, config: &Config) -> Self {
        Self {
            workspace,
            exec_timeout: config.exec_timeout,
            max_stdout: config.max_stdout,
            slice_lines: config.slice_lines,
            slice_head: config.slice_head(),
            slice_tail: config.slice_tail(),
            rom_lines: config.rom_lines,
            http: reqwest::Client::builder()
                .timeout(config.exec_timeout)
                .build()
                .expect("default reqwest client"),
        }
    }

    /// Resolves a pointer to a bounded text slice. Classified failures come
    /// back as marker slices; only a workspace escape is an error.
    pub async fn observe(&self, d: &str) -> Result<String, EngineError> {
        match pointer::classify(d) {
            PointerClass::Halt | PointerClass::System => Ok(String::new()),
            PointerClass::Trap => {
                let code = pointer::trap_code(d).unwrap_or("unknown");
                Ok(format!(
                    "[TRAP {}] The previous transition was rejected by the guard. \
                     Re-read your state, then emit a legal pointer.",
                    code
                ))
            }
            PointerClass::Shell => {
                let cmd = pointer::shell_command(d).unwrap_or_default();
                Ok(self.exec(cmd).await.slice())
            }
            PointerClass::Url => Ok(self.fetch(d).await),
            PointerClass::File => self.observe_file(d),
            PointerClass::Invalid => Ok(format!("[INVALID POINTER {:?}]", d)),
        }
    }

    /// Free-form write path: appends apply only to file pointers, everything
    /// else is silently dropped (the guard reports it separately).
    pub fn interfere(&self, d: &str, payload: &str) -> Result<bool, EngineError> {
        self.append(d, payload, false)
    }

    fn observe_file(&self, d: &str) -> Result<String, EngineError> {
        let path = self.workspace.resolve(d)?;
        if path.is_dir() {
            return Ok(FILE_NOT_FOUND.to_string());
        }
        match fs::read_to_string(&path) {
            Ok(content) => Ok(self.render_slice(&content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(FILE_NOT_FOUND.to_string()),
            Err(e) => Err(e.into()),
        }
    }

    // head/tail windows with original 1-based numbering restored across the gap
    fn render_slice(&self, content: &str) -> String {
        let lines: Vec<&str> = content.lines().collect();
        let mut out = String::new();
        if lines.len() <= self.slice_lines {
            for (i, line) in lines.iter().enumerate() {
                push_numbered(&mut out, i + 1, line);
            }
        } else {
            let tail_start = lines.len() - self.slice_tail;
            for (i, line) in lines[..self.slice_head].iter().enumerate() {
                push_numbered(&mut out, i + 1, line);
            }
            out.push_str(&format!(
                "[TAPE TOO LONG: lines {}-{} hidden ({} lines). Shrink this file with <ERASE start=\"a\" end=\"b\"/> or <REPLACE start=\"a\" end=\"b\">…</REPLACE>.]\n",
                self.slice_head + 1,
                tail_start,
                tail_start - self.slice_head
            ));
            for (i, line) in lines[tail_start..].iter().enumerate() {
                push_numbered(&mut out, tail_start + i + 1, line);
            }
        }
        out
    }

    /// Appends to a file cell. `newline_wrap` adds a trailing newline (the
    /// `<WRITE>` tag form); free-form appends go in verbatim. A separating
    /// newline is inserted only when the file has unterminated content.
    pub fn append(&self, d: &str, payload: &str, newline_wrap: bool) -> Result<bool, EngineError> {
        if pointer::classify(d) != PointerClass::File {
            debug!(pointer = d, "dropping write to non-file pointer");
            return Ok(false);
        }
        let path = self.workspace.resolve(d)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        if needs_separator(&path)? {
            file.write_all(b"\n")?;
        }
        file.write_all(payload.as_bytes())?;
        if newline_wrap && !payload.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(true)
    }

    /// Removes lines `start..=end`, leaving a single scar marker in their
    /// place. Out-of-range bounds drop the action without touching the file.
    pub fn erase(&self, d: &str, start: usize, end: usize) -> Result<SpanEdit, EngineError> {
        let scar = format!("[SCAR: lines {}-{} erased]", start, end);
        self.span_edit(d, start, end, vec![scar])
    }

    /// Replaces lines `start..=end` with the payload, trimmed of leading and
    /// trailing empty lines.
    pub fn replace(
        &self,
        d: &str,
        start: usize,
        end: usize,
        payload: &str,
    ) -> Result<SpanEdit, EngineError> {
        let trimmed = payload.trim_matches(['\n', '\r']);
        let lines: Vec<String> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.lines().map(|l| l.to_string()).collect()
        };
        self.span_edit(d, start, end, lines)
    }

    fn span_edit(
        &self,
        d: &str,
        start: usize,
        end: usize,
        insert: Vec<String>,
    ) -> Result<SpanEdit, EngineError> {
        if pointer::classify(d) != PointerClass::File {
            return Ok(SpanEdit::NotAFile);
        }
        let path = self.workspace.resolve(d)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SpanEdit::OutOfBounds),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<&str> = content.lines().collect();
        if start < 1 || start > end || end > lines.len() {
            warn!(pointer = d, start, end, "span edit out of bounds, dropped");
            return Ok(SpanEdit::OutOfBounds);
        }
        if self.rom_lines > 0 && path == self.workspace.tape_path() && start <= self.rom_lines {
            return Ok(SpanEdit::RomViolation);
        }

        let mut next: Vec<&str> = Vec::with_capacity(lines.len());
        next.extend(&lines[..start - 1]);
        let insert_refs: Vec<&str> = insert.iter().map(|s| s.as_str()).collect();
        next.extend(insert_refs);
        next.extend(&lines[end..]);

        let mut body = next.join("\n");
        if content.ends_with('\n') {
            body.push('\n');
        }
        write_atomic(&path, &body)?;
        Ok(SpanEdit::Applied)
    }

    pub fn rom_lines(&self) -> usize {
        self.rom_lines
    }

    /// Runs a command through the shell with `cwd = workspace`, merged
    /// stdout/stderr, and SIGKILL past the timeout.
    pub async fn exec(&self, cmd: &str) -> ExecOutcome {
        let started = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(self.workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return ExecOutcome {
                    success: false,
                    timed_out: false,
                    exit_code: None,
                    output: format!("failed to spawn: {}", e),
                    elapsed: started.elapsed(),
                }
            }
        };

        match timeout(self.exec_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
                merged.push_str(&String::from_utf8_lossy(&output.stderr));
                ExecOutcome {
                    success: output.status.success(),
                    timed_out: false,
                    exit_code: output.status.code(),
                    output: cap_tail(&merged, self.max_stdout),
                    elapsed: started.elapsed(),
                }
            }
            Ok(Err(e)) => ExecOutcome {
                success: false,
                timed_out: false,
                exit_code: None,
                output: format!("wait failed: {}", e),
                elapsed: started.elapsed(),
            },
            // dropping the timed-out future drops the child, which kill_on_drop
            // turns into SIGKILL
            Err(_) => ExecOutcome {
                success: false,
                timed_out: true,
                exit_code: None,
                output: String::new(),
                elapsed: started.elapsed(),
            },
        }
    }

    /// GET a URL pointer; failures come back as marker slices, never errors.
    pub async fn fetch(&self, url: &str) -> String {
        match self.http.get(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                match resp.text().await {
                    Ok(body) => {
                        let body = cap_tail(&body, self.max_stdout);
                        if status.is_success() {
                            body
                        } else {
                            format!("[HTTP {}]\n{}", status.as_u16(), body)
                        }
                    }
                    Err(e) => format!("[FETCH ERROR: {}]", e),
                }
            }
            Err(e) => format!("[FETCH ERROR: {}]", e),
        }
    }
}

fn push_numbered(out: &mut String, number: usize, line: &str) {
    out.push_str(&format!("{:04}| {}\n", number, line));
}

// true when the file ends in a non-newline byte
fn needs_separator(path: &Path) -> io::Result<bool> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn write_atomic(path: &Path, body: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp-span");
    let mut file = File::create(&tmp)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp, path)
}

/// Keeps the tail of an oversized capture, with a note about what fell off.
fn cap_tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = s.len() - max;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    format!("[... {} bytes truncated ...]\n{}", cut, &s[cut..])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::machine::MAIN_TAPE_POINTER;

    fn fixture() -> (tempfile::TempDir, Manifold) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        ws.boot().unwrap();
        let manifold = Manifold::new(Arc::new(ws), &Config::default());
        (dir, manifold)
    }

    fn fixture_with(config: Config) -> (tempfile::TempDir, Manifold) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        ws.boot().unwrap();
        let manifold = Manifold::new(Arc::new(ws), &config);
        (dir, manifold)
    }

    #[tokio::test]
    async fn short_files_are_numbered_in_full() {
        let (_dir, m) = fixture();
        m.append("./notes.txt", "alpha\nbeta\ngamma", false).unwrap();
        let slice = m.observe("./notes.txt").await.unwrap();
        assert_eq!(slice, "0001| alpha\n0002| beta\n0003| gamma\n");
    }

    #[tokio::test]
    async fn long_files_keep_head_and_tail_numbering() {
        let (_dir, m) = fixture();
        let content: String = (1..=2_500).map(|i| format!("line {}\n", i)).collect();
        m.append("./big.txt", &content, false).unwrap();

        let slice = m.observe("./big.txt").await.unwrap();
        let lines: Vec<&str> = slice.lines().collect();
        assert_eq!(lines.len(), 2_001); // 500 head + marker + 1500 tail
        assert_eq!(lines[0], "0001| line 1");
        assert_eq!(lines[499], "0500| line 500");
        assert!(lines[500].starts_with("[TAPE TOO LONG: lines 501-1000 hidden (500 lines)"));
        assert_eq!(lines[501], "1001| line 1001");
        assert_eq!(lines[2_000], "2500| line 2500");
    }

    #[tokio::test]
    async fn missing_file_is_the_sentinel() {
        let (_dir, m) = fixture();
        assert_eq!(m.observe("./nope.txt").await.unwrap(), FILE_NOT_FOUND);
    }

    #[tokio::test]
    async fn trap_and_system_cells_are_synthetic() {
        let (_dir, m) = fixture();
        assert_eq!(m.observe("sys://error_recovery").await.unwrap(), "");
        let trap = m.observe("sys://trap/invalid_pointer").await.unwrap();
        assert!(trap.contains("invalid_pointer"));
    }

    #[test]
    fn append_separates_unterminated_content() {
        let (_dir, m) = fixture();
        m.append("./log.txt", "first", false).unwrap();
        m.append("./log.txt", "second", false).unwrap();
        let content = fs::read_to_string(m.workspace.resolve("./log.txt").unwrap()).unwrap();
        assert_eq!(content, "first\nsecond");
    }

    #[test]
    fn append_drops_non_file_pointers() {
        let (_dir, m) = fixture();
        assert!(!m.append("$ ls", "payload", false).unwrap());
        assert!(!m.append("HALT", "payload", false).unwrap());
    }

    #[test]
    fn erase_leaves_a_scar() {
        let (_dir, m) = fixture();
        m.append("./doc.txt", "a\nb\nc\nd\n", false).unwrap();
        assert_eq!(m.erase("./doc.txt", 2, 3).unwrap(), SpanEdit::Applied);
        let content = fs::read_to_string(m.workspace.resolve("./doc.txt").unwrap()).unwrap();
        assert_eq!(content, "a\n[SCAR: lines 2-3 erased]\nd\n");
    }

    #[test]
    fn out_of_bounds_spans_are_dropped() {
        let (_dir, m) = fixture();
        m.append("./doc.txt", "a\nb\n", false).unwrap();
        assert_eq!(m.erase("./doc.txt", 0, 1).unwrap(), SpanEdit::OutOfBounds);
        assert_eq!(m.erase("./doc.txt", 2, 9).unwrap(), SpanEdit::OutOfBounds);
        assert_eq!(m.erase("./doc.txt", 2, 1).unwrap(), SpanEdit::OutOfBounds);
        let content = fs::read_to_string(m.workspace.resolve("./doc.txt").unwrap()).unwrap();
        assert_eq!(content, "a\nb\n");
    }

    #[test]
    fn replace_trims_empty_edges() {
        let (_dir, m) = fixture();
        m.append("./doc.txt", "a\nb\nc\n", false).unwrap();
        assert_eq!(
            m.replace("./doc.txt", 2, 2, "\n\nnew b\nnew b2\n\n").unwrap(),
            SpanEdit::Applied
        );
        let content = fs::read_to_string(m.workspace.resolve("./doc.txt").unwrap()).unwrap();
        assert_eq!(content, "a\nnew b\nnew b2\nc\n");
    }

    #[test]
    fn rom_prefix_of_the_tape_is_immutable() {
        let (_dir, m) = fixture();
        m.append(MAIN_TAPE_POINTER, "body\n", false).unwrap();
        assert_eq!(m.erase(MAIN_TAPE_POINTER, 1, 1).unwrap(), SpanEdit::RomViolation);
        // below the ROM prefix edits are fine
        assert_eq!(m.erase(MAIN_TAPE_POINTER, 2, 2).unwrap(), SpanEdit::Applied);
    }

    #[tokio::test]
    async fn exec_captures_merged_output() {
        let (_dir, m) = fixture();
        let out = m.exec("echo out; echo err 1>&2").await;
        assert!(out.success);
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[tokio::test]
    async fn exec_failure_slices_carry_the_exit_code() {
        let (_dir, m) = fixture();
        let out = m.exec("echo boom 1>&2; exit 3").await;
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        let slice = out.slice();
        assert!(slice.starts_with("[EXEC ERROR exit=3]"));
        assert!(slice.contains("boom"));
    }

    #[tokio::test]
    async fn exec_times_out_with_sigkill() {
        let mut cfg = Config::default();
        cfg.exec_timeout = Duration::from_millis(200);
        let (_dir, m) = fixture_with(cfg);
        let out = m.exec("sleep 5").await;
        assert!(out.timed_out);
        assert!(out.slice().starts_with("[COMMAND TIMED OUT after"));
    }

    #[tokio::test]
    async fn exec_result_marker_forms() {
        let (_dir, m) = fixture();
        let ok = m.exec("true").await;
        assert_eq!(ok.result_marker("true"), "[EXEC RESULT for `true`]: Silent Success");

        let long = m.exec("echo hi").await;
        let marker = long.result_marker("echo hi && echo this is a long command");
        assert!(marker.starts_with("[EXEC RESULT for `echo hi && echo this…`]"));
    }

    #[test]
    fn cap_tail_keeps_the_end() {
        let s = "x".repeat(100);
        let capped = cap_tail(&s, 10);
        assert!(capped.starts_with("[... 90 bytes truncated ...]"));
        assert!(capped.ends_with(&"x".repeat(10)));
    }
}
