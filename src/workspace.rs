use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Component, Path, PathBuf},
};

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use tracing::{debug, warn};

use crate::{
    error::EngineError,
    machine::{MAIN_TAPE, MAIN_TAPE_POINTER, Q_BOOT},
};

pub const REG_Q: &str = ".reg_q";
pub const REG_D: &str = ".reg_d";
pub const LOCK_FILE: &str = ".runtime_lock";

const TAPE_HEADER: &str = "# MAIN TAPE\n";

/// The workspace directory is the entire memory of the machine: two register
/// files, the main tape, and whatever files the oracle creates.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Opens (creating if needed) the workspace root. The stored root is the
    /// real path, so containment checks are symlink-proof.
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        let root = root.as_ref().canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tape_path(&self) -> PathBuf {
        self.root.join(MAIN_TAPE)
    }

    /// Initializes any missing register or tape file to its default. Never
    /// touches files that already exist, so booting a crashed workspace is a
    /// no-op apart from logging.
    pub fn boot(&self) -> io::Result<()> {
        let tape = self.tape_path();
        if !tape.exists() {
            fs::write(&tape, TAPE_HEADER)?;
        }
        if !self.root.join(REG_Q).exists() {
            self.write_q(Q_BOOT)?;
        }
        if !self.root.join(REG_D).exists() {
            self.write_d(MAIN_TAPE_POINTER)?;
        }
        debug!(root = %self.root.display(), "workspace booted");
        Ok(())
    }

    pub fn read_q(&self) -> io::Result<String> {
        self.read_register(REG_Q)
    }

    pub fn read_d(&self) -> io::Result<String> {
        self.read_register(REG_D)
    }

    pub fn write_q(&self, value: &str) -> io::Result<()> {
        self.write_register(REG_Q, value)
    }

    pub fn write_d(&self, value: &str) -> io::Result<()> {
        self.write_register(REG_D, value)
    }

    fn read_register(&self, name: &str) -> io::Result<String> {
        Ok(fs::read_to_string(self.root.join(name))?.trim().to_string())
    }

    // trimmed value + trailing newline, via tmp + fsync + rename so a crash
    // mid-write leaves the previous value intact
    fn write_register(&self, name: &str, value: &str) -> io::Result<()> {
        let tmp = self.root.join(format!("{}.tmp", name));
        let mut file = File::create(&tmp)?;
        file.write_all(value.trim().as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);
        fs::rename(tmp, self.root.join(name))
    }

    /// Resolves a file pointer (`./rel` or `/abs`) to a real path and proves
    /// it stays inside the workspace. Symlinks are chased on the existing
    /// part of the path before the prefix check.
    pub fn resolve(&self, d: &str) -> Result<PathBuf, EngineError> {
        let joined = match d.strip_prefix("./") {
            Some(rel) => self.root.join(rel),
            None => PathBuf::from(d),
        };
        if joined
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(EngineError::PathEscape(d.to_string()));
        }

        // peel nonexistent trailing components, canonicalize what exists
        let mut existing = joined.clone();
        let mut tail = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => return Err(EngineError::PathEscape(d.to_string())),
            }
        }
        let mut real = existing
            .canonicalize()
            .map_err(|_| EngineError::PathEscape(d.to_string()))?;
        for name in tail.iter().rev() {
            real.push(name);
        }

        if real == self.root || real.starts_with(&self.root) {
            Ok(real)
        } else {
            Err(EngineError::PathEscape(d.to_string()))
        }
    }

    /// Workspace-relative listing of oracle-visible files. Registers, the
    /// lock, and other dotfiles are skipped.
    pub fn list_files(&self) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        self.walk(&self.root, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }

    /// Single-writer lock: exclusive creation of `.runtime_lock` holding our
    /// PID. A lock held by a dead process is reclaimed and the acquisition
    /// retried exactly once.
    pub fn acquire_lock(&self) -> Result<LockGuard, EngineError> {
        let path = self.root.join(LOCK_FILE);
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path).unwrap_or_default();
                    let pid = holder.trim().parse::<i32>().ok();
                    match pid {
                        Some(pid) if pid_alive(pid) => {
                            return Err(EngineError::LockHeld(pid));
                        }
                        _ if attempt == 0 => {
                            warn!(?pid, "reclaiming stale runtime lock");
                            // idempotent: losing the removal race is fine
                            let _ = fs::remove_file(&path);
                        }
                        _ => return Err(EngineError::LockHeld(pid.unwrap_or(-1))),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("lock acquisition loop is bounded")
    }
}

fn pid_alive(pid: i32) -> bool {
    // null-signal probe; EPERM means it exists but isn't ours
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Removes the lock file on drop, success or error.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
