use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::{
    config::Config,
    error::EngineError,
    halt,
    kernel::TickKernel,
    machine::{HALT, MAIN_TAPE_POINTER, Q_PROCESSING},
    manifold::Manifold,
    oracle::Oracle,
    workspace::Workspace,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    Running,
    Error,
}

/// Emitted after each persist and around run boundaries. At most one of each
/// kind per tick; subscribers that lag just miss snapshots.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Status(Status),
    State { q: String, d: String },
    Tape(String),
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub q: String,
    pub d: String,
    pub tape: String,
}

/// Boots and owns one workspace. The registers on disk are the only live
/// state; this type is a thin veneer over them plus the run loop.
pub struct Runtime {
    workspace: Arc<Workspace>,
    config: Config,
    oracle: Arc<dyn Oracle>,
    events: broadcast::Sender<RuntimeEvent>,
    running: AtomicBool,
}

impl Runtime {
    pub fn new(config: Config, oracle: Arc<dyn Oracle>) -> anyhow::Result<Self> {
        let workspace = Arc::new(Workspace::open(&config.workspace)?);
        workspace.boot()?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            workspace,
            config,
            oracle,
            events,
            running: AtomicBool::new(false),
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Appends a user request to the tape. A halted machine is re-armed to
    /// the processing state first, so the next run picks the request up.
    pub fn user_input(&self, text: &str) -> anyhow::Result<()> {
        let q = self.workspace.read_q()?;
        let d = self.workspace.read_d()?;
        if halt::is_halt_like(&q) && d == HALT {
            info!("re-arming halted machine for new input");
            self.workspace.write_q(Q_PROCESSING)?;
            self.workspace.write_d(MAIN_TAPE_POINTER)?;
        }
        let manifold = Manifold::new(self.workspace.clone(), &self.config);
        manifold.append(MAIN_TAPE_POINTER, &format!("[USER REQUEST] {}", text), true)?;
        Ok(())
    }

    /// Runs the tick loop to halt. At most one run per workspace: in-process
    /// via a flag, across processes via the PID lock.
    pub async fn run(&self) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        match &result {
            Ok(()) => {
                let _ = self.events.send(RuntimeEvent::Status(Status::Idle));
            }
            Err(e) => {
                error!(error = %e, "run aborted");
                let _ = self.events.send(RuntimeEvent::Error(e.to_string()));
                let _ = self.events.send(RuntimeEvent::Status(Status::Error));
            }
        }
        result
    }

    async fn run_inner(&self) -> Result<(), EngineError> {
        // released on drop, success or error
        let _lock = self.workspace.acquire_lock()?;
        let _ = self.events.send(RuntimeEvent::Status(Status::Running));
        let mut kernel = TickKernel::new(
            self.workspace.clone(),
            self.oracle.clone(),
            self.config.clone(),
            self.events.clone(),
        )?;
        kernel.run().await
    }

    pub fn snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(Snapshot {
            q: self.workspace.read_q()?,
            d: self.workspace.read_d()?,
            tape: fs::read_to_string(self.workspace.tape_path()).unwrap_or_default(),
        })
    }

    pub fn list_files(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.workspace.list_files()?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        machine::{NO_WRITE, Transition},
        oracle::scripted::ScriptedOracle,
    };

    fn fixture(script: Vec<Transition>) -> (tempfile::TempDir, Runtime) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workspace = dir.path().to_path_buf();
        let runtime = Runtime::new(config, Arc::new(ScriptedOracle::new(script))).unwrap();
        (dir, runtime)
    }

    #[tokio::test]
    async fn run_reaches_halt_and_reports_status() {
        let (_dir, runtime) = fixture(vec![
            Transition::new("q_2: WORKING", NO_WRITE, "./scratch.txt"),
            Transition::new("HALT", NO_WRITE, "HALT"),
        ]);
        let mut events = runtime.subscribe();
        runtime.run().await.unwrap();

        let snapshot = runtime.snapshot().unwrap();
        assert_eq!(snapshot.q, "HALT");
        assert_eq!(snapshot.d, "HALT");

        let mut saw_running = false;
        let mut saw_idle = false;
        while let Ok(event) = events.try_recv() {
            match event {
                RuntimeEvent::Status(Status::Running) => saw_running = true,
                RuntimeEvent::Status(Status::Idle) => saw_idle = true,
                _ => {}
            }
        }
        assert!(saw_running && saw_idle);
        assert!(!runtime.is_running());
        // lock released: a fresh acquisition succeeds
        assert!(runtime.workspace().acquire_lock().is_ok());
    }

    #[tokio::test]
    async fn user_input_rearms_a_halted_machine() {
        let (_dir, runtime) = fixture(vec![Transition::new("HALT", NO_WRITE, "HALT")]);
        runtime.workspace().write_q("HALT").unwrap();
        runtime.workspace().write_d("HALT").unwrap();

        runtime.user_input("fix the build").unwrap();
        let snapshot = runtime.snapshot().unwrap();
        assert_eq!(snapshot.q, Q_PROCESSING);
        assert_eq!(snapshot.d, MAIN_TAPE_POINTER);
        assert!(snapshot.tape.contains("[USER REQUEST] fix the build"));
    }

    #[tokio::test]
    async fn user_input_leaves_a_working_machine_alone() {
        let (_dir, runtime) = fixture(vec![Transition::new("HALT", NO_WRITE, "HALT")]);
        runtime.workspace().write_q("q_4: MID_TASK").unwrap();
        runtime.workspace().write_d("./notes.txt").unwrap();

        runtime.user_input("also do this").unwrap();
        let snapshot = runtime.snapshot().unwrap();
        assert_eq!(snapshot.q, "q_4: MID_TASK");
        assert_eq!(snapshot.d, "./notes.txt");
        assert!(snapshot.tape.contains("[USER REQUEST] also do this"));
    }

    #[tokio::test]
    async fn list_files_shows_only_oracle_visible_files() {
        let (dir, runtime) = fixture(vec![Transition::new("HALT", NO_WRITE, "HALT")]);
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let files = runtime.list_files().unwrap();
        assert!(files.contains(&"MAIN_TAPE.md".to_string()));
        assert!(files.contains(&"notes.txt".to_string()));
        assert!(!files.iter().any(|f| f.starts_with('.')));
    }
}
