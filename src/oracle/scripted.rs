use std::sync::Mutex;

use async_trait::async_trait;

use crate::{machine::Transition, oracle::Oracle};

/// Replays a pre-recorded transition list, one entry per call, pinning the
/// last entry on overflow. The deterministic stand-in for the network oracle
/// in tests and harnesses.
pub struct ScriptedOracle {
    script: Vec<Transition>,
    cursor: Mutex<usize>,
}

impl ScriptedOracle {
    pub fn new(script: Vec<Transition>) -> Self {
        assert!(!script.is_empty(), "scripted oracle needs at least one entry");
        Self {
            script,
            cursor: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.cursor.lock().unwrap()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn collapse(
        &self,
        _discipline: &str,
        _q: &str,
        _s: &str,
        _d: &str,
    ) -> anyhow::Result<Transition> {
        let mut cursor = self.cursor.lock().unwrap();
        let index = (*cursor).min(self.script.len() - 1);
        *cursor += 1;
        Ok(self.script[index].clone())
    }
}
