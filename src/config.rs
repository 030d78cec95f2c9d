use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};

pub const DEFAULT_ORACLE_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_ORACLE_MODEL: &str = "gpt-4.1";

/// All tunables come from the environment; the library takes a `Config` value
/// and never reads env vars itself past this point.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory root for registers and tape.
    pub workspace: PathBuf,
    /// External discipline document, re-read every tick. Missing falls back
    /// to the built-in default.
    pub prompt_file: Option<PathBuf>,

    pub oracle_base_url: String,
    pub oracle_api_key: Option<String>,
    pub oracle_model: String,
    pub oracle_timeout: Duration,
    pub oracle_seed: u64,

    /// Subprocess timeout; commands get SIGKILL past this.
    pub exec_timeout: Duration,
    /// Output budget in bytes for exec and URL slices.
    pub max_stdout: usize,
    /// Hard truncation threshold in lines for file slices.
    pub slice_lines: usize,
    /// Immutable prefix of MAIN_TAPE.md; 0 disables.
    pub rom_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("./workspace"),
            prompt_file: None,
            oracle_base_url: DEFAULT_ORACLE_BASE_URL.to_string(),
            oracle_api_key: None,
            oracle_model: DEFAULT_ORACLE_MODEL.to_string(),
            oracle_timeout: Duration::from_millis(90_000),
            oracle_seed: 7,
            exec_timeout: Duration::from_millis(600_000),
            max_stdout: 16 * 1024,
            slice_lines: 2_000,
            rom_lines: 1,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            workspace: env::var("WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace),
            prompt_file: env::var("PROMPT_FILE").ok().map(PathBuf::from),
            oracle_base_url: env::var("ORACLE_BASE_URL").unwrap_or(defaults.oracle_base_url),
            oracle_api_key: env::var("ORACLE_API_KEY").ok(),
            oracle_model: env::var("ORACLE_MODEL").unwrap_or(defaults.oracle_model),
            oracle_timeout: Duration::from_millis(env_parse(
                "ORACLE_TIMEOUT_MS",
                defaults.oracle_timeout.as_millis() as u64,
            )?),
            oracle_seed: env_parse("ORACLE_SEED", defaults.oracle_seed)?,
            exec_timeout: Duration::from_millis(env_parse(
                "EXEC_TIMEOUT_MS",
                defaults.exec_timeout.as_millis() as u64,
            )?),
            max_stdout: env_parse("MAX_STDOUT", defaults.max_stdout)?,
            slice_lines: env_parse("SLICE_LINES", defaults.slice_lines)?,
            rom_lines: env_parse("ROM_LINES", defaults.rom_lines)?,
        })
    }

    /// Visible head of an over-long file slice.
    pub fn slice_head(&self) -> usize {
        self.slice_lines / 4
    }

    /// Visible tail of an over-long file slice.
    pub fn slice_tail(&self) -> usize {
        self.slice_lines - self.slice_head()
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{}: {}", key, e))
            .context("invalid configuration"),
        Err(_) => Ok(default),
    }
}
