use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use tapeloop::{
    config::Config,
    machine::Transition,
    oracle::{api::ApiOracle, Oracle},
    runtime::{Runtime, RuntimeEvent},
    workspace::LOCK_FILE,
};

#[derive(Parser)]
#[command(version, about = "filesystem Turing machine driven by an LLM oracle", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the workspace and run the loop until the machine halts
    Run {
        /// Append this user request before starting
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Append a user request (re-arms a halted machine)
    Input { text: String },
    /// Print the registers and whether a loop is running
    Status,
    /// Print MAIN_TAPE.md
    Tape,
    /// List oracle-visible workspace files
    Files,
}

// commands that only touch the workspace never call the oracle
struct NoOracle;

#[async_trait]
impl Oracle for NoOracle {
    async fn collapse(&self, _: &str, _: &str, _: &str, _: &str) -> anyhow::Result<Transition> {
        Err(anyhow!("this command does not run the machine"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Run { input } => {
            let oracle = Arc::new(ApiOracle::new(&config)?);
            let runtime = Runtime::new(config, oracle)?;
            if let Some(text) = input {
                runtime.user_input(&text)?;
            }

            // mirror state heads to stderr while the machine works
            let mut events = runtime.subscribe();
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let RuntimeEvent::State { q, d } = event {
                        eprintln!("{} @ {}", q.lines().next().unwrap_or(""), d);
                    }
                }
            });

            let result = runtime.run().await;
            printer.abort();
            result?;
            print!("{}", runtime.snapshot()?.tape);
        }
        Commands::Input { text } => {
            let runtime = Runtime::new(config, Arc::new(NoOracle))?;
            runtime.user_input(&text)?;
        }
        Commands::Status => {
            let running = config.workspace.join(LOCK_FILE).exists();
            let runtime = Runtime::new(config, Arc::new(NoOracle))?;
            let snapshot = runtime.snapshot()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "q": snapshot.q,
                    "d": snapshot.d,
                    "running": running,
                }))?
            );
        }
        Commands::Tape => {
            let runtime = Runtime::new(config, Arc::new(NoOracle))?;
            print!("{}", runtime.snapshot()?.tape);
        }
        Commands::Files => {
            let runtime = Runtime::new(config, Arc::new(NoOracle))?;
            for file in runtime.list_files()? {
                println!("{}", file);
            }
        }
    }

    Ok(())
}
