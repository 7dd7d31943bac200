//! Command-line front end for runforge.
//!
//! Launches pipelines, streams their output, and manages finished runs (status,
//! restore, delete) in a runforge home directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use runforge::core::types::{ParamValue, RunSnapshot, RunStatus};
use runforge::error::{RestoreError, SupervisorError};
use runforge::exit_codes;
use runforge::io::config::{ForgeConfig, config_path, load_config, resolve_home, write_config};
use runforge::io::credentials::{Credential, CredentialStore, NoCredentials, SessionCredentials};
use runforge::io::engine::Engine;
use runforge::logging;
use runforge::supervisor::{RunRequest, Supervisor, SupervisorOptions};

const DEFAULT_PASSWORD_ENV: &str = "RUNFORGE_PASSWORD";

#[derive(Parser)]
#[command(
    name = "runforge",
    version,
    about = "Launch, supervise and archive workflow pipeline runs"
)]
struct Cli {
    /// Home directory (defaults to $RUNFORGE_HOME, then ~/RunForge).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `config.toml` into the home directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a pipeline and stream its output. Ctrl-C cancels the run.
    Run {
        pipeline: String,
        /// Pipeline parameter as `key=value` (repeatable).
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Encrypt the run directory once the pipeline finishes.
        #[arg(long, requires = "user")]
        private: bool,
        #[command(flatten)]
        credential: CredentialArgs,
    },
    /// Show one run's status, or list every run.
    Status { run_id: Option<String> },
    /// Show engine metadata for a pipeline.
    Info { pipeline: String },
    /// List locally installed pipelines.
    List,
    /// Decrypt an archived run back into its run directory.
    Restore {
        run_id: String,
        #[command(flatten)]
        credential: CredentialArgs,
    },
    /// Delete a finished run (log, status, run directory, archive).
    Delete { run_id: String },
}

#[derive(clap::Args, Debug, Clone)]
struct CredentialArgs {
    /// Archive user name.
    #[arg(long)]
    user: Option<String>,
    /// Environment variable holding the archive password.
    #[arg(long, default_value = DEFAULT_PASSWORD_ENV)]
    password_env: String,
}

impl CredentialArgs {
    fn credential(&self) -> Result<Credential> {
        let Some(user) = &self.user else {
            bail!("--user is required");
        };
        let password = std::env::var(&self.password_env)
            .with_context(|| format!("read password from ${}", self.password_env))?;
        Ok(Credential::new(user.clone(), password))
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("parameter name must not be empty in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() {
    logging::init();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let home = resolve_home(cli.home.as_deref())?;
    match cli.command {
        Command::Init { force } => cmd_init(&home, force),
        Command::Run {
            pipeline,
            params,
            private,
            credential,
        } => cmd_run(&home, pipeline, params, private, &credential).await,
        Command::Status { run_id } => cmd_status(&home, run_id.as_deref()),
        Command::Info { pipeline } => cmd_info(&home, &pipeline),
        Command::List => cmd_list(&home),
        Command::Restore { run_id, credential } => {
            cmd_restore(&home, &run_id, &credential).await
        }
        Command::Delete { run_id } => cmd_delete(&home, &run_id),
    }
}

fn load(home: &Path) -> Result<ForgeConfig> {
    load_config(&config_path(home))
}

/// Only `run` owns the store for its lifetime; the other commands leave recovery to it.
fn supervisor(
    home: &Path,
    credentials: Arc<dyn CredentialStore>,
    recover: bool,
) -> Result<Supervisor> {
    let cfg = load(home)?;
    let options = SupervisorOptions {
        recover,
        ..SupervisorOptions::from_config(&cfg, home)
    };
    Supervisor::new(options, credentials)
}

fn cmd_init(home: &Path, force: bool) -> Result<i32> {
    let path = config_path(home);
    if path.exists() && !force {
        println!("config exists: {}", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &ForgeConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(
    home: &Path,
    pipeline: String,
    params: Vec<(String, String)>,
    private: bool,
    credential: &CredentialArgs,
) -> Result<i32> {
    let credentials: Arc<dyn CredentialStore> = if private {
        Arc::new(SessionCredentials::logged_in(&credential.credential()?))
    } else {
        Arc::new(NoCredentials)
    };
    let supervisor = supervisor(home, credentials, true)?;

    let mut request = RunRequest::new(pipeline);
    for (key, value) in params {
        request = request.param(key, ParamValue::parse(&value));
    }
    let run_id = supervisor.start_run(request).await?;
    eprintln!("run: {run_id}");

    let mut cancel_task = None;
    if let Ok(mut output) = supervisor.subscribe_output(&run_id) {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                line = output.recv() => match line {
                    Ok(line) => println!("{line}"),
                    Err(RecvError::Lagged(skipped)) => {
                        eprintln!("[{skipped} output lines skipped; see the run log]");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut ctrl_c, if cancel_task.is_none() => {
                    eprintln!("cancelling {run_id}...");
                    let supervisor = supervisor.clone();
                    let run_id = run_id.clone();
                    cancel_task = Some(tokio::spawn(async move {
                        supervisor.cancel_run(&run_id).await
                    }));
                }
            }
        }
    }

    if let Some(task) = cancel_task {
        match task.await.context("cancel task")? {
            Ok(outcome) => eprintln!("cancel: {outcome:?}"),
            Err(err) => eprintln!("cancel failed: {err}"),
        }
    }

    let snapshot = supervisor.wait_settled(&run_id).await?;
    let log_path = supervisor.store().paths(&run_id).log_path;
    println!(
        "run: id={} status={} exit_code={} log={}",
        run_id,
        snapshot.status,
        snapshot
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string()),
        log_path.display()
    );
    Ok(exit_code_for(&snapshot))
}

fn exit_code_for(snapshot: &RunSnapshot) -> i32 {
    match snapshot.status {
        RunStatus::Cancelled => exit_codes::CANCELLED,
        RunStatus::ArchiveFailed => exit_codes::ARCHIVE_FAILED,
        RunStatus::CompletedSuccess | RunStatus::CompletedFailure | RunStatus::Archived => {
            if snapshot.exit_code == Some(0) {
                exit_codes::OK
            } else {
                exit_codes::PIPELINE_FAILED
            }
        }
        RunStatus::Running => exit_codes::INVALID,
    }
}

fn cmd_status(home: &Path, run_id: Option<&str>) -> Result<i32> {
    let supervisor = supervisor(home, Arc::new(NoCredentials), false)?;
    if let Some(run_id) = run_id {
        let status = supervisor.status(run_id)?;
        println!("{status}");
        return Ok(exit_codes::OK);
    }
    for run in supervisor.runs()? {
        println!(
            "{}\t{}\t{}\t{}\t{:?}",
            run.run_id,
            run.pipeline,
            run.status,
            run.exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string()),
            run.artifacts
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_info(home: &Path, pipeline: &str) -> Result<i32> {
    let engine = Engine::from_config(&load(home)?.engine);
    for (key, value) in engine.info(pipeline)? {
        println!("{key}: {value}");
    }
    Ok(exit_codes::OK)
}

fn cmd_list(home: &Path) -> Result<i32> {
    let engine = Engine::from_config(&load(home)?.engine);
    for name in engine.list()? {
        println!("{name}");
    }
    Ok(exit_codes::OK)
}

async fn cmd_restore(home: &Path, run_id: &str, credential: &CredentialArgs) -> Result<i32> {
    let credential = credential.credential()?;
    let supervisor = supervisor(home, Arc::new(NoCredentials), false)?;
    match supervisor.restore(run_id, &credential).await {
        Ok(dir) => {
            println!("restored: {}", dir.display());
            Ok(exit_codes::OK)
        }
        Err(SupervisorError::Restore(err @ RestoreError::CredentialMismatch { .. })) => {
            eprintln!("{err}");
            Ok(exit_codes::CREDENTIAL_MISMATCH)
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_delete(home: &Path, run_id: &str) -> Result<i32> {
    let supervisor = supervisor(home, Arc::new(NoCredentials), false)?;
    supervisor.delete_run(run_id)?;
    println!("deleted: {run_id}");
    Ok(exit_codes::OK)
}
