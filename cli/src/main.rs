//! Anvil CLI - a line-oriented host for a language server.
//!
//! Reads one instruction per line from stdin:
//!
//! ```text
//! :folders A B        replace the workspace folders
//! :config             reload the config file
//! :diagnostics URI    list stored diagnostics for a resource
//! :read URI           print a diagnostics virtual document
//! :status             print the connection status
//! :quit               tear down and exit
//! NAME [JSON...]      dispatch a command; bare words are passed as strings
//! ```
//!
//! Server events are pumped on a fixed 100ms tick and after every line.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use anvil_lsp::{
    ClientConfig, ContentProvider, DiagnosticUri, Host, ProcessConnector, Session, ServerStatus,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_BUDGET: usize = 64;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries the session transcript; no log file means no logs.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => warnings.push(format!(
                "Failed to open log file {}: {e}",
                candidate.display()
            )),
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(config_path) = ClientConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("anvil.log"));
    }

    candidates.push(PathBuf::from(".anvil").join("logs").join("anvil.log"));

    candidates
}

/// Prints everything to the terminal.
struct StdoutHost;

impl Host for StdoutHost {
    fn show_info(&self, message: &str) {
        println!("info: {message}");
    }

    fn show_error(&self, message: &str) {
        eprintln!("error: {message}");
    }

    fn register_content_provider(&self, scheme: &str, _provider: ContentProvider) {
        tracing::debug!(scheme, "Documents are served through `:read`");
    }

    fn open_location(&self, location: &serde_json::Value) {
        println!("location: {location}");
    }

    fn apply_workspace_edit(&self, edit: &serde_json::Value) {
        println!("edit: {edit}");
    }

    fn run_builtin(&self, command: &str, args: &[serde_json::Value]) {
        println!("builtin: {command} {}", serde_json::Value::from(args.to_vec()));
    }
}

struct Args {
    config: Option<PathBuf>,
    folders: Vec<PathBuf>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut config = None;
        let mut folders = Vec::new();
        let mut args = std::env::args().skip(1);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args.next().context("--config needs a path")?;
                    config = Some(PathBuf::from(path));
                }
                "-h" | "--help" => {
                    println!("usage: anvil [--config PATH] [FOLDER...]");
                    std::process::exit(0);
                }
                flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
                _ => folders.push(absolute(PathBuf::from(arg))?),
            }
        }

        if folders.is_empty() {
            folders.push(std::env::current_dir().context("reading current directory")?);
        }
        Ok(Self { config, folders })
    }

    fn load_config(&self) -> Result<Option<ClientConfig>> {
        let loaded = match &self.config {
            Some(path) => ClientConfig::load_from(path)?,
            None => ClientConfig::load()?,
        };
        Ok(loaded)
    }
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    std::path::absolute(&path).with_context(|| format!("resolving {}", path.display()))
}

/// Bare words become JSON strings so `ssr foo ==>> bar` needs no quoting.
fn parse_arg(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn print_status(status: &ServerStatus) {
    match serde_json::to_string(status) {
        Ok(json) => println!("status: {json}"),
        Err(e) => tracing::warn!("Failed to encode status: {e}"),
    }
}

enum Flow {
    Continue,
    Quit,
}

async fn handle_line(session: &Session, args: &Args, line: &str) -> Result<Flow> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(Flow::Continue);
    };
    let ctx = session.ctx();

    match head {
        ":quit" => return Ok(Flow::Quit),
        ":status" => println!("{}", ctx.status()),
        ":folders" => {
            let folders = words
                .map(|w| absolute(PathBuf::from(w)))
                .collect::<Result<Vec<_>>>()?;
            ctx.on_workspace_folders_changed(folders).await?;
        }
        ":config" => {
            let config = args.load_config()?;
            ctx.on_configuration_changed(config).await?;
        }
        ":diagnostics" => {
            let uri = words.next().context(":diagnostics needs a resource URI")?;
            for record in ctx.diagnostics(uri) {
                let view = DiagnosticUri::new(uri, record.index()).to_url()?;
                println!(
                    "{:>3} {:<7} {}:{} {}  [{view}]",
                    record.index(),
                    record.severity().label(),
                    record.line() + 1,
                    record.col() + 1,
                    record.message()
                );
            }
        }
        ":read" => {
            let uri = words.next().context(":read needs a document URI")?;
            println!("{}", session.read_document(uri));
        }
        name => {
            let params: Vec<_> = words.map(parse_arg).collect();
            if let Some(result) = session.dispatch(name, &params).await? {
                println!("{result:#}");
            }
        }
    }
    Ok(Flow::Continue)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse()?;
    let config = args.load_config()?.unwrap_or_default();
    tracing::info!(command = %config.server.command, folders = ?args.folders, "Activating");

    let session = anvil_lsp::init(
        config,
        args.folders.clone(),
        Arc::new(StdoutHost),
        Arc::new(ProcessConnector),
    )
    .await
    .context("activation failed")?;

    let mut status = session.ctx().subscribe_status();
    print_status(&status.borrow_and_update());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticks = tokio::time::interval(POLL_INTERVAL);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                session.ctx().poll_events(EVENT_BUDGET);
            }
            Ok(()) = status.changed() => {
                print_status(&status.borrow_and_update());
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match handle_line(&session, &args, &line).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) => eprintln!("error: {e:#}"),
                }
                session.ctx().poll_events(EVENT_BUDGET);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let report = anvil_lsp::teardown(session).await;
    for failure in &report.failures {
        eprintln!("cleanup failed: {failure}");
    }
    tracing::info!(ran = report.ran, "Shut down");

    Ok(())
}
