use std::future::Future;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shell_updater::config::{UpdaterConfig, config_path, current_executable_name, log_dir};
use shell_updater::update::installer::{DelayedExit, LogGuardSlot};
use shell_updater::update::manifest::UpdateManifest;
use shell_updater::update::process::{SystemProcessTable, find_peer_instances};
use shell_updater::update::{ConsentProvider, SessionOutcome, UpdateEvent, UpdateOrchestrator};

#[derive(Parser)]
#[command(name = "shell-updater")]
#[command(version, about = "Self-update core for the desktop shell")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the manifest URL from the configuration
    #[arg(long, global = true)]
    manifest_url: Option<String>,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Report whether a newer release is available
    Check,
    /// Check, ask for consent, download and hand off to the new version
    Update {
        /// Install without asking
        #[arg(long)]
        yes: bool,
    },
    /// Run the startup check if automatic checks are enabled
    Startup,
    /// List other running instances of this application
    Peers,
}

/// Asks on the terminal
struct PromptConsent;

#[async_trait::async_trait]
impl ConsentProvider for PromptConsent {
    async fn request_consent(&self, manifest: &UpdateManifest) -> bool {
        let version = manifest.version;
        tokio::task::spawn_blocking(move || {
            print!("Version {} is available. Download and install? [y/N] ", version);
            let _ = std::io::stdout().flush();
            let mut answer = String::new();
            if std::io::stdin().lock().read_line(&mut answer).is_err() {
                return false;
            }
            matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}

/// Accepts every update
struct AlwaysConsent;

#[async_trait::async_trait]
impl ConsentProvider for AlwaysConsent {
    async fn request_consent(&self, _manifest: &UpdateManifest) -> bool {
        true
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<UpdaterConfig> {
    let path = cli.config.clone().unwrap_or_else(config_path);
    let mut config = if path.exists() {
        UpdaterConfig::load(&path)?
    } else {
        UpdaterConfig::default()
    };
    if let Some(url) = &cli.manifest_url {
        config.manifest_url = url.clone();
    }
    Ok(config)
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<UpdateEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            UpdateEvent::UpdateAvailable(manifest) => {
                eprintln!("Update available: {}", manifest.version);
            }
            UpdateEvent::Progress(progress) if progress.total_bytes > 0 => {
                eprint!(
                    "\rDownloading {:>3}% ({}/{} bytes)",
                    progress.percentage, progress.bytes_received, progress.total_bytes
                );
            }
            UpdateEvent::Progress(progress) => {
                eprint!("\rDownloading {} bytes", progress.bytes_received);
            }
            UpdateEvent::Installing => eprintln!("\nInstalling..."),
            UpdateEvent::Failed(reason) => eprintln!("\nUpdate failed: {}", reason),
        }
    }
}

fn list_peers() {
    let image_name = current_executable_name();
    let peers = find_peer_instances(&SystemProcessTable, &image_name, std::process::id());
    if peers.is_empty() {
        println!("No other instances of {} running", image_name);
    }
    for peer in peers {
        println!("{}\t{}", peer.pid, peer.image_name);
    }
}

/// Orchestrator plus the task printing its events
fn start_orchestrator(
    cli: &Cli,
    log_guard: &LogGuardSlot,
) -> anyhow::Result<(UpdateOrchestrator, JoinHandle<()>)> {
    let config = load_config(cli)?;
    if config.manifest_url.is_empty() {
        anyhow::bail!("no manifest URL configured (use --manifest-url or the config file)");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));
    let orchestrator = UpdateOrchestrator::new(config, tx)?
        .with_exit(Arc::new(DelayedExit::flushing(Arc::clone(log_guard))));
    Ok((orchestrator, printer))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

async fn finish(
    orchestrator: UpdateOrchestrator,
    printer: JoinHandle<()>,
    outcome: SessionOutcome,
) {
    // Closing the event channel lets the printer drain and stop.
    drop(orchestrator);
    let _ = printer.await;

    match outcome {
        SessionOutcome::NoUpdate => println!("No update available"),
        SessionOutcome::Declined => println!("Update declined"),
        SessionOutcome::Cancelled => println!("Update cancelled"),
        SessionOutcome::HandoffComplete(handoff) => {
            println!("Handed off to installer: {:?}", handoff);
            // The process exit is already scheduled.
            std::future::pending::<()>().await;
        }
    }
}

async fn run(cli: Cli, log_guard: LogGuardSlot) -> anyhow::Result<()> {
    match cli.command {
        Command::Peers => list_peers(),
        Command::Check => {
            let (orchestrator, _printer) = start_orchestrator(&cli, &log_guard)?;
            match orchestrator.check_for_updates().await? {
                Some(manifest) => println!("Update available: {}", manifest.version),
                None => println!("Up to date ({})", orchestrator.config().current_version),
            }
        }
        Command::Update { yes } => {
            let (orchestrator, printer) = start_orchestrator(&cli, &log_guard)?;
            let cancel = cancel_on_ctrl_c();
            let outcome = if yes {
                orchestrator.run_session(&AlwaysConsent, &cancel).await?
            } else {
                orchestrator.run_session(&PromptConsent, &cancel).await?
            };
            finish(orchestrator, printer, outcome).await;
        }
        Command::Startup => {
            let (orchestrator, printer) = start_orchestrator(&cli, &log_guard)?;
            let cancel = cancel_on_ctrl_c();
            let result = orchestrator.run_on_startup(&PromptConsent, &cancel).await;
            if let Some(result) = result {
                finish(orchestrator, printer, result?).await;
            }
        }
    }

    Ok(())
}

/// Run `future` to completion without waiting on blocking tasks it leaves
/// behind, such as a terminal prompt abandoned by Ctrl-C.
fn run_detached<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_guard: LogGuardSlot = Arc::new(Mutex::new(Some(shell_updater::logging::init(
        &log_dir(),
        cli.log_json,
    )?)));

    run_detached(run(cli, log_guard))?
}
