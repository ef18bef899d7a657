//! Binary entry point for the subtitle translator.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use subchat_core::config::Settings;
use subchat_core::events::{BannerKind, EventSink, QueueEvent};
use subchat_core::queue::{CancelToken, JobSource, JobStatus, Orchestrator, Queue, RunOutcome};
use subchat_core::secrets::{resolve_api_key, FileSecretStore, SecretStore, API_KEY_NAME};
use subchat_core::subtitle::output_file_name;
use subchat_core::translate::openai::OpenAiBackend;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Command line options for the binary.
#[derive(Parser)]
struct Cli {
    /// Enable verbose debug and trace logs.
    #[arg(long, global = true)]
    debug: bool,

    /// TOML settings file; raised throttle values are written back to it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate one or more subtitle files in order.
    Translate(TranslateArgs),
    /// Manage the stored API key.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Write a settings file with default values.
    InitConfig {
        /// Where to write the file.
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct TranslateArgs {
    /// Number of cues per chunk.
    #[arg(long, allow_negative_numbers = true)]
    chunk_size: Option<i64>,

    /// Target language, also used in the output file name.
    #[arg(long)]
    target: Option<String>,

    /// Chat model name.
    #[arg(long)]
    model: Option<String>,

    /// Base URL of the OpenAI-compatible API.
    #[arg(long)]
    endpoint: Option<String>,

    /// Directory for translated files; defaults to next to each input.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Subtitle files to translate.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store the API key.
    Set { value: String },
    /// Remove the stored API key.
    Clear,
    /// Report whether a key is available.
    Status,
}

/// Application entry point which parses CLI args and performs actions.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = if cli.debug {
        EnvFilter::default()
            .add_directive("subchat=trace".parse()?)
            .add_directive("subchat_core=trace".parse()?)
            .add_directive("info".parse()?)
    } else {
        EnvFilter::default()
            .add_directive("subchat=info".parse()?)
            .add_directive("subchat_core=info".parse()?)
            .add_directive("warn".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = FileSecretStore::new(secrets_path()?);
    match cli.command {
        Command::Translate(args) => translate(args, cli.config.as_deref(), &store).await,
        Command::Key { action } => manage_key(action, &store),
        Command::InitConfig { path } => {
            Settings::default().save_to_file(&path)?;
            info!("wrote default settings to {}", path.display());
            Ok(())
        }
    }
}

fn secrets_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().ok_or_else(|| anyhow!("no user config directory"))?;
    Ok(dir.join("subchat").join("secrets.json"))
}

fn manage_key(action: KeyAction, store: &FileSecretStore) -> Result<()> {
    match action {
        KeyAction::Set { value } => {
            store.set(API_KEY_NAME, value.trim())?;
            info!("API key saved to {}", store.path().display());
        }
        KeyAction::Clear => {
            store.clear(API_KEY_NAME)?;
            info!("API key removed");
        }
        KeyAction::Status => match resolve_api_key(store)? {
            Some(_) => info!("API key is configured"),
            None => warn!("no API key configured"),
        },
    }
    Ok(())
}

async fn translate(args: TranslateArgs, config: Option<&Path>, store: &dyn SecretStore) -> Result<()> {
    let mut settings = match config {
        Some(path) if path.exists() => Settings::from_file(path)?,
        _ => Settings::default(),
    };
    if let Some(size) = args.chunk_size {
        settings.chunk_size = size;
    }
    if let Some(target) = args.target {
        settings.target_language = target;
    }
    if let Some(model) = args.model {
        settings.model = model;
    }
    if let Some(endpoint) = args.endpoint {
        settings.endpoint = endpoint;
    }
    let api_key = resolve_api_key(store)?
        .ok_or_else(|| anyhow!("no API key; run `subchat key set <KEY>` or set SUBCHAT_API_KEY"))?;
    let backend = OpenAiBackend::new(&settings.endpoint, &settings.model, api_key)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(backend, &settings, EventSink::new(tx))?;
    let renderer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            render(event);
        }
    });

    let cancel = CancelToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stopping after the current chunk");
            stopper.cancel();
        }
    });

    let mut queue = Queue::new();
    for input in &args.inputs {
        queue.add(JobSource::File(input.clone()));
    }
    let outcome = orchestrator.run(&mut queue, &cancel).await;

    for job in queue.jobs() {
        let Some(input) = job.source.path() else {
            continue;
        };
        let out = output_path(input, args.out_dir.as_deref(), &settings.target_language);
        match job.status {
            JobStatus::Completed => {
                fs::write(&out, &job.output)
                    .with_context(|| format!("failed to write {}", out.display()))?;
                info!("wrote {}", out.display());
            }
            JobStatus::Error if !job.output.is_empty() => {
                let partial = out.with_extension(format!(
                    "{}.partial",
                    out.extension().unwrap_or_default().to_string_lossy()
                ));
                fs::write(&partial, &job.output)?;
                warn!("kept partial output in {}", partial.display());
            }
            _ => {}
        }
    }

    let delay = orchestrator.throttle().current().as_millis() as u64;
    if delay > settings.chunk_delay_ms {
        warn!("inter-chunk delay was raised to {delay} ms during the run");
        if let Some(path) = config {
            settings.chunk_delay_ms = delay;
            settings.save_to_file(path)?;
            debug!("saved raised delay to {}", path.display());
        }
    }

    // Dropping the orchestrator closes the event channel so the renderer ends.
    drop(orchestrator);
    let _ = renderer.await;

    match outcome {
        RunOutcome::Success => Ok(()),
        RunOutcome::Stopped => bail!("stopped by user"),
        RunOutcome::Error => bail!("some files failed to translate"),
    }
}

fn output_path(input: &Path, out_dir: Option<&Path>, target_language: &str) -> PathBuf {
    let named = output_file_name(input, target_language);
    match (out_dir, named.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => named,
    }
}

/// Print the events that `tracing` does not already cover.
fn render(event: QueueEvent) {
    match event {
        QueueEvent::Progress { job, current, total } if total > 0 => {
            info!("{job}: {current}/{total} chunks ({}%)", current * 100 / total);
        }
        QueueEvent::Status { job, status } => debug!("{job}: {status:?}"),
        QueueEvent::Banner(banner) => match banner.kind {
            BannerKind::Error => warn!("{}", banner.message),
            BannerKind::Info | BannerKind::Success => info!("{}", banner.message),
        },
        _ => {}
    }
}
