//! SnapMatch CLI - Command line interface for event photo processing.
//!
//! This tool uploads event photos and reference selfies, runs the matcher
//! for an event, and inspects or removes stored objects.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use snapmatch_app::{AppConfig, EventService, ObjectLocation};
use snapmatch_common::{EventId, RecipientId, StoragePath};
use snapmatch_storage::create_default_registry;
use snapmatch_storage::google::{AuthConfig, AuthManager, DRIVE_SCOPE, STORAGE_SCOPE};
use snapmatch_sync::{FileOutcome, IncomingFile, IntakeTarget};

#[derive(Parser)]
#[command(name = "snapmatch")]
#[command(about = "SnapMatch - Event photo storage and matching")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: $SNAPMATCH_CONFIG or the user config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload event photos, or reference selfies for a recipient.
    Upload {
        /// Event identifier.
        #[arg(short, long)]
        event: String,

        /// Store the files as this recipient's selfies.
        #[arg(short, long)]
        recipient: Option<String>,

        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run the matcher for an event and package the results.
    Process {
        /// Event identifier.
        #[arg(short, long)]
        event: String,
    },

    /// Show delivery status of every recipient of an event.
    Status {
        /// Event identifier.
        #[arg(short, long)]
        event: String,
    },

    /// List recipients waiting for reprocessing.
    Pending {
        /// Event identifier.
        #[arg(short, long)]
        event: String,

        /// Only check this recipient.
        #[arg(short, long)]
        recipient: Option<String>,
    },

    /// Fetch an object by virtual path.
    Fetch {
        /// Virtual path, e.g. events/e1/exports/bob.zip.
        path: String,

        /// Output file (default: the object's name).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print a link to an object.
    Url {
        /// Virtual path.
        path: String,
    },

    /// Delete an event from remote storage, the mirror, and the ledger.
    DeleteEvent {
        /// Event identifier.
        #[arg(short, long)]
        event: String,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// List available storage providers.
    Providers,

    /// Obtain OAuth tokens for a Google provider.
    Authorize {
        /// Provider to authorize.
        #[arg(value_enum)]
        provider: GoogleProvider,
    },

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum GoogleProvider {
    Gdrive,
    Gcs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Upload {
            event,
            recipient,
            files,
        } => cmd_upload(&connect(config).await?, &event, recipient.as_deref(), &files).await,

        Commands::Process { event } => cmd_process(&connect(config).await?, &event).await,

        Commands::Status { event } => cmd_status(&connect(config).await?, &event).await,

        Commands::Pending { event, recipient } => {
            cmd_pending(&connect(config).await?, &event, recipient.as_deref()).await
        }

        Commands::Fetch { path, output } => cmd_fetch(&connect(config).await?, &path, output).await,

        Commands::Url { path } => cmd_url(&connect(config).await?, &path).await,

        Commands::DeleteEvent { event, yes } => {
            cmd_delete_event(&connect(config).await?, &event, yes).await
        }

        Commands::Providers => cmd_providers(),

        Commands::Authorize { provider } => cmd_authorize(config, provider).await,

        Commands::Completions { shell } => cmd_completions(shell),
    }
}

/// Load the configuration and bring up storage, mirror, and ledger.
async fn connect(config: Option<&Path>) -> Result<EventService> {
    let config = load_config(config).await?;
    EventService::bootstrap(config)
        .await
        .context("Failed to start SnapMatch")
}

async fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => AppConfig::default_path().context("Cannot determine configuration directory")?,
    };
    info!("Using configuration {}", path.display());
    AppConfig::load(&path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn event_id(event: &str) -> Result<EventId> {
    EventId::new(event).context("Invalid event id")
}

fn recipient_id(recipient: &str) -> Result<RecipientId> {
    RecipientId::new(recipient).context("Invalid recipient id")
}

fn virtual_path(path: &str) -> Result<StoragePath> {
    StoragePath::parse(path).context("Invalid virtual path")
}

/// Upload files.
async fn cmd_upload(
    service: &EventService,
    event: &str,
    recipient: Option<&str>,
    files: &[PathBuf],
) -> Result<()> {
    let event = event_id(event)?;
    let target = match recipient {
        Some(recipient) => IntakeTarget::selfies(event, recipient_id(recipient)?),
        None => IntakeTarget::photos(event),
    };

    let mut incoming = Vec::with_capacity(files.len());
    for file in files {
        let data = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content_type = mime_guess::from_path(file).first_or_octet_stream();
        incoming.push(IncomingFile::new(name, data).with_content_type(content_type.essence_str()));
    }

    let report = service
        .upload(&target, incoming)
        .await
        .context("Failed to record upload")?;

    for file in &report.files {
        match &file.outcome {
            FileOutcome::Stored {
                path,
                remote,
                local,
            } => {
                let mut stored_in = Vec::new();
                if *remote {
                    stored_in.push("remote");
                }
                if *local {
                    stored_in.push("local");
                }
                println!("  [OK]   {} -> {} ({})", file.original_name, path, stored_in.join(", "));
            }
            FileOutcome::Rejected(reason) => {
                println!("  [FAIL] {}: {}", file.original_name, reason);
            }
        }
    }
    println!("{} accepted, {} rejected", report.accepted(), report.rejected());

    if !report.is_success() {
        anyhow::bail!("No file was accepted");
    }
    Ok(())
}

/// Run the matcher and wait for it.
async fn cmd_process(service: &EventService, event: &str) -> Result<()> {
    let event = event_id(event)?;
    let handle = service
        .trigger_processing(&event)
        .await
        .context("Processing was not started")?;
    println!("Processing event {}...", event);

    let report = handle.wait().await?;
    println!(
        "Synced down {} file(s), {} already present",
        report.sync_down.synced, report.sync_down.skipped
    );

    if let Some(cause) = &report.job.failure {
        anyhow::bail!("Job failed: {}", cause);
    }

    if let Some(sync_up) = &report.sync_up {
        println!("Uploaded {} matched file(s)", sync_up.synced);
    }
    if let Some(packages) = &report.packages {
        for export in &packages.packaged {
            println!(
                "  {} -> {} ({} photos{})",
                export.recipient,
                export.path,
                export.file_count,
                if export.uploaded { ", uploaded" } else { "" }
            );
        }
        for recipient in &packages.skipped {
            println!("  {} -> no matches", recipient);
        }
    }
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    println!("Done. {} recipient(s) notified.", report.notified);
    Ok(())
}

/// Show delivery records.
async fn cmd_status(service: &EventService, event: &str) -> Result<()> {
    let event = event_id(event)?;
    let records = service.deliveries(&event).await;

    if records.is_empty() {
        println!("No recipients recorded for event {}.", event);
        return Ok(());
    }

    println!("Event {}:", event);
    for record in records {
        let processed = record
            .last_processed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {}: {} selfie(s), {} match(es), packaged={}, notified={}, processed={}{}",
            record.recipient_id,
            record.source_count,
            record.matched_count,
            record.packaged,
            record.notified,
            processed,
            if record.is_pending() { " [pending]" } else { "" }
        );
    }
    Ok(())
}

/// List pending recipients.
async fn cmd_pending(service: &EventService, event: &str, recipient: Option<&str>) -> Result<()> {
    let event = event_id(event)?;

    if let Some(recipient) = recipient {
        let recipient = recipient_id(recipient)?;
        let pending = service.is_pending(&event, &recipient).await;
        println!("{}: {}", recipient, if pending { "pending" } else { "up to date" });
        return Ok(());
    }

    let pending = service.pending(&event).await;
    if pending.is_empty() {
        println!("Nothing pending for event {}.", event);
    } else {
        for recipient in pending {
            println!("{}", recipient);
        }
    }
    Ok(())
}

/// Fetch an object to a local file.
async fn cmd_fetch(service: &EventService, path: &str, output: Option<PathBuf>) -> Result<()> {
    let path = virtual_path(path)?;
    let output = match output {
        Some(output) => output,
        None => PathBuf::from(path.name().context("Path has no file name")?),
    };

    let data = service
        .fetch(&path)
        .await
        .with_context(|| format!("Failed to fetch {}", path))?;
    tokio::fs::write(&output, &data)
        .await
        .context("Failed to write output file")?;

    println!("Fetched {} ({} bytes) to {}", path, data.len(), output.display());
    Ok(())
}

/// Print a link.
async fn cmd_url(service: &EventService, path: &str) -> Result<()> {
    let path = virtual_path(path)?;
    match service.locate(&path).await? {
        ObjectLocation::Url(url) => println!("{}", url),
        ObjectLocation::LocalFile(file) => println!("file://{}", file.display()),
    }
    Ok(())
}

/// Delete an event.
async fn cmd_delete_event(service: &EventService, event: &str, yes: bool) -> Result<()> {
    let event = event_id(event)?;

    if !yes {
        println!("Delete event {} and all of its files? Type the event id to confirm:", event);
        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("Failed to read confirmation")?;
        if answer.trim() != event.as_str() {
            anyhow::bail!("Aborted");
        }
    }

    let deletion = service.delete_event(&event).await?;
    if let Some(remote) = &deletion.remote {
        println!(
            "Remote: {} object(s) deleted, {} already gone",
            remote.deleted, remote.absent
        );
        for (path, reason) in &remote.failed {
            println!("  [FAIL] {}: {}", path, reason);
        }
    }
    println!(
        "Local mirror: {}",
        if deletion.local_removed { "removed" } else { "nothing to remove" }
    );
    println!("Ledger: {} record(s) removed", deletion.records_removed);
    Ok(())
}

fn cmd_providers() -> Result<()> {
    println!("Available storage providers:");
    println!("  {}", snapmatch_storage::LOCAL_ONLY);
    for name in create_default_registry().providers() {
        println!("  {}", name);
    }
    Ok(())
}

fn cmd_completions(shell: Shell) -> Result<()> {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "snapmatch", &mut std::io::stdout());
    Ok(())
}

/// Interactive OAuth flow for `gdrive` or `gcs`.
async fn cmd_authorize(config_path: Option<&Path>, provider: GoogleProvider) -> Result<()> {
    // Client registration from the config file when present, else env vars.
    let configured = match config_path.map(Path::to_path_buf).or_else(AppConfig::default_path) {
        Some(path) if path.exists() => {
            let config = load_config(Some(&path)).await?;
            config
                .storage
                .settings
                .get("auth_config")
                .cloned()
                .map(serde_json::from_value::<AuthConfig>)
                .transpose()
                .context("Invalid auth_config in configuration")?
        }
        _ => None,
    };
    let auth_config = AuthConfig::resolve(configured).context("Missing OAuth client registration")?;

    let scope = match provider {
        GoogleProvider::Gdrive => DRIVE_SCOPE,
        GoogleProvider::Gcs => STORAGE_SCOPE,
    };
    let manager = AuthManager::new(auth_config).context("Invalid OAuth client registration")?;
    let (url, _csrf) = manager.authorization_url(scope);

    println!("Open this URL in a browser and grant access:\n\n  {}\n", url);
    println!("Paste the authorization code:");
    let mut code = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut code)
        .context("Failed to read authorization code")?;

    let tokens = manager
        .exchange_code(code.trim())
        .await
        .context("Failed to exchange authorization code")?;

    println!("\nAdd this to storage.settings in your configuration:\n");
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "tokens": tokens }))?
    );
    Ok(())
}
