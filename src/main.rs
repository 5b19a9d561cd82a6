mod app;
mod config;
mod database;
mod entities;
mod logging;
mod models;
mod ports;
mod services;
#[cfg(test)]
mod test_utils;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    app::{AppState, principal_for},
    config::Config,
    entities::download_job::JobState,
    models::{Platform, QualityTier, Track},
    services::{background::run_background_tasks, queue::JobEvent},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The config file to use
    #[arg(short, long, env = "MUSIC_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `info` or `music_sync=debug,sea_orm=warn`
    #[arg(long, default_value = "info", global = true, env = "LOG_LEVEL")]
    log_level: String,

    /// Export spans to this OTLP/gRPC endpoint
    #[arg(long, global = true, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Multi-line human-friendly log output
    #[arg(long, global = true)]
    pretty_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dispatcher, the reconcile scheduler and the refresh tasks until Ctrl-C
    Serve,
    /// Subscribe to a playlist by share link, or by id with --platform
    Subscribe {
        /// Share link, share text containing one, or a bare playlist id
        playlist: String,

        #[arg(short, long)]
        platform: Option<Platform>,

        /// How often to reconcile, e.g. `6h` or `90m`
        #[arg(short, long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,

        #[arg(short, long)]
        quality: Option<QualityTier>,
    },
    /// Stop reconciling a subscription
    Unsubscribe { id: i64 },
    /// List subscriptions, or show one in detail
    Subscriptions { id: Option<i64> },
    /// Reconcile one subscription now, or every due one
    Reconcile { id: Option<i64> },
    /// Queue a single track
    Download {
        #[arg(short, long)]
        platform: Platform,

        /// Track id on the platform (QQ songmid or NetEase song id)
        track_id: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        artist: String,

        #[arg(long, default_value = "")]
        album: String,

        #[arg(short, long)]
        quality: Option<QualityTier>,

        /// Process the queue in this process until the job finishes
        #[arg(short, long)]
        wait: bool,
    },
    /// Show queue counts and recent jobs
    Queue {
        #[arg(short, long)]
        state: Option<JobState>,

        #[arg(short, long, default_value = "20")]
        limit: u64,
    },
    /// Cancel a job
    Cancel { job_id: i64 },
    /// Daily download statistics
    Stats {
        #[arg(short, long, default_value = "7")]
        days: u32,
    },
    /// Delete finished jobs older than the retention period
    Clean {
        #[arg(long, value_parser = humantime::parse_duration)]
        older_than: Option<Duration>,
    },
    #[command(subcommand)]
    Credential(CredentialCommands),
    #[command(subcommand)]
    Relay(RelayCommands),
    #[command(subcommand)]
    Library(LibraryCommands),
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum CredentialCommands {
    /// Store a session cookie
    Set {
        platform: Platform,
        payload: String,

        /// Account the cookie belongs to; derived from the cookie when possible
        #[arg(long)]
        principal: Option<String>,
    },
    /// Probe a stored credential
    Validate {
        platform: Platform,
        #[arg(long)]
        principal: Option<String>,
    },
    /// Renew a stored credential
    Refresh {
        platform: Platform,
        #[arg(long)]
        principal: Option<String>,
    },
    /// Forget a stored credential
    Remove {
        platform: Platform,
        principal: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum RelayCommands {
    Health,
    /// Ask the relay how it sees the stored session
    Diagnose { platform: Platform },
}

#[derive(Subcommand, Debug)]
enum LibraryCommands {
    /// Fetch the catalog and publish a new snapshot
    Refresh,
    /// Check one track against the current snapshot
    Match {
        #[arg(long)]
        title: String,
        #[arg(long)]
        artist: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Create a default config file, if it doesn't exist
    CreateDefault,
    /// Print the path to the config file
    Path,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).wrap_err("Failed to serialize output")?
    );
    Ok(())
}

/// The given principal, else the platform's active credential.
async fn resolve_principal(
    state: &AppState,
    platform: Platform,
    principal: Option<String>,
) -> Result<String> {
    match principal {
        Some(principal) => Ok(principal),
        None => state
            .credentials
            .active(platform)
            .await?
            .map(|c| c.principal)
            .ok_or_else(|| eyre!("No {} credential stored", platform)),
    }
}

fn config_command(command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::CreateDefault => {
            let path = Config::create_default()?;
            println!("{}", path.display());
        }
        ConfigCommands::Path => match Config::config_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("No default config path found"),
        },
    }
    Ok(())
}

async fn serve(state: AppState) -> Result<()> {
    let reconciler = state.reconciler()?.clone();
    let library = state.library()?.clone();

    let resumed = state.queue.resume_interrupted().await?;
    let cleared = state
        .queue
        .clear_finished(state.config.queue.retention)
        .await?;
    tracing::info!(
        "Recovered {} interrupted jobs, cleared {} old ones",
        resumed,
        cleared
    );
    if let Err(e) = library.refresh().await {
        tracing::warn!("Initial library refresh failed, using cached snapshot: {:#}", e);
    }

    let tasks = run_background_tasks(
        &state.queue,
        reconciler,
        library,
        state.credentials.clone(),
        state.serve_settings(),
    );
    tracing::info!("Serving, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .wrap_err("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    tasks.shutdown().await;
    Ok(())
}

fn finished_elsewhere(job: entities::download_job::Model) -> Result<()> {
    match job.state {
        JobState::Succeeded => {
            println!(
                "Job {} finished: {}",
                job.id,
                job.file_path.as_deref().unwrap_or("already in library")
            );
            Ok(())
        }
        _ => Err(eyre!(
            "Job {} failed: {}",
            job.id,
            job.error.as_deref().unwrap_or("unknown error")
        )),
    }
}

/// Run the dispatcher here until `job_id` finishes.
async fn wait_for_job(state: &AppState, job_id: i64) -> Result<()> {
    state.queue.resume_interrupted().await?;
    let mut events = state.queue.subscribe_events();
    let cancel = CancellationToken::new();
    let dispatcher = state.queue.start(cancel.clone());

    let result = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            // A `serve` process may have claimed the job instead
            _ = tokio::time::sleep(state.config.queue.poll_interval) => {
                match state.queue.job(job_id).await {
                    Ok(Some(job)) if job.state.is_terminal() => break finished_elsewhere(job),
                    Ok(Some(_)) => continue,
                    Ok(None) => break Err(eyre!("Job {} was removed", job_id)),
                    Err(e) => break Err(e),
                }
            }
        };
        match event {
            Ok(JobEvent::Completed { job_id: id, outcome }) if id == job_id => {
                println!(
                    "Downloaded {} ({}, {} bytes)",
                    outcome.file_path.display(),
                    outcome.quality,
                    outcome.bytes_written
                );
                break Ok(());
            }
            Ok(JobEvent::Skipped { job_id: id, library_id }) if id == job_id => {
                println!("Already in library as {}", library_id);
                break Ok(());
            }
            Ok(JobEvent::Failed { job_id: id, reason, .. }) if id == job_id => {
                break Err(eyre!("Job {} failed: {}", job_id, reason));
            }
            Ok(JobEvent::CredentialAlert(alert)) => {
                eprintln!(
                    "{} credential for {} needs attention: {}",
                    alert.platform, alert.principal, alert.reason
                );
            }
            Ok(_) => {}
            Err(e) => break Err(e).wrap_err("Lost queue events"),
        }
    };

    cancel.cancel();
    dispatcher
        .await
        .wrap_err("Download dispatcher panicked")?;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let tracer_provider = logging::init_tracing(
        &args.log_level,
        args.otlp_endpoint.as_deref(),
        args.pretty_logs,
    )?;

    let result = run(args).await;

    if let Some(provider) = tracer_provider
        && let Err(e) = provider.shutdown()
    {
        eprintln!("Failed to flush traces: {}", e);
    }
    result
}

async fn run(args: Args) -> Result<()> {
    tracing::debug!("Loading configuration");
    let config = {
        if let Some(config) = args.config {
            Config::from_file(&config)
        } else {
            Config::load()
        }
    }
    .wrap_err("Failed to load music-sync config")?;

    // Config commands must work without a database
    let command = match args.command {
        Commands::Config(command) => return config_command(&command),
        command => command,
    };

    let state = AppState::build(config).await?;

    match command {
        Commands::Serve => serve(state).await?,
        Commands::Subscribe {
            playlist,
            platform,
            interval,
            quality,
        } => {
            let reconciler = state.reconciler()?;
            let quality = quality.unwrap_or(state.config.downloader.default_quality);
            let subscription = match platform {
                Some(platform) => {
                    reconciler
                        .subscribe(platform, playlist.trim(), interval, quality)
                        .await?
                }
                None => reconciler.subscribe_url(&playlist, interval, quality).await?,
            };
            println!(
                "Subscription {}: {} playlist {}",
                subscription.id, subscription.platform, subscription.playlist_id
            );
        }
        Commands::Unsubscribe { id } => {
            if !state.reconciler()?.unsubscribe(id).await? {
                return Err(eyre!("Subscription {} not found", id));
            }
        }
        Commands::Subscriptions { id: Some(id) } => {
            let status = state
                .reconciler()?
                .subscription_status(id)
                .await?
                .ok_or_else(|| eyre!("Subscription {} not found", id))?;
            print_json(&status)?;
        }
        Commands::Subscriptions { id: None } => {
            for sub in state.reconciler()?.list_subscriptions().await? {
                println!(
                    "{:>4}  {:<8} {:<14} {:<24} {:>5}m  {}{}",
                    sub.id,
                    sub.platform,
                    sub.playlist_id,
                    sub.name.as_deref().unwrap_or("-"),
                    sub.sync_interval_secs / 60,
                    if sub.active { "active" } else { "inactive" },
                    sub.last_error
                        .as_deref()
                        .map(|e| format!("  last error: {}", e))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Reconcile { id } => {
            let reconciler = state.reconciler()?;
            if let Err(e) = state.library()?.refresh().await {
                tracing::warn!("Library refresh failed, using cached snapshot: {:#}", e);
            }
            let ids = match id {
                Some(id) => vec![id],
                None => reconciler
                    .due_subscriptions(chrono::Utc::now().timestamp())
                    .await?
                    .into_iter()
                    .map(|s| s.id)
                    .collect(),
            };
            for id in ids {
                let report = reconciler.reconcile(id).await?;
                print_json(&report)?;
            }
        }
        Commands::Download {
            platform,
            track_id,
            title,
            artist,
            album,
            quality,
            wait,
        } => {
            let track = Track {
                id: track_id,
                title,
                artist,
                album,
                duration_ms: None,
                platform,
            };
            let quality = quality.unwrap_or(state.config.downloader.default_quality);
            let handle = state.queue.submit(track, quality, None).await?;
            if handle.created {
                println!("Queued job {} for {}", handle.job_id, handle.key);
            } else {
                println!("Job {} already covers {}", handle.job_id, handle.key);
            }
            if wait {
                wait_for_job(&state, handle.job_id).await?;
            }
        }
        Commands::Queue { state: filter, limit } => {
            print_json(&state.queue.status().await?)?;
            for job in state.queue.jobs(filter, limit).await? {
                println!(
                    "{:>5}  {:<16} {:<9} {:<8} {} - {}{}",
                    job.id,
                    job.state.as_str(),
                    job.current_quality,
                    job.platform,
                    job.artist,
                    job.title,
                    job.error
                        .as_deref()
                        .map(|e| format!("  ({})", e))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Cancel { job_id } => {
            let outcome = state.queue.cancel(job_id).await?;
            println!("{:?}", outcome);
        }
        Commands::Stats { days } => {
            print_json(&state.queue.statistics(days).await?)?;
        }
        Commands::Clean { older_than } => {
            let older_than = older_than.unwrap_or(state.config.queue.retention);
            let removed = state.queue.clear_finished(older_than).await?;
            println!("Removed {} finished jobs", removed);
        }
        Commands::Credential(command) => match command {
            CredentialCommands::Set {
                platform,
                payload,
                principal,
            } => {
                let principal = principal.unwrap_or_else(|| principal_for(platform, &payload));
                state.credentials.put(platform, &principal, &payload).await?;
                let validation = state.credentials.validate(platform, &principal).await?;
                println!(
                    "Stored {} credential for {} (valid: {}, tier: {:?})",
                    platform, principal, validation.valid, validation.tier
                );
            }
            CredentialCommands::Validate {
                platform,
                principal,
            } => {
                let principal = resolve_principal(&state, platform, principal).await?;
                let validation = state.credentials.validate(platform, &principal).await?;
                println!("valid: {}, tier: {:?}", validation.valid, validation.tier);
                if let Some(profile) = validation.profile {
                    println!(
                        "nickname: {}, vip: {:?}",
                        profile.nickname.as_deref().unwrap_or("-"),
                        profile.is_vip
                    );
                }
                for (tier, reason) in validation.failures {
                    println!("  {:?}: {}", tier, reason);
                }
            }
            CredentialCommands::Refresh {
                platform,
                principal,
            } => {
                let principal = resolve_principal(&state, platform, principal).await?;
                let outcome = state.credentials.refresh(platform, &principal).await;
                println!("{:?}", outcome);
            }
            CredentialCommands::Remove {
                platform,
                principal,
            } => {
                if !state.credentials.remove(platform, &principal).await? {
                    return Err(eyre!("No {} credential for {}", platform, principal));
                }
            }
            CredentialCommands::List => {
                for c in state.credentials.list().await? {
                    println!(
                        "{:<8} {:<16} valid: {:<5} tier: {:<10} nickname: {}{}",
                        c.platform,
                        c.principal,
                        c.valid,
                        c.validated_tier
                            .map(|t| format!("{:?}", t))
                            .unwrap_or_else(|| "-".into()),
                        c.nickname.as_deref().unwrap_or("-"),
                        if c.needs_attention {
                            "  NEEDS ATTENTION"
                        } else {
                            ""
                        },
                    );
                }
            }
        },
        Commands::Relay(command) => {
            let relay = state.relay()?;
            match command {
                RelayCommands::Health => {
                    let healthy = relay.health().await?;
                    println!("{}: {}", relay.base_url(), if healthy { "ok" } else { "unhealthy" });
                }
                RelayCommands::Diagnose { platform } => {
                    let credential = state
                        .credentials
                        .active(platform)
                        .await?
                        .ok_or_else(|| eyre!("No {} credential stored", platform))?;
                    let diagnosis = relay.diagnose(platform, &credential.payload).await?;
                    print_json(&diagnosis.raw)?;
                }
            }
        }
        Commands::Library(command) => {
            let library = state.library()?;
            match command {
                LibraryCommands::Refresh => {
                    let snapshot = library.refresh().await?;
                    println!(
                        "Snapshot version {} with {} tracks",
                        snapshot.version(),
                        snapshot.len()
                    );
                }
                LibraryCommands::Match { title, artist } => {
                    let track = Track {
                        id: String::new(),
                        title,
                        artist,
                        album: String::new(),
                        duration_ms: None,
                        platform: Platform::Netease,
                    };
                    let matcher = services::matching::Matcher::new(&state.config.matching);
                    print_json(&matcher.match_track(&track, &library.current()))?;
                }
            }
        }
        Commands::Config(command) => config_command(&command)?,
    }

    Ok(())
}
