use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use herald::channels::{Emitter, LogChannel, TelegramChannel, WebhookChannel};
use herald::config::{ChannelKind, Config};
use herald::enhance::LlmEnhancer;
use herald::feed::RssFeedSource;
use herald::media::{ImageDownloader, MediaPolicy};
use herald::metrics;
use herald::pipeline::{Orchestrator, RunStats};
use herald::scheduler::PublicationScheduler;
use herald::storage::{shared, DedupEngine, LoadSource, StateStore};
use herald::supervisor::{ArtifactCleaner, SessionHandle, Supervisor, TaskRegistry};

/// Flags for the `run` command
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Log publications instead of sending them
    pub dry_run: bool,
    /// Run a single cycle and exit
    pub once: bool,
}

/// Dry runs keep their own history next to the live state file
fn dry_run_state_path(path: &std::path::Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!("{stem}.dry-run.json"))
}

fn build_emitter(
    config: &Config,
    session: &Arc<SessionHandle>,
    dry_run: bool,
) -> Result<Arc<dyn Emitter>> {
    if dry_run {
        return Ok(Arc::new(LogChannel::new()));
    }

    let emitter: Arc<dyn Emitter> = match config.channel.kind {
        ChannelKind::Telegram => Arc::new(
            TelegramChannel::new(config.channel.telegram.clone(), Arc::clone(session))
                .context("Failed to configure Telegram channel")?,
        ),
        ChannelKind::Webhook => Arc::new(
            WebhookChannel::new(config.channel.webhook.clone(), Arc::clone(session))
                .context("Failed to configure webhook channel")?,
        ),
        ChannelKind::Log => Arc::new(LogChannel::new()),
    };
    Ok(emitter)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::error!("Failed to wait for Ctrl+C: {}", e);
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to wait for Ctrl+C: {}", e);
    }
}

pub async fn run(mut config: Config, options: RunOptions) -> Result<()> {
    println!("Starting herald");
    println!("===============");

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    if options.dry_run {
        config.state.path = dry_run_state_path(&config.state.path);
        println!("Dry run: publications are logged, history kept in {}", config.state.path.display());
    }

    let session = SessionHandle::new(config.supervisor.session_config())
        .context("Failed to build HTTP session")?;

    let store = Arc::new(StateStore::new(config.state.store_config()));
    let outcome = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.load())
            .await
            .context("State load task failed")?
    };
    match &outcome.source {
        LoadSource::Fresh => println!("No state file, starting fresh"),
        LoadSource::Loaded(report) if report.migrated() => {
            println!("State migrated: {}", report.applied.join(", "))
        }
        LoadSource::Loaded(_) => {}
        LoadSource::Recovered { reason, backup } => {
            println!("State was unusable ({reason}); starting fresh");
            if let Some(backup) = backup {
                println!("  Corrupt file preserved at {}", backup.display());
            }
        }
    }

    let stats = RunStats::from_stats(&outcome.state.stats);
    println!("{}", store.summary(&outcome.state));
    let state = shared(outcome.state);

    let scheduler = Arc::new(PublicationScheduler::with_system_clock(
        config.publication.schedule_settings(),
    ));
    if let Some(at) = stats.last_post {
        scheduler.restore_last_emission(at);
    }
    println!("{}", scheduler.status());

    let emitter = build_emitter(&config, &session, options.dry_run)?;
    if !emitter.health_check().await.unwrap_or(false) {
        tracing::warn!(channel = emitter.name(), "Channel health check failed, continuing");
    }

    let active_feeds = config.feeds.urls.iter().filter(|f| f.active).count();
    if active_feeds == 0 {
        tracing::warn!("No active feeds configured");
    }
    let feed = Arc::new(
        RssFeedSource::new(Arc::clone(&session), config.feeds.urls.clone())
            .with_request_delay(std::time::Duration::from_secs(config.feeds.request_delay_secs)),
    );

    let tasks = Arc::new(TaskRegistry::new());
    let mut orchestrator = Orchestrator::new(
        config.orchestrator_config(),
        feed,
        DedupEngine::new(Arc::clone(&state), config.state.dedup_config()),
        Arc::clone(&scheduler),
        emitter,
        Arc::clone(&store),
        Arc::clone(&tasks),
    )
    .with_stats(stats);

    if config.enhancer.enabled {
        orchestrator = orchestrator.with_enhancer(Arc::new(LlmEnhancer::new(
            config.enhancer.clone(),
            Arc::clone(&session),
        )));
    }
    if config.media.policy != MediaPolicy::Disabled {
        orchestrator = orchestrator.with_media(Arc::new(ImageDownloader::new(
            Arc::clone(&session),
            &config.media.output_dir,
            config.media.download_timeout(),
        )));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if options.once {
        let mut shutdown = shutdown_rx;
        let result = orchestrator.run_cycle(&mut shutdown).await;
        orchestrator.flush().await;
        tasks.abort_all().await;
        session.close().await;

        let report = result.context("Cycle failed")?;
        println!();
        println!("Cycle complete:");
        println!("  Fetched:    {}", report.fetched);
        println!("  Published:  {}", report.published());
        println!("  Duplicates: {}", report.duplicates());
        println!("  Failed:     {}", report.failed());
        return Ok(());
    }

    let supervisor = Supervisor::new(
        config.supervisor.clone(),
        Arc::clone(&session),
        Arc::clone(&tasks),
        ArtifactCleaner::new(&config.media.output_dir, config.supervisor.artifact_retention()),
        Arc::clone(&state),
    );
    let supervisor_handle = supervisor.start(shutdown_rx.clone());

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        println!("\nShutdown signal received, stopping...");
        let _ = signal_tx.send(true);
    });

    println!("Press Ctrl+C to stop.\n");
    orchestrator.run(shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    supervisor_handle.join(config.supervisor.shutdown_grace()).await;

    if metrics::metrics_initialized() {
        match metrics::encode_metrics() {
            Ok(text) => tracing::debug!(metrics = %text, "Final metrics"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
        }
    }

    let stats = orchestrator.stats();
    println!("herald stopped.");
    println!("  Posts sent:          {}", stats.posts_sent);
    println!("  Duplicates rejected: {}", stats.duplicates_rejected);
    println!("  Cycles completed:    {}", stats.cycles_completed);
    Ok(())
}
