use anyhow::{Context, Result};
use clap::Parser;
use presence_core::{CooldownTracker, Matcher, OnnxAnalyzerFactory, Registry};
use presence_hw::UriOpener;
use presenced::feedback::SoundFeedback;
use presenced::{
    Config, EventReporter, HttpTransport, Recognition, SqliteIdentityStore, StopSignal,
    StreamLauncher, Supervisor,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "presenced", about = "Multi-stream face recognition presence daemon")]
struct Args {
    /// TOML configuration file (default: PRESENCE_* environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    config.validate()?;

    tracing::info!(streams = config.streams.len(), "presenced starting");

    let store = SqliteIdentityStore::new(&config.db_path);
    let (registry, report) = Registry::load(&store)
        .map_err(|e| {
            tracing::error!(kind = "registry_unavailable", error = %e, "cannot load identities");
            e
        })
        .context("identity registry is required to start")?;
    tracing::info!(
        identities = report.loaded,
        skipped = report.skipped.len(),
        "registry ready"
    );

    // The blocking HTTP client must be built outside any async runtime.
    let transport = HttpTransport::new(config.http_timeout())?;
    let reporter = EventReporter::new(transport, config.reporter_settings());

    let recognition = Recognition::new(
        Arc::new(registry),
        Matcher::euclidean(config.match_threshold),
        CooldownTracker::new(config.cooldown()),
        Arc::new(reporter),
        Arc::new(SoundFeedback::from_config(&config)),
    )
    .with_delivery_attempts(config.http_retries);

    let stop = StopSignal::new();
    let launcher = StreamLauncher {
        opener: Arc::new(UriOpener::detect()),
        analyzers: Arc::new(OnnxAnalyzerFactory {
            scrfd_path: config.scrfd_model_path(),
            arcface_path: config.arcface_model_path(),
        }),
        recognition: Arc::new(recognition),
        settings: config.worker_settings(),
        stop: stop.clone(),
    };

    let supervisor = Supervisor::start(launcher, &config.streams, config.supervisor_poll(), stop.clone());
    let supervisor_thread = std::thread::Builder::new()
        .name("supervisor".into())
        .spawn(move || supervisor.run())
        .context("spawn supervisor thread")?;

    tracing::info!("presenced ready");
    wait_for_shutdown()?;
    tracing::info!("presenced shutting down");

    stop.stop();
    if supervisor_thread.join().is_err() {
        anyhow::bail!("supervisor thread panicked");
    }

    tracing::info!("presenced stopped");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
fn wait_for_shutdown() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;

    runtime.block_on(async {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    })?;
    Ok(())
}
