use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use presence_core::{FaceAnalyzer, Matcher, OnnxAnalyzer, PresenceEvent, Registry};
use presence_hw::{redact_uri, SourceOpener, UriOpener};
use presenced::{Config, EventReporter, EventSink, HttpTransport, SqliteIdentityStore};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "presence", about = "Presence daemon operator tools")]
struct Cli {
    /// TOML configuration file (default: PRESENCE_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List identities in the registry and any skipped records
    Registry,
    /// Open a video source and read a few frames
    Probe {
        /// Stream URI (rtsp://, http://, file path, or /dev/videoN)
        uri: String,
        /// Number of frames to read
        #[arg(short, long, default_value_t = 10)]
        frames: u32,
    },
    /// Detect and identify faces in an image file
    Detect {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Send one test presence event to the attendance endpoint
    Report {
        /// Identity id to report
        id: i64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Registry => list_registry(&config),
        Commands::Probe { uri, frames } => probe(&uri, frames),
        Commands::Detect { image } => detect(&config, &image),
        Commands::Report { id } => report(&config, id),
    }
}

fn load_registry(config: &Config) -> Result<Registry> {
    let store = SqliteIdentityStore::new(&config.db_path);
    let (registry, report) = Registry::load(&store)
        .with_context(|| format!("load identities from {}", config.db_path.display()))?;
    for skipped in &report.skipped {
        println!("skipped: {skipped}");
    }
    Ok(registry)
}

fn list_registry(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    if registry.is_empty() {
        println!("No identities registered");
        return Ok(());
    }
    println!("{:<8} {:<40} DIM", "ID", "NAME");
    for identity in registry.identities() {
        println!(
            "{:<8} {:<40} {}",
            identity.id,
            identity.caption(),
            identity.descriptor.len()
        );
    }
    println!("{} identities", registry.len());
    Ok(())
}

fn probe(uri: &str, frames: u32) -> Result<()> {
    println!("Opening {}", redact_uri(uri));
    let started = Instant::now();
    let mut source = UriOpener::detect()
        .open(uri)
        .with_context(|| format!("open {}", redact_uri(uri)))?;
    println!("Opened in {:.2?}", started.elapsed());

    let started = Instant::now();
    for _ in 0..frames {
        let frame = source.read_frame()?;
        println!(
            "frame {:>4}: {}x{}",
            frame.sequence,
            frame.width(),
            frame.height()
        );
    }
    let elapsed = started.elapsed().as_secs_f32();
    if elapsed > 0.0 && frames > 0 {
        println!("{:.1} fps", frames as f32 / elapsed);
    }
    Ok(())
}

fn detect(config: &Config, image_path: &Path) -> Result<()> {
    let image = image::open(image_path)
        .with_context(|| format!("read image {}", image_path.display()))?
        .to_rgb8();

    let mut analyzer = OnnxAnalyzer::load(&config.scrfd_model_path(), &config.arcface_model_path())?;
    let observations = analyzer.analyze(&image)?;
    println!(
        "{} face(s) in {}x{} image",
        observations.len(),
        image.width(),
        image.height()
    );

    let registry = match load_registry(config) {
        Ok(registry) => registry,
        Err(e) => {
            println!("registry unavailable ({e:#}), matching skipped");
            Registry::empty()
        }
    };
    let matcher = Matcher::euclidean(config.match_threshold);

    for (index, observation) in observations.iter().enumerate() {
        let region = observation.region;
        let result = matcher.identify(&observation.descriptor, &registry);
        let label = match result.identity {
            Some(identity) if result.is_recognized() => identity.caption(),
            _ => "Unknown".to_string(),
        };
        println!(
            "#{index}: top={:.0} right={:.0} bottom={:.0} left={:.0}  {label} (distance {:.3})",
            region.top, region.right, region.bottom, region.left, result.distance
        );
    }
    Ok(())
}

fn report(config: &Config, id: i64) -> Result<()> {
    let transport = HttpTransport::new(config.http_timeout())?;
    let reporter = EventReporter::new(transport, config.reporter_settings());
    let event = PresenceEvent {
        identity_id: id,
        observed_at: Utc::now(),
        stream_label: "cli".to_string(),
    };

    if reporter.report(&event) {
        println!("Event for identity {id} delivered to {}", config.report_url);
        Ok(())
    } else {
        anyhow::bail!(
            "event for identity {id} not delivered after {} attempt(s)",
            config.http_retries
        )
    }
}
