use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    AttendanceService, CommandProvider, GeoLocation, RegisterError, VerifyError, VerifyOutcome,
};
use rollcall_store::SqliteStore;

mod config;

use config::Config;

// 1 is left to anyhow for errors returned from main.
const EXIT_NO_MATCH: u8 = 2;
const EXIT_NO_FACE: u8 = 3;
const EXIT_PROVIDER: u8 = 4;

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Face-verified attendance")]
struct Cli {
    /// Config file (default: $ROLLCALL_CONFIG or $XDG_CONFIG_HOME/rollcall/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an identity (no face enrolled yet)
    Add {
        /// Unique handle, e.g. a username
        handle: String,
        /// Display name
        #[arg(short, long)]
        name: String,
    },
    /// Enroll a face image for an identity, replacing any previous one
    Enroll {
        handle: String,
        /// Image file containing exactly one face
        image: PathBuf,
    },
    /// Identify the face in an image and record attendance
    Verify {
        image: PathBuf,
        /// Latitude of the check-in, in decimal degrees
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        /// Longitude of the check-in, in decimal degrees
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
    },
    /// List identities and whether they have an enrolled face
    List,
    /// Show recorded attendance, newest first
    Attendance {
        /// Only this identity
        #[arg(long)]
        handle: Option<String>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Add { handle, name } => {
            let store = open_store(&cfg)?;
            let identity = store
                .create_identity(&handle, &name)
                .with_context(|| format!("creating identity {handle}"))?;
            println!("Created {} ({})", identity.handle, identity.display_name);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Enroll { handle, image } => enroll(&cfg, &handle, &image).await,
        Commands::Verify { image, lat, lon } => {
            let location = match (lat, lon) {
                (Some(latitude), Some(longitude)) => Some(GeoLocation {
                    latitude,
                    longitude,
                }),
                _ => None,
            };
            verify(&cfg, &image, location).await
        }
        Commands::List => {
            let store = open_store(&cfg)?;
            let identities = store.list_identities()?;
            if identities.is_empty() {
                println!("No identities");
            }
            for identity in identities {
                let face = match &identity.descriptor {
                    Some(d) => format!("enrolled ({})", d.model_version),
                    None => "not enrolled".to_string(),
                };
                println!("{:<20} {:<30} {face}", identity.handle, identity.display_name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Attendance {
            handle,
            limit,
            json,
        } => {
            let store = open_store(&cfg)?;
            for event in store.attendance(handle.as_deref(), limit)? {
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                    continue;
                }
                let location = event
                    .location
                    .map(|l| format!(" @ {:.6},{:.6}", l.latitude, l.longitude))
                    .unwrap_or_default();
                println!(
                    "{} {:<20} {}{location}",
                    event.recorded_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    event.handle,
                    event.status
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&cfg)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(cfg: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&cfg.db_path)
        .with_context(|| format!("opening database {}", cfg.db_path.display()))
}

fn provider(cfg: &Config) -> Result<CommandProvider> {
    CommandProvider::from_argv(&cfg.provider_command, &cfg.model_version)
        .context("provider_command is empty")
}

/// Read an image file and make sure it is in a recognised format.
fn read_image(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let format = image::guess_format(&bytes)
        .with_context(|| format!("{} is not a recognised image", path.display()))?;
    tracing::debug!(path = %path.display(), ?format, bytes = bytes.len(), "image loaded");
    Ok(bytes)
}

async fn enroll(cfg: &Config, handle: &str, image: &Path) -> Result<ExitCode> {
    let bytes = read_image(image)?;
    let store = open_store(cfg)?;
    let provider = provider(cfg)?;
    let service = AttendanceService::new(&provider, &store, &store, cfg.policy());

    match service.register(handle, &bytes).await {
        Ok(identity) => {
            println!("Enrolled face for {} ({})", identity.handle, identity.display_name);
            Ok(ExitCode::SUCCESS)
        }
        Err(RegisterError::NoFaceDetected) => {
            println!("No face detected; try another image");
            Ok(ExitCode::from(EXIT_NO_FACE))
        }
        Err(RegisterError::Provider(e)) => {
            eprintln!("Face model unavailable, try again: {e}");
            Ok(ExitCode::from(EXIT_PROVIDER))
        }
        Err(e) => Err(e).with_context(|| format!("enrolling {handle}")),
    }
}

async fn verify(cfg: &Config, image: &Path, location: Option<GeoLocation>) -> Result<ExitCode> {
    let bytes = read_image(image)?;
    let store = open_store(cfg)?;
    let provider = provider(cfg)?;
    let service = AttendanceService::new(&provider, &store, &store, cfg.policy());

    let code = report_verify(service.verify(&bytes, location).await)?;
    Ok(ExitCode::from(code))
}

/// Print a verification result and pick the process exit code.
fn report_verify(result: Result<VerifyOutcome, VerifyError>) -> Result<u8> {
    match result {
        Ok(VerifyOutcome::Matched(v)) => {
            println!(
                "Matched {} ({}) distance {:.4}: {}",
                v.handle, v.display_name, v.distance, v.event.status
            );
            Ok(0)
        }
        Ok(VerifyOutcome::NoMatch) => {
            println!("No matching face");
            Ok(EXIT_NO_MATCH)
        }
        Err(VerifyError::NoFaceDetected) => {
            println!("No face detected; try another image");
            Ok(EXIT_NO_FACE)
        }
        Err(VerifyError::Provider(e)) => {
            eprintln!("Face model unavailable, try again: {e}");
            Ok(EXIT_PROVIDER)
        }
        Err(e) => Err(e).context("verifying face"),
    }
}
