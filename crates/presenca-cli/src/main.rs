use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "presenca", about = "presenca attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    /// (development mode).
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Record a manual check-in for a subject
    Checkin {
        /// Profile id of the subject
        subject_id: String,
    },
    /// Create a new profile
    Create {
        /// Display name
        name: String,
    },
    /// Enroll a profile: capture samples from the camera and commit
    Enroll {
        /// Profile id to enroll
        profile_id: String,
        /// Number of samples to capture
        #[arg(short, long, default_value_t = 5)]
        samples: u32,
    },
    /// Remove a profile's biometrics
    Clear {
        /// Profile id to clear
        profile_id: String,
    },
    /// List enrolled profiles
    Profiles,
    /// Show the most recent kiosk check-in event
    Last,
    /// Run camera diagnostics, optionally writing a captured frame as PNG
    Test {
        /// Output path for the captured frame
        #[arg(short, long)]
        output: Option<std::path::PathBuf>,
    },
}

// `#[zbus::proxy]` generates KioskProxy; method names map to the PascalCase
// members served by presencad.
#[zbus::proxy(
    interface = "org.presenca.Kiosk1",
    default_service = "org.presenca.Kiosk1",
    default_path = "/org/presenca/Kiosk1"
)]
trait Kiosk {
    async fn status(&self) -> zbus::Result<String>;
    async fn manual_check_in(&self, subject_id: &str) -> zbus::Result<String>;
    async fn create_profile(&self, name: &str) -> zbus::Result<String>;
    async fn enroll_sample(&self, profile_id: &str) -> zbus::Result<u32>;
    async fn enroll_commit(&self, profile_id: &str) -> zbus::Result<u32>;
    async fn enroll_clear(&self, profile_id: &str) -> zbus::Result<()>;
    async fn list_profiles(&self) -> zbus::Result<String>;
    async fn last_check_in(&self) -> zbus::Result<String>;
}

async fn connect(session: bool) -> Result<zbus::Connection> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    };
    conn.context("failed to connect to D-Bus — is presencad running?")
}

fn print_json(payload: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let conn = connect(cli.session).await?;
            let proxy = KioskProxy::new(&conn).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Checkin { subject_id } => {
            let conn = connect(cli.session).await?;
            let proxy = KioskProxy::new(&conn).await?;
            print_json(&proxy.manual_check_in(&subject_id).await?)?;
        }
        Commands::Create { name } => {
            let conn = connect(cli.session).await?;
            let proxy = KioskProxy::new(&conn).await?;
            let id = proxy.create_profile(&name).await?;
            println!("{id}");
        }
        Commands::Enroll {
            profile_id,
            samples,
        } => {
            let conn = connect(cli.session).await?;
            let proxy = KioskProxy::new(&conn).await?;

            println!("Capturing {samples} samples — look at the camera.");
            let mut captured = 0u32;
            let mut attempts = 0u32;
            // Allow a few retries for frames with no detectable face.
            while captured < samples && attempts < samples * 3 {
                attempts += 1;
                match proxy.enroll_sample(&profile_id).await {
                    Ok(count) => {
                        captured = count;
                        println!("  sample {captured}/{samples}");
                    }
                    Err(e) => println!("  capture failed: {e}"),
                }
                tokio::time::sleep(std::time::Duration::from_millis(400)).await;
            }

            let committed = proxy.enroll_commit(&profile_id).await?;
            println!("Enrolled {committed} samples for {profile_id}.");
        }
        Commands::Clear { profile_id } => {
            let conn = connect(cli.session).await?;
            let proxy = KioskProxy::new(&conn).await?;
            proxy.enroll_clear(&profile_id).await?;
            println!("Biometrics cleared for {profile_id}.");
        }
        Commands::Profiles => {
            let conn = connect(cli.session).await?;
            let proxy = KioskProxy::new(&conn).await?;
            print_json(&proxy.list_profiles().await?)?;
        }
        Commands::Last => {
            let conn = connect(cli.session).await?;
            let proxy = KioskProxy::new(&conn).await?;
            print_json(&proxy.last_check_in().await?)?;
        }
        Commands::Test { output } => {
            // Diagnostics bypass the daemon and drive the camera directly.
            let devices = presenca_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found.");
            }
            for d in &devices {
                println!("{}  {} ({})", d.path, d.name, d.driver);
            }

            let device = std::env::var("PRESENCA_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string());
            let camera = presenca_hw::Camera::open(&device)?;
            let frame = camera.capture_frame()?;
            println!(
                "Captured {}x{} frame from {device}, brightness {:.1}",
                frame.width,
                frame.height,
                frame.avg_brightness()
            );

            if let Some(path) = output {
                let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
                    .context("frame buffer does not match its dimensions")?;
                image.save(&path)?;
                println!("Wrote {}", path.display());
            }
        }
    }

    Ok(())
}
