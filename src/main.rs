use face_lock::camera::{FrameSource, V4l2Camera};
use face_lock::service::{AdminClient, RemoteClient, RemoteReply};
use face_lock::storage::{AccessEvent, EventFilter, EventSource, Outcome, User};
use face_lock::{Config, DevMode};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facelock")]
#[command(about = "Administer the face-lock access controller")]
struct Cli {
    /// Enable development mode (local data directory and /tmp sockets)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file to use instead of the default search path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled users
    Users {
        #[arg(long)]
        json: bool,
    },
    /// Enroll or re-enroll a user from an image named <label>_<name>.<ext>
    Upload {
        file: PathBuf,
    },
    /// Browse the access log, newest first
    Events {
        #[arg(long)]
        label: Option<i64>,
        /// admitted | denied
        #[arg(long)]
        outcome: Option<Outcome>,
        /// recognition | remote
        #[arg(long)]
        source: Option<EventSource>,
        /// Only events at or after this RFC3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Unlock the door remotely
    Unlock,
    /// Lock the door immediately
    Lock,
    /// Capture one frame and save it
    TestCamera,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.dev);

    let dev_mode = DevMode::new(cli.dev)?;
    let config = Config::for_run(cli.config.as_deref(), &dev_mode)?;

    match cli.command {
        Commands::Users { json } => {
            let users = AdminClient::new(&config.admin.socket_path).list_users()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&users)?);
            } else {
                print_users(&users);
            }
        }
        Commands::Upload { file } => {
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("{} has no usable file name", file.display()))?
                .to_string();
            let content = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;

            let receipt = AdminClient::new(&config.admin.socket_path).upload(&filename, content)?;
            println!(
                "{} user {} ({})",
                if receipt.created { "Enrolled" } else { "Re-enrolled" },
                receipt.user.label,
                receipt.user.name
            );
            if !receipt.template_refreshed {
                println!("Warning: no face template could be built from this image");
            }
        }
        Commands::Events { label, outcome, source, since, until, limit, json } => {
            let filter = EventFilter { since, until, label, outcome, source, limit };
            let events = AdminClient::new(&config.admin.socket_path).list_events(filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                print_events(&events);
            }
        }
        Commands::Unlock => send_remote(&config, "unlock")?,
        Commands::Lock => send_remote(&config, "lock")?,
        Commands::TestCamera => {
            let mut camera = V4l2Camera::open(&config)?;
            let frame = camera.next_frame()?;
            let save_path = dev_mode.get_capture_path("camera_test");
            if let Some(parent) = save_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            frame.save(&save_path)?;
            println!(
                "Captured {}x{} from /dev/video{}, saved to {}",
                frame.width(),
                frame.height(),
                camera.device_index(),
                save_path.display()
            );
        }
    }

    Ok(())
}

fn send_remote(config: &Config, payload: &str) -> Result<()> {
    let client = RemoteClient::new(
        &config.remote.socket_path,
        &config.remote.topic,
        config.remote.shared_secret.clone(),
    );
    match client.send(payload)? {
        RemoteReply::Accepted { command, detail } => {
            println!("{}: {}", command, detail);
            Ok(())
        }
        RemoteReply::Rejected(reason) => bail!("command rejected: {}", reason),
    }
}

fn print_users(users: &[User]) {
    if users.is_empty() {
        println!("No users enrolled");
        return;
    }
    println!("{:>6}  {:<24} {:<20} {}", "LABEL", "NAME", "ENROLLED", "IMAGE");
    for user in users {
        println!(
            "{:>6}  {:<24} {:<20} {}",
            user.label,
            user.name,
            user.enrolled_at.format("%Y-%m-%d %H:%M:%S"),
            user.image_path.display()
        );
    }
}

fn print_events(events: &[AccessEvent]) {
    if events.is_empty() {
        println!("No matching events");
        return;
    }
    for event in events {
        println!("{}", event.to_log_line());
    }
}

fn setup_logging(dev_mode: bool) {
    let builder = tracing_subscriber::fmt().with_writer(std::io::stderr);
    if dev_mode {
        builder.with_max_level(tracing::Level::DEBUG).init();
    } else {
        builder.with_max_level(tracing::Level::WARN).init();
    }
}
