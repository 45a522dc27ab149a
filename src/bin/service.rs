use face_lock::service::Supervisor;
use face_lock::{AppContext, Config, DevMode, Result};

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser, Debug)]
#[command(name = "facelock-service")]
#[command(about = "Face-recognition door lock service")]
struct Args {
    /// Run in development mode
    #[arg(long)]
    dev: bool,

    /// Config file to use instead of the default search path
    #[arg(long)]
    config: Option<PathBuf>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> std::io::Result<()> {
    for signal in [libc::SIGINT, libc::SIGTERM] {
        install_handler(signal, request_shutdown)?;
    }
    Ok(())
}

/// SA_RESTART keeps blocking reads on the camera stream from failing with
/// EINTR; the loop sees the flag after its current frame.
fn install_handler(signal: libc::c_int, handler: extern "C" fn(libc::c_int)) -> std::io::Result<()> {
    // SAFETY: the handler only stores to an atomic, and `action` is fully
    // initialized before it is passed to the kernel.
    let rc = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, std::ptr::null_mut())
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(args.dev);

    tracing::info!("Starting face-lock service (dev_mode: {})", args.dev);

    match run(&args) {
        Ok(()) => {
            tracing::info!("Service stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Service failed: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn run(args: &Args) -> Result<()> {
    install_signal_handlers()?;

    let dev_mode = DevMode::new(args.dev)?;
    let config = Config::for_run(args.config.as_deref(), &dev_mode)?;
    let (context, mut camera) = AppContext::from_config(config)?;

    let mut supervisor = Supervisor::new();
    let source = context.socket_command_source()?;
    context.start_workers(&mut supervisor, source)?;

    let mut pipeline = context.pipeline();
    let outcome = context.engine.run(&mut camera, &mut pipeline, &SHUTDOWN);

    let failed = supervisor.poll_failures();
    if !failed.is_empty() {
        tracing::warn!("{} worker(s) had stopped before shutdown", failed.len());
    }

    drop(camera);
    let closed = context.shutdown(&mut supervisor);
    outcome?;
    closed
}
