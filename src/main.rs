//! uvc-stream: serve a UVC camera as an MJPEG multipart stream

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use uvc_stream::{utils, CaptureEngine, Config, FrameMailbox, StreamServer, V4l2Capture};

#[derive(Parser, Debug)]
#[command(name = "uvc-stream", version, about = "Stream MJPEG from UVC cameras")]
struct Cli {
    /// Configuration TOML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Video device to open (your camera); empty string to auto-detect
    #[arg(short, long)]
    device: Option<String>,

    #[arg(short, long)]
    width: Option<u32>,

    #[arg(short = 'H', long)]
    height: Option<u32>,

    /// Frames per second sent to clients
    #[arg(short, long)]
    fps: Option<u32>,

    /// TCP port for the server
    #[arg(short, long)]
    port: Option<u16>,

    /// Fork to the background, daemon mode
    #[arg(short, long)]
    background: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.capture.device = device.clone();
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.background {
            config.server.background = true;
        }
    }
}

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // Fork before any thread exists
    if config.server.background {
        nix::unistd::daemon(false, false).wrap_err("Failed to daemonize")?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("uvc_stream=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("Failed to start runtime")?;
    let result = runtime.block_on(run(config));
    // a dispatcher stuck past the grace period must not hold the process open
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(mut config: Config) -> Result<()> {
    info!("uvc-stream launching...");

    // Auto-detect capture device if needed
    if config.capture.device.is_empty() {
        config.capture.device = utils::auto_detect_device()?;
    }

    let capture = V4l2Capture::open(&config.capture)?;
    capture.apply_controls(&config.controls);
    config.capture = capture.config().clone();
    uvc_stream::CONFIG.store(Arc::new(config.clone()));

    let stop = Arc::new(AtomicBool::new(false));
    let mailbox = Arc::new(FrameMailbox::new(config.capture.max_frame_len()));

    let server = StreamServer::bind(config.server.clone(), mailbox.clone(), stop.clone())
        .await
        .wrap_err_with(|| format!("Failed to listen on port {}", config.server.port))?;

    let engine = CaptureEngine::new(capture, &config.capture, mailbox.clone(), stop.clone());
    let mut capture_task = tokio::task::spawn_blocking(move || engine.run());
    let mut capture_result = None;

    server
        .run_until(async {
            tokio::select! {
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => info!("Interrupt received"),
                    Err(e) => error!("Cannot listen for interrupt: {}", e),
                },
                res = &mut capture_task => capture_result = Some(res),
            }
        })
        .await;

    info!("Shutting down...");
    stop.store(true, Ordering::Release);
    mailbox.close();
    let grace = uvc_stream::CONFIG.load().server.shutdown_grace();
    let lingering = server.shutdown().await;
    if lingering > 0 {
        warn!(lingering, "Exiting with dispatchers still running");
    }

    let capture_result = match capture_result {
        Some(res) => res,
        None => match tokio::time::timeout(grace, capture_task).await {
            Ok(res) => res,
            Err(_) => return Err(eyre!("Capture thread did not stop within {:?}", grace)),
        },
    };
    capture_result
        .wrap_err("Capture thread panicked")?
        .wrap_err("Capture device failed")?;

    let stats = mailbox.stats();
    info!(
        published = stats.published,
        delivered = stats.delivered,
        "uvc-stream stopped"
    );
    Ok(())
}
