//! Camera-session binary for exercising a session end to end.

use std::path::PathBuf;
use std::time::Duration;

use camera_session::mock::{MockBackend, MockPushBackend};
use camera_session::{
    CameraBackend, ControlId, ControlValue, FrameMetadata, Session, SessionConfig, V4L2Backend,
};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long to wait for a single frame before giving up.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Synthetic mock camera paced by the session.
    Mock,
    /// Mock camera pushing frames from its own thread.
    Push,
    /// V4L2 capture device.
    V4l2,
}

/// Stream frames from a camera and print what arrives.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Camera back-end.
    #[arg(long, value_enum, default_value_t = Backend::Mock)]
    backend: Backend,

    /// V4L2 device index (/dev/video<N>).
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Session configuration file.
    #[arg(long, default_value = "camera-session.toml")]
    config: PathBuf,

    /// Number of frames to receive before exiting.
    #[arg(long, default_value_t = 30)]
    frames: usize,

    /// Gain to apply before streaming.
    #[arg(long)]
    gain: Option<i32>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = SessionConfig::load_from(&args.config)?;

    match args.backend {
        Backend::Mock => stream(&MockBackend::default(), &config, &args),
        Backend::Push => stream(&MockPushBackend::default(), &config, &args),
        Backend::V4l2 => stream(&V4L2Backend { index: args.device }, &config, &args),
    }
}

fn stream<B: CameraBackend>(
    backend: &B,
    config: &SessionConfig,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(backend, config)?;

    let caps = session.capabilities();
    println!("Device: {}", caps.card);
    println!("Driver: {}", caps.driver);
    println!(
        "Max frame: {}x{} ({} bytes/pixel)",
        caps.max_size.width, caps.max_size.height, caps.bytes_per_pixel
    );

    if let Some(gain) = args.gain {
        session.set_control(ControlId::GAIN, ControlValue::Int32(gain))?;
        info!(gain, "gain applied");
    }

    let (tx, rx) = crossbeam_channel::unbounded::<FrameMetadata>();
    session.start_streaming(move |_data, metadata| {
        let _ = tx.send(metadata.clone());
    })?;

    for _ in 0..args.frames {
        match rx.recv_timeout(FRAME_TIMEOUT) {
            Ok(metadata) => println!(
                "Frame {}: {} bytes, {}x{}, timestamp: {:?}",
                metadata.sequence,
                metadata.bytes_used,
                metadata.size.width,
                metadata.size.height,
                metadata.timestamp
            ),
            Err(err) => {
                warn!(error = %err, "no frame received");
                break;
            }
        }
    }

    session.stop_streaming()?;
    let stats = session.stats();
    println!(
        "Produced {}, delivered {}, dropped {}",
        stats.frames_produced, stats.frames_delivered, stats.frames_dropped
    );

    session.close()?;
    Ok(())
}
