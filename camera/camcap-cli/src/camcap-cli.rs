use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use camcap::{
    CameraModule, CaptureClient, FrameReceiver, PixelFormat, StreamRole,
    config::{CamcapConfig, CaptureSettings, VideoSettings, parse_config_file},
    video::{GrabOptions, VideoCapture, grab_frames},
};
use camcap_virtual::{VirtualModule, VirtualVideoCapture};

const DEFAULT_LOG_DIRECTIVES: &str = "camcap=info,warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// synthetic cameras, no hardware needed
    Virtual,
    /// Video4Linux2 devices
    #[cfg(feature = "backend_v4l")]
    V4l,
}

#[derive(Debug, Parser)]
#[command(name = "camcap", about, version)]
struct Cli {
    /// camera backend
    #[arg(
        long,
        value_enum,
        default_value_t = Backend::Virtual,
        env = "CAMCAP_BACKEND",
        global = true
    )]
    backend: Backend,

    /// TOML configuration file. Command-line options override its values.
    #[arg(long, env = "CAMCAP_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// also write the log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// list the available cameras
    List {
        /// also show the formats each camera supports
        #[arg(long)]
        formats: bool,
    },

    /// capture frames through the request queue
    Capture(CaptureArgs),

    /// read frames through the generic video-capture path
    Grab(GrabArgs),
}

#[derive(Debug, clap::Args)]
struct CaptureArgs {
    /// camera id (default: the first camera)
    #[arg(long)]
    camera: Option<String>,

    /// stream role: Raw, StillCapture, VideoRecording or Viewfinder
    #[arg(long)]
    role: Option<StreamRole>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// pixel format name (e.g. BGR888) or fourcc
    #[arg(long)]
    pixel_format: Option<PixelFormat>,

    /// number of buffers to allocate
    #[arg(long)]
    buffers: Option<u32>,

    /// how long to capture, in milliseconds
    #[arg(long)]
    duration_ms: Option<u64>,

    /// frames waiting for the consumer before new frames are dropped
    #[arg(long)]
    queue_depth: Option<usize>,

    /// save the first frame to this image file
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

impl CaptureArgs {
    fn apply_to(&self, settings: &mut CaptureSettings) {
        if let Some(camera) = &self.camera {
            settings.camera = Some(camera.clone());
        }
        if let Some(role) = self.role {
            settings.role = role;
        }
        if self.width.is_some() {
            settings.width = self.width;
        }
        if self.height.is_some() {
            settings.height = self.height;
        }
        if self.pixel_format.is_some() {
            settings.pixel_format = self.pixel_format;
        }
        if self.buffers.is_some() {
            settings.buffer_count = self.buffers;
        }
        if let Some(duration_ms) = self.duration_ms {
            settings.duration_ms = duration_ms;
        }
        if let Some(depth) = self.queue_depth {
            settings.frame_queue = depth;
        }
    }
}

#[derive(Debug, clap::Args)]
struct GrabArgs {
    /// video device index
    #[arg(long)]
    device: Option<usize>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    /// pixel format name or fourcc, e.g. BGR3
    #[arg(long)]
    fourcc: Option<PixelFormat>,

    /// stop after this many frames (0: no limit)
    #[arg(long)]
    max_frames: Option<usize>,

    /// stop after this many milliseconds (0: no limit)
    #[arg(long)]
    duration_ms: Option<u64>,
}

impl GrabArgs {
    fn apply_to(&self, settings: &mut VideoSettings) {
        if let Some(device) = self.device {
            settings.device = device;
        }
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if let Some(fps) = self.fps {
            settings.fps = fps;
        }
        if let Some(fourcc) = self.fourcc {
            settings.fourcc = fourcc;
        }
        if let Some(max_frames) = self.max_frames {
            settings.max_frames = max_frames;
        }
        if let Some(duration_ms) = self.duration_ms {
            settings.duration_ms = duration_ms;
        }
    }
}

fn run_list<M: CameraModule>(module: M, formats: bool) -> Result<()> {
    let client = CaptureClient::new(module);
    let devices = client.list_devices()?;
    if devices.is_empty() {
        return Err(camcap::Error::NoDeviceFound.into());
    }
    for device in &devices {
        println!("{device}");
        if !formats {
            continue;
        }
        let mut session = client.acquire(device)?;
        let config = session.negotiate(StreamRole::Raw, None, None)?.into_inner();
        for format in &config.formats {
            let sizes: Vec<String> = format.sizes.iter().map(|s| s.to_string()).collect();
            println!("    {}: {}", format.pixel_format, sizes.join(" "));
        }
        session.release()?;
    }
    Ok(())
}

/// Log every frame and save the first one if `snapshot` is set.
fn consume_frames(frames: FrameReceiver, mut snapshot: Option<PathBuf>) -> camcap::Result<u64> {
    let mut count = 0;
    for frame in frames {
        count += 1;
        debug!(
            "consumer got frame {} from buffer {} ({} bytes)",
            frame.sequence(),
            frame.index(),
            frame.bytes_used()
        );
        if let Some(path) = snapshot.take() {
            frame.save_snapshot(&path)?;
            info!("saved frame {} to {}", frame.sequence(), path.display());
        }
    }
    Ok(count)
}

fn run_capture<M: CameraModule>(
    module: M,
    settings: &CaptureSettings,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    let client = CaptureClient::new(module);
    info!("using {} camera backend", client.module().name());
    let mut session = match &settings.camera {
        Some(id) => client.acquire_by_id(id)?,
        None => {
            let device = client.first_device()?;
            info!("using first camera: {device}");
            client.acquire(&device)?
        }
    };

    let mut validated = session.negotiate(settings.role, settings.size(), settings.pixel_format)?;
    if let Some(count) = settings.buffer_count {
        let mut config = validated.into_inner();
        config.buffer_count = count;
        validated = session.validate(config)?;
    }
    session.apply(&validated)?;
    session.allocate_buffers()?;

    let frames = session.frames(settings.frame_queue)?;
    let consumer = std::thread::Builder::new()
        .name("frame-consumer".to_string())
        .spawn(move || consume_frames(frames, snapshot))?;

    session.start()?;
    let ran = session.run_for(settings.duration());
    // Releasing closes the frame channel, which ends the consumer.
    let released = session.release();
    let consumed = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("frame consumer panicked"))?;

    let stats = ran?;
    released?;
    let consumed = consumed?;
    info!(
        "{} frames completed, {} consumed, {} dropped, {} requests cancelled",
        stats.completed, consumed, stats.dropped, stats.cancelled
    );
    Ok(())
}

fn run_grab<C: VideoCapture>(capture: &mut C, settings: &VideoSettings) -> Result<()> {
    let requested = settings.properties();
    let actual = capture.apply_properties(&requested)?;
    if actual != requested {
        info!("requested {requested:?}, device uses {actual:?}");
    }
    let options = GrabOptions {
        max_frames: settings.max_frames,
        duration: (settings.duration_ms > 0).then(|| Duration::from_millis(settings.duration_ms)),
    };
    let summary = grab_frames(capture, &options, |_| ControlFlow::Continue(()))?;
    info!("grabbed {} frames ({:?})", summary.frames, summary.end);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CamcapConfig> {
    match path {
        Some(path) => parse_config_file(path)
            .with_context(|| format!("reading configuration {}", path.display())),
        None => Ok(CamcapConfig::default()),
    }
}

fn run(cli: Cli) -> Result<()> {
    let _log_guard = env_tracing_logger::initiate_logging(&env_tracing_logger::LogOptions {
        file: cli.log_file.as_deref(),
        default_directives: DEFAULT_LOG_DIRECTIVES,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("cannot set up logging: {e}"))?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::List { formats } => match cli.backend {
            Backend::Virtual => run_list(VirtualModule::new(), formats),
            #[cfg(feature = "backend_v4l")]
            Backend::V4l => run_list(camcap_v4l::V4lModule::new(), formats),
        },
        Command::Capture(args) => {
            let mut settings = config.capture;
            args.apply_to(&mut settings);
            let snapshot = args.snapshot;
            match cli.backend {
                Backend::Virtual => run_capture(VirtualModule::new(), &settings, snapshot),
                #[cfg(feature = "backend_v4l")]
                Backend::V4l => run_capture(camcap_v4l::V4lModule::new(), &settings, snapshot),
            }
        }
        Command::Grab(args) => {
            let mut settings = config.video;
            args.apply_to(&mut settings);
            match cli.backend {
                Backend::Virtual => run_grab(&mut VirtualVideoCapture::new(), &settings),
                #[cfg(feature = "backend_v4l")]
                Backend::V4l => run_grab(
                    &mut camcap_v4l::V4lVideoCapture::open(settings.device)?,
                    &settings,
                ),
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        if let Some(camcap::Error::NoDeviceFound) = e.downcast_ref::<camcap::Error>() {
            eprintln!("no camera found");
            std::process::exit(-1);
        }
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}
