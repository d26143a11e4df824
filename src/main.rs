//! cam-probe: replays the reference capture script through the status-code boundary.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cam_capture::boundary::{self, Status};
use cam_capture::validation::pixel_at;
use cam_capture::{native_backend, CoreConfig, FrameLayout, PixelFormat, PlatformBackend, SyntheticBackend};
use clap::{Parser, ValueEnum};
use image::ExtendedColorType;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// OS camera subsystem
    Native,
    /// In-process synthetic cameras
    Synthetic,
}

#[derive(Debug, Parser)]
#[command(name = "cam-probe")]
#[command(about = "Enumerate cameras and grab a frame")]
#[command(version)]
struct Cli {
    /// Device index to capture from
    #[arg(short, long, env = "CAM_DEVICE", default_value_t = 0)]
    device: i32,

    /// Backend to use
    #[arg(short, long, env = "CAM_BACKEND", value_enum, default_value_t = BackendKind::Native)]
    backend: BackendKind,

    /// Longest a single grab may block, in milliseconds
    #[arg(long, env = "CAM_GRAB_TIMEOUT_MS", default_value_t = 2000)]
    grab_timeout_ms: u64,

    /// Capture width; defaults to the widest format of the device
    #[arg(long, requires = "height")]
    width: Option<i32>,

    /// Capture height
    #[arg(long, requires = "width")]
    height: Option<i32>,

    /// Number of frames to grab
    #[arg(short = 'n', long, env = "CAM_FRAMES", default_value_t = 1)]
    frames: u32,

    /// Write the last frame as a JPEG
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Only list devices and formats
    #[arg(long)]
    list: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let result = run(&cli);
    boundary::shutdown();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn check(code: i32, what: &str) -> Result<i32, String> {
    if code < 0 {
        let status = Status::from_code(code).unwrap_or(Status::Unknown);
        return Err(format!("{what} failed: {status:?} ({code})"));
    }
    Ok(code)
}

fn read_string<F>(read: F) -> String
where
    F: Fn(&mut [u8]) -> usize,
{
    let mut buf = vec![0u8; 256];
    let len = read(&mut buf);
    if len >= buf.len() {
        buf.resize(len + 1, 0);
        read(&mut buf);
    }
    buf.truncate(len);
    String::from_utf8_lossy(&buf).into_owned()
}

fn run(cli: &Cli) -> Result<(), String> {
    let config = CoreConfig::default().with_grab_timeout(Duration::from_millis(cli.grab_timeout_ms));
    let backend: Arc<dyn PlatformBackend> = match cli.backend {
        BackendKind::Native => native_backend(&config),
        BackendKind::Synthetic => Arc::new(SyntheticBackend::with_default_devices().with_frames_until_ready(3)),
    };
    check(boundary::initialize_with(backend, config), "initialize")?;

    if boundary::has_authorization() == 0 {
        info!("camera authorization granted");
    } else {
        info!("requesting camera authorization");
        boundary::request_authorization();
    }

    let device_count = check(boundary::device_count(), "device_count")?;
    info!(device_count, "devices found");
    if device_count < 1 {
        return Ok(());
    }

    let mut widest = (0, 0);
    for index in 0..device_count {
        let name = read_string(|buf| boundary::device_name(index, buf));
        let unique_id = read_string(|buf| boundary::device_unique_id(index, buf));
        let model_id = read_string(|buf| boundary::device_model_id(index, buf));
        println!("Device {index}: {name}");
        println!("  Unique ID: {unique_id}");
        println!("  Model ID:  {model_id}");

        let format_count = check(boundary::device_format_count(index), "device_format_count")?;
        println!("  Formats:   {format_count}");
        for format_index in 0..format_count {
            let width = boundary::device_format_width(index, format_index);
            let height = boundary::device_format_height(index, format_index);
            let fps = boundary::device_format_frame_rate(index, format_index);
            let kind = read_string(|buf| boundary::device_format_type(index, format_index, buf));
            println!("    [{format_index}] {width}x{height} {fps}fps {kind}");

            if index == cli.device && width > widest.0 {
                widest = (width, height);
            }
        }
    }
    if cli.list {
        return Ok(());
    }

    let (width, height) = match (cli.width, cli.height) {
        (Some(width), Some(height)) => (width, height),
        _ => widest,
    };
    capture(cli, width, height)
}

fn capture(cli: &Cli, width: i32, height: i32) -> Result<(), String> {
    let device = cli.device;
    check(boundary::start_capture(device, width, height), "start_capture")?;
    info!(device, width, height, "capture started");

    let result = grab_frames(cli);
    let stopped = boundary::stop_capture(device);
    if stopped != Status::Ok.code() {
        warn!(code = stopped, "stop_capture reported an error");
    }
    result
}

fn grab_frames(cli: &Cli) -> Result<(), String> {
    let device = cli.device;
    let deadline = Instant::now() + Duration::from_millis(cli.grab_timeout_ms.saturating_mul(5));
    loop {
        let code = boundary::has_first_frame(device);
        if code == Status::Ok.code() {
            break;
        }
        if code != Status::NoFrameYet.code() {
            check(code, "has_first_frame")?;
        }
        if Instant::now() > deadline {
            return Err("no frame arrived".to_owned());
        }
        thread::sleep(Duration::from_millis(10));
    }
    info!("first frame available");

    let width = check(boundary::frame_width(device), "frame_width")?;
    let height = check(boundary::frame_height(device), "frame_height")?;
    let bytes_per_row = check(boundary::frame_bytes_per_row(device), "frame_bytes_per_row")?;
    println!("Frame: {width}x{height}, {bytes_per_row} bytes per row");

    let len = usize::try_from(height).unwrap_or(0) * usize::try_from(bytes_per_row).unwrap_or(0);
    let mut buffer = vec![0u8; len];
    for n in 0..cli.frames {
        let start = Instant::now();
        check(boundary::grab_frame(device, &mut buffer), "grab_frame")?;
        println!("Frame {n}: grabbed in {:?}", start.elapsed());
    }

    if let Some(path) = &cli.output {
        let tag = read_string(|buf| boundary::frame_pixel_format(device, buf));
        let pixel_format = PixelFormat::from_tag(&tag).ok_or_else(|| format!("unknown pixel format {tag:?}"))?;
        let to_u32 = |v: i32| u32::try_from(v).map_err(|_| format!("bad dimension {v}"));
        let layout = FrameLayout {
            width: to_u32(width)?,
            height: to_u32(height)?,
            bytes_per_row: to_u32(bytes_per_row)?,
            pixel_format,
        };
        save_jpeg(path, &layout, &buffer)?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

fn save_jpeg(path: &Path, layout: &FrameLayout, data: &[u8]) -> Result<(), String> {
    let mut rgb = Vec::with_capacity(layout.width as usize * layout.height as usize * 3);
    for y in 0..layout.height {
        for x in 0..layout.width {
            let (r, g, b) = pixel_at(layout, data, x, y).ok_or_else(|| format!("no pixel at ({x}, {y})"))?;
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    image::save_buffer(path, &rgb, layout.width, layout.height, ExtendedColorType::Rgb8)
        .map_err(|err| err.to_string())
}
