//! Status-code boundary over the process-wide registry.
//!
//! Every test owns the global registry for its duration, hence `#[serial]`.

use std::sync::Arc;
use std::time::Duration;

use cam_capture::boundary::{self, Status};
use cam_capture::{CoreConfig, PermissionState, SyntheticBackend};
use serial_test::serial;

fn init(backend: SyntheticBackend) {
    boundary::shutdown();
    assert_eq!(
        boundary::initialize_with(Arc::new(backend), CoreConfig::default()),
        Status::Ok.code()
    );
}

fn read_string<F>(read: F) -> String
where
    F: Fn(&mut [u8]) -> usize,
{
    let mut buf = [0u8; 128];
    let len = read(&mut buf);
    String::from_utf8_lossy(&buf[..len.min(buf.len() - 1)]).into_owned()
}

#[test]
#[serial]
fn test_not_initialized() {
    boundary::shutdown();

    assert_eq!(boundary::device_count(), Status::NotInitialized.code());
    assert_eq!(boundary::has_authorization(), Status::NotInitialized.code());
    assert_eq!(boundary::start_capture(0, 640, 480), Status::NotInitialized.code());
    assert_eq!(boundary::has_first_frame(0), Status::NotInitialized.code());
    assert_eq!(boundary::stop_capture(0), Status::NotInitialized.code());
    // Harmless before initialize.
    boundary::request_authorization();

    let mut buf = [0xFFu8; 16];
    assert_eq!(boundary::device_name(0, &mut buf), 0);
    assert_eq!(buf[0], 0);
}

#[test]
#[serial]
fn test_enumeration() {
    init(SyntheticBackend::with_default_devices());

    assert_eq!(boundary::device_count(), 2);
    assert_eq!(read_string(|b| boundary::device_name(0, b)), "Synthetic HD Camera");
    assert_eq!(
        read_string(|b| boundary::device_unique_id(1, b)),
        "synthetic:synthetic-ir-camera"
    );
    assert!(!read_string(|b| boundary::device_model_id(0, b)).is_empty());

    assert_eq!(boundary::device_format_count(0), 2);
    assert_eq!(boundary::device_format_width(0, 0), 1920);
    assert_eq!(boundary::device_format_height(0, 0), 1080);
    assert_eq!(boundary::device_format_frame_rate(0, 0), 30);
    assert_eq!(read_string(|b| boundary::device_format_type(0, 0, b)), "MJPEG");
    assert_eq!(read_string(|b| boundary::device_format_type(0, 1, b)), "YUYV");

    assert_eq!(boundary::device_format_count(2), Status::DeviceNotFound.code());
    assert_eq!(boundary::device_format_width(0, 2), Status::FormatNotFound.code());
    assert_eq!(boundary::device_format_width(5, 0), Status::DeviceNotFound.code());
    assert_eq!(boundary::device_format_count(-1), Status::InvalidArgument.code());
    assert_eq!(read_string(|b| boundary::device_name(7, b)), "");

    boundary::shutdown();
}

#[test]
#[serial]
fn test_initialize_twice_keeps_the_first_backend() {
    init(SyntheticBackend::with_default_devices());
    let other = SyntheticBackend::new();
    assert_eq!(
        boundary::initialize_with(Arc::new(other), CoreConfig::default()),
        Status::Ok.code()
    );
    assert_eq!(boundary::device_count(), 2);
    boundary::shutdown();
}

#[test]
#[serial]
fn test_unreachable_backend_fails_initialize() {
    boundary::shutdown();
    let backend = SyntheticBackend::with_default_devices();
    backend.set_reachable(false);

    assert_eq!(
        boundary::initialize_with(Arc::new(backend), CoreConfig::default()),
        Status::OpeningDevice.code()
    );
    assert_eq!(boundary::device_count(), Status::NotInitialized.code());
}

#[test]
#[serial]
fn test_truncated_strings_report_full_length() {
    init(SyntheticBackend::with_default_devices());

    let mut buf = [0xFFu8; 10];
    let len = boundary::device_name(0, &mut buf);
    assert_eq!(len, "Synthetic HD Camera".len());
    assert!(len >= buf.len());
    assert_eq!(&buf, b"Synthetic\0");

    let mut empty: [u8; 0] = [];
    assert_eq!(boundary::device_name(0, &mut empty), len);

    boundary::shutdown();
}

#[test]
#[serial]
fn test_capture_lifecycle() {
    init(SyntheticBackend::with_default_devices().with_frames_until_ready(2));

    assert_eq!(boundary::has_first_frame(0), Status::SessionNotStarted.code());
    assert_eq!(boundary::frame_width(0), Status::SessionNotStarted.code());

    assert_eq!(boundary::start_capture(0, 1920, 1080), Status::Ok.code());
    assert_eq!(boundary::start_capture(0, 1920, 1080), Status::SessionAlreadyStarted.code());

    let mut buffer = vec![0u8; 1920 * 1080 * 3];
    assert_eq!(boundary::grab_frame(0, &mut buffer), Status::NoFrameYet.code());
    assert_eq!(boundary::has_first_frame(0), Status::NoFrameYet.code());
    assert_eq!(boundary::has_first_frame(0), Status::NoFrameYet.code());
    assert_eq!(boundary::has_first_frame(0), Status::Ok.code());

    assert_eq!(boundary::frame_width(0), 1920);
    assert_eq!(boundary::frame_height(0), 1080);
    assert!(boundary::frame_bytes_per_row(0) >= 1920 * 3);
    assert_eq!(read_string(|b| boundary::frame_pixel_format(0, b)), "RGB24");

    assert_eq!(boundary::grab_frame(0, &mut []), Status::BufferNull.code());
    assert_eq!(boundary::grab_frame(0, &mut buffer[..100]), Status::BufferNotEnough.code());
    assert_eq!(boundary::grab_frame(0, &mut buffer), Status::Ok.code());
    assert!(buffer.iter().any(|&b| b != 0));

    assert_eq!(boundary::stop_capture(0), Status::Ok.code());
    assert_eq!(boundary::stop_capture(0), Status::Ok.code());
    assert_eq!(boundary::frame_width(0), Status::SessionNotStarted.code());
    assert_eq!(boundary::grab_frame(0, &mut buffer), Status::SessionNotStarted.code());

    assert_eq!(boundary::start_capture(0, 1920, 1080), Status::Ok.code());
    assert_eq!(boundary::shutdown(), Status::Ok.code());
    assert_eq!(boundary::has_first_frame(0), Status::NotInitialized.code());
}

#[test]
#[serial]
fn test_start_capture_argument_errors() {
    init(SyntheticBackend::with_default_devices());

    assert_eq!(boundary::start_capture(0, 800, 600), Status::FormatNotFound.code());
    assert_eq!(boundary::start_capture(0, 0, 480), Status::InvalidArgument.code());
    assert_eq!(boundary::start_capture(0, 640, -480), Status::InvalidArgument.code());
    assert_eq!(boundary::start_capture(-1, 640, 480), Status::InvalidArgument.code());
    assert_eq!(boundary::start_capture(9, 640, 480), Status::DeviceNotFound.code());

    // A rejected size leaves the device free.
    assert_eq!(boundary::start_capture(0, 640, 480), Status::Ok.code());
    boundary::shutdown();
}

#[test]
#[serial]
fn test_authorization_codes() {
    init(
        SyntheticBackend::with_default_devices()
            .with_permission(PermissionState::Undetermined, PermissionState::Denied),
    );

    assert_eq!(boundary::has_authorization(), -2);
    boundary::request_authorization();
    assert_eq!(boundary::has_authorization(), -1);
    assert_eq!(boundary::start_capture(0, 640, 480), Status::PermissionDenied.code());

    init(SyntheticBackend::with_default_devices());
    assert_eq!(boundary::has_authorization(), 0);
    boundary::shutdown();
}

#[test]
#[serial]
fn test_read_failure_maps_to_reading_frame() {
    let backend = SyntheticBackend::with_default_devices();
    init(backend.clone());

    assert_eq!(boundary::start_capture(1, 640, 480), Status::Ok.code());
    assert_eq!(boundary::has_first_frame(1), Status::Ok.code());

    backend.set_fail_reads(true);
    let mut buffer = vec![0u8; 640 * 480];
    assert_eq!(boundary::grab_frame(1, &mut buffer), Status::ReadingFrame.code());

    backend.set_fail_reads(false);
    assert_eq!(boundary::grab_frame(1, &mut buffer), Status::Ok.code());

    backend.disconnect("synthetic:synthetic-ir-camera");
    assert_eq!(boundary::grab_frame(1, &mut buffer), Status::OpeningDevice.code());
    assert_eq!(boundary::has_first_frame(1), Status::ReadingSession.code());
    boundary::shutdown();
}

#[test]
#[serial]
fn test_stalled_camera_times_out_and_dead_stream_fails_session() {
    let backend = SyntheticBackend::with_default_devices();
    boundary::shutdown();
    let config = CoreConfig::default().with_grab_timeout(Duration::from_millis(50));
    assert_eq!(
        boundary::initialize_with(Arc::new(backend.clone()), config),
        Status::Ok.code()
    );

    assert_eq!(boundary::start_capture(0, 640, 480), Status::Ok.code());
    assert_eq!(boundary::has_first_frame(0), Status::Ok.code());
    let mut buffer = vec![0u8; 640 * 480 * 2];

    backend.set_stall_reads(true);
    assert_eq!(boundary::grab_frame(0, &mut buffer), Status::GrabTimeout.code());
    assert_eq!(boundary::frame_width(0), 640);
    assert_eq!(boundary::start_capture(0, 640, 480), Status::SessionAlreadyStarted.code());

    backend.set_stall_reads(false);
    assert_eq!(boundary::grab_frame(0, &mut buffer), Status::Ok.code());

    backend.set_stream_ended(true);
    assert_eq!(boundary::has_first_frame(0), Status::ReadingSession.code());
    assert_eq!(boundary::grab_frame(0, &mut buffer), Status::ReadingSession.code());

    // A failed session is replaced on the next start.
    backend.set_stream_ended(false);
    assert_eq!(boundary::start_capture(0, 640, 480), Status::Ok.code());
    assert_eq!(boundary::has_first_frame(0), Status::Ok.code());
    boundary::shutdown();
}
