//! Stride-aware pixel access and test-pattern checks for delivered frames.
//!
//! Every function honors `bytes_per_row`, so padded frames validate the same
//! as packed ones.

use crate::error::{CameraError, Result};
use crate::frame::{FrameBuffer, FrameLayout};
use crate::traits::PixelFormat;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
#[must_use]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}

/// RGB value of pixel (`x`, `y`) in `data` laid out as `layout`.
///
/// Gray pixels are returned with all three channels equal.
pub fn pixel_at(layout: &FrameLayout, data: &[u8], x: u32, y: u32) -> Option<(u8, u8, u8)> {
    if x >= layout.width || y >= layout.height {
        return None;
    }
    let row_start = (y as usize).checked_mul(layout.bytes_per_row as usize)?;
    let row = data.get(row_start..row_start + layout.row_bytes())?;
    let x = x as usize;

    match layout.pixel_format {
        PixelFormat::Rgb24 | PixelFormat::Nv12 | PixelFormat::Mjpeg => {
            let px = row.get(x * 3..x * 3 + 3)?;
            Some((*px.first()?, *px.get(1)?, *px.get(2)?))
        }
        PixelFormat::Gray => {
            let value = *row.get(x)?;
            Some((value, value, value))
        }
        PixelFormat::Yuyv => {
            // [Y0 U Y1 V]: each pair of pixels shares U and V.
            let pair = row.get((x & !1) * 2..(x & !1) * 2 + 4)?;
            let luma = if x % 2 == 0 { *pair.first()? } else { *pair.get(2)? };
            Some(yuv_to_rgb(luma, *pair.get(1)?, *pair.get(3)?))
        }
    }
}

/// Check that `data` can hold a frame of `layout` and that the layout is
/// self-consistent.
pub fn validate_buffer(layout: &FrameLayout, data: &[u8]) -> Result<()> {
    layout
        .validate()
        .map_err(|err| CameraError::Validation(err.to_string()))?;
    if data.len() < layout.frame_len() {
        return Err(CameraError::Validation(format!(
            "buffer holds {} bytes, {}x{} at stride {} needs {}",
            data.len(),
            layout.width,
            layout.height,
            layout.bytes_per_row,
            layout.frame_len()
        )));
    }
    Ok(())
}

/// Copy the pixel bytes of every row into a tightly packed buffer.
pub fn pack_rows(layout: &FrameLayout, data: &[u8]) -> Result<Vec<u8>> {
    validate_buffer(layout, data)?;
    let row_bytes = layout.row_bytes();
    let mut packed = Vec::with_capacity(row_bytes * layout.height as usize);
    for row in data
        .chunks_exact(layout.bytes_per_row as usize)
        .take(layout.height as usize)
    {
        packed.extend_from_slice(row.get(..row_bytes).unwrap_or(row));
    }
    Ok(packed)
}

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// Checks the center of 8 vertical stripes on the middle row.
pub fn validate_color_bars(frame: &FrameBuffer) -> Result<()> {
    if frame.pixel_format() == PixelFormat::Gray {
        return Err(CameraError::Validation(
            "color bars cannot be checked on a gray frame".to_owned(),
        ));
    }
    let layout = frame.layout();
    let bar_width = layout.width / 8;
    let center_y = layout.height / 2;

    for (bar_idx, expected_rgb) in SMPTE_COLOR_BARS.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let sample_x = (bar_idx as u32 * bar_width) + (bar_width / 2);

        let actual_rgb = pixel_at(&layout, frame.data(), sample_x, center_y).ok_or_else(|| {
            CameraError::Validation(format!("no pixel at ({sample_x}, {center_y})"))
        })?;

        if !colors_match(actual_rgb, *expected_rgb, COLOR_TOLERANCE) {
            return Err(CameraError::Validation(format!(
                "Color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected_rgb:?}, got RGB{actual_rgb:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Luminance along the middle row must not decrease and must rise by at
/// least 50 across the frame.
pub fn validate_gradient(frame: &FrameBuffer) -> Result<()> {
    let layout = frame.layout();
    let center_y = layout.height / 2;

    let mut first_luminance: Option<f32> = None;
    let mut prev_luminance: Option<f32> = None;

    for x in (0..layout.width).step_by(10) {
        let (r, g, b) = pixel_at(&layout, frame.data(), x, center_y)
            .ok_or_else(|| CameraError::Validation(format!("no pixel at ({x}, {center_y})")))?;

        // Y' in Rec. 601
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );
        first_luminance.get_or_insert(luminance);

        if let Some(prev) = prev_luminance {
            if luminance < prev - 1.0 {
                return Err(CameraError::Validation(format!(
                    "Gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }
        prev_luminance = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first_luminance, prev_luminance) {
        let luminance_change = last - first;
        if luminance_change < 50.0 {
            return Err(CameraError::Validation(format!(
                "Insufficient luminance change for gradient: {luminance_change} \
                 (expected at least 50.0)"
            )));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by exactly 1.
pub fn validate_frame_sequence(frames: &[FrameBuffer]) -> Result<()> {
    check_sequence(frames, |prev, curr| curr == prev + 1)
}

/// Validates that frame sequence numbers strictly increase.
///
/// Backends that keep only the newest frame skip sequence numbers when the
/// consumer is slower than the camera.
pub fn validate_increasing_sequence(frames: &[FrameBuffer]) -> Result<()> {
    check_sequence(frames, |prev, curr| curr > prev)
}

fn check_sequence<F>(frames: &[FrameBuffer], ok: F) -> Result<()>
where
    F: Fn(u64, u64) -> bool,
{
    if frames.is_empty() {
        return Err(CameraError::Validation(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if !ok(prev.sequence(), curr.sequence()) {
                return Err(CameraError::Validation(format!(
                    "Frame sequence break at index {}: {} followed by {}",
                    i + 1,
                    prev.sequence(),
                    curr.sequence()
                )));
            }
        }
    }

    Ok(())
}

fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}
