//! Frame type and pixel format conversion — YUYV/GREY to RGBA, dark
//! detection.

/// A captured camera frame in interleaved RGBA.
#[derive(Clone)]
pub struct Frame {
    /// RGBA bytes (width * height * 4), row-major.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Average luma (0.0–255.0) over all pixels.
    pub fn avg_luma(&self) -> f32 {
        let pixels = self.data.chunks_exact(4);
        let count = pixels.len();
        if count == 0 {
            return 0.0;
        }
        let sum: u64 = pixels.map(|px| luma(px[0], px[1], px[2]) as u64).sum();
        sum as f32 / count as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Integer BT.601 luma approximation.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000) as u8
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert one YUV triple to RGB using the BT.601 integer transform.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Convert packed YUYV (4:2:2) to interleaved RGBA.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V], with the chroma
/// pair shared between both pixels.
pub fn yuyv_to_rgba(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        for y in [y0, y1] {
            let [r, g, b] = yuv_to_rgb(y, u, v);
            rgba.extend_from_slice(&[r, g, b, 255]);
        }
    }
    Ok(rgba)
}

/// Convert 8-bit grayscale to interleaved RGBA by replicating the
/// luma value into all three color channels.
pub fn grey_to_rgba(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        });
    }

    let mut rgba = Vec::with_capacity(expected * 4);
    for &value in &grey[..expected] {
        rgba.extend_from_slice(&[value, value, value, 255]);
    }
    Ok(rgba)
}

/// Check if an RGBA frame is dark using per-pixel luma.
///
/// Returns true when more than `threshold_pct` of pixels have luma
/// below 32 (the darkest histogram bucket).
pub fn is_dark_frame(rgba: &[u8], threshold_pct: f32) -> bool {
    let pixels = rgba.chunks_exact(4);
    let count = pixels.len();
    if count == 0 {
        return true;
    }
    let dark = pixels.filter(|px| luma(px[0], px[1], px[2]) < 32).count();
    (dark as f32 / count as f32) > threshold_pct
}
