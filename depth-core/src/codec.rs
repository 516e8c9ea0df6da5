//! Depth payload wire codec: quantizes a float depth map to 16-bit and
//! frames it with a fixed 32-byte little-endian header (spec §4.1/§6).

use std::io::Write;

use flate2::{write::ZlibEncoder, Compression};
use ndarray::Array2;

pub const HEADER_SIZE: usize = 32;
const MAGIC_RAW: &[u8; 4] = b"VDZ1";
const MAGIC_DEFLATE: &[u8; 4] = b"VDZ2";
const VERSION: u16 = 1;
const DATA_TYPE_U16: u16 = 1;

/// A packed depth frame ready to write to the wire.
pub struct DepthPayload {
    pub buffer: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub scale: f32,
    pub bias: f32,
    pub z_max: f32,
}

/// Quantizes `depth` to 16-bit using `(z_min, z_max)`, clamping and
/// normalizing into `[0, 65535]`. Returns the encoded pixels in row-major
/// order alongside the effective `(scale, bias)`.
///
/// `z_max` is nudged above `z_min` if the caller passed a degenerate range,
/// matching the wire contract's "never fails for finite input" guarantee.
fn quantize(depth: &Array2<f32>, z_min: f32, mut z_max: f32) -> (Vec<u8>, f32, f32) {
    if z_max <= z_min {
        z_max = z_min + 1e-3;
    }
    let scale = (z_max - z_min) / 65535.0;
    let mut bytes = Vec::with_capacity(depth.len() * 2);
    for &v in depth.iter() {
        let clamped = v.clamp(z_min, z_max);
        let normalized = (clamped - z_min) / scale;
        let quantized = normalized.round().clamp(0.0, 65535.0) as u16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }
    (bytes, scale, z_min)
}

/// Packs a depth frame into the wire format described in spec §4.1.
///
/// `timestamp_ms` is truncated (not rounded) to a `u32` before writing,
/// matching the original implementation's `int(timestamp_ms)` cast.
pub fn pack_depth_payload(
    depth: &Array2<f32>,
    timestamp_ms: f64,
    z_min: f32,
    z_max: f32,
    compress: bool,
) -> DepthPayload {
    let (height, width) = depth.dim();
    let (pixels, scale, bias) = quantize(depth, z_min, z_max);
    let effective_z_max = if z_max <= z_min { z_min + 1e-3 } else { z_max };

    let (magic, payload) = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(&pixels)
            .expect("writing to an in-memory encoder never fails");
        (MAGIC_DEFLATE, encoder.finish().expect("zlib finish"))
    } else {
        (MAGIC_RAW, pixels)
    };

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(magic);
    buffer.extend_from_slice(&VERSION.to_le_bytes());
    buffer.extend_from_slice(&DATA_TYPE_U16.to_le_bytes());
    buffer.extend_from_slice(&(timestamp_ms as u32).to_le_bytes());
    buffer.extend_from_slice(&(width as u32).to_le_bytes());
    buffer.extend_from_slice(&(height as u32).to_le_bytes());
    buffer.extend_from_slice(&scale.to_le_bytes());
    buffer.extend_from_slice(&bias.to_le_bytes());
    buffer.extend_from_slice(&effective_z_max.to_le_bytes());
    buffer.extend_from_slice(&payload);

    DepthPayload {
        buffer,
        width: width as u32,
        height: height as u32,
        scale,
        bias,
        z_max: effective_z_max,
    }
}

/// Parsed header fields, used by tests and by any out-of-process consumer
/// that wants to validate the wire contract without depending on this crate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthHeader {
    pub compressed: bool,
    pub version: u16,
    pub data_type: u16,
    pub timestamp_ms: u32,
    pub width: u32,
    pub height: u32,
    pub scale: f32,
    pub bias: f32,
    pub z_max: f32,
}

/// Parses the header and dequantizes the pixel payload back to `f32`
/// meters. Used only by round-trip tests (spec §8); the server never reads
/// its own wire format back.
pub fn decode_payload(buffer: &[u8]) -> Option<(DepthHeader, Array2<f32>)> {
    if buffer.len() < HEADER_SIZE {
        return None;
    }
    let magic: [u8; 4] = buffer[0..4].try_into().ok()?;
    let compressed = match &magic {
        b"VDZ1" => false,
        b"VDZ2" => true,
        _ => return None,
    };
    let header = DepthHeader {
        compressed,
        version: u16::from_le_bytes(buffer[4..6].try_into().ok()?),
        data_type: u16::from_le_bytes(buffer[6..8].try_into().ok()?),
        timestamp_ms: u32::from_le_bytes(buffer[8..12].try_into().ok()?),
        width: u32::from_le_bytes(buffer[12..16].try_into().ok()?),
        height: u32::from_le_bytes(buffer[16..20].try_into().ok()?),
        scale: f32::from_le_bytes(buffer[20..24].try_into().ok()?),
        bias: f32::from_le_bytes(buffer[24..28].try_into().ok()?),
        z_max: f32::from_le_bytes(buffer[28..32].try_into().ok()?),
    };

    let raw = if header.compressed {
        use flate2::read::ZlibDecoder;
        use std::io::Read;
        let mut decoder = ZlibDecoder::new(&buffer[HEADER_SIZE..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).ok()?;
        out
    } else {
        buffer[HEADER_SIZE..].to_vec()
    };

    let pixel_count = (header.width as usize) * (header.height as usize);
    if raw.len() < pixel_count * 2 {
        return None;
    }
    let mut depth = Array2::zeros((header.height as usize, header.width as usize));
    for (i, v) in depth.iter_mut().enumerate() {
        let bytes = [raw[i * 2], raw[i * 2 + 1]];
        let quantized = u16::from_le_bytes(bytes);
        *v = header.scale * quantized as f32 + header.bias;
    }
    Some((header, depth))
}
