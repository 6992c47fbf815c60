//! Frame views and the center-sample decoder.
//!
//! - `PixelFormat`: tag that decides the byte layout of each sample.
//! - `VideoFrame`: borrowed view of one captured frame.
//! - `decode`: the single decode routine shared by polling and callback mode.
//!
//! Decoding never reinterprets the buffer as a typed pointer. Samples are read
//! from a bounds-checked byte slice, and a buffer shorter than the geometry
//! promises is a `DecodeError`, not undefined behavior.

use serde::{Deserialize, Serialize};
use std::fmt;

// ----------------------------------------------------------------------------
// PixelFormat
// ----------------------------------------------------------------------------

/// Pixel formats a depth-camera SDK reports.
///
/// Only `Depth1Mm`, `Depth100Um` and `Rgb888` are decodable here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    #[serde(rename = "depth_1_mm")]
    Depth1Mm,
    #[serde(rename = "depth_100_um")]
    Depth100Um,
    #[serde(rename = "shift_9_2")]
    Shift9_2,
    #[serde(rename = "shift_9_3")]
    Shift9_3,
    #[serde(rename = "rgb888")]
    Rgb888,
    #[serde(rename = "yuv422")]
    Yuv422,
    #[serde(rename = "yuyv")]
    Yuyv,
    #[serde(rename = "gray8")]
    Gray8,
    #[serde(rename = "gray16")]
    Gray16,
    #[serde(rename = "jpeg")]
    Jpeg,
    #[serde(rename = "unknown")]
    Unknown(u32),
}

impl PixelFormat {
    /// Numeric format code used on the SDK side.
    pub fn code(&self) -> u32 {
        match self {
            PixelFormat::Depth1Mm => 100,
            PixelFormat::Depth100Um => 101,
            PixelFormat::Shift9_2 => 102,
            PixelFormat::Shift9_3 => 103,
            PixelFormat::Rgb888 => 200,
            PixelFormat::Yuv422 => 201,
            PixelFormat::Gray8 => 202,
            PixelFormat::Gray16 => 203,
            PixelFormat::Jpeg => 204,
            PixelFormat::Yuyv => 205,
            PixelFormat::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            100 => PixelFormat::Depth1Mm,
            101 => PixelFormat::Depth100Um,
            102 => PixelFormat::Shift9_2,
            103 => PixelFormat::Shift9_3,
            200 => PixelFormat::Rgb888,
            201 => PixelFormat::Yuv422,
            202 => PixelFormat::Gray8,
            203 => PixelFormat::Gray16,
            204 => PixelFormat::Jpeg,
            205 => PixelFormat::Yuyv,
            other => PixelFormat::Unknown(other),
        }
    }

    /// Bytes occupied by one pixel in the frame buffer.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Depth1Mm
            | PixelFormat::Depth100Um
            | PixelFormat::Shift9_2
            | PixelFormat::Shift9_3
            | PixelFormat::Gray16
            | PixelFormat::Yuv422
            | PixelFormat::Yuyv => 2,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Gray8 | PixelFormat::Jpeg | PixelFormat::Unknown(_) => 1,
        }
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, PixelFormat::Depth1Mm | PixelFormat::Depth100Um)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Depth1Mm => f.write_str("depth_1_mm"),
            PixelFormat::Depth100Um => f.write_str("depth_100_um"),
            PixelFormat::Shift9_2 => f.write_str("shift_9_2"),
            PixelFormat::Shift9_3 => f.write_str("shift_9_3"),
            PixelFormat::Rgb888 => f.write_str("rgb888"),
            PixelFormat::Yuv422 => f.write_str("yuv422"),
            PixelFormat::Yuyv => f.write_str("yuyv"),
            PixelFormat::Gray8 => f.write_str("gray8"),
            PixelFormat::Gray16 => f.write_str("gray16"),
            PixelFormat::Jpeg => f.write_str("jpeg"),
            PixelFormat::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

// ----------------------------------------------------------------------------
// VideoFrame
// ----------------------------------------------------------------------------

/// Borrowed view of one captured frame.
///
/// The view borrows the reader's backing buffer, which the next read reuses.
/// Holding a frame across a second read does not compile:
///
/// ```compile_fail
/// use depthtap::FrameReader;
///
/// fn hold_across_reads(reader: &mut dyn FrameReader) {
///     let first = reader.read_frame().unwrap();
///     let _second = reader.read_frame().unwrap();
///     println!("{}", first.width);
/// }
/// ```
#[derive(Clone, Copy, Debug)]
pub struct VideoFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture timestamp in microseconds since the stream started.
    pub timestamp: u64,
    /// Capture sequence number.
    pub index: u64,
}

impl<'a> VideoFrame<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
            timestamp: 0,
            index: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    /// Buffer length the geometry and format promise.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.format.bytes_per_pixel())
    }
}

/// Pixel index sampled as the frame's representative value.
///
/// For 640x480 this is 153 920: row 240, column 320.
pub fn center_index(width: u32, height: u32) -> usize {
    (height as usize + 1) * width as usize / 2
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Unit of a decoded depth value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthUnit {
    Millimeter,
    HundredMicrometer,
}

/// One representative sample taken from a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedSample {
    Depth {
        timestamp: u64,
        index: u64,
        value: u16,
        unit: DepthUnit,
    },
    Color {
        timestamp: u64,
        index: u64,
        rgb: [u8; 3],
    },
}

impl DecodedSample {
    pub fn timestamp(&self) -> u64 {
        match self {
            DecodedSample::Depth { timestamp, .. } | DecodedSample::Color { timestamp, .. } => {
                *timestamp
            }
        }
    }

    /// Capture sequence number of the frame the sample came from.
    pub fn frame_index(&self) -> u64 {
        match self {
            DecodedSample::Depth { index, .. } | DecodedSample::Color { index, .. } => *index,
        }
    }

    /// Depth in millimeters, for depth samples.
    pub fn millimeters(&self) -> Option<f32> {
        match self {
            DecodedSample::Depth { value, unit, .. } => Some(match unit {
                DepthUnit::Millimeter => *value as f32,
                DepthUnit::HundredMicrometer => *value as f32 / 10.0,
            }),
            DecodedSample::Color { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected frame format {0}")]
    UnsupportedFormat(PixelFormat),

    #[error("empty frame ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("frame buffer too short: need {needed} bytes, have {actual}")]
    BufferTooShort { needed: usize, actual: usize },
}

/// Decode the center sample of a frame.
///
/// Depth formats yield a single little-endian `u16`; RGB888 yields the three
/// channel bytes. Any other format is `UnsupportedFormat`.
pub fn decode(frame: &VideoFrame<'_>) -> Result<DecodedSample, DecodeError> {
    let unit = match frame.format {
        PixelFormat::Depth1Mm => Some(DepthUnit::Millimeter),
        PixelFormat::Depth100Um => Some(DepthUnit::HundredMicrometer),
        PixelFormat::Rgb888 => None,
        other => return Err(DecodeError::UnsupportedFormat(other)),
    };

    let pixel = center_pixel(frame)?;
    match unit {
        Some(unit) => Ok(DecodedSample::Depth {
            timestamp: frame.timestamp,
            index: frame.index,
            value: u16::from_le_bytes([pixel[0], pixel[1]]),
            unit,
        }),
        None => Ok(DecodedSample::Color {
            timestamp: frame.timestamp,
            index: frame.index,
            rgb: [pixel[0], pixel[1], pixel[2]],
        }),
    }
}

fn center_pixel<'a>(frame: &VideoFrame<'a>) -> Result<&'a [u8], DecodeError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(DecodeError::EmptyFrame {
            width: frame.width,
            height: frame.height,
        });
    }
    let actual = frame.data.len();
    let needed = frame.expected_len().unwrap_or(usize::MAX);
    if actual < needed {
        return Err(DecodeError::BufferTooShort { needed, actual });
    }

    let bpp = frame.format.bytes_per_pixel();
    let start = center_index(frame.width, frame.height).saturating_mul(bpp);
    let end = start.saturating_add(bpp);
    frame
        .data
        .get(start..end)
        .ok_or(DecodeError::BufferTooShort {
            needed: end,
            actual,
        })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
