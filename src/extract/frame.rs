/*!
 * Host-side frame model
 *
 * The immutable `FrameData` value handed to in-process callbacks and the
 * ring transport, plus the pixel-format whitelist and per-frame flags
 * carried through the slot header.
 */

use bytes::Bytes;
use serde::Serialize;

/// Pixel format of an extracted frame, carried on the wire as the
/// graphics runtime's numeric format code. Unknown codes survive a
/// round trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    Rgba8Typeless,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Typeless,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Unknown(u32),
}

impl PixelFormat {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            27 => Self::Rgba8Typeless,
            28 => Self::Rgba8Unorm,
            29 => Self::Rgba8UnormSrgb,
            87 => Self::Bgra8Unorm,
            90 => Self::Bgra8Typeless,
            91 => Self::Bgra8UnormSrgb,
            other => Self::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::Rgba8Typeless => 27,
            Self::Rgba8Unorm => 28,
            Self::Rgba8UnormSrgb => 29,
            Self::Bgra8Unorm => 87,
            Self::Bgra8Typeless => 90,
            Self::Bgra8UnormSrgb => 91,
            Self::Unknown(raw) => raw,
        }
    }

    /// Whether the extractor passes this format through. Everything on
    /// the whitelist is 32-bit RGBA/BGRA; no conversion is attempted for
    /// the rest.
    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    pub fn bytes_per_pixel(self) -> u32 {
        4
    }
}

bitflags::bitflags! {
    /// Per-frame flags stored in the slot header. Unknown bits are
    /// preserved on read.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        const KEYFRAME = 1 << 0;
        /// Set on a write that evicted the oldest unread slot.
        const EVICTED_PREDECESSOR = 1 << 1;
        const ERROR = 1 << 2;
    }
}

/// One extracted frame. Immutable after construction; `Bytes` lets the
/// in-process callbacks and the transport share one payload copy.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub width: u32,
    pub height: u32,
    /// Bytes per row as read back from the staging surface; may exceed
    /// `width * 4` when the runtime pads rows.
    pub stride: u32,
    pub format: PixelFormat,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Monotonic per-extractor counter.
    pub sequence: u64,
    pub flags: FrameFlags,
    pub data: Bytes,
}

impl FrameData {
    /// Whether rows are packed edge to edge with no padding.
    pub fn is_tightly_packed(&self) -> bool {
        self.stride == self.width * self.format.bytes_per_pixel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelisted_formats_round_trip() {
        for raw in [27, 28, 29, 87, 90, 91] {
            let format = PixelFormat::from_raw(raw);
            assert!(format.is_supported());
            assert_eq!(format.to_raw(), raw);
        }
    }

    #[test]
    fn unknown_format_codes_are_preserved() {
        let format = PixelFormat::from_raw(24); // 10-bit format, unsupported
        assert!(!format.is_supported());
        assert_eq!(format, PixelFormat::Unknown(24));
        assert_eq!(format.to_raw(), 24);
    }

    #[test]
    fn unknown_flag_bits_survive() {
        let flags = FrameFlags::from_bits_retain(0x8000_0001);
        assert!(flags.contains(FrameFlags::KEYFRAME));
        assert_eq!(flags.bits(), 0x8000_0001);
    }

    #[test]
    fn tight_packing_check_uses_stride() {
        let frame = FrameData {
            width: 64,
            height: 64,
            stride: 256,
            format: PixelFormat::Bgra8Unorm,
            timestamp_ms: 0,
            sequence: 0,
            flags: FrameFlags::empty(),
            data: Bytes::new(),
        };
        assert!(frame.is_tightly_packed());
        assert!(!FrameData { stride: 320, ..frame }.is_tightly_packed());
    }
}
