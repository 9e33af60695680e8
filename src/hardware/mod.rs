//! Hardware layer
//!
//! - [`capabilities`]: the `DigitalPort` and `FrameSource` traits
//! - [`firmata`]: Firmata controller over an async byte stream (serial in the field)
//! - [`mock`]: simulated controller and cameras for `--simulate` and tests

pub mod capabilities;
pub mod firmata;
pub mod mock;

/// A single camera frame.
///
/// # Storage
/// Data is stored as a raw byte vector (`Vec<u8>`).
/// - 8-bit images: 1 byte per pixel.
/// - 12/16-bit images: 2 bytes per pixel, Little Endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bits per pixel (8, 12 or 16)
    pub bit_depth: u32,

    /// Raw pixel data
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            bit_depth: 16,
            data,
        }
    }

    /// Create a frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bit_depth: 8,
            data,
        }
    }

    /// Bytes the pixel buffer must hold for this frame's size and bit depth.
    pub fn expected_len(&self) -> usize {
        let pixels = (self.width as usize) * (self.height as usize);
        if self.bit_depth > 8 {
            pixels * 2
        } else {
            pixels
        }
    }
}

/// A frame together with the camera that delivered it.
///
/// Grabs may come back with fewer frames than cameras, so the position in the
/// returned list says nothing about which camera a frame belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFrame {
    /// Camera index, stable for the lifetime of the rig
    pub camera: usize,

    /// Frame data
    pub frame: Frame,
}

impl CameraFrame {
    /// Tag `frame` with its camera index.
    pub fn new(camera: usize, frame: Frame) -> Self {
        Self { camera, frame }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_u16_is_little_endian() {
        let frame = Frame::from_u16(2, 1, &[0x0102, 0xA0B0]);
        assert_eq!(frame.data, vec![0x02, 0x01, 0xB0, 0xA0]);
        assert_eq!(frame.expected_len(), 4);
    }

    #[test]
    fn eight_bit_length() {
        let frame = Frame::from_u8(3, 2, vec![0; 6]);
        assert_eq!(frame.expected_len(), frame.data.len());
    }
}
