//! Pixel format registry and format negotiation

use std::fmt;
use std::str::FromStr;

use crate::error::{DeviceError, Result};

/// Four character code identifying a pixel format (e.g. RGB4, BGR4).
///
/// The numeric form is little-endian, matching `v4l2_fourcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// 32-bit ARGB, bytes A R G B
    pub const RGB32: Self = Self::new(b"RGB4");
    /// 32-bit BGRA, bytes B G R A
    pub const BGR32: Self = Self::new(b"BGR4");
    /// Packed 4:2:2, not produced by this device
    pub const YUYV: Self = Self::new(b"YUYV");

    pub const fn as_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub const fn from_u32(tag: u32) -> Self {
        Self(tag.to_le_bytes())
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| DeviceError::invalid_argument(format!("fourcc must be 4 bytes: {:?}", s)))?;
        Ok(Self(bytes))
    }
}

/// Color channel stored at one byte offset of a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Alpha,
    Red,
    Green,
    Blue,
}

/// Solid color used by the test pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const RED: Self = Self { r: 0xff, g: 0, b: 0 };
    pub const GREEN: Self = Self { r: 0, g: 0xff, b: 0 };
    pub const BLUE: Self = Self { r: 0, g: 0, b: 0xff };
}

/// A supported pixel format.
#[derive(Debug, PartialEq, Eq)]
pub struct PixelFormat {
    pub name: &'static str,
    pub fourcc: FourCC,
    pub bits_per_pixel: u32,
    /// Channel stored at each byte offset of a pixel
    pub channels: &'static [Channel],
    /// Value written to the alpha channel
    pub alpha: u8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel / 8) as usize
    }

    /// Size in bytes of one frame at the given resolution.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bits_per_pixel as usize / 8
    }

    /// Write one pixel of `color` into `out` in this format's channel order.
    pub fn write_pixel(&self, color: Rgb, out: &mut [u8]) {
        for (byte, channel) in out.iter_mut().zip(self.channels) {
            *byte = match channel {
                Channel::Alpha => self.alpha,
                Channel::Red => color.r,
                Channel::Green => color.g,
                Channel::Blue => color.b,
            };
        }
    }

    /// Read back the color of one pixel.
    pub fn read_pixel(&self, pixel: &[u8]) -> Rgb {
        let mut color = Rgb { r: 0, g: 0, b: 0 };
        for (byte, channel) in pixel.iter().zip(self.channels) {
            match channel {
                Channel::Red => color.r = *byte,
                Channel::Green => color.g = *byte,
                Channel::Blue => color.b = *byte,
                Channel::Alpha => {}
            }
        }
        color
    }
}

static FORMATS: [PixelFormat; 2] = [
    PixelFormat {
        name: "ARGB8888, 32 bpp",
        fourcc: FourCC::RGB32,
        bits_per_pixel: 32,
        channels: &[Channel::Alpha, Channel::Red, Channel::Green, Channel::Blue],
        alpha: 0x00,
    },
    PixelFormat {
        name: "32 bpp RGB, be",
        fourcc: FourCC::BGR32,
        bits_per_pixel: 32,
        channels: &[Channel::Blue, Channel::Green, Channel::Red, Channel::Alpha],
        alpha: 0xff,
    },
];

/// All supported formats, in enumeration order.
pub fn formats() -> &'static [PixelFormat] {
    &FORMATS
}

/// Format selected when a session is opened.
pub fn default_format() -> &'static PixelFormat {
    &FORMATS[0]
}

/// Look up a format by tag.
pub fn find(fourcc: FourCC) -> Result<&'static PixelFormat> {
    FORMATS
        .iter()
        .find(|f| f.fourcc == fourcc)
        .ok_or_else(|| DeviceError::NotFound(format!("unsupported pixel format {}", fourcc)))
}

/// Entry returned by format enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub index: u32,
    pub description: &'static str,
    pub fourcc: FourCC,
    pub bits_per_pixel: u32,
}

/// Describe the format at `index`; `NotFound` past the last one.
pub fn enumerate(index: u32) -> Result<FormatDescriptor> {
    let format = FORMATS
        .get(index as usize)
        .ok_or_else(|| DeviceError::NotFound(format!("no format at index {}", index)))?;
    Ok(FormatDescriptor {
        index,
        description: format.name,
        fourcc: format.fourcc,
        bits_per_pixel: format.bits_per_pixel,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Any,
    None,
    Interlaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    Smpte170m,
}

/// Negotiated capture format as reported by get/try/set-format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pub field: Field,
    pub colorspace: Colorspace,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

impl PixFormat {
    /// Fails with `InvalidArgument` when the line or image size overflows.
    pub fn new(width: u32, height: u32, format: &PixelFormat) -> Result<Self> {
        let bytes_per_line = width
            .checked_mul(format.bytes_per_pixel() as u32)
            .ok_or_else(|| {
                DeviceError::invalid_argument(format!("width {} is too large", width))
            })?;
        let size_image = height.checked_mul(bytes_per_line).ok_or_else(|| {
            DeviceError::invalid_argument(format!(
                "{}x{} frame is too large",
                width, height
            ))
        })?;

        Ok(Self {
            width,
            height,
            fourcc: format.fourcc,
            field: Field::Interlaced,
            colorspace: Colorspace::Smpte170m,
            bytes_per_line,
            size_image,
        })
    }
}

/// Format proposed by a client for try/set-format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
}

impl FormatRequest {
    pub const fn new(fourcc: FourCC, width: u32, height: u32) -> Self {
        Self {
            fourcc,
            width,
            height,
        }
    }
}

/// Validate and normalize a proposed format without applying it.
///
/// The width is forced even and the height is kept as proposed.
pub fn negotiate(request: &FormatRequest) -> Result<(&'static PixelFormat, PixFormat)> {
    let format = find(request.fourcc).map_err(|_| {
        DeviceError::invalid_argument(format!("unsupported pixel format {}", request.fourcc))
    })?;

    let width = request.width & !0x01;
    if width == 0 || request.height == 0 {
        return Err(DeviceError::invalid_argument(format!(
            "resolution {}x{} is empty",
            request.width, request.height
        )));
    }

    Ok((format, PixFormat::new(width, request.height, format)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_numeric_form_is_little_endian() {
        let tag = FourCC::RGB32.as_u32();
        assert_eq!(tag & 0xff, u32::from(b'R'));
        assert_eq!(FourCC::from_u32(tag), FourCC::RGB32);
        assert_eq!(FourCC::BGR32.to_string(), "BGR4");
        assert_eq!("YUYV".parse::<FourCC>().unwrap(), FourCC::YUYV);
        assert!("YUV".parse::<FourCC>().is_err());
    }

    #[test]
    fn find_rejects_unsupported_tag() {
        assert_eq!(find(FourCC::BGR32).unwrap().bits_per_pixel, 32);
        assert!(matches!(find(FourCC::YUYV), Err(DeviceError::NotFound(_))));
    }

    #[test]
    fn enumerate_stops_after_last_format() {
        let first = enumerate(0).unwrap();
        assert_eq!(first.fourcc, FourCC::RGB32);
        assert_eq!(first.description, "ARGB8888, 32 bpp");
        assert_eq!(enumerate(1).unwrap().fourcc, FourCC::BGR32);
        assert!(matches!(enumerate(2), Err(DeviceError::NotFound(_))));
    }

    #[test]
    fn channel_order_differs_between_formats() {
        let mut argb = [0u8; 4];
        find(FourCC::RGB32).unwrap().write_pixel(Rgb::BLUE, &mut argb);
        assert_eq!(argb, [0x00, 0x00, 0x00, 0xff]);

        let mut bgra = [0u8; 4];
        find(FourCC::BGR32).unwrap().write_pixel(Rgb::BLUE, &mut bgra);
        assert_eq!(bgra, [0xff, 0x00, 0x00, 0xff]);

        assert_eq!(find(FourCC::BGR32).unwrap().read_pixel(&bgra), Rgb::BLUE);
    }

    #[test]
    fn pix_format_sizes() {
        let fmt = PixFormat::new(800, 480, default_format()).unwrap();
        assert_eq!(fmt.bytes_per_line, 3200);
        assert_eq!(fmt.size_image, 3200 * 480);
        assert_eq!(fmt.field, Field::Interlaced);
        assert_eq!(default_format().frame_size(800, 480), 3200 * 480);
    }

    #[test]
    fn negotiate_forces_even_width() {
        let (_, fmt) = negotiate(&FormatRequest::new(FourCC::BGR32, 641, 481)).unwrap();
        assert_eq!(fmt.width, 640);
        assert_eq!(fmt.height, 481);
        assert_eq!(fmt.bytes_per_line, 640 * 4);

        let err = negotiate(&FormatRequest::new(FourCC::YUYV, 640, 480)).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));

        let err = negotiate(&FormatRequest::new(FourCC::RGB32, 1, 480)).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn negotiate_rejects_overflowing_sizes() {
        let wide = negotiate(&FormatRequest::new(FourCC::RGB32, 0x4000_0000, 2)).unwrap_err();
        assert!(matches!(wide, DeviceError::InvalidArgument(_)));

        let large = negotiate(&FormatRequest::new(FourCC::BGR32, 65536, 65537)).unwrap_err();
        assert!(matches!(large, DeviceError::InvalidArgument(_)));

        // Largest frame whose size still fits
        let (_, fmt) = negotiate(&FormatRequest::new(FourCC::RGB32, 65536, 16383)).unwrap();
        assert_eq!(fmt.bytes_per_line, 65536 * 4);
        assert_eq!(fmt.size_image, 65536 * 4 * 16383);
    }
}
