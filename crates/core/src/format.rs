use std::{fmt, str::FromStr};

/// Four-character code naming a pixel layout or a compressed bitstream.
///
/// # Example
/// ```rust
/// use uvcflow_core::prelude::FourCc;
///
/// let code: FourCc = "MJPG".parse().unwrap();
/// assert_eq!(code, FourCc::MJPG);
/// assert!(code.is_compressed());
/// assert_eq!(FourCc::new(*b"YUYV").to_string(), "YUYV");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    pub const MJPG: FourCc = FourCc(*b"MJPG");
    pub const H264: FourCc = FourCc(*b"H264");
    /// Packed 4:2:2.
    pub const YUYV: FourCc = FourCc(*b"YUYV");
    /// Planar 4:2:0.
    pub const YU12: FourCc = FourCc(*b"YU12");
    pub const RGBP: FourCc = FourCc(*b"RGBP");

    pub const fn new(code: [u8; 4]) -> Self {
        Self(code)
    }

    pub const fn bytes(self) -> [u8; 4] {
        self.0
    }

    /// Whether frames in this format are encoder output rather than raw sensor data.
    pub fn is_compressed(self) -> bool {
        matches!(self, FourCc::MJPG | FourCc::H264)
    }

    fn is_printable(self) -> bool {
        self.0.iter().all(|b| b.is_ascii_graphic() || *b == b' ')
    }
}

impl From<[u8; 4]> for FourCc {
    fn from(code: [u8; 4]) -> Self {
        Self(code)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_printable() {
            self.0.iter().try_for_each(|b| fmt::Write::write_char(f, char::from(*b)))
        } else {
            write!(f, "{:02x}{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2], self.0[3])
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 4]>::try_from(s.as_bytes())
            .map(FourCc)
            .map_err(|_| format!("`{s}` is not a four-byte code"))
    }
}

/// Codec tag stamped on encoded frames.
pub type CodecTag = FourCc;

/// Frame geometry in pixels. Both sides are non-zero.
///
/// # Example
/// ```rust
/// use uvcflow_core::prelude::Resolution;
///
/// let hd = Resolution::new(1280, 720).unwrap();
/// assert_eq!((hd.width(), hd.height()), (1280, 720));
/// assert!(Resolution::new(640, 0).is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "(u32, u32)", into = "(u32, u32)"))]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    pub const HD: Resolution = Resolution {
        width: 1280,
        height: 720,
    };

    pub const fn new(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            None
        } else {
            Some(Self { width, height })
        }
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }
}

impl TryFrom<(u32, u32)> for Resolution {
    type Error = String;

    fn try_from((width, height): (u32, u32)) -> Result<Self, Self::Error> {
        Resolution::new(width, height).ok_or_else(|| format!("{width}x{height} has a zero side"))
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(res: Resolution) -> Self {
        (res.width, res.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What a device streams: a code plus geometry.
///
/// # Example
/// ```rust
/// use uvcflow_core::prelude::{FourCc, Resolution, StreamFormat};
///
/// let fmt = StreamFormat::new(FourCc::MJPG, Resolution::new(1280, 720).unwrap());
/// assert_eq!(fmt, StreamFormat::default());
/// assert_eq!(fmt.to_string(), "MJPG 1280x720");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamFormat {
    pub code: FourCc,
    pub resolution: Resolution,
}

impl StreamFormat {
    pub const fn new(code: FourCc, resolution: Resolution) -> Self {
        Self { code, resolution }
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(FourCc::MJPG, Resolution::HD)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.resolution)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for FourCc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for FourCc {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <String as serde::Deserialize>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requires_four_bytes() {
        assert!("MJPEG".parse::<FourCc>().is_err());
        assert_eq!("H264".parse::<FourCc>().unwrap(), FourCc::H264);
    }

    #[test]
    fn unprintable_code_shows_hex() {
        assert_eq!(FourCc::new([0xff, 0, 1, 2]).to_string(), "ff000102");
    }

    #[test]
    fn raw_formats_are_not_compressed() {
        assert!(!FourCc::YUYV.is_compressed());
        assert!(!FourCc::YU12.is_compressed());
        assert!(FourCc::H264.is_compressed());
    }
}
