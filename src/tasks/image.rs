//! Image header parsing and pixel sampling.
//!
//! Headers of PNG, JPEG, GIF, BMP and binary PPM are read by hand for the
//! metadata report. Pixels are decoded with the `image` crate.

use std::collections::BTreeMap;

use ::image::RgbImage;

use crate::domain::Rgb;

/// Recognized container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Ppm,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "PNG",
            Self::Jpeg => "JPEG",
            Self::Gif => "GIF",
            Self::Bmp => "BMP",
            Self::Ppm => "PPM",
        }
    }
}

/// Header facts about an image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Color mode in the usual short notation (RGB, RGBA, L, P, CMYK...)
    pub mode: String,
    /// ASCII EXIF tags found in IFD0 (JPEG only)
    pub exif: BTreeMap<String, String>,
}

/// Why an image could not be read
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("unrecognized image format")]
    UnknownFormat,

    #[error("truncated {0} header")]
    Truncated(&'static str),

    #[error("image of {width}x{height} pixels is too large to decode")]
    TooLarge { width: u32, height: u32 },

    #[error("cannot decode pixels: {0}")]
    Decode(String),
}

/// Identify an image and read its header
pub fn inspect(bytes: &[u8]) -> Result<ImageInfo, ImageError> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        inspect_png(bytes)
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        inspect_jpeg(bytes)
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        inspect_gif(bytes)
    } else if bytes.starts_with(b"BM") {
        BmpHeader::parse(bytes).map(|h| h.info())
    } else if bytes.starts_with(b"P6") {
        PpmHeader::parse(bytes).map(|h| h.info())
    } else {
        Err(ImageError::UnknownFormat)
    }
}

fn be_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn inspect_png(bytes: &[u8]) -> Result<ImageInfo, ImageError> {
    // IHDR is always the first chunk: width, height, bit depth, color type
    let width = be_u32(bytes, 16).ok_or(ImageError::Truncated("PNG"))?;
    let height = be_u32(bytes, 20).ok_or(ImageError::Truncated("PNG"))?;
    let color_type = *bytes.get(25).ok_or(ImageError::Truncated("PNG"))?;

    let mode = match color_type {
        0 => "L",
        2 => "RGB",
        3 => "P",
        4 => "LA",
        6 => "RGBA",
        _ => "unknown",
    };

    Ok(ImageInfo {
        format: ImageFormat::Png,
        width,
        height,
        mode: mode.to_string(),
        exif: BTreeMap::new(),
    })
}

fn inspect_gif(bytes: &[u8]) -> Result<ImageInfo, ImageError> {
    let width = le_u16(bytes, 6).ok_or(ImageError::Truncated("GIF"))?;
    let height = le_u16(bytes, 8).ok_or(ImageError::Truncated("GIF"))?;

    Ok(ImageInfo {
        format: ImageFormat::Gif,
        width: width as u32,
        height: height as u32,
        mode: "P".to_string(),
        exif: BTreeMap::new(),
    })
}

fn inspect_jpeg(bytes: &[u8]) -> Result<ImageInfo, ImageError> {
    let mut exif = BTreeMap::new();
    let mut pos = 2;

    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            pos += 1;
            continue;
        }

        let marker = bytes[pos + 1];
        match marker {
            // Fill bytes and standalone markers carry no length
            0xFF => {
                pos += 1;
                continue;
            }
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            _ => {}
        }

        let length = be_u16(bytes, pos + 2).ok_or(ImageError::Truncated("JPEG"))? as usize;
        let segment = bytes
            .get(pos + 4..pos + 2 + length)
            .ok_or(ImageError::Truncated("JPEG"))?;

        match marker {
            0xE1 if segment.starts_with(b"Exif\0\0") => {
                exif = read_exif_ascii_tags(&segment[6..]);
            }
            // SOF0..SOF15, excluding DHT, JPG and DAC
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                let height = be_u16(segment, 1).ok_or(ImageError::Truncated("JPEG"))?;
                let width = be_u16(segment, 3).ok_or(ImageError::Truncated("JPEG"))?;
                let components = *segment.get(5).ok_or(ImageError::Truncated("JPEG"))?;

                let mode = match components {
                    1 => "L",
                    3 => "RGB",
                    4 => "CMYK",
                    _ => "unknown",
                };

                return Ok(ImageInfo {
                    format: ImageFormat::Jpeg,
                    width: width as u32,
                    height: height as u32,
                    mode: mode.to_string(),
                    exif,
                });
            }
            // Start of scan without a frame header
            0xDA => break,
            _ => {}
        }

        pos += 2 + length;
    }

    Err(ImageError::Truncated("JPEG"))
}

/// Read ASCII-typed entries of the first IFD of a TIFF structure
fn read_exif_ascii_tags(tiff: &[u8]) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();

    let big_endian = match tiff.get(0..2) {
        Some(b"MM") => true,
        Some(b"II") => false,
        _ => return tags,
    };
    let u16_at = |at: usize| {
        if big_endian {
            be_u16(tiff, at)
        } else {
            le_u16(tiff, at)
        }
    };
    let u32_at = |at: usize| {
        if big_endian {
            be_u32(tiff, at)
        } else {
            le_u32(tiff, at)
        }
    };

    let Some(ifd) = u32_at(4).map(|o| o as usize) else {
        return tags;
    };
    let Some(count) = u16_at(ifd) else {
        return tags;
    };

    for i in 0..count as usize {
        let entry = ifd + 2 + i * 12;
        let (Some(tag), Some(kind), Some(len)) = (u16_at(entry), u16_at(entry + 2), u32_at(entry + 4))
        else {
            break;
        };

        // Type 2 is ASCII
        if kind != 2 {
            continue;
        }
        let Some(name) = exif_tag_name(tag) else {
            continue;
        };

        let len = len as usize;
        let data = if len <= 4 {
            tiff.get(entry + 8..entry + 8 + len)
        } else {
            u32_at(entry + 8).and_then(|off| tiff.get(off as usize..off as usize + len))
        };

        if let Some(data) = data {
            let value = String::from_utf8_lossy(data)
                .trim_end_matches('\0')
                .trim()
                .to_string();
            if !value.is_empty() {
                tags.insert(name.to_string(), value);
            }
        }
    }

    tags
}

fn exif_tag_name(tag: u16) -> Option<&'static str> {
    match tag {
        0x010E => Some("ImageDescription"),
        0x010F => Some("Make"),
        0x0110 => Some("Model"),
        0x0131 => Some("Software"),
        0x0132 => Some("DateTime"),
        0x013B => Some("Artist"),
        0x8298 => Some("Copyright"),
        _ => None,
    }
}

/// Parsed binary PPM ("P6") header
#[derive(Debug, Clone, Copy)]
struct PpmHeader {
    width: u32,
    height: u32,
}

impl PpmHeader {
    fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let mut fields = [0u32; 3];
        let mut pos = 2;

        for field in fields.iter_mut() {
            // Skip whitespace and comments
            loop {
                match bytes.get(pos) {
                    Some(b'#') => {
                        while !matches!(bytes.get(pos), Some(b'\n') | None) {
                            pos += 1;
                        }
                    }
                    Some(c) if c.is_ascii_whitespace() => pos += 1,
                    Some(_) => break,
                    None => return Err(ImageError::Truncated("PPM")),
                }
            }

            let start = pos;
            while bytes.get(pos).is_some_and(|c| c.is_ascii_digit()) {
                pos += 1;
            }
            *field = std::str::from_utf8(&bytes[start..pos])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(ImageError::Truncated("PPM"))?;
        }

        // fields[2] is the max sample value; decoding handles it
        Ok(Self {
            width: fields[0],
            height: fields[1],
        })
    }

    fn info(&self) -> ImageInfo {
        ImageInfo {
            format: ImageFormat::Ppm,
            width: self.width,
            height: self.height,
            mode: "RGB".to_string(),
            exif: BTreeMap::new(),
        }
    }
}

/// Parsed BMP headers
#[derive(Debug, Clone, Copy)]
struct BmpHeader {
    width: u32,
    height: u32,
    bits_per_pixel: u16,
}

impl BmpHeader {
    fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let truncated = ImageError::Truncated("BMP");
        let width = le_u32(bytes, 18).ok_or(truncated.clone())? as i32;
        // Negative height marks top-down row order
        let height = le_u32(bytes, 22).ok_or(truncated.clone())? as i32;
        let bits_per_pixel = le_u16(bytes, 28).ok_or(truncated)?;

        Ok(Self {
            width: width.unsigned_abs(),
            height: height.unsigned_abs(),
            bits_per_pixel,
        })
    }

    fn info(&self) -> ImageInfo {
        let mode = match self.bits_per_pixel {
            32 => "RGBA",
            24 => "RGB",
            1 => "1",
            _ => "P",
        };
        ImageInfo {
            format: ImageFormat::Bmp,
            width: self.width,
            height: self.height,
            mode: mode.to_string(),
            exif: BTreeMap::new(),
        }
    }
}

/// Largest image, in pixels, that will be decoded for sampling
pub const MAX_DECODE_PIXELS: u64 = 178_956_970;

/// Decode an image and take a nearest-neighbour sample of at most
/// `side` x `side` pixels.
///
/// Header dimensions are checked against [`MAX_DECODE_PIXELS`] before any
/// pixel buffer is allocated.
pub fn sample_pixels(bytes: &[u8], side: u32) -> Result<Vec<Rgb>, ImageError> {
    let info = inspect(bytes)?;
    let total = u64::from(info.width) * u64::from(info.height);
    if total > MAX_DECODE_PIXELS {
        return Err(ImageError::TooLarge {
            width: info.width,
            height: info.height,
        });
    }

    let decoded = ::image::load_from_memory(bytes)
        .map_err(|e| ImageError::Decode(e.to_string()))?
        .to_rgb8();
    Ok(sample_grid(&decoded, side))
}

fn sample_grid(image: &RgbImage, side: u32) -> Vec<Rgb> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || side == 0 {
        return Vec::new();
    }

    let cols = width.min(side);
    let rows = height.min(side);
    let mut pixels = Vec::with_capacity(cols as usize * rows as usize);

    for row in 0..rows {
        let y = (u64::from(row) * u64::from(height) / u64::from(rows)) as u32;
        for col in 0..cols {
            let x = (u64::from(col) * u64::from(width) / u64::from(cols)) as u32;
            let [r, g, b] = image.get_pixel(x, y).0;
            pixels.push(Rgb { r, g, b });
        }
    }

    pixels
}

/// Build a binary PPM; used to fabricate test images
pub fn encode_ppm(width: u32, height: u32, pixels: &[Rgb]) -> Vec<u8> {
    let mut bytes = format!("P6\n{} {}\n255\n", width, height).into_bytes();
    for p in pixels {
        bytes.extend_from_slice(&[p.r, p.g, p.b]);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgb = Rgb { r: 255, g: 0, b: 0 };
    const BLUE: Rgb = Rgb { r: 0, g: 0, b: 255 };

    fn png_header(width: u32, height: u32, color_type: u8) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, color_type, 0, 0, 0]);
        bytes
    }

    fn png(rows: &[Vec<Rgb>]) -> Vec<u8> {
        let image = RgbImage::from_fn(rows[0].len() as u32, rows.len() as u32, |x, y| {
            let p = rows[y as usize][x as usize];
            ::image::Rgb([p.r, p.g, p.b])
        });
        let mut bytes = Vec::new();
        ::image::DynamicImage::ImageRgb8(image)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                ::image::ImageOutputFormat::Png,
            )
            .unwrap();
        bytes
    }

    fn bmp_24(width: u32, height: i32, rows_bottom_up: &[Vec<Rgb>]) -> Vec<u8> {
        let stride = (width as usize * 3 + 3) & !3;
        let mut bytes = vec![0u8; 54];
        bytes[0..2].copy_from_slice(b"BM");
        bytes[10..14].copy_from_slice(&54u32.to_le_bytes());
        bytes[14..18].copy_from_slice(&40u32.to_le_bytes());
        bytes[18..22].copy_from_slice(&(width as i32).to_le_bytes());
        bytes[22..26].copy_from_slice(&height.to_le_bytes());
        bytes[26..28].copy_from_slice(&1u16.to_le_bytes());
        bytes[28..30].copy_from_slice(&24u16.to_le_bytes());
        for row in rows_bottom_up {
            let mut line = Vec::with_capacity(stride);
            for p in row {
                line.extend_from_slice(&[p.b, p.g, p.r]);
            }
            line.resize(stride, 0);
            bytes.extend_from_slice(&line);
        }
        let size = bytes.len() as u32;
        bytes[2..6].copy_from_slice(&size.to_le_bytes());
        bytes
    }

    #[test]
    fn test_inspect_png() {
        let info = inspect(&png_header(640, 480, 6)).unwrap();
        assert_eq!(info.format, ImageFormat::Png);
        assert_eq!((info.width, info.height), (640, 480));
        assert_eq!(info.mode, "RGBA");
    }

    #[test]
    fn test_inspect_gif() {
        let mut bytes = b"GIF89a".to_vec();
        bytes.extend_from_slice(&300u16.to_le_bytes());
        bytes.extend_from_slice(&200u16.to_le_bytes());
        let info = inspect(&bytes).unwrap();
        assert_eq!(info.format, ImageFormat::Gif);
        assert_eq!((info.width, info.height), (300, 200));
    }

    #[test]
    fn test_inspect_jpeg_with_exif() {
        // TIFF block: little endian, IFD0 at 8 with one Make entry
        let mut tiff = b"II".to_vec();
        tiff.extend_from_slice(&42u16.to_le_bytes());
        tiff.extend_from_slice(&8u32.to_le_bytes());
        tiff.extend_from_slice(&1u16.to_le_bytes());
        tiff.extend_from_slice(&0x010Fu16.to_le_bytes());
        tiff.extend_from_slice(&2u16.to_le_bytes());
        tiff.extend_from_slice(&6u32.to_le_bytes());
        tiff.extend_from_slice(&26u32.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());
        tiff.extend_from_slice(b"Canon\0");

        let mut app1 = b"Exif\0\0".to_vec();
        app1.extend_from_slice(&tiff);

        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE1];
        bytes.extend_from_slice(&((app1.len() + 2) as u16).to_be_bytes());
        bytes.extend_from_slice(&app1);
        // SOF0: length 17, precision 8, 120 rows, 160 cols, 3 components
        bytes.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08, 0x00, 0x78, 0x00, 0xA0, 0x03]);
        bytes.extend_from_slice(&[0u8; 9]);

        let info = inspect(&bytes).unwrap();
        assert_eq!(info.format, ImageFormat::Jpeg);
        assert_eq!((info.width, info.height), (160, 120));
        assert_eq!(info.mode, "RGB");
        assert_eq!(info.exif.get("Make").map(String::as_str), Some("Canon"));
    }

    #[test]
    fn test_unknown_format() {
        assert_eq!(inspect(b"hello world"), Err(ImageError::UnknownFormat));
        assert_eq!(inspect(b""), Err(ImageError::UnknownFormat));
    }

    #[test]
    fn test_truncated_png() {
        assert_eq!(
            inspect(b"\x89PNG\r\n\x1a\n\0\0"),
            Err(ImageError::Truncated("PNG"))
        );
    }

    #[test]
    fn test_ppm_pixels() {
        let bytes = encode_ppm(2, 1, &[RED, BLUE]);
        let info = inspect(&bytes).unwrap();
        assert_eq!((info.width, info.height), (2, 1));
        assert_eq!(sample_pixels(&bytes, 50).unwrap(), vec![RED, BLUE]);
    }

    #[test]
    fn test_ppm_with_comment() {
        let mut bytes = b"P6\n# made by hand\n1 1\n255\n".to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        assert_eq!(
            sample_pixels(&bytes, 50).unwrap(),
            vec![Rgb { r: 1, g: 2, b: 3 }]
        );
    }

    #[test]
    fn test_bmp_bottom_up_rows() {
        // Bottom row blue, top row red; width 1 forces padding
        let bytes = bmp_24(1, 2, &[vec![BLUE], vec![RED]]);
        let info = inspect(&bytes).unwrap();
        assert_eq!(info.format, ImageFormat::Bmp);
        assert_eq!(info.mode, "RGB");
        assert_eq!(sample_pixels(&bytes, 50).unwrap(), vec![RED, BLUE]);
    }

    #[test]
    fn test_png_pixels() {
        let bytes = png(&[vec![RED, RED], vec![BLUE, RED]]);
        let info = inspect(&bytes).unwrap();
        assert_eq!(info.format, ImageFormat::Png);
        assert_eq!((info.width, info.height), (2, 2));
        assert_eq!(sample_pixels(&bytes, 50).unwrap(), vec![RED, RED, BLUE, RED]);
    }

    #[test]
    fn test_header_only_png_fails_to_decode() {
        let err = sample_pixels(&png_header(4, 4, 2), 50).unwrap_err();
        assert!(matches!(err, ImageError::Decode(_)));
    }

    #[test]
    fn test_huge_dimensions_rejected_before_decoding() {
        let ppm = b"P6\n4294967295 4294967295\n255\n\0\0\0";
        assert_eq!(
            sample_pixels(ppm, 50),
            Err(ImageError::TooLarge {
                width: u32::MAX,
                height: u32::MAX
            })
        );

        let mut bmp = bmp_24(1, 1, &[vec![RED]]);
        bmp[18..22].copy_from_slice(&i32::MAX.to_le_bytes());
        bmp[22..26].copy_from_slice(&i32::MIN.to_le_bytes());
        assert!(matches!(
            sample_pixels(&bmp, 50),
            Err(ImageError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_short_pixel_data_is_an_error() {
        let bytes = b"P6\n4 4\n255\n\0\0\0";
        assert!(matches!(sample_pixels(bytes, 50), Err(ImageError::Decode(_))));
    }

    #[test]
    fn test_sample_caps_grid() {
        let pixels = vec![RED; 100 * 80];
        let bytes = encode_ppm(100, 80, &pixels);
        assert_eq!(sample_pixels(&bytes, 50).unwrap().len(), 2500);

        let small = encode_ppm(3, 2, &[RED; 6]);
        assert_eq!(sample_pixels(&small, 50).unwrap().len(), 6);
    }
}
