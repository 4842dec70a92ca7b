//! Integrity and analysis helpers
//!
//! This module provides functionality for:
//! 1. Content hashing of downloaded payloads and files on disk
//! 2. Reading format, dimensions and color mode from image headers without a full decode
//! 3. Deriving stable, filesystem-safe names for classes and saved files

use std::fs;
use std::io;
use std::path::Path;

use image::{ColorType, GenericImageView, ImageFormat};
use tracing::debug;
use url::Url;

/// Longest stem kept when original filenames are preserved
const MAX_STEM_LEN: usize = 100;

/// Name used when a class or filename sanitizes down to nothing
const UNNAMED: &str = "Unnamed";

/// What the header (or decoder) says about an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub mode: String,
}

impl ImageInfo {
    fn new(format: &str, width: u32, height: u32, mode: &str) -> Self {
        Self {
            format: format.to_string(),
            width,
            height,
            mode: mode.to_string(),
        }
    }
}

/// Hex md5 of a byte slice
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Hex md5 of the file at `path`
pub fn hash_file(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(content_hash(&bytes))
}

/// Inspects the image, preferring the header and falling back to a full decode,
/// then to the URL extension with unknown dimensions.
pub fn analyze_image(bytes: &[u8], url: &str) -> ImageInfo {
    if let Some(info) = sniff_header(bytes) {
        return info;
    }

    match decode_info(bytes) {
        Some(info) => info,
        None => {
            debug!("Could not inspect image from {}, using URL extension", url);
            let format = extension_from_url(url)
                .map(|ext| normalize_format(&ext))
                .unwrap_or_else(|| "unknown".to_string());
            ImageInfo {
                format,
                width: 0,
                height: 0,
                mode: "unknown".to_string(),
            }
        }
    }
}

/// Reads format, size and color mode from the first bytes of the payload
pub fn sniff_header(bytes: &[u8]) -> Option<ImageInfo> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return sniff_png(bytes);
    }
    if bytes.starts_with(&[0xFF, 0xD8]) {
        return sniff_jpeg(bytes);
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        let width = read_u16_le(bytes, 6)?;
        let height = read_u16_le(bytes, 8)?;
        return Some(ImageInfo::new("gif", width as u32, height as u32, "P"));
    }
    if bytes.len() >= 16 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return sniff_webp(bytes);
    }
    if bytes.starts_with(b"BM") {
        return sniff_bmp(bytes);
    }
    None
}

fn sniff_png(bytes: &[u8]) -> Option<ImageInfo> {
    if bytes.get(12..16)? != b"IHDR" {
        return None;
    }
    let width = read_u32_be(bytes, 16)?;
    let height = read_u32_be(bytes, 20)?;
    let mode = match bytes.get(25)? {
        0 => "L",
        2 => "RGB",
        3 => "P",
        4 => "LA",
        6 => "RGBA",
        _ => "RGB",
    };
    Some(ImageInfo::new("png", width, height, mode))
}

fn sniff_jpeg(bytes: &[u8]) -> Option<ImageInfo> {
    let mut i = 2;
    while i + 3 < bytes.len() {
        if bytes[i] != 0xFF {
            return None;
        }
        let marker = bytes[i + 1];
        match marker {
            // padding
            0xFF => {
                i += 1;
                continue;
            }
            // standalone markers carry no length
            0x01 | 0xD0..=0xD7 => {
                i += 2;
                continue;
            }
            0xD9 | 0xDA => return None,
            0xC0..=0xCF if marker != 0xC4 && marker != 0xC8 && marker != 0xCC => {
                let height = read_u16_be(bytes, i + 5)?;
                let width = read_u16_be(bytes, i + 7)?;
                let mode = match bytes.get(i + 9)? {
                    1 => "L",
                    4 => "CMYK",
                    _ => "RGB",
                };
                return Some(ImageInfo::new("jpeg", width as u32, height as u32, mode));
            }
            _ => {
                let segment_len = read_u16_be(bytes, i + 2)? as usize;
                i += 2 + segment_len;
            }
        }
    }
    None
}

fn sniff_webp(bytes: &[u8]) -> Option<ImageInfo> {
    match bytes.get(12..16)? {
        b"VP8 " => {
            let width = read_u16_le(bytes, 26)? & 0x3FFF;
            let height = read_u16_le(bytes, 28)? & 0x3FFF;
            Some(ImageInfo::new("webp", width as u32, height as u32, "RGB"))
        }
        b"VP8L" => {
            let b = bytes.get(21..25)?;
            let width = 1 + (((b[1] as u32 & 0x3F) << 8) | b[0] as u32);
            let height =
                1 + (((b[3] as u32 & 0x0F) << 10) | ((b[2] as u32) << 2) | ((b[1] as u32 & 0xC0) >> 6));
            Some(ImageInfo::new("webp", width, height, "RGBA"))
        }
        b"VP8X" => {
            let flags = *bytes.get(20)?;
            let width = 1 + read_u24_le(bytes, 24)?;
            let height = 1 + read_u24_le(bytes, 27)?;
            let mode = if flags & 0x10 != 0 { "RGBA" } else { "RGB" };
            Some(ImageInfo::new("webp", width, height, mode))
        }
        _ => None,
    }
}

fn sniff_bmp(bytes: &[u8]) -> Option<ImageInfo> {
    let width = i32::from_le_bytes(bytes.get(18..22)?.try_into().ok()?);
    let height = i32::from_le_bytes(bytes.get(22..26)?.try_into().ok()?);
    let mode = match read_u16_le(bytes, 28)? {
        32 => "RGBA",
        8 | 4 | 1 => "P",
        _ => "RGB",
    };
    Some(ImageInfo::new("bmp", width.unsigned_abs(), height.unsigned_abs(), mode))
}

fn decode_info(bytes: &[u8]) -> Option<ImageInfo> {
    let format = image::guess_format(bytes).ok();
    let decoded = image::load_from_memory(bytes).ok()?;
    let (width, height) = decoded.dimensions();
    let mode = match decoded.color() {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "RGB",
    };
    let format = format.map(format_name).unwrap_or_else(|| "unknown".to_string());
    Some(ImageInfo::new(&format, width, height, mode))
}

fn format_name(format: ImageFormat) -> String {
    normalize_format(&format!("{:?}", format))
}

/// Lower-cased format name with the common aliases folded together
pub fn normalize_format(format: &str) -> String {
    match format.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" | "jpe" | "jfif" => "jpeg".to_string(),
        "tif" | "tiff" => "tiff".to_string(),
        other => other.to_string(),
    }
}

/// File extension to write for a decoded format name
pub fn extension_for(format: &str) -> String {
    match normalize_format(format).as_str() {
        "jpeg" | "unknown" | "" => "jpg".to_string(),
        other => other.to_string(),
    }
}

fn extension_from_url(url: &str) -> Option<String> {
    let name = original_filename_hint(url);
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())).then_some(ext)
}

/// Last path segment of the URL, or `unknown` if there is none
pub fn original_filename_hint(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Host part of the URL, empty when it has none
pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Directory and file base name for a class
pub fn class_slug(class_name: &str) -> String {
    let slug: String = class_name
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    if slug.is_empty() || slug.chars().all(|c| c == '.') {
        UNNAMED.to_string()
    } else {
        slug
    }
}

/// Keeps alphanumerics, space, `-` and `_`, trims, and caps the length
pub fn sanitize_stem(name: &str) -> String {
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    let cleaned: String = stem
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    cleaned.trim().chars().take(MAX_STEM_LEN).collect::<String>().trim().to_string()
}

/// Deterministic `{class}_{key}.{ext}` name
pub fn sequence_filename(class_name: &str, key: &str, format: &str) -> String {
    format!("{}_{}.{}", class_slug(class_name), key, extension_for(format))
}

fn read_u16_be(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn read_u16_le(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32_be(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn read_u24_le(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 3)?;
    Some(b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16)
}

#[cfg(test)]
pub(crate) fn png_header(width: u32, height: u32, color_type: u8) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.push(8);
    bytes.push(color_type);
    bytes.extend_from_slice(&[0, 0, 0]);
    bytes
}
