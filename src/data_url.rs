// src/data_url.rs
use std::{fmt, io::Cursor, sync::LazyLock};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{DynamicImage, ImageFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static CAPTURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^data:(image/(?:jpeg|png|webp));base64,(.*)$").expect("valid capture pattern")
});

/// Formats the camera is allowed to hand to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageMime {
    #[default]
    Jpeg,
    Png,
    Webp,
}

impl ImageMime {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageMime::Jpeg => "image/jpeg",
            ImageMime::Png => "image/png",
            ImageMime::Webp => "image/webp",
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            ImageMime::Jpeg => ImageFormat::Jpeg,
            ImageMime::Png => ImageFormat::Png,
            ImageMime::Webp => ImageFormat::WebP,
        }
    }
}

/// `data:<mime>;base64,<payload>` with the payload kept encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    mime: String,
    payload: String,
}

impl DataUrl {
    pub fn new(mime: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            payload: payload.into(),
        }
    }

    /// Validates a frame coming off the camera. Anything but a base64
    /// JPEG/PNG/WEBP data URL is a `Format` error.
    pub fn parse_capture(url: &str) -> Result<Self> {
        let caps = CAPTURE_PATTERN.captures(url).ok_or(Error::Format)?;
        Ok(Self::new(&caps[1], &caps[2]))
    }

    pub fn from_bytes(mime: ImageMime, bytes: &[u8]) -> Self {
        Self::new(mime.as_str(), BASE64.encode(bytes))
    }

    /// Encodes an image with the given format.
    pub fn encode_image(image: &DynamicImage, mime: ImageMime) -> Result<Self> {
        let mut buf = Cursor::new(Vec::new());
        // The JPEG encoder rejects alpha, WEBP wants 8-bit channels.
        let image = match mime {
            ImageMime::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
            ImageMime::Png | ImageMime::Webp => DynamicImage::ImageRgba8(image.to_rgba8()),
        };
        image
            .write_to(&mut buf, mime.image_format())
            .map_err(|e| Error::Device(format!("Failed to encode frame: {}", e)))?;
        Ok(Self::from_bytes(mime, &buf.into_inner()))
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn decode(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.payload)
    }

    pub fn to_image(&self) -> anyhow::Result<DynamicImage> {
        let bytes = self.decode()?;
        Ok(image::load_from_memory(&bytes)?)
    }
}

impl fmt::Display for DataUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data:{};base64,{}", self.mime, self.payload)
    }
}
