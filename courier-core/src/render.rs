//! Pairing-code rendering
//!
//! Turns a raw pairing code into a QR PNG, base64-encoded for storage in
//! `pairing_code_image` and for the HTTP `qrCode` data URL.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use thiserror::Error;

/// Minimum edge length of the rendered PNG, in pixels.
pub const QR_SIZE: u32 = 256;

pub const DATA_URL_PREFIX: &str = "data:image/png;base64,";

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("QR encoding failed: {0}")]
    Encode(#[from] qrcode::types::QrError),

    #[error("PNG encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

pub trait CodeRenderer: Send + Sync {
    /// Render `code` and return the image as base64 (no data-URL prefix).
    fn render(&self, code: &str) -> Result<String, RenderError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QrPngRenderer;

impl CodeRenderer for QrPngRenderer {
    fn render(&self, code: &str) -> Result<String, RenderError> {
        let qr = QrCode::new(code.as_bytes())?;
        let img = qr
            .render::<Luma<u8>>()
            .min_dimensions(QR_SIZE, QR_SIZE)
            .build();

        let mut png = Vec::new();
        DynamicImage::ImageLuma8(img).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        Ok(STANDARD.encode(png))
    }
}

/// `data:image/png;base64,...` form of a stored image. Already-prefixed input
/// is returned unchanged.
pub fn to_data_url(image_b64: &str) -> String {
    if image_b64.starts_with(DATA_URL_PREFIX) {
        image_b64.to_string()
    } else {
        format!("{}{}", DATA_URL_PREFIX, image_b64)
    }
}

/// Bare base64 payload of a stored image or data URL.
pub fn strip_data_url(image: &str) -> &str {
    image.strip_prefix(DATA_URL_PREFIX).unwrap_or(image)
}
