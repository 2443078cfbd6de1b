use anyhow::{anyhow, Result};
use image::{imageops, imageops::FilterType, Rgba, RgbaImage};

use super::source::ViewBounds;

pub const MIN_SURFACE_WIDTH: u32 = 1280;
pub const MIN_SURFACE_HEIGHT: u32 = 720;

const MAX_EVEN: u32 = u32::MAX - 1;

/// Surface size for a measured view: floored at the minimum and rounded up
/// to even dimensions, which 4:2:0 video codecs require.
pub fn surface_dimensions(bounds: ViewBounds, min_width: u32, min_height: u32) -> (u32, u32) {
    let measure = |value: f64, floor: u32| -> u32 {
        let measured = if value.is_finite() && value > 0.0 {
            value.ceil().min(MAX_EVEN as f64) as u32
        } else {
            0
        };
        let size = measured.max(floor).clamp(2, MAX_EVEN);
        size + (size % 2)
    };
    (measure(bounds.width, min_width), measure(bounds.height, min_height))
}

pub fn parse_hex_color(value: &str) -> Result<Rgba<u8>> {
    let hex = value.trim().trim_start_matches('#');
    let channel = |range: std::ops::Range<usize>| {
        hex.get(range)
            .and_then(|digits| u8::from_str_radix(digits, 16).ok())
            .ok_or_else(|| anyhow!("invalid colour '{value}'"))
    };
    match hex.len() {
        6 => Ok(Rgba([channel(0..2)?, channel(2..4)?, channel(4..6)?, 255])),
        8 => Ok(Rgba([channel(0..2)?, channel(2..4)?, channel(4..6)?, channel(6..8)?])),
        _ => Err(anyhow!("invalid colour '{value}'")),
    }
}

/// Fixed-size destination bitmap feeding the encoder.
///
/// Sized once when capture starts; frames of another size are stretched to fit.
#[derive(Debug, Clone)]
pub struct CaptureSurface {
    image: RgbaImage,
    background: Rgba<u8>,
    frames_drawn: u64,
}

impl CaptureSurface {
    pub fn new(width: u32, height: u32, background: Rgba<u8>) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, background),
            background,
            frames_drawn: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = self.background;
        }
    }

    pub fn draw(&mut self, frame: &RgbaImage) {
        self.clear();
        if frame.dimensions() == self.image.dimensions() {
            imageops::overlay(&mut self.image, frame, 0, 0);
        } else {
            let scaled = imageops::resize(frame, self.width(), self.height(), FilterType::Triangle);
            imageops::overlay(&mut self.image, &scaled, 0, 0);
        }
        self.frames_drawn += 1;
    }

    pub fn snapshot(&self) -> RgbaImage {
        self.image.clone()
    }
}
