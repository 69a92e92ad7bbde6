//! Detection overlay.
//!
//! Draws person boxes, per-box confidence labels and the crowd-tier banner
//! onto a canvas, and encodes annotated rasters as JPEG data URLs.

use std::path::Path;
use std::sync::OnceLock;

use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgba, RgbImage, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::classify::{AlertStatus, Classification};
use crate::detect::{BoundingBox, Detection};

pub type Color = Rgba<u8>;

pub const BOX_COLOR: Color = Rgba([0, 255, 0, 255]);
pub const LABEL_TEXT_COLOR: Color = Rgba([0, 0, 0, 255]);
pub const BANNER_BACKGROUND: Color = Rgba([0, 0, 0, 255]);
pub const GREEN: Color = Rgba([0, 255, 0, 255]);
pub const YELLOW: Color = Rgba([255, 255, 0, 255]);
pub const RED: Color = Rgba([255, 0, 0, 255]);
pub const WHITE: Color = Rgba([255, 255, 255, 255]);

/// Default JPEG quality for snapshots (0.7 on a 0-1 scale).
pub const DEFAULT_JPEG_QUALITY: u8 = 70;

const BOX_LINE_WIDTH: u32 = 2;
const BANNER_X: f32 = 20.0;
const BANNER_Y: f32 = 40.0;
const BANNER_PADDING: f32 = 10.0;
/// Width of one glyph relative to font size when no font is loaded.
const FALLBACK_GLYPH_WIDTH: f32 = 0.6;

/// DejaVu Sans, shipped so labels render without a configured font.
static BUNDLED_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

/// 2D drawing surface with canvas-style text placement (y is the baseline).
pub trait OverlayCanvas: Send {
    fn size(&self) -> (u32, u32);

    /// Resize and clear.
    fn resize(&mut self, width: u32, height: u32);

    fn clear(&mut self);

    fn stroke_rect(&mut self, rect: BoundingBox, color: Color, line_width: u32);

    fn fill_rect(&mut self, rect: BoundingBox, color: Color);

    fn fill_text(&mut self, text: &str, x: f32, y: f32, font_px: f32, color: Color);

    fn measure_text(&self, text: &str, font_px: f32) -> f32;
}

/// `OverlayCanvas` over an RGBA raster.
///
/// Text uses the bundled DejaVu Sans unless another font is set. A canvas
/// without any font estimates text extents and skips glyphs.
pub struct RasterCanvas {
    image: RgbaImage,
    font: Option<FontArc>,
}

impl RasterCanvas {
    /// Transparent canvas.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            font: bundled_font(),
        }
    }

    /// Opaque canvas holding a copy of `frame`.
    pub fn from_frame(frame: &RgbImage) -> Self {
        Self {
            image: DynamicImage::ImageRgb8(frame.clone()).to_rgba8(),
            font: bundled_font(),
        }
    }

    /// Replace the label font; `None` keeps the current one.
    pub fn with_font(mut self, font: Option<FontArc>) -> Self {
        if font.is_some() {
            self.font = font;
        }
        self
    }

    pub fn without_font(mut self) -> Self {
        self.font = None;
        self
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    pub fn to_jpeg_data_url(&self, quality: u8) -> Result<String> {
        encode_jpeg_data_url(&self.image, quality)
    }

    fn to_rect(&self, rect: BoundingBox) -> Option<Rect> {
        let (w, h) = self.image.dimensions();
        if w == 0 || h == 0 {
            return None;
        }
        let x1 = rect.x.round().max(0.0);
        let y1 = rect.y.round().max(0.0);
        let x2 = (rect.x + rect.width).round().min(w as f32);
        let y2 = (rect.y + rect.height).round().min(h as f32);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }
        Some(Rect::at(x1 as i32, y1 as i32).of_size((x2 - x1) as u32, (y2 - y1) as u32))
    }
}

impl OverlayCanvas for RasterCanvas {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.image = RgbaImage::new(width, height);
    }

    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }

    fn stroke_rect(&mut self, rect: BoundingBox, color: Color, line_width: u32) {
        for inset in 0..line_width.max(1) {
            let i = inset as f32;
            let inner = BoundingBox {
                x: rect.x + i,
                y: rect.y + i,
                width: rect.width - 2.0 * i,
                height: rect.height - 2.0 * i,
            };
            if let Some(r) = self.to_rect(inner) {
                draw_hollow_rect_mut(&mut self.image, r, color);
            }
        }
    }

    fn fill_rect(&mut self, rect: BoundingBox, color: Color) {
        if let Some(r) = self.to_rect(rect) {
            draw_filled_rect_mut(&mut self.image, r, color);
        }
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, font_px: f32, color: Color) {
        let Some(font) = self.font.as_ref() else {
            return;
        };
        let scale = PxScale::from(font_px);
        let ascent = font.as_scaled(scale).ascent();
        draw_text_mut(
            &mut self.image,
            color,
            x.round() as i32,
            (y - ascent).round() as i32,
            scale,
            font,
            text,
        );
    }

    fn measure_text(&self, text: &str, font_px: f32) -> f32 {
        match self.font.as_ref() {
            Some(font) => text_size(PxScale::from(font_px), font, text).0 as f32,
            None => text.chars().count() as f32 * font_px * FALLBACK_GLYPH_WIDTH,
        }
    }
}

/// The bundled label font, parsed once.
pub fn bundled_font() -> Option<FontArc> {
    static FONT: OnceLock<Option<FontArc>> = OnceLock::new();
    FONT.get_or_init(|| match FontArc::try_from_slice(BUNDLED_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            log::warn!("bundled label font is unusable, labels will be blank: {}", e);
            None
        }
    })
    .clone()
}

/// Load a TrueType/OpenType font for label rendering.
pub fn load_font<P: AsRef<Path>>(path: P) -> Result<FontArc> {
    let path = path.as_ref();
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
    FontArc::try_from_vec(bytes).map_err(|e| anyhow!("invalid font {}: {}", path.display(), e))
}

/// Encode a raster as `data:image/jpeg;base64,...`. Alpha is dropped.
pub fn encode_jpeg_data_url(image: &RgbaImage, quality: u8) -> Result<String> {
    let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100))
        .encode_image(&rgb)
        .context("failed to encode JPEG snapshot")?;
    Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(&bytes)))
}

pub fn label_for(detection: &Detection) -> String {
    format!("Person {}%", (detection.score * 100.0).round() as i64)
}

/// Banner text color. A frame with nobody in it gets the white fallback.
pub fn banner_color(count: usize, status: AlertStatus) -> Color {
    if count == 0 {
        return WHITE;
    }
    match status {
        AlertStatus::Green => GREEN,
        AlertStatus::Yellow => YELLOW,
        AlertStatus::Red => RED,
    }
}

/// Draws detections and the tier banner.
#[derive(Clone, Debug)]
pub struct OverlayRenderer {
    pub box_color: Color,
    pub line_width: u32,
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self {
            box_color: BOX_COLOR,
            line_width: BOX_LINE_WIDTH,
        }
    }
}

impl OverlayRenderer {
    /// Render onto `canvas`; boxes are given in a `frame_size` raster and
    /// scaled to the canvas size.
    pub fn render(
        &self,
        canvas: &mut dyn OverlayCanvas,
        detections: &[Detection],
        classification: &Classification,
        frame_size: (u32, u32),
    ) {
        let (cw, ch) = canvas.size();
        let (fw, fh) = frame_size;
        if cw == 0 || ch == 0 || fw == 0 || fh == 0 {
            return;
        }
        let sx = cw as f32 / fw as f32;
        let sy = ch as f32 / fh as f32;

        let label_px = (cw as f32 * 0.02).max(12.0);
        for detection in detections {
            let bbox = detection.bbox.scaled(sx, sy);
            canvas.stroke_rect(bbox, self.box_color, self.line_width);

            let label = label_for(detection);
            let text_w = canvas.measure_text(&label, label_px);
            let background = BoundingBox {
                x: bbox.x,
                y: bbox.y - label_px - 4.0,
                width: text_w + 8.0,
                height: label_px + 4.0,
            };
            canvas.fill_rect(background, self.box_color);
            canvas.fill_text(&label, bbox.x + 4.0, bbox.y - 4.0, label_px, LABEL_TEXT_COLOR);
        }

        self.render_banner(canvas, detections.len(), classification);
    }

    fn render_banner(
        &self,
        canvas: &mut dyn OverlayCanvas,
        count: usize,
        classification: &Classification,
    ) {
        let (cw, _) = canvas.size();
        let font_px = (cw as f32 * 0.025).max(16.0);
        let text_w = canvas.measure_text(&classification.label, font_px);
        let background = BoundingBox {
            x: BANNER_X - BANNER_PADDING / 2.0,
            y: BANNER_Y - font_px - BANNER_PADDING / 2.0,
            width: text_w + BANNER_PADDING,
            height: font_px + BANNER_PADDING,
        };
        canvas.fill_rect(background, BANNER_BACKGROUND);
        canvas.fill_text(
            &classification.label,
            BANNER_X,
            BANNER_Y,
            font_px,
            banner_color(count, classification.status),
        );
    }
}
