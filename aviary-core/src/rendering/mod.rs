//! rendering — draw detection boxes and labels onto a frame
//!
//! For every detection, in input order: a filled label background in the
//! species color, the box outline, then `"{label} - {score:.2}"` in the
//! species font color.  The label's baseline sits 5px right of and 5px above
//! the box's top-left corner.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::Deserialize;
use tracing::debug;

use crate::detection::Detection;
use crate::error::{CurationError, Result};
use crate::species::{parse_hex_color, Species, Style};
use crate::video::RgbFrame;

static FONT_BYTES: &[u8] = include_bytes!("../../fonts/DejaVuSans.ttf");

/// Box coordinates are clamped to ±2^20 px before any integer arithmetic.
const COORD_LIMIT: f32 = 1_048_576.0;
/// Upper bound on the outline thickness actually drawn.
const MAX_THICKNESS: u32 = 256;

/// Drawing parameters.  Defaults reproduce the project's annotation style.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Text scale relative to `glyph_height_px`.
    pub font_scale: f32,
    /// Glyph height in pixels at scale 1.0.
    pub glyph_height_px: f32,
    pub text_thickness: u32,
    pub box_thickness: u32,
    /// Distance of the label baseline from the box's top-left corner.
    pub text_offset: i32,
    pub padding_x: i32,
    pub padding_y: i32,
    /// TrueType/OpenType font to use instead of the embedded DejaVu Sans.
    pub font_path: Option<PathBuf>,
    /// Per-label color overrides as `#rrggbb`.
    pub colors: BTreeMap<String, String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            font_scale: 0.6,
            glyph_height_px: 22.0,
            text_thickness: 1,
            box_thickness: 4,
            text_offset: 5,
            padding_x: 2,
            padding_y: 5,
            font_path: None,
            colors: BTreeMap::new(),
        }
    }
}

/// Pixel geometry of one rendered detection.  Rectangles are inclusive
/// `(left, top, right, bottom)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelLayout {
    pub text: String,
    pub box_rect: (i32, i32, i32, i32),
    pub background: (i32, i32, i32, i32),
    /// Left end of the text baseline.
    pub baseline: (i32, i32),
    pub text_size: (u32, u32),
}

pub struct OverlayRenderer {
    config: RenderConfig,
    font: FontArc,
    styles: HashMap<Species, Style>,
}

impl OverlayRenderer {
    pub fn new(config: RenderConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    CurationError::Config(format!("cannot read font {}: {e}", path.display()))
                })?;
                FontArc::try_from_vec(bytes).map_err(|e| {
                    CurationError::Config(format!("invalid font {}: {e}", path.display()))
                })?
            }
            None => FontArc::try_from_slice(FONT_BYTES)
                .map_err(|e| CurationError::Config(format!("embedded font: {e}")))?,
        };

        let mut styles: HashMap<Species, Style> =
            Species::ALL.into_iter().map(|s| (s, s.style())).collect();
        for (label, hex) in &config.colors {
            let species = Species::from_label(label)?;
            let rgb = parse_hex_color(hex).ok_or_else(|| {
                CurationError::Config(format!("color for {label} is not #rrggbb: {hex:?}"))
            })?;
            if let Some(style) = styles.get_mut(&species) {
                style.color = rgb;
            }
        }

        Ok(Self {
            config,
            font,
            styles,
        })
    }

    /// Style of `species` after configured color overrides.
    pub fn style_of(&self, species: Species) -> Style {
        self.styles
            .get(&species)
            .copied()
            .unwrap_or_else(|| species.style())
    }

    pub fn color_of(&self, species: Species) -> [u8; 3] {
        self.style_of(species).color
    }

    fn scale(&self) -> PxScale {
        PxScale::from(self.config.font_scale * self.config.glyph_height_px)
    }

    pub fn label_text(detection: &Detection) -> String {
        format!("{} - {:.2}", detection.label, detection.score)
    }

    /// Compute where the box, label background and text go.
    pub fn layout(&self, detection: &Detection) -> LabelLayout {
        let b = &detection.bbox;
        let (x1, y1) = (to_px(b.x1), to_px(b.y1));
        let (x2, y2) = (to_px(b.x2), to_px(b.y2));

        let text = Self::label_text(detection);
        let (text_w, text_h) = text_size(self.scale(), &self.font, &text);

        let cfg = &self.config;
        let baseline = (
            x1.saturating_add(cfg.text_offset),
            y1.saturating_sub(cfg.text_offset),
        );
        let background = (
            x1,
            baseline
                .1
                .saturating_sub_unsigned(text_h)
                .saturating_sub(cfg.padding_y),
            baseline
                .0
                .saturating_add_unsigned(text_w)
                .saturating_add(cfg.padding_x),
            y1,
        );

        LabelLayout {
            text,
            box_rect: (x1, y1, x2, y2),
            background,
            baseline,
            text_size: (text_w, text_h),
        }
    }

    /// Return a copy of `frame` with all detections drawn on it.  Every
    /// detection is validated first, so a malformed record leaves nothing
    /// half-drawn.
    pub fn render(&self, frame: &RgbFrame, detections: &[Detection]) -> Result<RgbFrame> {
        let image = self.render_image(&frame.to_image()?, detections)?;
        Ok(RgbFrame::from_image(image, frame.index))
    }

    pub fn render_image(&self, image: &RgbImage, detections: &[Detection]) -> Result<RgbImage> {
        let species: Vec<Species> = detections
            .iter()
            .map(Detection::validate)
            .collect::<Result<_>>()?;

        let mut canvas = image.clone();
        for (detection, species) in detections.iter().zip(species) {
            let layout = self.layout(detection);
            debug!(text = %layout.text, rect = ?layout.box_rect, "drawing detection");
            self.draw(&mut canvas, &layout, species);
        }
        Ok(canvas)
    }

    fn draw(&self, canvas: &mut RgbImage, layout: &LabelLayout, species: Species) {
        let style = self.style_of(species);
        let (color, font_color) = (Rgb(style.color), Rgb(style.font_color));

        let thickness = self.config.box_thickness.clamp(1, MAX_THICKNESS) as i32;
        // Clip to the canvas plus the outline's reach.
        let reach = thickness + 1;
        let (width, height) = canvas.dimensions();
        let clip_x = |x: i32| clip(x, reach, width);
        let clip_y = |y: i32| clip(y, reach, height);

        let (l, t, r, b) = layout.background;
        if let Some(rect) = inclusive_rect(clip_x(l), clip_y(t), clip_x(r), clip_y(b)) {
            draw_filled_rect_mut(canvas, rect, color);
        }

        // Thick outlines grow both inwards and outwards from the box edge.
        let (x1, y1, x2, y2) = layout.box_rect;
        let (x1, y1, x2, y2) = (clip_x(x1), clip_y(y1), clip_x(x2), clip_y(y2));
        for step in 0..thickness {
            let grow = step - thickness / 2;
            if let Some(rect) = inclusive_rect(x1 - grow, y1 - grow, x2 + grow, y2 + grow) {
                draw_hollow_rect_mut(canvas, rect, color);
            }
        }

        let scale = self.scale();
        let ascent = self.font.as_scaled(scale).ascent().round() as i32;
        let (tx, ty) = (layout.baseline.0, layout.baseline.1.saturating_sub(ascent));
        for dx in 0..self.config.text_thickness.clamp(1, MAX_THICKNESS) as i32 {
            draw_text_mut(canvas, font_color, tx.saturating_add(dx), ty, scale, &self.font, &layout.text);
        }
    }
}

fn to_px(v: f32) -> i32 {
    v.round().clamp(-COORD_LIMIT, COORD_LIMIT) as i32
}

/// Clamp `v` into `[-reach, len + reach]`.
fn clip(v: i32, reach: i32, len: u32) -> i32 {
    let far = i32::try_from(len).unwrap_or(i32::MAX).saturating_add(reach);
    v.clamp(-reach, far)
}

fn inclusive_rect(left: i32, top: i32, right: i32, bottom: i32) -> Option<Rect> {
    if right < left || bottom < top {
        return None;
    }
    let w = u32::try_from(i64::from(right) - i64::from(left) + 1).ok()?;
    let h = u32::try_from(i64::from(bottom) - i64::from(top) + 1).ok()?;
    Some(Rect::at(left, top).of_size(w, h))
}
