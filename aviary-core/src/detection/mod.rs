//! detection — detection records and the boundary to the external detector
//!
//! Detections are produced outside this crate (a trained Faster R-CNN/YOLOv5
//! model) and arrive as JSON, either as a list of records or in the column
//! layout the detector emits:
//!
//! ```json
//! {"detection": {"bboxes": [[10, 10, 50, 50]], "labels": ["chupim"], "scores": [0.87]}}
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{CurationError, Result};
use crate::species::Species;
use crate::video::RgbFrame;

/// Axis-aligned bounding box in pixel coordinates of the original frame.
/// Serialized as `[xmin, ymin, xmax, ymax]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

impl From<[f32; 4]> for BBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One predicted or annotated object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BBox,
    pub score: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: BBox, score: f32) -> Self {
        Self {
            label: label.into(),
            bbox,
            score,
        }
    }

    /// Check geometry and score, then resolve the species.
    pub fn validate(&self) -> Result<Species> {
        let b = &self.bbox;
        if ![b.x1, b.y1, b.x2, b.y2].iter().all(|v| v.is_finite()) {
            return Err(CurationError::MalformedDetection(format!(
                "{}: non-finite box coordinates {:?}",
                self.label, b
            )));
        }
        if b.width() < 0.0 || b.height() < 0.0 {
            return Err(CurationError::MalformedDetection(format!(
                "{}: inverted box ({}, {}, {}, {})",
                self.label, b.x1, b.y1, b.x2, b.y2
            )));
        }
        // NaN fails the range check too.
        if !(0.0..=1.0).contains(&self.score) {
            return Err(CurationError::MalformedDetection(format!(
                "{}: score {} outside [0, 1]",
                self.label, self.score
            )));
        }
        Species::from_label(&self.label)
    }
}

/// The external detector: turns a frame into detections.
pub trait Detector {
    fn detect(&mut self, frame: &RgbFrame) -> anyhow::Result<Vec<Detection>>;
}

#[derive(Deserialize)]
struct Columns {
    bboxes: Vec<BBox>,
    labels: Vec<String>,
    scores: Vec<f32>,
}

#[derive(Deserialize)]
struct ColumnDetections {
    detection: Columns,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DetectionSet {
    Records(Vec<Detection>),
    Columns(ColumnDetections),
}

impl DetectionSet {
    fn into_records(self) -> Result<Vec<Detection>> {
        match self {
            DetectionSet::Records(records) => Ok(records),
            DetectionSet::Columns(ColumnDetections { detection: c }) => {
                if c.bboxes.len() != c.labels.len() || c.labels.len() != c.scores.len() {
                    return Err(CurationError::MalformedDetection(format!(
                        "column lengths differ: {} boxes, {} labels, {} scores",
                        c.bboxes.len(),
                        c.labels.len(),
                        c.scores.len()
                    )));
                }
                Ok(c.bboxes
                    .into_iter()
                    .zip(c.labels)
                    .zip(c.scores)
                    .map(|((bbox, label), score)| Detection { label, bbox, score })
                    .collect())
            }
        }
    }
}

/// Parse detections for a single image in either JSON layout.
pub fn parse_detections(json: &str) -> Result<Vec<Detection>> {
    let set: DetectionSet = serde_json::from_str(json)
        .map_err(|e| CurationError::MalformedDetection(format!("invalid detections JSON: {e}")))?;
    set.into_records()
}

pub fn load_detections<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Detection>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("could not read detections from {}", path.display()))?;
    Ok(parse_detections(&json)?)
}

/// Detector that replays precomputed detections from a per-frame sidecar:
/// a JSON object mapping frame index to detections for that frame.
#[derive(Debug, Default, Clone)]
pub struct SidecarDetector {
    frames: BTreeMap<usize, Vec<Detection>>,
}

impl SidecarDetector {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, DetectionSet> = serde_json::from_str(json)
            .map_err(|e| CurationError::MalformedDetection(format!("invalid sidecar JSON: {e}")))?;
        let mut frames = BTreeMap::new();
        for (key, set) in raw {
            let index = key.trim().parse::<usize>().map_err(|_| {
                CurationError::MalformedDetection(format!("sidecar key {key:?} is not a frame index"))
            })?;
            frames.insert(index, set.into_records()?);
        }
        Ok(Self { frames })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("could not read detection sidecar {}", path.display()))?;
        Ok(Self::from_json(&json)?)
    }

    pub fn frames_with_detections(&self) -> usize {
        self.frames.len()
    }
}

impl Detector for SidecarDetector {
    fn detect(&mut self, frame: &RgbFrame) -> anyhow::Result<Vec<Detection>> {
        Ok(self.frames.get(&frame.index).cloned().unwrap_or_default())
    }
}
