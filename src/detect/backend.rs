use anyhow::{anyhow, Result};
use serde::Serialize;

use super::normalize::ClassTable;
use crate::frame::Frame;

/// Score gates handed to the model on every call.
///
/// Set once when the detector is built and shared read-only afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Thresholds {
    /// Minimum score for a candidate box to be returned.
    pub confidence: f32,
    /// IoU above which the lower-scored of two same-class boxes is suppressed.
    pub overlap: f32,
}

impl Thresholds {
    pub fn new(confidence: f32, overlap: f32) -> Result<Self> {
        for (name, value) in [("confidence", confidence), ("overlap", overlap)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{name} threshold must be within [0, 1], got {value}"));
            }
        }
        Ok(Self {
            confidence,
            overlap,
        })
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            overlap: 0.45,
        }
    }
}

/// One candidate box straight out of the model, in source-frame pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub class_id: usize,
    pub confidence: f32,
}

/// Object-detection capability the pipeline is built around.
///
/// # Contract
///
/// - `infer` sees one frame per call and keeps no state between calls; it
///   must be callable from several request threads at once.
/// - Returned boxes already honor `thresholds`: every confidence is at least
///   `thresholds.confidence` and duplicates above `thresholds.overlap` are
///   suppressed. Callers never re-filter.
/// - Corner coordinates satisfy `x2 >= x1` and `y2 >= y1`.
/// - A structurally unusable frame is an error, not an empty result.
pub trait HazardModel: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class table used to label `RawBox::class_id`.
    fn classes(&self) -> &ClassTable;

    /// Run detection on a frame.
    fn infer(&self, frame: &Frame, thresholds: &Thresholds) -> Result<Vec<RawBox>>;

    /// Optional warm-up hook, run once after load.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
