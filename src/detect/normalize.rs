use std::borrow::Cow;

use super::backend::RawBox;
use super::result::{BBox, Detection};
use crate::error::{DetectError, Result};

/// Class index -> label table, as shipped with the model weights.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassTable {
    names: Vec<String>,
}

impl ClassTable {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// The two-class road hazard set the service ships with.
    pub fn road_hazards() -> Self {
        Self::new(["pothole", "speed_bump"])
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }

    /// Label for `class_id`, synthesizing `class_<id>` for unknown indices.
    pub fn name_for(&self, class_id: usize) -> Cow<'_, str> {
        match self.get(class_id) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("class_{class_id}")),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Convert a corner box from the model into the canonical record.
///
/// Unknown class indices get a synthesized label rather than failing the
/// frame. A negative or non-finite box size breaks the model contract and is
/// reported as an inference failure.
pub fn normalize(raw: &RawBox, classes: &ClassTable) -> Result<Detection> {
    let width = raw.x2 - raw.x1;
    let height = raw.y2 - raw.y1;
    if !(width.is_finite() && height.is_finite()) || width < 0.0 || height < 0.0 {
        return Err(DetectError::InferenceFailure(format!(
            "model returned invalid box ({}, {}, {}, {})",
            raw.x1, raw.y1, raw.x2, raw.y2
        )));
    }
    if !raw.confidence.is_finite() {
        return Err(DetectError::InferenceFailure(format!(
            "model returned non-finite confidence {}",
            raw.confidence
        )));
    }

    Ok(Detection {
        class_name: classes.name_for(raw.class_id).into_owned(),
        confidence: raw.confidence,
        bbox: BBox {
            x: raw.x1,
            y: raw.y1,
            width,
            height,
        },
        frame_index: None,
    })
}
