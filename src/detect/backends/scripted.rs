use anyhow::Result;

use super::apply_thresholds;
use crate::detect::backend::{HazardModel, RawBox, Thresholds};
use crate::detect::normalize::ClassTable;
use crate::frame::Frame;

type Script = dyn Fn(&Frame) -> Result<Vec<RawBox>> + Send + Sync;

/// In-process model whose candidate boxes come from a closure.
///
/// Used for tests, demos and dry runs of the service without weights. The
/// closure produces raw candidates; thresholds and suppression are applied
/// here, so the backend honors the same contract as a real network.
pub struct ScriptedModel {
    classes: ClassTable,
    script: Box<Script>,
}

impl ScriptedModel {
    /// A model that never finds anything.
    pub fn empty(classes: ClassTable) -> Self {
        Self::from_fn(classes, |_| Ok(Vec::new()))
    }

    /// A model that reports the same candidates for every frame.
    pub fn with_boxes(classes: ClassTable, boxes: Vec<RawBox>) -> Self {
        Self::from_fn(classes, move |_| Ok(boxes.clone()))
    }

    pub fn from_fn<F>(classes: ClassTable, script: F) -> Self
    where
        F: Fn(&Frame) -> Result<Vec<RawBox>> + Send + Sync + 'static,
    {
        Self {
            classes,
            script: Box::new(script),
        }
    }
}

impl HazardModel for ScriptedModel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn classes(&self) -> &ClassTable {
        &self.classes
    }

    fn infer(&self, frame: &Frame, thresholds: &Thresholds) -> Result<Vec<RawBox>> {
        let candidates = (self.script)(frame)?;
        Ok(apply_thresholds(candidates, thresholds))
    }
}
