use serde::{Deserialize, Serialize};

/// Axis-aligned box as top-left corner plus size, in pixels.
///
/// Serialized as `[x, y, width, height]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

impl From<[f32; 4]> for BBox {
    fn from([x, y, width, height]: [f32; 4]) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

/// One identified hazard. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    /// 0-based source frame, present only for video detections.
    #[serde(rename = "frame", default, skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<u64>,
}

impl Detection {
    pub fn in_frame(self, frame_index: u64) -> Self {
        Self {
            frame_index: Some(frame_index),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pothole() -> Detection {
        Detection {
            class_name: "pothole".into(),
            confidence: 0.87,
            bbox: BBox::from([10.0, 20.0, 100.0, 50.0]),
            frame_index: None,
        }
    }

    #[test]
    fn serializes_wire_shape() {
        let value = serde_json::to_value(pothole()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "class": "pothole",
                "confidence": 0.87f32,
                "bbox": [10.0, 20.0, 100.0, 50.0]
            })
        );
    }

    #[test]
    fn video_detections_carry_frame() {
        let value = serde_json::to_value(pothole().in_frame(7)).unwrap();
        assert_eq!(value["frame"], 7);
        let back: Detection = serde_json::from_value(value).unwrap();
        assert_eq!(back.frame_index, Some(7));
        assert_eq!(back.bbox.right(), 110.0);
        assert_eq!(back.bbox.bottom(), 70.0);
    }
}
