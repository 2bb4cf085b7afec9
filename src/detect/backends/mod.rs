pub mod scripted;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::ScriptedModel;

#[cfg(feature = "backend-tract")]
pub use tract::TractYolo;

use super::backend::{RawBox, Thresholds};

/// Upper bound on boxes returned for one frame.
const MAX_BOXES: usize = 300;

fn iou(a: &RawBox, b: &RawBox) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Confidence gate followed by class-wise non-max suppression.
///
/// Output is ordered by descending confidence; ties keep input order so the
/// same candidates always produce the same list.
pub(crate) fn apply_thresholds(candidates: Vec<RawBox>, thresholds: &Thresholds) -> Vec<RawBox> {
    let mut boxes: Vec<RawBox> = candidates
        .into_iter()
        .filter(|b| b.confidence >= thresholds.confidence)
        .collect();
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<RawBox> = Vec::with_capacity(boxes.len());
    'outer: for candidate in boxes {
        for kept in &keep {
            if kept.class_id == candidate.class_id && iou(kept, &candidate) > thresholds.overlap {
                continue 'outer;
            }
        }
        keep.push(candidate);
        if keep.len() >= MAX_BOXES {
            break;
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(x1: f32, class_id: usize, confidence: f32) -> RawBox {
        RawBox {
            x1,
            y1: 0.0,
            x2: x1 + 10.0,
            y2: 10.0,
            class_id,
            confidence,
        }
    }

    #[test]
    fn drops_low_scores_and_same_class_duplicates() {
        let thresholds = Thresholds::new(0.3, 0.5).unwrap();
        let out = apply_thresholds(
            vec![
                b(0.0, 0, 0.6),
                b(1.0, 0, 0.9),  // overlaps the first, higher score wins
                b(1.0, 1, 0.5),  // same place, different class: kept
                b(40.0, 0, 0.2), // below confidence
            ],
            &thresholds,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].confidence, 0.9);
        assert_eq!(out[1].class_id, 1);
        assert!(out.iter().all(|b| b.confidence >= thresholds.confidence));
    }

    #[test]
    fn disjoint_boxes_all_survive() {
        let thresholds = Thresholds::default();
        let out = apply_thresholds(vec![b(0.0, 0, 0.5), b(100.0, 0, 0.5)], &thresholds);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].x1, 0.0);
    }
}
