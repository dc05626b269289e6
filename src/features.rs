//! Per-hand geometric features: finger extension, normalized pinch distance,
//! centroid, bounding box and pointing axis.

use serde::Serialize;

use crate::tracker::{HandLandmarks, Handedness, Point, Snapshot};

pub const WRIST: usize = 0;
pub const THUMB_CMC: usize = 1;
pub const THUMB_MCP: usize = 2;
pub const THUMB_IP: usize = 3;
pub const THUMB_TIP: usize = 4;
pub const INDEX_MCP: usize = 5;
pub const INDEX_PIP: usize = 6;
pub const INDEX_DIP: usize = 7;
pub const INDEX_TIP: usize = 8;
pub const MIDDLE_MCP: usize = 9;
pub const MIDDLE_PIP: usize = 10;
pub const MIDDLE_DIP: usize = 11;
pub const MIDDLE_TIP: usize = 12;
pub const RING_MCP: usize = 13;
pub const RING_PIP: usize = 14;
pub const RING_DIP: usize = 15;
pub const RING_TIP: usize = 16;
pub const PINKY_MCP: usize = 17;
pub const PINKY_PIP: usize = 18;
pub const PINKY_DIP: usize = 19;
pub const PINKY_TIP: usize = 20;

const TIPS: [usize; 5] = [THUMB_TIP, INDEX_TIP, MIDDLE_TIP, RING_TIP, PINKY_TIP];
/// Joint each tip is compared against for extension.
const BASES: [usize; 5] = [THUMB_MCP, INDEX_PIP, MIDDLE_PIP, RING_PIP, PINKY_PIP];
/// Knuckles the pointing axis is measured from.
const ROOTS: [usize; 5] = [THUMB_MCP, INDEX_MCP, MIDDLE_MCP, RING_MCP, PINKY_MCP];
const PALM: [usize; 5] = [WRIST, INDEX_MCP, MIDDLE_MCP, RING_MCP, PINKY_MCP];

/// Finger extension pattern, thumb first.
pub type FingerPattern = [bool; 5];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl BoundingBox {
    fn around(points: &[Point]) -> Self {
        let mut b = BoundingBox {
            min_x: f32::INFINITY,
            min_y: f32::INFINITY,
            max_x: f32::NEG_INFINITY,
            max_y: f32::NEG_INFINITY,
        };
        for p in points {
            b.min_x = b.min_x.min(p.x);
            b.min_y = b.min_y.min(p.y);
            b.max_x = b.max_x.max(p.x);
            b.max_y = b.max_y.max(p.y);
        }
        b
    }

    pub fn diagonal(&self) -> f32 {
        let w = self.max_x - self.min_x;
        let h = self.max_y - self.min_y;
        (w * w + h * h).sqrt()
    }

    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSet {
    pub extended: FingerPattern,
    pub extended_count: usize,
    /// Thumb-tip to index-tip distance over the bounding-box diagonal.
    pub pinch_distance: f32,
    pub centroid: Point,
    /// Index fingertip, the coordinate that drives the cursor.
    pub pointer: Point,
    pub bbox: BoundingBox,
    /// Unit direction the extended fingers point in.
    pub axis: Option<(f32, f32)>,
    pub handedness: Option<Handedness>,
}

impl FeatureSet {
    pub fn matches(&self, pattern: FingerPattern) -> bool {
        self.extended == pattern
    }
}

/// Stateless landmark → feature mapping.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    extension_ratio: f32,
}

impl FeatureExtractor {
    pub fn new(extension_ratio: f32) -> Self {
        Self { extension_ratio }
    }

    /// `None` for incomplete or degenerate hands; callers treat that as absent.
    pub fn extract(&self, hand: &HandLandmarks) -> Option<FeatureSet> {
        if !hand.is_complete() {
            return None;
        }
        let pts = &hand.points;
        let bbox = BoundingBox::around(pts);
        let diag = bbox.diagonal();
        if diag <= f32::EPSILON {
            return None;
        }

        let palm = mean(PALM.iter().map(|&i| pts[i]));
        let mut extended = [false; 5];
        for (f, ext) in extended.iter_mut().enumerate() {
            let tip = palm.distance(&pts[TIPS[f]]);
            let base = palm.distance(&pts[BASES[f]]);
            *ext = tip > base * self.extension_ratio;
        }

        Some(FeatureSet {
            extended,
            extended_count: extended.iter().filter(|e| **e).count(),
            pinch_distance: pts[THUMB_TIP].distance(&pts[INDEX_TIP]) / diag,
            centroid: mean(pts.iter().copied()),
            pointer: pts[INDEX_TIP],
            bbox,
            axis: pointing_axis(pts, &extended),
            handedness: hand.handedness,
        })
    }

    /// Features for every usable hand in the frame, in tracker order.
    pub fn extract_all(&self, snap: &Snapshot) -> Vec<FeatureSet> {
        snap.hands.iter().filter_map(|h| self.extract(h)).collect()
    }
}

fn mean(points: impl Iterator<Item = Point>) -> Point {
    let (mut sx, mut sy, mut sz, mut n) = (0.0f32, 0.0f32, 0.0f32, 0usize);
    for p in points {
        sx += p.x;
        sy += p.y;
        sz += p.z;
        n += 1;
    }
    if n == 0 {
        return Point::default();
    }
    let n = n as f32;
    Point {
        x: sx / n,
        y: sy / n,
        z: sz / n,
    }
}

fn pointing_axis(pts: &[Point], extended: &FingerPattern) -> Option<(f32, f32)> {
    // thumb splays sideways; only use it when it is the sole extended finger
    let fingers: Vec<usize> = (1..5).filter(|&f| extended[f]).collect();
    let chosen: Vec<usize> = if !fingers.is_empty() {
        fingers
    } else if extended[0] {
        vec![0]
    } else {
        Vec::new()
    };

    let (mut ax, mut ay) = (0.0f32, 0.0f32);
    if chosen.is_empty() {
        ax = pts[MIDDLE_MCP].x - pts[WRIST].x;
        ay = pts[MIDDLE_MCP].y - pts[WRIST].y;
    } else {
        for f in chosen {
            let (dx, dy) = (
                pts[TIPS[f]].x - pts[ROOTS[f]].x,
                pts[TIPS[f]].y - pts[ROOTS[f]].y,
            );
            let len = (dx * dx + dy * dy).sqrt();
            if len > f32::EPSILON {
                ax += dx / len;
                ay += dy / len;
            }
        }
    }
    let len = (ax * ax + ay * ay).sqrt();
    (len > f32::EPSILON).then(|| (ax / len, ay / len))
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn extract(h: &HandBuilder) -> FeatureSet {
        FeatureExtractor::new(1.2).extract(&h.build()).unwrap()
    }

    #[test]
    fn test_extension_patterns() {
        for pattern in [POINTING, SCROLL, ZOOM, OPEN, FIST] {
            let f = extract(&hand(pattern));
            assert_eq!(f.extended, pattern, "pattern {:?}", pattern);
            assert_eq!(f.extended_count, pattern.iter().filter(|e| **e).count());
        }
    }

    #[test]
    fn test_extension_survives_rotation() {
        for deg in [45.0, 90.0, 180.0, -120.0] {
            let f = extract(&hand(SCROLL).rotated(deg));
            assert_eq!(f.extended, SCROLL, "rotated {deg}");
        }
    }

    #[test]
    fn test_pinch_distance_scale_invariant() {
        let near = extract(&hand(POINTING).pinched().at(0.5, 0.5));
        let far = extract(&hand(POINTING).pinched().at(0.3, 0.3));
        assert!(near.pinch_distance < 0.05, "{}", near.pinch_distance);

        let small = extract(&hand(POINTING).scaled(0.1));
        let big = extract(&hand(POINTING));
        assert!((small.pinch_distance - big.pinch_distance).abs() < 1e-4);
        assert!((near.pinch_distance - far.pinch_distance).abs() < 1e-4);
        assert!(big.pinch_distance > 0.3);
    }

    #[test]
    fn test_incomplete_hand_is_absent() {
        let mut h = hand(OPEN).build();
        h.points.pop();
        assert!(FeatureExtractor::new(1.2).extract(&h).is_none());

        let mut h = hand(OPEN).build();
        h.points[3].x = f32::NAN;
        assert!(FeatureExtractor::new(1.2).extract(&h).is_none());
    }

    #[test]
    fn test_degenerate_hand_is_absent() {
        let h = HandLandmarks::new(vec![Point::new(0.5, 0.5); 21], None);
        assert!(FeatureExtractor::new(1.2).extract(&h).is_none());
    }

    #[test]
    fn test_axis_follows_fingers() {
        let up = extract(&hand(SCROLL)).axis.unwrap();
        assert!(up.0.abs() < 1e-3 && up.1 < -0.99, "{:?}", up);
        let side = extract(&hand(SCROLL).rotated(90.0)).axis.unwrap();
        assert!((up.0 * side.0 + up.1 * side.1).abs() < 1e-3);
    }

    #[test]
    fn test_pointer_is_index_tip() {
        let h = hand(POINTING).build();
        let f = FeatureExtractor::new(1.2).extract(&h).unwrap();
        assert_eq!(f.pointer, h.points[INDEX_TIP]);
    }

    #[test]
    fn test_extract_all_skips_bad_hands() {
        let mut bad = hand(OPEN).build();
        bad.points.truncate(10);
        let snap = Snapshot::new(
            std::time::Duration::ZERO,
            vec![bad, hand(FIST).build()],
        );
        let all = FeatureExtractor::new(1.2).extract_all(&snap);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].extended, FIST);
    }

    #[test]
    fn test_bbox_overlap() {
        let a = extract(&hand(SCROLL).at(0.4, 0.5)).bbox;
        let b = extract(&hand(SCROLL).at(0.45, 0.5)).bbox;
        let c = extract(&hand(SCROLL).at(0.95, 0.5)).bbox;
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
