//! Camera-space calibration region and the mapping to screen pixels.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tracker::Point;

/// Smallest usable region side, in normalized camera units.
pub const MIN_SPAN: f32 = 0.05;

#[derive(Debug, Error, Clone, PartialEq)]
#[error(
    "invalid calibration region ({left}, {top})-({right}, {bottom}): sides must lie in [0,1] and span at least {MIN_SPAN}"
)]
pub struct InvalidCalibration {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRegion {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Default for CalibrationRegion {
    fn default() -> Self {
        Self::FULL
    }
}

impl CalibrationRegion {
    pub const FULL: CalibrationRegion = CalibrationRegion {
        left: 0.0,
        top: 0.0,
        right: 1.0,
        bottom: 1.0,
    };

    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Result<Self, InvalidCalibration> {
        let r = Self {
            left,
            top,
            right,
            bottom,
        };
        r.validate()?;
        Ok(r)
    }

    /// Region spanned by two captured corners, in any order.
    pub fn from_corners(a: Point, b: Point) -> Result<Self, InvalidCalibration> {
        Self::new(a.x.min(b.x), a.y.min(b.y), a.x.max(b.x), a.y.max(b.y))
    }

    pub fn validate(&self) -> Result<(), InvalidCalibration> {
        let in_unit = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
        let ok = in_unit(self.left)
            && in_unit(self.top)
            && in_unit(self.right)
            && in_unit(self.bottom)
            && self.right - self.left >= MIN_SPAN
            && self.bottom - self.top >= MIN_SPAN;
        if ok {
            Ok(())
        } else {
            Err(InvalidCalibration {
                left: self.left,
                top: self.top,
                right: self.right,
                bottom: self.bottom,
            })
        }
    }

    /// Clamp into the region and rescale to [0,1] within it.
    pub fn normalize(&self, x: f32, y: f32) -> (f32, f32) {
        let u = (x.clamp(self.left, self.right) - self.left) / (self.right - self.left);
        let v = (y.clamp(self.top, self.bottom) - self.top) / (self.bottom - self.top);
        (u, v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl Default for ScreenSize {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Camera point → screen pixel. Sensitivity scales about the screen centre,
/// and the result is clamped on screen.
#[derive(Debug, Clone)]
pub struct ScreenMapper {
    pub region: CalibrationRegion,
    pub screen: ScreenSize,
    pub sensitivity: f32,
    pub mirror: bool,
}

impl ScreenMapper {
    /// Apply the selfie-view mirror, giving the point calibration works in.
    pub fn camera_point(&self, p: Point) -> Point {
        if self.mirror {
            Point { x: 1.0 - p.x, ..p }
        } else {
            p
        }
    }

    pub fn map(&self, p: Point) -> (f32, f32) {
        let c = self.camera_point(p);
        let (u, v) = self.region.normalize(c.x, c.y);
        let w = self.screen.width as f32;
        let h = self.screen.height as f32;
        let (cx, cy) = (w / 2.0, h / 2.0);
        let x = cx + (u * w - cx) * self.sensitivity;
        let y = cy + (v * h - cy) * self.sensitivity;
        (x.clamp(0.0, (w - 1.0).max(0.0)), y.clamp(0.0, (h - 1.0).max(0.0)))
    }
}

/// Two-step corner capture: the first call stores a corner, the second
/// yields the region spanned by both.
#[derive(Debug, Clone, Default)]
pub struct CornerCapture {
    first: Option<Point>,
}

impl CornerCapture {
    pub fn capture(&mut self, p: Point) -> Option<Result<CalibrationRegion, InvalidCalibration>> {
        match self.first.take() {
            None => {
                self.first = Some(p);
                None
            }
            Some(a) => Some(CalibrationRegion::from_corners(a, p)),
        }
    }

    pub fn pending(&self) -> bool {
        self.first.is_some()
    }

    pub fn cancel(&mut self) {
        self.first = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(region: CalibrationRegion, sensitivity: f32) -> ScreenMapper {
        ScreenMapper {
            region,
            screen: ScreenSize::default(),
            sensitivity,
            mirror: false,
        }
    }

    #[test]
    fn test_full_region_identity_scale() {
        let m = mapper(CalibrationRegion::FULL, 1.0);
        assert_eq!(m.map(Point::new(0.5, 0.5)), (960.0, 540.0));
        assert_eq!(m.map(Point::new(0.0, 0.0)), (0.0, 0.0));
        assert_eq!(m.map(Point::new(1.0, 1.0)), (1919.0, 1079.0));
    }

    #[test]
    fn test_sub_region_rescales_and_clamps() {
        let r = CalibrationRegion::new(0.2, 0.2, 0.8, 0.8).unwrap();
        let m = mapper(r, 1.0);
        assert_eq!(m.map(Point::new(0.2, 0.2)), (0.0, 0.0));
        assert_eq!(m.map(Point::new(0.5, 0.5)), (960.0, 540.0));
        assert_eq!(m.map(Point::new(0.05, 0.95)), (0.0, 1079.0));
    }

    #[test]
    fn test_mapping_is_bounded_for_any_sensitivity() {
        let r = CalibrationRegion::new(0.1, 0.3, 0.7, 0.9).unwrap();
        for sens in [0.0, 0.1, 1.0, 2.5, 3.0] {
            let m = mapper(r, sens);
            for i in 0..=20 {
                for j in 0..=20 {
                    let p = Point::new(0.1 + 0.03 * i as f32, 0.3 + 0.03 * j as f32);
                    let (x, y) = m.map(p);
                    assert!((0.0..=1920.0).contains(&x), "x={x} sens={sens}");
                    assert!((0.0..=1080.0).contains(&y), "y={y} sens={sens}");
                }
            }
        }
    }

    #[test]
    fn test_mirror_flips_x() {
        let mut m = mapper(CalibrationRegion::FULL, 1.0);
        m.mirror = true;
        assert_eq!(m.map(Point::new(0.25, 0.5)), (1440.0, 540.0));
    }

    #[test]
    fn test_invalid_regions() {
        assert!(CalibrationRegion::new(0.5, 0.0, 0.5, 1.0).is_err());
        assert!(CalibrationRegion::new(0.0, 0.0, 1.2, 1.0).is_err());
        assert!(CalibrationRegion::new(0.0, f32::NAN, 1.0, 1.0).is_err());
        assert!(CalibrationRegion::new(0.0, 0.0, 0.04, 1.0).is_err());
    }

    #[test]
    fn test_corner_capture_any_order() {
        let mut cap = CornerCapture::default();
        assert!(cap.capture(Point::new(0.8, 0.9)).is_none());
        assert!(cap.pending());
        let r = cap.capture(Point::new(0.2, 0.1)).unwrap().unwrap();
        assert_eq!(r, CalibrationRegion::new(0.2, 0.1, 0.8, 0.9).unwrap());
        assert!(!cap.pending());
    }
}
