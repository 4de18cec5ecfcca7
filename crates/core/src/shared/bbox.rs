use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates, stored as `(x, y, w, h)`
/// with `(x, y)` the top-left corner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Builds a box from `[x1, y1, x2, y2]` corners.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    /// Builds a box of the given size centered on `(cx, cy)`.
    pub fn from_center(cx: f64, cy: f64, width: f64, height: f64) -> Self {
        Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
    }

    pub fn corners(&self) -> [f64; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn diagonal(&self) -> f64 {
        self.width.hypot(self.height)
    }

    /// Intersection-over-Union with `other`. Degenerate boxes yield 0.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let [ax1, ay1, ax2, ay2] = self.corners();
        let [bx1, by1, bx2, by2] = other.corners();

        let inter = (ax2.min(bx2) - ax1.max(bx1)).max(0.0) * (ay2.min(by2) - ay1.max(by1)).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }

    /// Intersects the box with a `width` × `height` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamp_to(&self, width: f64, height: f64) -> Option<BoundingBox> {
        let [x1, y1, x2, y2] = self.corners();
        let cx1 = x1.max(0.0);
        let cy1 = y1.max(0.0);
        let cx2 = x2.min(width);
        let cy2 = y2.min(height);
        if cx2 <= cx1 || cy2 <= cy1 {
            return None;
        }
        Some(BoundingBox::from_corners(cx1, cy1, cx2, cy2))
    }
}
