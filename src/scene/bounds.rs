use glam::{Mat4, Vec3};

/// Axis-aligned box given by its lower and upper corners.
///
/// An empty box has `lower > upper` on every axis, so the first point
/// combined into it becomes both corners.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    lower: Vec3,
    upper: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new(Vec3::splat(-1.0), Vec3::splat(1.0))
    }
}

impl BoundingBox {
    pub fn new(lower: Vec3, upper: Vec3) -> Self {
        Self { lower, upper }
    }

    pub fn empty() -> Self {
        Self {
            lower: Vec3::splat(f32::INFINITY),
            upper: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Self {
        let mut bounds = Self::empty();
        for point in points {
            bounds.combine_point(point);
        }
        bounds
    }

    pub fn lower(&self) -> Vec3 {
        self.lower
    }

    pub fn upper(&self) -> Vec3 {
        self.upper
    }

    pub fn is_empty(&self) -> bool {
        self.lower.x > self.upper.x || self.lower.y > self.upper.y || self.lower.z > self.upper.z
    }

    pub fn center(&self) -> Vec3 {
        (self.lower + self.upper) * 0.5
    }

    pub fn combine_point(&mut self, point: Vec3) {
        self.lower = self.lower.min(point);
        self.upper = self.upper.max(point);
    }

    pub fn combine(&mut self, other: &BoundingBox) {
        if other.is_empty() {
            return;
        }
        self.combine_point(other.lower);
        self.combine_point(other.upper);
    }

    /// Re-bounds the eight transformed corners, so a rotated box grows to
    /// enclose its new extent on every axis.
    pub fn transform(&self, matrix: &Mat4) -> BoundingBox {
        if self.is_empty() {
            return *self;
        }
        let (l, u) = (self.lower, self.upper);
        let corners = [
            Vec3::new(l.x, l.y, l.z),
            Vec3::new(u.x, l.y, l.z),
            Vec3::new(l.x, u.y, l.z),
            Vec3::new(u.x, u.y, l.z),
            Vec3::new(l.x, l.y, u.z),
            Vec3::new(u.x, l.y, u.z),
            Vec3::new(l.x, u.y, u.z),
            Vec3::new(u.x, u.y, u.z),
        ];
        BoundingBox::from_points(corners.iter().map(|corner| matrix.transform_point3(*corner)))
    }
}
