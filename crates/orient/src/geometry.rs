//! Rotated boxes, their corner polygons and convex polygon overlap.

use std::f32::consts::{PI, TAU};

use nalgebra as na;
use ndarray::ArrayView1;

use crate::error::{Error, Result};

pub type Point = na::Point2<f32>;
pub type Vector = na::Vector2<f32>;

/// Areas below this are treated as empty when computing overlaps.
pub const AREA_EPS: f32 = 1e-6;

/// Normalizes an angle into the canonical range `[-π, π)`.
#[must_use]
pub fn normalize_angle(theta: f32) -> f32 {
    if (-PI..PI).contains(&theta) {
        return theta;
    }

    let wrapped = (theta + PI).rem_euclid(TAU) - PI;
    // `rem_euclid` can round up to exactly `TAU` for tiny negative inputs
    if wrapped >= PI { wrapped - TAU } else { wrapped }
}

/// Shortest signed angular difference, reduced with `atan2` so there is no jump at the wrap point.
#[must_use]
pub fn wrap_angle(delta: f32) -> f32 {
    delta.sin().atan2(delta.cos())
}

/// A box with center `(cx, cy)`, extents `(w, h)` and rotation `theta` in radians.
///
/// The angle is kept in `[-π, π)`, see [`normalize_angle`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub theta: f32,
}

impl RotatedBox {
    #[must_use]
    pub fn new(cx: f32, cy: f32, w: f32, h: f32, theta: f32) -> Self {
        Self {
            cx,
            cy,
            w,
            h,
            theta: normalize_angle(theta),
        }
    }

    /// Lifts an axis-aligned `(x1, y1, x2, y2)` box to a rotated box with `theta = 0`.
    #[must_use]
    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new((x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1, 0.0)
    }

    /// Reads a box from the first five values of a `(cx, cy, w, h, theta)` row.
    pub fn from_row(row: ArrayView1<f32>) -> Result<Self> {
        if row.len() < 5 {
            return Err(Error::mismatch("a row with 5 box values", row.len()));
        }

        Ok(Self::new(row[0], row[1], row[2], row[3], row[4]))
    }

    #[must_use]
    pub fn to_array(self) -> [f32; 5] {
        [self.cx, self.cy, self.w, self.h, self.theta]
    }

    #[must_use]
    pub fn area(self) -> f32 {
        self.w * self.h
    }

    /// Geometric mean of the extents, the size measure used for level routing.
    #[must_use]
    pub fn scale(self) -> f32 {
        (self.w * self.h).sqrt()
    }

    #[must_use]
    pub fn center(self) -> Point {
        Point::new(self.cx, self.cy)
    }

    /// Returns the box if both extents are strictly positive.
    pub fn validated(self) -> Result<Self> {
        if self.w > 0.0 && self.h > 0.0 {
            Ok(self)
        } else {
            Err(Error::invalid_shape(format!(
                "box extents must be positive, got w={} h={}",
                self.w, self.h
            )))
        }
    }

    /// Scales the extents only; center and angle stay fixed so the result is concentric.
    #[must_use]
    pub fn rescaled(self, w_factor: f32, h_factor: f32) -> Self {
        Self {
            w: self.w * w_factor,
            h: self.h * h_factor,
            ..self
        }
    }

    /// Multiplies every position and extent by `factor`, e.g. to move into feature map coordinates.
    #[must_use]
    pub fn scaled(self, factor: f32) -> Self {
        Self {
            cx: self.cx * factor,
            cy: self.cy * factor,
            w: self.w * factor,
            h: self.h * factor,
            theta: self.theta,
        }
    }

    fn axes(self) -> (Vector, Vector) {
        let (sin, cos) = self.theta.sin_cos();
        (Vector::new(cos, sin), Vector::new(-sin, cos))
    }

    /// Maps box-local coordinates to image coordinates.
    ///
    /// The local frame has its origin at the corner that becomes the first polygon vertex,
    /// `u` runs along the width axis and `v` along the height axis.
    #[must_use]
    pub fn from_local(self, u: f32, v: f32) -> Point {
        let (x_axis, y_axis) = self.axes();
        self.center() + x_axis * (u - self.w / 2.0) + y_axis * (v - self.h / 2.0)
    }

    /// Inverse of [`RotatedBox::from_local`].
    #[must_use]
    pub fn to_local(self, point: Point) -> (f32, f32) {
        let (x_axis, y_axis) = self.axes();
        let d = point - self.center();
        (d.dot(&x_axis) + self.w / 2.0, d.dot(&y_axis) + self.h / 2.0)
    }

    /// The four corners, rotated around the center.
    #[must_use]
    pub fn to_polygon(self) -> Polygon {
        Polygon([
            self.from_local(0.0, 0.0),
            self.from_local(self.w, 0.0),
            self.from_local(self.w, self.h),
            self.from_local(0.0, self.h),
        ])
    }
}

/// Four ordered vertices of a quadrilateral, usually the corners of a [`RotatedBox`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Polygon(pub [Point; 4]);

impl Polygon {
    /// Builds a polygon from `x1, y1, .., x4, y4`.
    #[must_use]
    pub fn from_flat(coords: [f32; 8]) -> Self {
        Polygon(std::array::from_fn(|i| {
            Point::new(coords[2 * i], coords[2 * i + 1])
        }))
    }

    /// Reads a polygon from the first eight values of a row.
    pub fn from_row(row: ArrayView1<f32>) -> Result<Self> {
        if row.len() < 8 {
            return Err(Error::mismatch("a row with 8 polygon values", row.len()));
        }

        Ok(Self::from_flat(std::array::from_fn(|i| row[i])))
    }

    #[must_use]
    pub fn to_flat(&self) -> [f32; 8] {
        std::array::from_fn(|i| {
            let vertex = self.0[i / 2];
            if i % 2 == 0 { vertex.x } else { vertex.y }
        })
    }

    /// Shoelace area, positive for the winding produced by [`RotatedBox::to_polygon`].
    #[must_use]
    pub fn signed_area(&self) -> f32 {
        shoelace(&self.0)
    }

    #[must_use]
    pub fn area(&self) -> f32 {
        self.signed_area().abs()
    }

    /// The vertices with positive winding, reversing them when needed.
    fn oriented(&self) -> [Point; 4] {
        let mut vertices = self.0;
        if self.signed_area() < 0.0 {
            vertices.reverse();
        }
        vertices
    }

    /// Area of the overlap between two convex polygons.
    #[must_use]
    pub fn intersection_area(&self, other: &Polygon) -> f32 {
        if self.area() <= AREA_EPS || other.area() <= AREA_EPS {
            return 0.0;
        }

        let clipped = clip_convex(&self.oriented(), &other.oriented());
        shoelace(&clipped).max(0.0)
    }

    /// Intersection over union of two convex polygons.
    ///
    /// Degenerate polygons overlap nothing, and the union is floored at [`AREA_EPS`].
    #[must_use]
    pub fn iou(&self, other: &Polygon) -> f32 {
        let area_a = self.area();
        let area_b = other.area();
        if area_a <= AREA_EPS || area_b <= AREA_EPS {
            return 0.0;
        }

        let intersection = self.intersection_area(other);
        intersection / (area_a + area_b - intersection).max(AREA_EPS)
    }
}

fn cross(a: Vector, b: Vector) -> f32 {
    a.x * b.y - a.y * b.x
}

fn shoelace(vertices: &[Point]) -> f32 {
    if vertices.len() < 3 {
        return 0.0;
    }

    let twice_area: f32 = vertices
        .iter()
        .zip(vertices.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum();

    twice_area / 2.0
}

/// Sutherland-Hodgman clipping of `subject` against the convex, positively wound `clip`.
fn clip_convex(subject: &[Point], clip: &[Point]) -> Vec<Point> {
    let mut output = subject.to_vec();

    for (k, &a) in clip.iter().enumerate() {
        let b = clip[(k + 1) % clip.len()];
        let edge = b - a;
        let inside = |p: Point| cross(edge, p - a) >= 0.0;

        let input = std::mem::take(&mut output);
        let Some(&last) = input.last() else {
            break;
        };

        let mut prev = last;
        for &current in &input {
            match (inside(prev), inside(current)) {
                (true, true) => output.push(current),
                (true, false) => output.push(segment_line_intersection(prev, current, a, edge)),
                (false, true) => {
                    output.push(segment_line_intersection(prev, current, a, edge));
                    output.push(current);
                }
                (false, false) => {}
            }
            prev = current;
        }
    }

    output
}

/// Point where the segment `start -> end` crosses the line through `origin` along `direction`.
fn segment_line_intersection(start: Point, end: Point, origin: Point, direction: Vector) -> Point {
    let segment = end - start;
    let denom = cross(direction, segment);
    if denom.abs() <= f32::EPSILON {
        return start;
    }

    let t = cross(direction, origin - start) / denom;
    start + segment * t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn angles_normalize_into_half_open_range() {
        assert!(close(normalize_angle(PI), -PI));
        assert!(close(normalize_angle(3.0 * PI / 2.0), -PI / 2.0));
        assert!(close(normalize_angle(-PI), -PI));
        assert!(close(normalize_angle(0.25), 0.25));
        assert!(normalize_angle(-1e-9) < PI);
    }

    #[test]
    fn wrap_has_no_jump_at_boundary() {
        assert!(close(wrap_angle(PI - 0.1 - (-PI + 0.1)), -0.2));
        assert!(close(wrap_angle(0.3), 0.3));
    }

    #[test]
    fn polygon_of_axis_aligned_box() {
        let polygon = RotatedBox::new(5.0, 5.0, 4.0, 2.0, 0.0).to_polygon();
        assert_eq!(
            polygon.to_flat(),
            [3.0, 4.0, 7.0, 4.0, 7.0, 6.0, 3.0, 6.0]
        );
        assert!(close(polygon.signed_area(), 8.0));
    }

    #[test]
    fn polygon_rotation_keeps_area_and_center() {
        let rbox = RotatedBox::new(10.0, -3.0, 6.0, 2.0, 0.7);
        let polygon = rbox.to_polygon();
        assert!(close(polygon.signed_area(), 12.0));

        let centroid = polygon.0.iter().fold(Vector::zeros(), |acc, p| acc + p.coords) / 4.0;
        assert!(close(centroid.x, 10.0));
        assert!(close(centroid.y, -3.0));
    }

    #[test]
    fn local_frame_round_trip() {
        let rbox = RotatedBox::new(3.0, 4.0, 5.0, 7.0, -1.2);
        let (u, v) = rbox.to_local(rbox.from_local(1.5, 6.0));
        assert!(close(u, 1.5));
        assert!(close(v, 6.0));
    }

    #[test]
    fn iou_of_shifted_squares() {
        let a = RotatedBox::new(5.0, 5.0, 10.0, 10.0, 0.0).to_polygon();
        let b = RotatedBox::new(10.0, 10.0, 10.0, 10.0, 0.0).to_polygon();

        assert!(close(a.intersection_area(&b), 25.0));
        assert!(close(a.iou(&b), 25.0 / 175.0));
    }

    #[test]
    fn iou_of_rotated_square_with_itself_is_one() {
        let a = RotatedBox::new(0.0, 0.0, 8.0, 3.0, 0.4).to_polygon();
        assert!(close(a.iou(&a), 1.0));
    }

    #[test]
    fn iou_ignores_winding() {
        let a = RotatedBox::new(5.0, 5.0, 10.0, 10.0, 0.0).to_polygon();
        let mut reversed = a;
        reversed.0.reverse();
        assert!(close(a.iou(&reversed), 1.0));
    }

    #[test]
    fn cross_shaped_overlap() {
        // a square rotated by 45 degrees inside a bigger axis-aligned one
        let outer = RotatedBox::new(0.0, 0.0, 4.0, 4.0, 0.0).to_polygon();
        let diamond = RotatedBox::new(0.0, 0.0, 2.0, 2.0, PI / 4.0).to_polygon();
        assert!(close(outer.intersection_area(&diamond), 4.0));
        assert!(close(outer.iou(&diamond), 4.0 / 16.0));
    }

    #[test]
    fn degenerate_polygon_has_zero_overlap() {
        let flat = RotatedBox::new(5.0, 5.0, 10.0, 0.0, 0.0).to_polygon();
        let square = RotatedBox::new(5.0, 5.0, 10.0, 10.0, 0.0).to_polygon();
        assert_eq!(flat.iou(&square), 0.0);
        assert_eq!(square.iou(&flat), 0.0);
        assert_eq!(flat.iou(&flat), 0.0);
    }

    #[test]
    fn disjoint_polygons() {
        let a = RotatedBox::new(0.0, 0.0, 2.0, 2.0, 0.3).to_polygon();
        let b = RotatedBox::new(50.0, 50.0, 2.0, 2.0, 0.3).to_polygon();
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn non_positive_extents_are_rejected() {
        assert!(RotatedBox::new(0.0, 0.0, 0.0, 1.0, 0.0).validated().is_err());
        assert!(RotatedBox::new(0.0, 0.0, 1.0, -1.0, 0.0).validated().is_err());
        assert!(RotatedBox::new(0.0, 0.0, 1.0, 1.0, 0.0).validated().is_ok());
    }
}
