//! Geometry and color primitives shared by the packer and the tracer.

/// Normalized RGBA color. Channels are kept in `[0, 1]`; the per-format
/// encoders clamp and quantize on the way to disk.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };

    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Color { r, g, b, a }
    }

    /// Euclidean distance over all four channels. Drives merge decisions in
    /// the optimizer.
    pub fn dist(self, other: Color) -> f32 {
        let dr = other.r - self.r;
        let dg = other.g - self.g;
        let db = other.b - self.b;
        let da = other.a - self.a;
        (dr * dr + dg * dg + db * db + da * da).sqrt()
    }

    pub fn component(self, index: usize) -> f32 {
        match index {
            0 => self.r,
            1 => self.g,
            2 => self.b,
            3 => self.a,
            _ => panic!("invalid color component {index}"),
        }
    }

    pub fn set_component(&mut self, index: usize, value: f32) {
        match index {
            0 => self.r = value,
            1 => self.g = value,
            2 => self.b = value,
            3 => self.a = value,
            _ => panic!("invalid color component {index}"),
        }
    }

    pub fn to_rgba8(self) -> [u8; 4] {
        let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(self.r), q(self.g), q(self.b), q(self.a)]
    }

    pub fn from_rgba8(bytes: [u8; 4]) -> Self {
        Color {
            r: bytes[0] as f32 / 255.0,
            g: bytes[1] as f32 / 255.0,
            b: bytes[2] as f32 / 255.0,
            a: bytes[3] as f32 / 255.0,
        }
    }
}

/// A position in world units.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Point { x, y, z }
    }
}

/// Axis-aligned cube. `contains` is strict on both sides on every axis:
/// samples exactly on a face belong to neither neighbor.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bounds {
    pub pos: Point,
    pub size: f64,
}

impl Bounds {
    pub fn new(pos: Point, size: f64) -> Self {
        Bounds { pos, size }
    }

    pub fn contains(&self, p: Point) -> bool {
        let max = Point::new(
            self.pos.x + self.size,
            self.pos.y + self.size,
            self.pos.z + self.size,
        );
        self.pos.x < p.x
            && self.pos.y < p.y
            && self.pos.z < p.z
            && max.x > p.x
            && max.y > p.y
            && max.z > p.z
    }

    /// The octant occupying child slot `(z << 2) | (y << 1) | x`.
    pub fn child(&self, slot: usize) -> Bounds {
        debug_assert!(slot < 8);
        let half = self.size * 0.5;
        Bounds {
            pos: Point::new(
                self.pos.x + if slot & 1 != 0 { half } else { 0.0 },
                self.pos.y + if slot & 2 != 0 { half } else { 0.0 },
                self.pos.z + if slot & 4 != 0 { half } else { 0.0 },
            ),
            size: half,
        }
    }

    /// Grow the cube by `margin` on every face. Used to widen sample
    /// collection when the color filter is enabled.
    pub fn dilated(&self, margin: f64) -> Bounds {
        Bounds {
            pos: Point::new(
                self.pos.x - margin,
                self.pos.y - margin,
                self.pos.z - margin,
            ),
            size: self.size + 2.0 * margin,
        }
    }
}

/// One input point: a position and its color. The core never inspects
/// anything else.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub position: Point,
    pub color: Color,
}
