//! Interleave two jittered half-width frames into one full-width image.

use image::RgbaImage;
use octavox::{Error, Result};

/// Merge half-width frames `a` and `b` into `out`.
///
/// `out` must be exactly twice as wide as the inputs and equally tall. On
/// even rows `a` supplies the even output columns and `b` the odd ones;
/// odd rows swap the roles. No filtering is applied.
pub fn reconstruct(a: &RgbaImage, b: &RgbaImage, out: &mut RgbaImage) -> Result<()> {
    if a.dimensions() != b.dimensions() {
        return Err(Error::InvalidSize);
    }
    let (width, height) = a.dimensions();
    if out.width() != width * 2 || out.height() != height {
        return Err(Error::InvalidSize);
    }

    for y in 0..height {
        let (left, right) = if y % 2 == 0 { (a, b) } else { (b, a) };
        for x in 0..width {
            out.put_pixel(x * 2, y, *left.get_pixel(x, y));
            out.put_pixel(x * 2 + 1, y, *right.get_pixel(x, y));
        }
    }
    Ok(())
}
