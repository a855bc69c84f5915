//! Face alignment to the canonical ArcFace 112×112 crop.
//!
//! A 4-DOF similarity (scale, rotation, translation) is fit from the five
//! detected landmarks to the InsightFace reference points in closed form,
//! then the RGB frame is warped with bilinear sampling.

use image::{Rgb, RgbImage};

const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// `dst = [a -b; b a] * src + [tx; ty]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / 5.0, sy / 5.0)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }

        // Degenerate landmarks (all at one point): fall back to a pure translation.
        let (a, b) = if norm > f32::EPSILON {
            (dot / norm, cross / norm)
        } else {
            (1.0, 0.0)
        };

        Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse mapping, or `None` if the transform collapses the plane.
    pub fn invert(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det <= f32::EPSILON {
            return None;
        }
        let (ux, uy) = (x - self.tx, y - self.ty);
        Some(((self.a * ux + self.b * uy) / det, (self.a * uy - self.b * ux) / det))
    }
}

/// Warp the face described by `landmarks` into a 112×112 aligned crop.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        transform
            .invert((ox as f32, oy as f32))
            .map(|(sx, sy)| sample_bilinear(frame, sx, sy))
            .unwrap_or(Rgb([0, 0, 0]))
    })
}

/// Bilinear sample; pixels outside the frame read as black.
fn sample_bilinear(frame: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let texel = |px: i64, py: i64, c: usize| -> f32 {
        if px >= 0 && px < w && py >= 0 && py < h {
            frame.get_pixel(px as u32, py as u32)[c] as f32
        } else {
            0.0
        }
    };

    let mut out = [0u8; 3];
    for (c, v) in out.iter_mut().enumerate() {
        let top = texel(x0, y0, c) * (1.0 - fx) + texel(x0 + 1, y0, c) * fx;
        let bottom = texel(x0, y0 + 1, c) * (1.0 - fx) + texel(x0 + 1, y0 + 1, c) * fx;
        *v = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_fit() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_recovers_scale_and_translation() {
        // Source landmarks are the reference scaled ×2 and shifted by (100, 50).
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 100.0, y * 2.0 + 50.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 0.5).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            let (x, y) = t.apply(*s);
            assert!((x - d.0).abs() < 1e-2 && (y - d.1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_recovers_rotation() {
        // 90° rotation: (x, y) -> (-y, x)
        let src = REFERENCE_LANDMARKS_112;
        let dst = src.map(|(x, y)| (-y, x));
        let t = Similarity::estimate(&src, &dst);
        assert!(t.a.abs() < 1e-4);
        assert!((t.b - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_invert_round_trip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 5.0, ty: -2.0 };
        let p = (12.5, 40.0);
        let back = t.invert(t.apply(p)).unwrap();
        assert!((back.0 - p.0).abs() < 1e-4 && (back.1 - p.1).abs() < 1e-4);
    }

    #[test]
    fn test_invert_degenerate() {
        let t = Similarity { a: 0.0, b: 0.0, tx: 0.0, ty: 0.0 };
        assert!(t.invert((1.0, 1.0)).is_none());
    }

    #[test]
    fn test_align_uniform_frame() {
        let frame = RgbImage::from_pixel(400, 400, Rgb([90, 120, 150]));
        let landmarks = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 50.0, y * 2.0 + 50.0));
        let aligned = align_face(&frame, &landmarks);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(*aligned.get_pixel(56, 56), Rgb([90, 120, 150]));
    }

    #[test]
    fn test_out_of_frame_is_black() {
        let frame = RgbImage::from_pixel(10, 10, Rgb([255, 255, 255]));
        assert_eq!(sample_bilinear(&frame, -5.0, -5.0), Rgb([0, 0, 0]));
    }
}
