//! Face alignment to the canonical ArcFace crop.
//!
//! Fits a 4-DOF similarity transform (scale, rotation, translation) from the
//! five detected landmarks to the InsightFace reference positions and warps
//! the face into a 112×112 RGB crop.

/// Side of the aligned crop.
pub const ALIGNED_SIZE: usize = 112;

const CHANNELS: usize = 3;

/// InsightFace reference landmarks for a 112×112 crop.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    const IDENTITY: Similarity = Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares fit over point pairs.
    ///
    /// Each pair contributes two rows to an overdetermined system in
    /// (a, b, tx, ty); the normal equations are solved directly.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            for (row, rhs) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atb[j] += row[j] * rhs;
                }
            }
        }

        match solve4(ata, atb) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self::IDENTITY,
        }
    }

    /// Map a destination pixel back into the source image.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Gaussian elimination with partial pivoting. `None` for a singular system.
#[allow(clippy::needless_range_loop)]
fn solve4(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| {
            m[i][col]
                .abs()
                .partial_cmp(&m[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample of one channel of packed RGB24; out-of-bounds reads as black.
fn sample(rgb: &[u8], width: usize, height: usize, channel: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let px = |px: i64, py: i64| -> f32 {
        if px >= 0 && py >= 0 && (px as usize) < width && (py as usize) < height {
            rgb.get((py as usize * width + px as usize) * CHANNELS + channel)
                .copied()
                .unwrap_or(0) as f32
        } else {
            0.0
        }
    };
    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy
}

/// Warp the face described by `landmarks` into a 112×112 packed RGB24 crop.
pub fn align_face(rgb: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS);
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * CHANNELS];

    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            let Some((sx, sy)) = transform.invert_point(ox as f32, oy as f32) else {
                continue;
            };
            let base = (oy * ALIGNED_SIZE + ox) * CHANNELS;
            for c in 0..CHANNELS {
                out[base + c] = sample(rgb, w, h, c, sx, sy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}
