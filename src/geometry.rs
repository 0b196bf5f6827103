//! Metric tensors and element geometry.
//!
//! A per-vertex metric is a symmetric positive-definite matrix stored in
//! packed upper-triangular form:
//!
//! - 2D: `[m00, m01, m11]` (3 reals),
//! - 3D: `[m00, m01, m02, m11, m12, m22]` (6 reals).
//!
//! Lengths are measured as `sqrt(z' M z)`. Edge lengths under a pointwise
//! varying metric use the endpoint-averaged tensor, which makes
//! `edge_length(a, b) == edge_length(b, a)` hold to machine precision.
//!
//! The quality functional is the Lipnikov shape measure: 1 for the ideal
//! simplex in the metric-transformed space, decaying towards 0 for
//! badly-shaped elements and non-positive for inverted ones.

const EPS: f64 = 1e-12;

/// Number of packed metric entries for a given dimension.
#[inline]
pub fn metric_len(dim: usize) -> usize {
    dim * (dim + 1) / 2
}

/// `z' M z` for a packed 2D metric.
#[inline]
pub fn metric_inner_2d(m: &[f64], z: [f64; 2]) -> f64 {
    m[0] * z[0] * z[0] + 2.0 * m[1] * z[0] * z[1] + m[2] * z[1] * z[1]
}

/// `z' M z` for a packed 3D metric.
#[inline]
pub fn metric_inner_3d(m: &[f64], z: [f64; 3]) -> f64 {
    m[0] * z[0] * z[0]
        + m[3] * z[1] * z[1]
        + m[5] * z[2] * z[2]
        + 2.0 * (m[1] * z[0] * z[1] + m[2] * z[0] * z[2] + m[4] * z[1] * z[2])
}

/// Determinant of a packed 2D metric.
#[inline]
pub fn det_2d(m: &[f64]) -> f64 {
    m[0] * m[2] - m[1] * m[1]
}

/// Determinant of a packed 3D metric.
#[inline]
pub fn det_3d(m: &[f64]) -> f64 {
    m[0] * (m[3] * m[5] - m[4] * m[4]) - m[1] * (m[1] * m[5] - m[4] * m[2])
        + m[2] * (m[1] * m[4] - m[3] * m[2])
}

/// Check that a packed metric is symmetric positive-definite, by leading
/// principal minors.
pub fn is_spd(dim: usize, m: &[f64]) -> bool {
    match dim {
        2 => m[0] > 0.0 && det_2d(m) > 0.0,
        3 => m[0] > 0.0 && (m[0] * m[3] - m[1] * m[1]) > 0.0 && det_3d(m) > 0.0,
        _ => false,
    }
}

/// Linear interpolation between two packed metrics: `ma + w * (mb - ma)`.
///
/// Writes into `out`, which must have `metric_len(dim)` entries.
pub fn interpolate_metric(ma: &[f64], mb: &[f64], w: f64, out: &mut [f64]) {
    for ((o, &a), &b) in out.iter_mut().zip(ma).zip(mb) {
        *o = a + w * (b - a);
    }
}

/// Length of the segment `(xa, xb)` under a single packed metric.
pub fn edge_length_single(dim: usize, xa: &[f64], xb: &[f64], m: &[f64]) -> f64 {
    let q = match dim {
        2 => metric_inner_2d(m, [xb[0] - xa[0], xb[1] - xa[1]]),
        _ => metric_inner_3d(m, [xb[0] - xa[0], xb[1] - xa[1], xb[2] - xa[2]]),
    };
    q.max(0.0).sqrt()
}

/// Length of the edge `(xa, xb)` under the endpoint-averaged metric.
///
/// Symmetric under endpoint swap by construction.
pub fn edge_length(dim: usize, xa: &[f64], xb: &[f64], ma: &[f64], mb: &[f64]) -> f64 {
    let q = match dim {
        2 => {
            let mbar = [
                0.5 * (ma[0] + mb[0]),
                0.5 * (ma[1] + mb[1]),
                0.5 * (ma[2] + mb[2]),
            ];
            metric_inner_2d(&mbar, [xb[0] - xa[0], xb[1] - xa[1]])
        }
        _ => {
            let mut mbar = [0.0; 6];
            for i in 0..6 {
                mbar[i] = 0.5 * (ma[i] + mb[i]);
            }
            metric_inner_3d(&mbar, [xb[0] - xa[0], xb[1] - xa[1], xb[2] - xa[2]])
        }
    };
    q.max(0.0).sqrt()
}

/// Signed area of the triangle `(x0, x1, x2)`, positive for counter-clockwise
/// orientation.
#[inline]
pub fn area(x0: &[f64], x1: &[f64], x2: &[f64]) -> f64 {
    0.5 * ((x1[0] - x0[0]) * (x2[1] - x0[1]) - (x1[1] - x0[1]) * (x2[0] - x0[0]))
}

/// Signed volume of the tetrahedron `(x0, x1, x2, x3)`, positive for a
/// right-handed vertex ordering.
#[inline]
pub fn volume(x0: &[f64], x1: &[f64], x2: &[f64], x3: &[f64]) -> f64 {
    let a = [x1[0] - x0[0], x1[1] - x0[1], x1[2] - x0[2]];
    let b = [x2[0] - x0[0], x2[1] - x0[1], x2[2] - x0[2]];
    let c = [x3[0] - x0[0], x3[1] - x0[1], x3[2] - x0[2]];
    (a[0] * (b[1] * c[2] - b[2] * c[1]) - a[1] * (b[0] * c[2] - b[2] * c[0])
        + a[2] * (b[0] * c[1] - b[1] * c[0]))
        / 6.0
}

/// Lipnikov shape quality of a triangle under the vertex-averaged metric.
///
/// Equal to 1 for the equilateral triangle of unit metric edge length,
/// in (0, 1) otherwise, non-positive when the triangle is inverted, and 0
/// when the triangle is degenerate.
pub fn lipnikov_2d(x: [&[f64]; 3], m: [&[f64]; 3]) -> f64 {
    let mbar = [
        (m[0][0] + m[1][0] + m[2][0]) / 3.0,
        (m[0][1] + m[1][1] + m[2][1]) / 3.0,
        (m[0][2] + m[1][2] + m[2][2]) / 3.0,
    ];

    // Perimeter in metric space.
    let l = edge_length_single(2, x[0], x[1], &mbar)
        + edge_length_single(2, x[0], x[2], &mbar)
        + edge_length_single(2, x[1], x[2], &mbar);
    if l < EPS {
        return 0.0;
    }

    let a = area(x[0], x[1], x[2]);
    let f = (l / 3.0).min(3.0 / l);
    let tf = f * (2.0 - f);
    let ff = tf * tf * tf;

    12.0 * 3.0_f64.sqrt() * a * det_2d(&mbar).max(0.0).sqrt() * ff / (l * l)
}

/// Lipnikov shape quality of a tetrahedron under the vertex-averaged metric.
///
/// Normalised so the regular tetrahedron of unit metric edge length scores 1.
pub fn lipnikov_3d(x: [&[f64]; 4], m: [&[f64]; 4]) -> f64 {
    let mut mbar = [0.0; 6];
    for i in 0..6 {
        mbar[i] = (m[0][i] + m[1][i] + m[2][i] + m[3][i]) / 4.0;
    }

    // Sum of the six edge lengths in metric space.
    let l = edge_length_single(3, x[0], x[1], &mbar)
        + edge_length_single(3, x[0], x[2], &mbar)
        + edge_length_single(3, x[0], x[3], &mbar)
        + edge_length_single(3, x[1], x[2], &mbar)
        + edge_length_single(3, x[1], x[3], &mbar)
        + edge_length_single(3, x[2], x[3], &mbar);
    if l < EPS {
        return 0.0;
    }

    let v = volume(x[0], x[1], x[2], x[3]);
    let f = (l / 6.0).min(6.0 / l);
    let tf = f * (2.0 - f);
    let ff = tf * tf * tf;

    // 6^4 * sqrt(2) normalises the regular tetrahedron to quality 1.
    1296.0 * 2.0_f64.sqrt() * v * det_3d(&mbar).max(0.0).sqrt() * ff / (l * l * l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ID2: [f64; 3] = [1.0, 0.0, 1.0];
    const ID3: [f64; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 1.0];

    #[test]
    fn edge_length_is_symmetric() {
        let xa = [0.3, -1.2];
        let xb = [2.0, 0.7];
        let ma = [2.0, 0.3, 1.5];
        let mb = [0.8, -0.1, 3.0];
        let ab = edge_length(2, &xa, &xb, &ma, &mb);
        let ba = edge_length(2, &xb, &xa, &mb, &ma);
        assert_eq!(ab, ba);
    }

    #[test]
    fn identity_metric_recovers_euclidean_length() {
        let l = edge_length(2, &[0.0, 0.0], &[3.0, 4.0], &ID2, &ID2);
        assert_relative_eq!(l, 5.0, epsilon = 1e-14);
    }

    #[test]
    fn anisotropic_metric_stretches_length() {
        // Metric with eigenvalue 100 along x: unit x-edge measures 10.
        let m = [100.0, 0.0, 1.0];
        let l = edge_length(2, &[0.0, 0.0], &[1.0, 0.0], &m, &m);
        assert_relative_eq!(l, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn equilateral_triangle_has_unit_quality() {
        let x0 = [0.0, 0.0];
        let x1 = [1.0, 0.0];
        let x2 = [0.5, 3.0_f64.sqrt() / 2.0];
        let q = lipnikov_2d([&x0, &x1, &x2], [&ID2, &ID2, &ID2]);
        assert_relative_eq!(q, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn inverted_triangle_has_nonpositive_quality() {
        let x0 = [0.0, 0.0];
        let x1 = [1.0, 0.0];
        let x2 = [0.5, 3.0_f64.sqrt() / 2.0];
        // Swapping two vertices flips the orientation.
        let q = lipnikov_2d([&x1, &x0, &x2], [&ID2, &ID2, &ID2]);
        assert!(q <= 0.0);
    }

    #[test]
    fn quality_is_scale_sensitive() {
        // A triangle far from unit metric size scores below one.
        let x0 = [0.0, 0.0];
        let x1 = [10.0, 0.0];
        let x2 = [5.0, 10.0 * 3.0_f64.sqrt() / 2.0];
        let q = lipnikov_2d([&x0, &x1, &x2], [&ID2, &ID2, &ID2]);
        assert!(q > 0.0 && q < 0.2, "q = {q}");
    }

    #[test]
    fn regular_tetrahedron_has_unit_quality() {
        // Regular tetrahedron with unit edge length.
        let s = 0.5;
        let x0 = [s, 0.0, -s / 2.0_f64.sqrt()];
        let x1 = [-s, 0.0, -s / 2.0_f64.sqrt()];
        let x2 = [0.0, -s, s / 2.0_f64.sqrt()];
        let x3 = [0.0, s, s / 2.0_f64.sqrt()];
        let q = lipnikov_3d([&x0, &x1, &x2, &x3], [&ID3, &ID3, &ID3, &ID3]);
        assert!(q > 0.0);
        assert_relative_eq!(q, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn spd_checks() {
        assert!(is_spd(2, &[1.0, 0.0, 1.0]));
        assert!(!is_spd(2, &[1.0, 2.0, 1.0]));
        assert!(is_spd(3, &ID3));
        assert!(!is_spd(3, &[1.0, 0.0, 0.0, 1.0, 0.0, -1.0]));
    }

    #[test]
    fn metric_interpolation_endpoints() {
        let ma = [2.0, 0.5, 1.0];
        let mb = [4.0, -0.5, 3.0];
        let mut out = [0.0; 3];
        interpolate_metric(&ma, &mb, 0.0, &mut out);
        assert_eq!(out, ma);
        interpolate_metric(&ma, &mb, 1.0, &mut out);
        assert_eq!(out, mb);
    }
}
