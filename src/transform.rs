//! Pose value carried through the transform pipes.
//!
//! A `Transformation` is position + orientation + scale + scale orientation.
//! Its matrix form is `T * R * SOᵀ * S * SO` (row-major, column vectors), so
//! converting a matrix back is not unique: the decomposition below always
//! yields an identity scale orientation.

use serde::{Deserialize, Serialize};

/// Row-major 4x4 matrix, `m[row][col]`.
pub type Matrix4 = [[f32; 4]; 4];

type Matrix3 = [[f32; 3]; 3];

/// Identity quaternion `[x, y, z, w]`.
pub const QUAT_IDENTITY: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Default tolerance for `approx_eq`.
pub const DEFAULT_EPSILON: f32 = 1e-4;

/// A pose: position, orientation and (possibly non-uniform) scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    #[serde(default)]
    pub position: [f32; 3],
    /// Quaternion `[x, y, z, w]`.
    #[serde(default = "default_quat")]
    pub orientation: [f32; 4],
    #[serde(default = "default_scale")]
    pub scale: [f32; 3],
    /// Orientation of the scale axes, quaternion `[x, y, z, w]`.
    #[serde(default = "default_quat")]
    pub scale_orientation: [f32; 4],
}

fn default_quat() -> [f32; 4] {
    QUAT_IDENTITY
}

fn default_scale() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

impl Default for Transformation {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transformation {
    pub const fn identity() -> Self {
        Self {
            position: [0.0; 3],
            orientation: QUAT_IDENTITY,
            scale: [1.0; 3],
            scale_orientation: QUAT_IDENTITY,
        }
    }

    /// Rigid transform with unit scale.
    pub fn new(position: [f32; 3], orientation: [f32; 4]) -> Self {
        Self {
            position,
            orientation,
            ..Self::identity()
        }
    }

    pub fn from_position(position: [f32; 3]) -> Self {
        Self::new(position, QUAT_IDENTITY)
    }

    pub fn with_scale(mut self, scale: [f32; 3]) -> Self {
        self.scale = scale;
        self
    }

    /// Quaternion for a rotation of `angle` radians about `axis`.
    pub fn axis_angle(axis: [f32; 3], angle: f32) -> [f32; 4] {
        let len = (axis[0] * axis[0] + axis[1] * axis[1] + axis[2] * axis[2]).sqrt();
        if len <= f32::EPSILON {
            return QUAT_IDENTITY;
        }
        let (s, c) = (angle * 0.5).sin_cos();
        [axis[0] / len * s, axis[1] / len * s, axis[2] / len * s, c]
    }

    /// True when the scale is exactly `(1, 1, 1)`; such values skip the
    /// scale fields on the wire.
    pub fn has_identity_scale(&self) -> bool {
        self.scale == [1.0, 1.0, 1.0]
    }

    pub fn to_matrix(&self) -> Matrix4 {
        let rot = quat_to_mat3(normalize_quat(self.orientation));
        let scale_rot = quat_to_mat3(normalize_quat(self.scale_orientation));
        let s = self.scale;
        let scale = [[s[0], 0.0, 0.0], [0.0, s[1], 0.0], [0.0, 0.0, s[2]]];

        let linear = mat3_mul(
            &mat3_mul(&mat3_mul(&rot, &transpose3(&scale_rot)), &scale),
            &scale_rot,
        );

        let mut m = [[0.0; 4]; 4];
        for r in 0..3 {
            m[r][..3].copy_from_slice(&linear[r]);
            m[r][3] = self.position[r];
        }
        m[3][3] = 1.0;
        m
    }

    /// Decompose an affine matrix into translation, rotation and scale.
    ///
    /// Columns of the linear part are Gram-Schmidt orthonormalised so that
    /// averaged (non-orthogonal) matrices still produce a valid rotation.
    pub fn from_matrix(m: &Matrix4) -> Self {
        let position = [m[0][3], m[1][3], m[2][3]];

        let mut cols = [[0.0f32; 3]; 3];
        for (c, col) in cols.iter_mut().enumerate() {
            *col = [m[0][c], m[1][c], m[2][c]];
        }

        let mut scale = [length(cols[0]), length(cols[1]), length(cols[2])];

        let x = normalize3(cols[0]);
        let y = normalize3(sub3(cols[1], mul3(x, dot3(x, cols[1]))));
        let mut z = cross3(x, y);
        if dot3(z, cols[2]) < 0.0 {
            // reflection: fold the sign into the z scale
            scale[2] = -scale[2];
        }
        if length(z) <= f32::EPSILON {
            z = [0.0, 0.0, 1.0];
        }

        let rot = [[x[0], y[0], z[0]], [x[1], y[1], z[1]], [x[2], y[2], z[2]]];

        Self {
            position,
            orientation: mat3_to_quat(&rot),
            scale,
            scale_orientation: QUAT_IDENTITY,
        }
    }

    /// Composition `self * other`: `other` is applied first.
    pub fn multiply(&self, other: &Transformation) -> Transformation {
        Self::from_matrix(&mat4_mul(&self.to_matrix(), &other.to_matrix()))
    }

    /// Arithmetic mean of the matrix forms of `values`.
    ///
    /// Returns the identity for an empty slice.
    pub fn mean(values: &[Transformation]) -> Transformation {
        if values.is_empty() {
            return Self::identity();
        }

        let mut sum = [[0.0f32; 4]; 4];
        for value in values {
            let m = value.to_matrix();
            for r in 0..4 {
                for c in 0..4 {
                    sum[r][c] += m[r][c];
                }
            }
        }

        let inv = 1.0 / values.len() as f32;
        for row in sum.iter_mut() {
            for v in row.iter_mut() {
                *v *= inv;
            }
        }
        Self::from_matrix(&sum)
    }

    /// Compare as matrices, so `q` and `-q` orientations are equal.
    pub fn approx_eq(&self, other: &Transformation, epsilon: f32) -> bool {
        let a = self.to_matrix();
        let b = other.to_matrix();
        a.iter()
            .flatten()
            .zip(b.iter().flatten())
            .all(|(x, y)| (x - y).abs() <= epsilon)
    }
}

fn quat_to_mat3(q: [f32; 4]) -> Matrix3 {
    let [x, y, z, w] = q;
    [
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
        ],
        [
            2.0 * (x * y + w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - w * x),
        ],
        [
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            1.0 - 2.0 * (x * x + y * y),
        ],
    ]
}

fn mat3_to_quat(m: &Matrix3) -> [f32; 4] {
    let trace = m[0][0] + m[1][1] + m[2][2];
    let q = if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0;
        [
            (m[2][1] - m[1][2]) / s,
            (m[0][2] - m[2][0]) / s,
            (m[1][0] - m[0][1]) / s,
            0.25 * s,
        ]
    } else if m[0][0] > m[1][1] && m[0][0] > m[2][2] {
        let s = (1.0 + m[0][0] - m[1][1] - m[2][2]).sqrt() * 2.0;
        [
            0.25 * s,
            (m[0][1] + m[1][0]) / s,
            (m[0][2] + m[2][0]) / s,
            (m[2][1] - m[1][2]) / s,
        ]
    } else if m[1][1] > m[2][2] {
        let s = (1.0 + m[1][1] - m[0][0] - m[2][2]).sqrt() * 2.0;
        [
            (m[0][1] + m[1][0]) / s,
            0.25 * s,
            (m[1][2] + m[2][1]) / s,
            (m[0][2] - m[2][0]) / s,
        ]
    } else {
        let s = (1.0 + m[2][2] - m[0][0] - m[1][1]).sqrt() * 2.0;
        [
            (m[0][2] + m[2][0]) / s,
            (m[1][2] + m[2][1]) / s,
            0.25 * s,
            (m[1][0] - m[0][1]) / s,
        ]
    };
    normalize_quat(q)
}

fn normalize_quat(q: [f32; 4]) -> [f32; 4] {
    let len = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    if len <= f32::EPSILON {
        QUAT_IDENTITY
    } else {
        [q[0] / len, q[1] / len, q[2] / len, q[3] / len]
    }
}

fn mat3_mul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for r in 0..3 {
        for c in 0..3 {
            out[r][c] = (0..3).map(|k| a[r][k] * b[k][c]).sum();
        }
    }
    out
}

fn mat4_mul(a: &Matrix4, b: &Matrix4) -> Matrix4 {
    let mut out = [[0.0; 4]; 4];
    for r in 0..4 {
        for c in 0..4 {
            out[r][c] = (0..4).map(|k| a[r][k] * b[k][c]).sum();
        }
    }
    out
}

fn transpose3(m: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for r in 0..3 {
        for c in 0..3 {
            out[c][r] = m[r][c];
        }
    }
    out
}

fn dot3(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross3(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn sub3(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn mul3(a: [f32; 3], s: f32) -> [f32; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn length(a: [f32; 3]) -> f32 {
    dot3(a, a).sqrt()
}

fn normalize3(a: [f32; 3]) -> [f32; 3] {
    let len = length(a);
    if len <= f32::EPSILON {
        [0.0; 3]
    } else {
        mul3(a, 1.0 / len)
    }
}
