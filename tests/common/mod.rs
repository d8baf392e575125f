//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use posepipe::Transformation;

/// Frame time used by the scheduling tests
pub const DT: f32 = 1.0 / 60.0;

/// Translation-only transform along x
pub fn at(x: f32) -> Transformation {
    Transformation::from_position([x, 0.0, 0.0])
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f32, b: f32, epsilon: f32) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
