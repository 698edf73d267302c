pub mod concurrency;
pub mod fluid_model;
pub mod neighborhood_search;
pub mod projective;
pub mod scene;
pub mod simulation_parameters;
pub mod sph_kernels;

pub type IT = i32;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::{FRAC_1_PI, PI};

    pub type AtomicFtBits = std::sync::atomic::AtomicU64;
    pub type FtBits = u64;
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::{FRAC_1_PI, PI};

    pub type AtomicFtBits = std::sync::atomic::AtomicU32;
    pub type FtBits = u32;
}

use floating_type_mod::FT;
use num_traits::Float;
use std::fmt::Display;

use nalgebra::SVector;

pub type V<FT, const D: usize> = SVector<FT, D>;

pub type VF<const D: usize> = V<FT, D>;
pub type VI<const D: usize> = V<IT, D>;

pub type V2 = V<FT, 2>;
pub type V3 = V<FT, 3>;

pub fn vec2f(x: FT, y: FT) -> V<FT, 2> {
    [x, y].into()
}

pub fn vec3f(x: FT, y: FT, z: FT) -> V<FT, 3> {
    [x, y, z].into()
}

pub fn is_ft_approx_eq<FT: Float>(a: FT, b: FT, tolerance: FT) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<FT: Float + Display>(a: FT, b: FT, tolerance: FT, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}

pub use fluid_model::*;
pub use projective::*;
pub use scene::*;
