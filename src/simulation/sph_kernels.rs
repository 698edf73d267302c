use crate::{
    floating_type_mod::{FT, PI},
    V2, V3, VF, VI,
};

/**
 * Cubic spline kernel on the normalized distance q = r / (2h), without the
 * dimension-dependent normalization factor.
 */
pub fn cubic_kernel_unnormalized(q: FT) -> FT {
    if q < 0.5 {
        return 6. * (q * q * q - q * q) + 1.;
    } else if q < 1. {
        let v = 1. - q;
        return 2. * (v * v * v);
    } else {
        return 0.;
    }
}

pub fn cubic_kernel_unnormalized_deriv(q: FT) -> FT {
    if q < 0.5 {
        return 18. * q * q - 12. * q;
    } else if q < 1. {
        let v = 1. - q;
        return -6. * v * v;
    } else {
        return 0.;
    };
}

/**
 * r is the distance to the center.
 * h is the smoothing length, the support radius is 2h.
 */
pub fn cubic_kernel_2d(r: FT, h: FT) -> FT {
    let norm_factor = 10. / (7. * PI * (h * h));
    return norm_factor * cubic_kernel_unnormalized(r / (2. * h));
}
pub fn cubic_kernel_3d(r: FT, h: FT) -> FT {
    let norm_factor = 1. / (PI * (h * h * h));
    return norm_factor * cubic_kernel_unnormalized(r / (2. * h));
}

/**
 * Calculate the derivative dW/dx where W=kernel(|x-y|/h) and x-y=diff.
 */
pub fn cubic_kernel_2d_deriv(mut diff: V2, h: FT) -> V2 {
    let r = diff.norm();
    let q: FT = r / (2. * h);
    if q <= 1.0e-5 {
        return V2::zeros();
    }
    diff.unscale_mut(r);

    let norm_factor = 10. / (7. * PI * (h * h));
    return norm_factor * cubic_kernel_unnormalized_deriv(q) / (2. * h) * diff;
}

/**
 * Calculate the derivative dW/dx where W=kernel(|x-y|/h) and x-y=diff.
 */
pub fn cubic_kernel_3d_deriv(mut diff: V3, h: FT) -> V3 {
    let r = diff.norm();
    let q: FT = r / (2. * h);
    if q <= 1.0e-5 {
        return V3::zeros();
    }
    diff.unscale_mut(r);

    let norm_factor = 1. / (PI * (h * h * h));
    return norm_factor * cubic_kernel_unnormalized_deriv(q) / (2. * h) * diff;
}

// Sync is needed since we use this trait inside parallel iterators
pub trait DimensionUtils<const D: usize>: Sync {
    fn iterate_grid_neighbors(dist: i32, f: impl FnMut(VI<D>));

    fn kernelh(diff: VF<D>, h: FT) -> FT;
    fn kernel_derivh(diff: VF<D>, h: FT) -> VF<D>;

    /// Kernel weight of a particle for itself (distance zero). The density
    /// estimate starts from this self contribution.
    fn kernel_zeroh(h: FT) -> FT;

    fn support_radius_by_smoothing_length() -> FT;
}

pub enum DimensionUtils2d {}
impl DimensionUtils<2> for DimensionUtils2d {
    fn iterate_grid_neighbors(dist: i32, mut f: impl FnMut(VI<2>)) {
        for y in -dist..=dist {
            for x in -dist..=dist {
                f([x, y].into());
            }
        }
    }

    fn kernelh(diff: VF<2>, h: FT) -> FT {
        cubic_kernel_2d(diff.norm(), h)
    }

    fn kernel_derivh(diff: VF<2>, h: FT) -> VF<2> {
        cubic_kernel_2d_deriv(diff, h)
    }

    fn kernel_zeroh(h: FT) -> FT {
        cubic_kernel_2d(0., h)
    }

    fn support_radius_by_smoothing_length() -> FT {
        2.
    }
}

pub enum DimensionUtils3d {}
impl DimensionUtils<3> for DimensionUtils3d {
    fn iterate_grid_neighbors(dist: i32, mut f: impl FnMut(VI<3>)) {
        for z in -dist..=dist {
            for y in -dist..=dist {
                for x in -dist..=dist {
                    f([x, y, z].into());
                }
            }
        }
    }

    fn kernelh(diff: VF<3>, h: FT) -> FT {
        cubic_kernel_3d(diff.norm(), h)
    }

    fn kernel_derivh(diff: VF<3>, h: FT) -> VF<3> {
        cubic_kernel_3d_deriv(diff, h)
    }

    fn kernel_zeroh(h: FT) -> FT {
        cubic_kernel_3d(0., h)
    }

    fn support_radius_by_smoothing_length() -> FT {
        2.
    }
}

#[test]
fn cubic_kernel_2d_integration_test() {
    use crate::vec2f;

    let h = 5.;
    let support_radius = 2.0 * h;
    let grid_size = 200;
    let square_len = 2. * support_radius / grid_size as FT;
    let square_area = square_len * square_len;

    let mut integral = 0.;

    for y in 0..grid_size {
        for x in 0..grid_size {
            let integration_point = vec2f(
                (x as FT + 0.5) * square_len - support_radius,
                (y as FT + 0.5) * square_len - support_radius,
            );
            integral += cubic_kernel_2d(integration_point.norm(), h) * square_area;
        }
    }

    let allow_deviation = 1.00001;
    println!("Integration of 2D cubic kernel with h={:.2}: {}", h, integral);
    assert!(1.0 / allow_deviation <= integral);
    assert!(integral <= allow_deviation / 1.0);
}

#[test]
fn cubic_kernel_3d_integration_test() {
    use crate::vec3f;

    let h = 2.;
    let support_radius = 2.0 * h;
    let grid_size = 60;
    let cube_len = 2. * support_radius / grid_size as FT;
    let cube_volume = cube_len * cube_len * cube_len;

    let mut integral = 0.;

    for z in 0..grid_size {
        for y in 0..grid_size {
            for x in 0..grid_size {
                let integration_point = vec3f(
                    (x as FT + 0.5) * cube_len - support_radius,
                    (y as FT + 0.5) * cube_len - support_radius,
                    (z as FT + 0.5) * cube_len - support_radius,
                );
                integral += cubic_kernel_3d(integration_point.norm(), h) * cube_volume;
            }
        }
    }

    let allow_deviation = 1.001;
    println!("Integration of 3D cubic kernel with h={:.2}: {}", h, integral);
    assert!(1.0 / allow_deviation <= integral);
    assert!(integral <= allow_deviation / 1.0);
}

#[test]
fn cubic_kernel_3d_derivative_test() {
    use crate::vec3f;

    let h = 5.;
    let support_radius = 2. * h;
    let test_grid_size = 20;
    let diff = support_radius * 1e-2;
    let diff_half = diff * 0.5;

    let probe_offset = 2. * support_radius / test_grid_size as FT;

    for z in 0..=test_grid_size {
        for y in 0..=test_grid_size {
            for x in 0..=test_grid_size {
                let probe_point = vec3f(
                    (x as FT + 0.5) * probe_offset - support_radius,
                    (y as FT + 0.5) * probe_offset - support_radius,
                    (z as FT + 0.5) * probe_offset - support_radius,
                );

                let analytical_deriv = cubic_kernel_3d_deriv(probe_point, h);

                let mut approx_deriv = V3::zeros();
                for d in 0..3 {
                    let mut offset = V3::zeros();
                    offset[d] = diff_half;
                    let neg: FT = cubic_kernel_3d((probe_point - offset).norm(), h);
                    let pos: FT = cubic_kernel_3d((probe_point + offset).norm(), h);
                    approx_deriv[d] = (pos - neg) / diff;
                }

                let absolute_error = analytical_deriv - approx_deriv;
                for d in 0..3 {
                    assert!(absolute_error[d].abs() < 0.001);
                }
            }
        }
    }
}

#[test]
fn kernel_zero_matches_kernel_at_origin() {
    let h = 0.025;
    crate::assert_ft_approx_eq(
        DimensionUtils3d::kernel_zeroh(h),
        DimensionUtils3d::kernelh(V3::zeros(), h),
        1e-3,
        || format!("w_zero"),
    );
    crate::assert_ft_approx_eq(
        DimensionUtils2d::kernel_zeroh(h),
        DimensionUtils2d::kernelh(V2::zeros(), h),
        1e-3,
        || format!("w_zero 2d"),
    );
}
