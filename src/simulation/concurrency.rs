use crate::floating_type_mod::{AtomicFtBits, FT};
use crate::VF;

use rayon::prelude::*;
use std::sync::atomic::Ordering;

pub fn par_iter_mut0<F: Fn(usize) + Send + Sync>(n: usize, f: F) {
    (0..n).into_par_iter().for_each(|idx| {
        f(idx);
    });
}

pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
    arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
        f(idx, v1);
    });
}

pub fn par_iter_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
    arr1: &mut [T1],
    arr2: &mut [T2],
    f: F,
) {
    arr1.into_par_iter()
        .zip(arr2.into_par_iter())
        .enumerate()
        .for_each(|(idx, (v1, v2))| {
            f(idx, v1, v2);
        });
}

pub fn par_iter_mut3<
    T1: Send + Sync,
    T2: Send + Sync,
    T3: Send + Sync,
    F: Fn(usize, &mut T1, &mut T2, &mut T3) + Send + Sync,
>(
    arr1: &mut [T1],
    arr2: &mut [T2],
    arr3: &mut [T3],
    f: F,
) {
    arr1.into_par_iter()
        .zip(arr2.into_par_iter())
        .zip(arr3.into_par_iter())
        .enumerate()
        .for_each(|(idx, ((v1, v2), v3))| {
            f(idx, v1, v2, v3);
        });
}

pub fn par_dot<const D: usize>(a: &[VF<D>], b: &[VF<D>]) -> FT {
    assert!(a.len() == b.len());
    a.par_iter().zip(b.par_iter()).map(|(x, y)| x.dot(y)).sum()
}

pub fn par_norm_squared<const D: usize>(a: &[VF<D>]) -> FT {
    a.par_iter().map(|x| x.norm_squared()).sum()
}

/**
 * Accumulation buffer for D components per particle that can be written
 * concurrently from multiple worker threads.
 *
 * Both the matrix-free operator and the right-hand-side construction scatter
 * contributions into neighbor slots, so a slot may be targeted by many
 * particles of the same parallel stage at once. Additions are performed with
 * a compare-and-swap retry loop over the bit pattern of `FT` (associative and
 * commutative up to floating-point rounding; the arrival order of concurrent
 * writers is irrelevant).
 */
pub struct AtomicAccumulator<const D: usize> {
    data: Vec<AtomicFtBits>,
}

impl<const D: usize> AtomicAccumulator<D> {
    pub fn zeroed(num_particles: usize) -> Self {
        AtomicAccumulator {
            data: (0..num_particles * D)
                .map(|_| AtomicFtBits::new((0. as FT).to_bits()))
                .collect(),
        }
    }

    pub fn add(&self, i: usize, v: VF<D>) {
        for d in 0..D {
            add_to_atomic_ft(&self.data[D * i + d], v[d]);
        }
    }

    pub fn get(&self, i: usize) -> VF<D> {
        VF::<D>::from_iterator((0..D).map(|d| FT::from_bits(self.data[D * i + d].load(Ordering::Relaxed))))
    }
}

fn add_to_atomic_ft(a: &AtomicFtBits, r: FT) {
    let mut current = a.load(Ordering::Relaxed);
    loop {
        let next = (FT::from_bits(current) + r).to_bits();
        match a.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

#[test]
fn atomic_accumulator_concurrent_sum_test() {
    use crate::vec3f;

    let num_particles = 64;
    let additions_per_particle = 100;

    let acc = AtomicAccumulator::<3>::zeroed(num_particles);

    // every particle slot is hit by many parallel writers
    par_iter_mut0(num_particles * additions_per_particle, |k| {
        let i = k % num_particles;
        acc.add(i, vec3f(1., 2., -1.));
    });

    for i in 0..num_particles {
        let v = acc.get(i);
        let n = additions_per_particle as FT;
        crate::assert_ft_approx_eq(v.x, n, n * 1e-5, || format!("acc[{}].x", i));
        crate::assert_ft_approx_eq(v.y, 2. * n, n * 1e-5, || format!("acc[{}].y", i));
        crate::assert_ft_approx_eq(v.z, -n, n * 1e-5, || format!("acc[{}].z", i));
    }
}
