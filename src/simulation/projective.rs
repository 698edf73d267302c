use std::marker::PhantomData;

use nalgebra::zero;

use crate::{
    concurrency::{par_dot, par_iter_mut0, par_iter_mut1, par_iter_mut2, par_iter_mut3, par_norm_squared, AtomicAccumulator},
    fluid_model::{FluidModel, ParticleVec},
    floating_type_mod::FT,
    neighborhood_search::{spatial_sort_order, NeighborId, FLUID_POINT_SET},
    simulation_parameters::SimulationParams,
    sph_kernels::DimensionUtils,
    VF,
};

/// The residual is recomputed exactly from scratch every this many CG
/// iterations to counter accumulated floating-point drift of the cheap
/// incremental update.
const CG_RESTART_ITERATIONS: usize = 50;

/// Bounds of the local density-constraint projection.
const PROJECTION_MAX_STEPS: usize = 100;
const PROJECTION_C_GOAL: FT = 1e-14;
const PROJECTION_REGULARIZATION: FT = 1e-6;

/// The particle storage is reordered for memory locality every this many steps.
const RESORT_INTERVAL: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgSolveState {
    AlreadySolved,
    Converged,
    MaxIterReached,
}

/**
 * Per-particle solver scratch, kept alive across steps. All arrays are
 * resized to the current particle count before a step runs and are reordered
 * in lock-step with the particle container on resort.
 */
pub struct SimulationState<const D: usize> {
    /// Position at the start of the current step.
    pub old_position: Vec<VF<D>>,

    /// The unconstrained inertial guess "s", target of the momentum term.
    pub predicted_position: Vec<VF<D>>,

    /// The CG unknown vector (D reals per particle).
    pub x: Vec<VF<D>>,

    /// Number of fluid neighbors plus one (self). Used as a per-particle
    /// step-size scale in the local projection.
    pub num_fluid_neighbors: Vec<u32>,
}

impl<const D: usize> SimulationState<D> {
    pub fn new(num_particles: usize) -> Self {
        SimulationState {
            old_position: vec![zero(); num_particles],
            predicted_position: vec![zero(); num_particles],
            x: vec![zero(); num_particles],
            num_fluid_neighbors: vec![1; num_particles],
        }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn resize(&mut self, num_particles: usize) {
        self.old_position.resize(num_particles, zero());
        self.predicted_position.resize(num_particles, zero());
        self.x.resize(num_particles, zero());
        self.num_fluid_neighbors.resize(num_particles, 1);
    }

    pub fn clear(&mut self) {
        let num_particles = self.len();
        *self = SimulationState::new(num_particles);
    }

    /// Apply the same permutation the particle container was reordered with.
    pub fn reorder(&mut self, order: &[usize]) {
        assert!(order.len() == self.len());
        self.old_position = order.iter().map(|&src| self.old_position[src]).collect();
        self.predicted_position = order.iter().map(|&src| self.predicted_position[src]).collect();
        self.x = order.iter().map(|&src| self.x[src]).collect();
        self.num_fluid_neighbors = order.iter().map(|&src| self.num_fluid_neighbors[src]).collect();
    }
}

/// Diagnostics of the implicit solve of one step.
#[derive(Debug, Clone, Default)]
pub struct SolveStatistics {
    pub pd_iterations: usize,
    pub cg_iterations: usize,
    pub final_state: Option<CgSolveState>,

    /// Squared residual norm after every CG iteration of the last inner solve.
    pub residual_history: Vec<FT>,
}

struct CgRun {
    state: CgSolveState,
    iterations: usize,
    residual_history: Vec<FT>,
}

/**
 * Advances a fluid model in time with the Projective Fluids implicit solver:
 * particle positions are found by minimizing a quadratic energy trading off
 * inertial drift against incompressibility. The linear system is never
 * assembled; the conjugate-gradient iteration only needs the effect of the
 * system matrix on a vector and a right-hand side built from local
 * density-constraint projections.
 */
pub struct TimeStepProjective<DU: DimensionUtils<D>, const D: usize> {
    pub state: SimulationState<D>,
    pub time: FT,
    pub last_solve: SolveStatistics,

    step_counter: u32,

    _marker: PhantomData<DU>,
}

impl<DU: DimensionUtils<D>, const D: usize> TimeStepProjective<DU, D> {
    pub fn new(num_particles: usize) -> Self {
        TimeStepProjective {
            state: SimulationState::new(num_particles),
            time: 0.,
            last_solve: SolveStatistics::default(),
            step_counter: 0,
            _marker: PhantomData,
        }
    }

    /// Advance the simulation by one time step of size `simulation_params.dt`.
    pub fn step(&mut self, model: &mut FluidModel<DU, D>, simulation_params: SimulationParams) {
        let dt = simulation_params.dt;
        let num_particles = model.num_fluid_particles();
        self.state.resize(num_particles);

        Self::clear_accelerations(&mut model.particles.acceleration, simulation_params);
        Self::initial_guess_for_positions(&mut self.state, &mut model.particles, dt);
        self.perform_neighborhood_search(model, simulation_params);

        self.last_solve = Self::solve_pd_constraints(&mut self.state, model, simulation_params);

        Self::compute_densities(model, simulation_params);
        Self::compute_viscosity(model, simulation_params);
        Self::add_acceleration_to_velocity(&mut model.particles, dt);

        self.time += dt;
        self.step_counter += 1;
    }

    /// Zero the step counter and wipe the solver scratch. Must only be called
    /// between steps.
    pub fn reset(&mut self) {
        self.step_counter = 0;
        self.time = 0.;
        self.last_solve = SolveStatistics::default();
        self.state.clear();
    }

    /// Accelerations start every step from gravity; secondary forces add onto
    /// this after the implicit solve.
    fn clear_accelerations(acceleration: &mut [VF<D>], simulation_params: SimulationParams) {
        let gravity = simulation_params.gravity_vector::<D>();
        par_iter_mut1(acceleration, |_i, p_acceleration| {
            *p_acceleration = gravity;
        });
    }

    /// Explicit symplectic-Euler prediction, independent for every particle.
    fn initial_guess_for_positions(state: &mut SimulationState<D>, particles: &mut ParticleVec<D>, dt: FT) {
        let ParticleVec {
            position,
            velocity,
            acceleration,
            ..
        } = particles;
        let velocity: &[VF<D>] = velocity;
        let acceleration: &[VF<D>] = acceleration;

        par_iter_mut3(
            &mut state.old_position,
            &mut state.predicted_position,
            position,
            |i, p_old_position, p_predicted_position, p_position| {
                *p_old_position = *p_position;
                let new_pos = *p_position + dt * velocity[i] + (dt * dt) * acceleration[i];
                *p_position = new_pos;
                *p_predicted_position = new_pos;
            },
        );
    }

    fn perform_neighborhood_search(&mut self, model: &mut FluidModel<DU, D>, simulation_params: SimulationParams) {
        if self.step_counter % RESORT_INTERVAL == 0 {
            let support_radius = simulation_params.h * DU::support_radius_by_smoothing_length();
            let order = spatial_sort_order(&model.particles.position, support_radius);
            model.reorder(&order);
            self.state.reorder(&order);
        }

        model.perform_neighborhood_search(simulation_params);
    }

    fn solve_pd_constraints(
        state: &mut SimulationState<D>,
        model: &mut FluidModel<DU, D>,
        simulation_params: SimulationParams,
    ) -> SolveStatistics {
        Self::prepare_solve(state, model);

        let mut statistics = SolveStatistics::default();
        for _pd_it in 0..simulation_params.max_pd_iterations {
            let run = Self::cg_solve(state, model, simulation_params);

            statistics.pd_iterations += 1;
            statistics.cg_iterations += run.iterations;
            statistics.final_state = Some(run.state);
            statistics.residual_history = run.residual_history;

            if run.state == CgSolveState::AlreadySolved {
                break;
            }
        }

        Self::update_positions_and_velocity(state, &mut model.particles, simulation_params.dt);

        statistics
    }

    /// Initialize the unknown vector from the current (predicted) positions
    /// and count fluid neighbors (plus self) for the projection damping.
    fn prepare_solve(state: &mut SimulationState<D>, model: &FluidModel<DU, D>) {
        let position: &[VF<D>] = &model.particles.position;
        let neighs = &model.neighs;

        par_iter_mut2(
            &mut state.x,
            &mut state.num_fluid_neighbors,
            |i, p_x, p_num_fluid_neighbors| {
                *p_x = position[i];

                let mut nfn = 1u32;
                for id in neighs.iter(i) {
                    if id.point_set == FLUID_POINT_SET {
                        nfn += 1;
                    }
                }
                *p_num_fluid_neighbors = nfn;
            },
        );
    }

    fn update_positions_and_velocity(state: &SimulationState<D>, particles: &mut ParticleVec<D>, dt: FT) {
        let x: &[VF<D>] = &state.x;
        let old_position: &[VF<D>] = &state.old_position;

        let ParticleVec { position, velocity, .. } = particles;
        par_iter_mut2(position, velocity, |i, p_position, p_velocity| {
            *p_position = x[i];
            *p_velocity = (x[i] - old_position[i]) / dt;
        });
    }

    fn add_acceleration_to_velocity(particles: &mut ParticleVec<D>, dt: FT) {
        let ParticleVec {
            velocity, acceleration, ..
        } = particles;
        let acceleration: &[VF<D>] = acceleration;

        par_iter_mut1(velocity, |i, p_velocity| {
            *p_velocity += dt * acceleration[i];
        });
    }

    /**
     * Apply the system matrix to `x` without materializing the matrix:
     * `result = (dt² · stiffness) · coupling(x) + mass ⊙ x`, where the
     * coupling scatters each particle's value into its own slot and each
     * fluid neighbor's value into that neighbor's slot. Pure function of `x`
     * and the current neighbor topology.
     */
    fn matrix_free_lhs(
        model: &FluidModel<DU, D>,
        simulation_params: SimulationParams,
        x: &[VF<D>],
        result: &mut [VF<D>],
    ) {
        let num_particles = x.len();
        let accumulator = AtomicAccumulator::<D>::zeroed(num_particles);

        // influence of pressure
        par_iter_mut0(num_particles, |i| {
            accumulator.add(i, x[i]);
            for id in model.neighs.iter(i) {
                if id.point_set != FLUID_POINT_SET {
                    continue;
                }
                let j = id.point_id as usize;
                accumulator.add(j, x[j]);
            }
        });

        // influence of momentum
        let dt = simulation_params.dt;
        let system_scale = dt * dt * simulation_params.stiffness;
        let mass: &[FT] = &model.particles.mass;
        par_iter_mut1(result, |i, p_result| {
            *p_result = system_scale * accumulator.get(i) + mass[i] * x[i];
        });
    }

    /**
     * Build the right-hand side of the system: for every particle, project
     * its local neighborhood toward rest density (the nonlinear part of the
     * solve), scatter the projected positions, and combine them with the
     * momentum term targeting the inertial guess.
     */
    fn matrix_free_rhs(
        state: &SimulationState<D>,
        model: &FluidModel<DU, D>,
        simulation_params: SimulationParams,
        result: &mut [VF<D>],
    ) {
        let num_particles = state.len();
        let accumulator = AtomicAccumulator::<D>::zeroed(num_particles);

        let x: &[VF<D>] = &state.x;
        let num_fluid_neighbors: &[u32] = &state.num_fluid_neighbors;
        let density0_inv = 1. / simulation_params.rest_density;
        let h = simulation_params.h;

        // local step for the fluid density constraints
        par_iter_mut0(num_particles, |i| {
            let neighbor_ids: Vec<NeighborId> = model.neighs.iter(i).collect();

            // particle positions of the local constraint, will be projected
            let mut p: Vec<VF<D>> = Vec::with_capacity(neighbor_ids.len() + 1);
            p.push(x[i]);
            for &id in &neighbor_ids {
                if id.point_set == FLUID_POINT_SET {
                    p.push(x[id.point_id as usize]);
                } else {
                    p.push(model.neighbor_position(id));
                }
            }

            let calculate_c = |p: &[VF<D>]| -> FT {
                let mut density = model.particles.mass[i] * DU::kernel_zeroh(h);
                let xi = p[0];
                for (j, &id) in neighbor_ids.iter().enumerate() {
                    let xj = p[j + 1];
                    if id.point_set == FLUID_POINT_SET {
                        density += model.particles.mass[id.point_id as usize] * DU::kernelh(xi - xj, h);
                    } else {
                        density += model.boundary_psi(id) * DU::kernelh(xi - xj, h);
                    }
                }

                // constraint value = density / density0 - 1, only compression
                // is penalized
                let c = density * density0_inv - 1.;
                if c < 0. {
                    0.
                } else {
                    c
                }
            };

            let calculate_nabla_c = |p: &[VF<D>]| -> Vec<VF<D>> {
                let mut nabla_c: Vec<VF<D>> = vec![zero(); p.len()];
                let xi = p[0];
                for (j, &id) in neighbor_ids.iter().enumerate() {
                    let xj = p[j + 1];
                    let coefficient = if id.point_set == FLUID_POINT_SET {
                        model.particles.mass[id.point_id as usize]
                    } else {
                        model.boundary_psi(id)
                    };
                    let grad = (-density0_inv * coefficient) * DU::kernel_derivh(xi - xj, h);
                    nabla_c[j + 1] = grad;
                    nabla_c[0] -= grad;
                }
                nabla_c
            };

            // projection: a bounded Newton-style iteration on the one-sided
            // density constraint; hitting the cap is accepted as best-effort
            let mut c = calculate_c(&p);
            let mut it = 0;
            while c.abs() > PROJECTION_C_GOAL && it < PROJECTION_MAX_STEPS {
                it += 1;

                let g = calculate_nabla_c(&p);
                let dg: FT = g.iter().map(|grad| grad.norm_squared()).sum();
                if dg == 0. {
                    // found a minimum
                    break;
                }
                let cdg = -c / (dg + PROJECTION_REGULARIZATION);

                // move fluid particles along the constraint gradient; the
                // neighbor-count scale damps concurrent projections of the
                // same particle by different constraints
                p[0] += (cdg * num_fluid_neighbors[i] as FT) * g[0];
                for (j, &id) in neighbor_ids.iter().enumerate() {
                    if id.point_set == FLUID_POINT_SET {
                        let nfn = num_fluid_neighbors[id.point_id as usize] as FT;
                        p[j + 1] += (cdg * nfn) * g[j + 1];
                    }
                }

                c = calculate_c(&p);
            }

            accumulator.add(i, p[0]);
            for (j, &id) in neighbor_ids.iter().enumerate() {
                if id.point_set != FLUID_POINT_SET {
                    continue;
                }
                accumulator.add(id.point_id as usize, p[j + 1]);
            }
        });

        // influence of momentum
        let dt = simulation_params.dt;
        let system_scale = dt * dt * simulation_params.stiffness;
        let mass: &[FT] = &model.particles.mass;
        let predicted_position: &[VF<D>] = &state.predicted_position;
        par_iter_mut1(result, |i, p_result| {
            *p_result = system_scale * accumulator.get(i) + mass[i] * predicted_position[i];
        });
    }

    /// r = b - A·x (the negative gradient of the step energy). The right-hand
    /// side is only rebuilt when requested; CG restarts reuse it.
    fn calculate_negative_gradient(
        state: &SimulationState<D>,
        model: &FluidModel<DU, D>,
        simulation_params: SimulationParams,
        r: &mut [VF<D>],
        b: &mut [VF<D>],
        update_rhs: bool,
    ) {
        // use r as temporary buffer for the matrix-vector product
        Self::matrix_free_lhs(model, simulation_params, &state.x, r);
        if update_rhs {
            Self::matrix_free_rhs(state, model, simulation_params, b);
        }

        let b: &[VF<D>] = b;
        par_iter_mut1(r, |i, p_r| {
            *p_r = b[i] - *p_r;
        });
    }

    fn cg_solve(state: &mut SimulationState<D>, model: &FluidModel<DU, D>, simulation_params: SimulationParams) -> CgRun {
        let num_particles = state.len();
        let num_variables = D * num_particles;

        let mut d: Vec<VF<D>> = vec![zero(); num_particles];
        let mut r: Vec<VF<D>> = vec![zero(); num_particles];
        let mut q: Vec<VF<D>> = vec![zero(); num_particles];
        let mut b: Vec<VF<D>> = vec![zero(); num_particles];

        Self::calculate_negative_gradient(state, model, simulation_params, &mut r, &mut b, true);
        d.copy_from_slice(&r);

        let tol_abs = simulation_params.cg_abs_tolerance;
        let tol_rel = simulation_params.cg_rel_tolerance;

        let mut delta_new = par_norm_squared(&r);
        let delta_0 = delta_new;
        let mut residual_history = Vec::new();

        if (delta_new < tol_abs) || (delta_new < tol_rel * delta_0) {
            return CgRun {
                state: CgSolveState::AlreadySolved,
                iterations: 0,
                residual_history,
            };
        }

        for cg_it in 0..num_variables {
            Self::matrix_free_lhs(model, simulation_params, &d, &mut q);

            let dq = par_dot(&d, &q);
            if dq == 0. {
                // the search direction vanished, the solution is exact
                return CgRun {
                    state: CgSolveState::Converged,
                    iterations: cg_it,
                    residual_history,
                };
            }

            let alpha = delta_new / dq;
            {
                let d: &[VF<D>] = &d;
                par_iter_mut1(&mut state.x, |i, p_x| {
                    *p_x += alpha * d[i];
                });
            }

            if (cg_it + 1) % CG_RESTART_ITERATIONS == 0 {
                Self::calculate_negative_gradient(state, model, simulation_params, &mut r, &mut b, false);
            } else {
                let q: &[VF<D>] = &q;
                par_iter_mut1(&mut r, |i, p_r| {
                    *p_r -= alpha * q[i];
                });
            }

            let delta_old = delta_new;
            delta_new = par_norm_squared(&r);
            residual_history.push(delta_new);

            if (delta_new < tol_abs) || (delta_new < tol_rel * delta_0) {
                return CgRun {
                    state: CgSolveState::Converged,
                    iterations: cg_it + 1,
                    residual_history,
                };
            }

            let beta = delta_new / delta_old;
            {
                let r: &[VF<D>] = &r;
                par_iter_mut1(&mut d, |i, p_d| {
                    *p_d = r[i] + beta * *p_d;
                });
            }
        }

        CgRun {
            state: CgSolveState::MaxIterReached,
            iterations: num_variables,
            residual_history,
        }
    }

    fn compute_densities(model: &mut FluidModel<DU, D>, simulation_params: SimulationParams) {
        let FluidModel {
            particles,
            boundary_sets,
            neighs,
            ..
        } = model;
        let ParticleVec {
            density,
            position,
            mass,
            ..
        } = particles;
        let position: &[VF<D>] = position;
        let mass: &[FT] = mass;
        let h = simulation_params.h;

        par_iter_mut1(density, |i, p_density| {
            let mut density_acc = mass[i] * DU::kernel_zeroh(h);
            for id in neighs.iter(i) {
                let j = id.point_id as usize;
                if id.point_set == FLUID_POINT_SET {
                    density_acc += mass[j] * DU::kernelh(position[i] - position[j], h);
                } else {
                    let boundary_set = &boundary_sets[id.point_set as usize - 1];
                    density_acc += boundary_set.psi[j] * DU::kernelh(position[i] - boundary_set.positions[j], h);
                }
            }

            assert!(density_acc.is_finite());
            *p_density = density_acc;
        });
    }

    /// XSPH velocity smoothing, expressed as an acceleration so it slots into
    /// the common `velocity += dt · acceleration` update.
    fn compute_viscosity(model: &mut FluidModel<DU, D>, simulation_params: SimulationParams) {
        if simulation_params.viscosity == 0. {
            return;
        }

        let FluidModel {
            particles, neighs, ..
        } = model;
        let ParticleVec {
            acceleration,
            position,
            velocity,
            density,
            mass,
            ..
        } = particles;
        let position: &[VF<D>] = position;
        let velocity: &[VF<D>] = velocity;
        let density: &[FT] = density;
        let mass: &[FT] = mass;

        let h = simulation_params.h;
        let inv_dt = 1. / simulation_params.dt;

        par_iter_mut1(acceleration, |i, p_acceleration| {
            let mut velocity_correction: VF<D> = zero();
            for id in neighs.iter(i) {
                if id.point_set != FLUID_POINT_SET {
                    continue;
                }
                let j = id.point_id as usize;
                let weight = DU::kernelh(position[i] - position[j], h);
                velocity_correction += (mass[j] / density[j]) * (velocity[j] - velocity[i]) * weight;
            }

            *p_acceleration += (simulation_params.viscosity * inv_dt) * velocity_correction;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fluid_model::BoundaryPointSet;
    use crate::sph_kernels::DimensionUtils3d;
    use crate::{assert_ft_approx_eq, vec3f, V3};

    type Solver = TimeStepProjective<DimensionUtils3d, 3>;
    type Model = FluidModel<DimensionUtils3d, 3>;

    fn test_params() -> SimulationParams {
        SimulationParams {
            rest_density: 1000.,
            h: 0.1,
            dt: 0.001,
            stiffness: 1000.,
            gravity: 0.,
            viscosity: 0.,
            max_pd_iterations: 5,
            cg_abs_tolerance: 1e-10,
            cg_rel_tolerance: 1e-8,
        }
    }

    /// Mass that makes an isolated particle sit exactly at rest density.
    fn rest_mass(params: SimulationParams) -> FT {
        params.rest_density / DimensionUtils3d::kernel_zeroh(params.h)
    }

    fn make_model(
        positions: Vec<V3>,
        velocities: Vec<V3>,
        masses: Vec<FT>,
        boundary_sets: Vec<BoundaryPointSet<3>>,
        params: SimulationParams,
    ) -> Model {
        Model::new(positions, velocities, masses, boundary_sets, params)
    }

    fn assert_v3_approx_eq(a: V3, b: V3, tolerance: FT, what: &str) {
        for d in 0..3 {
            assert_ft_approx_eq(a[d], b[d], tolerance, || format!("{}[{}]", what, d));
        }
    }

    fn assert_v3_finite(v: V3) {
        for d in 0..3 {
            assert!(v[d].is_finite());
        }
    }

    #[test]
    fn momentum_only_step_recovers_symplectic_euler() {
        let mut params = test_params();
        params.stiffness = 0.;

        let positions = vec![
            vec3f(0., 0., 0.),
            vec3f(0.05, 0., 0.),
            vec3f(0.1, 0., 0.),
            vec3f(0.15, 0., 0.),
        ];
        let velocities = vec![
            vec3f(1., 0., 0.),
            vec3f(0., 2., 0.),
            vec3f(0., 0., -3.),
            vec3f(-1., 1., 1.),
        ];
        let masses = vec![1.; 4];
        let mut model = make_model(positions.clone(), velocities.clone(), masses, vec![], params);
        let mut solver = Solver::new(model.num_fluid_particles());

        solver.step(&mut model, params);

        // with zero stiffness the operator degenerates to mass * x, the
        // residual vanishes and the prediction is the exact solution
        assert_eq!(solver.last_solve.final_state, Some(CgSolveState::AlreadySolved));
        assert_eq!(solver.last_solve.cg_iterations, 0);

        for i in 0..4 {
            // storage may have been resorted, find the particle by velocity
            let k = (0..4)
                .find(|&k| (model.particles.velocity[k] - velocities[i]).norm() < 1e-4)
                .unwrap();
            let expected_position = positions[i] + params.dt * velocities[i];
            assert_v3_approx_eq(model.particles.position[k], expected_position, 1e-5, "position");
            assert_eq!(model.particles.position[k], solver.state.predicted_position[k]);
        }
    }

    #[test]
    fn isolated_particle_at_rest_density_needs_no_projection() {
        let params = test_params();
        let m = rest_mass(params);

        let position = vec3f(1., 2., 3.);
        let mut model = make_model(vec![position], vec![vec3f(0., 0., 0.)], vec![m], vec![], params);
        model.perform_neighborhood_search(params);

        let mut state = SimulationState::<3>::new(1);
        state.x[0] = position;
        state.predicted_position[0] = position;

        let mut rhs = vec![V3::zeros(); 1];
        Solver::matrix_free_rhs(&state, &model, params, &mut rhs);

        // C is already zero, the projection must leave the position untouched
        let scale = params.dt * params.dt * params.stiffness;
        let expected = scale * position + m * position;
        assert_v3_approx_eq(rhs[0], expected, expected.norm() * 1e-5, "rhs");
    }

    #[test]
    fn compressed_pair_is_projected_apart() {
        let params = test_params();
        let m = rest_mass(params);

        let x0 = vec3f(0., 0., 0.);
        let x1 = vec3f(0.01, 0., 0.);
        let mut model = make_model(
            vec![x0, x1],
            vec![V3::zeros(); 2],
            vec![m, m],
            vec![],
            params,
        );
        model.perform_neighborhood_search(params);

        let mut state = SimulationState::<3>::new(2);
        state.x = vec![x0, x1];
        state.predicted_position = vec![x0, x1];
        state.num_fluid_neighbors = vec![2, 2];

        let mut rhs = vec![V3::zeros(); 2];
        Solver::matrix_free_rhs(&state, &model, params, &mut rhs);

        let scale = params.dt * params.dt * params.stiffness;
        // reconstruct the accumulated projected positions
        let projected0 = (rhs[0] - m * state.predicted_position[0]) / scale;
        let projected1 = (rhs[1] - m * state.predicted_position[1]) / scale;

        // each slot received two contributions (self + the neighbor's view of it)
        let center0 = projected0 / 2.;
        let center1 = projected1 / 2.;
        assert!(center0.x < x0.x, "left particle must move left, got {}", center0.x);
        assert!(center1.x > x1.x, "right particle must move right, got {}", center1.x);
        assert_v3_finite(center0);
        assert_v3_finite(center1);
    }

    #[test]
    fn fluid_particle_is_pushed_away_from_boundary() {
        let params = test_params();
        let m = rest_mass(params);

        let spacing = params.h * 0.5;
        let mut plate = Vec::new();
        for bx in -3..=3 {
            for bz in -3..=3 {
                plate.push(vec3f(bx as FT * spacing, 0., bz as FT * spacing));
            }
        }

        let fluid_pos = vec3f(0., 0.05, 0.);
        let mut model = make_model(
            vec![fluid_pos],
            vec![V3::zeros()],
            vec![m],
            vec![BoundaryPointSet::new(plate)],
            params,
        );
        model.perform_neighborhood_search(params);
        assert!(model.neighs.neighbor_count(0) > 0);

        let mut state = SimulationState::<3>::new(1);
        state.x[0] = fluid_pos;
        state.predicted_position[0] = fluid_pos;

        let mut rhs = vec![V3::zeros(); 1];
        Solver::matrix_free_rhs(&state, &model, params, &mut rhs);

        let scale = params.dt * params.dt * params.stiffness;
        let projected = (rhs[0] - m * state.predicted_position[0]) / scale;
        assert!(
            projected.y > fluid_pos.y,
            "particle overlapping a boundary plate must be projected upward, got y={}",
            projected.y
        );
    }

    #[test]
    fn pairwise_coupling_is_symmetric() {
        let params = test_params();

        let positions = vec![vec3f(0., 0., 0.), vec3f(0.05, 0., 0.)];
        let mut model = make_model(
            positions,
            vec![V3::zeros(); 2],
            vec![1.0, 1.3],
            vec![],
            params,
        );
        model.perform_neighborhood_search(params);

        let x = vec![vec3f(1., -2., 3.), vec3f(-0.5, 4., 0.25)];
        let mut result = vec![V3::zeros(); 2];
        Solver::matrix_free_lhs(&model, params, &x, &mut result);

        // both particles list each other, so every slot accumulates its own
        // value twice regardless of which loop iteration discovers the pair
        let scale = params.dt * params.dt * params.stiffness;
        for i in 0..2 {
            let expected = scale * (2. * x[i]) + model.particles.mass[i] * x[i];
            assert_v3_approx_eq(result[i], expected, expected.norm() * 1e-5, "lhs");
        }
    }

    #[test]
    fn cg_residual_decreases_monotonically() {
        let mut params = test_params();
        params.stiffness = 50000.;
        // a single outer iteration, so the history belongs to a solve with a
        // substantial initial residual
        params.max_pd_iterations = 1;
        let m = rest_mass(params);

        // compressed cube, well above rest density
        let mut positions = Vec::new();
        for ix in 0..2 {
            for iy in 0..2 {
                for iz in 0..2 {
                    positions.push(vec3f(
                        ix as FT * 0.04 + 0.001 * iy as FT,
                        iy as FT * 0.04,
                        iz as FT * 0.04 + 0.002 * ix as FT,
                    ));
                }
            }
        }
        let n = positions.len();
        let mut model = make_model(positions, vec![V3::zeros(); n], vec![m; n], vec![], params);
        let mut solver = Solver::new(n);

        solver.step(&mut model, params);

        let history = &solver.last_solve.residual_history;
        assert!(!history.is_empty(), "compressed cube must require CG iterations");
        for k in 1..history.len() {
            let is_restart = (k + 1) % CG_RESTART_ITERATIONS == 0;
            if !is_restart {
                assert!(
                    history[k] <= history[k - 1] * 1.001,
                    "residual increased at iteration {}: {} -> {}",
                    k,
                    history[k - 1],
                    history[k]
                );
            }
        }
        for &delta in history {
            assert!(delta.is_finite());
        }
    }

    #[test]
    fn already_converged_state_is_idempotent() {
        let params = test_params();
        let m = rest_mass(params);

        let position = vec3f(0.5, 0.5, 0.5);
        let mut model = make_model(vec![position], vec![V3::zeros()], vec![m], vec![], params);
        let mut solver = Solver::new(1);

        solver.step(&mut model, params);
        assert_eq!(solver.last_solve.final_state, Some(CgSolveState::AlreadySolved));
        assert_eq!(model.particles.position[0], position);

        solver.step(&mut model, params);
        assert_eq!(solver.last_solve.final_state, Some(CgSolveState::AlreadySolved));
        assert_eq!(model.particles.position[0], position);
        assert_eq!(model.particles.velocity[0], V3::zeros());
    }

    #[test]
    fn resort_keeps_state_attached_to_particles() {
        let mut params = test_params();
        params.stiffness = 0.;

        // descending x coordinates force the spatial sort to permute, and the
        // spacing keeps the particles from interacting
        let num_particles = 8;
        let positions: Vec<V3> = (0..num_particles)
            .map(|i| vec3f((num_particles - i) as FT, 0., 0.))
            .collect();
        let velocities: Vec<V3> = (0..num_particles).map(|i| vec3f(0., (i + 1) as FT, 0.)).collect();
        let masses = vec![1.; num_particles];

        let mut model = make_model(positions.clone(), velocities.clone(), masses, vec![], params);
        let mut solver = Solver::new(num_particles);

        // the first step resorts (the counter starts at zero)
        solver.step(&mut model, params);

        let mut seen = vec![false; num_particles];
        for k in 0..num_particles {
            // old position and velocity must still belong to the same particle
            let i = positions
                .iter()
                .position(|&p| (p - solver.state.old_position[k]).norm() < 1e-3)
                .expect("old position must match one of the original particles");
            assert!(!seen[i], "duplicate mapping after resort");
            seen[i] = true;

            // dividing the position roundoff by dt leaves a visible error in
            // the reconstructed velocity
            assert_v3_approx_eq(model.particles.velocity[k], velocities[i], 1e-2, "velocity");
            let expected_position = positions[i] + params.dt * velocities[i];
            assert_v3_approx_eq(model.particles.position[k], expected_position, 1e-4, "position");
        }

        // the storage order must actually have changed
        assert!(solver.state.old_position[0] != positions[0]);
    }

    #[test]
    fn unreachable_tolerance_reports_iteration_cap() {
        let mut params = test_params();
        params.stiffness = 50000.;
        params.cg_abs_tolerance = 1e-30;
        params.cg_rel_tolerance = 0.;
        params.max_pd_iterations = 2;
        let m = rest_mass(params);

        let positions = vec![vec3f(0., 0., 0.), vec3f(0.0123, 0.0045, 0.0067)];
        let mut model = make_model(positions, vec![V3::zeros(); 2], vec![m, 1.37 * m], vec![], params);
        let mut solver = Solver::new(2);

        solver.step(&mut model, params);

        assert_eq!(solver.last_solve.final_state, Some(CgSolveState::MaxIterReached));
        for i in 0..2 {
            assert_v3_finite(model.particles.position[i]);
            assert_v3_finite(model.particles.velocity[i]);
        }
    }

    #[test]
    fn empty_particle_set_is_a_noop_step() {
        let params = test_params();
        let mut model = make_model(vec![], vec![], vec![], vec![], params);
        let mut solver = Solver::new(0);

        solver.step(&mut model, params);

        assert_eq!(solver.last_solve.final_state, Some(CgSolveState::AlreadySolved));
        assert_ft_approx_eq(solver.time, params.dt, 1e-9, || format!("time"));
    }

    #[test]
    fn reset_zeroes_counter_and_state() {
        let params = test_params();
        let mut model = make_model(vec![vec3f(0., 0., 0.)], vec![V3::zeros()], vec![1.], vec![], params);
        let mut solver = Solver::new(1);

        solver.step(&mut model, params);
        solver.state.predicted_position[0] = vec3f(9., 9., 9.);

        solver.reset();
        assert_eq!(solver.time, 0.);
        assert_eq!(solver.state.predicted_position[0], V3::zeros());
        assert_eq!(solver.state.num_fluid_neighbors[0], 1);
    }

    #[test]
    fn falling_block_on_boundary_plate_stays_finite() {
        let mut params = test_params();
        params.gravity = -9.81;
        params.viscosity = 0.01;
        params.stiffness = 10000.;
        params.max_pd_iterations = 3;
        let m = rest_mass(params);

        let spacing = params.h * 0.5;
        let mut plate = Vec::new();
        for bx in -5..=5 {
            for bz in -5..=5 {
                plate.push(vec3f(bx as FT * spacing, 0., bz as FT * spacing));
            }
        }

        let mut positions = Vec::new();
        for ix in 0..3 {
            for iy in 0..3 {
                for iz in 0..3 {
                    positions.push(vec3f(
                        (ix as FT - 1.) * spacing,
                        0.06 + iy as FT * spacing,
                        (iz as FT - 1.) * spacing,
                    ));
                }
            }
        }
        let n = positions.len();
        let mut model = make_model(
            positions,
            vec![V3::zeros(); n],
            vec![m; n],
            vec![BoundaryPointSet::new(plate)],
            params,
        );
        let mut solver = Solver::new(n);

        for _ in 0..5 {
            solver.step(&mut model, params);
            for i in 0..n {
                assert_v3_finite(model.particles.position[i]);
                assert_v3_finite(model.particles.velocity[i]);
                assert!(model.particles.density[i].is_finite());
            }
        }
        assert!(solver.last_solve.final_state.is_some());
    }
}
