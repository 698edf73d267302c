use std::marker::PhantomData;

use nalgebra::zero;

use crate::{
    concurrency::par_iter_mut1,
    floating_type_mod::FT,
    neighborhood_search::{NeighborId, NeighborhoodCache, FLUID_POINT_SET},
    simulation_parameters::SimulationParams,
    sph_kernels::DimensionUtils,
    VF,
};

macro_rules! decl_particle_vec {
    (pub struct $struct_name:ident<const D: usize> { $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),*$(,)?  }) => {
        pub struct $struct_name<const D: usize> {
            $(
                pub $field_name : Vec<$field_type>,
            )*
        }

        impl<const D: usize> $struct_name<D> {
            pub fn swap(&mut self, i: usize, j: usize) {
                $(
                    self.$field_name.swap(i, j);
                )*
            }

            pub fn truncate(&mut self, len: usize) {
                $(
                    self.$field_name.truncate(len);
                )*
            }

            pub fn extend(&mut self, num_elements: usize) {
                $(
                    self.$field_name.extend((0..num_elements).map::<$field_type, _>(|_| $default_value));
                )*
            }

            /// Rearrange all per-particle arrays so that entry `k` afterwards
            /// holds the data of particle `order[k]`.
            pub fn reorder(&mut self, order: &[usize]) {
                $(
                    assert!(order.len() == self.$field_name.len());
                    self.$field_name = order.iter().map(|&src| self.$field_name[src].clone()).collect();
                )*
            }

            pub fn default(len: usize) -> Self {
                Self {
                    $(
                        $field_name: (0..len).map(|_| $default_value).collect::<Vec<$field_type>>(),
                    )*
                }
            }
        }
    }
}

decl_particle_vec! {
    pub struct ParticleVec<const D: usize> {
        pub mass: Vec<FT> | 0.,
        pub position: Vec<VF<D>> | zero(),
        pub velocity: Vec<VF<D>> | zero(),
        pub acceleration: Vec<VF<D>> | zero(),
        pub density: Vec<FT> | 0.,
    }
}

/**
 * A static boundary object sampled with particles. Every boundary particle
 * carries a precomputed coefficient psi that stands in for its effective mass
 * in density sums (Akinci 2012).
 */
pub struct BoundaryPointSet<const D: usize> {
    pub positions: Vec<VF<D>>,
    pub psi: Vec<FT>,
}

impl<const D: usize> BoundaryPointSet<D> {
    pub fn new(positions: Vec<VF<D>>) -> Self {
        let num_particles = positions.len();
        BoundaryPointSet {
            positions,
            psi: vec![0.; num_particles],
        }
    }
}

/**
 * The particle container: fluid particles in SoA layout (point set 0) plus
 * any number of boundary point sets, and the per-fluid-particle neighbor
 * lists over all sets.
 */
pub struct FluidModel<DU: DimensionUtils<D>, const D: usize> {
    pub particles: ParticleVec<D>,
    pub boundary_sets: Vec<BoundaryPointSet<D>>,
    pub neighs: NeighborhoodCache,

    _marker: PhantomData<DU>,
}

impl<DU: DimensionUtils<D>, const D: usize> FluidModel<DU, D> {
    pub fn new(
        fluid_particle_positions: Vec<VF<D>>,
        fluid_particle_velocities: Vec<VF<D>>,
        fluid_particle_masses: Vec<FT>,
        boundary_sets: Vec<BoundaryPointSet<D>>,
        simulation_params: SimulationParams,
    ) -> Self {
        let num_fluid_particles = fluid_particle_positions.len();
        assert!(fluid_particle_velocities.len() == num_fluid_particles);
        assert!(fluid_particle_masses.len() == num_fluid_particles);

        let mut particles = ParticleVec::<D>::default(num_fluid_particles);
        particles.position = fluid_particle_positions;
        particles.velocity = fluid_particle_velocities;
        particles.mass = fluid_particle_masses;

        let mut model = FluidModel {
            particles,
            boundary_sets,
            neighs: NeighborhoodCache::new(num_fluid_particles),
            _marker: PhantomData,
        };
        model.update_boundary_psi(simulation_params);
        model
    }

    pub fn num_fluid_particles(&self) -> usize {
        self.particles.position.len()
    }

    /// Position of a tagged neighbor, regardless of which point set it
    /// belongs to.
    pub fn neighbor_position(&self, id: NeighborId) -> VF<D> {
        if id.point_set == FLUID_POINT_SET {
            self.particles.position[id.point_id as usize]
        } else {
            self.boundary_sets[id.point_set as usize - 1].positions[id.point_id as usize]
        }
    }

    pub fn boundary_psi(&self, id: NeighborId) -> FT {
        assert!(id.point_set != FLUID_POINT_SET);
        self.boundary_sets[id.point_set as usize - 1].psi[id.point_id as usize]
    }

    /**
     * Precompute the boundary coefficients psi = rest_density / number_density
     * where the number density sums kernel weights over the boundary particles
     * of the same set (including the particle itself).
     */
    pub fn update_boundary_psi(&mut self, simulation_params: SimulationParams) {
        let support_radius = simulation_params.h * DU::support_radius_by_smoothing_length();

        for boundary_set in &mut self.boundary_sets {
            let BoundaryPointSet { positions, psi } = boundary_set;
            let positions: &[VF<D>] = positions;

            let mut boundary_neighs = NeighborhoodCache::new(positions.len());
            boundary_neighs.add_neighbors_from_set::<DU, D>(0, positions, positions, support_radius, false);

            par_iter_mut1(psi, |bi, p_psi| {
                let mut number_density: FT = 0.;
                for bj in boundary_neighs.iter(bi) {
                    let weight = DU::kernelh(positions[bi] - positions[bj.point_id as usize], simulation_params.h);
                    number_density += weight;
                }

                assert!(number_density > 0.);
                *p_psi = simulation_params.rest_density / number_density;
            });
        }
    }

    /// Rebuild the tagged neighbor lists of all fluid particles from the
    /// current positions.
    pub fn perform_neighborhood_search(&mut self, simulation_params: SimulationParams) {
        let support_radius = simulation_params.h * DU::support_radius_by_smoothing_length();

        self.neighs.clear_lists();
        self.neighs.add_neighbors_from_set::<DU, D>(
            FLUID_POINT_SET,
            &self.particles.position,
            &self.particles.position,
            support_radius,
            true,
        );

        // positions borrowed separately so the cache can be mutated
        let (neighs, particles, boundary_sets) = (&mut self.neighs, &self.particles, &self.boundary_sets);
        for (set_index, boundary_set) in boundary_sets.iter().enumerate() {
            neighs.add_neighbors_from_set::<DU, D>(
                set_index as u32 + 1,
                &boundary_set.positions,
                &particles.position,
                support_radius,
                false,
            );
        }
    }

    /// Reorder the fluid particle storage for memory locality. Neighbor lists
    /// are invalidated and must be rebuilt afterwards; any solver-side
    /// per-particle state has to be reordered with the same permutation.
    pub fn reorder(&mut self, order: &[usize]) {
        self.particles.reorder(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sph_kernels::DimensionUtils3d;
    use crate::vec3f;

    fn test_params() -> SimulationParams {
        SimulationParams::default()
    }

    #[test]
    fn isolated_boundary_particle_psi() {
        let params = test_params();
        let boundary = BoundaryPointSet::new(vec![vec3f(0., 0., 0.)]);
        let model = FluidModel::<DimensionUtils3d, 3>::new(vec![], vec![], vec![], vec![boundary], params);

        // a lone boundary particle only sees its own kernel weight
        let expected = params.rest_density / DimensionUtils3d::kernel_zeroh(params.h);
        crate::assert_ft_approx_eq(model.boundary_sets[0].psi[0], expected, expected * 1e-5, || {
            format!("psi of isolated boundary particle")
        });
    }

    #[test]
    fn denser_boundary_sampling_gives_smaller_psi() {
        let params = test_params();
        let spacing = params.h * 0.5;

        let lone = BoundaryPointSet::new(vec![vec3f(0., 0., 0.)]);
        let row = BoundaryPointSet::new(vec![
            vec3f(-spacing, 0., 0.),
            vec3f(0., 0., 0.),
            vec3f(spacing, 0., 0.),
        ]);
        let model = FluidModel::<DimensionUtils3d, 3>::new(vec![], vec![], vec![], vec![lone, row], params);

        assert!(model.boundary_sets[1].psi[1] < model.boundary_sets[0].psi[0]);
    }

    #[test]
    fn reorder_keeps_fields_attached() {
        let params = test_params();
        let positions = vec![vec3f(0., 0., 0.), vec3f(1., 0., 0.), vec3f(2., 0., 0.)];
        let velocities = vec![vec3f(0., 1., 0.), vec3f(0., 2., 0.), vec3f(0., 3., 0.)];
        let masses = vec![1., 2., 3.];
        let mut model =
            FluidModel::<DimensionUtils3d, 3>::new(positions.clone(), velocities.clone(), masses.clone(), vec![], params);

        let order = vec![2, 0, 1];
        model.reorder(&order);

        for k in 0..3 {
            assert_eq!(model.particles.position[k], positions[order[k]]);
            assert_eq!(model.particles.velocity[k], velocities[order[k]]);
            assert_eq!(model.particles.mass[k], masses[order[k]]);
        }
    }
}
