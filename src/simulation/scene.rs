use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    floating_type_mod::FT,
    fluid_model::{BoundaryPointSet, FluidModel},
    simulation_parameters::SimulationParams,
    sph_kernels::DimensionUtils,
    VF,
};

/**
 * An axis-aligned box filled with fluid particles on a regular grid.
 * `jitter` perturbs each particle by a random offset of up to that fraction
 * of the grid spacing, which breaks up lattice artifacts in the solve.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneFluidBlock {
    pub pos: Vec<FT>,
    pub size: Vec<FT>,
    pub spacing: FT,
    #[serde(default)]
    pub jitter: FT,
    pub velocity: Vec<FT>,
}

/// An axis-aligned box sampled as a hollow shell of boundary particles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneBoundaryBox {
    pub pos: Vec<FT>,
    pub size: Vec<FT>,
    pub spacing: FT,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    /// 2 or 3; all position/size/velocity entries must have this length.
    pub dimension: usize,
    pub blocks: Vec<SceneFluidBlock>,
    #[serde(default)]
    pub boundary_boxes: Vec<SceneBoundaryBox>,
}

fn vf_from_components<const D: usize>(components: &[FT]) -> VF<D> {
    assert!(
        components.len() == D,
        "expected {} vector components in scene config, got {}",
        D,
        components.len()
    );
    VF::<D>::from_column_slice(components)
}

fn grid_counts<const D: usize>(size: VF<D>, spacing: FT) -> [usize; D] {
    let mut counts = [0usize; D];
    for d in 0..D {
        counts[d] = (size[d] / spacing).floor() as usize;
    }
    counts
}

fn add_fluid_block<const D: usize>(
    block: &SceneFluidBlock,
    rest_density: FT,
    particle_positions: &mut Vec<VF<D>>,
    particle_masses: &mut Vec<FT>,
    particle_velocities: &mut Vec<VF<D>>,
) {
    let min = vf_from_components::<D>(&block.pos);
    let size = vf_from_components::<D>(&block.size);
    let velocity = vf_from_components::<D>(&block.velocity);

    let particle_volume = block.spacing.powi(D as i32);
    let particle_mass = particle_volume * rest_density;

    let counts = grid_counts(size, block.spacing);
    let num_particles: usize = counts.iter().product();

    let mut rng = rand::thread_rng();
    let max_offset = block.jitter * block.spacing;

    for idx in 0..num_particles {
        let mut rem = idx;
        let mut position = min;
        for d in 0..D {
            position[d] += (rem % counts[d]) as FT * block.spacing;
            rem /= counts[d];

            if max_offset > 0. {
                position[d] += rng.gen_range::<FT, _>(-0.5..0.5) * max_offset;
            }
        }

        particle_positions.push(position);
        particle_masses.push(particle_mass);
        particle_velocities.push(velocity);
    }
}

/// Sample the faces of a box, leaving the interior empty.
fn add_boundary_box<const D: usize>(boundary_box: &SceneBoundaryBox, positions: &mut Vec<VF<D>>) {
    let min = vf_from_components::<D>(&boundary_box.pos);
    let size = vf_from_components::<D>(&boundary_box.size);

    let counts = grid_counts(size, boundary_box.spacing);
    let num_grid_points: usize = counts.iter().product();

    for idx in 0..num_grid_points {
        let mut rem = idx;
        let mut position = min;
        let mut on_shell = false;
        for d in 0..D {
            let cell = rem % counts[d];
            rem /= counts[d];

            position[d] += cell as FT * boundary_box.spacing;
            if cell == 0 || cell == counts[d] - 1 {
                on_shell = true;
            }
        }

        if on_shell {
            positions.push(position);
        }
    }
}

/// Build the particle container described by a scene config.
pub fn build_scene<DU: DimensionUtils<D>, const D: usize>(
    scene_config: &SceneConfig,
    simulation_params: SimulationParams,
) -> FluidModel<DU, D> {
    assert!(scene_config.dimension == D);

    let mut fluid_positions = Vec::new();
    let mut fluid_masses = Vec::new();
    let mut fluid_velocities = Vec::new();
    for block in &scene_config.blocks {
        add_fluid_block::<D>(
            block,
            simulation_params.rest_density,
            &mut fluid_positions,
            &mut fluid_masses,
            &mut fluid_velocities,
        );
    }

    let mut boundary_sets = Vec::new();
    for boundary_box in &scene_config.boundary_boxes {
        let mut boundary_positions = Vec::new();
        add_boundary_box::<D>(boundary_box, &mut boundary_positions);
        boundary_sets.push(BoundaryPointSet::new(boundary_positions));
    }

    FluidModel::new(
        fluid_positions,
        fluid_velocities,
        fluid_masses,
        boundary_sets,
        simulation_params,
    )
}
