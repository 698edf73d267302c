use crate::{concurrency::par_iter_mut1, floating_type_mod::FT, sph_kernels::DimensionUtils, V, VF, VI};

const MAX_NEIGHBOR_COUNT: usize = 20000;

/// Point set 0 holds the simulated fluid particles, every other set is a
/// static boundary object.
pub const FLUID_POINT_SET: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborId {
    pub point_set: u32,
    pub point_id: u32,
}

/**
 * Stores for each fluid particle the ids of its neighbors, tagged with the
 * point set the neighbor belongs to. The lists are rebuilt from scratch every
 * simulation step.
 */
pub struct NeighborhoodCache {
    neighs: Vec<Vec<NeighborId>>,
}

impl NeighborhoodCache {
    pub fn new(num_particles: usize) -> Self {
        NeighborhoodCache {
            neighs: (0..num_particles).map(|_| Vec::new()).collect(),
        }
    }

    pub fn iter<'a>(&'a self, i: usize) -> impl Iterator<Item = NeighborId> + 'a {
        self.neighs[i].iter().copied()
    }

    pub fn neighbor_count(&self, i: usize) -> usize {
        self.neighs[i].len()
    }

    pub fn len(&self) -> usize {
        self.neighs.len()
    }

    pub fn swap(&mut self, i: usize, j: usize) {
        self.neighs.swap(i, j);
    }

    pub fn truncate(&mut self, len: usize) {
        self.neighs.truncate(len);
    }

    pub fn extend(&mut self, num_elements: usize) {
        self.neighs.extend((0..num_elements).map(|_| Vec::new()));
    }

    pub fn clear_lists(&mut self) {
        for p_neighs in &mut self.neighs {
            p_neighs.clear();
        }
    }

    /**
     * Append all particles of one point set that lie within the support
     * radius of a query particle to that particle's neighbor list.
     *
     * `exclude_self` must be set when the query positions and the neighbor
     * positions are the same set (a particle is not its own list entry, its
     * self contribution enters the density via the zero-distance kernel
     * weight).
     */
    pub fn add_neighbors_from_set<DU: DimensionUtils<D>, const D: usize>(
        &mut self,
        point_set: u32,
        neighbor_positions: &[VF<D>],
        query_positions: &[VF<D>],
        support_radius: FT,
        exclude_self: bool,
    ) {
        if neighbor_positions.is_empty() {
            return;
        }

        let grid = CellGrid::build(neighbor_positions, support_radius);

        par_iter_mut1(&mut self.neighs, |particle_id, p_neighs| {
            let this_particle_position = query_positions[particle_id];
            let particle_cell_pos = particle_to_cell_pos(this_particle_position, support_radius);

            let mut num_neighbors = p_neighs.len();

            DU::iterate_grid_neighbors(1, |offset| {
                let cell_pos = particle_cell_pos + offset;

                if !grid.contains(cell_pos) {
                    return;
                }

                for &neigh_particle_id in &grid.get(cell_pos).particle_ids {
                    if exclude_self && neigh_particle_id == particle_id {
                        continue;
                    }

                    let neigh_particle_position = neighbor_positions[neigh_particle_id];

                    if (neigh_particle_position - this_particle_position).norm_squared()
                        >= support_radius * support_radius
                    {
                        continue;
                    }

                    if num_neighbors == MAX_NEIGHBOR_COUNT {
                        panic!("exceeded maximum allowed number of {} neighbors", MAX_NEIGHBOR_COUNT);
                    }
                    p_neighs.push(NeighborId {
                        point_set,
                        point_id: neigh_particle_id as u32,
                    });
                    num_neighbors = num_neighbors + 1;
                }
            });
        });
    }
}

fn particle_to_cell_pos<const D: usize>(particle_pos: VF<D>, cell_len: FT) -> VI<D> {
    (particle_pos / cell_len).map(|x| x.floor() as i32)
}

/**
 * Compute a permutation that orders particles by their grid cell so that
 * spatially close particles end up close in memory. Used for the periodic
 * resort of the particle container.
 */
pub fn spatial_sort_order<const D: usize>(positions: &[VF<D>], cell_len: FT) -> Vec<usize> {
    let mut order: Vec<usize> = (0..positions.len()).collect();
    order.sort_by_key(|&i| {
        let cell = particle_to_cell_pos(positions[i], cell_len);
        let mut key = [0i32; D];
        for d in 0..D {
            // highest dimension varies slowest
            key[d] = cell[D - 1 - d];
        }
        key
    });
    order
}

struct Cell {
    particle_ids: Vec<usize>,
}

impl Cell {
    fn new() -> Cell {
        Cell {
            particle_ids: Vec::new(),
        }
    }
}

struct CellGrid<const D: usize> {
    grid_min: V<i32, D>,
    grid_max: V<i32, D>,
    size: V<usize, D>,
    cells: Vec<Cell>,
}

impl<const D: usize> CellGrid<D> {
    fn build(positions: &[VF<D>], cell_len: FT) -> CellGrid<D> {
        let mut domain_min = positions[0];
        let mut domain_max = positions[0];
        for position in positions {
            for d in 0..D {
                domain_min[d] = FT::min(domain_min[d], position[d]);
                domain_max[d] = FT::max(domain_max[d], position[d]);
            }
        }

        let cells_min = domain_min.map(|x| (x / cell_len).floor() as i32 - 1);
        let cells_max = domain_max.map(|x| (x / cell_len).floor() as i32 + 2);
        let grid_size: V<usize, D> = (cells_max - cells_min).map(|x| x as usize);

        let num_elements = grid_size.fold(1, |acc, x| acc * x);
        let mut grid = CellGrid {
            grid_min: cells_min,
            grid_max: cells_max,
            size: grid_size,
            cells: (0..num_elements).map(|_| Cell::new()).collect(),
        };

        for (particle_id, position) in positions.iter().enumerate() {
            let cell_pos = particle_to_cell_pos(*position, cell_len);
            grid.get_mut(cell_pos).particle_ids.push(particle_id);
        }

        grid
    }

    fn contains(&self, cell_pos: V<i32, D>) -> bool {
        for d in 0..D {
            if cell_pos[d] < self.grid_min[d] || cell_pos[d] >= self.grid_max[d] {
                return false;
            }
        }
        true
    }

    fn pos_to_idx(&self, mut cell_pos: V<i32, D>) -> usize {
        cell_pos = cell_pos - self.grid_min;

        let mut multiplier = 1;
        let mut idx: usize = 0;
        for d in 0..D {
            assert!(0 <= cell_pos[d]);
            assert!((cell_pos[d] as usize) < self.size[d]);
            idx += multiplier * cell_pos[d] as usize;
            multiplier *= self.size[d];
        }
        idx
    }

    fn get(&self, cell_pos: V<i32, D>) -> &Cell {
        let idx = self.pos_to_idx(cell_pos);
        self.cells
            .get(idx)
            .expect("out-of-bounds access should have been catched before")
    }

    fn get_mut(&mut self, cell_pos: V<i32, D>) -> &mut Cell {
        let idx = self.pos_to_idx(cell_pos);
        self.cells
            .get_mut(idx)
            .expect("out-of-bounds access should have been catched before")
    }
}
