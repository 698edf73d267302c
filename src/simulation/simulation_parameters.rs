use crate::{floating_type_mod::FT, VF};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulationParams {
    pub rest_density: FT,

    /// Smoothing length of the cubic spline kernel. The support radius is
    /// twice this value.
    pub h: FT,

    /// Fixed time step size.
    pub dt: FT,

    /// Stiffness of the density constraints in the implicit system.
    pub stiffness: FT,

    pub gravity: FT,

    /// XSPH velocity smoothing coefficient.
    pub viscosity: FT,

    /// Upper bound for the outer projective-dynamics iterations per step.
    pub max_pd_iterations: usize,

    /// Absolute tolerance on the squared CG residual norm.
    pub cg_abs_tolerance: FT,

    /// Tolerance on the squared CG residual norm relative to its initial value.
    pub cg_rel_tolerance: FT,
}

impl SimulationParams {
    pub fn gravity_vector<const D: usize>(&self) -> VF<D> {
        let mut data: [FT; D] = [0.; D];
        data[1] = self.gravity;
        VF::<D>::from_column_slice(&data)
    }
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            rest_density: 1000.,
            h: 0.025,
            dt: 0.001,
            stiffness: 50000.,
            gravity: -9.81,
            viscosity: 0.01,
            max_pd_iterations: 5,
            cg_abs_tolerance: 1e-10,
            cg_rel_tolerance: 1e-8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_yaml_roundtrip() {
        let params = SimulationParams::default();
        let yaml = serde_yaml::to_string(&params).unwrap();
        let parsed: SimulationParams = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(params.max_pd_iterations, parsed.max_pd_iterations);
        crate::assert_ft_approx_eq(params.stiffness, parsed.stiffness, 1e-6, || format!("stiffness"));
    }
}
