use crate::grid::{PressureParams, SolverKind};
use crate::simulator::SimulatorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("grid resolution must be greater than 0.5 cells per unit length, got {0}")]
    GridResolution(f64),
    #[error("particle radius must be positive, got {0}")]
    ParticleRadius(f64),
    #[error("fluid density must be positive, got {0}")]
    FluidDensity(f64),
    #[error("incompressibility iteration count must be in 1..=600, got {0}")]
    IterationCount(u32),
    #[error("residual tolerance must be positive, got {0}")]
    ResidualTolerance(f64),
    #[error("flip ratio must be within [0, 1], got {0}")]
    FlipRatio(f64),
}

/// Everything tunable about a simulation. Validated when handed to the
/// manager; a rejected config never reaches the tick loop.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Cells per unit of world length.
    pub grid_resolution: f64,
    pub particle_radius: f64,
    pub is_top_of_container_solid: bool,
    /// Strength of the density relaxation term in the pressure solve.
    pub pressure_k: f64,
    /// Kernel-weighted particle count a cell is relaxed towards.
    pub average_pressure: f64,
    pub incompressibility_iteration_count: u32,
    /// Gates the density relaxation term (the projection always runs).
    pub pressure_enabled: bool,
    pub residual_tolerance: f64,
    pub fluid_density: f64,
    pub grid_solver: SolverKind,
    pub simulator: SimulatorConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            grid_resolution: 4.0,
            particle_radius: 0.06,
            is_top_of_container_solid: false,
            pressure_k: 2.0,
            average_pressure: 2.0,
            incompressibility_iteration_count: 80,
            pressure_enabled: true,
            residual_tolerance: 1e-6,
            fluid_density: 1.0,
            grid_solver: SolverKind::Bridson,
            simulator: SimulatorConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.grid_resolution > 0.5) {
            return Err(ConfigError::GridResolution(self.grid_resolution));
        }
        if !(self.particle_radius > 0.0) {
            return Err(ConfigError::ParticleRadius(self.particle_radius));
        }
        if !(self.fluid_density > 0.0) {
            return Err(ConfigError::FluidDensity(self.fluid_density));
        }
        if !(1..=600).contains(&self.incompressibility_iteration_count) {
            return Err(ConfigError::IterationCount(
                self.incompressibility_iteration_count,
            ));
        }
        if !(self.residual_tolerance > 0.0) {
            return Err(ConfigError::ResidualTolerance(self.residual_tolerance));
        }
        if !(0.0..=1.0).contains(&self.simulator.flip_ratio) {
            return Err(ConfigError::FlipRatio(self.simulator.flip_ratio));
        }
        Ok(())
    }

    pub(crate) fn pressure_params(&self) -> PressureParams {
        PressureParams {
            fluid_density: self.fluid_density,
            pressure_k: self.pressure_k,
            average_pressure: self.average_pressure,
            pressure_enabled: self.pressure_enabled,
            max_iterations: self.incompressibility_iteration_count,
            residual_tolerance: self.residual_tolerance,
        }
    }
}
