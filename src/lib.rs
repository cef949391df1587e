//! CPU hybrid particle/grid fluid solver.
//!
//! Marker particles carry the fluid, a staggered MAC grid carries the
//! pressure projection; PIC, FLIP and APIC transfers move velocities
//! between the two. [`SimulationManager`] drives the tick loop on a
//! background thread and publishes per-particle snapshots;
//! [`simulator::Simulator`] can also be stepped directly for headless and
//! deterministic runs.

pub mod config;
pub mod grid;
pub mod interpolation;
pub mod manager;
pub mod obstacle;
mod parallel;
pub mod particles;
pub mod simulator;

pub use config::{ConfigError, SimulationConfig};
pub use grid::{CellType, MacGrid, PressureSolver, SolverKind};
pub use manager::{CellView, ParticleSnapshot, SimulationManager};
pub use obstacle::{Obstacle, ObstacleShape};
pub use parallel::AtomicF64;
pub use particles::{Particle, ParticleSet};
pub use simulator::{Simulator, SimulatorConfig, TransferScheme};
