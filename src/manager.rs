use crate::config::{ConfigError, SimulationConfig};
use crate::grid::{Cell, CellType, MacGrid, PressureSolver};
use crate::obstacle::{Obstacle, ObstacleShape};
use crate::parallel::AtomicF64;
use crate::particles::ParticleSet;
use crate::simulator::Simulator;
use cgmath::{InnerSpace, Point3, Vector3};
use log::info;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Per-particle data published for visualization after every tick.
#[derive(Clone, Copy, Debug)]
pub struct ParticleSnapshot {
    pub pos: Point3<f32>,
    /// Velocity magnitude; only refreshed while speed calculation is
    /// enabled.
    pub speed: f32,
}

impl Default for ParticleSnapshot {
    fn default() -> Self {
        ParticleSnapshot {
            pos: Point3::new(0.0, 0.0, 0.0),
            speed: 0.0,
        }
    }
}

/// Read-only copy of one grid cell, for inspection tooling.
#[derive(Clone, Copy, Debug)]
pub struct CellView {
    pub cell_type: CellType,
    /// Transferred face velocities (one component per axis).
    pub v: Vector3<f64>,
    /// Working face velocities after the projection.
    pub v_star: Vector3<f64>,
    pub particle_density: f64,
}

impl CellView {
    fn read(cell: &Cell) -> Self {
        CellView {
            cell_type: cell.cell_type(),
            v: Vector3::new(
                cell.faces[0].v.get(),
                cell.faces[1].v.get(),
                cell.faces[2].v.get(),
            ),
            v_star: Vector3::new(
                cell.faces[0].v_star.get(),
                cell.faces[1].v_star.get(),
                cell.faces[2].v_star.get(),
            ),
            particle_density: cell.particle_density.get(),
        }
    }
}

struct SharedData {
    config: SimulationConfig,
    obstacles: Vec<Obstacle>,
    particle_target: usize,
    restart: bool,
    snapshot: Vec<ParticleSnapshot>,
    durations: BTreeMap<String, u64>,
    grid: Arc<MacGrid>,
}

struct Shared {
    data: Mutex<SharedData>,
    step_signal: Condvar,
    run: AtomicBool,
    terminate: AtomicBool,
    auto_dt: AtomicBool,
    calculate_speeds: AtomicBool,
    dt: AtomicF64,
    last_iteration_seconds: AtomicF64,
}

/// Owns the background tick loop and all simulation state.
///
/// Callers talk to it through one mutex-guarded shared block plus a handful
/// of atomic flags; the simulation itself runs lock-free between the tick
/// boundaries.
pub struct SimulationManager {
    shared: Arc<Shared>,
    target_dimensions: Vector3<f64>,
    two_d: bool,
    /// Consumed by `start`.
    simulator: Option<Simulator>,
    worker: Option<JoinHandle<()>>,
}

impl SimulationManager {
    pub fn new(
        target_dimensions: Vector3<f64>,
        config: SimulationConfig,
        particle_count: usize,
        two_d: bool,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let grid = Arc::new(MacGrid::new(target_dimensions, config.grid_resolution, two_d));
        let fixed_z = two_d.then_some(target_dimensions.z / 2.0);
        let particles = ParticleSet::new(
            particle_count,
            config.particle_radius,
            grid.dimensions,
            grid.cell_d,
            fixed_z,
        );
        let mut snapshot = vec![ParticleSnapshot::default(); particles.len()];
        refresh_snapshot(&mut snapshot, &particles, false);

        let mut simulator = Simulator::new(
            config.simulator,
            particles,
            grid.clone(),
            PressureSolver::new(config.grid_solver),
        );
        simulator.pressure = config.pressure_params();
        simulator.is_top_of_container_solid = config.is_top_of_container_solid;

        let shared = Arc::new(Shared {
            data: Mutex::new(SharedData {
                config,
                obstacles: Vec::new(),
                particle_target: particle_count,
                restart: false,
                snapshot,
                durations: BTreeMap::new(),
                grid,
            }),
            step_signal: Condvar::new(),
            run: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            auto_dt: AtomicBool::new(true),
            calculate_speeds: AtomicBool::new(false),
            dt: AtomicF64::new(0.01),
            last_iteration_seconds: AtomicF64::new(0.01),
        });

        Ok(SimulationManager {
            shared,
            target_dimensions,
            two_d,
            simulator: Some(simulator),
            worker: None,
        })
    }

    /// Spawns the tick loop and lets it run.
    pub fn start(&mut self) {
        let simulator = match self.simulator.take() {
            Some(simulator) => simulator,
            None => return,
        };
        self.shared.run.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let target_dimensions = self.target_dimensions;
        let two_d = self.two_d;
        let initial = self.shared.data.lock().config;
        self.worker = Some(
            std::thread::Builder::new()
                .name("slosh-tick".into())
                .spawn(move || worker_loop(shared, simulator, initial, target_dimensions, two_d))
                .expect("failed to spawn the simulation thread"),
        );
    }

    /// Resets the particles to a fresh random seeding at the next tick
    /// boundary.
    pub fn restart(&self) {
        self.shared.data.lock().restart = true;
    }

    pub fn set_run(&self, run: bool) {
        self.shared.run.store(run, Ordering::SeqCst);
        if run {
            self.shared.step_signal.notify_all();
        }
    }

    /// Advances one tick while the loop is paused.
    pub fn step_once(&self) {
        self.shared.step_signal.notify_all();
    }

    pub fn set_auto_dt(&self, auto_dt: bool) {
        self.shared.auto_dt.store(auto_dt, Ordering::SeqCst);
    }

    /// Fixed tick length used while auto-dt is off.
    pub fn set_simulation_dt(&self, dt: f64) {
        self.shared.dt.set(dt);
    }

    pub fn set_calculate_particle_speeds(&self, calculate: bool) {
        self.shared.calculate_speeds.store(calculate, Ordering::SeqCst);
    }

    pub fn set_config(&self, config: SimulationConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.shared.data.lock().config = config;
        Ok(())
    }

    pub fn config(&self) -> SimulationConfig {
        self.shared.data.lock().config
    }

    /// Replaces the obstacle list. In 2D mode obstacle z poses are pinned
    /// to the slab center.
    pub fn set_obstacles(&self, mut obstacles: Vec<Obstacle>) {
        if self.two_d {
            let z = self.target_dimensions.z / 2.0;
            for obstacle in &mut obstacles {
                obstacle.pos.z = z;
                obstacle.prev_pos.z = z;
                obstacle.speed.z = 0.0;
            }
        }
        self.shared.data.lock().obstacles = obstacles;
    }

    /// Deep clones of the authoritative obstacle list.
    pub fn obstacles(&self) -> Vec<Obstacle> {
        self.shared.data.lock().obstacles.clone()
    }

    pub fn set_particle_num(&self, count: usize) {
        self.shared.data.lock().particle_target = count;
    }

    pub fn particle_num(&self) -> usize {
        self.shared.data.lock().particle_target
    }

    /// The published per-particle positions and speed magnitudes.
    pub fn particle_snapshot(&self) -> Vec<ParticleSnapshot> {
        self.shared.data.lock().snapshot.clone()
    }

    /// Index of a published particle containing `pos`, 0 when none does.
    pub fn particle_index_at(&self, pos: Point3<f64>) -> usize {
        let data = self.shared.data.lock();
        let r2 = (data.config.particle_radius * data.config.particle_radius) as f32;
        for (index, particle) in data.snapshot.iter().enumerate() {
            let d = Point3::new(pos.x as f32, pos.y as f32, pos.z as f32) - particle.pos;
            if d.magnitude2() < r2 {
                return index;
            }
        }
        0
    }

    /// Wall time of the last simulated tick, smoothed, in seconds.
    pub fn last_iteration_time(&self) -> f64 {
        self.shared.last_iteration_seconds.get()
    }

    pub fn step_durations(&self) -> BTreeMap<String, u64> {
        self.shared.data.lock().durations.clone()
    }

    pub fn grid_size(&self) -> Vector3<i32> {
        self.shared.data.lock().grid.size
    }

    pub fn cell_d(&self) -> Vector3<f64> {
        self.shared.data.lock().grid.cell_d
    }

    /// Actual world dimensions of the grid.
    pub fn dimensions(&self) -> Vector3<f64> {
        self.shared.data.lock().grid.dimensions
    }

    /// Cell inspection by world position. Out-of-range queries return a
    /// dummy interior cell instead of failing.
    pub fn cell_at(&self, pos: Point3<f64>) -> CellView {
        let grid = self.shared.data.lock().grid.clone();
        let grid_pos = Vector3::new(
            (pos.x * grid.cell_d_inv.x) as i32,
            (pos.y * grid.cell_d_inv.y) as i32,
            (pos.z * grid.cell_d_inv.z) as i32,
        );
        self.cell_view(&grid, grid_pos)
    }

    /// Cell inspection by grid index, with the same out-of-range fallback.
    pub fn cell_at_index(&self, x: i32, y: i32, z: i32) -> CellView {
        let grid = self.shared.data.lock().grid.clone();
        self.cell_view(&grid, Vector3::new(x, y, z))
    }

    fn cell_view(&self, grid: &MacGrid, mut pos: Vector3<i32>) -> CellView {
        if grid.two_d {
            pos.z = 1;
        }
        if grid.contains(pos) {
            CellView::read(grid.cell(pos))
        } else {
            CellView::read(grid.cell_xyz(0, 0, 1))
        }
    }
}

impl Drop for SimulationManager {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::SeqCst);
        self.shared.step_signal.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn refresh_snapshot(
    snapshot: &mut Vec<ParticleSnapshot>,
    particles: &ParticleSet,
    calculate_speeds: bool,
) {
    snapshot.resize(particles.len(), ParticleSnapshot::default());
    for (slot, particle) in snapshot.iter_mut().zip(particles.particles()) {
        slot.pos = Point3::new(
            particle.pos.x as f32,
            particle.pos.y as f32,
            particle.pos.z as f32,
        );
        if calculate_speeds {
            slot.speed = particle.v.magnitude() as f32;
        }
    }
}

fn worker_loop(
    shared: Arc<Shared>,
    mut simulator: Simulator,
    initial: SimulationConfig,
    target_dimensions: Vector3<f64>,
    two_d: bool,
) {
    let mut current = initial;
    loop {
        let dt = if shared.auto_dt.load(Ordering::SeqCst) {
            shared.last_iteration_seconds.get()
        } else {
            shared.dt.get()
        };

        {
            let mut data = shared.data.lock();

            // fractional spawn counts accrued on the tick clones flow back
            // into the authoritative obstacles
            if data.obstacles.len() == simulator.obstacles.len() {
                for (original, simulated) in data.obstacles.iter_mut().zip(&simulator.obstacles) {
                    if let (
                        ObstacleShape::SphereSource { spawn_debt, .. },
                        ObstacleShape::SphereSource {
                            spawn_debt: simulated_debt,
                            ..
                        },
                    ) = (&mut original.shape, &simulated.shape)
                    {
                        *spawn_debt = *simulated_debt;
                    }
                }
            }

            if data.config.grid_resolution != current.grid_resolution
                || data.config.grid_solver != current.grid_solver
            {
                let grid = Arc::new(MacGrid::new(
                    target_dimensions,
                    data.config.grid_resolution,
                    two_d,
                ));
                info!(
                    "grid reallocated: {}x{}x{} cells, h = {}",
                    grid.size.x, grid.size.y, grid.size.z, grid.cell_d.x
                );
                simulator
                    .particles_mut()
                    .update_grid_params(grid.cell_d, grid.dimensions);
                simulator.set_grid(grid.clone());
                simulator.set_solver(PressureSolver::new(data.config.grid_solver));
                data.grid = grid;
            }
            simulator.pressure = data.config.pressure_params();
            simulator.is_top_of_container_solid = data.config.is_top_of_container_solid;

            if data.particle_target != simulator.particles().len() {
                simulator.particles_mut().set_count(data.particle_target);
            }
            if data.config.particle_radius != current.particle_radius {
                simulator
                    .particles_mut()
                    .set_radius(data.config.particle_radius);
            }
            simulator.config = data.config.simulator;
            current = data.config;

            simulator.obstacles = data
                .obstacles
                .iter()
                .map(|obstacle| {
                    let mut clone = obstacle.clone();
                    clone.compute_speed(dt);
                    clone
                })
                .collect();
            for obstacle in data.obstacles.iter_mut() {
                obstacle.prev_pos = obstacle.pos;
            }

            data.durations = simulator.step_timings();

            if data.restart {
                data.restart = false;
                let grid = simulator.grid().clone();
                let fixed_z = two_d.then_some(target_dimensions.z / 2.0);
                simulator.set_particles(ParticleSet::new(
                    data.particle_target,
                    data.config.particle_radius,
                    grid.dimensions,
                    grid.cell_d,
                    fixed_z,
                ));
            }

            let calculate_speeds = shared.calculate_speeds.load(Ordering::SeqCst);
            let particles = simulator.particles();
            refresh_snapshot(&mut data.snapshot, particles, calculate_speeds);
            data.particle_target = particles.len();

            if !shared.run.load(Ordering::SeqCst) && !shared.terminate.load(Ordering::SeqCst) {
                shared.step_signal.wait(&mut data);
            }
        }
        if shared.terminate.load(Ordering::SeqCst) {
            break;
        }

        let started = Instant::now();
        simulator.simulate(dt);
        let seconds = started.elapsed().as_secs_f64();
        shared
            .last_iteration_seconds
            .set(shared.last_iteration_seconds.get() * 0.8 + 0.2 * seconds);
    }
    info!("simulation thread terminated");
}
