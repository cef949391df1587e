//! End-to-end scenarios driving the whole solver pipeline.

use cgmath::{InnerSpace, Point3, Vector3, Zero};
use more_asserts::{assert_ge, assert_le};
use slosh::grid::PressureParams;
use slosh::{
    MacGrid, Obstacle, Particle, ParticleSet, PressureSolver, SimulationConfig, SimulationManager,
    Simulator, SimulatorConfig, SolverKind, TransferScheme,
};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quiet_pressure(tolerance: f64, max_iterations: u32) -> PressureParams {
    PressureParams {
        pressure_enabled: false,
        residual_tolerance: tolerance,
        max_iterations,
        ..PressureParams::default()
    }
}

fn simulator_with(
    config: SimulatorConfig,
    particles: ParticleSet,
    grid: Arc<MacGrid>,
) -> Simulator {
    let mut simulator = Simulator::new(
        config,
        particles,
        grid,
        PressureSolver::new(SolverKind::Bridson),
    );
    simulator.parallel = false;
    simulator
}

#[test]
fn resting_fluid_stays_at_rest() {
    init_logging();
    let grid = Arc::new(MacGrid::new(Vector3::new(10.0, 10.0, 10.0), 1.0, false));
    let particles = ParticleSet::new(200, 0.1, grid.dimensions, grid.cell_d, None);
    let config = SimulatorConfig {
        gravity_enabled: false,
        push_apart_enabled: false,
        ..SimulatorConfig::default()
    };
    let mut simulator = simulator_with(config, particles, grid);
    simulator.pressure = quiet_pressure(1e-8, 200);

    for _ in 0..10 {
        simulator.simulate(0.01);
    }

    let max_speed = simulator
        .particles()
        .particles()
        .iter()
        .map(|p| p.v.magnitude())
        .fold(0.0, f64::max);
    assert_le!(max_speed, 1e-4);
}

#[test]
fn falling_column_approaches_free_fall() {
    init_logging();
    let grid = Arc::new(MacGrid::new(Vector3::new(10.0, 20.0, 10.0), 1.0, false));
    // a tight column high above the floor
    let particles: Vec<Particle> = (0..100)
        .map(|i| {
            Particle::new(
                Point3::new(5.05, 14.0 + i as f64 * 0.04, 5.05),
                Vector3::zero(),
            )
        })
        .collect();
    let set = ParticleSet::from_particles(particles, 0.1, grid.dimensions, grid.cell_d, None);
    let config = SimulatorConfig {
        gravity: -9.81,
        push_apart_enabled: false,
        transfer_scheme: TransferScheme::Flip,
        flip_ratio: 0.99,
        ..SimulatorConfig::default()
    };
    let mut simulator = simulator_with(config, set, grid.clone());
    simulator.pressure = quiet_pressure(1e-6, 200);

    for _ in 0..100 {
        simulator.simulate(0.01);
    }

    let mean_vy: f64 = simulator
        .particles()
        .particles()
        .iter()
        .map(|p| p.v.y)
        .sum::<f64>()
        / simulator.particles().len() as f64;
    // one second of gravity, allowing for transfer and collision losses
    assert_le!(mean_vy, -0.5 * 9.81);

    // containment still holds on every axis
    let low = grid.cell_d + Vector3::new(0.1, 0.1, 0.1) * 1.01;
    for p in simulator.particles().particles() {
        for axis in 0..3 {
            assert_ge!(p.pos[axis], low[axis] - 1e-9);
            assert_le!(p.pos[axis], grid.dimensions[axis] - low[axis] + 1e-9);
        }
    }
}

#[test]
fn two_d_slab_keeps_z_still_and_divergence_free() {
    init_logging();
    let grid = Arc::new(MacGrid::new(Vector3::new(40.0, 22.0, 3.0), 1.0, true));
    assert_eq!(grid.size, Vector3::new(40, 22, 3));
    let slab_z = 1.5;
    let particles: Vec<Particle> = (0..100)
        .map(|i| {
            Particle::new(
                Point3::new(20.5, 2.0 + i as f64 * 0.18, slab_z),
                Vector3::zero(),
            )
        })
        .collect();
    let set =
        ParticleSet::from_particles(particles, 0.1, grid.dimensions, grid.cell_d, Some(slab_z));
    let config = SimulatorConfig {
        gravity: -176.0,
        transfer_scheme: TransferScheme::Flip,
        flip_ratio: 0.99,
        ..SimulatorConfig::default()
    };
    let mut simulator = simulator_with(config, set, grid.clone());
    simulator.pressure = quiet_pressure(1e-6, 300);

    for _ in 0..200 {
        simulator.simulate(0.01);
    }

    for p in simulator.particles().particles() {
        assert_eq!(p.v.z, 0.0);
        assert_eq!(p.pos.z, slab_z);
    }

    // the projected field is divergence free over the wet interior
    let mut max_divergence = 0.0f64;
    for x in 1..grid.size.x - 1 {
        for y in 1..grid.size.y - 1 {
            let pos = Vector3::new(x, y, 1);
            if grid.cell(pos).is_water() {
                max_divergence = max_divergence.max(grid.face_divergence(pos).abs());
            }
        }
    }
    assert_le!(max_divergence, 1e-4);
}

#[test]
fn no_particle_remains_inside_an_obstacle() {
    init_logging();
    let grid = Arc::new(MacGrid::new(Vector3::new(10.0, 10.0, 10.0), 1.0, false));
    let particles = ParticleSet::new(500, 0.1, grid.dimensions, grid.cell_d, None);
    let config = SimulatorConfig {
        gravity_enabled: false,
        ..SimulatorConfig::default()
    };
    let mut simulator = simulator_with(config, particles, grid);
    simulator.pressure = quiet_pressure(1e-6, 100);
    let center = Point3::new(5.0, 5.0, 5.0);
    simulator.obstacles = vec![Obstacle::sphere(center, 3.0)];

    simulator.simulate(0.01);

    for p in simulator.particles().particles() {
        assert_ge!((p.pos - center).magnitude(), 3.0 + 0.1 - 1e-6);
    }
}

#[test]
fn relaxation_solver_also_settles_fluid() {
    init_logging();
    let grid = Arc::new(MacGrid::new(Vector3::new(10.0, 10.0, 10.0), 1.0, false));
    let particles = ParticleSet::new(150, 0.1, grid.dimensions, grid.cell_d, None);
    let config = SimulatorConfig {
        gravity: -9.81,
        ..SimulatorConfig::default()
    };
    let mut simulator = Simulator::new(
        config,
        particles,
        grid.clone(),
        PressureSolver::new(SolverKind::Basic),
    );
    simulator.parallel = false;
    simulator.pressure = quiet_pressure(1e-6, 100);

    for _ in 0..50 {
        simulator.simulate(0.01);
    }
    // nothing exploded and everything is still inside the container
    let low = grid.cell_d.x + 0.1 * 1.01;
    for p in simulator.particles().particles() {
        assert!(p.v.magnitude().is_finite());
        for axis in 0..3 {
            assert_ge!(p.pos[axis], low - 1e-9);
            assert_le!(p.pos[axis], grid.dimensions[axis] - low + 1e-9);
        }
    }
}

#[test]
fn manager_accrues_fractional_spawns_across_ticks() {
    init_logging();
    let config = SimulationConfig {
        grid_resolution: 1.0,
        particle_radius: 0.1,
        pressure_enabled: false,
        simulator: SimulatorConfig {
            particle_spawning_enabled: true,
            gravity_enabled: false,
            ..SimulatorConfig::default()
        },
        ..SimulationConfig::default()
    };
    let mut manager =
        SimulationManager::new(Vector3::new(10.0, 10.0, 10.0), config, 0, false).unwrap();
    manager.set_auto_dt(false);
    manager.set_simulation_dt(0.01);
    // half a particle per tick: without the spawn debt flowing back to the
    // authoritative obstacle, nothing would ever spawn
    manager.set_obstacles(vec![Obstacle::sphere_source(
        Point3::new(5.0, 5.0, 5.0),
        1.0,
        50.0,
        0.5,
    )]);
    manager.start();
    for _ in 0..500 {
        if !manager.particle_snapshot().is_empty() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!("fractional spawn debt never produced a particle");
}

#[test]
fn pic_flip_apic_all_survive_a_splash() {
    init_logging();
    for scheme in [
        TransferScheme::Pic,
        TransferScheme::Flip,
        TransferScheme::Apic,
    ] {
        let grid = Arc::new(MacGrid::new(Vector3::new(10.0, 10.0, 10.0), 1.0, false));
        let particles = ParticleSet::new(200, 0.1, grid.dimensions, grid.cell_d, None);
        let config = SimulatorConfig {
            gravity: -60.0,
            transfer_scheme: scheme,
            ..SimulatorConfig::default()
        };
        let mut simulator = simulator_with(config, particles, grid.clone());
        simulator.pressure = PressureParams {
            residual_tolerance: 1e-6,
            max_iterations: 120,
            ..PressureParams::default()
        };
        for _ in 0..60 {
            simulator.simulate(0.01);
        }
        let low = grid.cell_d.x + 0.1 * 1.01;
        for p in simulator.particles().particles() {
            assert!(
                p.v.magnitude().is_finite(),
                "{:?} produced non-finite velocities",
                scheme
            );
            for axis in 0..3 {
                assert_ge!(p.pos[axis], low - 1e-9);
                assert_le!(p.pos[axis], grid.dimensions[axis] - low + 1e-9);
            }
        }
    }
}
