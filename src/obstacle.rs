use cgmath::{Point3, Vector3, Zero};
use serde::{Deserialize, Serialize};

/// A movable body the fluid collides with.
///
/// `speed` is derived from the current and previous pose; the manager calls
/// [`Obstacle::compute_speed`] once per tick before handing clones to the
/// simulator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Obstacle {
    pub pos: Point3<f64>,
    pub prev_pos: Point3<f64>,
    pub speed: Vector3<f64>,
    pub shape: ObstacleShape,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ObstacleShape {
    Sphere {
        radius: f64,
    },
    /// Axis-aligned box, `size` is the full extent per axis.
    Rectangle {
        size: Vector3<f64>,
    },
    /// Solid sphere that emits particles from its surface. `spawn_debt`
    /// accumulates the fractional particles per tick so non-integer
    /// spawn counts accrue across ticks.
    SphereSource {
        radius: f64,
        /// Particles per second.
        spawn_rate: f64,
        /// Speed of freshly emitted particles along the outward normal.
        spawn_speed: f64,
        spawn_debt: f64,
    },
    /// Sphere that removes any particle entering it (when despawning is
    /// enabled). Does not voxelize into the grid.
    SphereSink {
        radius: f64,
    },
}

impl Obstacle {
    fn with_shape(pos: Point3<f64>, shape: ObstacleShape) -> Self {
        Obstacle {
            pos,
            prev_pos: pos,
            speed: Vector3::zero(),
            shape,
        }
    }

    pub fn sphere(pos: Point3<f64>, radius: f64) -> Self {
        Self::with_shape(pos, ObstacleShape::Sphere { radius })
    }

    pub fn rectangle(pos: Point3<f64>, size: Vector3<f64>) -> Self {
        Self::with_shape(pos, ObstacleShape::Rectangle { size })
    }

    pub fn sphere_source(pos: Point3<f64>, radius: f64, spawn_rate: f64, spawn_speed: f64) -> Self {
        Self::with_shape(
            pos,
            ObstacleShape::SphereSource {
                radius,
                spawn_rate,
                spawn_speed,
                spawn_debt: 0.0,
            },
        )
    }

    pub fn sphere_sink(pos: Point3<f64>, radius: f64) -> Self {
        Self::with_shape(pos, ObstacleShape::SphereSink { radius })
    }

    /// Moves the obstacle, remembering the previous pose for the velocity
    /// derivation.
    pub fn set_new_pos(&mut self, pos: Point3<f64>) {
        self.prev_pos = self.pos;
        self.pos = pos;
    }

    pub fn compute_speed(&mut self, dt: f64) {
        self.speed = (self.pos - self.prev_pos) / dt;
    }
}
