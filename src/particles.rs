use cgmath::{InnerSpace, Point3, Vector3, Zero};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

/// A single marker particle. Positions and velocities are double precision
/// for stability over long runs; the affine vectors carry the sub-cell
/// velocity gradient for the APIC transfer.
#[derive(Clone, Debug)]
pub struct Particle {
    pub pos: Point3<f64>,
    pub v: Vector3<f64>,
    pub c: [Vector3<f64>; 3],
}

impl Particle {
    pub fn new(pos: Point3<f64>, v: Vector3<f64>) -> Self {
        Particle {
            pos,
            v,
            c: [Vector3::zero(); 3],
        }
    }
}

/// A bounded cloud of particles with a uniform spatial hash at twice the
/// particle radius, used for the neighbour queries of the push-apart pass.
///
/// Hash layout: `cell_ranges[i]` is the start offset into `particle_ids`
/// for hash cell i, `cell_ranges[i + 1]` its end; after a rehash the ranges
/// concatenate to a permutation of all particle indices.
pub struct ParticleSet {
    particles: Vec<Particle>,
    cell_ranges: Vec<AtomicU32>,
    particle_ids: Vec<AtomicU32>,
    hash_size: Vector3<i32>,
    dimensions: Vector3<f64>,
    cell_d: Vector3<f64>,
    radius: f64,
    diameter_inv: f64,
    /// All particles share this z coordinate in 2D mode.
    pub fixed_z: Option<f64>,
    rng: SmallRng,
    position_snapshot: Vec<Point3<f64>>,
}

impl ParticleSet {
    /// Seeds `num` particles uniformly at random in the upper-interior box,
    /// at rest. `cell_d` and `dimensions` must match the grid's.
    pub fn new(
        num: usize,
        radius: f64,
        dimensions: Vector3<f64>,
        cell_d: Vector3<f64>,
        fixed_z: Option<f64>,
    ) -> Self {
        let mut rng = SmallRng::seed_from_u64(num as u64);
        let mut particles = Vec::with_capacity(num);
        for _ in 0..num {
            let pos = Point3::new(
                rng.gen_range(dimensions.x * 0.5 + cell_d.x..dimensions.x - 1.1 * radius - cell_d.x),
                rng.gen_range(dimensions.y * 0.5 + cell_d.y..dimensions.y - 1.1 * radius - cell_d.y),
                match fixed_z {
                    Some(z) => z,
                    None => rng.gen_range(
                        dimensions.z * 0.5 + cell_d.z..dimensions.z - 1.1 * radius - cell_d.z,
                    ),
                },
            );
            particles.push(Particle::new(pos, Vector3::zero()));
        }
        Self::assemble(particles, radius, dimensions, cell_d, fixed_z, rng)
    }

    /// Builds a set from explicitly placed particles, for scripted scenes.
    pub fn from_particles(
        particles: Vec<Particle>,
        radius: f64,
        dimensions: Vector3<f64>,
        cell_d: Vector3<f64>,
        fixed_z: Option<f64>,
    ) -> Self {
        let rng = SmallRng::seed_from_u64(particles.len() as u64);
        Self::assemble(particles, radius, dimensions, cell_d, fixed_z, rng)
    }

    fn assemble(
        particles: Vec<Particle>,
        radius: f64,
        dimensions: Vector3<f64>,
        cell_d: Vector3<f64>,
        fixed_z: Option<f64>,
        rng: SmallRng,
    ) -> Self {
        let mut set = ParticleSet {
            particles,
            cell_ranges: Vec::new(),
            particle_ids: Vec::new(),
            hash_size: Vector3::new(0, 0, 0),
            dimensions,
            cell_d,
            radius,
            diameter_inv: 1.0 / (radius * 2.0),
            fixed_z,
            rng,
            position_snapshot: Vec::new(),
        };
        set.resize_hash();
        set.rehash(false);
        set
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn dimensions(&self) -> Vector3<f64> {
        self.dimensions
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particle(&self, index: usize) -> &Particle {
        &self.particles[index]
    }

    /// Runs `func` for every particle with its index, mutably.
    pub fn for_each<F>(&mut self, parallel: bool, func: F)
    where
        F: Fn(&mut Particle, usize) + Send + Sync,
    {
        if parallel {
            self.particles
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, p)| func(p, i));
        } else {
            for (i, p) in self.particles.iter_mut().enumerate() {
                func(p, i);
            }
        }
    }

    /// Read-only sibling of [`ParticleSet::for_each`].
    pub fn for_each_read<F>(&self, parallel: bool, func: F)
    where
        F: Fn(&Particle, usize) + Send + Sync,
    {
        if parallel {
            self.particles
                .par_iter()
                .enumerate()
                .for_each(|(i, p)| func(p, i));
        } else {
            for (i, p) in self.particles.iter().enumerate() {
                func(p, i);
            }
        }
    }

    #[inline]
    fn hash_coord(&self, pos: Point3<f64>) -> Vector3<i32> {
        Vector3::new(
            (pos.x * self.diameter_inv) as i32,
            (pos.y * self.diameter_inv) as i32,
            (pos.z * self.diameter_inv) as i32,
        )
    }

    #[inline]
    fn hash_index(&self, coord: Vector3<i32>) -> usize {
        (coord.x * self.hash_size.y * self.hash_size.z + coord.y * self.hash_size.z + coord.z)
            as usize
    }

    fn resize_hash(&mut self) {
        self.hash_size = Vector3::new(
            (self.dimensions.x * self.diameter_inv).ceil() as i32,
            (self.dimensions.y * self.diameter_inv).ceil() as i32,
            (self.dimensions.z * self.diameter_inv).ceil() as i32,
        );
        let hash_cells = (self.hash_size.x * self.hash_size.y * self.hash_size.z) as usize + 1;
        self.cell_ranges.resize_with(hash_cells, || AtomicU32::new(0));
        self.particle_ids
            .resize_with(self.particles.len(), || AtomicU32::new(0));
    }

    /// Rebuilds the spatial hash: atomic per-cell counts, a serial prefix
    /// sum, then an atomic pre-decrement scatter.
    pub fn rehash(&self, parallel: bool) {
        let ranges = &self.cell_ranges;
        let ids = &self.particle_ids;
        crate::parallel::parallel_for(parallel, 0..ranges.len(), |i| {
            ranges[i].store(0, Ordering::Relaxed);
        });
        self.for_each_read(parallel, |particle, _| {
            let index = self.hash_index(self.hash_coord(particle.pos));
            ranges[index].fetch_add(1, Ordering::Relaxed);
        });
        let mut running_total = 0;
        for range in ranges.iter() {
            running_total += range.load(Ordering::Relaxed);
            range.store(running_total, Ordering::Relaxed);
        }
        self.for_each_read(parallel, |particle, p| {
            let index = self.hash_index(self.hash_coord(particle.pos));
            let slot = ranges[index].fetch_sub(1, Ordering::Relaxed) - 1;
            ids[slot as usize].store(p as u32, Ordering::Relaxed);
        });
    }

    /// One relaxation pass separating particles closer than their diameter.
    /// Neighbour positions are read from a snapshot taken before the pass;
    /// both sides of a pair apply their own half of the separation.
    /// Requires a fresh [`ParticleSet::rehash`].
    pub fn push_apart(&mut self, parallel: bool) {
        let diameter = self.radius * 2.0;
        let diameter2 = diameter * diameter;
        let low = Vector3::new(
            self.cell_d.x + self.radius * 1.01,
            self.cell_d.y + self.radius * 1.01,
            self.cell_d.z + self.radius * 1.01,
        );
        let high = self.dimensions - low;
        let fixed_z = self.fixed_z;
        let hash_size = self.hash_size;
        let diameter_inv = self.diameter_inv;

        self.position_snapshot.clear();
        self.position_snapshot
            .extend(self.particles.iter().map(|p| p.pos));

        let snapshot = &self.position_snapshot;
        let ranges = &self.cell_ranges;
        let ids = &self.particle_ids;
        let particles = &mut self.particles;

        let pass = |particle: &mut Particle, index: usize| {
            let own = snapshot[index];
            let coord = Vector3::new(
                (own.x * diameter_inv) as i32,
                (own.y * diameter_inv) as i32,
                (own.z * diameter_inv) as i32,
            );
            let max = Vector3::new(
                (coord.x + 1).min(hash_size.x - 1),
                (coord.y + 1).min(hash_size.y - 1),
                (coord.z + 1).min(hash_size.z - 1),
            );
            for x in (coord.x - 1).max(0)..=max.x {
                for y in (coord.y - 1).max(0)..=max.y {
                    for z in (coord.z - 1).max(0)..=max.z {
                        let cell = (x * hash_size.y * hash_size.z + y * hash_size.z + z) as usize;
                        let start = ranges[cell].load(Ordering::Relaxed) as usize;
                        let end = ranges[cell + 1].load(Ordering::Relaxed) as usize;
                        for slot in start..end {
                            let other = ids[slot].load(Ordering::Relaxed) as usize;
                            if other == index {
                                continue;
                            }
                            let to_self = own - snapshot[other];
                            let distance2 = to_self.magnitude2();
                            if distance2 > diameter2 || distance2 < 1e-8 {
                                continue;
                            }
                            let distance = distance2.sqrt();
                            particle.pos += to_self * ((diameter - distance) / distance * 0.5);
                        }
                    }
                }
            }
            particle.pos.x = particle.pos.x.clamp(low.x, high.x);
            particle.pos.y = particle.pos.y.clamp(low.y, high.y);
            particle.pos.z = match fixed_z {
                Some(z) => z,
                None => particle.pos.z.clamp(low.z, high.z),
            };
        };

        if parallel {
            particles
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, p)| pass(p, i));
        } else {
            for (i, p) in particles.iter_mut().enumerate() {
                pass(p, i);
            }
        }
    }

    /// Grows with random in-box particles or shrinks by truncation.
    pub fn set_count(&mut self, num: usize) {
        self.particles.truncate(num);
        while self.particles.len() < num {
            let pos = Point3::new(
                self.rng.gen_range(
                    1.1 * self.radius + self.cell_d.x
                        ..self.dimensions.x - 1.1 * self.radius - self.cell_d.x,
                ),
                self.rng.gen_range(
                    1.1 * self.radius + self.cell_d.y
                        ..self.dimensions.y - 1.1 * self.radius - self.cell_d.y,
                ),
                match self.fixed_z {
                    Some(z) => z,
                    None => self.rng.gen_range(
                        1.1 * self.radius + self.cell_d.z
                            ..self.dimensions.z - 1.1 * self.radius - self.cell_d.z,
                    ),
                },
            );
            self.particles.push(Particle::new(pos, Vector3::zero()));
        }
        self.resize_hash();
        self.rehash(false);
    }

    pub fn add_particles(&mut self, new_particles: Vec<Particle>) {
        self.particles.extend(new_particles);
        self.resize_hash();
        self.rehash(false);
    }

    /// Removes the given particles (indices into the current ordering),
    /// keeping the relative order of the survivors.
    pub fn remove_particles(&mut self, mut indices: Vec<usize>) {
        if indices.is_empty() {
            return;
        }
        indices.sort_unstable();
        indices.dedup();
        let mut next_removed = 0;
        let mut current = 0;
        self.particles.retain(|_| {
            let remove = next_removed < indices.len() && indices[next_removed] == current;
            if remove {
                next_removed += 1;
            }
            current += 1;
            !remove
        });
        self.resize_hash();
        self.rehash(false);
    }

    /// Changes the particle radius and rebuilds the hash at the new
    /// diameter.
    pub fn set_radius(&mut self, radius: f64) {
        self.radius = radius;
        self.diameter_inv = 1.0 / (radius * 2.0);
        self.resize_hash();
        self.rehash(false);
    }

    /// Adopts new grid geometry: clamps every particle back into the
    /// interior box and rebuilds the hash.
    pub fn update_grid_params(&mut self, cell_d: Vector3<f64>, dimensions: Vector3<f64>) {
        self.cell_d = cell_d;
        self.dimensions = dimensions;
        let low = Vector3::new(
            1.1 * self.radius + cell_d.x,
            1.1 * self.radius + cell_d.y,
            1.1 * self.radius + cell_d.z,
        );
        let high = dimensions - low;
        for particle in &mut self.particles {
            particle.pos.x = particle.pos.x.clamp(low.x, high.x);
            particle.pos.y = particle.pos.y.clamp(low.y, high.y);
            particle.pos.z = match self.fixed_z {
                Some(z) => z,
                None => particle.pos.z.clamp(low.z, high.z),
            };
        }
        self.resize_hash();
        self.rehash(false);
    }
}
