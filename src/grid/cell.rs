use crate::parallel::AtomicF64;
use cgmath::Point3;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CellType {
    Air = 0,
    Water = 1,
    Solid = 2,
}

/// One velocity sample of the staggered grid. The face on axis `a` of cell
/// (i,j,k) sits between (i,j,k) and its +a neighbour.
#[derive(Debug)]
pub struct Face {
    /// Particle-transferred velocity component: P2G accumulator first, then
    /// the weighted average once the transfer divides by `weight`.
    pub v: AtomicF64,
    /// Working copy (the textbook v*): gravity, pressure projection and
    /// extrapolation act on this one. FLIP reconstructs its delta against
    /// `v`.
    pub v_star: AtomicF64,
    /// Accumulated kernel weight of all contributing particles.
    pub weight: AtomicF64,
    /// World-space face centroid, fixed at construction.
    pub centroid: Point3<f64>,
}

impl Face {
    pub fn new(centroid: Point3<f64>) -> Self {
        Face {
            v: AtomicF64::default(),
            v_star: AtomicF64::default(),
            weight: AtomicF64::default(),
            centroid,
        }
    }
}

/// A MAC cell. Every scalar is an atomic accumulator so the grid can be
/// iterated in parallel and inspected from other threads mid-tick.
#[derive(Debug)]
pub struct Cell {
    /// x, y, z faces (towards the +axis neighbour).
    pub faces: [Face; 3],
    /// World-space cell center.
    pub center: Point3<f64>,
    /// Kernel-weighted particle count, input to the density relaxation term
    /// of the pressure solve.
    pub particle_density: AtomicF64,
    cell_type: AtomicU8,
    fluid_id: AtomicU32,
}

impl Cell {
    pub fn new(face_centroids: [Point3<f64>; 3], center: Point3<f64>) -> Self {
        Cell {
            faces: [
                Face::new(face_centroids[0]),
                Face::new(face_centroids[1]),
                Face::new(face_centroids[2]),
            ],
            center,
            particle_density: AtomicF64::default(),
            cell_type: AtomicU8::new(CellType::Air as u8),
            fluid_id: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn cell_type(&self) -> CellType {
        match self.cell_type.load(Ordering::Relaxed) {
            0 => CellType::Air,
            1 => CellType::Water,
            _ => CellType::Solid,
        }
    }

    #[inline]
    pub fn set_cell_type(&self, cell_type: CellType) {
        self.cell_type.store(cell_type as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_water(&self) -> bool {
        self.cell_type() == CellType::Water
    }

    #[inline]
    pub fn is_solid(&self) -> bool {
        self.cell_type() == CellType::Solid
    }

    /// Row index in the pressure system, valid while this cell is WATER and
    /// the fluid cell list of the current tick is alive.
    #[inline]
    pub fn fluid_id(&self) -> usize {
        self.fluid_id.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn set_fluid_id(&self, id: usize) {
        self.fluid_id.store(id as u32, Ordering::Relaxed);
    }
}
