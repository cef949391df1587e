mod cell;
mod pcg;
mod relaxation;

pub use cell::{Cell, CellType, Face};
pub use pcg::PcgSolver;

use crate::obstacle::{Obstacle, ObstacleShape};
use crate::parallel::parallel_for;
use cgmath::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use strum_macros::{Display, EnumIter};

/// Which pressure solver runs on the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter)]
pub enum SolverKind {
    /// Preconditioned conjugate gradient with a modified incomplete
    /// Cholesky preconditioner (Bridson's formulation).
    Bridson,
    /// Red-black Gauss-Seidel relaxation with over-relaxation.
    Basic,
}

/// Numeric tuning shared by both pressure solvers, copied from the
/// simulation config at every tick.
#[derive(Clone, Copy, Debug)]
pub struct PressureParams {
    pub fluid_density: f64,
    /// Strength of the density relaxation term added to the solver's
    /// right-hand side.
    pub pressure_k: f64,
    /// Kernel-weighted particle count a cell is relaxed towards.
    pub average_pressure: f64,
    /// Gates the density relaxation term, not the projection itself.
    pub pressure_enabled: bool,
    pub max_iterations: u32,
    /// Max-norm residual below which the PCG loop exits.
    pub residual_tolerance: f64,
}

impl Default for PressureParams {
    fn default() -> Self {
        PressureParams {
            fluid_density: 1.0,
            pressure_k: 2.0,
            average_pressure: 2.0,
            pressure_enabled: true,
            max_iterations: 80,
            residual_tolerance: 1e-6,
        }
    }
}

pub enum PressureSolver {
    Bridson(PcgSolver),
    Basic,
}

impl PressureSolver {
    pub fn new(kind: SolverKind) -> Self {
        match kind {
            SolverKind::Bridson => PressureSolver::Bridson(PcgSolver::new()),
            SolverKind::Basic => PressureSolver::Basic,
        }
    }

    /// Projects the working velocities to (approximately) divergence-free.
    /// Returns the iteration count spent.
    pub fn solve(
        &mut self,
        grid: &MacGrid,
        fluid_cells: &[Vector3<i32>],
        params: &PressureParams,
        parallel: bool,
        dt: f64,
    ) -> u32 {
        match self {
            PressureSolver::Bridson(solver) => solver.solve(grid, fluid_cells, params, parallel, dt),
            PressureSolver::Basic => relaxation::solve(grid, params, parallel),
        }
    }
}

#[inline]
pub(crate) fn offset(pos: Vector3<i32>, axis: usize, amount: i32) -> Vector3<i32> {
    let mut p = pos;
    p[axis] += amount;
    p
}

/// The staggered marker-and-cell grid: velocity components on cell faces,
/// type tags and pressure accumulators on cell centers.
///
/// All cell state is atomic, so the grid is shared (`Arc`) between the
/// simulation thread and inspection readers without locking.
pub struct MacGrid {
    /// Cell spacing. Uniform in x/y; in 2D mode z is a single tall slab.
    pub cell_d: Vector3<f64>,
    pub cell_d_inv: Vector3<f64>,
    /// Cell counts per axis.
    pub size: Vector3<i32>,
    /// Actual world dimensions (`size * cell_d`), usually slightly below
    /// the requested ones.
    pub dimensions: Vector3<f64>,
    pub two_d: bool,
    yz_stride: i32,
    cell_count: usize,
    cells: Vec<Cell>,
}

impl MacGrid {
    /// Number of extrapolation sweeps after the pressure solve. Two layers
    /// are enough for the trilinear stencils right outside the fluid.
    pub const EXTRAPOLATION_SWEEPS: usize = 2;

    /// Builds a grid covering `target_dimensions` at `resolution` cells per
    /// unit length. In 2D mode the z axis collapses to three slabs of
    /// height `target_dimensions.z / 3`.
    pub fn new(target_dimensions: Vector3<f64>, resolution: f64, two_d: bool) -> Self {
        let h = 1.0 / resolution;
        let cell_d = Vector3::new(h, h, if two_d { target_dimensions.z / 3.0 } else { h });
        let size = Vector3::new(
            (target_dimensions.x / cell_d.x) as i32,
            (target_dimensions.y / cell_d.y) as i32,
            if two_d { 3 } else { (target_dimensions.z / cell_d.z) as i32 },
        );
        let dimensions = Vector3::new(
            size.x as f64 * cell_d.x,
            size.y as f64 * cell_d.y,
            if two_d { target_dimensions.z } else { size.z as f64 * cell_d.z },
        );
        let cell_count = (size.x * size.y * size.z) as usize;

        let mut cells = Vec::with_capacity(cell_count);
        for x in 0..size.x {
            for y in 0..size.y {
                for z in 0..size.z {
                    let (x, y, z) = (x as f64, y as f64, z as f64);
                    cells.push(Cell::new(
                        [
                            Point3::new((x + 1.0) * cell_d.x, (y + 0.5) * cell_d.y, (z + 0.5) * cell_d.z),
                            Point3::new((x + 0.5) * cell_d.x, (y + 1.0) * cell_d.y, (z + 0.5) * cell_d.z),
                            Point3::new((x + 0.5) * cell_d.x, (y + 0.5) * cell_d.y, (z + 1.0) * cell_d.z),
                        ],
                        Point3::new((x + 0.5) * cell_d.x, (y + 0.5) * cell_d.y, (z + 0.5) * cell_d.z),
                    ));
                }
            }
        }

        let grid = MacGrid {
            cell_d,
            cell_d_inv: Vector3::new(1.0 / cell_d.x, 1.0 / cell_d.y, 1.0 / cell_d.z),
            size,
            dimensions,
            two_d,
            yz_stride: size.y * size.z,
            cell_count,
            cells,
        };
        grid.restore_border_solids(false, false);
        grid
    }

    #[inline]
    fn index(&self, pos: Vector3<i32>) -> usize {
        (pos.x * self.yz_stride + pos.y * self.size.z + pos.z) as usize
    }

    #[inline]
    pub fn cell(&self, pos: Vector3<i32>) -> &Cell {
        &self.cells[self.index(pos)]
    }

    #[inline]
    pub fn cell_xyz(&self, x: i32, y: i32, z: i32) -> &Cell {
        &self.cells[(x * self.yz_stride + y * self.size.z + z) as usize]
    }

    /// Neighbour access with compile-time axis and offset, for the hot
    /// solver loops where the direction is fixed.
    #[inline]
    pub fn neighbor<const AXIS: usize, const OFF: i32>(&self, pos: Vector3<i32>) -> &Cell {
        let mut p = pos;
        p[AXIS] += OFF;
        self.cell(p)
    }

    #[inline]
    pub fn contains(&self, pos: Vector3<i32>) -> bool {
        pos.x >= 0
            && pos.x < self.size.x
            && pos.y >= 0
            && pos.y < self.size.y
            && pos.z >= 0
            && pos.z < self.size.z
    }

    /// The cell containing a world-space point.
    #[inline]
    pub fn cell_at_world(&self, pos: Point3<f64>) -> &Cell {
        self.cell(Vector3::new(
            (pos.x * self.cell_d_inv.x) as i32,
            (pos.y * self.cell_d_inv.y) as i32,
            (pos.z * self.cell_d_inv.z) as i32,
        ))
    }

    /// The eight faces per axis whose centroids form the corner cube around
    /// `pos` on that axis' staggered lattice.
    pub fn faces_around(&self, pos: Point3<f64>) -> [[&Face; 8]; 3] {
        let mut base = [Vector3::new(0, 0, 0); 3];
        for (axis, slot) in base.iter_mut().enumerate() {
            let mut grid_pos = Vector3::new(
                pos.x * self.cell_d_inv.x,
                pos.y * self.cell_d_inv.y,
                pos.z * self.cell_d_inv.z,
            );
            for other in 0..3 {
                if other != axis {
                    grid_pos[other] -= 0.5;
                }
            }
            let mut coord = Vector3::new(grid_pos.x as i32, grid_pos.y as i32, grid_pos.z as i32);
            coord[axis] -= 1;
            *slot = coord;
        }
        [
            self.corner_faces(0, base[0]),
            self.corner_faces(1, base[1]),
            self.corner_faces(2, base[2]),
        ]
    }

    fn corner_faces(&self, axis: usize, c: Vector3<i32>) -> [&Face; 8] {
        [
            &self.cell(c + Vector3::new(1, 1, 1)).faces[axis],
            &self.cell(c + Vector3::new(0, 1, 1)).faces[axis],
            &self.cell(c + Vector3::new(1, 0, 1)).faces[axis],
            &self.cell(c + Vector3::new(1, 1, 0)).faces[axis],
            &self.cell(c + Vector3::new(1, 0, 0)).faces[axis],
            &self.cell(c + Vector3::new(0, 0, 1)).faces[axis],
            &self.cell(c + Vector3::new(0, 1, 0)).faces[axis],
            &self.cell(c + Vector3::new(0, 0, 0)).faces[axis],
        ]
    }

    /// The eight cells whose centers enclose `pos`.
    pub fn cells_around(&self, pos: Point3<f64>) -> [&Cell; 8] {
        let grid_pos = Vector3::new(
            pos.x * self.cell_d_inv.x - 0.5,
            pos.y * self.cell_d_inv.y - 0.5,
            pos.z * self.cell_d_inv.z - 0.5,
        );
        let c = Vector3::new(grid_pos.x as i32, grid_pos.y as i32, grid_pos.z as i32);
        [
            self.cell(c + Vector3::new(1, 1, 1)),
            self.cell(c + Vector3::new(0, 1, 1)),
            self.cell(c + Vector3::new(1, 0, 1)),
            self.cell(c + Vector3::new(1, 1, 0)),
            self.cell(c + Vector3::new(1, 0, 0)),
            self.cell(c + Vector3::new(0, 0, 1)),
            self.cell(c + Vector3::new(0, 1, 0)),
            self.cell(c + Vector3::new(0, 0, 0)),
        ]
    }

    /// Runs `func` for every cell, parallelized over the x axis.
    pub fn for_each_cell<F>(&self, parallel: bool, include_borders: bool, func: F)
    where
        F: Fn(Vector3<i32>, &Cell) + Send + Sync,
    {
        let b = if include_borders { 0 } else { 1 };
        parallel_for(parallel, b as usize..(self.size.x - b) as usize, |x| {
            for y in b..self.size.y - b {
                for z in b..self.size.z - b {
                    let pos = Vector3::new(x as i32, y, z);
                    func(pos, self.cell(pos));
                }
            }
        });
    }

    /// Zeroes every accumulator and resets all cells to AIR.
    pub fn reset(&self, parallel: bool) {
        self.for_each_cell(parallel, true, |_, cell| {
            for face in &cell.faces {
                face.v.set(0.0);
                face.v_star.set(0.0);
                face.weight.set(0.0);
            }
            cell.particle_density.set(0.0);
            cell.set_cell_type(CellType::Air);
        });
    }

    /// Marks the outer shell SOLID (the top row only with `top_solid`) and
    /// zeroes transferred velocities on faces bordering WATER cells.
    pub fn restore_border_solids(&self, parallel: bool, top_solid: bool) {
        let size = self.size;
        parallel_for(parallel, 0..size.y as usize, |y| {
            let y = y as i32;
            for z in 0..size.z {
                self.cell_xyz(0, y, z).set_cell_type(CellType::Solid);
                self.cell_xyz(size.x - 1, y, z).set_cell_type(CellType::Solid);
                if self.cell_xyz(1, y, z).is_water() {
                    self.cell_xyz(0, y, z).faces[0].v.set(0.0);
                }
                if self.cell_xyz(size.x - 2, y, z).is_water() {
                    self.cell_xyz(size.x - 2, y, z).faces[0].v.set(0.0);
                }
            }
        });
        parallel_for(parallel, 0..size.x as usize, |x| {
            let x = x as i32;
            for z in 0..size.z {
                self.cell_xyz(x, 0, z).set_cell_type(CellType::Solid);
                if self.cell_xyz(x, 1, z).is_water() {
                    self.cell_xyz(x, 0, z).faces[1].v.set(0.0);
                }
                if top_solid {
                    self.cell_xyz(x, size.y - 1, z).set_cell_type(CellType::Solid);
                    if self.cell_xyz(x, size.y - 2, z).is_water() {
                        self.cell_xyz(x, size.y - 2, z).faces[1].v.set(0.0);
                    }
                }
            }
            for y in 0..size.y {
                self.cell_xyz(x, y, 0).set_cell_type(CellType::Solid);
                self.cell_xyz(x, y, size.z - 1).set_cell_type(CellType::Solid);
                if self.cell_xyz(x, y, 1).is_water() {
                    self.cell_xyz(x, y, 0).faces[2].v.set(0.0);
                }
                if self.cell_xyz(x, y, size.z - 2).is_water() {
                    self.cell_xyz(x, y, size.z - 2).faces[2].v.set(0.0);
                }
            }
        });
    }

    /// Copies the transferred velocities into the working copies and applies
    /// the gravity increment to interior y faces between non-solid cells.
    pub fn post_p2g_update(&self, parallel: bool, gravity_increment: f64) {
        self.for_each_cell(parallel, true, |pos, cell| {
            for face in &cell.faces {
                face.v_star.set(face.v.get());
            }
            let up = offset(pos, 1, 1);
            if !cell.is_solid() && self.contains(up) && !self.cell(up).is_solid() {
                cell.faces[1].v_star.add(gravity_increment);
            }
        });
    }

    /// Collects all WATER cells in scan order and assigns each its row
    /// index in the pressure system.
    pub fn collect_fluid_cells(&self, out: &mut Vec<Vector3<i32>>) {
        out.clear();
        for x in 1..self.size.x - 1 {
            for y in 1..self.size.y - 1 {
                for z in 1..self.size.z - 1 {
                    let pos = Vector3::new(x, y, z);
                    let cell = self.cell(pos);
                    if cell.is_water() {
                        cell.set_fluid_id(out.len());
                        out.push(pos);
                    }
                }
            }
        }
    }

    /// Sum of the outgoing minus incoming working face velocities, i.e. the
    /// discrete divergence of v* scaled by h.
    pub fn face_divergence(&self, pos: Vector3<i32>) -> f64 {
        let cell = self.cell(pos);
        cell.faces[0].v_star.get() + cell.faces[1].v_star.get() + cell.faces[2].v_star.get()
            - self.neighbor::<0, -1>(pos).faces[0].v_star.get()
            - self.neighbor::<1, -1>(pos).faces[1].v_star.get()
            - self.neighbor::<2, -1>(pos).faces[2].v_star.get()
    }

    /// Grid-aligned world-space bounds of a rectangle obstacle, clamped to
    /// the interior.
    pub fn min_max_rect(&self, pos: Point3<f64>, size: Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
        let center = Vector3::new(
            pos.x * self.cell_d_inv.x,
            pos.y * self.cell_d_inv.y,
            pos.z * self.cell_d_inv.z,
        );
        let d = Vector3::new(
            size.x * self.cell_d_inv.x * 0.5,
            size.y * self.cell_d_inv.y * 0.5,
            size.z * self.cell_d_inv.z * 0.5,
        );
        let min = Vector3::new(
            (center.x - d.x).round().max(1.0),
            (center.y - d.y).round().max(1.0),
            (center.z - d.z).round().max(1.0),
        );
        let max = Vector3::new(
            (center.x + d.x).round().min(self.size.x as f64 - 1.0),
            (center.y + d.y).round().min(self.size.y as f64 - 1.0),
            (center.z + d.z).round().min(self.size.z as f64 - 1.0),
        );
        (
            Vector3::new(min.x * self.cell_d.x, min.y * self.cell_d.y, min.z * self.cell_d.z),
            Vector3::new(max.x * self.cell_d.x, max.y * self.cell_d.y, max.z * self.cell_d.z),
        )
    }

    /// Voxelizes an obstacle: cells inside become SOLID, and faces shared
    /// with WATER cells take the obstacle's velocity component. Sinks do
    /// not voxelize.
    pub fn add_obstacle(&self, obstacle: &Obstacle) {
        let center = Vector3::new(
            obstacle.pos.x * self.cell_d_inv.x,
            obstacle.pos.y * self.cell_d_inv.y,
            obstacle.pos.z * self.cell_d_inv.z,
        );
        match obstacle.shape {
            ObstacleShape::Sphere { radius } | ObstacleShape::SphereSource { radius, .. } => {
                let r = self.cell_d_inv.x * radius;
                let r2 = r * r;
                let min = Vector3::new(
                    (center.x - r).max(1.0) as i32,
                    (center.y - r).max(1.0) as i32,
                    (center.z - r).max(1.0) as i32,
                );
                let max = Vector3::new(
                    (center.x + r).min(self.size.x as f64 - 2.0) as i32,
                    (center.y + r).min(self.size.y as f64 - 2.0) as i32,
                    (center.z + r).min(self.size.z as f64 - 2.0) as i32,
                );
                for x in min.x..=max.x {
                    for y in min.y..=max.y {
                        for z in min.z..=max.z {
                            let c2o =
                                Vector3::new(x as f64 + 0.5, y as f64 + 0.5, z as f64 + 0.5) - center;
                            if c2o.x * c2o.x + c2o.y * c2o.y + c2o.z * c2o.z < r2 {
                                self.stamp_solid_cell(Vector3::new(x, y, z), obstacle.speed);
                            }
                        }
                    }
                }
            }
            ObstacleShape::Rectangle { size } => {
                let d = Vector3::new(
                    size.x * self.cell_d_inv.x * 0.5,
                    size.y * self.cell_d_inv.y * 0.5,
                    size.z * self.cell_d_inv.z * 0.5,
                );
                let min = Vector3::new(
                    (center.x - d.x).round().max(1.0) as i32,
                    (center.y - d.y).round().max(1.0) as i32,
                    (center.z - d.z).round().max(1.0) as i32,
                );
                let max = Vector3::new(
                    (center.x + d.x).round().min(self.size.x as f64 - 1.0) as i32,
                    (center.y + d.y).round().min(self.size.y as f64 - 1.0) as i32,
                    (center.z + d.z).round().min(self.size.z as f64 - 1.0) as i32,
                );
                for x in min.x..max.x {
                    for y in min.y..max.y {
                        for z in min.z..max.z {
                            self.stamp_solid_cell(Vector3::new(x, y, z), obstacle.speed);
                        }
                    }
                }
            }
            ObstacleShape::SphereSink { .. } => {}
        }
    }

    fn stamp_solid_cell(&self, pos: Vector3<i32>, speed: Vector3<f64>) {
        let cell = self.cell(pos);
        cell.set_cell_type(CellType::Solid);
        for axis in 0..3 {
            if self.cell(offset(pos, axis, 1)).is_water() {
                cell.faces[axis].v.set(speed[axis]);
            }
            let below = self.cell(offset(pos, axis, -1));
            if below.is_water() {
                below.faces[axis].v.set(speed[axis]);
            }
        }
    }

    /// Spreads working velocities from the fluid outwards so that G2P
    /// stencils right outside the surface do not read zeros. Only faces
    /// that do not border a WATER cell are overwritten.
    pub fn extrapolate_velocities(&self, parallel: bool, fluid_cells: &[Vector3<i32>]) {
        let valid: Vec<AtomicU8> = (0..self.cell_count).map(|_| AtomicU8::new(u8::MAX)).collect();
        let is_valid = |pos: Vector3<i32>, sweep: u8| {
            self.contains(pos) && valid[self.index(pos)].load(Ordering::Relaxed) <= sweep
        };
        parallel_for(parallel, 0..fluid_cells.len(), |i| {
            valid[self.index(fluid_cells[i])].store(0, Ordering::Relaxed);
        });

        for sweep in 0..Self::EXTRAPOLATION_SWEEPS as u8 {
            self.for_each_cell(parallel, true, |pos, cell| {
                if is_valid(pos, sweep) {
                    return;
                }
                let mut neighbor_count = 0;
                let mut v_sum = Vector3::new(0.0, 0.0, 0.0);
                for axis in 0..3 {
                    for side in [-1, 1] {
                        let neighbor_pos = offset(pos, axis, side);
                        if is_valid(neighbor_pos, sweep) {
                            let neighbor = self.cell(neighbor_pos);
                            v_sum.x += neighbor.faces[0].v_star.get();
                            v_sum.y += neighbor.faces[1].v_star.get();
                            v_sum.z += neighbor.faces[2].v_star.get();
                            neighbor_count += 1;
                        }
                    }
                }
                if neighbor_count > 0 {
                    let average = v_sum / neighbor_count as f64;
                    for axis in 0..3 {
                        let plus = offset(pos, axis, 1);
                        if self.contains(plus) && !self.cell(plus).is_water() {
                            cell.faces[axis].v_star.set(average[axis]);
                        }
                    }
                    valid[self.index(pos)].store(sweep + 1, Ordering::Relaxed);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_grid() -> MacGrid {
        MacGrid::new(Vector3::new(8.0, 8.0, 8.0), 1.0, false)
    }

    #[test]
    fn construction_derives_dimensions_from_resolution() {
        let grid = MacGrid::new(Vector3::new(10.0, 5.0, 7.5), 2.0, false);
        assert_eq!(grid.size, Vector3::new(20, 10, 15));
        assert_eq!(grid.cell_d, Vector3::new(0.5, 0.5, 0.5));
        assert_eq!(grid.dimensions, Vector3::new(10.0, 5.0, 7.5));
    }

    #[test]
    fn two_d_mode_collapses_z_to_three_slabs() {
        let grid = MacGrid::new(Vector3::new(10.0, 6.0, 3.0), 1.0, true);
        assert_eq!(grid.size.z, 3);
        assert_eq!(grid.cell_d.z, 1.0);
        assert_eq!(grid.dimensions.z, 3.0);
    }

    #[test]
    fn outer_shell_is_solid_after_construction() {
        let grid = small_grid();
        for y in 0..grid.size.y {
            for z in 0..grid.size.z {
                assert!(grid.cell_xyz(0, y, z).is_solid());
                assert!(grid.cell_xyz(grid.size.x - 1, y, z).is_solid());
            }
        }
        for x in 0..grid.size.x {
            for z in 0..grid.size.z {
                assert!(grid.cell_xyz(x, 0, z).is_solid());
            }
            for y in 0..grid.size.y {
                assert!(grid.cell_xyz(x, y, 0).is_solid());
                assert!(grid.cell_xyz(x, y, grid.size.z - 1).is_solid());
            }
        }
        // top stays open unless requested
        assert!(!grid.cell_xyz(3, grid.size.y - 1, 3).is_solid());
        grid.restore_border_solids(false, true);
        assert!(grid.cell_xyz(3, grid.size.y - 1, 3).is_solid());
    }

    #[test]
    fn border_faces_towards_water_are_zeroed() {
        let grid = small_grid();
        grid.cell_xyz(1, 4, 4).set_cell_type(CellType::Water);
        grid.cell_xyz(0, 4, 4).faces[0].v.set(3.0);
        grid.restore_border_solids(false, false);
        assert_eq!(grid.cell_xyz(0, 4, 4).faces[0].v.get(), 0.0);
    }

    #[test]
    fn faces_around_encloses_the_sample_point() {
        let grid = small_grid();
        let pos = Point3::new(3.3, 4.7, 2.2);
        let faces = grid.faces_around(pos);
        for (axis, axis_faces) in faces.iter().enumerate() {
            for face in axis_faces {
                for a in 0..3 {
                    assert!(
                        (face.centroid[a] - pos[a]).abs() <= grid.cell_d[a] + 1e-12,
                        "axis {} face too far from sample",
                        axis
                    );
                }
            }
        }
    }

    #[test]
    fn interpolated_face_weights_sum_to_one() {
        let grid = small_grid();
        let pos = Point3::new(3.3, 4.7, 2.2);
        for axis_faces in grid.faces_around(pos).iter() {
            let sum: f64 = axis_faces
                .iter()
                .map(|f| crate::interpolation::trilinear_weight(f.centroid, pos, grid.cell_d_inv))
                .sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn fluid_cell_ids_are_contiguous_in_scan_order() {
        let grid = small_grid();
        grid.cell_xyz(2, 2, 2).set_cell_type(CellType::Water);
        grid.cell_xyz(2, 2, 3).set_cell_type(CellType::Water);
        grid.cell_xyz(5, 3, 2).set_cell_type(CellType::Water);
        let mut fluid_cells = Vec::new();
        grid.collect_fluid_cells(&mut fluid_cells);
        assert_eq!(
            fluid_cells,
            vec![
                Vector3::new(2, 2, 2),
                Vector3::new(2, 2, 3),
                Vector3::new(5, 3, 2)
            ]
        );
        for (id, pos) in fluid_cells.iter().enumerate() {
            assert_eq!(grid.cell(*pos).fluid_id(), id);
        }
    }

    #[test]
    fn voxelized_sphere_stamps_type_and_face_velocity() {
        let grid = small_grid();
        // water next to where the obstacle will land
        grid.cell_xyz(5, 4, 4).set_cell_type(CellType::Water);
        let mut obstacle = Obstacle::sphere(Point3::new(4.5, 4.5, 4.5), 1.0);
        obstacle.speed = Vector3::new(2.0, 0.0, 0.0);
        grid.add_obstacle(&obstacle);
        let cell = grid.cell_xyz(4, 4, 4);
        assert!(cell.is_solid());
        // face between the solid cell and the water neighbour carries the
        // obstacle velocity component along the face normal
        assert_eq!(cell.faces[0].v.get(), 2.0);
    }

    #[test]
    fn sink_does_not_voxelize() {
        let grid = small_grid();
        let sink = Obstacle::sphere_sink(Point3::new(4.5, 4.5, 4.5), 1.5);
        grid.add_obstacle(&sink);
        assert!(!grid.cell_xyz(4, 4, 4).is_solid());
    }

    #[test]
    fn post_p2g_copies_velocities_and_applies_gravity() {
        let grid = small_grid();
        let cell = grid.cell_xyz(3, 3, 3);
        cell.faces[0].v.set(1.5);
        cell.faces[1].v.set(0.5);
        grid.post_p2g_update(false, -0.1);
        assert_eq!(cell.faces[0].v_star.get(), 1.5);
        assert_eq!(cell.faces[1].v_star.get(), 0.5 - 0.1);
        // solid border cells get no gravity
        assert_eq!(grid.cell_xyz(3, 0, 3).faces[1].v_star.get(), 0.0);
    }

    #[test]
    fn extrapolation_fills_faces_next_to_the_fluid() {
        let grid = small_grid();
        let water_pos = Vector3::new(3, 3, 3);
        grid.cell(water_pos).set_cell_type(CellType::Water);
        grid.cell(water_pos).faces[0].v_star.set(2.0);
        grid.cell(water_pos).faces[1].v_star.set(4.0);
        grid.cell(water_pos).faces[2].v_star.set(6.0);
        let fluid_cells = vec![water_pos];
        grid.extrapolate_velocities(false, &fluid_cells);
        // the air neighbour picked up the average of its single valid
        // neighbour
        let air = grid.cell_xyz(4, 3, 3);
        assert_eq!(air.faces[0].v_star.get(), 2.0);
        assert_eq!(air.faces[1].v_star.get(), 4.0);
        assert_eq!(air.faces[2].v_star.get(), 6.0);
        // but the face pointing back into the water was left alone
        let behind = grid.cell_xyz(2, 3, 3);
        assert_eq!(behind.faces[0].v_star.get(), 0.0);
    }

    #[test]
    fn face_divergence_of_uniform_flow_is_zero() {
        let grid = small_grid();
        grid.for_each_cell(false, true, |_, cell| {
            cell.faces[0].v_star.set(1.0);
        });
        assert_eq!(grid.face_divergence(Vector3::new(4, 4, 4)), 0.0);
    }
}
