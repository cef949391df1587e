use super::{offset, CellType, MacGrid, PressureParams};
use crate::parallel::{for_each_indexed_mut, parallel_for};
use cgmath::Vector3;
use log::debug;
use rayon::prelude::*;

// Tuning constants of the modified incomplete Cholesky factorization,
// Bridson's recommended values.
const TAU: f64 = 0.97;
const SIGMA: f64 = 0.25;

/// One row of the Poisson matrix, i.e. one WATER cell.
///
/// Off-diagonals exist only towards +axis WATER neighbours; symmetry
/// provides the -axis entries. The fluid row ids of all six neighbours are
/// precomputed so the serial preconditioner sweeps run without cell-type
/// checks.
#[derive(Clone, Copy)]
struct MatrixRow {
    /// Non-solid neighbour count scaled by dt / (rho * h^2).
    diag: f64,
    off_diag: [f64; 3],
    /// Fluid row id of the +axis WATER neighbour, -1 where there is none.
    plus: [i32; 3],
    minus: [i32; 3],
}

impl Default for MatrixRow {
    fn default() -> Self {
        MatrixRow {
            diag: 0.0,
            off_diag: [0.0; 3],
            plus: [-1; 3],
            minus: [-1; 3],
        }
    }
}

/// Preconditioned conjugate gradient solver for the grid's Poisson system.
///
/// The working vectors live here and are only reallocated when the fluid
/// cell count changes.
pub struct PcgSolver {
    rows: Vec<MatrixRow>,
    precon: Vec<f64>,
    pressure: Vec<f64>,
    residual: Vec<f64>,
    auxiliary: Vec<f64>,
    search: Vec<f64>,
    scratch: Vec<f64>,
}

impl PcgSolver {
    pub fn new() -> Self {
        PcgSolver {
            rows: Vec::new(),
            precon: Vec::new(),
            pressure: Vec::new(),
            residual: Vec::new(),
            auxiliary: Vec::new(),
            search: Vec::new(),
            scratch: Vec::new(),
        }
    }

    fn resize(&mut self, fluid_cell_count: usize) {
        if self.rows.len() != fluid_cell_count {
            self.rows.resize(fluid_cell_count, MatrixRow::default());
            self.precon.resize(fluid_cell_count, 0.0);
            self.pressure.resize(fluid_cell_count, 0.0);
            self.residual.resize(fluid_cell_count, 0.0);
            self.auxiliary.resize(fluid_cell_count, 0.0);
            self.search.resize(fluid_cell_count, 0.0);
            self.scratch.resize(fluid_cell_count, 0.0);
        }
    }

    /// Runs the projection. Returns the number of PCG iterations spent
    /// (0 when the initial divergence was already negligible).
    pub fn solve(
        &mut self,
        grid: &MacGrid,
        fluid_cells: &[Vector3<i32>],
        params: &PressureParams,
        parallel: bool,
        dt: f64,
    ) -> u32 {
        self.resize(fluid_cells.len());
        if fluid_cells.is_empty() {
            return 0;
        }

        self.compute_rhs(grid, fluid_cells, params, parallel);
        let norm2: f64 = self.residual.iter().map(|r| r * r).sum();
        if norm2 < 1e-7 {
            return 0;
        }

        self.build_matrix(grid, fluid_cells, params, parallel, dt);
        self.build_preconditioner();

        for p in self.pressure.iter_mut() {
            *p = 0.0;
        }
        self.apply_preconditioner();
        self.search.copy_from_slice(&self.auxiliary);
        let mut rho = dot(parallel, &self.auxiliary, &self.residual);

        let mut iterations = 0;
        for _ in 0..params.max_iterations {
            self.apply_matrix(parallel);
            let alpha = rho / dot(parallel, &self.search, &self.auxiliary);
            if alpha.is_nan() {
                debug!("pressure solve: search direction degenerated, giving up");
                break;
            }
            mult_add(parallel, &mut self.pressure, &self.search, alpha);
            mult_add(parallel, &mut self.residual, &self.auxiliary, -alpha);
            iterations += 1;

            let mut max_residual = 0.0f64;
            for r in &self.residual {
                max_residual = max_residual.max(r.abs());
            }
            if max_residual < params.residual_tolerance {
                break;
            }

            self.apply_preconditioner();
            let rho_new = dot(parallel, &self.auxiliary, &self.residual);
            let beta = rho_new / rho;
            if beta.is_nan() {
                debug!("pressure solve: residual norm degenerated, giving up");
                break;
            }
            scale_add(parallel, &mut self.search, &self.auxiliary, beta);
            rho = rho_new;
        }

        self.apply_pressure(grid, fluid_cells, params, parallel, dt);
        iterations
    }

    /// Right-hand side: negative divergence (times h), plus the optional
    /// density relaxation term. Written into `residual`.
    fn compute_rhs(
        &mut self,
        grid: &MacGrid,
        fluid_cells: &[Vector3<i32>],
        params: &PressureParams,
        parallel: bool,
    ) {
        let scale = 1.0 / grid.cell_d.x;
        for_each_indexed_mut(parallel, &mut self.residual, |i, out| {
            let pos = fluid_cells[i];
            let relax = if params.pressure_enabled {
                (grid.cell(pos).particle_density.get() - params.average_pressure) * params.pressure_k
            } else {
                0.0
            };
            *out = -scale * grid.face_divergence(pos) + relax;
        });
    }

    fn build_matrix(
        &mut self,
        grid: &MacGrid,
        fluid_cells: &[Vector3<i32>],
        params: &PressureParams,
        parallel: bool,
        dt: f64,
    ) {
        let scale = dt / (params.fluid_density * grid.cell_d.x * grid.cell_d.x);
        for_each_indexed_mut(parallel, &mut self.rows, |i, row| {
            *row = MatrixRow::default();
            let pos = fluid_cells[i];
            for axis in 0..3 {
                let plus = grid.cell(offset(pos, axis, 1));
                match plus.cell_type() {
                    CellType::Water => {
                        row.diag += scale;
                        row.off_diag[axis] = -scale;
                        row.plus[axis] = plus.fluid_id() as i32;
                    }
                    CellType::Air => row.diag += scale,
                    CellType::Solid => {}
                }
                let minus = grid.cell(offset(pos, axis, -1));
                if !minus.is_solid() {
                    row.diag += scale;
                }
                if minus.is_water() {
                    row.minus[axis] = minus.fluid_id() as i32;
                }
            }
        });
    }

    /// Modified incomplete Cholesky, one scalar per fluid row. Serial: each
    /// row references the already-factored -axis rows.
    fn build_preconditioner(&mut self) {
        for i in 0..self.rows.len() {
            let row = self.rows[i];
            let mut e_neg = 0.0;
            let mut e_neg_tau = 0.0;
            for axis in 0..3 {
                let m = row.minus[axis];
                if m >= 0 {
                    let m = m as usize;
                    let neighbor = self.rows[m];
                    let scaled = neighbor.off_diag[axis] * self.precon[m];
                    e_neg += scaled * scaled;
                    let other_offs =
                        neighbor.off_diag[(axis + 1) % 3] + neighbor.off_diag[(axis + 2) % 3];
                    e_neg_tau += scaled * other_offs * self.precon[m];
                }
            }
            let mut e = row.diag - e_neg - e_neg_tau * TAU;
            if e < SIGMA * row.diag {
                e = if row.diag < 1e-6 { 1.0 } else { row.diag };
            }
            self.precon[i] = 1.0 / e.sqrt();
        }
    }

    /// M^-1 * residual -> auxiliary: forward substitution into `scratch`,
    /// then the transposed backward sweep.
    fn apply_preconditioner(&mut self) {
        let n = self.rows.len();
        for i in 0..n {
            let row = self.rows[i];
            let mut q = 0.0;
            for axis in 0..3 {
                let m = row.minus[axis];
                if m >= 0 {
                    let m = m as usize;
                    q += self.rows[m].off_diag[axis] * self.scratch[m] * self.precon[m];
                }
            }
            self.scratch[i] = (self.residual[i] - q) * self.precon[i];
        }
        for i in (0..n).rev() {
            let row = self.rows[i];
            let mut t = 0.0;
            for axis in 0..3 {
                let p = row.plus[axis];
                if p >= 0 {
                    t += row.off_diag[axis] * self.auxiliary[p as usize];
                }
            }
            self.auxiliary[i] = (self.scratch[i] - t * self.precon[i]) * self.precon[i];
        }
    }

    /// auxiliary = A * search
    fn apply_matrix(&mut self, parallel: bool) {
        let rows = &self.rows;
        let search = &self.search;
        for_each_indexed_mut(parallel, &mut self.auxiliary, |i, out| {
            let row = rows[i];
            let mut value = row.diag * search[i];
            for axis in 0..3 {
                let p = row.plus[axis];
                if p >= 0 {
                    value += row.off_diag[axis] * search[p as usize];
                }
                let m = row.minus[axis];
                if m >= 0 {
                    let m = m as usize;
                    value += rows[m].off_diag[axis] * search[m];
                }
            }
            *out = value;
        });
    }

    /// Applies the pressure gradient to the working face velocities.
    fn apply_pressure(
        &self,
        grid: &MacGrid,
        fluid_cells: &[Vector3<i32>],
        params: &PressureParams,
        parallel: bool,
        dt: f64,
    ) {
        let scale = dt / (params.fluid_density * grid.cell_d.x);
        let pressure = &self.pressure;
        parallel_for(parallel, 0..fluid_cells.len(), |i| {
            let pos = fluid_cells[i];
            let cell = grid.cell(pos);
            for axis in 0..3 {
                let plus = grid.cell(offset(pos, axis, 1));
                match plus.cell_type() {
                    CellType::Air => cell.faces[axis].v_star.add(scale * pressure[i]),
                    CellType::Water => cell.faces[axis]
                        .v_star
                        .add(scale * (pressure[i] - pressure[plus.fluid_id()])),
                    CellType::Solid => {}
                }
                let minus = grid.cell(offset(pos, axis, -1));
                if minus.cell_type() == CellType::Air {
                    minus.faces[axis].v_star.add(-scale * pressure[i]);
                }
            }
        });
    }
}

const DOT_CHUNK: usize = 4096;

/// Dot product with a fixed-order chunked reduction, so the parallel sum is
/// identical between runs.
fn dot(parallel: bool, a: &[f64], b: &[f64]) -> f64 {
    if parallel {
        a.par_chunks(DOT_CHUNK)
            .zip(b.par_chunks(DOT_CHUNK))
            .map(|(ca, cb)| ca.iter().zip(cb).map(|(x, y)| x * y).sum::<f64>())
            .collect::<Vec<_>>()
            .into_iter()
            .sum()
    } else {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }
}

/// target += other * scalar
fn mult_add(parallel: bool, target: &mut [f64], other: &[f64], scalar: f64) {
    if parallel {
        target
            .par_iter_mut()
            .zip(other.par_iter())
            .for_each(|(t, o)| *t += o * scalar);
    } else {
        for (t, o) in target.iter_mut().zip(other) {
            *t += o * scalar;
        }
    }
}

/// target = target * scalar + other
fn scale_add(parallel: bool, target: &mut [f64], other: &[f64], scalar: f64) {
    if parallel {
        target
            .par_iter_mut()
            .zip(other.par_iter())
            .for_each(|(t, o)| *t = *t * scalar + o);
    } else {
        for (t, o) in target.iter_mut().zip(other) {
            *t = *t * scalar + o;
        }
    }
}
