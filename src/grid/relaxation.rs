use super::{MacGrid, PressureParams};
use crate::parallel::parallel_for;
use cgmath::Vector3;

const OVER_RELAXATION: f64 = 1.98;

/// Gauss-Seidel style relaxation of the divergence, the cheap alternative
/// to the PCG solver. Always runs the configured iteration count.
///
/// The parallel variant colours cells by (x + y) parity with a z stride of
/// two. That is a layer-wise 2D colouring, not a full red-black split of
/// the 3D stencil, so z neighbours of one colour can land in the same pass;
/// the relaxation tolerates the resulting races.
pub fn solve(grid: &MacGrid, params: &PressureParams, parallel: bool) -> u32 {
    if parallel {
        for _ in 0..params.max_iterations {
            for phase in 0..2 {
                parallel_for(true, 1..(grid.size.x - 1) as usize, |x| {
                    let x = x as i32;
                    for y in 1..grid.size.y - 1 {
                        let start = 1 + (x + y + phase) % 2;
                        let mut z = start;
                        while z < grid.size.z - 1 {
                            relax_cell(grid, params, Vector3::new(x, y, z));
                            z += 2;
                        }
                    }
                });
            }
        }
    } else {
        for _ in 0..params.max_iterations {
            for x in 1..grid.size.x - 1 {
                for y in 1..grid.size.y - 1 {
                    for z in 1..grid.size.z - 1 {
                        relax_cell(grid, params, Vector3::new(x, y, z));
                    }
                }
            }
        }
    }
    params.max_iterations
}

#[inline]
fn relax_cell(grid: &MacGrid, params: &PressureParams, pos: Vector3<i32>) {
    let cell = grid.cell(pos);
    if !cell.is_water() {
        return;
    }
    let x_pos = grid.neighbor::<0, 1>(pos);
    let x_neg = grid.neighbor::<0, -1>(pos);
    let y_pos = grid.neighbor::<1, 1>(pos);
    let y_neg = grid.neighbor::<1, -1>(pos);
    let z_pos = grid.neighbor::<2, 1>(pos);
    let z_neg = grid.neighbor::<2, -1>(pos);

    let s1 = !z_pos.is_solid() as i32;
    let s2 = !z_neg.is_solid() as i32;
    let s3 = !y_pos.is_solid() as i32;
    let s4 = !y_neg.is_solid() as i32;
    let s5 = !x_pos.is_solid() as i32;
    let s6 = !x_neg.is_solid() as i32;
    let open_sides = s1 + s2 + s3 + s4 + s5 + s6;
    if open_sides == 0 {
        return;
    }

    let relax = if params.pressure_enabled {
        (cell.particle_density.get() - params.average_pressure) * params.pressure_k
    } else {
        0.0
    };
    let mut d = -cell.faces[0].v_star.get() - cell.faces[1].v_star.get() - cell.faces[2].v_star.get()
        + x_neg.faces[0].v_star.get()
        + y_neg.faces[1].v_star.get()
        + z_neg.faces[2].v_star.get()
        + relax;
    d = d * OVER_RELAXATION / open_sides as f64;

    if s1 != 0 {
        cell.faces[2].v_star.add(d);
    }
    if s2 != 0 {
        z_neg.faces[2].v_star.add(-d);
    }
    if s3 != 0 {
        cell.faces[1].v_star.add(d);
    }
    if s4 != 0 {
        y_neg.faces[1].v_star.add(-d);
    }
    if s5 != 0 {
        cell.faces[0].v_star.add(d);
    }
    if s6 != 0 {
        x_neg.faces[0].v_star.add(-d);
    }
}
