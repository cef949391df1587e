use cgmath::{Point3, Vector3};
use more_asserts::{assert_ge, debug_assert_ge};

/// Trilinear kernel weight of a sample point relative to a face/cell
/// centroid. `cell_d_inv` carries the (possibly anisotropic) inverse cell
/// spacing, so the weight stays well defined on the squashed z slab of the
/// 2D mode.
///
/// Only valid while `pos` is within one cell spacing of the centroid on
/// every axis; the grid stencils guarantee that.
#[inline]
pub fn trilinear_weight(centroid: Point3<f64>, pos: Point3<f64>, cell_d_inv: Vector3<f64>) -> f64 {
    let d = pos - centroid;
    let x = 1.0 - (d.x * cell_d_inv.x).abs();
    let y = 1.0 - (d.y * cell_d_inv.y).abs();
    let z = 1.0 - (d.z * cell_d_inv.z).abs();
    debug_assert_ge!(x, -1e-6);
    debug_assert_ge!(y, -1e-6);
    debug_assert_ge!(z, -1e-6);
    x * y * z
}

/// Gradient of [`trilinear_weight`] with respect to `pos`, used to gather
/// the affine velocity vectors of the APIC transfer.
#[inline]
pub fn trilinear_weight_gradient(
    centroid: Point3<f64>,
    pos: Point3<f64>,
    cell_d_inv: Vector3<f64>,
) -> Vector3<f64> {
    let d = pos - centroid;
    let v = Vector3::new(d.x * cell_d_inv.x, d.y * cell_d_inv.y, d.z * cell_d_inv.z);
    let x_abs = 1.0 - v.x.abs();
    let y_abs = 1.0 - v.y.abs();
    let z_abs = 1.0 - v.z.abs();
    debug_assert_ge!(x_abs, -1e-6);
    debug_assert_ge!(y_abs, -1e-6);
    debug_assert_ge!(z_abs, -1e-6);
    let x_sign = if v.x > 0.0 { -1.0 } else { 1.0 };
    let y_sign = if v.y > 0.0 { -1.0 } else { 1.0 };
    let z_sign = if v.z > 0.0 { -1.0 } else { 1.0 };
    Vector3::new(
        x_sign * y_abs * z_abs * cell_d_inv.x,
        y_sign * x_abs * z_abs * cell_d_inv.y,
        z_sign * x_abs * y_abs * cell_d_inv.z,
    )
}
