//! Demo programs built on the public runtime surface.
//!
//! Shared between the demo binaries and the test suite. Every entry point
//! expects an initialised runtime on the current thread and leaves the
//! context installed when it returns.

use crate::common::types::ElemType;
use crate::runtime;
use crate::trace::inst::{BinOp, Inst};
use crate::trace::table::THREAD_INDEX;
use crate::trace::Handle;

fn const_f32(x: f64) -> Handle {
    Handle::from_id(runtime::trace_append(Inst::ConstFloat(x), ElemType::F32))
}

fn const_i32(x: i32) -> Handle {
    Handle::from_id(runtime::trace_append(Inst::ConstInt(x), ElemType::I32))
}

fn binary(op: BinOp, a: &Handle, b: &Handle, ty: ElemType) -> Handle {
    let w = runtime::width_of(a.id()).max(runtime::width_of(b.id()));
    let id = runtime::trace_append(Inst::Binary { op, lhs: a.id(), rhs: b.id() }, ty);
    runtime::set_width(id, w);
    Handle::from_id(id)
}

fn add(a: &Handle, b: &Handle) -> Handle {
    binary(BinOp::FAdd, a, b, ElemType::F32)
}

fn sub(a: &Handle, b: &Handle) -> Handle {
    binary(BinOp::FSub, a, b, ElemType::F32)
}

fn mul(a: &Handle, b: &Handle) -> Handle {
    binary(BinOp::FMul, a, b, ElemType::F32)
}

/// Trace one ray per pixel against a unit sphere at (0, 0, -3), evaluate the
/// fused kernel, and return the image as 255-on-hit / 0-on-miss pixels in
/// row-major order.
///
/// With pixel centers mapped to [-1, 1] and unnormalized ray direction
/// d = (fx, fy, -1), the discriminant test reduces to fx^2 + fy^2 <= 1/8, a
/// centered disc covering pi * w * h / 32 pixels.
pub fn render_disc(width: usize, height: usize) -> Vec<i32> {
    let lanes = width * height;
    runtime::set_width(THREAD_INDEX, lanes);
    let gid = Handle::from_id(THREAD_INDEX);

    let w = const_i32(width as i32);
    let px = binary(BinOp::Mod, &gid, &w, ElemType::I32);
    let py = binary(BinOp::FDiv, &gid, &w, ElemType::I32);

    // Pixel centers mapped to [-1, 1] on both axes.
    let half = const_f32(0.5);
    let scale_x = const_f32(2.0 / width as f64);
    let scale_y = const_f32(2.0 / height as f64);
    let one = const_f32(1.0);
    let fx = sub(&mul(&add(&px, &half), &scale_x), &one);
    let fy = sub(&mul(&add(&py, &half), &scale_y), &one);

    // Ray from the origin through the image plane at z = -1; the sphere has
    // radius 1 and center (0, 0, -3). With oc = origin - center = (0, 0, 3),
    // the ray hits iff (2 d.oc)^2 - 4 (d.d) (oc.oc - 1) >= 0.
    let (ocx, ocy, ocz) = (const_f32(0.0), const_f32(0.0), const_f32(3.0));
    let dz = const_f32(-1.0);
    let two = const_f32(2.0);
    let a = {
        let xx = mul(&fx, &fx);
        let yy = mul(&fy, &fy);
        add(&add(&xx, &yy), &mul(&dz, &dz))
    };
    let b = {
        let dot = add(&add(&mul(&fx, &ocx), &mul(&fy, &ocy)), &mul(&dz, &ocz));
        mul(&two, &dot)
    };
    let c = {
        let dot = add(&add(&mul(&ocx, &ocx), &mul(&ocy, &ocy)), &mul(&ocz, &ocz));
        sub(&dot, &one)
    };
    let disc = {
        let four = const_f32(4.0);
        let b2 = mul(&b, &b);
        sub(&b2, &mul(&four, &mul(&a, &c)))
    };

    let zero = const_f32(0.0);
    let hit = binary(BinOp::CmpGe, &disc, &zero, ElemType::Bool);
    let lit = const_i32(255);
    let dark = const_i32(0);
    let pixel = {
        let id = runtime::trace_append(
            Inst::Select { cond: hit.id(), if_true: lit.id(), if_false: dark.id() },
            ElemType::I32,
        );
        runtime::set_width(id, lanes);
        Handle::from_id(id)
    };

    let mut bytes = vec![0u8; lanes * 4];
    runtime::copy_to_host(pixel.id(), &mut bytes);
    bytes.chunks_exact(4).map(|c| i32::from_ne_bytes(c.try_into().unwrap())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disc_coverage_matches_analytic_area() {
        runtime::init();
        let pixels = render_disc(256, 256);
        runtime::destroy();

        assert_eq!(pixels.len(), 256 * 256);
        assert!(pixels.iter().all(|&p| p == 0 || p == 255));
        // Center of the image is inside the disc, the corners are not.
        assert_eq!(pixels[128 * 256 + 128], 255);
        assert_eq!(pixels[0], 0);
        assert_eq!(pixels[256 * 256 - 1], 0);

        // The hit set is the disc fx^2 + fy^2 <= 1/8, whose pixel-space area
        // is pi * w * h / 32; rasterization error stays well under 1%.
        let analytic = std::f64::consts::PI * (256.0 * 256.0) / 32.0;
        let lit = pixels.iter().filter(|&&p| p != 0).count() as f64;
        assert!(
            (lit - analytic).abs() <= analytic * 0.01,
            "{} lit pixels, analytic area {:.0}",
            lit,
            analytic
        );
    }
}
