//! Kernel sources bundled with the crate.
//!
//! The `.cl` files under `kernels/` are embedded at compile time. Each one has
//! a matching body for the host emulator, installed by
//! [`register_host_kernels`].

use crate::runtime::HostRuntime;

/// An embedded kernel source and its entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSource {
    pub entry_point: &'static str,
    pub source: &'static str,
}

/// `C[i] = alpha * A[i] + B[i]` over `f32`.
///
/// Arguments: `float alpha, global float* A, global float* B, global float* C`.
pub const SAXPY: KernelSource = KernelSource {
    entry_point: "saxpy_kernel",
    source: include_str!("../kernels/saxpy.cl"),
};

/// `C[i] = alpha * A[i] + B[i]` over `u8`, wrapping.
///
/// Arguments: `uchar alpha, global uchar* A, global uchar* B, global uchar* C`.
pub const ADDMUL: KernelSource = KernelSource {
    entry_point: "kernel_addmul",
    source: include_str!("../kernels/addmul.cl"),
};

/// `dst[i] = src[i]` over `f32`.
pub const COPY: KernelSource = KernelSource {
    entry_point: "copy_kernel",
    source: include_str!("../kernels/copy.cl"),
};

pub const ALL: [KernelSource; 3] = [SAXPY, ADDMUL, COPY];

/// Install host bodies for every bundled kernel.
pub fn register_host_kernels(runtime: &HostRuntime) {
    runtime.register_kernel(SAXPY.entry_point, |item| {
        let i = item.global_id();
        let alpha: f32 = item.scalar(0);
        let a: f32 = item.load(1, i);
        let b: f32 = item.load(2, i);
        item.store(3, i, alpha * a + b);
    });

    runtime.register_kernel(ADDMUL.entry_point, |item| {
        let i = item.global_id();
        let alpha: u8 = item.scalar(0);
        let a: u8 = item.load(1, i);
        let b: u8 = item.load(2, i);
        item.store(3, i, alpha.wrapping_mul(a).wrapping_add(b));
    });

    runtime.register_kernel(COPY.entry_point, |item| {
        let i = item.global_id();
        let v: f32 = item.load(0, i);
        item.store(1, i, v);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_declare_their_entry_points() {
        for kernel in ALL {
            let decl = format!("void {}(", kernel.entry_point);
            assert!(kernel.source.contains(&decl), "{} missing", kernel.entry_point);
            assert!(kernel.source.contains("__kernel"));
        }
    }
}
