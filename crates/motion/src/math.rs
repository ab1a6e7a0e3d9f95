//! Float intrinsic shims: `std` methods on hosts, `libm` on bare metal.

#![allow(dead_code)]

#[cfg(feature = "std")]
mod imp {
    #[inline(always)]
    pub fn sqrtf(x: f32) -> f32 {
        x.sqrt()
    }
    #[inline(always)]
    pub fn ceilf(x: f32) -> f32 {
        x.ceil()
    }
    #[inline(always)]
    pub fn floorf(x: f32) -> f32 {
        x.floor()
    }
    #[inline(always)]
    pub fn roundf(x: f32) -> f32 {
        x.round()
    }
    #[inline(always)]
    pub fn fabsf(x: f32) -> f32 {
        x.abs()
    }
}

#[cfg(all(not(feature = "std"), feature = "libm"))]
mod imp {
    pub use libm::{ceilf, fabsf, floorf, roundf, sqrtf};
}

#[cfg(all(not(feature = "std"), not(feature = "libm")))]
compile_error!("the `motion` crate needs either the `std` or the `libm` feature");

pub(crate) use imp::*;

/// `x²`, spelled out; squared speeds are this crate's working currency.
#[inline(always)]
pub(crate) fn sq(x: f32) -> f32 {
    x * x
}

/// Nearest integer as `i32`.
#[inline(always)]
pub(crate) fn lroundf(x: f32) -> i32 {
    roundf(x) as i32
}
