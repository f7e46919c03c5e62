//! Sharding rules for the built-in operator families.
//!
//! Many operator types share the same sharding behavior, so there is an M:1
//! mapping between operator types and rules. The mapping used by default is
//! set up by [`RuleRegistry::with_all_rules`](crate::RuleRegistry::with_all_rules).

mod elementwise;
mod matmul;
mod reduce;
mod shape_preserving;

pub use elementwise::Elementwise;
pub use matmul::MatMul;
pub use reduce::Reduce;
pub use shape_preserving::ShapePreserving;

/// Resolve an axis given as a value in `[-ndim, ndim-1]` to a zero-based
/// axis, or return None if it is out of range.
///
/// Negative axis values count backwards from the last dimension.
pub(crate) fn resolve_axis(ndim: usize, axis: i64) -> Option<usize> {
    let ndim = ndim.min(i64::MAX as usize) as i64;
    if axis < -ndim || axis >= ndim {
        return None;
    }
    if axis >= 0 {
        Some(axis as usize)
    } else {
        Some((ndim + axis) as usize)
    }
}

/// Return the axis of an input with `in_ndim` dimensions which is aligned
/// with axis `out_axis` of an output with `out_ndim` dimensions, when the
/// two are broadcast together (aligned at their trailing axes).
pub(crate) fn aligned_axis(in_ndim: usize, out_ndim: usize, out_axis: usize) -> Option<usize> {
    let offset = out_ndim.checked_sub(in_ndim)?;
    out_axis.checked_sub(offset)
}

/// Return true if an input axis of size `in_size` is broadcast against an
/// output axis of size `out_size`.
pub(crate) fn is_broadcast(in_size: usize, out_size: usize) -> bool {
    in_size == 1 && out_size != 1
}
