//! This module provides `StaticSize`.

/// A serializable object that knows the size of its
/// [`bincode`](../../bincode/index.html) representation, so records can
/// reserve room for it before it is computed.
pub trait StaticSize {
    /// Returns the number of bytes of the serialized object.
    fn size() -> usize;
}

impl StaticSize for u64 {
    fn size() -> usize {
        8
    }
}
