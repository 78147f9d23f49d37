//! Element dtype classification for sharded parameters.
//!
//! The discrimination is a tagged enum computed once per parameter at
//! construction time, not a runtime string compare on the hot path.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    F32,
    F16,
    Bf16,
}

impl Dtype {
    /// Size in bytes of one element of this dtype.
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F16 | Dtype::Bf16 => 2,
        }
    }

    /// Whether this dtype is one of the low-precision ("half") types that
    /// requires a float32 master shard for accumulation.
    pub fn is_low_precision(&self) -> bool {
        matches!(self, Dtype::F16 | Dtype::Bf16)
    }
}

/// Fixed iteration order over dtypes, pinned explicitly so that every
/// participant walks grad buffers in the same sequence (spec §9: collective
/// ordering depends on this, and a `HashMap`'s insertion order is not a
/// contract).
pub const DTYPE_ORDER: [Dtype; 3] = [Dtype::F32, Dtype::F16, Dtype::Bf16];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_precision_classification() {
        assert!(!Dtype::F32.is_low_precision());
        assert!(Dtype::F16.is_low_precision());
        assert!(Dtype::Bf16.is_low_precision());
    }

    #[test]
    fn sizes() {
        assert_eq!(Dtype::F32.size_bytes(), 4);
        assert_eq!(Dtype::F16.size_bytes(), 2);
        assert_eq!(Dtype::Bf16.size_bytes(), 2);
    }

    #[test]
    fn order_is_fixed() {
        assert_eq!(DTYPE_ORDER, [Dtype::F32, Dtype::F16, Dtype::Bf16]);
    }
}
