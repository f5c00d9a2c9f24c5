//! Element Types
//!
//! The closed set of element-type tags an array can carry, the coarser
//! category lattice used for subtype queries, and the promotion rules for
//! combining two dtypes in a binary operation.
//!
//! ## Category lattice
//!
//! ```text
//! generic
//! ├── bool
//! └── number
//!     ├── integer
//!     │   ├── signedinteger    (int8 .. int64)
//!     │   └── unsignedinteger  (uint8 .. uint64)
//!     └── inexact
//!         ├── floating         (float16, bfloat16, float32, float64)
//!         └── complexfloating  (complex64)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Dtype
// ============================================================================

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dtype {
    /// Boolean
    Bool,
    /// Unsigned 8-bit integer
    Uint8,
    /// Unsigned 16-bit integer
    Uint16,
    /// Unsigned 32-bit integer
    Uint32,
    /// Unsigned 64-bit integer
    Uint64,
    /// Signed 8-bit integer
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// IEEE half precision
    Float16,
    /// IEEE single precision
    Float32,
    /// IEEE double precision
    Float64,
    /// Brain floating point
    Bfloat16,
    /// Complex number made of two single precision floats
    Complex64,
}

impl Dtype {
    /// Every dtype, in declaration order.
    pub const ALL: [Dtype; 14] = [
        Dtype::Bool,
        Dtype::Uint8,
        Dtype::Uint16,
        Dtype::Uint32,
        Dtype::Uint64,
        Dtype::Int8,
        Dtype::Int16,
        Dtype::Int32,
        Dtype::Int64,
        Dtype::Float16,
        Dtype::Float32,
        Dtype::Float64,
        Dtype::Bfloat16,
        Dtype::Complex64,
    ];

    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            Dtype::Bool | Dtype::Uint8 | Dtype::Int8 => 1,
            Dtype::Uint16 | Dtype::Int16 | Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Uint32 | Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::Uint64 | Dtype::Int64 | Dtype::Float64 | Dtype::Complex64 => 8,
        }
    }

    /// Host-visible name
    pub fn name(self) -> &'static str {
        match self {
            Dtype::Bool => "bool_",
            Dtype::Uint8 => "uint8",
            Dtype::Uint16 => "uint16",
            Dtype::Uint32 => "uint32",
            Dtype::Uint64 => "uint64",
            Dtype::Int8 => "int8",
            Dtype::Int16 => "int16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Float16 => "float16",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Bfloat16 => "bfloat16",
            Dtype::Complex64 => "complex64",
        }
    }

    /// Parse a dtype from its name. `bool` is accepted as well as `bool_`.
    pub fn from_name(name: &str) -> Option<Dtype> {
        if name == "bool" {
            return Some(Dtype::Bool);
        }
        Dtype::ALL.iter().copied().find(|d| d.name() == name)
    }

    /// The most specific category this dtype belongs to
    pub fn category(self) -> DtypeCategory {
        match self {
            Dtype::Bool => DtypeCategory::Generic,
            Dtype::Uint8 | Dtype::Uint16 | Dtype::Uint32 | Dtype::Uint64 => {
                DtypeCategory::UnsignedInteger
            }
            Dtype::Int8 | Dtype::Int16 | Dtype::Int32 | Dtype::Int64 => {
                DtypeCategory::SignedInteger
            }
            Dtype::Float16 | Dtype::Float32 | Dtype::Float64 | Dtype::Bfloat16 => {
                DtypeCategory::Floating
            }
            Dtype::Complex64 => DtypeCategory::ComplexFloating,
        }
    }

    pub fn is_bool(self) -> bool {
        self == Dtype::Bool
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self.category(),
            DtypeCategory::SignedInteger | DtypeCategory::UnsignedInteger
        )
    }

    pub fn is_unsigned(self) -> bool {
        self.category() == DtypeCategory::UnsignedInteger
    }

    pub fn is_floating(self) -> bool {
        self.category() == DtypeCategory::Floating
    }

    pub fn is_complex(self) -> bool {
        self == Dtype::Complex64
    }

    /// Floating or complex
    pub fn is_inexact(self) -> bool {
        self.is_floating() || self.is_complex()
    }

    /// Number of bits in the integer representation, if integral
    pub fn int_bits(self) -> Option<u32> {
        match self {
            Dtype::Uint8 | Dtype::Int8 => Some(8),
            Dtype::Uint16 | Dtype::Int16 => Some(16),
            Dtype::Uint32 | Dtype::Int32 => Some(32),
            Dtype::Uint64 | Dtype::Int64 => Some(64),
            _ => None,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Categories
// ============================================================================

/// Abstract dtype category used by subtype queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtypeCategory {
    ComplexFloating,
    Floating,
    Inexact,
    SignedInteger,
    UnsignedInteger,
    Integer,
    Number,
    Generic,
}

impl DtypeCategory {
    pub const ALL: [DtypeCategory; 8] = [
        DtypeCategory::ComplexFloating,
        DtypeCategory::Floating,
        DtypeCategory::Inexact,
        DtypeCategory::SignedInteger,
        DtypeCategory::UnsignedInteger,
        DtypeCategory::Integer,
        DtypeCategory::Number,
        DtypeCategory::Generic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DtypeCategory::ComplexFloating => "complexfloating",
            DtypeCategory::Floating => "floating",
            DtypeCategory::Inexact => "inexact",
            DtypeCategory::SignedInteger => "signedinteger",
            DtypeCategory::UnsignedInteger => "unsignedinteger",
            DtypeCategory::Integer => "integer",
            DtypeCategory::Number => "number",
            DtypeCategory::Generic => "generic",
        }
    }

    pub fn from_name(name: &str) -> Option<DtypeCategory> {
        DtypeCategory::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Immediate parent in the lattice
    pub fn parent(self) -> Option<DtypeCategory> {
        match self {
            DtypeCategory::ComplexFloating | DtypeCategory::Floating => {
                Some(DtypeCategory::Inexact)
            }
            DtypeCategory::SignedInteger | DtypeCategory::UnsignedInteger => {
                Some(DtypeCategory::Integer)
            }
            DtypeCategory::Inexact | DtypeCategory::Integer => Some(DtypeCategory::Number),
            DtypeCategory::Number => Some(DtypeCategory::Generic),
            DtypeCategory::Generic => None,
        }
    }

    /// Reflexive, transitive subtype relation between categories
    pub fn is_sub(self, other: DtypeCategory) -> bool {
        let mut current = Some(self);
        while let Some(c) = current {
            if c == other {
                return true;
            }
            current = c.parent();
        }
        false
    }
}

impl fmt::Display for DtypeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Either side of an `issubdtype` query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtypeLike {
    Dtype(Dtype),
    Category(DtypeCategory),
}

impl From<Dtype> for DtypeLike {
    fn from(d: Dtype) -> Self {
        DtypeLike::Dtype(d)
    }
}

impl From<DtypeCategory> for DtypeLike {
    fn from(c: DtypeCategory) -> Self {
        DtypeLike::Category(c)
    }
}

/// Subtype query over dtypes and categories.
///
/// A concrete dtype is only a subtype of itself among dtypes; a category
/// is never a subtype of a concrete dtype.
pub fn issubdtype(a: impl Into<DtypeLike>, b: impl Into<DtypeLike>) -> bool {
    match (a.into(), b.into()) {
        (DtypeLike::Dtype(a), DtypeLike::Dtype(b)) => a == b,
        (DtypeLike::Dtype(a), DtypeLike::Category(b)) => a.category().is_sub(b),
        (DtypeLike::Category(_), DtypeLike::Dtype(_)) => false,
        (DtypeLike::Category(a), DtypeLike::Category(b)) => a.is_sub(b),
    }
}

// ============================================================================
// Promotion
// ============================================================================

/// Promote two dtypes to the dtype of their binary-operation result.
///
/// - bool yields to anything
/// - complex wins over everything
/// - floats win over integers and keep their own width
/// - float16 with bfloat16 meets at float32
/// - mixed signed/unsigned integers widen to a signed type that holds both,
///   and uint64 with a signed type falls back to float32
pub fn promote_types(lhs: Dtype, rhs: Dtype) -> Dtype {
    use Dtype::*;

    if lhs == rhs {
        return lhs;
    }
    if lhs == Bool {
        return rhs;
    }
    if rhs == Bool {
        return lhs;
    }
    if lhs.is_complex() || rhs.is_complex() {
        return Complex64;
    }

    match (lhs.is_floating(), rhs.is_floating()) {
        (true, true) => {
            return match (lhs, rhs) {
                (Float64, _) | (_, Float64) => Float64,
                (Float32, _) | (_, Float32) => Float32,
                _ => Float32,
            }
        }
        (true, false) => return lhs,
        (false, true) => return rhs,
        (false, false) => {}
    }

    let (lbits, rbits) = (lhs.int_bits().unwrap_or(8), rhs.int_bits().unwrap_or(8));
    match (lhs.is_unsigned(), rhs.is_unsigned()) {
        (true, true) => unsigned_of(lbits.max(rbits)),
        (false, false) => signed_of(lbits.max(rbits)),
        (true, false) => mixed(lbits, rbits),
        (false, true) => mixed(rbits, lbits),
    }
}

fn unsigned_of(bits: u32) -> Dtype {
    match bits {
        8 => Dtype::Uint8,
        16 => Dtype::Uint16,
        32 => Dtype::Uint32,
        _ => Dtype::Uint64,
    }
}

fn signed_of(bits: u32) -> Dtype {
    match bits {
        8 => Dtype::Int8,
        16 => Dtype::Int16,
        32 => Dtype::Int32,
        _ => Dtype::Int64,
    }
}

fn mixed(unsigned_bits: u32, signed_bits: u32) -> Dtype {
    if unsigned_bits == 64 {
        return Dtype::Float32;
    }
    if unsigned_bits < signed_bits {
        signed_of(signed_bits)
    } else {
        signed_of(unsigned_bits * 2)
    }
}

// ============================================================================
// Numeric limits
// ============================================================================

/// Limits of a floating dtype
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatInfo {
    pub dtype: Dtype,
    pub min: f64,
    pub max: f64,
    pub eps: f64,
}

/// Limits of an integer dtype
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntInfo {
    pub dtype: Dtype,
    pub min: i128,
    pub max: i128,
}

/// Floating point limits; `None` for non-inexact dtypes.
/// For complex64 the limits of the component type are reported.
pub fn finfo(dtype: Dtype) -> Option<FloatInfo> {
    let (max, eps) = match dtype {
        Dtype::Float16 => (65504.0, 0.000_976_562_5),
        Dtype::Bfloat16 => (3.389_531_389_251_535_5e38, 0.007_812_5),
        Dtype::Float32 | Dtype::Complex64 => (f32::MAX as f64, f32::EPSILON as f64),
        Dtype::Float64 => (f64::MAX, f64::EPSILON),
        _ => return None,
    };
    Some(FloatInfo {
        dtype,
        min: -max,
        max,
        eps,
    })
}

/// Integer limits; `None` for non-integer dtypes.
pub fn iinfo(dtype: Dtype) -> Option<IntInfo> {
    let bits = dtype.int_bits()?;
    let (min, max) = if dtype.is_unsigned() {
        (0, (1i128 << bits) - 1)
    } else {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    };
    Some(IntInfo { dtype, min, max })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_names_round_trip() {
        for d in Dtype::ALL {
            assert_eq!(Dtype::from_name(d.name()), Some(d));
        }
        assert_eq!(Dtype::from_name("bool"), Some(Dtype::Bool));
        assert_eq!(Dtype::from_name("float128"), None);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(Dtype::Int32.size(), 4);
        assert_eq!(Dtype::Float32.size(), 4);
        assert_eq!(Dtype::Bfloat16.size(), 2);
        assert_eq!(Dtype::Complex64.size(), 8);
    }

    #[test]
    fn test_issubdtype() {
        assert!(issubdtype(Dtype::Float32, DtypeCategory::Floating));
        assert!(issubdtype(Dtype::Float32, DtypeCategory::Number));
        assert!(issubdtype(Dtype::Int8, DtypeCategory::Integer));
        assert!(issubdtype(Dtype::Uint8, DtypeCategory::UnsignedInteger));
        assert!(!issubdtype(Dtype::Uint8, DtypeCategory::SignedInteger));
        assert!(issubdtype(Dtype::Complex64, DtypeCategory::Inexact));
        assert!(issubdtype(Dtype::Bool, DtypeCategory::Generic));
        assert!(!issubdtype(Dtype::Bool, DtypeCategory::Number));
        assert!(issubdtype(DtypeCategory::Floating, DtypeCategory::Inexact));
        assert!(!issubdtype(DtypeCategory::Number, DtypeCategory::Floating));
        assert!(!issubdtype(DtypeCategory::Floating, Dtype::Float32));
        assert!(issubdtype(Dtype::Float16, Dtype::Float16));
        assert!(!issubdtype(Dtype::Float16, Dtype::Float32));
    }

    #[test]
    fn test_promotion() {
        assert_eq!(promote_types(Dtype::Bool, Dtype::Int8), Dtype::Int8);
        assert_eq!(promote_types(Dtype::Int32, Dtype::Float16), Dtype::Float16);
        assert_eq!(promote_types(Dtype::Float16, Dtype::Bfloat16), Dtype::Float32);
        assert_eq!(promote_types(Dtype::Float32, Dtype::Float64), Dtype::Float64);
        assert_eq!(promote_types(Dtype::Uint8, Dtype::Int8), Dtype::Int16);
        assert_eq!(promote_types(Dtype::Uint8, Dtype::Int32), Dtype::Int32);
        assert_eq!(promote_types(Dtype::Uint32, Dtype::Int16), Dtype::Int64);
        assert_eq!(promote_types(Dtype::Uint64, Dtype::Int8), Dtype::Float32);
        assert_eq!(promote_types(Dtype::Uint16, Dtype::Uint64), Dtype::Uint64);
        assert_eq!(promote_types(Dtype::Int64, Dtype::Complex64), Dtype::Complex64);
    }

    #[test]
    fn test_limits() {
        let info = iinfo(Dtype::Int8).unwrap();
        assert_eq!((info.min, info.max), (-128, 127));
        let info = iinfo(Dtype::Uint16).unwrap();
        assert_eq!((info.min, info.max), (0, 65535));
        assert!(iinfo(Dtype::Float32).is_none());

        let info = finfo(Dtype::Float16).unwrap();
        assert_eq!(info.max, 65504.0);
        assert!(finfo(Dtype::Int32).is_none());
    }
}
