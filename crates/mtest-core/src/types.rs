//! Element dtypes and tensor shapes.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Supported data types for tensor elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    Bool,
}

impl DType {
    /// Whether values of this dtype can carry gradients.
    pub fn is_floating_point(self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
    }

    /// Result dtype of a binary op between `self` and `other` (the wider wins).
    pub fn promote(self, other: DType) -> DType {
        if self.priority() >= other.priority() {
            self
        } else {
            other
        }
    }

    fn priority(self) -> u8 {
        match self {
            DType::Bool => 0,
            DType::I32 => 1,
            DType::I64 => 2,
            DType::F16 => 3,
            DType::BF16 => 4,
            DType::F32 => 5,
            DType::F64 => 6,
        }
    }

    /// Round a widened value to what this dtype can represent.
    pub fn quantize(self, v: f64) -> f64 {
        match self {
            DType::F64 => v,
            DType::F32 => v as f32 as f64,
            DType::F16 => f16::from_f64(v).to_f64(),
            DType::BF16 => bf16::from_f64(v).to_f64(),
            // `as` saturates and maps NaN to 0, matching an integer cast.
            DType::I64 => v.trunc() as i64 as f64,
            DType::I32 => v.trunc() as i32 as f64,
            DType::Bool => {
                if v != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F64 => write!(f, "f64"),
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::I64 => write!(f, "i64"),
            DType::I32 => write!(f, "i32"),
            DType::Bool => write!(f, "bool"),
        }
    }
}

/// Dimensions of a tensor, outermost first. Rank 0 is a scalar.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub Vec<i64>);

impl Shape {
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Element count; 1 for a scalar.
    pub fn numel(&self) -> i64 {
        self.0.iter().product()
    }

    /// Shape of one entry along the leading axis.
    pub fn tail(&self) -> Shape {
        Shape(self.0.get(1..).unwrap_or_default().to_vec())
    }

    /// Right-aligned broadcast of `a` against `b`; size-1 axes stretch.
    pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Option<Shape> {
        let rank = a.ndim().max(b.ndim());
        let padded = |s: &Shape, axis: usize| {
            let offset = rank - s.ndim();
            if axis < offset { 1 } else { s.0[axis - offset] }
        };
        (0..rank)
            .map(|axis| match (padded(a, axis), padded(b, axis)) {
                (x, y) if x == y => Some(x),
                (1, y) => Some(y),
                (x, 1) => Some(x),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Shape)
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dims: Vec<String> = self.0.iter().map(i64::to_string).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_numel() {
        assert_eq!(Shape::new(vec![2, 3, 4]).numel(), 24);
        assert_eq!(Shape::scalar().numel(), 1);
        assert_eq!(Shape::new(vec![0, 5]).numel(), 0);
    }

    #[test]
    fn test_broadcast_shapes() {
        let s = |d: &[i64]| Shape::new(d.to_vec());
        assert_eq!(Shape::broadcast_shapes(&s(&[3, 1]), &s(&[1, 4])), Some(s(&[3, 4])));
        assert_eq!(Shape::broadcast_shapes(&s(&[]), &s(&[2, 2])), Some(s(&[2, 2])));
        assert_eq!(Shape::broadcast_shapes(&s(&[5]), &s(&[2, 1])), Some(s(&[2, 5])));
        assert_eq!(Shape::broadcast_shapes(&s(&[3]), &s(&[4])), None);
        assert_eq!(s(&[2, 3]).to_string(), "[2, 3]");
    }

    #[test]
    fn test_shape_tail() {
        assert_eq!(Shape::new(vec![4, 8, 3]).tail(), Shape::new(vec![8, 3]));
        assert_eq!(Shape::new(vec![4]).tail(), Shape::scalar());
    }

    #[test]
    fn test_quantize_half_loses_precision() {
        let v = 1.0 + 1e-4;
        assert_eq!(DType::F64.quantize(v), v);
        assert_eq!(DType::F16.quantize(v), 1.0);
        assert_eq!(DType::I64.quantize(-2.7), -2.0);
        assert_eq!(DType::Bool.quantize(0.3), 1.0);
    }

    #[test]
    fn test_promote_prefers_wider() {
        assert_eq!(DType::I64.promote(DType::F16), DType::F16);
        assert_eq!(DType::F32.promote(DType::F64), DType::F64);
        assert_eq!(DType::Bool.promote(DType::I32), DType::I32);
        assert_eq!(DType::F32.promote(DType::F32), DType::F32);
    }

    #[test]
    fn test_floating_point_dtypes() {
        assert!(DType::BF16.is_floating_point());
        assert!(!DType::I32.is_floating_point());
        assert!(!DType::Bool.is_floating_point());
    }
}
