//! Property tests for tensor slicing, concatenation and dtype casts.

use mtest_core::{DType, Device, Shape, Tensor};
use proptest::prelude::*;

// ── Strategies ───────────────────────────────────────────────────────────

fn cpu() -> Device {
    Device::Cpu
}

/// A stacked batch tensor `[batches, batch_size]` with its raw values.
fn arb_batches() -> impl Strategy<Value = (i64, i64, Vec<f32>)> {
    (1i64..=6, 1i64..=8).prop_flat_map(|(b, n)| {
        (
            Just(b),
            Just(n),
            prop::collection::vec(-100.0f32..100.0, (b * n) as usize),
        )
    })
}

// ── Properties ───────────────────────────────────────────────────────────

proptest! {
    /// Concatenating every batch row rebuilds the flattened source.
    #[test]
    fn cat_of_rows_is_flatten((b, n, data) in arb_batches()) {
        let t = Tensor::from_f32(&data, &Shape::new(vec![b, n]), &cpu()).unwrap();
        let rows: Vec<Tensor> = (0..b).map(|i| t.get(i).unwrap()).collect();
        let joined = Tensor::cat(&rows).unwrap();
        prop_assert_eq!(joined.shape(), &Shape::new(vec![b * n]));
        prop_assert_eq!(joined.to_vec_f32(), data);
    }

    /// `index_select` over a permutation of all rows preserves the multiset of values.
    #[test]
    fn index_select_preserves_sum((b, n, data) in arb_batches()) {
        let t = Tensor::from_f32(&data, &Shape::new(vec![b, n]), &cpu()).unwrap();
        let reversed: Vec<i64> = (0..b).rev().collect();
        let s = t.index_select(&reversed).unwrap();
        prop_assert_eq!(s.shape(), t.shape());
        let diff = (s.sum_all().item().unwrap() - t.sum_all().item().unwrap()).abs();
        prop_assert!(diff < 1e-3);
    }

    /// Narrowing then concatenating the two halves is the identity.
    #[test]
    fn narrow_halves_roundtrip((b, n, data) in arb_batches(), split in 0i64..=6) {
        let split = split.min(b);
        let t = Tensor::from_f32(&data, &Shape::new(vec![b, n]), &cpu()).unwrap();
        let head = t.narrow(0, 0, split).unwrap();
        let rest = t.narrow(0, split, b - split).unwrap();
        let joined = Tensor::cat(&[head, rest]).unwrap();
        prop_assert_eq!(joined, t);
    }

    /// Half-precision casts stay within f16 relative precision.
    #[test]
    fn f16_cast_error_bounded(v in -1000.0f64..1000.0) {
        let t = Tensor::from_f64(&[v], &Shape::new(vec![1]), &cpu()).unwrap();
        let h = t.to_dtype(DType::F16).item().unwrap();
        prop_assert!((h - v).abs() <= v.abs() * 1e-3 + 1e-4);
    }

    /// Masking with an all-true mask keeps every row.
    #[test]
    fn masked_select_all_true((b, n, data) in arb_batches()) {
        let t = Tensor::from_f32(&data, &Shape::new(vec![b, n]), &cpu()).unwrap();
        let mask = Tensor::from_bool(&vec![true; b as usize], &Shape::new(vec![b]), &cpu()).unwrap();
        prop_assert_eq!(t.masked_select(&mask).unwrap(), t);
    }
}
