//! Shared constants and deterministic input generators.

use std::collections::BTreeSet;

use mtest_core::{DType, Device, Shape, Tensor};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::Result;

pub const NUM_PROCESSES: usize = 2;
pub const NUM_BATCHES: usize = 2 * NUM_PROCESSES;
pub const BATCH_SIZE: usize = 32;
pub const NUM_CLASSES: usize = 5;
pub const EXTRA_DIM: usize = 3;
pub const THRESHOLD: f64 = 0.5;
pub const START_PORT: u16 = 8088;
pub const MAX_PORT: u16 = 8100;

/// `n` reproducible values in roughly [-1, 1].
pub fn gen_data(n: usize, seed: u64) -> Vec<f32> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f64 / (1u64 << 31) as f64 * 2.0 - 1.0) as f32
        })
        .collect()
}

/// `n` reproducible values in [0, 1].
pub fn gen_positive_data(n: usize, seed: u64) -> Vec<f32> {
    gen_data(n, seed).iter().map(|x| (x + 1.0) / 2.0).collect()
}

/// `n` reproducible labels in `0..num_classes`.
pub fn gen_labels(n: usize, num_classes: usize, seed: u64) -> Vec<i64> {
    let classes = num_classes.max(1) as f32;
    gen_positive_data(n, seed)
        .iter()
        .map(|&x| ((x * classes) as i64).min(num_classes as i64 - 1).max(0))
        .collect()
}

/// Probability-like tensor of the given shape.
pub fn rand_tensor(dims: &[usize], seed: u64, device: &Device) -> Result<Tensor> {
    let shape = Shape::new(dims.iter().map(|&d| d as i64).collect::<Vec<_>>());
    let data = gen_positive_data(shape.numel() as usize, seed);
    Ok(Tensor::from_f32(&data, &shape, device)?)
}

/// Integer label tensor of the given shape.
pub fn randint_tensor(dims: &[usize], num_classes: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let shape = Shape::new(dims.iter().map(|&d| d as i64).collect::<Vec<_>>());
    let data = gen_labels(shape.numel() as usize, num_classes, seed);
    Ok(Tensor::from_i64(&data, &shape, device)?)
}

/// Overwrite a random subset of `x` with `ignore_index`.
///
/// Returns `x` unchanged when it already contains `ignore_index`. Otherwise
/// every 9th or 10th element of a random permutation is replaced, then any
/// class that vanished from a leading-axis row is written back over that
/// row's first ignored element.
pub fn inject_ignore_index<R: Rng>(x: &Tensor, ignore_index: i64, rng: &mut R) -> Result<Tensor> {
    let ignore = ignore_index as f64;
    if x.eq_scalar(ignore).any() {
        return Ok(x.clone());
    }
    let classes: BTreeSet<i64> = x.as_slice().iter().map(|&v| v as i64).collect();
    let mut out = x.clone();
    let n = x.numel() as usize;
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(rng);
    let skip = rng.random_range(9..11);
    for &flat in perm.iter().step_by(skip) {
        out.set_flat(flat, ignore)?;
    }

    let rows = x.shape().0.first().copied().unwrap_or(1).max(1) as usize;
    let row_len = n / rows;
    for row in 0..rows {
        let range = row * row_len..(row + 1) * row_len;
        let values = &out.as_slice()[range.clone()];
        let present: BTreeSet<i64> = values.iter().map(|&v| v as i64).collect();
        let Some(&missing) = classes.iter().find(|c| !present.contains(c)) else {
            continue;
        };
        if let Some(pos) = values.iter().position(|&v| v == ignore) {
            out.set_flat(range.start + pos, missing as f64)?;
        }
    }
    Ok(out)
}

/// Drop samples whose target equals `ignore_index`; returns `(target, preds)`.
pub fn remove_ignore_index(
    target: &Tensor,
    preds: &Tensor,
    ignore_index: Option<i64>,
) -> Result<(Tensor, Tensor)> {
    let Some(ignore) = ignore_index else {
        return Ok((target.clone(), preds.clone()));
    };
    let keep = target.ne_scalar(ignore as f64).to_dtype(DType::Bool);
    Ok((target.masked_select(&keep)?, preds.masked_select(&keep)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cpu() -> Device {
        Device::Cpu
    }

    #[test]
    fn test_gen_data_is_reproducible() {
        assert_eq!(gen_data(16, 7), gen_data(16, 7));
        assert_ne!(gen_data(16, 7), gen_data(16, 8));
        assert!(gen_data(256, 1).iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!(gen_positive_data(256, 1).iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_labels_in_range() {
        let labels = gen_labels(500, NUM_CLASSES, 3);
        assert!(labels.iter().all(|&l| (0..NUM_CLASSES as i64).contains(&l)));
    }

    #[test]
    fn test_inject_keeps_existing_ignore() {
        let x = Tensor::from_i64(&[0, 1, -1, 2], &Shape::new(vec![4]), &cpu()).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(inject_ignore_index(&x, -1, &mut rng).unwrap(), x);
    }

    #[test]
    fn test_inject_marks_roughly_a_tenth() {
        let x = randint_tensor(&[NUM_BATCHES, BATCH_SIZE], NUM_CLASSES, 11, &cpu()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let y = inject_ignore_index(&x, -100, &mut rng).unwrap();
        let marked = y.as_slice().iter().filter(|&&v| v == -100.0).count();
        let n = x.numel() as usize;
        assert!(marked + NUM_BATCHES >= n / 10 && marked <= n / 9 + 1, "marked {marked} of {n}");
    }

    #[test]
    fn test_remove_ignore_index() {
        let target = Tensor::from_i64(&[0, -1, 2, -1], &Shape::new(vec![4]), &cpu()).unwrap();
        let preds = Tensor::from_f32(&[0.1, 0.2, 0.3, 0.4], &Shape::new(vec![4]), &cpu()).unwrap();
        let (t, p) = remove_ignore_index(&target, &preds, Some(-1)).unwrap();
        assert_eq!(t.to_vec_f64(), vec![0.0, 2.0]);
        assert_eq!(p.to_vec_f32(), vec![0.1, 0.3]);
        let (t, _) = remove_ignore_index(&target, &preds, None).unwrap();
        assert_eq!(t.numel(), 4);
    }
}
