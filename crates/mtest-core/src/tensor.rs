//! Eager, host-resident n-d tensor.
//!
//! Every op materialises its result immediately. Values are stored widened to
//! `f64` and rounded to the tensor's dtype, so casting to `F16` really loses
//! precision. Devices are tags: moving a tensor copies it and never aliases
//! the source.

use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{DType, Result, Shape, TensorError};

/// Compute device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Gpu,
}

impl Device {
    /// Whether this is an accelerator (non-host) device.
    pub fn is_accelerator(self) -> bool {
        matches!(self, Device::Gpu)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu => write!(f, "gpu"),
        }
    }
}

impl FromStr for Device {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Gpu),
            other => Err(TensorError::InvalidArgument(format!(
                "unknown device `{other}`"
            ))),
        }
    }
}

/// A tensor.
///
/// Cloning copies the data. `requires_grad` is a tracking tag: ops that are
/// differentiable propagate it from their inputs, comparisons and `detach`
/// drop it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    #[serde(with = "bits")]
    data: Vec<f64>,
    shape: Shape,
    dtype: DType,
    device: Device,
    requires_grad: bool,
}

impl Tensor {
    // ── Constructors ────────────────────────────────────────────────────

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: &Shape, dtype: DType, device: &Device) -> Result<Self> {
        Self::full(0.0, shape, dtype, device)
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: &Shape, dtype: DType, device: &Device) -> Result<Self> {
        Self::full(1.0, shape, dtype, device)
    }

    /// Create a tensor filled with `value`.
    pub fn full(value: f64, shape: &Shape, dtype: DType, device: &Device) -> Result<Self> {
        let n = checked_numel(shape)?;
        Self::from_data_with_dtype(vec![value; n], shape, dtype, device)
    }

    /// Rank-0 tensor holding `value`.
    pub fn scalar(value: f64, dtype: DType, device: &Device) -> Self {
        Self {
            data: vec![dtype.quantize(value)],
            shape: Shape::scalar(),
            dtype,
            device: *device,
            requires_grad: false,
        }
    }

    /// Empty 1-D tensor (shape `[0]`).
    pub fn empty(dtype: DType, device: &Device) -> Self {
        Self {
            data: Vec::new(),
            shape: Shape::new(vec![0]),
            dtype,
            device: *device,
            requires_grad: false,
        }
    }

    /// Create a tensor from f32 data.
    pub fn from_f32(data: &[f32], shape: &Shape, device: &Device) -> Result<Self> {
        let wide = data.iter().map(|&v| v as f64).collect();
        Self::from_data_with_dtype(wide, shape, DType::F32, device)
    }

    /// Create a tensor from f64 data.
    pub fn from_f64(data: &[f64], shape: &Shape, device: &Device) -> Result<Self> {
        Self::from_data_with_dtype(data.to_vec(), shape, DType::F64, device)
    }

    /// Create a tensor from i64 data.
    pub fn from_i64(data: &[i64], shape: &Shape, device: &Device) -> Result<Self> {
        let wide = data.iter().map(|&v| v as f64).collect();
        Self::from_data_with_dtype(wide, shape, DType::I64, device)
    }

    /// Create a boolean tensor.
    pub fn from_bool(data: &[bool], shape: &Shape, device: &Device) -> Result<Self> {
        let wide = data.iter().map(|&v| if v { 1.0 } else { 0.0 }).collect();
        Self::from_data_with_dtype(wide, shape, DType::Bool, device)
    }

    /// Create a tensor from widened data, rounding every value to `dtype`.
    pub fn from_data_with_dtype(
        data: Vec<f64>,
        shape: &Shape,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let expected = checked_numel(shape)?;
        if data.len() != expected {
            return Err(TensorError::InvalidArgument(format!(
                "data length {} does not match shape {} (expected {})",
                data.len(),
                shape,
                expected,
            )));
        }
        Ok(Self {
            data: data.into_iter().map(|v| dtype.quantize(v)).collect(),
            shape: shape.clone(),
            dtype,
            device: *device,
            requires_grad: false,
        })
    }

    /// Stack equally shaped tensors along a new leading axis.
    pub fn stack(tensors: &[Tensor]) -> Result<Tensor> {
        if tensors.is_empty() {
            return Err(TensorError::InvalidArgument("stack of zero tensors".into()));
        }
        let unsqueezed = tensors
            .iter()
            .map(|t| t.reshape(&Shape::new(prepend(1, &t.shape))))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&unsqueezed)
    }

    /// Concatenate tensors along the leading axis.
    pub fn cat(tensors: &[Tensor]) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| TensorError::InvalidArgument("cat of zero tensors".into()))?;
        if first.shape.ndim() == 0 {
            return Err(TensorError::InvalidArgument(
                "zero-dimensional tensors cannot be concatenated".into(),
            ));
        }
        let tail = first.shape.tail();
        let mut rows = 0;
        let mut data = Vec::new();
        let mut requires_grad = false;
        for t in tensors {
            if t.shape.ndim() == 0 || t.shape.tail() != tail {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.0.clone(),
                    got: t.shape.0.clone(),
                });
            }
            if t.dtype != first.dtype {
                return Err(TensorError::DTypeMismatch {
                    expected: first.dtype,
                    got: t.dtype,
                });
            }
            if t.device != first.device {
                return Err(device_mismatch(first.device, t.device));
            }
            rows += t.shape.0[0];
            data.extend_from_slice(&t.data);
            requires_grad |= t.requires_grad;
        }
        Ok(Tensor {
            data,
            shape: Shape::new(prepend(rows, &tail)),
            dtype: first.dtype,
            device: first.device,
            requires_grad,
        })
    }

    // ── Elementwise ops ─────────────────────────────────────────────────

    /// Element-wise addition (with broadcasting).
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, |a, b| a + b)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, |a, b| a - b)
    }

    /// Element-wise multiplication.
    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, |a, b| a * b)
    }

    /// Element-wise division. Integer inputs divide as floats.
    pub fn div(&self, rhs: &Tensor) -> Result<Tensor> {
        let lhs = self.float_if_integral();
        let rhs = rhs.float_if_integral();
        lhs.binary(&rhs, |a, b| a / b)
    }

    /// Element-wise maximum.
    pub fn maximum(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, f64::max)
    }

    /// Element-wise minimum.
    pub fn minimum(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, f64::min)
    }

    /// Element-wise negation.
    pub fn neg(&self) -> Tensor {
        self.unary(|a| -a)
    }

    /// Element-wise absolute value.
    pub fn abs(&self) -> Tensor {
        self.unary(f64::abs)
    }

    /// Element-wise square.
    pub fn square(&self) -> Tensor {
        self.unary(|a| a * a)
    }

    /// Multiply every element by a constant.
    pub fn mul_scalar(&self, value: f64) -> Tensor {
        self.unary(|a| a * value)
    }

    // ── Comparisons ─────────────────────────────────────────────────────

    /// Element-wise equality, as a bool tensor.
    pub fn eq(&self, rhs: &Tensor) -> Result<Tensor> {
        self.compare(rhs, |a, b| a == b)
    }

    /// Element-wise `>=`, as a bool tensor.
    pub fn ge(&self, rhs: &Tensor) -> Result<Tensor> {
        self.compare(rhs, |a, b| a >= b)
    }

    /// Element-wise `== value`.
    pub fn eq_scalar(&self, value: f64) -> Tensor {
        self.predicate(|a| a == value)
    }

    /// Element-wise `!= value`.
    pub fn ne_scalar(&self, value: f64) -> Tensor {
        self.predicate(|a| a != value)
    }

    /// Element-wise `>= value`.
    pub fn ge_scalar(&self, value: f64) -> Tensor {
        self.predicate(|a| a >= value)
    }

    /// Whether any element is non-zero.
    pub fn any(&self) -> bool {
        self.data.iter().any(|&v| v != 0.0)
    }

    // ── Reductions ──────────────────────────────────────────────────────

    /// Sum all elements to a rank-0 tensor. Integer and bool inputs sum as i64.
    pub fn sum_all(&self) -> Tensor {
        let dtype = if self.dtype.is_floating_point() {
            self.dtype
        } else {
            DType::I64
        };
        let mut out = Tensor::scalar(self.data.iter().sum(), dtype, &self.device);
        out.requires_grad = self.requires_grad && dtype.is_floating_point();
        out
    }

    /// Mean of all elements as a rank-0 floating tensor (NaN when empty).
    pub fn mean_all(&self) -> Tensor {
        let src = self.float_if_integral();
        let n = src.data.len() as f64;
        let mut out = Tensor::scalar(src.data.iter().sum::<f64>() / n, src.dtype, &src.device);
        out.requires_grad = src.requires_grad;
        out
    }

    // ── Shape manipulation ──────────────────────────────────────────────

    /// Reshape the tensor.
    pub fn reshape(&self, new_shape: &Shape) -> Result<Tensor> {
        if self.shape.numel() != new_shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.0.clone(),
                got: new_shape.0.clone(),
            });
        }
        let mut out = self.clone();
        out.shape = new_shape.clone();
        Ok(out)
    }

    /// Broadcast to a larger shape.
    pub fn broadcast_to(&self, shape: &Shape) -> Result<Tensor> {
        let target = Tensor::zeros(shape, self.dtype, &self.device)?;
        let out = target.add(self)?;
        if out.shape() != shape {
            return Err(TensorError::ShapeMismatch {
                expected: shape.0.clone(),
                got: self.shape.0.clone(),
            });
        }
        Ok(out)
    }

    /// Flatten to 1-D.
    pub fn flatten(&self) -> Tensor {
        let mut out = self.clone();
        out.shape = Shape::new(vec![self.data.len() as i64]);
        out
    }

    /// Select one entry along the leading axis (negative indices count from the end).
    pub fn get(&self, index: i64) -> Result<Tensor> {
        let size = self.leading_dim()?;
        let idx = if index < 0 { size + index } else { index };
        if idx < 0 || idx >= size {
            return Err(TensorError::IndexOutOfRange { index, size });
        }
        let inner = self.inner_len();
        let start = idx as usize * inner;
        Ok(self.derive(
            self.data[start..start + inner].to_vec(),
            self.shape.tail(),
            self.dtype,
        ))
    }

    /// Gather entries along the leading axis; the result has shape `[k, tail...]`.
    pub fn index_select(&self, indices: &[i64]) -> Result<Tensor> {
        let rows = indices
            .iter()
            .map(|&i| {
                let row = self.get(i)?;
                row.reshape(&Shape::new(prepend(1, row.shape())))
            })
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            let dims = prepend(0, &self.shape.tail());
            return Ok(self.derive(Vec::new(), Shape::new(dims), self.dtype));
        }
        Tensor::cat(&rows)
    }

    /// Slice `len` entries starting at `start` along `axis`.
    pub fn narrow(&self, axis: usize, start: i64, len: i64) -> Result<Tensor> {
        let ndim = self.shape.ndim();
        if axis >= ndim {
            return Err(TensorError::InvalidArgument(format!(
                "axis {axis} out of range for ndim {ndim}"
            )));
        }
        let dim = self.shape.0[axis];
        if start < 0 || len < 0 || start + len > dim {
            return Err(TensorError::IndexOutOfRange {
                index: start + len,
                size: dim,
            });
        }
        let outer: i64 = self.shape.0[..axis].iter().product();
        let inner: i64 = self.shape.0[axis + 1..].iter().product();
        let (dim, start, len, inner) = (dim as usize, start as usize, len as usize, inner as usize);
        let mut data = Vec::with_capacity(outer as usize * len * inner);
        for o in 0..outer as usize {
            let base = (o * dim + start) * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }
        let mut dims = self.shape.0.clone();
        dims[axis] = len as i64;
        Ok(self.derive(data, Shape::new(dims), self.dtype))
    }

    /// Keep the leading-axis blocks where `mask` is true.
    ///
    /// `mask` must be a bool tensor whose shape is a prefix of this tensor's
    /// shape; the result has shape `[count, rest...]`.
    pub fn masked_select(&self, mask: &Tensor) -> Result<Tensor> {
        if mask.dtype != DType::Bool {
            return Err(TensorError::DTypeMismatch {
                expected: DType::Bool,
                got: mask.dtype,
            });
        }
        let prefix = mask.shape.ndim();
        if prefix > self.shape.ndim() || self.shape.0[..prefix] != mask.shape.0[..] {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.0.clone(),
                got: mask.shape.0.clone(),
            });
        }
        let rest = Shape::new(self.shape.0[prefix..].to_vec());
        let block = rest.numel() as usize;
        let mut data = Vec::new();
        let mut count = 0;
        for (i, &m) in mask.data.iter().enumerate() {
            if m != 0.0 {
                data.extend_from_slice(&self.data[i * block..(i + 1) * block]);
                count += 1;
            }
        }
        Ok(self.derive(data, Shape::new(prepend(count, &rest)), self.dtype))
    }

    /// Sorted distinct values as a 1-D tensor.
    pub fn unique(&self) -> Tensor {
        let mut values = self.data.clone();
        values.sort_by(f64::total_cmp);
        values.dedup_by(|a, b| a.to_bits() == b.to_bits());
        let n = values.len() as i64;
        Tensor {
            data: values,
            shape: Shape::new(vec![n]),
            dtype: self.dtype,
            device: self.device,
            requires_grad: false,
        }
    }

    /// Overwrite one element (row-major flat index), rounding to the dtype.
    pub fn set_flat(&mut self, index: usize, value: f64) -> Result<()> {
        let size = self.data.len();
        let slot = self
            .data
            .get_mut(index)
            .ok_or(TensorError::IndexOutOfRange {
                index: index as i64,
                size: size as i64,
            })?;
        *slot = self.dtype.quantize(value);
        Ok(())
    }

    // ── Conversion ──────────────────────────────────────────────────────

    /// Cast to another dtype. Grad tracking survives only float-to-float casts.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        Tensor {
            data: self.data.iter().map(|&v| dtype.quantize(v)).collect(),
            shape: self.shape.clone(),
            dtype,
            device: self.device,
            requires_grad: self.requires_grad && dtype.is_floating_point(),
        }
    }

    /// Copy to a device.
    pub fn to_device(&self, device: &Device) -> Tensor {
        let mut out = self.clone();
        out.device = *device;
        out
    }

    /// Host copy.
    pub fn cpu(&self) -> Tensor {
        self.to_device(&Device::Cpu)
    }

    /// Copy without grad tracking.
    pub fn detach(&self) -> Tensor {
        let mut out = self.clone();
        out.requires_grad = false;
        out
    }

    /// Enable or disable grad tracking. Only floating tensors can require grad.
    pub fn set_requires_grad(&mut self, requires_grad: bool) -> Result<()> {
        if requires_grad && !self.dtype.is_floating_point() {
            return Err(TensorError::InvalidArgument(format!(
                "only floating point tensors can require gradients, got {}",
                self.dtype
            )));
        }
        self.requires_grad = requires_grad;
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// Get the tensor shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Get the tensor dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get the tensor device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of elements.
    pub fn numel(&self) -> i64 {
        self.shape.numel()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn is_floating_point(&self) -> bool {
        self.dtype.is_floating_point()
    }

    /// Row-major values, widened to f64.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn to_vec_f64(&self) -> Vec<f64> {
        self.data.clone()
    }

    pub fn to_vec_f32(&self) -> Vec<f32> {
        self.data.iter().map(|&v| v as f32).collect()
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<f64> {
        match self.data.as_slice() {
            [v] => Ok(*v),
            _ => Err(TensorError::InvalidArgument(format!(
                "item() requires a single element, tensor has shape {}",
                self.shape
            ))),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn derive(&self, data: Vec<f64>, shape: Shape, dtype: DType) -> Tensor {
        Tensor {
            data,
            shape,
            dtype,
            device: self.device,
            requires_grad: self.requires_grad && dtype.is_floating_point(),
        }
    }

    fn leading_dim(&self) -> Result<i64> {
        self.shape.0.first().copied().ok_or_else(|| {
            TensorError::InvalidArgument("cannot index a zero-dimensional tensor".into())
        })
    }

    fn inner_len(&self) -> usize {
        self.shape.tail().numel() as usize
    }

    fn float_if_integral(&self) -> Tensor {
        if self.dtype.is_floating_point() {
            self.clone()
        } else {
            self.to_dtype(DType::F32)
        }
    }

    fn unary(&self, f: impl Fn(f64) -> f64) -> Tensor {
        let data = self.data.iter().map(|&a| self.dtype.quantize(f(a))).collect();
        self.derive(data, self.shape.clone(), self.dtype)
    }

    fn predicate(&self, f: impl Fn(f64) -> bool) -> Tensor {
        let data = self
            .data
            .iter()
            .map(|&a| if f(a) { 1.0 } else { 0.0 })
            .collect();
        Tensor {
            data,
            shape: self.shape.clone(),
            dtype: DType::Bool,
            device: self.device,
            requires_grad: false,
        }
    }

    fn binary(&self, rhs: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
        let dtype = self.dtype.promote(rhs.dtype);
        let (shape, data) = self.broadcast_zip(rhs, |a, b| dtype.quantize(f(a, b)))?;
        Ok(Tensor {
            data,
            shape,
            dtype,
            device: self.device,
            requires_grad: (self.requires_grad || rhs.requires_grad) && dtype.is_floating_point(),
        })
    }

    fn compare(&self, rhs: &Tensor, f: impl Fn(f64, f64) -> bool) -> Result<Tensor> {
        let (shape, data) = self.broadcast_zip(rhs, |a, b| if f(a, b) { 1.0 } else { 0.0 })?;
        Ok(Tensor {
            data,
            shape,
            dtype: DType::Bool,
            device: self.device,
            requires_grad: false,
        })
    }

    fn broadcast_zip(
        &self,
        rhs: &Tensor,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(Shape, Vec<f64>)> {
        if self.device != rhs.device {
            return Err(device_mismatch(self.device, rhs.device));
        }
        if self.shape == rhs.shape {
            let data = self
                .data
                .iter()
                .zip(rhs.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Ok((self.shape.clone(), data));
        }
        let out = Shape::broadcast_shapes(&self.shape, &rhs.shape).ok_or_else(|| {
            TensorError::ShapeMismatch {
                expected: self.shape.0.clone(),
                got: rhs.shape.0.clone(),
            }
        })?;
        let a_strides = contiguous_strides(&self.shape.0);
        let b_strides = contiguous_strides(&rhs.shape.0);
        let n = out.numel() as usize;
        let data = (0..n)
            .map(|flat| {
                let ia = source_index(&out.0, flat, &self.shape.0, &a_strides);
                let ib = source_index(&out.0, flat, &rhs.shape.0, &b_strides);
                f(self.data[ia], rhs.data[ib])
            })
            .collect();
        Ok((out, data))
    }
}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shape.hash(state);
        self.dtype.hash(state);
        self.device.hash(state);
        self.requires_grad.hash(state);
        for v in &self.data {
            v.to_bits().hash(state);
        }
    }
}

fn checked_numel(shape: &Shape) -> Result<usize> {
    if shape.0.iter().any(|&d| d < 0) {
        return Err(TensorError::InvalidArgument(format!(
            "negative dimension in shape {shape}"
        )));
    }
    Ok(shape.numel() as usize)
}

fn prepend(first: i64, rest: &Shape) -> Vec<i64> {
    let mut dims = Vec::with_capacity(rest.ndim() + 1);
    dims.push(first);
    dims.extend_from_slice(&rest.0);
    dims
}

fn device_mismatch(expected: Device, got: Device) -> TensorError {
    TensorError::InvalidArgument(format!(
        "expected all tensors on {expected}, found one on {got}"
    ))
}

fn contiguous_strides(dims: &[i64]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1].max(1) as usize;
    }
    strides
}

/// Map a flat index of the broadcast output back into a (possibly smaller) input.
fn source_index(out_dims: &[i64], flat: usize, in_dims: &[i64], in_strides: &[usize]) -> usize {
    let pad = out_dims.len() - in_dims.len();
    let mut rem = flat;
    let mut idx = 0;
    for axis in (0..out_dims.len()).rev() {
        let d = out_dims[axis] as usize;
        let coord = rem % d;
        rem /= d;
        if axis >= pad && in_dims[axis - pad] != 1 {
            idx += coord * in_strides[axis - pad];
        }
    }
    idx
}

/// Serialise values as IEEE bit patterns so NaN and infinities survive JSON.
mod bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[f64], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_seq(data.iter().map(|v| v.to_bits()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<f64>, D::Error> {
        let raw = Vec::<u64>::deserialize(d)?;
        Ok(raw.into_iter().map(f64::from_bits).collect())
    }
}
