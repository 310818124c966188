//! Minimal tensor substrate for the metric correctness harness.
//!
//! `mtest-core` provides the foundational types (`Tensor`, `Device`, `DType`,
//! `Shape`). Tensors are eager and host-resident: values are widened to `f64`
//! and quantised to their dtype on construction and cast, so reduced-precision
//! behaviour (f16/bf16 rounding) is observable without a numeric backend.
//!
//! # Devices
//!
//! - `Device::Cpu`: the host.
//! - `Device::Gpu`: an accelerator tag. Data still lives on the host; moving a
//!   tensor is an explicit one-way copy that changes the tag.

pub mod tensor;
pub mod types;

pub use tensor::{Device, Tensor};
pub use types::{DType, Shape};

pub type Result<T> = std::result::Result<T, TensorError>;

#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("Index {index} out of range for axis of size {size}")]
    IndexOutOfRange { index: i64, size: i64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
