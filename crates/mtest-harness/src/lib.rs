//! Correctness harness for accumulator metrics.
//!
//! A metric under test is compared, batch by batch and in aggregate, against a
//! trusted reference function. [`MetricTester`] owns a pool of rank-bound
//! worker threads joined to one `mtest-dist` rendezvous so the same checks run
//! distributed, each rank feeding a strided share of the batches.
//!
//! - [`compare`]: recursive tolerance comparator over metric results.
//! - [`driver`]: functional and class drivers.
//! - [`probe`]: reduced-precision and differentiability probes.
//! - [`fixtures`]: shared constants and deterministic data.

pub mod batch;
pub mod compare;
pub mod config;
pub mod driver;
mod error;
pub mod fixtures;
pub mod pool;
pub mod port;
pub mod probe;
mod tester;

pub use batch::BatchSeq;
pub use compare::{check_allclose, check_requires_grad, check_tensor_leaves};
pub use config::HarnessConfig;
pub use driver::{ClassCase, ClassOptions, FunctionalCase, TestableMetric};
pub use error::{HarnessError, Phase, Result};
pub use port::PortAllocator;
pub use probe::{PrecisionCase, ProbeTarget};
pub use tester::MetricTester;
