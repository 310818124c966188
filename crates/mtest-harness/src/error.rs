use mtest_autograd::GradcheckError;
use mtest_core::TensorError;
use mtest_dist::DistError;
use mtest_metric::MetricError;

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Where in a test run a check failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Construction, immutability, scripting, cloning and round-trip checks.
    Setup,
    /// Functional driver, batch `i`.
    Batch(usize),
    /// Class driver, unsynced per-step check at batch `i`.
    Step(usize),
    /// Class driver, per-step check over the union of batches `i..i + world_size`.
    SyncedStep(usize),
    /// Final aggregate against the reference over every batch.
    Aggregate,
    Precision,
    Differentiability,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Batch(i) => write!(f, "batch {i}"),
            Phase::Step(i) => write!(f, "step {i}"),
            Phase::SyncedStep(i) => write!(f, "synced step {i}"),
            Phase::Aggregate => write!(f, "final aggregate"),
            Phase::Precision => write!(f, "precision probe"),
            Phase::Differentiability => write!(f, "differentiability probe"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HarnessError {
    // ── Preconditions ───────────────────────────────────────────────────
    #[error("preds has {preds} batches but target has {target}")]
    LengthMismatch { preds: usize, target: usize },

    #[error("a key is required to compare {0} results")]
    MissingKey(&'static str),

    #[error("key `{0}` not found in result")]
    KeyNotFound(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    // ── Comparison ──────────────────────────────────────────────────────
    #[error("unknown format for comparison: {0}")]
    UnsupportedShape(&'static str),

    #[error(
        "mismatch at [{index}]: actual={actual} expected={expected} diff={diff} atol={atol}"
    )]
    Mismatch {
        index: usize,
        actual: f64,
        expected: f64,
        diff: f64,
        atol: f64,
    },

    #[error("shapes {actual:?} and {expected:?} do not broadcast")]
    ShapeMismatch { actual: Vec<i64>, expected: Vec<i64> },

    #[error("sequence length mismatch: actual={actual} expected={expected}")]
    SequenceLength { actual: usize, expected: usize },

    #[error("leaf `{path}` is a {kind}, expected a tensor")]
    NotATensor { path: String, kind: &'static str },

    #[error("leaf `{path}` has requires_grad={actual} but is_differentiable={expected}")]
    GradFlag {
        path: String,
        actual: bool,
        expected: bool,
    },

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("{metric}: {phase}: {source}")]
    Check {
        metric: String,
        phase: Phase,
        source: Box<HarnessError>,
    },

    // ── Workers ─────────────────────────────────────────────────────────
    #[error("rank {rank}: {source}")]
    Worker {
        rank: usize,
        source: Box<HarnessError>,
    },

    #[error("rank {rank} panicked: {message}")]
    WorkerPanicked { rank: usize, message: String },

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("no free rendezvous port in {start}..={max}")]
    NoFreePort { start: u16, max: u16 },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    // ── Collaborators ───────────────────────────────────────────────────
    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error(transparent)]
    Dist(#[from] DistError),

    #[error(transparent)]
    Gradcheck(#[from] GradcheckError),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl HarnessError {
    /// Attach the metric name and phase to a failure.
    pub fn at(self, metric: &str, phase: Phase) -> HarnessError {
        HarnessError::Check {
            metric: metric.to_string(),
            phase,
            source: Box::new(self),
        }
    }

    /// Whether this failure is only a peer's abort propagating through a collective.
    pub fn is_aborted(&self) -> bool {
        match self {
            HarnessError::Dist(DistError::Aborted) => true,
            HarnessError::Metric(MetricError::Dist(DistError::Aborted)) => true,
            HarnessError::Check { source, .. } | HarnessError::Worker { source, .. } => {
                source.is_aborted()
            }
            _ => false,
        }
    }

    /// Innermost error, through `Check` and `Worker` wrappers.
    pub fn root(&self) -> &HarnessError {
        match self {
            HarnessError::Check { source, .. } | HarnessError::Worker { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}
