//! Test-suite facade: one worker pool and rendezvous shared by every test.

use std::marker::PhantomData;
use std::sync::Arc;

use mtest_autograd::Differentiable;
use mtest_core::{Device, Tensor};
use mtest_dist::{Endpoint, GroupHandle};
use mtest_metric::MetricArgs;
use tracing::info;

use crate::config::HarnessConfig;
use crate::driver::{ClassCase, FunctionalCase, TestableMetric, class_test, functional_test};
use crate::pool::{WorkerContext, WorkerPool, WorkerTask};
use crate::port::PortAllocator;
use crate::probe::{self, PrecisionCase, ProbeTarget};
use crate::{HarnessError, Result};

/// Owns the worker pool and rendezvous for a suite of metric tests.
///
/// Built once with [`MetricTester::setup`]; the pool lives until
/// [`MetricTester::teardown`] or drop.
pub struct MetricTester {
    config: HarnessConfig,
    atol: f64,
    ports: PortAllocator,
    pool: Option<WorkerPool>,
    group: Option<GroupHandle>,
}

impl MetricTester {
    /// Bind a rendezvous, start `num_processes` workers and join them to it.
    pub fn setup(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let mut ports = PortAllocator::new(config.start_port, config.max_port)?;
        let group = ports.bind(&config.master_addr, config.num_processes)?;
        let pool = WorkerPool::spawn(config.num_processes)?;
        pool.init(group.endpoint())?;
        info!(
            endpoint = %group.endpoint(),
            world_size = config.num_processes,
            "metric tester ready"
        );
        Ok(Self {
            atol: config.atol,
            config,
            ports,
            pool: Some(pool),
            group: Some(group),
        })
    }

    /// Override the comparison tolerance.
    pub fn with_atol(mut self, atol: f64) -> Self {
        self.atol = atol;
        self
    }

    pub fn atol(&self) -> f64 {
        self.atol
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn world_size(&self) -> usize {
        self.config.num_processes
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.group.as_ref().map(GroupHandle::endpoint)
    }

    /// Allocator the rendezvous port was taken from.
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Device for single-process runs.
    pub fn device(&self) -> Device {
        if self.config.accelerator {
            Device::Gpu
        } else {
            Device::Cpu
        }
    }

    /// Close and join the pool, then release the rendezvous. Later calls are
    /// no-ops.
    pub fn teardown(&mut self) {
        let Some(mut pool) = self.pool.take() else {
            return;
        };
        pool.join();
        self.group = None;
        info!(world_size = self.config.num_processes, "metric tester torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.pool.is_none()
    }

    // ── Entry points ────────────────────────────────────────────────────

    pub fn run_functional_metric_test(&self, name: &str, case: &FunctionalCase) -> Result<()> {
        functional_test(name, case, self.atol, &self.device())
    }

    /// Run `case` against `M`, across every worker when `ddp` is set or on the
    /// calling thread otherwise.
    pub fn run_class_metric_test<M: TestableMetric>(&self, ddp: bool, case: ClassCase) -> Result<()> {
        if !ddp {
            return class_test::<M>(0, 1, &case, self.atol, &self.device());
        }
        let (Some(pool), Some(group)) = (&self.pool, &self.group) else {
            return Err(HarnessError::PoolClosed);
        };
        let case = Arc::new(case);
        let result = pool.fan_out(|_| {
            Box::new(ClassTestTask::<M> {
                case: Arc::clone(&case),
                atol: self.atol,
                metric: PhantomData,
            })
        });
        group.recover();
        result
    }

    pub fn run_precision_test_cpu(
        &self,
        metric: Option<&mut dyn ProbeTarget>,
        case: &PrecisionCase,
    ) -> Result<()> {
        probe::assert_dtype_support(metric, case, &Device::Cpu)
    }

    /// Accelerator variant of [`Self::run_precision_test_cpu`]; fails when the
    /// configuration has no accelerator.
    pub fn run_precision_test_gpu(
        &self,
        metric: Option<&mut dyn ProbeTarget>,
        case: &PrecisionCase,
    ) -> Result<()> {
        if !self.config.accelerator {
            return Err(HarnessError::Precondition(
                "no accelerator configured for the gpu precision probe".into(),
            ));
        }
        probe::assert_dtype_support(metric, case, &Device::Gpu)
    }

    pub fn run_differentiability_test<M: TestableMetric>(
        &self,
        preds: &mut Tensor,
        target: &Tensor,
        functional: Option<&dyn Differentiable>,
        metric_args: &MetricArgs,
    ) -> Result<()> {
        probe::run_differentiability_test::<M>(preds, target, functional, metric_args)
    }
}

impl Drop for MetricTester {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// One rank's class test; distributed runs always use the CPU.
struct ClassTestTask<M> {
    case: Arc<ClassCase>,
    atol: f64,
    metric: PhantomData<fn() -> M>,
}

impl<M: TestableMetric> WorkerTask for ClassTestTask<M> {
    fn run(self: Box<Self>, ctx: &WorkerContext) -> Result<()> {
        class_test::<M>(ctx.rank, ctx.world_size, &self.case, self.atol, &Device::Cpu)
    }
}
