use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use mtest_core::{DType, Device, Shape, Tensor};
use mtest_harness::fixtures::NUM_BATCHES;
use mtest_harness::{ClassCase, FunctionalCase, HarnessConfig, MetricTester, PrecisionCase};
use mtest_metric::dummy::{DummyMetricDiff, DummyMetricSum};
use mtest_metric::{Functional, Input, Kwargs, Metric, MetricArgs, MetricOutput};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mtest")]
#[command(about = "Metric correctness harness CLI")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the built-in dummy metrics through every driver.
    Smoke(Overrides),
    /// Print the resolved harness configuration as JSON.
    Config(Overrides),
}

/// Flags layered over the `MTEST_*` environment.
#[derive(ClapArgs)]
struct Overrides {
    #[arg(long)]
    num_processes: Option<usize>,
    #[arg(long)]
    atol: Option<f64>,
    #[arg(long)]
    master_addr: Option<String>,
    #[arg(long)]
    start_port: Option<u16>,
    #[arg(long)]
    max_port: Option<u16>,
    #[arg(long)]
    accelerator: bool,
}

impl Overrides {
    fn resolve(self) -> mtest_harness::Result<HarnessConfig> {
        let mut cfg = HarnessConfig::from_env()?;
        if let Some(n) = self.num_processes {
            cfg.num_processes = n;
        }
        if let Some(atol) = self.atol {
            cfg.atol = atol;
        }
        if let Some(addr) = self.master_addr {
            cfg.master_addr = addr;
        }
        if let Some(port) = self.start_port {
            cfg.start_port = port;
        }
        if let Some(port) = self.max_port {
            cfg.max_port = port;
        }
        cfg.accelerator |= self.accelerator;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
    let args = Args::parse();
    let outcome = match args.cmd {
        Cmd::Smoke(overrides) => overrides.resolve().and_then(smoke),
        Cmd::Config(overrides) => overrides.resolve().and_then(|cfg| {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Functional sum under test; drivers compare tensor results.
fn sum_functional() -> Arc<dyn Functional> {
    Arc::new(|preds: &Input, _: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        Ok(preds.tensor()?.to_dtype(DType::F64).sum_all().into())
    })
}

fn summed(sign: f64) -> Arc<dyn Functional> {
    Arc::new(move |preds: &Input, _: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        let total: f64 = preds.tensor()?.to_vec_f64().iter().sum();
        Ok(MetricOutput::Scalar(sign * total))
    })
}

fn smoke(cfg: HarnessConfig) -> mtest_harness::Result<()> {
    let data: Vec<f32> = (1..=NUM_BATCHES).map(|v| v as f32).collect();
    let batches = Tensor::from_f32(&data, &Shape::new(vec![NUM_BATCHES as i64]), &Device::Cpu)?;
    let tester = MetricTester::setup(cfg)?;
    info!(endpoint = ?tester.endpoint(), device = %tester.device(), "running smoke checks");

    let functional =
        FunctionalCase::new(batches.clone(), batches.clone(), sum_functional(), summed(1.0));
    tester.run_functional_metric_test("sum", &functional)?;
    info!("functional sum ok");

    for ddp in [false, true] {
        let case = ClassCase::new(batches.clone(), batches.clone(), summed(1.0));
        tester.run_class_metric_test::<DummyMetricSum>(ddp, case.clone())?;
        tester.run_class_metric_test::<DummyMetricSum>(ddp, case.dist_sync_on_step(true))?;
        let case = ClassCase::new(batches.clone(), batches.clone(), summed(-1.0));
        tester.run_class_metric_test::<DummyMetricDiff>(ddp, case)?;
        info!(ddp, "class metrics ok");
    }

    let mut metric = DummyMetricSum::from_args(false, &MetricArgs::new())?;
    let precision = PrecisionCase::new(batches.clone(), batches.clone());
    tester.run_precision_test_cpu(Some(&mut metric), &precision)?;
    if tester.config().accelerator {
        tester.run_precision_test_gpu(Some(&mut metric), &precision)?;
    }
    info!("precision ok");

    let mut preds = batches.clone();
    tester.run_differentiability_test::<DummyMetricSum>(&mut preds, &batches, None, &MetricArgs::new())?;
    info!("differentiability ok");

    println!("All smoke checks passed.");
    Ok(())
}
