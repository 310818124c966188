//! Functional and single-process class drivers.

mod common;

use std::sync::Arc;

use common::*;
use mtest_core::{DType, Shape, Tensor};
use mtest_harness::driver::{class_test, functional_test};
use mtest_harness::{BatchSeq, ClassCase, ClassOptions, FunctionalCase, HarnessError, Phase};
use mtest_metric::dummy::{DummyMetricMultiOutput, DummyMetricSum};
use mtest_metric::{ArgValue, Functional, Input, Kwargs, MetricArgs, MetricOutput};

const ATOL: f64 = 1e-8;

// ─── Functional driver ──────────────────────────────────────────────────

#[test]
fn functional_matches_reference_per_batch() {
    init_tracing();
    let (preds, target) = regression_inputs(3);
    let case = FunctionalCase::new(preds, target, mse_fn(), mse_reference());
    functional_test("mse", &case, ATOL, &cpu()).unwrap();
}

#[test]
fn functional_mismatch_names_batch() {
    let case = FunctionalCase::new(
        running_sum_batches(),
        running_sum_batches(),
        sum_fn(),
        wrong_sum_reference(),
    );
    let err = functional_test("sum", &case, ATOL, &cpu()).unwrap_err();
    match &err {
        HarnessError::Check { metric, phase, .. } => {
            assert_eq!(metric, "sum");
            assert_eq!(*phase, Phase::Batch(0));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(err.root(), HarnessError::Mismatch { .. }));
}

#[test]
fn functional_final_aggregate_is_opt_in() {
    // The last batch alone (4) differs from the sum over every batch (10).
    let case = FunctionalCase::new(
        running_sum_batches(),
        running_sum_batches(),
        sum_fn(),
        sum_reference(),
    );
    functional_test("sum", &case, ATOL, &cpu()).unwrap();
    let err = functional_test("sum", &case.check_final_aggregate(true), ATOL, &cpu()).unwrap_err();
    assert!(matches!(err, HarnessError::Check { phase: Phase::Aggregate, .. }));
}

#[test]
fn functional_binds_metric_args_but_not_for_reference() {
    let (preds, target) = binary_inputs(5);
    let metric: Arc<dyn Functional> =
        Arc::new(|p: &Input, t: &Input, kw: &Kwargs| -> mtest_metric::Result<MetricOutput> {
            assert_eq!(kw.get("threshold").and_then(ArgValue::as_f64), Some(0.25));
            accuracy_fn().call(p, t, kw)
        });
    let reference: Arc<dyn Functional> =
        Arc::new(|p: &Input, t: &Input, kw: &Kwargs| -> mtest_metric::Result<MetricOutput> {
            assert!(kw.get("threshold").is_none());
            let mut kw = kw.clone();
            kw.insert("threshold".into(), ArgValue::Float(0.25));
            accuracy_reference().call(p, t, &kw)
        });
    let mut args = MetricArgs::new();
    args.insert("threshold".into(), ArgValue::Float(0.25));
    let case = FunctionalCase::new(preds, target, metric, reference).with_metric_args(args);
    functional_test("accuracy", &case, ATOL, &cpu()).unwrap();
}

#[test]
fn functional_kwargs_sliced_or_whole() {
    let weights = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &Shape::new(vec![4]), &cpu()).unwrap();
    let mut kwargs = Kwargs::new();
    kwargs.insert("w".into(), ArgValue::Tensor(weights));
    // Metric sees batch i's weight; the reference sees the whole vector
    // unless kwargs are fragmented.
    let metric: Arc<dyn Functional> =
        Arc::new(|_: &Input, _: &Input, kw: &Kwargs| -> mtest_metric::Result<MetricOutput> {
            let w = kw["w"].as_tensor().unwrap();
            Ok(w.to_dtype(DType::F64).sum_all().into())
        });
    let reference: Arc<dyn Functional> =
        Arc::new(|_: &Input, _: &Input, kw: &Kwargs| -> mtest_metric::Result<MetricOutput> {
            let w = kw["w"].as_tensor().unwrap();
            Ok(MetricOutput::Scalar(w.to_vec_f64().iter().sum()))
        });
    let case = FunctionalCase::new(running_sum_batches(), running_sum_batches(), metric, reference)
    .with_kwargs(kwargs);
    assert!(functional_test("weights", &case, ATOL, &cpu()).is_err());
    functional_test("weights", &case.fragment_kwargs(true), ATOL, &cpu()).unwrap();
}

#[test]
fn call_keyword_overrides_metric_arg() {
    let (preds, target) = binary_inputs(17);
    let metric: Arc<dyn Functional> =
        Arc::new(|p: &Input, t: &Input, kw: &Kwargs| -> mtest_metric::Result<MetricOutput> {
            assert_eq!(kw.get("threshold").and_then(ArgValue::as_f64), Some(0.7));
            accuracy_fn().call(p, t, kw)
        });
    let mut args = MetricArgs::new();
    args.insert("threshold".into(), ArgValue::Float(0.5));
    let mut kwargs = Kwargs::new();
    kwargs.insert("threshold".into(), ArgValue::Float(0.7));
    let case = FunctionalCase::new(preds, target, metric, accuracy_reference())
        .with_metric_args(args)
        .with_kwargs(kwargs);
    functional_test("accuracy", &case, ATOL, &cpu()).unwrap();
}

#[test]
fn functional_rejects_uneven_inputs() {
    let short = Tensor::from_f32(&[1.0, 2.0], &Shape::new(vec![2]), &cpu()).unwrap();
    let case = FunctionalCase::new(running_sum_batches(), short, sum_fn(), sum_reference());
    assert!(matches!(
        functional_test("sum", &case, ATOL, &cpu()),
        Err(HarnessError::LengthMismatch { preds: 4, target: 2 })
    ));
}

// ─── Class driver, single process ───────────────────────────────────────

#[test]
fn running_sum_aggregates_to_ten() {
    init_tracing();
    let case = ClassCase::new(running_sum_batches(), running_sum_batches(), sum_reference());
    class_test::<DummyMetricSum>(0, 1, &case, ATOL, &cpu()).unwrap();
}

#[test]
fn class_mse_matches_reference() {
    let (preds, target) = regression_inputs(7);
    let case = ClassCase::new(preds, target, mse_reference());
    class_test::<MeanSquaredError>(0, 1, &case, ATOL, &cpu()).unwrap();
}

#[test]
fn class_accuracy_with_metric_args() {
    let (preds, target) = binary_inputs(9);
    let mut args = MetricArgs::new();
    args.insert("threshold".into(), ArgValue::Float(0.5));
    let case = ClassCase::new(preds, target, accuracy_reference()).with_metric_args(args);
    class_test::<BinaryAccuracy>(0, 1, &case, ATOL, &cpu()).unwrap();
}

#[test]
fn class_mapping_result_is_checked_per_key() {
    let (preds, target) = regression_inputs(11);
    let case = ClassCase::new(preds, target, stats_reference());
    class_test::<SumAndMean>(0, 1, &case, ATOL, &cpu()).unwrap();
}

#[test]
fn class_sequence_result_against_sequence_reference() {
    let reference: Arc<dyn Functional> =
        Arc::new(|p: &Input, _: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
            let s: f64 = p.tensor()?.to_vec_f64().iter().sum();
            Ok(MetricOutput::Sequence(vec![MetricOutput::Scalar(s), MetricOutput::Scalar(s)]))
        });
    let case = ClassCase::new(running_sum_batches(), running_sum_batches(), reference);
    class_test::<DummyMetricMultiOutput>(0, 1, &case, ATOL, &cpu()).unwrap();
}

#[test]
fn class_step_mismatch_names_step() {
    let case = ClassCase::new(running_sum_batches(), running_sum_batches(), wrong_sum_reference());
    let err = class_test::<DummyMetricSum>(0, 1, &case, ATOL, &cpu()).unwrap_err();
    assert!(matches!(err, HarnessError::Check { phase: Phase::Step(0), .. }));
}

#[test]
fn class_aggregate_mismatch_without_batch_checks() {
    let options = ClassOptions {
        check_batch: false,
        ..ClassOptions::default()
    };
    let case = ClassCase::new(running_sum_batches(), running_sum_batches(), wrong_sum_reference())
        .with_options(options);
    let err = class_test::<DummyMetricSum>(0, 1, &case, ATOL, &cpu()).unwrap_err();
    assert!(matches!(err, HarnessError::Check { phase: Phase::Aggregate, .. }));
}

#[test]
fn persistent_state_fails_state_dict_check() {
    let case = ClassCase::new(running_sum_batches(), running_sum_batches(), sum_reference());
    let err = class_test::<PersistentSum>(0, 1, &case, ATOL, &cpu()).unwrap_err();
    assert!(matches!(err.root(), HarnessError::Assertion(msg) if msg.contains("state dict")));

    let options = ClassOptions {
        check_state_dict: false,
        ..ClassOptions::default()
    };
    class_test::<PersistentSum>(0, 1, &case.with_options(options), ATOL, &cpu()).unwrap();
}

#[test]
fn writable_flags_fail_setup() {
    let case = ClassCase::new(running_sum_batches(), running_sum_batches(), sum_reference());
    let err = class_test::<MutableFlags>(0, 1, &case, ATOL, &cpu()).unwrap_err();
    assert!(matches!(err, HarnessError::Check { phase: Phase::Setup, .. }));
    assert!(err.to_string().contains("is_differentiable"));
}

#[test]
fn unknown_metric_args_are_rejected() {
    let mut args = MetricArgs::new();
    args.insert("bogus".into(), ArgValue::Bool(true));
    let case = ClassCase::new(running_sum_batches(), running_sum_batches(), sum_reference())
        .with_metric_args(args);
    assert!(matches!(
        class_test::<DummyMetricSum>(0, 1, &case, ATOL, &cpu()),
        Err(HarnessError::Metric(_))
    ));
}

#[test]
fn nested_inputs_flatten_for_the_reference() {
    let item = |v: f32| {
        let mut m = mtest_metric::TensorMap::new();
        m.insert("scores".into(), Tensor::from_f32(&[v], &Shape::new(vec![1]), &cpu()).unwrap());
        m
    };
    let batches = BatchSeq::Nested(vec![vec![item(1.0)], vec![item(2.0), item(3.0)]]);
    let count: Arc<dyn Functional> =
        Arc::new(|p: &Input, _: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
            Ok(Tensor::scalar(p.len() as f64, DType::F64, &cpu()).into())
        });
    let reference: Arc<dyn Functional> =
        Arc::new(|p: &Input, _: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
            Ok(MetricOutput::Scalar(p.len() as f64))
        });
    let case = FunctionalCase::new(batches.clone(), batches, count, reference);
    functional_test("count", &case, ATOL, &cpu()).unwrap();
}

#[test]
fn half_precision_batches_still_compare_in_f64() {
    let (preds, target) = regression_inputs(13);
    let case = FunctionalCase::new(
        preds.to_dtype(DType::F16),
        target.to_dtype(DType::F16),
        mse_fn(),
        mse_reference(),
    );
    functional_test("mse-f16", &case, ATOL, &cpu()).unwrap();
}
