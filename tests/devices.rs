mod common;

use briny_graph::approx::{FLOAT_TOLERANCE, approx_eq, max_abs_diff};
use briny_graph::backend::{ExecutionContext, Precision};
use briny_graph::layer::LayerId;
use briny_graph::layers::{
    Activation, ActivationKind, Concat, Convolution2D, FullyConnected, Input, Mse, Sum,
};
use briny_graph::model::{Model, ModelContext};
use common::{random, run_step};

const BATCH: usize = 2;

struct Net {
    model: Model,
    input: LayerId,
    loss: LayerId,
    hidden: Vec<LayerId>,
    weighted: Vec<LayerId>,
}

fn net(ctx: ExecutionContext) -> Net {
    let mut g = ModelContext::new("devices");
    let input = g.add(Input::grid(2, 5, 5).unwrap()).unwrap();
    let a = g.add(Convolution2D::new(&g, input, 3, 3, 1).unwrap()).unwrap();
    let relu = g
        .add(Activation::new(&g, a, ActivationKind::ReLU).unwrap())
        .unwrap();
    let b = g.add(Convolution2D::new(&g, relu, 2, 3, 2).unwrap()).unwrap();
    let c = g.add(Convolution2D::new(&g, relu, 2, 1, 2).unwrap()).unwrap();
    let sum = g.add(Sum::new(&g, &[b, c]).unwrap()).unwrap();
    let concat = g.add(Concat::new(&g, &[sum, b]).unwrap()).unwrap();
    let fc = g.add(FullyConnected::new(&g, concat, 3).unwrap()).unwrap();
    let sigmoid = g
        .add(Activation::new(&g, fc, ActivationKind::Sigmoid).unwrap())
        .unwrap();
    let loss = g.add(Mse::new(&g, sigmoid).unwrap()).unwrap();

    let mut model = g.build(ctx).unwrap();
    model.initialize(Default::default()).unwrap();
    Net {
        model,
        input,
        loss,
        hidden: vec![a, relu, b, c, sum, concat, fc, sigmoid],
        weighted: vec![a, b, c, fc],
    }
}

fn step(net: &mut Net) -> Vec<f64> {
    let truth = random(2, BATCH * 3);
    run_step(
        &mut net.model,
        net.input,
        net.loss,
        BATCH,
        &random(1, BATCH * 50),
        &truth,
    )
    .unwrap();
    truth
}

fn compare(gpu: ExecutionContext, tolerance: f64) {
    let mut cpu = net(ExecutionContext::cpu());
    let mut gpu = net(gpu);
    assert_eq!(cpu.model.weights(), gpu.model.weights());
    step(&mut cpu);
    step(&mut gpu);

    for &id in cpu.hidden.iter().chain([&cpu.loss]) {
        for elem in 0..BATCH {
            let expected = cpu.model.outs(id, elem).unwrap();
            let actual = gpu.model.outs(id, elem).unwrap();
            assert!(
                approx_eq(&actual, &expected, tolerance),
                "outs of layer {id}: {}",
                max_abs_diff(&actual, &expected)
            );
        }
    }
    for &id in &cpu.hidden {
        for elem in 0..BATCH {
            let expected = cpu.model.delta(id, elem).unwrap();
            let actual = gpu.model.delta(id, elem).unwrap();
            assert!(
                approx_eq(&actual, &expected, tolerance),
                "delta of layer {id}: {}",
                max_abs_diff(&actual, &expected)
            );
        }
    }
    let weighted = cpu.weighted.clone();
    let expected = cpu.model.collect_gradients(&weighted).unwrap();
    let actual = gpu.model.collect_gradients(&weighted).unwrap();
    assert!(approx_eq(&actual, &expected, tolerance));

    cpu.model.update(0.1).unwrap();
    gpu.model.update(0.1).unwrap();
    gpu.model.collect_gradients(&weighted).unwrap();
    assert!(approx_eq(&gpu.model.weights(), &cpu.model.weights(), tolerance));
}

#[test]
fn test_cpu_and_gpu_agree() {
    compare(ExecutionContext::host_gpu(), FLOAT_TOLERANCE);
}

#[test]
fn test_cpu_and_gpu_agree_in_half_precision() {
    let ctx = ExecutionContext::host_gpu().with_precision(Precision::Half);
    compare(ctx, Precision::Half.tolerance());
}

#[test]
fn test_gradient_check_in_gpu_mode() {
    let mut gpu = net(ExecutionContext::host_gpu());
    let truth = step(&mut gpu);
    let diff = gpu.model.check_gradients(gpu.loss, &truth).unwrap();
    assert!(diff < FLOAT_TOLERANCE, "relative difference {diff}");
}

#[test]
fn test_gpu_outputs_need_forward() {
    let mut gpu = net(ExecutionContext::host_gpu());
    gpu.model.update_kernel(1).unwrap();
    let fc = gpu.weighted[3];
    assert!(gpu.model.outs(fc, 0).is_err());
    assert!(gpu.model.delta(fc, 0).is_err());
}

#[cfg(feature = "wgpu")]
#[test]
fn test_wgpu_matches_cpu() {
    let Ok(ctx) = ExecutionContext::wgpu() else {
        // no adapter on this machine
        return;
    };
    compare(ctx, FLOAT_TOLERANCE);
}
