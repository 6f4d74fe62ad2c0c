mod common;

use briny_graph::approx::approx_eq;
use briny_graph::backend::ExecutionContext;
use briny_graph::error::GraphError;
use briny_graph::layer::{Layer, LayerId, Phase};
use briny_graph::layers::{Convolution2D, FullyConnected, Input, Mse, Sum};
use briny_graph::model::{Model, ModelContext};
use briny_graph::shape::Shape;
use common::{random, run_step};

struct Mlp {
    model: Model,
    input: LayerId,
    fc1: LayerId,
    fc2: LayerId,
    loss: LayerId,
}

fn mlp(ctx: ExecutionContext) -> Mlp {
    let mut g = ModelContext::new("mlp");
    let input = g.add(Input::flat(3).unwrap()).unwrap();
    let fc1 = g.add(FullyConnected::new(&g, input, 4).unwrap()).unwrap();
    let fc2 = g.add(FullyConnected::new(&g, fc1, 2).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, fc2).unwrap()).unwrap();
    let mut model = g.build(ctx).unwrap();
    model.initialize(Phase::Training).unwrap();
    Mlp {
        model,
        input,
        fc1,
        fc2,
        loss,
    }
}

#[test]
fn test_backward_twice_is_rejected() {
    let Mlp {
        mut model,
        input,
        loss,
        ..
    } = mlp(ExecutionContext::cpu());
    run_step(&mut model, input, loss, 2, &random(1, 6), &random(2, 4)).unwrap();
    assert_eq!(model.backward(), Err(GraphError::BackwardReplay));

    // a new step allows it again
    run_step(&mut model, input, loss, 2, &random(1, 6), &random(2, 4)).unwrap();
}

#[test]
fn test_batch_size_is_never_clamped() {
    let Mlp {
        mut model,
        input,
        loss,
        ..
    } = mlp(ExecutionContext::cpu());
    assert_eq!(model.update_kernel(0), Err(GraphError::BatchSize));

    run_step(&mut model, input, loss, 2, &random(1, 6), &random(2, 4)).unwrap();
    // smaller batches reuse the state
    run_step(&mut model, input, loss, 1, &random(1, 3), &random(2, 2)).unwrap();

    model.update_kernel(3).unwrap();
    assert_eq!(
        model.set_data(input, &random(1, 9)),
        Err(GraphError::BatchSize)
    );
    model.reset_kernel();
    run_step(&mut model, input, loss, 3, &random(1, 9), &random(2, 6)).unwrap();
}

#[test]
fn test_data_size_mismatch() {
    let Mlp {
        mut model,
        input,
        loss,
        ..
    } = mlp(ExecutionContext::cpu());
    model.update_kernel(1).unwrap();
    assert_eq!(model.set_data(input, &[1.0]), Err(GraphError::DataSize));
    model.set_data(input, &[1.0, 2.0, 3.0]).unwrap();
    model.forward().unwrap();
    assert_eq!(
        model.loss_derivative(loss, &[1.0]),
        Err(GraphError::DataSize)
    );
}

#[test]
fn test_dirty_reads_fail() {
    let Mlp {
        mut model,
        input,
        fc1,
        fc2,
        loss,
    } = mlp(ExecutionContext::cpu());
    model.update_kernel(1).unwrap();
    model.set_data(input, &[1.0, 2.0, 3.0]).unwrap();
    assert_eq!(model.outs(fc2, 0), Err(GraphError::Dirty(fc2)));

    model.forward().unwrap();
    assert_eq!(model.outs(fc2, 0).unwrap().len(), 2);
    assert_eq!(model.outs(fc2, 0), model.outs(loss, 0));
    assert_eq!(model.delta(fc1, 0), Err(GraphError::Dirty(fc1)));
    assert_eq!(model.update(0.1), Err(GraphError::Dirty(fc1)));

    model.loss_derivative(loss, &[0.0, 1.0]).unwrap();
    assert!(model.delta(fc2, 0).is_ok());
    assert_eq!(model.delta(fc1, 0), Err(GraphError::Dirty(fc1)));
    model.backward().unwrap();
    assert_eq!(model.delta(fc1, 0).unwrap().len(), 4);
    // nothing needs the input gradient
    assert_eq!(model.delta(input, 0), Err(GraphError::Dirty(input)));
    model.update(0.1).unwrap();
}

#[test]
fn test_update_follows_gradient() {
    let Mlp {
        mut model,
        input,
        loss,
        ..
    } = mlp(ExecutionContext::cpu());
    let data = random(3, 6);
    let truth = random(4, 4);
    run_step(&mut model, input, loss, 2, &data, &truth).unwrap();
    let before = model.loss(loss, &truth).unwrap();
    model.update(0.1).unwrap();

    run_step(&mut model, input, loss, 2, &data, &truth).unwrap();
    let after = model.loss(loss, &truth).unwrap();
    assert!(after < before, "{after} >= {before}");
}

#[test]
fn test_accumulated_weight_gradients() {
    let Mlp {
        mut model,
        input,
        fc1,
        fc2,
        loss,
    } = mlp(ExecutionContext::cpu());
    let steps = [(random(5, 3), random(6, 2)), (random(7, 3), random(8, 2))];

    let mut expected = vec![0.0; model.collect_gradients(&[fc1, fc2]).unwrap().len()];
    for (data, truth) in &steps {
        run_step(&mut model, input, loss, 1, data, truth).unwrap();
        let gradients = model.collect_gradients(&[fc1, fc2]).unwrap();
        for (e, g) in expected.iter_mut().zip(gradients) {
            *e += g;
        }
    }

    // a zero learning rate only clears the gradients
    model.update(0.0).unwrap();
    model.set_accumulate_delta_weights(true);
    for (data, truth) in &steps {
        run_step(&mut model, input, loss, 1, data, truth).unwrap();
    }
    let accumulated = model.collect_gradients(&[fc1, fc2]).unwrap();
    assert!(approx_eq(&accumulated, &expected, 1e-9));
}

#[test]
fn test_update_resets_accumulation() {
    let Mlp {
        mut model,
        input,
        fc1,
        loss,
        ..
    } = mlp(ExecutionContext::cpu());
    model.set_accumulate_delta_weights(true);
    run_step(&mut model, input, loss, 1, &random(1, 3), &random(2, 2)).unwrap();
    model.update(0.05).unwrap();
    assert!(model.collect_gradients(&[fc1]).unwrap().iter().all(|g| *g == 0.0));
}

#[test]
fn test_inference_disables_weight_gradients() {
    let mut g = ModelContext::new("inference");
    let input = g.add(Input::flat(2).unwrap()).unwrap();
    let fc = g.add(FullyConnected::new(&g, input, 2).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, fc).unwrap()).unwrap();
    let mut model = g.build(ExecutionContext::cpu()).unwrap();
    model.initialize(Phase::Inference).unwrap();

    run_step(&mut model, input, loss, 1, &[1.0, 1.0], &[0.0, 0.0]).unwrap();
    assert_eq!(model.collect_gradients(&[fc]).unwrap(), vec![0.0; 6]);
    let weights = model.weights();
    model.update(1.0).unwrap();
    assert_eq!(model.weights(), weights);
}

#[test]
fn test_seeded_initialization() {
    let a = mlp(ExecutionContext::cpu());
    let b = mlp(ExecutionContext::cpu());
    let c = mlp(ExecutionContext::cpu().with_seed(7));
    assert_eq!(a.model.weights(), b.model.weights());
    assert_ne!(a.model.weights(), c.model.weights());
}

#[test]
fn test_set_weights() {
    let Mlp { mut model, .. } = mlp(ExecutionContext::cpu());
    let nb = model.weights().len();
    assert_eq!(nb, 3 * 4 + 4 + 4 * 2 + 2);
    let weights: Vec<f64> = (0..nb).map(|x| x as f64 * 0.01).collect();
    model.set_weights(&weights).unwrap();
    assert_eq!(model.weights(), weights);
    // kept by a later initialization
    model.initialize(Phase::Training).unwrap();
    assert_eq!(model.weights(), weights);
    assert_eq!(model.set_weights(&weights[1..]), Err(GraphError::DataSize));
}

#[test]
fn test_copy_matches_source_model() {
    let Mlp {
        mut model,
        input,
        loss,
        ..
    } = mlp(ExecutionContext::cpu());
    let mut copy = model.copy().unwrap();
    assert_eq!(copy.weights(), model.weights());
    assert_eq!(copy.batch_size(), 0);

    let data = random(9, 3);
    let truth = random(10, 2);
    run_step(&mut model, input, loss, 1, &data, &truth).unwrap();
    run_step(&mut copy, input, loss, 1, &data, &truth).unwrap();
    assert_eq!(model.outs(loss, 0), copy.outs(loss, 0));
}

#[test]
fn test_copy_graph_keeps_ancestors_only() {
    let mut g = ModelContext::new("two heads");
    let input = g.add(Input::flat(2).unwrap()).unwrap();
    let a = g.add(FullyConnected::new(&g, input, 2).unwrap()).unwrap();
    let b = g.add(FullyConnected::new(&g, input, 3).unwrap()).unwrap();
    let loss_a = g.add(Mse::new(&g, a).unwrap()).unwrap();
    let _loss_b = g.add(Mse::new(&g, b).unwrap()).unwrap();
    let mut model = g.build(ExecutionContext::cpu()).unwrap();
    model.initialize(Phase::Training).unwrap();

    assert_eq!(model.get_graph(loss_a).unwrap(), vec![input, a, loss_a]);
    let head = model.copy_graph(loss_a).unwrap();
    assert_eq!(head.ids().collect::<Vec<_>>(), vec![input, a, loss_a]);
    assert_eq!(head.weights().len(), 6);
}

#[test]
fn test_get_graph_through_merge() {
    let mut g = ModelContext::new("merge");
    let input = g.add(Input::flat(2).unwrap()).unwrap();
    let a = g.add(FullyConnected::new(&g, input, 2).unwrap()).unwrap();
    let b = g.add(FullyConnected::new(&g, a, 2).unwrap()).unwrap();
    let unused = g.add(FullyConnected::new(&g, input, 2).unwrap()).unwrap();
    let c = g.add(FullyConnected::new(&g, a, 2).unwrap()).unwrap();
    let sum = g.add(Sum::new(&g, &[b, c]).unwrap()).unwrap();
    let model = g.build(ExecutionContext::cpu()).unwrap();

    let layers = model.get_graph(sum).unwrap();
    assert_eq!(layers, vec![input, a, b, c, sum]);
    assert!(!layers.contains(&unused));
}

#[test]
fn test_resize_convolutions() {
    let mut g = ModelContext::new("fcn");
    let input = g.add(Input::grid(1, 4, 4).unwrap()).unwrap();
    let conv1 = g.add(Convolution2D::new(&g, input, 2, 3, 1).unwrap()).unwrap();
    let conv2 = g.add(Convolution2D::new(&g, conv1, 1, 3, 2).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, conv2).unwrap()).unwrap();
    let mut model = g.build(ExecutionContext::cpu()).unwrap();
    model.initialize(Phase::Training).unwrap();
    assert_eq!(
        model.layer(conv2).unwrap().base().shape(),
        Shape::grid(1, 2, 2)
    );

    let mut resized = model.resize(8, 6).unwrap();
    assert_eq!(resized.weights(), model.weights());
    assert_eq!(
        resized.layer(input).unwrap().base().shape(),
        Shape::grid(1, 8, 6)
    );
    assert_eq!(
        resized.layer(conv2).unwrap().base().shape(),
        Shape::grid(1, 4, 3)
    );
    run_step(&mut resized, input, loss, 1, &random(1, 48), &random(2, 12)).unwrap();
}

#[test]
fn test_resize_rejects_fixed_size_layers() {
    let mut g = ModelContext::new("classifier");
    let input = g.add(Input::grid(1, 4, 4).unwrap()).unwrap();
    let conv = g.add(Convolution2D::new(&g, input, 2, 3, 1).unwrap()).unwrap();
    let fc = g.add(FullyConnected::new(&g, conv, 2).unwrap()).unwrap();
    g.add(Mse::new(&g, fc).unwrap()).unwrap();
    let model = g.build(ExecutionContext::cpu()).unwrap();

    assert!(matches!(model.resize(4, 4), Ok(_)));
    assert!(matches!(model.resize(6, 6), Err(GraphError::Init(_))));
}

#[test]
fn test_stride_factor_and_receptive_field() {
    let mut g = ModelContext::new("pyramid");
    let input = g.add(Input::grid(1, 8, 8).unwrap()).unwrap();
    let conv1 = g.add(Convolution2D::new(&g, input, 1, 3, 2).unwrap()).unwrap();
    let conv2 = g.add(Convolution2D::new(&g, conv1, 1, 3, 1).unwrap()).unwrap();
    let model = g.build(ExecutionContext::cpu()).unwrap();
    let graph = model.graph();

    let layer = model.layer(conv2).unwrap();
    assert_eq!(layer.stride_factor(&graph).unwrap(), 2.0);
    assert_eq!(layer.receptive_field(&graph).unwrap(), 1 + 2 + 2 * 2);
}

#[test]
#[should_panic(expected = "stride factor")]
fn test_merge_of_mismatched_strides_panics() {
    let mut g = ModelContext::new("mismatch");
    let big = g.add(Input::grid(1, 4, 4).unwrap()).unwrap();
    let small = g.add(Input::grid(1, 2, 2).unwrap()).unwrap();
    let down = g.add(Convolution2D::new(&g, big, 1, 3, 2).unwrap()).unwrap();
    let same = g.add(Convolution2D::new(&g, small, 1, 3, 1).unwrap()).unwrap();
    let sum = g.add(Sum::new(&g, &[down, same]).unwrap()).unwrap();
    let model = g.build(ExecutionContext::cpu()).unwrap();

    let graph = model.graph();
    let _ = model.layer(sum).unwrap().stride_factor(&graph);
}

#[test]
fn test_invalid_construction() {
    let mut g = ModelContext::new("invalid");
    let flat = g.add(Input::flat(4).unwrap()).unwrap();
    let grid = g.add(Input::grid(1, 2, 2).unwrap()).unwrap();
    assert!(matches!(Input::flat(0), Err(GraphError::Init(_))));
    assert!(matches!(
        FullyConnected::new(&g, flat, 0),
        Err(GraphError::Init(_))
    ));
    assert!(matches!(
        Convolution2D::new(&g, flat, 1, 3, 1),
        Err(GraphError::Init(_))
    ));
    assert!(matches!(Sum::new(&g, &[]), Err(GraphError::Init(_))));
    assert!(matches!(
        Sum::new(&g, &[flat, grid]),
        Err(GraphError::Init(_))
    ));
    assert!(matches!(
        FullyConnected::new(&g, 9, 2),
        Err(GraphError::UnknownLayer(9))
    ));
}

#[test]
fn test_step_and_epoch_counters() {
    let Mlp { mut model, .. } = mlp(ExecutionContext::cpu());
    for _ in 0..3 {
        model.inc_step();
    }
    model.inc_epoch();
    assert_eq!((model.step(), model.epoch()), (3, 1));
}
