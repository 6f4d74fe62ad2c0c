mod common;

use briny_graph::approx::GRADIENT_WARNING;
use briny_graph::backend::ExecutionContext;
use briny_graph::layer::{Layer, LayerId};
use briny_graph::layers::{
    Activation, ActivationKind, Concat, Convolution2D, FullyConnected, Input, Mse, Sum,
};
use briny_graph::model::{Model, ModelContext};
use common::{random, run_step};

fn size(model: &Model, id: LayerId) -> usize {
    model.layer(id).unwrap().base().size()
}

fn gradient_check(graph: ModelContext, input: LayerId, loss: LayerId, batch: usize) -> f64 {
    let mut model = graph.build(ExecutionContext::cpu()).unwrap();
    model.initialize(Default::default()).unwrap();
    let data = random(1, batch * size(&model, input));
    let truth = random(2, batch * size(&model, loss));
    run_step(&mut model, input, loss, batch, &data, &truth).unwrap();
    let diff = model.check_gradients(loss, &truth).unwrap();
    assert!(!model.collect_gradients_approx(loss, &truth).unwrap().is_empty());
    diff
}

#[test]
fn test_fully_connected_gradients() {
    let mut g = ModelContext::new("mlp");
    let input = g.add(Input::flat(3).unwrap()).unwrap();
    let fc1 = g.add(FullyConnected::new(&g, input, 4).unwrap()).unwrap();
    let act = g
        .add(Activation::new(&g, fc1, ActivationKind::Sigmoid).unwrap())
        .unwrap();
    let fc2 = g.add(FullyConnected::new(&g, act, 2).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, fc2).unwrap()).unwrap();

    let diff = gradient_check(g, input, loss, 3);
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
}

#[test]
fn test_convolution_gradients() {
    let mut g = ModelContext::new("cnn");
    let input = g.add(Input::grid(2, 5, 5).unwrap()).unwrap();
    let conv1 = g.add(Convolution2D::new(&g, input, 3, 3, 1).unwrap()).unwrap();
    let act = g
        .add(Activation::new(&g, conv1, ActivationKind::Sigmoid).unwrap())
        .unwrap();
    let conv2 = g.add(Convolution2D::new(&g, act, 2, 3, 2).unwrap()).unwrap();
    let fc = g.add(FullyConnected::new(&g, conv2, 2).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, fc).unwrap()).unwrap();

    let diff = gradient_check(g, input, loss, 2);
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
}

#[test]
fn test_sum_gradients() {
    let mut g = ModelContext::new("sum");
    let input = g.add(Input::flat(3).unwrap()).unwrap();
    let a = g.add(FullyConnected::new(&g, input, 3).unwrap()).unwrap();
    let b = g.add(FullyConnected::new(&g, a, 2).unwrap()).unwrap();
    let c = g.add(FullyConnected::new(&g, a, 2).unwrap()).unwrap();
    let sum = g.add(Sum::new(&g, &[b, c]).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, sum).unwrap()).unwrap();

    let diff = gradient_check(g, input, loss, 2);
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
}

#[test]
fn test_duplicated_branch_gradients() {
    let mut g = ModelContext::new("twice");
    let input = g.add(Input::flat(2).unwrap()).unwrap();
    let a = g.add(FullyConnected::new(&g, input, 2).unwrap()).unwrap();
    let sum = g.add(Sum::new(&g, &[a, a]).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, sum).unwrap()).unwrap();

    let diff = gradient_check(g, input, loss, 2);
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
}

#[test]
fn test_nested_merge_gradients() {
    let mut g = ModelContext::new("nested");
    let input = g.add(Input::flat(3).unwrap()).unwrap();
    let a = g.add(FullyConnected::new(&g, input, 3).unwrap()).unwrap();
    let b = g.add(FullyConnected::new(&g, a, 3).unwrap()).unwrap();
    let c = g.add(FullyConnected::new(&g, a, 3).unwrap()).unwrap();
    let inner = g.add(Sum::new(&g, &[b, c]).unwrap()).unwrap();
    let d = g.add(FullyConnected::new(&g, inner, 3).unwrap()).unwrap();
    let outer = g.add(Sum::new(&g, &[d, a]).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, outer).unwrap()).unwrap();

    let diff = gradient_check(g, input, loss, 2);
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
}

#[test]
fn test_concat_gradients() {
    let mut g = ModelContext::new("concat");
    let input = g.add(Input::grid(1, 4, 4).unwrap()).unwrap();
    let a = g.add(Convolution2D::new(&g, input, 2, 3, 1).unwrap()).unwrap();
    let b = g.add(Convolution2D::new(&g, a, 1, 3, 1).unwrap()).unwrap();
    let c = g.add(Convolution2D::new(&g, a, 2, 1, 1).unwrap()).unwrap();
    let concat = g.add(Concat::new(&g, &[b, c]).unwrap()).unwrap();
    let fc = g.add(FullyConnected::new(&g, concat, 2).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, fc).unwrap()).unwrap();

    let diff = gradient_check(g, input, loss, 2);
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
}

#[test]
fn test_merge_probe_attribution() {
    let mut g = ModelContext::new("fork");
    let input = g.add(Input::grid(1, 4, 4).unwrap()).unwrap();
    let a = g.add(Convolution2D::new(&g, input, 2, 3, 1).unwrap()).unwrap();
    let b = g.add(Convolution2D::new(&g, a, 1, 3, 1).unwrap()).unwrap();
    let c = g.add(Convolution2D::new(&g, a, 1, 3, 1).unwrap()).unwrap();
    let sum = g.add(Sum::new(&g, &[b, c]).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, sum).unwrap()).unwrap();

    let mut model = g.build(ExecutionContext::cpu()).unwrap();
    model.initialize(Default::default()).unwrap();
    let data = random(3, 16);
    let truth = random(4, 16);
    run_step(&mut model, input, loss, 1, &data, &truth).unwrap();
    model.forward_gradients().unwrap();

    let nb_gc = |id: LayerId| model.layer(id).unwrap().nb_gc();
    assert_eq!(nb_gc(a), 2 * (2 * 9 + 2));
    assert_eq!(nb_gc(b), nb_gc(a) + 2 * (2 * 9 + 1));

    let merged = model.merged_graph(sum).unwrap();
    assert_eq!(merged.common_ancestor, Some(a));
    assert_eq!(merged.nb_same_elems, nb_gc(a));
    assert_eq!(merged.layers, vec![b, c]);
    assert_eq!(merged.layers_index, vec![0, 1]);
    for (branch, leaf) in [(0, b), (1, c)] {
        assert_eq!(merged.branch_nb_gc(branch), nb_gc(leaf));
    }
    assert_eq!(merged.nb_gc(), nb_gc(sum));

    let approx = model.collect_gradients_approx(loss, &truth).unwrap();
    let analytic = model.collect_gradients(&[a, b, c]).unwrap();
    assert_eq!(approx.len(), analytic.len());
    assert!(model.check_gradients(loss, &truth).unwrap() < GRADIENT_WARNING);
}

#[test]
fn test_branches_from_distinct_inputs() {
    let mut g = ModelContext::new("two inputs");
    let left = g.add(Input::flat(2).unwrap()).unwrap();
    let right = g.add(Input::flat(3).unwrap()).unwrap();
    let a = g.add(FullyConnected::new(&g, left, 2).unwrap()).unwrap();
    let b = g.add(FullyConnected::new(&g, right, 2).unwrap()).unwrap();
    let sum = g.add(Sum::new(&g, &[a, b]).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, sum).unwrap()).unwrap();

    let mut model = g.build(ExecutionContext::cpu()).unwrap();
    model.initialize(Default::default()).unwrap();
    let truth = random(5, 2);
    model.update_kernel(1).unwrap();
    model.set_data(left, &random(6, 2)).unwrap();
    model.set_data(right, &random(7, 3)).unwrap();
    model.forward().unwrap();
    model.loss_derivative(loss, &truth).unwrap();
    model.backward().unwrap();

    let diff = model.check_gradients(loss, &truth).unwrap();
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
    let merged = model.merged_graph(sum).unwrap();
    assert_eq!(merged.common_ancestor, None);
    assert_eq!(merged.nb_same_elems, 0);
}

#[test]
fn test_merge_of_merge_and_sibling_gradients() {
    let mut g = ModelContext::new("merge of merge");
    let input = g.add(Input::flat(3).unwrap()).unwrap();
    let a = g.add(FullyConnected::new(&g, input, 3).unwrap()).unwrap();
    let b = g.add(FullyConnected::new(&g, input, 3).unwrap()).unwrap();
    let inner = g.add(Sum::new(&g, &[b, a]).unwrap()).unwrap();
    let c = g.add(FullyConnected::new(&g, a, 3).unwrap()).unwrap();
    let outer = g.add(Sum::new(&g, &[inner, c]).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, outer).unwrap()).unwrap();

    let mut model = g.build(ExecutionContext::cpu()).unwrap();
    model.initialize(Default::default()).unwrap();
    let truth = random(2, 2 * 3);
    run_step(&mut model, input, loss, 2, &random(1, 2 * 3), &truth).unwrap();

    let merged = model.merged_graph(outer).unwrap();
    assert_eq!(merged.common_ancestor, Some(a));
    assert_eq!(merged.nb_same_elems, 2 * (3 * 3 + 3));
    assert_eq!(merged.layers, vec![b, c]);
    assert_eq!(merged.layers_index, vec![0, 1]);

    let diff = model.check_gradients(loss, &truth).unwrap();
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
    let nb_gc = |id: LayerId| model.layer(id).unwrap().nb_gc();
    assert_eq!(nb_gc(outer), 3 * 2 * (3 * 3 + 3));
    assert_eq!(merged.branch_nb_gc(0), nb_gc(inner));
    assert_eq!(merged.branch_nb_gc(1), nb_gc(c));
}

#[test]
fn test_merge_of_merge_from_distinct_inputs() {
    let mut g = ModelContext::new("two inputs, merge of merge");
    let left = g.add(Input::flat(2).unwrap()).unwrap();
    let right = g.add(Input::flat(3).unwrap()).unwrap();
    let a = g.add(FullyConnected::new(&g, left, 2).unwrap()).unwrap();
    let b = g.add(FullyConnected::new(&g, right, 2).unwrap()).unwrap();
    let inner = g.add(Sum::new(&g, &[b, a]).unwrap()).unwrap();
    let c = g.add(FullyConnected::new(&g, a, 2).unwrap()).unwrap();
    let outer = g.add(Sum::new(&g, &[inner, c]).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, outer).unwrap()).unwrap();

    let mut model = g.build(ExecutionContext::cpu()).unwrap();
    model.initialize(Default::default()).unwrap();
    let truth = random(5, 2);
    model.update_kernel(1).unwrap();
    model.set_data(left, &random(6, 2)).unwrap();
    model.set_data(right, &random(7, 3)).unwrap();
    model.forward().unwrap();
    model.loss_derivative(loss, &truth).unwrap();
    model.backward().unwrap();

    let diff = model.check_gradients(loss, &truth).unwrap();
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
    assert_eq!(model.merged_graph(inner).unwrap().common_ancestor, None);
    assert_eq!(model.merged_graph(outer).unwrap().common_ancestor, Some(a));
}

#[test]
fn test_fork_below_branch_heads() {
    // `s` feeds both branches, `x` only the first one
    let mut g = ModelContext::new("late fork");
    let input = g.add(Input::flat(3).unwrap()).unwrap();
    let x = g.add(FullyConnected::new(&g, input, 2).unwrap()).unwrap();
    let s = g.add(FullyConnected::new(&g, input, 2).unwrap()).unwrap();
    let first = g.add(Sum::new(&g, &[x, s]).unwrap()).unwrap();
    let second = g.add(FullyConnected::new(&g, s, 2).unwrap()).unwrap();
    let outer = g.add(Sum::new(&g, &[first, second]).unwrap()).unwrap();
    let loss = g.add(Mse::new(&g, outer).unwrap()).unwrap();

    let mut model = g.build(ExecutionContext::cpu()).unwrap();
    model.initialize(Default::default()).unwrap();
    let truth = random(2, 2 * 2);
    run_step(&mut model, input, loss, 2, &random(1, 2 * 3), &truth).unwrap();

    let merged = model.merged_graph(outer).unwrap();
    assert_eq!(merged.common_ancestor, Some(s));
    assert_eq!(merged.layers, vec![x, second]);
    assert_eq!(merged.layers_index, vec![0, 1]);
    assert_eq!(model.get_graph(loss).unwrap(), vec![input, x, s, first, second, outer, loss]);

    let diff = model.check_gradients(loss, &truth).unwrap();
    assert!(diff < GRADIENT_WARNING, "relative difference {diff}");
}
