//! briny_graph: the layer-graph engine of a neural-network framework in Rust.
//!
//! A model is a directed acyclic graph of stateful layers supporting forward
//! evaluation, hand-written backpropagation, numerical gradient checking, and
//! CPU/GPU execution with equivalent results.
//!
//! # Features
//!
//! - Layers wired by id, created in topological order.
//! - Dirty-flag gradient accumulation: the first writer of a gradient
//!   overwrites it, later ones add to it, so fan-out needs no bookkeeping.
//! - Every operation on per-element CPU state (`f64`) and on flat device
//!   buffers (`f32`, optionally rounded to half precision).
//! - Gradient checking across branching graphs through common-ancestor
//!   reconstruction of merge layers.
//!
//! # Modules
//!
//! - [`layer`] — layer traits, shared state, graph views and merge links.
//! - [`layers`] — concrete layers.
//! - [`model`] — graph construction and traversal.
//! - [`device`] — compute devices, buffers and kernels.
//! - [`backend`] — execution context configuration.
//! - [`approx`] — tolerances for gradient and CPU/GPU comparisons.
//!
//! # Example
//!
//! ```rust
//! use briny_graph::backend::ExecutionContext;
//! use briny_graph::layers::{Activation, ActivationKind, FullyConnected, Input, Mse};
//! use briny_graph::model::ModelContext;
//!
//! # fn main() -> briny_graph::error::Result<()> {
//! let mut graph = ModelContext::new("tiny");
//! let input = graph.add(Input::flat(2)?)?;
//! let fc = graph.add(FullyConnected::new(&graph, input, 2)?)?;
//! let act = graph.add(Activation::new(&graph, fc, ActivationKind::Sigmoid)?)?;
//! let loss = graph.add(Mse::new(&graph, act)?)?;
//!
//! let mut model = graph.build(ExecutionContext::cpu())?;
//! model.initialize(Default::default())?;
//! model.update_kernel(1)?;
//! model.set_data(input, &[0.5, -1.0])?;
//! model.forward()?;
//! model.loss_derivative(loss, &[1.0, 0.0])?;
//! model.backward()?;
//! assert!(model.check_gradients(loss, &[1.0, 0.0])? < 1e-6);
//! # Ok(())
//! # }
//! ```

pub mod approx;
pub mod backend;
pub mod device;
pub mod error;
pub mod layer;
pub mod layers;
pub mod model;
pub mod shape;
pub mod state;
pub mod weights;
