#![allow(dead_code)]

use briny_graph::error::Result;
use briny_graph::layer::LayerId;
use briny_graph::model::Model;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn random(seed: u64, len: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Forward, loss derivative and backward over one batch.
pub fn run_step(
    model: &mut Model,
    input: LayerId,
    loss: LayerId,
    batch: usize,
    data: &[f64],
    truth: &[f64],
) -> Result<()> {
    model.update_kernel(batch)?;
    model.set_data(input, data)?;
    model.forward()?;
    model.loss_derivative(loss, truth)?;
    model.backward()
}
