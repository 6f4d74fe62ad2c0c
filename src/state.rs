//! Per-neuron CPU state.
//!
//! A [`Neurons`] array holds one [`Neuron`] per scalar position of a layer
//! output. Each neuron keeps, for every batch element, the forward value and
//! the backward gradient ([`Var`]), plus one forward value per
//! gradient-checking probe.

use crate::shape::Shape;

/// Forward value and backward gradient of one scalar for one batch element.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Var {
    /// Forward value.
    pub out: f64,
    /// Gradient of the loss with respect to `out`.
    pub delta: f64,
}

/// State of one scalar position across the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Neuron {
    /// One value per batch element.
    pub v: Vec<Var>,
    /// `gc[elem][probe]`: forward value of each gradient-checking probe.
    pub gc: Vec<Vec<f64>>,
}

impl Neuron {
    fn with_batch(batch: usize) -> Self {
        Self {
            v: vec![Var::default(); batch],
            gc: Vec::new(),
        }
    }
}

/// Neuron state of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Neurons {
    shape: Shape,
    units: Vec<Neuron>,
    capacity: usize,
}

impl Neurons {
    /// Allocates zeroed state for `capacity` batch elements.
    pub fn new(shape: Shape, capacity: usize) -> Self {
        Self {
            shape,
            units: (0..shape.size()).map(|_| Neuron::with_batch(capacity)).collect(),
            capacity,
        }
    }

    /// Shape of one batch element.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Largest batch the state can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of neurons.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether there is no neuron.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// All neurons.
    pub fn units(&self) -> &[Neuron] {
        &self.units
    }

    /// All neurons, mutably.
    pub fn units_mut(&mut self) -> &mut [Neuron] {
        &mut self.units
    }

    /// Neuron at flat index `index`.
    pub fn get(&self, index: usize) -> &Neuron {
        &self.units[index]
    }

    /// Neuron at flat index `index`, mutably.
    pub fn get_mut(&mut self, index: usize) -> &mut Neuron {
        &mut self.units[index]
    }

    /// Number of gradient-checking probes currently held.
    pub fn nb_gc(&self) -> usize {
        self.units
            .first()
            .and_then(|unit| unit.gc.first())
            .map_or(0, Vec::len)
    }

    /// Resets the probe arrays to `nb_gc` zeroed probes per batch element.
    pub fn init_gc(&mut self, batch: usize, nb_gc: usize) {
        for unit in &mut self.units {
            unit.gc = vec![vec![0.0; nb_gc]; batch];
        }
    }

    /// Forward values of batch element `elem`, in flat order.
    pub fn outs(&self, elem: usize) -> Vec<f64> {
        self.units.iter().map(|unit| unit.v[elem].out).collect()
    }

    /// Gradients of batch element `elem`, in flat order.
    pub fn deltas(&self, elem: usize) -> Vec<f64> {
        self.units.iter().map(|unit| unit.v[elem].delta).collect()
    }

    /// Loads forward values of the first `batch` elements from a flat
    /// device layout.
    pub fn load_outs(&mut self, batch: usize, flat: &[f32]) {
        let size = self.units.len();
        for elem in 0..batch {
            for (index, unit) in self.units.iter_mut().enumerate() {
                unit.v[elem].out = f64::from(flat[elem * size + index]);
            }
        }
    }

    /// Writes the forward values of the first `batch` elements in flat
    /// device layout.
    pub fn store_outs(&self, batch: usize, flat: &mut [f32]) {
        let size = self.units.len();
        for elem in 0..batch {
            for (index, unit) in self.units.iter().enumerate() {
                flat[elem * size + index] = unit.v[elem].out as f32;
            }
        }
    }
}
