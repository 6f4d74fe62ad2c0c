//! Output shapes of layers.

use core::fmt;

/// Shape of the output of one batch element.
///
/// Device buffers store batch elements one after the other; inside an
/// element, grids are laid out channel, then row, then column, and
/// sequences token, then feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Flat vector of neurons.
    Flat {
        /// Number of neurons.
        nb_neurons: usize,
    },
    /// Channels of 2D planes.
    Grid {
        /// Number of channels.
        nb_channels: usize,
        /// Plane height.
        height: usize,
        /// Plane width.
        width: usize,
    },
    /// Sequence of feature vectors.
    Seq {
        /// Sequence length.
        sequence: usize,
        /// Features per token.
        nb_neurons: usize,
    },
}

impl Shape {
    /// Flat shape of `nb_neurons`.
    pub const fn flat(nb_neurons: usize) -> Self {
        Self::Flat { nb_neurons }
    }

    /// Grid shape.
    pub const fn grid(nb_channels: usize, height: usize, width: usize) -> Self {
        Self::Grid {
            nb_channels,
            height,
            width,
        }
    }

    /// Sequence shape.
    pub const fn seq(sequence: usize, nb_neurons: usize) -> Self {
        Self::Seq {
            sequence,
            nb_neurons,
        }
    }

    /// Scalars per batch element.
    pub const fn size(&self) -> usize {
        match *self {
            Self::Flat { nb_neurons } => nb_neurons,
            Self::Grid {
                nb_channels,
                height,
                width,
            } => nb_channels * height * width,
            Self::Seq {
                sequence,
                nb_neurons,
            } => sequence * nb_neurons,
        }
    }

    /// `(channels, height, width)` of a grid.
    pub const fn as_grid(&self) -> Option<(usize, usize, usize)> {
        match *self {
            Self::Grid {
                nb_channels,
                height,
                width,
            } => Some((nb_channels, height, width)),
            _ => None,
        }
    }

    /// Same kind of shape with another plane resolution. Only grids change.
    pub const fn with_resolution(&self, height: usize, width: usize) -> Self {
        match *self {
            Self::Grid { nb_channels, .. } => Self::grid(nb_channels, height, width),
            other => other,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat { nb_neurons } => write!(f, "[{nb_neurons}]"),
            Self::Grid {
                nb_channels,
                height,
                width,
            } => write!(f, "[{nb_channels}x{height}x{width}]"),
            Self::Seq {
                sequence,
                nb_neurons,
            } => write!(f, "[{sequence}x{nb_neurons}]"),
        }
    }
}
