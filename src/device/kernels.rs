//! Kernel table of the host device.
//!
//! Each kernel reads its parameters from binding `0` and its buffers from
//! the bindings listed in [`Kernel::inputs`] and [`Kernel::outputs`]. The
//! `wgpu` shaders in `shaders/` follow the same bindings and parameters.
//!
//! | kernel                | params                                              | inputs              | outputs        |
//! |-----------------------|-----------------------------------------------------|---------------------|----------------|
//! | `copy`                | n, half                                             | 1 src               | 2 dst          |
//! | `add`                 | n, half                                             | 1 src               | 2 dst          |
//! | `linear_forward`      | batch, nb_out, nb_in, half                          | 1 prev, 2 w, 3 b    | 4 outs         |
//! | `linear_backward`     | batch, nb_out, nb_in, accumulate, half              | 1 delta, 2 w        | 3 delta_prev   |
//! | `linear_weights`      | batch, nb_out, nb_in, accumulate, half              | 1 delta, 2 prev     | 3 gw, 4 gb     |
//! | `conv_forward`        | geometry, half                                      | 1 prev, 2 w, 3 b    | 4 outs         |
//! | `conv_backward`       | geometry, accumulate, half                          | 1 delta, 2 w        | 3 delta_prev   |
//! | `conv_weights`        | geometry, accumulate, half                          | 1 delta, 2 prev     | 3 gw, 4 gb     |
//! | `activation_forward`  | n, kind, half                                       | 1 prev              | 2 outs         |
//! | `activation_backward` | n, kind, accumulate, half                           | 1 delta, 2 prev     | 3 delta_prev   |
//! | `concat_forward`      | batch, size_in, size_out, offset, half              | 1 prev              | 2 outs         |
//! | `concat_backward`     | batch, size_in, size_out, offset, accumulate, half  | 1 delta             | 2 delta_prev   |
//! | `mse_derivative`      | n, factor, accumulate, half                         | 1 outs, 2 truth     | 3 delta_prev   |
//! | `sgd`                 | n, lr, half                                         | -                   | 1 w, 2 g       |
//!
//! `geometry` is the ten words of [`ConvGeometry::words`]. Floats are passed
//! as `f32::to_bits`.

use super::store;
use crate::error::DeviceError;
use crate::layers::activation::ActivationKind;
use rayon::prelude::*;
use std::collections::HashMap;

/// Host implementation of a kernel.
pub type KernelFn = fn(&[u32], &[&[f32]], &mut [&mut [f32]]) -> Result<(), DeviceError>;

/// A registered kernel.
pub struct Kernel {
    /// Name used by [`create_command`](crate::device::Device).
    pub name: &'static str,
    /// Bindings read by the kernel.
    pub inputs: &'static [u32],
    /// Bindings written by the kernel.
    pub outputs: &'static [u32],
    /// Host implementation.
    pub run: KernelFn,
}

lazy_static::lazy_static! {
    static ref REGISTRY: HashMap<&'static str, Kernel> = {
        let kernels = [
            Kernel { name: "copy", inputs: &[1], outputs: &[2], run: copy },
            Kernel { name: "add", inputs: &[1], outputs: &[2], run: add },
            Kernel { name: "linear_forward", inputs: &[1, 2, 3], outputs: &[4], run: linear_forward },
            Kernel { name: "linear_backward", inputs: &[1, 2], outputs: &[3], run: linear_backward },
            Kernel { name: "linear_weights", inputs: &[1, 2], outputs: &[3, 4], run: linear_weights },
            Kernel { name: "conv_forward", inputs: &[1, 2, 3], outputs: &[4], run: conv_forward },
            Kernel { name: "conv_backward", inputs: &[1, 2], outputs: &[3], run: conv_backward },
            Kernel { name: "conv_weights", inputs: &[1, 2], outputs: &[3, 4], run: conv_weights },
            Kernel { name: "activation_forward", inputs: &[1], outputs: &[2], run: activation_forward },
            Kernel { name: "activation_backward", inputs: &[1, 2], outputs: &[3], run: activation_backward },
            Kernel { name: "concat_forward", inputs: &[1], outputs: &[2], run: concat_forward },
            Kernel { name: "concat_backward", inputs: &[1], outputs: &[2], run: concat_backward },
            Kernel { name: "mse_derivative", inputs: &[1, 2], outputs: &[3], run: mse_derivative },
            Kernel { name: "sgd", inputs: &[], outputs: &[1, 2], run: sgd },
        ];
        kernels.into_iter().map(|kernel| (kernel.name, kernel)).collect()
    };
}

/// Finds a kernel by name.
pub fn lookup(name: &str) -> Result<&'static Kernel, DeviceError> {
    REGISTRY
        .get(name)
        .ok_or_else(|| DeviceError::UnknownKernel(name.to_string()))
}

/// Every registered kernel name.
pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.keys().copied()
}

/// Geometry of a 2D convolution, shared by the CPU path and the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    /// Batch elements.
    pub batch: usize,
    /// Input channels.
    pub c_in: usize,
    /// Input height.
    pub h_in: usize,
    /// Input width.
    pub w_in: usize,
    /// Output channels.
    pub c_out: usize,
    /// Output height.
    pub h_out: usize,
    /// Output width.
    pub w_out: usize,
    /// Kernel side.
    pub kernel: usize,
    /// Stride.
    pub stride: usize,
    /// Zero padding on each border.
    pub padding: usize,
}

impl ConvGeometry {
    /// Parameter words, in kernel order.
    pub fn words(&self) -> [u32; 10] {
        [
            self.batch,
            self.c_in,
            self.h_in,
            self.w_in,
            self.c_out,
            self.h_out,
            self.w_out,
            self.kernel,
            self.stride,
            self.padding,
        ]
        .map(|x| x as u32)
    }

    fn parse(params: &[u32]) -> Result<Self, DeviceError> {
        Ok(Self {
            batch: usize_at(params, 0)?,
            c_in: usize_at(params, 1)?,
            h_in: usize_at(params, 2)?,
            w_in: usize_at(params, 3)?,
            c_out: usize_at(params, 4)?,
            h_out: usize_at(params, 5)?,
            w_out: usize_at(params, 6)?,
            kernel: usize_at(params, 7)?,
            stride: usize_at(params, 8)?,
            padding: usize_at(params, 9)?,
        })
    }

    /// Elements of one input batch element.
    pub fn in_size(&self) -> usize {
        self.c_in * self.h_in * self.w_in
    }

    /// Elements of one output batch element.
    pub fn out_size(&self) -> usize {
        self.c_out * self.h_out * self.w_out
    }

    /// Number of kernel weights.
    pub fn nb_weights(&self) -> usize {
        self.c_out * self.c_in * self.kernel * self.kernel
    }

    /// Flat index of weight (`co`, `ci`, `ki`, `kj`).
    pub fn weight_index(&self, co: usize, ci: usize, ki: usize, kj: usize) -> usize {
        ((co * self.c_in + ci) * self.kernel + ki) * self.kernel + kj
    }

    /// Input position read by output (`y`, `x`) through tap (`ki`, `kj`).
    pub fn input_pos(&self, y: usize, x: usize, ki: usize, kj: usize) -> Option<(usize, usize)> {
        let iy = (y * self.stride + ki).checked_sub(self.padding)?;
        let ix = (x * self.stride + kj).checked_sub(self.padding)?;
        (iy < self.h_in && ix < self.w_in).then_some((iy, ix))
    }

    /// Output position reading input (`iy`, `ix`) through tap (`ki`, `kj`).
    pub fn output_pos(&self, iy: usize, ix: usize, ki: usize, kj: usize) -> Option<(usize, usize)> {
        let ny = (iy + self.padding).checked_sub(ki)?;
        let nx = (ix + self.padding).checked_sub(kj)?;
        if ny % self.stride != 0 || nx % self.stride != 0 {
            return None;
        }
        let (y, x) = (ny / self.stride, nx / self.stride);
        (y < self.h_out && x < self.w_out).then_some((y, x))
    }
}

fn word(params: &[u32], index: usize) -> Result<u32, DeviceError> {
    params.get(index).copied().ok_or(DeviceError::Size {
        expected: index + 1,
        actual: params.len(),
    })
}

fn usize_at(params: &[u32], index: usize) -> Result<usize, DeviceError> {
    word(params, index).map(|x| x as usize)
}

fn flag_at(params: &[u32], index: usize) -> Result<bool, DeviceError> {
    word(params, index).map(|x| x != 0)
}

fn float_at(params: &[u32], index: usize) -> Result<f32, DeviceError> {
    word(params, index).map(f32::from_bits)
}

fn input<'a>(inputs: &[&'a [f32]], index: usize, len: usize) -> Result<&'a [f32], DeviceError> {
    let data = inputs.get(index).copied().ok_or(DeviceError::Size {
        expected: index + 1,
        actual: inputs.len(),
    })?;
    data.get(..len).ok_or(DeviceError::Size {
        expected: len,
        actual: data.len(),
    })
}

fn output<'a>(
    outputs: &'a mut [&mut [f32]],
    index: usize,
    len: usize,
) -> Result<&'a mut [f32], DeviceError> {
    let count = outputs.len();
    let data = outputs.get_mut(index).ok_or(DeviceError::Size {
        expected: index + 1,
        actual: count,
    })?;
    let actual = data.len();
    data.get_mut(..len).ok_or(DeviceError::Size { expected: len, actual })
}

fn output_pair<'a>(
    outputs: &'a mut [&mut [f32]],
    len0: usize,
    len1: usize,
) -> Result<(&'a mut [f32], &'a mut [f32]), DeviceError> {
    let count = outputs.len();
    match outputs {
        [first, second, ..] => {
            let (a0, a1) = (first.len(), second.len());
            let first = first.get_mut(..len0).ok_or(DeviceError::Size {
                expected: len0,
                actual: a0,
            })?;
            let second = second.get_mut(..len1).ok_or(DeviceError::Size {
                expected: len1,
                actual: a1,
            })?;
            Ok((first, second))
        }
        _ => Err(DeviceError::Size {
            expected: 2,
            actual: count,
        }),
    }
}

#[inline]
fn write(slot: &mut f32, value: f32, accumulate: bool, half: bool) {
    let value = if accumulate { *slot + value } else { value };
    *slot = store(value, half);
}

fn activation_kind(code: u32) -> Result<ActivationKind, DeviceError> {
    ActivationKind::from_code(code)
        .ok_or_else(|| DeviceError::UnknownKernel(format!("activation kind {code}")))
}

fn copy(params: &[u32], inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<(), DeviceError> {
    let n = usize_at(params, 0)?;
    let half = flag_at(params, 1)?;
    let src = input(inputs, 0, n)?;
    let dst = output(outputs, 0, n)?;
    dst.par_iter_mut()
        .zip(src.par_iter())
        .for_each(|(d, s)| *d = store(*s, half));
    Ok(())
}

fn add(params: &[u32], inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<(), DeviceError> {
    let n = usize_at(params, 0)?;
    let half = flag_at(params, 1)?;
    let src = input(inputs, 0, n)?;
    let dst = output(outputs, 0, n)?;
    dst.par_iter_mut()
        .zip(src.par_iter())
        .for_each(|(d, s)| write(d, *s, true, half));
    Ok(())
}

fn linear_forward(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let batch = usize_at(params, 0)?;
    let nb_out = usize_at(params, 1)?;
    let nb_in = usize_at(params, 2)?;
    let half = flag_at(params, 3)?;
    let prev = input(inputs, 0, batch * nb_in)?;
    let weights = input(inputs, 1, nb_out * nb_in)?;
    let biases = input(inputs, 2, nb_out)?;
    let outs = output(outputs, 0, batch * nb_out)?;

    outs.par_iter_mut().enumerate().for_each(|(index, o)| {
        let (elem, j) = (index / nb_out, index % nb_out);
        let row = &weights[j * nb_in..(j + 1) * nb_in];
        let x = &prev[elem * nb_in..(elem + 1) * nb_in];
        let sum: f32 = row.iter().zip(x).map(|(w, x)| w * x).sum();
        *o = store(biases[j] + sum, half);
    });
    Ok(())
}

fn linear_backward(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let batch = usize_at(params, 0)?;
    let nb_out = usize_at(params, 1)?;
    let nb_in = usize_at(params, 2)?;
    let accumulate = flag_at(params, 3)?;
    let half = flag_at(params, 4)?;
    let delta = input(inputs, 0, batch * nb_out)?;
    let weights = input(inputs, 1, nb_out * nb_in)?;
    let delta_prev = output(outputs, 0, batch * nb_in)?;

    delta_prev.par_iter_mut().enumerate().for_each(|(index, d)| {
        let (elem, i) = (index / nb_in, index % nb_in);
        let sum: f32 = (0..nb_out)
            .map(|j| weights[j * nb_in + i] * delta[elem * nb_out + j])
            .sum();
        write(d, sum, accumulate, half);
    });
    Ok(())
}

fn linear_weights(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let batch = usize_at(params, 0)?;
    let nb_out = usize_at(params, 1)?;
    let nb_in = usize_at(params, 2)?;
    let accumulate = flag_at(params, 3)?;
    let half = flag_at(params, 4)?;
    let delta = input(inputs, 0, batch * nb_out)?;
    let prev = input(inputs, 1, batch * nb_in)?;
    let (grad_w, grad_b) = output_pair(outputs, nb_out * nb_in, nb_out)?;

    grad_w.par_iter_mut().enumerate().for_each(|(index, g)| {
        let (j, i) = (index / nb_in, index % nb_in);
        let sum: f32 = (0..batch)
            .map(|elem| delta[elem * nb_out + j] * prev[elem * nb_in + i])
            .sum();
        write(g, sum, accumulate, half);
    });
    grad_b.par_iter_mut().enumerate().for_each(|(j, g)| {
        let sum: f32 = (0..batch).map(|elem| delta[elem * nb_out + j]).sum();
        write(g, sum, accumulate, half);
    });
    Ok(())
}

fn conv_forward(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let geo = ConvGeometry::parse(params)?;
    let half = flag_at(params, 10)?;
    let (in_size, out_size) = (geo.in_size(), geo.out_size());
    let prev = input(inputs, 0, geo.batch * in_size)?;
    let weights = input(inputs, 1, geo.nb_weights())?;
    let biases = input(inputs, 2, geo.c_out)?;
    let outs = output(outputs, 0, geo.batch * out_size)?;

    outs.par_iter_mut().enumerate().for_each(|(index, o)| {
        let (elem, rem) = (index / out_size, index % out_size);
        let plane = geo.h_out * geo.w_out;
        let (co, y, x) = (rem / plane, (rem / geo.w_out) % geo.h_out, rem % geo.w_out);
        let mut sum = biases[co];
        for ci in 0..geo.c_in {
            for ki in 0..geo.kernel {
                for kj in 0..geo.kernel {
                    if let Some((iy, ix)) = geo.input_pos(y, x, ki, kj) {
                        sum += weights[geo.weight_index(co, ci, ki, kj)]
                            * prev[elem * in_size + (ci * geo.h_in + iy) * geo.w_in + ix];
                    }
                }
            }
        }
        *o = store(sum, half);
    });
    Ok(())
}

fn conv_backward(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let geo = ConvGeometry::parse(params)?;
    let accumulate = flag_at(params, 10)?;
    let half = flag_at(params, 11)?;
    let (in_size, out_size) = (geo.in_size(), geo.out_size());
    let delta = input(inputs, 0, geo.batch * out_size)?;
    let weights = input(inputs, 1, geo.nb_weights())?;
    let delta_prev = output(outputs, 0, geo.batch * in_size)?;

    delta_prev.par_iter_mut().enumerate().for_each(|(index, d)| {
        let (elem, rem) = (index / in_size, index % in_size);
        let plane = geo.h_in * geo.w_in;
        let (ci, iy, ix) = (rem / plane, (rem / geo.w_in) % geo.h_in, rem % geo.w_in);
        let mut sum = 0.0;
        for co in 0..geo.c_out {
            for ki in 0..geo.kernel {
                for kj in 0..geo.kernel {
                    if let Some((y, x)) = geo.output_pos(iy, ix, ki, kj) {
                        sum += weights[geo.weight_index(co, ci, ki, kj)]
                            * delta[elem * out_size + (co * geo.h_out + y) * geo.w_out + x];
                    }
                }
            }
        }
        write(d, sum, accumulate, half);
    });
    Ok(())
}

fn conv_weights(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let geo = ConvGeometry::parse(params)?;
    let accumulate = flag_at(params, 10)?;
    let half = flag_at(params, 11)?;
    let (in_size, out_size) = (geo.in_size(), geo.out_size());
    let delta = input(inputs, 0, geo.batch * out_size)?;
    let prev = input(inputs, 1, geo.batch * in_size)?;
    let (grad_w, grad_b) = output_pair(outputs, geo.nb_weights(), geo.c_out)?;

    let k2 = geo.kernel * geo.kernel;
    grad_w.par_iter_mut().enumerate().for_each(|(index, g)| {
        let (co, ci) = (index / (geo.c_in * k2), (index / k2) % geo.c_in);
        let (ki, kj) = ((index % k2) / geo.kernel, index % geo.kernel);
        let mut sum = 0.0;
        for elem in 0..geo.batch {
            for y in 0..geo.h_out {
                for x in 0..geo.w_out {
                    if let Some((iy, ix)) = geo.input_pos(y, x, ki, kj) {
                        sum += delta[elem * out_size + (co * geo.h_out + y) * geo.w_out + x]
                            * prev[elem * in_size + (ci * geo.h_in + iy) * geo.w_in + ix];
                    }
                }
            }
        }
        write(g, sum, accumulate, half);
    });
    let plane = geo.h_out * geo.w_out;
    grad_b.par_iter_mut().enumerate().for_each(|(co, g)| {
        let mut sum = 0.0;
        for elem in 0..geo.batch {
            let start = elem * out_size + co * plane;
            sum += delta[start..start + plane].iter().sum::<f32>();
        }
        write(g, sum, accumulate, half);
    });
    Ok(())
}

fn activation_forward(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let n = usize_at(params, 0)?;
    let kind = activation_kind(word(params, 1)?)?;
    let half = flag_at(params, 2)?;
    let prev = input(inputs, 0, n)?;
    let outs = output(outputs, 0, n)?;
    outs.par_iter_mut()
        .zip(prev.par_iter())
        .for_each(|(o, x)| *o = store(kind.apply(f64::from(*x)) as f32, half));
    Ok(())
}

fn activation_backward(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let n = usize_at(params, 0)?;
    let kind = activation_kind(word(params, 1)?)?;
    let accumulate = flag_at(params, 2)?;
    let half = flag_at(params, 3)?;
    let delta = input(inputs, 0, n)?;
    let prev = input(inputs, 1, n)?;
    let delta_prev = output(outputs, 0, n)?;
    delta_prev
        .par_iter_mut()
        .zip(delta.par_iter().zip(prev.par_iter()))
        .for_each(|(d, (g, x))| {
            let value = kind.derivative(f64::from(*x)) as f32 * g;
            write(d, value, accumulate, half);
        });
    Ok(())
}

fn concat_forward(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let batch = usize_at(params, 0)?;
    let size_in = usize_at(params, 1)?;
    let size_out = usize_at(params, 2)?;
    let offset = usize_at(params, 3)?;
    let half = flag_at(params, 4)?;
    if offset + size_in > size_out {
        return Err(DeviceError::Size {
            expected: size_out,
            actual: offset + size_in,
        });
    }
    if size_in == 0 {
        return Ok(());
    }
    let prev = input(inputs, 0, batch * size_in)?;
    let outs = output(outputs, 0, batch * size_out)?;
    outs.par_chunks_mut(size_out)
        .zip(prev.par_chunks(size_in))
        .for_each(|(o, p)| {
            for (dst, src) in o[offset..offset + size_in].iter_mut().zip(p) {
                *dst = store(*src, half);
            }
        });
    Ok(())
}

fn concat_backward(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let batch = usize_at(params, 0)?;
    let size_in = usize_at(params, 1)?;
    let size_out = usize_at(params, 2)?;
    let offset = usize_at(params, 3)?;
    let accumulate = flag_at(params, 4)?;
    let half = flag_at(params, 5)?;
    if offset + size_in > size_out {
        return Err(DeviceError::Size {
            expected: size_out,
            actual: offset + size_in,
        });
    }
    if size_in == 0 {
        return Ok(());
    }
    let delta = input(inputs, 0, batch * size_out)?;
    let delta_prev = output(outputs, 0, batch * size_in)?;
    delta_prev
        .par_chunks_mut(size_in)
        .zip(delta.par_chunks(size_out))
        .for_each(|(d, g)| {
            for (dst, src) in d.iter_mut().zip(&g[offset..offset + size_in]) {
                write(dst, *src, accumulate, half);
            }
        });
    Ok(())
}

fn mse_derivative(
    params: &[u32],
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
) -> Result<(), DeviceError> {
    let n = usize_at(params, 0)?;
    let factor = float_at(params, 1)?;
    let accumulate = flag_at(params, 2)?;
    let half = flag_at(params, 3)?;
    let outs = input(inputs, 0, n)?;
    let truth = input(inputs, 1, n)?;
    let delta_prev = output(outputs, 0, n)?;
    delta_prev
        .par_iter_mut()
        .zip(outs.par_iter().zip(truth.par_iter()))
        .for_each(|(d, (o, t))| write(d, factor * (o - t), accumulate, half));
    Ok(())
}

fn sgd(params: &[u32], _inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<(), DeviceError> {
    let n = usize_at(params, 0)?;
    let lr = float_at(params, 1)?;
    let half = flag_at(params, 2)?;
    let (weights, grads) = output_pair(outputs, n, n)?;
    weights
        .par_iter_mut()
        .zip(grads.par_iter_mut())
        .for_each(|(w, g)| {
            *w = store(*w - lr * *g, half);
            *g = 0.0;
        });
    Ok(())
}
