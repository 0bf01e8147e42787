use super::{RecurrentCell, Seq2SeqParams, VideoModel};
use crate::autograd::Variable;
use crate::nn::module::{Module, Parameter, join};
use crate::nn::{Conv3d, LayerNorm};
use crate::tensor::{FloatElem, Result, Tensor, TensorError};
use rand::Rng;
use std::cell::RefCell;

/// Runs a [`RecurrentCell`] over the time axis of `[B, C, T, H, W]`.
///
/// The state starts at zero and has the configured frame size. Every hidden state is returned,
/// stacked back along time: `[B, hidden_channels, T, H, W]`.
#[derive(Debug)]
pub struct Recurrent<T: FloatElem, C> {
    pub cell: C,
    frame_size: [usize; 2],
    /// `[B, T, H * W]` attention of the last forward pass.
    attention: RefCell<Option<Tensor<T, 3>>>,
}

impl<T: FloatElem, C: RecurrentCell<T>> Recurrent<T, C> {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, params: &Seq2SeqParams, rng: &mut R) -> Result<Self> {
        Ok(Self {
            cell: C::new(in_channels, params, rng)?,
            frame_size: params.frame_size,
            attention: RefCell::new(None),
        })
    }

    pub fn forward(&self, x: &Variable<T, 5>) -> Result<Variable<T, 5>> {
        let [batch, channels, seq_len, height, width] = *x.shape();
        if [height, width] != self.frame_size {
            return Err(TensorError::ShapeMismatch {
                expected: self.frame_size.to_vec(),
                got: vec![height, width],
            });
        }
        if seq_len == 0 {
            return Err(TensorError::Unsupported("empty input sequence".into()));
        }

        let hidden_channels = self.cell.hidden_channels();
        let state_shape = [batch, hidden_channels, height, width];
        let mut hidden = Variable::new(Tensor::zeros(state_shape));
        let mut cell = Variable::new(Tensor::zeros(state_shape));

        let mut outputs = Vec::with_capacity(seq_len);
        let mut attention = Vec::new();
        for t in 0..seq_len {
            let frame = x.narrow(2, t, 1)?.reshape([batch, channels, height, width])?;
            let step = self.cell.step(&frame, &hidden, &cell)?;

            outputs.push(step.hidden.reshape([batch, hidden_channels, 1, height, width])?);
            if let Some(weights) = step.attention {
                attention.push(weights);
            }
            hidden = step.hidden;
            cell = step.cell;
        }

        *self.attention.borrow_mut() = stack_over_time(&attention)?;

        let parts: Vec<&Variable<T, 5>> = outputs.iter().collect();
        Variable::cat(&parts, 2)
    }

    /// Attention recorded by the last forward pass, if the cell attends.
    pub fn attention(&self) -> Option<Tensor<T, 3>> {
        self.attention.borrow().clone()
    }
}

/// Stacks per-step `[B, N]` maps into `[B, T, N]`.
fn stack_over_time<T: FloatElem>(steps: &[Tensor<T, 2>]) -> Result<Option<Tensor<T, 3>>> {
    let Some(first) = steps.first() else {
        return Ok(None);
    };
    let [batch, positions] = *first.shape();
    let expanded = steps
        .iter()
        .map(|s| s.clone().reshape([batch, 1, positions]))
        .collect::<Result<Vec<_>>>()?;
    let parts: Vec<&Tensor<T, 3>> = expanded.iter().collect();
    Tensor::concat(&parts, 1).map(Some)
}

impl<T: FloatElem, C: RecurrentCell<T>> Module<T> for Recurrent<T, C> {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Parameter<T>)) {
        self.cell.visit_parameters(&join(prefix, "cell"), f);
    }
}

/// Stacked recurrent layers with LayerNorm, a 3x3x3 convolution head and a sigmoid.
///
/// ```text
/// X -> [Recurrent -> LayerNorm([num_kernels, T, H, W])] x num_layers -> Conv3d -> sigmoid
/// ```
#[derive(Debug)]
pub struct Seq2SeqModel<T: FloatElem, C> {
    pub params: Seq2SeqParams,
    pub layers: Vec<Recurrent<T, C>>,
    pub norms: Vec<LayerNorm<T, 4>>,
    pub head: Conv3d<T>,
}

impl<T: FloatElem, C: RecurrentCell<T>> Seq2SeqModel<T, C> {
    pub fn new<R: Rng + ?Sized>(params: Seq2SeqParams, rng: &mut R) -> Result<Self> {
        params.validate()?;
        let [height, width] = params.frame_size;

        let mut layers = Vec::with_capacity(params.num_layers);
        let mut norms = Vec::with_capacity(params.num_layers);
        for i in 0..params.num_layers {
            let in_channels = if i == 0 {
                params.num_channels
            } else {
                params.num_kernels
            };
            layers.push(Recurrent::new(in_channels, &params, rng)?);
            norms.push(LayerNorm::new([
                params.num_kernels,
                params.input_seq_length,
                height,
                width,
            ]));
        }
        let head = Conv3d::same(params.num_kernels, params.out_channels(), [3, 3, 3], rng)?;

        Ok(Self {
            params,
            layers,
            norms,
            head,
        })
    }
}

impl<T: FloatElem, C: RecurrentCell<T>> Module<T> for Seq2SeqModel<T, C> {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Parameter<T>)) {
        for (i, (layer, norm)) in self.layers.iter_mut().zip(&mut self.norms).enumerate() {
            layer.visit_parameters(&join(prefix, &format!("{}{}", C::LAYER_NAME, i + 1)), f);
            norm.visit_parameters(&join(prefix, &format!("layernorm{}", i + 1)), f);
        }
        self.head.visit_parameters(&join(prefix, "conv3d"), f);
    }
}

impl<T: FloatElem, C: RecurrentCell<T>> VideoModel<T> for Seq2SeqModel<T, C> {
    fn forward(&self, x: &Variable<T, 5>) -> Result<Variable<T, 5>> {
        let mut hidden = x.clone();
        for (layer, norm) in self.layers.iter().zip(&self.norms) {
            hidden = norm.forward(&layer.forward(&hidden)?)?;
        }
        let output = self.head.forward(&hidden)?.sigmoid();

        if self.params.return_sequences {
            return Ok(output);
        }
        let seq_len = output.shape()[2];
        output.narrow(2, seq_len - 1, 1)
    }

    fn attention_maps(&self) -> Vec<(String, Tensor<T, 3>)> {
        self.layers
            .iter()
            .enumerate()
            .filter_map(|(i, layer)| {
                layer
                    .attention()
                    .map(|map| (format!("{}{}", C::LAYER_NAME, i + 1), map))
            })
            .collect()
    }
}
