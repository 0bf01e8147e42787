//! Self-Attention ConvLSTM.
//!
//! A ConvLSTM whose input frame and previous hidden state both pass through a spatial
//! self-attention block before the gates are computed, so each position can draw on the whole
//! frame instead of only its convolutional neighbourhood.

use super::convlstm::ConvLstmCell;
use super::recurrent::{Recurrent, Seq2SeqModel};
use super::{CellOutput, RecurrentCell, Seq2SeqParams};
use crate::autograd::Variable;
use crate::autograd::ops::from_usize;
use crate::nn::module::{Module, Parameter, join};
use crate::nn::{Conv2d, Padding, Size2};
use crate::tensor::{FloatElem, Result, Tensor};
use rand::Rng;

/// A Self-Attention ConvLSTM layer over `[B, C, T, H, W]`.
pub type SaConvLstm<T> = Recurrent<T, SaConvLstmCell<T>>;

/// Sequence-to-sequence Self-Attention ConvLSTM.
pub type SaSeq2Seq<T> = Seq2SeqModel<T, SaConvLstmCell<T>>;

/// Spatial self-attention over the `H * W` positions of a feature map.
///
/// $$
/// A = \mathrm{softmax}(Q^\top K), \quad Z = W_z * (V A^\top), \quad \mathrm{out} = Z + X
/// $$
///
/// with `Q`, `K` (`hidden_dims` channels) and `V` (input channels) produced by 1x1 convolutions.
#[derive(Debug)]
pub struct SelfAttention<T: FloatElem> {
    pub query: Conv2d<T>,
    pub key: Conv2d<T>,
    pub value: Conv2d<T>,
    pub z: Conv2d<T>,
}

impl<T: FloatElem> SelfAttention<T> {
    pub fn new<R: Rng + ?Sized>(input_dims: usize, hidden_dims: usize, rng: &mut R) -> Result<Self> {
        let pointwise = |out: usize, rng: &mut R| {
            Conv2d::new(input_dims, out, Size2::Square(1), Padding::Valid, rng)
        };
        Ok(Self {
            query: pointwise(hidden_dims, rng)?,
            key: pointwise(hidden_dims, rng)?,
            value: pointwise(input_dims, rng)?,
            z: pointwise(input_dims, rng)?,
        })
    }

    /// Returns the attended map `[B, C, H, W]` and the attention weights `[B, N, N]`, where row
    /// `i` is the distribution of query position `i` over all key positions.
    pub fn forward(&self, x: &Variable<T, 4>) -> Result<(Variable<T, 4>, Variable<T, 3>)> {
        let [batch, channels, height, width] = *x.shape();
        let positions = height * width;
        let hidden = self.query.out_channels();

        let q = self
            .query
            .forward(x)?
            .reshape([batch, hidden, positions])?
            .permute([0, 2, 1])?;
        let k = self.key.forward(x)?.reshape([batch, hidden, positions])?;
        let v = self.value.forward(x)?.reshape([batch, channels, positions])?;

        let attention = q.matmul(&k)?.softmax();
        let attended = v
            .matmul(&attention.permute([0, 2, 1])?)?
            .reshape([batch, channels, height, width])?;
        let out = (&self.z.forward(&attended)? + x)?;
        Ok((out, attention))
    }
}

impl<T: FloatElem> Module<T> for SelfAttention<T> {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Parameter<T>)) {
        self.query.visit_parameters(&join(prefix, "query"), f);
        self.key.visit_parameters(&join(prefix, "key"), f);
        self.value.visit_parameters(&join(prefix, "value"), f);
        self.z.visit_parameters(&join(prefix, "z"), f);
    }
}

/// Averages `[B, N, N]` attention over query positions, giving how much each position is attended
/// to: `[B, N]`.
pub fn mean_over_queries<T: FloatElem>(attention: &Tensor<T, 3>) -> Result<Tensor<T, 2>> {
    let [batch, queries, keys] = *attention.shape();
    let n = from_usize::<T>(queries.max(1))?;
    let mut out = vec![T::zero(); batch * keys];
    for (b, sample) in attention.data().chunks(queries * keys).enumerate() {
        let row = &mut out[b * keys..(b + 1) * keys];
        for query in sample.chunks(keys) {
            for (acc, &w) in row.iter_mut().zip(query) {
                *acc += w;
            }
        }
        for acc in row.iter_mut() {
            *acc = *acc / n;
        }
    }
    Tensor::new(out, [batch, keys])
}

/// ConvLSTM timestep on self-attended input and hidden state.
#[derive(Debug)]
pub struct SaConvLstmCell<T: FloatElem> {
    pub attention_x: SelfAttention<T>,
    pub attention_h: SelfAttention<T>,
    pub convlstm: ConvLstmCell<T>,
}

impl<T: FloatElem> RecurrentCell<T> for SaConvLstmCell<T> {
    const LAYER_NAME: &'static str = "sa_convlstm";

    fn new<R: Rng + ?Sized>(in_channels: usize, params: &Seq2SeqParams, rng: &mut R) -> Result<Self> {
        let hidden_dims = params.attention_hidden_dims;
        Ok(Self {
            attention_x: SelfAttention::new(in_channels, hidden_dims, rng)?,
            attention_h: SelfAttention::new(params.num_kernels, hidden_dims, rng)?,
            convlstm: ConvLstmCell::new(in_channels, params, rng)?,
        })
    }

    fn hidden_channels(&self) -> usize {
        self.convlstm.hidden_channels()
    }

    fn step(
        &self,
        x: &Variable<T, 4>,
        h_prev: &Variable<T, 4>,
        c_prev: &Variable<T, 4>,
    ) -> Result<CellOutput<T>> {
        let (x_attended, _) = self.attention_x.forward(x)?;
        let (h_attended, weights) = self.attention_h.forward(h_prev)?;

        let mut out = self.convlstm.step(&x_attended, &h_attended, c_prev)?;
        out.attention = Some(mean_over_queries(&weights.data)?);
        Ok(out)
    }
}

impl<T: FloatElem> Module<T> for SaConvLstmCell<T> {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Parameter<T>)) {
        self.attention_x.visit_parameters(&join(prefix, "attention_x"), f);
        self.attention_h.visit_parameters(&join(prefix, "attention_h"), f);
        self.convlstm.visit_parameters(&join(prefix, "convlstm"), f);
    }
}
