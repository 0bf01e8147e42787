//! ConvLSTM (Shi et al., 2015).
//!
//! An LSTM whose input-to-state and state-to-state transitions are convolutions, so the hidden
//! and cell states keep the spatial layout of the frames. Peephole connections let the cell state
//! drive the gates:
//!
//! $$
//! \begin{aligned}
//! i_t &= \sigma(W_{xi} * X_t + W_{hi} * H_{t-1} + W_{ci} \circ C_{t-1} + b_i) \\
//! f_t &= \sigma(W_{xf} * X_t + W_{hf} * H_{t-1} + W_{cf} \circ C_{t-1} + b_f) \\
//! C_t &= f_t \circ C_{t-1} + i_t \circ \phi(W_{xc} * X_t + W_{hc} * H_{t-1} + b_c) \\
//! o_t &= \sigma(W_{xo} * X_t + W_{ho} * H_{t-1} + W_{co} \circ C_t + b_o) \\
//! H_t &= o_t \circ \phi(C_t)
//! \end{aligned}
//! $$

use super::recurrent::{Recurrent, Seq2SeqModel};
use super::{CellOutput, RecurrentCell, Seq2SeqParams};
use crate::autograd::Variable;
use crate::nn::module::{Module, Parameter, join};
use crate::nn::{Activation, Conv2d};
use crate::tensor::{FloatElem, Result};
use rand::Rng;

/// A ConvLSTM layer over `[B, C, T, H, W]`.
pub type ConvLstm<T> = Recurrent<T, ConvLstmCell<T>>;

/// Sequence-to-sequence ConvLSTM.
pub type Seq2Seq<T> = Seq2SeqModel<T, ConvLstmCell<T>>;

/// One ConvLSTM timestep.
#[derive(Debug)]
pub struct ConvLstmCell<T: FloatElem> {
    /// Maps `cat[X, H_prev]` to the four stacked gate pre-activations `i, f, g, o`.
    pub conv: Conv2d<T>,
    /// Peephole weights, each `[C, H, W]`.
    pub w_ci: Variable<T, 3>,
    pub w_cf: Variable<T, 3>,
    pub w_co: Variable<T, 3>,
    pub activation: Activation,
}

impl<T: FloatElem> ConvLstmCell<T> {
    /// `w ∘ state`, with `w` broadcast over the batch.
    fn peephole(w: &Variable<T, 3>, state: &Variable<T, 4>) -> Result<Variable<T, 4>> {
        let [c, h, width] = *w.shape();
        let w = w.reshape([1, c, h, width])?.expand(*state.shape())?;
        &w * state
    }
}

impl<T: FloatElem> RecurrentCell<T> for ConvLstmCell<T> {
    const LAYER_NAME: &'static str = "convlstm";

    fn new<R: Rng + ?Sized>(in_channels: usize, params: &Seq2SeqParams, rng: &mut R) -> Result<Self> {
        let out_channels = params.num_kernels;
        let conv = Conv2d::new(
            in_channels + out_channels,
            4 * out_channels,
            params.kernel_size,
            params.padding,
            rng,
        )?;

        let [height, width] = params.frame_size;
        let peephole_shape = [out_channels, height, width];
        let init = params.weights_initializer;
        Ok(Self {
            conv,
            w_ci: Variable::new(init.init(peephole_shape, rng)?),
            w_cf: Variable::new(init.init(peephole_shape, rng)?),
            w_co: Variable::new(init.init(peephole_shape, rng)?),
            activation: params.activation,
        })
    }

    fn hidden_channels(&self) -> usize {
        self.w_ci.shape()[0]
    }

    fn step(
        &self,
        x: &Variable<T, 4>,
        h_prev: &Variable<T, 4>,
        c_prev: &Variable<T, 4>,
    ) -> Result<CellOutput<T>> {
        let gates = self.conv.forward(&Variable::cat(&[x, h_prev], 1)?)?.chunk(4, 1)?;
        let (i_conv, f_conv, g_conv, o_conv) = (&gates[0], &gates[1], &gates[2], &gates[3]);

        let input_gate = (i_conv + &Self::peephole(&self.w_ci, c_prev)?)?.sigmoid();
        let forget_gate = (f_conv + &Self::peephole(&self.w_cf, c_prev)?)?.sigmoid();

        let kept = (&forget_gate * c_prev)?;
        let written = (&input_gate * &self.activation.apply(g_conv))?;
        let cell = (&kept + &written)?;

        let output_gate = (o_conv + &Self::peephole(&self.w_co, &cell)?)?.sigmoid();
        let hidden = (&output_gate * &self.activation.apply(&cell))?;

        Ok(CellOutput {
            hidden,
            cell,
            attention: None,
        })
    }
}

impl<T: FloatElem> Module<T> for ConvLstmCell<T> {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Parameter<T>)) {
        self.conv.visit_parameters(&join(prefix, "conv"), f);
        f(&join(prefix, "w_ci"), &mut self.w_ci);
        f(&join(prefix, "w_cf"), &mut self.w_cf);
        f(&join(prefix, "w_co"), &mut self.w_co);
    }
}
