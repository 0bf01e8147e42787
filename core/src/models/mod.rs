//! Sequence-to-sequence video prediction models.
//!
//! Both architectures share one skeleton: a stack of recurrent layers, each followed by a
//! [`LayerNorm`](crate::nn::LayerNorm) over `[channels, time, height, width]`, then a 3x3x3
//! convolution head with a sigmoid. They differ only in the cell that advances one timestep.
//!
//! - **ConvLSTM**: see [`convlstm`].
//! - **Self-Attention ConvLSTM**: see [`sa_convlstm`].
//!
//! # Example
//!
//! ```rust
//! use rand::SeedableRng;
//! use rand::rngs::StdRng;
//! use sa_convlstm::autograd::Variable;
//! use sa_convlstm::models::{Seq2Seq, Seq2SeqParams, VideoModel};
//! use sa_convlstm::tensor::Tensor;
//!
//! let params = Seq2SeqParams {
//!     frame_size: [8, 8],
//!     input_seq_length: 4,
//!     ..Seq2SeqParams::default()
//! };
//! let model = Seq2Seq::<f32>::new(params, &mut StdRng::seed_from_u64(0)).unwrap();
//!
//! // [batch, channels, time, height, width]
//! let video = Variable::new(Tensor::zeros([2, 1, 4, 8, 8]));
//! let prediction = model.forward(&video).unwrap();
//! assert_eq!(prediction.shape(), &[2, 1, 4, 8, 8]);
//! ```

use crate::autograd::Variable;
use crate::nn::{Activation, Module, Padding, Size2, WeightsInitializer};
use crate::tensor::{FloatElem, Result, Tensor, TensorError};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub mod convlstm;
pub mod recurrent;
pub mod sa_convlstm;

pub use convlstm::{ConvLstm, ConvLstmCell, Seq2Seq};
pub use recurrent::{Recurrent, Seq2SeqModel};
pub use sa_convlstm::{SaConvLstm, SaConvLstmCell, SaSeq2Seq, SelfAttention};

/// Hyperparameters shared by both sequence-to-sequence models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Seq2SeqParams {
    /// Channels of the input video.
    pub num_channels: usize,
    pub kernel_size: Size2,
    /// Hidden channels of every recurrent layer.
    pub num_kernels: usize,
    pub padding: Padding,
    pub activation: Activation,
    /// `[height, width]` of every frame.
    pub frame_size: [usize; 2],
    pub num_layers: usize,
    /// Number of input frames. Fixes the LayerNorm shape.
    pub input_seq_length: usize,
    /// Output channels, `num_channels` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_channels: Option<usize>,
    pub weights_initializer: WeightsInitializer,
    /// Return every predicted frame instead of only the last one.
    pub return_sequences: bool,
    /// Query/key channels of the self-attention blocks. Unused by plain ConvLSTM.
    pub attention_hidden_dims: usize,
}

impl Default for Seq2SeqParams {
    fn default() -> Self {
        Self {
            num_channels: 1,
            kernel_size: Size2::Square(3),
            num_kernels: 1,
            padding: Padding::Same,
            activation: Activation::Relu,
            frame_size: [64, 64],
            num_layers: 1,
            input_seq_length: 10,
            out_channels: Some(1),
            weights_initializer: WeightsInitializer::He,
            return_sequences: true,
            attention_hidden_dims: 4,
        }
    }
}

impl Seq2SeqParams {
    pub fn out_channels(&self) -> usize {
        self.out_channels.unwrap_or(self.num_channels)
    }

    /// Rejects sizes that would build an empty layer.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("num_channels", self.num_channels),
            ("num_kernels", self.num_kernels),
            ("num_layers", self.num_layers),
            ("input_seq_length", self.input_seq_length),
            ("frame height", self.frame_size[0]),
            ("frame width", self.frame_size[1]),
            ("out_channels", self.out_channels()),
            ("attention_hidden_dims", self.attention_hidden_dims),
        ];
        match sizes.iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(TensorError::Unsupported(format!("{name} must be positive"))),
            None => Ok(()),
        }
    }
}

/// Output of one recurrent timestep.
#[derive(Debug)]
pub struct CellOutput<T: FloatElem> {
    /// New hidden state `[B, C, H, W]`.
    pub hidden: Variable<T, 4>,
    /// New cell state `[B, C, H, W]`.
    pub cell: Variable<T, 4>,
    /// Attention over spatial positions `[B, H * W]`, for cells that attend.
    pub attention: Option<Tensor<T, 2>>,
}

/// One timestep of a convolutional recurrent cell.
pub trait RecurrentCell<T: FloatElem>: Module<T> {
    /// Prefix of the layer names in a stacked model (`convlstm1`, `sa_convlstm2`, ...).
    const LAYER_NAME: &'static str;

    /// Builds a cell mapping `in_channels` to `params.num_kernels` hidden channels.
    fn new<R: Rng + ?Sized>(in_channels: usize, params: &Seq2SeqParams, rng: &mut R) -> Result<Self>
    where
        Self: Sized;

    fn hidden_channels(&self) -> usize;

    /// Advances the state `(h_prev, c_prev)` by one input frame `x`.
    fn step(
        &self,
        x: &Variable<T, 4>,
        h_prev: &Variable<T, 4>,
        c_prev: &Variable<T, 4>,
    ) -> Result<CellOutput<T>>;
}

/// A trainable video-to-video model over `[B, C, T, H, W]`.
pub trait VideoModel<T: FloatElem>: Module<T> {
    fn forward(&self, x: &Variable<T, 5>) -> Result<Variable<T, 5>>;

    /// Named attention maps of the last forward pass, each `[batch, seq_len, H * W]`.
    fn attention_maps(&self) -> Vec<(String, Tensor<T, 3>)> {
        Vec::new()
    }
}
