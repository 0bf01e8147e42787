use crate::autograd::Variable;
use crate::nn::init;
use crate::nn::module::{Module, Parameter, join};
use crate::tensor::{FloatElem, Result, Tensor, TensorElem, TensorError};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A square (`3`) or rectangular (`[3, 5]`) 2D size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Size2 {
    Square(usize),
    Rect([usize; 2]),
}

impl Size2 {
    pub fn dims(self) -> [usize; 2] {
        match self {
            Size2::Square(k) => [k, k],
            Size2::Rect(k) => k,
        }
    }
}

impl From<usize> for Size2 {
    fn from(k: usize) -> Self {
        Size2::Square(k)
    }
}

/// Spatial zero-padding of a 2D convolution.
///
/// Deserializes from `"same"`, `"valid"`, an integer or an `[h, w]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "PaddingRepr", into = "PaddingRepr")]
pub enum Padding {
    /// Output keeps the input's spatial size. Needs odd kernels.
    #[default]
    Same,
    Valid,
    Explicit([usize; 2]),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PaddingRepr {
    Named(String),
    Size(Size2),
}

impl TryFrom<PaddingRepr> for Padding {
    type Error = String;

    fn try_from(repr: PaddingRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            PaddingRepr::Named(name) => match name.as_str() {
                "same" => Ok(Padding::Same),
                "valid" => Ok(Padding::Valid),
                other => Err(format!("unknown padding '{other}'")),
            },
            PaddingRepr::Size(size) => Ok(Padding::Explicit(size.dims())),
        }
    }
}

impl From<Padding> for PaddingRepr {
    fn from(padding: Padding) -> Self {
        match padding {
            Padding::Same => PaddingRepr::Named("same".into()),
            Padding::Valid => PaddingRepr::Named("valid".into()),
            Padding::Explicit(p) => PaddingRepr::Size(Size2::Rect(p)),
        }
    }
}

impl Padding {
    /// Per-side padding for a `kernel` with unit dilation.
    pub fn resolve(self, kernel: [usize; 2]) -> Result<[usize; 2]> {
        match self {
            Padding::Same => same_padding(kernel),
            Padding::Valid => Ok([0, 0]),
            Padding::Explicit(p) => Ok(p),
        }
    }
}

/// Padding that preserves every spatial extent under stride 1.
///
/// # Errors
///
/// Returns `TensorError::Unsupported` for even kernel sizes, which cannot pad symmetrically.
pub fn same_padding<const N: usize>(kernel: [usize; N]) -> Result<[usize; N]> {
    let mut padding = [0; N];
    for (p, &k) in padding.iter_mut().zip(&kernel) {
        if k % 2 == 0 {
            return Err(TensorError::Unsupported(format!(
                "'same' padding needs odd kernel sizes, got {:?}",
                kernel
            )));
        }
        *p = k / 2;
    }
    Ok(padding)
}

/// 2D Convolution Layer.
///
/// Applies a 2D convolution over an input signal composed of several input planes.
#[derive(Debug)]
pub struct Conv2d<T: TensorElem> {
    /// `[out_channels, in_channels, kH, kW]`.
    pub weight: Variable<T, 4>,
    pub bias: Option<Variable<T, 1>>,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
}

impl<T: FloatElem> Conv2d<T> {
    /// Creates a stride-1 Conv2d layer with bias, uniformly initialized from the fan-in.
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of channels in the input image.
    /// * `out_channels` - Number of channels produced by the convolution.
    /// * `kernel_size` - Size of the convolving kernel.
    /// * `padding` - Zero-padding added to both sides of the input.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: Size2,
        padding: Padding,
        rng: &mut R,
    ) -> Result<Self> {
        let [kh, kw] = kernel_size.dims();
        let fan_in = in_channels * kh * kw;
        let weight = init::conv_uniform([out_channels, in_channels, kh, kw], fan_in, rng)?;
        let bias = init::conv_uniform([out_channels], fan_in, rng)?;

        Ok(Self {
            weight: Variable::new(weight),
            bias: Some(Variable::new(bias)),
            stride: [1, 1],
            padding: padding.resolve([kh, kw])?,
            dilation: [1, 1],
        })
    }

    /// Wraps existing weights.
    pub fn from_weights(weight: Tensor<T, 4>, bias: Option<Tensor<T, 1>>, padding: [usize; 2]) -> Self {
        Self {
            weight: Variable::new(weight),
            bias: bias.map(Variable::new),
            stride: [1, 1],
            padding,
            dilation: [1, 1],
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Performs the forward pass on `[B, C, H, W]`.
    pub fn forward(&self, input: &Variable<T, 4>) -> Result<Variable<T, 4>> {
        let out = input.conv2d(&self.weight, self.stride, self.padding, self.dilation)?;
        match &self.bias {
            Some(bias) => {
                let shape = *out.shape();
                let bias = bias.reshape([1, shape[1], 1, 1])?.expand(shape)?;
                &out + &bias
            }
            None => Ok(out),
        }
    }
}

impl<T: TensorElem + 'static> Module<T> for Conv2d<T> {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Parameter<T>)) {
        f(&join(prefix, "weight"), &mut self.weight);
        if let Some(bias) = &mut self.bias {
            f(&join(prefix, "bias"), bias);
        }
    }
}

/// 3D Convolution Layer over `[B, C, D, H, W]`.
#[derive(Debug)]
pub struct Conv3d<T: TensorElem> {
    /// `[out_channels, in_channels, kD, kH, kW]`.
    pub weight: Variable<T, 5>,
    pub bias: Option<Variable<T, 1>>,
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub dilation: [usize; 3],
}

impl<T: FloatElem> Conv3d<T> {
    /// Creates a stride-1 Conv3d layer with bias.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 3],
        padding: [usize; 3],
        rng: &mut R,
    ) -> Result<Self> {
        let [kd, kh, kw] = kernel_size;
        let fan_in = in_channels * kd * kh * kw;
        let weight = init::conv_uniform([out_channels, in_channels, kd, kh, kw], fan_in, rng)?;
        let bias = init::conv_uniform([out_channels], fan_in, rng)?;

        Ok(Self {
            weight: Variable::new(weight),
            bias: Some(Variable::new(bias)),
            stride: [1, 1, 1],
            padding,
            dilation: [1, 1, 1],
        })
    }

    /// Conv3d whose output keeps the input's depth, height and width.
    pub fn same<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 3],
        rng: &mut R,
    ) -> Result<Self> {
        Self::new(in_channels, out_channels, kernel_size, same_padding(kernel_size)?, rng)
    }

    pub fn forward(&self, input: &Variable<T, 5>) -> Result<Variable<T, 5>> {
        let out = input.conv3d(&self.weight, self.stride, self.padding, self.dilation)?;
        match &self.bias {
            Some(bias) => {
                let shape = *out.shape();
                let bias = bias.reshape([1, shape[1], 1, 1, 1])?.expand(shape)?;
                &out + &bias
            }
            None => Ok(out),
        }
    }
}

impl<T: TensorElem + 'static> Module<T> for Conv3d<T> {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Parameter<T>)) {
        f(&join(prefix, "weight"), &mut self.weight);
        if let Some(bias) = &mut self.bias {
            f(&join(prefix, "bias"), bias);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_conv2d_same_keeps_size() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::<f32>::new(2, 8, Size2::Square(3), Padding::Same, &mut rng).unwrap();
        assert_eq!(conv.padding, [1, 1]);

        let x = Variable::new(Tensor::ones([1, 2, 5, 6]));
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.shape(), &[1, 8, 5, 6]);
    }

    #[test]
    fn test_conv2d_valid_shrinks() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::<f32>::new(1, 1, Size2::Rect([3, 1]), Padding::Valid, &mut rng).unwrap();
        let y = conv.forward(&Variable::new(Tensor::ones([2, 1, 5, 5]))).unwrap();
        assert_eq!(y.shape(), &[2, 1, 3, 5]);
    }

    #[test]
    fn test_same_padding_rejects_even_kernel() {
        assert!(same_padding([3, 4]).is_err());
        assert_eq!(same_padding([3, 5, 1]).unwrap(), [1, 2, 0]);
    }

    #[test]
    fn test_conv2d_bias_is_broadcast_and_trained() {
        // 1x1 identity kernel plus bias
        let conv = Conv2d::from_weights(
            Tensor::new(vec![1.0f32], [1, 1, 1, 1]).unwrap(),
            Some(Tensor::new(vec![0.5], [1]).unwrap()),
            [0, 0],
        );
        let x = Variable::new(Tensor::new(vec![1.0, 2.0, 3.0, 4.0], [1, 1, 2, 2]).unwrap());
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.data.data(), &[1.5, 2.5, 3.5, 4.5]);

        y.sum().backward().unwrap();
        let bias = conv.bias.as_ref().unwrap();
        assert_eq!(bias.grad_tensor().unwrap().data(), &[4.0]);
        assert_eq!(conv.weight.grad_tensor().unwrap().data(), &[10.0]);
    }

    #[test]
    fn test_conv3d_same() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conv = Conv3d::<f32>::same(4, 1, [3, 3, 3], &mut rng).unwrap();
        let y = conv
            .forward(&Variable::new(Tensor::ones([2, 4, 3, 5, 5])))
            .unwrap();
        assert_eq!(y.shape(), &[2, 1, 3, 5, 5]);
        assert_eq!(conv.num_parameters(), 4 * 27 + 1);
        assert_eq!(conv.parameter_names(), vec!["weight", "bias"]);
    }

    #[test]
    fn test_padding_serde() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            padding: Padding,
            kernel: Size2,
        }
        let w: Wrapper = toml::from_str("padding = \"same\"\nkernel = 3").unwrap();
        assert_eq!(w.padding, Padding::Same);
        assert_eq!(w.kernel.dims(), [3, 3]);

        let w: Wrapper = toml::from_str("padding = [1, 2]\nkernel = [3, 5]").unwrap();
        assert_eq!(w.padding, Padding::Explicit([1, 2]));
        assert_eq!(w.kernel, Size2::Rect([3, 5]));

        let w: Wrapper = toml::from_str("padding = 2\nkernel = 1").unwrap();
        assert_eq!(w.padding, Padding::Explicit([2, 2]));

        assert!(toml::from_str::<Wrapper>("padding = \"full\"\nkernel = 3").is_err());
    }
}
