/// Quantized 2D convolution: parameters, the backend contract and the build-selected backend.
pub mod fpga;
pub mod kn2row;
pub mod reference;
pub mod transform;

use crate::packed::{max_abs_weight, Acc, PackedElement, QuantizedPacked, QuantizedPackedKernel};
use crate::scaling::QuantizerKind;
use crate::tensor::pack::ActivationShape;
use crate::tensor::{Bhwc, ChHWBCl, KernelLayout, KernelShape, Layout, Ohwi, ShapeError, TensorView, TensorViewMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fpga::{AccelError, Accelerator, SimulatedTca, TcaConv};
pub use kn2row::Kn2Row;

#[derive(Debug, Error)]
pub enum ConvError {
    #[error("invalid convolution parameters: {0}")]
    InvalidParams(String),
    #[error("{what} shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { what: &'static str, expected: Vec<usize>, actual: Vec<usize> },
    #[error(transparent)]
    Buffer(#[from] ShapeError),
    #[error("accelerator failure: {0}")]
    Accelerator(#[from] AccelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
    /// Symmetric `(k - 1) / 2` padding; odd kernels only.
    Same,
    Explicit(usize),
}

fn default_one() -> usize { 1 }

/// Convolution parameters as emitted by the converter. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvParams {
    #[serde(default = "default_one")]
    pub batch: usize,
    pub input_height: usize,
    pub input_width: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    #[serde(default = "default_one")]
    pub stride: usize,
    #[serde(default)]
    pub padding: Padding,
    pub quantizer: QuantizerKind,
}

impl ConvParams {
    /// Square-kernel, single-batch parameters with the per-tensor binary quantizer.
    pub fn new(height: usize, width: usize, in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self {
            batch: 1,
            input_height: height,
            input_width: width,
            in_channels,
            out_channels,
            kernel_height: kernel,
            kernel_width: kernel,
            stride: 1,
            padding: Padding::Valid,
            quantizer: QuantizerKind::BinaryMeanScaling,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self { self.stride = stride; self }
    pub fn with_padding(mut self, padding: Padding) -> Self { self.padding = padding; self }
    pub fn with_batch(mut self, batch: usize) -> Self { self.batch = batch; self }
    pub fn with_quantizer(mut self, q: QuantizerKind) -> Self { self.quantizer = q; self }

    pub fn pad_h(&self) -> usize { pad_for(self.padding, self.kernel_height) }
    pub fn pad_w(&self) -> usize { pad_for(self.padding, self.kernel_width) }

    pub fn out_height(&self) -> usize { out_extent(self.input_height, self.pad_h(), self.kernel_height, self.stride) }
    pub fn out_width(&self) -> usize { out_extent(self.input_width, self.pad_w(), self.kernel_width, self.stride) }

    pub fn input_shape(&self) -> ActivationShape {
        ActivationShape { batch: self.batch, height: self.input_height, width: self.input_width, channels: self.in_channels }
    }

    pub fn output_shape(&self) -> ActivationShape {
        ActivationShape { batch: self.batch, height: self.out_height(), width: self.out_width(), channels: self.out_channels }
    }

    pub fn kernel_shape(&self) -> KernelShape {
        KernelShape {
            out_channels: self.out_channels,
            height: self.kernel_height,
            width: self.kernel_width,
            in_channels: self.in_channels,
        }
    }

    pub fn input_dims<A: PackedElement>(&self) -> [usize; 4] { self.input_shape().dims::<A>() }

    pub fn output_dims(&self) -> [usize; 4] { [self.batch, self.out_height(), self.out_width(), self.out_channels] }

    pub fn output_len(&self) -> usize { Bhwc::size(&self.output_dims()) }

    pub fn validate(&self) -> Result<(), ConvError> {
        let dims = [
            ("batch", self.batch),
            ("input_height", self.input_height),
            ("input_width", self.input_width),
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("kernel_height", self.kernel_height),
            ("kernel_width", self.kernel_width),
            ("stride", self.stride),
        ];
        for (name, v) in dims {
            if v == 0 { return Err(ConvError::InvalidParams(format!("{} must be > 0", name))); }
        }
        if self.padding == Padding::Same && (self.kernel_height % 2 == 0 || self.kernel_width % 2 == 0) {
            return Err(ConvError::InvalidParams(format!(
                "same padding needs an odd kernel, got {}x{}", self.kernel_height, self.kernel_width
            )));
        }
        if self.input_height + 2 * self.pad_h() < self.kernel_height || self.input_width + 2 * self.pad_w() < self.kernel_width {
            return Err(ConvError::InvalidParams(format!(
                "kernel {}x{} larger than padded input {}x{}",
                self.kernel_height, self.kernel_width,
                self.input_height + 2 * self.pad_h(), self.input_width + 2 * self.pad_w()
            )));
        }
        Ok(())
    }

    /// Worst-case |accumulator| for these parameters with activation/kernel element types `A`/`K`.
    pub fn accumulator_bound<A: PackedElement, K: PackedElement>(&self) -> u64 {
        let max_act = A::lane_mask();
        let taps = (self.in_channels * self.kernel_height * self.kernel_width) as u64;
        taps.saturating_mul(max_act).saturating_mul(max_abs_weight(K::BITS))
    }

    /// Reject parameters whose reduction could overflow [`Acc`].
    pub fn check_accumulator<A: PackedElement, K: PackedElement>(&self) -> Result<(), ConvError> {
        let bound = self.accumulator_bound::<A, K>();
        if bound > Acc::MAX as u64 {
            return Err(ConvError::InvalidParams(format!(
                "worst-case accumulator {} overflows {}-bit accumulator", bound, Acc::BITS
            )));
        }
        Ok(())
    }
}

fn pad_for(padding: Padding, kernel: usize) -> usize {
    match padding {
        Padding::Valid => 0,
        Padding::Same => kernel.saturating_sub(1) / 2,
        Padding::Explicit(p) => p,
    }
}

#[inline]
fn out_extent(input: usize, pad: usize, kernel: usize, stride: usize) -> usize {
    let padded = input + 2 * pad;
    if padded < kernel || stride == 0 { 0 } else { (padded - kernel) / stride + 1 }
}

/// One quantized convolution implementation. Exactly one is linked as [`Backend`].
pub trait ConvBackend: Send + Sync {
    type Input: PackedElement;
    type Kernel: PackedElement;
    type KernelLayout: KernelLayout;
    const NAME: &'static str;

    fn kernel_dims(&self, p: &ConvParams) -> <Self::KernelLayout as Layout>::Dims {
        Self::KernelLayout::kernel_dims(&p.kernel_shape(), Self::Kernel::LANES)
    }

    /// Reformat a converter-native kernel into this backend's layout. Load time only.
    fn prepare_kernel(&self, ohwi: &TensorView<'_, Self::Kernel, Ohwi>, p: &ConvParams) -> Vec<Self::Kernel> {
        let dims = self.kernel_dims(p);
        let mut out = vec![Self::Kernel::default(); Self::KernelLayout::size(&dims)];
        let mut dst = TensorViewMut::<Self::Kernel, Self::KernelLayout>::new(&mut out, dims);
        transform::relayout_kernel(ohwi, &mut dst, &p.kernel_shape());
        out
    }

    /// Unscaled integer convolution of `input` with `kernel` into the caller-allocated `output`.
    fn convolve(
        &self,
        input: &TensorView<'_, Self::Input, ChHWBCl>,
        kernel: &TensorView<'_, Self::Kernel, Self::KernelLayout>,
        p: &ConvParams,
        output: &mut TensorViewMut<'_, Acc, Bhwc>,
    ) -> Result<(), ConvError>;
}

/// Full precondition check: parameters, view extents and accumulator width.
pub fn check_shapes<A: PackedElement, K: PackedElement, L: KernelLayout>(
    input: &TensorView<'_, A, ChHWBCl>,
    kernel: &TensorView<'_, K, L>,
    p: &ConvParams,
    output_dims: &[usize; 4],
) -> Result<(), ConvError> {
    p.validate()?;
    p.check_accumulator::<A, K>()?;
    expect_dims("input", &p.input_dims::<A>(), input.dims().as_ref())?;
    expect_dims("kernel", L::kernel_dims(&p.kernel_shape(), K::LANES).as_ref(), kernel.dims().as_ref())?;
    expect_dims("output", &p.output_dims(), output_dims)?;
    expect_dims("input buffer", &[ChHWBCl::size(&input.dims())], &[input.len()])?;
    expect_dims("kernel buffer", &[L::size(&kernel.dims())], &[kernel.len()])?;
    Ok(())
}

fn expect_dims(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<(), ConvError> {
    if expected != actual {
        return Err(ConvError::ShapeMismatch { what, expected: expected.to_vec(), actual: actual.to_vec() });
    }
    Ok(())
}

#[cfg(not(feature = "fpga"))]
pub type Backend = Kn2Row<QuantizedPacked, QuantizedPackedKernel>;

#[cfg(feature = "fpga")]
pub type Backend = TcaConv<QuantizedPacked, QuantizedPackedKernel, Box<dyn Accelerator<QuantizedPacked, QuantizedPackedKernel>>>;

/// Open the backend this build links.
#[cfg(not(feature = "fpga"))]
pub fn open_backend(threads: usize) -> Backend { Kn2Row::with_threads(threads) }

#[cfg(feature = "fpga")]
pub fn open_backend(_threads: usize) -> Backend {
    TcaConv::new(fpga::open_device())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_json_fills_defaults() {
        let json = r#"{"input_height": 8, "input_width": 6, "in_channels": 32, "out_channels": 4,
            "kernel_height": 3, "kernel_width": 3, "quantizer": "BinaryMeanScalingQuantizer"}"#;
        let p: ConvParams = serde_json::from_str(json).unwrap();
        assert_eq!(p, ConvParams::new(8, 6, 32, 4, 3));
        let p: ConvParams = serde_json::from_str(&json.replace("}", r#", "stride": 2, "padding": "same"}"#)).unwrap();
        assert_eq!((p.batch, p.stride, p.padding), (1, 2, Padding::Same));
    }
}
