// Quantized kn2row convolution engine
pub mod packed;
pub mod tensor;
pub mod conv;
pub mod scaling;
pub mod model;

pub use conv::{open_backend, Backend, ConvBackend, ConvError, ConvParams, Padding};
pub use packed::{Acc, Packed, PackedElement, QuantizedPacked, QuantizedPackedKernel};
pub use scaling::{QuantizerKind, ScalingFactor, ScalingFactorTable};
