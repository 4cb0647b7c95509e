use std::fmt;

/// Dimension ordering policy for a [`super::TensorView`].
///
/// Every layout is row-major over its own dimension order; what differs is which
/// logical dimension each position stands for, so two views over the same buffer
/// with different layouts describe different physical orders.
pub trait Layout: Copy + Default + fmt::Debug + Send + Sync + 'static {
    type Dims: Copy + fmt::Debug + PartialEq + Send + Sync + AsRef<[usize]>;
    const NAME: &'static str;

    fn size(dims: &Self::Dims) -> usize { dims.as_ref().iter().product() }

    fn contains(dims: &Self::Dims, idx: &Self::Dims) -> bool {
        dims.as_ref().iter().zip(idx.as_ref()).all(|(d, i)| i < d)
    }

    #[inline]
    fn offset(dims: &Self::Dims, idx: &Self::Dims) -> usize { row_major(dims.as_ref(), idx.as_ref()) }
}

#[inline]
fn row_major(dims: &[usize], idx: &[usize]) -> usize {
    let mut off = 0usize;
    for (d, i) in dims.iter().zip(idx) { off = off * d + i; }
    off
}

/// Logical kernel extents, independent of storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelShape {
    pub out_channels: usize,
    pub height: usize,
    pub width: usize,
    pub in_channels: usize,
}

/// Layouts that can hold a convolution kernel.
pub trait KernelLayout: Layout {
    /// Extents in words for a kernel of `shape` packed `lanes` input channels per word.
    fn kernel_dims(shape: &KernelShape, lanes: usize) -> Self::Dims;

    /// Word offset and lane of logical weight `(o, kh, kw, c)`.
    fn locate(dims: &Self::Dims, lanes: usize, o: usize, kh: usize, kw: usize, c: usize) -> (usize, usize);
}

/// Activations: channel words outer, then height, width, batch; channel lanes inside the word.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChHWBCl;

impl Layout for ChHWBCl {
    type Dims = [usize; 4];
    const NAME: &'static str = "ChHWBCl";
}

/// Converter-native kernel order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ohwi;

impl Layout for Ohwi {
    type Dims = [usize; 4];
    const NAME: &'static str = "OHWI";
}

impl KernelLayout for Ohwi {
    fn kernel_dims(s: &KernelShape, lanes: usize) -> [usize; 4] {
        [s.out_channels, s.height, s.width, s.in_channels.div_ceil(lanes)]
    }

    #[inline]
    fn locate(dims: &[usize; 4], lanes: usize, o: usize, kh: usize, kw: usize, c: usize) -> (usize, usize) {
        (Self::offset(dims, &[o, kh, kw, c / lanes]), c % lanes)
    }
}

/// Kernel order consumed by kn2row: one contiguous `out x in` matrix per tap.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hwoi;

impl Layout for Hwoi {
    type Dims = [usize; 4];
    const NAME: &'static str = "HWOI";
}

impl KernelLayout for Hwoi {
    fn kernel_dims(s: &KernelShape, lanes: usize) -> [usize; 4] {
        [s.height, s.width, s.out_channels, s.in_channels.div_ceil(lanes)]
    }

    #[inline]
    fn locate(dims: &[usize; 4], lanes: usize, o: usize, kh: usize, kw: usize, c: usize) -> (usize, usize) {
        (Self::offset(dims, &[kh, kw, o, c / lanes]), c % lanes)
    }
}

/// Output channels per accelerator PE block.
pub const TCA_OUT_BLOCK: usize = 16;
/// Input channel words streamed per accelerator block.
pub const TCA_IN_BLOCK_WORDS: usize = 2;

/// Accelerator kernel order: `[out_blocks, in_blocks, kh, kw, out_lane, in_word]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OhIhHWOlIl;

impl Layout for OhIhHWOlIl {
    type Dims = [usize; 6];
    const NAME: &'static str = "OhIhHWOlIl";
}

impl KernelLayout for OhIhHWOlIl {
    fn kernel_dims(s: &KernelShape, lanes: usize) -> [usize; 6] {
        let in_words = s.in_channels.div_ceil(lanes);
        [
            s.out_channels.div_ceil(TCA_OUT_BLOCK),
            in_words.div_ceil(TCA_IN_BLOCK_WORDS),
            s.height,
            s.width,
            TCA_OUT_BLOCK,
            TCA_IN_BLOCK_WORDS,
        ]
    }

    #[inline]
    fn locate(dims: &[usize; 6], lanes: usize, o: usize, kh: usize, kw: usize, c: usize) -> (usize, usize) {
        let (ol, il) = (dims[4], dims[5]);
        let word = c / lanes;
        (Self::offset(dims, &[o / ol, word / il, kh, kw, o % ol, word % il]), c % lanes)
    }
}

/// Accumulator output: `[batch, out_h, out_w, out_channels]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bhwc;

impl Layout for Bhwc {
    type Dims = [usize; 4];
    const NAME: &'static str = "BHWC";
}
