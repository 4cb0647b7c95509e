/// Conversion between logical code arrays (as the converter emits them) and packed layout buffers.
use crate::packed::{PackError, PackedElement};
use crate::tensor::layout::{ChHWBCl, KernelLayout, KernelShape, Layout, Ohwi};

/// Logical activation extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationShape {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ActivationShape {
    pub fn dims<A: PackedElement>(&self) -> [usize; 4] {
        [self.channels.div_ceil(A::LANES), self.height, self.width, self.batch]
    }

    pub fn len(&self) -> usize { self.batch * self.height * self.width * self.channels }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Pack BHWC codes into a `ChHWBCl` buffer.
pub fn pack_activations<A: PackedElement>(codes: &[u8], shape: &ActivationShape) -> Result<Vec<A>, PackError> {
    debug_assert_eq!(codes.len(), shape.len());
    let dims = shape.dims::<A>();
    let mut out = vec![A::default(); ChHWBCl::size(&dims)];
    let mut i = 0usize;
    for b in 0..shape.batch {
        for y in 0..shape.height {
            for x in 0..shape.width {
                for c in 0..shape.channels {
                    let code = codes[i];
                    if (code as u64) > A::lane_mask() {
                        return Err(PackError::CodeOutOfRange { index: i, code, bits: A::BITS });
                    }
                    let off = ChHWBCl::offset(&dims, &[c / A::LANES, y, x, b]);
                    out[off] = out[off].with_lane(c % A::LANES, code);
                    i += 1;
                }
            }
        }
    }
    Ok(out)
}

/// Inverse of [`pack_activations`].
pub fn unpack_activations<A: PackedElement>(words: &[A], shape: &ActivationShape) -> Vec<u8> {
    let dims = shape.dims::<A>();
    let mut out = Vec::with_capacity(shape.len());
    for b in 0..shape.batch {
        for y in 0..shape.height {
            for x in 0..shape.width {
                for c in 0..shape.channels {
                    out.push(words[ChHWBCl::offset(&dims, &[c / A::LANES, y, x, b])].lane(c % A::LANES));
                }
            }
        }
    }
    out
}

/// Pack logical OHWI kernel codes into an `Ohwi` buffer.
pub fn pack_kernel_ohwi<K: PackedElement>(codes: &[u8], shape: &KernelShape) -> Result<Vec<K>, PackError> {
    pack_kernel::<K, Ohwi>(codes, shape)
}

/// Pack logical OHWI kernel codes directly into any kernel layout.
pub fn pack_kernel<K: PackedElement, L: KernelLayout>(codes: &[u8], shape: &KernelShape) -> Result<Vec<K>, PackError> {
    debug_assert_eq!(codes.len(), shape.out_channels * shape.height * shape.width * shape.in_channels);
    let dims = L::kernel_dims(shape, K::LANES);
    let mut out = vec![K::default(); L::size(&dims)];
    let mut i = 0usize;
    for o in 0..shape.out_channels {
        for kh in 0..shape.height {
            for kw in 0..shape.width {
                for c in 0..shape.in_channels {
                    let code = codes[i];
                    if (code as u64) > K::lane_mask() {
                        return Err(PackError::CodeOutOfRange { index: i, code, bits: K::BITS });
                    }
                    let (off, lane) = L::locate(&dims, K::LANES, o, kh, kw, c);
                    out[off] = out[off].with_lane(lane, code);
                    i += 1;
                }
            }
        }
    }
    Ok(out)
}

/// Read back logical OHWI codes from any kernel layout.
pub fn unpack_kernel<K: PackedElement, L: KernelLayout>(words: &[K], shape: &KernelShape) -> Vec<u8> {
    let dims = L::kernel_dims(shape, K::LANES);
    let mut out = Vec::with_capacity(shape.out_channels * shape.height * shape.width * shape.in_channels);
    for o in 0..shape.out_channels {
        for kh in 0..shape.height {
            for kw in 0..shape.width {
                for c in 0..shape.in_channels {
                    let (off, lane) = L::locate(&dims, K::LANES, o, kh, kw, c);
                    out.push(words[off].lane(lane));
                }
            }
        }
    }
    out
}
