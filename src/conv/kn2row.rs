/// Kn2row convolution: a KxK convolution as K*K shifted 1x1 channel reductions.
///
/// For each kernel tap `(kh, kw)` the pointwise product of the whole input map
/// with that tap's `out x in` matrix is computed once, then added into every
/// output position whose receptive field uses that tap. Stride and zero padding
/// only shape the range of output positions a tap lands on; taps whose shifted
/// source falls outside the input are never added.
use crate::conv::{check_shapes, ConvBackend, ConvError, ConvParams};
use crate::packed::{dot, Acc, PackedElement};
use crate::tensor::{Bhwc, ChHWBCl, Hwoi, Layout, TensorView, TensorViewMut};
use log::debug;
use rayon::prelude::*;
use std::marker::PhantomData;
use std::ops::Range;

pub struct Kn2Row<A, K> {
    threads: usize,
    _elems: PhantomData<fn() -> (A, K)>,
}

impl<A, K> Default for Kn2Row<A, K> {
    fn default() -> Self { Self { threads: 1, _elems: PhantomData } }
}

impl<A: PackedElement, K: PackedElement> Kn2Row<A, K> {
    pub fn new() -> Self { Self::default() }

    /// Data-parallel over pixels and output rows when `threads > 1`; runs on the current rayon pool.
    pub fn with_threads(threads: usize) -> Self { Self { threads: threads.max(1), _elems: PhantomData } }

    pub fn threads(&self) -> usize { self.threads }

    /// `out[pixel][o] = sum_c act[pixel][c] * w[o][c]` for every input pixel.
    fn pointwise(&self, pixels: &[A], taps: &[K], channels: usize, out_channels: usize, out: &mut [Acc]) {
        let cw = channels.div_ceil(A::LANES);
        let kw = channels.div_ceil(K::LANES);
        let body = |(i, dst): (usize, &mut [Acc])| {
            let act = &pixels[i * cw..(i + 1) * cw];
            for (o, d) in dst.iter_mut().enumerate() {
                *d = dot(act, &taps[o * kw..(o + 1) * kw], channels);
            }
        };
        if self.threads > 1 {
            out.par_chunks_mut(out_channels).enumerate().for_each(&body);
        } else {
            out.chunks_mut(out_channels).enumerate().for_each(&body);
        }
    }

    /// Add one tap's pointwise map into the output rows/columns it reaches.
    fn accumulate(&self, partial: &[Acc], out: &mut [Acc], p: &ConvParams, tap: (usize, usize), ys: Range<usize>, xs: Range<usize>) {
        let o = p.out_channels;
        let row_len = p.out_width() * o;
        let (kh, kw) = tap;
        let (pad_h, pad_w, s, in_w) = (p.pad_h(), p.pad_w(), p.stride, p.input_width);
        let y0 = ys.start;
        let body = |(i, row): (usize, &mut [Acc])| {
            let iy = (y0 + i) * s + kh - pad_h;
            for x in xs.clone() {
                let ix = x * s + kw - pad_w;
                let src = &partial[(iy * in_w + ix) * o..][..o];
                for (d, v) in row[x * o..(x + 1) * o].iter_mut().zip(src) { *d += *v; }
            }
        };
        let rows = &mut out[ys.start * row_len..ys.end * row_len];
        if self.threads > 1 {
            rows.par_chunks_mut(row_len).enumerate().for_each(&body);
        } else {
            rows.chunks_mut(row_len).enumerate().for_each(&body);
        }
    }
}

impl<A: PackedElement, K: PackedElement> ConvBackend for Kn2Row<A, K> {
    type Input = A;
    type Kernel = K;
    type KernelLayout = Hwoi;
    const NAME: &'static str = "kn2row";

    fn convolve(
        &self,
        input: &TensorView<'_, A, ChHWBCl>,
        kernel: &TensorView<'_, K, Hwoi>,
        p: &ConvParams,
        output: &mut TensorViewMut<'_, Acc, Bhwc>,
    ) -> Result<(), ConvError> {
        if cfg!(debug_assertions) {
            check_shapes(input, kernel, p, &output.dims())?;
        }
        let (in_h, in_w, c, o) = (p.input_height, p.input_width, p.in_channels, p.out_channels);
        let (pad_h, pad_w, s) = (p.pad_h(), p.pad_w(), p.stride);
        let (out_h, out_w) = (p.out_height(), p.out_width());
        let tap_words = o * c.div_ceil(K::LANES);
        let kdims = kernel.dims();
        let weights = kernel.as_slice();

        let pixels = gather_pixels(input);
        let px_words = in_h * in_w * c.div_ceil(A::LANES);
        let plane_out = out_h * out_w * o;
        let out = output.as_mut_slice();
        out.fill(0);

        if p.kernel_height == 1 && p.kernel_width == 1 && pad_h == 0 && pad_w == 0 && s == 1 {
            // Single pointwise pass straight into the output.
            for b in 0..p.batch {
                let pix = &pixels[b * px_words..(b + 1) * px_words];
                self.pointwise(pix, &weights[..tap_words], c, o, &mut out[b * plane_out..(b + 1) * plane_out]);
            }
            debug!("kn2row 1x1 {}x{}x{} -> {} channels, batch {}", in_h, in_w, c, o, p.batch);
            return Ok(());
        }

        let mut partial = vec![0 as Acc; in_h * in_w * o];
        let mut skipped = 0usize;
        for b in 0..p.batch {
            let pix = &pixels[b * px_words..(b + 1) * px_words];
            let out_b = &mut out[b * plane_out..(b + 1) * plane_out];
            for kh in 0..p.kernel_height {
                let ys = tap_range(kh, pad_h, s, in_h, out_h);
                for kw in 0..p.kernel_width {
                    let xs = tap_range(kw, pad_w, s, in_w, out_w);
                    if ys.is_empty() || xs.is_empty() {
                        skipped += 1;
                        continue;
                    }
                    let start = Hwoi::offset(&kdims, &[kh, kw, 0, 0]);
                    self.pointwise(pix, &weights[start..start + tap_words], c, o, &mut partial);
                    self.accumulate(&partial, out_b, p, (kh, kw), ys.clone(), xs);
                }
            }
        }
        debug!(
            "kn2row {}x{}x{} -> {}x{}x{} k={}x{} s={} pad={}x{} batch={} skipped_taps={}",
            in_h, in_w, c, out_h, out_w, o, p.kernel_height, p.kernel_width, s, pad_h, pad_w, p.batch, skipped
        );
        Ok(())
    }
}

/// Reorder `ChHWBCl` words so each pixel's channel words are contiguous: `[b][y][x][cw]`.
fn gather_pixels<A: PackedElement>(input: &TensorView<'_, A, ChHWBCl>) -> Vec<A> {
    let dims = input.dims();
    let [cw, h, w, batch] = dims;
    let src = input.as_slice();
    let mut rows = vec![A::default(); ChHWBCl::size(&dims)];
    let mut i = 0usize;
    for ch in 0..cw {
        for y in 0..h {
            for x in 0..w {
                for b in 0..batch {
                    rows[((b * h + y) * w + x) * cw + ch] = src[i];
                    i += 1;
                }
            }
        }
    }
    rows
}

/// Output positions along one axis that kernel tap `k` contributes to.
///
/// Position `y` reads input `y * stride + k - pad`, which must lie in `[0, input)`.
fn tap_range(k: usize, pad: usize, stride: usize, input: usize, output: usize) -> Range<usize> {
    if input + pad <= k { return 0..0; }
    let lo = if pad > k { (pad - k).div_ceil(stride) } else { 0 };
    let hi = ((input - 1 + pad - k) / stride + 1).min(output);
    lo.min(hi)..hi
}
