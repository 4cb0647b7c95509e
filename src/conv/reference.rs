/// Direct sliding-window convolution on unpacked values. Slow; used to verify the backends.
use crate::conv::ConvParams;
use crate::packed::{decode_weight, Acc, PackedElement};
use crate::tensor::pack::{unpack_activations, unpack_kernel};
use crate::tensor::{ChHWBCl, Ohwi, TensorView};

/// `input`: BHWC activation codes. `weights`: OHWI signed weight values. Output: BHWC.
pub fn direct_conv(input: &[u8], weights: &[i32], p: &ConvParams) -> Vec<Acc> {
    let (h, w, c, o) = (p.input_height, p.input_width, p.in_channels, p.out_channels);
    let (kh_n, kw_n) = (p.kernel_height, p.kernel_width);
    let (oh, ow) = (p.out_height(), p.out_width());
    let (pad_h, pad_w) = (p.pad_h() as isize, p.pad_w() as isize);
    let s = p.stride as isize;
    let mut out = vec![0 as Acc; p.batch * oh * ow * o];
    for b in 0..p.batch {
        for y in 0..oh {
            for x in 0..ow {
                for oc in 0..o {
                    let mut acc: Acc = 0;
                    for kh in 0..kh_n {
                        let iy = y as isize * s + kh as isize - pad_h;
                        if iy < 0 || iy >= h as isize { continue; }
                        for kw in 0..kw_n {
                            let ix = x as isize * s + kw as isize - pad_w;
                            if ix < 0 || ix >= w as isize { continue; }
                            let a_base = ((b * h + iy as usize) * w + ix as usize) * c;
                            let w_base = ((oc * kh_n + kh) * kw_n + kw) * c;
                            for ic in 0..c {
                                acc += input[a_base + ic] as Acc * weights[w_base + ic];
                            }
                        }
                    }
                    out[((b * oh + y) * ow + x) * o + oc] = acc;
                }
            }
        }
    }
    out
}

/// Signed values for OHWI kernel codes of width `bits`.
pub fn decode_kernel(codes: &[u8], bits: u32) -> Vec<i32> { codes.iter().map(|&k| decode_weight(k, bits)).collect() }

/// [`direct_conv`] on packed buffers: unpacks both operands first.
pub fn direct_conv_packed<A: PackedElement, K: PackedElement>(
    input: &TensorView<'_, A, ChHWBCl>,
    kernel: &TensorView<'_, K, Ohwi>,
    p: &ConvParams,
) -> Vec<Acc> {
    let codes = unpack_activations(input.as_slice(), &p.input_shape());
    let weights = decode_kernel(&unpack_kernel::<K, Ohwi>(kernel.as_slice(), &p.kernel_shape()), K::BITS);
    direct_conv(&codes, &weights, p)
}
