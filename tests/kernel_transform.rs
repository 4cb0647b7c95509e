use pretty_assertions::assert_eq;
use qconv::conv::transform::{quantized_hwoi_to_ohwi, quantized_ohwi_to_hwoi, quantized_ohwi_to_tca, relayout_kernel};
use qconv::conv::ConvParams;
use qconv::packed::{Packed, PackedElement, QuantizedPackedKernel};
use qconv::tensor::pack::{pack_kernel, pack_kernel_ohwi, unpack_kernel};
use qconv::tensor::{Hwoi, KernelLayout, Layout, OhIhHWOlIl, Ohwi, TensorView, TensorViewMut};

type K = QuantizedPackedKernel;

fn layer() -> ConvParams {
    // 17 outputs spill into a second TCA block, 40 inputs into a second word
    ConvParams::new(8, 8, 40, 17, 3)
}

fn codes(p: &ConvParams) -> Vec<u8> {
    let s = p.kernel_shape();
    (0..s.out_channels * s.height * s.width * s.in_channels).map(|i| ((i * 31 + i / 7) % 2) as u8).collect()
}

#[test]
fn ohwi_to_hwoi_and_back() {
    let p = layer();
    let shape = p.kernel_shape();
    let src = pack_kernel_ohwi::<K>(&codes(&p), &shape).unwrap();
    let src_view = TensorView::<K, Ohwi>::new(&src, Ohwi::kernel_dims(&shape, K::LANES));

    let hdims = Hwoi::kernel_dims(&shape, K::LANES);
    let mut hwoi = vec![K::default(); Hwoi::size(&hdims)];
    quantized_ohwi_to_hwoi(&src_view, &mut TensorViewMut::<K, Hwoi>::new(&mut hwoi, hdims), &p);
    assert_eq!(unpack_kernel::<K, Hwoi>(&hwoi, &shape), codes(&p));

    // stale words in the destination must not survive
    let mut back = vec![K::new(u32::MAX); src.len()];
    quantized_hwoi_to_ohwi(&TensorView::<K, Hwoi>::new(&hwoi, hdims), &mut TensorViewMut::<K, Ohwi>::new(&mut back, src_view.dims()), &p);
    assert_eq!(back, src);
}

#[test]
fn hwoi_places_each_tap_contiguously() {
    let p = layer();
    let shape = p.kernel_shape();
    let mut c = vec![0u8; codes(&p).len()];
    // single set weight at (o=3, kh=2, kw=1, c=35)
    c[((3 * 3 + 2) * 3 + 1) * 40 + 35] = 1;
    let src = pack_kernel_ohwi::<K>(&c, &shape).unwrap();
    let hdims = Hwoi::kernel_dims(&shape, K::LANES);
    assert_eq!(hdims, [3, 3, 17, 2]);
    let mut hwoi = vec![K::default(); Hwoi::size(&hdims)];
    quantized_ohwi_to_hwoi(
        &TensorView::<K, Ohwi>::new(&src, Ohwi::kernel_dims(&shape, K::LANES)),
        &mut TensorViewMut::<K, Hwoi>::new(&mut hwoi, hdims),
        &p,
    );
    let at = Hwoi::offset(&hdims, &[2, 1, 3, 1]);
    assert_eq!(hwoi[at].word(), 1 << 3);
    assert_eq!(hwoi.iter().filter(|w| w.word() != 0).count(), 1);
}

#[test]
fn tca_layout_blocks_and_zero_fills() {
    let p = layer();
    let shape = p.kernel_shape();
    let src = pack_kernel_ohwi::<K>(&codes(&p), &shape).unwrap();
    let tdims = OhIhHWOlIl::kernel_dims(&shape, K::LANES);
    assert_eq!(tdims, [2, 1, 3, 3, 16, 2]);
    let mut tca = vec![K::new(0xdead_beef); OhIhHWOlIl::size(&tdims)];
    quantized_ohwi_to_tca(
        &TensorView::<K, Ohwi>::new(&src, Ohwi::kernel_dims(&shape, K::LANES)),
        &mut TensorViewMut::<K, OhIhHWOlIl>::new(&mut tca, tdims),
        &p,
    );
    assert_eq!(unpack_kernel::<K, OhIhHWOlIl>(&tca, &shape), codes(&p));
    // output lanes 17..32 of the second block hold no weights
    for kh in 0..3 {
        for kw in 0..3 {
            for ol in 1..16 {
                for il in 0..2 {
                    assert_eq!(tca[OhIhHWOlIl::offset(&tdims, &[1, 0, kh, kw, ol, il])].word(), 0);
                }
            }
        }
    }
    // channels 40..64 of the second input word are zero too
    let w = tca[OhIhHWOlIl::offset(&tdims, &[0, 0, 0, 0, 0, 1])].word();
    assert_eq!(w >> 8, 0);
}

#[test]
fn relayout_can_change_packing_ratio() {
    let p = layer();
    let shape = p.kernel_shape();
    let src = pack_kernel_ohwi::<K>(&codes(&p), &shape).unwrap();
    type Narrow = Packed<u8, 1>;
    let dims = Hwoi::kernel_dims(&shape, Narrow::LANES);
    assert_eq!(dims[3], 5);
    let mut dst = vec![Narrow::default(); Hwoi::size(&dims)];
    relayout_kernel(
        &TensorView::<K, Ohwi>::new(&src, Ohwi::kernel_dims(&shape, K::LANES)),
        &mut TensorViewMut::<Narrow, Hwoi>::new(&mut dst, dims),
        &shape,
    );
    assert_eq!(dst, pack_kernel::<Narrow, Hwoi>(&codes(&p), &shape).unwrap());
}
