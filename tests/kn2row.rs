use pretty_assertions::assert_eq;
use qconv::conv::reference::direct_conv_packed;
use qconv::conv::{ConvBackend, ConvError, ConvParams, Kn2Row, Padding};
use qconv::packed::{Acc, Packed, PackedElement, QuantizedPacked, QuantizedPackedKernel};
use qconv::tensor::pack::{pack_activations, pack_kernel_ohwi};
use qconv::tensor::{Bhwc, ChHWBCl, Hwoi, KernelLayout, Ohwi, TensorView, TensorViewMut};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn random_codes(n: usize, mask: u64, rng: &mut SmallRng) -> Vec<u8> {
    (0..n).map(|_| rng.gen_range(0..=mask as u8)).collect()
}

/// Run kn2row on packed `act`/`weights` codes; returns (kn2row, direct) outputs.
fn convolve<A: PackedElement, K: PackedElement>(p: &ConvParams, act: &[u8], weights: &[u8], threads: usize) -> (Vec<Acc>, Vec<Acc>) {
    let shape = p.kernel_shape();
    let input = pack_activations::<A>(act, &p.input_shape()).unwrap();
    let ohwi = pack_kernel_ohwi::<K>(weights, &shape).unwrap();
    let ohwi_view = TensorView::<K, Ohwi>::new(&ohwi, Ohwi::kernel_dims(&shape, K::LANES));
    let backend = Kn2Row::<A, K>::with_threads(threads);
    let hwoi = backend.prepare_kernel(&ohwi_view, p);
    let input_view = TensorView::<A, ChHWBCl>::new(&input, p.input_dims::<A>());
    let kernel_view = TensorView::<K, Hwoi>::new(&hwoi, backend.kernel_dims(p));
    // stale contents must be overwritten
    let mut out = vec![-7 as Acc; p.output_len()];
    backend.convolve(&input_view, &kernel_view, p, &mut TensorViewMut::<Acc, Bhwc>::new(&mut out, p.output_dims())).unwrap();
    (out, direct_conv_packed(&input_view, &ohwi_view, p))
}

fn check_random<A: PackedElement, K: PackedElement>(p: &ConvParams, seed: u64) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let s = p.kernel_shape();
    let act = random_codes(p.input_shape().len(), A::lane_mask(), &mut rng);
    let w = random_codes(s.out_channels * s.height * s.width * s.in_channels, K::lane_mask(), &mut rng);
    let (got, want) = convolve::<A, K>(p, &act, &w, 1);
    assert_eq!(got, want, "{:?}", p);
}

#[test]
fn all_ones_3x3_over_4x4() {
    type B = Packed<u32, 1>;
    let p = ConvParams::new(4, 4, 1, 1, 3);
    let (got, want) = convolve::<B, B>(&p, &[1; 16], &[1; 9], 1);
    assert_eq!(p.output_dims(), [1, 2, 2, 1]);
    assert_eq!(got, vec![9, 9, 9, 9]);
    assert_eq!(want, got);
}

#[test]
fn zero_padding_contributes_nothing() {
    let p = ConvParams::new(3, 3, 1, 1, 3).with_padding(Padding::Same);
    // max activation code everywhere
    let (got, _) = convolve::<QuantizedPacked, QuantizedPackedKernel>(&p, &[3; 9], &[1; 9], 1);
    assert_eq!(got, vec![12, 18, 12, 18, 27, 18, 12, 18, 12]);
    // negative weights: padded taps still add zero, not -code
    let (got, _) = convolve::<QuantizedPacked, QuantizedPackedKernel>(&p, &[3; 9], &[0; 9], 1);
    assert_eq!(got, vec![-12, -18, -12, -18, -27, -18, -12, -18, -12]);
}

#[test]
fn matches_direct_convolution() {
    type A = QuantizedPacked;
    type K = QuantizedPackedKernel;
    // channel counts that leave partial words
    check_random::<A, K>(&ConvParams::new(6, 5, 40, 17, 3).with_padding(Padding::Same), 1);
    check_random::<A, K>(&ConvParams::new(7, 9, 33, 8, 3).with_stride(2).with_padding(Padding::Explicit(1)).with_batch(2), 2);
    check_random::<A, K>(&ConvParams::new(8, 8, 64, 5, 2).with_stride(2), 3);
    check_random::<A, K>(&ConvParams::new(5, 5, 3, 4, 5).with_padding(Padding::Explicit(2)).with_batch(3), 4);
    check_random::<A, K>(&ConvParams::new(4, 6, 70, 3, 1).with_batch(2), 5);
}

#[test]
fn taps_that_only_see_padding_are_skipped() {
    // 5x5 kernel with pad 2 on a 3x3 map: the outer taps miss the input for most outputs
    check_random::<QuantizedPacked, QuantizedPackedKernel>(&ConvParams::new(3, 3, 16, 2, 5).with_padding(Padding::Same), 6);
    // 1x1 input, every tap except the centre falls in padding
    check_random::<QuantizedPacked, QuantizedPackedKernel>(&ConvParams::new(1, 1, 8, 4, 7).with_padding(Padding::Same), 7);
}

#[test]
fn rectangular_kernel() {
    let mut p = ConvParams::new(6, 7, 12, 6, 1).with_padding(Padding::Explicit(1));
    p.kernel_width = 3;
    check_random::<QuantizedPacked, QuantizedPackedKernel>(&p, 8);
}

#[test]
fn other_element_widths() {
    let p = ConvParams::new(5, 5, 19, 6, 3).with_padding(Padding::Same);
    // binary activations, popcount path
    check_random::<Packed<u32, 1>, Packed<u32, 1>>(&p, 9);
    // ternary weights with different lanes per word than the activations
    check_random::<QuantizedPacked, Packed<u16, 2>>(&p, 10);
    check_random::<Packed<u16, 4>, Packed<u8, 1>>(&p, 11);
    check_random::<Packed<u32, 8>, Packed<u32, 4>>(&p, 12);
}

#[test]
fn threads_give_identical_results() {
    let p = ConvParams::new(12, 10, 96, 24, 3).with_padding(Padding::Same).with_batch(2);
    let mut rng = SmallRng::seed_from_u64(99);
    let s = p.kernel_shape();
    let act = random_codes(p.input_shape().len(), 3, &mut rng);
    let w = random_codes(s.out_channels * s.height * s.width * s.in_channels, 1, &mut rng);
    let (single, want) = convolve::<QuantizedPacked, QuantizedPackedKernel>(&p, &act, &w, 1);
    let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
    let (multi, _) = pool.install(|| convolve::<QuantizedPacked, QuantizedPackedKernel>(&p, &act, &w, 4));
    assert_eq!(multi, single);
    assert_eq!(single, want);
}

#[cfg(debug_assertions)]
#[test]
fn shape_mismatch_is_reported_in_debug_builds() {
    type A = QuantizedPacked;
    type K = QuantizedPackedKernel;
    let p = ConvParams::new(4, 4, 8, 2, 3);
    let backend = Kn2Row::<A, K>::new();
    let input = vec![A::default(); 16];
    let kernel = vec![K::default(); 18];
    let input_view = TensorView::<A, ChHWBCl>::new(&input, p.input_dims::<A>());
    let kernel_view = TensorView::<K, Hwoi>::new(&kernel, backend.kernel_dims(&p));

    // output sized for 3 channels instead of 2
    let mut out = vec![0 as Acc; 12];
    let err = backend.convolve(&input_view, &kernel_view, &p, &mut TensorViewMut::<Acc, Bhwc>::new(&mut out, [1, 2, 2, 3])).unwrap_err();
    assert!(matches!(err, ConvError::ShapeMismatch { what: "output", .. }), "{}", err);

    // a stride of zero never reaches the kernel loop
    let bad = p.clone().with_stride(0);
    let mut out = vec![0 as Acc; 8];
    let err = backend.convolve(&input_view, &kernel_view, &bad, &mut TensorViewMut::<Acc, Bhwc>::new(&mut out, [1, 2, 2, 2])).unwrap_err();
    assert!(matches!(err, ConvError::InvalidParams(_)), "{}", err);
}

#[test]
fn accumulator_overflow_is_rejected_up_front() {
    let p = ConvParams::new(4, 4, 1 << 20, 1, 31);
    assert!(p.check_accumulator::<Packed<u64, 8>, Packed<u64, 8>>().is_err());
    assert!(ConvParams::new(4, 4, 512, 1, 3).check_accumulator::<QuantizedPacked, QuantizedPackedKernel>().is_ok());
}
