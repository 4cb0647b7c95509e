use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use qconv::conv::{ConvBackend, ConvParams, Kn2Row, Padding, SimulatedTca, TcaConv};
use qconv::packed::{Acc, PackedElement, QuantizedPacked, QuantizedPackedKernel};
use qconv::tensor::pack::{pack_activations, pack_kernel_ohwi};
use qconv::tensor::{Bhwc, ChHWBCl, KernelLayout, Ohwi, TensorView, TensorViewMut};

fn random_codes(n: usize, max: u8, seed: &mut u64) -> Vec<u8> {
    (0..n)
        .map(|_| {
            *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((*seed >> 33) % (max as u64 + 1)) as u8
        })
        .collect()
}

fn run<B: ConvBackend>(c: &mut Criterion, group: &str, backend: B, layers: &[ConvParams]) {
    let mut g = c.benchmark_group(group);
    let mut seed = 0x1234_5678_9abc_def0u64;
    for p in layers {
        let shape = p.kernel_shape();
        let acts = random_codes(p.input_shape().len(), B::Input::lane_mask() as u8, &mut seed);
        let weights = random_codes(shape.out_channels * shape.height * shape.width * shape.in_channels, B::Kernel::lane_mask() as u8, &mut seed);
        let input = pack_activations::<B::Input>(&acts, &p.input_shape()).unwrap();
        let ohwi = pack_kernel_ohwi::<B::Kernel>(&weights, &shape).unwrap();
        let ohwi_view = TensorView::<B::Kernel, Ohwi>::new(&ohwi, Ohwi::kernel_dims(&shape, B::Kernel::LANES));
        let kernel = backend.prepare_kernel(&ohwi_view, p);
        let input_view = TensorView::<B::Input, ChHWBCl>::new(&input, p.input_dims::<B::Input>());
        let kernel_view = TensorView::<B::Kernel, B::KernelLayout>::new(&kernel, backend.kernel_dims(p));
        let mut out = vec![0 as Acc; p.output_len()];
        let id = format!("{}x{}x{}_k{}_o{}", p.input_height, p.input_width, p.in_channels, p.kernel_height, p.out_channels);
        g.bench_with_input(BenchmarkId::from_parameter(id), p, |ben, p| {
            ben.iter(|| {
                let mut view = TensorViewMut::<Acc, Bhwc>::new(&mut out, p.output_dims());
                backend.convolve(black_box(&input_view), &kernel_view, p, &mut view).unwrap();
            })
        });
    }
    g.finish();
}

fn layers() -> Vec<ConvParams> {
    vec![
        ConvParams::new(32, 32, 64, 64, 3).with_padding(Padding::Same),
        ConvParams::new(16, 16, 128, 128, 3).with_padding(Padding::Same),
        ConvParams::new(32, 32, 64, 128, 1),
    ]
}

fn bench_kn2row(c: &mut Criterion) {
    run(c, "kn2row", Kn2Row::<QuantizedPacked, QuantizedPackedKernel>::new(), &layers());
}

fn bench_tca_sim(c: &mut Criterion) {
    run(c, "tca_sim", TcaConv::<QuantizedPacked, QuantizedPackedKernel, _>::new(SimulatedTca::new()), &layers());
}

criterion_group!(benches, bench_kn2row, bench_tca_sim);
criterion_main!(benches);
