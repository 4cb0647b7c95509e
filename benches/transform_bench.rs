use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qconv::conv::transform::{quantized_ohwi_to_hwoi, quantized_ohwi_to_tca};
use qconv::conv::{ConvParams, Padding};
use qconv::packed::{PackedElement, QuantizedPackedKernel};
use qconv::tensor::pack::pack_kernel_ohwi;
use qconv::tensor::{Hwoi, KernelLayout, Layout, OhIhHWOlIl, Ohwi, TensorView, TensorViewMut};

type K = QuantizedPackedKernel;

fn bench_kernel_transforms(c: &mut Criterion) {
    let p = ConvParams::new(16, 16, 256, 256, 3).with_padding(Padding::Same);
    let shape = p.kernel_shape();
    let n = shape.out_channels * shape.height * shape.width * shape.in_channels;
    let codes: Vec<u8> = (0..n).map(|i| ((i * 2654435761) >> 7) as u8 & 1).collect();
    let ohwi = pack_kernel_ohwi::<K>(&codes, &shape).unwrap();
    let src = TensorView::<K, Ohwi>::new(&ohwi, Ohwi::kernel_dims(&shape, K::LANES));

    let hwoi_dims = Hwoi::kernel_dims(&shape, K::LANES);
    let mut hwoi = vec![K::default(); Hwoi::size(&hwoi_dims)];
    c.bench_function("ohwi_to_hwoi_3x3_256", |b| {
        b.iter(|| {
            let mut dst = TensorViewMut::<K, Hwoi>::new(&mut hwoi, hwoi_dims);
            quantized_ohwi_to_hwoi(black_box(&src), &mut dst, &p);
        })
    });

    let tca_dims = OhIhHWOlIl::kernel_dims(&shape, K::LANES);
    let mut tca = vec![K::default(); OhIhHWOlIl::size(&tca_dims)];
    c.bench_function("ohwi_to_tca_3x3_256", |b| {
        b.iter(|| {
            let mut dst = TensorViewMut::<K, OhIhHWOlIl>::new(&mut tca, tca_dims);
            quantized_ohwi_to_tca(black_box(&src), &mut dst, &p);
        })
    });
}

criterion_group!(benches, bench_kernel_transforms);
criterion_main!(benches);
