use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use qconv::conv::reference::direct_conv_packed;
use qconv::conv::{ConvBackend, ConvParams, Padding};
use qconv::packed::{Acc, PackedElement};
use qconv::tensor::pack::{pack_activations, pack_kernel_ohwi};
use qconv::tensor::{Bhwc, ChHWBCl, KernelLayout, Ohwi, TensorView, TensorViewMut};
use qconv::{open_backend, Backend};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

type Input = <Backend as ConvBackend>::Input;
type Kernel = <Backend as ConvBackend>::Kernel;

#[derive(Parser, Debug)]
#[command(name = "qconv-bench", version, about = "Benchmark the linked quantized convolution backend on a random layer")]
struct Args {
    #[arg(long, default_value_t = 32)]
    height: usize,

    #[arg(long, default_value_t = 32)]
    width: usize,

    #[arg(long, default_value_t = 64)]
    in_ch: usize,

    #[arg(long, default_value_t = 64)]
    out_ch: usize,

    /// Square kernel size
    #[arg(long, default_value_t = 3)]
    kernel: usize,

    #[arg(long, default_value_t = 1)]
    stride: usize,

    /// Symmetric zero padding
    #[arg(long, default_value_t = 1)]
    pad: usize,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Threads
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Timed iterations
    #[arg(long, default_value_t = 20)]
    iters: usize,

    /// Check the result against the direct convolution
    #[arg(long, default_value_t = false)]
    verify: bool,

    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let p = ConvParams::new(args.height, args.width, args.in_ch, args.out_ch, args.kernel)
        .with_stride(args.stride)
        .with_padding(Padding::Explicit(args.pad))
        .with_batch(args.batch);
    if let Err(e) = p.validate() {
        eprintln!("invalid layer: {}", e);
        std::process::exit(2);
    }

    let mut rng = SmallRng::seed_from_u64(args.seed);
    let act_codes: Vec<u8> = (0..p.input_shape().len()).map(|_| rng.gen_range(0..=Input::lane_mask() as u8)).collect();
    let shape = p.kernel_shape();
    let n_weights = shape.out_channels * shape.height * shape.width * shape.in_channels;
    let w_codes: Vec<u8> = (0..n_weights).map(|_| rng.gen_range(0..=Kernel::lane_mask() as u8)).collect();
    let input = pack_activations::<Input>(&act_codes, &p.input_shape()).expect("codes in range");
    let ohwi = pack_kernel_ohwi::<Kernel>(&w_codes, &shape).expect("codes in range");
    let ohwi_view = TensorView::<Kernel, Ohwi>::new(&ohwi, Ohwi::kernel_dims(&shape, Kernel::LANES));

    let backend = open_backend(args.threads);
    let kernel = backend.prepare_kernel(&ohwi_view, &p);
    let input_view = TensorView::<Input, ChHWBCl>::new(&input, p.input_dims::<Input>());
    let kernel_view = TensorView::<Kernel, <Backend as ConvBackend>::KernelLayout>::new(&kernel[..], backend.kernel_dims(&p));
    let mut out = vec![0 as Acc; p.output_len()];

    let pool = rayon::ThreadPoolBuilder::new().num_threads(args.threads.max(1)).build().unwrap();
    let pb = ProgressBar::new(args.iters as u64);
    pb.set_style(ProgressStyle::with_template("{bar:40} {pos}/{len} {elapsed_precise}").unwrap());
    let t0 = Instant::now();
    for _ in 0..args.iters {
        let mut view = TensorViewMut::<Acc, Bhwc>::new(&mut out, p.output_dims());
        if let Err(e) = pool.install(|| backend.convolve(&input_view, &kernel_view, &p, &mut view)) {
            pb.abandon();
            eprintln!("convolution failed: {}", e);
            std::process::exit(1);
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    let dt = t0.elapsed();
    let per_iter = dt.as_secs_f64() / args.iters.max(1) as f64;
    let macs = (p.batch * p.out_height() * p.out_width() * p.out_channels * p.in_channels * p.kernel_height * p.kernel_width) as f64;
    println!(
        "backend={} out={:?} iters={} elapsed={:.3}s per_iter={:.3}ms gmacs={:.2}",
        <Backend as ConvBackend>::NAME, p.output_dims(), args.iters, dt.as_secs_f64(), per_iter * 1e3, macs / per_iter / 1e9
    );

    if args.verify {
        let want = direct_conv_packed(&input_view, &ohwi_view, &p);
        let bad = want.iter().zip(&out).filter(|(a, b)| a != b).count();
        if bad > 0 {
            eprintln!("verify FAILED: {} of {} outputs differ", bad, want.len());
            std::process::exit(1);
        }
        println!("verify ok ({} outputs)", want.len());
    }
}
