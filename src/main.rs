use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use qconv::conv::{ConvBackend, ConvParams, Padding};
use qconv::model::{write_model, ConvLayerRecord, QuantModel};
use qconv::packed::{Acc, PackedElement};
use qconv::tensor::pack::{pack_activations, pack_kernel_ohwi};
use qconv::{open_backend, Backend, QuantizerKind};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Instant;

type Input = <Backend as ConvBackend>::Input;
type Kernel = <Backend as ConvBackend>::Kernel;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run and inspect quantized convolution models", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List the layers of a model file
    Inspect {
        #[arg(long)]
        model: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the scaling factor constants of a model file
    EmitConsts {
        #[arg(long)]
        model: PathBuf,
        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run one layer on random activations and print dequantized statistics
    Run {
        #[arg(long)]
        model: PathBuf,
        /// Layer index or name
        #[arg(long, default_value = "0")]
        layer: String,
        #[arg(long, default_value_t = 1)]
        threads: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
    /// Write a model file with random binary weights (one layer)
    Synth {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "conv1")]
        name: String,
        #[arg(long, default_value_t = 16)]
        height: usize,
        #[arg(long, default_value_t = 16)]
        width: usize,
        #[arg(long, default_value_t = 64)]
        in_ch: usize,
        #[arg(long, default_value_t = 64)]
        out_ch: usize,
        #[arg(long, default_value_t = 3)]
        kernel: usize,
        #[arg(long, default_value_t = 1)]
        stride: usize,
        /// Use 'same' padding
        #[arg(long)]
        same: bool,
        /// Per-output-channel scaling factors
        #[arg(long)]
        channel_wise: bool,
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.cmd {
        Cmd::Inspect { model, json } => {
            let m = QuantModel::load(&model, open_backend(1))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&m.summaries())?);
            } else {
                for (i, s) in m.summaries().iter().enumerate() {
                    let p = &s.params;
                    println!(
                        "#{} {} {}x{}x{} -> {:?} k={}x{} s={} pad={:?} {} ({} kernel words)",
                        i, s.name, p.input_height, p.input_width, p.in_channels, s.output_shape,
                        p.kernel_height, p.kernel_width, p.stride, p.padding, p.quantizer.op_type(), s.kernel_words
                    );
                }
            }
        }
        Cmd::EmitConsts { model, out } => {
            let m = QuantModel::load(&model, open_backend(1))?;
            let src = m.scales().emit_rust_consts();
            match out {
                Some(path) => std::fs::write(&path, src).with_context(|| format!("write {}", path.display()))?,
                None => print!("{}", src),
            }
        }
        Cmd::Run { model, layer, threads, seed } => {
            let m = QuantModel::load(&model, open_backend(threads))?;
            let idx = match layer.parse::<usize>() {
                Ok(i) if i < m.layers().len() => i,
                Ok(i) => bail!("layer {} out of range ({} layers)", i, m.layers().len()),
                Err(_) => m.layer_index(&layer).with_context(|| format!("no layer named {}", layer))?,
            };
            let p = m.layers()[idx].params.clone();
            let mut rng = SmallRng::seed_from_u64(seed);
            let codes: Vec<u8> = (0..p.input_shape().len()).map(|_| rng.gen_range(0..=Input::lane_mask() as u8)).collect();
            let input = pack_activations::<Input>(&codes, &p.input_shape())?;
            let mut out = vec![0 as Acc; p.output_len()];
            let t0 = Instant::now();
            let pool = rayon::ThreadPoolBuilder::new().num_threads(threads.max(1)).build()?;
            pool.install(|| m.run_layer(idx, &input, &mut out))?;
            let dt = t0.elapsed();
            let deq = m.dequantize(idx, &out).unwrap_or_default();
            let (min, max) = deq.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
            let mean = if deq.is_empty() { 0.0 } else { deq.iter().sum::<f32>() / deq.len() as f32 };
            println!(
                "layer={} output={:?} elapsed={:.3}ms min={:.4} max={:.4} mean={:.4}",
                m.layers()[idx].name, p.output_dims(), dt.as_secs_f64() * 1e3, min, max, mean
            );
        }
        Cmd::Synth { out, name, height, width, in_ch, out_ch, kernel, stride, same, channel_wise, seed } => {
            let quantizer = if channel_wise { QuantizerKind::BinaryChannelWiseMeanScaling } else { QuantizerKind::BinaryMeanScaling };
            let params = ConvParams::new(height, width, in_ch, out_ch, kernel)
                .with_stride(stride)
                .with_padding(if same { Padding::Same } else { Padding::Valid })
                .with_quantizer(quantizer);
            params.validate()?;
            let mut rng = SmallRng::seed_from_u64(seed);
            let shape = params.kernel_shape();
            let n = shape.out_channels * shape.height * shape.width * shape.in_channels;
            let codes: Vec<u8> = (0..n).map(|_| rng.gen_range(0..=Kernel::lane_mask() as u8)).collect();
            let scales: Vec<f32> = if channel_wise {
                (0..out_ch).map(|_| rng.gen_range(0.01f32..0.1)).collect()
            } else {
                vec![rng.gen_range(0.01f32..0.1)]
            };
            let rec = ConvLayerRecord { name, params, scales, kernel: pack_kernel_ohwi::<Kernel>(&codes, &shape)? };
            write_model(&out, &[rec])?;
            println!("wrote {}", out.display());
        }
    }
    Ok(())
}
