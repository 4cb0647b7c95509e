use crate::conv::{ConvParams, Padding};
use crate::packed::PackedElement;
use crate::scaling::QuantizerKind;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MODEL_MAGIC: &[u8; 8] = b"QCONVM01";
pub const MODEL_VERSION: u32 = 1;
// name length, 8 params, padding tag and value, quantizer length, scale count, bits, lanes, word count
const MIN_LAYER_BYTES: u64 = 4 + 8 * 4 + 1 + 4 + 4 + 4 + 2 + 4;

/// One quantized convolution as the converter emits it: kernel in OHWI order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvLayerRecord<K> {
    pub name: String,
    pub params: ConvParams,
    pub scales: Vec<f32>,
    pub kernel: Vec<K>,
}

// File format (all little endian):
// magic: 8 bytes b"QCONVM01"
// u32 version, u32 layer_count
// per layer:
//   u32 name_len, name bytes
//   u32 batch, input_h, input_w, in_ch, out_ch, kernel_h, kernel_w, stride
//   u8 padding (0 valid, 1 same, 2 explicit), u32 explicit pad
//   u32 quantizer_len, quantizer op_type bytes
//   u32 scale_count, f32 scales[scale_count]
//   u8 kernel_bits, u8 kernel_lanes
//   u32 word_count, u64 words[word_count]

pub fn read_model<K: PackedElement, P: AsRef<Path>>(path: P) -> Result<Vec<ConvLayerRecord<K>>> {
    let f = File::open(&path).with_context(|| format!("open model file: {}", path.as_ref().display()))?;
    // every count in the file is bounded by the file size before anything is allocated
    let limit = f.metadata().context("stat model file")?.len();
    let mut r = BufReader::new(f);
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).context("read magic")?;
    if &magic != MODEL_MAGIC { bail!("bad model magic"); }
    let version = read_u32(&mut r).context("read version")?;
    if version != MODEL_VERSION { bail!("unsupported model version {}", version); }
    let count = read_count(&mut r, MIN_LAYER_BYTES, limit).context("read layer count")?;
    let mut layers = Vec::with_capacity(count);
    for i in 0..count {
        layers.push(read_layer::<K, _>(&mut r, limit).with_context(|| format!("read layer {}", i))?);
    }
    Ok(layers)
}

fn read_layer<K: PackedElement, R: Read>(r: &mut R, limit: u64) -> Result<ConvLayerRecord<K>> {
    let name = read_string(r, limit).context("read name")?;
    let mut d = [0usize; 8];
    for v in d.iter_mut() { *v = read_u32(r).context("read conv params")? as usize; }
    let padding = match (read_u8(r)?, read_u32(r)? as usize) {
        (0, _) => Padding::Valid,
        (1, _) => Padding::Same,
        (2, p) => Padding::Explicit(p),
        (t, _) => bail!("{}: unknown padding tag {}", name, t),
    };
    let quantizer = QuantizerKind::from(read_string(r, limit).context("read quantizer")?);
    let n_scales = read_count(r, 4, limit).context("read scale count")?;
    let mut scales = Vec::with_capacity(n_scales);
    for _ in 0..n_scales { scales.push(f32::from_le_bytes(read_array(r).context("read scales")?)); }
    let (bits, lanes) = (read_u8(r)? as u32, read_u8(r)? as usize);
    if bits != K::BITS || lanes != K::LANES {
        bail!("{}: kernel packed as {}x{}b, this build expects {}x{}b", name, lanes, bits, K::LANES, K::BITS);
    }
    let n_words = read_count(r, 8, limit).context("read kernel word count")?;
    let mut kernel = Vec::with_capacity(n_words);
    for i in 0..n_words {
        let raw = u64::from_le_bytes(read_array(r).context("read kernel words")?);
        match K::try_from_raw(raw) {
            Some(k) => kernel.push(k),
            None => bail!("{}: kernel word {} ({:#x}) has bits past its {} lanes", name, i, raw, K::LANES),
        }
    }
    let params = ConvParams {
        batch: d[0],
        input_height: d[1],
        input_width: d[2],
        in_channels: d[3],
        out_channels: d[4],
        kernel_height: d[5],
        kernel_width: d[6],
        stride: d[7],
        padding,
        quantizer,
    };
    Ok(ConvLayerRecord { name, params, scales, kernel })
}

pub fn write_model<K: PackedElement, P: AsRef<Path>>(path: P, layers: &[ConvLayerRecord<K>]) -> Result<()> {
    let f = File::create(&path).with_context(|| format!("create model file: {}", path.as_ref().display()))?;
    let mut w = BufWriter::new(f);
    w.write_all(MODEL_MAGIC)?;
    w.write_all(&MODEL_VERSION.to_le_bytes())?;
    w.write_all(&(layers.len() as u32).to_le_bytes())?;
    for l in layers {
        let p = &l.params;
        write_string(&mut w, &l.name)?;
        for v in [p.batch, p.input_height, p.input_width, p.in_channels, p.out_channels, p.kernel_height, p.kernel_width, p.stride] {
            w.write_all(&(v as u32).to_le_bytes())?;
        }
        let (tag, pad) = match p.padding {
            Padding::Valid => (0u8, 0usize),
            Padding::Same => (1, 0),
            Padding::Explicit(n) => (2, n),
        };
        w.write_all(&[tag])?;
        w.write_all(&(pad as u32).to_le_bytes())?;
        write_string(&mut w, p.quantizer.op_type())?;
        w.write_all(&(l.scales.len() as u32).to_le_bytes())?;
        for s in &l.scales { w.write_all(&s.to_le_bytes())?; }
        w.write_all(&[K::BITS as u8, K::LANES as u8])?;
        w.write_all(&(l.kernel.len() as u32).to_le_bytes())?;
        for k in &l.kernel { w.write_all(&k.raw().to_le_bytes())?; }
    }
    w.flush().context("flush model file")?;
    Ok(())
}

fn read_array<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N]> {
    let mut b = [0u8; N];
    r.read_exact(&mut b)?;
    Ok(b)
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> { Ok(read_array::<1, _>(r)?[0]) }
fn read_u32<R: Read>(r: &mut R) -> Result<u32> { Ok(u32::from_le_bytes(read_array(r)?)) }

/// Element count prefix, rejected if `n * elem_bytes` cannot fit in a file of `limit` bytes.
fn read_count<R: Read>(r: &mut R, elem_bytes: u64, limit: u64) -> Result<usize> {
    let n = read_u32(r)? as u64;
    if n.saturating_mul(elem_bytes) > limit {
        bail!("count {} needs more than the {} bytes in the file", n, limit);
    }
    Ok(n as usize)
}

fn read_string<R: Read>(r: &mut R, limit: u64) -> Result<String> {
    let n = read_count(r, 1, limit)?;
    let mut b = vec![0u8; n];
    r.read_exact(&mut b)?;
    Ok(String::from_utf8(b)?)
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_all(&(s.len() as u32).to_le_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}
