/// Model-lifetime ownership of kernels and scaling factors; inference calls only borrow.
pub mod loader;

use crate::conv::{ConvBackend, ConvError, ConvParams};
use crate::packed::{Acc, PackedElement};
use crate::scaling::ScalingFactorTable;
use crate::tensor::{Bhwc, ChHWBCl, KernelLayout, Layout, Ohwi, TensorView, TensorViewMut};
use anyhow::{bail, Context, Result};
use log::info;
use serde::Serialize;
use std::path::Path;

pub use loader::{read_model, write_model, ConvLayerRecord};

/// A convolution whose kernel is already in the backend's layout.
pub struct QuantLayer<K> {
    pub name: String,
    pub params: ConvParams,
    kernel: Vec<K>,
}

impl<K> QuantLayer<K> {
    pub fn kernel_words(&self) -> &[K] { &self.kernel }
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerSummary {
    pub name: String,
    pub params: ConvParams,
    pub kernel_words: usize,
    pub output_shape: [usize; 4],
}

pub struct QuantModel<B: ConvBackend> {
    backend: B,
    layers: Vec<QuantLayer<B::Kernel>>,
    scales: ScalingFactorTable,
}

impl<B: ConvBackend> QuantModel<B> {
    pub fn load<P: AsRef<Path>>(path: P, backend: B) -> Result<Self> {
        let records = read_model::<B::Kernel, _>(&path)?;
        Self::from_records(records, backend).with_context(|| format!("load model {}", path.as_ref().display()))
    }

    /// Validate every layer, build the scaling table and reformat kernels for `backend`.
    pub fn from_records(records: Vec<ConvLayerRecord<B::Kernel>>, backend: B) -> Result<Self> {
        let mut table = ScalingFactorTable::builder();
        let mut layers = Vec::with_capacity(records.len());
        for rec in records {
            let p = &rec.params;
            p.validate().with_context(|| format!("layer {}", rec.name))?;
            p.check_accumulator::<B::Input, B::Kernel>().with_context(|| format!("layer {}", rec.name))?;
            table.add(&rec.name, &p.quantizer, p.out_channels, &rec.scales)?;
            let dims = Ohwi::kernel_dims(&p.kernel_shape(), B::Kernel::LANES);
            if rec.kernel.len() != Ohwi::size(&dims) {
                bail!("layer {}: kernel has {} words, OHWI {:?} needs {}", rec.name, rec.kernel.len(), dims, Ohwi::size(&dims));
            }
            let ohwi = TensorView::<B::Kernel, Ohwi>::new(&rec.kernel, dims);
            let kernel = backend.prepare_kernel(&ohwi, p);
            layers.push(QuantLayer { name: rec.name, params: rec.params, kernel });
        }
        info!("loaded {} quantized conv layers for the {} backend", layers.len(), B::NAME);
        Ok(Self { backend, layers, scales: table.build() })
    }

    pub fn backend(&self) -> &B { &self.backend }
    pub fn layers(&self) -> &[QuantLayer<B::Kernel>] { &self.layers }
    pub fn scales(&self) -> &ScalingFactorTable { &self.scales }

    pub fn layer_index(&self, name: &str) -> Option<usize> { self.layers.iter().position(|l| l.name == name) }

    pub fn summaries(&self) -> Vec<LayerSummary> {
        self.layers
            .iter()
            .map(|l| LayerSummary {
                name: l.name.clone(),
                params: l.params.clone(),
                kernel_words: l.kernel.len(),
                output_shape: l.params.output_dims(),
            })
            .collect()
    }

    /// Run layer `idx` on a packed `ChHWBCl` input into `output` (BHWC accumulators).
    pub fn run_layer(&self, idx: usize, input: &[B::Input], output: &mut [Acc]) -> Result<(), ConvError> {
        let layer = self
            .layers
            .get(idx)
            .ok_or_else(|| ConvError::InvalidParams(format!("layer {} out of range ({} layers)", idx, self.layers.len())))?;
        let p = &layer.params;
        let input = TensorView::<B::Input, ChHWBCl>::try_new(input, p.input_dims::<B::Input>())?;
        let kernel = TensorView::<B::Kernel, B::KernelLayout>::new(&layer.kernel[..], self.backend.kernel_dims(p));
        let mut out = TensorViewMut::<Acc, Bhwc>::try_new(output, p.output_dims())?;
        self.backend.convolve(&input, &kernel, p, &mut out)
    }

    /// Apply layer `idx`'s scaling factor to its accumulator output. `None` for an unknown layer.
    pub fn dequantize(&self, idx: usize, acc: &[Acc]) -> Option<Vec<f32>> {
        let layer = self.layers.get(idx)?;
        self.scales.get(&layer.name).map(|s| s.apply(acc, layer.params.out_channels))
    }
}
