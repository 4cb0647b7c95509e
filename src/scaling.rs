/// Per-operator dequantization constants, generated once per model and read-only afterwards.
use crate::packed::Acc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

/// Weight quantizer that produced a convolution's kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QuantizerKind {
    /// One scale for the whole kernel.
    BinaryMeanScaling,
    /// One scale per output channel.
    BinaryChannelWiseMeanScaling,
    /// Anything else the converter may name; no scaling-factor shape exists for it.
    Other(String),
}

impl QuantizerKind {
    pub fn op_type(&self) -> &str {
        match self {
            QuantizerKind::BinaryMeanScaling => "BinaryMeanScalingQuantizer",
            QuantizerKind::BinaryChannelWiseMeanScaling => "BinaryChannelWiseMeanScalingQuantizer",
            QuantizerKind::Other(s) => s,
        }
    }
}

impl From<String> for QuantizerKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "BinaryMeanScalingQuantizer" => QuantizerKind::BinaryMeanScaling,
            "BinaryChannelWiseMeanScalingQuantizer" => QuantizerKind::BinaryChannelWiseMeanScaling,
            _ => QuantizerKind::Other(s),
        }
    }
}

impl From<QuantizerKind> for String {
    fn from(q: QuantizerKind) -> Self { q.op_type().to_string() }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name}: quantizer {op_type} has no scaling factor implementation")]
    UnsupportedQuantizer { name: String, op_type: String },
    #[error("{name}: expected {expected} scaling factors, got {actual}")]
    FactorCount { name: String, expected: usize, actual: usize },
    #[error("{name}: scaling factor {value} is not finite")]
    NonFinite { name: String, value: f32 },
    #[error("duplicate scaling factor constant {0}")]
    Duplicate(String),
    #[error("scaling factor table json: {0}")]
    Json(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalingFactor {
    PerTensor(f32),
    PerChannel(Vec<f32>),
}

impl ScalingFactor {
    #[inline]
    pub fn for_channel(&self, c: usize) -> f32 {
        match self {
            ScalingFactor::PerTensor(s) => *s,
            ScalingFactor::PerChannel(v) => v[c],
        }
    }

    /// Dequantize accumulators whose innermost dimension is `channels`.
    pub fn apply(&self, acc: &[Acc], channels: usize) -> Vec<f32> {
        let mut out = vec![0f32; acc.len()];
        self.apply_into(acc, channels, &mut out);
        out
    }

    pub fn apply_into(&self, acc: &[Acc], channels: usize, out: &mut [f32]) {
        debug_assert_eq!(acc.len(), out.len());
        match self {
            ScalingFactor::PerTensor(s) => {
                for (o, &a) in out.iter_mut().zip(acc) { *o = a as f32 * s; }
            }
            ScalingFactor::PerChannel(v) => {
                debug_assert_eq!(v.len(), channels);
                for (orow, arow) in out.chunks_mut(channels).zip(acc.chunks(channels)) {
                    for ((o, &a), s) in orow.iter_mut().zip(arow).zip(v) { *o = a as f32 * s; }
                }
            }
        }
    }
}

/// Constant name for an operator: non-alphanumerics become `_`, upper case, never starting with a digit.
pub fn constant_name(op_name: &str) -> String {
    let mut s: String = op_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    if s.is_empty() || s.starts_with(|c: char| c.is_ascii_digit()) {
        s.insert(0, '_');
    }
    s
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalingFactorTable {
    factors: BTreeMap<String, ScalingFactor>,
}

impl ScalingFactorTable {
    pub fn builder() -> ScalingTableBuilder { ScalingTableBuilder::default() }

    /// Look up by operator name (or by its constant name).
    pub fn get(&self, op_name: &str) -> Option<&ScalingFactor> { self.factors.get(&constant_name(op_name)) }

    pub fn len(&self) -> usize { self.factors.len() }
    pub fn is_empty(&self) -> bool { self.factors.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalingFactor)> { self.factors.iter().map(|(k, v)| (k.as_str(), v)) }

    /// Build from the converter's JSON listing: `[{"name", "quantizer", "channels", "values"}]`.
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let entries: Vec<ScalingEntry> = serde_json::from_str(s).map_err(|e| ConfigError::Json(e.to_string()))?;
        let mut b = Self::builder();
        for e in &entries { b.add(&e.name, &e.quantizer, e.channels, &e.values)?; }
        Ok(b.build())
    }

    /// Render one named constant per operator: `f32` for per-tensor, `[f32; N]` for per-channel.
    pub fn emit_rust_consts(&self) -> String {
        let mut out = String::from("// Generated scaling factors. Do not edit.\n");
        for (name, f) in &self.factors {
            match f {
                ScalingFactor::PerTensor(s) => { let _ = writeln!(out, "pub const {}: f32 = {:?};", name, s); }
                ScalingFactor::PerChannel(v) => {
                    let vals: Vec<String> = v.iter().map(|x| format!("{:?}", x)).collect();
                    let _ = writeln!(out, "pub const {}: [f32; {}] = [{}];", name, v.len(), vals.join(", "));
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEntry {
    pub name: String,
    pub quantizer: QuantizerKind,
    pub channels: usize,
    pub values: Vec<f32>,
}

/// Generation-time construction; every check that can fail happens here.
#[derive(Debug, Default)]
pub struct ScalingTableBuilder {
    factors: BTreeMap<String, ScalingFactor>,
}

impl ScalingTableBuilder {
    pub fn add(&mut self, op_name: &str, quantizer: &QuantizerKind, out_channels: usize, values: &[f32]) -> Result<&mut Self, ConfigError> {
        let name = constant_name(op_name);
        let expected = match quantizer {
            QuantizerKind::BinaryMeanScaling => 1,
            QuantizerKind::BinaryChannelWiseMeanScaling => out_channels,
            QuantizerKind::Other(op_type) => {
                return Err(ConfigError::UnsupportedQuantizer { name: op_name.to_string(), op_type: op_type.clone() });
            }
        };
        if values.len() != expected {
            return Err(ConfigError::FactorCount { name: op_name.to_string(), expected, actual: values.len() });
        }
        if let Some(&bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(ConfigError::NonFinite { name: op_name.to_string(), value: bad });
        }
        if self.factors.contains_key(&name) {
            return Err(ConfigError::Duplicate(name));
        }
        let f = match quantizer {
            QuantizerKind::BinaryMeanScaling => ScalingFactor::PerTensor(values[0]),
            _ => ScalingFactor::PerChannel(values.to_vec()),
        };
        self.factors.insert(name, f);
        Ok(self)
    }

    pub fn build(self) -> ScalingFactorTable { ScalingFactorTable { factors: self.factors } }
}
