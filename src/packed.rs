/// Packed low-bit quantized words and the scalar/popcount kernels that consume them.
use std::fmt;
use thiserror::Error;

/// Accumulator type for convolution outputs.
pub type Acc = i32;

/// Unsigned machine word usable as packed storage.
pub trait Word: Copy + Default + Eq + fmt::Debug + Send + Sync + 'static {
    const WIDTH: u32;
    fn to_u64(self) -> u64;
    fn from_u64(v: u64) -> Self;
}

macro_rules! impl_word {
    ($($t:ty),*) => {
        $(impl Word for $t {
            const WIDTH: u32 = <$t>::BITS;
            #[inline] fn to_u64(self) -> u64 { self as u64 }
            #[inline] fn from_u64(v: u64) -> Self { v as $t }
        })*
    };
}
impl_word!(u8, u16, u32, u64);

/// A word holding `LANES` sub-fields of `BITS` bits each.
pub trait PackedElement: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const BITS: u32;
    const LANES: usize;

    fn from_raw(raw: u64) -> Self;
    fn raw(self) -> u64;

    #[inline]
    fn lane_mask() -> u64 { (1u64 << Self::BITS) - 1 }

    /// [`from_raw`](Self::from_raw) that refuses bits above the last lane.
    fn try_from_raw(raw: u64) -> Option<Self> {
        let used = Self::LANES as u32 * Self::BITS;
        if used < u64::BITS && raw >> used != 0 { return None; }
        Some(Self::from_raw(raw))
    }

    #[inline]
    fn lane(self, i: usize) -> u8 {
        debug_assert!(i < Self::LANES, "lane {} out of {}", i, Self::LANES);
        ((self.raw() >> (i as u32 * Self::BITS)) & Self::lane_mask()) as u8
    }

    #[inline]
    fn with_lane(self, i: usize, code: u8) -> Self {
        debug_assert!(i < Self::LANES, "lane {} out of {}", i, Self::LANES);
        debug_assert!((code as u64) <= Self::lane_mask(), "code {} wider than {} bits", code, Self::BITS);
        let shift = i as u32 * Self::BITS;
        let cleared = self.raw() & !(Self::lane_mask() << shift);
        Self::from_raw(cleared | (((code as u64) & Self::lane_mask()) << shift))
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Packed<W: Word, const BITS: u32>(W);

impl<W: Word, const BITS: u32> Packed<W, BITS> {
    const LAYOUT_OK: () = assert!(
        (BITS == 1 || BITS == 2 || BITS == 4 || BITS == 8) && W::WIDTH % BITS == 0,
        "packed lane width must be 1, 2, 4 or 8 bits and divide the word"
    );

    #[inline]
    pub fn new(word: W) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::LAYOUT_OK;
        Self(word)
    }

    #[inline]
    pub fn word(self) -> W { self.0 }

    /// Build one word from up to `LANES` codes; missing lanes are zero.
    pub fn from_codes(codes: &[u8]) -> Self {
        debug_assert!(codes.len() <= <Self as PackedElement>::LANES);
        let mut p = Self::default();
        for (i, &c) in codes.iter().enumerate() { p = p.with_lane(i, c); }
        p
    }
}

impl<W: Word, const BITS: u32> PackedElement for Packed<W, BITS> {
    const BITS: u32 = BITS;
    const LANES: usize = (W::WIDTH / BITS) as usize;

    #[inline]
    fn from_raw(raw: u64) -> Self { Self::new(W::from_u64(raw)) }
    #[inline]
    fn raw(self) -> u64 { self.0.to_u64() }
}

impl<W: Word, const BITS: u32> fmt::Debug for Packed<W, BITS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packed<{}x{}b>({:#x})", <Self as PackedElement>::LANES, BITS, self.raw())
    }
}

/// Activation storage: 2-bit codes, 32 channels per word.
pub type QuantizedPacked = Packed<u64, 2>;
/// Kernel storage: binary weights, 32 channels per word.
pub type QuantizedPackedKernel = Packed<u32, 1>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackError {
    #[error("code {code} at index {index} does not fit in {bits} bits")]
    CodeOutOfRange { index: usize, code: u8, bits: u32 },
}

/// Number of words needed for `n` lanes.
#[inline]
pub fn words_for<E: PackedElement>(n: usize) -> usize { n.div_ceil(E::LANES) }

/// Pack a flat sequence of codes, lane-major within each word.
pub fn pack<E: PackedElement>(codes: &[u8]) -> Result<Vec<E>, PackError> {
    let mut out = vec![E::default(); words_for::<E>(codes.len())];
    for (i, &c) in codes.iter().enumerate() {
        if (c as u64) > E::lane_mask() {
            return Err(PackError::CodeOutOfRange { index: i, code: c, bits: E::BITS });
        }
        let w = &mut out[i / E::LANES];
        *w = w.with_lane(i % E::LANES, c);
    }
    Ok(out)
}

/// Inverse of [`pack`]; `n` is the logical count (tail lanes are dropped).
pub fn unpack<E: PackedElement>(words: &[E], n: usize) -> Vec<u8> {
    debug_assert!(n <= words.len() * E::LANES);
    (0..n).map(|i| words[i / E::LANES].lane(i % E::LANES)).collect()
}

/// Signed value of a kernel code of width `bits`.
#[inline]
pub fn decode_weight(code: u8, bits: u32) -> i32 {
    match bits {
        1 => if code & 1 == 1 { 1 } else { -1 },
        2 => match code & 0b11 {
            0b00 => -1,
            0b10 => 1,
            _ => 0, // 01 is zero, 11 reserved
        },
        _ => {
            let shift = 32 - bits;
            ((code as i32) << shift) >> shift
        }
    }
}

/// Largest absolute value a kernel code of width `bits` can decode to.
pub fn max_abs_weight(bits: u32) -> u64 {
    match bits {
        1 | 2 => 1,
        b => 1u64 << (b - 1),
    }
}

/// Mask selecting the first `valid` lanes of a word.
#[inline]
fn valid_mask<E: PackedElement>(valid: usize) -> u64 {
    if valid >= E::LANES { u64::MAX } else { (1u64 << (valid as u32 * E::BITS)) - 1 }
}

const EVEN_BITS: u64 = 0x5555_5555_5555_5555;

/// Move bit `i` of the low 32 bits to bit `2i`.
#[inline]
fn spread_bits(v: u64) -> u64 {
    let mut x = v & 0xFFFF_FFFF;
    x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    (x | (x << 1)) & EVEN_BITS
}

/// Channel reduction `sum_c act[c] * weight[c]` over the first `channels` lanes.
#[inline]
pub fn dot<A: PackedElement, K: PackedElement>(acts: &[A], weights: &[K], channels: usize) -> Acc {
    if A::LANES == K::LANES {
        let words = words_for::<A>(channels);
        debug_assert!(acts.len() >= words && weights.len() >= words);
        if A::BITS == 1 && K::BITS == 1 {
            // a * (2k - 1) summed over lanes = 2 * popcnt(a & k) - popcnt(a)
            let mut acc: Acc = 0;
            for w in 0..words {
                let a = acts[w].raw() & valid_mask::<A>(channels - w * A::LANES);
                let k = weights[w].raw();
                acc += 2 * (a & k).count_ones() as Acc - a.count_ones() as Acc;
            }
            return acc;
        }
        if A::BITS == 2 && K::BITS == 1 {
            // per bit plane b: 2^b * (2 * popcnt(a_b & k) - popcnt(a_b)), k spread onto even bits
            let mut acc: Acc = 0;
            for w in 0..words {
                let a = acts[w].raw() & valid_mask::<A>(channels - w * A::LANES);
                let k = spread_bits(weights[w].raw());
                let lo = a & EVEN_BITS;
                let hi = (a >> 1) & EVEN_BITS;
                acc += 2 * (lo & k).count_ones() as Acc - lo.count_ones() as Acc;
                acc += 2 * (2 * (hi & k).count_ones() as Acc - hi.count_ones() as Acc);
            }
            return acc;
        }
        let mut acc: Acc = 0;
        for w in 0..words {
            let (a, k) = (acts[w], weights[w]);
            let n = A::LANES.min(channels - w * A::LANES);
            for l in 0..n {
                acc += a.lane(l) as Acc * decode_weight(k.lane(l), K::BITS);
            }
        }
        return acc;
    }
    let mut acc: Acc = 0;
    for c in 0..channels {
        let a = acts[c / A::LANES].lane(c % A::LANES) as Acc;
        let k = weights[c / K::LANES].lane(c % K::LANES);
        acc += a * decode_weight(k, K::BITS);
    }
    acc
}
