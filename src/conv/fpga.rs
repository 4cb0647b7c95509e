/// FPGA (TCA) dispatch: hands packed buffers to the accelerator and blocks until it signals completion.
///
/// The accelerator consumes the kernel in `OhIhHWOlIl` order and produces the same
/// `Bhwc` accumulator tensor as the software path. The simulated device accumulates
/// in 32 bits, so results are bit-exact with [`super::Kn2Row`].
use crate::conv::{check_shapes, ConvBackend, ConvError, ConvParams};
use crate::packed::{dot, Acc, PackedElement, QuantizedPacked, QuantizedPackedKernel};
use crate::tensor::{Bhwc, ChHWBCl, Layout, OhIhHWOlIl, TensorView, TensorViewMut};
use log::{debug, warn};
use rayon::prelude::*;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccelError {
    #[error("device {device} timed out after {millis} ms")]
    Timeout { device: String, millis: u64 },
    #[error("link failure: {0}")]
    Link(String),
    #[error("job rejected: {0}")]
    Rejected(String),
}

/// One convolution handed to the device.
pub struct TcaJob<'a, A, K> {
    pub input: TensorView<'a, A, ChHWBCl>,
    pub kernel: TensorView<'a, K, OhIhHWOlIl>,
    pub params: &'a ConvParams,
    pub output: TensorViewMut<'a, Acc, Bhwc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcaStats {
    pub cycles: u64,
    pub macs: u64,
}

/// Device interface. `execute` must not return before the output buffer is complete.
pub trait Accelerator<A, K>: Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, job: TcaJob<'_, A, K>) -> Result<TcaStats, AccelError>;
}

impl<A, K, D: Accelerator<A, K> + ?Sized> Accelerator<A, K> for Box<D> {
    fn name(&self) -> &str { (**self).name() }
    fn execute(&self, job: TcaJob<'_, A, K>) -> Result<TcaStats, AccelError> { (**self).execute(job) }
}

/// Running totals over every dispatch on one adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcaTotals {
    pub jobs: u64,
    pub failures: u64,
    pub cycles: u64,
}

/// [`ConvBackend`] that forwards each convolution to an [`Accelerator`].
///
/// Failures are returned to the caller as-is; there is no retry and no software fallback here.
pub struct TcaConv<A, K, D> {
    device: D,
    jobs: AtomicU64,
    failures: AtomicU64,
    cycles: AtomicU64,
    _elems: PhantomData<fn() -> (A, K)>,
}

impl<A: PackedElement, K: PackedElement, D: Accelerator<A, K>> TcaConv<A, K, D> {
    pub fn new(device: D) -> Self {
        Self { device, jobs: AtomicU64::new(0), failures: AtomicU64::new(0), cycles: AtomicU64::new(0), _elems: PhantomData }
    }

    pub fn device(&self) -> &D { &self.device }

    pub fn totals(&self) -> TcaTotals {
        TcaTotals {
            jobs: self.jobs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
        }
    }
}

impl<A: PackedElement, K: PackedElement, D: Accelerator<A, K>> ConvBackend for TcaConv<A, K, D> {
    type Input = A;
    type Kernel = K;
    type KernelLayout = OhIhHWOlIl;
    const NAME: &'static str = "tca";

    fn convolve(
        &self,
        input: &TensorView<'_, A, ChHWBCl>,
        kernel: &TensorView<'_, K, OhIhHWOlIl>,
        p: &ConvParams,
        output: &mut TensorViewMut<'_, Acc, Bhwc>,
    ) -> Result<(), ConvError> {
        if cfg!(debug_assertions) {
            check_shapes(input, kernel, p, &output.dims())?;
        }
        let dims = output.dims();
        let job = TcaJob { input: *input, kernel: *kernel, params: p, output: TensorViewMut::new(output.as_mut_slice(), dims) };
        self.jobs.fetch_add(1, Ordering::Relaxed);
        match self.device.execute(job) {
            Ok(stats) => {
                self.cycles.fetch_add(stats.cycles, Ordering::Relaxed);
                debug!("tca[{}] done: {} cycles, {} macs", self.device.name(), stats.cycles, stats.macs);
                Ok(())
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("tca[{}] failed: {}", self.device.name(), e);
                Err(e.into())
            }
        }
    }
}

/// Host-side model of the TCA: a PE array over `OUT_BLOCK` output lanes fed
/// `IN_BLOCK_WORDS` channel words per step, run on a device thread.
#[derive(Debug, Default)]
pub struct SimulatedTca {
    fault: Option<AccelError>,
}

impl SimulatedTca {
    pub fn new() -> Self { Self::default() }

    /// Device that fails every job with `err` and leaves the output untouched.
    pub fn failing(err: AccelError) -> Self { Self { fault: Some(err) } }
}

impl<A: PackedElement, K: PackedElement> Accelerator<A, K> for SimulatedTca {
    fn name(&self) -> &str { "tca-sim" }

    fn execute(&self, job: TcaJob<'_, A, K>) -> Result<TcaStats, AccelError> {
        if let Some(e) = &self.fault {
            return Err(e.clone());
        }
        if A::LANES != K::LANES {
            return Err(AccelError::Rejected(format!(
                "activation words carry {} channels, kernel words {}", A::LANES, K::LANES
            )));
        }
        let TcaJob { input, kernel, params, mut output } = job;
        let (tx, rx) = mpsc::channel();
        std::thread::scope(|s| {
            s.spawn(move || {
                // a device panic drops `tx` unsent, which reports as a link failure
                let run = panic::catch_unwind(AssertUnwindSafe(|| run_pe_array(&input, &kernel, params, output.as_mut_slice())));
                if let Ok(stats) = run {
                    let _ = tx.send(stats);
                }
            });
            rx.recv().map_err(|_| AccelError::Link("device thread exited without completion".to_string()))
        })
    }
}

fn run_pe_array<A: PackedElement, K: PackedElement>(
    input: &TensorView<'_, A, ChHWBCl>,
    kernel: &TensorView<'_, K, OhIhHWOlIl>,
    p: &ConvParams,
    out: &mut [Acc],
) -> TcaStats {
    let idims = input.dims();
    let kdims = kernel.dims();
    let [ob_n, ib_n, kh_n, kw_n, ol_n, il_n] = kdims;
    let (c, o) = (p.in_channels, p.out_channels);
    let cw = c.div_ceil(A::LANES);
    let (pad_h, pad_w, s) = (p.pad_h() as isize, p.pad_w() as isize, p.stride as isize);
    let (in_h, in_w) = (p.input_height as isize, p.input_width as isize);
    let (out_h, out_w) = (p.out_height(), p.out_width());
    let acts = input.as_slice();
    let weights = kernel.as_slice();

    // one chunk per output pixel: (b, y, x)
    out.par_chunks_mut(o).enumerate().for_each(|(pix, dst)| {
        let x = (pix % out_w) as isize;
        let y = ((pix / out_w) % out_h) as isize;
        let b = pix / (out_w * out_h);
        dst.fill(0);
        for ob in 0..ob_n {
            for ib in 0..ib_n {
                for kh in 0..kh_n {
                    let iy = y * s + kh as isize - pad_h;
                    if iy < 0 || iy >= in_h { continue; }
                    for kw in 0..kw_n {
                        let ix = x * s + kw as isize - pad_w;
                        if ix < 0 || ix >= in_w { continue; }
                        for il in 0..il_n {
                            let w = ib * il_n + il;
                            if w >= cw { break; }
                            let a = acts[ChHWBCl::offset(&idims, &[w, iy as usize, ix as usize, b])];
                            let valid = A::LANES.min(c - w * A::LANES);
                            for ol in 0..ol_n {
                                let oc = ob * ol_n + ol;
                                if oc >= o { break; }
                                let k = weights[OhIhHWOlIl::offset(&kdims, &[ob, ib, kh, kw, ol, il])];
                                dst[oc] += dot(&[a], &[k], valid);
                            }
                        }
                    }
                }
            }
        }
    });

    let pixels = (p.batch * out_h * out_w) as u64;
    TcaStats {
        cycles: pixels * (ob_n * ib_n * kh_n * kw_n) as u64,
        macs: pixels * (o * c * kh_n * kw_n) as u64,
    }
}

/// Open the board's accelerator.
pub fn open_device() -> Box<dyn Accelerator<QuantizedPacked, QuantizedPackedKernel>> {
    warn!("no TCA hardware link in this build; dispatching to the simulated device");
    Box::new(SimulatedTca::new())
}
