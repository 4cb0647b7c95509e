/// Kernel reformatting between converter-native and backend-native layouts.
use crate::conv::ConvParams;
use crate::packed::PackedElement;
use crate::tensor::{Hwoi, KernelLayout, KernelShape, OhIhHWOlIl, Ohwi, TensorView, TensorViewMut};

/// Copy every weight of `src` into its position in `dst`, lane by lane.
///
/// Works across layouts and across packing ratios; `dst` lanes must be at least
/// as wide as the codes stored in `src`. Lanes of `dst` that hold no weight keep
/// their previous contents, so callers pass a zeroed buffer.
pub fn relayout_kernel<SE, SL, DE, DL>(
    src: &TensorView<'_, SE, SL>,
    dst: &mut TensorViewMut<'_, DE, DL>,
    shape: &KernelShape,
) where
    SE: PackedElement,
    SL: KernelLayout,
    DE: PackedElement,
    DL: KernelLayout,
{
    debug_assert_eq!(src.dims(), SL::kernel_dims(shape, SE::LANES), "{} source dims", SL::NAME);
    debug_assert_eq!(dst.dims(), DL::kernel_dims(shape, DE::LANES), "{} destination dims", DL::NAME);
    let (sd, dd) = (src.dims(), dst.dims());
    let words = src.as_slice();
    let out = dst.as_mut_slice();
    for o in 0..shape.out_channels {
        for kh in 0..shape.height {
            for kw in 0..shape.width {
                for c in 0..shape.in_channels {
                    let (so, sl) = SL::locate(&sd, SE::LANES, o, kh, kw, c);
                    let code = words[so].lane(sl);
                    debug_assert!((code as u64) <= DE::lane_mask(), "code {} does not fit {}-bit lanes", code, DE::BITS);
                    let (d_off, dl) = DL::locate(&dd, DE::LANES, o, kh, kw, c);
                    out[d_off] = out[d_off].with_lane(dl, code);
                }
            }
        }
    }
}

/// OHWI (converter) to HWOI (kn2row).
pub fn quantized_ohwi_to_hwoi<K: PackedElement>(
    ohwi: &TensorView<'_, K, Ohwi>,
    hwoi: &mut TensorViewMut<'_, K, Hwoi>,
    p: &ConvParams,
) {
    hwoi.as_mut_slice().fill(K::default());
    relayout_kernel(ohwi, hwoi, &p.kernel_shape());
}

/// OHWI (converter) to the accelerator's blocked layout.
pub fn quantized_ohwi_to_tca<K: PackedElement>(
    ohwi: &TensorView<'_, K, Ohwi>,
    tca: &mut TensorViewMut<'_, K, OhIhHWOlIl>,
    p: &ConvParams,
) {
    tca.as_mut_slice().fill(K::default());
    relayout_kernel(ohwi, tca, &p.kernel_shape());
}

/// HWOI back to OHWI.
pub fn quantized_hwoi_to_ohwi<K: PackedElement>(
    hwoi: &TensorView<'_, K, Hwoi>,
    ohwi: &mut TensorViewMut<'_, K, Ohwi>,
    p: &ConvParams,
) {
    ohwi.as_mut_slice().fill(K::default());
    relayout_kernel(hwoi, ohwi, &p.kernel_shape());
}
