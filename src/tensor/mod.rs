/// Non-owning, layout-tagged views over flat buffers of packed words.
pub mod layout;
pub mod pack;

pub use layout::{Bhwc, ChHWBCl, Hwoi, KernelLayout, KernelShape, Layout, OhIhHWOlIl, Ohwi};

use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("{layout} view with dims {dims:?} needs {expected} elements, buffer has {actual}")]
    BufferSize { layout: &'static str, dims: Vec<usize>, expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a, T, L: Layout> {
    data: &'a [T],
    dims: L::Dims,
    _layout: PhantomData<L>,
}

impl<'a, T: Copy, L: Layout> TensorView<'a, T, L> {
    /// Wrap `data`; the length is only checked in debug builds.
    pub fn new(data: &'a [T], dims: L::Dims) -> Self {
        debug_assert_eq!(data.len(), L::size(&dims), "{} view dims {:?}", L::NAME, dims);
        Self { data, dims, _layout: PhantomData }
    }

    pub fn try_new(data: &'a [T], dims: L::Dims) -> Result<Self, ShapeError> {
        check_len::<L>(data.len(), &dims)?;
        Ok(Self { data, dims, _layout: PhantomData })
    }

    pub fn dims(&self) -> L::Dims { self.dims }
    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
    pub fn as_slice(&self) -> &'a [T] { self.data }

    #[inline]
    pub fn offset(&self, idx: L::Dims) -> usize {
        debug_assert!(L::contains(&self.dims, &idx), "{} index {:?} outside {:?}", L::NAME, idx, self.dims);
        L::offset(&self.dims, &idx)
    }

    #[inline]
    pub fn get(&self, idx: L::Dims) -> T { self.data[self.offset(idx)] }
}

#[derive(Debug)]
pub struct TensorViewMut<'a, T, L: Layout> {
    data: &'a mut [T],
    dims: L::Dims,
    _layout: PhantomData<L>,
}

impl<'a, T: Copy, L: Layout> TensorViewMut<'a, T, L> {
    pub fn new(data: &'a mut [T], dims: L::Dims) -> Self {
        debug_assert_eq!(data.len(), L::size(&dims), "{} view dims {:?}", L::NAME, dims);
        Self { data, dims, _layout: PhantomData }
    }

    pub fn try_new(data: &'a mut [T], dims: L::Dims) -> Result<Self, ShapeError> {
        check_len::<L>(data.len(), &dims)?;
        Ok(Self { data, dims, _layout: PhantomData })
    }

    pub fn dims(&self) -> L::Dims { self.dims }
    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
    pub fn as_slice(&self) -> &[T] { self.data }
    pub fn as_mut_slice(&mut self) -> &mut [T] { self.data }

    #[inline]
    pub fn offset(&self, idx: L::Dims) -> usize {
        debug_assert!(L::contains(&self.dims, &idx), "{} index {:?} outside {:?}", L::NAME, idx, self.dims);
        L::offset(&self.dims, &idx)
    }

    #[inline]
    pub fn get(&self, idx: L::Dims) -> T { self.data[self.offset(idx)] }

    #[inline]
    pub fn set(&mut self, idx: L::Dims, v: T) {
        let off = self.offset(idx);
        self.data[off] = v;
    }

    /// Reborrow as a shared view.
    pub fn view(&self) -> TensorView<'_, T, L> { TensorView { data: self.data, dims: self.dims, _layout: PhantomData } }
}

fn check_len<L: Layout>(len: usize, dims: &L::Dims) -> Result<(), ShapeError> {
    let expected = L::size(dims);
    if len != expected {
        return Err(ShapeError::BufferSize { layout: L::NAME, dims: dims.as_ref().to_vec(), expected, actual: len });
    }
    Ok(())
}
