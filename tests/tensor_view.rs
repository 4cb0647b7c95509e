use qconv::tensor::{ChHWBCl, Hwoi, Layout, Ohwi, ShapeError, TensorView, TensorViewMut};

#[test]
fn offsets_are_row_major_in_layout_order() {
    let data: Vec<u32> = (0..120).collect();
    let v = TensorView::<u32, ChHWBCl>::new(&data, [2, 3, 4, 5]);
    assert_eq!(v.offset([0, 0, 0, 1]), 1);
    assert_eq!(v.offset([0, 0, 1, 0]), 5);
    assert_eq!(v.offset([1, 2, 3, 4]), 119);
    assert_eq!(v.get([1, 0, 0, 0]), 60);
}

#[test]
fn same_buffer_different_layouts_read_different_words() {
    let data: Vec<u32> = (0..24).collect();
    // 2 out, 3x1 taps, 4 words
    let ohwi = TensorView::<u32, Ohwi>::new(&data, [2, 3, 1, 4]);
    let hwoi = TensorView::<u32, Hwoi>::new(&data, [3, 1, 2, 4]);
    // logical (o=1, kh=0, kw=0, word=0)
    assert_eq!(ohwi.get([1, 0, 0, 0]), 12);
    assert_eq!(hwoi.get([0, 0, 1, 0]), 4);
}

#[test]
fn try_new_rejects_short_buffer() {
    let data = vec![0u32; 10];
    let err = TensorView::<u32, Ohwi>::try_new(&data, [2, 3, 1, 2]).unwrap_err();
    assert_eq!(err, ShapeError::BufferSize { layout: "OHWI", dims: vec![2, 3, 1, 2], expected: 12, actual: 10 });
    assert!(TensorView::<u32, Ohwi>::try_new(&data, [5, 1, 1, 2]).is_ok());
}

#[test]
fn mutable_view_writes_through() {
    let mut data = vec![0u32; ChHWBCl::size(&[1, 2, 2, 1])];
    {
        let mut v = TensorViewMut::<u32, ChHWBCl>::new(&mut data, [1, 2, 2, 1]);
        v.set([0, 1, 0, 0], 9);
        assert_eq!(v.view().get([0, 1, 0, 0]), 9);
        assert_eq!(v.len(), 4);
    }
    assert_eq!(data, vec![0, 0, 9, 0]);
}
