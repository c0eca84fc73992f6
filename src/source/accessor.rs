//! Read access to column grids
//!
//! Everything that can hand out columns (a full source or a window into one)
//! implements [`ColumnAccessor`]. Windows are zero-copy: they share the
//! backing column storage and carry only an offset and width.

use crate::datapoint::{DataPoint, IdMap};

/// Read accessor over a square grid of data point columns.
pub trait ColumnAccessor {
    /// Side length of the grid in columns.
    fn width(&self) -> usize;

    /// Column at local (x, z), depth-sorted topmost run first.
    fn get(&self, x: usize, z: usize) -> &[DataPoint];

    /// Id map the stored point ids resolve against.
    fn id_map(&self) -> &IdMap;

    /// Zero-copy window of `width` columns starting at (x, z).
    fn sub_view(&self, width: usize, x: usize, z: usize) -> SourceView<'_>;
}

/// Borrowed window over a source's column grid.
#[derive(Clone, Copy)]
pub struct SourceView<'a> {
    pub(crate) columns: &'a [Vec<DataPoint>],
    pub(crate) stride: usize,
    pub(crate) id_map: &'a IdMap,
    pub(crate) x_offset: usize,
    pub(crate) z_offset: usize,
    pub(crate) width: usize,
}

impl<'a> SourceView<'a> {
    pub(crate) fn new(
        columns: &'a [Vec<DataPoint>],
        stride: usize,
        id_map: &'a IdMap,
        x_offset: usize,
        z_offset: usize,
        width: usize,
    ) -> Self {
        assert!(x_offset + width <= stride, "view exceeds backing grid in x");
        assert!(z_offset + width <= columns.len() / stride, "view exceeds backing grid in z");
        Self { columns, stride, id_map, x_offset, z_offset, width }
    }
}

impl ColumnAccessor for SourceView<'_> {
    fn width(&self) -> usize {
        self.width
    }

    fn get(&self, x: usize, z: usize) -> &[DataPoint] {
        assert!(x < self.width && z < self.width, "column ({}, {}) outside view", x, z);
        &self.columns[(self.z_offset + z) * self.stride + self.x_offset + x]
    }

    fn id_map(&self) -> &IdMap {
        self.id_map
    }

    fn sub_view(&self, width: usize, x: usize, z: usize) -> SourceView<'_> {
        assert!(x + width <= self.width && z + width <= self.width, "sub-view outside view");
        SourceView {
            columns: self.columns,
            stride: self.stride,
            id_map: self.id_map,
            x_offset: self.x_offset + x,
            z_offset: self.z_offset + z,
            width,
        }
    }
}
