use std::ops::Range;

use crate::palette::Palette;
use crate::value::VoidPtr;

/// Pixel memory for one frame, all planes in a single allocation.
///
/// Planar formats keep their planes back to back, so a 4:2:0 frame is one
/// block with three plane offsets into it. Plugins only ever see the plane
/// addresses; the buffer must therefore not be reallocated while a channel
/// points into it.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    palette: Palette,
    width: usize,
    height: usize,
    rowstrides: Vec<usize>,
    offsets: Vec<usize>,
    data: Box<[u8]>,
}

impl FrameBuffer {
    /// Zeroed frame, `width` in macropixels, rows padded to `alignment`
    /// bytes (1 for tight packing).
    pub fn new(palette: Palette, width: usize, height: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let rowstrides = (0..palette.num_planes())
            .map(|plane| {
                let bytes = palette.plane_row_bytes(width, plane);
                bytes.div_ceil(alignment) * alignment
            })
            .collect::<Vec<_>>();
        Self::with_rowstrides(palette, width, height, rowstrides)
    }

    pub fn with_rowstrides(
        palette: Palette,
        width: usize,
        height: usize,
        rowstrides: Vec<usize>,
    ) -> Self {
        let (offsets, total) = Self::layout(palette, height, &rowstrides);
        FrameBuffer {
            palette,
            width,
            height,
            rowstrides,
            offsets,
            data: vec![0u8; total].into_boxed_slice(),
        }
    }

    /// Wrap existing contiguous plane bytes. Returns `None` when `data` does
    /// not hold exactly the planes described.
    pub fn from_bytes(
        palette: Palette,
        width: usize,
        height: usize,
        rowstrides: Vec<usize>,
        data: Vec<u8>,
    ) -> Option<Self> {
        if rowstrides.len() != palette.num_planes() {
            return None;
        }
        let (offsets, total) = Self::layout(palette, height, &rowstrides);
        if total != data.len() {
            return None;
        }
        Some(FrameBuffer {
            palette,
            width,
            height,
            rowstrides,
            offsets,
            data: data.into_boxed_slice(),
        })
    }

    fn layout(palette: Palette, height: usize, rowstrides: &[usize]) -> (Vec<usize>, usize) {
        let mut offsets = Vec::with_capacity(rowstrides.len());
        let mut total = 0;
        for (plane, stride) in rowstrides.iter().enumerate() {
            offsets.push(total);
            total += stride * palette.plane_rows(height, plane);
        }
        (offsets, total)
    }

    pub fn palette(&self) -> Palette {
        self.palette
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn num_planes(&self) -> usize {
        self.rowstrides.len()
    }

    pub fn rowstrides(&self) -> &[usize] {
        &self.rowstrides
    }

    pub fn rows(&self, plane: usize) -> usize {
        self.palette.plane_rows(self.height, plane)
    }

    fn plane_range(&self, plane: usize) -> Range<usize> {
        let start = self.offsets[plane];
        start..start + self.rowstrides[plane] * self.rows(plane)
    }

    pub fn plane(&self, plane: usize) -> &[u8] {
        &self.data[self.plane_range(plane)]
    }

    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        let range = self.plane_range(plane);
        &mut self.data[range]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Per-plane (rowstride, byte length).
    pub fn plane_layout(&self) -> Vec<(usize, usize)> {
        (0..self.num_planes())
            .map(|plane| (self.rowstrides[plane], self.plane_range(plane).len()))
            .collect()
    }

    /// Plane start addresses for `pixel_data` leaves.
    pub fn plane_ptrs(&mut self) -> Vec<VoidPtr> {
        let base = self.data.as_mut_ptr();
        self.offsets
            .iter()
            .map(|&offset| VoidPtr::from(base.wrapping_add(offset)))
            .collect()
    }

    pub fn fill(&mut self, byte: u8) {
        self.data.fill(byte);
    }

    /// Bytes of row `row` in `plane`, trimmed to the packed row length.
    pub fn row(&self, plane: usize, row: usize) -> &[u8] {
        let len = self.palette.plane_row_bytes(self.width, plane);
        let start = self.offsets[plane] + row * self.rowstrides[plane];
        &self.data[start..start + len]
    }

    pub fn row_mut(&mut self, plane: usize, row: usize) -> &mut [u8] {
        let len = self.palette.plane_row_bytes(self.width, plane);
        let start = self.offsets[plane] + row * self.rowstrides[plane];
        &mut self.data[start..start + len]
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("palette", &self.palette)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rowstrides", &self.rowstrides)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn planar_frames_are_one_block() {
        let mut frame = FrameBuffer::new(Palette::Yuv420P, 16, 8, 1);
        assert_eq!(frame.rowstrides(), &[16, 8, 8]);
        assert_eq!(frame.plane_layout(), vec![(16, 128), (8, 32), (8, 32)]);
        assert_eq!(frame.byte_len(), 192);
        let ptrs = frame.plane_ptrs();
        assert_eq!(ptrs[1].addr() - ptrs[0].addr(), 128);
        assert_eq!(ptrs[2].addr() - ptrs[1].addr(), 32);
    }

    #[test]
    fn rows_are_aligned() {
        let frame = FrameBuffer::new(Palette::Rgb24, 5, 2, 16);
        assert_eq!(frame.rowstrides(), &[16]);
        assert_eq!(frame.row(0, 1).len(), 15);
    }

    #[test]
    fn from_bytes_checks_length() {
        assert!(FrameBuffer::from_bytes(Palette::Rgba32, 2, 2, vec![8], vec![0; 16]).is_some());
        assert!(FrameBuffer::from_bytes(Palette::Rgba32, 2, 2, vec![8], vec![0; 15]).is_none());
        assert!(FrameBuffer::from_bytes(Palette::Yuv444P, 2, 2, vec![2], vec![0; 4]).is_none());
    }
}
