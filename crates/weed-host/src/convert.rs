use weed_plant::{FrameBuffer, Palette};

/// Resizes and repacks frames for channels that cannot take a layer as is.
pub trait FrameConverter: Send + Sync {
    /// Repack `frame` into `palette`. `None` when the pair is unsupported.
    fn convert(&self, frame: &FrameBuffer, palette: Palette) -> Option<FrameBuffer>;

    /// Scale `frame` to `width` macropixels by `height` rows.
    fn resize(&self, frame: &FrameBuffer, width: usize, height: usize) -> Option<FrameBuffer>;
}

/// Nearest-neighbour scaling for every palette and swizzling between the
/// packed 8-bit RGB layouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicConverter;

/// Byte offsets of red, green, blue and (optionally) alpha in a pixel.
fn rgb_layout(palette: Palette) -> Option<([usize; 3], Option<usize>)> {
    match palette {
        Palette::Rgb24 => Some(([0, 1, 2], None)),
        Palette::Bgr24 => Some(([2, 1, 0], None)),
        Palette::Rgba32 => Some(([0, 1, 2], Some(3))),
        Palette::Bgra32 => Some(([2, 1, 0], Some(3))),
        Palette::Argb32 => Some(([1, 2, 3], Some(0))),
        _ => None,
    }
}

/// Bytes of one addressable element in `plane`.
fn element_bytes(palette: Palette, plane: usize) -> usize {
    if palette.num_planes() > 1 {
        1
    } else if plane == 0 {
        palette.bytes_per_macropixel()
    } else {
        0
    }
}

impl FrameConverter for BasicConverter {
    fn convert(&self, frame: &FrameBuffer, palette: Palette) -> Option<FrameBuffer> {
        if frame.palette() == palette {
            return Some(frame.clone());
        }
        let (src_rgb, src_alpha) = rgb_layout(frame.palette())?;
        let (dst_rgb, dst_alpha) = rgb_layout(palette)?;
        let src_px = frame.palette().bytes_per_macropixel();
        let dst_px = palette.bytes_per_macropixel();

        let mut out = FrameBuffer::new(palette, frame.width(), frame.height(), 1);
        for y in 0..frame.height() {
            let src = frame.row(0, y);
            let dst = out.row_mut(0, y);
            for (s, d) in src.chunks_exact(src_px).zip(dst.chunks_exact_mut(dst_px)) {
                for c in 0..3 {
                    d[dst_rgb[c]] = s[src_rgb[c]];
                }
                if let Some(alpha) = dst_alpha {
                    d[alpha] = src_alpha.map_or(255, |a| s[a]);
                }
            }
        }
        Some(out)
    }

    fn resize(&self, frame: &FrameBuffer, width: usize, height: usize) -> Option<FrameBuffer> {
        if width == 0 || height == 0 || frame.width() == 0 || frame.height() == 0 {
            return None;
        }
        if frame.width() == width && frame.height() == height {
            return Some(frame.clone());
        }
        let palette = frame.palette();
        let mut out = FrameBuffer::new(palette, width, height, 1);
        for plane in 0..palette.num_planes() {
            let elem = element_bytes(palette, plane);
            if elem == 0 {
                continue;
            }
            let src_cols = palette.plane_row_bytes(frame.width(), plane) / elem;
            let dst_cols = palette.plane_row_bytes(width, plane) / elem;
            let src_rows = frame.rows(plane);
            let dst_rows = out.rows(plane);
            if src_cols == 0 || src_rows == 0 {
                continue;
            }
            for y in 0..dst_rows {
                let sy = y * src_rows / dst_rows;
                let src = frame.row(plane, sy).to_vec();
                let dst = out.row_mut(plane, y);
                for x in 0..dst_cols {
                    let sx = x * src_cols / dst_cols;
                    dst[x * elem..(x + 1) * elem].copy_from_slice(&src[sx * elem..(sx + 1) * elem]);
                }
            }
        }
        Some(out)
    }
}
