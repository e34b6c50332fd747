//! Pixel formats understood by the host and the legacy palette matcher.
//!
//! Widths carried by channels and layers are counted in macropixels; the
//! helpers here convert between macropixels, pixels and bytes.

/// A Weed palette code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum Palette {
    Rgb24 = 1,
    Bgr24 = 2,
    Rgba32 = 3,
    Argb32 = 4,
    RgbFloat = 5,
    RgbaFloat = 6,
    Bgra32 = 7,
    Yuv422P = 513,
    Yuv420P = 514,
    Yvu420P = 515,
    Yuv444P = 516,
    Yuva4444P = 517,
    Yuyv = 518,
    Uyvy = 519,
    Yuv411 = 520,
    Yuv888 = 521,
    Yuva8888 = 522,
    A1 = 1025,
    A8 = 1026,
    AFloat = 1027,
}

/// List terminator in `palette_list` leaves.
pub const PALETTE_END: i32 = 0;

impl Palette {
    pub const ALL: [Palette; 20] = [
        Palette::Rgb24,
        Palette::Bgr24,
        Palette::Rgba32,
        Palette::Argb32,
        Palette::RgbFloat,
        Palette::RgbaFloat,
        Palette::Bgra32,
        Palette::Yuv422P,
        Palette::Yuv420P,
        Palette::Yvu420P,
        Palette::Yuv444P,
        Palette::Yuva4444P,
        Palette::Yuyv,
        Palette::Uyvy,
        Palette::Yuv411,
        Palette::Yuv888,
        Palette::Yuva8888,
        Palette::A1,
        Palette::A8,
        Palette::AFloat,
    ];

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.code() == code)
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_rgb(self) -> bool {
        self.code() > 0 && self.code() < 512
    }

    pub fn is_yuv(self) -> bool {
        self.code() >= 512 && self.code() < 1024
    }

    pub fn is_alpha(self) -> bool {
        self.code() >= 1024
    }

    pub fn has_alpha(self) -> bool {
        self.is_alpha()
            || matches!(
                self,
                Palette::Rgba32
                    | Palette::Bgra32
                    | Palette::Argb32
                    | Palette::RgbaFloat
                    | Palette::Yuva4444P
                    | Palette::Yuva8888
            )
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            Palette::RgbFloat | Palette::RgbaFloat | Palette::AFloat
        )
    }

    pub fn pixels_per_macropixel(self) -> usize {
        match self {
            Palette::Uyvy | Palette::Yuyv => 2,
            Palette::Yuv411 => 4,
            Palette::A1 => 8,
            _ => 1,
        }
    }

    /// Bytes of one macropixel in plane 0.
    pub fn bytes_per_macropixel(self) -> usize {
        match self {
            Palette::Rgb24 | Palette::Bgr24 | Palette::Yuv888 => 3,
            Palette::Rgba32 | Palette::Bgra32 | Palette::Argb32 | Palette::Yuva8888 => 4,
            Palette::RgbFloat => 12,
            Palette::RgbaFloat => 16,
            Palette::Yuv422P
            | Palette::Yuv420P
            | Palette::Yvu420P
            | Palette::Yuv444P
            | Palette::Yuva4444P => 1,
            Palette::Uyvy | Palette::Yuyv => 4,
            Palette::Yuv411 => 6,
            Palette::A1 | Palette::A8 => 1,
            Palette::AFloat => 4,
        }
    }

    pub fn num_planes(self) -> usize {
        match self {
            Palette::Yuv444P | Palette::Yuv422P | Palette::Yuv420P | Palette::Yvu420P => 3,
            Palette::Yuva4444P => 4,
            _ => 1,
        }
    }

    pub fn plane_ratio_horizontal(self, plane: usize) -> f64 {
        match (self, plane) {
            (Palette::Yuv422P | Palette::Yuv420P | Palette::Yvu420P, 1 | 2) => 0.5,
            _ if plane < self.num_planes() => 1.0,
            _ => 0.0,
        }
    }

    pub fn plane_ratio_vertical(self, plane: usize) -> f64 {
        match (self, plane) {
            (Palette::Yuv420P | Palette::Yvu420P, 1 | 2) => 0.5,
            _ if plane < self.num_planes() => 1.0,
            _ => 0.0,
        }
    }

    /// Tightly packed row length in bytes of `plane` for a frame `width`
    /// macropixels wide.
    pub fn plane_row_bytes(self, width: usize, plane: usize) -> usize {
        let full = width * self.bytes_per_macropixel();
        (full as f64 * self.plane_ratio_horizontal(plane)) as usize
    }

    pub fn plane_rows(self, height: usize, plane: usize) -> usize {
        (height as f64 * self.plane_ratio_vertical(plane)) as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Palette::Rgb24 => "RGB24",
            Palette::Bgr24 => "BGR24",
            Palette::Rgba32 => "RGBA32",
            Palette::Argb32 => "ARGB32",
            Palette::RgbFloat => "RGBFLOAT",
            Palette::RgbaFloat => "RGBAFLOAT",
            Palette::Bgra32 => "BGRA32",
            Palette::Yuv422P => "YUV422P",
            Palette::Yuv420P => "YUV420P",
            Palette::Yvu420P => "YVU420P",
            Palette::Yuv444P => "YUV444P",
            Palette::Yuva4444P => "YUVA4444P",
            Palette::Yuyv => "YUYV",
            Palette::Uyvy => "UYVY",
            Palette::Yuv411 => "YUV411",
            Palette::Yuv888 => "YUV888",
            Palette::Yuva8888 => "YUVA8888",
            Palette::A1 => "A1",
            Palette::A8 => "A8",
            Palette::AFloat => "AFLOAT",
        }
    }
}

/// Decode a `palette_list` leaf, stopping at the terminator and skipping
/// codes this host does not know.
pub fn palette_list(codes: &[i32]) -> Vec<Palette> {
    codes
        .iter()
        .take_while(|&&code| code != PALETTE_END)
        .filter_map(|&code| Palette::from_code(code))
        .collect()
}

/// Pick the palette from `list` a channel should use when the frame arrives
/// as `palette`.
///
/// This is a compatibility table rather than a search: the passes and the
/// order in which they overwrite the candidate are what plugins have been
/// tested against, so they are kept exactly. `None` means nothing usable.
pub fn best_palette_match(list: &[Palette], palette: Palette) -> Option<Palette> {
    use Palette::*;

    if list.contains(&palette) {
        return Some(palette);
    }

    let mut best: Option<Palette> = None;
    let is = |best: Option<Palette>, p: Palette| best == Some(p);

    // same or higher quality in the same colourspace
    for &cand in list {
        if palette.is_alpha() {
            if cand == A8 {
                best = Some(cand);
            }
            if cand == A1 && (is(best, AFloat) || best.is_none()) {
                best = Some(cand);
            }
            if cand == AFloat && best.is_none() {
                best = Some(cand);
            }
        } else if palette.is_rgb() {
            if cand == RgbaFloat && (palette == RgbFloat || best.is_none()) {
                best = Some(cand);
            }
            if cand == RgbFloat && best.is_none() {
                best = Some(cand);
            }
            if matches!(cand, Rgba32 | Bgra32 | Argb32)
                && (best.is_none()
                    || is(best, RgbFloat)
                    || is(best, RgbaFloat)
                    || palette.has_alpha())
            {
                best = Some(cand);
            }
            if (!palette.has_alpha()
                || best.is_none()
                || is(best, RgbFloat)
                || is(best, RgbaFloat))
                && matches!(cand, Rgb24 | Bgr24)
            {
                best = Some(cand);
            }
        } else {
            if palette == Yuv411 && cand == Yuv422P {
                best = Some(cand);
            }
            if palette == Yuv411 && !is(best, Yuv422P) && matches!(cand, Yuv420P | Yvu420P) {
                best = Some(cand);
            }
            if palette == Yuv420P && cand == Yvu420P {
                best = Some(cand);
            }
            if palette == Yvu420P && cand == Yuv420P {
                best = Some(cand);
            }
            if ((palette == Yuv420P && !is(best, Yvu420P))
                || (palette == Yvu420P && !is(best, Yuv420P)))
                && matches!(cand, Yuv422P | Uyvy | Yuyv)
            {
                best = Some(cand);
            }
            if matches!(palette, Yuv422P | Uyvy | Yuyv) && matches!(cand, Yuv422P | Uyvy | Yuyv) {
                best = Some(cand);
            }
            if matches!(cand, Yuva8888 | Yuva4444P) && (best.is_none() || palette.has_alpha()) {
                best = Some(cand);
            }
            if (best.is_none()
                || ((is(best, Yuva8888) || is(best, Yuva4444P)) && !palette.has_alpha()))
                && matches!(cand, Yuv888 | Yuv444P)
            {
                best = Some(cand);
            }
        }
    }

    // alpha was dropped: try to keep it in the other colourspace
    for &cand in list {
        if palette.has_alpha() && best.map_or(true, |b| !b.has_alpha()) {
            if palette.is_rgb() {
                if matches!(cand, Yuva8888 | Yuva4444P) {
                    best = Some(cand);
                }
            } else if matches!(cand, Rgba32 | Bgra32 | Argb32) {
                best = Some(cand);
            }
        }
    }

    // switch colourspace, same or higher quality
    if best.is_none() {
        for &cand in list {
            if best.is_none() && matches!(cand, Rgba32 | Bgra32 | Argb32) {
                best = Some(cand);
            }
            if best.is_none() && matches!(cand, Yuva8888 | Yuva4444P) {
                best = Some(cand);
            }
            if (palette.is_rgb() || best.is_none()) && matches!(cand, Rgb24 | Bgr24) {
                best = Some(cand);
            }
            if (palette.is_yuv() || best.is_none()) && matches!(cand, Yuv888 | Yuv444P) {
                best = Some(cand);
            }
        }
    }

    // subsampled YUV as a last resort
    if best.is_none() {
        for &cand in list {
            if matches!(cand, Uyvy | Yuyv | Yuv422P) {
                best = Some(cand);
            }
            if (best.is_none() || is(best, Yuv411)) && matches!(cand, Yuv420P | Yvu420P) {
                best = Some(cand);
            }
            if best.is_none() && cand == Yuv411 {
                best = Some(cand);
            }
        }
    }

    // prefer the most common byte orders
    for &cand in list {
        if cand == Rgba32 && (is(best, Bgra32) || is(best, Argb32)) {
            best = Some(cand);
        }
        if cand == Rgb24 && is(best, Bgr24) {
            best = Some(cand);
        }
        if cand == Yuv420P && is(best, Yvu420P) {
            best = Some(cand);
        }
        if cand == Uyvy && is(best, Yuyv) {
            best = Some(cand);
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn exact_match_wins() {
        let list = [Palette::Bgr24, Palette::Yuv420P, Palette::Rgb24];
        assert_eq!(best_palette_match(&list, Palette::Yuv420P), Some(Palette::Yuv420P));
    }

    #[test]
    fn rgba32_preferred_over_argb32() {
        let list = [Palette::Argb32, Palette::Rgba32];
        assert_eq!(best_palette_match(&list, Palette::Bgra32), Some(Palette::Rgba32));
        let list = [Palette::Rgba32, Palette::Argb32];
        assert_eq!(best_palette_match(&list, Palette::Bgra32), Some(Palette::Rgba32));
    }

    #[test]
    fn rgb_without_alpha_prefers_packed_rgb() {
        let list = [Palette::Rgba32, Palette::Bgr24];
        assert_eq!(best_palette_match(&list, Palette::RgbFloat), Some(Palette::Bgr24));
        assert_eq!(best_palette_match(&list, Palette::Rgb24), Some(Palette::Bgr24));
    }

    #[test]
    fn alpha_is_kept_across_colourspaces() {
        let list = [Palette::Yuv888, Palette::Yuva8888, Palette::Rgb24];
        assert_eq!(best_palette_match(&list, Palette::Rgba32), Some(Palette::Yuva8888));
    }

    #[test]
    fn yuv_444_matches_alpha_presence() {
        let list = [Palette::Yuva4444P, Palette::Yuv444P, Palette::Yuv420P];
        assert_eq!(best_palette_match(&list, Palette::Yuv888), Some(Palette::Yuv444P));
        assert_eq!(best_palette_match(&list, Palette::Yuva8888), Some(Palette::Yuva4444P));
    }

    #[test]
    fn subsampled_last_resort() {
        let list = [Palette::Yuv411, Palette::Yvu420P];
        assert_eq!(best_palette_match(&list, Palette::Rgb24), Some(Palette::Yvu420P));
        assert_eq!(best_palette_match(&[Palette::A8], Palette::Rgb24), None);
    }

    #[test]
    fn alpha_palettes() {
        let list = [Palette::AFloat, Palette::A1];
        assert_eq!(best_palette_match(&list, Palette::A8), Some(Palette::A1));
    }

    #[test]
    fn geometry() {
        assert_eq!(Palette::Yuv420P.plane_row_bytes(64, 1), 32);
        assert_eq!(Palette::Yuv420P.plane_rows(48, 2), 24);
        assert_eq!(Palette::Yuv422P.plane_rows(48, 2), 48);
        assert_eq!(Palette::Uyvy.plane_row_bytes(32, 0), 128);
        assert_eq!(Palette::Rgb24.plane_row_bytes(10, 1), 0);
        assert_eq!(Palette::Yuva4444P.num_planes(), 4);
    }

    #[test]
    fn palette_list_stops_at_end() {
        assert_eq!(
            palette_list(&[3, 999, 1, PALETTE_END, 2]),
            vec![Palette::Rgba32, Palette::Rgb24]
        );
    }

    fn any_palette() -> impl Strategy<Value = Palette> {
        proptest::sample::select(Palette::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn matching_is_deterministic(
            list in proptest::collection::vec(any_palette(), 0..8),
            wanted in any_palette(),
        ) {
            let first = best_palette_match(&list, wanted);
            prop_assert_eq!(first, best_palette_match(&list, wanted));
            if let Some(found) = first {
                prop_assert!(list.contains(&found));
            }
        }
    }
}
