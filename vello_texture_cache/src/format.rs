// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pixel formats and the choice of upload format.

use crate::Error;

/// Layout of a single pixel in CPU memory or in a texture.
///
/// Multi-byte packed formats are little-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PixelFormat {
    /// A single 8 bit alpha channel.
    Alpha8,
    /// A single 8 bit luminance channel, always opaque.
    Gray8,
    /// 16 bit packed, 5 bits red in the high bits, 6 bits green, 5 bits blue.
    Rgb565,
    /// 16 bit packed, 4 bits per channel, red in the high nibble and alpha in the low.
    Rgba4444,
    Rgba8,
    Bgra8,
    /// Four 32 bit floats.
    RgbaF32,
}

/// The format every unsupported format is converted to before upload.
pub const FALLBACK_FORMAT: PixelFormat = PixelFormat::Rgba8;

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Alpha8 | Self::Gray8 => 1,
            Self::Rgb565 | Self::Rgba4444 => 2,
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::RgbaF32 => 16,
        }
    }

    /// Whether every channel of this format is stored as one unsigned byte.
    ///
    /// Such formats can be filtered channel by channel without decoding.
    pub const fn has_byte_channels(self) -> bool {
        matches!(
            self,
            Self::Alpha8 | Self::Gray8 | Self::Rgba8 | Self::Bgra8
        )
    }

    /// Decode one pixel into RGBA8.
    ///
    /// The alpha convention is carried through unchanged.
    pub(crate) fn load_rgba8(self, src: &[u8]) -> [u8; 4] {
        match self {
            Self::Alpha8 => [0, 0, 0, src[0]],
            Self::Gray8 => [src[0], src[0], src[0], 0xff],
            Self::Rgb565 => {
                let p = u16::from_le_bytes([src[0], src[1]]);
                let r = ((p >> 11) & 0x1f) as u8;
                let g = ((p >> 5) & 0x3f) as u8;
                let b = (p & 0x1f) as u8;
                [r << 3 | r >> 2, g << 2 | g >> 4, b << 3 | b >> 2, 0xff]
            }
            Self::Rgba4444 => {
                let p = u16::from_le_bytes([src[0], src[1]]);
                let expand = |n: u16| ((n & 0xf) as u8) * 17;
                [expand(p >> 12), expand(p >> 8), expand(p >> 4), expand(p)]
            }
            Self::Rgba8 => [src[0], src[1], src[2], src[3]],
            Self::Bgra8 => [src[2], src[1], src[0], src[3]],
            Self::RgbaF32 => {
                let mut out = [0; 4];
                for (c, chunk) in out.iter_mut().zip(src[..16].chunks_exact(4)) {
                    let v: f32 = bytemuck::pod_read_unaligned(chunk);
                    *c = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                }
                out
            }
        }
    }

    /// Encode one RGBA8 pixel, quantizing to this format's precision.
    pub(crate) fn store_rgba8(self, rgba: [u8; 4], dst: &mut [u8]) {
        let [r, g, b, a] = rgba;
        match self {
            Self::Alpha8 => dst[0] = a,
            Self::Gray8 => {
                // Rec. 709 luma, rounded.
                let luma = 0.2126 * f32::from(r) + 0.7152 * f32::from(g) + 0.0722 * f32::from(b);
                dst[0] = luma.round() as u8;
            }
            Self::Rgb565 => {
                let p = (u16::from(r) >> 3) << 11 | (u16::from(g) >> 2) << 5 | u16::from(b) >> 3;
                dst[..2].copy_from_slice(&p.to_le_bytes());
            }
            Self::Rgba4444 => {
                let q = |c: u8| u16::from(c) >> 4;
                let p = q(r) << 12 | q(g) << 8 | q(b) << 4 | q(a);
                dst[..2].copy_from_slice(&p.to_le_bytes());
            }
            Self::Rgba8 => dst[..4].copy_from_slice(&rgba),
            Self::Bgra8 => dst[..4].copy_from_slice(&[b, g, r, a]),
            Self::RgbaF32 => {
                for (c, chunk) in rgba.iter().zip(dst[..16].chunks_exact_mut(4)) {
                    chunk.copy_from_slice(&(f32::from(*c) / 255.0).to_le_bytes());
                }
            }
        }
    }
}

/// Converts a row of `width` pixels from `src_format` to `dst_format`.
pub(crate) fn convert_row(
    src_format: PixelFormat,
    src: &[u8],
    dst_format: PixelFormat,
    dst: &mut [u8],
    width: usize,
) {
    let src_bpp = src_format.bytes_per_pixel();
    let dst_bpp = dst_format.bytes_per_pixel();
    if src_format == dst_format {
        dst[..width * dst_bpp].copy_from_slice(&src[..width * src_bpp]);
        return;
    }
    for (s, d) in src
        .chunks_exact(src_bpp)
        .zip(dst.chunks_exact_mut(dst_bpp))
        .take(width)
    {
        dst_format.store_rgba8(src_format.load_rgba8(s), d);
    }
}

/// How the color channels relate to alpha.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum AlphaType {
    Opaque,
    #[default]
    Premultiplied,
    Unpremultiplied,
}

/// The color space pixels are encoded in. Carried along, never converted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum ColorSpace {
    #[default]
    Srgb,
    LinearSrgb,
    DisplayP3,
}

/// Dimensions and interpretation of a block of pixels.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub alpha_type: AlphaType,
    pub color_space: ColorSpace,
}

impl ImageInfo {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            alpha_type: AlphaType::default(),
            color_space: ColorSpace::default(),
        }
    }

    #[must_use]
    pub fn with_format(self, format: PixelFormat) -> Self {
        Self { format, ..self }
    }

    #[must_use]
    pub fn with_alpha_type(self, alpha_type: AlphaType) -> Self {
        Self { alpha_type, ..self }
    }

    #[must_use]
    pub fn with_color_space(self, color_space: ColorSpace) -> Self {
        Self {
            color_space,
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn min_row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Bytes needed to hold every row at `row_bytes` stride.
    pub fn byte_size(&self, row_bytes: usize) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.height as usize - 1) * row_bytes + self.min_row_bytes()
    }
}

/// Which pixel formats a device can sample from.
pub trait FormatSupport {
    /// Whether `format` can be uploaded and sampled as a non-renderable texture.
    fn supports_sampling(&self, format: PixelFormat) -> bool;
}

/// The format a source will be uploaded in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NegotiatedFormat {
    pub format: PixelFormat,
    /// The source's pixels have to be converted to `format` before upload.
    pub needs_conversion: bool,
}

/// Pick the upload format for a source stored as `native`.
///
/// Falls back to [`FALLBACK_FORMAT`], which the device is asked about as well: a device that
/// can sample neither format can't take the source at all.
pub fn negotiate(
    native: PixelFormat,
    caps: &(impl FormatSupport + ?Sized),
) -> Result<NegotiatedFormat, Error> {
    if caps.supports_sampling(native) {
        return Ok(NegotiatedFormat {
            format: native,
            needs_conversion: false,
        });
    }
    if caps.supports_sampling(FALLBACK_FORMAT) {
        log::debug!("{native:?} is not supported by the device, converting to {FALLBACK_FORMAT:?}");
        return Ok(NegotiatedFormat {
            format: FALLBACK_FORMAT,
            needs_conversion: true,
        });
    }
    Err(Error::UnsupportedFormat(native))
}
