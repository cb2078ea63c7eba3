// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pixel sources.

use std::sync::Arc;

use peniko::Blob;
use thiserror::Error;

use crate::format::{convert_row, ImageInfo, PixelFormat};
use crate::invalidation::InvalidationListener;
use crate::pixel_ref::{GenerationId, PixelRef};
use crate::Result;

/// An integer rectangle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct IRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl IRect {
    pub fn from_xywh(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// The overlap of two rectangles, if any.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (i64::from(self.x) + i64::from(self.width))
            .min(i64::from(other.x) + i64::from(other.width));
        let y1 = (i64::from(self.y) + i64::from(self.height))
            .min(i64::from(other.y) + i64::from(other.height));
        if x1 <= i64::from(x0) || y1 <= i64::from(y0) {
            return None;
        }
        Some(Self {
            x: x0,
            y: y0,
            width: (x1 - i64::from(x0)) as u32,
            height: (y1 - i64::from(y0)) as u32,
        })
    }
}

/// Errors from reading a source's pixels into caller storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadPixelsError {
    /// Storage for the destination pixels couldn't be allocated.
    #[error("Couldn't allocate {0} bytes for pixels")]
    Allocation(usize),
    #[error("Destination is {dst_width}x{dst_height} but the source is {src_width}x{src_height}")]
    SizeMismatch {
        src_width: u32,
        src_height: u32,
        dst_width: u32,
        dst_height: u32,
    },
    #[error("Destination buffer of {actual} bytes can't hold {expected} bytes")]
    DestinationTooSmall { expected: usize, actual: usize },
    #[error("Source has no pixels to read")]
    Empty,
}

/// A cheap, immutable view of a source's pixels.
///
/// Holds its own reference to the pixel storage, so it stays valid (and unchanged) if the
/// source is mutated afterwards.
#[derive(Clone)]
pub struct Pixmap {
    info: ImageInfo,
    data: Blob<u8>,
    offset: usize,
    row_bytes: usize,
}

impl Pixmap {
    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    /// The pixels, starting at the top left pixel of the view.
    ///
    /// Rows are [`row_bytes`](Self::row_bytes) apart; the last row is not padded.
    pub fn bytes(&self) -> &[u8] {
        &self.data.data()[self.offset..self.offset + self.info.byte_size(self.row_bytes)]
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.row_bytes;
        &self.bytes()[start..start + self.info.min_row_bytes()]
    }

    /// Rows packed without padding.
    pub fn to_packed(&self) -> Vec<u8> {
        (0..self.info.height)
            .flat_map(|y| self.row(y).iter().copied())
            .collect()
    }
}

impl std::fmt::Debug for Pixmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pixmap")
            .field("info", &self.info)
            .field("row_bytes", &self.row_bytes)
            .finish_non_exhaustive()
    }
}

/// Something a texture can be made from.
pub trait PixelSource {
    fn info(&self) -> &ImageInfo;

    /// Identifies the current contents. Changes whenever the pixels are mutated.
    fn generation_id(&self) -> GenerationId;

    /// The rectangle of the underlying pixel storage this source covers.
    fn subset(&self) -> IRect;

    /// Volatile sources are expected to change on every use and are never cached.
    fn is_volatile(&self) -> bool;

    fn pixmap(&self) -> Pixmap;

    /// Read the pixels into `dst`, converting them to `dst_info.format`.
    fn read_pixels(
        &self,
        dst_info: &ImageInfo,
        dst: &mut [u8],
        dst_row_bytes: usize,
    ) -> Result<(), ReadPixelsError> {
        let src = self.pixmap();
        let src_info = src.info();
        if src_info.is_empty() {
            return Err(ReadPixelsError::Empty);
        }
        if (src_info.width, src_info.height) != (dst_info.width, dst_info.height) {
            return Err(ReadPixelsError::SizeMismatch {
                src_width: src_info.width,
                src_height: src_info.height,
                dst_width: dst_info.width,
                dst_height: dst_info.height,
            });
        }
        let expected = dst_info.byte_size(dst_row_bytes);
        if dst.len() < expected || dst_row_bytes < dst_info.min_row_bytes() {
            return Err(ReadPixelsError::DestinationTooSmall {
                expected: expected.max(dst_info.min_row_bytes()),
                actual: dst.len(),
            });
        }
        for y in 0..dst_info.height {
            let start = y as usize * dst_row_bytes;
            convert_row(
                src_info.format,
                src.row(y),
                dst_info.format,
                &mut dst[start..start + dst_info.min_row_bytes()],
                dst_info.width as usize,
            );
        }
        Ok(())
    }

    /// Register a listener which fires when these pixels leave the listener's generation.
    fn add_invalidation_listener(&self, listener: InvalidationListener);
}

/// A 2D view of (a subset of) a [`PixelRef`].
#[derive(Clone, Debug)]
pub struct Bitmap {
    info: ImageInfo,
    pixel_ref: Arc<PixelRef>,
    origin: (u32, u32),
    volatile: bool,
}

impl Bitmap {
    /// Allocate a zeroed bitmap, failing instead of aborting if memory runs out.
    pub fn try_alloc(info: ImageInfo) -> Result<Self, ReadPixelsError> {
        let row_bytes = info.min_row_bytes();
        let len = row_bytes * info.height as usize;
        let data = try_alloc_zeroed(len)?;
        let pixel_ref = PixelRef::from_pixels(info.width, info.height, info.format, row_bytes, data)
            .map_err(|_| ReadPixelsError::Allocation(len))?;
        Ok(Self::from_pixel_ref(info, pixel_ref))
    }

    /// Wrap `data`, which holds `info.height` rows of `row_bytes` bytes each.
    pub fn from_pixels(info: ImageInfo, row_bytes: usize, data: Vec<u8>) -> Result<Self> {
        let pixel_ref = PixelRef::from_pixels(info.width, info.height, info.format, row_bytes, data)?;
        Ok(Self::from_pixel_ref(info, pixel_ref))
    }

    /// View all of `pixel_ref`. The alpha type and color space are taken from `info`.
    pub fn from_pixel_ref(info: ImageInfo, pixel_ref: Arc<PixelRef>) -> Self {
        let info = ImageInfo {
            width: pixel_ref.width(),
            height: pixel_ref.height(),
            format: pixel_ref.format(),
            ..info
        };
        Self {
            info,
            pixel_ref,
            origin: (0, 0),
            volatile: false,
        }
    }

    /// A bitmap viewing `subset` of this one and sharing its pixels.
    ///
    /// Returns `None` if `subset` doesn't overlap this bitmap.
    pub fn extract_subset(&self, subset: IRect) -> Option<Self> {
        let bounds = IRect::from_xywh(0, 0, self.info.width, self.info.height);
        let subset = bounds.intersect(&subset)?;
        Some(Self {
            info: ImageInfo {
                width: subset.width,
                height: subset.height,
                ..self.info
            },
            pixel_ref: self.pixel_ref.clone(),
            origin: (
                self.origin.0 + subset.x as u32,
                self.origin.1 + subset.y as u32,
            ),
            volatile: self.volatile,
        })
    }

    pub fn pixel_ref(&self) -> &Arc<PixelRef> {
        &self.pixel_ref
    }

    /// Where this bitmap's top left pixel is in its pixel ref.
    pub fn pixel_ref_origin(&self) -> (u32, u32) {
        self.origin
    }

    pub fn set_volatile(&mut self, volatile: bool) {
        self.volatile = volatile;
    }

    pub fn set_immutable(&self) {
        self.pixel_ref.set_immutable();
    }

    pub fn is_immutable(&self) -> bool {
        self.pixel_ref.is_immutable()
    }

    /// Mutate the pixels of the whole underlying pixel ref.
    ///
    /// This invalidates every cached texture made from this pixel ref, including those made
    /// from other subsets of it.
    pub fn modify(&self, f: impl FnOnce(&mut [u8])) -> Result<GenerationId> {
        self.pixel_ref.modify(f)
    }

    /// A new immutable bitmap holding these pixels converted to `format`.
    pub fn copy_to(&self, format: PixelFormat) -> Result<Self, ReadPixelsError> {
        copy_to_format(self, format)
    }
}

fn try_alloc_zeroed(len: usize) -> Result<Vec<u8>, ReadPixelsError> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| ReadPixelsError::Allocation(len))?;
    data.resize(len, 0);
    Ok(data)
}

/// Read `source` into a new immutable bitmap in `format`.
pub(crate) fn copy_to_format<S: PixelSource + ?Sized>(
    source: &S,
    format: PixelFormat,
) -> Result<Bitmap, ReadPixelsError> {
    let info = source.info().with_format(format);
    let row_bytes = info.min_row_bytes();
    let len = info.byte_size(row_bytes);
    let mut data = try_alloc_zeroed(len)?;
    source.read_pixels(&info, &mut data, row_bytes)?;
    let pixel_ref = PixelRef::from_pixels(info.width, info.height, format, row_bytes, data)
        .map_err(|_| ReadPixelsError::Allocation(len))?;
    pixel_ref.set_immutable();
    Ok(Bitmap::from_pixel_ref(info, pixel_ref))
}

impl PixelSource for Bitmap {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn generation_id(&self) -> GenerationId {
        self.pixel_ref.generation_id()
    }

    fn subset(&self) -> IRect {
        IRect::from_xywh(
            self.origin.0 as i32,
            self.origin.1 as i32,
            self.info.width,
            self.info.height,
        )
    }

    fn is_volatile(&self) -> bool {
        self.volatile
    }

    fn pixmap(&self) -> Pixmap {
        let row_bytes = self.pixel_ref.row_bytes();
        Pixmap {
            info: self.info,
            data: self.pixel_ref.pixels(),
            offset: self.origin.1 as usize * row_bytes
                + self.origin.0 as usize * self.info.format.bytes_per_pixel(),
            row_bytes,
        }
    }

    fn add_invalidation_listener(&self, listener: InvalidationListener) {
        self.pixel_ref.add_invalidation_listener(listener);
    }
}
