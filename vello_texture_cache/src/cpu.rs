// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A [`Device`] which keeps its textures in main memory.
//!
//! Useful where there is no GPU, and for inspecting exactly what the cache uploaded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bitmap::Pixmap;
use crate::device::{Device, DeviceError};
use crate::format::{FormatSupport, PixelFormat};
use crate::invalidation::ContextId;
use crate::key::Filter;
use crate::proxy::{Mipmapped, TextureDescriptor, TextureProxy};

#[derive(Clone, Debug)]
pub struct CpuDeviceOptions {
    /// Formats textures can be created in.
    pub supported_formats: Vec<PixelFormat>,
    /// The most texture memory that may be allocated at once, in bytes.
    pub memory_budget: Option<u64>,
    pub max_texture_dimension: u32,
}

impl Default for CpuDeviceOptions {
    fn default() -> Self {
        Self {
            supported_formats: vec![
                PixelFormat::Rgba8,
                PixelFormat::Bgra8,
                PixelFormat::Alpha8,
                PixelFormat::Gray8,
            ],
            memory_budget: None,
            max_texture_dimension: 8192,
        }
    }
}

/// Counts of the work a [`CpuDevice`] has done.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CpuDeviceStats {
    /// Textures created from CPU pixels.
    pub uploads: u64,
    /// Mipmapped copies made of existing textures.
    pub mip_copies: u64,
    /// Resampled copies made of existing textures.
    pub param_copies: u64,
    /// Texture memory currently allocated, in bytes.
    pub bytes_allocated: u64,
}

#[derive(Debug)]
pub struct CpuDevice {
    context: ContextId,
    options: CpuDeviceOptions,
    allocated: Arc<AtomicU64>,
    uploads: AtomicU64,
    mip_copies: AtomicU64,
    param_copies: AtomicU64,
}

impl CpuDevice {
    pub fn new(options: CpuDeviceOptions) -> Self {
        Self {
            context: ContextId::next(),
            options,
            allocated: Arc::new(AtomicU64::new(0)),
            uploads: AtomicU64::new(0),
            mip_copies: AtomicU64::new(0),
            param_copies: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &CpuDeviceOptions {
        &self.options
    }

    pub fn stats(&self) -> CpuDeviceStats {
        CpuDeviceStats {
            uploads: self.uploads.load(Ordering::Relaxed),
            mip_copies: self.mip_copies.load(Ordering::Relaxed),
            param_copies: self.param_copies.load(Ordering::Relaxed),
            bytes_allocated: self.allocated.load(Ordering::Relaxed),
        }
    }

    fn validate(&self, desc: &TextureDescriptor) -> Result<(), DeviceError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::Empty);
        }
        let max = self.options.max_texture_dimension;
        if desc.width > max || desc.height > max {
            return Err(DeviceError::TooLarge {
                width: desc.width,
                height: desc.height,
                max,
            });
        }
        if !self.supports_sampling(desc.format) {
            return Err(DeviceError::UnsupportedFormat(desc.format));
        }
        Ok(())
    }

    /// Like [`validate`](Self::validate), but mips must be possible too.
    fn validate_mipped(&self, desc: &TextureDescriptor) -> Result<(), DeviceError> {
        self.validate(desc)?;
        if desc.mipmapped == Mipmapped::Yes && !desc.format.has_byte_channels() {
            return Err(DeviceError::UnsupportedFormat(desc.format));
        }
        Ok(())
    }

    /// Charge the backing store of `desc` against the budget.
    fn allocate(&self, desc: &TextureDescriptor) -> Result<Allocation, DeviceError> {
        let requested = backing_size(desc);
        let budget = self.options.memory_budget.unwrap_or(u64::MAX);
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |allocated| {
                allocated
                    .checked_add(requested)
                    .filter(|total| *total <= budget)
            })
            .map_err(|_| DeviceError::OutOfMemory { requested })?;
        Ok(Allocation {
            bytes: requested,
            allocated: self.allocated.clone(),
        })
    }

    fn finish(
        &self,
        desc: &TextureDescriptor,
        base: Vec<u8>,
        allocation: Allocation,
    ) -> CpuTexture {
        let mut levels = vec![base];
        if desc.mipmapped == Mipmapped::Yes {
            let (mut width, mut height) = (desc.width, desc.height);
            for _ in 1..desc.mip_level_count() {
                let next = downsample(desc.format, &levels[levels.len() - 1], width, height);
                width = (width / 2).max(1);
                height = (height / 2).max(1);
                levels.push(next);
            }
        }
        CpuTexture {
            format: desc.format,
            width: desc.width,
            height: desc.height,
            levels,
            _allocation: allocation,
        }
    }
}

impl FormatSupport for CpuDevice {
    fn supports_sampling(&self, format: PixelFormat) -> bool {
        self.options.supported_formats.contains(&format)
    }
}

impl Device for CpuDevice {
    type Texture = CpuTexture;

    fn context_id(&self) -> ContextId {
        self.context
    }

    fn create_texture(
        &self,
        desc: &TextureDescriptor,
        pixels: &Pixmap,
    ) -> Result<(CpuTexture, Mipmapped), DeviceError> {
        self.validate(desc)?;
        let info = pixels.info();
        if info.format != desc.format {
            return Err(DeviceError::UnsupportedFormat(info.format));
        }
        debug_assert_eq!((info.width, info.height), (desc.width, desc.height));
        // The box filter only averages byte channels, other formats get just the base level.
        let desc = if desc.format.has_byte_channels() {
            *desc
        } else {
            desc.with_mipmapped(Mipmapped::No)
        };
        let allocation = self.allocate(&desc)?;
        self.uploads.fetch_add(1, Ordering::Relaxed);
        let texture = self.finish(&desc, pixels.to_packed(), allocation);
        Ok((texture, desc.mipmapped))
    }

    fn copy_base_and_generate_mips(
        &self,
        src: &TextureProxy<CpuTexture>,
        desc: &TextureDescriptor,
    ) -> Result<CpuTexture, DeviceError> {
        self.validate_mipped(desc)?;
        let allocation = self.allocate(desc)?;
        self.mip_copies.fetch_add(1, Ordering::Relaxed);
        Ok(self.finish(desc, src.texture().levels[0].clone(), allocation))
    }

    fn copy_for_params(
        &self,
        src: &TextureProxy<CpuTexture>,
        desc: &TextureDescriptor,
        filter: Filter,
    ) -> Result<CpuTexture, DeviceError> {
        self.validate_mipped(desc)?;
        let allocation = self.allocate(desc)?;
        self.param_copies.fetch_add(1, Ordering::Relaxed);
        let base = resample(src.texture(), desc.width, desc.height, filter);
        Ok(self.finish(desc, base, allocation))
    }
}

/// Returns the charged bytes to the device when dropped.
#[derive(Debug)]
struct Allocation {
    bytes: u64,
    allocated: Arc<AtomicU64>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// A texture held by a [`CpuDevice`].
#[derive(Debug)]
pub struct CpuTexture {
    format: PixelFormat,
    width: u32,
    height: u32,
    /// Tightly packed rows, base level first.
    levels: Vec<Vec<u8>>,
    _allocation: Allocation,
}

impl CpuTexture {
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Dimensions of mip level `level`.
    pub fn level_size(&self, level: usize) -> (u32, u32) {
        (
            (self.width >> level).max(1),
            (self.height >> level).max(1),
        )
    }

    pub fn level(&self, level: usize) -> Option<&[u8]> {
        self.levels.get(level).map(Vec::as_slice)
    }

    /// Decode one texel of `level` as RGBA8.
    pub fn read_pixel(&self, level: usize, x: u32, y: u32) -> Option<[u8; 4]> {
        let (width, height) = self.level_size(level);
        if x >= width || y >= height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let start = (y as usize * width as usize + x as usize) * bpp;
        let data = self.level(level)?;
        Some(self.format.load_rgba8(&data[start..start + bpp]))
    }
}

fn backing_size(desc: &TextureDescriptor) -> u64 {
    let width = desc.fit.backing_dimension(desc.width);
    let height = desc.fit.backing_dimension(desc.height);
    let bpp = desc.format.bytes_per_pixel() as u64;
    (0..desc.mip_level_count())
        .map(|level| {
            let w = u64::from((width >> level).max(1));
            let h = u64::from((height >> level).max(1));
            w * h * bpp
        })
        .sum()
}

/// A 2x2 box filter. Odd trailing rows and columns are folded into the last texel.
fn downsample(format: PixelFormat, src: &[u8], width: u32, height: u32) -> Vec<u8> {
    let bpp = format.bytes_per_pixel();
    let (dst_width, dst_height) = ((width / 2).max(1), (height / 2).max(1));
    let mut dst = vec![0; dst_width as usize * dst_height as usize * bpp];
    let texel = |x: u32, y: u32| {
        let start = (y.min(height - 1) as usize * width as usize + x.min(width - 1) as usize) * bpp;
        &src[start..start + bpp]
    };
    for y in 0..dst_height {
        for x in 0..dst_width {
            let quad = [
                texel(2 * x, 2 * y),
                texel(2 * x + 1, 2 * y),
                texel(2 * x, 2 * y + 1),
                texel(2 * x + 1, 2 * y + 1),
            ];
            let start = (y as usize * dst_width as usize + x as usize) * bpp;
            for (c, out) in dst[start..start + bpp].iter_mut().enumerate() {
                let sum: u32 = quad.iter().map(|t| u32::from(t[c])).sum();
                *out = ((sum + 2) / 4) as u8;
            }
        }
    }
    dst
}

/// Resample the base level of `src` to `width` by `height`.
fn resample(src: &CpuTexture, width: u32, height: u32, filter: Filter) -> Vec<u8> {
    let format = src.format;
    let bpp = format.bytes_per_pixel();
    let mut dst = vec![0; width as usize * height as usize * bpp];
    let scale_x = src.width as f32 / width as f32;
    let scale_y = src.height as f32 / height as f32;
    let texel = |x: i64, y: i64| -> [u8; 4] {
        let x = x.clamp(0, i64::from(src.width) - 1) as u32;
        let y = y.clamp(0, i64::from(src.height) - 1) as u32;
        src.read_pixel(0, x, y).unwrap_or_default()
    };
    for y in 0..height {
        for x in 0..width {
            // Sample at texel centers.
            let sx = (x as f32 + 0.5) * scale_x;
            let sy = (y as f32 + 0.5) * scale_y;
            let rgba = match filter {
                Filter::Nearest => texel(sx.floor() as i64, sy.floor() as i64),
                Filter::Bilinear | Filter::MipMap => {
                    let (fx, fy) = (sx - 0.5, sy - 0.5);
                    let (x0, y0) = (fx.floor(), fy.floor());
                    let (tx, ty) = (fx - x0, fy - y0);
                    let (x0, y0) = (x0 as i64, y0 as i64);
                    let corners = [
                        (texel(x0, y0), (1.0 - tx) * (1.0 - ty)),
                        (texel(x0 + 1, y0), tx * (1.0 - ty)),
                        (texel(x0, y0 + 1), (1.0 - tx) * ty),
                        (texel(x0 + 1, y0 + 1), tx * ty),
                    ];
                    let mut out = [0_u8; 4];
                    for (c, channel) in out.iter_mut().enumerate() {
                        let v: f32 = corners
                            .iter()
                            .map(|(t, weight)| f32::from(t[c]) * weight)
                            .sum();
                        *channel = v.round().clamp(0.0, 255.0) as u8;
                    }
                    out
                }
            };
            let start = (y as usize * width as usize + x as usize) * bpp;
            format.store_rgba8(rgba, &mut dst[start..start + bpp]);
        }
    }
    dst
}
