// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A content-addressed cache of GPU textures made from CPU pixel sources.
//!
//! Textures are cached under a [`UniqueKey`] derived from the generation id of a source's pixels
//! and the subset of them it covers. Two sources which view the same pixels share one texture,
//! and mutating the pixels evicts every texture made from the old contents.
//!
//! A [`TextureMaker`] drives the process for one source:
//!
//! - When the [`Device`] can't sample the source's [`PixelFormat`], the pixels are converted to
//!   [`FALLBACK_FORMAT`] before upload.
//! - When a mipmapped texture is requested and only an unmipped one is cached, a mipmapped copy
//!   is made and takes over the key. If that fails, the unmipped texture is used instead.
//! - Resampled copies are cached under keys derived from the original key and the copy
//!   parameters, see [`TextureMaker::texture_for_params`].
//!
//! ```
//! use vello_texture_cache::{
//!     AllowedTexGen, Bitmap, CpuDevice, CpuDeviceOptions, Device, ImageInfo, Mipmapped, Outcome,
//!     PixelFormat, ResourceCache, TextureMaker, TextureMakerOptions,
//! };
//!
//! let device = CpuDevice::new(CpuDeviceOptions::default());
//! let cache = ResourceCache::new(device.context_id());
//! let info = ImageInfo::new(16, 16, PixelFormat::Rgba8);
//! let bitmap = Bitmap::from_pixels(info, 64, vec![0x80; 64 * 16])?;
//!
//! let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
//! let first = maker.acquire(Mipmapped::No, AllowedTexGen::Any)?;
//! assert_eq!(first.outcome, Outcome::Created);
//! let second = maker.acquire(Mipmapped::No, AllowedTexGen::Any)?;
//! assert_eq!(second.outcome, Outcome::Hit);
//! assert_eq!(first.texture, second.texture);
//! # Ok::<(), vello_texture_cache::Error>(())
//! ```
//!
//! ## Features
//!
//! - `wgpu`: Enables `wgpu_device::WgpuDevice`, a [`Device`] backed by wgpu.

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
// The following lints are part of the Linebender standard set,
// but resolving them has been deferred for now.
// Feel free to send a PR that solves one or more of these.
#![allow(missing_docs, reason = "We have many as-yet undocumented items.")]
#![allow(
    unreachable_pub,
    clippy::cast_possible_truncation,
    clippy::missing_assert_message,
    reason = "Deferred"
)]

mod bitmap;
mod device;
mod format;
mod invalidation;
mod key;
mod pixel_ref;
mod proxy;
mod resource_cache;
mod texture_maker;

pub mod cpu;
#[cfg(feature = "wgpu")]
pub mod wgpu_device;

/// Styling and composition primitives.
pub use peniko;
#[cfg(feature = "wgpu")]
pub use wgpu;

pub use bitmap::{Bitmap, IRect, PixelSource, Pixmap, ReadPixelsError};
pub use cpu::{CpuDevice, CpuDeviceOptions, CpuDeviceStats, CpuTexture};
pub use device::{Device, DeviceError};
pub use format::{
    negotiate, AlphaType, ColorSpace, FormatSupport, ImageInfo, NegotiatedFormat, PixelFormat,
    FALLBACK_FORMAT,
};
pub use invalidation::{ContextId, InvalidationListener, KeyInvalidated};
pub use key::{make_copy_key, make_key_from_image_id, CopyParams, Domain, Filter, UniqueKey};
pub use pixel_ref::{GenerationId, PixelRef};
pub use proxy::{
    mip_level_count, BackingFit, Mipmapped, Origin, ResourceId, TextureDescriptor, TextureProxy,
};
pub use resource_cache::{Probe, Reservation, ResourceCache};
pub use texture_maker::{
    Acquired, AllowedTexGen, Cached, Outcome, TextureMaker, TextureMakerOptions,
};

use thiserror::Error;

/// Errors that can occur while making textures.
///
/// None of these leave the cache in an inconsistent state. A caller which gets one can skip
/// whatever needed the texture and carry on.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Neither the source's format nor [`FALLBACK_FORMAT`] can be sampled by the device.
    #[error("Device can't sample {0:?} or the fallback format")]
    UnsupportedFormat(PixelFormat),
    /// Converting the source's pixels to the fallback format failed.
    #[error("Couldn't convert pixels")]
    PixelConversion(#[from] ReadPixelsError),
    /// The device failed to create or copy a texture.
    #[error("Device error")]
    Device(#[from] DeviceError),
    /// Only cached textures were allowed, and none matched the request.
    #[error("No cached texture, and generating one wasn't allowed")]
    ExpensiveGenerationDisallowed,
    /// Tried to modify pixels which were marked immutable.
    #[error("Pixels are immutable")]
    ImmutablePixels,
    #[error("Row stride of {row_bytes} bytes is less than the minimum of {min_row_bytes}")]
    InvalidRowBytes {
        row_bytes: usize,
        min_row_bytes: usize,
    },
    #[error("Pixel buffer of {actual} bytes is smaller than the {expected} bytes required")]
    PixelBufferTooSmall { expected: usize, actual: usize },
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

static_assertions::assert_impl_all!(ResourceCache<CpuTexture>: Send, Sync);
static_assertions::assert_impl_all!(PixelRef: Send, Sync);
static_assertions::assert_impl_all!(TextureProxy<CpuTexture>: Send, Sync, Clone);
