// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use thiserror::Error;

use crate::bitmap::Pixmap;
use crate::format::{FormatSupport, PixelFormat};
use crate::invalidation::ContextId;
use crate::key::Filter;
use crate::proxy::{Mipmapped, TextureDescriptor, TextureProxy};

/// Errors reported by a [`Device`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("Out of texture memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },
    #[error("Texture of {width}x{height} exceeds the maximum dimension of {max}")]
    TooLarge { width: u32, height: u32, max: u32 },
    #[error("Textures can't be empty")]
    Empty,
    #[error("Device can't use {0:?} textures for this operation")]
    UnsupportedFormat(PixelFormat),
    /// An error captured from a wgpu error scope.
    #[cfg(feature = "wgpu")]
    #[error("wgpu Error from scope")]
    Wgpu(#[from] wgpu::Error),
}

/// The GPU side of the cache: creates textures and copies between them.
///
/// Implementations block until the work is done or has failed.
pub trait Device: FormatSupport {
    type Texture: Send + Sync + 'static;

    /// The context textures from this device live in.
    fn context_id(&self) -> ContextId;

    /// Create a texture described by `desc` with `pixels` as its base level.
    ///
    /// `pixels` has the dimensions and format of `desc`. When `desc` asks for mips, the rest of
    /// the chain is generated from the base level. A device which can't generate mips for the
    /// format may create just the base level instead; the returned [`Mipmapped`] says which
    /// happened.
    fn create_texture(
        &self,
        desc: &TextureDescriptor,
        pixels: &Pixmap,
    ) -> Result<(Self::Texture, Mipmapped), DeviceError>;

    /// Create a mipmapped texture described by `desc`, copy the base level of `src` into it, and
    /// generate the remaining levels.
    fn copy_base_and_generate_mips(
        &self,
        src: &TextureProxy<Self::Texture>,
        desc: &TextureDescriptor,
    ) -> Result<Self::Texture, DeviceError>;

    /// Create a texture described by `desc` holding the base level of `src` resampled to the
    /// size of `desc` with `filter`.
    fn copy_for_params(
        &self,
        src: &TextureProxy<Self::Texture>,
        desc: &TextureDescriptor,
        filter: Filter,
    ) -> Result<Self::Texture, DeviceError>;
}
