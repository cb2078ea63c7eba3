// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::format::PixelFormat;

/// Identity of a texture, unique for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceId(pub NonZeroU64);

impl ResourceId {
    pub fn next() -> Self {
        // We initialize with 1 so that the conversion below succeeds
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(NonZeroU64::new(ID_COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

/// Which row of the texture is stored first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Origin {
    #[default]
    TopLeft,
    BottomLeft,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Mipmapped {
    /// Only the base level.
    #[default]
    No,
    /// A full mip chain down to 1x1.
    Yes,
}

/// How closely the backing allocation matches the requested size.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum BackingFit {
    #[default]
    Exact,
    /// The backing may be larger, rounded to a size class so that it can be recycled.
    Approx,
}

impl BackingFit {
    /// The backing size for a requested dimension.
    pub fn backing_dimension(self, dim: u32) -> u32 {
        match self {
            Self::Exact => dim,
            Self::Approx => approx_dimension(dim),
        }
    }
}

/// Round up to a power of two, or above 1024 to the midpoint between two powers of two.
fn approx_dimension(dim: u32) -> u32 {
    const MIN_APPROX_SIZE: u32 = 16;
    const MAGIC_TOL: u32 = 1024;
    let dim = dim.max(MIN_APPROX_SIZE);
    let ceil = dim.next_power_of_two();
    if ceil <= MAGIC_TOL {
        return ceil;
    }
    let floor = ceil / 2;
    let mid = floor + floor / 2;
    if dim <= mid {
        mid
    } else {
        ceil
    }
}

/// Everything about a texture except its contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub origin: Origin,
    pub mipmapped: Mipmapped,
    pub fit: BackingFit,
}

impl TextureDescriptor {
    /// The number of levels, including the base level.
    pub fn mip_level_count(&self) -> u32 {
        match self.mipmapped {
            Mipmapped::No => 1,
            Mipmapped::Yes => mip_level_count(self.width, self.height),
        }
    }

    #[must_use]
    pub fn with_mipmapped(self, mipmapped: Mipmapped) -> Self {
        Self { mipmapped, ..self }
    }
}

/// Levels in a full mip chain for a `width` by `height` base level.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

struct ProxyInner<T> {
    id: ResourceId,
    desc: TextureDescriptor,
    texture: T,
}

/// A shared handle to a device texture.
///
/// Clones refer to the same texture, which lives until the last clone is dropped. Nothing in
/// this crate destroys a texture explicitly.
pub struct TextureProxy<T> {
    inner: Arc<ProxyInner<T>>,
}

impl<T> TextureProxy<T> {
    pub fn new(desc: TextureDescriptor, texture: T) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                id: ResourceId::next(),
                desc,
                texture,
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.inner.desc
    }

    pub fn width(&self) -> u32 {
        self.inner.desc.width
    }

    pub fn height(&self) -> u32 {
        self.inner.desc.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.desc.format
    }

    pub fn origin(&self) -> Origin {
        self.inner.desc.origin
    }

    pub fn mipmapped(&self) -> Mipmapped {
        self.inner.desc.mipmapped
    }

    /// The backend texture.
    pub fn texture(&self) -> &T {
        &self.inner.texture
    }

    /// Whether this texture can serve a request for `mipmapped`.
    pub fn satisfies(&self, mipmapped: Mipmapped) -> bool {
        mipmapped == Mipmapped::No || self.mipmapped() == Mipmapped::Yes
    }

    /// Number of live handles to this texture.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T> Clone for TextureProxy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for TextureProxy<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<T> Eq for TextureProxy<T> {}

impl<T> fmt::Debug for TextureProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureProxy")
            .field("id", &self.inner.id.0)
            .field("desc", &self.inner.desc)
            .finish_non_exhaustive()
    }
}
