// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use peniko::Blob;

use crate::format::PixelFormat;
use crate::invalidation::InvalidationListener;
use crate::{Error, Result};

/// Identifies one particular version of the contents of a [`PixelRef`].
///
/// Every mutation of a pixel ref moves it to a new, never before seen, generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct GenerationId(pub u64);

/// Shared, generation-tracked pixel storage.
///
/// Several [`Bitmap`](crate::Bitmap)s can view different subsets of one pixel ref.
/// The pixels themselves live in a [`Blob`], and the blob's id is the generation id: mutating
/// the pixels swaps in a new blob, so readers which cloned the old one keep seeing consistent
/// (old) contents.
pub struct PixelRef {
    width: u32,
    height: u32,
    format: PixelFormat,
    row_bytes: usize,
    pixels: RwLock<Blob<u8>>,
    immutable: AtomicBool,
    listeners: Mutex<Vec<InvalidationListener>>,
}

impl PixelRef {
    /// Wrap `data`, which holds `height` rows of `row_bytes` bytes each.
    pub fn from_pixels(
        width: u32,
        height: u32,
        format: PixelFormat,
        row_bytes: usize,
        data: Vec<u8>,
    ) -> Result<Arc<Self>> {
        let min_row_bytes = width as usize * format.bytes_per_pixel();
        if row_bytes < min_row_bytes {
            return Err(Error::InvalidRowBytes {
                row_bytes,
                min_row_bytes,
            });
        }
        let expected = row_bytes * height as usize;
        if data.len() < expected {
            return Err(Error::PixelBufferTooSmall {
                expected,
                actual: data.len(),
            });
        }
        Ok(Arc::new(Self {
            width,
            height,
            format,
            row_bytes,
            pixels: RwLock::new(Blob::from(data)),
            immutable: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn generation_id(&self) -> GenerationId {
        GenerationId(self.read().id())
    }

    /// A snapshot of the current pixels.
    ///
    /// The snapshot is unaffected by later mutations.
    pub fn pixels(&self) -> Blob<u8> {
        self.read().clone()
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable.load(Ordering::Acquire)
    }

    /// Forbid any further mutation. This can't be undone.
    pub fn set_immutable(&self) {
        self.immutable.store(true, Ordering::Release);
    }

    /// Mutate the pixels, returning the new generation id.
    ///
    /// Every invalidation listener registered against the previous generation fires.
    pub fn modify(&self, f: impl FnOnce(&mut [u8])) -> Result<GenerationId> {
        if self.is_immutable() {
            return Err(Error::ImmutablePixels);
        }
        let generation = {
            let mut pixels = self.pixels.write().unwrap_or_else(PoisonError::into_inner);
            let mut data = pixels.data().to_vec();
            f(&mut data);
            *pixels = Blob::from(data);
            GenerationId(pixels.id())
        };
        self.notify_pixels_changed(generation);
        Ok(generation)
    }

    /// Register `listener`, which fires once this pixel ref leaves the listener's generation.
    ///
    /// If that has already happened, the listener fires immediately.
    pub fn add_invalidation_listener(&self, listener: InvalidationListener) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        // Checked under the listener lock, which `notify_pixels_changed` also takes after
        // moving to a new generation, so a listener can't slip between the two.
        if listener.generation() != self.generation_id() {
            drop(listeners);
            listener.post();
            return;
        }
        if listeners.iter().any(|l| l.is_duplicate_of(&listener)) {
            return;
        }
        listeners.push(listener);
    }

    fn notify_pixels_changed(&self, current: GenerationId) {
        let stale = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            let (stale, live) = listeners
                .drain(..)
                .partition::<Vec<_>, _>(|l| l.generation() != current);
            *listeners = live;
            stale
        };
        if !stale.is_empty() {
            log::debug!(
                "Pixels moved to {current:?}, invalidating {} keys",
                stale.len()
            );
        }
        for listener in stale {
            listener.post();
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Blob<u8>> {
        self.pixels.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PixelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelRef")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("row_bytes", &self.row_bytes)
            .field("generation", &self.generation_id())
            .field("immutable", &self.is_immutable())
            .finish_non_exhaustive()
    }
}
