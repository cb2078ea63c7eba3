// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Invalidation of cached keys when the pixels they were derived from change.
//!
//! Listeners are registered on a [`PixelRef`](crate::PixelRef) against the generation id the
//! key was derived from. Once the pixel ref moves to a new generation, every listener for an
//! older one posts a [`KeyInvalidated`] message to the inbox of the cache that registered it.
//! Caches drain their inbox before looking anything up, so a mutated source is never served
//! stale pixels.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::Sender;

use crate::key::UniqueKey;
use crate::pixel_ref::GenerationId;

/// Identifies the device context (and thus the cache) a key lives in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContextId(NonZeroU32);

impl ContextId {
    pub fn next() -> Self {
        // We initialize with 1 so that the conversion below succeeds
        static ID_COUNTER: AtomicU32 = AtomicU32::new(1);
        Self(NonZeroU32::new(ID_COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

/// Message posted to a cache when one of its keys no longer describes current pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyInvalidated {
    pub key: UniqueKey,
    pub context: ContextId,
}

/// A registration binding a key in one context to a generation of some pixels.
#[derive(Debug)]
pub struct InvalidationListener {
    key: UniqueKey,
    context: ContextId,
    generation: GenerationId,
    inbox: Sender<KeyInvalidated>,
}

impl InvalidationListener {
    pub(crate) fn new(
        key: UniqueKey,
        context: ContextId,
        generation: GenerationId,
        inbox: Sender<KeyInvalidated>,
    ) -> Self {
        Self {
            key,
            context,
            generation,
            inbox,
        }
    }

    pub fn key(&self) -> &UniqueKey {
        &self.key
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// The generation of the pixels the key was derived from.
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// Whether `other` would post the same message for the same generation.
    pub(crate) fn is_duplicate_of(&self, other: &Self) -> bool {
        self.generation == other.generation
            && self.context == other.context
            && self.key == other.key
    }

    /// Post the invalidation. A cache which has since been dropped is ignored.
    pub(crate) fn post(self) {
        log::trace!("Invalidating {:?} in {:?}", self.key, self.context);
        let _ = self.inbox.send(KeyInvalidated {
            key: self.key,
            context: self.context,
        });
    }
}
