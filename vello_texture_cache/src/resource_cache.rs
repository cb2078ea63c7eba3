// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Key to texture associations for one device context.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::bitmap::PixelSource;
use crate::format::PixelFormat;
use crate::invalidation::{ContextId, InvalidationListener, KeyInvalidated};
use crate::key::UniqueKey;
use crate::pixel_ref::GenerationId;
use crate::proxy::{Mipmapped, Origin, ResourceId, TextureProxy};

/// Maps [`UniqueKey`]s to the textures holding their contents.
///
/// At most one texture is associated with a key at any time, and a texture holds at most one
/// key. The cache holds a reference to each keyed texture; it doesn't evict anything on its own.
///
/// The cache is shared between every thread making textures for its context. Lookups which may
/// end in creating a texture go through [`probe`](Self::probe), which makes sure only one
/// thread at a time does the work for a given key.
pub struct ResourceCache<T> {
    context: ContextId,
    state: Mutex<CacheState<T>>,
    /// Signalled whenever a key reservation is released.
    key_released: Condvar,
    /// Handed to invalidation listeners, which post into `CacheState::inbox`.
    invalidations: Sender<KeyInvalidated>,
}

struct CacheState<T> {
    by_key: HashMap<UniqueKey, TextureProxy<T>>,
    keys_by_resource: HashMap<ResourceId, UniqueKey>,
    /// Keys some thread is currently producing a texture for.
    pending: HashSet<UniqueKey>,
    inbox: Receiver<KeyInvalidated>,
}

/// Result of [`ResourceCache::probe`].
pub enum Probe<'a, T> {
    /// A texture which satisfies the request.
    Hit(TextureProxy<T>),
    /// Nothing suitable is cached and the caller is now responsible for the key.
    Reserved(Reservation<'a, T>),
}

impl<T> ResourceCache<T> {
    pub fn new(context: ContextId) -> Self {
        let (sender, inbox) = channel();
        Self {
            context,
            state: Mutex::new(CacheState {
                by_key: HashMap::new(),
                keys_by_resource: HashMap::new(),
                pending: HashSet::new(),
                inbox,
            }),
            key_released: Condvar::new(),
            invalidations: sender,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// The texture associated with `key`, if it has the given format and origin.
    pub fn find_by_key(
        &self,
        key: &UniqueKey,
        format: PixelFormat,
        origin: Origin,
    ) -> Option<TextureProxy<T>> {
        let state = self.lock();
        state
            .by_key
            .get(key)
            .filter(|texture| texture.format() == format && texture.origin() == origin)
            .cloned()
    }

    /// Find a texture for `key` which satisfies `mipmapped`, or reserve the key.
    ///
    /// While another thread holds the reservation for `key` and nothing cached satisfies the
    /// request, this blocks until that reservation is released and then looks again, so racing
    /// callers end up sharing the winner's texture.
    pub fn probe(
        &self,
        key: UniqueKey,
        format: PixelFormat,
        origin: Origin,
        mipmapped: Mipmapped,
    ) -> Probe<'_, T> {
        let mut state = self.lock();
        loop {
            let existing = state
                .by_key
                .get(&key)
                .filter(|texture| texture.format() == format && texture.origin() == origin);
            if let Some(texture) = existing {
                if texture.satisfies(mipmapped) {
                    log::trace!("Cache hit for {key:?}");
                    return Probe::Hit(texture.clone());
                }
            }
            if state.pending.contains(&key) {
                state = self
                    .key_released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                self.drain_invalidations(&mut state);
                continue;
            }
            let existing = existing.cloned();
            state.pending.insert(key.clone());
            return Probe::Reserved(Reservation {
                cache: self,
                key,
                existing,
            });
        }
    }

    /// Associate `key` with `texture`.
    ///
    /// Any texture previously associated with `key` loses it, and any key previously held by
    /// `texture` is dropped.
    pub fn assign_key(&self, key: UniqueKey, texture: &TextureProxy<T>) {
        let mut state = self.lock();
        state.assign(key, texture);
    }

    /// Remove the key held by `texture`, returning it.
    pub fn remove_key(&self, texture: &TextureProxy<T>) -> Option<UniqueKey> {
        let mut state = self.lock();
        let key = state.keys_by_resource.remove(&texture.id())?;
        state.by_key.remove(&key);
        Some(key)
    }

    pub fn unique_key_of(&self, texture: &TextureProxy<T>) -> Option<UniqueKey> {
        self.lock().keys_by_resource.get(&texture.id()).cloned()
    }

    pub fn contains_key(&self, key: &UniqueKey) -> bool {
        self.lock().by_key.contains_key(key)
    }

    /// The number of keyed textures.
    pub fn len(&self) -> usize {
        self.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arrange for `key` to be removed once `source` leaves `generation`.
    ///
    /// `generation` is the generation `key` was derived from. If the source has already moved
    /// on, the key is removed on the next access.
    pub fn register_invalidation_listener<S: PixelSource + ?Sized>(
        &self,
        key: UniqueKey,
        generation: GenerationId,
        source: &S,
    ) {
        source.add_invalidation_listener(InvalidationListener::new(
            key,
            self.context,
            generation,
            self.invalidations.clone(),
        ));
    }

    /// Remove keys whose sources have been mutated.
    ///
    /// This happens implicitly on every access; calling it lets the cache release invalidated
    /// textures sooner.
    pub fn purge_invalidated(&self) {
        drop(self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.drain_invalidations(&mut state);
        state
    }

    fn drain_invalidations(&self, state: &mut CacheState<T>) {
        while let Ok(message) = state.inbox.try_recv() {
            if message.context != self.context {
                continue;
            }
            if let Some(texture) = state.by_key.remove(&message.key) {
                log::debug!("Removing invalidated key {:?}", message.key);
                state.keys_by_resource.remove(&texture.id());
            }
        }
    }
}

impl<T> CacheState<T> {
    fn assign(&mut self, key: UniqueKey, texture: &TextureProxy<T>) {
        if let Some(old_key) = self.keys_by_resource.remove(&texture.id()) {
            self.by_key.remove(&old_key);
        }
        if let Some(previous) = self.by_key.insert(key.clone(), texture.clone()) {
            self.keys_by_resource.remove(&previous.id());
        }
        self.keys_by_resource.insert(texture.id(), key);
    }
}

impl<T> fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ResourceCache")
            .field("context", &self.context)
            .field("keys", &state.by_key.len())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

/// Exclusive responsibility for producing the texture of one key.
///
/// Other threads probing the same key wait until this is dropped.
pub struct Reservation<'a, T> {
    cache: &'a ResourceCache<T>,
    key: UniqueKey,
    existing: Option<TextureProxy<T>>,
}

impl<T> Reservation<'_, T> {
    pub fn key(&self) -> &UniqueKey {
        &self.key
    }

    /// A texture already holding the key which didn't satisfy the request.
    pub fn existing(&self) -> Option<&TextureProxy<T>> {
        self.existing.as_ref()
    }

    /// Associate the reserved key with `texture`.
    pub fn assign(&self, texture: &TextureProxy<T>) {
        log::debug!("Assigning {:?} to texture {:?}", self.key, texture.id());
        self.cache.lock().assign(self.key.clone(), texture);
    }

    /// Move the reserved key from `from` to `to`.
    ///
    /// The move is a single replacement under the cache lock, so lookups see either `from` or
    /// `to`. Returns `false`, changing nothing, if `from` doesn't hold the key anymore (for
    /// example because its source was mutated meanwhile).
    pub fn steal(&self, from: &TextureProxy<T>, to: &TextureProxy<T>) -> bool {
        let mut state = self.cache.lock();
        let holds_key = state
            .by_key
            .get(&self.key)
            .is_some_and(|current| current == from);
        if !holds_key {
            return false;
        }
        log::debug!(
            "Moving {:?} from texture {:?} to {:?}",
            self.key,
            from.id(),
            to.id()
        );
        state.assign(self.key.clone(), to);
        true
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        let mut state = self
            .cache
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.pending.remove(&self.key);
        drop(state);
        self.cache.key_released.notify_all();
    }
}
