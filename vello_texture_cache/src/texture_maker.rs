// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Turning pixel sources into (possibly cached) textures.

use crate::bitmap::{copy_to_format, Bitmap, PixelSource};
use crate::device::Device;
use crate::format::{negotiate, NegotiatedFormat};
use crate::key::{make_copy_key, make_key_from_image_id, CopyParams, UniqueKey};
use crate::pixel_ref::GenerationId;
use crate::proxy::{BackingFit, Mipmapped, Origin, TextureDescriptor, TextureProxy};
use crate::resource_cache::{Probe, ResourceCache, Reservation};
use crate::{Error, Result};

/// Whether textures made from a source may be cached.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Cached {
    No,
    #[default]
    Yes,
}

/// How much work an acquisition is allowed to do.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AllowedTexGen {
    /// Only return something already in the cache.
    Cheap,
    /// Upload, convert and generate mips as needed.
    #[default]
    Any,
}

/// Options for a [`TextureMaker`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TextureMakerOptions {
    pub cached: Cached,
    pub fit: BackingFit,
}

/// How an [`Acquired`] texture came to be.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    /// Found in the cache, nothing was created.
    Hit,
    /// Uploaded from the source's pixels as they are.
    Created,
    /// Uploaded after converting the source's pixels to the fallback format.
    Converted,
    /// A mipmapped copy of an unmipped texture, which took over its key.
    Promoted,
    /// Mips were requested but couldn't be generated; this is the unmipped texture.
    Degraded,
}

/// A texture produced by [`TextureMaker::acquire`].
#[derive(Debug)]
pub struct Acquired<T> {
    pub texture: TextureProxy<T>,
    pub outcome: Outcome,
}

impl<T> Acquired<T> {
    pub fn into_texture(self) -> TextureProxy<T> {
        self.texture
    }
}

/// Makes textures for one pixel source, reusing cached ones where possible.
///
/// The content key is computed once, when the maker is created. A source which is mutated
/// afterwards needs a new maker; until then its textures are made from the new pixels but not
/// cached.
pub struct TextureMaker<'a, S: PixelSource + ?Sized, D: Device + ?Sized> {
    device: &'a D,
    cache: &'a ResourceCache<D::Texture>,
    source: &'a S,
    negotiated: Option<NegotiatedFormat>,
    original_key: Option<UniqueKey>,
    generation: GenerationId,
    fit: BackingFit,
}

impl<'a, S: PixelSource + ?Sized, D: Device + ?Sized> TextureMaker<'a, S, D> {
    pub fn new(
        device: &'a D,
        cache: &'a ResourceCache<D::Texture>,
        source: &'a S,
        options: TextureMakerOptions,
    ) -> Self {
        let generation = source.generation_id();
        let original_key = (!source.is_volatile() && options.cached == Cached::Yes)
            .then(|| make_key_from_image_id(generation, source.subset()));
        let negotiated = negotiate(source.info().format, device).ok();
        Self {
            device,
            cache,
            source,
            negotiated,
            original_key,
            generation,
            fit: options.fit,
        }
    }

    /// The content key of the source, if its textures may be cached.
    pub fn original_key(&self) -> Option<&UniqueKey> {
        self.original_key.as_ref()
    }

    /// The format textures will be made in, if the device can take the source at all.
    pub fn negotiated_format(&self) -> Option<NegotiatedFormat> {
        self.negotiated
    }

    /// Get a texture holding the source's pixels.
    ///
    /// With `mipmapped` set to [`Mipmapped::Yes`], the texture has a full mip chain unless
    /// generating one failed, in which case the unmipped texture is returned as
    /// [`Outcome::Degraded`]. Errors mean no texture could be produced at all; callers should
    /// treat them as recoverable, e.g. by skipping the draw.
    pub fn acquire(
        &self,
        mipmapped: Mipmapped,
        allowed: AllowedTexGen,
    ) -> Result<Acquired<D::Texture>> {
        let negotiated = self.negotiated()?;
        if allowed == AllowedTexGen::Cheap {
            return self
                .find_cached(self.original_key.as_ref(), negotiated, mipmapped)
                .ok_or(Error::ExpensiveGenerationDisallowed);
        }

        let mut reservation = match &self.original_key {
            Some(key) => match self.cache.probe(
                key.clone(),
                negotiated.format,
                Origin::TopLeft,
                mipmapped,
            ) {
                Probe::Hit(texture) => {
                    return Ok(Acquired {
                        texture,
                        outcome: Outcome::Hit,
                    });
                }
                Probe::Reserved(reservation) => Some(reservation),
            },
            None => None,
        };

        let existing = reservation
            .as_ref()
            .and_then(Reservation::existing)
            .cloned();
        let texture = match existing {
            Some(existing) => existing,
            None => {
                let (texture, outcome) = self.create_texture(negotiated, mipmapped)?;
                if !self.source_unchanged() {
                    // The pixels read aren't the ones the key was derived from.
                    reservation = None;
                }
                if let Some(reservation) = &reservation {
                    reservation.assign(&texture);
                    self.install_invalidator(reservation.key());
                }
                if texture.satisfies(mipmapped) {
                    return Ok(Acquired { texture, outcome });
                }
                texture
            }
        };

        // Only an unmipped texture for a mipped request gets this far, either because the device
        // couldn't create it with mips or because it was cached without them.
        debug_assert_eq!(mipmapped, Mipmapped::Yes);
        debug_assert_eq!(texture.mipmapped(), Mipmapped::No);
        let desc = texture.descriptor().with_mipmapped(Mipmapped::Yes);
        match self.device.copy_base_and_generate_mips(&texture, &desc) {
            Ok(mipped) => {
                let mipped = TextureProxy::new(desc, mipped);
                // The unmipped texture stays alive for as long as anyone else holds it.
                if let Some(reservation) = &reservation {
                    if reservation.steal(&texture, &mipped) {
                        self.install_invalidator(reservation.key());
                    }
                }
                Ok(Acquired {
                    texture: mipped,
                    outcome: Outcome::Promoted,
                })
            }
            Err(err) => {
                log::warn!(
                    "Failed to generate mips for texture {:?}, using it unmipped: {err}",
                    texture.id()
                );
                Ok(Acquired {
                    texture,
                    outcome: Outcome::Degraded,
                })
            }
        }
    }

    /// The key a copy made with `params` is cached under.
    pub fn copy_key(&self, params: &CopyParams) -> Option<UniqueKey> {
        self.original_key
            .as_ref()
            .map(|key| make_copy_key(key, params))
    }

    /// Tie a cached copy's key to the source, so mutating the source evicts the copy along
    /// with the original.
    pub fn did_cache_copy(&self, copy_key: &UniqueKey) {
        self.install_invalidator(copy_key);
    }

    /// Get a copy of the source's texture resampled according to `params`.
    pub fn texture_for_params(
        &self,
        params: &CopyParams,
        allowed: AllowedTexGen,
    ) -> Result<Acquired<D::Texture>> {
        let negotiated = self.negotiated()?;
        let copy_key = self.copy_key(params);
        let mipmapped = params.mipmapped();
        if let Some(hit) = self.find_cached(copy_key.as_ref(), negotiated, mipmapped) {
            return Ok(hit);
        }
        if allowed == AllowedTexGen::Cheap {
            return Err(Error::ExpensiveGenerationDisallowed);
        }

        let original = self.acquire(Mipmapped::No, allowed)?.into_texture();
        let reservation = match copy_key {
            Some(key) => match self
                .cache
                .probe(key, negotiated.format, Origin::TopLeft, mipmapped)
            {
                Probe::Hit(texture) => {
                    return Ok(Acquired {
                        texture,
                        outcome: Outcome::Hit,
                    });
                }
                Probe::Reserved(reservation) => Some(reservation),
            },
            None => None,
        };

        let desc = TextureDescriptor {
            width: params.width,
            height: params.height,
            format: negotiated.format,
            origin: Origin::TopLeft,
            mipmapped,
            fit: BackingFit::Exact,
        };
        let copy = self
            .device
            .copy_for_params(&original, &desc, params.filter)?;
        let copy = TextureProxy::new(desc, copy);
        if let Some(reservation) = reservation.as_ref().filter(|_| self.source_unchanged()) {
            reservation.assign(&copy);
            self.did_cache_copy(reservation.key());
        }
        Ok(Acquired {
            texture: copy,
            outcome: Outcome::Created,
        })
    }

    fn negotiated(&self) -> Result<NegotiatedFormat> {
        self.negotiated
            .ok_or(Error::UnsupportedFormat(self.source.info().format))
    }

    fn find_cached(
        &self,
        key: Option<&UniqueKey>,
        negotiated: NegotiatedFormat,
        mipmapped: Mipmapped,
    ) -> Option<Acquired<D::Texture>> {
        let texture = self
            .cache
            .find_by_key(key?, negotiated.format, Origin::TopLeft)?;
        texture.satisfies(mipmapped).then_some(Acquired {
            texture,
            outcome: Outcome::Hit,
        })
    }

    fn create_texture(
        &self,
        negotiated: NegotiatedFormat,
        mipmapped: Mipmapped,
    ) -> Result<(TextureProxy<D::Texture>, Outcome)> {
        let info = self.source.info();
        let desc = TextureDescriptor {
            width: info.width,
            height: info.height,
            format: negotiated.format,
            origin: Origin::TopLeft,
            mipmapped,
            fit: self.fit,
        };
        let (pixmap, outcome) = if negotiated.needs_conversion {
            let converted = self.convert(negotiated)?;
            (converted.pixmap(), Outcome::Converted)
        } else {
            (self.source.pixmap(), Outcome::Created)
        };
        log::debug!(
            "Creating {}x{} {:?} texture ({:?}, {outcome:?})",
            desc.width,
            desc.height,
            desc.format,
            desc.mipmapped
        );
        let (texture, mipmapped) = self.device.create_texture(&desc, &pixmap)?;
        Ok((TextureProxy::new(desc.with_mipmapped(mipmapped), texture), outcome))
    }

    /// Whether the source still has the pixels the key was derived from.
    ///
    /// Generations never repeat, so pixels read before this returns `true` are the keyed ones.
    fn source_unchanged(&self) -> bool {
        self.source.generation_id() == self.generation
    }

    /// Copy the source's pixels into an immutable bitmap in the negotiated format.
    fn convert(&self, negotiated: NegotiatedFormat) -> Result<Bitmap> {
        Ok(copy_to_format(self.source, negotiated.format)?)
    }

    fn install_invalidator(&self, key: &UniqueKey) {
        self.cache
            .register_invalidation_listener(key.clone(), self.generation, self.source);
    }
}
