// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Content keys for cached textures.
//!
//! A [`UniqueKey`] identifies the *contents* of a texture rather than the texture itself.
//! Two textures created from sources with equal keys hold identical pixels, which is what
//! allows the [`ResourceCache`](crate::ResourceCache) to hand out one texture for both.
//!
//! There is no "invalid" key: code which may or may not have a key uses
//! `Option<UniqueKey>`, with `None` meaning the result must not be cached.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use smallvec::SmallVec;

use crate::bitmap::IRect;
use crate::pixel_ref::GenerationId;

/// A namespace for [`UniqueKey`]s.
///
/// Keys from different domains never compare equal, even if their data words do.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Domain(u32);

impl Domain {
    /// Keys derived from a pixel source's generation id and subset.
    pub const IMAGE: Self = Self(1);
    /// Keys derived from another key plus [`CopyParams`].
    pub const COPY: Self = Self(2);

    /// Allocate a fresh domain for keys which don't come from this crate.
    pub fn next() -> Self {
        // Leave room for the builtin domains above.
        static DOMAIN_COUNTER: AtomicU32 = AtomicU32::new(16);
        Self(DOMAIN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A deterministic identifier for the contents of a texture.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UniqueKey {
    domain: Domain,
    data: SmallVec<[u32; 8]>,
}

impl UniqueKey {
    /// Build a key from raw data words in the given domain.
    pub fn new(domain: Domain, data: &[u32]) -> Self {
        Self {
            domain,
            data: SmallVec::from_slice(data),
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn data(&self) -> &[u32] {
        &self.data
    }
}

impl fmt::Debug for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueKey({}:{:?})", self.domain.0, self.data.as_slice())
    }
}

/// Derive the content key of `subset` of the pixels at `generation`.
///
/// The subset is part of the key because several sources can share one underlying buffer
/// while looking at different rectangles of it.
pub fn make_key_from_image_id(generation: GenerationId, subset: IRect) -> UniqueKey {
    let id = generation.0;
    UniqueKey::new(
        Domain::IMAGE,
        &[
            id as u32,
            (id >> 32) as u32,
            subset.x as u32,
            subset.y as u32,
            subset.width,
            subset.height,
        ],
    )
}

/// How a copy of a texture is sampled from its original.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Filter {
    Nearest,
    Bilinear,
    /// Bilinear, and the copy gets a full mip chain.
    MipMap,
}

/// Describes a derived variant of a texture, such as a resized or refiltered copy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CopyParams {
    pub filter: Filter,
    pub width: u32,
    pub height: u32,
}

impl CopyParams {
    pub fn mipmapped(&self) -> crate::Mipmapped {
        match self.filter {
            Filter::MipMap => crate::Mipmapped::Yes,
            Filter::Nearest | Filter::Bilinear => crate::Mipmapped::No,
        }
    }
}

/// Derive the key of a copy of the texture keyed by `original`.
pub fn make_copy_key(original: &UniqueKey, params: &CopyParams) -> UniqueKey {
    let mut data: SmallVec<[u32; 8]> = SmallVec::with_capacity(original.data.len() + 4);
    data.push(original.domain.0);
    data.extend_from_slice(&original.data);
    data.push(params.filter as u32);
    data.push(params.width);
    data.push(params.height);
    UniqueKey {
        domain: Domain::COPY,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: i32, y: i32, width: u32, height: u32) -> IRect {
        IRect {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn image_keys_are_deterministic() {
        let a = make_key_from_image_id(GenerationId(7), rect(0, 0, 64, 64));
        let b = make_key_from_image_id(GenerationId(7), rect(0, 0, 64, 64));
        assert_eq!(a, b);
        assert_eq!(a.domain(), Domain::IMAGE);
    }

    #[test]
    fn image_keys_depend_on_subset_and_generation() {
        let base = make_key_from_image_id(GenerationId(7), rect(0, 0, 64, 64));
        assert_ne!(
            base,
            make_key_from_image_id(GenerationId(8), rect(0, 0, 64, 64))
        );
        assert_ne!(
            base,
            make_key_from_image_id(GenerationId(7), rect(32, 0, 32, 64))
        );
        // The high half of the generation id must not be dropped.
        assert_ne!(
            base,
            make_key_from_image_id(GenerationId(7 | (1 << 40)), rect(0, 0, 64, 64))
        );
    }

    #[test]
    fn copy_keys_depend_on_params() {
        let original = make_key_from_image_id(GenerationId(3), rect(0, 0, 10, 10));
        let params = CopyParams {
            filter: Filter::Bilinear,
            width: 16,
            height: 16,
        };
        let copy = make_copy_key(&original, &params);
        assert_eq!(copy, make_copy_key(&original, &params));
        assert_eq!(copy.domain(), Domain::COPY);
        assert_ne!(copy, original);

        let nearest = CopyParams {
            filter: Filter::Nearest,
            ..params
        };
        assert_ne!(copy, make_copy_key(&original, &nearest));

        let other = make_key_from_image_id(GenerationId(4), rect(0, 0, 10, 10));
        assert_ne!(copy, make_copy_key(&other, &params));
    }

    #[test]
    fn domains_separate_equal_data() {
        let a = UniqueKey::new(Domain::next(), &[1, 2, 3]);
        let b = UniqueKey::new(Domain::next(), &[1, 2, 3]);
        assert_ne!(a, b);
    }
}
