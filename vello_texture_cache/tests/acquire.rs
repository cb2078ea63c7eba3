// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Texture acquisition through a [`TextureMaker`] backed by a [`CpuDevice`].

use vello_texture_cache::{
    AllowedTexGen, Bitmap, Cached, ContextId, CopyParams, CpuDevice, CpuDeviceOptions, CpuTexture,
    Device, DeviceError, Error, Filter, FormatSupport, GenerationId, IRect, ImageInfo,
    InvalidationListener, Mipmapped, Origin, Outcome, PixelFormat, PixelSource, Pixmap,
    ResourceCache, TextureDescriptor, TextureMaker, TextureMakerOptions, TextureProxy,
};

fn setup(options: CpuDeviceOptions) -> (CpuDevice, ResourceCache<CpuTexture>) {
    let device = CpuDevice::new(options);
    let cache = ResourceCache::new(device.context_id());
    (device, cache)
}

fn rgba_gradient(width: u32, height: u32) -> Bitmap {
    let mut data = Vec::new();
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8, 0xff]);
        }
    }
    let info = ImageInfo::new(width, height, PixelFormat::Rgba8);
    Bitmap::from_pixels(info, width as usize * 4, data).unwrap()
}

fn rgb565_solid(width: u32, height: u32, pixel: u16) -> Bitmap {
    let data = pixel.to_le_bytes().repeat((width * height) as usize);
    let info = ImageInfo::new(width, height, PixelFormat::Rgb565);
    Bitmap::from_pixels(info, width as usize * 2, data).unwrap()
}

#[test]
fn unsupported_format_is_converted_and_cached() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    // Pure red.
    let bitmap = rgb565_solid(64, 64, 0xf800);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());

    let acquired = maker.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();
    assert_eq!(acquired.outcome, Outcome::Converted);
    let texture = acquired.texture;
    assert_eq!(texture.format(), PixelFormat::Rgba8);
    assert_eq!(texture.mipmapped(), Mipmapped::No);
    assert_eq!(texture.texture().read_pixel(0, 17, 42), Some([0xff, 0, 0, 0xff]));

    let key = maker.original_key().unwrap().clone();
    assert_eq!(cache.unique_key_of(&texture), Some(key.clone()));
    let found = cache
        .find_by_key(&key, PixelFormat::Rgba8, Origin::TopLeft)
        .unwrap();
    assert_eq!(found, texture);
    // The key is recorded against the converted format only.
    assert!(cache
        .find_by_key(&key, PixelFormat::Rgb565, Origin::TopLeft)
        .is_none());

    // The invalidation listener is in place.
    bitmap.modify(|pixels| pixels.fill(0)).unwrap();
    assert!(!cache.contains_key(&key));
}

#[test]
fn mipmapped_request_promotes_and_steals_the_key() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgb565_solid(64, 64, 0xf800);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    let key = maker.original_key().unwrap().clone();

    let base = maker
        .acquire(Mipmapped::No, AllowedTexGen::Any)
        .unwrap()
        .into_texture();
    let promoted = maker.acquire(Mipmapped::Yes, AllowedTexGen::Any).unwrap();
    assert_eq!(promoted.outcome, Outcome::Promoted);
    let mipped = promoted.texture;
    assert_ne!(mipped, base);
    assert_eq!(mipped.mipmapped(), Mipmapped::Yes);
    assert_eq!(mipped.texture().level_count(), 7);
    assert_eq!(mipped.texture().read_pixel(6, 0, 0), Some([0xff, 0, 0, 0xff]));

    assert_eq!(
        cache.find_by_key(&key, PixelFormat::Rgba8, Origin::TopLeft),
        Some(mipped.clone())
    );
    assert_eq!(cache.unique_key_of(&base), None);
    assert_eq!(cache.unique_key_of(&mipped), Some(key.clone()));
    assert_eq!(cache.len(), 1);

    // Both unmipped and mipped requests are now served by the promoted texture.
    let again = maker.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();
    assert_eq!(again.outcome, Outcome::Hit);
    assert_eq!(again.texture, mipped);
    assert_eq!(device.stats().uploads, 1);
    assert_eq!(device.stats().mip_copies, 1);

    // The invalidator was re-registered for the new holder of the key.
    drop(base);
    bitmap.modify(|pixels| pixels.fill(0xff)).unwrap();
    assert!(cache.is_empty());
}

#[test]
fn failed_promotion_degrades_to_the_unmipped_texture() {
    // Room for the 64x64 base level but not for a mipmapped copy next to it.
    let (device, cache) = setup(CpuDeviceOptions {
        memory_budget: Some(30_000),
        ..Default::default()
    });
    let bitmap = rgba_gradient(64, 64);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    let key = maker.original_key().unwrap().clone();

    let base = maker
        .acquire(Mipmapped::No, AllowedTexGen::Any)
        .unwrap()
        .into_texture();
    let degraded = maker.acquire(Mipmapped::Yes, AllowedTexGen::Any).unwrap();
    assert_eq!(degraded.outcome, Outcome::Degraded);
    assert_eq!(degraded.texture, base);
    assert_eq!(degraded.texture.mipmapped(), Mipmapped::No);
    assert_eq!(cache.unique_key_of(&base), Some(key));
    assert_eq!(device.stats().bytes_allocated, 64 * 64 * 4);
}

#[test]
fn mipmapped_request_without_a_cached_texture_creates_mips_directly() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgba_gradient(16, 8);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());

    let acquired = maker.acquire(Mipmapped::Yes, AllowedTexGen::Any).unwrap();
    assert_eq!(acquired.outcome, Outcome::Created);
    assert_eq!(acquired.texture.mipmapped(), Mipmapped::Yes);
    assert_eq!(acquired.texture.texture().level_count(), 5);
    assert_eq!(device.stats().mip_copies, 0);
}

#[test]
fn mipmapped_upload_without_mips_degrades() {
    // The CPU device can't filter float texels, so it uploads just the base level.
    let (device, cache) = setup(CpuDeviceOptions {
        supported_formats: vec![PixelFormat::Rgba8, PixelFormat::RgbaF32],
        ..Default::default()
    });
    let info = ImageInfo::new(16, 16, PixelFormat::RgbaF32);
    let bitmap = Bitmap::from_pixels(info, 16 * 16, vec![0; 16 * 16 * 16]).unwrap();
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    let key = maker.original_key().unwrap().clone();

    let degraded = maker.acquire(Mipmapped::Yes, AllowedTexGen::Any).unwrap();
    assert_eq!(degraded.outcome, Outcome::Degraded);
    assert_eq!(degraded.texture.mipmapped(), Mipmapped::No);
    assert_eq!(degraded.texture.format(), PixelFormat::RgbaF32);
    assert_eq!(cache.unique_key_of(&degraded.texture), Some(key));

    // The same request answers the same way once the unmipped texture is cached.
    let again = maker.acquire(Mipmapped::Yes, AllowedTexGen::Any).unwrap();
    assert_eq!(again.outcome, Outcome::Degraded);
    assert_eq!(again.texture, degraded.texture);
    assert_eq!(device.stats().uploads, 1);
}

/// Uploads only ever get a base level, but mipmapped copies work.
#[derive(Debug)]
struct BaseLevelUploads(CpuDevice);

impl FormatSupport for BaseLevelUploads {
    fn supports_sampling(&self, format: PixelFormat) -> bool {
        self.0.supports_sampling(format)
    }
}

impl Device for BaseLevelUploads {
    type Texture = CpuTexture;

    fn context_id(&self) -> ContextId {
        self.0.context_id()
    }

    fn create_texture(
        &self,
        desc: &TextureDescriptor,
        pixels: &Pixmap,
    ) -> Result<(CpuTexture, Mipmapped), DeviceError> {
        self.0
            .create_texture(&desc.with_mipmapped(Mipmapped::No), pixels)
    }

    fn copy_base_and_generate_mips(
        &self,
        src: &TextureProxy<CpuTexture>,
        desc: &TextureDescriptor,
    ) -> Result<CpuTexture, DeviceError> {
        self.0.copy_base_and_generate_mips(src, desc)
    }

    fn copy_for_params(
        &self,
        src: &TextureProxy<CpuTexture>,
        desc: &TextureDescriptor,
        filter: Filter,
    ) -> Result<CpuTexture, DeviceError> {
        self.0.copy_for_params(src, desc, filter)
    }
}

#[test]
fn unmipped_upload_for_a_mipped_request_is_promoted() {
    let device = BaseLevelUploads(CpuDevice::new(CpuDeviceOptions::default()));
    let cache = ResourceCache::new(device.context_id());
    let bitmap = rgba_gradient(16, 16);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    let key = maker.original_key().unwrap().clone();

    let promoted = maker.acquire(Mipmapped::Yes, AllowedTexGen::Any).unwrap();
    assert_eq!(promoted.outcome, Outcome::Promoted);
    let mipped = promoted.texture;
    assert_eq!(mipped.mipmapped(), Mipmapped::Yes);
    assert_eq!(mipped.texture().level_count(), 5);
    assert_eq!(cache.unique_key_of(&mipped), Some(key.clone()));
    assert_eq!(cache.len(), 1);
    let stats = device.0.stats();
    assert_eq!((stats.uploads, stats.mip_copies), (1, 1));

    let hit = maker.acquire(Mipmapped::Yes, AllowedTexGen::Any).unwrap();
    assert_eq!(hit.outcome, Outcome::Hit);
    assert_eq!(hit.texture, mipped);

    // The key follows the source to its next generation.
    bitmap.modify(|pixels| pixels.fill(0)).unwrap();
    assert!(!cache.contains_key(&key));
    assert_eq!(cache.unique_key_of(&mipped), None);
}

/// A source which never tells the cache about mutations.
struct Unobserved<'a>(&'a Bitmap);

impl PixelSource for Unobserved<'_> {
    fn info(&self) -> &ImageInfo {
        self.0.info()
    }

    fn generation_id(&self) -> GenerationId {
        self.0.generation_id()
    }

    fn subset(&self) -> IRect {
        self.0.subset()
    }

    fn is_volatile(&self) -> bool {
        self.0.is_volatile()
    }

    fn pixmap(&self) -> Pixmap {
        self.0.pixmap()
    }

    fn add_invalidation_listener(&self, _listener: InvalidationListener) {}
}

#[test]
fn pixels_changed_after_keying_are_not_cached() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgba_gradient(8, 8);
    let source = Unobserved(&bitmap);
    let maker = TextureMaker::new(&device, &cache, &source, TextureMakerOptions::default());
    bitmap.modify(|pixels| pixels.fill(9)).unwrap();

    let acquired = maker.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();
    assert_eq!(acquired.outcome, Outcome::Created);
    assert_eq!(acquired.texture.texture().read_pixel(0, 3, 3), Some([9, 9, 9, 9]));
    assert!(cache.is_empty());

    let params = CopyParams {
        filter: Filter::Nearest,
        width: 4,
        height: 4,
    };
    let copy = maker.texture_for_params(&params, AllowedTexGen::Any).unwrap();
    assert_eq!(copy.outcome, Outcome::Created);
    assert!(cache.is_empty());
}

#[test]
fn upload_round_trips_pixels() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgba_gradient(32, 16);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());

    let acquired = maker.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();
    assert_eq!(acquired.outcome, Outcome::Created);
    let packed = bitmap.pixmap().to_packed();
    assert_eq!(acquired.texture.texture().level(0), Some(packed.as_slice()));
}

#[test]
fn volatile_sources_are_never_cached() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let mut bitmap = rgba_gradient(8, 8);
    bitmap.set_volatile(true);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    assert!(maker.original_key().is_none());

    let first = maker.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();
    let second = maker.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();
    assert_eq!(first.outcome, Outcome::Created);
    assert_eq!(second.outcome, Outcome::Created);
    assert_ne!(first.texture, second.texture);
    assert!(cache.is_empty());
    assert_eq!(device.stats().uploads, 2);
}

#[test]
fn uncached_option_skips_the_cache() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgba_gradient(8, 8);
    let options = TextureMakerOptions {
        cached: Cached::No,
        ..Default::default()
    };
    let maker = TextureMaker::new(&device, &cache, &bitmap, options);
    assert!(maker.original_key().is_none());
    maker.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();
    assert!(cache.is_empty());
}

#[test]
fn cheap_acquisition_never_creates() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgb565_solid(16, 16, 0x07e0);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());

    assert!(matches!(
        maker.acquire(Mipmapped::No, AllowedTexGen::Cheap),
        Err(Error::ExpensiveGenerationDisallowed)
    ));
    assert_eq!(device.stats().uploads, 0);

    let created = maker
        .acquire(Mipmapped::No, AllowedTexGen::Any)
        .unwrap()
        .into_texture();
    let cheap = maker.acquire(Mipmapped::No, AllowedTexGen::Cheap).unwrap();
    assert_eq!(cheap.outcome, Outcome::Hit);
    assert_eq!(cheap.texture, created);

    // An unmipped texture doesn't satisfy a cheap mipmapped request, and isn't promoted.
    assert!(matches!(
        maker.acquire(Mipmapped::Yes, AllowedTexGen::Cheap),
        Err(Error::ExpensiveGenerationDisallowed)
    ));
    assert_eq!(device.stats().uploads, 1);
    assert_eq!(device.stats().mip_copies, 0);
}

#[test]
fn no_usable_format_is_an_error() {
    let (device, cache) = setup(CpuDeviceOptions {
        supported_formats: vec![PixelFormat::Bgra8],
        ..Default::default()
    });
    let bitmap = rgb565_solid(4, 4, 0);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    assert!(maker.negotiated_format().is_none());
    assert!(matches!(
        maker.acquire(Mipmapped::No, AllowedTexGen::Any),
        Err(Error::UnsupportedFormat(PixelFormat::Rgb565))
    ));
    assert_eq!(device.stats().uploads, 0);
}

#[test]
fn native_formats_are_uploaded_as_is() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let info = ImageInfo::new(4, 2, PixelFormat::Gray8);
    let bitmap = Bitmap::from_pixels(info, 4, vec![7; 8]).unwrap();
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    let acquired = maker.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();
    assert_eq!(acquired.outcome, Outcome::Created);
    assert_eq!(acquired.texture.format(), PixelFormat::Gray8);
    assert_eq!(acquired.texture.texture().read_pixel(0, 3, 1), Some([7, 7, 7, 0xff]));
}

#[test]
fn device_failure_leaves_the_key_free() {
    let (device, cache) = setup(CpuDeviceOptions {
        max_texture_dimension: 32,
        ..Default::default()
    });
    let bitmap = rgba_gradient(64, 64);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    for _ in 0..2 {
        // The second attempt would block if the first had left its reservation behind.
        assert!(matches!(
            maker.acquire(Mipmapped::No, AllowedTexGen::Any),
            Err(Error::Device(DeviceError::TooLarge { max: 32, .. }))
        ));
    }
    assert!(cache.is_empty());
}

#[test]
fn subsets_of_the_same_pixels_share_textures() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgba_gradient(32, 32);
    let left = bitmap.extract_subset(IRect::from_xywh(0, 0, 16, 32)).unwrap();
    let left_again = bitmap.extract_subset(IRect::from_xywh(0, 0, 16, 32)).unwrap();
    let right = bitmap.extract_subset(IRect::from_xywh(16, 0, 16, 32)).unwrap();

    let make = |source: &Bitmap| {
        TextureMaker::new(&device, &cache, source, TextureMakerOptions::default())
            .acquire(Mipmapped::No, AllowedTexGen::Any)
            .unwrap()
    };
    let a = make(&left);
    let b = make(&left_again);
    let c = make(&right);
    assert_eq!(a.outcome, Outcome::Created);
    assert_eq!(b.outcome, Outcome::Hit);
    assert_eq!(a.texture, b.texture);
    assert_eq!(c.outcome, Outcome::Created);
    assert_ne!(a.texture, c.texture);
    assert_eq!(c.texture.texture().read_pixel(0, 0, 0), Some([64, 0, 32, 0xff]));

    // Mutating the shared pixels evicts the textures of every subset.
    bitmap.modify(|pixels| pixels.fill(0)).unwrap();
    cache.purge_invalidated();
    assert!(cache.is_empty());
}

#[test]
fn mutation_gives_a_new_key() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgba_gradient(8, 8);
    let before = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    let old = before.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();

    bitmap.modify(|pixels| pixels[0] = 0x42).unwrap();
    let after = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    assert_ne!(before.original_key(), after.original_key());
    let new = after.acquire(Mipmapped::No, AllowedTexGen::Any).unwrap();
    assert_eq!(new.outcome, Outcome::Created);
    assert_ne!(old.texture, new.texture);
    assert_eq!(new.texture.texture().read_pixel(0, 0, 0), Some([0x42, 0, 0, 0xff]));
    assert_eq!(cache.len(), 1);
}

#[test]
fn immutable_bitmaps_reject_mutation() {
    let bitmap = rgba_gradient(2, 2);
    let generation = bitmap.generation_id();
    bitmap.set_immutable();
    assert!(matches!(
        bitmap.modify(|pixels| pixels.fill(0)),
        Err(Error::ImmutablePixels)
    ));
    assert_eq!(bitmap.generation_id(), generation);
}

#[test]
fn copies_are_cached_under_their_own_keys() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgba_gradient(32, 32);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    let bilinear = CopyParams {
        filter: Filter::Bilinear,
        width: 16,
        height: 16,
    };
    let mipmap = CopyParams {
        filter: Filter::MipMap,
        ..bilinear
    };

    let copy = maker
        .texture_for_params(&bilinear, AllowedTexGen::Any)
        .unwrap();
    assert_eq!(copy.outcome, Outcome::Created);
    assert_eq!((copy.texture.width(), copy.texture.height()), (16, 16));
    let copy_key = maker.copy_key(&bilinear).unwrap();
    assert_ne!(Some(&copy_key), maker.original_key());
    assert_eq!(cache.unique_key_of(&copy.texture), Some(copy_key));
    // The original was made on the way, and cached too.
    assert_eq!(cache.len(), 2);

    let again = maker
        .texture_for_params(&bilinear, AllowedTexGen::Cheap)
        .unwrap();
    assert_eq!(again.outcome, Outcome::Hit);
    assert_eq!(again.texture, copy.texture);

    let mipped = maker
        .texture_for_params(&mipmap, AllowedTexGen::Any)
        .unwrap();
    assert_eq!(mipped.texture.mipmapped(), Mipmapped::Yes);
    assert_ne!(mipped.texture, copy.texture);
    assert_eq!(cache.len(), 3);
    assert_eq!(device.stats().uploads, 1);
    assert_eq!(device.stats().param_copies, 2);

    // Copies go with the original when the source changes.
    bitmap.modify(|pixels| pixels.fill(0)).unwrap();
    cache.purge_invalidated();
    assert!(cache.is_empty());
}

#[test]
fn cheap_copy_requests_never_create() {
    let (device, cache) = setup(CpuDeviceOptions::default());
    let bitmap = rgba_gradient(8, 8);
    let maker = TextureMaker::new(&device, &cache, &bitmap, TextureMakerOptions::default());
    let params = CopyParams {
        filter: Filter::Nearest,
        width: 4,
        height: 4,
    };
    assert!(matches!(
        maker.texture_for_params(&params, AllowedTexGen::Cheap),
        Err(Error::ExpensiveGenerationDisallowed)
    ));
    assert_eq!(device.stats().uploads, 0);
    assert_eq!(device.stats().param_copies, 0);
}
