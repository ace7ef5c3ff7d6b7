use std::collections::HashMap;
use std::sync::Arc;

use image::{imageops, Rgba, RgbaImage};

use crate::scene::{ImageStatus, TextureImage, TextureImageId};

use super::backend::{RenderBackend, TextureId, TextureSampling};

/// Scales non-power-of-two images up to the next power of two (unless the
/// image is transparent and `resize_transparent` is off) and picks sampling.
pub fn prepare_upload(
    image: RgbaImage,
    transparent: bool,
    resize_transparent: bool,
) -> (RgbaImage, TextureSampling) {
    let (width, height) = image.dimensions();
    let power_of_two = width.is_power_of_two() && height.is_power_of_two();
    let image = if !power_of_two && (!transparent || resize_transparent) {
        let (w, h) = (width.next_power_of_two(), height.next_power_of_two());
        log::debug!("Resizing {}x{} texture to {}x{}", width, height, w, h);
        imageops::resize(&image, w, h, imageops::FilterType::Triangle)
    } else {
        image
    };
    let sampling = if image.width().is_power_of_two() && image.height().is_power_of_two() {
        TextureSampling::Mipmapped
    } else {
        TextureSampling::Clamped
    };
    (image, sampling)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum TextureKey {
    Url(String),
    Image(TextureImageId),
}

impl TextureKey {
    fn of(image: &TextureImage) -> Self {
        match image.url() {
            Some(url) => TextureKey::Url(url.to_owned()),
            None => TextureKey::Image(image.id()),
        }
    }
}

enum TextureEntry {
    Pending(Arc<TextureImage>),
    Bound(TextureId),
    /// Decode failed or pixels are gone; draws fall back to the diffuse color.
    Untextured,
}

/// Backend textures deduplicated by image URL or identity.
#[derive(Default)]
pub struct TextureCache {
    entries: HashMap<TextureKey, TextureEntry>,
    error_texture: Option<TextureId>,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Backend texture for `image`, uploading on first use. `None` means the
    /// draw goes untextured for now.
    pub fn resolve<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        image: &Arc<TextureImage>,
        resize_transparent: bool,
    ) -> Option<TextureId> {
        let key = TextureKey::of(image);
        match self.entries.get(&key) {
            Some(TextureEntry::Bound(texture)) => return Some(*texture),
            Some(TextureEntry::Untextured) => return None,
            Some(TextureEntry::Pending(_)) | None => {}
        }

        let entry = match image.status() {
            ImageStatus::Loading => TextureEntry::Pending(Arc::clone(image)),
            ImageStatus::Failed => {
                log::warn!(
                    "Texture {:?} failed to load ({}), drawing untextured",
                    key,
                    image.failure_reason().unwrap_or_default()
                );
                TextureEntry::Untextured
            }
            ImageStatus::Released => {
                log::warn!("Texture {:?} pixels were already released", key);
                TextureEntry::Untextured
            }
            ImageStatus::Loaded => match image.take_pixels() {
                Some((pixels, transparent)) => {
                    let (pixels, sampling) = prepare_upload(pixels, transparent, resize_transparent);
                    match backend.create_texture(&pixels, sampling) {
                        Ok(texture) => {
                            log::debug!(
                                "Uploaded texture {:?} ({}x{}, {:?})",
                                key,
                                pixels.width(),
                                pixels.height(),
                                sampling
                            );
                            TextureEntry::Bound(texture)
                        }
                        Err(err) => {
                            log::warn!("Texture {:?} upload failed: {}", key, err);
                            match self.error_texture(backend) {
                                Some(texture) => TextureEntry::Bound(texture),
                                None => TextureEntry::Untextured,
                            }
                        }
                    }
                }
                None => TextureEntry::Untextured,
            },
        };
        let texture = match &entry {
            TextureEntry::Bound(texture) => Some(*texture),
            _ => None,
        };
        self.entries.insert(key, entry);
        texture
    }

    /// False while any referenced image is still decoding.
    pub fn is_loading_completed(&self) -> bool {
        self.entries.values().all(|entry| match entry {
            TextureEntry::Pending(image) => image.status() != ImageStatus::Loading,
            _ => true,
        })
    }

    /// Deletes every texture, including the error texture.
    pub fn clear<B: RenderBackend>(&mut self, backend: &mut B) {
        let mut deleted = Vec::new();
        for (_, entry) in self.entries.drain() {
            if let TextureEntry::Bound(texture) = entry {
                if Some(texture) != self.error_texture && !deleted.contains(&texture) {
                    deleted.push(texture);
                }
            }
        }
        deleted.extend(self.error_texture.take());
        for texture in &deleted {
            backend.delete_texture(*texture);
        }
        log::debug!("Released {} textures", deleted.len());
    }

    fn error_texture<B: RenderBackend>(&mut self, backend: &mut B) -> Option<TextureId> {
        if self.error_texture.is_none() {
            let red = RgbaImage::from_pixel(1, 1, Rgba([255, 0, 0, 255]));
            match backend.create_texture(&red, TextureSampling::Mipmapped) {
                Ok(texture) => self.error_texture = Some(texture),
                Err(err) => log::warn!("Error texture upload failed: {}", err),
            }
        }
        self.error_texture
    }
}
