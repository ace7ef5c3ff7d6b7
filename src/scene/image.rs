use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use image::RgbaImage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureImageId(u64);

impl TextureImageId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
enum ImageState {
    Loading,
    Loaded { pixels: RgbaImage, transparent: bool },
    Failed(String),
    /// Pixels were handed to the GPU and dropped.
    Released { width: u32, height: u32, transparent: bool },
}

/// Shareable texture source. Decoding may finish after the image is already
/// referenced by appearances; the renderer binds it once pixels arrive.
#[derive(Debug)]
pub struct TextureImage {
    id: TextureImageId,
    url: Option<String>,
    state: Mutex<ImageState>,
}

/// Snapshot of a texture image's load state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageStatus {
    Loading,
    Loaded,
    Failed,
    Released,
}

impl TextureImage {
    /// Wraps decoded pixels; transparency is detected from the alpha channel.
    pub fn from_rgba(pixels: RgbaImage) -> Arc<Self> {
        let transparent = has_translucent_pixels(&pixels);
        Self::with_state(None, ImageState::Loaded { pixels, transparent })
    }

    pub fn from_rgba_with_transparency(pixels: RgbaImage, transparent: bool) -> Arc<Self> {
        Self::with_state(None, ImageState::Loaded { pixels, transparent })
    }

    /// An image whose pixels will be supplied later with [`TextureImage::finish_loading`].
    pub fn loading(url: impl Into<String>) -> Arc<Self> {
        Self::with_state(Some(url.into()), ImageState::Loading)
    }

    /// Decodes a file. A decode failure yields a failed image rather than an
    /// error so the shape falls back to its plain color.
    pub fn open<P: AsRef<Path>>(path: P) -> Arc<Self> {
        let path = path.as_ref();
        let url = path.to_string_lossy().into_owned();
        let state = match image::open(path) {
            Ok(decoded) => {
                let pixels = decoded.to_rgba8();
                let transparent = has_translucent_pixels(&pixels);
                ImageState::Loaded { pixels, transparent }
            }
            Err(err) => {
                log::warn!("Failed to decode texture {}: {}", url, err);
                ImageState::Failed(err.to_string())
            }
        };
        Self::with_state(Some(url), state)
    }

    fn with_state(url: Option<String>, state: ImageState) -> Arc<Self> {
        Arc::new(Self {
            id: TextureImageId::next(),
            url,
            state: Mutex::new(state),
        })
    }

    pub fn id(&self) -> TextureImageId {
        self.id
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn finish_loading(&self, pixels: RgbaImage) {
        let transparent = has_translucent_pixels(&pixels);
        *self.lock() = ImageState::Loaded { pixels, transparent };
    }

    pub fn fail_loading(&self, reason: impl Into<String>) {
        *self.lock() = ImageState::Failed(reason.into());
    }

    pub fn status(&self) -> ImageStatus {
        match &*self.lock() {
            ImageState::Loading => ImageStatus::Loading,
            ImageState::Loaded { .. } => ImageStatus::Loaded,
            ImageState::Failed(_) => ImageStatus::Failed,
            ImageState::Released { .. } => ImageStatus::Released,
        }
    }

    /// Why decoding failed, for failed images.
    pub fn failure_reason(&self) -> Option<String> {
        match &*self.lock() {
            ImageState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn is_transparent(&self) -> bool {
        match &*self.lock() {
            ImageState::Loaded { transparent, .. } | ImageState::Released { transparent, .. } => {
                *transparent
            }
            ImageState::Loading | ImageState::Failed(_) => false,
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match &*self.lock() {
            ImageState::Loaded { pixels, .. } => Some(pixels.dimensions()),
            ImageState::Released { width, height, .. } => Some((*width, *height)),
            ImageState::Loading | ImageState::Failed(_) => None,
        }
    }

    /// Takes the decoded pixels out of the image, leaving only its
    /// dimensions behind.
    pub fn take_pixels(&self) -> Option<(RgbaImage, bool)> {
        let mut state = self.lock();
        let ImageState::Loaded { pixels, transparent } = &*state else {
            return None;
        };
        let (width, height) = pixels.dimensions();
        let transparent = *transparent;
        match std::mem::replace(
            &mut *state,
            ImageState::Released {
                width,
                height,
                transparent,
            },
        ) {
            ImageState::Loaded { pixels, .. } => Some((pixels, transparent)),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ImageState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn has_translucent_pixels(pixels: &RgbaImage) -> bool {
    pixels.pixels().any(|pixel| pixel[3] < u8::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn transparency_is_detected_from_alpha() {
        let opaque = TextureImage::from_rgba(RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255])));
        assert!(!opaque.is_transparent());

        let mut pixels = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255]));
        pixels.put_pixel(1, 1, Rgba([0, 0, 0, 10]));
        assert!(TextureImage::from_rgba(pixels).is_transparent());
    }

    #[test]
    fn taking_pixels_keeps_dimensions() {
        let image = TextureImage::from_rgba(RgbaImage::new(3, 5));
        let (pixels, _) = image.take_pixels().unwrap();
        assert_eq!(pixels.dimensions(), (3, 5));
        assert_eq!(image.status(), ImageStatus::Released);
        assert_eq!(image.dimensions(), Some((3, 5)));
        assert!(image.take_pixels().is_none());
    }

    #[test]
    fn loading_image_becomes_loaded() {
        let image = TextureImage::loading("wood.png");
        assert_eq!(image.status(), ImageStatus::Loading);
        assert_eq!(image.url(), Some("wood.png"));
        image.finish_loading(RgbaImage::new(4, 4));
        assert_eq!(image.status(), ImageStatus::Loaded);
        assert_eq!(image.failure_reason(), None);
    }

    #[test]
    fn failed_loading_keeps_its_reason() {
        let image = TextureImage::loading("bricks.png");
        image.fail_loading("truncated PNG stream");
        assert_eq!(image.status(), ImageStatus::Failed);
        assert_eq!(image.failure_reason().as_deref(), Some("truncated PNG stream"));
    }

    #[test]
    fn missing_file_yields_failed_image() {
        let image = TextureImage::open("does/not/exist.png");
        assert_eq!(image.status(), ImageStatus::Failed);
        assert!(image.failure_reason().is_some_and(|reason| !reason.is_empty()));
        assert!(image.take_pixels().is_none());
    }
}
