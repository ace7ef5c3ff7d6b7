use image::RgbaImage;

use crate::scene::CullFace;

use super::error::RenderError;
use super::lights::LightsUniform;
use super::uniforms::DrawUniforms;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// Attribute streams uploaded for one geometry array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryBuffers {
    pub positions: BufferId,
    pub normals: Option<BufferId>,
    pub tex_coords: Option<BufferId>,
    pub vertex_count: u32,
}

impl GeometryBuffers {
    pub fn ids(&self) -> impl Iterator<Item = BufferId> {
        std::iter::once(self.positions)
            .chain(self.normals)
            .chain(self.tex_coords)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderMode {
    Triangles,
    Lines,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureSampling {
    /// Power-of-two: mipmaps, linear filtering, repeat wrapping.
    Mipmapped,
    /// Linear filtering, clamp-to-edge, single level.
    Clamped,
}

/// Where a frame goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderTarget {
    /// The presentable canvas.
    Canvas,
    /// Offscreen at canvas size, read back as RGBA.
    Image,
    /// Offscreen index buffer of the given size, read back as RGBA.
    Picking { width: u32, height: u32 },
}

impl RenderTarget {
    pub fn is_readable(&self) -> bool {
        !matches!(self, RenderTarget::Canvas)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DrawState {
    pub cull_face: CullFace,
    pub blend: bool,
    pub depth_test: bool,
}

/// One fully resolved draw.
#[derive(Clone, Copy, Debug)]
pub struct DrawCall {
    pub mode: RenderMode,
    pub buffers: GeometryBuffers,
    pub use_normals: bool,
    pub use_tex_coords: bool,
    pub texture: Option<TextureId>,
    pub uniforms: DrawUniforms,
    pub state: DrawState,
}

/// RGBA8 pixels read back from an offscreen target, rows bottom-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Readback {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Readback {
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y * self.width + x) * 4) as usize;
        let bytes = self.pixels.get(offset..offset + 4)?;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Converts to a top-down image.
    pub fn into_image(self) -> Option<RgbaImage> {
        let row = (self.width * 4) as usize;
        let mut flipped = Vec::with_capacity(self.pixels.len());
        for line in self.pixels.chunks_exact(row.max(1)).rev() {
            flipped.extend_from_slice(line);
        }
        RgbaImage::from_raw(self.width, self.height, flipped)
    }
}

/// GPU operations the canvas needs. A frame is `begin_frame`, any number of
/// `set_lights`/`draw`/`clear_depth` calls, then `end_frame`.
pub trait RenderBackend {
    /// Current canvas size in pixels.
    fn size(&self) -> (u32, u32);

    fn resize(&mut self, width: u32, height: u32);

    /// Uploads a flat float stream of `components` floats per vertex.
    fn create_buffer(&mut self, data: &[f32], components: u32) -> Result<BufferId, RenderError>;

    fn delete_buffer(&mut self, buffer: BufferId);

    fn create_texture(
        &mut self,
        image: &RgbaImage,
        sampling: TextureSampling,
    ) -> Result<TextureId, RenderError>;

    fn delete_texture(&mut self, texture: TextureId);

    fn begin_frame(&mut self, target: RenderTarget, clear_color: [f32; 4]) -> Result<(), RenderError>;

    fn set_lights(&mut self, lights: &LightsUniform);

    fn clear_depth(&mut self);

    fn draw(&mut self, call: &DrawCall);

    /// Finishes the frame; readable targets return their pixels.
    fn end_frame(&mut self) -> Result<Option<Readback>, RenderError>;

    /// Drops any offscreen picking target.
    fn release_picking_target(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readback_flips_rows_into_image() {
        let readback = Readback {
            width: 1,
            height: 2,
            pixels: vec![1, 1, 1, 255, 2, 2, 2, 255],
        };
        assert_eq!(readback.pixel(0, 1), Some([2, 2, 2, 255]));
        assert_eq!(readback.pixel(1, 0), None);
        let image = readback.into_image().unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [2, 2, 2, 255]);
        assert_eq!(image.get_pixel(0, 1).0, [1, 1, 1, 255]);
    }

    #[test]
    fn geometry_buffer_ids_skip_missing_streams() {
        let buffers = GeometryBuffers {
            positions: BufferId(1),
            normals: None,
            tex_coords: Some(BufferId(3)),
            vertex_count: 6,
        };
        assert_eq!(buffers.ids().collect::<Vec<_>>(), vec![BufferId(1), BufferId(3)]);
    }
}
