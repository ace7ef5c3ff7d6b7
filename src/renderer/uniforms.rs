// renderer/uniforms.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3, Vec4};

bitflags::bitflags! {
    /// Program toggles for one draw, mirrored as `FLAG_*` in the WGSL program.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DrawFlags: u32 {
        const LIGHTING = 1;
        const TEXTURE = 2;
        const GENERATED_TEX_COORDS = 4;
        const IGNORE_NORMAL = 8;
        const FLIP_NORMAL = 16;
    }
}

/// Per-draw uniform block. Matrices are column-major; the texture transform
/// is a 2D affine 3×3 held in the upper-left of a 4×4.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq)]
pub struct DrawUniforms {
    pub projection: [[f32; 4]; 4],
    pub model_view: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
    pub texture_transform: [[f32; 4]; 4],
    pub plane_s: [f32; 4],
    pub plane_t: [f32; 4],
    pub ambient_color: [f32; 4],
    /// rgb diffuse, alpha in w.
    pub diffuse_color: [f32; 4],
    /// rgb specular, shininess in w.
    pub specular_color: [f32; 4],
    pub flags: [u32; 4],
}

impl Default for DrawUniforms {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY.to_cols_array_2d(),
            model_view: Mat4::IDENTITY.to_cols_array_2d(),
            normal_matrix: Mat4::IDENTITY.to_cols_array_2d(),
            texture_transform: Mat4::IDENTITY.to_cols_array_2d(),
            plane_s: [1.0, 0.0, 0.0, 0.0],
            plane_t: [0.0, 1.0, 0.0, 0.0],
            ambient_color: [0.0; 4],
            diffuse_color: [1.0, 1.0, 1.0, 1.0],
            specular_color: [0.0, 0.0, 0.0, 1.0],
            flags: [0; 4],
        }
    }
}

impl DrawUniforms {
    pub fn set_projection(&mut self, projection: Mat4) {
        self.projection = projection.to_cols_array_2d();
    }

    pub fn set_model_view(&mut self, model_view: Mat4) {
        self.model_view = model_view.to_cols_array_2d();
    }

    pub fn set_normal_matrix(&mut self, normal_matrix: Mat3) {
        self.normal_matrix = Mat4::from_mat3(normal_matrix).to_cols_array_2d();
    }

    pub fn set_texture_transform(&mut self, transform: Mat3) {
        self.texture_transform = Mat4::from_mat3(transform).to_cols_array_2d();
    }

    pub fn set_planes(&mut self, plane_s: Vec4, plane_t: Vec4) {
        self.plane_s = plane_s.to_array();
        self.plane_t = plane_t.to_array();
    }

    pub fn set_ambient(&mut self, color: Vec3) {
        self.ambient_color = color.extend(0.0).to_array();
    }

    pub fn set_diffuse(&mut self, color: Vec3, alpha: f32) {
        self.diffuse_color = color.extend(alpha).to_array();
    }

    pub fn set_specular(&mut self, color: Vec3, shininess: f32) {
        self.specular_color = color.extend(shininess).to_array();
    }

    pub fn set_flags(&mut self, flags: DrawFlags) {
        self.flags[0] = flags.bits();
    }

    pub fn flags(&self) -> DrawFlags {
        DrawFlags::from_bits_truncate(self.flags[0])
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.projection)
    }

    pub fn model_view(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.model_view)
    }

    pub fn normal_matrix(&self) -> Mat3 {
        Mat3::from_mat4(Mat4::from_cols_array_2d(&self.normal_matrix))
    }

    pub fn texture_transform(&self) -> Mat3 {
        Mat3::from_mat4(Mat4::from_cols_array_2d(&self.texture_transform))
    }

    pub fn alpha(&self) -> f32 {
        self.diffuse_color[3]
    }
}
