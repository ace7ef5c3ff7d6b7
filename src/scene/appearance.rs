use std::sync::Arc;

use glam::{Mat3, Vec3, Vec4};

use super::image::TextureImage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CullFace {
    None,
    Back,
    Front,
}

/// Two object-space planes dotted with the vertex position to produce `(s, t)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TexCoordGeneration {
    pub plane_s: Vec4,
    pub plane_t: Vec4,
}

impl TexCoordGeneration {
    pub fn new(plane_s: Vec4, plane_t: Vec4) -> Self {
        Self { plane_s, plane_t }
    }
}

/// Material description shared by any number of shapes.
///
/// `None` colors mean "not set": an unset diffuse color renders white and an
/// unset specular color disables highlights.
#[derive(Clone, Debug)]
pub struct Appearance {
    pub ambient_color: Option<Vec3>,
    pub diffuse_color: Option<Vec3>,
    pub specular_color: Option<Vec3>,
    pub shininess: Option<f32>,
    /// 0 is opaque, 1 fully transparent.
    pub transparency: Option<f32>,
    /// 0 disables lighting for the shapes using this appearance.
    pub illumination: Option<u32>,
    pub texture_image: Option<Arc<TextureImage>>,
    pub texture_coordinates_generation: Option<TexCoordGeneration>,
    pub texture_transform: Option<Mat3>,
    pub visible: bool,
    pub cull_face: Option<CullFace>,
    pub back_face_normal_flip: bool,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            ambient_color: None,
            diffuse_color: None,
            specular_color: None,
            shininess: None,
            transparency: None,
            illumination: None,
            texture_image: None,
            texture_coordinates_generation: None,
            texture_transform: None,
            visible: true,
            cull_face: None,
            back_face_normal_flip: false,
        }
    }
}

impl Appearance {
    pub fn with_diffuse_color(mut self, color: Vec3) -> Self {
        self.diffuse_color = Some(color);
        self
    }

    pub fn with_ambient_color(mut self, color: Vec3) -> Self {
        self.ambient_color = Some(color);
        self
    }

    pub fn with_specular(mut self, color: Vec3, shininess: f32) -> Self {
        self.specular_color = Some(color);
        self.shininess = Some(shininess.max(1.0));
        self
    }

    pub fn with_transparency(mut self, transparency: f32) -> Self {
        self.transparency = Some(transparency);
        self
    }

    pub fn with_texture(mut self, image: Arc<TextureImage>) -> Self {
        self.texture_image = Some(image);
        self
    }

    pub fn with_cull_face(mut self, cull_face: CullFace) -> Self {
        self.cull_face = Some(cull_face);
        self
    }

    /// Applies `change`, returning false when it leaves the appearance as it was
    /// and should not be broadcast.
    pub(crate) fn apply(&mut self, change: &AppearanceChange) -> bool {
        match change {
            AppearanceChange::AmbientColor(color) => self.ambient_color = *color,
            AppearanceChange::DiffuseColor(color) => self.diffuse_color = *color,
            AppearanceChange::SpecularColor(color) => self.specular_color = *color,
            AppearanceChange::Shininess(shininess) => {
                self.shininess = shininess.map(|s| s.max(1.0));
            }
            AppearanceChange::Transparency(transparency) => self.transparency = *transparency,
            AppearanceChange::Illumination(illumination) => self.illumination = *illumination,
            AppearanceChange::TextureImage(image) => {
                let same = match (&self.texture_image, image) {
                    (Some(current), Some(new)) => Arc::ptr_eq(current, new),
                    (None, None) => true,
                    _ => false,
                };
                if same {
                    return false;
                }
                self.texture_image = image.clone();
            }
            AppearanceChange::TextureCoordinatesGeneration(generation) => {
                if self.texture_coordinates_generation == *generation {
                    return false;
                }
                self.texture_coordinates_generation = *generation;
            }
            AppearanceChange::TextureTransform(transform) => {
                if self.texture_transform == *transform {
                    return false;
                }
                self.texture_transform = *transform;
            }
            AppearanceChange::Visible(visible) => self.visible = *visible,
            AppearanceChange::CullFace(cull_face) => self.cull_face = *cull_face,
            AppearanceChange::BackFaceNormalFlip(flip) => self.back_face_normal_flip = *flip,
        }
        true
    }
}

/// One appearance setter, carrying the new value.
#[derive(Clone, Debug)]
pub enum AppearanceChange {
    AmbientColor(Option<Vec3>),
    DiffuseColor(Option<Vec3>),
    SpecularColor(Option<Vec3>),
    Shininess(Option<f32>),
    Transparency(Option<f32>),
    Illumination(Option<u32>),
    TextureImage(Option<Arc<TextureImage>>),
    TextureCoordinatesGeneration(Option<TexCoordGeneration>),
    TextureTransform(Option<Mat3>),
    Visible(bool),
    CullFace(Option<CullFace>),
    BackFaceNormalFlip(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shininess_is_clamped_to_one() {
        let mut appearance = Appearance::default();
        assert!(appearance.apply(&AppearanceChange::Shininess(Some(0.2))));
        assert_eq!(appearance.shininess, Some(1.0));
        assert_eq!(Appearance::default().with_specular(Vec3::ONE, 0.0).shininess, Some(1.0));
    }

    #[test]
    fn unchanged_texture_transform_is_not_broadcast() {
        let mut appearance = Appearance::default();
        let transform = Some(Mat3::from_scale(glam::Vec2::splat(2.0)));
        assert!(appearance.apply(&AppearanceChange::TextureTransform(transform)));
        assert!(!appearance.apply(&AppearanceChange::TextureTransform(transform)));
    }

    #[test]
    fn same_texture_image_is_not_broadcast() {
        let image = TextureImage::loading("a.png");
        let mut appearance = Appearance::default().with_texture(image.clone());
        assert!(!appearance.apply(&AppearanceChange::TextureImage(Some(image))));
        assert!(appearance.apply(&AppearanceChange::TextureImage(Some(TextureImage::loading("a.png")))));
        assert!(appearance.apply(&AppearanceChange::TextureImage(None)));
    }

    #[test]
    fn color_edits_land_on_their_own_field() {
        let mut appearance = Appearance::default();
        assert!(appearance.apply(&AppearanceChange::AmbientColor(Some(Vec3::X))));
        assert!(appearance.apply(&AppearanceChange::DiffuseColor(Some(Vec3::Y))));
        assert!(appearance.apply(&AppearanceChange::SpecularColor(Some(Vec3::Z))));
        assert_eq!(appearance.ambient_color, Some(Vec3::X));
        assert_eq!(appearance.diffuse_color, Some(Vec3::Y));
        assert_eq!(appearance.specular_color, Some(Vec3::Z));
    }

    #[test]
    fn transparency_always_broadcasts() {
        let mut appearance = Appearance::default();
        assert!(appearance.apply(&AppearanceChange::Transparency(None)));
    }
}
