//! CPU rendition of `src/shader/canvas3d.wgsl`, used by the software backend.
//! Both must stay in step.

use glam::{Vec2, Vec3, Vec4, Vec4Swizzles};

use super::lights::LightsUniform;
use super::uniforms::{DrawFlags, DrawUniforms};

#[derive(Clone, Copy, Debug, Default)]
pub struct VertexInput {
    pub position: Vec3,
    pub normal: Vec3,
    pub tex_coord: Vec2,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VertexOutput {
    pub clip_position: Vec4,
    pub view_position: Vec3,
    pub normal: Vec3,
    pub tex_coord: Vec2,
}

pub fn vertex_stage(uniforms: &DrawUniforms, input: &VertexInput) -> VertexOutput {
    let flags = uniforms.flags();
    let view_position = uniforms.model_view() * input.position.extend(1.0);

    let mut tex_coord = Vec2::ZERO;
    if flags.contains(DrawFlags::TEXTURE) {
        tex_coord = if flags.contains(DrawFlags::GENERATED_TEX_COORDS) {
            let p = input.position.extend(1.0);
            Vec2::new(
                p.dot(Vec4::from_array(uniforms.plane_s)),
                p.dot(Vec4::from_array(uniforms.plane_t)),
            )
        } else {
            input.tex_coord
        };
        tex_coord = (uniforms.texture_transform() * tex_coord.extend(1.0)).truncate();
    }

    let mut normal = Vec3::Z;
    if flags.contains(DrawFlags::LIGHTING) {
        let mut n = input.normal;
        if flags.contains(DrawFlags::IGNORE_NORMAL) {
            n = Vec3::ONE;
        } else if flags.contains(DrawFlags::FLIP_NORMAL) {
            n = -n;
        }
        normal = (uniforms.normal_matrix() * n).normalize_or_zero();
    }

    VertexOutput {
        clip_position: uniforms.projection() * view_position,
        view_position: view_position.xyz(),
        normal,
        tex_coord,
    }
}

/// Ambient plus the diffuse and specular terms of every directional light.
pub fn light_weight(
    uniforms: &DrawUniforms,
    lights: &LightsUniform,
    view_position: Vec3,
    normal: Vec3,
) -> Vec3 {
    let diffuse = Vec4::from_array(uniforms.diffuse_color).xyz();
    if !uniforms.flags().contains(DrawFlags::LIGHTING) {
        return diffuse;
    }

    let mut weight = Vec4::from_array(uniforms.ambient_color).xyz();
    let count = lights.directional_count();
    if count == 0 {
        return weight;
    }

    let specular = Vec4::from_array(uniforms.specular_color);
    let (specular_color, shininess) = (specular.xyz(), specular.w);
    let mut eye = Vec3::ZERO;
    let mut compute_specular = false;
    if specular_color.x > 0.0 && specular_color.y > 0.0 && specular_color.z > 0.0 {
        eye = (-view_position).normalize();
        // A degenerate eye vector normalizes to NaN and fails this test.
        compute_specular = eye.length() <= 1.0001;
    }

    let mut diffuse_weight = Vec3::ZERO;
    let mut specular_weight = Vec3::ZERO;
    for index in 0..count {
        let direction = lights.direction(index);
        let color = lights.color(index);
        diffuse_weight += color * normal.dot(direction).max(0.0);
        if compute_specular {
            let reflected = reflect(-direction, normal);
            specular_weight += color * reflected.dot(eye).max(0.0).powf(shininess);
        }
    }
    weight += diffuse * diffuse_weight;
    if compute_specular {
        weight += specular_color * specular_weight;
    }
    weight
}

/// Final color for a fragment; `texel` is white for untextured draws.
pub fn fragment_stage(
    uniforms: &DrawUniforms,
    lights: &LightsUniform,
    view_position: Vec3,
    normal: Vec3,
    texel: Vec4,
) -> Vec4 {
    let weight = light_weight(uniforms, lights, view_position, normal);
    let alpha = uniforms.alpha();
    (texel.xyz() * weight * alpha).extend(texel.w * alpha)
}

fn reflect(incident: Vec3, normal: Vec3) -> Vec3 {
    incident - 2.0 * normal.dot(incident) * normal
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat3, Mat4};

    fn lit_uniforms() -> DrawUniforms {
        let mut uniforms = DrawUniforms::default();
        uniforms.set_flags(DrawFlags::LIGHTING);
        uniforms.set_ambient(Vec3::splat(0.2));
        uniforms.set_diffuse(Vec3::ONE, 1.0);
        uniforms
    }

    fn one_light(direction: Vec3) -> LightsUniform {
        let mut lights = LightsUniform::default();
        lights.counts[0] = 1;
        lights.directions[0] = direction.extend(0.0).to_array();
        lights.colors[0] = [0.9, 0.9, 0.9, 1.0];
        lights
    }

    #[test]
    fn unlit_draw_uses_diffuse_color() {
        let mut uniforms = DrawUniforms::default();
        uniforms.set_diffuse(Vec3::new(0.5, 0.25, 1.0), 1.0);
        let weight = light_weight(&uniforms, &one_light(Vec3::Y), Vec3::ZERO, Vec3::Y);
        assert_eq!(weight, Vec3::new(0.5, 0.25, 1.0));
    }

    #[test]
    fn aligned_normal_is_brighter_than_perpendicular() {
        let uniforms = lit_uniforms();
        let lights = one_light(Vec3::Y);
        let aligned = light_weight(&uniforms, &lights, Vec3::new(0.0, 0.0, -3.0), Vec3::Y);
        let perpendicular = light_weight(&uniforms, &lights, Vec3::new(0.0, 0.0, -3.0), Vec3::X);
        assert!(aligned.abs_diff_eq(Vec3::splat(1.1), 1e-6));
        assert!(perpendicular.abs_diff_eq(Vec3::splat(0.2), 1e-6));
    }

    #[test]
    fn specular_needs_every_component() {
        let mut uniforms = lit_uniforms();
        let lights = one_light(Vec3::Z);
        let view_position = Vec3::new(0.0, 0.0, -2.0);

        uniforms.set_specular(Vec3::new(1.0, 1.0, 0.0), 8.0);
        let without = light_weight(&uniforms, &lights, view_position, Vec3::Z);
        uniforms.set_specular(Vec3::ONE, 8.0);
        let with = light_weight(&uniforms, &lights, view_position, Vec3::Z);
        assert!(with.x > without.x + 0.5);
    }

    #[test]
    fn alpha_scales_every_channel() {
        let mut uniforms = DrawUniforms::default();
        uniforms.set_diffuse(Vec3::ONE, 0.5);
        let color = fragment_stage(&uniforms, &LightsUniform::default(), Vec3::ZERO, Vec3::Z, Vec4::ONE);
        assert_eq!(color, Vec4::new(0.5, 0.5, 0.5, 0.5));
    }

    #[test]
    fn generated_coordinates_use_planes_and_transform() {
        let mut uniforms = DrawUniforms::default();
        uniforms.set_flags(DrawFlags::TEXTURE | DrawFlags::GENERATED_TEX_COORDS);
        uniforms.set_planes(Vec4::new(0.0, 0.0, 1.0, 0.5), Vec4::new(1.0, 0.0, 0.0, 0.0));
        uniforms.set_texture_transform(Mat3::from_scale(glam::Vec2::splat(2.0)));
        let out = vertex_stage(
            &uniforms,
            &VertexInput {
                position: Vec3::new(3.0, 0.0, 1.0),
                ..Default::default()
            },
        );
        assert!(out.tex_coord.abs_diff_eq(glam::Vec2::new(3.0, 6.0), 1e-6));
    }

    #[test]
    fn flipped_normal_is_negated() {
        let mut uniforms = DrawUniforms::default();
        uniforms.set_flags(DrawFlags::LIGHTING | DrawFlags::FLIP_NORMAL);
        uniforms.set_model_view(Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0)));
        let out = vertex_stage(
            &uniforms,
            &VertexInput {
                position: Vec3::ZERO,
                normal: Vec3::Y,
                tex_coord: glam::Vec2::ZERO,
            },
        );
        assert!(out.normal.abs_diff_eq(Vec3::NEG_Y, 1e-6));
        assert!(out.view_position.abs_diff_eq(Vec3::new(0.0, 0.0, -5.0), 1e-6));
    }
}
