use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3};

use crate::scene::LightKind;

use super::render_list::LightRecord;

pub const MAX_DIRECTIONAL_LIGHTS: usize = 16;

/// Lights uniform block; slots past `counts[0]` stay zeroed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq)]
pub struct LightsUniform {
    pub counts: [u32; 4],
    /// Eye-space direction towards the light.
    pub directions: [[f32; 4]; MAX_DIRECTIONAL_LIGHTS],
    pub colors: [[f32; 4]; MAX_DIRECTIONAL_LIGHTS],
}

impl Default for LightsUniform {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl LightsUniform {
    pub fn directional_count(&self) -> usize {
        (self.counts[0] as usize).min(MAX_DIRECTIONAL_LIGHTS)
    }

    pub fn direction(&self, index: usize) -> Vec3 {
        let [x, y, z, _] = self.directions[index];
        Vec3::new(x, y, z)
    }

    pub fn color(&self, index: usize) -> Vec3 {
        let [r, g, b, _] = self.colors[index];
        Vec3::new(r, g, b)
    }
}

/// Lights aggregated for one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameLights {
    pub ambient: Vec3,
    pub uniform: LightsUniform,
}

impl FrameLights {
    /// Sums ambient colors and moves directional lights into eye space,
    /// negated so they point from the surface towards the light.
    pub fn collect<'a, I>(lights: I, view_inverse: Mat4) -> Self
    where
        I: IntoIterator<Item = &'a LightRecord>,
    {
        let mut frame = Self::default();
        let mut count = 0usize;
        for light in lights {
            match light.kind {
                LightKind::Ambient => frame.ambient += light.color,
                LightKind::Directional { direction } => {
                    if count == MAX_DIRECTIONAL_LIGHTS {
                        log::debug!("Ignoring directional lights past {}", MAX_DIRECTIONAL_LIGHTS);
                        continue;
                    }
                    let to_eye = Mat3::from_mat4(view_inverse * light.transform);
                    let eye_direction = -(to_eye * direction).normalize_or_zero();
                    frame.uniform.directions[count] = eye_direction.extend(0.0).to_array();
                    frame.uniform.colors[count] = light.color.extend(1.0).to_array();
                    count += 1;
                }
            }
        }
        frame.uniform.counts[0] = count as u32;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::NodeId;

    fn light(kind: LightKind, color: Vec3, transform: Mat4) -> LightRecord {
        LightRecord {
            node: NodeId::default(),
            links: Vec::new(),
            kind,
            color,
            transform,
        }
    }

    #[test]
    fn ambient_colors_are_summed() {
        let lights = [
            light(LightKind::Ambient, Vec3::splat(0.2), Mat4::IDENTITY),
            light(LightKind::Ambient, Vec3::new(0.1, 0.0, 0.0), Mat4::IDENTITY),
        ];
        let frame = FrameLights::collect(&lights, Mat4::IDENTITY);
        assert!(frame.ambient.abs_diff_eq(Vec3::new(0.3, 0.2, 0.2), 1e-6));
        assert_eq!(frame.uniform.directional_count(), 0);
    }

    #[test]
    fn directional_light_points_towards_the_light_in_eye_space() {
        let lights = [light(
            LightKind::Directional {
                direction: Vec3::new(0.0, -2.0, 0.0),
            },
            Vec3::splat(0.9),
            Mat4::IDENTITY,
        )];
        // Camera rolled 90 degrees around Z: world up becomes eye -X.
        let platform = Mat4::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let frame = FrameLights::collect(&lights, platform.inverse());
        assert_eq!(frame.uniform.directional_count(), 1);
        assert!(frame.uniform.direction(0).abs_diff_eq(Vec3::new(1.0, 0.0, 0.0), 1e-5));
        assert!(frame.uniform.color(0).abs_diff_eq(Vec3::splat(0.9), 1e-6));
    }

    #[test]
    fn unused_slots_are_zero_and_extra_lights_dropped() {
        let directional = light(
            LightKind::Directional { direction: Vec3::NEG_Z },
            Vec3::ONE,
            Mat4::IDENTITY,
        );
        let few = FrameLights::collect(std::iter::repeat(&directional).take(3), Mat4::IDENTITY);
        assert_eq!(few.uniform.directional_count(), 3);
        assert_eq!(few.uniform.colors[3], [0.0; 4]);

        let many = FrameLights::collect(std::iter::repeat(&directional).take(20), Mat4::IDENTITY);
        assert_eq!(many.uniform.directional_count(), MAX_DIRECTIONAL_LIGHTS);
    }
}
