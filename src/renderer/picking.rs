use glam::Vec3;

use super::backend::Readback;

/// Index value of the white clear color.
pub const NO_HIT: u32 = 0xFF_FFFF;

/// Packs a draw-record index into three color bytes, high byte first.
pub fn encode_index(index: u32) -> [u8; 3] {
    [(index >> 16) as u8, (index >> 8) as u8, index as u8]
}

pub fn decode_index(rgb: [u8; 3]) -> u32 {
    (u32::from(rgb[0]) << 16) | (u32::from(rgb[1]) << 8) | u32::from(rgb[2])
}

/// Picking index of the record at `position`, if it fits below [`NO_HIT`].
pub fn pick_index(position: usize) -> Option<u32> {
    u32::try_from(position).ok().filter(|&index| index < NO_HIT)
}

/// Unlit color that rasterizes to the bytes of `encode_index(index)`.
pub fn index_color(index: u32) -> Vec3 {
    let [r, g, b] = encode_index(index);
    Vec3::new(r as f32, g as f32, b as f32) / 255.0
}

/// Largest power of two not above `dimension`.
pub fn pick_buffer_size(dimension: u32) -> u32 {
    if dimension.is_power_of_two() {
        dimension
    } else {
        (dimension.next_power_of_two() / 2).max(1)
    }
}

/// Read-back picking frame, valid until the view or scene changes.
#[derive(Clone, Debug)]
pub struct PickMap {
    readback: Readback,
    canvas_size: (u32, u32),
}

impl PickMap {
    pub fn new(readback: Readback, canvas_size: (u32, u32)) -> Self {
        Self {
            readback,
            canvas_size,
        }
    }

    /// Record index under canvas pixel `(x, y)`, origin top-left.
    pub fn index_at(&self, x: f32, y: f32) -> Option<u32> {
        let (canvas_width, canvas_height) = self.canvas_size;
        if canvas_width == 0 || canvas_height == 0 {
            return None;
        }
        if !(x >= 0.0 && x < canvas_width as f32 && y >= 0.0 && y < canvas_height as f32) {
            return None;
        }
        let (width, height) = (self.readback.width, self.readback.height);
        let fb_x = ((x / canvas_width as f32) * width as f32).floor() as u32;
        let fb_y = ((y / canvas_height as f32) * height as f32).floor() as u32;
        let row = height.checked_sub(1 + fb_y.min(height.saturating_sub(1)))?;
        let [r, g, b, _] = self.readback.pixel(fb_x.min(width.saturating_sub(1)), row)?;
        match decode_index([r, g, b]) {
            NO_HIT => None,
            index => Some(index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_bytes_survive_the_color_path() {
        assert_eq!(encode_index(0x01_02_03), [1, 2, 3]);
        let color = index_color(70_000);
        let bytes = [
            (color.x * 255.0).round() as u8,
            (color.y * 255.0).round() as u8,
            (color.z * 255.0).round() as u8,
        ];
        assert_eq!(decode_index(bytes), 70_000);
    }

    #[test]
    fn boundary_indices_round_trip() {
        for index in [0, 255, 256, 65_535, 65_536, 0xFF_FFFE] {
            let color = index_color(index);
            let bytes = [
                (color.x * 255.0).round() as u8,
                (color.y * 255.0).round() as u8,
                (color.z * 255.0).round() as u8,
            ];
            assert_eq!(decode_index(bytes), index);
            assert_ne!(decode_index(bytes), NO_HIT);
        }
        assert_eq!(decode_index(encode_index(NO_HIT)), NO_HIT);
    }

    #[test]
    fn indices_from_no_hit_up_are_not_pickable() {
        assert_eq!(pick_index(0), Some(0));
        assert_eq!(pick_index(0xFF_FFFE), Some(0xFF_FFFE));
        assert_eq!(pick_index(NO_HIT as usize), None);
        assert_eq!(pick_index(0x100_0000), None);
    }

    #[test]
    fn buffer_size_rounds_down_to_power_of_two() {
        assert_eq!(pick_buffer_size(512), 512);
        assert_eq!(pick_buffer_size(800), 512);
        assert_eq!(pick_buffer_size(3), 2);
        assert_eq!(pick_buffer_size(1), 1);
        assert_eq!(pick_buffer_size(0), 1);
    }

    #[test]
    fn lookup_flips_rows_and_scales() {
        // 2x2 readback, bottom row first: index 0 bottom-left, white elsewhere.
        let mut pixels = vec![255u8; 16];
        pixels[0..4].copy_from_slice(&[0, 0, 0, 255]);
        let map = PickMap::new(
            Readback {
                width: 2,
                height: 2,
                pixels,
            },
            (100, 50),
        );
        assert_eq!(map.index_at(10.0, 40.0), Some(0));
        assert_eq!(map.index_at(10.0, 10.0), None);
        assert_eq!(map.index_at(-1.0, 10.0), None);
        assert_eq!(map.index_at(100.0, 10.0), None);
        assert_eq!(map.index_at(f32::NAN, 40.0), None);
        assert_eq!(map.index_at(10.0, f32::NAN), None);
    }
}
