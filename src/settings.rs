use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionPolicy {
    #[default]
    Perspective,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    /// Horizontal field of view.
    #[serde(default = "RenderSettings::default_field_of_view")]
    pub field_of_view_degrees: f32,
    #[serde(default = "RenderSettings::default_front_clip_distance")]
    pub front_clip_distance: f32,
    #[serde(default = "RenderSettings::default_back_clip_distance")]
    pub back_clip_distance: f32,
    #[serde(default)]
    pub projection: ProjectionPolicy,
    #[serde(default = "RenderSettings::default_clear_color")]
    pub clear_color: [f32; 4],
    #[serde(default)]
    pub ignore_shininess: bool,
    #[serde(default = "RenderSettings::default_resize_transparent_textures")]
    pub resize_transparent_textures: bool,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub present_mode: PresentModeSetting,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            field_of_view_degrees: Self::default_field_of_view(),
            front_clip_distance: Self::default_front_clip_distance(),
            back_clip_distance: Self::default_back_clip_distance(),
            projection: ProjectionPolicy::default(),
            clear_color: Self::default_clear_color(),
            ignore_shininess: false,
            resize_transparent_textures: Self::default_resize_transparent_textures(),
            resolution: Resolution::default(),
            present_mode: PresentModeSetting::default(),
        }
    }
}

impl RenderSettings {
    pub fn load() -> Self {
        Self::load_from_path("settings.json")
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RenderSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded render settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default render settings.",
                        path, err
                    );
                    RenderSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    pub fn validate(mut self) -> Self {
        if !(self.field_of_view_degrees > 0.0 && self.field_of_view_degrees < 180.0) {
            warn!("Field of view must be within (0, 180) degrees. Using default value.");
            self.field_of_view_degrees = Self::default_field_of_view();
        }

        if !(self.front_clip_distance > 0.0) {
            warn!("Front clip distance must be positive. Using default value.");
            self.front_clip_distance = Self::default_front_clip_distance();
        }

        if !(self.back_clip_distance > self.front_clip_distance) {
            warn!("Back clip distance must exceed the front clip distance. Using default values.");
            self.front_clip_distance = Self::default_front_clip_distance();
            self.back_clip_distance = Self::default_back_clip_distance();
        }

        if self.resolution.width == 0 || self.resolution.height == 0 {
            warn!("Resolution must be greater than zero. Using default resolution.");
            self.resolution = Resolution::default();
        }

        self
    }

    pub fn field_of_view(&self) -> f32 {
        self.field_of_view_degrees.to_radians()
    }

    pub fn present_mode(&self, available: &[wgpu::PresentMode]) -> wgpu::PresentMode {
        let desired = self.present_mode.to_wgpu();
        if available.contains(&desired) {
            return desired;
        }

        warn!(
            "Requested present mode {:?} is not supported. Falling back to FIFO.",
            desired
        );

        if available.contains(&wgpu::PresentMode::Fifo) {
            wgpu::PresentMode::Fifo
        } else {
            available
                .first()
                .copied()
                .unwrap_or(wgpu::PresentMode::Fifo)
        }
    }

    const fn default_field_of_view() -> f32 {
        45.0
    }

    const fn default_front_clip_distance() -> f32 {
        0.1
    }

    const fn default_back_clip_distance() -> f32 {
        100.0
    }

    const fn default_clear_color() -> [f32; 4] {
        [0.0, 0.0, 0.0, 1.0]
    }

    const fn default_resize_transparent_textures() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeSetting {
    #[default]
    Fifo,
    FifoRelaxed,
    Immediate,
    Mailbox,
    AutoVsync,
    AutoNoVsync,
}

impl PresentModeSetting {
    fn to_wgpu(&self) -> wgpu::PresentMode {
        match self {
            PresentModeSetting::Fifo => wgpu::PresentMode::Fifo,
            PresentModeSetting::FifoRelaxed => wgpu::PresentMode::FifoRelaxed,
            PresentModeSetting::Immediate => wgpu::PresentMode::Immediate,
            PresentModeSetting::Mailbox => wgpu::PresentMode::Mailbox,
            PresentModeSetting::AutoVsync => wgpu::PresentMode::AutoVsync,
            PresentModeSetting::AutoNoVsync => wgpu::PresentMode::AutoNoVsync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_settings() -> RenderSettings {
        RenderSettings {
            field_of_view_degrees: 0.0,
            front_clip_distance: -1.0,
            back_clip_distance: 0.0,
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            present_mode: PresentModeSetting::Immediate,
            ..RenderSettings::default()
        }
    }

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let validated = invalid_settings().validate();
        let defaults = RenderSettings::default();

        assert_eq!(validated.field_of_view_degrees, defaults.field_of_view_degrees);
        assert_eq!(validated.front_clip_distance, defaults.front_clip_distance);
        assert_eq!(validated.back_clip_distance, defaults.back_clip_distance);
        assert_eq!(validated.resolution.width, Resolution::default().width);
        assert_eq!(validated.resolution.height, Resolution::default().height);
    }

    #[test]
    fn validate_preserves_valid_values() {
        let valid = RenderSettings {
            field_of_view_degrees: 60.0,
            front_clip_distance: 0.5,
            back_clip_distance: 500.0,
            projection: ProjectionPolicy::Parallel,
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            ..RenderSettings::default()
        };

        let validated = valid.clone().validate();

        assert_eq!(validated.field_of_view_degrees, 60.0);
        assert_eq!(validated.back_clip_distance, 500.0);
        assert_eq!(validated.projection, ProjectionPolicy::Parallel);
        assert_eq!(validated.resolution.width, valid.resolution.width);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let settings: RenderSettings =
            serde_json::from_str(r#"{ "projection": "parallel", "ignore_shininess": true }"#).unwrap();
        assert_eq!(settings.projection, ProjectionPolicy::Parallel);
        assert!(settings.ignore_shininess);
        assert_eq!(settings.field_of_view_degrees, 45.0);
        assert!(settings.resize_transparent_textures);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let settings = RenderSettings::load_from_path("does/not/exist/settings.json");
        assert_eq!(settings.back_clip_distance, 100.0);
    }

    #[test]
    fn present_mode_returns_desired_when_available() {
        let settings = RenderSettings {
            present_mode: PresentModeSetting::Mailbox,
            ..RenderSettings::default()
        };

        let available = [
            wgpu::PresentMode::Fifo,
            wgpu::PresentMode::Mailbox,
            wgpu::PresentMode::Immediate,
        ];

        assert_eq!(
            settings.present_mode(&available),
            wgpu::PresentMode::Mailbox
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo_when_desired_missing() {
        let settings = RenderSettings {
            present_mode: PresentModeSetting::Mailbox,
            ..RenderSettings::default()
        };

        let available = [wgpu::PresentMode::Fifo, wgpu::PresentMode::Immediate];

        assert_eq!(settings.present_mode(&available), wgpu::PresentMode::Fifo);
    }
}
