pub mod capture;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{CaptureSession, Frame, VirtualDevice};
pub use error::{DeviceError, Result};

/// Environment variables with this prefix override configuration keys,
/// e.g. `VIRTUAL_VIDEO__PRODUCER__FPS=60`.
pub const ENV_PREFIX: &str = "VIRTUAL_VIDEO";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub producer: ProducerConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub driver: String,
    pub bus_info: String,
    pub version: u32,
    pub default_width: u32,
    pub default_height: u32,
    pub min_buffers: u32,
    pub default_buffers: u32,
    pub memory_limit_mb: u32, // Ceiling on total buffer memory
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub fps: u32,
    pub first_tick_delay_ms: u64,
}

/// Settings of the demo capture client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub frame_count: u32,
    pub buffer_count: u32,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub output_dir: String,
    pub write_snapshots: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "virtual_video".into(),
            driver: "virtual_video".into(),
            bus_info: "virtual_video".into(),
            version: 0x0001,
            default_width: 800,
            default_height: 480,
            min_buffers: 4,
            default_buffers: 8,
            memory_limit_mb: 16,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            first_tick_delay_ms: 0,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frame_count: 4,
            buffer_count: 4,
            format: "BGR4".into(),
            width: 800,
            height: 480,
            output_dir: "./img".into(),
            write_snapshots: true,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `VIRTUAL_VIDEO__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Config>()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_match_device_contract() {
        let config = Config::default();
        assert_eq!(config.device.min_buffers, 4);
        assert_eq!(config.device.default_buffers, 8);
        assert_eq!(config.device.memory_limit_mb, 16);
        assert_eq!(config.producer.fps, 30);
        assert_eq!((config.device.default_width, config.device.default_height), (800, 480));
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = std::env::temp_dir().join(format!("virtual-video-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("device.toml");
        fs::write(
            &path,
            "[producer]\nfps = 60\n\n[device]\nmemory_limit_mb = 4\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.producer.fps, 60);
        assert_eq!(config.device.memory_limit_mb, 4);
        assert_eq!(config.device.default_buffers, 8);
        assert_eq!(config.demo.format, "BGR4");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_fails_for_missing_explicit_file() {
        let path = std::env::temp_dir().join("virtual-video-no-such-config.toml");
        assert!(matches!(
            Config::load(Some(&path)),
            Err(DeviceError::Config(_))
        ));
    }
}
