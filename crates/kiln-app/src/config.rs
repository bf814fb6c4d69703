// SPDX-License-Identifier: CEPL-1.0
use std::{fs, io, path::Path};

use kiln_render::RenderSize;
use kiln_render_vk::{ash::vk, ScoringPolicy};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct AppCfg {
    #[serde(default)]
    pub device: DeviceCfg,
    #[serde(default)]
    pub swapchain: SwapchainCfg,
    #[serde(default)]
    pub window: WindowCfg,
}

/// Device scoring weights. Anything left out keeps its stock value.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeviceCfg {
    pub version_major_weight: u32,
    pub version_minor_weight: u32,
    pub discrete_bonus: u32,
    pub optional_extension_bonus: u32,
    pub dedicated_transfer_bonus: u32,
    pub dedicated_compute_bonus: u32,
    pub shared_graphics_present_bonus: u32,
}

impl Default for DeviceCfg {
    fn default() -> Self {
        let p = ScoringPolicy::default();
        DeviceCfg {
            version_major_weight: p.version_major_weight,
            version_minor_weight: p.version_minor_weight,
            discrete_bonus: p.discrete_bonus,
            optional_extension_bonus: p.optional_extension_bonus,
            dedicated_transfer_bonus: p.dedicated_transfer_bonus,
            dedicated_compute_bonus: p.dedicated_compute_bonus,
            shared_graphics_present_bonus: p.shared_graphics_present_bonus,
        }
    }
}

impl DeviceCfg {
    pub fn policy(&self) -> ScoringPolicy {
        ScoringPolicy {
            version_major_weight: self.version_major_weight,
            version_minor_weight: self.version_minor_weight,
            discrete_bonus: self.discrete_bonus,
            optional_extension_bonus: self.optional_extension_bonus,
            dedicated_transfer_bonus: self.dedicated_transfer_bonus,
            dedicated_compute_bonus: self.dedicated_compute_bonus,
            shared_graphics_present_bonus: self.shared_graphics_present_bonus,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq)]
pub struct SwapchainCfg {
    /// Applied after creation when the surface supports it.
    #[serde(default)]
    pub present_mode: Option<PresentModeCfg>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeCfg {
    Fifo,
    Mailbox,
    Immediate,
    FifoRelaxed,
}

impl PresentModeCfg {
    pub fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            PresentModeCfg::Fifo => vk::PresentModeKHR::FIFO,
            PresentModeCfg::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModeCfg::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentModeCfg::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: "kiln".into(),
            width: 1280,
            height: 720,
        }
    }
}

impl WindowCfg {
    pub fn size(&self) -> RenderSize {
        RenderSize {
            width: self.width,
            height: self.height,
        }
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(text)
}

/// Missing or malformed files fall back to defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match parse_cfg(&s) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("config {} is malformed, using defaults: {e}", path.display());
                AppCfg::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("no config at {}, using defaults", path.display());
            AppCfg::default()
        }
        Err(e) => {
            warn!("config {} unreadable, using defaults: {e}", path.display());
            AppCfg::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg, AppCfg::default());
        assert_eq!(cfg.device.policy(), ScoringPolicy::default());
        assert_eq!(cfg.swapchain.present_mode, None);
        assert_eq!(cfg.window.title, "kiln");
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let cfg = parse_cfg(
            r#"
            [device]
            discrete_bonus = 0
            shared_graphics_present_bonus = 200

            [swapchain]
            present_mode = "fifo_relaxed"

            [window]
            width = 640
            "#,
        )
        .unwrap();
        let policy = cfg.device.policy();
        assert_eq!(policy.discrete_bonus, 0);
        assert_eq!(policy.shared_graphics_present_bonus, 200);
        assert_eq!(policy.version_major_weight, 8);
        assert_eq!(cfg.swapchain.present_mode.map(PresentModeCfg::to_vk), Some(vk::PresentModeKHR::FIFO_RELAXED));
        assert_eq!(cfg.window.size(), RenderSize { width: 640, height: 720 });
    }

    #[test]
    fn unknown_present_mode_is_an_error() {
        assert!(parse_cfg("[swapchain]\npresent_mode = \"triple\"\n").is_err());
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = load_cfg(Path::new("/definitely/not/here/kiln.toml"));
        assert_eq!(cfg, AppCfg::default());
    }
}
