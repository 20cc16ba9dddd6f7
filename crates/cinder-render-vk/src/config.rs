// SPDX-License-Identifier: CEPL-1.0
//! Renderer configuration.
//!
//! Plain structs with defaulted fields; every option and its effect is listed
//! here rather than spread over builder calls.

use ash::vk;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const MAX_FRAMES_IN_FLIGHT: u32 = 3;

/// Order in which present modes are tried. FIFO is always the last resort
/// because it is the only mode every surface must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    /// Mailbox, then immediate, then FIFO.
    #[default]
    LowLatency,
    /// FIFO only (vsync).
    Fifo,
    /// Immediate, then mailbox, then FIFO.
    Immediate,
}

impl PresentModePreference {
    pub fn candidates(self) -> &'static [vk::PresentModeKHR] {
        match self {
            PresentModePreference::LowLatency => &[
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::IMMEDIATE,
                vk::PresentModeKHR::FIFO,
            ],
            PresentModePreference::Fifo => &[vk::PresentModeKHR::FIFO],
            PresentModePreference::Immediate => &[
                vk::PresentModeKHR::IMMEDIATE,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::FIFO,
            ],
        }
    }
}

/// Options consumed by [`LogicalDevice`](crate::device::LogicalDevice).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub present_mode: PresentModePreference,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    /// 1 = single, 2 = double, 3 = triple buffering. Fixed for the
    /// renderer's lifetime.
    pub frames_in_flight: u32,
    pub present_mode: PresentModePreference,
    /// Device extensions a physical device must expose to be eligible.
    pub required_extensions: Vec<String>,
    pub clear_color: [f32; 4],
    /// Enable `VK_LAYER_KHRONOS_validation` and route its messages to the
    /// logger.
    pub validation: bool,
    pub application_name: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            present_mode: PresentModePreference::default(),
            required_extensions: vec!["VK_KHR_swapchain".to_owned()],
            clear_color: [0.02, 0.02, 0.04, 1.0],
            validation: cfg!(debug_assertions),
            application_name: "cinder".to_owned(),
        }
    }
}

impl RendererConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if !self
            .required_extensions
            .iter()
            .any(|e| e == "VK_KHR_swapchain")
        {
            return Err(Error::Config(
                "required_extensions must include VK_KHR_swapchain".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn device(&self) -> DeviceConfig {
        DeviceConfig {
            present_mode: self.present_mode,
        }
    }
}
