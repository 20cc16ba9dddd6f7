// SPDX-License-Identifier: CEPL-1.0
//! Physical device scoring and queue-family discovery.
//!
//! Candidates are plain data. [`VulkanInstance::candidates`](crate::vulkan::VulkanInstance::candidates)
//! builds them from a live instance and surface; tests and the headless
//! driver build them directly.

use ash::vk;
use cinder_core::Logger;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyCaps {
    pub flags: vk::QueueFlags,
    /// Can present to the target surface.
    pub present: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub extensions: Vec<String>,
    pub queue_families: Vec<QueueFamilyCaps>,
}

/// Resolved queue-family indices. Roles may share a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// Distinct families in role order.
    pub fn unique(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(3);
        for f in [self.graphics, self.present, self.transfer] {
            if !out.contains(&f) {
                out.push(f);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub extensions: Vec<String>,
    pub queues: QueueFamilies,
    pub score: u64,
}

/// Why a candidate scored zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NoGraphicsQueue,
    NoPresentQueue,
    MissingExtension(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::NoGraphicsQueue => f.write_str("no graphics-capable queue family"),
            Rejection::NoPresentQueue => f.write_str("no queue family can present to the surface"),
            Rejection::MissingExtension(name) => write!(f, "missing extension {name}"),
        }
    }
}

/// Scans the families once. Transfer prefers a dedicated family (TRANSFER
/// without GRAPHICS or COMPUTE) and falls back to the graphics family.
pub fn discover_queue_families(
    families: &[QueueFamilyCaps],
) -> std::result::Result<QueueFamilies, Rejection> {
    let mut graphics = None;
    let mut present = None;
    let mut transfer = None;
    for (i, fam) in families.iter().enumerate() {
        let i = i as u32;
        if graphics.is_none() && fam.flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(i);
        }
        if present.is_none() && fam.present {
            present = Some(i);
        }
        if transfer.is_none()
            && fam.flags.contains(vk::QueueFlags::TRANSFER)
            && !fam
                .flags
                .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        {
            transfer = Some(i);
        }
    }
    let graphics = graphics.ok_or(Rejection::NoGraphicsQueue)?;
    let present = present.ok_or(Rejection::NoPresentQueue)?;
    Ok(QueueFamilies {
        graphics,
        present,
        transfer: transfer.unwrap_or(graphics),
    })
}

/// Zero for ineligible candidates, otherwise 1000 for discrete GPUs plus the
/// maximum 2D image dimension.
pub fn score(
    candidate: &DeviceCandidate,
    required_extensions: &[String],
) -> std::result::Result<(u64, QueueFamilies), Rejection> {
    let queues = discover_queue_families(&candidate.queue_families)?;
    if let Some(missing) = required_extensions
        .iter()
        .find(|r| !candidate.extensions.iter().any(|e| e == *r))
    {
        return Err(Rejection::MissingExtension(missing.clone()));
    }
    let mut score = u64::from(candidate.max_image_dimension_2d);
    if candidate.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += 1000;
    }
    Ok((score, queues))
}

/// Picks the highest strictly-positive score. Ties keep the first
/// enumerated candidate.
pub fn select(
    candidates: Vec<DeviceCandidate>,
    required_extensions: &[String],
    log: &Logger,
) -> Result<PhysicalDeviceInfo> {
    let total = candidates.len();
    let mut best: Option<PhysicalDeviceInfo> = None;
    for c in candidates {
        match score(&c, required_extensions) {
            Err(why) => {
                log.debug(format_args!("rejecting device '{}': {why}", c.name));
            }
            Ok((0, _)) => {
                log.debug(format_args!("rejecting device '{}': zero score", c.name));
            }
            Ok((s, queues)) => {
                log.trace(format_args!(
                    "device '{}' ({:?}) scored {s}, queues {:?}",
                    c.name, c.device_type, queues
                ));
                if best.as_ref().map_or(true, |b| s > b.score) {
                    best = Some(PhysicalDeviceInfo {
                        handle: c.handle,
                        name: c.name,
                        device_type: c.device_type,
                        max_image_dimension_2d: c.max_image_dimension_2d,
                        extensions: c.extensions,
                        queues,
                        score: s,
                    });
                }
            }
        }
    }
    match best {
        Some(info) => {
            log.info(format_args!(
                "selected device '{}' (score {}, graphics {}, present {}, transfer {})",
                info.name,
                info.score,
                info.queues.graphics,
                info.queues.present,
                info.queues.transfer
            ));
            Ok(info)
        }
        None => Err(Error::NoSuitableDevice { candidates: total }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    fn fam(flags: vk::QueueFlags, present: bool) -> QueueFamilyCaps {
        QueueFamilyCaps { flags, present }
    }

    fn device(
        id: u64,
        ty: vk::PhysicalDeviceType,
        max_dim: u32,
        families: Vec<QueueFamilyCaps>,
    ) -> DeviceCandidate {
        DeviceCandidate {
            handle: vk::PhysicalDevice::from_raw(id),
            name: format!("gpu{id}"),
            device_type: ty,
            max_image_dimension_2d: max_dim,
            extensions: vec!["VK_KHR_swapchain".into()],
            queue_families: families,
        }
    }

    fn required() -> Vec<String> {
        vec!["VK_KHR_swapchain".into()]
    }

    #[test]
    fn discrete_beats_integrated() {
        let all = vec![fam(G | C | T, true)];
        let a = device(1, vk::PhysicalDeviceType::INTEGRATED_GPU, 8192, all.clone());
        let b = device(2, vk::PhysicalDeviceType::DISCRETE_GPU, 8192, all);
        let info = select(vec![a, b], &required(), &Logger::default()).unwrap();
        assert_eq!(info.handle, vk::PhysicalDevice::from_raw(2));
        assert_eq!(info.score, 1000 + 8192);
    }

    #[test]
    fn missing_present_is_ineligible() {
        let a = device(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            16384,
            vec![fam(G, false)],
        );
        let err = select(vec![a], &required(), &Logger::default()).unwrap_err();
        assert!(matches!(err, Error::NoSuitableDevice { candidates: 1 }));
    }

    #[test]
    fn missing_extension_is_ineligible() {
        let mut a = device(1, vk::PhysicalDeviceType::DISCRETE_GPU, 4096, vec![fam(G, true)]);
        a.extensions.clear();
        assert_eq!(
            score(&a, &required()).unwrap_err(),
            Rejection::MissingExtension("VK_KHR_swapchain".into())
        );
    }

    #[test]
    fn ineligible_devices_lose_regardless_of_capability() {
        let all = vec![fam(G | C | T, true)];
        let mut no_swapchain = device(1, vk::PhysicalDeviceType::DISCRETE_GPU, 16384, all.clone());
        no_swapchain.extensions.clear();
        let no_present = device(
            2,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            16384,
            vec![fam(G | C | T, false)],
        );
        let modest = device(3, vk::PhysicalDeviceType::INTEGRATED_GPU, 1024, all);
        let info = select(
            vec![no_swapchain, no_present, modest],
            &required(),
            &Logger::default(),
        )
        .unwrap();
        assert_eq!(info.handle, vk::PhysicalDevice::from_raw(3));
        assert_eq!(info.score, 1024);
    }

    #[test]
    fn ties_keep_first_enumerated() {
        let a = device(1, vk::PhysicalDeviceType::DISCRETE_GPU, 4096, vec![fam(G, true)]);
        let b = device(2, vk::PhysicalDeviceType::DISCRETE_GPU, 4096, vec![fam(G, true)]);
        let info = select(vec![a, b], &required(), &Logger::default()).unwrap();
        assert_eq!(info.handle, vk::PhysicalDevice::from_raw(1));
    }

    #[test]
    fn no_candidates_is_an_error() {
        let err = select(vec![], &required(), &Logger::default()).unwrap_err();
        assert!(matches!(err, Error::NoSuitableDevice { candidates: 0 }));
    }

    #[test]
    fn dedicated_transfer_family_is_preferred() {
        let q = discover_queue_families(&[
            fam(G | C | T, false),
            fam(C | T, false),
            fam(T, false),
            fam(vk::QueueFlags::empty(), true),
        ])
        .unwrap();
        assert_eq!(
            q,
            QueueFamilies {
                graphics: 0,
                present: 3,
                transfer: 2
            }
        );
        assert_eq!(q.unique(), vec![0, 3, 2]);
    }

    #[test]
    fn transfer_falls_back_to_graphics() {
        let q = discover_queue_families(&[fam(C | T, false), fam(G | C | T, true)]).unwrap();
        assert_eq!(q.graphics, 1);
        assert_eq!(q.transfer, 1);
        assert_eq!(q.unique(), vec![1]);
    }
}
