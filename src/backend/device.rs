// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (capability checks, prefer discrete GPU)
// - Graphics / present queue family choice
// - Logical device + queue creation

use anyhow::{bail, Context, Result};
use ash::vk;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::enumerate::{enumerate, name_from_raw};
use super::instance::VulkanInstance;
use super::surface::WindowSurface;
use crate::config::Requirements;

/// Flat bonus a discrete GPU gets over every other device type
const DISCRETE_GPU_BONUS: u32 = 100;

/// Graphics and present queue family indices on one device. They may be equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyChoice {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyChoice {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Families that need a queue, without duplicates
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Result of evaluating one physical device. Discarded after selection.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCandidate {
    pub device: vk::PhysicalDevice,
    pub queues: Option<QueueFamilyChoice>,
    pub suitable: bool,
    pub score: u32,
}

/// The device selection settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedDevice {
    pub device: vk::PhysicalDevice,
    pub queues: QueueFamilyChoice,
}

/// Everything selection needs to know about a physical device.
///
/// The live implementation asks the driver; tests hand in synthetic devices.
pub trait DeviceInspector {
    fn device_type(&self, device: vk::PhysicalDevice) -> vk::PhysicalDeviceType;
    fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties>;
    fn supports_present(&self, device: vk::PhysicalDevice, family: u32) -> Result<bool>;
    fn layers(&self, device: vk::PhysicalDevice) -> Result<Vec<String>>;
    fn extensions(&self, device: vk::PhysicalDevice) -> Result<Vec<String>>;
    fn surface_capabilities(&self, device: vk::PhysicalDevice)
        -> Result<vk::SurfaceCapabilitiesKHR>;
}

/// First graphics-capable family and first present-capable family, scanned once
fn find_queue_families<I: DeviceInspector>(
    inspector: &I,
    device: vk::PhysicalDevice,
) -> Result<Option<QueueFamilyChoice>> {
    let mut graphics = None;
    let mut present = None;

    for (index, family) in inspector.queue_families(device).iter().enumerate() {
        let index = index as u32;
        if graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(index);
        }
        if present.is_none() && inspector.supports_present(device, index)? {
            present = Some(index);
        }
    }

    Ok(match (graphics, present) {
        (Some(graphics), Some(present)) => Some(QueueFamilyChoice { graphics, present }),
        _ => None,
    })
}

fn has_all(available: &[String], required: &[String]) -> bool {
    required.iter().all(|name| available.contains(name))
}

/// Check one device against the requirements and score it (0 = unsuitable)
pub fn evaluate_device<I: DeviceInspector>(
    inspector: &I,
    device: vk::PhysicalDevice,
    requirements: &Requirements,
) -> Result<DeviceCandidate> {
    let queues = find_queue_families(inspector, device)?;

    let suitable = queues.is_some()
        && has_all(&inspector.layers(device)?, &requirements.layers)
        && has_all(&inspector.extensions(device)?, &requirements.device_extensions)
        && inspector
            .surface_capabilities(device)?
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT);

    let score = if !suitable {
        0
    } else if inspector.device_type(device) == vk::PhysicalDeviceType::DISCRETE_GPU {
        1 + DISCRETE_GPU_BONUS
    } else {
        1
    };

    Ok(DeviceCandidate {
        device,
        queues,
        suitable,
        score,
    })
}

/// Pick the highest scoring device. Ties keep the earlier one.
pub fn select_device<I: DeviceInspector>(
    inspector: &I,
    candidates: &[vk::PhysicalDevice],
    requirements: &Requirements,
) -> Result<SelectedDevice> {
    let mut best: Option<SelectedDevice> = None;
    let mut best_score = 0;

    for &device in candidates {
        let candidate = evaluate_device(inspector, device, requirements)?;
        log::debug!(
            "Device {:?}: suitable={} score={}",
            candidate.device,
            candidate.suitable,
            candidate.score
        );

        if candidate.score > best_score {
            if let Some(queues) = candidate.queues {
                best_score = candidate.score;
                best = Some(SelectedDevice { device, queues });
            }
        }
    }

    match best {
        Some(selected) => Ok(selected),
        None => bail!("No suitable device found among {} candidates", candidates.len()),
    }
}

/// Driver-backed inspector
pub struct VulkanInspector<'a> {
    pub instance: &'a ash::Instance,
    pub surface: &'a WindowSurface,
}

impl DeviceInspector for VulkanInspector<'_> {
    fn device_type(&self, device: vk::PhysicalDevice) -> vk::PhysicalDeviceType {
        unsafe { self.instance.get_physical_device_properties(device) }.device_type
    }

    fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.instance
                .get_physical_device_queue_family_properties(device)
        }
    }

    fn supports_present(&self, device: vk::PhysicalDevice, family: u32) -> Result<bool> {
        self.surface.supports_present(device, family)
    }

    fn layers(&self, device: vk::PhysicalDevice) -> Result<Vec<String>> {
        let fp = self.instance.fp_v1_0();
        let layers = enumerate("device layers", |count, data| unsafe {
            (fp.enumerate_device_layer_properties)(device, count, data)
        })?;
        Ok(layers
            .iter()
            .map(|p: &vk::LayerProperties| name_from_raw(&p.layer_name))
            .collect())
    }

    fn extensions(&self, device: vk::PhysicalDevice) -> Result<Vec<String>> {
        let fp = self.instance.fp_v1_0();
        let extensions = enumerate("device extensions", |count, data| unsafe {
            (fp.enumerate_device_extension_properties)(device, std::ptr::null(), count, data)
        })?;
        Ok(extensions
            .iter()
            .map(|p: &vk::ExtensionProperties| name_from_raw(&p.extension_name))
            .collect())
    }

    fn surface_capabilities(
        &self,
        device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        self.surface.capabilities(device)
    }
}

/// Logical device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queues: QueueFamilyChoice,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub instance: Arc<VulkanInstance>,
}

impl VulkanDevice {
    /// Select a GPU for `surface` and create the logical device on it
    pub fn new(
        instance: Arc<VulkanInstance>,
        surface: &WindowSurface,
        requirements: &Requirements,
    ) -> Result<Arc<Self>> {
        let raw = &instance.instance;
        let fp = raw.fp_v1_0();
        let candidates = enumerate("physical devices", |count, data| unsafe {
            (fp.enumerate_physical_devices)(raw.handle(), count, data)
        })?;
        log::info!("Found {} physical device(s)", candidates.len());

        let inspector = VulkanInspector {
            instance: raw,
            surface,
        };
        let selected = select_device(&inspector, &candidates, requirements)?;

        let properties = unsafe { raw.get_physical_device_properties(selected.device) };
        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );
        log::info!(
            "Queue families: graphics={} present={}",
            selected.queues.graphics,
            selected.queues.present
        );

        let device = Self::create_logical_device(raw, selected, requirements)?;
        let graphics_queue = unsafe { device.get_device_queue(selected.queues.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(selected.queues.present, 0) };

        Ok(Arc::new(Self {
            device,
            physical_device: selected.device,
            queues: selected.queues,
            graphics_queue,
            present_queue,
            instance,
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        selected: SelectedDevice,
        requirements: &Requirements,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos = queue_create_infos(selected.queues, &queue_priorities);

        let extensions = to_cstrings(&requirements.device_extensions)?;
        let extension_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();

        let create_info = device_create_info(&queue_create_infos, &extension_ptrs);

        let device = unsafe { instance.create_device(selected.device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("{:#}", e);
        }
        unsafe { self.device.destroy_device(None) };
    }
}

/// One queue per unique family
fn queue_create_infos(
    queues: QueueFamilyChoice,
    priorities: &[f32],
) -> Vec<vk::DeviceQueueCreateInfo> {
    queues
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(priorities)
                .build()
        })
        .collect()
}

/// Device-level layers are deprecated, layers are only enabled on the instance
fn device_create_info<'a>(
    queue_create_infos: &'a [vk::DeviceQueueCreateInfo],
    extension_ptrs: &'a [*const c_char],
) -> vk::DeviceCreateInfoBuilder<'a> {
    vk::DeviceCreateInfo::builder()
        .queue_create_infos(queue_create_infos)
        .enabled_extension_names(extension_ptrs)
}

fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|n| CString::new(n.as_str()).with_context(|| format!("Invalid name {:?}", n)))
        .collect()
}

/// In-memory devices for exercising selection without a GPU
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use ash::vk::Handle;
    use std::collections::HashMap;

    #[derive(Clone)]
    pub struct FakeDevice {
        pub device_type: vk::PhysicalDeviceType,
        pub families: Vec<vk::QueueFlags>,
        pub present_families: Vec<u32>,
        pub layers: Vec<String>,
        pub extensions: Vec<String>,
        pub usage: vk::ImageUsageFlags,
    }

    impl FakeDevice {
        /// Suitable integrated GPU with one family doing everything
        pub fn good() -> Self {
            Self {
                device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
                families: vec![vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER],
                present_families: vec![0],
                layers: vec!["VK_LAYER_KHRONOS_validation".to_string()],
                extensions: vec!["VK_KHR_swapchain".to_string()],
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            }
        }

        pub fn discrete() -> Self {
            Self {
                device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
                ..Self::good()
            }
        }
    }

    #[derive(Default)]
    pub struct FakeInspector {
        devices: HashMap<u64, FakeDevice>,
    }

    impl FakeInspector {
        pub fn with(devices: Vec<FakeDevice>) -> (Self, Vec<vk::PhysicalDevice>) {
            let mut inspector = Self::default();
            let mut handles = Vec::new();
            for (i, device) in devices.into_iter().enumerate() {
                let raw = (i + 1) as u64;
                inspector.devices.insert(raw, device);
                handles.push(vk::PhysicalDevice::from_raw(raw));
            }
            (inspector, handles)
        }

        fn get(&self, device: vk::PhysicalDevice) -> &FakeDevice {
            &self.devices[&device.as_raw()]
        }
    }

    impl DeviceInspector for FakeInspector {
        fn device_type(&self, device: vk::PhysicalDevice) -> vk::PhysicalDeviceType {
            self.get(device).device_type
        }

        fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
            self.get(device)
                .families
                .iter()
                .map(|&queue_flags| vk::QueueFamilyProperties {
                    queue_flags,
                    queue_count: 1,
                    ..Default::default()
                })
                .collect()
        }

        fn supports_present(&self, device: vk::PhysicalDevice, family: u32) -> Result<bool> {
            Ok(self.get(device).present_families.contains(&family))
        }

        fn layers(&self, device: vk::PhysicalDevice) -> Result<Vec<String>> {
            Ok(self.get(device).layers.clone())
        }

        fn extensions(&self, device: vk::PhysicalDevice) -> Result<Vec<String>> {
            Ok(self.get(device).extensions.clone())
        }

        fn surface_capabilities(
            &self,
            device: vk::PhysicalDevice,
        ) -> Result<vk::SurfaceCapabilitiesKHR> {
            Ok(vk::SurfaceCapabilitiesKHR {
                supported_usage_flags: self.get(device).usage,
                ..Default::default()
            })
        }
    }

    pub fn requirements() -> Requirements {
        Requirements {
            layers: vec!["VK_LAYER_KHRONOS_validation".to_string()],
            instance_extensions: vec![],
            device_extensions: vec!["VK_KHR_swapchain".to_string()],
            debug_messenger: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    fn select(devices: Vec<FakeDevice>) -> (Result<SelectedDevice>, Vec<vk::PhysicalDevice>) {
        let (inspector, handles) = FakeInspector::with(devices);
        (select_device(&inspector, &handles, &requirements()), handles)
    }

    #[test]
    fn single_suitable_device_is_selected() {
        let (selected, handles) = select(vec![FakeDevice::good()]);
        let selected = selected.unwrap();
        assert_eq!(selected.device, handles[0]);
        assert_eq!(selected.queues, QueueFamilyChoice { graphics: 0, present: 0 });
    }

    #[test]
    fn suitable_device_wins_over_unsuitable_ones() {
        let no_graphics = FakeDevice {
            families: vec![vk::QueueFlags::COMPUTE],
            ..FakeDevice::discrete()
        };
        let no_present = FakeDevice {
            present_families: vec![],
            ..FakeDevice::discrete()
        };
        let no_swapchain = FakeDevice {
            extensions: vec![],
            ..FakeDevice::discrete()
        };
        let no_layer = FakeDevice {
            layers: vec!["VK_LAYER_other".to_string()],
            ..FakeDevice::discrete()
        };
        let no_color_attachment = FakeDevice {
            usage: vk::ImageUsageFlags::TRANSFER_DST,
            ..FakeDevice::discrete()
        };

        let (selected, handles) = select(vec![
            no_graphics,
            no_present,
            no_swapchain,
            no_layer,
            no_color_attachment,
            FakeDevice::good(),
        ]);
        assert_eq!(selected.unwrap().device, handles[5]);
    }

    #[test]
    fn tie_keeps_first_enumerated() {
        let cpu = FakeDevice {
            device_type: vk::PhysicalDeviceType::CPU,
            ..FakeDevice::good()
        };
        let (selected, handles) = select(vec![FakeDevice::good(), cpu]);
        assert_eq!(selected.unwrap().device, handles[0]);
    }

    #[test]
    fn discrete_outranks_earlier_integrated() {
        let (selected, handles) = select(vec![FakeDevice::good(), FakeDevice::discrete()]);
        assert_eq!(selected.unwrap().device, handles[1]);

        let (selected, handles) = select(vec![FakeDevice::discrete(), FakeDevice::good()]);
        assert_eq!(selected.unwrap().device, handles[0]);
    }

    #[test]
    fn empty_candidate_set_is_fatal() {
        let (selected, _) = select(vec![]);
        assert!(selected
            .unwrap_err()
            .to_string()
            .contains("No suitable device"));
    }

    #[test]
    fn all_unsuitable_is_fatal() {
        let broken = FakeDevice {
            extensions: vec![],
            ..FakeDevice::discrete()
        };
        let (selected, _) = select(vec![broken.clone(), broken]);
        assert!(selected
            .unwrap_err()
            .to_string()
            .contains("No suitable device"));
    }

    #[test]
    fn first_matching_families_are_recorded() {
        let split = FakeDevice {
            families: vec![
                vk::QueueFlags::TRANSFER,
                vk::QueueFlags::GRAPHICS,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            ],
            present_families: vec![2, 0],
            ..FakeDevice::good()
        };
        let (selected, _) = select(vec![split]);
        assert_eq!(
            selected.unwrap().queues,
            QueueFamilyChoice { graphics: 1, present: 0 }
        );
    }

    #[test]
    fn scores() {
        let (inspector, handles) =
            FakeInspector::with(vec![FakeDevice::good(), FakeDevice::discrete()]);
        let req = requirements();

        let integrated = evaluate_device(&inspector, handles[0], &req).unwrap();
        assert!(integrated.suitable);
        assert_eq!(integrated.score, 1);

        let discrete = evaluate_device(&inspector, handles[1], &req).unwrap();
        assert_eq!(discrete.score, 1 + DISCRETE_GPU_BONUS);
    }

    #[test]
    fn unique_families() {
        assert_eq!(QueueFamilyChoice { graphics: 2, present: 2 }.unique(), vec![2]);
        assert_eq!(QueueFamilyChoice { graphics: 0, present: 3 }.unique(), vec![0, 3]);
    }

    #[test]
    fn logical_device_enables_extensions_but_no_layers() {
        let req = requirements();
        assert!(!req.layers.is_empty());

        let priorities = [1.0];
        let queue_infos =
            queue_create_infos(QueueFamilyChoice { graphics: 0, present: 1 }, &priorities);
        let extensions = to_cstrings(&req.device_extensions).unwrap();
        let extension_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();

        let info = device_create_info(&queue_infos, &extension_ptrs);
        assert_eq!(info.enabled_layer_count, 0);
        assert!(info.pp_enabled_layer_names.is_null());
        assert_eq!(info.enabled_extension_count, 1);
        assert_eq!(info.queue_create_info_count, 2);
        assert_eq!(queue_infos[1].queue_family_index, 1);
    }
}
