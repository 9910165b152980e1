// Window surface - connection between the instance and the native window

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::enumerate::enumerate;
use super::instance::VulkanInstance;

/// Everything the surface reports about one physical device
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

pub struct WindowSurface {
    pub surface: vk::SurfaceKHR,
    pub loader: khr::Surface,
    _instance: Arc<VulkanInstance>,
}

impl WindowSurface {
    pub fn new(
        instance: Arc<VulkanInstance>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        let loader = khr::Surface::new(&instance.entry, &instance.instance);
        let surface = unsafe {
            ash_window::create_surface(&instance.entry, &instance.instance, display, window, None)
        }
        .context("Failed to create window surface")?;

        Ok(Arc::new(Self {
            surface,
            loader,
            _instance: instance,
        }))
    }

    pub fn supports_present(&self, device: vk::PhysicalDevice, family: u32) -> Result<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(device, family, self.surface)
        }
        .context("Failed to query surface presentation support")
    }

    pub fn capabilities(&self, device: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(device, self.surface)
        }
        .context("Failed to query surface capabilities")
    }

    pub fn formats(&self, device: vk::PhysicalDevice) -> Result<Vec<vk::SurfaceFormatKHR>> {
        let fp = self.loader.fp();
        enumerate("surface formats", |count, data| unsafe {
            (fp.get_physical_device_surface_formats_khr)(device, self.surface, count, data)
        })
    }

    pub fn present_modes(&self, device: vk::PhysicalDevice) -> Result<Vec<vk::PresentModeKHR>> {
        let fp = self.loader.fp();
        enumerate("surface present modes", |count, data| unsafe {
            (fp.get_physical_device_surface_present_modes_khr)(device, self.surface, count, data)
        })
    }

    pub fn support(&self, device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        Ok(SurfaceSupport {
            capabilities: self.capabilities(device)?,
            formats: self.formats(device)?,
            present_modes: self.present_modes(device)?,
        })
    }
}

impl Drop for WindowSurface {
    fn drop(&mut self) {
        log::info!("Destroying window surface...");
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}
