// Render context - owns every Vulkan object for one window
//
// Creation order: instance (+ debug messenger), surface, device, swapchain,
// frame sync objects. Fields are declared in the opposite order so they
// drop in strict reverse creation order.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use super::device::VulkanDevice;
use super::instance::VulkanInstance;
use super::surface::WindowSurface;
use super::swapchain::Swapchain;
use super::sync::{FrameSync, FrameSynchronizer, VulkanPresentDriver};
use crate::config::Requirements;

pub struct RenderContext {
    frames: FrameSynchronizer<VulkanPresentDriver>,
    _frame_sync: FrameSync,
    swapchain: Swapchain,
    device: Arc<VulkanDevice>,
    _surface: Arc<WindowSurface>,
    _instance: Arc<VulkanInstance>,
}

impl RenderContext {
    pub fn new(window: &Window, app_name: &str, requirements: &Requirements) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let display = window.raw_display_handle();
        let instance = VulkanInstance::new(app_name, display, requirements)?;
        if !instance.has_debug_messenger() {
            log::debug!("Running without debug messenger");
        }

        let surface = WindowSurface::new(instance.clone(), display, window.raw_window_handle())?;
        let device = VulkanDevice::new(instance.clone(), &surface, requirements)?;

        log::debug!(
            "Queues: graphics {:?}, present {:?}",
            device.graphics_queue,
            device.present_queue
        );

        let size = window.inner_size();
        let drawable = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let swapchain = Swapchain::new(device.clone(), surface.clone(), drawable)?;

        let frame_sync = FrameSync::new(device.clone())?;
        let frames = FrameSynchronizer::new(
            VulkanPresentDriver::new(&device, &swapchain),
            frame_sync.handles(),
            device.queues.is_shared(),
        );

        log::info!(
            "Vulkan initialized successfully! Images transition to {:?}",
            frames.target_layout()
        );

        Ok(Self {
            frames,
            _frame_sync: frame_sync,
            swapchain,
            device,
            _surface: surface,
            _instance: instance,
        })
    }

    /// One acquire → record → submit → wait → present cycle
    pub fn render_frame(&mut self) -> Result<()> {
        self.frames.run_frame().with_context(|| {
            format!(
                "Frame {} aborted in state {:?}",
                self.frames.frames() + 1,
                self.frames.state()
            )
        })?;
        Ok(())
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames.frames()
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.images.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.config.extent
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Nothing may be destroyed while the GPU still uses it
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }
    }
}
