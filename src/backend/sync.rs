// Synchronization and the per-frame present protocol
//
// One semaphore (image acquired) and one fence (submitted work done), reused
// every frame. The fence is waited and reset before the frame ends, so at
// most one frame of GPU work is ever outstanding.

use anyhow::{bail, Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::device::VulkanDevice;
use super::swapchain::Swapchain;

/// Raw handles the synchronizer threads through a frame
#[derive(Debug, Clone, Copy)]
pub struct FrameHandles {
    pub image_available: vk::Semaphore,
    pub work_done: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
}

/// Owner of the frame's sync objects and its command pool
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub work_done: vk::Fence,
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Unsignaled: the frame waits on it after submitting
        let fence_info = vk::FenceCreateInfo::builder();

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queues.present)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        unsafe {
            let command_pool = device
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?;

            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = match device.device.allocate_command_buffers(&alloc_info) {
                Ok(buffers) => buffers[0],
                Err(e) => {
                    device.device.destroy_command_pool(command_pool, None);
                    return Err(e).context("Failed to allocate command buffer");
                }
            };

            let image_available = match device.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.device.destroy_command_pool(command_pool, None);
                    return Err(e).context("Failed to create semaphore");
                }
            };

            let work_done = match device.device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    device.device.destroy_command_pool(command_pool, None);
                    return Err(e).context("Failed to create fence");
                }
            };

            Ok(Self {
                image_available,
                work_done,
                command_pool,
                command_buffer,
                device,
            })
        }
    }

    pub fn handles(&self) -> FrameHandles {
        FrameHandles {
            image_available: self.image_available,
            work_done: self.work_done,
            command_buffer: self.command_buffer,
        }
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        log::info!("Destroying frame sync objects...");

        let device = &self.device.device;
        unsafe {
            // Sync objects first, then the pool (also frees the command buffer)
            device.destroy_fence(self.work_done, None);
            device.destroy_semaphore(self.image_available, None);
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Where a frame is in the acquire → record → submit → wait → present cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

/// The GPU operations one frame is made of.
///
/// Every method either succeeds or returns a fatal error naming the step.
pub trait PresentDriver {
    /// Next presentable image, signaling `signal` once it is acquired. May block.
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<u32>;

    /// Record a single layout transition of image `image_index` to `layout`
    fn record_transition(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
        layout: vk::ImageLayout,
    ) -> Result<()>;

    /// Submit `command_buffer` waiting on `wait` at top-of-pipe, signaling `fence`
    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()>;

    /// Block until `fence` signals, then reset it
    fn wait_and_reset(&mut self, fence: vk::Fence) -> Result<()>;

    fn present(&mut self, image_index: u32) -> Result<()>;
}

/// Runs one frame at a time through the present protocol
pub struct FrameSynchronizer<D: PresentDriver> {
    driver: D,
    handles: FrameHandles,
    target_layout: vk::ImageLayout,
    state: FrameState,
    frames: u64,
}

impl<D: PresentDriver> FrameSynchronizer<D> {
    /// `shared_queues` tells whether graphics and present use the same family
    pub fn new(driver: D, handles: FrameHandles, shared_queues: bool) -> Self {
        let target_layout = if shared_queues {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else {
            vk::ImageLayout::SHARED_PRESENT_KHR
        };

        Self {
            driver,
            handles,
            target_layout,
            state: FrameState::Idle,
            frames: 0,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn target_layout(&self) -> vk::ImageLayout {
        self.target_layout
    }

    #[cfg(test)]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn advance(&mut self, from: FrameState, to: FrameState) -> Result<()> {
        if self.state != from {
            bail!(
                "Frame state machine out of order: expected {:?}, was {:?}",
                from,
                self.state
            );
        }
        self.state = to;
        Ok(())
    }

    /// Acquire, record, submit, wait, present. Returns the presented image index.
    pub fn run_frame(&mut self) -> Result<u32> {
        let FrameHandles {
            image_available,
            work_done,
            command_buffer,
        } = self.handles;

        self.advance(FrameState::Idle, FrameState::Acquiring)?;
        let image_index = self.driver.acquire_next_image(image_available)?;

        self.advance(FrameState::Acquiring, FrameState::Recording)?;
        self.driver
            .record_transition(command_buffer, image_index, self.target_layout)?;

        self.advance(FrameState::Recording, FrameState::Submitted)?;
        self.driver.submit(command_buffer, image_available, work_done)?;
        self.driver.wait_and_reset(work_done)?;

        self.advance(FrameState::Submitted, FrameState::Presenting)?;
        self.driver.present(image_index)?;

        self.advance(FrameState::Presenting, FrameState::Idle)?;
        self.frames += 1;
        log::trace!("Frame {} presented image {}", self.frames, image_index);

        Ok(image_index)
    }
}

/// Driver that talks to the real device and swapchain
pub struct VulkanPresentDriver {
    device: ash::Device,
    loader: khr::Swapchain,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    queue: vk::Queue,
    wait_stages: [vk::PipelineStageFlags; 1],
}

impl VulkanPresentDriver {
    pub fn new(device: &VulkanDevice, swapchain: &Swapchain) -> Self {
        Self {
            device: device.device.clone(),
            loader: swapchain.loader.clone(),
            swapchain: swapchain.swapchain,
            images: swapchain.images.clone(),
            queue: device.present_queue,
            wait_stages: [vk::PipelineStageFlags::TOP_OF_PIPE],
        }
    }
}

impl PresentDriver for VulkanPresentDriver {
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<u32> {
        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        }
        .context("Failed to acquire swapchain image")?;

        if suboptimal {
            bail!("Failed to acquire swapchain image: SUBOPTIMAL_KHR");
        }
        Ok(index)
    }

    fn record_transition(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        let image = *self
            .images
            .get(image_index as usize)
            .with_context(|| format!("Acquired image index {} out of range", image_index))?;

        // Which parts of the image to affect (all of it)
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range)
            .build();

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .context("Failed to begin command buffer")?;
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
            self.device
                .end_command_buffer(command_buffer)
                .context("Failed to end command buffer")?;
        }

        Ok(())
    }

    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores = [wait];
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers);

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info.build()], fence)
        }
        .context("Failed to submit frame")
    }

    fn wait_and_reset(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .context("Failed to wait for frame fence")?;
            self.device
                .reset_fences(&[fence])
                .context("Failed to reset frame fence")?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> Result<()> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let mut results = [vk::Result::SUCCESS];

        let present_info = vk::PresentInfoKHR::builder()
            .swapchains(&swapchains)
            .image_indices(&image_indices)
            .results(&mut results);

        let suboptimal = unsafe { self.loader.queue_present(self.queue, &present_info) }
            .context("Failed to present swapchain image")?;

        if results[0] != vk::Result::SUCCESS {
            bail!("Failed to present swapchain image: {:?}", results[0]);
        }
        if suboptimal {
            bail!("Failed to present swapchain image: SUBOPTIMAL_KHR");
        }
        Ok(())
    }
}
