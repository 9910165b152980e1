// Swapchain - Window presentation
//
// Negotiates format, extent, present mode, composite alpha and sharing mode
// from what the surface reports, then creates the chain of images we
// present to the screen.

use anyhow::{bail, Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::device::{QueueFamilyChoice, VulkanDevice};
use super::enumerate::enumerate;
use super::surface::{SurfaceSupport, WindowSurface};

/// Composite alpha modes in the order we try them
const COMPOSITE_ALPHA_PRIORITY: [vk::CompositeAlphaFlagsKHR; 4] = [
    vk::CompositeAlphaFlagsKHR::OPAQUE,
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::INHERIT,
];

/// Everything needed to create a swapchain. Fixed for the swapchain's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub sharing_mode: vk::SharingMode,
    /// Empty for exclusive sharing, otherwise the two sharing families
    pub queue_family_indices: Vec<u32>,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// Outcome of negotiation plus the soft warnings it raised, for the caller to log
#[derive(Debug, Clone)]
pub struct Negotiation {
    pub config: SwapchainConfig,
    pub warnings: Vec<String>,
}

/// Prefer B8G8R8A8_SRGB with non-linear sRGB, else the first reported format.
/// The flag is true when the fallback was taken.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Result<(vk::SurfaceFormatKHR, bool)> {
    let preferred = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_SRGB
            && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });

    match (preferred, formats.first()) {
        (Some(&format), _) => Ok((format, false)),
        (None, Some(&first)) => Ok((first, true)),
        (None, None) => bail!("Surface reports no supported formats"),
    }
}

/// MAILBOX if offered, otherwise FIFO which is always available
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_composite_alpha(
    supported: vk::CompositeAlphaFlagsKHR,
) -> Result<vk::CompositeAlphaFlagsKHR> {
    COMPOSITE_ALPHA_PRIORITY
        .iter()
        .copied()
        .find(|&mode| supported.contains(mode))
        .with_context(|| format!("Surface supports no composite alpha mode ({:?})", supported))
}

/// Clamp each axis of the drawable size into the surface's image extent bounds
pub fn clamp_extent(
    drawable: vk::Extent2D,
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::Extent2D {
    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: drawable.width.max(min.width).min(max.width),
        height: drawable.height.max(min.height).min(max.height),
    }
}

pub fn sharing_mode(queues: QueueFamilyChoice) -> (vk::SharingMode, Vec<u32>) {
    if queues.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![queues.graphics, queues.present],
        )
    }
}

/// Derive the swapchain configuration from the surface's reported support
pub fn negotiate(
    support: &SurfaceSupport,
    drawable: vk::Extent2D,
    queues: QueueFamilyChoice,
) -> Result<Negotiation> {
    let mut warnings = Vec::new();

    let (surface_format, fell_back) = choose_surface_format(&support.formats)?;
    if fell_back {
        let warning = format!(
            "Preferred surface format B8G8R8A8_SRGB/SRGB_NONLINEAR unavailable, using {:?}/{:?}; colors may be inaccurate",
            surface_format.format, surface_format.color_space
        );
        warnings.push(warning);
    }

    let capabilities = &support.capabilities;
    let (sharing_mode, queue_family_indices) = sharing_mode(queues);

    let config = SwapchainConfig {
        format: surface_format.format,
        color_space: surface_format.color_space,
        extent: clamp_extent(drawable, capabilities),
        present_mode: choose_present_mode(&support.present_modes),
        composite_alpha: choose_composite_alpha(capabilities.supported_composite_alpha)?,
        sharing_mode,
        queue_family_indices,
        image_count: capabilities.min_image_count,
        pre_transform: capabilities.current_transform,
    };

    Ok(Negotiation { config, warnings })
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub config: SwapchainConfig,
    _device: Arc<VulkanDevice>,
    _surface: Arc<WindowSurface>,
}

impl Swapchain {
    /// Negotiate against `surface` and create the swapchain on `device`
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: Arc<WindowSurface>,
        drawable: vk::Extent2D,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", drawable.width, drawable.height);

        let support = surface.support(device.physical_device)?;
        let Negotiation { config, warnings } = negotiate(&support, drawable, device.queues)?;
        for warning in &warnings {
            log::warn!("{}", warning);
        }

        log::info!(
            "Swapchain config: {:?}/{:?} {}x{} {:?} alpha={:?} sharing={:?} min images={}",
            config.format,
            config.color_space,
            config.extent.width,
            config.extent.height,
            config.present_mode,
            config.composite_alpha,
            config.sharing_mode,
            config.image_count
        );

        let loader = khr::Swapchain::new(&device.instance.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.surface)
            .min_image_count(config.image_count)
            .image_format(config.format)
            .image_color_space(config.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(config.sharing_mode)
            .queue_family_indices(&config.queue_family_indices)
            .pre_transform(config.pre_transform)
            .composite_alpha(config.composite_alpha)
            .present_mode(config.present_mode)
            .clipped(true);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let fp = loader.fp();
        let images = enumerate("swapchain images", |count, data| unsafe {
            (fp.get_swapchain_images_khr)(device.device.handle(), swapchain, count, data)
        });
        let images = match images {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        Ok(Self {
            swapchain,
            loader,
            images,
            config,
            _device: device,
            _surface: surface,
        })
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::info!("Destroying swapchain...");
        unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
    }
}
