// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash. Capability queries go through the
// enumerator; selection, negotiation and the frame protocol are written
// against small traits/pure functions so they run without a GPU in tests.

pub mod context;
pub mod device;
pub mod enumerate;
pub mod instance;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use context::RenderContext;
