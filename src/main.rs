// =============================================================================
// PRESENT LOOP - Vulkan context bring-up and a synchronized present loop
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, quit requests)                       │
// │    └── RenderContext                                            │
// │          ├── Instance + optional debug messenger                │
// │          ├── Surface                                            │
// │          ├── Device (selected by capability score)              │
// │          ├── Swapchain (negotiated from surface support)        │
// │          └── FrameSync + FrameSynchronizer                      │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (one frame per loop iteration, after all events are pumped):
// 1. Acquire swapchain image (signals semaphore)
// 2. Record layout transition to present layout
// 3. Submit, waiting on the semaphore, signaling the fence
// 4. Wait for and reset the fence
// 5. Present
//
// =============================================================================

mod backend;
mod config;

use anyhow::Result;
use backend::RenderContext;
use config::{Config, LoggingConfig};
use std::process::ExitCode;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> ExitCode {
    // Load configuration from config.toml; problems are reported once the
    // logger is up
    let loaded = Config::load();
    init_logging(&loaded.config.logging);
    loaded.report();

    exit_status(run(loaded.config))
}

/// Run the event loop until quit or the first fatal error. The app, and with
/// it every GPU resource, is gone by the time this returns.
fn run(config: Config) -> Result<()> {
    log::info!("Starting present loop");
    log::info!(
        "Window: {}x{} \"{}\"",
        config.window.width,
        config.window.height,
        config.window.title
    );

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Single place the outcome is reported
fn exit_status(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => {
            log::info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging. A filter from a loaded config wins over RUST_LOG,
/// default is info.
fn init_logging(config: &LoggingConfig) {
    use env_logger::{Builder, Env};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(ref filter) = config.filter {
        builder.parse_filters(filter);
    }
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The render context must be
/// gone before the window it presents to.
struct App {
    config: Config,
    context: Option<RenderContext>,
    window: Option<Arc<Window>>,
    /// First fatal error; ends the loop and is reported by `main`
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            context: None,
            window: None,
            fatal: None,
        }
    }

    /// Record the first fatal error and stop the loop. `main` reports it.
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    fn create_window(&self, event_loop: &ActiveEventLoop) -> Result<Arc<Window>> {
        let attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        Ok(Arc::new(event_loop.create_window(attributes)?))
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match self.create_window(event_loop) {
            Ok(window) => window,
            Err(e) => return self.fail(event_loop, e.context("Failed to create window")),
        };

        let requirements = self.config.requirements();
        match RenderContext::new(&window, &self.config.window.title, &requirements) {
            Ok(context) => self.context = Some(context),
            Err(e) => return self.fail(event_loop, e.context("Failed to initialize Vulkan")),
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// All pending events were handled; run exactly one frame.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if event_loop.exiting() {
            return;
        }

        let result = match self.context.as_mut() {
            Some(context) => context.render_frame(),
            None => return,
        };

        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }

    /// Release GPU resources before the window goes away.
    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(context) = self.context.take() {
            log::info!(
                "Presented {} frames on a {}-image {}x{} swapchain",
                context.frames_presented(),
                context.image_count(),
                context.extent().width,
                context.extent().height
            );
            drop(context);
        }
        self.window = None;
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_error_gives_failure_status() {
        let error = anyhow::anyhow!("ERROR_DEVICE_LOST").context("Frame 3 aborted in state Submitted");
        assert_eq!(exit_status(Err(error)), ExitCode::FAILURE);
    }

    #[test]
    fn clean_run_gives_success_status() {
        assert_eq!(exit_status(Ok(())), ExitCode::SUCCESS);
    }
}
