// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use kiln_core::init_tracing;
use kiln_platform::PlatformWindow;
use kiln_render::WindowSource;
use kiln_render_vk::host_alloc::{self, HostUsage};
use kiln_render_vk::{AshInstance, DeviceError, QueueRole, RendererContext, SwapchainSettings};
use tracing::{error, info, warn};

use kiln_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::WindowId,
};

mod config;

use config::{load_cfg, AppCfg};

const RESIZE_RETRY: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config
    #[arg(long, default_value = "kiln.toml")]
    config: PathBuf,
}

struct App {
    cfg: AppCfg,
    // ctx before window: the surface must go before the window it was created from
    ctx: Option<RendererContext<AshInstance>>,
    window: Option<Rc<PlatformWindow>>,
    failure: Option<anyhow::Error>,
}

impl App {
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let wcfg = &self.cfg.window;
        let window = Rc::new(PlatformWindow::create(event_loop, &wcfg.title, wcfg.size())?);
        let instance = AshInstance::new(&*window, &wcfg.title).context("vk instance")?;

        let source: Rc<dyn WindowSource> = window.clone();
        let mut ctx = RendererContext::new(instance, source, self.cfg.device.policy());
        ctx.create_device()?;
        if let Some(dev) = ctx.device() {
            info!(
                "device: {} (score {}, transfer queue {:?}, compute queue {:?})",
                dev.name(),
                dev.score(),
                dev.queue_or_graphics(QueueRole::Transfer),
                dev.queue_or_graphics(QueueRole::Compute)
            );
        }
        ctx.create_swapchain()?;

        if let (Some(mode), Some(current)) = (self.cfg.swapchain.present_mode, ctx.swapchain_settings()) {
            let wanted = SwapchainSettings {
                present_mode: mode.to_vk(),
                ..current
            };
            if !ctx.set_swapchain_settings(wanted)? {
                warn!("present mode {:?} unsupported, keeping {:?}", mode, current.present_mode);
            }
        }

        self.window = Some(window);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.teardown();
        self.failure = Some(err);
        event_loop.exit();
    }

    fn teardown(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.wait_idle() {
                warn!("wait idle failed: {e}");
            }
            ctx.destroy_swapchain();
            ctx.destroy_device();
            drop(ctx);
            let host = host_alloc::usage(HostUsage::RendererBackend);
            info!(
                "renderer torn down (driver host memory: {} B live, {} B peak)",
                host.live_bytes, host.peak_bytes
            );
        }
        self.window = None;
    }

    fn on_resized(&mut self) -> Result<(), DeviceError> {
        let (Some(window), Some(ctx)) = (&self.window, &mut self.ctx) else {
            return Ok(());
        };
        window.notify_resized();
        ctx.wait_idle()?;
        ctx.process_resize()?;
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Wait);
        if self.window.is_some() || self.failure.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.teardown();
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                info!("Resized → {}x{}", new_size.width, new_size.height);
                match self.on_resized() {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => self.fail(event_loop, anyhow!(e)),
                    Err(e) => {
                        warn!("swapchain rebuild failed, retrying: {e}");
                        event_loop.set_control_flow(ControlFlow::WaitUntil(Instant::now() + RESIZE_RETRY));
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        // a failed rebuild leaves the swapchain stale; pick it up again here
        let Some(ctx) = &mut self.ctx else {
            return;
        };
        if !ctx.resize_pending() {
            return;
        }
        match ctx.wait_idle().and_then(|()| ctx.process_resize()) {
            Ok(true) => {
                info!("swapchain rebuilt on retry");
                event_loop.set_control_flow(ControlFlow::Wait);
            }
            Ok(false) => {}
            Err(e) if e.is_fatal() => self.fail(event_loop, anyhow!(e)),
            Err(e) => {
                warn!("swapchain rebuild failed again: {e}");
                event_loop.set_control_flow(ControlFlow::WaitUntil(Instant::now() + RESIZE_RETRY));
            }
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App {
        cfg: load_cfg(&args.config),
        ctx: None,
        window: None,
        failure: None,
    };

    event_loop.run_app(&mut app)?;
    app.teardown();
    match app.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
