//! Windowed runner: one engine update per redraw.

use std::sync::Arc;
use std::time::Instant;

use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

use crate::context::GraphicsContext;
use crate::engine::{Engine, EngineConfig, FrameStats};
use crate::error::{EngineError, SimulationError};
use crate::gpu::WgpuContext;

type Setup = Box<dyn FnOnce(&mut Engine<WgpuContext>) -> Result<(), EngineError>>;
type OnFrame = Box<dyn FnMut(&mut Engine<WgpuContext>, &FrameStats)>;

/// Open a window, declare variables with `setup`, build, and run until the
/// window closes.
pub fn run<S>(title: &str, config: EngineConfig, setup: S) -> Result<(), SimulationError>
where
    S: FnOnce(&mut Engine<WgpuContext>) -> Result<(), EngineError> + 'static,
{
    run_with(title, config, setup, |_, _| {})
}

/// Like [`run`], calling `on_frame` after every update.
pub fn run_with<S, F>(title: &str, config: EngineConfig, setup: S, on_frame: F) -> Result<(), SimulationError>
where
    S: FnOnce(&mut Engine<WgpuContext>) -> Result<(), EngineError> + 'static,
    F: FnMut(&mut Engine<WgpuContext>, &FrameStats) + 'static,
{
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App {
        title: title.to_string(),
        config: Some(config),
        setup: Some(Box::new(setup)),
        on_frame: Box::new(on_frame),
        window: None,
        engine: None,
        mouse_pressed: false,
        last_mouse_pos: None,
        last_frame: Instant::now(),
        error: None,
    };
    event_loop.run_app(&mut app)?;

    match app.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct App {
    title: String,
    config: Option<EngineConfig>,
    setup: Option<Setup>,
    on_frame: OnFrame,
    window: Option<Arc<Window>>,
    engine: Option<Engine<WgpuContext>>,
    mouse_pressed: bool,
    last_mouse_pos: Option<(f64, f64)>,
    last_frame: Instant,
    error: Option<SimulationError>,
}

impl App {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<(), SimulationError> {
        let window_attrs = Window::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(winit::dpi::LogicalSize::new(1280, 720));
        let window = Arc::new(event_loop.create_window(window_attrs)?);
        let ctx = WgpuContext::new(window.clone())?;

        let mut engine = Engine::new(ctx, self.config.take().unwrap_or_default());
        if let Some(setup) = self.setup.take() {
            setup(&mut engine)?;
        }
        let report = engine.build()?;
        for miss in report.unresolved() {
            tracing::warn!(program = %miss.program, name = %miss.name, "variable not used by its program");
        }

        window.request_redraw();
        self.window = Some(window);
        self.engine = Some(engine);
        self.last_frame = Instant::now();
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: SimulationError) {
        tracing::error!(error = %error, "runner stopped");
        self.error = Some(error);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.start(event_loop) {
                self.fail(event_loop, e);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                if let Some(engine) = &mut self.engine {
                    engine.dispose();
                }
                event_loop.exit();
            }
            WindowEvent::Resized(physical_size) => {
                if let Some(engine) = &mut self.engine {
                    engine
                        .context_mut()
                        .resize(physical_size.width, physical_size.height);
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Space),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => {
                if let Some(engine) = &mut self.engine {
                    engine.time_mut().toggle_pause();
                    tracing::info!(paused = engine.time().is_paused(), "clock toggled");
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                if button == MouseButton::Left {
                    self.mouse_pressed = state == ElementState::Pressed;
                    if !self.mouse_pressed {
                        self.last_mouse_pos = None;
                    }
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                if self.mouse_pressed {
                    if let (Some((last_x, last_y)), Some(engine)) = (self.last_mouse_pos, &mut self.engine) {
                        engine
                            .camera_mut()
                            .orbit((position.x - last_x) as f32, (position.y - last_y) as f32);
                    }
                    self.last_mouse_pos = Some((position.x, position.y));
                }
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let scroll = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 * 0.1,
                };
                if let Some(engine) = &mut self.engine {
                    engine.camera_mut().zoom(scroll);
                }
            }
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                let delta = now.duration_since(self.last_frame).as_secs_f32();
                self.last_frame = now;

                let Some(engine) = &mut self.engine else {
                    return;
                };
                match engine.update(delta) {
                    Ok(stats) => {
                        if stats.faults > 0 {
                            tracing::debug!(frame = stats.frame, faults = stats.faults, "frame raised device faults");
                        }
                        (self.on_frame)(engine, &stats);
                    }
                    Err(EngineError::Gpu(e)) => {
                        // A dropped frame is recoverable; the next redraw acquires again.
                        tracing::warn!(error = %e, "frame skipped");
                    }
                    Err(e) => {
                        self.fail(event_loop, e.into());
                        return;
                    }
                }
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }
}
