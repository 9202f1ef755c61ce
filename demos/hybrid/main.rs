#![allow(irrefutable_let_patterns)]

use std::{fs, io, path::Path};

use flare::{RenderMode, ShaderExport, ShaderLibrary, ShaderStage};

const SHADER_DIR: &str = "demos/hybrid/shaders/spv";

fn load_spirv(file_name: &str) -> Vec<u32> {
    let path = Path::new(SHADER_DIR).join(file_name);
    let bytes = fs::read(&path)
        .unwrap_or_else(|e| panic!("unable to read {} ({}), run shaders/compile.sh first", path.display(), e));
    ash::util::read_spv(&mut io::Cursor::new(bytes)).unwrap()
}

fn library(file_name: &str, exports: &[(&str, ShaderStage, u32)]) -> ShaderLibrary {
    ShaderLibrary {
        spirv: load_spirv(file_name),
        exports: exports
            .iter()
            .map(|&(name, stage, trace_depth)| ShaderExport::new(name, stage, trace_depth))
            .collect(),
    }
}

struct Example {
    renderer: flare::Renderer,
    surface: flare::Surface,
    context: flare::Context,
}

impl Example {
    fn new(window: &winit::window::Window) -> Self {
        let window_size = window.inner_size();
        let screen_size = flare::Extent {
            width: window_size.width,
            height: window_size.height,
        };
        let context = unsafe {
            flare::Context::init_windowed(
                window,
                flare::ContextDesc {
                    validation: cfg!(debug_assertions),
                },
            )
            .unwrap()
        };
        let mut surface = context
            .create_surface(window, flare::SurfaceConfig { size: screen_size })
            .unwrap();

        let libraries = vec![
            library("raygen.spv", &[("RayGen", ShaderStage::RayGeneration, 3)]),
            library("miss.spv", &[("Miss", ShaderStage::Miss, 1)]),
            library("shadow_miss.spv", &[("ShadowMiss", ShaderStage::Miss, 1)]),
            library(
                "reflection_miss.spv",
                &[("ReflectionMiss", ShaderStage::Miss, 1)],
            ),
            library(
                "closest_hit.spv",
                &[("ClosestHit", ShaderStage::ClosestHit, 3)],
            ),
            library(
                "shadow_hit.spv",
                &[("ShadowClosestHit", ShaderStage::ClosestHit, 1)],
            ),
            library(
                "reflection_hit.spv",
                &[("ReflectionClosestHit", ShaderStage::ClosestHit, 3)],
            ),
        ];

        let renderer = match flare::Renderer::new(
            &context,
            flare::RendererDesc {
                screen_size,
                surface_format: surface.format(),
                libraries,
                raster_vertex: &load_spirv("raster_vs.spv"),
                raster_fragment: &load_spirv("raster_fs.spv"),
                material_seed: 73,
            },
        ) {
            Ok(renderer) => renderer,
            Err(e) => {
                context.destroy_surface(&mut surface);
                panic!("renderer setup failed: {}", e);
            }
        };

        Self {
            renderer,
            surface,
            context,
        }
    }

    fn render(&mut self) {
        self.renderer.update(&self.context);
        self.renderer
            .render(&self.context, &mut self.surface)
            .unwrap();
    }

    fn delete(mut self) {
        self.renderer.destroy(&self.context);
        self.context.destroy_surface(&mut self.surface);
    }
}

fn main() {
    env_logger::init();

    let event_loop = winit::event_loop::EventLoop::new().unwrap();
    let window = winit::window::WindowBuilder::new()
        .with_title("flare: raster")
        .build(&event_loop)
        .unwrap();

    let mut example = Some(Example::new(&window));

    event_loop
        .run(move |event, target| match event {
            winit::event::Event::AboutToWait => {
                window.request_redraw();
            }
            winit::event::Event::WindowEvent { event, .. } => match event {
                winit::event::WindowEvent::KeyboardInput {
                    event:
                        winit::event::KeyEvent {
                            physical_key: winit::keyboard::PhysicalKey::Code(key_code),
                            state: winit::event::ElementState::Pressed,
                            ..
                        },
                    ..
                } => match key_code {
                    winit::keyboard::KeyCode::Space => {
                        let example = example.as_mut().unwrap();
                        example.renderer.toggle_mode();
                        window.set_title(match example.renderer.mode() {
                            RenderMode::Raster => "flare: raster",
                            RenderMode::RayTrace => "flare: raytrace",
                        });
                    }
                    winit::keyboard::KeyCode::Escape => {
                        target.exit();
                    }
                    _ => {}
                },
                winit::event::WindowEvent::RedrawRequested => {
                    example.as_mut().unwrap().render();
                }
                winit::event::WindowEvent::CloseRequested => {
                    target.exit();
                }
                _ => {}
            },
            winit::event::Event::LoopExiting => {
                if let Some(example) = example.take() {
                    example.delete();
                }
            }
            _ => {}
        })
        .unwrap();
}
