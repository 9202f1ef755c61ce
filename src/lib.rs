#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
    // Matches are good and extendable, no need to make an exception here.
    clippy::single_match,
    // Push commands are more regular than macros.
    clippy::vec_init_then_push,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

use ash::vk;
use std::sync::Mutex;

mod accel;
mod geometry;
mod init;
mod pipeline;
mod renderer;
mod resource;
mod sbt;
mod scene;
mod surface;

pub use accel::{build_bottom_level, BlasTriangles, BottomLevel, TlasBuilder, TlasInstance};
pub use geometry::{
    plane_mesh, tetrahedron_mesh, GeometryStore, MeshBuffers, MeshData, MeshHandle, Vertex,
};
pub use pipeline::{
    HitGroupDesc, PipelineLimits, RasterPipeline, RasterPipelineDesc, RayTracingPipeline,
    RayTracingPipelineDesc, RecordAssociation, RecordLayout, RecordParamKind, ShaderExport,
    ShaderLibrary, ShaderStage,
};
pub use renderer::{RenderMode, Renderer, RendererDesc};
pub use sbt::{SbtParam, SbtRegions, ShaderBindingTable};
pub use scene::{
    generate_instance_colors, Camera, CameraMatrices, InstanceColors, SceneInstance,
    SceneInstances, RAY_TYPE_COUNT,
};
pub use surface::{Frame, Surface, SurfaceConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The raytracing capability check failed. Fatal at startup, there is
    /// no fallback path.
    #[error("no suitable GPU: {0}")]
    NotSupported(&'static str),
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),
    #[error("pipeline compilation failed: {0}")]
    PipelineCompile(String),
    #[error("shader binding table layout: {0}")]
    SbtLayout(String),
    #[error("shader binding table needs {needed} bytes, destination holds {available}")]
    SbtOverflow { needed: u64, available: u64 },
    #[error("geometry has no primitives")]
    EmptyGeometry,
    #[error("scene contains no instances")]
    EmptyScene,
    #[error("top-level refit requires a prior full build with the same topology")]
    RefitBeforeBuild,
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
}

#[derive(Debug)]
pub struct ContextDesc {
    pub validation: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Memory {
    /// Device-local, not host-reachable.
    Device,
    /// Device-local and host-mapped.
    Shared,
    /// Host-mapped, for one-way CPU to GPU traffic.
    Upload,
}

#[derive(Debug)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub memory: Memory,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq)]
pub struct Buffer {
    raw: vk::Buffer,
    memory_handle: usize,
    mapped_data: *mut u8,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Host pointer to the start of the buffer.
    ///
    /// Only valid for `Memory::Shared` and `Memory::Upload` buffers.
    pub fn data(&self) -> *mut u8 {
        assert!(
            !self.mapped_data.is_null(),
            "buffer is not host-visible, can't be mapped"
        );
        self.mapped_data
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq)]
pub struct Texture {
    raw: vk::Image,
    memory_handle: usize,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq)]
pub struct TextureView {
    raw: vk::ImageView,
}

#[derive(Debug)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub format: vk::Format,
    pub size: Extent,
    pub usage: vk::ImageUsageFlags,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

/// Timeline value signaled by the GPU when the corresponding submission
/// retires. The CPU compares its locally held value against
/// [`Context::gpu_progress`] to decide whether to wait.
#[derive(Clone, Debug)]
pub struct SyncPoint {
    progress: u64,
}

impl SyncPoint {
    pub fn value(&self) -> u64 {
        self.progress
    }
}

/// Device limits that shape shader binding table encoding, cached at
/// context initialization.
#[derive(Clone, Copy, Debug)]
pub struct RayTracingLimits {
    pub group_handle_size: u32,
    pub group_handle_alignment: u32,
    pub group_base_alignment: u32,
    pub max_recursion_depth: u32,
    pub max_group_stride: u32,
}

struct Instance {
    core: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    surface: ash::khr::surface::Instance,
}

struct Device {
    core: ash::Device,
    swapchain: ash::khr::swapchain::Device,
    dynamic_rendering: ash::khr::dynamic_rendering::Device,
    acceleration_structure: ash::khr::acceleration_structure::Device,
    ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

struct Queue {
    raw: vk::Queue,
    timeline_semaphore: vk::Semaphore,
    present_semaphore: vk::Semaphore,
    last_progress: u64,
}

struct MemoryManager {
    allocator: gpu_alloc::GpuAllocator<vk::DeviceMemory>,
    slab: slab::Slab<gpu_alloc::MemoryBlock<vk::DeviceMemory>>,
    valid_ash_memory_types: u32,
}

pub struct Context {
    memory: Mutex<MemoryManager>,
    device: Device,
    queue: Mutex<Queue>,
    queue_family_index: u32,
    physical_device: vk::PhysicalDevice,
    rt_limits: RayTracingLimits,
    instance: Instance,
    entry: ash::Entry,
}

impl Context {
    pub fn ray_tracing_limits(&self) -> &RayTracingLimits {
        &self.rt_limits
    }
}

struct PresentIntent {
    swapchain: vk::SwapchainKHR,
    image_index: u32,
    acquire_semaphore: vk::Semaphore,
}

pub struct CommandEncoderDesc<'a> {
    pub name: &'a str,
    /// Number of command buffers rotated through by the encoder. Two is
    /// enough for one frame being recorded while the previous one runs.
    pub buffer_count: u32,
}

pub struct CommandEncoder {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    device: ash::Device,
    present: Option<PresentIntent>,
}

impl CommandEncoder {
    pub fn start(&mut self) {
        self.buffers.rotate_left(1);
        let vk_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(self.buffers[0], &vk_info)
                .unwrap();
        }
    }

    /// The command buffer currently being recorded.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffers[0]
    }

    /// Schedule `frame` for presentation on the next submit.
    pub fn present(&mut self, frame: Frame) {
        assert!(self.present.is_none(), "only one frame can be presented");
        self.present = Some(PresentIntent {
            swapchain: frame.swapchain,
            image_index: frame.image_index,
            acquire_semaphore: frame.acquire_semaphore,
        });
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[test]
fn test_align_up() {
    assert_eq!(align_up(0, 64), 0);
    assert_eq!(align_up(1, 64), 64);
    assert_eq!(align_up(64, 64), 64);
    assert_eq!(align_up(65, 32), 96);
}
