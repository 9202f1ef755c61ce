use ash::vk;

use crate::{
    accel, geometry, pipeline, scene, BufferDesc, Camera, Error, Extent, GeometryStore, Memory,
    SbtParam, SceneInstances, ShaderBindingTable, ShaderLibrary, TextureDesc, RAY_TYPE_COUNT,
};

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
const RAY_OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Which command sequence gets recorded for a frame. Toggling never touches
/// instance data, acceleration structures or the binding table; both paths
/// read the same buffers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RenderMode {
    Raster,
    RayTrace,
}

impl RenderMode {
    fn toggled(self) -> Self {
        match self {
            Self::Raster => Self::RayTrace,
            Self::RayTrace => Self::Raster,
        }
    }
}

pub struct RendererDesc<'a> {
    pub screen_size: Extent,
    pub surface_format: vk::Format,
    /// Compiled raytracing shader libraries. Expected to export the entry
    /// points "RayGen", "Miss", "ShadowMiss", "ReflectionMiss",
    /// "ClosestHit", "ShadowClosestHit" and "ReflectionClosestHit".
    pub libraries: Vec<ShaderLibrary>,
    pub raster_vertex: &'a [u32],
    pub raster_fragment: &'a [u32],
    /// Seed for the per-instance material colors, injected so runs are
    /// reproducible.
    pub material_seed: u64,
}

/// Drives the whole frame loop: updates per-instance and camera data,
/// refits the top-level structure, records either the raster or the
/// raytrace command sequence, submits and synchronizes.
///
/// One frame in flight: `update` blocks on the previous frame's sync point
/// before any host-visible buffer is rewritten, so the GPU never reads a
/// mapping the CPU is mutating.
pub struct Renderer {
    mode: RenderMode,
    screen_size: Extent,
    camera: Camera,
    geometry: GeometryStore,
    blases: Vec<accel::BottomLevel>,
    blas_addresses: Vec<u64>,
    tlas: accel::TlasBuilder,
    scene: SceneInstances,
    rt_pipeline: pipeline::RayTracingPipeline,
    raster_pipeline: pipeline::RasterPipeline,
    sbt_buffer: crate::Buffer,
    sbt_regions: crate::SbtRegions,
    camera_buf: crate::Buffer,
    instance_buf: crate::Buffer,
    material_bufs: Vec<crate::Buffer>,
    ray_output: crate::Texture,
    ray_output_view: crate::TextureView,
    ray_output_initialized: bool,
    depth: crate::Texture,
    depth_view: crate::TextureView,
    descriptor_pool: vk::DescriptorPool,
    rt_set: vk::DescriptorSet,
    raster_set: vk::DescriptorSet,
    command_encoder: crate::CommandEncoder,
    prev_sync_point: Option<crate::SyncPoint>,
}

impl Renderer {
    pub fn new(gpu: &crate::Context, desc: RendererDesc) -> Result<Self, Error> {
        let mut geometry = GeometryStore::new();
        let tet_data = geometry::tetrahedron_mesh();
        let plane_data = geometry::plane_mesh();
        let tet_mesh = geometry.upload(
            gpu,
            "tetrahedron",
            &tet_data.vertices,
            Some(&tet_data.indices[..]),
        )?;
        let plane_mesh = geometry.upload(
            gpu,
            "plane",
            &plane_data.vertices,
            Some(&plane_data.indices[..]),
        )?;

        let scene = SceneInstances::demo((tet_mesh, 0), (plane_mesh, 1));

        let rt_pipeline = gpu.create_ray_tracing_pipeline(pipeline::RayTracingPipelineDesc {
            name: "raytrace",
            libraries: &desc.libraries,
            hit_groups: &[
                pipeline::HitGroupDesc {
                    name: "HitGroup",
                    closest_hit: Some("ClosestHit"),
                    any_hit: None,
                    intersection: None,
                },
                pipeline::HitGroupDesc {
                    name: "ShadowHitGroup",
                    closest_hit: Some("ShadowClosestHit"),
                    any_hit: None,
                    intersection: None,
                },
                pipeline::HitGroupDesc {
                    name: "ReflectionHitGroup",
                    closest_hit: Some("ReflectionClosestHit"),
                    any_hit: None,
                    intersection: None,
                },
            ],
            associations: &[
                pipeline::RecordAssociation {
                    layout: pipeline::RecordLayout::empty(),
                    shaders: &["RayGen", "Miss", "ShadowMiss", "ReflectionMiss", "ShadowHitGroup"],
                },
                // Hit shaders read the instance's geometry and color block
                // straight from their binding-table record.
                pipeline::RecordAssociation {
                    layout: pipeline::RecordLayout::new(&[
                        pipeline::RecordParamKind::BufferAddress,
                        pipeline::RecordParamKind::BufferAddress,
                        pipeline::RecordParamKind::BufferAddress,
                    ]),
                    shaders: &["HitGroup", "ReflectionHitGroup"],
                },
            ],
            limits: pipeline::PipelineLimits {
                // RGB + distance + normal + hit flag, in floats.
                max_payload_size: 12 * 4,
                // Triangle barycentrics.
                max_attribute_size: 2 * 4,
                // Primary -> reflection -> shadow.
                max_recursion_depth: 3,
            },
        })?;

        let raster_pipeline = gpu.create_raster_pipeline(pipeline::RasterPipelineDesc {
            name: "raster",
            vertex_spirv: desc.raster_vertex,
            vertex_entry: "main",
            fragment_spirv: desc.raster_fragment,
            fragment_entry: "main",
            color_format: desc.surface_format,
            depth_format: DEPTH_FORMAT,
        })?;

        let camera_buf = gpu.create_buffer(BufferDesc {
            name: "camera",
            size: std::mem::size_of::<scene::CameraMatrices>() as u64,
            memory: Memory::Upload,
        })?;
        let instance_buf = gpu.create_buffer(BufferDesc {
            name: "instance transforms",
            size: (scene.len() * std::mem::size_of::<glam::Mat4>()) as u64,
            memory: Memory::Upload,
        })?;

        let mut rng = nanorand::WyRand::new_seed(desc.material_seed);
        let colors = scene::generate_instance_colors(scene.len(), &mut rng);
        let mut material_bufs = Vec::with_capacity(colors.len());
        for (index, block) in colors.iter().enumerate() {
            let buf = gpu.create_buffer(BufferDesc {
                name: &format!("materials[{}]", index),
                size: std::mem::size_of::<scene::InstanceColors>() as u64,
                memory: Memory::Upload,
            })?;
            buf.write_slice(0, std::slice::from_ref(block));
            material_bufs.push(buf);
        }

        let ray_output = gpu.create_texture(TextureDesc {
            name: "ray output",
            format: RAY_OUTPUT_FORMAT,
            size: desc.screen_size,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        })?;
        let ray_output_view = gpu.create_texture_view(
            ray_output,
            "ray output",
            RAY_OUTPUT_FORMAT,
            vk::ImageAspectFlags::COLOR,
        )?;
        let depth = gpu.create_texture(TextureDesc {
            name: "depth",
            format: DEPTH_FORMAT,
            size: desc.screen_size,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        })?;
        let depth_view =
            gpu.create_texture_view(depth, "depth", DEPTH_FORMAT, vk::ImageAspectFlags::DEPTH)?;

        // Build the acceleration structures up front and wait for them; the
        // scratch space is only needed until then.
        let mut command_encoder = gpu.create_command_encoder(crate::CommandEncoderDesc {
            name: "main",
            buffer_count: 2,
        });
        let mut temp_buffers = Vec::new();
        let mut blases = Vec::new();
        let mut tlas = accel::TlasBuilder::new("TLAS");
        command_encoder.start();
        {
            let cmd = command_encoder.raw();
            for mesh in [tet_mesh, plane_mesh] {
                let entry = accel::BlasTriangles::from(geometry.mesh(mesh));
                blases.push(accel::build_bottom_level(
                    gpu,
                    cmd,
                    "BLAS",
                    &[entry],
                    &mut temp_buffers,
                )?);
            }
            let blas_addresses = blases.iter().map(|b| b.address()).collect::<Vec<_>>();
            tlas.build(gpu, cmd, &scene.tlas_instances(&blas_addresses), false)?;
        }
        let sync_point = gpu.submit(&mut command_encoder);
        gpu.wait_for(&sync_point, !0);
        for buffer in temp_buffers.drain(..) {
            gpu.destroy_buffer(buffer);
        }
        let blas_addresses = blases.iter().map(|b| b.address()).collect::<Vec<_>>();

        let (descriptor_pool, rt_set, raster_set) = Self::create_descriptor_sets(
            gpu,
            &rt_pipeline,
            &raster_pipeline,
            tlas.raw().unwrap(),
            ray_output_view,
            camera_buf,
            instance_buf,
        )?;

        let (sbt_buffer, sbt_regions) = Self::encode_binding_table(
            gpu,
            &rt_pipeline,
            &scene,
            &geometry,
            &material_bufs,
        )?;

        Ok(Self {
            mode: RenderMode::Raster,
            screen_size: desc.screen_size,
            camera: Camera::looking_at(
                glam::Vec3::new(1.5, 1.5, 1.5),
                glam::Vec3::ZERO,
                desc.screen_size.width as f32 / desc.screen_size.height as f32,
            ),
            geometry,
            blases,
            blas_addresses,
            tlas,
            scene,
            rt_pipeline,
            raster_pipeline,
            sbt_buffer,
            sbt_regions,
            camera_buf,
            instance_buf,
            material_bufs,
            ray_output,
            ray_output_view,
            ray_output_initialized: false,
            depth,
            depth_view,
            descriptor_pool,
            rt_set,
            raster_set,
            command_encoder,
            prev_sync_point: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn create_descriptor_sets(
        gpu: &crate::Context,
        rt_pipeline: &pipeline::RayTracingPipeline,
        raster_pipeline: &pipeline::RasterPipeline,
        tlas: vk::AccelerationStructureKHR,
        ray_output_view: crate::TextureView,
        camera_buf: crate::Buffer,
        instance_buf: crate::Buffer,
    ) -> Result<(vk::DescriptorPool, vk::DescriptorSet, vk::DescriptorSet), Error> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(2)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { gpu.device.core.create_descriptor_pool(&pool_info, None)? };

        let set_layouts = [rt_pipeline.set_layout(), raster_pipeline.set_layout()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let sets = unsafe { gpu.device.core.allocate_descriptor_sets(&alloc_info)? };
        let (rt_set, raster_set) = (sets[0], sets[1]);

        let tlas_handles = [tlas];
        let mut tlas_write = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&tlas_handles);
        let output_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: ray_output_view.raw(),
            image_layout: vk::ImageLayout::GENERAL,
        }];
        let camera_info = [vk::DescriptorBufferInfo {
            buffer: camera_buf.raw(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let instance_info = [vk::DescriptorBufferInfo {
            buffer: instance_buf.raw(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(rt_set)
                .dst_binding(pipeline::GLOBAL_BINDING_TLAS)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .push_next(&mut tlas_write),
            vk::WriteDescriptorSet::default()
                .dst_set(rt_set)
                .dst_binding(pipeline::GLOBAL_BINDING_OUTPUT)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&output_info),
            vk::WriteDescriptorSet::default()
                .dst_set(rt_set)
                .dst_binding(pipeline::GLOBAL_BINDING_CAMERA)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&camera_info),
            vk::WriteDescriptorSet::default()
                .dst_set(raster_set)
                .dst_binding(pipeline::RASTER_BINDING_CAMERA)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&camera_info),
            vk::WriteDescriptorSet::default()
                .dst_set(raster_set)
                .dst_binding(pipeline::RASTER_BINDING_INSTANCES)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&instance_info),
        ];
        unsafe { gpu.device.core.update_descriptor_sets(&writes, &[]) };
        Ok((pool, rt_set, raster_set))
    }

    /// Fill and serialize the binding table: one ray-generation record,
    /// one miss record per ray type, then per instance one record per ray
    /// type, in instance order.
    fn encode_binding_table(
        gpu: &crate::Context,
        rt_pipeline: &pipeline::RayTracingPipeline,
        scene: &SceneInstances,
        geometry: &GeometryStore,
        material_bufs: &[crate::Buffer],
    ) -> Result<(crate::Buffer, crate::SbtRegions), Error> {
        let mut sbt = ShaderBindingTable::new();
        sbt.add_ray_generation("RayGen", Vec::new());
        sbt.add_miss("Miss", Vec::new());
        sbt.add_miss("ShadowMiss", Vec::new());
        sbt.add_miss("ReflectionMiss", Vec::new());
        for (index, instance) in scene.instances().iter().enumerate() {
            let mesh = geometry.mesh(instance.mesh);
            let geometry_params = vec![
                SbtParam::Buffer(gpu.buffer_device_address(mesh.vertex_buf)),
                SbtParam::Buffer(
                    gpu.buffer_device_address(mesh.index_buf.expect("demo meshes are indexed")),
                ),
                SbtParam::Buffer(gpu.buffer_device_address(material_bufs[index])),
            ];
            sbt.add_hit_group("HitGroup", geometry_params.clone());
            sbt.add_hit_group("ShadowHitGroup", Vec::new());
            sbt.add_hit_group("ReflectionHitGroup", geometry_params);
        }
        debug_assert_eq!(
            sbt.hit_group_count(),
            scene.len() as u32 * RAY_TYPE_COUNT,
        );

        let size = sbt.compute_size(gpu.ray_tracing_limits());
        let buffer = gpu.create_buffer(BufferDesc {
            name: "SBT",
            size,
            memory: Memory::Upload,
        })?;
        let regions = sbt.generate(gpu, rt_pipeline, buffer, size)?;
        Ok((buffer, regions))
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Flip raster <-> raytrace at frame granularity. No acceleration
    /// structure or binding table work happens here; the next `render` just
    /// records the other command sequence.
    pub fn toggle_mode(&mut self) {
        self.mode = self.mode.toggled();
        log::info!("Render mode: {:?}", self.mode);
    }

    pub fn set_mode(&mut self, mode: RenderMode) {
        self.mode = mode;
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn scene(&self) -> &SceneInstances {
        &self.scene
    }

    /// Per-frame CPU work. Waits out the previous frame first, which makes
    /// every mapped buffer safe to rewrite.
    #[profiling::function]
    pub fn update(&mut self, gpu: &crate::Context) {
        if let Some(sp) = self.prev_sync_point.take() {
            gpu.wait_for(&sp, !0);
        }
        self.scene.advance();
        self.camera_buf
            .write_slice(0, std::slice::from_ref(&self.camera.matrices()));
        self.instance_buf.write_slice(0, &self.scene.transforms());
    }

    /// Record, submit and present one frame.
    #[profiling::function]
    pub fn render(&mut self, gpu: &crate::Context, surface: &mut crate::Surface) -> Result<(), Error> {
        let frame = gpu.acquire_frame(surface);
        self.command_encoder.start();
        let cmd = self.command_encoder.raw();

        // Common prologue: the back buffer leaves the presentable state.
        image_barrier(
            gpu,
            cmd,
            frame.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );

        match self.mode {
            RenderMode::Raster => self.record_raster(gpu, cmd, frame.image, frame.view),
            RenderMode::RayTrace => self.record_ray_trace(gpu, cmd, frame.image)?,
        }

        self.command_encoder.present(frame);
        let sync_point = gpu.submit(&mut self.command_encoder);
        self.prev_sync_point = Some(sync_point);
        Ok(())
    }

    fn record_raster(
        &mut self,
        gpu: &crate::Context,
        cmd: vk::CommandBuffer,
        target_image: vk::Image,
        target: vk::ImageView,
    ) {
        image_barrier(
            gpu,
            cmd,
            self.depth.raw(),
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

        let color_attachments = [vk::RenderingAttachmentInfoKHR::default()
            .image_view(target)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.2, 0.4, 1.0],
                },
            })];
        let depth_attachment = vk::RenderingAttachmentInfoKHR::default()
            .image_view(self.depth_view.raw())
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering_info = vk::RenderingInfoKHR::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: self.screen_size.width,
                    height: self.screen_size.height,
                },
            })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        unsafe {
            gpu.device.dynamic_rendering.cmd_begin_rendering(cmd, &rendering_info);
            gpu.device.core.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.raster_pipeline.raw(),
            );
            // Flipped viewport, so the world keeps its Y up.
            gpu.device.core.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: self.screen_size.height as f32,
                    width: self.screen_size.width as f32,
                    height: -(self.screen_size.height as f32),
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            gpu.device.core.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: self.screen_size.width,
                        height: self.screen_size.height,
                    },
                }],
            );
            gpu.device.core.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.raster_pipeline.vk_layout(),
                0,
                &[self.raster_set],
                &[],
            );

            // One draw per instance, the instance index rides in a push
            // constant and selects the transform on the GPU side.
            for (index, instance) in self.scene.instances().iter().enumerate() {
                let mesh = self.geometry.mesh(instance.mesh);
                gpu.device.core.cmd_push_constants(
                    cmd,
                    self.raster_pipeline.vk_layout(),
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    &(index as u32).to_ne_bytes(),
                );
                gpu.device
                    .core
                    .cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buf.raw()], &[0]);
                match mesh.index_buf {
                    Some(index_buf) => {
                        gpu.device.core.cmd_bind_index_buffer(
                            cmd,
                            index_buf.raw(),
                            0,
                            vk::IndexType::UINT32,
                        );
                        gpu.device
                            .core
                            .cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
                    }
                    None => {
                        gpu.device.core.cmd_draw(cmd, mesh.vertex_count, 1, 0, 0);
                    }
                }
            }
            gpu.device.dynamic_rendering.cmd_end_rendering(cmd);
        }

        // Epilogue: back to presentable.
        image_barrier(
            gpu,
            cmd,
            target_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        );
    }

    fn record_ray_trace(
        &mut self,
        gpu: &crate::Context,
        cmd: vk::CommandBuffer,
        target: vk::Image,
    ) -> Result<(), Error> {
        // Refit the top-level structure for the transforms written during
        // `update`. Recording it in the same command stream as the trace
        // keeps the result buffer free of read/write races.
        let tlas_instances = self.scene.tlas_instances(&self.blas_addresses);
        self.tlas.build(gpu, cmd, &tlas_instances, true)?;

        // The ray output was a copy source last frame; make it writable.
        let old_layout = if self.ray_output_initialized {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        };
        image_barrier(
            gpu,
            cmd,
            self.ray_output.raw(),
            vk::ImageAspectFlags::COLOR,
            old_layout,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags::SHADER_WRITE,
        );

        unsafe {
            gpu.device.core.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.rt_pipeline.raw(),
            );
            gpu.device.core.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.rt_pipeline.vk_layout(),
                0,
                &[self.rt_set],
                &[],
            );
            // One ray per output pixel.
            gpu.device.ray_tracing_pipeline.cmd_trace_rays(
                cmd,
                &self.sbt_regions.ray_gen,
                &self.sbt_regions.miss,
                &self.sbt_regions.hit,
                &self.sbt_regions.callable,
                self.screen_size.width,
                self.screen_size.height,
                1,
            );
        }

        image_barrier(
            gpu,
            cmd,
            self.ray_output.raw(),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        );
        image_barrier(
            gpu,
            cmd,
            target,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        );

        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let full_extent = [
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: self.screen_size.width as i32,
                y: self.screen_size.height as i32,
                z: 1,
            },
        ];
        let blit = vk::ImageBlit {
            src_subresource: subresource,
            src_offsets: full_extent,
            dst_subresource: subresource,
            dst_offsets: full_extent,
        };
        unsafe {
            gpu.device.core.cmd_blit_image(
                cmd,
                self.ray_output.raw(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::NEAREST,
            );
        }

        image_barrier(
            gpu,
            cmd,
            target,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        );
        self.ray_output_initialized = true;
        Ok(())
    }

    /// Drain the GPU and release everything. The final wait guarantees no
    /// in-flight work still references the resources being freed.
    pub fn destroy(&mut self, gpu: &crate::Context) {
        if let Some(sp) = self.prev_sync_point.take() {
            gpu.wait_for(&sp, !0);
        }
        unsafe {
            gpu.device
                .core
                .destroy_descriptor_pool(self.descriptor_pool, None);
        }
        self.rt_pipeline.destroy(gpu);
        self.raster_pipeline.destroy(gpu);
        gpu.destroy_buffer(self.sbt_buffer);
        gpu.destroy_buffer(self.camera_buf);
        gpu.destroy_buffer(self.instance_buf);
        for buffer in self.material_bufs.drain(..) {
            gpu.destroy_buffer(buffer);
        }
        gpu.destroy_texture_view(self.ray_output_view);
        gpu.destroy_texture(self.ray_output);
        gpu.destroy_texture_view(self.depth_view);
        gpu.destroy_texture(self.depth);
        self.tlas.destroy(gpu);
        for blas in self.blases.drain(..) {
            blas.destroy(gpu);
        }
        self.geometry.destroy(gpu);
        gpu.destroy_command_encoder(&mut self.command_encoder);
    }
}

#[allow(clippy::too_many_arguments)]
fn image_barrier(
    gpu: &crate::Context,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspects: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags,
    src_access: vk::AccessFlags,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspects,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe {
        gpu.device.core.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_is_an_involution() {
        assert_eq!(RenderMode::Raster.toggled(), RenderMode::RayTrace);
        assert_eq!(RenderMode::RayTrace.toggled(), RenderMode::Raster);
        assert_eq!(RenderMode::Raster.toggled().toggled(), RenderMode::Raster);
    }
}
