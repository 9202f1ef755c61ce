use ash::vk;
use std::{collections::HashMap, ffi};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ShaderStage {
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
}

impl ShaderStage {
    fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            Self::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            Self::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
        }
    }
}

/// One entry point exported by a shader library.
#[derive(Clone, Debug)]
pub struct ShaderExport {
    pub name: String,
    pub stage: ShaderStage,
    /// Deepest ray-recursion level the pipeline can reach through this
    /// shader, counting the ray that invoked it. E.g. a closest-hit that
    /// spawns a reflection ray whose hit spawns a shadow ray declares 3.
    pub trace_depth: u32,
}

impl ShaderExport {
    pub fn new(name: &str, stage: ShaderStage, trace_depth: u32) -> Self {
        Self {
            name: name.to_string(),
            stage,
            trace_depth,
        }
    }
}

/// A compiled shader module exporting one or more named entry points.
/// The source text never reaches this subsystem.
#[derive(Clone, Debug)]
pub struct ShaderLibrary {
    pub spirv: Vec<u32>,
    pub exports: Vec<ShaderExport>,
}

/// Bundle of intersection/any-hit/closest-hit entry points invoked together
/// on a ray-geometry hit, addressed by one symbolic name from the SBT.
#[derive(Clone, Copy, Debug)]
pub struct HitGroupDesc<'a> {
    pub name: &'a str,
    pub closest_hit: Option<&'a str>,
    pub any_hit: Option<&'a str>,
    pub intersection: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordParamKind {
    /// Raw buffer device address.
    BufferAddress,
    /// Base of a descriptor heap region.
    HeapBase,
}

/// The fixed-size parameter block a shader reads from its binding-table
/// record. Multiple shaders may share one layout.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordLayout {
    pub params: Vec<RecordParamKind>,
}

impl RecordLayout {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(params: &[RecordParamKind]) -> Self {
        Self {
            params: params.to_vec(),
        }
    }
}

/// Associates a record layout with the named shaders / hit groups.
/// Every binding-table addressable name must appear in exactly one
/// association.
#[derive(Clone, Debug)]
pub struct RecordAssociation<'a> {
    pub layout: RecordLayout,
    pub shaders: &'a [&'a str],
}

#[derive(Clone, Copy, Debug)]
pub struct PipelineLimits {
    /// Maximum ray-payload byte size. Keep minimal, oversized payloads
    /// trash the cache.
    pub max_payload_size: u32,
    /// Maximum hit-attribute byte size (barycentrics need 8).
    pub max_attribute_size: u32,
    /// Longest allowed ray-spawns-ray chain.
    pub max_recursion_depth: u32,
}

pub struct RayTracingPipelineDesc<'a> {
    pub name: &'a str,
    pub libraries: &'a [ShaderLibrary],
    pub hit_groups: &'a [HitGroupDesc<'a>],
    pub associations: &'a [RecordAssociation<'a>],
    pub limits: PipelineLimits,
}

enum ResolvedKind {
    General {
        stage_index: u32,
    },
    Hit {
        closest_hit: u32,
        any_hit: Option<u32>,
        intersection: Option<u32>,
    },
}

struct ResolvedGroup {
    name: String,
    kind: ResolvedKind,
    record: RecordLayout,
}

struct Resolved {
    /// (library index, export index) in stage order.
    stages: Vec<(usize, usize)>,
    /// Binding-table order: ray-generation, miss, hit groups.
    groups: Vec<ResolvedGroup>,
}

fn err(message: String) -> crate::Error {
    crate::Error::PipelineCompile(message)
}

/// Name/stage/recursion validation, independent of the device. Failures
/// here are configuration errors and surface before any GPU object exists.
fn resolve(desc: &RayTracingPipelineDesc, device_max_recursion: u32) -> Result<Resolved, crate::Error> {
    let mut exports = HashMap::<&str, (usize, usize)>::new();
    let mut stages = Vec::new();
    for (li, library) in desc.libraries.iter().enumerate() {
        for (ei, export) in library.exports.iter().enumerate() {
            if exports.insert(export.name.as_str(), (li, ei)).is_some() {
                return Err(err(format!("shader {:?} is exported twice", export.name)));
            }
            stages.push((li, ei));
        }
    }

    let stage_index = |name: &str, wanted: ShaderStage| -> Result<u32, crate::Error> {
        let &(li, ei) = exports
            .get(name)
            .ok_or_else(|| err(format!("missing shader entry point {:?}", name)))?;
        let export = &desc.libraries[li].exports[ei];
        if export.stage != wanted {
            return Err(err(format!(
                "shader {:?} is a {:?} entry point, expected {:?}",
                name, export.stage, wanted,
            )));
        }
        let position = stages.iter().position(|&s| s == (li, ei)).unwrap();
        Ok(position as u32)
    };

    let mut layouts = HashMap::<&str, &RecordLayout>::new();
    for association in desc.associations {
        for &name in association.shaders {
            if layouts.insert(name, &association.layout).is_some() {
                return Err(err(format!(
                    "shader {:?} is associated with more than one signature",
                    name
                )));
            }
        }
    }
    let mut take_layout = |name: &str| -> Result<RecordLayout, crate::Error> {
        layouts
            .remove(name)
            .cloned()
            .ok_or_else(|| err(format!("shader {:?} has no signature associated", name)))
    };

    let mut groups = Vec::new();
    for stage in [ShaderStage::RayGeneration, ShaderStage::Miss] {
        for library in desc.libraries {
            for export in library.exports.iter().filter(|e| e.stage == stage) {
                groups.push(ResolvedGroup {
                    name: export.name.clone(),
                    kind: ResolvedKind::General {
                        stage_index: stage_index(&export.name, stage)?,
                    },
                    record: take_layout(&export.name)?,
                });
            }
        }
    }
    for hit_group in desc.hit_groups {
        let closest_hit = match hit_group.closest_hit {
            Some(name) => stage_index(name, ShaderStage::ClosestHit)?,
            None => {
                return Err(err(format!(
                    "hit group {:?} has no closest-hit shader",
                    hit_group.name
                )))
            }
        };
        groups.push(ResolvedGroup {
            name: hit_group.name.to_string(),
            kind: ResolvedKind::Hit {
                closest_hit,
                any_hit: hit_group
                    .any_hit
                    .map(|name| stage_index(name, ShaderStage::AnyHit))
                    .transpose()?,
                intersection: hit_group
                    .intersection
                    .map(|name| stage_index(name, ShaderStage::Intersection))
                    .transpose()?,
            },
            record: take_layout(hit_group.name)?,
        });
    }

    let required_depth = desc
        .libraries
        .iter()
        .flat_map(|library| library.exports.iter())
        .map(|export| export.trace_depth)
        .max()
        .unwrap_or(0);
    if desc.limits.max_recursion_depth < required_depth {
        return Err(err(format!(
            "recursion depth {} is below the declared shader chain of {}",
            desc.limits.max_recursion_depth, required_depth,
        )));
    }
    if desc.limits.max_recursion_depth > device_max_recursion {
        return Err(err(format!(
            "recursion depth {} exceeds the device limit of {}",
            desc.limits.max_recursion_depth, device_max_recursion,
        )));
    }

    Ok(Resolved { stages, groups })
}

struct GroupInfo {
    index: u32,
    record: RecordLayout,
}

/// Executable multi-shader raytracing pipeline. Shader-group handles are
/// fetched once at compile time; afterwards every lookup is a plain map
/// access into a fixed byte blob, keeping the per-frame encode path free of
/// dynamic dispatch.
pub struct RayTracingPipeline {
    raw: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    handles: Vec<u8>,
    handle_size: u32,
    groups: HashMap<String, GroupInfo>,
}

impl RayTracingPipeline {
    /// Opaque shader identifier for the named shader or hit group, as
    /// recorded in the binding table.
    pub fn group_handle(&self, name: &str) -> Result<&[u8], crate::Error> {
        let info = self
            .groups
            .get(name)
            .ok_or_else(|| err(format!("missing shader entry point {:?}", name)))?;
        let size = self.handle_size as usize;
        let base = info.index as usize * size;
        Ok(&self.handles[base..base + size])
    }

    pub fn record_layout(&self, name: &str) -> Option<&RecordLayout> {
        self.groups.get(name).map(|info| &info.record)
    }

    pub(crate) fn raw(&self) -> vk::Pipeline {
        self.raw
    }

    pub(crate) fn vk_layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub(crate) fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn destroy(&mut self, gpu: &crate::Context) {
        unsafe {
            gpu.device.core.destroy_pipeline(self.raw, None);
            gpu.device.core.destroy_pipeline_layout(self.layout, None);
            gpu.device
                .core
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Global bindings shared by every raytracing shader: the scene structure,
/// the ray output image and the camera block.
pub(crate) const GLOBAL_BINDING_TLAS: u32 = 0;
pub(crate) const GLOBAL_BINDING_OUTPUT: u32 = 1;
pub(crate) const GLOBAL_BINDING_CAMERA: u32 = 2;

impl crate::Context {
    pub fn create_ray_tracing_pipeline(
        &self,
        desc: RayTracingPipelineDesc,
    ) -> Result<RayTracingPipeline, crate::Error> {
        let resolved = resolve(&desc, self.rt_limits.max_recursion_depth)?;

        let mut modules = Vec::with_capacity(desc.libraries.len());
        for library in desc.libraries {
            let vk_info = vk::ShaderModuleCreateInfo::default().code(&library.spirv);
            modules.push(unsafe { self.device.core.create_shader_module(&vk_info, None)? });
        }

        let entry_points = resolved
            .stages
            .iter()
            .map(|&(li, ei)| {
                ffi::CString::new(desc.libraries[li].exports[ei].name.as_str()).unwrap()
            })
            .collect::<Vec<_>>();
        let vk_stages = resolved
            .stages
            .iter()
            .zip(entry_points.iter())
            .map(|(&(li, ei), entry_point)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(desc.libraries[li].exports[ei].stage.to_vk())
                    .module(modules[li])
                    .name(entry_point)
            })
            .collect::<Vec<_>>();

        let vk_groups = resolved
            .groups
            .iter()
            .map(|group| {
                let mut vk_group = vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR);
                match group.kind {
                    ResolvedKind::General { stage_index } => {
                        vk_group = vk_group
                            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                            .general_shader(stage_index);
                    }
                    ResolvedKind::Hit {
                        closest_hit,
                        any_hit,
                        intersection,
                    } => {
                        vk_group = vk_group
                            .ty(match intersection {
                                Some(_) => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
                                None => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                            })
                            .closest_hit_shader(closest_hit);
                        if let Some(index) = any_hit {
                            vk_group = vk_group.any_hit_shader(index);
                        }
                        if let Some(index) = intersection {
                            vk_group = vk_group.intersection_shader(index);
                        }
                    }
                }
                vk_group
            })
            .collect::<Vec<_>>();

        let set_layout = {
            let bindings = [
                vk::DescriptorSetLayoutBinding::default()
                    .binding(GLOBAL_BINDING_TLAS)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .descriptor_count(1)
                    .stage_flags(
                        vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                    ),
                vk::DescriptorSetLayoutBinding::default()
                    .binding(GLOBAL_BINDING_OUTPUT)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
                vk::DescriptorSetLayoutBinding::default()
                    .binding(GLOBAL_BINDING_CAMERA)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(
                        vk::ShaderStageFlags::RAYGEN_KHR
                            | vk::ShaderStageFlags::MISS_KHR
                            | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                    ),
            ];
            let vk_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            unsafe { self.device.core.create_descriptor_set_layout(&vk_info, None)? }
        };

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = unsafe { self.device.core.create_pipeline_layout(&layout_info, None)? };

        let interface_info = vk::RayTracingPipelineInterfaceCreateInfoKHR::default()
            .max_pipeline_ray_payload_size(desc.limits.max_payload_size)
            .max_pipeline_ray_hit_attribute_size(desc.limits.max_attribute_size);
        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&vk_stages)
            .groups(&vk_groups)
            .max_pipeline_ray_recursion_depth(desc.limits.max_recursion_depth)
            .library_interface(&interface_info)
            .layout(layout);

        let raw = match unsafe {
            self.device.ray_tracing_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                for module in modules.drain(..) {
                    unsafe { self.device.core.destroy_shader_module(module, None) };
                }
                return Err(err(format!("vkCreateRayTracingPipelinesKHR: {}", e)));
            }
        };
        for module in modules.drain(..) {
            unsafe { self.device.core.destroy_shader_module(module, None) };
        }
        if !desc.name.is_empty() {
            self.set_object_name(raw, desc.name);
        }

        let handle_size = self.rt_limits.group_handle_size;
        let handles = unsafe {
            self.device
                .ray_tracing_pipeline
                .get_ray_tracing_shader_group_handles(
                    raw,
                    0,
                    resolved.groups.len() as u32,
                    resolved.groups.len() * handle_size as usize,
                )?
        };

        let groups = resolved
            .groups
            .into_iter()
            .enumerate()
            .map(|(index, group)| {
                (
                    group.name,
                    GroupInfo {
                        index: index as u32,
                        record: group.record,
                    },
                )
            })
            .collect();

        log::info!(
            "Compiled raytracing pipeline {:?}: {} stages, {} groups, recursion {}",
            desc.name,
            vk_stages.len(),
            vk_groups.len(),
            desc.limits.max_recursion_depth,
        );
        Ok(RayTracingPipeline {
            raw,
            layout,
            set_layout,
            handles,
            handle_size,
            groups,
        })
    }
}

pub struct RasterPipelineDesc<'a> {
    pub name: &'a str,
    pub vertex_spirv: &'a [u32],
    pub vertex_entry: &'a str,
    pub fragment_spirv: &'a [u32],
    pub fragment_entry: &'a str,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

pub(crate) const RASTER_BINDING_CAMERA: u32 = 0;
pub(crate) const RASTER_BINDING_INSTANCES: u32 = 1;

/// Conventional vertex/index draw pipeline. Shares the camera block and the
/// per-instance transform buffer with the raytracing path; the instance
/// index arrives as a push constant.
pub struct RasterPipeline {
    raw: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
}

impl RasterPipeline {
    pub(crate) fn raw(&self) -> vk::Pipeline {
        self.raw
    }

    pub(crate) fn vk_layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub(crate) fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn destroy(&mut self, gpu: &crate::Context) {
        unsafe {
            gpu.device.core.destroy_pipeline(self.raw, None);
            gpu.device.core.destroy_pipeline_layout(self.layout, None);
            gpu.device
                .core
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

impl crate::Context {
    pub fn create_raster_pipeline(
        &self,
        desc: RasterPipelineDesc,
    ) -> Result<RasterPipeline, crate::Error> {
        let set_layout = {
            let bindings = [
                vk::DescriptorSetLayoutBinding::default()
                    .binding(RASTER_BINDING_CAMERA)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX),
                vk::DescriptorSetLayoutBinding::default()
                    .binding(RASTER_BINDING_INSTANCES)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX),
            ];
            let vk_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            unsafe { self.device.core.create_descriptor_set_layout(&vk_info, None)? }
        };

        let set_layouts = [set_layout];
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(4)];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { self.device.core.create_pipeline_layout(&layout_info, None)? };

        let vs_info = vk::ShaderModuleCreateInfo::default().code(desc.vertex_spirv);
        let vs_module = unsafe { self.device.core.create_shader_module(&vs_info, None)? };
        let fs_info = vk::ShaderModuleCreateInfo::default().code(desc.fragment_spirv);
        let fs_module = unsafe { self.device.core.create_shader_module(&fs_info, None)? };
        let vs_entry = ffi::CString::new(desc.vertex_entry).unwrap();
        let fs_entry = ffi::CString::new(desc.fragment_entry).unwrap();

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vs_module)
                .name(&vs_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fs_module)
                .name(&fs_entry),
        ];

        let vertex_bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<crate::Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vertex_attributes = [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 12,
            },
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .cull_mode(vk::CullModeFlags::NONE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS);
        let color_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [desc.color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfoKHR::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(desc.depth_format);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let result = unsafe {
            self.device.core.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        };
        unsafe {
            self.device.core.destroy_shader_module(vs_module, None);
            self.device.core.destroy_shader_module(fs_module, None);
        }
        let raw = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => return Err(err(format!("vkCreateGraphicsPipelines: {}", e))),
        };
        if !desc.name.is_empty() {
            self.set_object_name(raw, desc.name);
        }

        Ok(RasterPipeline {
            raw,
            layout,
            set_layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library(exports: &[(&str, ShaderStage, u32)]) -> ShaderLibrary {
        ShaderLibrary {
            spirv: vec![0x0723_0203],
            exports: exports
                .iter()
                .map(|&(name, stage, depth)| ShaderExport::new(name, stage, depth))
                .collect(),
        }
    }

    fn hit_group<'a>(name: &'a str, closest_hit: Option<&'a str>) -> HitGroupDesc<'a> {
        HitGroupDesc {
            name,
            closest_hit,
            any_hit: None,
            intersection: None,
        }
    }

    const LIMITS: PipelineLimits = PipelineLimits {
        max_payload_size: 48,
        max_attribute_size: 8,
        max_recursion_depth: 3,
    };

    #[test]
    fn resolve_orders_groups_by_section() {
        let libraries = [
            library(&[("RayGen", ShaderStage::RayGeneration, 3)]),
            library(&[
                ("Miss", ShaderStage::Miss, 1),
                ("ClosestHit", ShaderStage::ClosestHit, 3),
            ]),
            library(&[("ShadowMiss", ShaderStage::Miss, 1)]),
        ];
        let hit_groups = [hit_group("HitGroup", Some("ClosestHit"))];
        let names = ["RayGen", "Miss", "ShadowMiss", "HitGroup"];
        let associations = [RecordAssociation {
            layout: RecordLayout::empty(),
            shaders: &names,
        }];
        let resolved = resolve(
            &RayTracingPipelineDesc {
                name: "test",
                libraries: &libraries,
                hit_groups: &hit_groups,
                associations: &associations,
                limits: LIMITS,
            },
            31,
        )
        .unwrap();
        let order = resolved
            .groups
            .iter()
            .map(|g| g.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, ["RayGen", "Miss", "ShadowMiss", "HitGroup"]);
    }

    #[test]
    fn resolve_rejects_missing_entry_point() {
        let libraries = [library(&[("RayGen", ShaderStage::RayGeneration, 1)])];
        let hit_groups = [hit_group("HitGroup", Some("ClosestHit"))];
        let names = ["RayGen", "HitGroup"];
        let associations = [RecordAssociation {
            layout: RecordLayout::empty(),
            shaders: &names,
        }];
        let result = resolve(
            &RayTracingPipelineDesc {
                name: "test",
                libraries: &libraries,
                hit_groups: &hit_groups,
                associations: &associations,
                limits: LIMITS,
            },
            31,
        );
        assert!(matches!(result, Err(crate::Error::PipelineCompile(_))));
    }

    #[test]
    fn resolve_rejects_hit_group_without_closest_hit() {
        let libraries = [library(&[("RayGen", ShaderStage::RayGeneration, 1)])];
        let hit_groups = [hit_group("HitGroup", None)];
        let names = ["RayGen", "HitGroup"];
        let associations = [RecordAssociation {
            layout: RecordLayout::empty(),
            shaders: &names,
        }];
        let result = resolve(
            &RayTracingPipelineDesc {
                name: "test",
                libraries: &libraries,
                hit_groups: &hit_groups,
                associations: &associations,
                limits: LIMITS,
            },
            31,
        );
        assert!(matches!(result, Err(crate::Error::PipelineCompile(_))));
    }

    #[test]
    fn resolve_rejects_underdeclared_recursion() {
        // Primary -> reflection -> shadow needs depth 3.
        let libraries = [library(&[("RayGen", ShaderStage::RayGeneration, 3)])];
        let names = ["RayGen"];
        let associations = [RecordAssociation {
            layout: RecordLayout::empty(),
            shaders: &names,
        }];
        let result = resolve(
            &RayTracingPipelineDesc {
                name: "test",
                libraries: &libraries,
                hit_groups: &[],
                associations: &associations,
                limits: PipelineLimits {
                    max_recursion_depth: 2,
                    ..LIMITS
                },
            },
            31,
        );
        assert!(matches!(result, Err(crate::Error::PipelineCompile(_))));
    }

    #[test]
    fn resolve_rejects_recursion_beyond_device() {
        let libraries = [library(&[("RayGen", ShaderStage::RayGeneration, 1)])];
        let names = ["RayGen"];
        let associations = [RecordAssociation {
            layout: RecordLayout::empty(),
            shaders: &names,
        }];
        let result = resolve(
            &RayTracingPipelineDesc {
                name: "test",
                libraries: &libraries,
                hit_groups: &[],
                associations: &associations,
                limits: LIMITS,
            },
            1,
        );
        assert!(matches!(result, Err(crate::Error::PipelineCompile(_))));
    }

    #[test]
    fn resolve_rejects_unassociated_shader() {
        let libraries = [library(&[("RayGen", ShaderStage::RayGeneration, 1)])];
        let result = resolve(
            &RayTracingPipelineDesc {
                name: "test",
                libraries: &libraries,
                hit_groups: &[],
                associations: &[],
                limits: LIMITS,
            },
            31,
        );
        assert!(matches!(result, Err(crate::Error::PipelineCompile(_))));
    }
}
