use ash::vk;
use glam::Mat4;
use std::{mem, ptr};

/// One triangle geometry entry of a bottom-level build. A missing index
/// buffer means non-indexed triangles.
#[derive(Clone, Copy, Debug)]
pub struct BlasTriangles {
    pub vertex_buf: crate::Buffer,
    pub vertex_count: u32,
    pub vertex_stride: u64,
    pub index_buf: Option<crate::Buffer>,
    pub index_count: u32,
}

impl BlasTriangles {
    pub fn triangle_count(&self) -> u32 {
        match self.index_buf {
            Some(_) => self.index_count / 3,
            None => self.vertex_count / 3,
        }
    }
}

impl From<&crate::geometry::MeshBuffers> for BlasTriangles {
    fn from(mesh: &crate::geometry::MeshBuffers) -> Self {
        Self {
            vertex_buf: mesh.vertex_buf,
            vertex_count: mesh.vertex_count,
            vertex_stride: mem::size_of::<crate::Vertex>() as u64,
            index_buf: mesh.index_buf,
            index_count: mesh.index_count,
        }
    }
}

/// GPU-resident spatial index over one mesh's triangles. Immutable once
/// built; geometry changes require a new build.
pub struct BottomLevel {
    raw: vk::AccelerationStructureKHR,
    buffer: crate::Buffer,
    address: vk::DeviceAddress,
}

impl BottomLevel {
    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn destroy(self, gpu: &crate::Context) {
        unsafe {
            gpu.device
                .acceleration_structure
                .destroy_acceleration_structure(self.raw, None);
        }
        gpu.destroy_buffer(self.buffer);
    }
}

/// Record a bottom-level build. The scratch buffer lands in `temp_buffers`
/// and may be released once the submission is waited on. The recorded
/// commands end with a barrier, so a top-level build in the same command
/// stream sees a consistent structure.
pub fn build_bottom_level(
    gpu: &crate::Context,
    cmd: vk::CommandBuffer,
    name: &str,
    entries: &[BlasTriangles],
    temp_buffers: &mut Vec<crate::Buffer>,
) -> Result<BottomLevel, crate::Error> {
    if entries.is_empty() || entries.iter().any(|e| e.triangle_count() == 0) {
        return Err(crate::Error::EmptyGeometry);
    }

    let mut geometries = Vec::with_capacity(entries.len());
    let mut primitive_counts = Vec::with_capacity(entries.len());
    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: gpu.buffer_device_address(entry.vertex_buf),
            })
            .vertex_stride(entry.vertex_stride)
            .max_vertex(entry.vertex_count.saturating_sub(1));
        triangles = match entry.index_buf {
            Some(index_buf) => triangles
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: gpu.buffer_device_address(index_buf),
                }),
            None => triangles.index_type(vk::IndexType::NONE_KHR),
        };
        geometries.push(
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(vk::GeometryFlagsKHR::OPAQUE),
        );
        primitive_counts.push(entry.triangle_count());
        ranges.push(
            vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(entry.triangle_count()),
        );
    }

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        gpu.device
            .acceleration_structure
            .get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &primitive_counts,
                &mut sizes,
            );
    }

    let buffer = gpu.create_buffer(crate::BufferDesc {
        name,
        size: sizes.acceleration_structure_size,
        memory: crate::Memory::Device,
    })?;
    let scratch = gpu.create_buffer(crate::BufferDesc {
        name: "BLAS scratch",
        size: sizes.build_scratch_size,
        memory: crate::Memory::Device,
    })?;
    temp_buffers.push(scratch);

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer.raw())
        .size(sizes.acceleration_structure_size)
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
    let raw = unsafe {
        gpu.device
            .acceleration_structure
            .create_acceleration_structure(&create_info, None)?
    };
    if !name.is_empty() {
        gpu.set_object_name(raw, name);
    }

    build_info = build_info
        .dst_acceleration_structure(raw)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: gpu.buffer_device_address(scratch),
        });

    unsafe {
        gpu.device
            .acceleration_structure
            .cmd_build_acceleration_structures(cmd, &[build_info], &[&ranges]);
    }
    accel_build_barrier(gpu, cmd);

    let address = unsafe {
        gpu.device
            .acceleration_structure
            .get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(raw),
            )
    };

    log::debug!(
        "Built BLAS {:?}: {} geometries, {} bytes",
        name,
        entries.len(),
        sizes.acceleration_structure_size,
    );
    Ok(BottomLevel {
        raw,
        buffer,
        address,
    })
}

/// Per-instance tuple aggregated by the top-level build.
#[derive(Clone, Copy, Debug)]
pub struct TlasInstance {
    pub blas_address: vk::DeviceAddress,
    pub transform: Mat4,
    /// Base record index of this instance's hit-group section slice.
    pub sbt_offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum BuildMode {
    Full,
    Refit,
}

struct Built {
    raw: vk::AccelerationStructureKHR,
    result: crate::Buffer,
    scratch: crate::Buffer,
    instance_buf: crate::Buffer,
    instance_count: u32,
}

/// Builds and refits the scene-wide structure over all instances.
///
/// The result buffer is mutated in place by a refit, and the scratch and
/// instance-descriptor buffers are reused across refits. The caller is
/// responsible for sequencing: a refit is recorded into the same linear
/// command stream as the dispatch that consumes it, and a full rebuild must
/// not be requested while a previous build is still in flight.
pub struct TlasBuilder {
    name: String,
    built: Option<Built>,
}

impl TlasBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            built: None,
        }
    }

    /// Pick full build vs refit, validating the preconditions first.
    fn plan(
        prev_instance_count: Option<u32>,
        instance_count: usize,
        update_only: bool,
    ) -> Result<BuildMode, crate::Error> {
        if instance_count == 0 {
            return Err(crate::Error::EmptyScene);
        }
        if !update_only {
            return Ok(BuildMode::Full);
        }
        match prev_instance_count {
            Some(count) if count as usize == instance_count => Ok(BuildMode::Refit),
            _ => Err(crate::Error::RefitBeforeBuild),
        }
    }

    pub fn raw(&self) -> Option<vk::AccelerationStructureKHR> {
        self.built.as_ref().map(|b| b.raw)
    }

    pub fn instance_count(&self) -> u32 {
        self.built.as_ref().map_or(0, |b| b.instance_count)
    }

    #[profiling::function]
    pub fn build(
        &mut self,
        gpu: &crate::Context,
        cmd: vk::CommandBuffer,
        instances: &[TlasInstance],
        update_only: bool,
    ) -> Result<(), crate::Error> {
        let prev_count = self.built.as_ref().map(|b| b.instance_count);
        match Self::plan(prev_count, instances.len(), update_only)? {
            BuildMode::Full => self.build_full(gpu, cmd, instances),
            BuildMode::Refit => self.refit(gpu, cmd, instances),
        }
    }

    fn build_full(
        &mut self,
        gpu: &crate::Context,
        cmd: vk::CommandBuffer,
        instances: &[TlasInstance],
    ) -> Result<(), crate::Error> {
        self.destroy(gpu);

        let records = instances
            .iter()
            .enumerate()
            .map(|(index, instance)| vk::AccelerationStructureInstanceKHR {
                transform: map_transform(&instance.transform),
                instance_custom_index_and_mask: vk::Packed24_8::new(index as u32, 0xFF),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    instance.sbt_offset,
                    vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: instance.blas_address,
                },
            })
            .collect::<Vec<_>>();

        // Instance records are populated by mapping, so the buffer has to be
        // host-visible.
        let record_size = mem::size_of::<vk::AccelerationStructureInstanceKHR>();
        let instance_buf = gpu.create_buffer(crate::BufferDesc {
            name: "TLAS instances",
            size: (records.len() * record_size) as u64,
            memory: crate::Memory::Upload,
        })?;
        unsafe {
            ptr::copy_nonoverlapping(
                records.as_ptr() as *const u8,
                instance_buf.data(),
                records.len() * record_size,
            );
        }

        let geometry = instances_geometry(gpu.buffer_device_address(instance_buf));
        let geometries = [geometry];
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(
                vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                    | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            )
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            gpu.device
                .acceleration_structure
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[instances.len() as u32],
                    &mut sizes,
                );
        }

        let result = gpu.create_buffer(crate::BufferDesc {
            name: &self.name,
            size: sizes.acceleration_structure_size,
            memory: crate::Memory::Device,
        })?;
        // Sized for both the initial build and every subsequent refit.
        let scratch = gpu.create_buffer(crate::BufferDesc {
            name: "TLAS scratch",
            size: sizes.build_scratch_size.max(sizes.update_scratch_size),
            memory: crate::Memory::Device,
        })?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(result.raw())
            .size(sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        let raw = unsafe {
            gpu.device
                .acceleration_structure
                .create_acceleration_structure(&create_info, None)?
        };
        gpu.set_object_name(raw, &self.name);

        build_info = build_info
            .dst_acceleration_structure(raw)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: gpu.buffer_device_address(scratch),
            });
        let ranges = [vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(instances.len() as u32)];
        unsafe {
            gpu.device
                .acceleration_structure
                .cmd_build_acceleration_structures(cmd, &[build_info], &[&ranges]);
        }
        accel_build_barrier(gpu, cmd);

        log::debug!(
            "Built TLAS {:?}: {} instances, {} bytes",
            self.name,
            instances.len(),
            sizes.acceleration_structure_size,
        );
        self.built = Some(Built {
            raw,
            result,
            scratch,
            instance_buf,
            instance_count: instances.len() as u32,
        });
        Ok(())
    }

    /// In-place transform update. Strictly cheaper than a rebuild; topology
    /// (instance count, BLAS references, binding offsets) stays as it was at
    /// the last full build.
    fn refit(
        &mut self,
        gpu: &crate::Context,
        cmd: vk::CommandBuffer,
        instances: &[TlasInstance],
    ) -> Result<(), crate::Error> {
        let built = self.built.as_ref().unwrap();

        // `transform` is the leading field of the instance record, so each
        // write lands at the record's base offset.
        let record_size = mem::size_of::<vk::AccelerationStructureInstanceKHR>();
        for (index, instance) in instances.iter().enumerate() {
            let transform = map_transform(&instance.transform);
            unsafe {
                ptr::write_unaligned(
                    built.instance_buf.data().add(index * record_size) as *mut vk::TransformMatrixKHR,
                    transform,
                );
            }
        }

        let geometry = instances_geometry(gpu.buffer_device_address(built.instance_buf));
        let geometries = [geometry];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(
                vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                    | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            )
            .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
            .src_acceleration_structure(built.raw)
            .dst_acceleration_structure(built.raw)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: gpu.buffer_device_address(built.scratch),
            });
        let ranges = [vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(built.instance_count)];
        unsafe {
            gpu.device
                .acceleration_structure
                .cmd_build_acceleration_structures(cmd, &[build_info], &[&ranges]);
        }
        accel_build_barrier(gpu, cmd);
        Ok(())
    }

    pub fn destroy(&mut self, gpu: &crate::Context) {
        if let Some(built) = self.built.take() {
            unsafe {
                gpu.device
                    .acceleration_structure
                    .destroy_acceleration_structure(built.raw, None);
            }
            gpu.destroy_buffer(built.result);
            gpu.destroy_buffer(built.scratch);
            gpu.destroy_buffer(built.instance_buf);
        }
    }
}

fn instances_geometry<'a>(
    instance_address: vk::DeviceAddress,
) -> vk::AccelerationStructureGeometryKHR<'a> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_address,
                }),
        })
}

/// Make an acceleration structure build visible to the next build or trace
/// in the same command stream.
fn accel_build_barrier(gpu: &crate::Context, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_access_mask(
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        );
    unsafe {
        gpu.device.core.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// Row-major 3x4 matrix expected by the instance records.
fn map_transform(transform: &Mat4) -> vk::TransformMatrixKHR {
    let c = transform.to_cols_array_2d();
    vk::TransformMatrixKHR {
        matrix: [
            c[0][0], c[1][0], c[2][0], c[3][0], //
            c[0][1], c[1][1], c[2][1], c[3][1], //
            c[0][2], c[1][2], c[2][2], c[3][2],
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn plan_rejects_empty_scene() {
        // No-instance is an invalid scene, not a silently empty structure.
        assert!(matches!(
            TlasBuilder::plan(None, 0, false),
            Err(crate::Error::EmptyScene)
        ));
        assert!(matches!(
            TlasBuilder::plan(Some(10), 0, true),
            Err(crate::Error::EmptyScene)
        ));
    }

    #[test]
    fn plan_rejects_refit_before_build() {
        assert!(matches!(
            TlasBuilder::plan(None, 10, true),
            Err(crate::Error::RefitBeforeBuild)
        ));
    }

    #[test]
    fn plan_rejects_refit_on_topology_change() {
        assert!(matches!(
            TlasBuilder::plan(Some(10), 11, true),
            Err(crate::Error::RefitBeforeBuild)
        ));
    }

    #[test]
    fn plan_picks_the_cheap_path() {
        assert_eq!(TlasBuilder::plan(None, 10, false).unwrap(), BuildMode::Full);
        assert_eq!(
            TlasBuilder::plan(Some(10), 10, false).unwrap(),
            BuildMode::Full
        );
        assert_eq!(
            TlasBuilder::plan(Some(10), 10, true).unwrap(),
            BuildMode::Refit
        );
    }

    #[test]
    fn transform_rows_carry_translation() {
        let transform = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let rows = map_transform(&transform).matrix;
        assert_eq!(rows[3], 1.0);
        assert_eq!(rows[7], 2.0);
        assert_eq!(rows[11], 3.0);
        // Rotation part stays identity.
        assert_eq!(rows[0], 1.0);
        assert_eq!(rows[5], 1.0);
        assert_eq!(rows[10], 1.0);
    }
}
