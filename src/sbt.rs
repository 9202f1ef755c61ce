use ash::vk;
use std::{mem, ptr};

/// One resource parameter of a binding-table record, encoded as 8 bytes
/// right after the shader identifier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SbtParam {
    /// Raw buffer device address.
    Buffer(vk::DeviceAddress),
    /// Base of a descriptor heap region.
    HeapBase(u64),
}

impl SbtParam {
    fn raw(self) -> u64 {
        match self {
            Self::Buffer(address) => address,
            Self::HeapBase(base) => base,
        }
    }

    fn kind(self) -> crate::RecordParamKind {
        match self {
            Self::Buffer(_) => crate::RecordParamKind::BufferAddress,
            Self::HeapBase(_) => crate::RecordParamKind::HeapBase,
        }
    }
}

struct SbtEntry {
    name: String,
    params: Vec<SbtParam>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct SectionLayout {
    stride: u64,
    size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct TableLayout {
    ray_gen: SectionLayout,
    miss: SectionLayout,
    hit: SectionLayout,
}

impl TableLayout {
    fn total(&self) -> u64 {
        self.ray_gen.size + self.miss.size + self.hit.size
    }
}

/// The three strided address regions handed to the trace dispatch, plus the
/// (unused) callable region.
#[derive(Clone, Copy, Debug)]
pub struct SbtRegions {
    pub ray_gen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Serializes shader identifiers and their resource parameters into the
/// binary table indexed by the GPU dispatch.
///
/// Entries are grouped into three contiguous sections: exactly one
/// ray-generation record, one miss record per ray type, and one hit-group
/// record per (instance x ray type) pair. Entry order within a section is
/// the invocation index seen by the GPU, so hit groups must be added
/// instance-major or shaders bind to the wrong instance's data.
pub struct ShaderBindingTable {
    ray_gen: Vec<SbtEntry>,
    miss: Vec<SbtEntry>,
    hit: Vec<SbtEntry>,
}

impl ShaderBindingTable {
    pub fn new() -> Self {
        Self {
            ray_gen: Vec::new(),
            miss: Vec::new(),
            hit: Vec::new(),
        }
    }

    /// Empty the table before re-adding entries.
    pub fn reset(&mut self) {
        self.ray_gen.clear();
        self.miss.clear();
        self.hit.clear();
    }

    pub fn add_ray_generation(&mut self, name: &str, params: Vec<SbtParam>) {
        self.ray_gen.push(SbtEntry {
            name: name.to_string(),
            params,
        });
    }

    pub fn add_miss(&mut self, name: &str, params: Vec<SbtParam>) {
        self.miss.push(SbtEntry {
            name: name.to_string(),
            params,
        });
    }

    pub fn add_hit_group(&mut self, name: &str, params: Vec<SbtParam>) {
        self.hit.push(SbtEntry {
            name: name.to_string(),
            params,
        });
    }

    pub fn miss_count(&self) -> u32 {
        self.miss.len() as u32
    }

    pub fn hit_group_count(&self) -> u32 {
        self.hit.len() as u32
    }

    /// All records of a section share one stride: the largest parameter
    /// block in the section, rounded up to the group base alignment. Keeping
    /// strides base-aligned also keeps the section start addresses legal
    /// without inter-section padding.
    fn section_layout(entries: &[SbtEntry], limits: &crate::RayTracingLimits) -> SectionLayout {
        let max_params = entries.iter().map(|e| e.params.len()).max().unwrap_or(0);
        let stride = crate::align_up(
            limits.group_handle_size as u64 + (max_params * mem::size_of::<u64>()) as u64,
            limits.group_base_alignment as u64,
        );
        SectionLayout {
            stride,
            size: stride * entries.len() as u64,
        }
    }

    fn layout(&self, limits: &crate::RayTracingLimits) -> TableLayout {
        TableLayout {
            ray_gen: Self::section_layout(&self.ray_gen, limits),
            miss: Self::section_layout(&self.miss, limits),
            hit: Self::section_layout(&self.hit, limits),
        }
    }

    /// Byte size the destination buffer must provide for `generate`.
    pub fn compute_size(&self, limits: &crate::RayTracingLimits) -> u64 {
        self.layout(limits).total()
    }

    /// Resolve every entry's symbolic name through the pipeline and write
    /// the table into `destination` through its mapping. Fails without
    /// touching the buffer if the destination is smaller than
    /// [`compute_size`](Self::compute_size), if any name is unknown to the
    /// pipeline, or if an entry's parameters don't match the signature
    /// associated at compile time.
    #[profiling::function]
    pub fn generate(
        &self,
        gpu: &crate::Context,
        pipeline: &crate::RayTracingPipeline,
        destination: crate::Buffer,
        destination_size: u64,
    ) -> Result<SbtRegions, crate::Error> {
        let limits = gpu.ray_tracing_limits();
        if self.ray_gen.len() != 1 {
            return Err(crate::Error::SbtLayout(format!(
                "expected exactly one ray-generation entry, got {}",
                self.ray_gen.len()
            )));
        }
        let layout = self.layout(limits);
        for section in [&layout.ray_gen, &layout.miss, &layout.hit] {
            if section.stride > limits.max_group_stride as u64 {
                return Err(crate::Error::SbtLayout(format!(
                    "record stride {} exceeds the device limit of {}",
                    section.stride, limits.max_group_stride,
                )));
            }
        }
        let needed = layout.total();
        if needed > destination_size {
            return Err(crate::Error::SbtOverflow {
                needed,
                available: destination_size,
            });
        }

        // Validate every entry first, so a failing table never leaves the
        // destination half-written.
        for (entry, _, _) in self.entries() {
            pipeline.group_handle(&entry.name)?;
            if let Some(record) = pipeline.record_layout(&entry.name) {
                let kinds = entry.params.iter().map(|p| p.kind()).collect::<Vec<_>>();
                if kinds != record.params {
                    return Err(crate::Error::SbtLayout(format!(
                        "entry {:?} carries {:?}, its signature expects {:?}",
                        entry.name, kinds, record.params,
                    )));
                }
            }
        }

        for (entry, section, section_offset) in self.entries() {
            let layout_of = match section {
                Section::RayGen => layout.ray_gen,
                Section::Miss => layout.miss,
                Section::Hit => layout.hit,
            };
            let section_base = match section {
                Section::RayGen => 0,
                Section::Miss => layout.ray_gen.size,
                Section::Hit => layout.ray_gen.size + layout.miss.size,
            };
            let handle = pipeline.group_handle(&entry.name)?;
            let offset = section_base + section_offset as u64 * layout_of.stride;
            unsafe {
                let dst = destination.data().add(offset as usize);
                ptr::copy_nonoverlapping(handle.as_ptr(), dst, handle.len());
                let mut param_offset = handle.len();
                for param in entry.params.iter() {
                    let bytes = param.raw().to_le_bytes();
                    ptr::copy_nonoverlapping(bytes.as_ptr(), dst.add(param_offset), bytes.len());
                    param_offset += bytes.len();
                }
            }
        }

        let base = gpu.buffer_device_address(destination);
        log::debug!(
            "Encoded SBT: 1 ray-gen, {} miss, {} hit-group records, {} bytes",
            self.miss.len(),
            self.hit.len(),
            needed,
        );
        Ok(SbtRegions {
            ray_gen: vk::StridedDeviceAddressRegionKHR {
                device_address: base,
                stride: layout.ray_gen.stride,
                // The ray-generation section allows exactly one stride.
                size: layout.ray_gen.stride,
            },
            miss: vk::StridedDeviceAddressRegionKHR {
                device_address: base + layout.ray_gen.size,
                stride: layout.miss.stride,
                size: layout.miss.size,
            },
            hit: vk::StridedDeviceAddressRegionKHR {
                device_address: base + layout.ray_gen.size + layout.miss.size,
                stride: layout.hit.stride,
                size: layout.hit.size,
            },
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        })
    }

    fn entries(&self) -> impl Iterator<Item = (&SbtEntry, Section, usize)> {
        let ray_gen = self
            .ray_gen
            .iter()
            .enumerate()
            .map(|(i, e)| (e, Section::RayGen, i));
        let miss = self
            .miss
            .iter()
            .enumerate()
            .map(|(i, e)| (e, Section::Miss, i));
        let hit = self
            .hit
            .iter()
            .enumerate()
            .map(|(i, e)| (e, Section::Hit, i));
        ray_gen.chain(miss).chain(hit)
    }
}

#[derive(Clone, Copy)]
enum Section {
    RayGen,
    Miss,
    Hit,
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: crate::RayTracingLimits = crate::RayTracingLimits {
        group_handle_size: 32,
        group_handle_alignment: 32,
        group_base_alignment: 64,
        max_recursion_depth: 31,
        max_group_stride: 4096,
    };

    fn demo_table(instances: usize, rays_per_instance: usize) -> ShaderBindingTable {
        let mut sbt = ShaderBindingTable::new();
        sbt.add_ray_generation("RayGen", vec![SbtParam::HeapBase(0x10)]);
        sbt.add_miss("Miss", vec![SbtParam::HeapBase(0x10), SbtParam::HeapBase(0x20)]);
        sbt.add_miss("ShadowMiss", vec![]);
        sbt.add_miss("ReflectionMiss", vec![SbtParam::HeapBase(0x10)]);
        for i in 0..instances {
            for _ in 0..rays_per_instance {
                sbt.add_hit_group(
                    "HitGroup",
                    vec![
                        SbtParam::Buffer(0x1000 + i as u64),
                        SbtParam::Buffer(0x2000 + i as u64),
                        SbtParam::Buffer(0x3000 + i as u64),
                    ],
                );
            }
        }
        sbt
    }

    #[test]
    fn sections_use_the_max_parameter_stride() {
        let sbt = demo_table(1, 1);
        let layout = sbt.layout(&LIMITS);
        // One 8-byte param rounds up to one base alignment unit.
        assert_eq!(layout.ray_gen.stride, 64);
        // Two params in the largest miss record, still within 64.
        assert_eq!(layout.miss.stride, 64);
        assert_eq!(layout.hit.stride, 64);
        assert_eq!(layout.miss.size, 3 * 64);
    }

    #[test]
    fn compute_size_is_the_sum_of_strided_sections() {
        // For all instance counts, the total is
        // rayGenStride + missTypes * missStride + (N * raysPerInstance) * hitStride.
        for instances in 1..=16 {
            let sbt = demo_table(instances, 3);
            let layout = sbt.layout(&LIMITS);
            let expected = layout.ray_gen.stride
                + 3 * layout.miss.stride
                + (instances as u64 * 3) * layout.hit.stride;
            assert_eq!(sbt.compute_size(&LIMITS), expected);
        }
    }

    #[test]
    fn ten_instances_three_ray_types() {
        // 9 mesh instances + 1 floor: 30 hit-group records, 1 ray-gen,
        // 3 miss records.
        let sbt = demo_table(10, 3);
        assert_eq!(sbt.hit_group_count(), 30);
        assert_eq!(sbt.miss_count(), 3);
        assert_eq!(sbt.compute_size(&LIMITS), 64 + 3 * 64 + 30 * 64);
    }

    #[test]
    fn wide_records_round_up_to_the_next_alignment() {
        let mut sbt = ShaderBindingTable::new();
        sbt.add_ray_generation("RayGen", vec![]);
        // 32 handle bytes + 5 * 8 param bytes = 72, rounds to 128.
        sbt.add_hit_group("HitGroup", vec![SbtParam::Buffer(0); 5]);
        sbt.add_hit_group("HitGroup", vec![]);
        let layout = sbt.layout(&LIMITS);
        assert_eq!(layout.hit.stride, 128);
        assert_eq!(layout.hit.size, 2 * 128);
    }

    #[test]
    fn hit_entries_keep_invocation_order() {
        let sbt = demo_table(2, 3);
        let hit_offsets = sbt
            .entries()
            .filter(|&(_, section, _)| matches!(section, Section::Hit))
            .map(|(_, _, index)| index)
            .collect::<Vec<_>>();
        assert_eq!(hit_offsets, [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn reset_empties_every_section() {
        let mut sbt = demo_table(4, 3);
        sbt.reset();
        assert_eq!(sbt.hit_group_count(), 0);
        assert_eq!(sbt.miss_count(), 0);
        assert_eq!(sbt.compute_size(&LIMITS), 0);
    }
}
