use ash::vk;
use gpu_alloc_ash::AshMemoryDevice;
use std::ptr;

struct Allocation {
    memory: vk::DeviceMemory,
    offset: u64,
    data: *mut u8,
    handle: usize,
}

impl crate::Context {
    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        memory: crate::Memory,
    ) -> Result<Allocation, crate::Error> {
        let mut manager = self.memory.lock().unwrap();
        let alloc_usage = match memory {
            crate::Memory::Device => gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS,
            crate::Memory::Shared => {
                gpu_alloc::UsageFlags::HOST_ACCESS
                    | gpu_alloc::UsageFlags::DOWNLOAD
                    | gpu_alloc::UsageFlags::UPLOAD
                    | gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS
            }
            crate::Memory::Upload => {
                gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::UPLOAD
            }
        };
        let memory_types = requirements.memory_type_bits & manager.valid_ash_memory_types;
        let mut block = unsafe {
            manager
                .allocator
                .alloc(
                    AshMemoryDevice::wrap(&self.device.core),
                    gpu_alloc::Request {
                        size: requirements.size,
                        align_mask: requirements.alignment - 1,
                        usage: alloc_usage,
                        memory_types,
                    },
                )
                .map_err(|e| crate::Error::ResourceCreation(e.to_string()))?
        };

        let data = if memory == crate::Memory::Device {
            ptr::null_mut()
        } else {
            unsafe {
                block
                    .map(AshMemoryDevice::wrap(&self.device.core), 0, block.size() as usize)
                    .map_err(|e| crate::Error::ResourceCreation(e.to_string()))?
                    .as_ptr()
            }
        };

        Ok(Allocation {
            memory: *block.memory(),
            offset: block.offset(),
            data,
            handle: manager.slab.insert(block),
        })
    }

    fn free_memory(&self, handle: usize) {
        let mut manager = self.memory.lock().unwrap();
        let block = manager.slab.remove(handle);
        unsafe {
            manager
                .allocator
                .dealloc(AshMemoryDevice::wrap(&self.device.core), block);
        }
    }

    pub fn create_buffer(&self, desc: crate::BufferDesc) -> Result<crate::Buffer, crate::Error> {
        use vk::BufferUsageFlags as Buf;
        let vk_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(
                Buf::TRANSFER_SRC
                    | Buf::TRANSFER_DST
                    | Buf::STORAGE_BUFFER
                    | Buf::UNIFORM_BUFFER
                    | Buf::INDEX_BUFFER
                    | Buf::VERTEX_BUFFER
                    | Buf::SHADER_DEVICE_ADDRESS
                    | Buf::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | Buf::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | Buf::SHADER_BINDING_TABLE_KHR,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = unsafe { self.device.core.create_buffer(&vk_info, None)? };
        let requirements = unsafe { self.device.core.get_buffer_memory_requirements(raw) };
        let allocation = self.allocate_memory(requirements, desc.memory)?;

        unsafe {
            self.device
                .core
                .bind_buffer_memory(raw, allocation.memory, allocation.offset)?;
        }
        if !desc.name.is_empty() {
            self.set_object_name(raw, desc.name);
        }

        Ok(crate::Buffer {
            raw,
            memory_handle: allocation.handle,
            mapped_data: allocation.data,
        })
    }

    pub fn destroy_buffer(&self, buffer: crate::Buffer) {
        unsafe { self.device.core.destroy_buffer(buffer.raw, None) };
        self.free_memory(buffer.memory_handle);
    }

    pub fn buffer_device_address(&self, buffer: crate::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer.raw);
        unsafe { self.device.core.get_buffer_device_address(&info) }
    }

    pub fn create_texture(&self, desc: crate::TextureDesc) -> Result<crate::Texture, crate::Error> {
        let vk_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.size.width,
                height: desc.size.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = unsafe { self.device.core.create_image(&vk_info, None)? };
        let requirements = unsafe { self.device.core.get_image_memory_requirements(raw) };
        let allocation = self.allocate_memory(requirements, crate::Memory::Device)?;

        unsafe {
            self.device
                .core
                .bind_image_memory(raw, allocation.memory, allocation.offset)?;
        }
        if !desc.name.is_empty() {
            self.set_object_name(raw, desc.name);
        }

        Ok(crate::Texture {
            raw,
            memory_handle: allocation.handle,
        })
    }

    pub fn destroy_texture(&self, texture: crate::Texture) {
        unsafe { self.device.core.destroy_image(texture.raw, None) };
        self.free_memory(texture.memory_handle);
    }

    pub fn create_texture_view(
        &self,
        texture: crate::Texture,
        name: &str,
        format: vk::Format,
        aspects: vk::ImageAspectFlags,
    ) -> Result<crate::TextureView, crate::Error> {
        let vk_info = vk::ImageViewCreateInfo::default()
            .image(texture.raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspects,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let raw = unsafe { self.device.core.create_image_view(&vk_info, None)? };
        if !name.is_empty() {
            self.set_object_name(raw, name);
        }
        Ok(crate::TextureView { raw })
    }

    pub fn destroy_texture_view(&self, view: crate::TextureView) {
        unsafe { self.device.core.destroy_image_view(view.raw, None) };
    }
}

impl crate::Buffer {
    pub(crate) fn raw(&self) -> vk::Buffer {
        self.raw
    }

    /// Copy `data` into the buffer at `offset` through the persistent mapping.
    pub fn write_slice<T: bytemuck::Pod>(&self, offset: usize, data: &[T]) {
        let bytes = bytemuck::cast_slice::<T, u8>(data);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data().add(offset), bytes.len());
        }
    }
}

impl crate::Texture {
    pub(crate) fn raw(&self) -> vk::Image {
        self.raw
    }
}

impl crate::TextureView {
    pub(crate) fn raw(&self) -> vk::ImageView {
        self.raw
    }
}
