use ash::{khr, vk};
use std::{ffi, sync::Mutex};

const REQUIRED_DEVICE_EXTENSIONS: &[&ffi::CStr] = &[
    khr::dynamic_rendering::NAME,
    khr::deferred_host_operations::NAME,
    khr::acceleration_structure::NAME,
    khr::ray_tracing_pipeline::NAME,
];

#[derive(Debug)]
struct AdapterCapabilities {
    properties: vk::PhysicalDeviceProperties,
    queue_family_index: u32,
    rt_limits: crate::RayTracingLimits,
}

unsafe fn inspect_adapter(
    phd: vk::PhysicalDevice,
    instance: &crate::Instance,
    driver_api_version: u32,
    surface: Option<vk::SurfaceKHR>,
) -> Option<AdapterCapabilities> {
    let supported_extension_properties = instance
        .core
        .enumerate_device_extension_properties(phd)
        .unwrap();
    let supported_extensions = supported_extension_properties
        .iter()
        .map(|ext_prop| ffi::CStr::from_ptr(ext_prop.extension_name.as_ptr()))
        .collect::<Vec<_>>();
    for extension in REQUIRED_DEVICE_EXTENSIONS {
        if !supported_extensions.contains(extension) {
            log::warn!(
                "Rejected for device extension {:?} not supported",
                extension
            );
            return None;
        }
    }

    let mut ray_tracing_pipeline_properties =
        vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut acceleration_structure_properties =
        vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut properties2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut ray_tracing_pipeline_properties)
        .push_next(&mut acceleration_structure_properties);
    instance
        .core
        .get_physical_device_properties2(phd, &mut properties2);

    let properties = properties2.properties;
    let name = ffi::CStr::from_ptr(properties.device_name.as_ptr());
    log::info!("Adapter {:?}", name);

    let api_version = properties.api_version.min(driver_api_version);
    if api_version < vk::API_VERSION_1_2 {
        log::warn!("\tRejected for API version {}", api_version);
        return None;
    }

    let queue_families = instance.core.get_physical_device_queue_family_properties(phd);
    let queue_family_index = match queue_families.iter().position(|family| {
        family
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    }) {
        Some(index) => index as u32,
        None => {
            log::warn!("\tRejected for missing a graphics+compute queue family");
            return None;
        }
    };

    if let Some(surface) = surface {
        if instance.surface.get_physical_device_surface_support(phd, queue_family_index, surface)
            != Ok(true)
        {
            log::warn!("\tRejected for not presenting to the window surface");
            return None;
        }
    }

    let mut timeline_semaphore_features = vk::PhysicalDeviceVulkan12Features::default();
    let mut dynamic_rendering_features = vk::PhysicalDeviceDynamicRenderingFeaturesKHR::default();
    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut timeline_semaphore_features)
        .push_next(&mut dynamic_rendering_features)
        .push_next(&mut acceleration_structure_features)
        .push_next(&mut ray_tracing_pipeline_features);
    instance
        .core
        .get_physical_device_features2(phd, &mut features2);

    if timeline_semaphore_features.timeline_semaphore == vk::FALSE {
        log::warn!("\tRejected for missing timeline semaphores");
        return None;
    }
    if timeline_semaphore_features.buffer_device_address == vk::FALSE {
        log::warn!("\tRejected for missing buffer device addresses");
        return None;
    }
    if dynamic_rendering_features.dynamic_rendering == vk::FALSE {
        log::warn!("\tRejected for missing dynamic rendering");
        return None;
    }
    if acceleration_structure_features.acceleration_structure == vk::FALSE
        || acceleration_structure_properties.max_geometry_count == 0
    {
        log::warn!(
            "\tRejected for acceleration structures. Properties = {:?}. Features = {:?}",
            acceleration_structure_properties,
            acceleration_structure_features,
        );
        return None;
    }
    if ray_tracing_pipeline_features.ray_tracing_pipeline == vk::FALSE {
        log::warn!(
            "\tRejected for the raytracing pipeline. Features = {:?}",
            ray_tracing_pipeline_features,
        );
        return None;
    }

    log::debug!(
        "Raytracing properties: {:#?}",
        ray_tracing_pipeline_properties
    );

    Some(AdapterCapabilities {
        properties,
        queue_family_index,
        rt_limits: crate::RayTracingLimits {
            group_handle_size: ray_tracing_pipeline_properties.shader_group_handle_size,
            group_handle_alignment: ray_tracing_pipeline_properties.shader_group_handle_alignment,
            group_base_alignment: ray_tracing_pipeline_properties.shader_group_base_alignment,
            max_recursion_depth: ray_tracing_pipeline_properties.max_ray_recursion_depth,
            max_group_stride: ray_tracing_pipeline_properties.max_shader_group_stride,
        },
    })
}

impl crate::Context {
    unsafe fn init_impl(
        desc: crate::ContextDesc,
        surface_handles: Option<(
            raw_window_handle::RawWindowHandle,
            raw_window_handle::RawDisplayHandle,
        )>,
    ) -> Result<Self, crate::Error> {
        let entry = match ash::Entry::load() {
            Ok(entry) => entry,
            Err(err) => {
                log::error!("Missing Vulkan entry points: {:?}", err);
                return Err(crate::Error::NotSupported("vulkan loader is not present"));
            }
        };
        let driver_api_version = match entry.try_enumerate_instance_version() {
            Ok(Some(version)) => version,
            Ok(None) => return Err(crate::Error::NotSupported("vulkan 1.0 driver")),
            Err(err) => {
                log::error!("try_enumerate_instance_version: {:?}", err);
                return Err(crate::Error::NotSupported("unable to query driver version"));
            }
        };

        let supported_layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(err) => {
                log::error!("enumerate_instance_layer_properties: {:?}", err);
                return Err(crate::Error::NotSupported("unable to enumerate layers"));
            }
        };
        let supported_layer_names = supported_layers
            .iter()
            .map(|properties| ffi::CStr::from_ptr(properties.layer_name.as_ptr()))
            .collect::<Vec<_>>();

        let mut layers = Vec::<&ffi::CStr>::new();
        if desc.validation {
            let name = c"VK_LAYER_KHRONOS_validation";
            if supported_layer_names.contains(&name) {
                layers.push(name);
            } else {
                log::warn!("Validation layer is not found");
            }
        }

        let supported_instance_extension_properties =
            match entry.enumerate_instance_extension_properties(None) {
                Ok(extensions) => extensions,
                Err(err) => {
                    log::error!("enumerate_instance_extension_properties: {:?}", err);
                    return Err(crate::Error::NotSupported(
                        "unable to enumerate instance extensions",
                    ));
                }
            };
        let supported_instance_extensions = supported_instance_extension_properties
            .iter()
            .map(|ext_prop| ffi::CStr::from_ptr(ext_prop.extension_name.as_ptr()))
            .collect::<Vec<_>>();
        let has_debug_utils = supported_instance_extensions.contains(&ash::ext::debug_utils::NAME);

        let core_instance = {
            let mut instance_extensions = Vec::<&ffi::CStr>::new();
            if has_debug_utils {
                instance_extensions.push(ash::ext::debug_utils::NAME);
            }
            if let Some((_, rdh)) = surface_handles {
                instance_extensions.extend(
                    ash_window::enumerate_required_extensions(rdh)
                        .unwrap()
                        .iter()
                        .map(|&ptr| ffi::CStr::from_ptr(ptr)),
                );
            }

            for inst_ext in instance_extensions.iter() {
                if !supported_instance_extensions.contains(inst_ext) {
                    log::error!("Instance extension {:?} is not supported", inst_ext);
                    return Err(crate::Error::NotSupported("missing instance extension"));
                }
            }

            let app_info = vk::ApplicationInfo::default()
                .engine_name(c"flare")
                .engine_version(1)
                .api_version(vk::API_VERSION_1_2);
            let str_pointers = layers
                .iter()
                .chain(instance_extensions.iter())
                .map(|&s| s.as_ptr())
                .collect::<Vec<_>>();
            let (layer_strings, extension_strings) = str_pointers.split_at(layers.len());
            let create_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(layer_strings)
                .enabled_extension_names(extension_strings);
            entry.create_instance(&create_info, None)?
        };

        let vk_surface = surface_handles
            .map(|(rwh, rdh)| ash_window::create_surface(&entry, &core_instance, rdh, rwh, None))
            .transpose()?;

        let instance = crate::Instance {
            debug_utils: if has_debug_utils {
                Some(ash::ext::debug_utils::Instance::new(&entry, &core_instance))
            } else {
                None
            },
            surface: khr::surface::Instance::new(&entry, &core_instance),
            core: core_instance,
        };

        let physical_devices = instance.core.enumerate_physical_devices()?;
        let (physical_device, capabilities) = physical_devices
            .into_iter()
            .find_map(|phd| {
                inspect_adapter(phd, &instance, driver_api_version, vk_surface)
                    .map(|caps| (phd, caps))
            })
            .ok_or(crate::Error::NotSupported(
                "no adapter passes the raytracing capability check",
            ))?;

        log::debug!("Adapter {:#?}", capabilities);

        let device_core = {
            let family_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(capabilities.queue_family_index)
                .queue_priorities(&[1.0])];

            let mut device_extensions = REQUIRED_DEVICE_EXTENSIONS.to_vec();
            if surface_handles.is_some() {
                device_extensions.push(khr::swapchain::NAME);
            }
            let str_pointers = device_extensions
                .iter()
                .map(|&s| s.as_ptr())
                .collect::<Vec<_>>();

            let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
                .timeline_semaphore(true)
                .buffer_device_address(true);
            let mut dynamic_rendering_features =
                vk::PhysicalDeviceDynamicRenderingFeaturesKHR::default().dynamic_rendering(true);
            let mut acceleration_structure_features =
                vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                    .acceleration_structure(true);
            let mut ray_tracing_pipeline_features =
                vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
                    .ray_tracing_pipeline(true);
            let device_create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&family_infos)
                .enabled_extension_names(&str_pointers)
                .push_next(&mut vulkan12_features)
                .push_next(&mut dynamic_rendering_features)
                .push_next(&mut acceleration_structure_features)
                .push_next(&mut ray_tracing_pipeline_features);

            instance
                .core
                .create_device(physical_device, &device_create_info, None)?
        };

        let device = crate::Device {
            swapchain: khr::swapchain::Device::new(&instance.core, &device_core),
            dynamic_rendering: khr::dynamic_rendering::Device::new(&instance.core, &device_core),
            acceleration_structure: khr::acceleration_structure::Device::new(
                &instance.core,
                &device_core,
            ),
            ray_tracing_pipeline: khr::ray_tracing_pipeline::Device::new(
                &instance.core,
                &device_core,
            ),
            debug_utils: if instance.debug_utils.is_some() {
                Some(ash::ext::debug_utils::Device::new(&instance.core, &device_core))
            } else {
                None
            },
            core: device_core,
        };

        let memory_manager = {
            let mem_properties = instance
                .core
                .get_physical_device_memory_properties(physical_device);
            let memory_types =
                &mem_properties.memory_types[..mem_properties.memory_type_count as usize];
            let limits = &capabilities.properties.limits;
            let config = gpu_alloc::Config::i_am_prototyping();

            let properties = gpu_alloc::DeviceProperties {
                max_memory_allocation_count: limits.max_memory_allocation_count,
                max_memory_allocation_size: u64::MAX,
                non_coherent_atom_size: limits.non_coherent_atom_size,
                memory_types: memory_types
                    .iter()
                    .map(|memory_type| gpu_alloc::MemoryType {
                        props: gpu_alloc::MemoryPropertyFlags::from_bits_truncate(
                            memory_type.property_flags.as_raw() as u8,
                        ),
                        heap: memory_type.heap_index,
                    })
                    .collect(),
                memory_heaps: mem_properties.memory_heaps
                    [..mem_properties.memory_heap_count as usize]
                    .iter()
                    .map(|&memory_heap| gpu_alloc::MemoryHeap {
                        size: memory_heap.size,
                    })
                    .collect(),
                buffer_device_address: true,
            };

            let known_memory_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED
                | vk::MemoryPropertyFlags::LAZILY_ALLOCATED;
            let valid_ash_memory_types = memory_types.iter().enumerate().fold(0, |u, (i, mem)| {
                if known_memory_flags.contains(mem.property_flags) {
                    u | (1 << i)
                } else {
                    u
                }
            });
            crate::MemoryManager {
                allocator: gpu_alloc::GpuAllocator::new(config, properties),
                slab: slab::Slab::new(),
                valid_ash_memory_types,
            }
        };

        let queue = device
            .core
            .get_device_queue(capabilities.queue_family_index, 0);
        let last_progress = 0;
        let mut timeline_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(last_progress);
        let timeline_semaphore_create_info =
            vk::SemaphoreCreateInfo::default().push_next(&mut timeline_info);
        let timeline_semaphore = device
            .core
            .create_semaphore(&timeline_semaphore_create_info, None)?;
        let present_semaphore = device
            .core
            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;

        // The windowed path keeps the `vk::SurfaceKHR` alive inside the
        // `Surface` object created later, so the raw handle is dropped here.
        if let Some(raw) = vk_surface {
            instance.surface.destroy_surface(raw, None);
        }

        Ok(crate::Context {
            memory: Mutex::new(memory_manager),
            device,
            queue: Mutex::new(crate::Queue {
                raw: queue,
                timeline_semaphore,
                present_semaphore,
                last_progress,
            }),
            queue_family_index: capabilities.queue_family_index,
            physical_device,
            rt_limits: capabilities.rt_limits,
            instance,
            entry,
        })
    }

    /// Initialize without presentation support.
    pub unsafe fn init(desc: crate::ContextDesc) -> Result<Self, crate::Error> {
        Self::init_impl(desc, None)
    }

    /// Initialize with presentation support for the given window.
    pub unsafe fn init_windowed<
        I: raw_window_handle::HasWindowHandle + raw_window_handle::HasDisplayHandle,
    >(
        window: &I,
        desc: crate::ContextDesc,
    ) -> Result<Self, crate::Error> {
        let handles = (
            window.window_handle().unwrap().as_raw(),
            window.display_handle().unwrap().as_raw(),
        );
        Self::init_impl(desc, Some(handles))
    }

    pub(super) fn set_object_name(&self, object: impl vk::Handle, name: &str) {
        let Some(ref debug_utils) = self.device.debug_utils else {
            return;
        };
        let name_cstr = ffi::CString::new(name).unwrap();
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(&name_cstr);
        let _ = unsafe { debug_utils.set_debug_utils_object_name(&name_info) };
    }

    pub fn create_command_encoder(&self, desc: crate::CommandEncoderDesc) -> crate::CommandEncoder {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family_index);
        let pool = unsafe { self.device.core.create_command_pool(&pool_info, None).unwrap() };
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(desc.buffer_count);
        let buffers = unsafe { self.device.core.allocate_command_buffers(&alloc_info).unwrap() };
        for &raw in buffers.iter() {
            self.set_object_name(raw, desc.name);
        }
        crate::CommandEncoder {
            pool,
            buffers,
            device: self.device.core.clone(),
            present: None,
        }
    }

    pub fn destroy_command_encoder(&self, encoder: &mut crate::CommandEncoder) {
        unsafe { self.device.core.destroy_command_pool(encoder.pool, None) };
        encoder.buffers.clear();
    }

    /// Close the current command buffer and hand it to the GPU. The returned
    /// sync point covers everything recorded since the last `start`.
    pub fn submit(&self, encoder: &mut crate::CommandEncoder) -> crate::SyncPoint {
        unsafe {
            self.device
                .core
                .end_command_buffer(encoder.buffers[0])
                .unwrap()
        };

        let mut queue = self.queue.lock().unwrap();
        queue.last_progress += 1;
        let progress = queue.last_progress;
        let command_buffers = [encoder.buffers[0]];
        let signal_values;
        let wait_values;
        let signal_semaphores;
        let wait_semaphores;
        let wait_stages;
        let mut timeline_info;
        let submit_info;
        match encoder.present.take() {
            Some(intent) => {
                signal_values = [progress, 0];
                wait_values = [0];
                signal_semaphores = [queue.timeline_semaphore, queue.present_semaphore];
                wait_semaphores = [intent.acquire_semaphore];
                wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::TRANSFER];
                timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
                    .wait_semaphore_values(&wait_values)
                    .signal_semaphore_values(&signal_values);
                submit_info = vk::SubmitInfo::default()
                    .command_buffers(&command_buffers)
                    .wait_semaphores(&wait_semaphores)
                    .wait_dst_stage_mask(&wait_stages)
                    .signal_semaphores(&signal_semaphores[..2])
                    .push_next(&mut timeline_info);
                unsafe {
                    self.device
                        .core
                        .queue_submit(queue.raw, &[submit_info], vk::Fence::null())
                        .unwrap();
                }

                let present_wait = [queue.present_semaphore];
                let swapchains = [intent.swapchain];
                let image_indices = [intent.image_index];
                let present_info = vk::PresentInfoKHR::default()
                    .wait_semaphores(&present_wait)
                    .swapchains(&swapchains)
                    .image_indices(&image_indices);
                match unsafe { self.device.swapchain.queue_present(queue.raw, &present_info) } {
                    Ok(_suboptimal) => {}
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                        log::warn!("Present failed because the surface is out of date");
                    }
                    Err(other) => panic!("present error {}", other),
                }
            }
            None => {
                signal_values = [progress, 0];
                signal_semaphores = [queue.timeline_semaphore, vk::Semaphore::null()];
                timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
                    .signal_semaphore_values(&signal_values[..1]);
                submit_info = vk::SubmitInfo::default()
                    .command_buffers(&command_buffers)
                    .signal_semaphores(&signal_semaphores[..1])
                    .push_next(&mut timeline_info);
                unsafe {
                    self.device
                        .core
                        .queue_submit(queue.raw, &[submit_info], vk::Fence::null())
                        .unwrap();
                }
            }
        }

        crate::SyncPoint { progress }
    }

    /// Block until the GPU has retired `sp`, or until the timeout expires.
    /// Returns `true` when the sync point is reached.
    pub fn wait_for(&self, sp: &crate::SyncPoint, timeout_ms: u32) -> bool {
        let timeline_semaphore = self.queue.lock().unwrap().timeline_semaphore;
        let semaphores = [timeline_semaphore];
        let values = [sp.progress];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = (timeout_ms as u64).saturating_mul(1_000_000);
        match unsafe { self.device.core.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => true,
            Err(vk::Result::TIMEOUT) => false,
            Err(other) => panic!("wait error {}", other),
        }
    }

    /// The highest sync point value the GPU has completed so far.
    pub fn gpu_progress(&self) -> u64 {
        let timeline_semaphore = self.queue.lock().unwrap().timeline_semaphore;
        unsafe {
            self.device
                .core
                .get_semaphore_counter_value(timeline_semaphore)
                .unwrap()
        }
    }
}
