use ash::vk;
use std::mem;

#[derive(Clone, Copy, Debug)]
pub struct SurfaceConfig {
    pub size: crate::Extent,
}

#[derive(Clone, Copy, Debug, Default)]
struct InternalFrame {
    acquire_semaphore: vk::Semaphore,
    image: vk::Image,
    view: vk::ImageView,
}

/// Double-buffered swap surface. Created by the embedding application and
/// passed to the frame orchestrator by reference; the orchestrator only
/// acquires back buffers and signals presents.
pub struct Surface {
    raw: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: crate::Extent,
    frames: Vec<InternalFrame>,
    next_semaphore: vk::Semaphore,
}

impl Surface {
    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> crate::Extent {
        self.extent
    }
}

/// One acquired back buffer, valid until presented.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) swapchain: vk::SwapchainKHR,
    pub(crate) image_index: u32,
    pub(crate) acquire_semaphore: vk::Semaphore,
}

impl crate::Context {
    pub fn create_surface<
        I: raw_window_handle::HasWindowHandle + raw_window_handle::HasDisplayHandle,
    >(
        &self,
        window: &I,
        config: SurfaceConfig,
    ) -> Result<Surface, crate::Error> {
        let raw = unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.instance.core,
                window.display_handle().unwrap().as_raw(),
                window.window_handle().unwrap().as_raw(),
                None,
            )?
        };

        if unsafe {
            self.instance.surface.get_physical_device_surface_support(
                self.physical_device,
                self.queue_family_index,
                raw,
            ) != Ok(true)
        } {
            log::warn!("Rejected for not presenting to the window surface");
            return Err(crate::Error::NotSupported(
                "queue can not present to the window surface",
            ));
        }

        let capabilities = unsafe {
            self.instance
                .surface
                .get_physical_device_surface_capabilities(self.physical_device, raw)?
        };
        if config.size.width < capabilities.min_image_extent.width
            || config.size.width > capabilities.max_image_extent.width
            || config.size.height < capabilities.min_image_extent.height
            || config.size.height > capabilities.max_image_extent.height
        {
            log::warn!(
                "Requested size {}x{} is outside of surface capabilities",
                config.size.width,
                config.size.height
            );
        }

        let supported_formats = unsafe {
            self.instance
                .surface
                .get_physical_device_surface_formats(self.physical_device, raw)?
        };
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let surface_format = if supported_formats.contains(&preferred) {
            preferred
        } else {
            supported_formats[0]
        };

        let effective_frame_count = 2.max(capabilities.min_image_count).min(
            if capabilities.max_image_count != 0 {
                capabilities.max_image_count
            } else {
                !0
            },
        );

        let queue_families = [self.queue_family_index];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(raw)
            .min_image_count(effective_frame_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(vk::Extent2D {
                width: config.size.width,
                height: config.size.height,
            })
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .queue_family_indices(&queue_families)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO);
        let swapchain = unsafe { self.device.swapchain.create_swapchain(&create_info, None)? };

        let images = unsafe { self.device.swapchain.get_swapchain_images(swapchain)? };
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let mut frames = Vec::with_capacity(images.len());
        for image in images {
            let view_create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(subresource_range);
            let view = unsafe { self.device.core.create_image_view(&view_create_info, None)? };
            let acquire_semaphore = unsafe {
                self.device
                    .core
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
            };
            frames.push(InternalFrame {
                acquire_semaphore,
                image,
                view,
            });
        }
        let next_semaphore = unsafe {
            self.device
                .core
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        };

        log::info!(
            "Created surface {}x{} with {} frames, format {:?}",
            config.size.width,
            config.size.height,
            frames.len(),
            surface_format.format,
        );
        Ok(Surface {
            raw,
            swapchain,
            format: surface_format.format,
            extent: config.size,
            frames,
            next_semaphore,
        })
    }

    pub fn destroy_surface(&self, surface: &mut Surface) {
        unsafe {
            self.device.swapchain.destroy_swapchain(surface.swapchain, None);
            for frame in surface.frames.drain(..) {
                self.device.core.destroy_image_view(frame.view, None);
                self.device
                    .core
                    .destroy_semaphore(frame.acquire_semaphore, None);
            }
            self.device
                .core
                .destroy_semaphore(surface.next_semaphore, None);
            self.instance.surface.destroy_surface(surface.raw, None);
        }
    }

    /// The current back-buffer of the swap surface.
    pub fn acquire_frame(&self, surface: &mut Surface) -> Frame {
        let acquire_semaphore = surface.next_semaphore;
        match unsafe {
            self.device.swapchain.acquire_next_image(
                surface.swapchain,
                !0,
                acquire_semaphore,
                vk::Fence::null(),
            )
        } {
            Ok((index, _suboptimal)) => {
                surface.next_semaphore = mem::replace(
                    &mut surface.frames[index as usize].acquire_semaphore,
                    acquire_semaphore,
                );
                let frame = &surface.frames[index as usize];
                Frame {
                    image: frame.image,
                    view: frame.view,
                    swapchain: surface.swapchain,
                    image_index: index,
                    acquire_semaphore,
                }
            }
            Err(other) => panic!("acquire image error {}", other),
        }
    }
}
