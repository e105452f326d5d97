//! Vulkan graphics backend.
//!
//! Allocates external memory with `OPAQUE_FD` export, so every allocation
//! has an fd handle other processes can duplicate and import. Mapping
//! imports the (duplicated) fd into a fresh `VkDeviceMemory` and maps it;
//! the returned view owns the import-side memory and releases it on drop,
//! leaving the exported handle itself untouched.

use std::collections::HashMap;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use ash::vk;

use super::{CpuView, GpuAllocation, GraphicsApi};
use crate::error::{Error, Result};

/// Owns the instance and device; views keep it alive past the allocator.
struct DeviceOwner {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
}

impl Drop for DeviceOwner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Vulkan-backed [`GraphicsApi`] implementation.
pub struct VulkanGraphics {
    owner: Arc<DeviceOwner>,
    external_memory_fd: ash::khr::external_memory_fd::Device,
    device_local_memory_type: u32,
    host_visible_memory_type: u32,
    /// fd handle -> device memory, for allocations made by this process.
    exports: Mutex<HashMap<u64, vk::DeviceMemory>>,
}

impl VulkanGraphics {
    /// Bring up Vulkan: load the library, create an instance, pick the
    /// first physical device, and create a device with external-memory-fd
    /// support.
    pub fn new() -> Result<Self> {
        // SAFETY: standard ash bring-up; the library outlives the instance.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| Error::GraphicsUnavailable(format!("vulkan loader: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"crosspool")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"crosspool")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| Error::GraphicsUnavailable(format!("create instance: {e}")))?;

        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| Error::GraphicsUnavailable(format!("enumerate devices: {e}")))?;
        let Some(&physical_device) = physical_devices.first() else {
            unsafe { instance.destroy_instance(None) };
            return Err(Error::GraphicsUnavailable("no physical device".into()));
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_local_memory_type = Self::find_memory_type(
            &memory_properties,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let host_visible_memory_type = Self::find_memory_type(
            &memory_properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        let (Some(device_local_memory_type), Some(host_visible_memory_type)) =
            (device_local_memory_type, host_visible_memory_type)
        else {
            unsafe { instance.destroy_instance(None) };
            return Err(Error::GraphicsUnavailable(
                "required memory types missing".into(),
            ));
        };

        let queue_priority = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(0)
            .queue_priorities(&queue_priority)];
        let extensions = [ash::khr::external_memory_fd::NAME.as_ptr()];
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);
        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|e| {
                unsafe { instance.destroy_instance(None) };
                Error::GraphicsUnavailable(format!("create device: {e}"))
            })?;

        let external_memory_fd = ash::khr::external_memory_fd::Device::new(&instance, &device);

        Ok(Self {
            owner: Arc::new(DeviceOwner {
                _entry: entry,
                instance,
                device,
            }),
            external_memory_fd,
            device_local_memory_type,
            host_visible_memory_type,
            exports: Mutex::new(HashMap::new()),
        })
    }

    fn find_memory_type(
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        required_flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..memory_properties.memory_type_count).find(|&i| {
            memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required_flags)
        })
    }
}

impl GraphicsApi for VulkanGraphics {
    fn is_active(&self) -> bool {
        true
    }

    fn allocate(&self, size: u64, device_local: bool) -> Option<GpuAllocation> {
        let memory_type_index = if device_local {
            self.device_local_memory_type
        } else {
            self.host_visible_memory_type
        };

        let mut export_info = vk::ExportMemoryAllocateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index)
            .push_next(&mut export_info);

        let device = &self.owner.device;
        let memory = unsafe { device.allocate_memory(&alloc_info, None) }.ok()?;

        let fd_info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let fd = match unsafe { self.external_memory_fd.get_memory_fd(&fd_info) } {
            Ok(fd) => fd,
            Err(err) => {
                tracing::warn!(%err, size, "external memory fd export failed");
                unsafe { device.free_memory(memory, None) };
                return None;
            }
        };

        let handle = fd as u64;
        self.exports
            .lock()
            .expect("exports mutex poisoned")
            .insert(handle, memory);
        Some(GpuAllocation {
            handle,
            memory_type_index,
        })
    }

    fn map(&self, handle: u64, size: u64, memory_type_index: u32) -> Result<CpuView> {
        // Importing consumes an fd; hand Vulkan a duplicate so the pool's
        // handle stays valid for later duplication and freeing.
        let dup = rustix::io::fcntl_dupfd_cloexec(
            // SAFETY: handle is an fd owned by the caller, borrowed for dup.
            unsafe { std::os::fd::BorrowedFd::borrow_raw(handle as i32) },
            0,
        )?;

        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .fd(dup.into_raw_fd());
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info);

        let device = &self.owner.device;
        let imported = unsafe { device.allocate_memory(&alloc_info, None) }
            .map_err(|e| Error::GraphicsUnavailable(format!("import memory: {e}")))?;

        let ptr = unsafe { device.map_memory(imported, 0, size, vk::MemoryMapFlags::empty()) }
            .map_err(|e| {
                unsafe { device.free_memory(imported, None) };
                Error::GraphicsUnavailable(format!("map memory: {e}"))
            })?;
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("vkMapMemory returned null".into()))?;

        let owner = Arc::clone(&self.owner);
        Ok(CpuView::new(
            ptr,
            size as usize,
            Box::new(move || unsafe {
                owner.device.unmap_memory(imported);
                owner.device.free_memory(imported, None);
            }),
        ))
    }

    fn free(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        if let Some(memory) = self
            .exports
            .lock()
            .expect("exports mutex poisoned")
            .remove(&handle)
        {
            unsafe { self.owner.device.free_memory(memory, None) };
        }
        // Either way the fd is ours to close: exported fds for our own
        // allocations, duplicated fds for foreign ones.
        // SAFETY: the handle is an fd this process owns.
        drop(unsafe { OwnedFd::from_raw_fd(handle as i32) });
    }
}

impl std::fmt::Debug for VulkanGraphics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanGraphics")
            .field("device_local_memory_type", &self.device_local_memory_type)
            .field("host_visible_memory_type", &self.host_visible_memory_type)
            .finish()
    }
}
