//! Device capability reporting.
//!
//! Everything here is derived from the [`DeviceConfig`] once at device
//! creation and never changes afterwards.

use crate::config::{DeviceConfig, HeapKind};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tessera_core::format::TexelClass;
use tessera_core::{constants, Format};

/// Vendor id reported by the device. Ids above `0xFFFF` are outside the PCI
/// range and reserved for non-hardware implementations.
pub const VENDOR_ID: u32 = 0x1_7E55;

/// Encode an API version the way the loader expects it.
pub const fn make_api_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 22) | (minor << 12) | patch
}

pub const fn api_version_major(version: u32) -> u32 {
    version >> 22
}

pub const fn api_version_minor(version: u32) -> u32 {
    (version >> 12) & 0x3ff
}

pub const fn api_version_patch(version: u32) -> u32 {
    version & 0xfff
}

bitflags! {
    /// Properties of a memory type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 0x1;
        const HOST_VISIBLE = 0x2;
        const HOST_COHERENT = 0x4;
    }

    /// Properties of a memory heap.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryHeapFlags: u32 {
        const DEVICE_LOCAL = 0x1;
    }

    /// Operations a queue family supports.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct QueueFlags: u32 {
        const GRAPHICS = 0x1;
        const TRANSFER = 0x4;
    }

    /// Operations a format supports.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FormatFeatureFlags: u32 {
        const SAMPLED_IMAGE = 0x1;
        const UNIFORM_TEXEL_BUFFER = 0x8;
        const VERTEX_BUFFER = 0x40;
        const COLOR_ATTACHMENT = 0x80;
        const COLOR_ATTACHMENT_BLEND = 0x100;
        const DEPTH_STENCIL_ATTACHMENT = 0x200;
        const SAMPLED_IMAGE_FILTER_LINEAR = 0x1000;
        const TRANSFER_SRC = 0x4000;
        const TRANSFER_DST = 0x8000;
    }
}

/// Kind of physical device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicalDeviceType {
    Cpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: MemoryHeapFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueFamily {
    pub flags: QueueFlags,
    pub queue_count: u32,
}

/// Numeric limits.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub max_image_dimension_1d: u32,
    pub max_image_dimension_2d: u32,
    pub max_image_dimension_3d: u32,
    pub max_image_array_layers: u32,
    pub max_push_constants_size: u32,
    pub max_bound_descriptor_sets: u32,
    pub max_vertex_input_bindings: u32,
    pub max_color_attachments: u32,
    pub min_memory_map_alignment: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub sub_pixel_precision_bits: u32,
    pub max_viewport_dimensions: [u32; 2],
    pub viewport_bounds_range: [f32; 2],
    pub point_size_range: [f32; 2],
    pub max_update_buffer_size: u64,
}

/// Detected device capabilities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub device_name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    pub memory_heaps: Vec<MemoryHeap>,
    pub memory_types: Vec<MemoryType>,
    pub queue_families: Vec<QueueFamily>,
    pub limits: Limits,
}

impl Capabilities {
    pub(crate) fn from_config(config: &DeviceConfig) -> Self {
        let memory_heaps = config
            .heaps
            .iter()
            .map(|heap| MemoryHeap {
                size: heap.size,
                flags: match heap.kind {
                    HeapKind::DeviceLocal => MemoryHeapFlags::DEVICE_LOCAL,
                    HeapKind::HostVisible => MemoryHeapFlags::empty(),
                },
            })
            .collect();
        let memory_types = config
            .heaps
            .iter()
            .enumerate()
            .map(|(index, heap)| MemoryType {
                property_flags: match heap.kind {
                    HeapKind::DeviceLocal => MemoryPropertyFlags::DEVICE_LOCAL,
                    HeapKind::HostVisible => {
                        MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT
                    }
                },
                heap_index: index as u32,
            })
            .collect();

        let dim = config.max_image_dimension;
        Self {
            device_name: "Tessera Software Rasterizer".to_string(),
            vendor_id: VENDOR_ID,
            device_id: 1,
            device_type: PhysicalDeviceType::Cpu,
            api_version: make_api_version(1, 3, 0),
            driver_version: make_api_version(0, 1, 0),
            memory_heaps,
            memory_types,
            queue_families: vec![QueueFamily {
                flags: QueueFlags::GRAPHICS | QueueFlags::TRANSFER,
                queue_count: config.queue_count,
            }],
            limits: Limits {
                max_image_dimension_1d: dim,
                max_image_dimension_2d: dim,
                max_image_dimension_3d: dim.min(2048),
                max_image_array_layers: 2048,
                max_push_constants_size: 128,
                max_bound_descriptor_sets: 4,
                max_vertex_input_bindings: 16,
                max_color_attachments: 8,
                min_memory_map_alignment: 64,
                min_uniform_buffer_offset_alignment: 256,
                min_storage_buffer_offset_alignment: 64,
                sub_pixel_precision_bits: constants::SUBPIXEL_BITS,
                max_viewport_dimensions: [constants::MAX_VIEWPORT_DIMENSION; 2],
                viewport_bounds_range: constants::VIEWPORT_BOUNDS_RANGE,
                point_size_range: [1.0, 64.0],
                max_update_buffer_size: 65536,
            },
        }
    }

    /// Bit mask with one bit per exposed memory type.
    pub fn memory_type_bits(&self) -> u32 {
        (1u32 << self.memory_types.len()) - 1
    }

    /// First memory type allowed by `type_bits` that has all of `required`.
    pub fn find_memory_type(&self, type_bits: u32, required: MemoryPropertyFlags) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .find(|(i, ty)| type_bits & (1 << i) != 0 && ty.property_flags.contains(required))
            .map(|(i, _)| i as u32)
    }

    /// Features supported for `format` with optimal or linear tiling.
    pub fn format_features(&self, format: Format) -> FormatFeatureFlags {
        let transfer = FormatFeatureFlags::TRANSFER_SRC | FormatFeatureFlags::TRANSFER_DST;
        if !format.is_color() {
            return transfer
                | FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                | FormatFeatureFlags::SAMPLED_IMAGE;
        }

        let mut features = transfer
            | FormatFeatureFlags::SAMPLED_IMAGE
            | FormatFeatureFlags::COLOR_ATTACHMENT
            | FormatFeatureFlags::VERTEX_BUFFER
            | FormatFeatureFlags::UNIFORM_TEXEL_BUFFER;
        if format.class() == TexelClass::Float {
            features |= FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        }
        if format.is_blendable() {
            features |= FormatFeatureFlags::COLOR_ATTACHMENT_BLEND;
        }
        features
    }

    /// Total size of the device-local heaps, in MiB.
    pub fn device_local_memory_mb(&self) -> u64 {
        self.memory_heaps
            .iter()
            .filter(|h| h.flags.contains(MemoryHeapFlags::DEVICE_LOCAL))
            .map(|h| h.size)
            .sum::<u64>()
            / (1024 * 1024)
    }

    /// Get a summary string for logging.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - API {}.{}.{} - {} MB device-local - {} queue(s)",
            self.device_name,
            self.device_type,
            api_version_major(self.api_version),
            api_version_minor(self.api_version),
            api_version_patch(self.api_version),
            self.device_local_memory_mb(),
            self.queue_families.iter().map(|f| f.queue_count).sum::<u32>(),
        )
    }
}
