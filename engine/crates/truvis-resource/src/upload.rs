//! 上传管线
//!
//! 写入策略只由 MemoryPolicy 决定：
//! - HostVisible / HostVisibleCoherent：同步写入映射内存，非 coherent 时显式 flush
//! - DeviceLocal / Sparse：复制到 UploadArena → 写入 staging buffer →
//!   录制 barrier(prior → TRANSFER_DST) + copy + barrier(TRANSFER_DST → usage 对应的状态)
//!
//! staging 上传不会阻塞调用方，资源要等到传输被 `complete_pending_transfers` 确认后才能读取。

use ash::vk;
use truvis_gfx::commands::barrier::{BufferBarrierDesc, ImageBarrierDesc};
use truvis_gfx::commands::transfer_command::TransferCommand;
use truvis_gfx::device::GfxDevice;
use truvis_gfx::memory::DeviceAllocation;
use truvis_gfx::resources::desc::{BufferDesc, ImageDesc, format_texel_size};
use truvis_gfx::resources::resource_state::{BufferState, ImageState, buffer_state_for_usage, image_state_for_usage};

use crate::allocator::AllocationRecord;
use crate::error::{ResourceError, ResourceResult};
use crate::handles::InnerResourceHandle;
use crate::resource_data::GpuResourceData;
use crate::staging::StagingBuffer;
use crate::transfer::{StagingRequest, TransferRecorder, TransferState};

/// 同步写入 host 可见内存
pub fn write_host_visible(
    device: &dyn GfxDevice,
    record: &AllocationRecord,
    offset: vk::DeviceSize,
    bytes: &[u8],
) -> ResourceResult<()> {
    device.write_mapped(&record.allocation, offset, bytes)?;
    if record.policy.needs_flush() {
        device.flush_mapped(&record.allocation, offset, bytes.len() as vk::DeviceSize)?;
    }
    Ok(())
}

pub fn validate_buffer_data(desc: &BufferDesc, data: &GpuResourceData) -> ResourceResult<()> {
    if data.data.is_empty() {
        return Err(ResourceError::InvalidData("empty upload".to_string()));
    }
    if data.data.len() as u64 > desc.size {
        return Err(ResourceError::InvalidData(format!(
            "{} bytes do not fit into a buffer of {} bytes",
            data.data.len(),
            desc.size
        )));
    }
    Ok(())
}

/// 复制到 arena 并写入一个 staging buffer
fn stage_bytes(
    device: &dyn GfxDevice,
    state: &mut TransferState,
    data: &GpuResourceData,
) -> ResourceResult<StagingBuffer> {
    let copy = state.arena.stash(data.data, data.alignment)?;
    let staging = state.staging.acquire(device, copy.len() as vk::DeviceSize)?;
    if let Err(e) = device.write_mapped(&staging.allocation, 0, copy) {
        state.staging.give_back(device, staging);
        return Err(e.into());
    }
    state.staging.mark_in_flight(staging);
    Ok(staging)
}

/// 通过 staging 上传 buffer 数据，返回上传完成后 buffer 所处的状态
pub fn stage_buffer_upload(
    device: &dyn GfxDevice,
    recorder: &mut TransferRecorder<'_>,
    key: InnerResourceHandle,
    buffer: vk::Buffer,
    desc: &BufferDesc,
    prior: BufferState,
    data: &GpuResourceData,
) -> ResourceResult<BufferState> {
    let _span = tracy_client::span!("stage_buffer_upload");
    validate_buffer_data(desc, data)?;

    let staging = stage_bytes(device, recorder.state_mut(), data)?;
    let size = data.data.len() as vk::DeviceSize;
    let final_state = buffer_state_for_usage(desc.usage);

    recorder.record(TransferCommand::BufferBarrier(BufferBarrierDesc::new(buffer, prior, BufferState::TRANSFER_DST)));
    recorder.record(TransferCommand::CopyBuffer {
        src: staging.buffer,
        dst: buffer,
        regions: vec![vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        }],
    });
    recorder.record(TransferCommand::BufferBarrier(BufferBarrierDesc::new(
        buffer,
        BufferState::TRANSFER_DST,
        final_state,
    )));
    recorder.state_mut().pending.push(StagingRequest { destination: key, size });

    log::debug!("staged {} bytes into buffer {:?}", size, buffer);
    Ok(final_state)
}

/// 通过 staging 上传 image 数据，返回上传完成后 image 所处的状态
pub fn stage_image_upload(
    device: &dyn GfxDevice,
    recorder: &mut TransferRecorder<'_>,
    key: InnerResourceHandle,
    image: vk::Image,
    desc: &ImageDesc,
    prior: ImageState,
    data: &GpuResourceData,
) -> ResourceResult<ImageState> {
    let _span = tracy_client::span!("stage_image_upload");
    let regions = image_copy_regions(desc, data)?;

    let staging = stage_bytes(device, recorder.state_mut(), data)?;
    let range = desc.full_subresource_range();
    let final_state = image_state_for_usage(desc.usage);
    let region_count = regions.len();

    recorder.record(TransferCommand::ImageBarrier(ImageBarrierDesc::new(image, prior, ImageState::TRANSFER_DST, range)));
    recorder.record(TransferCommand::CopyBufferToImage {
        src: staging.buffer,
        dst: image,
        dst_layout: ImageState::TRANSFER_DST.layout,
        regions,
    });
    recorder.record(TransferCommand::ImageBarrier(ImageBarrierDesc::new(
        image,
        ImageState::TRANSFER_DST,
        final_state,
        range,
    )));
    recorder.state_mut().pending.push(StagingRequest {
        destination: key,
        size: data.data.len() as u64,
    });

    log::debug!("staged {} bytes into image {:?} ({} regions)", data.data.len(), image, region_count);
    Ok(final_state)
}

/// extent 的任一维为 0 或没有 mip/layer 的 image 无法创建也无法上传
pub fn validate_image_desc(desc: &ImageDesc) -> ResourceResult<()> {
    let extent = desc.extent;
    if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
        return Err(ResourceError::InvalidData(format!("image extent {extent:?} has a zero dimension")));
    }
    if desc.mip_levels == 0 || desc.array_layers == 0 {
        return Err(ResourceError::InvalidData(format!(
            "image needs at least one mip level and one array layer, got {} and {}",
            desc.mip_levels, desc.array_layers
        )));
    }
    Ok(())
}

/// 计算 image 上传的拷贝描述
///
/// - 只有一个 subresource 时，允许通过 row/slice pitch 描述数据布局
/// - 多个 subresource 时数据必须紧密排列：先按 mip 再按 layer，
///   每个 (mip, layer) 一个拷贝描述，第 k 级 mip 的尺寸为 `max(1, dim >> k)`
pub fn image_copy_regions(desc: &ImageDesc, data: &GpuResourceData) -> ResourceResult<Vec<vk::BufferImageCopy>> {
    validate_image_desc(desc)?;
    if data.data.is_empty() {
        return Err(ResourceError::InvalidData("empty upload".to_string()));
    }
    // 传输队列只能回放可以按 texel 定位的拷贝
    let texel = format_texel_size(desc.format).ok_or(ResourceError::UnsupportedFormat(desc.format))? as u64;

    let aspect_mask = desc.aspect_mask();
    let region = |buffer_offset: u64, mip: u32, layer: u32, row_length: u32, image_height: u32| vk::BufferImageCopy {
        buffer_offset,
        buffer_row_length: row_length,
        buffer_image_height: image_height,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask,
            mip_level: mip,
            base_array_layer: layer,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: desc.mip_extent(mip),
    };

    if desc.subresource_count() == 1 {
        let extent = desc.extent;
        let row_length = if data.row_pitch == 0 { extent.width } else { data.row_pitch };
        let image_height = if data.slice_pitch == 0 { extent.height } else { data.slice_pitch };
        if row_length < extent.width || image_height < extent.height {
            return Err(ResourceError::InvalidData(format!(
                "pitch ({row_length}, {image_height}) smaller than image extent {extent:?}"
            )));
        }
        let texels = (extent.depth as u64 - 1) * image_height as u64 * row_length as u64
            + (extent.height as u64 - 1) * row_length as u64
            + extent.width as u64;
        let required = texels * texel;
        if (data.data.len() as u64) < required {
            return Err(ResourceError::InvalidData(format!(
                "image upload needs {required} bytes, got {}",
                data.data.len()
            )));
        }
        return Ok(vec![region(0, 0, 0, data.row_pitch, data.slice_pitch)]);
    }

    if !data.is_tightly_packed() {
        return Err(ResourceError::InvalidData(
            "row/slice pitch is only supported for single-subresource image uploads".to_string(),
        ));
    }

    let mut regions = Vec::with_capacity(desc.subresource_count() as usize);
    let mut offset = 0u64;
    for mip in 0..desc.mip_levels {
        let extent = desc.mip_extent(mip);
        let size = extent.width as u64 * extent.height as u64 * extent.depth as u64 * texel;
        for layer in 0..desc.array_layers {
            regions.push(region(offset, mip, layer, 0, 0));
            offset += size;
        }
    }
    if (data.data.len() as u64) < offset {
        return Err(ResourceError::InvalidData(format!(
            "mip chain needs {offset} bytes, got {}",
            data.data.len()
        )));
    }
    Ok(regions)
}

/// 按 host 可写策略写入 image 的线性内存
pub fn write_host_visible_image(
    device: &dyn GfxDevice,
    record: &AllocationRecord,
    desc: &ImageDesc,
    data: &GpuResourceData,
) -> ResourceResult<()> {
    image_copy_regions(desc, data)?;
    if data.data.len() as u64 > record.allocation.size {
        return Err(ResourceError::InvalidData(format!(
            "{} bytes do not fit into an image allocation of {} bytes",
            data.data.len(),
            record.allocation.size
        )));
    }
    write_host_visible(device, record, 0, data.data)
}

#[inline]
pub fn allocation_range_check(allocation: &DeviceAllocation, offset: u64, len: u64) -> ResourceResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= allocation.size => Ok(()),
        _ => Err(ResourceError::InvalidData(format!(
            "range {offset}..{offset}+{len} outside allocation of {} bytes",
            allocation.size
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba_desc(width: u32, height: u32, mips: u32) -> ImageDesc {
        ImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width, height },
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )
        .with_mip_levels(mips)
    }

    #[test]
    fn test_one_region_per_mip_with_halved_extent() {
        for (width, height) in [(256, 256), (37, 5), (1, 64)] {
            for mips in 1..=9 {
                let desc = rgba_desc(width, height, mips);
                let data = vec![0u8; 4 * 256 * 256 * 2];
                let regions = image_copy_regions(&desc, &GpuResourceData::new(&data)).unwrap();

                assert_eq!(regions.len(), mips as usize);
                for (k, region) in regions.iter().enumerate() {
                    assert_eq!(region.image_subresource.mip_level, k as u32);
                    assert_eq!(region.image_extent.width, (width >> k).max(1));
                    assert_eq!(region.image_extent.height, (height >> k).max(1));
                }
            }
        }
    }

    #[test]
    fn test_regions_are_packed_mip_major() {
        let desc = rgba_desc(4, 4, 3).with_array_layers(2);
        let data = vec![0u8; (16 + 4 + 1) * 4 * 2];
        let regions = image_copy_regions(&desc, &GpuResourceData::new(&data)).unwrap();

        let layout: Vec<(u32, u32, u64)> = regions
            .iter()
            .map(|r| (r.image_subresource.mip_level, r.image_subresource.base_array_layer, r.buffer_offset))
            .collect();
        assert_eq!(layout, vec![(0, 0, 0), (0, 1, 64), (1, 0, 128), (1, 1, 144), (2, 0, 160), (2, 1, 164)]);
    }

    #[test]
    fn test_short_mip_chain_data_is_rejected() {
        let desc = rgba_desc(4, 4, 2);
        let data = vec![0u8; 64];
        assert!(matches!(
            image_copy_regions(&desc, &GpuResourceData::new(&data)),
            Err(ResourceError::InvalidData(_))
        ));
    }

    #[test]
    fn test_pitch_only_for_single_subresource() {
        let data = vec![0u8; 8 * 4 * 4];
        let single = image_copy_regions(&rgba_desc(4, 4, 1), &GpuResourceData::new(&data).with_pitches(8, 4)).unwrap();
        assert_eq!(single[0].buffer_row_length, 8);

        let multi = image_copy_regions(&rgba_desc(4, 4, 2), &GpuResourceData::new(&data).with_pitches(8, 4));
        assert!(matches!(multi, Err(ResourceError::InvalidData(_))));
    }

    #[test]
    fn test_compressed_mip_chain_is_unsupported() {
        let desc = ImageDesc::new_2d(
            vk::Format::BC7_UNORM_BLOCK,
            vk::Extent2D { width: 8, height: 8 },
            vk::ImageUsageFlags::SAMPLED,
        )
        .with_mip_levels(2);
        assert!(matches!(
            image_copy_regions(&desc, &GpuResourceData::new(&[0u8; 128])),
            Err(ResourceError::UnsupportedFormat(vk::Format::BC7_UNORM_BLOCK))
        ));
    }

    #[test]
    fn test_compressed_single_image_is_unsupported() {
        let desc = ImageDesc::new_2d(
            vk::Format::BC7_UNORM_BLOCK,
            vk::Extent2D { width: 8, height: 8 },
            vk::ImageUsageFlags::SAMPLED,
        );
        assert!(matches!(
            image_copy_regions(&desc, &GpuResourceData::new(&[0u8; 64])),
            Err(ResourceError::UnsupportedFormat(vk::Format::BC7_UNORM_BLOCK))
        ));
    }

    #[test]
    fn test_zero_extent_is_rejected() {
        let data = GpuResourceData::new(&[0u8; 16]);
        for (width, height) in [(0, 2), (2, 0)] {
            assert!(matches!(image_copy_regions(&rgba_desc(width, height, 1), &data), Err(ResourceError::InvalidData(_))));
        }

        let mut flat = rgba_desc(2, 2, 1);
        flat.extent.depth = 0;
        assert!(matches!(image_copy_regions(&flat, &data), Err(ResourceError::InvalidData(_))));
        assert!(matches!(validate_image_desc(&flat), Err(ResourceError::InvalidData(_))));
        assert!(validate_image_desc(&rgba_desc(2, 2, 1)).is_ok());
    }

    #[test]
    fn test_buffer_data_validation() {
        let desc = BufferDesc::new(4, vk::BufferUsageFlags::VERTEX_BUFFER);
        assert!(validate_buffer_data(&desc, &GpuResourceData::new(&[1, 2, 3, 4])).is_ok());
        assert!(validate_buffer_data(&desc, &GpuResourceData::new(&[0; 5])).is_err());
        assert!(validate_buffer_data(&desc, &GpuResourceData::new(&[])).is_err());
    }
}
