//! 传输命令通道
//!
//! 所有 staging 拷贝以及前后的 barrier 都录制到同一条命令流中。
//! 录制必须先通过 [`TransferChannel::acquire_recording_scope`] 拿到独占的 [`TransferRecorder`]，
//! 因此同一个 staging 请求的 barrier + copy + barrier 总是连续的，不会和其他线程的录制交错。
//!
//! 释放 recorder 不会触发提交，提交由使用方每帧调用 `complete_pending_transfers` 完成。

use std::sync::{Mutex, MutexGuard, PoisonError};

use truvis_gfx::commands::transfer_command::TransferCommand;
use truvis_gfx::device::GfxDevice;

use crate::config::ResourceContextConfig;
use crate::error::{ResourceError, ResourceResult};
use crate::handles::InnerResourceHandle;
use crate::staging::StagingBufferPool;
use crate::upload_arena::UploadArena;

/// 一次已经录制、等待设备确认的 staging 上传
#[derive(Clone, Copy, Debug)]
pub struct StagingRequest {
    pub destination: InnerResourceHandle,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// 成功提交的批次数
    pub batches_submitted: u64,
    /// 累计录制的命令数
    pub commands_recorded: u64,
    /// 累计被确认的 staging 请求数
    pub requests_confirmed: u64,
    /// 当前已录制但未确认的 staging 请求数
    pub outstanding: usize,
}

pub(crate) struct TransferState {
    pub(crate) commands: Vec<TransferCommand>,
    pub(crate) pending: Vec<StagingRequest>,
    pub(crate) arena: UploadArena,
    pub(crate) staging: StagingBufferPool,
    pub(crate) stats: TransferStats,
}

/// 独占的录制权限，drop 时释放
pub struct TransferRecorder<'a> {
    state: MutexGuard<'a, TransferState>,
}

impl TransferRecorder<'_> {
    pub fn record(&mut self, command: TransferCommand) {
        self.state.stats.commands_recorded += 1;
        self.state.commands.push(command);
    }

    /// 当前批次中已录制的命令数
    #[inline]
    pub fn recorded_count(&self) -> usize {
        self.state.commands.len()
    }

    #[inline]
    pub(crate) fn state_mut(&mut self) -> &mut TransferState {
        &mut self.state
    }
}

pub struct TransferChannel {
    state: Mutex<TransferState>,
}

impl TransferChannel {
    pub fn new(config: &ResourceContextConfig) -> Self {
        Self {
            state: Mutex::new(TransferState {
                commands: Vec::new(),
                pending: Vec::new(),
                arena: UploadArena::new(config.arena_chunk_size),
                staging: StagingBufferPool::new(config.staging_min_size, config.max_free_staging_buffers),
                stats: TransferStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 阻塞直到拿到录制权限
    pub fn acquire_recording_scope(&self) -> TransferRecorder<'_> {
        TransferRecorder { state: self.lock() }
    }

    /// 提交当前命令流并等待设备完成，确认本批次的所有 staging 请求
    ///
    /// 命令流为空时不提交。返回本次确认的请求数。
    /// 提交失败时命令流和未确认请求保持原样，可以重试，
    /// 或者通过 [`Self::abort_pending_transfers`] 丢弃整个批次。
    pub fn complete_pending_transfers(&self, device: &dyn GfxDevice) -> ResourceResult<usize> {
        let _span = tracy_client::span!("TransferChannel::complete_pending_transfers");
        let mut state = self.lock();
        if state.commands.is_empty() {
            debug_assert!(state.pending.is_empty());
            return Ok(0);
        }

        if let Err(e) = device.submit_transfers(&state.commands) {
            log::error!(
                "transfer batch submission failed, {} commands kept for retry: {}",
                state.commands.len(),
                e
            );
            return Err(e.into());
        }

        let state = &mut *state;
        let confirmed = state.pending.len();
        let command_count = state.commands.len();
        state.commands.clear();
        state.pending.clear();
        state.staging.recycle_in_flight(device);
        state.stats.batches_submitted += 1;
        state.stats.requests_confirmed += confirmed as u64;
        log::info!("transfer batch submitted: {} commands, {} staged requests confirmed", command_count, confirmed);
        Ok(confirmed)
    }

    /// 丢弃尚未提交的命令流和所有未确认的 staging 请求
    ///
    /// 返回被丢弃的请求所指向的资源（去重，保持录制顺序），这些资源的内容未定义。
    /// staging buffer 回到空闲列表，之后 destroy 和 flush 不再被这些请求阻塞。
    pub fn abort_pending_transfers(&self, device: &dyn GfxDevice) -> Vec<InnerResourceHandle> {
        let _span = tracy_client::span!("TransferChannel::abort_pending_transfers");
        let mut state = self.lock();
        let state = &mut *state;

        let mut aborted: Vec<InnerResourceHandle> = Vec::with_capacity(state.pending.len());
        for request in state.pending.drain(..) {
            if !aborted.contains(&request.destination) {
                aborted.push(request.destination);
            }
        }
        let command_count = state.commands.len();
        state.commands.clear();
        state.staging.recycle_in_flight(device);

        if command_count > 0 {
            log::warn!(
                "transfer batch aborted: {} commands dropped, {} resources left with undefined contents",
                command_count,
                aborted.len()
            );
        }
        aborted
    }

    /// 销毁所有 staging buffer 并重置 UploadArena
    ///
    /// 还有未确认的传输时返回 `StaleTransfer`。返回销毁的 staging buffer 数量，
    /// 连续调用时第二次没有任何效果。
    pub fn flush_staging_buffers(&self, device: &dyn GfxDevice) -> ResourceResult<usize> {
        let _span = tracy_client::span!("TransferChannel::flush_staging_buffers");
        let mut state = self.lock();
        if !state.pending.is_empty() || !state.commands.is_empty() {
            return Err(ResourceError::StaleTransfer {
                operation: "flush staging buffers",
                outstanding: state.pending.len(),
            });
        }

        let released = state.staging.release_all(device);
        let arena_copies = state.arena.allocation_count();
        state.arena.reset();
        if released > 0 || arena_copies > 0 {
            log::info!("flush staging: {} staging buffers released, {} arena copies dropped", released, arena_copies);
        }
        Ok(released)
    }

    /// 资源是否被未确认的传输引用
    pub fn is_referenced(&self, key: InnerResourceHandle) -> bool {
        self.lock().pending.iter().any(|r| r.destination == key)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn stats(&self) -> TransferStats {
        let state = self.lock();
        TransferStats {
            outstanding: state.pending.len(),
            ..state.stats
        }
    }

    /// (in-flight, free) staging buffer 数量
    pub fn staging_buffer_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.staging.in_flight_count(), state.staging.free_count())
    }

    pub fn arena_allocation_count(&self) -> usize {
        self.lock().arena.allocation_count()
    }
}
