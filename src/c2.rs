// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Data model of the Codec2-facing surface: work items, statuses, flags and
//! the listener through which finished work is returned to the framework.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::Arc;

use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use thiserror::Error;

use crate::codec::h264::CodedColorAspects;
use crate::pool::VideoFrame;

// Numerical values taken from
// frameworks/av/media/codec2/core/include/C2.h
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum C2Status {
    C2Ok = 0,
    C2BadState = 1,   // EPERM
    C2NotFound = 2,   // ENOENT
    C2Blocking = 11,  // EAGAIN
    C2Corrupted = 14, // EFAULT
    C2BadValue = 22,  // EINVAL
    C2Omitted = 38,   // ENOSYS
}

/// Per-frame flags carried by work items, values from C2FrameData.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkFlags(u32);

impl WorkFlags {
    pub const DROP_FRAME: WorkFlags = WorkFlags(1 << 0);
    pub const END_OF_STREAM: WorkFlags = WorkFlags(1 << 1);
    pub const CODEC_CONFIG: WorkFlags = WorkFlags(1 << 31);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: WorkFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: WorkFlags) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl std::ops::BitOr for WorkFlags {
    type Output = WorkFlags;

    fn bitor(self, rhs: WorkFlags) -> WorkFlags {
        WorkFlags(self.0 | rhs.0)
    }
}

/// Ordering information attached by the client to every work item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkOrdinal {
    /// Monotonic counter assigned by the client.
    pub frame_index: u64,
    /// Presentation timestamp in microseconds.
    pub timestamp: u64,
}

/// Mask against 30 bits to avoid (undefined) wraparound on signed integer.
const BITSTREAM_ID_MASK: u64 = 0x3FFF_FFFF;

/// The device-visible tag correlating queued inputs with dequeued outputs.
pub fn frame_index_to_bitstream_id(frame_index: u64) -> i32 {
    (frame_index & BITSTREAM_ID_MASK) as i32
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("cannot map an empty block")]
    EmptyBlock,
    #[error("mmap failed: {0}")]
    Mmap(nix::Error),
}

/// A read view of a compressed input block, unmapped on drop.
pub struct MappedBlock {
    ptr: NonNull<c_void>,
    len: usize,
    offset: usize,
    size: usize,
}

impl MappedBlock {
    /// The bitstream payload, skipping the block-level offset.
    pub fn payload(&self) -> &[u8] {
        // The mapping covers offset + size bytes starting at the block base.
        let all = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) };
        &all[self.offset..self.offset + self.size]
    }
}

impl Drop for MappedBlock {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            log::error!("Failed to unmap input block: {e}");
        }
    }
}

/// A compressed input block: a linear DMABuf region described by offset and
/// size within the underlying buffer.
#[derive(Debug, Clone)]
pub struct LinearBlock {
    pub dmabuf: Arc<OwnedFd>,
    pub offset: usize,
    pub size: usize,
}

impl LinearBlock {
    /// Maps the block read-only so its payload can be inspected on the CPU.
    pub fn map(&self) -> Result<MappedBlock, MapError> {
        let len = NonZeroUsize::new(self.offset + self.size).ok_or(MapError::EmptyBlock)?;
        let ptr = unsafe {
            mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, self.dmabuf.as_fd(), 0)
        }
        .map_err(MapError::Mmap)?;
        Ok(MappedBlock { ptr, len: len.get(), offset: self.offset, size: self.size })
    }
}

/// A decoded output attached to a worklet before it is reported.
#[derive(Debug)]
pub struct OutputBuffer {
    pub frame: VideoFrame,
    pub color_aspects: Option<ColorAspects>,
}

/// The single output slot of a work item.
#[derive(Debug, Default)]
pub struct Worklet {
    pub flags: WorkFlags,
    pub ordinal: WorkOrdinal,
    pub buffer: Option<OutputBuffer>,
}

/// The unit of client submission and completion.
///
/// Every work carries exactly one worklet and at most one input block, which
/// the C++ framework checks at runtime and this type enforces by shape.
#[derive(Debug)]
pub struct Work {
    pub flags: WorkFlags,
    pub ordinal: WorkOrdinal,
    pub input: Option<LinearBlock>,
    pub worklet: Worklet,
    pub result: C2Status,
    pub worklets_processed: u32,
}

impl Work {
    pub fn new(flags: WorkFlags, ordinal: WorkOrdinal, input: Option<LinearBlock>) -> Self {
        Self {
            flags,
            ordinal,
            input,
            worklet: Worklet::default(),
            result: C2Status::C2Ok,
            worklets_processed: 0,
        }
    }

    pub fn bitstream_id(&self) -> i32 {
        frame_index_to_bitstream_id(self.ordinal.frame_index)
    }
}

/// Receiver of finished work and component errors, invoked on the worker.
pub trait Listener: Send + Sync {
    fn on_work_done(&self, works: Vec<Work>);
    fn on_error(&self, status: C2Status);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Component,
    Chain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    ComponentWithEos,
    ComponentNoEos,
    Chain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    #[default]
    Unspecified,
    Full,
    Limited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorPrimaries {
    #[default]
    Unspecified,
    Bt709,
    Bt470M,
    Bt601_625,
    Bt601_525,
    GenericFilm,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorTransfer {
    #[default]
    Unspecified,
    Linear,
    Srgb,
    Smpte170M,
    Gamma22,
    Gamma28,
    St2084,
    Hlg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMatrix {
    #[default]
    Unspecified,
    Bt709,
    Fcc47_73_682,
    Bt601,
    Smpte240M,
    Bt2020,
    Bt2020Constant,
}

/// Color description stamped on output buffers, in framework terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorAspects {
    pub range: ColorRange,
    pub primaries: ColorPrimaries,
    pub transfer: ColorTransfer,
    pub matrix: ColorMatrix,
}

impl ColorAspects {
    /// Maps ISO/IEC 23091-2 code points to framework values. Source values
    /// without a framework equivalent become `Unspecified` in their slot.
    pub fn from_coded(coded: CodedColorAspects) -> Self {
        let primaries = match coded.primaries {
            1 => ColorPrimaries::Bt709,
            4 => ColorPrimaries::Bt470M,
            5 => ColorPrimaries::Bt601_625,
            6 | 7 => ColorPrimaries::Bt601_525,
            8 => ColorPrimaries::GenericFilm,
            9 => ColorPrimaries::Bt2020,
            _ => ColorPrimaries::Unspecified,
        };
        let transfer = match coded.transfer {
            1 | 6 | 14 | 15 => ColorTransfer::Smpte170M,
            4 => ColorTransfer::Gamma22,
            5 => ColorTransfer::Gamma28,
            8 => ColorTransfer::Linear,
            13 => ColorTransfer::Srgb,
            16 => ColorTransfer::St2084,
            18 => ColorTransfer::Hlg,
            _ => ColorTransfer::Unspecified,
        };
        let matrix = match coded.matrix {
            1 => ColorMatrix::Bt709,
            4 => ColorMatrix::Fcc47_73_682,
            5 | 6 => ColorMatrix::Bt601,
            7 => ColorMatrix::Smpte240M,
            9 => ColorMatrix::Bt2020,
            10 => ColorMatrix::Bt2020Constant,
            _ => ColorMatrix::Unspecified,
        };
        let range = if coded.full_range { ColorRange::Full } else { ColorRange::Limited };
        Self { range, primaries, transfer, matrix }
    }
}
