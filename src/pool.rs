// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the output frame pool.
//!
//! The pool is an external collaborator: it hands out decoded-output memory
//! blocks keyed by an opaque block id. The decoder borrows frames from it for
//! as long as the kernel holds the corresponding buffer; reported frames are
//! owned by the client from then on.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::Rect;
use crate::Resolution;

/// Pixel layouts a pool can be asked for. Decoded buffers are always dressed
/// as the flexible 4:2:0 format towards the framework, whatever the device
/// format underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalPixelFormat {
    Ycbcr420Flexible,
}

/// A decoded-output frame borrowed from the pool.
#[derive(Debug)]
pub struct VideoFrame {
    /// One DMABuf per plane, in plane order.
    pub planes: Vec<Arc<OwnedFd>>,
    /// Stamped by the decoder when the frame comes back from the device.
    pub bitstream_id: i32,
    pub visible_rect: Rect,
}

impl VideoFrame {
    pub fn new(planes: Vec<Arc<OwnedFd>>) -> Self {
        Self { planes, bitstream_id: -1, visible_rect: Rect::default() }
    }
}

/// What the component asks the pool factory for after a resolution change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePoolRequest {
    pub coded_size: Resolution,
    pub pixel_format: HalPixelFormat,
    pub num_buffers: usize,
    pub block_pool_id: u64,
    pub secure: bool,
}

/// Callback delivering a requested frame together with its pool block id.
/// May be invoked from any thread; `None` means the pool failed.
pub type GetVideoFrameCb = Box<dyn FnOnce(Option<(VideoFrame, u32)>) + Send>;

pub trait VideoFramePool {
    /// Asks for one frame, delivered asynchronously through `cb`. Returns
    /// `false` when a previous request is still in flight, in which case `cb`
    /// is dropped unused.
    fn get_video_frame(&mut self, cb: GetVideoFrameCb) -> bool;
}

/// Creates pools on demand; invoked on the worker during resolution changes.
pub type FramePoolFactory =
    Box<dyn Fn(FramePoolRequest) -> Option<Box<dyn VideoFramePool>> + Send + Sync>;
