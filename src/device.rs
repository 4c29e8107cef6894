// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The kernel video-device interface consumed by the decoder.
//!
//! Everything ioctl-shaped lives behind [`VideoDevice`] so the decoder state
//! machine stays testable against a simulated device. The m2m device exposes
//! two multi-planar queues: the input queue receives compressed bitstream
//! buffers (V4L2 OUTPUT), the output queue produces decoded frames
//! (V4L2 CAPTURE).

use std::os::fd::OwnedFd;
use std::sync::Arc;

use thiserror::Error;
use v4l2r::PixelFormat;

use crate::Rect;
use crate::Resolution;

#[cfg(test)]
pub(crate) mod fake;
pub mod v4l2;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open video device: {0}")]
    Open(#[source] anyhow::Error),
    #[error("{0} failed: {1}")]
    Ioctl(&'static str, #[source] anyhow::Error),
    #[error("no free buffer on the {0} queue")]
    NoFreeBuffer(&'static str),
    #[error("buffer {0} is not free")]
    BufferBusy(u32),
    #[error("device error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Current format of the decoded-output queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub pixel_format: PixelFormat,
    pub coded_size: Resolution,
}

/// A buffer dequeued from the decoded-output queue.
#[derive(Debug, Clone, Copy)]
pub struct DequeuedOutputBuffer {
    /// Queue slot the buffer was dequeued from.
    pub index: u32,
    /// Bitstream id recovered from the timestamp `tv_sec` field.
    pub bitstream_id: i32,
    /// Zero for buffers the decoder produced no payload into.
    pub bytes_used: usize,
    /// Set on the final buffer of a drain.
    pub is_last: bool,
}

/// Invoked by the device poller whenever the device made progress. The flag
/// is true when an asynchronous device event (e.g. a source change) is
/// pending on top of any queue activity.
pub type PollCallback = Arc<dyn Fn(bool) + Send + Sync>;

pub trait VideoDevice: Send {
    /// Whether the device is a streaming multi-planar m2m decoder.
    fn has_capabilities(&self) -> bool;
    /// Whether the device accepts `DECODER_CMD` STOP, required for draining.
    fn supports_decoder_stop(&self) -> bool;
    fn subscribe_source_change(&mut self) -> Result<(), DeviceError>;
    /// Drains the device event queue; true when a resolution change was
    /// signalled.
    fn dequeue_source_change_event(&mut self) -> bool;
    fn send_decoder_stop(&mut self) -> Result<(), DeviceError>;
    fn send_decoder_start(&mut self) -> Result<(), DeviceError>;

    fn enumerate_input_formats(&self) -> Result<Vec<PixelFormat>, DeviceError>;
    fn set_input_format(
        &mut self,
        pixel_format: PixelFormat,
        buffer_size: usize,
    ) -> Result<(), DeviceError>;
    fn enumerate_output_formats(&self) -> Result<Vec<PixelFormat>, DeviceError>;
    fn set_output_format(
        &mut self,
        pixel_format: PixelFormat,
        coded_size: Resolution,
    ) -> Result<(), DeviceError>;
    fn output_format(&self) -> Result<OutputFormat, DeviceError>;
    /// `V4L2_CID_MIN_BUFFERS_FOR_CAPTURE`.
    fn min_output_buffers(&self) -> Result<u32, DeviceError>;
    /// The visible rectangle reported by the device, if it reports one.
    fn visible_rect(&self) -> Option<Rect>;

    fn allocate_input_buffers(&mut self, count: u32) -> Result<u32, DeviceError>;
    fn deallocate_input_buffers(&mut self) -> Result<(), DeviceError>;
    fn stream_on_input(&mut self) -> Result<(), DeviceError>;
    fn stream_off_input(&mut self) -> Result<(), DeviceError>;
    fn free_input_buffers(&self) -> usize;
    fn queued_input_buffers(&self) -> usize;
    /// Size of the single bitstream plane of every input buffer.
    fn input_plane_size(&self) -> usize;
    fn queue_input_buffer(
        &mut self,
        bitstream_id: i32,
        dmabuf: &Arc<OwnedFd>,
        offset: usize,
        size: usize,
    ) -> Result<(), DeviceError>;
    /// Returns the bitstream id of a consumed input buffer, or `None` when
    /// nothing is ready.
    fn dequeue_input_buffer(&mut self) -> Result<Option<i32>, DeviceError>;

    fn allocate_output_buffers(&mut self, count: u32) -> Result<u32, DeviceError>;
    fn deallocate_output_buffers(&mut self) -> Result<(), DeviceError>;
    fn stream_on_output(&mut self) -> Result<(), DeviceError>;
    fn stream_off_output(&mut self) -> Result<(), DeviceError>;
    fn is_output_streaming(&self) -> bool;
    fn free_output_buffers(&self) -> usize;
    fn allocated_output_buffers(&self) -> usize;
    fn queue_output_buffer(
        &mut self,
        index: u32,
        planes: &[Arc<OwnedFd>],
    ) -> Result<(), DeviceError>;
    fn dequeue_output_buffer(&mut self) -> Result<Option<DequeuedOutputBuffer>, DeviceError>;

    fn start_polling(&mut self, poll_cb: PollCallback) -> Result<(), DeviceError>;
    fn stop_polling(&mut self);
}

/// Creates and opens the device; runs on the worker during component start.
pub type VideoDeviceFactory =
    Box<dyn Fn() -> Result<Box<dyn VideoDevice>, DeviceError> + Send + Sync>;
