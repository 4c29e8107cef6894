// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder driver: a state machine over the kernel m2m device.
//!
//! It owns the device handle and both buffer queues, correlates queued inputs
//! with dequeued outputs through the bitstream id stamped into the buffer
//! timestamp, renegotiates the output queue on resolution changes and
//! implements draining through the device STOP/START commands. All methods
//! run on the component worker.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use thiserror::Error;
use v4l2r::PixelFormat;

use crate::component::ComponentInner;
use crate::device::DeviceError;
use crate::device::PollCallback;
use crate::device::VideoDevice;
use crate::pool::GetVideoFrameCb;
use crate::pool::VideoFrame;
use crate::pool::VideoFramePool;
use crate::worker::TaskRunner;
use crate::Rect;
use crate::Resolution;
use crate::VideoCodec;

pub const NUM_INPUT_BUFFERS: u32 = 16;
/// Extra buffers for transmitting in the whole video pipeline.
const NUM_EXTRA_OUTPUT_BUFFERS: usize = 4;

/// The flexible 4:2:0 layouts the framework can consume; the first one the
/// device offers wins.
const SUPPORTED_OUTPUT_FOURCCS: [&[u8; 4]; 8] =
    [b"YU12", b"YV12", b"YM12", b"YM21", b"NV12", b"NV21", b"NM12", b"NM21"];

fn is_supported_output_format(pixel_format: PixelFormat) -> bool {
    SUPPORTED_OUTPUT_FOURCCS.iter().any(|fourcc| PixelFormat::from_fourcc(fourcc) == pixel_format)
}

pub fn codec_to_pixel_format(codec: VideoCodec) -> PixelFormat {
    match codec {
        VideoCodec::H264 => PixelFormat::from_fourcc(b"H264"),
        VideoCodec::Vp8 => PixelFormat::from_fourcc(b"VP80"),
        VideoCodec::Vp9 => PixelFormat::from_fourcc(b"VP90"),
        VideoCodec::Hevc => PixelFormat::from_fourcc(b"HEVC"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    Aborted,
    Error,
}

/// Completion callback for a decode or drain request.
pub type DecodeDoneCb = Box<dyn FnOnce(DecodeStatus)>;
/// Requests a new frame pool for the given coded size and buffer count.
pub type GetPoolCb =
    Box<dyn FnMut(Resolution, usize) -> Option<Box<dyn VideoFramePool>>>;
/// Delivers a decoded frame to the component.
pub type OutputCb = Box<dyn Fn(VideoFrame)>;
/// Reports an unrecoverable device error to the component.
pub type ErrorCb = Box<dyn Fn()>;

/// A compressed input handed to [`Decoder::decode`].
#[derive(Debug)]
pub struct BitstreamBuffer {
    pub bitstream_id: i32,
    pub dmabuf: Arc<OwnedFd>,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("device does not have VIDEO_M2M_MPLANE and STREAMING capabilities")]
    MissingCapabilities,
    #[error("device does not support flushing (V4L2_DEC_CMD_STOP)")]
    StopCommandUnsupported,
    #[error("device does not support {0}")]
    UnsupportedCodec(VideoCodec),
    #[error("failed to allocate input buffers")]
    InputBufferAllocation,
    #[error("failed to allocate output buffers")]
    OutputBufferAllocation,
    #[error("no supported output pixel format")]
    NoSupportedOutputFormat,
    #[error("device reported an empty coded size")]
    EmptyCodedSize,
    #[error("failed to create a video frame pool")]
    PoolCreation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Decoding,
    Draining,
    Error,
}

enum DecodeRequest {
    Decode { buffer: BitstreamBuffer, done_cb: DecodeDoneCb },
    Drain { done_cb: DecodeDoneCb },
}

pub struct Decoder {
    state: State,
    device: Box<dyn VideoDevice>,
    runner: TaskRunner<ComponentInner>,
    poll_cb: PollCallback,

    min_num_output_buffers: usize,
    get_pool_cb: GetPoolCb,
    output_cb: OutputCb,
    error_cb: ErrorCb,

    decode_requests: VecDeque<DecodeRequest>,
    /// Inputs queued to the device whose consumption has not been seen yet.
    pending_decode_cbs: BTreeMap<i32, DecodeDoneCb>,
    drain_cb: Option<DecodeDoneCb>,

    /// Frames owned by the kernel, by output buffer slot.
    frame_at_device: BTreeMap<u32, VideoFrame>,
    /// Pool block id to output buffer slot, assigned first come first served.
    /// Survives flushes, reset on resolution change.
    block_id_to_device_id: BTreeMap<u32, u32>,
    video_frame_pool: Option<Box<dyn VideoFramePool>>,

    coded_size: Resolution,
    visible_rect: Rect,
}

impl Decoder {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        codec: VideoCodec,
        input_buffer_size: usize,
        min_num_output_buffers: usize,
        get_pool_cb: GetPoolCb,
        output_cb: OutputCb,
        error_cb: ErrorCb,
        mut device: Box<dyn VideoDevice>,
        runner: TaskRunner<ComponentInner>,
    ) -> Result<Self, DecoderError> {
        log::debug!(
            "Creating decoder: codec={codec}, input_buffer_size={input_buffer_size}, \
             min_num_output_buffers={min_num_output_buffers}"
        );

        if !device.has_capabilities() {
            return Err(DecoderError::MissingCapabilities);
        }
        if !device.supports_decoder_stop() {
            return Err(DecoderError::StopCommandUnsupported);
        }
        device.subscribe_source_change()?;

        let pixel_format = codec_to_pixel_format(codec);
        if !device.enumerate_input_formats()?.contains(&pixel_format) {
            return Err(DecoderError::UnsupportedCodec(codec));
        }
        device.set_input_format(pixel_format, input_buffer_size)?;
        if device.allocate_input_buffers(NUM_INPUT_BUFFERS)? == 0 {
            return Err(DecoderError::InputBufferAllocation);
        }
        device.stream_on_input()?;

        let poll_runner = runner.clone();
        let poll_cb: PollCallback = Arc::new(move |device_event| {
            poll_runner.post(move |inner| {
                if let Some(decoder) = inner.decoder_mut() {
                    decoder.service_device(device_event);
                }
            });
        });
        device.start_polling(poll_cb.clone())?;

        Ok(Self {
            state: State::Idle,
            device,
            runner,
            poll_cb,
            min_num_output_buffers,
            get_pool_cb,
            output_cb,
            error_cb,
            decode_requests: VecDeque::new(),
            pending_decode_cbs: BTreeMap::new(),
            drain_cb: None,
            frame_at_device: BTreeMap::new(),
            block_id_to_device_id: BTreeMap::new(),
            video_frame_pool: None,
            coded_size: Resolution::default(),
            visible_rect: Rect::default(),
        })
    }

    pub fn decode(&mut self, buffer: BitstreamBuffer, done_cb: DecodeDoneCb) {
        log::debug!("decode(id={})", buffer.bitstream_id);

        if self.state == State::Error {
            log::error!("Ignore decode request due to error state");
            done_cb(DecodeStatus::Error);
            return;
        }
        if self.state == State::Idle {
            self.set_state(State::Decoding);
        }

        self.decode_requests.push_back(DecodeRequest::Decode { buffer, done_cb });
        self.pump_decode_requests();
    }

    pub fn drain(&mut self, done_cb: DecodeDoneCb) {
        log::debug!("drain()");

        match self.state {
            State::Idle => {
                log::debug!("Nothing to drain, ignore");
                done_cb(DecodeStatus::Ok);
            }
            State::Decoding => {
                self.decode_requests.push_back(DecodeRequest::Drain { done_cb });
                self.pump_decode_requests();
            }
            State::Draining | State::Error => {
                log::error!("Ignore drain request due to state {:?}", self.state);
                done_cb(DecodeStatus::Error);
            }
        }
    }

    pub fn flush(&mut self) {
        log::debug!("flush()");

        match self.state {
            State::Idle => {
                log::debug!("Nothing to flush, ignore");
                return;
            }
            State::Error => {
                log::error!("Ignore flush request due to error state");
                return;
            }
            State::Decoding | State::Draining => (),
        }

        // Cancel everything in flight before dropping the device buffers.
        for (_, done_cb) in std::mem::take(&mut self.pending_decode_cbs) {
            done_cb(DecodeStatus::Aborted);
        }
        if let Some(drain_cb) = self.drain_cb.take() {
            drain_cb(DecodeStatus::Aborted);
        }

        let was_output_streaming = self.device.is_output_streaming();
        self.device.stop_polling();
        if let Err(e) = self.device.stream_off_output() {
            log::debug!("Output streamoff during flush: {e}");
        }
        self.frame_at_device.clear();
        if let Err(e) = self.device.stream_off_input() {
            log::debug!("Input streamoff during flush: {e}");
        }

        if let Err(e) = self.device.stream_on_input() {
            log::debug!("Input streamon during flush: {e}");
        }
        if was_output_streaming {
            if let Err(e) = self.device.stream_on_output() {
                log::debug!("Output streamon during flush: {e}");
            }
        }

        // All device output buffers are free now, so a fetch cannot be
        // resumed by an output dequeue. Kick it explicitly.
        if self.video_frame_pool.is_some() {
            self.try_fetch_video_frame();
        }

        if let Err(e) = self.device.start_polling(self.poll_cb.clone()) {
            log::error!("Failed to restart polling after flush: {e}");
            self.on_error();
            return;
        }

        self.set_state(State::Idle);
    }

    pub fn pump_decode_requests(&mut self) {
        if self.state != State::Decoding {
            return;
        }

        while let Some(request) = self.decode_requests.front() {
            if matches!(request, DecodeRequest::Drain { .. }) {
                // The stop command must only go out once the device consumed
                // all queued inputs: the driver holds the input that triggers
                // a pending resolution change, and flushing earlier would
                // deliver the LAST buffer while inputs are still undecoded.
                if self.device.queued_input_buffers() > 0 {
                    log::debug!("Wait for all input buffers to be dequeued before draining");
                    return;
                }

                let Some(DecodeRequest::Drain { done_cb }) = self.decode_requests.pop_front()
                else {
                    unreachable!();
                };
                if let Err(e) = self.device.send_decoder_stop() {
                    log::error!("Failed to send stop command: {e}");
                    done_cb(DecodeStatus::Error);
                    self.on_error();
                    return;
                }
                self.drain_cb = Some(done_cb);
                self.set_state(State::Draining);
                return;
            }

            // Pause until an input buffer frees up; resumed from the next
            // input dequeue.
            if self.device.free_input_buffers() == 0 {
                log::debug!("There is no free input buffer");
                return;
            }

            let Some(DecodeRequest::Decode { buffer, done_cb }) = self.decode_requests.pop_front()
            else {
                unreachable!();
            };

            let plane_size = self.device.input_plane_size();
            if buffer.size > plane_size {
                log::error!(
                    "The input plane size ({plane_size}) is not enough, we need {}",
                    buffer.size
                );
                self.on_error();
                return;
            }

            log::debug!(
                "QBUF to input queue, bitstream_id={}, offset={}, size={}",
                buffer.bitstream_id,
                buffer.offset,
                buffer.size
            );
            if let Err(e) = self.device.queue_input_buffer(
                buffer.bitstream_id,
                &buffer.dmabuf,
                buffer.offset,
                buffer.size,
            ) {
                log::error!("Failed to QBUF to input queue, bitstream_id={}: {e}", buffer.bitstream_id);
                self.on_error();
                return;
            }

            self.pending_decode_cbs.insert(buffer.bitstream_id, done_cb);
        }
    }

    /// Runs on every poll wakeup: dequeues both queues, handles resolution
    /// changes, and reschedules the pumps that may now make progress.
    pub fn service_device(&mut self, device_event: bool) {
        if self.state == State::Error {
            return;
        }

        let mut input_dequeued = false;
        loop {
            match self.device.dequeue_input_buffer() {
                Ok(Some(bitstream_id)) => {
                    input_dequeued = true;
                    log::debug!("DQBUF from input queue, bitstream_id={bitstream_id}");
                    match self.pending_decode_cbs.remove(&bitstream_id) {
                        Some(done_cb) => done_cb(DecodeStatus::Ok),
                        None => log::warn!("Callback is already abandoned"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to dequeue buffer from input queue: {e}");
                    self.on_error();
                    return;
                }
            }
        }

        let mut output_dequeued = false;
        loop {
            match self.device.dequeue_output_buffer() {
                Ok(Some(dequeued)) => {
                    output_dequeued = true;
                    log::debug!(
                        "DQBUF from output queue, buffer_id={}, bitstream_id={}, bytes_used={}, is_last={}",
                        dequeued.index,
                        dequeued.bitstream_id,
                        dequeued.bytes_used,
                        dequeued.is_last
                    );

                    let Some(mut frame) = self.frame_at_device.remove(&dequeued.index) else {
                        log::error!("Buffer {} is not found at frame_at_device", dequeued.index);
                        self.on_error();
                        return;
                    };

                    if dequeued.bytes_used > 0 {
                        frame.bitstream_id = dequeued.bitstream_id;
                        frame.visible_rect = self.visible_rect;
                        (self.output_cb)(frame);
                    } else {
                        // An unqueued buffer would make the driver fail to
                        // deliver the LAST marker of the next drain, so the
                        // empty buffer goes straight back to the same slot.
                        // The frame stays valid the whole time.
                        log::debug!("Recycle empty buffer {} back to output queue", dequeued.index);
                        if let Err(e) = self.device.queue_output_buffer(dequeued.index, &frame.planes)
                        {
                            log::error!("Failed to recycle empty buffer to output queue: {e}");
                            self.on_error();
                            return;
                        }
                        self.frame_at_device.insert(dequeued.index, frame);
                    }

                    if dequeued.is_last && self.drain_cb.is_some() {
                        log::debug!("All buffers are drained");
                        if let Err(e) = self.device.send_decoder_start() {
                            log::error!("Failed to send start command: {e}");
                        }
                        if let Some(drain_cb) = self.drain_cb.take() {
                            drain_cb(DecodeStatus::Ok);
                        }
                        self.set_state(State::Idle);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to dequeue buffer from output queue: {e}");
                    self.on_error();
                    return;
                }
            }
        }

        if device_event && self.device.dequeue_source_change_event() {
            if let Err(e) = self.change_resolution() {
                log::error!("Failed to change resolution: {e}");
                self.on_error();
                return;
            }
        }

        if input_dequeued {
            self.runner.post(|inner| {
                if let Some(decoder) = inner.decoder_mut() {
                    decoder.pump_decode_requests();
                }
            });
        }
        if output_dequeued {
            self.runner.post(|inner| {
                if let Some(decoder) = inner.decoder_mut() {
                    decoder.try_fetch_video_frame();
                }
            });
        }
    }

    fn change_resolution(&mut self) -> Result<(), DecoderError> {
        log::debug!("change_resolution()");

        let format = self.device.output_format()?;
        let num_output_buffers = std::cmp::max(
            self.device.min_output_buffers()? as usize + NUM_EXTRA_OUTPUT_BUFFERS,
            self.min_num_output_buffers,
        );

        self.setup_output_format(format.coded_size)?;

        let adjusted_format = self.device.output_format()?;
        self.coded_size = adjusted_format.coded_size;
        self.visible_rect = self.query_visible_rect(self.coded_size);

        log::info!(
            "Need {num_output_buffers} output buffers. coded size: {}, visible rect: {}",
            self.coded_size,
            self.visible_rect
        );
        if self.coded_size.is_empty() {
            return Err(DecoderError::EmptyCodedSize);
        }

        if let Err(e) = self.device.stream_off_output() {
            log::debug!("Output streamoff during resolution change: {e}");
        }
        self.device.deallocate_output_buffers()?;
        self.frame_at_device.clear();
        self.block_id_to_device_id.clear();

        let allocated = self.device.allocate_output_buffers(num_output_buffers as u32)?;
        if allocated == 0 {
            return Err(DecoderError::OutputBufferAllocation);
        }
        log::debug!("Allocated {allocated} output buffers");
        self.device.stream_on_output()?;

        // Release the previous pool before asking for a new one, only one may
        // be alive at a time.
        self.video_frame_pool = None;
        self.video_frame_pool =
            Some((self.get_pool_cb)(self.coded_size, allocated as usize).ok_or_else(|| {
                log::error!("Failed to get pool with size {}", self.coded_size);
                DecoderError::PoolCreation
            })?);

        self.try_fetch_video_frame();
        Ok(())
    }

    fn setup_output_format(&mut self, coded_size: Resolution) -> Result<(), DecoderError> {
        for pixel_format in self.device.enumerate_output_formats()? {
            if !is_supported_output_format(pixel_format) {
                log::debug!("Pixel format {pixel_format} is not supported, skipping");
                continue;
            }
            if self.device.set_output_format(pixel_format, coded_size).is_ok() {
                return Ok(());
            }
        }
        Err(DecoderError::NoSupportedOutputFormat)
    }

    fn query_visible_rect(&mut self, coded_size: Resolution) -> Rect {
        let Some(rect) = self.device.visible_rect() else {
            log::warn!("Device reports no visible rectangle");
            return Rect::from(coded_size);
        };
        if !rect.fits_in(coded_size) {
            log::warn!("Visible rectangle {rect} is not inside coded size {coded_size}");
            return Rect::from(coded_size);
        }
        if rect.is_empty() {
            log::warn!("Visible rectangle is empty");
            return Rect::from(coded_size);
        }
        rect
    }

    pub fn try_fetch_video_frame(&mut self) {
        if self.video_frame_pool.is_none() {
            log::error!("No frame pool, failed to get the instance after resolution change?");
            self.on_error();
            return;
        }

        if self.device.free_output_buffers() == 0 {
            log::debug!("No free output buffers, ignore");
            return;
        }

        let runner = self.runner.clone();
        let done_cb: GetVideoFrameCb = Box::new(move |frame_with_block_id| {
            runner.post(move |inner| {
                if let Some(decoder) = inner.decoder_mut() {
                    decoder.on_video_frame_ready(frame_with_block_id);
                }
            });
        });
        if let Some(pool) = self.video_frame_pool.as_mut() {
            if !pool.get_video_frame(done_cb) {
                log::debug!("Previous frame request is still running, ignore");
            }
        }
    }

    fn on_video_frame_ready(&mut self, frame_with_block_id: Option<(VideoFrame, u32)>) {
        let Some((frame, block_id)) = frame_with_block_id else {
            log::error!("Got no video frame from the pool");
            self.on_error();
            return;
        };

        // Blocks keep the slot they were first queued to; a block seen for
        // the first time takes the next unused slot.
        let device_id = match self.block_id_to_device_id.get(&block_id) {
            Some(device_id) => *device_id,
            None => {
                let next_id = self.block_id_to_device_id.len() as u32;
                if (next_id as usize) < self.device.allocated_output_buffers() {
                    self.block_id_to_device_id.insert(block_id, next_id);
                    next_id
                } else {
                    // The pool must never hand out more distinct blocks than
                    // the device has buffer slots.
                    log::error!("Got more different blocks than we have output buffers for");
                    self.on_error();
                    return;
                }
            }
        };

        log::debug!("QBUF to output queue, block_id={block_id}, buffer_id={device_id}");
        if self.frame_at_device.contains_key(&device_id) {
            log::error!("Output buffer {device_id} already enqueued");
            self.on_error();
            return;
        }
        if let Err(e) = self.device.queue_output_buffer(device_id, &frame.planes) {
            log::error!("Failed to QBUF to output queue, block_id={block_id}: {e}");
            self.on_error();
            return;
        }
        self.frame_at_device.insert(device_id, frame);

        self.try_fetch_video_frame();
    }

    fn on_error(&mut self) {
        self.set_state(State::Error);
        (self.error_cb)();
    }

    fn set_state(&mut self, new_state: State) {
        if self.state == new_state {
            return;
        }
        if self.state == State::Error {
            log::debug!("Already in error state");
            return;
        }
        let new_state = match new_state {
            State::Draining if self.state != State::Decoding => State::Error,
            other => other,
        };
        log::info!("Set state {:?} => {:?}", self.state, new_state);
        self.state = new_state;
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if let Err(e) = self.device.stream_off_output() {
            log::debug!("Output streamoff on teardown: {e}");
        }
        if let Err(e) = self.device.deallocate_output_buffers() {
            log::debug!("Output buffer release on teardown: {e}");
        }
        if let Err(e) = self.device.stream_off_input() {
            log::debug!("Input streamoff on teardown: {e}");
        }
        if let Err(e) = self.device.deallocate_input_buffers() {
            log::debug!("Input buffer release on teardown: {e}");
        }
        self.device.stop_polling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_pixel_formats() {
        assert_eq!(codec_to_pixel_format(VideoCodec::H264), PixelFormat::from_fourcc(b"H264"));
        assert_eq!(codec_to_pixel_format(VideoCodec::Vp8), PixelFormat::from_fourcc(b"VP80"));
        assert_eq!(codec_to_pixel_format(VideoCodec::Vp9), PixelFormat::from_fourcc(b"VP90"));
        assert_eq!(codec_to_pixel_format(VideoCodec::Hevc), PixelFormat::from_fourcc(b"HEVC"));
    }

    #[test]
    fn flexible_420_formats_accepted() {
        assert!(is_supported_output_format(PixelFormat::from_fourcc(b"NV12")));
        assert!(is_supported_output_format(PixelFormat::from_fourcc(b"YU12")));
        assert!(is_supported_output_format(PixelFormat::from_fourcc(b"NM21")));
        assert!(!is_supported_output_format(PixelFormat::from_fourcc(b"MM21")));
        assert!(!is_supported_output_format(PixelFormat::from_fourcc(b"H264")));
    }
}
