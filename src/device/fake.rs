// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An in-memory stand-in for the kernel decoder device. Tests script it from
//! the outside (complete inputs, emit frames, trigger resolution changes)
//! while the decoder drives it through the [`VideoDevice`] trait.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use v4l2r::PixelFormat;

use crate::device::DequeuedOutputBuffer;
use crate::device::DeviceError;
use crate::device::OutputFormat;
use crate::device::PollCallback;
use crate::device::VideoDevice;
use crate::Rect;
use crate::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputSlot {
    Free,
    Queued,
    /// Filled by the decoder, waiting for DQBUF.
    Done,
}

struct State {
    input_formats: Vec<PixelFormat>,
    output_formats: Vec<PixelFormat>,
    chosen_output_format: Option<PixelFormat>,
    min_output_buffers: u32,
    coded_size: Resolution,
    visible_rect: Option<Rect>,

    subscribed_source_change: bool,
    pending_source_change: bool,
    stop_commands: u32,
    start_commands: u32,

    input_plane_size: usize,
    input_allocated: u32,
    input_streaming: bool,
    /// Bitstream ids in QBUF order, not yet consumed by the "decoder".
    input_queued: VecDeque<i32>,
    /// Consumed inputs awaiting DQBUF.
    input_ready: VecDeque<i32>,

    output_streaming: bool,
    output_slots: Vec<OutputSlot>,
    /// QBUF order of output slots, the "decoder" fills them FIFO.
    output_queued_order: VecDeque<u32>,
    output_ready: VecDeque<DequeuedOutputBuffer>,

    polling: bool,
    poll_cb: Option<PollCallback>,
}

/// Clonable handle; the decoder side owns one clone as `Box<dyn VideoDevice>`
/// while the test keeps another to play the kernel.
#[derive(Clone)]
pub(crate) struct FakeDevice {
    state: Arc<Mutex<State>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                input_formats: vec![
                    PixelFormat::from_fourcc(b"H264"),
                    PixelFormat::from_fourcc(b"VP80"),
                    PixelFormat::from_fourcc(b"VP90"),
                    PixelFormat::from_fourcc(b"HEVC"),
                ],
                output_formats: vec![PixelFormat::from_fourcc(b"NV12")],
                chosen_output_format: None,
                min_output_buffers: 4,
                coded_size: Resolution::new(320, 240),
                visible_rect: None,
                subscribed_source_change: false,
                pending_source_change: false,
                stop_commands: 0,
                start_commands: 0,
                input_plane_size: 0,
                input_allocated: 0,
                input_streaming: false,
                input_queued: VecDeque::new(),
                input_ready: VecDeque::new(),
                output_streaming: false,
                output_slots: Vec::new(),
                output_queued_order: VecDeque::new(),
                output_ready: VecDeque::new(),
                polling: false,
                poll_cb: None,
            })),
        }
    }

    fn wake(&self, device_event: bool) {
        let cb = {
            let state = self.state.lock().unwrap();
            if !state.polling {
                return;
            }
            state.poll_cb.clone()
        };
        if let Some(cb) = cb {
            cb(device_event);
        }
    }

    // Test-side kernel controls.

    pub fn set_output_formats(&self, formats: Vec<PixelFormat>) {
        self.state.lock().unwrap().output_formats = formats;
    }

    pub fn set_min_output_buffers(&self, count: u32) {
        self.state.lock().unwrap().min_output_buffers = count;
    }

    pub fn set_visible_rect(&self, rect: Option<Rect>) {
        self.state.lock().unwrap().visible_rect = rect;
    }

    /// Consumes all queued inputs, making them dequeuable.
    pub fn complete_queued_inputs(&self) {
        {
            let mut state = self.state.lock().unwrap();
            while let Some(id) = state.input_queued.pop_front() {
                state.input_ready.push_back(id);
            }
        }
        self.wake(false);
    }

    /// Fills the oldest queued output slot and makes it dequeuable.
    pub fn emit_output(&self, bitstream_id: i32, bytes_used: usize, is_last: bool) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(index) = state.output_queued_order.pop_front() else {
                panic!("no queued output buffer to emit into");
            };
            state.output_slots[index as usize] = OutputSlot::Done;
            state
                .output_ready
                .push_back(DequeuedOutputBuffer { index, bitstream_id, bytes_used, is_last });
        }
        self.wake(false);
    }

    /// Announces a new coded size through a source-change event.
    pub fn trigger_resolution_change(&self, coded_size: Resolution) {
        {
            let mut state = self.state.lock().unwrap();
            state.coded_size = coded_size;
            if !state.subscribed_source_change {
                panic!("source-change event triggered without subscription");
            }
            state.pending_source_change = true;
        }
        self.wake(true);
    }

    // Test-side observers.

    pub fn queued_input_ids(&self) -> Vec<i32> {
        self.state.lock().unwrap().input_queued.iter().copied().collect()
    }

    pub fn queued_output_buffers(&self) -> usize {
        self.state.lock().unwrap().output_queued_order.len()
    }

    pub fn output_buffer_count(&self) -> usize {
        self.state.lock().unwrap().output_slots.len()
    }

    pub fn stop_commands(&self) -> u32 {
        self.state.lock().unwrap().stop_commands
    }

    pub fn start_commands(&self) -> u32 {
        self.state.lock().unwrap().start_commands
    }

    pub fn is_input_streaming(&self) -> bool {
        self.state.lock().unwrap().input_streaming
    }

    pub fn is_polling(&self) -> bool {
        self.state.lock().unwrap().polling
    }
}

impl VideoDevice for FakeDevice {
    fn has_capabilities(&self) -> bool {
        true
    }

    fn supports_decoder_stop(&self) -> bool {
        true
    }

    fn subscribe_source_change(&mut self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().subscribed_source_change = true;
        Ok(())
    }

    fn dequeue_source_change_event(&mut self) -> bool {
        std::mem::take(&mut self.state.lock().unwrap().pending_source_change)
    }

    fn send_decoder_stop(&mut self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().stop_commands += 1;
        Ok(())
    }

    fn send_decoder_start(&mut self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().start_commands += 1;
        Ok(())
    }

    fn enumerate_input_formats(&self) -> Result<Vec<PixelFormat>, DeviceError> {
        Ok(self.state.lock().unwrap().input_formats.clone())
    }

    fn set_input_format(
        &mut self,
        pixel_format: PixelFormat,
        buffer_size: usize,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if !state.input_formats.contains(&pixel_format) {
            return Err(DeviceError::Ioctl("VIDIOC_S_FMT", anyhow!("unsupported {pixel_format}")));
        }
        state.input_plane_size = buffer_size;
        Ok(())
    }

    fn enumerate_output_formats(&self) -> Result<Vec<PixelFormat>, DeviceError> {
        Ok(self.state.lock().unwrap().output_formats.clone())
    }

    fn set_output_format(
        &mut self,
        pixel_format: PixelFormat,
        _coded_size: Resolution,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if !state.output_formats.contains(&pixel_format) {
            return Err(DeviceError::Ioctl("VIDIOC_S_FMT", anyhow!("unsupported {pixel_format}")));
        }
        state.chosen_output_format = Some(pixel_format);
        Ok(())
    }

    fn output_format(&self) -> Result<OutputFormat, DeviceError> {
        let state = self.state.lock().unwrap();
        Ok(OutputFormat {
            pixel_format: state
                .chosen_output_format
                .unwrap_or_else(|| PixelFormat::from_fourcc(b"NV12")),
            coded_size: state.coded_size,
        })
    }

    fn min_output_buffers(&self) -> Result<u32, DeviceError> {
        Ok(self.state.lock().unwrap().min_output_buffers)
    }

    fn visible_rect(&self) -> Option<Rect> {
        self.state.lock().unwrap().visible_rect
    }

    fn allocate_input_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.input_allocated = count;
        Ok(count)
    }

    fn deallocate_input_buffers(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.input_allocated = 0;
        state.input_queued.clear();
        state.input_ready.clear();
        Ok(())
    }

    fn stream_on_input(&mut self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().input_streaming = true;
        Ok(())
    }

    fn stream_off_input(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.input_streaming = false;
        state.input_queued.clear();
        state.input_ready.clear();
        Ok(())
    }

    fn free_input_buffers(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.input_allocated as usize - state.input_queued.len() - state.input_ready.len()
    }

    fn queued_input_buffers(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.input_queued.len() + state.input_ready.len()
    }

    fn input_plane_size(&self) -> usize {
        self.state.lock().unwrap().input_plane_size
    }

    fn queue_input_buffer(
        &mut self,
        bitstream_id: i32,
        _dmabuf: &Arc<OwnedFd>,
        _offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.input_queued.len() + state.input_ready.len() >= state.input_allocated as usize {
            return Err(DeviceError::NoFreeBuffer("input"));
        }
        if size > state.input_plane_size {
            return Err(DeviceError::Ioctl("VIDIOC_QBUF", anyhow!("payload too large")));
        }
        state.input_queued.push_back(bitstream_id);
        Ok(())
    }

    fn dequeue_input_buffer(&mut self) -> Result<Option<i32>, DeviceError> {
        Ok(self.state.lock().unwrap().input_ready.pop_front())
    }

    fn allocate_output_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.output_slots = vec![OutputSlot::Free; count as usize];
        state.output_queued_order.clear();
        state.output_ready.clear();
        Ok(count)
    }

    fn deallocate_output_buffers(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.output_slots.clear();
        state.output_queued_order.clear();
        state.output_ready.clear();
        Ok(())
    }

    fn stream_on_output(&mut self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().output_streaming = true;
        Ok(())
    }

    fn stream_off_output(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.output_streaming = false;
        state.output_queued_order.clear();
        state.output_ready.clear();
        for slot in &mut state.output_slots {
            *slot = OutputSlot::Free;
        }
        Ok(())
    }

    fn is_output_streaming(&self) -> bool {
        self.state.lock().unwrap().output_streaming
    }

    fn free_output_buffers(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .output_slots
            .iter()
            .filter(|slot| **slot == OutputSlot::Free)
            .count()
    }

    fn allocated_output_buffers(&self) -> usize {
        self.state.lock().unwrap().output_slots.len()
    }

    fn queue_output_buffer(
        &mut self,
        index: u32,
        _planes: &[Arc<OwnedFd>],
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        match state.output_slots.get(index as usize) {
            Some(OutputSlot::Free) => {
                state.output_slots[index as usize] = OutputSlot::Queued;
                state.output_queued_order.push_back(index);
                Ok(())
            }
            Some(_) => Err(DeviceError::BufferBusy(index)),
            None => Err(DeviceError::Ioctl("VIDIOC_QBUF", anyhow!("index {index} out of range"))),
        }
    }

    fn dequeue_output_buffer(&mut self) -> Result<Option<DequeuedOutputBuffer>, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let Some(buffer) = state.output_ready.pop_front() else {
            return Ok(None);
        };
        state.output_slots[buffer.index as usize] = OutputSlot::Free;
        Ok(Some(buffer))
    }

    fn start_polling(&mut self, poll_cb: PollCallback) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.poll_cb = Some(poll_cb);
        state.polling = true;
        Ok(())
    }

    fn stop_polling(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.poll_cb = None;
        state.polling = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn dummy_fd() -> Arc<OwnedFd> {
        Arc::new(OwnedFd::from(std::fs::File::open("/dev/null").unwrap()))
    }

    #[test]
    fn input_buffer_accounting() {
        let mut device = FakeDevice::new();
        device.allocate_input_buffers(2).unwrap();
        device.set_input_format(PixelFormat::from_fourcc(b"H264"), 1024).unwrap();
        assert_eq!(device.free_input_buffers(), 2);

        let fd = dummy_fd();
        device.queue_input_buffer(1, &fd, 0, 100).unwrap();
        device.queue_input_buffer(2, &fd, 0, 100).unwrap();
        assert_eq!(device.free_input_buffers(), 0);
        assert!(matches!(
            device.queue_input_buffer(3, &fd, 0, 100),
            Err(DeviceError::NoFreeBuffer("input"))
        ));

        // Nothing is dequeuable until the kernel side consumed the buffers.
        assert!(device.dequeue_input_buffer().unwrap().is_none());
        device.complete_queued_inputs();
        assert_eq!(device.dequeue_input_buffer().unwrap(), Some(1));
        assert_eq!(device.dequeue_input_buffer().unwrap(), Some(2));
        assert_eq!(device.free_input_buffers(), 2);
    }

    #[test]
    fn output_slots_cycle_free_queued_done_free() {
        let mut device = FakeDevice::new();
        device.allocate_output_buffers(2).unwrap();
        device.queue_output_buffer(0, &[]).unwrap();
        assert!(matches!(device.queue_output_buffer(0, &[]), Err(DeviceError::BufferBusy(0))));
        assert_eq!(device.free_output_buffers(), 1);

        device.emit_output(7, 128, false);
        let buffer = device.dequeue_output_buffer().unwrap().unwrap();
        assert_eq!(buffer.index, 0);
        assert_eq!(buffer.bitstream_id, 7);
        assert_eq!(device.free_output_buffers(), 2);
    }

    #[test]
    fn poll_callback_reports_device_events() {
        let mut device = FakeDevice::new();
        device.subscribe_source_change().unwrap();
        let events = Arc::new(AtomicUsize::new(0));
        let events_in_cb = events.clone();
        device
            .start_polling(Arc::new(move |device_event| {
                if device_event {
                    events_in_cb.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .unwrap();

        device.trigger_resolution_change(Resolution::new(1920, 1080));
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert!(device.dequeue_source_change_event());
        assert!(!device.dequeue_source_change_event());
    }
}
