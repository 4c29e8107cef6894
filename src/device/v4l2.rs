// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`VideoDevice`] implementation over a real V4L2 m2m decoder node.

use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Wake;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use nix::sys::stat::fstat;
use nix::sys::time::TimeVal;
use nix::sys::time::TimeValLike;
use v4l2r::device::poller::DeviceEvent;
use v4l2r::device::poller::PollEvent;
use v4l2r::device::poller::Poller;
use v4l2r::device::poller::Waker;
use v4l2r::device::queue::direction::Capture;
use v4l2r::device::queue::direction::Output;
use v4l2r::device::queue::CaptureQueueable;
use v4l2r::device::queue::GetCaptureBufferByIndex;
use v4l2r::device::queue::GetFreeOutputBuffer;
use v4l2r::device::queue::OutputQueueable;
use v4l2r::device::queue::BuffersAllocated;
use v4l2r::device::queue::Queue;
use v4l2r::device::queue::QueueInit;
use v4l2r::device::AllocatedQueue;
use v4l2r::device::Device;
use v4l2r::device::DeviceConfig;
use v4l2r::device::Stream;
use v4l2r::device::TryDequeue;
use v4l2r::ioctl;
use v4l2r::ioctl::DecoderCmd;
use v4l2r::ioctl::SelectionTarget;
use v4l2r::ioctl::SelectionType;
use v4l2r::memory::BufferHandles;
use v4l2r::memory::DmaBufHandle;
use v4l2r::memory::MemoryType;
use v4l2r::memory::PrimitiveBufferHandles;
use v4l2r::Format;
use v4l2r::PixelFormat;
use v4l2r::PlaneLayout;
use v4l2r::QueueType;

use crate::device::DequeuedOutputBuffer;
use crate::device::DeviceError;
use crate::device::OutputFormat;
use crate::device::PollCallback;
use crate::device::VideoDevice;
use crate::Rect;
use crate::Resolution;

/// `V4L2_CID_MIN_BUFFERS_FOR_CAPTURE` control for `g_ext_ctrls`.
struct MinBuffersForCapture;

impl v4l2r::controls::ExtControlTrait for MinBuffersForCapture {
    const ID: u32 = v4l2r::bindings::V4L2_CID_MIN_BUFFERS_FOR_CAPTURE;
    type PAYLOAD = i32;
}

fn plane_length(fd: &OwnedFd) -> u32 {
    let length = fstat(fd.as_raw_fd()).map(|stat| stat.st_size as u32).unwrap_or(0);
    if length == 0 {
        log::warn!("Failed to fstat DMABUF plane size");
    }
    length
}

/// The single compressed plane of an input buffer. Offset and length are
/// carried in the plane itself so the device decodes exactly the payload
/// region of the shared buffer.
#[derive(Debug)]
struct BitstreamPlane {
    fd: Arc<OwnedFd>,
    data_offset: u32,
}

impl BufferHandles for BitstreamPlane {
    type SupportedMemoryType = MemoryType;

    fn len(&self) -> usize {
        1
    }

    fn fill_v4l2_plane(&self, _index: usize, plane: &mut v4l2r::bindings::v4l2_plane) {
        plane.m.fd = self.fd.as_raw_fd();
        plane.data_offset = self.data_offset;
        plane.length = plane_length(&self.fd);
    }
}

impl PrimitiveBufferHandles for BitstreamPlane {
    type HandleType = DmaBufHandle<std::fs::File>;
    const MEMORY_TYPE: Self::SupportedMemoryType = MemoryType::DmaBuf;
}

/// The DMABUF planes of one decoded frame.
#[derive(Debug)]
struct FramePlanes {
    fds: Vec<Arc<OwnedFd>>,
}

impl BufferHandles for FramePlanes {
    type SupportedMemoryType = MemoryType;

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn fill_v4l2_plane(&self, index: usize, plane: &mut v4l2r::bindings::v4l2_plane) {
        plane.m.fd = self.fds[index].as_raw_fd();
        plane.data_offset = 0;
        plane.length = plane_length(&self.fds[index]);
    }
}

impl PrimitiveBufferHandles for FramePlanes {
    type HandleType = DmaBufHandle<std::fs::File>;
    const MEMORY_TYPE: Self::SupportedMemoryType = MemoryType::DmaBuf;
}

#[derive(Default)]
enum InputQueueState {
    Init(Queue<Output, QueueInit>),
    Allocated(Queue<Output, BuffersAllocated<BitstreamPlane>>),
    #[default]
    Unknown,
}

#[derive(Default)]
enum OutputQueueState {
    Init(Queue<Capture, QueueInit>),
    Allocated(Queue<Capture, BuffersAllocated<FramePlanes>>),
    #[default]
    Unknown,
}

struct PollThread {
    join_handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

pub struct V4l2Device {
    device: Arc<Device>,
    capabilities: v4l2r::ioctl::Capabilities,
    input_queue: InputQueueState,
    output_queue: OutputQueueState,
    input_format: Option<Format>,
    /// Output format requested while buffers were still allocated; applied
    /// once the queue returns to its init state.
    pending_output_format: Option<Format>,
    poll_thread: Option<PollThread>,
}

impl V4l2Device {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let device = Device::open(path, DeviceConfig::new().non_blocking_dqbuf())
            .map_err(|e| DeviceError::Open(anyhow!(e)))?;
        let device = Arc::new(device);

        let capability: ioctl::Capability =
            ioctl::querycap(&*device).map_err(|e| DeviceError::Open(anyhow!(e)))?;
        let capabilities = capability.device_caps.unwrap_or(capability.capabilities);

        let input_queue = Queue::get_output_mplane_queue(device.clone())
            .map_err(|e| DeviceError::Open(anyhow!(e)))?;
        let output_queue = Queue::get_capture_mplane_queue(device.clone())
            .map_err(|e| DeviceError::Open(anyhow!(e)))?;

        Ok(Self {
            device,
            capabilities,
            input_queue: InputQueueState::Init(input_queue),
            output_queue: OutputQueueState::Init(output_queue),
            input_format: None,
            pending_output_format: None,
            poll_thread: None,
        })
    }

    fn allocated_input_queue(
        &mut self,
    ) -> Result<&mut Queue<Output, BuffersAllocated<BitstreamPlane>>, DeviceError> {
        match &mut self.input_queue {
            InputQueueState::Allocated(queue) => Ok(queue),
            _ => Err(DeviceError::Other(anyhow!("input queue has no buffers allocated"))),
        }
    }

    fn allocated_output_queue(
        &mut self,
    ) -> Result<&mut Queue<Capture, BuffersAllocated<FramePlanes>>, DeviceError> {
        match &mut self.output_queue {
            OutputQueueState::Allocated(queue) => Ok(queue),
            _ => Err(DeviceError::Other(anyhow!("output queue has no buffers allocated"))),
        }
    }
}

impl VideoDevice for V4l2Device {
    fn has_capabilities(&self) -> bool {
        self.capabilities.contains(ioctl::Capabilities::VIDEO_M2M_MPLANE)
            && self.capabilities.contains(ioctl::Capabilities::STREAMING)
    }

    fn supports_decoder_stop(&self) -> bool {
        ioctl::try_decoder_cmd::<_, ()>(&*self.device, DecoderCmd::stop()).is_ok()
    }

    fn subscribe_source_change(&mut self) -> Result<(), DeviceError> {
        ioctl::subscribe_event(
            &*self.device,
            ioctl::EventType::SourceChange(0),
            ioctl::SubscribeEventFlags::empty(),
        )
        .map_err(|e| DeviceError::Ioctl("VIDIOC_SUBSCRIBE_EVENT", anyhow!(e)))
    }

    fn dequeue_source_change_event(&mut self) -> bool {
        let mut resolution_changed = false;
        while let Ok(event) = ioctl::dqevent::<ioctl::Event>(&*self.device) {
            match event {
                ioctl::Event::SrcChangeEvent(changes)
                    if changes.contains(ioctl::SrcChanges::RESOLUTION) =>
                {
                    resolution_changed = true;
                }
                _ => (),
            }
        }
        resolution_changed
    }

    fn send_decoder_stop(&mut self) -> Result<(), DeviceError> {
        ioctl::decoder_cmd::<_, ()>(&*self.device, DecoderCmd::stop())
            .map_err(|e| DeviceError::Ioctl("VIDIOC_DECODER_CMD", anyhow!(e)))
    }

    fn send_decoder_start(&mut self) -> Result<(), DeviceError> {
        ioctl::decoder_cmd::<_, ()>(&*self.device, DecoderCmd::start())
            .map_err(|e| DeviceError::Ioctl("VIDIOC_DECODER_CMD", anyhow!(e)))
    }

    fn enumerate_input_formats(&self) -> Result<Vec<PixelFormat>, DeviceError> {
        Ok(ioctl::FormatIterator::new(&*self.device, QueueType::VideoOutputMplane)
            .map(|desc| desc.pixelformat)
            .collect())
    }

    fn set_input_format(
        &mut self,
        pixel_format: PixelFormat,
        buffer_size: usize,
    ) -> Result<(), DeviceError> {
        let InputQueueState::Init(queue) = &mut self.input_queue else {
            return Err(DeviceError::Other(anyhow!("input queue is already set up")));
        };
        let format = queue
            .set_format(Format {
                width: 0,
                height: 0,
                pixelformat: pixel_format,
                plane_fmt: vec![PlaneLayout { sizeimage: buffer_size as u32, bytesperline: 0 }],
            })
            .map_err(|e| DeviceError::Ioctl("VIDIOC_S_FMT", anyhow!(e)))?;
        if format.pixelformat != pixel_format {
            return Err(DeviceError::Other(anyhow!(
                "device did not accept input format {pixel_format}"
            )));
        }
        self.input_format = Some(format);
        Ok(())
    }

    fn enumerate_output_formats(&self) -> Result<Vec<PixelFormat>, DeviceError> {
        Ok(ioctl::FormatIterator::new(&*self.device, QueueType::VideoCaptureMplane)
            .map(|desc| desc.pixelformat)
            .collect())
    }

    fn set_output_format(
        &mut self,
        pixel_format: PixelFormat,
        coded_size: Resolution,
    ) -> Result<(), DeviceError> {
        let format = Format {
            width: coded_size.width,
            height: coded_size.height,
            pixelformat: pixel_format,
            plane_fmt: vec![],
        };
        match &mut self.output_queue {
            OutputQueueState::Init(queue) => {
                queue
                    .set_format(format)
                    .map_err(|e| DeviceError::Ioctl("VIDIOC_S_FMT", anyhow!(e)))?;
            }
            OutputQueueState::Allocated(_) => {
                // The stream already told the device its new coded size, so
                // deferring the ioctl until the buffers are released does not
                // change what G_FMT reports in between.
                self.pending_output_format = Some(format);
            }
            OutputQueueState::Unknown => {
                return Err(DeviceError::Other(anyhow!("output queue in unknown state")))
            }
        }
        Ok(())
    }

    fn output_format(&self) -> Result<OutputFormat, DeviceError> {
        let format: Format = ioctl::g_fmt(&*self.device, QueueType::VideoCaptureMplane)
            .map_err(|e| DeviceError::Ioctl("VIDIOC_G_FMT", anyhow!(e)))?;
        Ok(OutputFormat {
            pixel_format: format.pixelformat,
            coded_size: Resolution::new(format.width, format.height),
        })
    }

    fn min_output_buffers(&self) -> Result<u32, DeviceError> {
        let mut ctrl = v4l2r::controls::SafeExtControl::<MinBuffersForCapture>::from_value(0);
        ioctl::g_ext_ctrls(&*self.device, ioctl::CtrlWhich::Current, &mut ctrl)
            .map_err(|e| DeviceError::Ioctl("VIDIOC_G_EXT_CTRLS", anyhow!("{e:?}")))?;
        Ok(ctrl.value() as u32)
    }

    fn visible_rect(&self) -> Option<Rect> {
        for target in [SelectionTarget::Compose, SelectionTarget::ComposeDefault] {
            match ioctl::g_selection::<v4l2r::Rect>(&*self.device, SelectionType::Capture, target) {
                Ok(rect) => {
                    return Some(Rect {
                        left: rect.left,
                        top: rect.top,
                        width: rect.width,
                        height: rect.height,
                    })
                }
                Err(e) => log::debug!("G_SELECTION {target:?} failed: {e}"),
            }
        }
        None
    }

    fn allocate_input_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        let InputQueueState::Init(_) = &self.input_queue else {
            return Err(DeviceError::Other(anyhow!("input buffers already allocated")));
        };
        let InputQueueState::Init(queue) = std::mem::take(&mut self.input_queue) else {
            unreachable!();
        };
        let queue = queue
            .request_buffers::<BitstreamPlane>(count)
            .map_err(|e| DeviceError::Ioctl("VIDIOC_REQBUFS", anyhow!(e)))?;
        let allocated = queue.num_buffers() as u32;
        self.input_queue = InputQueueState::Allocated(queue);
        Ok(allocated)
    }

    fn deallocate_input_buffers(&mut self) -> Result<(), DeviceError> {
        match std::mem::take(&mut self.input_queue) {
            InputQueueState::Allocated(queue) => {
                let queue = queue
                    .free_buffers()
                    .map_err(|e| DeviceError::Ioctl("VIDIOC_REQBUFS", anyhow!(e)))?
                    .queue;
                self.input_queue = InputQueueState::Init(queue);
                Ok(())
            }
            other => {
                self.input_queue = other;
                Ok(())
            }
        }
    }

    fn stream_on_input(&mut self) -> Result<(), DeviceError> {
        self.allocated_input_queue()?
            .stream_on()
            .map_err(|e| DeviceError::Ioctl("VIDIOC_STREAMON", anyhow!(e)))
    }

    fn stream_off_input(&mut self) -> Result<(), DeviceError> {
        self.allocated_input_queue()?
            .stream_off()
            .map_err(|e| DeviceError::Ioctl("VIDIOC_STREAMOFF", anyhow!(e)))?;
        Ok(())
    }

    fn free_input_buffers(&self) -> usize {
        match &self.input_queue {
            InputQueueState::Allocated(queue) => queue.num_free_buffers(),
            _ => 0,
        }
    }

    fn queued_input_buffers(&self) -> usize {
        match &self.input_queue {
            InputQueueState::Allocated(queue) => queue.num_queued_buffers(),
            _ => 0,
        }
    }

    fn input_plane_size(&self) -> usize {
        self.input_format
            .as_ref()
            .and_then(|format| format.plane_fmt.first())
            .map(|plane| plane.sizeimage as usize)
            .unwrap_or(0)
    }

    fn queue_input_buffer(
        &mut self,
        bitstream_id: i32,
        dmabuf: &Arc<OwnedFd>,
        offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        let queue = self.allocated_input_queue()?;
        let buffer = queue.try_get_free_buffer().map_err(|_| DeviceError::NoFreeBuffer("input"))?;
        buffer
            .set_timestamp(TimeVal::seconds(i64::from(bitstream_id)))
            .queue_with_handles(
                BitstreamPlane { fd: dmabuf.clone(), data_offset: offset as u32 },
                &[offset + size],
            )
            .map_err(|e| DeviceError::Ioctl("VIDIOC_QBUF", anyhow!(e)))?;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self) -> Result<Option<i32>, DeviceError> {
        let queue = self.allocated_input_queue()?;
        match queue.try_dequeue() {
            Ok(buffer) => Ok(Some(buffer.data.timestamp().tv_sec as i32)),
            Err(ioctl::DqBufError::IoctlError(
                ioctl::DqBufIoctlError::NotReady | ioctl::DqBufIoctlError::Eos,
            )) => Ok(None),
            Err(e) => Err(DeviceError::Ioctl("VIDIOC_DQBUF", anyhow!(e))),
        }
    }

    fn allocate_output_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        let OutputQueueState::Init(_) = &self.output_queue else {
            return Err(DeviceError::Other(anyhow!("output buffers already allocated")));
        };
        let OutputQueueState::Init(mut queue) = std::mem::take(&mut self.output_queue) else {
            unreachable!();
        };
        if let Some(format) = self.pending_output_format.take() {
            queue.set_format(format).map_err(|e| DeviceError::Ioctl("VIDIOC_S_FMT", anyhow!(e)))?;
        }
        let queue = queue
            .request_buffers::<FramePlanes>(count)
            .map_err(|e| DeviceError::Ioctl("VIDIOC_REQBUFS", anyhow!(e)))?;
        let allocated = queue.num_buffers() as u32;
        self.output_queue = OutputQueueState::Allocated(queue);
        Ok(allocated)
    }

    fn deallocate_output_buffers(&mut self) -> Result<(), DeviceError> {
        match std::mem::take(&mut self.output_queue) {
            OutputQueueState::Allocated(queue) => {
                let queue = queue
                    .free_buffers()
                    .map_err(|e| DeviceError::Ioctl("VIDIOC_REQBUFS", anyhow!(e)))?
                    .queue;
                self.output_queue = OutputQueueState::Init(queue);
                Ok(())
            }
            other => {
                self.output_queue = other;
                Ok(())
            }
        }
    }

    fn stream_on_output(&mut self) -> Result<(), DeviceError> {
        self.allocated_output_queue()?
            .stream_on()
            .map_err(|e| DeviceError::Ioctl("VIDIOC_STREAMON", anyhow!(e)))
    }

    fn stream_off_output(&mut self) -> Result<(), DeviceError> {
        self.allocated_output_queue()?
            .stream_off()
            .map_err(|e| DeviceError::Ioctl("VIDIOC_STREAMOFF", anyhow!(e)))?;
        Ok(())
    }

    fn is_output_streaming(&self) -> bool {
        match &self.output_queue {
            OutputQueueState::Allocated(queue) => queue.is_streaming(),
            _ => false,
        }
    }

    fn free_output_buffers(&self) -> usize {
        match &self.output_queue {
            OutputQueueState::Allocated(queue) => queue.num_free_buffers(),
            _ => 0,
        }
    }

    fn allocated_output_buffers(&self) -> usize {
        match &self.output_queue {
            OutputQueueState::Allocated(queue) => queue.num_buffers(),
            _ => 0,
        }
    }

    fn queue_output_buffer(
        &mut self,
        index: u32,
        planes: &[Arc<OwnedFd>],
    ) -> Result<(), DeviceError> {
        let queue = self.allocated_output_queue()?;
        let buffer =
            queue.try_get_buffer(index as usize).map_err(|_| DeviceError::BufferBusy(index))?;
        buffer
            .queue_with_handles(FramePlanes { fds: planes.to_vec() })
            .map_err(|e| DeviceError::Ioctl("VIDIOC_QBUF", anyhow!(e)))?;
        Ok(())
    }

    fn dequeue_output_buffer(&mut self) -> Result<Option<DequeuedOutputBuffer>, DeviceError> {
        let queue = self.allocated_output_queue()?;
        match queue.try_dequeue() {
            Ok(buffer) => Ok(Some(DequeuedOutputBuffer {
                index: buffer.data.index(),
                bitstream_id: buffer.data.timestamp().tv_sec as i32,
                bytes_used: *buffer.data.get_first_plane().bytesused as usize,
                is_last: buffer.data.is_last(),
            })),
            Err(ioctl::DqBufError::IoctlError(
                ioctl::DqBufIoctlError::NotReady | ioctl::DqBufIoctlError::Eos,
            )) => Ok(None),
            Err(e) => Err(DeviceError::Ioctl("VIDIOC_DQBUF", anyhow!(e))),
        }
    }

    fn start_polling(&mut self, poll_cb: PollCallback) -> Result<(), DeviceError> {
        self.stop_polling();

        let mut poller = Poller::new(self.device.clone())
            .map_err(|e| DeviceError::Other(anyhow!("failed to create poller: {e}")))?;
        poller
            .enable_event(DeviceEvent::CaptureReady)
            .and_then(|_| poller.enable_event(DeviceEvent::OutputReady))
            .and_then(|_| poller.enable_event(DeviceEvent::V4L2Event))
            .map_err(|e| DeviceError::Other(anyhow!("failed to enable poll events: {e}")))?;
        let waker = poller
            .add_waker(0)
            .map_err(|e| DeviceError::Other(anyhow!("failed to add poll waker: {e}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let join_handle = thread::Builder::new()
            .name("v4l2-poll".to_owned())
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    let events = match poller.poll(None) {
                        Ok(events) => events,
                        Err(e) => {
                            log::error!("Device poll failed: {e}");
                            return;
                        }
                    };
                    let mut progressed = false;
                    let mut device_event = false;
                    for event in events {
                        match event {
                            PollEvent::Device(DeviceEvent::V4L2Event) => device_event = true,
                            PollEvent::Device(_) => progressed = true,
                            PollEvent::Waker(_) => (),
                        }
                    }
                    if thread_stop.load(Ordering::SeqCst) {
                        return;
                    }
                    if progressed || device_event {
                        poll_cb(device_event);
                        // Readiness is level triggered, give the worker a
                        // chance to consume it before polling again.
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
            .map_err(|e| DeviceError::Other(anyhow!("failed to spawn poll thread: {e}")))?;

        self.poll_thread = Some(PollThread { join_handle, stop, waker });
        Ok(())
    }

    fn stop_polling(&mut self) {
        if let Some(poll_thread) = self.poll_thread.take() {
            poll_thread.stop.store(true, Ordering::SeqCst);
            poll_thread.waker.wake();
            let _ = poll_thread.join_handle.join();
        }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.stop_polling();
    }
}
