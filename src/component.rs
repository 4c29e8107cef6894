// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode component: the Codec2-facing state engine.
//!
//! The component accepts work items from the client, feeds their compressed
//! payloads to the decoder driver, matches decoded frames back to the works
//! that produced them and reports finished works through the listener in
//! completion-queue order. All bookkeeping lives on a dedicated worker
//! thread; the public methods only validate state and post tasks.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;

use crate::c2::C2Status;
use crate::c2::ColorAspects;
use crate::c2::DrainMode;
use crate::c2::FlushMode;
use crate::c2::LinearBlock;
use crate::c2::Listener;
use crate::c2::OutputBuffer;
use crate::c2::Work;
use crate::c2::WorkFlags;
use crate::c2::WorkOrdinal;
use crate::codec::h264;
use crate::decoder::BitstreamBuffer;
use crate::decoder::DecodeDoneCb;
use crate::decoder::DecodeStatus;
use crate::decoder::Decoder;
use crate::decoder::ErrorCb;
use crate::decoder::GetPoolCb;
use crate::decoder::OutputCb;
use crate::device::VideoDeviceFactory;
use crate::pool::FramePoolFactory;
use crate::pool::FramePoolRequest;
use crate::pool::HalPixelFormat;
use crate::pool::VideoFrame;
use crate::worker::TaskRunner;
use crate::worker::WorkerThread;
use crate::VideoCodec;

/// Cap on dynamic resolution changes so a malicious stream cannot exhaust
/// system memory.
const MAX_SUPPORTED_AREA: u64 = 4096 * 4096;

// The constant values copied from CCodecBufferChannel.cpp.
const SMOOTHNESS_FACTOR: usize = 4;
const RENDERING_DEPTH: usize = 3;
// Extra number of needed output buffers for the decoder itself.
const EXTRA_OUTPUT_BUFFERS_FOR_DECODER: usize = 2;

fn output_delay(codec: VideoCodec) -> usize {
    match codec {
        VideoCodec::H264 | VideoCodec::Hevc => 16,
        VideoCodec::Vp9 => 4,
        VideoCodec::Vp8 => 1,
    }
}

/// The framework stops feeding input once all its output slots hold pending
/// decoded buffers; the decoder must have at least this many output buffers
/// so the pipeline never starves beforehand.
fn min_num_output_buffers(codec: VideoCodec) -> usize {
    output_delay(codec) + SMOOTHNESS_FACTOR + RENDERING_DEPTH + EXTRA_OUTPUT_BUFFERS_FOR_DECODER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Stopped,
    Running,
    Released,
    Error,
}

static CONCURRENT_INSTANCES: AtomicI32 = AtomicI32::new(0);
// Guards the check-and-increment on creation so a pair of racing creates
// cannot both slip under the cap.
static CREATE_LOCK: Mutex<()> = Mutex::new(());

struct InstanceGuard;

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        CONCURRENT_INSTANCES.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Configuration the client negotiated before creating the component.
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    pub codec: VideoCodec,
    pub input_buffer_size: usize,
    pub block_pool_id: u64,
    /// Process-wide cap on live decode components, -1 for unlimited.
    pub max_concurrent_instances: i32,
}

/// The component interface: configuration values queried and updated by both
/// the client and the worker.
pub struct DecodeInterface {
    codec: VideoCodec,
    input_buffer_size: usize,
    block_pool_id: u64,
    color_aspects: Mutex<ColorAspects>,
}

impl DecodeInterface {
    fn new(config: &ComponentConfig) -> Self {
        Self {
            codec: config.codec,
            input_buffer_size: config.input_buffer_size,
            block_pool_id: config.block_pool_id,
            color_aspects: Mutex::new(ColorAspects::default()),
        }
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn input_buffer_size(&self) -> usize {
        self.input_buffer_size
    }

    pub fn block_pool_id(&self) -> u64 {
        self.block_pool_id
    }

    pub fn config_color_aspects(&self, aspects: ColorAspects) -> C2Status {
        *self.color_aspects.lock().unwrap() = aspects;
        C2Status::C2Ok
    }

    pub fn query_color_aspects(&self) -> ColorAspects {
        *self.color_aspects.lock().unwrap()
    }
}

struct Shared {
    state: Mutex<ComponentState>,
    listener: Mutex<Option<Arc<dyn Listener>>>,
}

/// The client-facing component handle. All methods may be called from any
/// thread; mutation happens through tasks on the worker.
pub struct DecodeComponent {
    shared: Arc<Shared>,
    intf: Arc<DecodeInterface>,
    is_secure: bool,
    device_factory: Arc<VideoDeviceFactory>,
    pool_factory: Arc<FramePoolFactory>,
    /// Also serializes start/stop/release against each other.
    worker: Mutex<Option<WorkerThread<ComponentInner>>>,
    _instance: InstanceGuard,
}

impl DecodeComponent {
    /// Creates a component, or `None` when the concurrent-instance cap is
    /// reached or the configuration is unusable.
    pub fn create(
        name: &str,
        config: ComponentConfig,
        device_factory: VideoDeviceFactory,
        pool_factory: FramePoolFactory,
    ) -> Option<DecodeComponent> {
        let lock = CREATE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        if config.max_concurrent_instances >= 0
            && CONCURRENT_INSTANCES.load(Ordering::Relaxed) >= config.max_concurrent_instances
        {
            log::warn!(
                "Reject to create {name} due to too many instances: {}",
                CONCURRENT_INSTANCES.load(Ordering::Relaxed)
            );
            return None;
        }
        if config.input_buffer_size == 0 {
            log::error!("Cannot create {name} with an empty input buffer size");
            return None;
        }
        CONCURRENT_INSTANCES.fetch_add(1, Ordering::Relaxed);
        drop(lock);

        let is_secure = name.contains(".secure");
        Some(DecodeComponent {
            shared: Arc::new(Shared {
                state: Mutex::new(ComponentState::Stopped),
                listener: Mutex::new(None),
            }),
            intf: Arc::new(DecodeInterface::new(&config)),
            is_secure,
            device_factory: Arc::new(device_factory),
            pool_factory: Arc::new(pool_factory),
            worker: Mutex::new(None),
            _instance: InstanceGuard,
        })
    }

    pub fn state(&self) -> ComponentState {
        *self.shared.state.lock().unwrap()
    }

    pub fn interface(&self) -> Arc<DecodeInterface> {
        self.intf.clone()
    }

    /// STOPPED -> RUNNING. Blocks until the worker and the decoder driver are
    /// up; the driver failing to come up fails the start.
    pub fn start(&self) -> C2Status {
        let mut worker_slot = self.worker.lock().unwrap();
        {
            let state = self.shared.state.lock().unwrap();
            if *state != ComponentState::Stopped {
                log::error!("Could not start at {:?} state", *state);
                return C2Status::C2BadState;
            }
        }

        let shared = self.shared.clone();
        let intf = self.intf.clone();
        let is_secure = self.is_secure;
        let device_factory = self.device_factory.clone();
        let pool_factory = self.pool_factory.clone();
        let worker = WorkerThread::spawn("c2-decode-worker", move |runner| {
            ComponentInner::new(runner, shared, intf, is_secure, device_factory, pool_factory)
        });

        match worker {
            Ok(worker) => {
                *worker_slot = Some(worker);
                *self.shared.state.lock().unwrap() = ComponentState::Running;
                C2Status::C2Ok
            }
            Err(e) => {
                log::error!("Failed to bring up the decoder worker: {e}");
                C2Status::C2Corrupted
            }
        }
    }

    /// RUNNING|ERROR -> STOPPED. Abandons all pending and in-flight work,
    /// tears the driver down and joins the worker.
    pub fn stop(&self) -> C2Status {
        let mut worker_slot = self.worker.lock().unwrap();
        {
            let state = self.shared.state.lock().unwrap();
            if *state != ComponentState::Running && *state != ComponentState::Error {
                log::error!("Could not stop at {:?} state", *state);
                return C2Status::C2BadState;
            }
        }

        if let Some(worker) = worker_slot.take() {
            worker.runner().post(|inner| inner.stop_task());
            worker.stop();
        }
        *self.shared.state.lock().unwrap() = ComponentState::Stopped;
        C2Status::C2Ok
    }

    pub fn reset(&self) -> C2Status {
        self.stop()
    }

    /// Any state -> RELEASED.
    pub fn release(&self) -> C2Status {
        let mut worker_slot = self.worker.lock().unwrap();
        if let Some(worker) = worker_slot.take() {
            worker.runner().post(|inner| inner.release_task());
            worker.stop();
        }
        *self.shared.state.lock().unwrap() = ComponentState::Released;
        C2Status::C2Ok
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn Listener>>, may_block: bool) -> C2Status {
        let state = self.state();
        if state == ComponentState::Released
            || (state == ComponentState::Running && listener.is_some())
        {
            log::error!("Could not set listener at {state:?} state");
            return C2Status::C2BadState;
        }
        if state == ComponentState::Running && !may_block {
            log::error!("Could not set listener at {state:?} state non-blocking");
            return C2Status::C2Blocking;
        }

        let worker_slot = self.worker.lock().unwrap();
        match worker_slot.as_ref() {
            // No worker, safe to update the listener directly.
            None => {
                *self.shared.listener.lock().unwrap() = listener;
                C2Status::C2Ok
            }
            Some(worker) => {
                let shared = self.shared.clone();
                match worker.runner().post_and_wait(move |_| {
                    *shared.listener.lock().unwrap() = listener;
                }) {
                    Some(()) => C2Status::C2Ok,
                    None => C2Status::C2Corrupted,
                }
            }
        }
    }

    /// Appends works to the pending queue; they are processed asynchronously.
    pub fn queue(&self, works: Vec<Work>) -> C2Status {
        if self.state() != ComponentState::Running {
            log::error!("Could not queue at state {:?}", self.state());
            return C2Status::C2BadState;
        }

        let worker_slot = self.worker.lock().unwrap();
        let Some(worker) = worker_slot.as_ref() else {
            return C2Status::C2Corrupted;
        };
        for work in works {
            worker.runner().post(move |inner| inner.queue_task(work));
        }
        C2Status::C2Ok
    }

    /// Abandons all pending and in-flight work; they come back through the
    /// listener as NOT_FOUND.
    pub fn flush(&self, mode: FlushMode) -> C2Status {
        if self.state() != ComponentState::Running {
            log::error!("Could not flush at state {:?}", self.state());
            return C2Status::C2BadState;
        }
        if mode != FlushMode::Component {
            // Tunneling is not supported.
            return C2Status::C2Omitted;
        }

        let worker_slot = self.worker.lock().unwrap();
        let Some(worker) = worker_slot.as_ref() else {
            return C2Status::C2Corrupted;
        };
        worker.runner().post(|inner| inner.flush_task());
        C2Status::C2Ok
    }

    pub fn drain(&self, mode: DrainMode) -> C2Status {
        if self.state() != ComponentState::Running {
            log::error!("Could not drain at state {:?}", self.state());
            return C2Status::C2BadState;
        }

        match mode {
            // Tunneling is not supported.
            DrainMode::Chain => C2Status::C2Omitted,
            DrainMode::ComponentNoEos => C2Status::C2Ok,
            DrainMode::ComponentWithEos => {
                let worker_slot = self.worker.lock().unwrap();
                let Some(worker) = worker_slot.as_ref() else {
                    return C2Status::C2Corrupted;
                };
                worker.runner().post(|inner| inner.drain_task());
                C2Status::C2Ok
            }
        }
    }

    pub fn announce(&self, _items: &[WorkOrdinal]) -> C2Status {
        // Work announcement is part of tunneling, which is not supported.
        C2Status::C2Omitted
    }
}

impl Drop for DecodeComponent {
    fn drop(&mut self) {
        self.release();
    }
}

/// Worker-confined state: the engine bookkeeping plus the decoder driver.
pub struct ComponentInner {
    runner: TaskRunner<ComponentInner>,
    shared: Arc<Shared>,
    intf: Arc<DecodeInterface>,
    codec: VideoCodec,
    is_secure: bool,

    decoder: Option<Decoder>,

    /// Works accepted from the client, not yet handed to the decoder.
    pending_works: VecDeque<Work>,
    /// Works whose input has been (or will be) queued to the device, keyed
    /// by bitstream id.
    works_at_decoder: BTreeMap<i32, Work>,
    /// Completion order: works are reported in the order their ids enter.
    output_bitstream_ids: VecDeque<i32>,
    is_draining: bool,

    current_color_aspects: Option<ColorAspects>,
    /// Set when a CSD carried new aspects; the first output at or past this
    /// frame index re-queries the interface.
    pending_color_aspects_change: Option<u64>,
}

impl ComponentInner {
    fn new(
        runner: TaskRunner<ComponentInner>,
        shared: Arc<Shared>,
        intf: Arc<DecodeInterface>,
        is_secure: bool,
        device_factory: Arc<VideoDeviceFactory>,
        pool_factory: Arc<FramePoolFactory>,
    ) -> anyhow::Result<ComponentInner> {
        let codec = intf.codec();
        let device = (*device_factory)().map_err(|e| anyhow!("failed to open device: {e}"))?;

        let get_pool_runner = runner.clone();
        let get_pool_intf = intf.clone();
        let get_pool_cb: GetPoolCb = Box::new(move |coded_size, num_buffers| {
            if coded_size.area() > MAX_SUPPORTED_AREA {
                log::error!(
                    "The output size ({coded_size}) is larger than supported size (4096x4096)"
                );
                get_pool_runner.post(|inner| inner.report_error(C2Status::C2BadValue));
                return None;
            }
            let pool = (*pool_factory)(FramePoolRequest {
                coded_size,
                pixel_format: HalPixelFormat::Ycbcr420Flexible,
                num_buffers,
                block_pool_id: get_pool_intf.block_pool_id(),
                secure: is_secure,
            });
            if pool.is_none() {
                log::error!("Failed to create block pool for {coded_size}");
                get_pool_runner.post(|inner| inner.report_error(C2Status::C2Corrupted));
            }
            pool
        });

        let output_runner = runner.clone();
        let output_cb: OutputCb = Box::new(move |frame| {
            output_runner.post(move |inner| inner.on_output_frame_ready(frame));
        });

        let error_runner = runner.clone();
        let error_cb: ErrorCb = Box::new(move || {
            error_runner.post(|inner| inner.report_error(C2Status::C2Corrupted));
        });

        let decoder = Decoder::create(
            codec,
            intf.input_buffer_size(),
            min_num_output_buffers(codec),
            get_pool_cb,
            output_cb,
            error_cb,
            device,
            runner.clone(),
        )
        .map_err(|e| anyhow!("failed to create decoder for {codec}: {e}"))?;

        // Cache the default color aspects so the first outputs are stamped
        // even before any CSD is parsed.
        let current_color_aspects =
            (!is_secure && codec == VideoCodec::H264).then(|| intf.query_color_aspects());

        Ok(ComponentInner {
            runner,
            shared,
            intf,
            codec,
            is_secure,
            decoder: Some(decoder),
            pending_works: VecDeque::new(),
            works_at_decoder: BTreeMap::new(),
            output_bitstream_ids: VecDeque::new(),
            is_draining: false,
            current_color_aspects,
            pending_color_aspects_change: None,
        })
    }

    pub(crate) fn decoder_mut(&mut self) -> Option<&mut Decoder> {
        self.decoder.as_mut()
    }

    fn queue_task(&mut self, mut work: Work) {
        log::debug!(
            "queue_task(): flags={:?}, index={}, timestamp={}",
            work.flags,
            work.ordinal.frame_index,
            work.ordinal.timestamp
        );

        work.worklet.flags = WorkFlags::empty();
        work.worklet.ordinal = work.ordinal;
        work.worklet.buffer = None;
        work.result = C2Status::C2Ok;
        work.worklets_processed = 0;

        // A work without an input buffer is only meaningful as EOS or as an
        // empty CSD.
        if work.input.is_none()
            && !work.flags.contains(WorkFlags::END_OF_STREAM)
            && !work.flags.contains(WorkFlags::CODEC_CONFIG)
        {
            log::error!("Invalid work: work with no input buffer should be EOS or CSD");
            self.report_error(C2Status::C2BadValue);
            return;
        }

        self.pending_works.push_back(work);
        self.pump_pending_works();
    }

    fn pump_pending_works(&mut self) {
        {
            let state = self.shared.state.lock().unwrap();
            if *state != ComponentState::Running {
                log::warn!("Could not pump works at state {:?}", *state);
                return;
            }
        }

        while !self.pending_works.is_empty() && !self.is_draining {
            let Some(work) = self.pending_works.pop_front() else {
                break;
            };
            let bitstream_id = work.bitstream_id();
            let frame_index = work.ordinal.frame_index;
            let is_csd = work.flags.contains(WorkFlags::CODEC_CONFIG);
            let is_eos = work.flags.contains(WorkFlags::END_OF_STREAM);
            let input = work.input.clone();
            let is_empty = input.is_none();
            log::debug!(
                "Process work bitstream_id={bitstream_id} is_csd={is_csd} is_empty={is_empty}"
            );

            if self.works_at_decoder.insert(bitstream_id, work).is_some() {
                log::warn!("We already inserted bitstream_id {bitstream_id} to decoder?");
            }

            if let Some(input) = input {
                // CSD of a non-secure H.264 stream may carry color aspects
                // the framework wants reflected in the configuration.
                if is_csd && !self.is_secure && self.codec == VideoCodec::H264 {
                    if let Some(aspects) = parse_csd_color_aspects(&input) {
                        let status = self.intf.config_color_aspects(aspects);
                        if status != C2Status::C2Ok {
                            log::error!("Failed to config color aspects to interface: {status:?}");
                            self.report_error(status);
                            return;
                        }
                        // Aspects apply to outputs from this frame on.
                        self.pending_color_aspects_change = Some(frame_index);
                    }
                }

                let runner = self.runner.clone();
                let done_cb: DecodeDoneCb = Box::new(move |status| {
                    runner.post(move |inner| inner.on_decode_done(bitstream_id, status));
                });
                let buffer = BitstreamBuffer {
                    bitstream_id,
                    dmabuf: input.dmabuf.clone(),
                    offset: input.offset,
                    size: input.size,
                };
                let Some(decoder) = self.decoder.as_mut() else {
                    return;
                };
                decoder.decode(buffer, done_cb);
            }

            if is_eos {
                let runner = self.runner.clone();
                let done_cb: DecodeDoneCb = Box::new(move |status| {
                    runner.post(move |inner| inner.on_drain_done(status));
                });
                let Some(decoder) = self.decoder.as_mut() else {
                    return;
                };
                decoder.drain(done_cb);
                self.is_draining = true;
            }

            // An empty CSD has no decoder side at all, report it directly.
            if is_csd && is_empty {
                self.output_bitstream_ids.push_back(bitstream_id);
                self.pump_report_works();
            }
        }
    }

    fn on_decode_done(&mut self, bitstream_id: i32, status: DecodeStatus) {
        log::debug!("on_decode_done(bitstream_id={bitstream_id}, status={status:?})");

        let Some(work) = self.works_at_decoder.get_mut(&bitstream_id) else {
            // The work was abandoned while its callback was in flight.
            log::debug!("work(bitstream_id={bitstream_id}) is already gone, skip");
            return;
        };

        match status {
            DecodeStatus::Aborted => {
                work.input = None;
                work.worklet.flags.insert(WorkFlags::DROP_FRAME);
                self.output_bitstream_ids.push_back(bitstream_id);
                self.pump_report_works();
            }
            DecodeStatus::Error => self.report_error(C2Status::C2Corrupted),
            DecodeStatus::Ok => {
                work.input = None;
                // A CSD work has no output frame, its id enters the
                // completion queue as soon as the input is consumed.
                if work.flags.contains(WorkFlags::CODEC_CONFIG) {
                    self.output_bitstream_ids.push_back(bitstream_id);
                }
                self.pump_report_works();
            }
        }
    }

    fn on_output_frame_ready(&mut self, frame: VideoFrame) {
        let bitstream_id = frame.bitstream_id;
        log::debug!("on_output_frame_ready(bitstream_id={bitstream_id})");

        let Some(work) = self.works_at_decoder.get(&bitstream_id) else {
            log::error!("Work with bitstream_id={bitstream_id} not found, already abandoned?");
            self.report_error(C2Status::C2Corrupted);
            return;
        };
        let ordinal = work.ordinal;

        if self.pending_color_aspects_change.is_some_and(|index| ordinal.frame_index >= index) {
            self.current_color_aspects = Some(self.intf.query_color_aspects());
            self.pending_color_aspects_change = None;
        }
        let buffer = OutputBuffer { frame, color_aspects: self.current_color_aspects };
        if let Some(work) = self.works_at_decoder.get_mut(&bitstream_id) {
            work.worklet.buffer = Some(buffer);
        }

        // The decoder outputs in display order, so a newer output proves
        // that older outstanding frames will never show.
        if matches!(self.codec, VideoCodec::Vp8 | VideoCodec::Vp9) {
            self.detect_no_show_frame_works(ordinal);
        }

        self.output_bitstream_ids.push_back(bitstream_id);
        self.pump_report_works();
    }

    fn detect_no_show_frame_works(&mut self, current_ordinal: WorkOrdinal) {
        let mut no_show_ids = Vec::new();
        for (bitstream_id, work) in self.works_at_decoder.iter_mut() {
            if is_no_show_frame_work(work, &current_ordinal) {
                work.worklet.flags.insert(WorkFlags::DROP_FRAME);
                no_show_ids.push(*bitstream_id);
                log::debug!(
                    "Detected no-show frame work index={} timestamp={}",
                    work.ordinal.frame_index,
                    work.ordinal.timestamp
                );
            }
        }

        // Queued after the scan completes so reporting cannot mutate the map
        // under the iteration above.
        self.output_bitstream_ids.extend(no_show_ids);
    }

    fn pump_report_works(&mut self) {
        while let Some(&bitstream_id) = self.output_bitstream_ids.front() {
            if !self.report_work_if_finished(bitstream_id) {
                break;
            }
            self.output_bitstream_ids.pop_front();
        }
    }

    /// Returns true when the id is consumed (reported or already dropped);
    /// false leaves it as the queue head, a barrier for later ids.
    fn report_work_if_finished(&mut self, bitstream_id: i32) -> bool {
        // The EOS work is only reported by report_eos_work() once the drain
        // completes.
        if self.is_draining && self.works_at_decoder.len() == 1 {
            log::debug!("work(bitstream_id={bitstream_id}) is the EOS work");
            return false;
        }

        let Some(work) = self.works_at_decoder.get(&bitstream_id) else {
            log::info!("work(bitstream_id={bitstream_id}) is dropped, skip");
            return true;
        };
        if !is_work_done(work) {
            log::debug!("work(bitstream_id={bitstream_id}) is not done yet");
            return false;
        }

        let Some(mut work) = self.works_at_decoder.remove(&bitstream_id) else {
            return true;
        };
        work.result = C2Status::C2Ok;
        work.worklets_processed = 1;
        // A work with neither flags nor output buffer is treated by the
        // framework as having no corresponding output, regaining pipeline
        // capacity immediately.
        if work.worklet.flags.contains(WorkFlags::DROP_FRAME) {
            work.worklet.flags = WorkFlags::empty();
        }

        self.report_work(work)
    }

    fn report_eos_work(&mut self) -> bool {
        log::debug!("report_eos_work()");

        let Some(eos_id) = self
            .works_at_decoder
            .iter()
            .find(|(_, work)| work.flags.contains(WorkFlags::END_OF_STREAM))
            .map(|(id, _)| *id)
        else {
            log::error!("Failed to find EOS work");
            return false;
        };
        let Some(mut eos_work) = self.works_at_decoder.remove(&eos_id) else {
            return false;
        };

        eos_work.result = C2Status::C2Ok;
        eos_work.worklets_processed = 1;
        eos_work.worklet.flags = WorkFlags::END_OF_STREAM;
        eos_work.input = None;

        if !self.works_at_decoder.is_empty() {
            log::warn!("There are remaining works except the EOS work, abandon them");
            self.report_abandoned_works();
        }

        self.report_work(eos_work)
    }

    fn report_work(&mut self, work: Work) -> bool {
        log::debug!("report_work(index={})", work.ordinal.frame_index);

        let listener = self.shared.listener.lock().unwrap().clone();
        let Some(listener) = listener else {
            log::error!("No listener, set_listener() not called?");
            return false;
        };
        listener.on_work_done(vec![work]);
        true
    }

    fn on_drain_done(&mut self, status: DecodeStatus) {
        log::debug!("on_drain_done(status={status:?})");

        match status {
            // A flush is in flight; the EOS work is abandoned with the rest.
            DecodeStatus::Aborted => (),
            DecodeStatus::Error => self.report_error(C2Status::C2Corrupted),
            DecodeStatus::Ok => {
                self.is_draining = false;
                if !self.report_eos_work() {
                    self.report_error(C2Status::C2Corrupted);
                    return;
                }
                self.runner.clone().post(|inner| inner.pump_pending_works());
            }
        }
    }

    fn drain_task(&mut self) {
        log::debug!("drain_task()");

        if !self.pending_works.is_empty() {
            log::debug!("Set EOS flag at last queued work");
            if let Some(last) = self.pending_works.back_mut() {
                last.flags.insert(WorkFlags::END_OF_STREAM);
            }
            return;
        }

        if !self.works_at_decoder.is_empty() {
            log::debug!("Drain the pending works at the decoder");
            let runner = self.runner.clone();
            let done_cb: DecodeDoneCb = Box::new(move |status| {
                runner.post(move |inner| inner.on_drain_done(status));
            });
            let Some(decoder) = self.decoder.as_mut() else {
                return;
            };
            decoder.drain(done_cb);
            self.is_draining = true;
        }
    }

    fn flush_task(&mut self) {
        log::debug!("flush_task()");

        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
        self.report_abandoned_works();

        // A pending EOS work was abandoned above, the drain is gone with it.
        self.is_draining = false;
    }

    fn report_abandoned_works(&mut self) {
        log::debug!("report_abandoned_works()");

        // Ids left in the completion queue now point at erased works; the
        // reporting pump skips them.
        let mut abandoned_works: Vec<Work> = self.pending_works.drain(..).collect();
        abandoned_works.extend(std::mem::take(&mut self.works_at_decoder).into_values());

        if abandoned_works.is_empty() {
            return;
        }
        for work in &mut abandoned_works {
            work.result = C2Status::C2NotFound;
            work.input = None;
        }

        let listener = self.shared.listener.lock().unwrap().clone();
        let Some(listener) = listener else {
            log::error!("No listener, set_listener() not called?");
            return;
        };
        listener.on_work_done(abandoned_works);
    }

    fn report_error(&mut self, status: C2Status) {
        log::error!("report_error(status={status:?})");

        {
            let mut state = self.shared.state.lock().unwrap();
            // Only the first error is surfaced.
            if *state == ComponentState::Error {
                return;
            }
            *state = ComponentState::Error;
        }

        let listener = self.shared.listener.lock().unwrap().clone();
        match listener {
            Some(listener) => listener.on_error(status),
            None => log::error!("No listener, set_listener() not called?"),
        }
    }

    fn stop_task(&mut self) {
        log::debug!("stop_task()");

        self.report_abandoned_works();
        self.is_draining = false;
        self.release_task();
    }

    fn release_task(&mut self) {
        log::debug!("release_task()");

        self.decoder = None;
    }
}

fn parse_csd_color_aspects(input: &LinearBlock) -> Option<ColorAspects> {
    let mapped = match input.map() {
        Ok(mapped) => mapped,
        Err(e) => {
            log::error!("Failed to map CSD input: {e}");
            return None;
        }
    };
    h264::parse_color_aspects(mapped.payload()).map(ColorAspects::from_coded)
}

fn is_work_done(work: &Work) -> bool {
    // The EOS work is finished by the drain, never here.
    if work.flags.contains(WorkFlags::END_OF_STREAM) {
        return false;
    }
    let input_released = work.input.is_none();
    let output_returned = work.worklet.buffer.is_some();
    let ignore_output = work.flags.contains(WorkFlags::CODEC_CONFIG)
        || work.worklet.flags.contains(WorkFlags::DROP_FRAME);
    input_released && (output_returned || ignore_output)
}

fn is_no_show_frame_work(work: &Work, current_ordinal: &WorkOrdinal) -> bool {
    // An outstanding work counts as a no-show frame when a later output
    // already arrived: both parts of its ordinal are strictly smaller, it has
    // no output of its own, and it is not EOS, CSD or already dropped.
    let small_ordinal = work.ordinal.timestamp < current_ordinal.timestamp
        && work.ordinal.frame_index < current_ordinal.frame_index;
    let output_returned = work.worklet.buffer.is_some();
    let special_work = work.flags.contains(WorkFlags::END_OF_STREAM)
        || work.flags.contains(WorkFlags::CODEC_CONFIG)
        || work.worklet.flags.contains(WorkFlags::DROP_FRAME);
    small_ordinal && !output_returned && !special_work
}
