// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding sessions.
//!
//! A [`CodecSession`] owns one component instance for the lifetime of a decoding pipeline. Its
//! methods are called from the pipeline's threads, while the component reports back from its own
//! thread through the dispatcher: all state is therefore behind locks, and every method takes
//! `&self`.
//!
//! The expected call sequence is `init`, `configure` (or `set_parameter`), `prepare`, `start`,
//! then any number of `queue_input_buffer`, `queue_output_buffer` and `flush` calls, and finally
//! `stop` or `deinit`. `reset` brings a prepared session back to an unconfigured Loaded state without
//! destroying the component.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use crate::buffer::InputFrame;
use crate::buffer::OutputBuffer;
use crate::dispatcher::CallbackDispatcher;
use crate::error::CodecError;
use crate::error::CodecResult;
use crate::protocol::*;
use crate::queue::BoundedQueue;
use crate::queue::QueueError;
use crate::registry::parse_component_name;
use crate::shm::MemFdAllocator;
use crate::shm::SharedRegionAllocator;
use crate::slots::SlotRegistry;
use crate::state::StateController;
use crate::ComponentCallbacks;
use crate::ComponentManager;
use crate::HardwareComponent;

/// Tunables of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum number of input slots.
    pub input_pool_capacity: usize,
    /// Maximum number of output slots.
    pub output_pool_capacity: usize,
    /// Maximum number of donated output buffers waiting for a slot.
    pub output_supply_capacity: usize,
    /// Maximum time to wait for the component to confirm a state change, or for a donated
    /// buffer during `prepare`. `None` waits forever.
    pub state_wait_timeout: Option<Duration>,
    /// Frame rate used when none has been set, in frames per second.
    pub default_frame_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_pool_capacity: 4,
            output_pool_capacity: 21,
            output_supply_capacity: 21,
            state_wait_timeout: Some(Duration::from_secs(3)),
            default_frame_rate: 30,
        }
    }
}

/// Layout of decoded frames requested by the pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VideoPixelFormat {
    #[default]
    Unknown,
    Nv12,
    Nv21,
    Yuv420p,
    Rgba,
}

impl VideoPixelFormat {
    /// Colour format the output port must produce for this pixel format, if supported.
    pub fn color_format(self) -> Option<ColorFormat> {
        match self {
            VideoPixelFormat::Nv12 => Some(ColorFormat::Yuv420SemiPlanar),
            VideoPixelFormat::Yuv420p => Some(ColorFormat::Yuv420Planar),
            VideoPixelFormat::Rgba => Some(ColorFormat::Argb8888),
            VideoPixelFormat::Nv21 | VideoPixelFormat::Unknown => None,
        }
    }

    pub fn from_color_format(format: u32) -> Self {
        match ColorFormat::n(format) {
            Some(ColorFormat::Yuv420SemiPlanar) => VideoPixelFormat::Nv12,
            Some(ColorFormat::Yuv420Planar) => VideoPixelFormat::Yuv420p,
            Some(ColorFormat::Argb8888) => VideoPixelFormat::Rgba,
            Some(ColorFormat::Unused) | None => VideoPixelFormat::Unknown,
        }
    }
}

/// Parameters readable or writable through [`CodecSession::get_parameter`] and
/// [`CodecSession::set_parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    VideoWidth,
    VideoHeight,
    VideoPixelFormat,
    /// Frames per second.
    VideoFrameRate,
    RequiredOutBufferCount,
    RequiredOutBufferSize,
    RequiredInBufferCount,
    RequiredInBufferSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagValue {
    U32(u32),
    PixelFormat(VideoPixelFormat),
    None,
}

/// Lifecycle notifications sent to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecEvent {
    /// The component confirmed it reached a new state.
    StateChanged(HardwareState),
    /// The component reported an error.
    Error(i32),
}

pub trait CodecCallback: Send + Sync {
    fn on_event(&self, event: CodecEvent);
}

/// Buffer returns to the pipeline. Called from the component's thread or from the thread
/// queuing a buffer, never with an internal lock held.
pub trait CodecDataCallback: Send + Sync {
    /// `frame` has been copied and submitted to the component.
    ///
    /// This also happens if the component refused the submission: the frame is then lost, but
    /// still handed back so the pipeline can recycle it.
    fn on_input_buffer_done(&self, frame: InputFrame);
    /// `buffer` has been filled with a decoded frame.
    fn on_output_buffer_done(&self, buffer: OutputBuffer);
}

/// Video geometry and buffer requirements negotiated with the component.
#[derive(Debug, Default, Clone, Copy)]
struct VideoParams {
    width: u32,
    height: u32,
    stride: u32,
    pixel_format: VideoPixelFormat,
    /// Frames per second, 0 if not set.
    frame_rate: u32,
    in_buffer_count: u32,
    in_buffer_size: u32,
    out_buffer_count: u32,
    out_buffer_size: u32,
}

impl VideoParams {
    fn is_complete(&self) -> bool {
        self.width != 0 && self.height != 0 && self.pixel_format != VideoPixelFormat::Unknown
    }
}

/// Returns the line stride of frames `width` pixels wide: the width aligned up to 16.
fn stride_for(width: u32) -> CodecResult<u32> {
    width
        .checked_next_multiple_of(16)
        .filter(|&stride| i32::try_from(stride).is_ok())
        .ok_or_else(|| CodecError::InvalidParameter(format!("width {} is too large", width)))
}

/// Component instance owned by a session.
#[derive(Debug, Clone, Copy)]
struct Instance {
    id: u32,
    version: ComponentVersion,
    role: ComponentRole,
}

/// State shared between a session and the dispatcher of its component.
pub(crate) struct SessionCore<C> {
    component: Mutex<Option<Arc<C>>>,
    pub(crate) state: StateController,
    pub(crate) slots: SlotRegistry,
    pub(crate) input_pool: BoundedQueue<u32>,
    pub(crate) output_pool: BoundedQueue<u32>,
    pub(crate) supply: BoundedQueue<OutputBuffer>,
    pub(crate) pending: Mutex<VecDeque<InputFrame>>,
    /// Set once the output slots bound during allocation have been submitted.
    pub(crate) initial_fill_done: AtomicBool,
    callback: Mutex<Option<Arc<dyn CodecCallback>>>,
    data_callback: Mutex<Option<Arc<dyn CodecDataCallback>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: HardwareComponent> SessionCore<C> {
    pub(crate) fn new(config: &SessionConfig) -> Self {
        Self {
            component: Mutex::new(None),
            state: StateController::new(config.state_wait_timeout),
            slots: SlotRegistry::new(),
            input_pool: BoundedQueue::new("input slot pool", config.input_pool_capacity),
            output_pool: BoundedQueue::new("output slot pool", config.output_pool_capacity),
            supply: BoundedQueue::new("output supply queue", config.output_supply_capacity),
            pending: Mutex::new(VecDeque::new()),
            initial_fill_done: AtomicBool::new(false),
            callback: Mutex::new(None),
            data_callback: Mutex::new(None),
        }
    }

    pub(crate) fn component(&self) -> Option<Arc<C>> {
        lock(&self.component).clone()
    }

    pub(crate) fn pending(&self) -> MutexGuard<'_, VecDeque<InputFrame>> {
        lock(&self.pending)
    }

    pub(crate) fn data_callback(&self) -> Option<Arc<dyn CodecDataCallback>> {
        lock(&self.data_callback).clone()
    }

    pub(crate) fn notify(&self, event: CodecEvent) {
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback.on_event(event);
        }
    }

    fn clear_queues(&self) {
        self.pending().clear();
        let dropped = self.supply.clear();
        if !dropped.is_empty() {
            log::debug!("dropped {} donated output buffers", dropped.len());
        }
    }
}

/// A decoding session driving one hardware component.
pub struct CodecSession<M: ComponentManager> {
    plugin_name: String,
    manager: Arc<M>,
    config: SessionConfig,
    allocator: Box<dyn SharedRegionAllocator>,
    core: Arc<SessionCore<M::Component>>,
    instance: Mutex<Option<Instance>>,
    params: Mutex<VideoParams>,
}

impl<M: ComponentManager> CodecSession<M> {
    /// Creates a session for `plugin_name`, of the form `<package>.<component>`.
    pub fn new(plugin_name: impl Into<String>, manager: Arc<M>) -> Self {
        Self::with_config(plugin_name, manager, Default::default())
    }

    pub fn with_config(
        plugin_name: impl Into<String>,
        manager: Arc<M>,
        config: SessionConfig,
    ) -> Self {
        Self::with_allocator(plugin_name, manager, config, Box::new(MemFdAllocator))
    }

    /// Creates a session whose input slots are backed by memory from `allocator`.
    pub fn with_allocator(
        plugin_name: impl Into<String>,
        manager: Arc<M>,
        config: SessionConfig,
        allocator: Box<dyn SharedRegionAllocator>,
    ) -> Self {
        let core = Arc::new(SessionCore::new(&config));

        Self {
            plugin_name: plugin_name.into(),
            manager,
            config,
            allocator,
            core,
            instance: Mutex::new(None),
            params: Mutex::new(Default::default()),
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Last state confirmed by the component.
    pub fn state(&self) -> HardwareState {
        self.core.state.current()
    }

    pub fn set_callback(&self, callback: Arc<dyn CodecCallback>) {
        *lock(&self.core.callback) = Some(callback);
    }

    pub fn set_data_callback(&self, callback: Arc<dyn CodecDataCallback>) {
        *lock(&self.core.data_callback) = Some(callback);
    }

    fn component(&self) -> CodecResult<Arc<M::Component>> {
        self.core.component().ok_or(CodecError::NoComponent)
    }

    /// Creates the component instance. Does nothing if it already exists.
    pub fn init(&self) -> CodecResult<()> {
        let mut instance = lock(&self.instance);
        if instance.is_some() {
            return Ok(());
        }

        let name = parse_component_name(&self.plugin_name)?;
        let role = self
            .manager
            .capabilities()
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.role)
            .unwrap_or(ComponentRole::Unknown);

        let callbacks: Arc<dyn ComponentCallbacks> =
            Arc::new(CallbackDispatcher::new(Arc::downgrade(&self.core)));
        let (id, component) = self
            .manager
            .create_component(name, callbacks)
            .map_err(CodecError::ComponentCreation)?;

        let version = match component.get_version() {
            Ok(version) => version,
            Err(status) => {
                log::error!("failed to get version of component {}: {}", name, status);
                if let Err(status) = self.manager.destroy_component(id) {
                    log::error!("failed to destroy component {}: {}", id, status);
                }
                return Err(CodecError::Device {
                    call: "get_version",
                    status,
                });
            }
        };

        log::info!(
            "created component {} (id {}, version {}.{})",
            name,
            id,
            version.major,
            version.minor
        );
        *lock(&self.core.component) = Some(Arc::new(component));
        *instance = Some(Instance { id, version, role });
        self.core.state.reset(HardwareState::Loaded);
        self.core.supply.set_active(true);

        Ok(())
    }

    /// Resets the session and destroys the component instance.
    pub fn deinit(&self) -> CodecResult<()> {
        let res = self.reset();
        self.destroy()?;
        res
    }

    /// Same as [`CodecSession::deinit`].
    pub fn stop(&self) -> CodecResult<()> {
        self.deinit()
    }

    fn destroy(&self) -> CodecResult<()> {
        let Some(instance) = lock(&self.instance).take() else {
            return Ok(());
        };
        lock(&self.core.component).take();
        self.core.state.reset(HardwareState::Invalid);

        log::info!("destroying component {}", instance.id);
        self.manager
            .destroy_component(instance.id)
            .map_err(CodecError::device("destroy_component"))
    }

    /// Sets the video geometry and negotiates it with the component.
    ///
    /// A `frame_rate` of 0 selects the configured default.
    pub fn configure(
        &self,
        width: u32,
        height: u32,
        pixel_format: VideoPixelFormat,
        frame_rate: u32,
    ) -> CodecResult<()> {
        if width == 0 || height == 0 {
            return Err(CodecError::InvalidParameter(format!(
                "invalid geometry {}x{}",
                width, height
            )));
        }
        let stride = stride_for(width)?;
        {
            let mut params = lock(&self.params);
            params.width = width;
            params.stride = stride;
            params.height = height;
            params.pixel_format = pixel_format;
            params.frame_rate = frame_rate;
        }

        self.negotiate()
    }

    /// Pushes the current video parameters to the component and reads back its buffer
    /// requirements.
    fn negotiate(&self) -> CodecResult<()> {
        let component = self.component()?;
        let instance = (*lock(&self.instance)).ok_or(CodecError::NoComponent)?;
        let mut params = *lock(&self.params);
        let version = instance.version;

        let compression_format = instance.role.compression_format().ok_or_else(|| {
            CodecError::InvalidParameter(format!(
                "component of {} has no supported compression format",
                self.plugin_name
            ))
        })?;
        let color_format = params.pixel_format.color_format().ok_or_else(|| {
            CodecError::InvalidParameter(format!(
                "unsupported pixel format {:?}",
                params.pixel_format
            ))
        })?;

        // Input port format.
        let mut format: VideoPortFormatParam = component
            .get_param(version, PortIndex::Input)
            .map_err(CodecError::negotiation("input video format"))?;
        let fps = match params.frame_rate {
            0 => self.config.default_frame_rate,
            fps => fps,
        };
        format.frame_rate = fps << 16;
        format.compression_format = compression_format as u32;
        component
            .set_param(&format)
            .map_err(CodecError::negotiation("input video format"))?;

        // Decoded frames are written into externally allocated surfaces.
        let mut buffer_type = UseBufferTypeParam::for_port(version, PortIndex::Output);
        buffer_type.buffer_type = BufferType::Handle as u32;
        component
            .set_param(&buffer_type)
            .map_err(CodecError::negotiation("output buffer type"))?;

        for port in [PortIndex::Input, PortIndex::Output] {
            let mut def: PortDefinitionParam = component
                .get_param(version, port)
                .map_err(CodecError::negotiation("port definition"))?;
            match port {
                PortIndex::Input => def.compression_format = compression_format as u32,
                PortIndex::Output => def.color_format = color_format as u32,
            }
            def.frame_width = params.width;
            def.frame_height = params.height;
            def.stride = params.stride as i32;
            def.slice_height = params.height;
            component
                .set_param(&def)
                .map_err(CodecError::negotiation("port definition"))?;
        }

        for port in [PortIndex::Input, PortIndex::Output] {
            let def: PortDefinitionParam = component
                .get_param(version, port)
                .map_err(CodecError::negotiation("buffer requirements"))?;
            match port {
                PortIndex::Input => {
                    params.in_buffer_count = def.buffer_count_actual;
                    params.in_buffer_size = def.buffer_size;
                }
                PortIndex::Output => {
                    params.out_buffer_count = def.buffer_count_actual;
                    params.out_buffer_size = def.buffer_size;
                }
            }
            log::debug!(
                "{} port needs {} buffers of {} bytes",
                port,
                def.buffer_count_actual,
                def.buffer_size
            );

            if def.enabled == 0 {
                log::info!("enabling {} port", port);
                if let Err(status) = component.send_command(Command::PortEnable(port)) {
                    log::warn!("failed to enable {} port: {}", port, status);
                }
            }
        }

        log::info!(
            "configured {}x{} (stride {}) {:?} at {} fps",
            params.width,
            params.height,
            params.stride,
            params.pixel_format,
            fps
        );
        *lock(&self.params) = params;

        Ok(())
    }

    /// Sets a video parameter. Once width, height and pixel format are all known, the
    /// parameters are negotiated with the component.
    ///
    /// Read-only tags are ignored. A value of the wrong type is rejected.
    pub fn set_parameter(&self, tag: Tag, value: TagValue) -> CodecResult<()> {
        let complete = {
            let mut params = lock(&self.params);
            match (tag, value) {
                (Tag::VideoWidth, TagValue::U32(width)) => {
                    params.stride = stride_for(width)?;
                    params.width = width;
                }
                (Tag::VideoHeight, TagValue::U32(height)) => params.height = height,
                (Tag::VideoPixelFormat, TagValue::PixelFormat(format)) => {
                    params.pixel_format = format
                }
                (Tag::VideoFrameRate, TagValue::U32(fps)) => params.frame_rate = fps,
                (
                    Tag::RequiredOutBufferCount
                    | Tag::RequiredOutBufferSize
                    | Tag::RequiredInBufferCount
                    | Tag::RequiredInBufferSize,
                    _,
                ) => {
                    log::warn!("ignoring read-only tag {:?}", tag);
                    return Ok(());
                }
                (tag, value) => {
                    return Err(CodecError::InvalidParameter(format!(
                        "invalid value {:?} for tag {:?}",
                        value, tag
                    )))
                }
            }
            params.is_complete()
        };

        if complete && self.core.component().is_some() {
            self.negotiate()?;
        }

        Ok(())
    }

    pub fn get_parameter(&self, tag: Tag) -> TagValue {
        let params = lock(&self.params);
        match tag {
            Tag::VideoWidth => TagValue::U32(params.width),
            Tag::VideoHeight => TagValue::U32(params.height),
            Tag::VideoPixelFormat => TagValue::PixelFormat(params.pixel_format),
            Tag::VideoFrameRate => TagValue::U32(params.frame_rate),
            Tag::RequiredOutBufferCount => TagValue::U32(params.out_buffer_count),
            Tag::RequiredOutBufferSize => TagValue::U32(params.out_buffer_size),
            Tag::RequiredInBufferCount => TagValue::U32(params.in_buffer_count),
            Tag::RequiredInBufferSize => TagValue::U32(params.in_buffer_size),
        }
    }

    /// Moves the component to Idle and registers its buffers.
    ///
    /// Output slots are bound to buffers donated with `queue_output_buffer` beforehand: the
    /// pipeline must donate at least the `RequiredOutBufferCount` before calling this method.
    pub fn prepare(&self) -> CodecResult<()> {
        let component = self.component()?;
        let params = *lock(&self.params);
        let core = &self.core;

        core.supply.set_active(true);
        core.initial_fill_done.store(false, Ordering::Release);
        core.state.request(&*component, HardwareState::Idle)?;

        let res = core
            .slots
            .allocate_input_slots(
                &*component,
                &*self.allocator,
                &core.input_pool,
                params.in_buffer_count,
                params.in_buffer_size,
            )
            .and_then(|()| {
                core.slots.allocate_output_slots(
                    &*component,
                    &core.supply,
                    &core.output_pool,
                    params.out_buffer_count,
                    params.out_buffer_size,
                    self.config.state_wait_timeout,
                )
            });
        if let Err(e) = res {
            log::error!("failed to allocate buffers: {:#}", e);
            core.slots
                .release_all(&*component, &[&core.input_pool, &core.output_pool]);
            if let Err(e) = core.state.request(&*component, HardwareState::Loaded) {
                log::warn!("failed to return component to Loaded: {:#}", e);
            }
            return Err(e);
        }

        let state = component
            .get_state()
            .map_err(CodecError::device("get_state"))?;
        log::debug!("component in state {:?} after buffer registration", state);
        if state != HardwareState::Idle {
            core.state.wait_for(HardwareState::Idle)?;
        }

        Ok(())
    }

    /// Moves the component to Executing and submits every output slot.
    pub fn start(&self) -> CodecResult<()> {
        let component = self.component()?;
        let core = &self.core;

        core.state.request(&*component, HardwareState::Executing)?;
        core.state.wait_for(HardwareState::Executing)?;
        core.initial_fill()?;
        core.supply.set_active(true);
        core.fill_outputs();

        Ok(())
    }

    /// Drops every pending input frame and donated output buffer, and flushes the component.
    ///
    /// The component goes through Paused and back to Executing on its own: this method does not
    /// wait for it.
    pub fn flush(&self) -> CodecResult<()> {
        let component = self.component()?;
        let core = &self.core;

        // Pausing fails with `WrongState` while Executing is requested but not confirmed yet.
        let executing = core.state.current() == HardwareState::Executing
            || core.state.target() == HardwareState::Executing;
        if executing {
            core.state.request(&*component, HardwareState::Paused)?;
        }
        core.clear_queues();
        if !executing {
            log::debug!("not executing, nothing to flush in the component");
            return Ok(());
        }

        for port in [PortIndex::Input, PortIndex::Output] {
            component
                .send_command(Command::Flush(port))
                .map_err(CodecError::device("send_command"))?;
        }

        Ok(())
    }

    /// Brings the component back to Loaded, releasing every buffer, and forgets the video
    /// parameters. The component instance is kept.
    pub fn reset(&self) -> CodecResult<()> {
        let core = &self.core;

        core.supply.set_active(false);
        let res = match core.component() {
            Some(component) => {
                let res = self.teardown(&component);
                core.slots
                    .release_all(&*component, &[&core.input_pool, &core.output_pool]);
                res
            }
            None => Ok(()),
        };
        core.clear_queues();
        core.initial_fill_done.store(false, Ordering::Release);
        *lock(&self.params) = Default::default();
        core.supply.set_active(true);

        res
    }

    fn teardown(&self, component: &M::Component) -> CodecResult<()> {
        let state = &self.core.state;

        if state.current() == HardwareState::Paused {
            state.request(component, HardwareState::Executing)?;
            state.wait_for(HardwareState::Executing)?;
        }
        if state.current() == HardwareState::Executing {
            state.request(component, HardwareState::Idle)?;
            state.wait_for(HardwareState::Idle)?;
        }
        if state.current() != HardwareState::Idle {
            return Ok(());
        }

        state.request(component, HardwareState::Loaded)?;
        self.core
            .slots
            .release_all(component, &[&self.core.input_pool, &self.core.output_pool]);
        state.wait_for(HardwareState::Loaded)
    }

    /// Queues a compressed frame for decoding.
    ///
    /// Never blocks: frames wait in an unbounded queue until an input slot is available. The
    /// frame is handed back through [`CodecDataCallback::on_input_buffer_done`] once submitted.
    /// `_timeout_ms` is accepted for interface compatibility and ignored.
    pub fn queue_input_buffer(&self, frame: InputFrame, _timeout_ms: i32) -> CodecResult<()> {
        if frame.is_empty() && !frame.is_eos() {
            log::error!("rejecting empty input frame without EOS");
            return Err(CodecError::EmptyFrame);
        }

        self.core.pending().push_back(frame);
        self.core.drain_pending_input();

        Ok(())
    }

    /// Donates an empty output buffer.
    ///
    /// Waits up to `timeout_ms` for room in the supply queue: forever if negative, not at all if
    /// 0. Buffers donated before `start` are only used from `prepare` on.
    pub fn queue_output_buffer(&self, buffer: OutputBuffer, timeout_ms: i32) -> CodecResult<()> {
        let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
        self.core.supply.push(buffer, timeout).map_err(|e| match e {
            QueueError::Timeout(_) => CodecError::SupplyTimeout,
            QueueError::Inactive(_) => CodecError::NotActive,
        })?;
        self.core.fill_outputs();

        Ok(())
    }
}

impl<M: ComponentManager> Drop for CodecSession<M> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::error!("failed to destroy component of {}: {:#}", self.plugin_name, e);
        }
    }
}
