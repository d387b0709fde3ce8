// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Test doubles for the component traits.
//!
//! [`RecordingComponent`] records every call made to it. When created through a
//! [`RecordingManager`] it also confirms commands from its own thread, like a real component
//! would, but leaves buffers with the test until it calls `complete_empty` or `complete_fill`.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::buffer::OutputBuffer;
use crate::buffer::SurfaceHandle;
use crate::protocol::*;
use crate::session::CodecCallback;
use crate::session::CodecDataCallback;
use crate::session::CodecEvent;
use crate::shm::NewSharedRegionError;
use crate::shm::SharedRegion;
use crate::shm::SharedRegionAllocator;
use crate::ComponentCallbacks;
use crate::ComponentManager;
use crate::HardwareComponent;

pub fn surface(fd: i32) -> Arc<SurfaceHandle> {
    Arc::new(SurfaceHandle {
        fd,
        width: 1920,
        stride: 1920,
        height: 1080,
        size: 1920 * 1080 * 3 / 2,
        format: ColorFormat::Yuv420SemiPlanar as u32,
        reserve_fds: Vec::new(),
        reserve_ints: Vec::new(),
    })
}

pub fn donation(fd: i32) -> OutputBuffer {
    OutputBuffer::new(surface(fd))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetParameter(ParamIndex),
    SetParameter(ParamIndex),
    Command(Command),
    UseBuffer(PortIndex, u32),
    FreeBuffer(PortIndex, u32),
    EmptyThisBuffer(u32),
    FillThisBuffer(u32),
}

struct Inner {
    calls: Mutex<Vec<Call>>,
    next_id: AtomicU32,
    /// Number of `use_buffer` calls allowed to succeed, unlimited if `None`.
    use_buffer_budget: Mutex<Option<usize>>,
    fail_commands: AtomicBool,
    fail_fills: AtomicBool,
    confirm_commands: AtomicBool,
    state: Mutex<HardwareState>,
    port_defs: Mutex<[PortDefinitionParam; 2]>,
    /// Buffers currently lent to us, with their descriptor.
    lent: Mutex<BTreeMap<u32, CodecBuffer>>,
    input_data: Mutex<Vec<(u32, BufferFlags)>>,
    callbacks: Mutex<Option<Arc<dyn ComponentCallbacks>>>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
}

/// Component recording calls. Clones share the same state.
#[derive(Clone)]
pub struct RecordingComponent(Arc<Inner>);

impl RecordingComponent {
    pub fn new() -> Self {
        let port_def = |port: PortIndex, count: u32, size: u32| PortDefinitionParam {
            port_index: port as u32,
            enabled: 1,
            buffer_count_actual: count,
            buffer_count_min: 1,
            buffer_size: size,
            ..PortDefinitionParam::for_port(Default::default(), port)
        };

        Self(Arc::new(Inner {
            calls: Default::default(),
            next_id: AtomicU32::new(1),
            use_buffer_budget: Default::default(),
            fail_commands: Default::default(),
            fail_fills: Default::default(),
            confirm_commands: AtomicBool::new(true),
            state: Mutex::new(HardwareState::Loaded),
            port_defs: Mutex::new([
                port_def(PortIndex::Input, 4, 4096),
                port_def(PortIndex::Output, 4, 0),
            ]),
            lent: Default::default(),
            input_data: Default::default(),
            callbacks: Default::default(),
            commands: Default::default(),
        }))
    }

    fn record(&self, call: Call) {
        self.0.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.0.calls.lock().unwrap().clear();
    }

    /// Ids submitted with `fill_this_buffer`, in order.
    pub fn fills(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::FillThisBuffer(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Ids submitted with `empty_this_buffer`, in order.
    pub fn empties(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::EmptyThisBuffer(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Filled length and flags of every input buffer submitted, in order.
    pub fn input_data(&self) -> Vec<(u32, BufferFlags)> {
        self.0.input_data.lock().unwrap().clone()
    }

    pub fn fail_use_buffer_after(&self, successes: usize) {
        *self.0.use_buffer_budget.lock().unwrap() = Some(successes);
    }

    pub fn fail_commands(&self, fail: bool) {
        self.0.fail_commands.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fills(&self, fail: bool) {
        self.0.fail_fills.store(fail, Ordering::SeqCst);
    }

    /// Stops confirming commands, so state waits time out.
    pub fn hold_commands(&self) {
        self.0.confirm_commands.store(false, Ordering::SeqCst);
    }

    /// Makes `use_buffer` hand out ids from 1 again.
    pub fn restart_buffer_ids(&self) {
        self.0.next_id.store(1, Ordering::SeqCst);
    }

    pub fn set_port_buffers(&self, port: PortIndex, count: u32, size: u32) {
        let mut defs = self.0.port_defs.lock().unwrap();
        defs[port as usize].buffer_count_actual = count;
        defs[port as usize].buffer_size = size;
    }

    pub fn disable_port(&self, port: PortIndex) {
        self.0.port_defs.lock().unwrap()[port as usize].enabled = 0;
    }

    pub fn port_def(&self, port: PortIndex) -> PortDefinitionParam {
        self.0.port_defs.lock().unwrap()[port as usize]
    }

    /// Starts confirming commands to `callbacks` from a dedicated thread.
    pub fn attach(&self, callbacks: Arc<dyn ComponentCallbacks>) {
        let (sender, receiver) = mpsc::channel::<Command>();
        *self.0.callbacks.lock().unwrap() = Some(Arc::clone(&callbacks));
        *self.0.commands.lock().unwrap() = Some(sender);

        let inner = Arc::downgrade(&self.0);
        thread::spawn(move || {
            while let Ok(command) = receiver.recv() {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if !inner.confirm_commands.load(Ordering::SeqCst) {
                    continue;
                }
                if let Command::StateSet(state) = command {
                    *inner.state.lock().unwrap() = state;
                }
                drop(inner);
                callbacks.on_event(ComponentEvent::CommandComplete {
                    command: command.kind() as u32,
                    data: command.data(),
                });
            }
        });
    }

    fn callbacks(&self) -> Arc<dyn ComponentCallbacks> {
        self.0
            .callbacks
            .lock()
            .unwrap()
            .clone()
            .expect("component not attached")
    }

    /// Returns input buffer `id` as if the component had consumed it.
    pub fn complete_empty(&self, id: u32) {
        let buffer = self.0.lent.lock().unwrap().remove(&id).unwrap();
        self.callbacks().on_empty_buffer_done(&buffer);
    }

    /// Returns output buffer `id` as if the component had decoded a frame into it.
    pub fn complete_fill(&self, id: u32, filled_len: u32, flags: BufferFlags, pts: i64) {
        let mut buffer = self.0.lent.lock().unwrap().remove(&id).unwrap();
        buffer.filled_len = filled_len;
        buffer.flags = flags;
        buffer.pts = pts;
        self.callbacks().on_fill_buffer_done(&buffer);
    }

    /// Delivers an empty completion for `buffer` without checking it was lent.
    pub fn complete_empty_raw(&self, buffer: &CodecBuffer) {
        self.callbacks().on_empty_buffer_done(buffer);
    }

    /// Delivers a fill completion for `buffer` without checking it was lent.
    pub fn complete_fill_raw(&self, buffer: &CodecBuffer) {
        self.callbacks().on_fill_buffer_done(buffer);
    }

    pub fn lent_ids(&self) -> Vec<u32> {
        self.0.lent.lock().unwrap().keys().copied().collect()
    }
}

impl HardwareComponent for RecordingComponent {
    fn get_version(&self) -> Result<ComponentVersion, i32> {
        Ok(ComponentVersion {
            major: 1,
            ..Default::default()
        })
    }

    fn get_parameter(&self, index: ParamIndex, data: &mut [u8]) -> Result<(), i32> {
        self.record(Call::GetParameter(index));
        match index {
            ParamIndex::PortDefinition => {
                let req = PortDefinitionParam::read_from(data).ok_or(libc::EINVAL)?;
                let port = PortIndex::n(req.port_index).ok_or(libc::EINVAL)?;
                let def = self.port_def(port);
                data.copy_from_slice(def.as_bytes());
                Ok(())
            }
            ParamIndex::VideoPortFormat => Ok(()),
            ParamIndex::UseBufferType => Err(libc::ENOTSUP),
        }
    }

    fn set_parameter(&self, index: ParamIndex, data: &[u8]) -> Result<(), i32> {
        self.record(Call::SetParameter(index));
        if index == ParamIndex::PortDefinition {
            let def = PortDefinitionParam::read_from(data).ok_or(libc::EINVAL)?;
            let port = PortIndex::n(def.port_index).ok_or(libc::EINVAL)?;
            let mut defs = self.0.port_defs.lock().unwrap();
            let stored = &mut defs[port as usize];
            stored.frame_width = def.frame_width;
            stored.frame_height = def.frame_height;
            stored.stride = def.stride;
            stored.slice_height = def.slice_height;
            stored.compression_format = def.compression_format;
            stored.color_format = def.color_format;
            if port == PortIndex::Output && stored.buffer_size == 0 {
                stored.buffer_size = def.stride as u32 * def.slice_height * 3 / 2;
            }
        }
        Ok(())
    }

    fn send_command(&self, command: Command) -> Result<(), i32> {
        if self.0.fail_commands.load(Ordering::SeqCst) {
            return Err(libc::EIO);
        }
        self.record(Call::Command(command));
        if let Command::PortEnable(port) = command {
            self.0.port_defs.lock().unwrap()[port as usize].enabled = 1;
        }
        if let Some(sender) = self.0.commands.lock().unwrap().as_ref() {
            let _ = sender.send(command);
        }
        Ok(())
    }

    fn get_state(&self) -> Result<HardwareState, i32> {
        Ok(*self.0.state.lock().unwrap())
    }

    fn use_buffer(&self, port: PortIndex, buffer: &mut CodecBuffer) -> Result<(), i32> {
        if let Some(budget) = self.0.use_buffer_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(libc::ENOMEM);
            }
            *budget -= 1;
        }
        buffer.buffer_id = self.0.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(Call::UseBuffer(port, buffer.buffer_id));
        Ok(())
    }

    fn free_buffer(&self, port: PortIndex, buffer: &CodecBuffer) -> Result<(), i32> {
        self.record(Call::FreeBuffer(port, buffer.buffer_id));
        self.0.lent.lock().unwrap().remove(&buffer.buffer_id);
        Ok(())
    }

    fn empty_this_buffer(&self, buffer: &CodecBuffer) -> Result<(), i32> {
        self.record(Call::EmptyThisBuffer(buffer.buffer_id));
        self.0
            .input_data
            .lock()
            .unwrap()
            .push((buffer.filled_len, buffer.flags));
        self.0
            .lent
            .lock()
            .unwrap()
            .insert(buffer.buffer_id, buffer.clone());
        Ok(())
    }

    fn fill_this_buffer(&self, buffer: &CodecBuffer) -> Result<(), i32> {
        if self.0.fail_fills.load(Ordering::SeqCst) {
            return Err(libc::EIO);
        }
        self.record(Call::FillThisBuffer(buffer.buffer_id));
        self.0
            .lent
            .lock()
            .unwrap()
            .insert(buffer.buffer_id, buffer.clone());
        Ok(())
    }
}

/// Manager handing out a single [`RecordingComponent`], reachable by tests through
/// [`RecordingManager::component`].
pub struct RecordingManager {
    component: RecordingComponent,
    capabilities: Vec<ComponentCapability>,
    destroyed: Mutex<Vec<u32>>,
    created: AtomicUsize,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self {
            component: RecordingComponent::new(),
            capabilities: vec![ComponentCapability {
                name: "OMX.test.video_decoder.avc".into(),
                kind: CodecKind::VideoDecoder,
                role: ComponentRole::VideoAvc,
                color_formats: vec![ColorFormat::Yuv420SemiPlanar as u32],
            }],
            destroyed: Default::default(),
            created: Default::default(),
        }
    }

    pub fn component(&self) -> RecordingComponent {
        self.component.clone()
    }

    pub fn destroyed(&self) -> Vec<u32> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ComponentManager for RecordingManager {
    type Component = RecordingComponent;

    fn capabilities(&self) -> Vec<ComponentCapability> {
        self.capabilities.clone()
    }

    fn create_component(
        &self,
        name: &str,
        callbacks: Arc<dyn ComponentCallbacks>,
    ) -> anyhow::Result<(u32, RecordingComponent)> {
        if !self.capabilities.iter().any(|c| c.name == name) {
            anyhow::bail!("no component named {}", name);
        }
        self.component.attach(callbacks);
        let id = self.created.fetch_add(1, Ordering::SeqCst) as u32 + 7;
        Ok((id, self.component.clone()))
    }

    fn destroy_component(&self, id: u32) -> Result<(), i32> {
        self.destroyed.lock().unwrap().push(id);
        Ok(())
    }
}

/// Allocator failing after a given number of successful allocations.
pub struct FailingAllocator {
    remaining: AtomicUsize,
}

impl FailingAllocator {
    pub fn new(successes: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(successes),
        }
    }
}

impl SharedRegionAllocator for FailingAllocator {
    fn allocate(&self, size: u64) -> Result<SharedRegion, NewSharedRegionError> {
        match self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
        {
            Ok(_) => SharedRegion::new(size),
            Err(_) => Err(NewSharedRegionError::FailedToCreate(nix::errno::Errno::ENOMEM)),
        }
    }
}

/// Records everything the session reports to the pipeline.
#[derive(Default)]
pub struct RecordingPipeline {
    pub events: Mutex<Vec<CodecEvent>>,
    pub inputs: Mutex<Vec<crate::buffer::InputFrame>>,
    pub outputs: Mutex<Vec<OutputBuffer>>,
}

impl RecordingPipeline {
    pub fn input_pts(&self) -> Vec<i64> {
        self.inputs.lock().unwrap().iter().map(|f| f.pts).collect()
    }

    pub fn output_fds(&self) -> Vec<i32> {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.handle().fd)
            .collect()
    }
}

impl CodecCallback for RecordingPipeline {
    fn on_event(&self, event: CodecEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl CodecDataCallback for RecordingPipeline {
    fn on_input_buffer_done(&self, frame: crate::buffer::InputFrame) {
        self.inputs.lock().unwrap().push(frame);
    }

    fn on_output_buffer_done(&self, buffer: OutputBuffer) {
        self.outputs.lock().unwrap().push(buffer);
    }
}
