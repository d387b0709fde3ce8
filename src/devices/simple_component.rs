// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Simple software decoder component with no hardware dependency.
//!
//! This module illustrates how to implement the component traits. The component follows the
//! lifecycle of a hardware decoder: it only reaches Idle once all its buffers are registered, only
//! goes back to Loaded once they are all freed, holds buffers while Paused and returns them on
//! flush. Every frame submitted on the input port produces one frame of the configured size on the
//! output port, carrying the timestamp and flags of the input, but no pixel data is written.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;

use anyhow::Context;
use nix::errno::Errno;
use nix::sys::uio::pread;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::protocol::*;
use crate::ComponentCallbacks;
use crate::ComponentManager;
use crate::HardwareComponent;

/// Name of the only component offered by [`SimpleComponentManager`].
pub const COMPONENT_NAME: &str = "OMX.simple.video_decoder.avc";

const VERSION: ComponentVersion = ComponentVersion {
    major: 1,
    minor: 1,
    revision: 0,
    step: 0,
};

const INPUT_BUFFER_COUNT: u32 = 4;
const INPUT_BUFFER_SIZE: u32 = 1 << 20;
const OUTPUT_BUFFER_COUNT: u32 = 6;
const MIN_BUFFER_COUNT: u32 = 2;
const DEFAULT_WIDTH: u32 = 176;
const DEFAULT_HEIGHT: u32 = 144;
const DEFAULT_FRAME_RATE: u32 = 30 << 16;

/// Size of a decoded frame, or `None` if the colour format is not supported.
fn frame_size(color_format: u32, stride: u32, slice_height: u32) -> Option<u32> {
    let pixels = stride.checked_mul(slice_height)?;
    match ColorFormat::n(color_format)? {
        ColorFormat::Yuv420Planar | ColorFormat::Yuv420SemiPlanar => {
            pixels.checked_mul(3).map(|size| size / 2)
        }
        ColorFormat::Argb8888 => pixels.checked_mul(4),
        ColorFormat::Unused => None,
    }
}

fn read_param<P: FromBytes>(data: &[u8]) -> Result<P, i32> {
    P::read_from(data).ok_or(libc::EINVAL)
}

fn write_param<P: AsBytes>(param: &P, data: &mut [u8]) -> Result<(), i32> {
    param.write_to(data).ok_or(libc::EINVAL)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configuration and buffers of a component, shared between its handle and its worker thread.
struct Ports {
    state: HardwareState,
    defs: [PortDefinitionParam; 2],
    formats: [VideoPortFormatParam; 2],
    /// [`BufferType`] of each port.
    buffer_types: [u32; 2],
    /// Port of every registered buffer.
    buffers: BTreeMap<u32, PortIndex>,
    next_buffer_id: u32,
}

impl Ports {
    fn new() -> Self {
        let input = PortDefinitionParam {
            enabled: 1,
            buffer_count_actual: INPUT_BUFFER_COUNT,
            buffer_count_min: MIN_BUFFER_COUNT,
            buffer_size: INPUT_BUFFER_SIZE,
            frame_width: DEFAULT_WIDTH,
            frame_height: DEFAULT_HEIGHT,
            stride: DEFAULT_WIDTH as i32,
            slice_height: DEFAULT_HEIGHT,
            compression_format: CompressionFormat::Avc as u32,
            ..PortDefinitionParam::for_port(VERSION, PortIndex::Input)
        };
        let output = PortDefinitionParam {
            enabled: 1,
            buffer_count_actual: OUTPUT_BUFFER_COUNT,
            buffer_count_min: MIN_BUFFER_COUNT,
            buffer_size: DEFAULT_WIDTH * DEFAULT_HEIGHT * 3 / 2,
            frame_width: DEFAULT_WIDTH,
            frame_height: DEFAULT_HEIGHT,
            stride: DEFAULT_WIDTH as i32,
            slice_height: DEFAULT_HEIGHT,
            color_format: ColorFormat::Yuv420SemiPlanar as u32,
            ..PortDefinitionParam::for_port(VERSION, PortIndex::Output)
        };

        Self {
            state: HardwareState::Loaded,
            defs: [input, output],
            formats: [
                VideoPortFormatParam {
                    compression_format: CompressionFormat::Avc as u32,
                    frame_rate: DEFAULT_FRAME_RATE,
                    ..VideoPortFormatParam::for_port(VERSION, PortIndex::Input)
                },
                VideoPortFormatParam {
                    color_format: ColorFormat::Yuv420SemiPlanar as u32,
                    frame_rate: DEFAULT_FRAME_RATE,
                    ..VideoPortFormatParam::for_port(VERSION, PortIndex::Output)
                },
            ],
            buffer_types: [BufferType::SharedMemoryFd as u32; 2],
            buffers: Default::default(),
            next_buffer_id: 1,
        }
    }

    fn registered(&self, port: PortIndex) -> u32 {
        self.buffers.values().filter(|&&p| p == port).count() as u32
    }

    /// Whether every enabled port has all its buffers registered.
    fn populated(&self) -> bool {
        [PortIndex::Input, PortIndex::Output].into_iter().all(|port| {
            let def = &self.defs[port as usize];
            def.enabled == 0 || self.registered(port) >= def.buffer_count_actual
        })
    }

    fn set_port_definition(&mut self, def: &PortDefinitionParam) -> Result<(), i32> {
        let port = PortIndex::n(def.port_index).ok_or(libc::EINVAL)?;
        let stored = &self.defs[port as usize];
        if self.state != HardwareState::Loaded && stored.enabled != 0 {
            log::error!("cannot reconfigure enabled {} port in state {:?}", port, self.state);
            return Err(libc::EBUSY);
        }
        if def.frame_width == 0 || def.frame_height == 0 {
            return Err(libc::EINVAL);
        }
        if def.buffer_count_actual < stored.buffer_count_min {
            return Err(libc::EINVAL);
        }

        let stride = match def.stride {
            stride if stride > 0 => stride as u32,
            _ => def.frame_width,
        };
        let slice_height = def.slice_height.max(def.frame_height);
        let buffer_size = match port {
            PortIndex::Input => {
                if def.compression_format != CompressionFormat::Avc as u32 {
                    log::error!("unsupported compression format {}", def.compression_format);
                    return Err(libc::EINVAL);
                }
                stored.buffer_size
            }
            PortIndex::Output => match frame_size(def.color_format, stride, slice_height) {
                Some(size) => size,
                None => {
                    log::error!("unsupported colour format {}", def.color_format);
                    return Err(libc::EINVAL);
                }
            },
        };

        let stored = &mut self.defs[port as usize];
        stored.buffer_count_actual = def.buffer_count_actual;
        stored.buffer_size = buffer_size;
        stored.frame_width = def.frame_width;
        stored.frame_height = def.frame_height;
        stored.stride = stride as i32;
        stored.slice_height = slice_height;
        stored.compression_format = def.compression_format;
        stored.color_format = def.color_format;

        Ok(())
    }

    /// Checks that `buffer` can be submitted on `port`.
    fn check_submission(&self, port: PortIndex, buffer: &CodecBuffer) -> Result<(), i32> {
        if self.buffers.get(&buffer.buffer_id) != Some(&port) {
            log::error!("{} buffer {} is not registered", port, buffer.buffer_id);
            return Err(libc::EINVAL);
        }
        match self.state {
            HardwareState::Idle | HardwareState::Executing | HardwareState::Paused => Ok(()),
            state => {
                log::error!("cannot accept buffers in state {:?}", state);
                Err(libc::EINVAL)
            }
        }
    }
}

/// Messages processed by the worker thread of a component.
enum Message {
    Command(Command),
    Empty(CodecBuffer),
    Fill(CodecBuffer),
    /// A buffer has been registered or freed.
    BuffersChanged,
    Shutdown,
}

/// Handle to an instance created by [`SimpleComponentManager`].
pub struct SimpleComponent {
    ports: Arc<Mutex<Ports>>,
    sender: mpsc::Sender<Message>,
}

impl SimpleComponent {
    fn lock(&self) -> MutexGuard<'_, Ports> {
        lock(&self.ports)
    }

    fn send(&self, message: Message) -> Result<(), i32> {
        self.sender.send(message).map_err(|_| {
            log::error!("component worker is gone");
            libc::EPIPE
        })
    }
}

impl HardwareComponent for SimpleComponent {
    fn get_version(&self) -> Result<ComponentVersion, i32> {
        Ok(VERSION)
    }

    fn get_parameter(&self, index: ParamIndex, data: &mut [u8]) -> Result<(), i32> {
        let ports = self.lock();
        match index {
            ParamIndex::PortDefinition => {
                let req: PortDefinitionParam = read_param(data)?;
                let port = PortIndex::n(req.port_index).ok_or(libc::EINVAL)?;
                write_param(&ports.defs[port as usize], data)
            }
            ParamIndex::VideoPortFormat => {
                let req: VideoPortFormatParam = read_param(data)?;
                let port = PortIndex::n(req.port_index).ok_or(libc::EINVAL)?;
                write_param(&ports.formats[port as usize], data)
            }
            ParamIndex::UseBufferType => {
                let mut req: UseBufferTypeParam = read_param(data)?;
                let port = PortIndex::n(req.port_index).ok_or(libc::EINVAL)?;
                req.buffer_type = ports.buffer_types[port as usize];
                write_param(&req, data)
            }
        }
    }

    fn set_parameter(&self, index: ParamIndex, data: &[u8]) -> Result<(), i32> {
        let mut ports = self.lock();
        match index {
            ParamIndex::PortDefinition => ports.set_port_definition(&read_param(data)?),
            ParamIndex::VideoPortFormat => {
                let format: VideoPortFormatParam = read_param(data)?;
                let port = PortIndex::n(format.port_index).ok_or(libc::EINVAL)?;
                if port == PortIndex::Input
                    && format.compression_format != CompressionFormat::Avc as u32
                {
                    return Err(libc::EINVAL);
                }
                ports.formats[port as usize] = format;
                Ok(())
            }
            ParamIndex::UseBufferType => {
                let param: UseBufferTypeParam = read_param(data)?;
                let port = PortIndex::n(param.port_index).ok_or(libc::EINVAL)?;
                match (port, BufferType::n(param.buffer_type)) {
                    (_, Some(BufferType::SharedMemoryFd))
                    | (PortIndex::Output, Some(BufferType::Handle)) => {
                        ports.buffer_types[port as usize] = param.buffer_type;
                        Ok(())
                    }
                    _ => Err(libc::ENOTSUP),
                }
            }
        }
    }

    fn send_command(&self, command: Command) -> Result<(), i32> {
        self.send(Message::Command(command))
    }

    fn get_state(&self) -> Result<HardwareState, i32> {
        Ok(self.lock().state)
    }

    fn use_buffer(&self, port: PortIndex, buffer: &mut CodecBuffer) -> Result<(), i32> {
        {
            let mut ports = self.lock();
            if buffer.alloc_len < ports.defs[port as usize].buffer_size {
                log::error!(
                    "{} buffer of {} bytes is too small, {} needed",
                    port,
                    buffer.alloc_len,
                    ports.defs[port as usize].buffer_size
                );
                return Err(libc::EINVAL);
            }
            let buffer_type = BufferType::n(ports.buffer_types[port as usize]);
            match (&buffer.kind, buffer_type) {
                (BufferKind::SharedMemory { .. }, Some(BufferType::SharedMemoryFd))
                | (BufferKind::Handle(Some(_)), Some(BufferType::Handle)) => (),
                _ => {
                    log::error!(
                        "{} buffer does not match port buffer type {:?}",
                        port,
                        buffer_type
                    );
                    return Err(libc::EINVAL);
                }
            }

            buffer.buffer_id = ports.next_buffer_id;
            ports.next_buffer_id += 1;
            ports.buffers.insert(buffer.buffer_id, port);
        }

        self.send(Message::BuffersChanged)
    }

    fn free_buffer(&self, port: PortIndex, buffer: &CodecBuffer) -> Result<(), i32> {
        {
            let mut ports = self.lock();
            if ports.buffers.get(&buffer.buffer_id) != Some(&port) {
                return Err(libc::EINVAL);
            }
            ports.buffers.remove(&buffer.buffer_id);
        }

        self.send(Message::BuffersChanged)
    }

    fn empty_this_buffer(&self, buffer: &CodecBuffer) -> Result<(), i32> {
        self.lock().check_submission(PortIndex::Input, buffer)?;
        self.send(Message::Empty(buffer.clone()))
    }

    fn fill_this_buffer(&self, buffer: &CodecBuffer) -> Result<(), i32> {
        self.lock().check_submission(PortIndex::Output, buffer)?;
        if !matches!(buffer.kind, BufferKind::Handle(Some(_))) {
            return Err(libc::EINVAL);
        }
        self.send(Message::Fill(buffer.clone()))
    }
}

/// Reads the valid bytes of an input buffer.
///
/// Must be called with the ports lock held, which guarantees that the buffer is not freed
/// concurrently.
fn read_input(ports: &Ports, input: &CodecBuffer) -> Result<Vec<u8>, Errno> {
    if !ports.buffers.contains_key(&input.buffer_id) {
        return Err(Errno::EBADF);
    }
    let BufferKind::SharedMemory { fd, .. } = input.kind else {
        return Err(Errno::EINVAL);
    };
    // SAFETY: the session keeps the memory of an input buffer open until it has freed it, and
    // freeing requires the lock held by our caller.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };

    let mut data = vec![0u8; input.filled_len as usize];
    let mut read = 0;
    while read < data.len() {
        let offset = input.offset as usize + read;
        match pread(fd, &mut data[read..], offset as libc::off_t)? {
            0 => return Err(Errno::EIO),
            len => read += len,
        }
    }

    Ok(data)
}

/// Thread delivering command completions and decoded frames.
struct Worker {
    ports: Arc<Mutex<Ports>>,
    callbacks: Arc<dyn ComponentCallbacks>,
    /// State change waiting for buffers to be registered or freed.
    pending: Option<HardwareState>,
    inputs: VecDeque<CodecBuffer>,
    outputs: VecDeque<CodecBuffer>,
}

impl Worker {
    fn run(mut self, receiver: mpsc::Receiver<Message>) {
        while let Ok(message) = receiver.recv() {
            match message {
                Message::Command(command) => self.handle_command(command),
                Message::Empty(buffer) => self.inputs.push_back(buffer),
                Message::Fill(buffer) => self.outputs.push_back(buffer),
                Message::BuffersChanged => self.complete_pending(),
                Message::Shutdown => break,
            }
            self.process();
        }
        log::debug!("simple component worker exiting");
    }

    fn state(&self) -> HardwareState {
        lock(&self.ports).state
    }

    fn complete(&self, command: Command) {
        self.callbacks.on_event(ComponentEvent::CommandComplete {
            command: command.kind() as u32,
            data: command.data(),
        });
    }

    fn set_state(&mut self, state: HardwareState) {
        lock(&self.ports).state = state;
        self.complete(Command::StateSet(state));
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StateSet(target) => self.change_state(target),
            Command::Flush(port) => {
                self.return_buffers(port);
                self.complete(command);
            }
            Command::PortEnable(port) => {
                lock(&self.ports).defs[port as usize].enabled = 1;
                self.complete(command);
            }
            Command::PortDisable(port) => {
                lock(&self.ports).defs[port as usize].enabled = 0;
                self.return_buffers(port);
                self.complete(command);
            }
        }
    }

    fn change_state(&mut self, target: HardwareState) {
        let current = self.state();
        if self.pending.take().is_some() && target == current {
            log::debug!("state change cancelled, staying in {:?}", current);
            self.complete(Command::StateSet(current));
            return;
        }
        if !current.can_transition_to(target) {
            log::error!("invalid state transition from {:?} to {:?}", current, target);
            self.callbacks.on_event(ComponentEvent::Error(libc::EINVAL));
            return;
        }

        match (current, target) {
            (HardwareState::Loaded, HardwareState::Idle)
            | (HardwareState::Idle, HardwareState::Loaded) => {
                self.pending = Some(target);
                self.complete_pending();
            }
            (HardwareState::Executing, HardwareState::Idle) => {
                self.return_buffers(PortIndex::Input);
                self.return_buffers(PortIndex::Output);
                self.set_state(target);
            }
            _ => self.set_state(target),
        }
    }

    /// Completes the pending state change if the buffers it waits for are registered or freed.
    fn complete_pending(&mut self) {
        let Some(target) = self.pending else {
            return;
        };
        let ready = {
            let ports = lock(&self.ports);
            match target {
                HardwareState::Idle => ports.populated(),
                _ => ports.buffers.is_empty(),
            }
        };
        if ready {
            self.pending = None;
            self.set_state(target);
        }
    }

    /// Returns every buffer held on `port` without processing it.
    fn return_buffers(&mut self, port: PortIndex) {
        match port {
            PortIndex::Input => {
                for mut buffer in std::mem::take(&mut self.inputs) {
                    buffer.filled_len = 0;
                    self.callbacks.on_empty_buffer_done(&buffer);
                }
            }
            PortIndex::Output => {
                for mut buffer in std::mem::take(&mut self.outputs) {
                    buffer.filled_len = 0;
                    buffer.flags = BufferFlags::empty();
                    self.callbacks.on_fill_buffer_done(&buffer);
                }
            }
        }
    }

    /// Decodes held input buffers for as long as output buffers are available.
    fn process(&mut self) {
        if self.state() != HardwareState::Executing {
            return;
        }

        while let Some(input) = self.inputs.front() {
            let produces_frame = input.flags.contains(BufferFlags::EOS)
                || (input.filled_len > 0 && !input.flags.contains(BufferFlags::CODEC_CONFIG));
            if produces_frame && self.outputs.is_empty() {
                break;
            }
            let Some(input) = self.inputs.pop_front() else {
                break;
            };
            let output = if produces_frame {
                self.outputs.pop_front()
            } else {
                None
            };
            self.decode(input, output);
        }
    }

    fn decode(&mut self, mut input: CodecBuffer, output: Option<CodecBuffer>) {
        let (data, frame_size) = {
            let ports = lock(&self.ports);
            (
                read_input(&ports, &input),
                ports.defs[PortIndex::Output as usize].buffer_size,
            )
        };
        let decoded = match data {
            Ok(data) => {
                log::debug!("consumed {} bytes (pts {})", data.len(), input.pts);
                !data.is_empty() && !input.flags.contains(BufferFlags::CODEC_CONFIG)
            }
            Err(e) => {
                log::error!("failed to read input buffer {}: {:#}", input.buffer_id, e);
                self.callbacks.on_event(ComponentEvent::Error(e as i32));
                false
            }
        };

        let flags = input.flags;
        let pts = input.pts;
        input.filled_len = 0;
        self.callbacks.on_empty_buffer_done(&input);

        if let Some(mut output) = output {
            output.offset = 0;
            output.filled_len = if decoded {
                frame_size.min(output.alloc_len)
            } else {
                0
            };
            output.pts = pts;
            output.flags =
                BufferFlags::END_OF_FRAME | (flags & (BufferFlags::EOS | BufferFlags::SYNC_FRAME));
            self.callbacks.on_fill_buffer_done(&output);
        }
    }
}

/// Manager offering a single software AVC decoder, [`COMPONENT_NAME`].
pub struct SimpleComponentManager {
    next_id: AtomicU32,
    /// Channels to the worker of every live instance.
    instances: Mutex<BTreeMap<u32, mpsc::Sender<Message>>>,
}

impl SimpleComponentManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            instances: Default::default(),
        }
    }
}

impl Default for SimpleComponentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentManager for SimpleComponentManager {
    type Component = SimpleComponent;

    fn capabilities(&self) -> Vec<ComponentCapability> {
        vec![ComponentCapability {
            name: COMPONENT_NAME.into(),
            kind: CodecKind::VideoDecoder,
            role: ComponentRole::VideoAvc,
            color_formats: vec![
                ColorFormat::Yuv420SemiPlanar as u32,
                ColorFormat::Yuv420Planar as u32,
                0,
            ],
        }]
    }

    fn create_component(
        &self,
        name: &str,
        callbacks: Arc<dyn ComponentCallbacks>,
    ) -> anyhow::Result<(u32, SimpleComponent)> {
        if name != COMPONENT_NAME {
            anyhow::bail!("no component named {}", name);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ports = Arc::new(Mutex::new(Ports::new()));
        let (sender, receiver) = mpsc::channel();
        let worker = Worker {
            ports: Arc::clone(&ports),
            callbacks,
            pending: None,
            inputs: Default::default(),
            outputs: Default::default(),
        };
        thread::Builder::new()
            .name(format!("simple-component-{}", id))
            .spawn(move || worker.run(receiver))
            .context("failed to spawn component thread")?;

        lock(&self.instances).insert(id, sender.clone());
        log::info!("created {} instance {}", name, id);

        Ok((id, SimpleComponent { ports, sender }))
    }

    fn destroy_component(&self, id: u32) -> Result<(), i32> {
        let sender = lock(&self.instances).remove(&id).ok_or(libc::EINVAL)?;
        // The worker may already be gone if every handle was dropped.
        let _ = sender.send(Message::Shutdown);
        log::info!("destroyed instance {}", id);

        Ok(())
    }
}
