// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types exchanged with hardware codec components.
//!
//! Parameter structures are passed to [`crate::HardwareComponent::get_parameter`] and
//! [`crate::HardwareComponent::set_parameter`] as raw bytes, so they are `repr(C)` and derive the
//! `zerocopy` traits. Values received from the component's callbacks are plain `u32`s and decoded
//! into the enums of this module with [`enumn::N`].

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::buffer::SurfaceHandle;

/// Lifecycle state of a hardware component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum HardwareState {
    Invalid = 0,
    Loaded = 1,
    Idle = 2,
    Executing = 3,
    Paused = 4,
}

impl HardwareState {
    /// Returns whether moving directly from `self` to `target` is a valid lifecycle edge.
    pub fn can_transition_to(self, target: HardwareState) -> bool {
        use HardwareState::*;

        matches!(
            (self, target),
            (Loaded, Idle)
                | (Idle, Loaded)
                | (Idle, Executing)
                | (Executing, Idle)
                | (Executing, Paused)
                | (Paused, Executing)
        )
    }
}

/// Kind of a command sent to the component, as reported back in command-complete events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CommandKind {
    StateSet = 0,
    Flush = 1,
    PortDisable = 2,
    PortEnable = 3,
}

/// Ports of a decoder component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(u32)]
pub enum PortIndex {
    /// Compressed data port.
    Input = 0,
    /// Decoded frames port.
    Output = 1,
}

impl fmt::Display for PortIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortIndex::Input => f.write_str("input"),
            PortIndex::Output => f.write_str("output"),
        }
    }
}

/// Asynchronous commands accepted by [`crate::HardwareComponent::send_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StateSet(HardwareState),
    Flush(PortIndex),
    PortEnable(PortIndex),
    PortDisable(PortIndex),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::StateSet(_) => CommandKind::StateSet,
            Command::Flush(_) => CommandKind::Flush,
            Command::PortEnable(_) => CommandKind::PortEnable,
            Command::PortDisable(_) => CommandKind::PortDisable,
        }
    }

    /// Command argument, as echoed in the matching [`ComponentEvent::CommandComplete`].
    pub fn data(&self) -> u32 {
        match self {
            Command::StateSet(state) => *state as u32,
            Command::Flush(port) | Command::PortEnable(port) | Command::PortDisable(port) => {
                *port as u32
            }
        }
    }
}

/// Events delivered by the component's callback thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentEvent {
    /// A command sent with `send_command` has completed. `command` is a [`CommandKind`] and
    /// `data` its argument: the reached [`HardwareState`] for state changes, the [`PortIndex`]
    /// for port commands.
    CommandComplete { command: u32, data: u32 },
    /// The component hit an error. The value is a component status code.
    Error(i32),
}

bitflags::bitflags! {
    /// Flags carried by buffers exchanged with the component.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const EOS = 0x1;
        const END_OF_FRAME = 0x10;
        const SYNC_FRAME = 0x20;
        const CODEC_CONFIG = 0x80;
    }
}

/// How the memory of a [`CodecBuffer`] is passed to the component.
#[derive(Debug, Clone)]
pub enum BufferKind {
    /// Anonymous shared memory region owned by the session. The component maps it from `fd`.
    SharedMemory { fd: RawFd, read_only: bool },
    /// Externally allocated surface, bound for the duration of one fill cycle. `None` while no
    /// surface is bound.
    Handle(Option<Arc<SurfaceHandle>>),
}

/// Descriptor of a buffer registered with the component.
#[derive(Debug, Clone)]
pub struct CodecBuffer {
    /// Identifier assigned by the component at registration.
    pub buffer_id: u32,
    pub kind: BufferKind,
    /// Capacity of the buffer's memory.
    pub alloc_len: u32,
    /// Number of valid bytes, starting at `offset`.
    pub filled_len: u32,
    pub offset: u32,
    pub flags: BufferFlags,
    /// Presentation timestamp, in microseconds.
    pub pts: i64,
    /// Acquire fence, `-1` if none.
    pub fence_fd: i32,
}

impl CodecBuffer {
    /// Returns a descriptor for a not-yet-registered buffer of `alloc_len` bytes.
    pub fn new(kind: BufferKind, alloc_len: u32) -> Self {
        Self {
            buffer_id: 0,
            kind,
            alloc_len,
            filled_len: 0,
            offset: 0,
            flags: BufferFlags::empty(),
            pts: 0,
            fence_fd: -1,
        }
    }
}

/// Compression formats understood by the input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CompressionFormat {
    Unused = 0,
    Mpeg4 = 4,
    Avc = 7,
    Hevc = 11,
}

/// Colour formats produced by the output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ColorFormat {
    Unused = 0,
    Argb8888 = 16,
    Yuv420Planar = 19,
    Yuv420SemiPlanar = 21,
}

/// Memory representations a port can be configured to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum BufferType {
    Invalid = 0,
    VirtualAddr = 1,
    SharedMemoryFd = 2,
    Handle = 3,
    DynamicHandle = 4,
}

/// Parameter indices accepted by `get_parameter` and `set_parameter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ParamIndex {
    PortDefinition = 0x0200_0001,
    VideoPortFormat = 0x0600_0001,
    UseBufferType = 0x7f00_0001,
}

/// Version of a component, also stamped on every parameter structure.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct ComponentVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
    pub step: u8,
}

/// Trait for parameter structures, tying each one to its [`ParamIndex`].
pub trait ComponentParam: AsBytes + FromBytes + FromZeroes + Sized {
    const INDEX: ParamIndex;

    /// Returns a zeroed parameter with its size, version and port fields filled.
    fn for_port(version: ComponentVersion, port: PortIndex) -> Self;
}

/// Definition of a port: geometry, formats, and buffer requirements.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct PortDefinitionParam {
    pub size: u32,
    pub version: ComponentVersion,
    pub port_index: u32,
    /// Non-zero if the port is enabled.
    pub enabled: u32,
    pub buffer_count_actual: u32,
    pub buffer_count_min: u32,
    pub buffer_size: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub stride: i32,
    pub slice_height: u32,
    pub compression_format: u32,
    pub color_format: u32,
}

impl ComponentParam for PortDefinitionParam {
    const INDEX: ParamIndex = ParamIndex::PortDefinition;

    fn for_port(version: ComponentVersion, port: PortIndex) -> Self {
        Self {
            size: std::mem::size_of::<Self>() as u32,
            version,
            port_index: port as u32,
            ..Self::new_zeroed()
        }
    }
}

/// Video format of a port.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct VideoPortFormatParam {
    pub size: u32,
    pub version: ComponentVersion,
    pub port_index: u32,
    pub index: u32,
    pub compression_format: u32,
    pub color_format: u32,
    /// Frame rate in Q16 fixed point.
    pub frame_rate: u32,
}

impl ComponentParam for VideoPortFormatParam {
    const INDEX: ParamIndex = ParamIndex::VideoPortFormat;

    fn for_port(version: ComponentVersion, port: PortIndex) -> Self {
        Self {
            size: std::mem::size_of::<Self>() as u32,
            version,
            port_index: port as u32,
            ..Self::new_zeroed()
        }
    }
}

/// Memory representation used by a port, as a [`BufferType`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct UseBufferTypeParam {
    pub size: u32,
    pub version: ComponentVersion,
    pub port_index: u32,
    pub buffer_type: u32,
}

impl ComponentParam for UseBufferTypeParam {
    const INDEX: ParamIndex = ParamIndex::UseBufferType;

    fn for_port(version: ComponentVersion, port: PortIndex) -> Self {
        Self {
            size: std::mem::size_of::<Self>() as u32,
            version,
            port_index: port as u32,
            ..Self::new_zeroed()
        }
    }
}

/// Kind of codec a component implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    VideoDecoder,
    VideoEncoder,
    AudioDecoder,
    AudioEncoder,
}

/// Media role of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentRole {
    VideoAvc,
    VideoHevc,
    Unknown,
}

impl ComponentRole {
    /// Compression format the input port must be configured with for this role, if any.
    pub fn compression_format(self) -> Option<CompressionFormat> {
        match self {
            ComponentRole::VideoAvc => Some(CompressionFormat::Avc),
            ComponentRole::VideoHevc => Some(CompressionFormat::Hevc),
            ComponentRole::Unknown => None,
        }
    }
}

/// Capability of one component, as listed by [`crate::ComponentManager::capabilities`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentCapability {
    /// Component name, used to create instances.
    pub name: String,
    pub kind: CodecKind,
    pub role: ComponentRole,
    /// Raw [`ColorFormat`] values the output port can produce.
    pub color_formats: Vec<u32>,
}
