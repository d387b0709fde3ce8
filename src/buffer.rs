// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffers exchanged between the calling pipeline and a [`crate::session::CodecSession`].
//!
//! Compressed input is handed over as [`InputFrame`]s whose bytes are copied into shared memory
//! owned by the session. Decoded output goes into [`OutputBuffer`]s backed by surfaces the
//! pipeline allocated: the session only borrows their [`SurfaceHandle`] for one fill cycle.

use std::os::fd::RawFd;
use std::sync::Arc;

use crate::protocol::BufferFlags;

bitflags::bitflags! {
    /// Flags attached to frames by the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        const EOS = 0x1;
        const KEY_FRAME = 0x2;
        const PARTIAL_FRAME = 0x4;
        const CODEC_DATA = 0x8;
    }
}

impl From<FrameFlags> for BufferFlags {
    fn from(flags: FrameFlags) -> Self {
        let mut res = BufferFlags::empty();
        if flags.contains(FrameFlags::EOS) {
            res |= BufferFlags::EOS;
        }
        if flags.contains(FrameFlags::KEY_FRAME) {
            res |= BufferFlags::SYNC_FRAME;
        }
        if flags.contains(FrameFlags::CODEC_DATA) {
            res |= BufferFlags::CODEC_CONFIG;
        }
        if !flags.contains(FrameFlags::PARTIAL_FRAME) {
            res |= BufferFlags::END_OF_FRAME;
        }
        res
    }
}

impl From<BufferFlags> for FrameFlags {
    fn from(flags: BufferFlags) -> Self {
        let mut res = FrameFlags::empty();
        if flags.contains(BufferFlags::EOS) {
            res |= FrameFlags::EOS;
        }
        if flags.contains(BufferFlags::SYNC_FRAME) {
            res |= FrameFlags::KEY_FRAME;
        }
        if flags.contains(BufferFlags::CODEC_CONFIG) {
            res |= FrameFlags::CODEC_DATA;
        }
        res
    }
}

/// A compressed frame queued by the pipeline.
///
/// The frame is returned to the pipeline through
/// [`crate::session::CodecDataCallback::on_input_buffer_done`] as soon as its bytes have been
/// copied and submitted to the component, not when the component has consumed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFrame {
    pub data: Vec<u8>,
    pub flags: FrameFlags,
    /// Presentation timestamp, in microseconds.
    pub pts: i64,
}

impl InputFrame {
    pub fn new(data: Vec<u8>, pts: i64) -> Self {
        Self {
            data,
            flags: FrameFlags::empty(),
            pts,
        }
    }

    /// Returns an empty frame signaling the end of the stream.
    pub fn eos(pts: i64) -> Self {
        Self {
            data: Vec::new(),
            flags: FrameFlags::EOS,
            pts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(FrameFlags::EOS)
    }
}

/// Description of an externally allocated surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceHandle {
    /// File descriptor of the surface memory. Owned by the allocator, never closed here.
    pub fd: RawFd,
    pub width: u32,
    pub stride: u32,
    pub height: u32,
    /// Size of the surface memory in bytes.
    pub size: u32,
    pub format: u32,
    pub reserve_fds: Vec<i32>,
    pub reserve_ints: Vec<i32>,
}

/// An empty output buffer donated by the pipeline, returned filled through
/// [`crate::session::CodecDataCallback::on_output_buffer_done`].
#[derive(Debug)]
pub struct OutputBuffer {
    handle: Arc<SurfaceHandle>,
    pub flags: FrameFlags,
    /// Presentation timestamp of the decoded frame, in microseconds.
    pub pts: i64,
    /// Number of bytes written by the component.
    pub filled_len: u32,
}

impl OutputBuffer {
    pub fn new(handle: Arc<SurfaceHandle>) -> Self {
        Self {
            handle,
            flags: FrameFlags::empty(),
            pts: 0,
            filled_len: 0,
        }
    }

    pub fn handle(&self) -> &Arc<SurfaceHandle> {
        &self.handle
    }
}
