// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

use crate::protocol::HardwareState;
use crate::protocol::PortIndex;
use crate::shm::NewSharedRegionError;

/// Broad classes of failures reported by a [`crate::session::CodecSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed an invalid argument.
    Parameter,
    /// A resource could not be obtained or negotiated.
    Resource,
    /// The component did not follow the expected lifecycle.
    Protocol,
    /// A call into the component failed.
    UnderlyingDevice,
    /// A bounded wait expired.
    Timeout,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame is empty and does not carry EOS")]
    EmptyFrame,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to allocate shared memory: {0}")]
    SharedMemory(#[from] NewSharedRegionError),
    #[error("{count} buffers requested but the {port} pool holds at most {capacity}")]
    PoolTooSmall {
        port: PortIndex,
        count: u32,
        capacity: usize,
    },
    #[error("no donated output buffer available for allocation")]
    NoDonation,
    #[error("no component instance")]
    NoComponent,
    #[error("failed to create component: {0:#}")]
    ComponentCreation(anyhow::Error),
    #[error("operation not allowed in state {0:?}")]
    WrongState(HardwareState),
    #[error("requested state {requested:?} but component confirmed {confirmed:?}")]
    StateMismatch {
        requested: HardwareState,
        confirmed: HardwareState,
    },
    #[error("timed out waiting for state {0:?}")]
    StateTimeout(HardwareState),
    #[error("timed out waiting for room in the output supply queue")]
    SupplyTimeout,
    #[error("session is being torn down")]
    NotActive,
    #[error("failed to negotiate {step}: status {status}")]
    Negotiation { step: &'static str, status: i32 },
    #[error("component call {call} failed with status {status}")]
    Device { call: &'static str, status: i32 },
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::EmptyFrame | CodecError::InvalidParameter(_) => ErrorKind::Parameter,
            CodecError::SharedMemory(_)
            | CodecError::PoolTooSmall { .. }
            | CodecError::NoDonation
            | CodecError::NoComponent
            | CodecError::ComponentCreation(_)
            | CodecError::NotActive
            | CodecError::Negotiation { .. } => ErrorKind::Resource,
            CodecError::WrongState(_) | CodecError::StateMismatch { .. } => ErrorKind::Protocol,
            CodecError::StateTimeout(_) | CodecError::SupplyTimeout => ErrorKind::Timeout,
            CodecError::Device { .. } => ErrorKind::UnderlyingDevice,
        }
    }

    /// Builds the error returned when the component call `call` fails with `status`.
    pub fn device(call: &'static str) -> impl FnOnce(i32) -> Self {
        move |status| CodecError::Device { call, status }
    }

    /// Builds the error returned when negotiation step `step` fails with `status`.
    pub fn negotiation(step: &'static str) -> impl FnOnce(i32) -> Self {
        move |status| CodecError::Negotiation { step, status }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;
