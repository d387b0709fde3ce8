// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate drives hardware video decoder components on behalf of a media pipeline.
//!
//! A component is reached through a transport that is outside the scope of this crate, and is
//! modeled by a handful of traits. Supporting a new transport means implementing them; every
//! session then runs on top of it unchanged.
//!
//! # Traits to implement by the transport
//!
//! * [`ComponentManager`] lists the capabilities of the available components and creates and
//!   destroys component instances.
//! * [`HardwareComponent`] is the synchronous side of one component instance: parameters,
//!   commands and buffer submission.
//! * [`ComponentCallbacks`] is the asynchronous side. The transport invokes it from the
//!   component's own thread whenever a command completes or a buffer is returned.
//!
//! # Anatomy of a session
//!
//! A [`session::CodecSession`] owns one component instance and walks it through its lifecycle
//! (Loaded, Idle, Executing, Paused). Compressed frames are copied into shared memory slots and
//! submitted in order; decoded frames are written into output buffers donated by the pipeline
//! and returned to it as soon as the component is done with them.
//!
//! [`registry`] turns the capabilities of a component manager into the codec definitions the
//! pipeline uses to pick and name sessions.
//!
//! The components currently in this crate are:
//!
//! * A software component that behaves like a hardware decoder without decoding anything, in the
//!   `crate::devices::simple_component` module.

pub mod buffer;
pub mod devices;
mod dispatcher;
pub mod error;
mod pipeline;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod session;
pub mod shm;
pub mod slots;
pub mod state;

#[cfg(test)]
mod mock;

use std::sync::Arc;

use zerocopy::AsBytes;

use protocol::*;

/// Synchronous interface to one instance of a hardware component.
///
/// Every method returns a `libc` error code on failure. Commands only return once they have been
/// accepted: their completion is reported later through [`ComponentCallbacks::on_event`].
///
/// Implementations must not invoke the [`ComponentCallbacks`] they have been created with from
/// within one of these methods.
pub trait HardwareComponent: Send + Sync + 'static {
    fn get_version(&self) -> Result<ComponentVersion, i32>;

    /// Fills `data` with the current value of parameter `index`. The port the parameter applies
    /// to is part of `data`.
    fn get_parameter(&self, index: ParamIndex, data: &mut [u8]) -> Result<(), i32>;
    /// Sets parameter `index` to the value in `data`.
    fn set_parameter(&self, index: ParamIndex, data: &[u8]) -> Result<(), i32>;

    fn send_command(&self, command: Command) -> Result<(), i32>;
    fn get_state(&self) -> Result<HardwareState, i32>;

    /// Registers `buffer` on `port`. On success, `buffer.buffer_id` is set to the identifier the
    /// component will use for it.
    fn use_buffer(&self, port: PortIndex, buffer: &mut CodecBuffer) -> Result<(), i32>;
    fn free_buffer(&self, port: PortIndex, buffer: &CodecBuffer) -> Result<(), i32>;

    /// Submits a filled input buffer. It is returned through
    /// [`ComponentCallbacks::on_empty_buffer_done`].
    fn empty_this_buffer(&self, buffer: &CodecBuffer) -> Result<(), i32>;
    /// Submits an empty output buffer. It is returned through
    /// [`ComponentCallbacks::on_fill_buffer_done`].
    fn fill_this_buffer(&self, buffer: &CodecBuffer) -> Result<(), i32>;

    /// Reads parameter `P` of `port`.
    fn get_param<P: ComponentParam>(
        &self,
        version: ComponentVersion,
        port: PortIndex,
    ) -> Result<P, i32>
    where
        Self: Sized,
    {
        let mut param = P::for_port(version, port);
        self.get_parameter(P::INDEX, param.as_bytes_mut())?;
        Ok(param)
    }

    fn set_param<P: ComponentParam>(&self, param: &P) -> Result<(), i32>
    where
        Self: Sized,
    {
        self.set_parameter(P::INDEX, param.as_bytes())
    }
}

/// Notifications sent by a component, from its own thread.
pub trait ComponentCallbacks: Send + Sync {
    fn on_event(&self, event: ComponentEvent);
    /// The component is done reading `buffer`, which can be reused.
    fn on_empty_buffer_done(&self, buffer: &CodecBuffer);
    /// The component has written a decoded frame into `buffer`.
    fn on_fill_buffer_done(&self, buffer: &CodecBuffer);
}

/// Trait for creating component instances.
pub trait ComponentManager: Send + Sync + 'static {
    type Component: HardwareComponent;

    fn capabilities(&self) -> Vec<ComponentCapability>;

    /// Creates an instance of component `name` reporting to `callbacks`.
    ///
    /// Returns the instance and the identifier to pass to `destroy_component`.
    fn create_component(
        &self,
        name: &str,
        callbacks: Arc<dyn ComponentCallbacks>,
    ) -> anyhow::Result<(u32, Self::Component)>;

    fn destroy_component(&self, id: u32) -> Result<(), i32>;
}
