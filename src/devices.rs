// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Component implementations.
//!
//! The components in this module implement [`crate::ComponentManager`] and
//! [`crate::HardwareComponent`] entirely in software, and report back through
//! [`crate::ComponentCallbacks`] from a thread of their own like a hardware component would.
//!
//! [simple_component] implements a decoder that follows the component lifecycle faithfully but
//! does not decode anything. It can be used as a reference for how to write a transport, or as a
//! way to test a pipeline without any specific hardware.

#[cfg(feature = "simple-component")]
pub mod simple_component;
#[cfg(feature = "simple-component")]
pub use simple_component::SimpleComponentManager;
