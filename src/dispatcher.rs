// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Routing of component notifications to the session they belong to.

use std::sync::Weak;

use crate::protocol::CodecBuffer;
use crate::protocol::CommandKind;
use crate::protocol::ComponentEvent;
use crate::protocol::HardwareState;
use crate::protocol::PortIndex;
use crate::session::CodecEvent;
use crate::session::SessionCore;
use crate::ComponentCallbacks;
use crate::HardwareComponent;

/// Callbacks given to a component when it is created.
///
/// Only holds a weak reference to the session, so notifications arriving after the session is
/// gone are dropped.
pub(crate) struct CallbackDispatcher<C> {
    core: Weak<SessionCore<C>>,
}

impl<C> CallbackDispatcher<C> {
    pub(crate) fn new(core: Weak<SessionCore<C>>) -> Self {
        Self { core }
    }
}

impl<C: HardwareComponent> CallbackDispatcher<C> {
    fn on_command_complete(&self, core: &SessionCore<C>, command: u32, data: u32) {
        match CommandKind::n(command) {
            Some(CommandKind::StateSet) => match HardwareState::n(data) {
                Some(state) => core.on_state_set(state),
                None => log::warn!("component reached unknown state {}", data),
            },
            Some(CommandKind::Flush) => match PortIndex::n(data) {
                Some(port) => core.on_flush_complete(port),
                None => log::warn!("flush completed on unknown port {}", data),
            },
            Some(kind @ (CommandKind::PortEnable | CommandKind::PortDisable)) => {
                log::info!("{:?} completed on port {}", kind, data)
            }
            None => log::warn!("unknown command {} completed (data {})", command, data),
        }
    }
}

impl<C: HardwareComponent> ComponentCallbacks for CallbackDispatcher<C> {
    fn on_event(&self, event: ComponentEvent) {
        let Some(core) = self.core.upgrade() else {
            log::debug!("dropping event {:?} for a closed session", event);
            return;
        };

        match event {
            ComponentEvent::CommandComplete { command, data } => {
                self.on_command_complete(&core, command, data)
            }
            ComponentEvent::Error(status) => {
                log::error!("component reported error {}", status);
                core.notify(CodecEvent::Error(status));
            }
        }
    }

    fn on_empty_buffer_done(&self, buffer: &CodecBuffer) {
        match self.core.upgrade() {
            Some(core) => core.reclaim_input(buffer),
            None => log::debug!("input buffer {} returned to a closed session", buffer.buffer_id),
        }
    }

    fn on_fill_buffer_done(&self, buffer: &CodecBuffer) {
        match self.core.upgrade() {
            Some(core) => core.complete_output(buffer),
            None => log::debug!("output buffer {} returned to a closed session", buffer.buffer_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mock::RecordingComponent;
    use crate::protocol::BufferKind;
    use crate::session::SessionConfig;

    fn core() -> Arc<SessionCore<RecordingComponent>> {
        let core = Arc::new(SessionCore::new(&SessionConfig::default()));
        core.state.reset(HardwareState::Loaded);
        core
    }

    #[test]
    fn state_confirmation() {
        let core = core();
        let dispatcher = CallbackDispatcher::new(Arc::downgrade(&core));

        dispatcher.on_event(ComponentEvent::CommandComplete {
            command: CommandKind::StateSet as u32,
            data: HardwareState::Idle as u32,
        });
        assert_eq!(core.state.current(), HardwareState::Idle);

        // Undecodable completions are ignored.
        dispatcher.on_event(ComponentEvent::CommandComplete {
            command: CommandKind::StateSet as u32,
            data: 42,
        });
        dispatcher.on_event(ComponentEvent::CommandComplete {
            command: 42,
            data: HardwareState::Loaded as u32,
        });
        assert_eq!(core.state.current(), HardwareState::Idle);
    }

    #[test]
    fn closed_session() {
        let core = core();
        let dispatcher = CallbackDispatcher::new(Arc::downgrade(&core));
        drop(core);

        let buffer = CodecBuffer::new(BufferKind::Handle(None), 0);
        dispatcher.on_event(ComponentEvent::Error(-1));
        dispatcher.on_empty_buffer_done(&buffer);
        dispatcher.on_fill_buffer_done(&buffer);
    }

    #[test]
    fn unknown_buffers_ignored() {
        let core = core();
        let dispatcher = CallbackDispatcher::new(Arc::downgrade(&core));

        let buffer = CodecBuffer {
            buffer_id: 3,
            ..CodecBuffer::new(BufferKind::Handle(None), 0)
        };
        dispatcher.on_empty_buffer_done(&buffer);
        dispatcher.on_fill_buffer_done(&buffer);
        assert!(core.input_pool.is_empty());
        assert!(core.output_pool.is_empty());
    }
}
