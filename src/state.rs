// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lifecycle state tracking of a component.
//!
//! State changes are requested synchronously but confirmed asynchronously, from the component's
//! callback thread. [`StateController`] records the requested target, lets callers block until a
//! confirmation arrives, and handles the automatic return to Executing after a flush.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use crate::error::CodecError;
use crate::error::CodecResult;
use crate::protocol::Command;
use crate::protocol::HardwareState;
use crate::HardwareComponent;

struct Transition {
    /// Last state confirmed by the component.
    current: HardwareState,
    /// Last state requested. Equal to `current` when no transition is outstanding.
    target: HardwareState,
    /// Confirmation received since the last request, if any.
    confirmed: Option<HardwareState>,
    /// A flush completed before the component confirmed Paused.
    resume_after_pause: bool,
}

pub struct StateController {
    transition: Mutex<Transition>,
    confirmed: Condvar,
    timeout: Option<Duration>,
}

impl StateController {
    /// Creates a controller waiting at most `timeout` for confirmations, or forever if `None`.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            transition: Mutex::new(Transition {
                current: HardwareState::Invalid,
                target: HardwareState::Invalid,
                confirmed: None,
                resume_after_pause: false,
            }),
            confirmed: Condvar::new(),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Transition> {
        self.transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> HardwareState {
        self.lock().current
    }

    pub fn target(&self) -> HardwareState {
        self.lock().target
    }

    /// Whether the component is Executing with no transition away from it requested.
    pub fn is_executing(&self) -> bool {
        let transition = self.lock();
        transition.current == HardwareState::Executing
            && transition.target == HardwareState::Executing
    }

    /// Forgets any outstanding transition and sets the current state to `state`.
    pub fn reset(&self, state: HardwareState) {
        let mut transition = self.lock();
        transition.current = state;
        transition.target = state;
        transition.confirmed = None;
        transition.resume_after_pause = false;
    }

    /// Asks `component` to move to `state`.
    ///
    /// Does nothing and returns `false` if `state` is already the requested target. A request
    /// made while another one is outstanding replaces the expected target.
    ///
    /// Fails with [`CodecError::WrongState`], without calling `component`, unless `state` can be
    /// reached directly from the current state. Requesting the current state cancels an
    /// outstanding transition.
    pub fn request<C: HardwareComponent>(
        &self,
        component: &C,
        state: HardwareState,
    ) -> CodecResult<bool> {
        let previous = {
            let mut transition = self.lock();
            if transition.target == state {
                log::debug!("state {:?} already requested", state);
                return Ok(false);
            }
            if state != transition.current && !transition.current.can_transition_to(state) {
                log::error!(
                    "cannot move from state {:?} to {:?}",
                    transition.current,
                    state
                );
                return Err(CodecError::WrongState(transition.current));
            }
            log::info!(
                "requesting state change from {:?} to {:?}",
                transition.target,
                state
            );
            transition.confirmed = None;
            std::mem::replace(&mut transition.target, state)
        };

        if let Err(status) = component.send_command(Command::StateSet(state)) {
            log::error!("failed to request state {:?}: {}", state, status);
            let mut transition = self.lock();
            if transition.target == state {
                transition.target = previous;
            }
            return Err(CodecError::Device {
                call: "send_command",
                status,
            });
        }

        Ok(true)
    }

    /// Blocks until the component confirms a state, and checks that it is `state`.
    ///
    /// Returns immediately if `state` is the current state.
    pub fn wait_for(&self, state: HardwareState) -> CodecResult<()> {
        let transition = self.lock();
        let pending = |t: &mut Transition| t.current != state && t.confirmed.is_none();

        let transition = match self.timeout {
            None => self
                .confirmed
                .wait_while(transition, pending)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                self.confirmed
                    .wait_timeout_while(transition, timeout, pending)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };

        if transition.current == state {
            return Ok(());
        }
        match transition.confirmed {
            Some(confirmed) => {
                log::error!(
                    "waited for state {:?} but component confirmed {:?}",
                    state,
                    confirmed
                );
                Err(CodecError::StateMismatch {
                    requested: state,
                    confirmed,
                })
            }
            None => {
                log::error!("timed out waiting for state {:?}", state);
                Err(CodecError::StateTimeout(state))
            }
        }
    }

    /// Records that the component reached `state` and wakes up waiters.
    ///
    /// Returns `true` if the component should now be asked to go back to Executing because a
    /// flush completed before it confirmed Paused.
    pub fn on_state_set(&self, state: HardwareState) -> bool {
        let resume = {
            let mut transition = self.lock();
            log::info!(
                "component state changed from {:?} to {:?}",
                transition.current,
                state
            );
            transition.current = state;
            transition.confirmed = Some(state);
            if state == HardwareState::Paused && transition.resume_after_pause {
                transition.resume_after_pause = false;
                true
            } else {
                false
            }
        };
        self.confirmed.notify_all();

        resume
    }

    /// Handles the completion of a flush: the component must go back to Executing, now if it is
    /// already Paused or as soon as it confirms Paused otherwise.
    ///
    /// Waiters are not woken up.
    pub fn on_flush_complete<C: HardwareComponent>(&self, component: &C) -> CodecResult<()> {
        {
            let mut transition = self.lock();
            if transition.current != HardwareState::Paused
                && transition.target == HardwareState::Paused
            {
                log::debug!("flush completed before pause, deferring resume");
                transition.resume_after_pause = true;
                return Ok(());
            }
        }

        self.request(component, HardwareState::Executing).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::Call;
    use crate::mock::RecordingComponent;

    fn controller(state: HardwareState) -> StateController {
        let controller = StateController::new(Some(Duration::from_secs(5)));
        controller.reset(state);
        controller
    }

    #[test]
    fn idempotent_requests() {
        let component = RecordingComponent::new();
        let controller = controller(HardwareState::Idle);

        assert!(!controller.request(&component, HardwareState::Idle).unwrap());
        assert!(component.calls().is_empty());

        assert!(controller
            .request(&component, HardwareState::Executing)
            .unwrap());
        assert!(!controller
            .request(&component, HardwareState::Executing)
            .unwrap());
        assert_eq!(
            component.calls(),
            vec![Call::Command(Command::StateSet(HardwareState::Executing))]
        );
    }

    #[test]
    fn invalid_edges_rejected() {
        let component = RecordingComponent::new();
        let controller = controller(HardwareState::Loaded);

        for state in [HardwareState::Executing, HardwareState::Paused] {
            let err = controller.request(&component, state).unwrap_err();
            assert!(matches!(err, CodecError::WrongState(HardwareState::Loaded)));
            assert_eq!(err.kind(), ErrorKind::Protocol);
        }
        assert_eq!(controller.target(), HardwareState::Loaded);
        assert!(component.calls().is_empty());

        // Going back to the current state cancels an outstanding request.
        assert!(controller.request(&component, HardwareState::Idle).unwrap());
        assert!(controller
            .request(&component, HardwareState::Loaded)
            .unwrap());
        assert_eq!(controller.target(), HardwareState::Loaded);
    }

    #[test]
    fn failed_request_restores_target() {
        let component = RecordingComponent::new();
        component.fail_commands(true);
        let controller = controller(HardwareState::Loaded);

        let err = controller
            .request(&component, HardwareState::Idle)
            .unwrap_err();
        assert!(matches!(err, CodecError::Device { call: "send_command", .. }));
        assert_eq!(controller.target(), HardwareState::Loaded);
    }

    #[test]
    fn wait_for_confirmation() {
        let component = RecordingComponent::new();
        let controller = Arc::new(controller(HardwareState::Loaded));
        controller.request(&component, HardwareState::Idle).unwrap();

        let confirmer = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                controller.on_state_set(HardwareState::Idle);
            })
        };

        controller.wait_for(HardwareState::Idle).unwrap();
        confirmer.join().unwrap();
        assert_eq!(controller.current(), HardwareState::Idle);

        // Already there.
        controller.wait_for(HardwareState::Idle).unwrap();
    }

    #[test]
    fn wait_mismatch() {
        let component = RecordingComponent::new();
        let controller = controller(HardwareState::Loaded);
        controller.request(&component, HardwareState::Idle).unwrap();
        controller.on_state_set(HardwareState::Invalid);

        assert!(matches!(
            controller.wait_for(HardwareState::Idle),
            Err(CodecError::StateMismatch {
                requested: HardwareState::Idle,
                confirmed: HardwareState::Invalid,
            })
        ));
    }

    #[test]
    fn wait_timeout() {
        let component = RecordingComponent::new();
        let controller = StateController::new(Some(Duration::from_millis(20)));
        controller.reset(HardwareState::Loaded);
        controller.request(&component, HardwareState::Idle).unwrap();

        let err = controller.wait_for(HardwareState::Idle).unwrap_err();
        assert!(matches!(err, CodecError::StateTimeout(HardwareState::Idle)));
    }

    #[test]
    fn flush_after_pause_resumes() {
        let component = RecordingComponent::new();
        let controller = controller(HardwareState::Executing);
        controller.request(&component, HardwareState::Paused).unwrap();
        assert!(!controller.on_state_set(HardwareState::Paused));

        controller.on_flush_complete(&component).unwrap();
        controller.on_flush_complete(&component).unwrap();

        assert_eq!(
            component.calls(),
            vec![
                Call::Command(Command::StateSet(HardwareState::Paused)),
                Call::Command(Command::StateSet(HardwareState::Executing)),
            ]
        );
    }

    #[test]
    fn flush_before_pause_defers_resume() {
        let component = RecordingComponent::new();
        let controller = controller(HardwareState::Executing);
        controller.request(&component, HardwareState::Paused).unwrap();

        controller.on_flush_complete(&component).unwrap();
        assert_eq!(component.calls().len(), 1);

        assert!(controller.on_state_set(HardwareState::Paused));
        assert!(!controller.on_state_set(HardwareState::Paused));
    }
}
