// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer traffic between the pipeline and the component.
//!
//! These methods run on the pipeline's threads when it queues buffers, and on the component's
//! thread when buffers come back. Buffers only flow while the component is Executing.

use std::sync::atomic::Ordering;

use crate::error::CodecError;
use crate::error::CodecResult;
use crate::protocol::CodecBuffer;
use crate::protocol::HardwareState;
use crate::protocol::PortIndex;
use crate::session::CodecEvent;
use crate::session::SessionCore;
use crate::slots::Lend;
use crate::HardwareComponent;

impl<C: HardwareComponent> SessionCore<C> {
    /// Submits pending input frames for as long as there are free input slots.
    ///
    /// Submission happens under the pending queue lock so frames reach the component in the order
    /// they were queued, whichever thread runs this. Accepted frames are handed back to the
    /// pipeline after the lock is released.
    pub(crate) fn drain_pending_input(&self) {
        if !self.state.is_executing() {
            return;
        }
        let Some(component) = self.component() else {
            return;
        };

        let mut accepted = Vec::new();
        {
            let mut pending = self.pending();
            while !pending.is_empty() {
                let Some(id) = self.input_pool.try_pop() else {
                    break;
                };
                let Some(frame) = pending.pop_front() else {
                    self.input_pool.push_front(id);
                    break;
                };

                let descriptor = match self.slots.prepare_input(id, &frame) {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        log::error!("dropping input frame (pts {}): {:#}", frame.pts, e);
                        self.input_pool.push_front(id);
                        continue;
                    }
                };

                log::debug!(
                    "submitting input buffer {} ({} bytes, pts {})",
                    id,
                    descriptor.filled_len,
                    descriptor.pts
                );
                if let Err(status) = component.empty_this_buffer(&descriptor) {
                    log::error!("failed to submit input buffer {}: {}", id, status);
                    self.slots.reclaim(id, PortIndex::Input);
                    self.input_pool.push_front(id);
                }
                accepted.push(frame);
            }
        }

        if let Some(callback) = self.data_callback() {
            for frame in accepted {
                callback.on_input_buffer_done(frame);
            }
        }
    }

    /// Submits every output slot still bound to the buffer it was allocated with.
    ///
    /// Only does something the first time it is called after `prepare`.
    pub(crate) fn initial_fill(&self) -> CodecResult<()> {
        if self.initial_fill_done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let component = self.component().ok_or(CodecError::NoComponent)?;

        let mut submitted = 0;
        while let Some(id) = self.output_pool.try_pop() {
            let descriptor = match self.slots.lend_output(id, || None) {
                Ok(Lend::Lent(descriptor)) => descriptor,
                Ok(Lend::NoBuffer) => {
                    self.output_pool.push_front(id);
                    break;
                }
                Err(e) => {
                    log::error!("cannot submit output slot {}: {:#}", id, e);
                    continue;
                }
            };

            if let Err(status) = component.fill_this_buffer(&descriptor) {
                log::error!("failed to submit output buffer {}: {}", id, status);
                self.slots.reclaim(id, PortIndex::Output);
                self.output_pool.push_front(id);
                return Err(CodecError::Device {
                    call: "fill_this_buffer",
                    status,
                });
            }
            submitted += 1;
        }
        log::debug!("submitted {} output buffers", submitted);

        Ok(())
    }

    /// Binds donated buffers to free output slots and submits them.
    pub(crate) fn fill_outputs(&self) {
        if !self.state.is_executing() || !self.initial_fill_done.load(Ordering::Acquire) {
            return;
        }
        let Some(component) = self.component() else {
            return;
        };

        while let Some(id) = self.output_pool.try_pop() {
            let descriptor = match self.slots.lend_output(id, || self.supply.try_pop()) {
                Ok(Lend::Lent(descriptor)) => descriptor,
                Ok(Lend::NoBuffer) => {
                    self.output_pool.push_front(id);
                    break;
                }
                Err(e) => {
                    log::error!("cannot submit output slot {}: {:#}", id, e);
                    continue;
                }
            };

            log::debug!("submitting output buffer {}", id);
            if let Err(status) = component.fill_this_buffer(&descriptor) {
                log::error!("failed to submit output buffer {}: {}", id, status);
                self.slots.reclaim(id, PortIndex::Output);
                self.output_pool.push_front(id);
                break;
            }
        }
    }

    /// Returns a filled output buffer to the pipeline and reuses its slot.
    pub(crate) fn complete_output(&self, descriptor: &CodecBuffer) {
        let id = descriptor.buffer_id;
        let Some(buffer) = self.slots.complete_output(descriptor) else {
            log::warn!("ignoring completion of output buffer {} not lent", id);
            return;
        };
        log::debug!(
            "output buffer {} done ({} bytes, pts {})",
            id,
            buffer.filled_len,
            buffer.pts
        );

        if self.output_pool.try_push(id).is_err() {
            log::error!("no room for output slot {} in its pool", id);
        }
        if let Some(callback) = self.data_callback() {
            callback.on_output_buffer_done(buffer);
        }

        self.fill_outputs();
    }

    /// Reuses the slot of an input buffer the component is done with.
    pub(crate) fn reclaim_input(&self, descriptor: &CodecBuffer) {
        let id = descriptor.buffer_id;
        if !self.slots.reclaim(id, PortIndex::Input) {
            log::warn!("ignoring return of input buffer {} not lent", id);
            return;
        }
        log::debug!("input buffer {} returned", id);

        if self.input_pool.try_push(id).is_err() {
            log::error!("no room for input slot {} in its pool", id);
        }

        self.drain_pending_input();
    }

    /// Records a state change confirmed by the component.
    pub(crate) fn on_state_set(&self, state: HardwareState) {
        let resume = self.state.on_state_set(state);
        self.notify(CodecEvent::StateChanged(state));

        if resume {
            if let Some(component) = self.component() {
                if let Err(e) = self.state.request(&*component, HardwareState::Executing) {
                    log::error!("failed to resume after flush: {:#}", e);
                }
            }
        }

        if state == HardwareState::Executing {
            self.drain_pending_input();
            self.fill_outputs();
        }
    }

    /// Resumes the component after one of its ports has been flushed.
    pub(crate) fn on_flush_complete(&self, port: PortIndex) {
        log::debug!("{} port flushed", port);
        let Some(component) = self.component() else {
            return;
        };
        if let Err(e) = self.state.on_flush_complete(&*component) {
            log::error!("failed to resume after flush: {:#}", e);
        }
    }
}
