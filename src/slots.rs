// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exchange slots registered with a component.
//!
//! A slot is one buffer known to the component, identified by the id the component assigned to
//! it at registration. Input slots own a [`SharedRegion`] for their whole lifetime. Output slots
//! never own memory: they are bound to one donated [`OutputBuffer`] per fill cycle.
//!
//! A slot is either available (its id sits in the free pool of its port) or lent to the
//! component. Ownership only moves through the methods of [`SlotRegistry`], under its lock.

use std::collections::BTreeMap;
use std::os::fd::AsRawFd;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use crate::buffer::InputFrame;
use crate::buffer::OutputBuffer;
use crate::error::CodecError;
use crate::error::CodecResult;
use crate::protocol::BufferFlags;
use crate::protocol::BufferKind;
use crate::protocol::CodecBuffer;
use crate::protocol::PortIndex;
use crate::queue::BoundedQueue;
use crate::shm::SharedRegion;
use crate::shm::SharedRegionAllocator;
use crate::HardwareComponent;

/// Memory behind a slot.
pub enum BackingStorage {
    /// Region created at registration and dropped with the slot.
    Owned(SharedRegion),
    /// Donated buffer the slot is currently bound to, if any.
    Borrowed(Option<OutputBuffer>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    FreePool,
    Hardware,
}

struct BufferSlot {
    port: PortIndex,
    storage: BackingStorage,
    owner: SlotOwner,
    descriptor: CodecBuffer,
}

/// Outcome of [`SlotRegistry::lend_output`].
pub enum Lend {
    /// The slot is now lent to the component and should be submitted with this descriptor.
    Lent(CodecBuffer),
    /// No buffer was available to bind the slot to. The slot stays available.
    NoBuffer,
}

#[derive(Default)]
pub struct SlotRegistry {
    slots: Mutex<BTreeMap<u32, BufferSlot>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, BufferSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register<C: HardwareComponent>(
        &self,
        component: &C,
        port: PortIndex,
        storage: BackingStorage,
        mut descriptor: CodecBuffer,
    ) -> Result<u32, (CodecError, BackingStorage)> {
        if let Err(status) = component.use_buffer(port, &mut descriptor) {
            log::error!("failed to register {} buffer: {}", port, status);
            let err = CodecError::Device {
                call: "use_buffer",
                status,
            };
            return Err((err, storage));
        }

        let id = descriptor.buffer_id;
        let mut slots = self.lock();
        if slots.contains_key(&id) {
            drop(slots);
            log::error!("component assigned duplicate buffer id {} on {} port", id, port);
            if let Err(status) = component.free_buffer(port, &descriptor) {
                log::error!("failed to free duplicate buffer {}: {}", id, status);
            }
            let err = CodecError::Device {
                call: "use_buffer",
                status: libc::EEXIST,
            };
            return Err((err, storage));
        }

        log::debug!("registered {} buffer {}", port, id);
        slots.insert(
            id,
            BufferSlot {
                port,
                storage,
                owner: SlotOwner::FreePool,
                descriptor,
            },
        );

        Ok(id)
    }

    /// Unregisters the slots in `ids`, returning the donated buffers they were bound to in the
    /// same order.
    fn rollback<C: HardwareComponent>(&self, component: &C, ids: &[u32]) -> Vec<OutputBuffer> {
        let removed: Vec<_> = {
            let mut slots = self.lock();
            ids.iter().filter_map(|id| slots.remove(id)).collect()
        };

        let mut donations = Vec::new();
        for slot in removed {
            if let Err(status) = component.free_buffer(slot.port, &slot.descriptor) {
                log::error!(
                    "failed to free {} buffer {} during rollback: {}",
                    slot.port,
                    slot.descriptor.buffer_id,
                    status
                );
            }
            if let BackingStorage::Borrowed(Some(buffer)) = slot.storage {
                donations.push(buffer);
            }
        }

        donations
    }

    fn check_capacity(pool: &BoundedQueue<u32>, port: PortIndex, count: u32) -> CodecResult<()> {
        let capacity = pool.capacity().saturating_sub(pool.len());
        if count as usize > capacity {
            return Err(CodecError::PoolTooSmall {
                port,
                count,
                capacity,
            });
        }
        Ok(())
    }

    fn publish(pool: &BoundedQueue<u32>, ids: Vec<u32>) {
        for id in ids {
            if pool.try_push(id).is_err() {
                log::error!("{} has no room for slot {}", pool.name(), id);
            }
        }
    }

    /// Creates `count` input slots of `size` bytes each and makes them available in `pool`.
    ///
    /// Either all slots are created, or none is and every registration done by this call is
    /// undone.
    pub fn allocate_input_slots<C: HardwareComponent>(
        &self,
        component: &C,
        allocator: &dyn SharedRegionAllocator,
        pool: &BoundedQueue<u32>,
        count: u32,
        size: u32,
    ) -> CodecResult<()> {
        Self::check_capacity(pool, PortIndex::Input, count)?;

        let mut registered = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let res = allocator
                .allocate(size as u64)
                .map_err(CodecError::from)
                .and_then(|region| {
                    let descriptor = CodecBuffer::new(
                        BufferKind::SharedMemory {
                            fd: region.as_raw_fd(),
                            read_only: true,
                        },
                        size,
                    );
                    self.register(
                        component,
                        PortIndex::Input,
                        BackingStorage::Owned(region),
                        descriptor,
                    )
                    .map_err(|(e, _)| e)
                });

            match res {
                Ok(id) => registered.push(id),
                Err(e) => {
                    self.rollback(component, &registered);
                    return Err(e);
                }
            }
        }

        Self::publish(pool, registered);
        Ok(())
    }

    /// Creates `count` output slots of `size` bytes, each bound to a buffer taken from `supply`,
    /// and makes them available in `pool`.
    ///
    /// Waits up to `timeout` for each donation. On failure every registration done by this call
    /// is undone and the donations it took are put back at the head of `supply`.
    pub fn allocate_output_slots<C: HardwareComponent>(
        &self,
        component: &C,
        supply: &BoundedQueue<OutputBuffer>,
        pool: &BoundedQueue<u32>,
        count: u32,
        size: u32,
        timeout: Option<Duration>,
    ) -> CodecResult<()> {
        Self::check_capacity(pool, PortIndex::Output, count)?;

        let mut registered = Vec::with_capacity(count as usize);
        let mut res = Ok(());
        for _ in 0..count {
            let Some(buffer) = supply.pop(timeout) else {
                res = Err(CodecError::NoDonation);
                break;
            };

            let descriptor = CodecBuffer::new(
                BufferKind::Handle(Some(buffer.handle().clone())),
                size,
            );
            match self.register(
                component,
                PortIndex::Output,
                BackingStorage::Borrowed(Some(buffer)),
                descriptor,
            ) {
                Ok(id) => registered.push(id),
                Err((e, storage)) => {
                    if let BackingStorage::Borrowed(Some(buffer)) = storage {
                        supply.push_front(buffer);
                    }
                    res = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = res {
            let donations = self.rollback(component, &registered);
            for buffer in donations.into_iter().rev() {
                supply.push_front(buffer);
            }
            return Err(e);
        }

        Self::publish(pool, registered);
        Ok(())
    }

    /// Copies `frame` into input slot `id` and lends the slot to the component.
    ///
    /// Returns the descriptor to submit. On error the slot is left available.
    pub fn prepare_input(&self, id: u32, frame: &InputFrame) -> CodecResult<CodecBuffer> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(&id)
            .filter(|s| s.port == PortIndex::Input && s.owner == SlotOwner::FreePool)
            .ok_or_else(|| {
                CodecError::InvalidParameter(format!("input slot {} not available", id))
            })?;

        let BackingStorage::Owned(region) = &mut slot.storage else {
            return Err(CodecError::InvalidParameter(format!(
                "slot {} has no shared memory",
                id
            )));
        };
        region
            .write(&frame.data, 0)
            .map_err(|e| CodecError::InvalidParameter(e.to_string()))?;

        slot.descriptor.offset = 0;
        slot.descriptor.filled_len = frame.data.len() as u32;
        slot.descriptor.flags = frame.flags.into();
        slot.descriptor.pts = frame.pts;
        slot.owner = SlotOwner::Hardware;

        Ok(slot.descriptor.clone())
    }

    /// Binds output slot `id` to a buffer and lends it to the component.
    ///
    /// A slot still bound from allocation keeps its buffer. Otherwise `donation` is called to
    /// obtain one.
    pub fn lend_output<F>(&self, id: u32, donation: F) -> CodecResult<Lend>
    where
        F: FnOnce() -> Option<OutputBuffer>,
    {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(&id)
            .filter(|s| s.port == PortIndex::Output && s.owner == SlotOwner::FreePool)
            .ok_or_else(|| {
                CodecError::InvalidParameter(format!("output slot {} not available", id))
            })?;

        let handle = match &mut slot.storage {
            BackingStorage::Borrowed(Some(buffer)) => buffer.handle().clone(),
            BackingStorage::Borrowed(bound @ None) => match donation() {
                Some(buffer) => {
                    let handle = buffer.handle().clone();
                    *bound = Some(buffer);
                    handle
                }
                None => return Ok(Lend::NoBuffer),
            },
            BackingStorage::Owned(_) => {
                return Err(CodecError::InvalidParameter(format!(
                    "slot {} owns its memory",
                    id
                )))
            }
        };

        slot.descriptor.kind = BufferKind::Handle(Some(handle));
        slot.descriptor.offset = 0;
        slot.descriptor.filled_len = 0;
        slot.descriptor.flags = BufferFlags::empty();
        slot.descriptor.pts = 0;
        slot.owner = SlotOwner::Hardware;

        Ok(Lend::Lent(slot.descriptor.clone()))
    }

    /// Makes slot `id`, lent to the component on `port`, available again.
    ///
    /// Returns `false` if the slot is unknown, on another port, or not lent. An output slot keeps
    /// the buffer it is bound to.
    pub fn reclaim(&self, id: u32, port: PortIndex) -> bool {
        match self.lock().get_mut(&id) {
            Some(slot) if slot.port == port && slot.owner == SlotOwner::Hardware => {
                slot.owner = SlotOwner::FreePool;
                true
            }
            _ => false,
        }
    }

    /// Takes back output slot `descriptor.buffer_id` after the component filled it.
    ///
    /// Returns the buffer it was bound to, stamped with the results from `descriptor`, and
    /// leaves the slot unbound and available. Returns `None` if the slot is unknown, not lent or
    /// not bound.
    pub fn complete_output(&self, descriptor: &CodecBuffer) -> Option<OutputBuffer> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&descriptor.buffer_id).filter(|s| {
            s.port == PortIndex::Output && s.owner == SlotOwner::Hardware
        })?;
        let BackingStorage::Borrowed(bound) = &mut slot.storage else {
            return None;
        };
        let mut buffer = bound.take()?;

        buffer.flags = descriptor.flags.into();
        buffer.pts = descriptor.pts;
        buffer.filled_len = descriptor.filled_len;

        slot.descriptor.kind = BufferKind::Handle(None);
        slot.owner = SlotOwner::FreePool;

        Some(buffer)
    }

    /// Unregisters every slot and empties `pools`.
    ///
    /// Failures to unregister are logged. Input regions are released and donated buffers still
    /// bound to a slot are dropped.
    pub fn release_all<C: HardwareComponent>(&self, component: &C, pools: &[&BoundedQueue<u32>]) {
        let slots = std::mem::take(&mut *self.lock());
        for (id, slot) in slots {
            if let Err(status) = component.free_buffer(slot.port, &slot.descriptor) {
                log::error!("failed to free {} buffer {}: {}", slot.port, id, status);
            }
        }

        for pool in pools {
            pool.clear();
        }
    }
}
