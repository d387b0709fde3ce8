// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Anonymous shared memory regions backing input slots.
//!
//! Each region is a sealed `memfd` mapped read-write into our address space. The component
//! receives the file descriptor and maps it on its side, so compressed bytes written here become
//! visible to it without any further copy.

use core::slice;
use std::fs::File;
use std::io;
use std::num::NonZeroU64;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::sys::mman;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewSharedRegionError {
    #[error("shared region size cannot be zero")]
    ZeroSize,
    #[error("region size {0} larger than usize")]
    TooLarge(u64),
    #[error("call to memfd_create failed: {0}")]
    FailedToCreate(#[from] Errno),
    #[error("failed to set size of memfd: {0}")]
    FailedToSetSize(io::Error),
    #[error("failed to seal memfd: {0}")]
    FailedToSeal(io::Error),
    #[error("mmap call returned error: {0}")]
    Mmap(Errno),
}

#[derive(Debug, Clone, Error)]
pub enum SharedRegionWriteError {
    #[error("{len} bytes at offset {offset} do not fit in a region of {size} bytes")]
    TooLarge {
        len: usize,
        offset: usize,
        size: usize,
    },
}

/// A fixed-size chunk of shared memory, mapped for the lifetime of the object.
///
/// Dropping the region unmaps it and closes its file descriptor.
pub struct SharedRegion {
    file: File,
    // A mapping remains valid until we munmap it, that is, until the region is dropped. Hence the
    // static lifetime.
    data: &'static mut [u8],
}

impl SharedRegion {
    pub fn new(size: u64) -> Result<Self, NewSharedRegionError> {
        let size = NonZeroU64::new(size).ok_or(NewSharedRegionError::ZeroSize)?;
        let map_size = NonZeroUsize::try_from(size)
            .map_err(|_| NewSharedRegionError::TooLarge(size.into()))?;

        let fd = memfd_create(c"codec-input", MemFdCreateFlag::MFD_ALLOW_SEALING)?;
        let file: File = fd.into();

        file.set_len(size.into())
            .map_err(NewSharedRegionError::FailedToSetSize)?;

        // Seal so the memory size cannot be changed by the component.
        //
        // SAFETY: `file` is a valid file.
        if unsafe {
            libc::fcntl(
                file.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL,
            )
        } < 0
        {
            return Err(NewSharedRegionError::FailedToSeal(
                io::Error::last_os_error(),
            ));
        }

        // SAFETY: `file` is a valid file of `map_size` bytes.
        let data = unsafe {
            mman::mmap(
                None,
                map_size,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                &file,
                0,
            )
            .map_err(NewSharedRegionError::Mmap)?
        };

        Ok(Self {
            file,
            // SAFETY: `data` is non-null and obtained through a `mmap` of size `map_size`.
            data: unsafe { slice::from_raw_parts_mut(data.as_ptr().cast(), map_size.into()) },
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Copies `data` into the region at `offset`.
    pub fn write(&mut self, data: &[u8], offset: usize) -> Result<(), SharedRegionWriteError> {
        let too_large = SharedRegionWriteError::TooLarge {
            len: data.len(),
            offset,
            size: self.data.len(),
        };
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| too_large.clone())?;
        self.data
            .get_mut(offset..end)
            .ok_or(too_large)?
            .copy_from_slice(data);

        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: the pointer and length were constructed in mmap() and are always valid.
        unsafe {
            mman::munmap(
                NonNull::new_unchecked(self.data.as_mut_ptr().cast()),
                self.data.len(),
            )
        }
        .unwrap_or_else(|e| {
            log::error!("error while unmapping shared region: {:#}", e);
        });
    }
}

impl AsFd for SharedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for SharedRegion {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsRef<[u8]> for SharedRegion {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

/// Creates the shared regions of input slots.
///
/// Implemented as a trait so tests can observe or fail allocations.
pub trait SharedRegionAllocator: Send + Sync {
    fn allocate(&self, size: u64) -> Result<SharedRegion, NewSharedRegionError>;
}

/// Allocator creating plain `memfd` regions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemFdAllocator;

impl SharedRegionAllocator for MemFdAllocator {
    fn allocate(&self, size: u64) -> Result<SharedRegion, NewSharedRegionError> {
        SharedRegion::new(size)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileExt;

    use super::*;

    #[test]
    fn zero_size() {
        assert!(matches!(
            SharedRegion::new(0),
            Err(NewSharedRegionError::ZeroSize)
        ));
    }

    #[test]
    fn write_visible_through_fd() {
        let mut region = SharedRegion::new(64).unwrap();
        assert_eq!(region.size(), 64);

        region.write(b"frame", 8).unwrap();
        assert_eq!(&region.as_ref()[8..13], b"frame");

        let file = File::from(region.as_fd().try_clone_to_owned().unwrap());
        let mut buf = [0u8; 5];
        file.read_exact_at(&mut buf, 8).unwrap();
        assert_eq!(&buf, b"frame");
    }

    #[test]
    fn write_too_large() {
        let mut region = SharedRegion::new(4).unwrap();
        assert!(region.write(&[0u8; 5], 0).is_err());
        assert!(region.write(&[0u8; 2], 3).is_err());
        assert!(region.write(&[0u8; 1], usize::MAX).is_err());
        region.write(&[1u8; 4], 0).unwrap();
    }
}
