use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use memmap2::{Mmap, MmapMut, MmapOptions};
use rustix::fs::{MemfdFlags, ftruncate, memfd_create};
use snafu::ResultExt;

use crate::protocol::{LinkError, SetupFailedSnafu};

/// Anonymous fixed-size shared memory object.
///
/// The length is set once at creation and is immutable for the object's
/// life; both peers map the same object `MAP_SHARED`, so a writer's bytes
/// are coherent in the reader's window.
#[derive(Debug)]
pub struct SharedRegion {
    fd: OwnedFd,
    len: usize,
}

impl SharedRegion {
    /// Allocate a region of exactly `len` bytes. The backing memfd is
    /// created close-on-exec; the spawn handoff re-enables inheritance on
    /// the slot copy only.
    pub fn create(tag: &str, len: usize) -> Result<Self, LinkError> {
        if len == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "region capacity must be positive",
            ))
            .context(SetupFailedSnafu {
                step: "sizing shared region",
            });
        }
        let name = format!("shmlink-{tag}");
        let fd = memfd_create(name.as_str(), MemfdFlags::CLOEXEC)
            .map_err(std::io::Error::from)
            .context(SetupFailedSnafu {
                step: "creating shared region",
            })?;
        ftruncate(&fd, len as u64)
            .map_err(std::io::Error::from)
            .context(SetupFailedSnafu {
                step: "sizing shared region",
            })?;
        Ok(Self { fd, len })
    }

    /// Adopt an inherited region handle of known capacity.
    pub(crate) fn from_owned(fd: OwnedFd, len: usize) -> Self {
        Self { fd, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Writable window over the whole region, for the sending side.
    pub fn map_writer(&self) -> Result<MmapMut, LinkError> {
        unsafe {
            MmapOptions::new()
                .len(self.len)
                .map_mut(self.fd.as_raw_fd())
        }
        .context(SetupFailedSnafu {
            step: "mapping shared region writable",
        })
    }

    /// Read-only window over the whole region, for the receiving side.
    pub fn map_reader(&self) -> Result<Mmap, LinkError> {
        unsafe { MmapOptions::new().len(self.len).map(self.fd.as_raw_fd()) }
            .context(SetupFailedSnafu {
                step: "mapping shared region read-only",
            })
    }
}

impl AsFd for SharedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        let err = SharedRegion::create("zero", 0).unwrap_err();
        assert!(matches!(err, LinkError::SetupFailed { .. }));
    }

    #[test]
    fn writer_bytes_are_visible_through_reader_mapping() {
        let region = SharedRegion::create("coherence", 4096).unwrap();
        let mut writer = region.map_writer().unwrap();
        let reader = region.map_reader().unwrap();

        writer[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&reader[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(reader.len(), 4096);
    }
}
