//! Named POSIX shared memory segments holding exactly one frame
//!
//! The capture process creates the segment and is the only one that ever
//! unlinks it. Readers attach read-only by name and size, and only unmap.

use std::fs::File;
use std::thread;
use std::time::{Duration, Instant};

use memmap2::{Mmap, MmapMut};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::camera::SharedCameraConfig;
use crate::capture::frame::{FrameShape, FrameView, FrameViewMut};
use crate::error::{CaptureError, ShmError};

/// Longest name accepted by `shm_open`, leading slash included
const MAX_NAME_LEN: usize = 255;

const ATTACH_RETRY_INTERVAL: Duration = Duration::from_millis(10);

enum Mapping {
    Created(MmapMut),
    Attached(Mmap),
}

/// A named shared memory region sized to one frame
pub struct SharedFrameBuffer {
    name: String,
    os_name: String,
    size: usize,
    mapping: Option<Mapping>,
    unlinked: bool,
}

impl SharedFrameBuffer {
    /// Create and map a new segment. Fails if the name is already taken.
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        let os_name = os_name(name)?;
        let fd = shm_open(
            os_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| match errno {
            Errno::EEXIST => ShmError::AlreadyExists(name.to_owned()),
            source => ShmError::Os {
                name: name.to_owned(),
                source,
            },
        })?;
        let file = File::from(fd);

        // The segment exists from here on, so it must not outlive a failed setup
        let mapped = file
            .set_len(size as u64)
            .and_then(|()| unsafe { MmapMut::map_mut(&file) });
        let mmap = match mapped {
            Ok(mmap) => mmap,
            Err(e) => {
                let _ = shm_unlink(os_name.as_str());
                return Err(e.into());
            }
        };

        debug!("Created shared memory '{}' ({} bytes)", name, size);
        Ok(Self {
            name: name.to_owned(),
            os_name,
            size,
            mapping: Some(Mapping::Created(mmap)),
            unlinked: false,
        })
    }

    /// Attach read-only to the segment a capture process exported
    pub fn attach(shared: &SharedCameraConfig) -> Result<Self, ShmError> {
        Self::attach_named(&shared.shared_memory_name, Some(shared.size_bytes))
    }

    /// Attach read-only by name, optionally checking the segment size
    pub fn attach_named(name: &str, expected_size: Option<usize>) -> Result<Self, ShmError> {
        let os_name = os_name(name)?;
        let fd = shm_open(os_name.as_str(), OFlag::O_RDONLY, Mode::empty()).map_err(
            |errno| match errno {
                Errno::ENOENT => ShmError::NotFound(name.to_owned()),
                source => ShmError::Os {
                    name: name.to_owned(),
                    source,
                },
            },
        )?;
        let file = File::from(fd);
        let size = file.metadata()?.len() as usize;

        // A zero length means the creator has not sized the segment yet
        let expected = expected_size.unwrap_or(size);
        if size == 0 || size != expected {
            return Err(ShmError::SizeMismatch {
                name: name.to_owned(),
                expected,
                actual: size,
            });
        }

        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            name: name.to_owned(),
            os_name,
            size,
            mapping: Some(Mapping::Attached(mmap)),
            unlinked: false,
        })
    }

    /// Attach, retrying while the capture process has not published the segment yet
    pub fn attach_with_retry(
        shared: &SharedCameraConfig,
        timeout: Duration,
    ) -> Result<Self, ShmError> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::attach(shared) {
                Err(ShmError::NotFound(_)) | Err(ShmError::SizeMismatch { actual: 0, .. })
                    if Instant::now() < deadline =>
                {
                    thread::sleep(ATTACH_RETRY_INTERVAL);
                }
                result => return result,
            }
        }
    }

    /// Unlink a segment whose creator died without cleaning up
    ///
    /// Only for callers that know the creator is gone. Returns whether a
    /// segment was removed.
    pub fn reclaim(name: &str) -> Result<bool, ShmError> {
        let os_name = os_name(name)?;
        match shm_unlink(os_name.as_str()) {
            Ok(()) => {
                debug!("Reclaimed shared memory '{}'", name);
                Ok(true)
            }
            Err(Errno::ENOENT) => Ok(false),
            Err(source) => Err(ShmError::Os {
                name: name.to_owned(),
                source,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created the segment (and so owns its unlink)
    pub fn is_creator(&self) -> bool {
        matches!(self.mapping, Some(Mapping::Created(_)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.mapping {
            Some(Mapping::Created(mmap)) => &mmap[..],
            Some(Mapping::Attached(mmap)) => &mmap[..],
            None => &[],
        }
    }

    /// Writable bytes; `None` for attached readers
    pub fn as_mut_bytes(&mut self) -> Option<&mut [u8]> {
        match &mut self.mapping {
            Some(Mapping::Created(mmap)) => Some(&mut mmap[..]),
            _ => None,
        }
    }

    pub fn view(&self, shape: FrameShape) -> Result<FrameView<'_>, CaptureError> {
        FrameView::new(self.as_bytes(), shape)
    }

    pub fn view_mut(&mut self, shape: FrameShape) -> Result<FrameViewMut<'_>, CaptureError> {
        let name = self.name.clone();
        let bytes = self
            .as_mut_bytes()
            .ok_or_else(|| CaptureError::Device(format!("'{}' is attached read-only", name)))?;
        FrameViewMut::new(bytes, shape)
    }

    /// Copy of the current contents; may be torn if the writer is mid-frame
    pub fn snapshot(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Unmap, then unlink if this handle is the creator. Readers only unmap.
    pub fn close_and_unlink(mut self) -> Result<(), ShmError> {
        let created = self.is_creator();
        self.mapping = None;
        if !created {
            return Ok(());
        }
        self.unlink()
    }

    fn unlink(&mut self) -> Result<(), ShmError> {
        self.unlinked = true;
        shm_unlink(self.os_name.as_str()).map_err(|source| ShmError::Os {
            name: self.name.clone(),
            source,
        })?;
        debug!("Unlinked shared memory '{}'", self.name);
        Ok(())
    }
}

impl Drop for SharedFrameBuffer {
    fn drop(&mut self) {
        let created = self.is_creator();
        self.mapping = None;
        if created && !self.unlinked {
            if let Err(e) = self.unlink() {
                warn!("Failed to unlink shared memory: {}", e);
            }
        }
    }
}

/// Validate a segment name and give it the leading slash `shm_open` expects
pub fn os_name(name: &str) -> Result<String, ShmError> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') || bare.contains('\0') || bare.len() + 1 > MAX_NAME_LEN
    {
        return Err(ShmError::InvalidName(name.to_owned()));
    }
    Ok(format!("/{}", bare))
}
