//! POSIX shared-memory mapping of a [`ChannelLayout`].

use std::ffi::CString;
use std::io;
use std::ops::Deref;
use std::ptr::NonNull;

use super::{ChannelLayout, CHANNEL_LAYOUT_BYTES};

/// A `ChannelLayout` mapped from a named POSIX shared-memory object.
///
/// The producer [`create`](Self::create)s the object and unlinks it on drop;
/// consumers [`open_read_only`](Self::open_read_only) it and only unmap.
pub struct ShmRegion {
    layout: NonNull<ChannelLayout>,
    name: CString,
    owner: bool,
}

// SAFETY: the mapping is only accessed through the atomics in
// `ChannelLayout`, which are safe to share between threads.
unsafe impl Send for ShmRegion {}
// SAFETY: see above.
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create (or truncate) the named object and map it read-write.
    ///
    /// `name` follows `shm_open` rules: a leading `/` and no other slashes.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the object cannot be created, sized, or
    /// mapped.
    pub fn create(name: &str) -> io::Result<Self> {
        let c_name = shm_name(name)?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Truncating to zero first resets a stale object to "never published".
        // SAFETY: `fd` is an open descriptor owned by this function.
        let sized = unsafe {
            libc::ftruncate(fd, 0) == 0
                && libc::ftruncate(fd, CHANNEL_LAYOUT_BYTES as libc::off_t) == 0
        };
        if !sized {
            let err = io::Error::last_os_error();
            // SAFETY: `fd` is open and `c_name` valid; both are cleaned up.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        // SAFETY: `fd` is open and sized to hold a `ChannelLayout`.
        let mapped = unsafe { map(fd, libc::PROT_READ | libc::PROT_WRITE) };
        if mapped.is_err() {
            // SAFETY: `c_name` is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
        let layout = mapped?;

        tracing::debug!(name, "created snapshot channel");
        Ok(Self {
            layout,
            name: c_name,
            owner: true,
        })
    }

    /// Map an existing object read-only.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the object does not exist or cannot be
    /// mapped, and [`io::ErrorKind::InvalidData`] if it is too small to hold
    /// a channel.
    pub fn open_read_only(name: &str) -> io::Result<Self> {
        let c_name = shm_name(name)?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `stat` is plain data, and `fd` is open.
        let size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            stat.st_size
        };
        if usize::try_from(size).map_or(true, |size| size < CHANNEL_LAYOUT_BYTES) {
            // SAFETY: `fd` is open.
            unsafe { libc::close(fd) };
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared object {name} holds {size} bytes, channel needs {CHANNEL_LAYOUT_BYTES}"),
            ));
        }

        // SAFETY: `fd` is open and large enough.
        let layout = unsafe { map(fd, libc::PROT_READ) }?;

        tracing::debug!(name, "opened snapshot channel read-only");
        Ok(Self {
            layout,
            name: c_name,
            owner: false,
        })
    }

    /// Whether this mapping created the object (and will unlink it).
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Deref for ShmRegion {
    type Target = ChannelLayout;

    fn deref(&self) -> &ChannelLayout {
        // SAFETY: the mapping stays valid until `drop`, and an all-zero or
        // previously published block is a valid `ChannelLayout`.
        unsafe { self.layout.as_ref() }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: `layout` is the start of a live mapping of exactly
        // `CHANNEL_LAYOUT_BYTES`, and `name` is NUL-terminated.
        unsafe {
            libc::munmap(self.layout.as_ptr().cast(), CHANNEL_LAYOUT_BYTES);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

fn shm_name(name: &str) -> io::Result<CString> {
    if !name.starts_with('/') || name[1..].contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("shared memory name {name:?} must be a single leading-slash component"),
        ));
    }
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Map `fd` and close it.
///
/// # Safety
///
/// `fd` must be an open shared-memory descriptor at least
/// `CHANNEL_LAYOUT_BYTES` long.
unsafe fn map(fd: libc::c_int, prot: libc::c_int) -> io::Result<NonNull<ChannelLayout>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            CHANNEL_LAYOUT_BYTES,
            prot,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if ptr == libc::MAP_FAILED {
        return Err(err);
    }
    NonNull::new(ptr.cast::<ChannelLayout>())
        .ok_or_else(|| io::Error::other("mmap returned a null mapping"))
}
