// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    ffi,
    ptr,
    thread,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A named POSIX shared memory object.
///
/// The object may be mapped either at an arbitrary address or at a caller
/// supplied fixed address. Fixed mappings are the backbone of the uni-address
/// scheme: every worker maps the same object layout at the same virtual
/// address, so pointers into the mapping are meaningful on every rank.
pub struct SharedMemory {
    /// Was this region created or opened?
    was_created: bool,
    /// Name.
    name: ffi::CString,
    /// Underlying file descriptor.
    fd: libc::c_int,
    /// Size in bytes.
    size: libc::size_t,
    /// Base address of the mapping, if mapped.
    addr: *mut libc::c_void,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SharedMemory {
    /// Creates a named shared memory object of `size` bytes. The object is not
    /// mapped yet; call [SharedMemory::map] or [SharedMemory::map_at].
    pub fn create(name: &str, size: usize) -> Result<SharedMemory, Fail> {
        let name: ffi::CString = Self::parse_name(name)?;
        let fd: libc::c_int = unsafe {
            let ret: libc::c_int = libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                libc::S_IRUSR | libc::S_IWUSR,
            );
            if ret == -1 {
                let errno: libc::c_int = *libc::__errno_location();
                let cause: String = format!(
                    "failed to create shared memory object (name={:?}, size={}, errno={})",
                    name, size, errno
                );
                error!("create(): {}", cause);
                return Err(Fail::new(errno, &cause));
            }
            ret
        };

        let mut shm: SharedMemory = SharedMemory {
            was_created: true,
            name,
            fd,
            size: 0,
            addr: ptr::null_mut(),
        };
        shm.truncate(size)?;

        Ok(shm)
    }

    /// Opens an existing named shared memory object.
    pub fn open(name: &str, size: usize) -> Result<SharedMemory, Fail> {
        let name: ffi::CString = Self::parse_name(name)?;
        let fd: libc::c_int = unsafe {
            let ret: libc::c_int = libc::shm_open(name.as_ptr(), libc::O_RDWR, libc::S_IRUSR | libc::S_IWUSR);
            if ret == -1 {
                let errno: libc::c_int = *libc::__errno_location();
                let cause: String = format!(
                    "failed to open shared memory object (name={:?}, size={}, errno={})",
                    name, size, errno
                );
                error!("open(): {}", cause);
                return Err(Fail::new(errno, &cause));
            }
            ret
        };

        Ok(SharedMemory {
            was_created: false,
            name,
            fd,
            size,
            addr: ptr::null_mut(),
        })
    }

    /// Opens an existing named shared memory object, retrying while the
    /// creator has not yet published it. Ranks race through initialization, so
    /// peers back off until the owner's `create` becomes visible.
    pub fn open_retry(name: &str, size: usize, attempts: usize) -> Result<SharedMemory, Fail> {
        for _ in 0..attempts {
            match Self::open(name, size) {
                Ok(shm) => return Ok(shm),
                Err(e) if e.errno == libc::ENOENT => thread::sleep(Duration::from_millis(1)),
                Err(e) => return Err(e),
            }
        }
        let cause: String = format!("shared memory object never appeared (name={:?})", name);
        error!("open_retry(): {}", cause);
        Err(Fail::new(libc::ETIMEDOUT, &cause))
    }

    /// Maps the object at an address chosen by the kernel.
    pub fn map(&mut self) -> Result<*mut u8, Fail> {
        self.do_map(ptr::null_mut(), 0)
    }

    /// Maps the object at `addr` exactly, replacing whatever mapping occupies
    /// that range. The caller must own the range (e.g. by holding a
    /// `PROT_NONE` reservation over it).
    pub fn map_at(&mut self, addr: *mut u8) -> Result<*mut u8, Fail> {
        self.do_map(addr as *mut libc::c_void, libc::MAP_FIXED)
    }

    /// Returns the base address of the mapping.
    pub fn addr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Returns the size of the object.
    pub fn size(&self) -> usize {
        self.size
    }

    fn parse_name(name: &str) -> Result<ffi::CString, Fail> {
        match ffi::CString::new(name) {
            Ok(name) => Ok(name),
            Err(_) => Err(Fail::new(libc::EINVAL, "could not parse name of shared memory object")),
        }
    }

    fn do_map(&mut self, addr: *mut libc::c_void, extra_flags: libc::c_int) -> Result<*mut u8, Fail> {
        let ret: *mut libc::c_void = unsafe {
            libc::mmap(
                addr,
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | extra_flags,
                self.fd,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            let errno: libc::c_int = unsafe { *libc::__errno_location() };
            let cause: String = format!(
                "failed to map shared memory object (name={:?}, addr={:?}, size={}, errno={})",
                self.name, addr, self.size, errno
            );
            error!("do_map(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
        self.addr = ret;
        Ok(ret as *mut u8)
    }

    fn truncate(&mut self, size: usize) -> Result<(), Fail> {
        unsafe {
            let ret: libc::c_int = libc::ftruncate(self.fd, size as libc::off_t);
            if ret == -1 {
                return Err(Fail::new(libc::EAGAIN, "failed to truncate shared memory object"));
            }
        };
        self.size = size;
        Ok(())
    }

    fn unmap(&mut self) -> Result<(), Fail> {
        if self.addr.is_null() {
            return Ok(());
        }
        unsafe {
            let ret: libc::c_int = libc::munmap(self.addr, self.size);
            if ret == -1 {
                return Err(Fail::new(libc::EAGAIN, "failed to unmap shared memory object"));
            }
        }
        self.addr = ptr::null_mut();
        Ok(())
    }

    fn close(&mut self) -> Result<(), Fail> {
        unsafe {
            let ret: libc::c_int = libc::close(self.fd);
            if ret == -1 {
                return Err(Fail::new(libc::EAGAIN, "failed to close shared memory object"));
            }
        }
        self.fd = -1;
        Ok(())
    }

    fn unlink(&mut self) -> Result<(), Fail> {
        unsafe {
            let ret: libc::c_int = libc::shm_unlink(self.name.as_ptr());
            if ret == -1 {
                return Err(Fail::new(libc::EAGAIN, "failed to unlink shared memory object"));
            }
        }
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop trait implementation.
impl Drop for SharedMemory {
    fn drop(&mut self) {
        // 1) Unmap the underlying object from the address space of the calling process.
        match self.unmap() {
            Ok(_) => {},
            Err(e) => eprintln!("{}", e),
        };
        // 2) Close the underlying object.
        match self.close() {
            Ok(_) => {},
            Err(e) => eprintln!("{}", e),
        }
        // 3) Remove the underlying object name link.
        if self.was_created {
            match self.unlink() {
                Ok(_) => {},
                Err(e) => eprintln!("{}", e),
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::SharedMemory;
    use ::anyhow::Result;

    const SHM_SIZE: usize = 4096;

    fn unique_name(tag: &str) -> String {
        format!("/spindle-shm-test-{}-{}", tag, std::process::id())
    }

    /// Tests if we succeed to create, map, and re-open a shared memory object.
    #[test]
    fn create_open_map() -> Result<()> {
        let name: String = unique_name("create");
        let mut created: SharedMemory = SharedMemory::create(&name, SHM_SIZE)?;
        crate::ensure_eq!(created.size(), SHM_SIZE);
        let base: *mut u8 = created.map()?;
        crate::ensure_eq!(base.is_null(), false);

        let mut opened: SharedMemory = SharedMemory::open(&name, SHM_SIZE)?;
        let peer: *mut u8 = opened.map()?;

        // Both mappings alias the same physical pages.
        unsafe {
            base.write(0x5a);
            crate::ensure_eq!(peer.read(), 0x5a);
        }

        Ok(())
    }

    /// Tests that opening a nonexistent object times out.
    #[test]
    fn open_missing() -> Result<()> {
        let name: String = unique_name("missing");
        crate::ensure_eq!(SharedMemory::open_retry(&name, SHM_SIZE, 4).is_err(), true);
        Ok(())
    }
}
