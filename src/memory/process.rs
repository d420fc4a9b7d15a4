//! Reads the memory of a live, stopped process.

use alloc::{collections::BTreeMap, string::String};
use core::ffi;

use super::{MemoryError, MemoryView};
use crate::{stdext::with_last_os_error_str, Addr};

/// Uses [`process_vm_readv`](https://man7.org/linux/man-pages/man2/process_vm_readv.2.html)
/// to read, and `process_vm_writev` to write, another process's memory.
///
/// This needs the same permissions as ptrace. The registers of the walked
/// thread are captured by the caller (usually with `PTRACE_GETREGS`) and
/// handed in by name.
#[derive(Debug)]
pub struct ProcessMemory {
    pid: libc::pid_t,
    registers: BTreeMap<String, u64>,
}

impl ProcessMemory {
    pub fn new(pid: libc::pid_t) -> Self {
        Self {
            pid,
            registers: BTreeMap::new(),
        }
    }

    pub fn with_register(mut self, name: &str, value: u64) -> Self {
        self.registers.insert(name.into(), value);
        self
    }
}

impl MemoryView for ProcessMemory {
    fn read_bytes(&self, address: Addr, buf: &mut [u8]) -> Result<(), MemoryError> {
        let err = MemoryError {
            address,
            width: buf.len(),
        };
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast::<ffi::c_void>(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: usize::try_from(address.0).map_err(|_| err)? as *mut ffi::c_void,
            iov_len: buf.len(),
        };

        // SAFETY: both iovecs describe exactly one buffer; the local one is
        // borrowed mutably for the duration of the call.
        let read = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        if read < 0 {
            with_last_os_error_str(|msg| {
                trace!(pid = self.pid, ?address, "process_vm_readv failed: {msg}")
            });
            return Err(err);
        }
        if read as usize != buf.len() {
            trace!(pid = self.pid, ?address, read, "short read");
            return Err(err);
        }
        Ok(())
    }

    fn write_bytes(&self, address: Addr, bytes: &[u8]) -> Result<(), MemoryError> {
        let err = MemoryError {
            address,
            width: bytes.len(),
        };
        let local = libc::iovec {
            iov_base: bytes.as_ptr() as *mut ffi::c_void,
            iov_len: bytes.len(),
        };
        let remote = libc::iovec {
            iov_base: usize::try_from(address.0).map_err(|_| err)? as *mut ffi::c_void,
            iov_len: bytes.len(),
        };

        // SAFETY: process_vm_writev only reads from the local iovec.
        let written = unsafe { libc::process_vm_writev(self.pid, &local, 1, &remote, 1, 0) };
        if written < 0 || written as usize != bytes.len() {
            with_last_os_error_str(|msg| {
                trace!(pid = self.pid, ?address, "process_vm_writev failed: {msg}")
            });
            return Err(err);
        }
        Ok(())
    }

    fn register(&self, name: &str) -> Option<u64> {
        self.registers.get(name).copied()
    }
}
