//! Linux kernel AIO boundary.
//!
//! Thin wrappers over the raw `io_setup`, `io_submit`, `io_getevents` and
//! `io_destroy` system calls. `libc` exposes the syscall numbers but not the
//! ABI structs from `<linux/aio_abi.h>`, so [`Iocb`] and [`IoEvent`] mirror
//! them here.

use std::os::fd::RawFd;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{AioError, AioResult};

/// `IOCB_CMD_PREAD`.
pub const IOCB_CMD_PREAD: u16 = 0;
/// `IOCB_CMD_PWRITE`.
pub const IOCB_CMD_PWRITE: u16 = 1;

/// Kind of asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoOp {
    /// Positional read.
    Read,
    /// Positional write.
    Write,
}

impl IoOp {
    /// Kernel opcode for this operation.
    pub fn opcode(self) -> u16 {
        match self {
            IoOp::Read => IOCB_CMD_PREAD,
            IoOp::Write => IOCB_CMD_PWRITE,
        }
    }

    /// Short name for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            IoOp::Read => "READ",
            IoOp::Write => "WRITE",
        }
    }
}

/// Kernel request descriptor (`struct iocb`).
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Iocb {
    /// Returned untouched in [`IoEvent::data`].
    pub aio_data: u64,
    #[cfg(target_endian = "little")]
    aio_key: u32,
    aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    aio_key: u32,
    /// One of the `IOCB_CMD_*` opcodes.
    pub aio_lio_opcode: u16,
    aio_reqprio: i16,
    /// Target file descriptor.
    pub aio_fildes: u32,
    /// Buffer address.
    pub aio_buf: u64,
    /// Transfer length.
    pub aio_nbytes: u64,
    /// File offset.
    pub aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

impl Iocb {
    /// Prepares a positional read or write.
    pub fn prep(op: IoOp, fd: RawFd, buf: *mut u8, len: u64, offset: u64, data: u64) -> Self {
        Self {
            aio_data: data,
            aio_lio_opcode: op.opcode(),
            aio_fildes: fd as u32,
            aio_buf: buf as u64,
            aio_nbytes: len,
            aio_offset: offset as i64,
            ..Self::default()
        }
    }
}

/// Kernel completion record (`struct io_event`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoEvent {
    /// The submitting request's `aio_data`.
    pub data: u64,
    /// Address of the submitted iocb.
    pub obj: u64,
    /// Bytes transferred, or a negative errno.
    pub res: i64,
    /// Secondary result.
    pub res2: i64,
}

/// The kernel side of the engine: submit one request, reap completions.
///
/// [`LinuxAio`] talks to the kernel; [`MockAio`](crate::mock::MockAio)
/// completes requests in memory for tests.
pub trait AioBackend: Send + Sync {
    /// Submits one prepared request.
    fn submit(&self, iocb: &mut Iocb) -> AioResult<()>;

    /// Waits up to `timeout` for at least one completion and fills `events`.
    ///
    /// Returns the number of events written; zero means the wait timed out.
    fn get_events(&self, events: &mut [IoEvent], timeout: Duration) -> AioResult<usize>;
}

type AioContextId = libc::c_ulong;

/// Kernel AIO context (`aio_context_t`).
pub struct LinuxAio {
    ctx: AioContextId,
    nr_events: u32,
}

impl LinuxAio {
    /// Creates a context able to hold `nr_events` outstanding requests.
    pub fn setup(nr_events: u32) -> AioResult<Self> {
        let mut ctx: AioContextId = 0;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                nr_events as libc::c_long,
                &mut ctx as *mut AioContextId,
            )
        };
        if ret < 0 {
            let err = AioError::last_os_error("io_setup");
            error!("io_setup({}) failed: {}", nr_events, err);
            return Err(err);
        }
        info!("kernel AIO context {:#x} created, nr_events={}", ctx, nr_events);
        Ok(Self { ctx, nr_events })
    }

    /// Number of events the context was sized for.
    pub fn nr_events(&self) -> u32 {
        self.nr_events
    }

    /// Whether kernel AIO can be set up in this process.
    pub fn is_available() -> bool {
        LinuxAio::setup(1).is_ok()
    }
}

impl AioBackend for LinuxAio {
    fn submit(&self, iocb: &mut Iocb) -> AioResult<()> {
        let mut iocbs = [iocb as *mut Iocb];
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                1 as libc::c_long,
                iocbs.as_mut_ptr(),
            )
        };
        match ret {
            1 => Ok(()),
            r if r < 0 => Err(AioError::last_os_error("io_submit")),
            _ => Err(AioError::from_errno("io_submit", libc::EAGAIN)),
        }
    }

    fn get_events(&self, events: &mut [IoEvent], timeout: Duration) -> AioResult<usize> {
        let mut ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                1 as libc::c_long,
                events.len() as libc::c_long,
                events.as_mut_ptr(),
                &mut ts as *mut libc::timespec,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(AioError::SystemCall {
                op: "io_getevents",
                source: err,
            });
        }
        Ok(ret as usize)
    }
}

impl Drop for LinuxAio {
    fn drop(&mut self) {
        let ret = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        if ret < 0 {
            error!(
                "io_destroy({:#x}) failed: {}",
                self.ctx,
                std::io::Error::last_os_error()
            );
        } else {
            debug!("kernel AIO context {:#x} destroyed", self.ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;
    use tempfile::tempdir;

    #[test]
    fn test_abi_sizes() {
        assert_eq!(std::mem::size_of::<Iocb>(), 64);
        assert_eq!(std::mem::size_of::<IoEvent>(), 32);
    }

    #[test]
    fn test_prep_fields() {
        let mut buf = AlignedBuffer::new(4096).unwrap();
        let iocb = Iocb::prep(IoOp::Write, 7, buf.as_mut_ptr(), 4096, 8192, 42);
        assert_eq!(iocb.aio_lio_opcode, IOCB_CMD_PWRITE);
        assert_eq!(iocb.aio_fildes, 7);
        assert_eq!(iocb.aio_nbytes, 4096);
        assert_eq!(iocb.aio_offset, 8192);
        assert_eq!(iocb.aio_data, 42);
        assert_eq!(iocb.aio_buf, buf.as_mut_ptr() as u64);
    }

    #[test]
    fn test_op_names() {
        assert_eq!(IoOp::Read.opcode(), IOCB_CMD_PREAD);
        assert_eq!(IoOp::Read.as_str(), "READ");
        assert_eq!(IoOp::Write.as_str(), "WRITE");
    }

    #[test]
    fn test_linux_aio_write_then_read() {
        if !LinuxAio::is_available() {
            return;
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("aio_raw");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let aio = LinuxAio::setup(8).unwrap();

        let mut data = AlignedBuffer::new(4096).unwrap();
        data.fill(0x5A);
        let mut iocb = Iocb::prep(IoOp::Write, file.as_raw_fd(), data.as_mut_ptr(), 4096, 0, 1);
        aio.submit(&mut iocb).unwrap();

        let mut events = [IoEvent::default(); 4];
        let mut got = 0;
        while got == 0 {
            got = aio.get_events(&mut events, Duration::from_secs(1)).unwrap();
        }
        assert_eq!(events[0].data, 1);
        assert_eq!(events[0].res, 4096);

        let mut back = AlignedBuffer::new(4096).unwrap();
        let mut iocb = Iocb::prep(IoOp::Read, file.as_raw_fd(), back.as_mut_ptr(), 4096, 0, 2);
        aio.submit(&mut iocb).unwrap();
        got = 0;
        while got == 0 {
            got = aio.get_events(&mut events, Duration::from_secs(1)).unwrap();
        }
        assert_eq!(events[0].data, 2);
        assert_eq!(events[0].res, 4096);
        assert!(back.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_get_events_times_out() {
        if !LinuxAio::is_available() {
            return;
        }
        let aio = LinuxAio::setup(4).unwrap();
        let mut events = [IoEvent::default(); 4];
        let n = aio
            .get_events(&mut events, Duration::from_millis(50))
            .unwrap();
        assert_eq!(n, 0);
    }
}
