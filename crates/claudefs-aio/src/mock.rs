//! In-memory [`AioBackend`] for tests.
//!
//! Data moves at submit time against a growable byte vector. The matching
//! completion becomes visible to [`get_events`](AioBackend::get_events) after
//! an optional artificial latency. Submit failures, short transfers and held
//! completions can be injected.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{AioError, AioResult};
use crate::sys::{AioBackend, IoEvent, Iocb, IOCB_CMD_PREAD, IOCB_CMD_PWRITE};

#[derive(Debug, Default)]
struct MockState {
    disk: Vec<u8>,
    pending: VecDeque<(Instant, IoEvent)>,
    latency: Duration,
    hold: bool,
    fail_submits: u32,
    fail_errno: i32,
    short_by: u64,
    submitted: u64,
    reaped: u64,
}

/// Memory-backed stand-in for the kernel AIO context.
#[derive(Debug, Default)]
pub struct MockAio {
    state: Mutex<MockState>,
    ready: Condvar,
}

impl MockAio {
    /// Creates an empty mock disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every subsequent completion by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Fails the next `count` submissions with `errno`.
    pub fn fail_next_submits(&self, count: u32, errno: i32) {
        let mut state = self.state.lock();
        state.fail_submits = count;
        state.fail_errno = errno;
    }

    /// Reports every subsequent transfer as `bytes` shorter than requested.
    pub fn set_short_by(&self, bytes: u64) {
        self.state.lock().short_by = bytes;
    }

    /// While held, completions stay pending and `get_events` only times out.
    pub fn hold_completions(&self, hold: bool) {
        self.state.lock().hold = hold;
        self.ready.notify_all();
    }

    /// Copy of the backing bytes in `offset..offset + len`, zero-filled past the end.
    pub fn read_disk(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let mut out = vec![0u8; len];
        let start = offset as usize;
        if start < state.disk.len() {
            let end = (start + len).min(state.disk.len());
            out[..end - start].copy_from_slice(&state.disk[start..end]);
        }
        out
    }

    /// Requests accepted so far.
    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    /// Completions handed out so far.
    pub fn reaped(&self) -> u64 {
        self.state.lock().reaped
    }

    /// Completions not yet reaped.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl AioBackend for MockAio {
    fn submit(&self, iocb: &mut Iocb) -> AioResult<()> {
        let mut state = self.state.lock();
        if state.fail_submits > 0 {
            state.fail_submits -= 1;
            return Err(AioError::from_errno("io_submit", state.fail_errno));
        }

        let offset = iocb.aio_offset as usize;
        let len = iocb.aio_nbytes as usize;
        let buf = iocb.aio_buf as *mut u8;
        let transferred = match iocb.aio_lio_opcode {
            IOCB_CMD_PWRITE => {
                if state.disk.len() < offset + len {
                    state.disk.resize(offset + len, 0);
                }
                let src = unsafe { std::slice::from_raw_parts(buf as *const u8, len) };
                state.disk[offset..offset + len].copy_from_slice(src);
                len
            }
            IOCB_CMD_PREAD => {
                let available = state.disk.len().saturating_sub(offset).min(len);
                if available > 0 {
                    let dst = unsafe { std::slice::from_raw_parts_mut(buf, available) };
                    dst.copy_from_slice(&state.disk[offset..offset + available]);
                }
                available
            }
            other => {
                return Err(AioError::InvalidArgument(format!(
                    "mock backend does not support opcode {}",
                    other
                )))
            }
        };

        let res = (transferred as u64).saturating_sub(state.short_by) as i64;
        let ready_at = Instant::now() + state.latency;
        let event = IoEvent {
            data: iocb.aio_data,
            obj: iocb as *mut Iocb as u64,
            res,
            res2: 0,
        };
        state.pending.push_back((ready_at, event));
        state.submitted += 1;
        debug!(
            "mock submit: opcode={} offset={} len={} res={}",
            iocb.aio_lio_opcode, offset, len, res
        );
        self.ready.notify_all();
        Ok(())
    }

    fn get_events(&self, events: &mut [IoEvent], timeout: Duration) -> AioResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            let now = Instant::now();
            if !state.hold {
                let mut count = 0;
                while count < events.len() {
                    let ready =
                        matches!(state.pending.front(), Some(&(ready_at, _)) if ready_at <= now);
                    if !ready {
                        break;
                    }
                    if let Some((_, event)) = state.pending.pop_front() {
                        events[count] = event;
                        count += 1;
                    }
                }
                if count > 0 {
                    state.reaped += count as u64;
                    return Ok(count);
                }
            }

            if now >= deadline {
                return Ok(0);
            }
            let wake_at = match state.pending.front() {
                Some(&(ready_at, _)) if !state.hold => ready_at.min(deadline),
                _ => deadline,
            };
            self.ready.wait_until(&mut state, wake_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;
    use crate::sys::IoOp;

    fn reap(mock: &MockAio) -> Vec<IoEvent> {
        let mut events = [IoEvent::default(); 8];
        let n = mock.get_events(&mut events, Duration::from_millis(200)).unwrap();
        events[..n].to_vec()
    }

    #[test]
    fn test_write_then_read() {
        let mock = MockAio::new();
        let mut data = AlignedBuffer::from_slice(&[7u8; 512]).unwrap();
        let mut iocb = Iocb::prep(IoOp::Write, -1, data.as_mut_ptr(), 512, 1024, 3);
        mock.submit(&mut iocb).unwrap();
        assert_eq!(mock.read_disk(1024, 512), vec![7u8; 512]);

        let mut back = AlignedBuffer::new(512).unwrap();
        let mut iocb = Iocb::prep(IoOp::Read, -1, back.as_mut_ptr(), 512, 1024, 4);
        mock.submit(&mut iocb).unwrap();
        assert!(back.iter().all(|&b| b == 7));

        let events = reap(&mock);
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].data, events[0].res), (3, 512));
        assert_eq!((events[1].data, events[1].res), (4, 512));
        assert_eq!(mock.reaped(), 2);
    }

    #[test]
    fn test_read_past_end_is_short() {
        let mock = MockAio::new();
        let mut back = AlignedBuffer::new(512).unwrap();
        let mut iocb = Iocb::prep(IoOp::Read, -1, back.as_mut_ptr(), 512, 0, 1);
        mock.submit(&mut iocb).unwrap();
        assert_eq!(reap(&mock)[0].res, 0);
    }

    #[test]
    fn test_injected_submit_failure() {
        let mock = MockAio::new();
        mock.fail_next_submits(1, libc::EAGAIN);
        let mut data = AlignedBuffer::new(512).unwrap();
        let mut iocb = Iocb::prep(IoOp::Write, -1, data.as_mut_ptr(), 512, 0, 1);
        assert!(matches!(
            mock.submit(&mut iocb),
            Err(AioError::SystemCall { op: "io_submit", .. })
        ));
        assert!(mock.submit(&mut iocb).is_ok());
        assert_eq!(mock.submitted(), 1);
    }

    #[test]
    fn test_hold_and_latency() {
        let mock = MockAio::new();
        mock.hold_completions(true);
        let mut data = AlignedBuffer::new(512).unwrap();
        let mut iocb = Iocb::prep(IoOp::Write, -1, data.as_mut_ptr(), 512, 0, 1);
        mock.submit(&mut iocb).unwrap();
        assert!(reap(&mock).is_empty());
        assert_eq!(mock.pending(), 1);

        mock.hold_completions(false);
        assert_eq!(reap(&mock).len(), 1);

        mock.set_latency(Duration::from_millis(30));
        let start = Instant::now();
        mock.submit(&mut iocb).unwrap();
        assert_eq!(reap(&mock).len(), 1);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_short_transfer_injection() {
        let mock = MockAio::new();
        mock.set_short_by(100);
        let mut data = AlignedBuffer::new(512).unwrap();
        let mut iocb = Iocb::prep(IoOp::Write, -1, data.as_mut_ptr(), 512, 0, 9);
        mock.submit(&mut iocb).unwrap();
        assert_eq!(reap(&mock)[0].res, 412);
    }
}
