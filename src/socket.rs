//! Non-blocking AF_UNIX stream transport with `SCM_RIGHTS` fd passing and
//! partial-frame reassembly.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoSlice;

use crate::error::WireError;

/// Maximum ancillary fds accepted in a single `recvmsg` call. Matches the
/// teacher's own budget, comfortably above anything a real compositor sends
/// in one frame.
const MAX_FDS_IN: usize = 16;
/// Size of the plain-bytes receive buffer per `recvmsg` call.
const RECV_BUF_SIZE: usize = 4096;

/// One frame queued for send: its bytes and the fds that must travel with it
/// as `SCM_RIGHTS`.
pub struct OutgoingFrame {
    pub bytes: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// Owns the socket fd and the send/receive buffering state. Performs no
/// parsing — callers hand it complete frames to send and get back raw bytes
/// plus a queue of received fds.
pub struct Socket {
    stream: UnixStream,
    send_queue: VecDeque<OutgoingFrame>,
    /// Bytes received but not yet consumed into a complete frame.
    partial: Vec<u8>,
    pub incoming_fds: VecDeque<OwnedFd>,
}

/// Outcome of a non-blocking flush attempt.
pub enum FlushResult {
    /// The send queue was fully drained.
    Complete,
    /// The syscall would have blocked; some frames remain queued.
    Partial,
}

/// Outcome of a non-blocking receive attempt.
pub enum RecvResult {
    /// Bytes were appended to the internal partial buffer.
    Data,
    /// Nothing was available right now.
    NoData,
}

impl Socket {
    pub fn new(stream: UnixStream) -> std::io::Result<Socket> {
        stream.set_nonblocking(true)?;
        Ok(Socket { stream, send_queue: VecDeque::new(), partial: Vec::new(), incoming_fds: VecDeque::new() })
    }

    pub fn queue_frame(&mut self, bytes: Vec<u8>, fds: Vec<OwnedFd>) {
        self.send_queue.push_back(OutgoingFrame { bytes, fds });
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    /// Drain the send queue. Pushes the head frame back if the syscall
    /// would block; closes the duplicated fds on successful send (ownership
    /// transferred to the kernel).
    pub fn flush(&mut self) -> Result<FlushResult, WireError> {
        while let Some(frame) = self.send_queue.pop_front() {
            let iov = [IoSlice::new(&frame.bytes)];
            let raw_fds: Vec<std::os::fd::RawFd> =
                frame.fds.iter().map(std::os::fd::AsRawFd::as_raw_fd).collect();
            let cmsgs = if raw_fds.is_empty() { vec![] } else { vec![ControlMessage::ScmRights(&raw_fds)] };
            let result = socket::sendmsg::<()>(
                self.stream.as_fd().as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
                None,
            );
            match result {
                Ok(_) => {
                    // fds are owned by `frame.fds`; dropping it closes the
                    // client-side duplicates now that the kernel has copied
                    // them into the receiving process.
                    drop(frame.fds);
                }
                Err(Errno::EWOULDBLOCK) => {
                    self.send_queue.push_front(frame);
                    return Ok(FlushResult::Partial);
                }
                Err(e) => return Err(WireError::from(e)),
            }
        }
        Ok(FlushResult::Complete)
    }

    /// Issue one non-blocking `recvmsg`. Appends any received bytes to the
    /// internal partial buffer and any received fds to `incoming_fds`.
    pub fn recv(&mut self) -> Result<RecvResult, WireError> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let mut iov = [std::io::IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!([std::os::fd::RawFd; MAX_FDS_IN]);
        let result = socket::recvmsg::<()>(
            self.stream.as_fd().as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::MSG_DONTWAIT,
        );
        match result {
            Ok(msg) => {
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for fd in fds {
                            self.incoming_fds.push_back(unsafe {
                                std::os::fd::OwnedFd::from_raw_fd(fd)
                            });
                        }
                    }
                }
                let n = msg.bytes;
                if n == 0 {
                    return Err(WireError::ServerDisconnected);
                }
                self.partial.extend_from_slice(&buf[..n]);
                Ok(RecvResult::Data)
            }
            Err(Errno::EWOULDBLOCK) => Ok(RecvResult::NoData),
            Err(e) => Err(WireError::from(e)),
        }
    }

    /// Attempt to pull one complete frame's raw bytes out of the partial
    /// buffer, per the reassembler rule in spec.md §4.5: at least 8 bytes of
    /// header, and `size` bytes total available.
    pub fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.partial.len() < 8 {
            return None;
        }
        let word2 = u32::from_ne_bytes(self.partial[4..8].try_into().unwrap());
        let size = (word2 >> 16) as usize;
        if size < 8 || size > self.partial.len() {
            return None;
        }
        let rest = self.partial.split_off(size);
        let frame = std::mem::replace(&mut self.partial, rest);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a frame's 8-byte header the way `wire.rs::write_to_buffer` does:
    /// `object_id` little-endian, then `(size << 16) | opcode` little-endian.
    fn header(object_id: u32, opcode: u16, size: u32) -> Vec<u8> {
        let mut v = object_id.to_ne_bytes().to_vec();
        v.extend_from_slice(&((size << 16) | u32::from(opcode)).to_ne_bytes());
        v
    }

    #[test]
    fn write_read_cycle() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sa = Socket::new(a).unwrap();
        let mut sb = Socket::new(b).unwrap();

        let mut frame = header(1, 0, 12);
        frame.extend_from_slice(&[9, 9, 9, 9]);
        sa.queue_frame(frame, Vec::new());
        matches!(sa.flush().unwrap(), FlushResult::Complete);

        // allow the datagram to land
        std::thread::sleep(std::time::Duration::from_millis(10));
        matches!(sb.recv().unwrap(), RecvResult::Data);
        let frame = sb.take_frame().unwrap();
        assert_eq!(frame.len(), 12);
    }

    #[test]
    fn partial_frame_split_across_two_recvs() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sa = Socket::new(a).unwrap();
        let mut sb = Socket::new(b).unwrap();

        let mut full = header(1, 0, 16);
        full.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        sa.queue_frame(full[..5].to_vec(), Vec::new());
        let _ = sa.flush();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let _ = sb.recv();
        assert!(sb.take_frame().is_none(), "must wait for the rest of the frame");

        sa.queue_frame(full[5..].to_vec(), Vec::new());
        let _ = sa.flush();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let _ = sb.recv();
        let frame = sb.take_frame().expect("frame should be complete now");
        assert_eq!(frame, full);
    }
}
