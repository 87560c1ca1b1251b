//! The parent/child rendezvous channel.
//!
//! Exactly two fixed-width messages ever cross it, one per direction:
//! the child's namespace report and the parent's verdict. Each is a single
//! 4-byte signed integer with no framing.

use crate::error::HandshakeError;
use anyhow::{Context, Result};
use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use nix::{
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::socket::{AddressFamily, SockFlag, SockType, socketpair},
    unistd::{read, write},
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::{
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    time::Duration,
};

/// Width of every message on the wire.
pub const MESSAGE_LEN: usize = std::mem::size_of::<i32>();

const WIRE: Configuration<LittleEndian, Fixint, NoLimit> = bincode::config::standard()
    .with_little_endian()
    .with_fixed_int_encoding();

/// Child to parent: did the child manage to enter a new user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum NamespaceReport {
    Absent = 0,
    Entered = 1,
}

/// Parent to child: may the child adopt its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum Verdict {
    Proceed = 0,
    MappingFailed = 1,
    NamespaceAbsent = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    ChildReport(NamespaceReport),
    ParentResult(i32),
}

impl Message {
    pub fn verdict(verdict: Verdict) -> Self {
        Message::ParentResult(verdict.into())
    }

    fn code(self) -> i32 {
        match self {
            Message::ChildReport(report) => report.into(),
            Message::ParentResult(code) => code,
        }
    }

    pub fn encode(self) -> Result<[u8; MESSAGE_LEN], HandshakeError> {
        let mut buf = [0u8; MESSAGE_LEN];
        let written = bincode::encode_into_slice(self.code(), &mut buf, WIRE)?;
        debug_assert_eq!(written, MESSAGE_LEN);
        Ok(buf)
    }

    pub fn decode_report(buf: &[u8; MESSAGE_LEN]) -> Result<NamespaceReport, HandshakeError> {
        let code = decode_code(buf)?;
        NamespaceReport::try_from(code).map_err(|_| HandshakeError::UnexpectedReport(code))
    }

    /// Any code is a valid result; only zero means proceed.
    pub fn decode_result(buf: &[u8; MESSAGE_LEN]) -> Result<i32, HandshakeError> {
        decode_code(buf)
    }
}

fn decode_code(buf: &[u8; MESSAGE_LEN]) -> Result<i32, HandshakeError> {
    let (code, _) = bincode::decode_from_slice::<i32, _>(buf, WIRE)?;
    Ok(code)
}

/// One side of the channel.
#[derive(Debug)]
pub struct Endpoint {
    fd: OwnedFd,
    timeout: Option<Duration>,
}

impl Endpoint {
    fn new(fd: OwnedFd) -> Self {
        Self { fd, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn send(&self, message: Message) -> Result<(), HandshakeError> {
        let buf = message.encode()?;
        let n = write(&self.fd, &buf)?;

        if n != MESSAGE_LEN {
            return Err(HandshakeError::ShortTransfer {
                op: "write",
                expected: MESSAGE_LEN,
                actual: n,
            });
        }

        Ok(())
    }

    /// Reads exactly one message worth of bytes.
    pub fn receive(&self) -> Result<[u8; MESSAGE_LEN], HandshakeError> {
        self.wait_readable()?;

        // One spare byte so an oversized datagram is caught instead of truncated.
        let mut buf = [0u8; MESSAGE_LEN + 1];
        let n = read(&self.fd, &mut buf)?;

        match n {
            0 => Err(HandshakeError::PeerClosed),
            MESSAGE_LEN => {
                let mut message = [0u8; MESSAGE_LEN];
                message.copy_from_slice(&buf[..MESSAGE_LEN]);
                Ok(message)
            }
            actual => Err(HandshakeError::ShortTransfer {
                op: "read",
                expected: MESSAGE_LEN,
                actual,
            }),
        }
    }

    fn wait_readable(&self) -> Result<(), HandshakeError> {
        let Some(timeout) = self.timeout else {
            return Ok(());
        };

        let poll_timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, poll_timeout)? {
            0 => Err(HandshakeError::Timeout(timeout)),
            _ => Ok(()),
        }
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Both endpoints, straight out of `socketpair`.
#[derive(Debug)]
pub struct Channel {
    parent: Endpoint,
    child: Endpoint,
}

impl Channel {
    pub fn new() -> Result<Self> {
        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .context("Failed to create handshake socketpair")?;

        Ok(Self {
            parent: Endpoint::new(parent),
            child: Endpoint::new(child),
        })
    }

    pub fn split(self) -> (Endpoint, Endpoint) {
        (self.parent, self.child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout_is_four_le_bytes() -> Result<()> {
        assert_eq!(
            Message::ChildReport(NamespaceReport::Entered).encode()?,
            [1, 0, 0, 0]
        );
        assert_eq!(Message::ParentResult(-1).encode()?, [0xff; 4]);
        assert_eq!(Message::verdict(Verdict::Proceed).encode()?, [0; 4]);
        Ok(())
    }

    #[test]
    fn test_report_rejects_unknown_values() {
        let result = Message::decode_report(&[7, 0, 0, 0]);
        assert!(matches!(result, Err(HandshakeError::UnexpectedReport(7))));
    }

    #[test]
    fn test_any_result_code_decodes() -> Result<()> {
        let buf = Message::ParentResult(42).encode()?;
        assert_eq!(Message::decode_result(&buf)?, 42);
        Ok(())
    }

    #[test]
    fn test_message_crosses_socketpair() -> Result<()> {
        let (parent, child) = Channel::new()?.split();

        child.send(Message::ChildReport(NamespaceReport::Absent))?;
        let buf = parent.receive()?;
        assert_eq!(Message::decode_report(&buf)?, NamespaceReport::Absent);
        Ok(())
    }

    #[test]
    fn test_truncated_write_is_detected() -> Result<()> {
        let (parent, child) = Channel::new()?.split();

        write(child.as_fd(), &[1u8, 0])?;
        let result = parent.receive();
        assert!(matches!(
            result,
            Err(HandshakeError::ShortTransfer {
                op: "read",
                expected: 4,
                actual: 2
            })
        ));
        Ok(())
    }

    #[test]
    fn test_closed_peer_is_detected() -> Result<()> {
        let (parent, child) = Channel::new()?.split();
        drop(child);

        assert!(matches!(parent.receive(), Err(HandshakeError::PeerClosed)));
        Ok(())
    }

    #[test]
    fn test_receive_times_out() -> Result<()> {
        let (parent, _child) = Channel::new()?.split();
        let parent = parent.with_timeout(Some(Duration::from_millis(20)));

        assert!(matches!(parent.receive(), Err(HandshakeError::Timeout(_))));
        Ok(())
    }
}
