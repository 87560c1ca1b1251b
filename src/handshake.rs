//! User namespace handshake.
//!
//! The child detaches into an empty user namespace and reports whether that
//! worked. The parent, which keeps its privileges, writes the id maps and
//! replies with a verdict. The child adopts its identity only on `Proceed`.

use crate::{
    channel::{Endpoint, Message, NamespaceReport, Verdict},
    error::HandshakeError,
    idmap::{IdMapping, IdentityMapper},
};
use nix::unistd::Pid;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    ChildReported(NamespaceReport),
    ParentMapped,
    Resolved,
    Aborted,
}

/// Parent half. Drives one round-trip for one child.
pub struct ParentHandshake<'a, M: IdentityMapper> {
    endpoint: &'a Endpoint,
    mapper: &'a M,
    pid: Pid,
    uid: u32,
    gid: u32,
    state: HandshakeState,
}

impl<'a, M: IdentityMapper> ParentHandshake<'a, M> {
    pub fn new(endpoint: &'a Endpoint, mapper: &'a M, pid: Pid, uid: u32, gid: u32) -> Self {
        Self {
            endpoint,
            mapper,
            pid,
            uid,
            gid,
            state: HandshakeState::Idle,
        }
    }

    #[inline]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Runs the parent's half and returns the verdict sent to the child.
    pub fn run(&mut self) -> Result<Verdict, HandshakeError> {
        match self.exchange() {
            Ok(verdict) => {
                self.transition(match verdict {
                    Verdict::Proceed => HandshakeState::Resolved,
                    _ => HandshakeState::Aborted,
                });
                Ok(verdict)
            }
            Err(error) => {
                self.transition(HandshakeState::Aborted);
                Err(error)
            }
        }
    }

    fn exchange(&mut self) -> Result<Verdict, HandshakeError> {
        let buf = self.endpoint.receive()?;
        let report = Message::decode_report(&buf)?;
        self.transition(HandshakeState::ChildReported(report));

        let verdict = match report {
            NamespaceReport::Absent => {
                warn!(pid = %self.pid, "child has no user namespace to map");
                Verdict::NamespaceAbsent
            }
            NamespaceReport::Entered => match self.write_mappings() {
                Ok(()) => {
                    self.transition(HandshakeState::ParentMapped);
                    Verdict::Proceed
                }
                Err(error) => {
                    warn!(pid = %self.pid, error = %format!("{error:#}"), "failed to write id maps");
                    Verdict::MappingFailed
                }
            },
        };

        self.endpoint.send(Message::verdict(verdict))?;
        Ok(verdict)
    }

    fn write_mappings(&self) -> anyhow::Result<()> {
        debug!(pid = %self.pid, uid = self.uid, gid = self.gid, "writing id maps");
        self.mapper
            .write_uid_map(self.pid, IdMapping::identity(self.uid))?;
        self.mapper
            .write_gid_map(self.pid, IdMapping::identity(self.gid))?;
        Ok(())
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(from = ?self.state, to = ?next, "handshake");
        self.state = next;
    }
}

/// Child half: reports `entered`, then blocks for the parent's verdict.
///
/// Returns `Ok` only when the parent allowed the identity change.
pub fn child_exchange(endpoint: &Endpoint, entered: bool) -> Result<(), HandshakeError> {
    let report = match entered {
        true => NamespaceReport::Entered,
        false => NamespaceReport::Absent,
    };

    debug!(?report, "reporting user namespace to parent");
    endpoint.send(Message::ChildReport(report))?;

    debug!("waiting for parent");
    let buf = endpoint.receive()?;
    let code = Message::decode_result(&buf)?;
    debug!(code, "got response from parent");

    match code {
        0 => Ok(()),
        code => Err(HandshakeError::Refused(code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use anyhow::{Result, bail};
    use nix::unistd::write;
    use std::{os::fd::AsFd, sync::Mutex, thread};

    #[derive(Default)]
    struct RecordingMapper {
        fail: bool,
        writes: Mutex<Vec<(&'static str, IdMapping)>>,
    }

    impl IdentityMapper for RecordingMapper {
        fn write_uid_map(&self, _pid: Pid, mapping: IdMapping) -> Result<()> {
            if self.fail {
                bail!("permission denied");
            }
            self.writes.lock().unwrap().push(("uid", mapping));
            Ok(())
        }

        fn write_gid_map(&self, _pid: Pid, mapping: IdMapping) -> Result<()> {
            self.writes.lock().unwrap().push(("gid", mapping));
            Ok(())
        }
    }

    fn run_both(
        mapper: &RecordingMapper,
        entered: bool,
    ) -> Result<(
        Result<Verdict, HandshakeError>,
        HandshakeState,
        Result<(), HandshakeError>,
    )> {
        let (parent, child) = Channel::new()?.split();
        let pid = Pid::from_raw(4242);

        Ok(thread::scope(|scope| {
            let child = scope.spawn(move || child_exchange(&child, entered));

            let mut handshake = ParentHandshake::new(&parent, mapper, pid, 1000, 1000);
            let verdict = handshake.run();
            let state = handshake.state();

            (verdict, state, child.join().unwrap())
        }))
    }

    #[test]
    fn test_round_trip_maps_identity() -> Result<()> {
        let mapper = RecordingMapper::default();
        let (verdict, state, child) = run_both(&mapper, true)?;

        assert_eq!(verdict?, Verdict::Proceed);
        assert_eq!(state, HandshakeState::Resolved);
        assert!(child.is_ok());
        assert_eq!(
            *mapper.writes.lock().unwrap(),
            [
                ("uid", IdMapping::identity(1000)),
                ("gid", IdMapping::identity(1000))
            ]
        );
        Ok(())
    }

    #[test]
    fn test_failed_mapping_refuses_child() -> Result<()> {
        let mapper = RecordingMapper {
            fail: true,
            ..Default::default()
        };
        let (verdict, state, child) = run_both(&mapper, true)?;

        assert_eq!(verdict?, Verdict::MappingFailed);
        assert_eq!(state, HandshakeState::Aborted);
        assert!(matches!(child, Err(HandshakeError::Refused(1))));
        assert!(mapper.writes.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn test_absent_namespace_still_completes_round_trip() -> Result<()> {
        let mapper = RecordingMapper::default();
        let (verdict, state, child) = run_both(&mapper, false)?;

        assert_eq!(verdict?, Verdict::NamespaceAbsent);
        assert_eq!(state, HandshakeState::Aborted);
        assert!(matches!(child, Err(HandshakeError::Refused(2))));
        assert!(mapper.writes.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn test_truncated_report_aborts_parent() -> Result<()> {
        let (parent, child) = Channel::new()?.split();
        let mapper = RecordingMapper::default();

        write(child.as_fd(), &[1u8, 0])?;

        let mut handshake = ParentHandshake::new(&parent, &mapper, Pid::from_raw(1), 0, 0);
        let result = handshake.run();

        assert!(matches!(
            result,
            Err(HandshakeError::ShortTransfer { actual: 2, .. })
        ));
        assert_eq!(handshake.state(), HandshakeState::Aborted);
        assert!(mapper.writes.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn test_truncated_verdict_aborts_child() -> Result<()> {
        let (parent, child) = Channel::new()?.split();

        let result = thread::scope(|scope| {
            let child = scope.spawn(move || child_exchange(&child, true));

            let _report = parent.receive();
            write(parent.as_fd(), &[0u8, 0]).map(|_| ())?;

            anyhow::Ok(child.join().unwrap())
        })?;

        assert!(matches!(
            result,
            Err(HandshakeError::ShortTransfer {
                op: "read",
                actual: 2,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_parent_hangup_aborts_child() -> Result<()> {
        let (parent, child) = Channel::new()?.split();

        let result = thread::scope(|scope| {
            let child = scope.spawn(move || child_exchange(&child, true));
            let _report = parent.receive();
            drop(parent);
            child.join().unwrap()
        });

        assert!(matches!(result, Err(HandshakeError::PeerClosed)));
        Ok(())
    }
}
