use crate::{
    channel::{Channel, Endpoint, Verdict},
    checks::ensure_namespaces_supported,
    error::{ChildStatus, HandshakeError, SpawnError},
    handshake::ParentHandshake,
    idmap::{IdentityMapper, ProcIdMapper},
    stack::ChildStack,
};
use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    sched::{CloneFlags, clone},
    sys::{
        signal::{Signal, kill},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use std::{
    cell::{Cell, RefCell},
    convert::Infallible,
    time::Duration,
};
use tracing::{debug, error, info_span, warn};

const STACK_SIZE: usize = 1024 * 1024;

/// What runs inside the cloned child.
pub trait Pipeline {
    /// Runs to completion in the child. Returns only on failure; success
    /// means the process image was replaced.
    fn run(&self, channel: Endpoint) -> Result<Infallible>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

pub struct SpawnerBuilder<P: Pipeline, M: IdentityMapper = ProcIdMapper> {
    target: P,
    mapper: M,
    flags: CloneFlags,
    remap: Option<Identity>,
    timeout: Option<Duration>,
    stack_bytes: usize,
}

impl<P: Pipeline> SpawnerBuilder<P> {
    pub fn new(target: P) -> Self {
        Self {
            target,
            mapper: ProcIdMapper,
            flags: CloneFlags::empty(),
            remap: None,
            timeout: None,
            stack_bytes: STACK_SIZE,
        }
    }
}

impl<P: Pipeline, M: IdentityMapper> SpawnerBuilder<P, M> {
    #[cfg(test)]
    pub fn with_mapper<N: IdentityMapper>(self, mapper: N) -> SpawnerBuilder<P, N> {
        SpawnerBuilder {
            target: self.target,
            mapper,
            flags: self.flags,
            remap: self.remap,
            timeout: self.timeout,
            stack_bytes: self.stack_bytes,
        }
    }

    pub fn with_flags(mut self, flags: CloneFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Run the user namespace handshake for this identity.
    pub fn with_remap(mut self, remap: Option<Identity>) -> Self {
        self.remap = remap;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Spawner<P, M> {
        Spawner {
            target: self.target,
            mapper: self.mapper,
            flags: self.flags,
            remap: self.remap,
            timeout: self.timeout,
            stack_bytes: self.stack_bytes,
        }
    }
}

pub struct Spawner<P: Pipeline, M: IdentityMapper = ProcIdMapper> {
    target: P,
    mapper: M,
    flags: CloneFlags,
    remap: Option<Identity>,
    timeout: Option<Duration>,
    stack_bytes: usize,
}

impl<P: Pipeline, M: IdentityMapper> Spawner<P, M> {
    /// Clones the child, drives the handshake, and waits for it.
    ///
    /// `Ok` only for a clean zero exit.
    pub fn spawn(&self) -> Result<ChildStatus, SpawnError> {
        ensure_namespaces_supported(self.flags).map_err(SpawnError::Setup)?;

        let (parent_end, child_end) = Channel::new().map_err(SpawnError::Setup)?.split();
        let parent_slot = RefCell::new(Some(parent_end.with_timeout(self.timeout)));
        let child_slot = RefCell::new(Some(child_end.with_timeout(self.timeout)));

        let mut stack = ChildStack::new(self.stack_bytes).map_err(SpawnError::Setup)?;
        let handle = self
            .clone_child(&mut stack, &parent_slot, &child_slot)
            .map_err(SpawnError::Setup)?;

        // Only the child uses its end from here on.
        drop(child_slot.take());

        let handshake = match (self.remap, parent_slot.take()) {
            (Some(identity), Some(parent_end)) => {
                self.parent_handshake(&parent_end, handle.pid(), identity)
            }
            _ => Ok(()),
        };

        let status = handle.wait().map_err(SpawnError::Setup)?;
        debug!(pid = %handle.pid(), %status, "child terminated");

        handshake?;

        match status.success() {
            true => Ok(status),
            false => Err(SpawnError::Child(status)),
        }
    }

    fn clone_child(
        &self,
        stack: &mut ChildStack,
        parent_slot: &RefCell<Option<Endpoint>>,
        child_slot: &RefCell<Option<Endpoint>>,
    ) -> Result<ProcessHandle> {
        debug!(flags = ?self.flags, "spawning child process with clone");

        let callback = Box::new(|| self.child_main(parent_slot, child_slot));

        // SAFETY: without CLONE_VM the child runs on its own copy of the
        // address space; `stack` outlives the call in the parent.
        let pid = unsafe {
            clone(
                callback,
                stack.as_mut_slice(),
                self.flags,
                Some(Signal::SIGCHLD as i32),
            )
        }
        .context("clone failed")?;

        Ok(ProcessHandle::new(pid))
    }

    fn child_main(
        &self,
        parent_slot: &RefCell<Option<Endpoint>>,
        child_slot: &RefCell<Option<Endpoint>>,
    ) -> isize {
        // Our copy of the parent's end.
        drop(parent_slot.take());

        let Some(endpoint) = child_slot.take() else {
            return 1;
        };

        let _span = info_span!("launcher", side = "child").entered();
        match self.target.run(endpoint) {
            Ok(never) => match never {},
            Err(error) => {
                error!("{error:#}");
                error!("failed to execute child");
                1
            }
        }
    }

    fn parent_handshake(
        &self,
        endpoint: &Endpoint,
        pid: Pid,
        identity: Identity,
    ) -> Result<(), HandshakeError> {
        let _span = info_span!("launcher", side = "parent", child = %pid).entered();
        let mut handshake =
            ParentHandshake::new(endpoint, &self.mapper, pid, identity.uid, identity.gid);

        let verdict = handshake.run();
        debug!(state = ?handshake.state(), "handshake finished");

        match verdict? {
            Verdict::Proceed => Ok(()),
            verdict => Err(HandshakeError::Refused(verdict.into())),
        }
    }
}

/// The spawned child. Reaped on `wait`, or killed and reaped on drop.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    waited: Cell<bool>,
}

impl ProcessHandle {
    #[inline]
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            waited: Cell::new(false),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn wait(&self) -> Result<ChildStatus> {
        let status = loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                result => {
                    break result
                        .with_context(|| format!("Failed to wait for process {}", self.pid))?;
                }
            }
        };

        self.waited.set(true);
        Ok(Self::map_status(status))
    }

    fn map_status(status: WaitStatus) -> ChildStatus {
        match status {
            WaitStatus::Exited(_, code) => ChildStatus::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ChildStatus::Signaled(signal),
            other => ChildStatus::Other(format!("{other:?}")),
        }
    }

    fn try_wait(&self) -> Result<Option<ChildStatus>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))
            .with_context(|| format!("Failed to check status of process {}", self.pid))?
        {
            WaitStatus::StillAlive => Ok(None),
            status => {
                self.waited.set(true);
                Ok(Some(Self::map_status(status)))
            }
        }
    }

    pub fn terminate(&self) -> Result<()> {
        if self.waited.get() || self.try_wait()?.is_some() {
            return Ok(());
        }

        kill(self.pid, Signal::SIGKILL)
            .with_context(|| format!("Failed to kill process {}", self.pid))?;
        self.wait()?;
        Ok(())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.waited.get() {
            return;
        }

        warn!(pid = %self.pid, "child still running on drop, killing it");
        if let Err(error) = self.terminate() {
            warn!(pid = %self.pid, error = %format!("{error:#}"), "failed to reap child");
        }
    }
}
