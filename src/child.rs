use crate::{
    capabilities::{CapabilityDropper, log_snapshot, restore_effective},
    channel::Endpoint,
    config::IsolationConfig,
    exec::ExecSpec,
    handshake::child_exchange,
    rootfs::{RootfsBuilder, mount_procfs},
    seccomp::SyscallFilter,
    spawner::Pipeline,
};
use anyhow::{Context, Result};
use nix::{
    sched::{CloneFlags, unshare},
    sys::prctl,
    unistd::{setgroups, sethostname, setresgid, setresuid},
};
use std::convert::Infallible;
use tracing::{debug, warn};

/// Everything the cloned child does between clone and exec.
pub struct ChildPipeline<'a> {
    config: &'a IsolationConfig,
    exec: ExecSpec,
}

impl<'a> ChildPipeline<'a> {
    pub fn new(config: &'a IsolationConfig) -> Result<Self> {
        Ok(Self {
            config,
            exec: ExecSpec::from_config(config)?,
        })
    }

    fn set_hostname(&self) -> Result<()> {
        let Some(hostname) = self.config.hostname.as_deref() else {
            return Ok(());
        };

        if self.config.disable_uts {
            warn!(hostname, "no UTS namespace, hostname left unchanged");
            return Ok(());
        }

        debug!(hostname, "setting hostname");
        sethostname(hostname).with_context(|| format!("Couldn't set hostname to {hostname}"))
    }

    fn build_rootfs(&self) -> Result<()> {
        let Some(builder) = RootfsBuilder::from_config(self.config) else {
            return Ok(());
        };

        if self.config.disable_mount {
            warn!("changing root without a mount namespace affects the host mount table");
        }

        let advisory = builder.build()?;
        for failure in advisory.failures() {
            debug!(
                step = failure.step,
                error = %format!("{:#}", failure.error),
                "root filesystem step skipped"
            );
        }

        if self.config.disable_proc {
            debug!("skipping /proc mount");
            return Ok(());
        }

        debug!("mounting /proc");
        mount_procfs()
    }

    /// Enters a user namespace, waits for the parent to map it, then
    /// switches to the target identity.
    fn adopt_identity(&self, channel: &Endpoint) -> Result<()> {
        let entered = match unshare(CloneFlags::CLONE_NEWUSER) {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "couldn't create user namespace");
                false
            }
        };

        debug!(entered, "reporting user namespace to parent");
        child_exchange(channel, entered).context("user namespace handshake failed")?;

        let uid = self.config.target_uid();
        let gid = self.config.target_gid();
        debug!(%uid, %gid, "switching identity");

        // Permitted capabilities survive the uid switch; exec still clears
        // them for a non-root target.
        prctl::set_keepcaps(true).context("Couldn't set keepcaps")?;

        setresgid(gid, gid, gid).with_context(|| format!("setresgid({gid}) failed"))?;
        setgroups(&[gid]).with_context(|| format!("setgroups([{gid}]) failed"))?;
        setresuid(uid, uid, uid).with_context(|| format!("setresuid({uid}) failed"))?;

        prctl::set_keepcaps(false).context("Couldn't clear keepcaps")?;
        restore_effective()
    }
}

impl Pipeline for ChildPipeline<'_> {
    fn run(&self, channel: Endpoint) -> Result<Infallible> {
        self.set_hostname()?;
        self.build_rootfs()?;

        if self.config.userns_remap {
            self.adopt_identity(&channel)?;
        }

        if !self.config.disable_cgroups {
            debug!("no resource limits configured");
        }

        if self.config.disable_capabilities {
            debug!("capability drop disabled");
        } else {
            CapabilityDropper::default().apply()?;
        }

        if self.config.disable_seccomp {
            debug!("syscall filter disabled");
        } else {
            SyscallFilter::new(self.config.no_new_privs).apply()?;
        }

        log_snapshot("capabilities before exec");

        drop(channel);

        debug!(program = ?self.exec.program(), "starting execution of process");
        self.exec.exec()
    }
}
