use anyhow::{Context, Result, bail};
use caps::{CapSet, Capability, CapsHashSet};
use tracing::debug;

/// Capabilities no launched program ever gets back.
pub const DROPPED_CAPABILITIES: [Capability; 20] = [
    Capability::CAP_AUDIT_CONTROL,
    Capability::CAP_AUDIT_READ,
    Capability::CAP_AUDIT_WRITE,
    Capability::CAP_BLOCK_SUSPEND,
    Capability::CAP_DAC_READ_SEARCH,
    Capability::CAP_FSETID,
    Capability::CAP_IPC_LOCK,
    Capability::CAP_MAC_ADMIN,
    Capability::CAP_MAC_OVERRIDE,
    Capability::CAP_MKNOD,
    Capability::CAP_SETFCAP,
    Capability::CAP_SYSLOG,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_BOOT,
    Capability::CAP_SYS_MODULE,
    Capability::CAP_SYS_NICE,
    Capability::CAP_SYS_RAWIO,
    Capability::CAP_SYS_RESOURCE,
    Capability::CAP_SYS_TIME,
    Capability::CAP_WAKE_ALARM,
];

#[derive(Debug, Clone, Copy)]
pub struct CapabilityDropper {
    dropped: &'static [Capability],
}

impl Default for CapabilityDropper {
    fn default() -> Self {
        Self {
            dropped: &DROPPED_CAPABILITIES,
        }
    }
}

impl CapabilityDropper {
    /// Removes the list from the bounding set, then clears it from the
    /// inheritable set.
    pub fn apply(&self) -> Result<()> {
        debug!(count = self.dropped.len(), "dropping capabilities");

        for &capability in self.dropped {
            caps::drop(None, CapSet::Bounding, capability).with_context(|| {
                format!("Couldn't drop capability {capability} from the bounding set")
            })?;
        }

        let leftover = self.still_present(&read_capability_set(CapSet::Bounding)?);
        if !leftover.is_empty() {
            bail!("capabilities still in the bounding set after drop: {leftover:?}");
        }

        debug!("clearing inheritable capabilities");

        let mut inheritable = read_capability_set(CapSet::Inheritable)?;
        self.clear_listed(&mut inheritable);
        caps::set(None, CapSet::Inheritable, &inheritable)
            .context("Couldn't commit inheritable capability set")?;

        debug!("capabilities dropped");
        Ok(())
    }

    fn clear_listed(&self, set: &mut CapsHashSet) {
        for capability in self.dropped {
            set.remove(capability);
        }
    }

    /// Listed capabilities still present in `set`.
    pub fn still_present(&self, set: &CapsHashSet) -> Vec<Capability> {
        self.dropped
            .iter()
            .copied()
            .filter(|capability| set.contains(capability))
            .collect()
    }
}

/// Raises the effective set back to the permitted set, which is kept across
/// a uid change with `PR_SET_KEEPCAPS`.
pub fn restore_effective() -> Result<()> {
    let permitted = read_capability_set(CapSet::Permitted)?;
    caps::set(None, CapSet::Effective, &permitted)
        .context("Couldn't restore effective capability set")
}

fn read_capability_set(cap_set: CapSet) -> Result<CapsHashSet> {
    caps::read(None, cap_set).with_context(|| format!("Failed to read {cap_set:?} capability set"))
}

/// Represents the current state of process capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub effective: CapsHashSet,
    pub permitted: CapsHashSet,
    pub inheritable: CapsHashSet,
    pub bounding: CapsHashSet,
    pub ambient: CapsHashSet,
}

impl CapabilitySnapshot {
    pub fn current() -> Result<Self> {
        Ok(Self {
            effective: read_capability_set(CapSet::Effective)?,
            permitted: read_capability_set(CapSet::Permitted)?,
            inheritable: read_capability_set(CapSet::Inheritable)?,
            bounding: read_capability_set(CapSet::Bounding)?,
            ambient: read_capability_set(CapSet::Ambient)?,
        })
    }
}

impl std::fmt::Display for CapabilitySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "effective={}, ", self.effective.len())?;
        write!(f, "permitted={}, ", self.permitted.len())?;
        write!(f, "inheritable={}, ", self.inheritable.len())?;
        write!(f, "bounding={}, ", self.bounding.len())?;
        write!(f, "ambient={}", self.ambient.len())
    }
}

/// Logs the capability sets at debug level, if they can be read.
pub fn log_snapshot(label: &str) {
    match CapabilitySnapshot::current() {
        Ok(snapshot) => debug!(%snapshot, "{label}"),
        Err(error) => debug!(error = %format!("{error:#}"), "{label}: capabilities unreadable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{
        libc,
        sys::wait::{WaitStatus, waitpid},
        unistd::{ForkResult, fork},
    };
    use std::collections::HashSet;

    #[test]
    fn test_dropped_list_has_no_duplicates() {
        let unique: HashSet<_> = DROPPED_CAPABILITIES.iter().collect();
        assert_eq!(unique.len(), DROPPED_CAPABILITIES.len());
    }

    #[test]
    fn test_dropped_list_keeps_setuid_and_setgid() {
        // Identity adoption runs before the drop and the target may still need them.
        assert!(!DROPPED_CAPABILITIES.contains(&Capability::CAP_SETUID));
        assert!(!DROPPED_CAPABILITIES.contains(&Capability::CAP_SETGID));
    }

    #[test]
    fn test_clear_listed_leaves_others() {
        let dropper = CapabilityDropper::default();
        let mut set: CapsHashSet = [
            Capability::CAP_SYS_ADMIN,
            Capability::CAP_CHOWN,
            Capability::CAP_MKNOD,
        ]
        .into_iter()
        .collect();

        assert_eq!(dropper.still_present(&set).len(), 2);

        dropper.clear_listed(&mut set);
        assert!(dropper.still_present(&set).is_empty());
        assert!(set.contains(&Capability::CAP_CHOWN));
    }

    #[test]
    fn test_snapshot_is_readable() -> Result<()> {
        let snapshot = CapabilitySnapshot::current()?;
        assert!(!snapshot.bounding.is_empty());
        Ok(())
    }

    #[test]
    #[ignore = "requires root"]
    fn test_apply_clears_listed_capabilities() -> Result<()> {
        let dropper = CapabilityDropper::default();

        match unsafe { fork()? } {
            ForkResult::Child => {
                let result = caps::raise(None, CapSet::Inheritable, Capability::CAP_SYS_ADMIN)
                    .context("Couldn't raise inheritable capability")
                    .and_then(|()| dropper.apply())
                    .and_then(|()| CapabilitySnapshot::current());

                let code = match result {
                    Ok(snapshot)
                        if dropper.still_present(&snapshot.bounding).is_empty()
                            && dropper.still_present(&snapshot.inheritable).is_empty()
                            && snapshot.bounding.contains(&Capability::CAP_CHOWN) =>
                    {
                        0
                    }
                    Ok(_) => 11,
                    Err(_) => 10,
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None)?, WaitStatus::Exited(child, 0));
            }
        }

        Ok(())
    }
}
