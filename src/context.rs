use anyhow::{Context, Result, bail};
use nix::unistd::{Gid, Uid, getegid, geteuid, getgid, getuid};
use once_cell::sync::OnceCell;
use std::fmt;

static HOST_CONTEXT: OnceCell<HostContext> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Root,
    Rootless,
    Setuid,
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivilegeLevel::Root => f.write_str("root"),
            PrivilegeLevel::Rootless => f.write_str("rootless"),
            PrivilegeLevel::Setuid => f.write_str("setuid"),
        }
    }
}

/// Identity of the invoking process, captured once before anything is spawned.
#[derive(Debug, Clone, Copy)]
pub struct HostContext {
    ruid: Uid,
    euid: Uid,
    rgid: Gid,
    egid: Gid,
    level: PrivilegeLevel,
}

impl HostContext {
    /// Captures the context. Later calls return the first snapshot.
    pub fn init() -> Result<&'static Self> {
        HOST_CONTEXT
            .get_or_try_init(Self::capture)
            .context("Failed to capture host context")
    }

    /// The captured context, if `init` has run.
    pub fn get() -> Option<&'static Self> {
        HOST_CONTEXT.get()
    }

    #[inline]
    pub fn ruid(&self) -> Uid {
        self.ruid
    }

    #[inline]
    pub fn euid(&self) -> Uid {
        self.euid
    }

    #[inline]
    pub fn rgid(&self) -> Gid {
        self.rgid
    }

    #[inline]
    pub fn egid(&self) -> Gid {
        self.egid
    }

    #[inline]
    pub fn privilege_level(&self) -> PrivilegeLevel {
        self.level
    }

    /// Whether this process can write arbitrary id mappings for a child.
    #[inline]
    pub fn can_map_identities(&self) -> bool {
        self.euid.is_root()
    }

    fn capture() -> Result<Self> {
        let ruid = getuid();
        let euid = geteuid();

        let level = if ruid != euid {
            if !euid.is_root() {
                bail!("setuid binary must elevate to root (euid=0), but got euid={euid}");
            }
            PrivilegeLevel::Setuid
        } else if euid.is_root() {
            PrivilegeLevel::Root
        } else {
            PrivilegeLevel::Rootless
        };

        Ok(Self {
            ruid,
            euid,
            rgid: getgid(),
            egid: getegid(),
            level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() -> Result<()> {
        let first = HostContext::init()?;
        let second = HostContext::init()?;

        assert!(std::ptr::eq(first, second));
        assert_eq!(first.ruid(), getuid());
        assert_eq!(first.euid(), geteuid());
        assert!(HostContext::get().is_some());
        Ok(())
    }

    #[test]
    fn test_level_matches_effective_uid() -> Result<()> {
        let context = HostContext::init()?;
        let expected = if getuid() != geteuid() {
            PrivilegeLevel::Setuid
        } else if geteuid().is_root() {
            PrivilegeLevel::Root
        } else {
            PrivilegeLevel::Rootless
        };

        assert_eq!(context.privilege_level(), expected);
        assert_eq!(context.can_map_identities(), geteuid().is_root());
        Ok(())
    }
}
