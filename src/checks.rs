use anyhow::{Result, bail};
use nix::sched::CloneFlags;
use std::path::Path;

const NAMESPACE_ENTRIES: [(CloneFlags, &str); 6] = [
    (CloneFlags::CLONE_NEWNS, "mnt"),
    (CloneFlags::CLONE_NEWPID, "pid"),
    (CloneFlags::CLONE_NEWIPC, "ipc"),
    (CloneFlags::CLONE_NEWNET, "net"),
    (CloneFlags::CLONE_NEWUTS, "uts"),
    (CloneFlags::CLONE_NEWUSER, "user"),
];

pub fn is_namespace_supported(flag: CloneFlags) -> bool {
    NAMESPACE_ENTRIES
        .iter()
        .find(|(candidate, _)| *candidate == flag)
        .is_some_and(|(_, ns)| Path::new("/proc/self/ns").join(ns).exists())
}

/// Fails on the first requested namespace the kernel does not provide.
pub fn ensure_namespaces_supported(flags: CloneFlags) -> Result<()> {
    for (flag, ns) in NAMESPACE_ENTRIES {
        if flags.contains(flag) && !is_namespace_supported(flag) {
            bail!("Kernel doesn't support the {ns} namespace ({flag:?})");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_flags_always_supported() {
        assert!(ensure_namespaces_supported(CloneFlags::empty()).is_ok());
    }

    #[test]
    fn test_unknown_flag_is_unsupported() {
        assert!(!is_namespace_supported(CloneFlags::CLONE_VM));
    }

    #[test]
    fn test_mount_namespace_matches_procfs() {
        let expected = Path::new("/proc/self/ns/mnt").exists();
        assert_eq!(is_namespace_supported(CloneFlags::CLONE_NEWNS), expected);
    }
}
