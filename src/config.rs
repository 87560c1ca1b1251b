use crate::error::ConfigError;
use nix::{
    sched::CloneFlags,
    unistd::{Gid, Uid},
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Everything the pipeline needs to know about one launch.
///
/// Built once by the front end, validated, then only ever read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationConfig {
    // Identity
    pub uid: u32,
    pub gid: u32,
    pub userns_remap: bool,

    // Filesystem
    pub rootfs: Option<PathBuf>,
    pub old_rootfs: Option<PathBuf>,
    pub readonly: bool,

    // Namespaces
    pub disable_mount: bool,
    pub disable_pid: bool,
    pub disable_ipc: bool,
    pub disable_net: bool,
    pub disable_uts: bool,
    pub disable_proc: bool,
    pub disable_cgroups: bool,
    pub hostname: Option<String>,

    // Privileges
    pub disable_capabilities: bool,
    pub disable_seccomp: bool,
    pub no_new_privs: bool,

    // Process image
    pub program: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,

    pub handshake_timeout: Option<Duration>,
    pub debug: bool,
}

impl IsolationConfig {
    /// A config that runs `program` with every namespace and every
    /// privilege reduction enabled, and no root change.
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();

        Self {
            uid: 0,
            gid: 0,
            userns_remap: false,
            rootfs: None,
            old_rootfs: None,
            readonly: false,
            disable_mount: false,
            disable_pid: false,
            disable_ipc: false,
            disable_net: false,
            disable_uts: false,
            disable_proc: false,
            disable_cgroups: false,
            hostname: None,
            disable_capabilities: false,
            disable_seccomp: false,
            no_new_privs: false,
            argv: vec![program.clone()],
            program,
            envp: Vec::new(),
            handshake_timeout: None,
            debug: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.truncate(1);
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.envp = env.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rootfs(mut self, rootfs: impl Into<PathBuf>) -> Self {
        self.rootfs = Some(rootfs.into());
        self
    }

    pub fn with_identity(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self.userns_remap = true;
        self
    }

    /// Disables both capability dropping and the syscall filter.
    pub fn privileged(mut self, privileged: bool) -> Self {
        if privileged {
            self.disable_capabilities = true;
            self.disable_seccomp = true;
        }
        self
    }

    /// Disables every namespace created at clone time.
    #[cfg(test)]
    pub fn without_namespaces(mut self) -> Self {
        self.disable_mount = true;
        self.disable_pid = true;
        self.disable_ipc = true;
        self.disable_net = true;
        self.disable_uts = true;
        self
    }

    /// The root path to pivot into, if one was configured and is non-empty.
    pub fn rootfs(&self) -> Option<&Path> {
        self.rootfs
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn old_rootfs(&self) -> Option<&Path> {
        self.old_rootfs
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    #[inline]
    pub fn target_uid(&self) -> Uid {
        Uid::from_raw(self.uid)
    }

    #[inline]
    pub fn target_gid(&self) -> Gid {
        Gid::from_raw(self.gid)
    }

    /// Namespaces created together with the child process.
    ///
    /// The user namespace is never part of this set: the child detaches
    /// into it later so the handshake can run first.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        for (disabled, flag) in self.namespace_mappings() {
            if !disabled {
                flags.insert(flag);
            }
        }

        flags
    }

    fn namespace_mappings(&self) -> [(bool, CloneFlags); 5] {
        [
            (self.disable_mount, CloneFlags::CLONE_NEWNS),
            (self.disable_pid, CloneFlags::CLONE_NEWPID),
            (self.disable_ipc, CloneFlags::CLONE_NEWIPC),
            (self.disable_net, CloneFlags::CLONE_NEWNET),
            (self.disable_uts, CloneFlags::CLONE_NEWUTS),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.is_empty() || self.argv.is_empty() {
            return Err(ConfigError::MissingProgram);
        }

        match self.rootfs() {
            Some(root) => require_absolute("rootfs", root)?,
            None => {
                if self.readonly {
                    return Err(ConfigError::RequiresRootfs("readonly"));
                }
                if self.old_rootfs().is_some() {
                    return Err(ConfigError::RequiresRootfs("old-rootfs"));
                }
            }
        }

        if let Some(old_root) = self.old_rootfs() {
            require_absolute("old-rootfs", old_root)?;
        }

        if let Some(entry) = self.envp.iter().find(|entry| !is_env_entry(entry)) {
            return Err(ConfigError::MalformedEnv(entry.clone()));
        }

        require_no_nul("program", std::iter::once(&self.program))?;
        require_no_nul("argv", self.argv.iter())?;
        require_no_nul("envp", self.envp.iter())?;
        require_no_nul("hostname", self.hostname.iter())?;

        Ok(())
    }
}

fn require_absolute(field: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ConfigError::RelativePath {
            field,
            value: path.display().to_string(),
        })
    }
}

fn require_no_nul<'a, I>(field: &'static str, values: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = &'a String>,
{
    match values.into_iter().any(|value| value.contains('\0')) {
        true => Err(ConfigError::InteriorNul { field }),
        false => Ok(()),
    }
}

fn is_env_entry(entry: &str) -> bool {
    matches!(entry.split_once('='), Some((key, _)) if !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_requests_every_namespace_but_user() {
        let flags = IsolationConfig::new("/bin/sh").clone_flags();

        assert!(flags.contains(
            CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWNET
                | CloneFlags::CLONE_NEWUTS
        ));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn test_toggles_are_independent() {
        let mut config = IsolationConfig::new("/bin/sh");
        config.disable_net = true;
        config.disable_ipc = true;

        let flags = config.clone_flags();
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID));

        assert!(
            IsolationConfig::new("/bin/sh")
                .without_namespaces()
                .clone_flags()
                .is_empty()
        );
    }

    #[test]
    fn test_privileged_disables_both_reductions() {
        let config = IsolationConfig::new("/bin/sh").privileged(true);
        assert!(config.disable_capabilities);
        assert!(config.disable_seccomp);

        let config = IsolationConfig::new("/bin/sh").privileged(false);
        assert!(!config.disable_capabilities);
        assert!(!config.disable_seccomp);
    }

    #[test]
    fn test_argv_starts_with_program() {
        let config = IsolationConfig::new("/bin/echo").with_args(["hello", "world"]);
        assert_eq!(config.argv, ["/bin/echo", "hello", "world"]);
    }

    #[test]
    fn test_empty_rootfs_means_no_root_change() {
        let config = IsolationConfig::new("/bin/sh").with_rootfs("");
        assert_eq!(config.rootfs(), None);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let relative = IsolationConfig::new("/bin/sh").with_rootfs("rootfs");
        assert!(matches!(
            relative.validate(),
            Err(ConfigError::RelativePath { field: "rootfs", .. })
        ));

        let mut readonly = IsolationConfig::new("/bin/sh");
        readonly.readonly = true;
        assert_eq!(
            readonly.validate(),
            Err(ConfigError::RequiresRootfs("readonly"))
        );

        let env = IsolationConfig::new("/bin/sh").with_env(["PATH=/bin", "=oops"]);
        assert_eq!(env.validate(), Err(ConfigError::MalformedEnv("=oops".into())));

        let nul = IsolationConfig::new("/bin/sh").with_args(["a\0b"]);
        assert_eq!(
            nul.validate(),
            Err(ConfigError::InteriorNul { field: "argv" })
        );

        assert_eq!(
            IsolationConfig::new("").validate(),
            Err(ConfigError::MissingProgram)
        );
    }

    #[test]
    fn test_validate_accepts_full_config() {
        let mut config = IsolationConfig::new("/bin/sh")
            .with_rootfs("/srv/busybox")
            .with_identity(1000, 1000)
            .with_env(["HOME=/", "EMPTY="]);
        config.readonly = true;
        config.old_rootfs = Some(PathBuf::from("/oldroot"));

        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.target_uid(), Uid::from_raw(1000));
    }
}
