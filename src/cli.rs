use crate::config::IsolationConfig;
use clap::{Args, Parser};
use std::{path::PathBuf, time::Duration};

const HEADING_NAMESPACES: &str = "Namespaces";
const HEADING_FILESYSTEM: &str = "Filesystem";
const HEADING_IDENTITY: &str = "Identity";
const HEADING_SECURITY: &str = "Security";
const HEADING_ENVIRONMENT: &str = "Environment";
const HEADING_DEBUG: &str = "Debug";

#[derive(Parser, Debug)]
#[command(
    name = "tinybox",
    version,
    about = "Run a program inside fresh namespaces with reduced privileges",
    after_help = "Examples:\n\n    sudo tinybox --privileged --rootfs=/tmp/busybox /bin/sh\n"
)]
pub struct Cli {
    #[command(flatten)]
    pub namespace: NamespaceOptions,

    #[command(flatten)]
    pub filesystem: FilesystemOptions,

    #[command(flatten)]
    pub identity: IdentityOptions,

    #[command(flatten)]
    pub security: SecurityOptions,

    #[command(flatten)]
    pub env: EnvOptions,

    #[command(flatten)]
    pub debug: DebugOptions,

    /// Program to execute followed by its arguments
    #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct NamespaceOptions {
    #[arg(long, help = "Disable new mount namespace", help_heading = HEADING_NAMESPACES)]
    pub disable_mount: bool,

    #[arg(long, help = "Disable new PID namespace", help_heading = HEADING_NAMESPACES)]
    pub disable_pid: bool,

    #[arg(long, help = "Disable new IPC namespace", help_heading = HEADING_NAMESPACES)]
    pub disable_ipc: bool,

    #[arg(long, help = "Disable new network namespace", help_heading = HEADING_NAMESPACES)]
    pub disable_net: bool,

    #[arg(long, help = "Disable new UTS namespace", help_heading = HEADING_NAMESPACES)]
    pub disable_uts: bool,

    #[arg(long, help = "Disable resource groups", help_heading = HEADING_NAMESPACES)]
    pub disable_cgroups: bool,

    #[arg(
        long,
        help = "Hostname inside the new UTS namespace",
        help_heading = HEADING_NAMESPACES,
        conflicts_with = "disable_uts"
    )]
    pub hostname: Option<String>,
}

#[derive(Args, Debug)]
pub struct FilesystemOptions {
    #[arg(long, help = "Absolute path to a root filesystem", help_heading = HEADING_FILESYSTEM)]
    pub rootfs: Option<PathBuf>,

    #[arg(
        long,
        help = "Mount the root filesystem read-only",
        help_heading = HEADING_FILESYSTEM,
        requires = "rootfs"
    )]
    pub readonly: bool,

    #[arg(
        long,
        help = "Absolute path inside the rootfs where the old root is exposed",
        help_heading = HEADING_FILESYSTEM,
        requires = "rootfs"
    )]
    pub old_rootfs: Option<PathBuf>,

    #[arg(long, help = "Do not mount a fresh /proc", help_heading = HEADING_FILESYSTEM)]
    pub disable_proc: bool,
}

#[derive(Args, Debug)]
pub struct IdentityOptions {
    #[arg(long, help = "Enable user namespace remapping", help_heading = HEADING_IDENTITY)]
    pub userns_remap: bool,

    #[arg(
        long,
        default_value_t = 0,
        help = "Uid to adopt after remapping",
        help_heading = HEADING_IDENTITY
    )]
    pub uid: u32,

    #[arg(
        long,
        help = "Gid to adopt after remapping (defaults to the uid)",
        help_heading = HEADING_IDENTITY
    )]
    pub gid: Option<u32>,

    #[arg(
        long,
        value_name = "SECONDS",
        help = "Give up on the remapping handshake after this long",
        help_heading = HEADING_IDENTITY,
        requires = "userns_remap"
    )]
    pub handshake_timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SecurityOptions {
    #[arg(
        long,
        help = "Disable capability dropping and syscall filtering",
        help_heading = HEADING_SECURITY
    )]
    pub privileged: bool,

    #[arg(
        long,
        help = "Set no_new_privs before loading the syscall filter",
        help_heading = HEADING_SECURITY
    )]
    pub no_new_privs: bool,
}

#[derive(Args, Debug)]
pub struct EnvOptions {
    #[arg(
        long = "env",
        value_name = "KEY=VALUE",
        help = "Environment variable for the program (repeatable)",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub vars: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DebugOptions {
    #[arg(long, help = "Enable debug messages", help_heading = HEADING_DEBUG)]
    pub debug: bool,
}

impl From<Cli> for IsolationConfig {
    fn from(cli: Cli) -> Self {
        let mut command = cli.command.into_iter();
        let program = command.next().unwrap_or_default();

        let mut config = IsolationConfig::new(program)
            .with_args(command)
            .with_env(cli.env.vars)
            .privileged(cli.security.privileged);

        let uid = cli.identity.uid;
        let gid = cli.identity.gid.unwrap_or(uid);
        if cli.identity.userns_remap {
            config = config.with_identity(uid, gid);
        } else {
            config.uid = uid;
            config.gid = gid;
        }
        config.handshake_timeout = cli.identity.handshake_timeout.map(Duration::from_secs);

        if let Some(rootfs) = cli.filesystem.rootfs {
            config = config.with_rootfs(rootfs);
        }
        config.old_rootfs = cli.filesystem.old_rootfs;
        config.readonly = cli.filesystem.readonly;
        config.disable_proc = cli.filesystem.disable_proc;

        config.disable_mount = cli.namespace.disable_mount;
        config.disable_pid = cli.namespace.disable_pid;
        config.disable_ipc = cli.namespace.disable_ipc;
        config.disable_net = cli.namespace.disable_net;
        config.disable_uts = cli.namespace.disable_uts;
        config.disable_cgroups = cli.namespace.disable_cgroups;
        config.hostname = cli.namespace.hostname;

        config.no_new_privs = cli.security.no_new_privs;
        config.debug = cli.debug.debug;

        config
    }
}
