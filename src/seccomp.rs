//! Syscall filter installed right before exec.
//!
//! Default action is allow; the rules below deny a fixed set of calls,
//! some only when an argument matches. Denied calls fail with `EPERM`
//! instead of killing the process.

use anyhow::{Context, Result, anyhow, bail};
use nix::libc;
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use std::collections::BTreeMap;
use tracing::debug;
use ArgWidth::{Dword, Qword};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgWidth {
    Dword,
    Qword,
}

impl From<ArgWidth> for SeccompCmpArgLen {
    fn from(width: ArgWidth) -> Self {
        match width {
            ArgWidth::Dword => SeccompCmpArgLen::Dword,
            ArgWidth::Qword => SeccompCmpArgLen::Qword,
        }
    }
}

/// Argument test attached to a rule: `(arg[index] & mask) == value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgMatch {
    pub index: u8,
    pub len: ArgWidth,
    pub mask: u64,
    pub value: u64,
}

impl ArgMatch {
    const fn flag(index: u8, len: ArgWidth, flag: u64) -> Self {
        Self {
            index,
            len,
            mask: flag,
            value: flag,
        }
    }

    const fn equals(index: u8, len: ArgWidth, value: u64) -> Self {
        Self {
            index,
            len,
            mask: u64::MAX,
            value,
        }
    }

    fn condition(&self) -> Result<SeccompCondition> {
        let op = match self.mask {
            u64::MAX => SeccompCmpOp::Eq,
            mask => SeccompCmpOp::MaskedEq(mask),
        };

        SeccompCondition::new(self.index, self.len.into(), op, self.value)
            .map_err(|error| anyhow!("invalid seccomp condition {self:?}: {error}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRule {
    pub syscall: i64,
    pub arg: Option<ArgMatch>,
}

impl SyscallRule {
    const fn always(syscall: i64) -> Self {
        Self { syscall, arg: None }
    }

    const fn when(syscall: i64, arg: ArgMatch) -> Self {
        Self {
            syscall,
            arg: Some(arg),
        }
    }
}

const SETUID_BIT: u64 = libc::S_ISUID as u64;
const SETGID_BIT: u64 = libc::S_ISGID as u64;
const NEWUSER: u64 = libc::CLONE_NEWUSER as u64;
const TIOCSTI: u64 = libc::TIOCSTI as u64;

/// Denied outright or when the argument test matches.
pub const DENIED_SYSCALLS: &[SyscallRule] = &[
    // setuid/setgid executables
    #[cfg(target_arch = "x86_64")]
    SyscallRule::when(libc::SYS_chmod, ArgMatch::flag(1, Dword, SETUID_BIT)),
    #[cfg(target_arch = "x86_64")]
    SyscallRule::when(libc::SYS_chmod, ArgMatch::flag(1, Dword, SETGID_BIT)),
    SyscallRule::when(libc::SYS_fchmod, ArgMatch::flag(1, Dword, SETUID_BIT)),
    SyscallRule::when(libc::SYS_fchmod, ArgMatch::flag(1, Dword, SETGID_BIT)),
    SyscallRule::when(libc::SYS_fchmodat, ArgMatch::flag(2, Dword, SETUID_BIT)),
    SyscallRule::when(libc::SYS_fchmodat, ArgMatch::flag(2, Dword, SETGID_BIT)),
    // nested user namespaces
    SyscallRule::when(libc::SYS_unshare, ArgMatch::flag(0, Qword, NEWUSER)),
    SyscallRule::when(libc::SYS_clone, ArgMatch::flag(0, Qword, NEWUSER)),
    // pushing input into the controlling terminal
    SyscallRule::when(libc::SYS_ioctl, ArgMatch::equals(1, Dword, TIOCSTI)),
    // kernel keyring
    SyscallRule::always(libc::SYS_keyctl),
    SyscallRule::always(libc::SYS_add_key),
    SyscallRule::always(libc::SYS_request_key),
    SyscallRule::always(libc::SYS_ptrace),
    // NUMA placement
    SyscallRule::always(libc::SYS_mbind),
    SyscallRule::always(libc::SYS_migrate_pages),
    SyscallRule::always(libc::SYS_move_pages),
    SyscallRule::always(libc::SYS_set_mempolicy),
    SyscallRule::always(libc::SYS_userfaultfd),
    SyscallRule::always(libc::SYS_perf_event_open),
];

#[derive(Debug, Clone, Copy)]
pub struct SyscallFilter {
    rules: &'static [SyscallRule],
    no_new_privs: bool,
}

impl SyscallFilter {
    pub fn new(no_new_privs: bool) -> Self {
        Self {
            rules: DENIED_SYSCALLS,
            no_new_privs,
        }
    }

    /// Compiles the rule table for the running architecture.
    pub fn compile(&self) -> Result<BpfProgram> {
        let arch = TargetArch::try_from(std::env::consts::ARCH)
            .map_err(|error| anyhow!("unsupported seccomp architecture: {error}"))?;

        let filter = SeccompFilter::new(
            self.rule_map()?,
            SeccompAction::Allow,
            SeccompAction::Errno(libc::EPERM as u32),
            arch,
        )
        .context("Couldn't build seccomp filter")?;

        filter.try_into().context("Couldn't compile seccomp filter")
    }

    fn rule_map(&self) -> Result<BTreeMap<i64, Vec<SeccompRule>>> {
        let mut map: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

        for rule in self.rules {
            let entry = map.entry(rule.syscall).or_default();

            // An empty rule list matches the syscall unconditionally.
            if let Some(arg) = rule.arg {
                let rule = SeccompRule::new(vec![arg.condition()?])
                    .map_err(|error| anyhow!("invalid seccomp rule: {error}"))?;
                entry.push(rule);
            }
        }

        Ok(map)
    }

    /// Compiles and installs the filter. Irreversible for this process.
    pub fn apply(&self) -> Result<()> {
        debug!(
            rules = self.rules.len(),
            no_new_privs = self.no_new_privs,
            "starting filtering of syscalls"
        );

        let program = self.compile()?;
        load_program(&program, self.no_new_privs)
    }
}

/// The process and its children are prevented from gaining new privileges via `execve()`
pub fn apply_no_new_privs() -> Result<()> {
    // SAFETY: PR_SET_NO_NEW_PRIVS takes plain integer arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to set no_new_privs");
    }
    Ok(())
}

/// Loads a compiled program with `prctl(PR_SET_SECCOMP)`.
///
/// Without `no_new_privs` the kernel requires CAP_SYS_ADMIN in the current
/// user namespace.
pub fn load_program(program: &BpfProgram, no_new_privs: bool) -> Result<()> {
    if program.is_empty() {
        bail!("refusing to load an empty seccomp program");
    }

    if no_new_privs {
        apply_no_new_privs()?;
    }

    let len = u16::try_from(program.len()).context("seccomp program too long")?;
    let prog = libc::sock_fprog {
        len,
        // seccompiler's sock_filter has the kernel's layout.
        filter: program.as_ptr() as *mut libc::sock_filter,
    };

    // SAFETY: `prog` points at `len` valid instructions that outlive the call;
    // the kernel copies the program before returning.
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER as libc::c_ulong,
            &prog as *const libc::sock_fprog as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };

    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("Couldn't load seccomp filter");
    }

    debug!(instructions = program.len(), "seccomp filter loaded");
    Ok(())
}
