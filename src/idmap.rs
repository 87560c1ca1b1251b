use anyhow::{Context, Result};
use nix::unistd::Pid;
use std::{fs::OpenOptions, io::Write, path::PathBuf};

/// Single-range identity mapping: `inside outside count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub inside: u32,
    pub outside: u32,
    pub count: u32,
}

impl IdMapping {
    /// Maps `id` onto itself, width one.
    pub fn identity(id: u32) -> Self {
        Self {
            inside: id,
            outside: id,
            count: 1,
        }
    }

    pub fn to_line(self) -> String {
        format!("{} {} {}\n", self.inside, self.outside, self.count)
    }
}

/// Writes identity mappings for a child parked in a fresh user namespace.
pub trait IdentityMapper {
    fn write_uid_map(&self, pid: Pid, mapping: IdMapping) -> Result<()>;
    fn write_gid_map(&self, pid: Pid, mapping: IdMapping) -> Result<()>;
}

/// Writes into `/proc/<pid>/{uid,gid}_map`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcIdMapper;

impl ProcIdMapper {
    fn map_path(pid: Pid, file: &str) -> Result<PathBuf> {
        anyhow::ensure!(pid.as_raw() > 0, "Invalid child pid {pid}");
        Ok(PathBuf::from(format!("/proc/{pid}/{file}")))
    }

    fn write_map(pid: Pid, file: &str, mapping: IdMapping) -> Result<()> {
        let path = Self::map_path(pid, file)?;
        let line = mapping.to_line();

        // The kernel accepts a map in exactly one write(2).
        let mut map = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        map.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write {:?} to {}", line.trim_end(), path.display()))?;

        Ok(())
    }
}

impl IdentityMapper for ProcIdMapper {
    fn write_uid_map(&self, pid: Pid, mapping: IdMapping) -> Result<()> {
        Self::write_map(pid, "uid_map", mapping)
    }

    fn write_gid_map(&self, pid: Pid, mapping: IdMapping) -> Result<()> {
        Self::write_map(pid, "gid_map", mapping)
    }
}
