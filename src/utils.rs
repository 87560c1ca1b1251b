use anyhow::{Context, Result, anyhow};
use nix::unistd::{SysconfVar, mkdtemp, sysconf};
use std::{
    ffi::CString,
    path::{Path, PathBuf},
};

/// Returns the system page size.
pub fn page_size() -> Result<usize> {
    match sysconf(SysconfVar::PAGE_SIZE)? {
        Some(size) if size > 0 => Ok(size as usize),
        Some(_) => Err(anyhow!("PAGE_SIZE returned non-positive value")),
        None => Err(anyhow!("PAGE_SIZE is not defined on this system")),
    }
}

/// Creates a uniquely named directory `<parent>/<prefix>XXXXXX`.
pub fn make_temp_dir(parent: &Path, prefix: &str) -> Result<PathBuf> {
    let template = parent.join(format!("{prefix}XXXXXX"));
    mkdtemp(&template)
        .with_context(|| format!("mkdtemp failed for template {}", template.display()))
}

/// Converts strings for the exec boundary.
pub fn to_cstrings<I, S>(values: I) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|value| {
            CString::new(value.as_ref())
                .with_context(|| format!("{:?} contains a NUL byte", value.as_ref()))
        })
        .collect()
}
