use crate::{config::IsolationConfig, error::Advisory, utils::make_temp_dir};
use anyhow::{Context, Result};
use nix::{
    mount::{MntFlags, MsFlags, mount, umount2},
    unistd::{chdir, pivot_root},
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

const ROOT: &str = "/";
const TEMP_ROOT: &str = "/tmp";
const STAGING_PREFIX: &str = "tmp.";
const OLD_ROOT_PREFIX: &str = "oldroot.";

/// Where things live around the pivot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotLayout {
    /// Host directory the new root is bind-mounted on.
    staging: PathBuf,
    /// Directory inside `staging` that receives the old root.
    put_old: PathBuf,
}

impl PivotLayout {
    pub fn new(staging: PathBuf, put_old: PathBuf) -> Self {
        Self { staging, put_old }
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    pub fn put_old(&self) -> &Path {
        &self.put_old
    }

    /// The old root as seen from inside the new root, e.g. `/oldroot.abc123`.
    pub fn old_root_view(&self) -> PathBuf {
        let name = self.put_old.file_name().unwrap_or_default();
        Path::new(ROOT).join(name)
    }

    /// The staging directory as seen through the old root view.
    pub fn staging_leftover(&self) -> PathBuf {
        let relative = self.staging.strip_prefix(ROOT).unwrap_or(&self.staging);
        self.old_root_view().join(relative)
    }
}

/// Gives the calling process a private root tree at the configured path.
#[derive(Debug)]
pub struct RootfsBuilder<'a> {
    rootfs: &'a Path,
    old_rootfs: Option<&'a Path>,
    readonly: bool,
    temp_root: &'a Path,
}

impl<'a> RootfsBuilder<'a> {
    /// `None` when no root change is configured.
    pub fn from_config(config: &'a IsolationConfig) -> Option<Self> {
        config.rootfs().map(|rootfs| Self {
            rootfs,
            old_rootfs: config.old_rootfs(),
            readonly: config.readonly,
            temp_root: Path::new(TEMP_ROOT),
        })
    }

    /// Runs the pivot sequence. Fatal steps return `Err`; best-effort ones
    /// end up in the returned `Advisory`.
    pub fn build(&self) -> Result<Advisory> {
        let mut advisory = Advisory::default();

        debug!("remounting / as private");
        make_root_private().context("Couldn't remount '/' as private")?;

        let layout = self.stage()?;

        debug!(
            new = %layout.staging().display(),
            put_old = %layout.put_old().display(),
            "pivoting root"
        );
        if let Err(error) = pivot_root(layout.staging(), layout.put_old()) {
            discard_staging(layout.staging(), Some(layout.put_old()));
            return Err(error).with_context(|| {
                format!(
                    "Couldn't pivot root (new={}, put_old={})",
                    layout.staging().display(),
                    layout.put_old().display()
                )
            });
        }

        chdir(ROOT).context("Couldn't chdir to the new root")?;

        self.release_old_root(&layout, &mut advisory);

        if self.readonly {
            advisory.attempt("remount root read-only", remount_root_readonly);
        }

        Ok(advisory)
    }

    /// Bind-mounts the rootfs onto a fresh staging directory and creates the
    /// old root receptacle inside it.
    fn stage(&self) -> Result<PivotLayout> {
        let staging = make_temp_dir(self.temp_root, STAGING_PREFIX)
            .context("Couldn't create staging directory")?;

        debug!(
            rootfs = %self.rootfs.display(),
            staging = %staging.display(),
            "mounting rootfs to staging directory"
        );
        if let Err(error) = bind_mount_private(self.rootfs, &staging) {
            discard_staging(&staging, None);
            return Err(error).with_context(|| {
                format!(
                    "Failed to mount (src={}, dst={})",
                    self.rootfs.display(),
                    staging.display()
                )
            });
        }

        match make_temp_dir(&staging, OLD_ROOT_PREFIX) {
            Ok(put_old) => Ok(PivotLayout::new(staging, put_old)),
            Err(error) => {
                discard_staging(&staging, None);
                Err(error).context("Couldn't create old root directory")
            }
        }
    }

    fn release_old_root(&self, layout: &PivotLayout, advisory: &mut Advisory) {
        let old_root = layout.old_root_view();
        debug!(old_root = %old_root.display(), "unmounting old root");

        // The staging directory is an ordinary empty directory in the old
        // tree now that the new root has moved off it.
        if let Err(error) = fs::remove_dir(layout.staging_leftover()) {
            debug!(%error, "staging directory left behind");
        }

        if let Some(target) = self.old_rootfs {
            advisory.attempt("expose old root", || {
                mount::<Path, Path, str, str>(
                    Some(old_root.as_path()),
                    target,
                    None,
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None,
                )
                .with_context(|| format!("Couldn't bind old root at {}", target.display()))
            });
        }

        advisory.attempt("unmount old root", || {
            umount2(&old_root, MntFlags::MNT_DETACH)
                .with_context(|| format!("umount of {} failed", old_root.display()))?;
            fs::remove_dir(&old_root)
                .with_context(|| format!("rmdir of {} failed", old_root.display()))
        });
    }
}

/// Undoes `stage` after a fatal error so nothing is left under the temp root.
fn discard_staging(staging: &Path, put_old: Option<&Path>) {
    if let Some(put_old) = put_old {
        remove_quietly(put_old);
    }

    if let Err(error) = umount2(staging, MntFlags::MNT_DETACH) {
        debug!(%error, staging = %staging.display(), "couldn't unmount staging directory");
    }
    remove_quietly(staging);
}

fn remove_quietly(dir: &Path) {
    if let Err(error) = fs::remove_dir(dir) {
        debug!(%error, dir = %dir.display(), "couldn't remove directory");
    }
}

/// Stops mount events propagating between `/` and the host.
pub fn make_root_private() -> Result<()> {
    let flags = MsFlags::MS_REC | MsFlags::MS_PRIVATE;
    mount::<str, str, str, str>(None, ROOT, None, flags, None)?;
    Ok(())
}

fn bind_mount_private(source: &Path, target: &Path) -> Result<()> {
    mount::<Path, Path, str, str>(
        Some(source),
        target,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )?;

    // Propagation flags are ignored alongside MS_BIND, so set them separately.
    mount::<str, Path, str, str>(
        None,
        target,
        None,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None,
    )?;

    Ok(())
}

fn remount_root_readonly() -> Result<()> {
    let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
    mount::<str, str, str, str>(None, ROOT, None, flags, None)
        .context("Couldn't remount '/' read-only")
}

/// Mounts a fresh procfs on `/proc` after reasserting private propagation.
pub fn mount_procfs() -> Result<()> {
    make_root_private().context("Failed to remount '/' as private")?;

    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    mount::<str, str, str, str>(Some("proc"), "/proc", Some("proc"), flags, None)
        .context("Failed to mount 'proc' in '/proc'")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PivotLayout {
        PivotLayout::new(
            PathBuf::from("/tmp/tmp.Ab12Cd"),
            PathBuf::from("/tmp/tmp.Ab12Cd/oldroot.Xy34Zw"),
        )
    }

    #[test]
    fn test_old_root_view_is_at_top_level() {
        assert_eq!(layout().old_root_view(), PathBuf::from("/oldroot.Xy34Zw"));
    }

    #[test]
    fn test_staging_leftover_is_seen_through_old_root() {
        assert_eq!(
            layout().staging_leftover(),
            PathBuf::from("/oldroot.Xy34Zw/tmp/tmp.Ab12Cd")
        );
    }

    #[test]
    fn test_builder_requires_rootfs() {
        let config = IsolationConfig::new("/bin/sh");
        assert!(RootfsBuilder::from_config(&config).is_none());

        let config = IsolationConfig::new("/bin/sh").with_rootfs("");
        assert!(RootfsBuilder::from_config(&config).is_none());
    }

    #[test]
    fn test_builder_carries_filesystem_options() {
        let mut config = IsolationConfig::new("/bin/sh").with_rootfs("/srv/root");
        config.old_rootfs = Some(PathBuf::from("/mnt/host"));
        config.readonly = true;

        let builder = RootfsBuilder::from_config(&config).expect("rootfs configured");
        assert_eq!(builder.rootfs, Path::new("/srv/root"));
        assert_eq!(builder.old_rootfs, Some(Path::new("/mnt/host")));
        assert!(builder.readonly);
        assert_eq!(builder.temp_root, Path::new(TEMP_ROOT));
    }

    #[test]
    fn test_failed_stage_leaves_no_staging_directory() -> Result<()> {
        let temp_root = tempfile::tempdir()?;
        let builder = RootfsBuilder {
            rootfs: Path::new("/nonexistent/tinybox-root"),
            old_rootfs: None,
            readonly: false,
            temp_root: temp_root.path(),
        };

        assert!(builder.stage().is_err());
        assert_eq!(fs::read_dir(temp_root.path())?.count(), 0);
        Ok(())
    }
}
