use crate::utils::page_size;
use anyhow::{Context, Result, bail};
use memmap2::{MmapMut, MmapOptions};
use nix::libc::{PROT_NONE, mprotect};

/// Stack for the cloned child: an anonymous mapping whose lowest page is
/// inaccessible, so an overflow faults instead of scribbling on the heap.
pub struct ChildStack {
    mmap: MmapMut,
    guard: usize,
}

impl ChildStack {
    pub fn new(stack_size: usize) -> Result<Self> {
        let page_size = page_size()?;

        if stack_size == 0 || !stack_size.is_multiple_of(page_size) {
            bail!("stack size must be a non-zero multiple of the page size ({page_size} bytes)");
        }

        let total = stack_size
            .checked_add(page_size)
            .context("stack size plus guard page overflows usize")?;

        let mut mmap = MmapOptions::new()
            .len(total)
            .stack()
            .map_anon()
            .context("Failed to map child stack")?;

        // SAFETY: the first page lies inside the mapping we own and the
        // mapping is page-aligned.
        let ret = unsafe { mprotect(mmap.as_mut_ptr().cast(), page_size, PROT_NONE) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error()).context("Failed to protect guard page");
        }

        Ok(Self {
            mmap,
            guard: page_size,
        })
    }

    /// The usable region, above the guard page. The stack grows down from its end.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[self.guard..]
    }
}
