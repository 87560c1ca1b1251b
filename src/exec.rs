use crate::{config::IsolationConfig, utils::to_cstrings};
use anyhow::{Context, Result};
use nix::unistd::execve;
use std::{convert::Infallible, ffi::CString};

/// Program, argument and environment vectors, converted ahead of the
/// clone so the child does no allocation on its way to exec.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl ExecSpec {
    pub fn from_config(config: &IsolationConfig) -> Result<Self> {
        Ok(Self {
            program: CString::new(config.program.as_str())
                .context("Program path contains a NUL byte")?,
            argv: to_cstrings(&config.argv).context("Invalid argument vector")?,
            envp: to_cstrings(&config.envp).context("Invalid environment vector")?,
        })
    }

    pub fn program(&self) -> &CString {
        &self.program
    }

    /// Replaces the process image. Returns only on failure.
    pub fn exec(&self) -> Result<Infallible> {
        execve(&self.program, &self.argv, &self.envp)
            .with_context(|| format!("couldn't execute process {:?}", self.program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectors_are_passed_verbatim() -> Result<()> {
        let config = IsolationConfig::new("/bin/echo")
            .with_args(["a b", "c"])
            .with_env(["A=1", "B="]);
        let spec = ExecSpec::from_config(&config)?;

        assert_eq!(spec.program().to_str()?, "/bin/echo");
        assert_eq!(spec.argv, [c"/bin/echo", c"a b", c"c"].map(CString::from));
        assert_eq!(spec.envp, [c"A=1", c"B="].map(CString::from));
        Ok(())
    }

    #[test]
    fn test_missing_program_fails_without_replacing_image() -> Result<()> {
        let spec = ExecSpec::from_config(&IsolationConfig::new("/nonexistent/tinybox-target"))?;

        let error = spec.exec().unwrap_err();
        assert!(format!("{error:#}").contains("ENOENT"));
        Ok(())
    }
}
