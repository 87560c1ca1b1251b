use crate::{
    child::ChildPipeline,
    config::IsolationConfig,
    context::{HostContext, PrivilegeLevel},
    error::{ChildStatus, SpawnError},
    spawner::{Identity, SpawnerBuilder},
};
use anyhow::anyhow;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Sandbox {
    config: IsolationConfig,
}

impl Sandbox {
    /// Validates the configuration. Nothing is spawned yet.
    pub fn new(config: IsolationConfig) -> Result<Self, SpawnError> {
        config
            .validate()
            .map_err(|error| SpawnError::Setup(anyhow!(error)))?;

        Ok(Self { config })
    }

    /// Runs the configured program in a fresh child and waits for it.
    pub fn spawn(&self) -> Result<ChildStatus, SpawnError> {
        self.check_privilege();

        let remap = self.config.userns_remap.then_some(Identity {
            uid: self.config.uid,
            gid: self.config.gid,
        });

        let pipeline = ChildPipeline::new(&self.config).map_err(SpawnError::Setup)?;
        let spawner = SpawnerBuilder::new(pipeline)
            .with_flags(self.config.clone_flags())
            .with_remap(remap)
            .with_handshake_timeout(self.config.handshake_timeout)
            .build();

        info!(program = %self.config.program, "launching");
        let status = spawner.spawn()?;
        info!(%status, "program finished");
        Ok(status)
    }

    fn check_privilege(&self) {
        let Some(context) = HostContext::get() else {
            return;
        };

        debug!(level = %context.privilege_level(), "host privilege level");

        if self.config.userns_remap && !context.can_map_identities() {
            warn!("identity remapping usually needs root; the mapping write may be refused");
        }

        let namespaced = !self.config.clone_flags().is_empty();
        if namespaced && context.privilege_level() == PrivilegeLevel::Rootless {
            warn!("creating namespaces without root usually fails, see --disable-* flags");
        }
    }
}
