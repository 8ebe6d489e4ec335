//! External collaborators
//!
//! The bank-to-budget synchronization and the bank's callback API live
//! outside this daemon. They are reached through the traits below; the
//! shipped implementations run configured commands.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use autosync_core::CommandsConfig;

/// Collaborator errors
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("no {0} command configured")]
    NotConfigured(&'static str),

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{0}")]
    Other(String),
}

/// One synchronization run
#[async_trait::async_trait]
pub trait SyncJob: Send {
    /// Prepare the run (fetch the bank user list)
    async fn populate(&mut self) -> Result<(), CollaboratorError>;

    /// Copy new bank transactions into the budget
    async fn synchronize(&mut self) -> Result<(), CollaboratorError>;

    /// Bank users known after `populate`
    fn user_ids(&self) -> Vec<String>;
}

/// Builds a fresh [`SyncJob`] for each scheduler iteration
pub trait SyncJobFactory: Send + Sync {
    fn build(&self) -> Box<dyn SyncJob>;
}

/// Bank callback (notification filter) management
#[async_trait::async_trait]
pub trait CallbackApi: Send + Sync {
    async fn add_callback(
        &self,
        user_id: &str,
        marker: &str,
        url: &str,
    ) -> Result<(), CollaboratorError>;

    async fn remove_callback(&self, user_id: &str, marker: &str)
        -> Result<(), CollaboratorError>;
}

/// Run `argv` followed by `extra`, returning stdout on success
async fn run_command(argv: &[String], extra: &[&str]) -> Result<String, CollaboratorError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(CollaboratorError::Other("empty command".into()));
    };
    let shown = argv.join(" ");
    debug!("Running {} {:?}", shown, extra);

    let output = Command::new(program)
        .args(args)
        .args(extra)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| CollaboratorError::Spawn {
            command: shown.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(CollaboratorError::Failed {
            command: shown,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Sync job backed by the `sync` and `user_ids` commands
pub struct CommandSync {
    commands: CommandsConfig,
    users: Vec<String>,
}

impl CommandSync {
    pub fn new(commands: CommandsConfig) -> Self {
        Self {
            commands,
            users: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl SyncJob for CommandSync {
    async fn populate(&mut self) -> Result<(), CollaboratorError> {
        if self.commands.user_ids.is_empty() {
            self.users.clear();
            return Ok(());
        }
        let out = run_command(&self.commands.user_ids, &[]).await?;
        self.users = out.split_whitespace().map(str::to_string).collect();
        debug!("Bank users: {:?}", self.users);
        Ok(())
    }

    async fn synchronize(&mut self) -> Result<(), CollaboratorError> {
        if self.commands.sync.is_empty() {
            return Err(CollaboratorError::NotConfigured("sync"));
        }
        let out = run_command(&self.commands.sync, &[]).await?;
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            info!(target: "autosync::sync", "{}", line);
        }
        Ok(())
    }

    fn user_ids(&self) -> Vec<String> {
        self.users.clone()
    }
}

/// Factory producing [`CommandSync`] jobs
pub struct CommandSyncFactory {
    commands: CommandsConfig,
}

impl CommandSyncFactory {
    pub fn new(commands: CommandsConfig) -> Self {
        Self { commands }
    }
}

impl SyncJobFactory for CommandSyncFactory {
    fn build(&self) -> Box<dyn SyncJob> {
        Box::new(CommandSync::new(self.commands.clone()))
    }
}

/// Callback API backed by the `add_callback` / `remove_callback` commands
///
/// Without a command the call is logged and treated as done, so the
/// daemon still runs on the timer.
pub struct CommandCallbacks {
    add: Vec<String>,
    remove: Vec<String>,
}

impl CommandCallbacks {
    pub fn new(commands: &CommandsConfig) -> Self {
        Self {
            add: commands.add_callback.clone(),
            remove: commands.remove_callback.clone(),
        }
    }
}

#[async_trait::async_trait]
impl CallbackApi for CommandCallbacks {
    async fn add_callback(
        &self,
        user_id: &str,
        marker: &str,
        url: &str,
    ) -> Result<(), CollaboratorError> {
        if self.add.is_empty() {
            warn!("No add_callback command configured, not registering {}", url);
            return Ok(());
        }
        run_command(&self.add, &[user_id, marker, url]).await?;
        Ok(())
    }

    async fn remove_callback(
        &self,
        user_id: &str,
        marker: &str,
    ) -> Result<(), CollaboratorError> {
        if self.remove.is_empty() {
            warn!("No remove_callback command configured");
            return Ok(());
        }
        run_command(&self.remove, &[user_id, marker]).await?;
        Ok(())
    }
}
