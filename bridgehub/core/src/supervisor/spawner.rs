//! Worker process spawning

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::config::BridgeIdentity;

/// What to launch for one bridge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Bridge id
    pub bridge_id: String,
    /// Accessory protocol port
    pub port: u16,
    /// Delay before the first spawn of this handle
    pub start_delay: Duration,
}

impl WorkerSpec {
    /// Spec with no start delay
    pub fn new(bridge_id: impl Into<String>, port: u16) -> Self {
        Self {
            bridge_id: bridge_id.into(),
            port,
            start_delay: Duration::ZERO,
        }
    }

    /// Spec for a configured bridge, honouring its autostart delay
    #[must_use]
    pub fn from_identity(identity: &BridgeIdentity) -> Self {
        let delay = u64::try_from(identity.autostart_delay_seconds).unwrap_or(0);
        Self {
            bridge_id: identity.id.clone(),
            port: identity.port,
            start_delay: Duration::from_secs(delay),
        }
    }
}

/// Starts one worker process
pub trait WorkerSpawner: Send + Sync {
    /// Spawn the process for `spec`
    ///
    /// # Errors
    ///
    /// Whatever the OS reports when the process cannot be started.
    fn spawn(&self, spec: &WorkerSpec) -> std::io::Result<Child>;
}

/// Runs `<program> [args..] bridge <id> <port>`
#[derive(Clone, Debug)]
pub struct CommandSpawner {
    program: PathBuf,
    leading_args: Vec<String>,
    config_path: Option<PathBuf>,
}

impl CommandSpawner {
    /// Spawn `program` for each worker
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            config_path: None,
        }
    }

    /// Re-run the current executable in bridge mode
    ///
    /// # Errors
    ///
    /// The current executable path cannot be determined.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Arguments placed before the mode/identity/port positionals
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Pass the hub's config file to children via `BRIDGEHUB_CONFIG`
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Command that would be run for `spec`
    #[must_use]
    pub fn command(&self, spec: &WorkerSpec) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg("bridge")
            .arg(&spec.bridge_id)
            .arg(spec.port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = &self.config_path {
            command.env("BRIDGEHUB_CONFIG", path);
        }
        command
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, spec: &WorkerSpec) -> std::io::Result<Child> {
        self.command(spec).spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_spec_from_identity() {
        let mut identity = BridgeIdentity::worker("den", 51000);
        identity.autostart_delay_seconds = 3;
        let spec = WorkerSpec::from_identity(&identity);
        assert_eq!(spec.start_delay, Duration::from_secs(3));

        identity.autostart_delay_seconds = -1;
        assert_eq!(WorkerSpec::from_identity(&identity).start_delay, Duration::ZERO);
    }

    #[test]
    fn test_command_positionals() {
        let spawner = CommandSpawner::new("/usr/bin/bridgehub-daemon")
            .with_args(["--quiet"])
            .with_config_path("/etc/bridgehub.toml");
        let command = spawner.command(&WorkerSpec::new("den", 51000));
        let std = command.as_std();

        let args: Vec<String> = std
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["--quiet", "bridge", "den", "51000"]);

        let env: Vec<(String, String)> = std
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned())))
            .collect();
        assert_eq!(
            env,
            vec![("BRIDGEHUB_CONFIG".to_string(), "/etc/bridgehub.toml".to_string())]
        );
    }

    #[test]
    fn test_children_die_with_their_handle() {
        let spawner = CommandSpawner::new("/usr/bin/bridgehub-daemon");
        assert!(spawner.command(&WorkerSpec::new("den", 51000)).get_kill_on_drop());
    }

    #[tokio::test]
    async fn test_spawn_runs_program() {
        let spawner = CommandSpawner::new("true");
        let mut child = spawner.spawn(&WorkerSpec::new("den", 51000)).unwrap();
        assert!(child.wait().await.unwrap().success());
    }
}
