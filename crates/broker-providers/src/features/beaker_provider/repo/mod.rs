use async_trait::async_trait;
use broker_core::InstanceConfig;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

use crate::{ProviderError, ProviderResult};

const DEFAULT_PROGRAM: &str = "bkr";

/// Connection options passed to every `bkr` invocation for one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeakerHub {
    pub program: String,
    pub hub_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BeakerHub {
    pub fn from_instance(instance: &InstanceConfig) -> Self {
        let owned = |key: &str| instance.str_setting(key).map(str::to_string);
        Self {
            program: owned("bkr_path").unwrap_or_else(|| DEFAULT_PROGRAM.to_string()),
            hub_url: owned("hub_url"),
            username: owned("username"),
            password: owned("password"),
        }
    }

    /// `bkr <subcommand> [global options] <args...>`
    pub fn arguments(&self, subcommand: &str, args: &[String]) -> Vec<String> {
        let mut arguments = vec![subcommand.to_string()];
        if let Some(hub) = &self.hub_url {
            arguments.push(format!("--hub={hub}"));
        }
        if let Some(username) = &self.username {
            arguments.push(format!("--username={username}"));
        }
        if let Some(password) = &self.password {
            arguments.push(format!("--password={password}"));
        }
        arguments.extend(args.iter().cloned());
        arguments
    }
}

/// Captured result of one CLI run. A non-zero exit is not an error at this
/// level; callers decide which failures are benign.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn from_output(output: Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    /// Fails on a non-zero exit, keeping both streams in the message.
    pub fn check(self, subcommand: &str) -> ProviderResult<String> {
        if self.success {
            return Ok(self.stdout);
        }
        let message = format!(
            "bkr {subcommand} exited with {}\nStderr: {}\nStdout: {}",
            self.code, self.stderr, self.stdout
        );
        let lowered = self.stderr.to_lowercase();
        Err(if lowered.contains("authenticat") || lowered.contains("kerberos") {
            ProviderError::AuthenticationFailed(message)
        } else if lowered.contains("connection") || lowered.contains("unreachable") {
            ProviderError::InstanceUnreachable(message)
        } else {
            ProviderError::Backend(message)
        })
    }
}

#[async_trait]
pub trait BeakerCli: Send + Sync {
    async fn run(
        &self,
        hub: &BeakerHub,
        subcommand: &str,
        args: &[String],
    ) -> ProviderResult<CommandOutput>;
}

/// Runs the real `bkr` client.
#[derive(Debug, Default)]
pub struct ProcessBeakerCli;

#[async_trait]
impl BeakerCli for ProcessBeakerCli {
    async fn run(
        &self,
        hub: &BeakerHub,
        subcommand: &str,
        args: &[String],
    ) -> ProviderResult<CommandOutput> {
        let arguments = hub.arguments(subcommand, args);
        debug!(program = %hub.program, %subcommand, "Running beaker command");

        let output = Command::new(&hub.program)
            .args(&arguments)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ProviderError::InstanceUnreachable(format!("failed to start {}: {e}", hub.program))
            })?;
        Ok(CommandOutput::from_output(output))
    }
}
