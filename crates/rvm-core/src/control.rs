//! Service lifecycle control
//!
//! The orchestrator never manages processes itself; it asks a
//! `ServiceController` to start, stop or restart a named service. The
//! production implementation shells out to `systemctl`.

use crate::error::ControlError;
use std::collections::BTreeMap;
use tokio::process::Command;

/// Start/stop/restart capability for named services
#[async_trait::async_trait]
pub trait ServiceController: Send + Sync {
    async fn start(&self, service: &str) -> Result<(), ControlError>;

    async fn stop(&self, service: &str) -> Result<(), ControlError>;

    async fn restart(&self, service: &str) -> Result<(), ControlError>;
}

/// `systemctl`-backed controller
///
/// Service names map to unit names through an optional override table;
/// unmapped names are used as the unit name directly.
#[derive(Debug, Clone)]
pub struct SystemctlController {
    program: String,
    units: BTreeMap<String, String>,
}

impl SystemctlController {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "systemctl".to_string(),
            units: BTreeMap::new(),
        }
    }

    /// Map a service name to a specific unit
    #[must_use]
    pub fn with_unit(mut self, service: impl Into<String>, unit: impl Into<String>) -> Self {
        self.units.insert(service.into(), unit.into());
        self
    }

    /// Use a different binary (e.g. a wrapper script)
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn unit<'a>(&'a self, service: &'a str) -> &'a str {
        self.units.get(service).map_or(service, String::as_str)
    }

    async fn run(&self, verb: &str, service: &str) -> Result<(), ControlError> {
        let unit = self.unit(service);
        tracing::info!(verb, service, unit, "service control");

        let output = Command::new(&self.program)
            .arg(verb)
            .arg(unit)
            .env_clear()
            .output()
            .await
            .map_err(|source| ControlError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ControlError::CommandFailed {
                verb: verb.to_string(),
                service: service.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Default for SystemctlController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ServiceController for SystemctlController {
    async fn start(&self, service: &str) -> Result<(), ControlError> {
        self.run("start", service).await
    }

    async fn stop(&self, service: &str) -> Result<(), ControlError> {
        self.run("stop", service).await
    }

    async fn restart(&self, service: &str) -> Result<(), ControlError> {
        self.run("restart", service).await
    }
}
