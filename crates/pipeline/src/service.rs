//! Service lifecycle and command dispatch.
//!
//! Every long-lived subsystem implements [`Service`]. A [`Manager`] owns a
//! set of named services, starts them in registration order, stops them in
//! reverse, and routes [`Cmd`]s to them by name.

use crate::{
    Error, Result,
    status::{StatusHandle, StatusMap, StatusTable},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{error, info, warn};

/// A command addressed to one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cmd {
    pub service: String,
    pub cmd: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Cmd {
    pub fn new(service: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            cmd: cmd.into(),
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }
}

/// Answer to a [`Cmd`]. An empty `error` means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub cmd: String,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub error: String,
}

impl Reply {
    pub fn ok(cmd: &Cmd, data: Vec<u8>) -> Self {
        Self {
            cmd: cmd.cmd.clone(),
            data,
            error: String::new(),
        }
    }

    pub fn err(cmd: &Cmd, error: impl fmt::Display) -> Self {
        Self {
            cmd: cmd.cmd.clone(),
            data: Vec::new(),
            error: error.to_string(),
        }
    }

    pub fn unknown(cmd: &Cmd) -> Self {
        Self::err(cmd, format!("Unknown command: {}", cmd.cmd))
    }

    /// Serialize `value` as the reply payload.
    pub fn json<T: Serialize>(cmd: &Cmd, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(data) => Self::ok(cmd, data),
            Err(err) => Self::err(cmd, err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Start with a raw JSON configuration. Fails with
    /// [`Error::ServiceAlreadyRunning`] while running.
    async fn start(&self, config: &[u8]) -> Result<()>;

    /// Stop and wait for the service to finish. Stopping a service that is
    /// not running succeeds.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Current status. Never waits on the service's main loop.
    fn status(&self) -> StatusMap;

    async fn handle(&self, cmd: &Cmd) -> Reply {
        Reply::unknown(cmd)
    }
}

/// Parse a service configuration; empty input yields the defaults.
pub fn parse_config<T: DeserializeOwned + Default>(raw: &[u8]) -> Result<T> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(raw).map_err(|e| Error::InvalidConfig(e.to_string()))
}

/// Commands understood by the [`Manager`] itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerCommand {
    Status,
    StartService {
        name: String,
        config: serde_json::Value,
    },
    StopService {
        name: String,
    },
    GetConfig,
}

#[derive(Debug, Deserialize)]
struct ServiceRequest {
    name: String,
    #[serde(default)]
    config: serde_json::Value,
}

impl TryFrom<&Cmd> for ManagerCommand {
    type Error = Error;

    fn try_from(cmd: &Cmd) -> Result<Self> {
        let request = || -> Result<ServiceRequest> {
            serde_json::from_slice(&cmd.data).map_err(|e| Error::InvalidConfig(e.to_string()))
        };

        match cmd.cmd.as_str() {
            "Status" => Ok(ManagerCommand::Status),
            "GetConfig" => Ok(ManagerCommand::GetConfig),
            "StartService" => {
                let ServiceRequest { name, config } = request()?;
                Ok(ManagerCommand::StartService { name, config })
            }
            "StopService" => Ok(ManagerCommand::StopService {
                name: request()?.name,
            }),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }
}

/// Commands understood by simple services that only report on themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCommand {
    GetConfig,
    Status,
}

impl FromStr for ServiceCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GetConfig" => Ok(ServiceCommand::GetConfig),
            "Status" => Ok(ServiceCommand::Status),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }
}

fn config_bytes(config: &serde_json::Value) -> Result<Vec<u8>> {
    if config.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::to_vec(config)?)
}

/// Composes named services behind a single [`Service`].
pub struct Manager {
    name: String,
    status: StatusHandle,
    services: RwLock<Vec<Arc<dyn Service>>>,
    configs: Mutex<BTreeMap<String, serde_json::Value>>,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Manager {
    pub fn new(name: impl Into<String>, table: &StatusTable) -> Self {
        let name = name.into();
        let status = table.handle(name.clone());
        status.update("Stopped");
        Self {
            name,
            status,
            services: RwLock::new(Vec::new()),
            configs: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Add a service. Only allowed before the manager is started.
    pub fn register(&self, service: Arc<dyn Service>) -> Result<()> {
        let name = service.name().to_string();
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::ServiceRegistration(format!(
                "cannot register {name} while {} is running",
                self.name
            )));
        }
        if name == self.name {
            return Err(Error::ServiceRegistration(format!(
                "{name} is reserved for the manager"
            )));
        }

        let mut services = self.services_mut();
        if services.iter().any(|s| s.name() == name) {
            return Err(Error::ServiceRegistration(format!(
                "{name} is already registered"
            )));
        }
        services.push(service);
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services_ref().iter().find(|s| s.name() == name).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services_ref()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Last configuration each service was started with.
    pub fn configs(&self) -> BTreeMap<String, serde_json::Value> {
        self.configs_mut().clone()
    }

    async fn start_service(&self, service: &Arc<dyn Service>, config: serde_json::Value) -> Result<()> {
        let raw = config_bytes(&config)?;
        service.start(&raw).await?;
        info!(service = service.name(), "service started");
        self.configs_mut().insert(service.name().to_string(), config);
        Ok(())
    }

    async fn handle_command(&self, cmd: &Cmd, command: ManagerCommand) -> Reply {
        match command {
            ManagerCommand::Status => Reply::json(cmd, &self.status()),
            ManagerCommand::GetConfig => Reply::json(cmd, &self.configs()),
            ManagerCommand::StartService { name, config } => {
                let Some(service) = self.service(&name) else {
                    return Reply::err(cmd, format!("Unknown service: {name}"));
                };
                match self.start_service(&service, config).await {
                    Ok(()) => Reply::ok(cmd, Vec::new()),
                    Err(err) => Reply::err(cmd, err),
                }
            }
            ManagerCommand::StopService { name } => {
                let Some(service) = self.service(&name) else {
                    return Reply::err(cmd, format!("Unknown service: {name}"));
                };
                match service.stop().await {
                    Ok(()) => {
                        info!(service = %name, "service stopped");
                        Reply::ok(cmd, Vec::new())
                    }
                    Err(err) => Reply::err(cmd, err),
                }
            }
        }
    }

    fn services_ref(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Service>>> {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn services_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Service>>> {
        self.services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn configs_mut(&self) -> MutexGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Service for Manager {
    fn name(&self) -> &str {
        &self.name
    }

    /// `config` is a JSON object mapping service names to their
    /// configuration. Services without an entry start with defaults.
    async fn start(&self, config: &[u8]) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::ServiceAlreadyRunning(self.name.clone()));
        }

        let mut configs: BTreeMap<String, serde_json::Value> = parse_config(config)?;
        let services = self.services_ref().clone();
        info!(manager = %self.name, services = services.len(), "starting");

        for (i, service) in services.iter().enumerate() {
            let config = configs.remove(service.name()).unwrap_or_default();
            if let Err(err) = self.start_service(service, config).await {
                error!(service = service.name(), %err, "service failed to start");
                for started in services[..i].iter().rev() {
                    if let Err(err) = started.stop().await {
                        warn!(service = started.name(), %err, "stop after failed start");
                    }
                }
                self.status.update("Stopped");
                return Err(err);
            }
        }
        for name in configs.keys() {
            warn!(service = %name, "configuration for unregistered service ignored");
        }

        self.running.store(true, Ordering::SeqCst);
        self.status.update("Running");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.status.update("Stopping");
        let services = self.services_ref().clone();
        let mut first_err = None;
        for service in services.iter().rev() {
            match service.stop().await {
                Ok(()) => info!(service = service.name(), "service stopped"),
                Err(err) => {
                    error!(service = service.name(), %err, "service failed to stop");
                    first_err.get_or_insert(err);
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.status.update("Stopped");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn status(&self) -> StatusMap {
        let mut status = self.status.map();
        for service in self.services_ref().iter() {
            status.extend(service.status());
        }
        status
    }

    async fn handle(&self, cmd: &Cmd) -> Reply {
        if cmd.service == self.name {
            return match ManagerCommand::try_from(cmd) {
                Ok(command) => self.handle_command(cmd, command).await,
                Err(Error::UnknownCommand(_)) => Reply::unknown(cmd),
                Err(err) => Reply::err(cmd, err),
            };
        }

        match self.service(&cmd.service) {
            Some(service) => service.handle(cmd).await,
            None => Reply::unknown(cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_defaults_on_empty() {
        #[derive(Debug, Default, Deserialize, PartialEq)]
        struct Conf {
            #[serde(default)]
            n: u32,
        }

        assert_eq!(parse_config::<Conf>(b"").unwrap(), Conf::default());
        assert_eq!(parse_config::<Conf>(b"  \n").unwrap(), Conf::default());
        assert_eq!(parse_config::<Conf>(br#"{"n":4}"#).unwrap(), Conf { n: 4 });
        assert!(matches!(
            parse_config::<Conf>(b"{nope"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_manager_command_parsing() {
        let cmd = Cmd::new("agent", "StartService")
            .with_data(br#"{"name":"data","config":{"blackhole":true}}"#.to_vec());
        assert_eq!(
            ManagerCommand::try_from(&cmd).unwrap(),
            ManagerCommand::StartService {
                name: "data".to_string(),
                config: serde_json::json!({"blackhole": true}),
            }
        );

        let cmd = Cmd::new("agent", "StopService").with_data(br#"{"name":"mm"}"#.to_vec());
        assert_eq!(
            ManagerCommand::try_from(&cmd).unwrap(),
            ManagerCommand::StopService {
                name: "mm".to_string()
            }
        );

        let cmd = Cmd::new("agent", "StopService");
        assert!(matches!(
            ManagerCommand::try_from(&cmd),
            Err(Error::InvalidConfig(_))
        ));

        let cmd = Cmd::new("agent", "Reboot");
        assert!(matches!(
            ManagerCommand::try_from(&cmd),
            Err(Error::UnknownCommand(ref c)) if c == "Reboot"
        ));
    }

    #[test]
    fn test_reply_helpers() {
        let cmd = Cmd::new("data", "Explode");
        let reply = Reply::unknown(&cmd);
        assert_eq!(reply.error, "Unknown command: Explode");
        assert_eq!(reply.cmd, "Explode");
        assert!(!reply.is_ok());

        let reply = Reply::json(&Cmd::new("data", "GetConfig"), &vec![1, 2]);
        assert!(reply.is_ok());
        assert_eq!(reply.data, b"[1,2]");
    }

    #[test]
    fn test_service_command_from_str() {
        assert_eq!(
            "GetConfig".parse::<ServiceCommand>().unwrap(),
            ServiceCommand::GetConfig
        );
        assert!("Reload".parse::<ServiceCommand>().is_err());
    }
}
