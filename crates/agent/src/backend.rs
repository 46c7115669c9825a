//! In-memory infrastructure backend for the chat CLI and tests.
//!
//! The demo backend seeds a small homelab: a few VMs and containers
//! spread over two nodes plus a service catalog. Handlers mutate the
//! shared state so multi-turn conversations observe their own effects
//! ("start vm 100" then "status of vm 100" reports running).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use opsbot_core::domain::command::{Command, ErrorKind, HandlerResult};
use opsbot_core::domain::entity::{EntityType, EntityValue};
use opsbot_core::schema::{ContainerRef, IntentRegistry, ResourceInventory, ServiceRef, VmRef};
use opsbot_core::IntentName;

use crate::dispatch::CommandHandler;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PowerState {
    Running,
    Stopped,
}

impl PowerState {
    fn label(self) -> &'static str {
        match self {
            PowerState::Running => "running",
            PowerState::Stopped => "stopped",
        }
    }
}

#[derive(Clone, Debug)]
struct Vm {
    id: u64,
    name: String,
    node: String,
    state: PowerState,
}

#[derive(Clone, Debug)]
struct Container {
    id: u64,
    name: String,
    state: PowerState,
}

#[derive(Clone, Debug)]
struct CatalogService {
    id: String,
    display_name: String,
    aliases: Vec<String>,
    deployed: bool,
}

#[derive(Debug)]
struct DemoState {
    vms: Vec<Vm>,
    containers: Vec<Container>,
    services: Vec<CatalogService>,
    nodes: Vec<String>,
}

/// Shared mutable homelab state behind a plain mutex; handlers never
/// hold the lock across an await point.
pub struct DemoBackend {
    state: Mutex<DemoState>,
}

impl Default for DemoBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoBackend {
    pub fn new() -> Self {
        let state = DemoState {
            vms: vec![
                Vm {
                    id: 100,
                    name: "media-server".to_string(),
                    node: "pve1".to_string(),
                    state: PowerState::Running,
                },
                Vm {
                    id: 101,
                    name: "build-agent".to_string(),
                    node: "pve1".to_string(),
                    state: PowerState::Stopped,
                },
                Vm {
                    id: 204,
                    name: "backup-target".to_string(),
                    node: "pve2".to_string(),
                    state: PowerState::Running,
                },
            ],
            containers: vec![
                Container { id: 200, name: "reverse-proxy".to_string(), state: PowerState::Running },
                Container { id: 201, name: "pihole".to_string(), state: PowerState::Running },
                Container { id: 202, name: "grafana".to_string(), state: PowerState::Stopped },
            ],
            services: vec![
                CatalogService {
                    id: "nextcloud".to_string(),
                    display_name: "Nextcloud".to_string(),
                    aliases: vec!["cloud".to_string(), "file sync".to_string()],
                    deployed: false,
                },
                CatalogService {
                    id: "jellyfin".to_string(),
                    display_name: "Jellyfin".to_string(),
                    aliases: vec!["media".to_string()],
                    deployed: true,
                },
                CatalogService {
                    id: "gitea".to_string(),
                    display_name: "Gitea".to_string(),
                    aliases: vec!["git".to_string()],
                    deployed: false,
                },
            ],
            nodes: vec!["pve1".to_string(), "pve2".to_string()],
        };
        Self { state: Mutex::new(state) }
    }

    /// Snapshot of the known resources for fuzzy entity resolution.
    pub fn inventory(&self) -> ResourceInventory {
        let state = self.lock();
        ResourceInventory {
            vms: state.vms.iter().map(|vm| VmRef { id: vm.id, name: vm.name.clone() }).collect(),
            containers: state
                .containers
                .iter()
                .map(|ct| ContainerRef { id: ct.id, name: ct.name.clone() })
                .collect(),
            services: state
                .services
                .iter()
                .map(|service| ServiceRef {
                    id: service.id.clone(),
                    display_name: service.display_name.clone(),
                    aliases: service.aliases.clone(),
                })
                .collect(),
            nodes: state.nodes.clone(),
        }
    }

    /// One handler per catalog intent, ready for `HandlerRegistry::new`.
    pub fn handlers(self: &Arc<Self>, catalog: &IntentRegistry) -> Vec<Arc<dyn CommandHandler>> {
        catalog
            .iter()
            .map(|schema| {
                Arc::new(DemoHandler { intent: schema.name.clone(), backend: Arc::clone(self) })
                    as Arc<dyn CommandHandler>
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DemoState> {
        // Lock poisoning only happens if a handler panicked; the state is
        // plain data, so continue with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn vm_status(&self, id: u64) -> HandlerResult {
        let state = self.lock();
        match state.vms.iter().find(|vm| vm.id == id) {
            Some(vm) => HandlerResult::ok_with_data(
                format!("VM {} ({}) is {}", vm.id, vm.name, vm.state.label()),
                json!({"vm_id": vm.id, "name": vm.name, "state": vm.state.label(), "node": vm.node}),
            ),
            None => HandlerResult::fail(ErrorKind::NotFound, format!("VM {id} does not exist")),
        }
    }

    fn vm_set_state(&self, id: u64, target: PowerState, verb: &str) -> HandlerResult {
        let mut state = self.lock();
        let Some(vm) = state.vms.iter_mut().find(|vm| vm.id == id) else {
            return HandlerResult::fail(ErrorKind::NotFound, format!("VM {id} does not exist"));
        };
        if vm.state == target {
            return HandlerResult::fail(
                ErrorKind::InvalidArguments,
                format!("VM {} ({}) is already {}", vm.id, vm.name, target.label()),
            );
        }
        vm.state = target;
        HandlerResult::ok_with_data(
            format!("{verb} VM {} ({})", vm.id, vm.name),
            json!({"vm_id": vm.id, "name": vm.name}),
        )
    }

    fn vm_restart(&self, id: u64) -> HandlerResult {
        let mut state = self.lock();
        let Some(vm) = state.vms.iter_mut().find(|vm| vm.id == id) else {
            return HandlerResult::fail(ErrorKind::NotFound, format!("VM {id} does not exist"));
        };
        if vm.state == PowerState::Stopped {
            return HandlerResult::fail(
                ErrorKind::InvalidArguments,
                format!("VM {} ({}) is stopped; start it instead", vm.id, vm.name),
            );
        }
        HandlerResult::ok_with_data(
            format!("Restarted VM {} ({})", vm.id, vm.name),
            json!({"vm_id": vm.id, "name": vm.name}),
        )
    }

    fn vm_delete(&self, id: u64) -> HandlerResult {
        let mut state = self.lock();
        let Some(position) = state.vms.iter().position(|vm| vm.id == id) else {
            return HandlerResult::fail(ErrorKind::NotFound, format!("VM {id} does not exist"));
        };
        let vm = state.vms.remove(position);
        HandlerResult::ok_with_data(
            format!("Deleted VM {} ({})", vm.id, vm.name),
            json!({"vm_id": vm.id, "name": vm.name}),
        )
    }

    fn container_set_state(&self, id: u64, target: PowerState, verb: &str) -> HandlerResult {
        let mut state = self.lock();
        let Some(container) = state.containers.iter_mut().find(|ct| ct.id == id) else {
            return HandlerResult::fail(
                ErrorKind::NotFound,
                format!("container {id} does not exist"),
            );
        };
        if container.state == target {
            return HandlerResult::fail(
                ErrorKind::InvalidArguments,
                format!(
                    "container {} ({}) is already {}",
                    container.id,
                    container.name,
                    target.label()
                ),
            );
        }
        container.state = target;
        HandlerResult::ok_with_data(
            format!("{verb} container {} ({})", container.id, container.name),
            json!({"container_id": container.id, "name": container.name}),
        )
    }

    fn container_delete(&self, id: u64) -> HandlerResult {
        let mut state = self.lock();
        let Some(position) = state.containers.iter().position(|ct| ct.id == id) else {
            return HandlerResult::fail(
                ErrorKind::NotFound,
                format!("container {id} does not exist"),
            );
        };
        let container = state.containers.remove(position);
        HandlerResult::ok_with_data(
            format!("Deleted container {} ({})", container.id, container.name),
            json!({"container_id": container.id, "name": container.name}),
        )
    }

    fn service_deploy(&self, id: &str, node: Option<&str>) -> HandlerResult {
        let mut state = self.lock();
        let Some(service) = state.services.iter_mut().find(|service| service.id == id) else {
            return HandlerResult::fail(
                ErrorKind::NotFound,
                format!("service `{id}` is not in the catalog"),
            );
        };
        if service.deployed {
            return HandlerResult::fail(
                ErrorKind::InvalidArguments,
                format!("{} is already deployed", service.display_name),
            );
        }
        service.deployed = true;
        let detail = match node {
            Some(node) => format!("It is coming up on {node}."),
            None => "It is coming up now.".to_string(),
        };
        HandlerResult::ok_with_data(
            format!("Deployed {}. {detail}", service.display_name),
            json!({"service": service.display_name, "detail": detail}),
        )
    }

    fn service_remove(&self, id: &str) -> HandlerResult {
        let mut state = self.lock();
        let Some(service) = state.services.iter_mut().find(|service| service.id == id) else {
            return HandlerResult::fail(
                ErrorKind::NotFound,
                format!("service `{id}` is not in the catalog"),
            );
        };
        if !service.deployed {
            return HandlerResult::fail(
                ErrorKind::InvalidArguments,
                format!("{} is not deployed", service.display_name),
            );
        }
        service.deployed = false;
        HandlerResult::ok_with_data(
            format!("Removed {}", service.display_name),
            json!({"service": service.display_name}),
        )
    }

    fn system_status(&self) -> HandlerResult {
        let state = self.lock();
        let vms_running = state.vms.iter().filter(|vm| vm.state == PowerState::Running).count();
        let containers_running =
            state.containers.iter().filter(|ct| ct.state == PowerState::Running).count();
        let message = format!(
            "{} of {} VMs running, {} of {} containers running, {} nodes online",
            vms_running,
            state.vms.len(),
            containers_running,
            state.containers.len(),
            state.nodes.len(),
        );
        HandlerResult::ok_with_data(
            message,
            json!({
                "vms_total": state.vms.len(),
                "vms_running": vms_running,
                "containers_total": state.containers.len(),
                "containers_running": containers_running,
                "nodes": state.nodes,
            }),
        )
    }

    fn help(&self, catalog_lines: &str) -> HandlerResult {
        HandlerResult::ok(format!("Here's what I can do:\n{catalog_lines}"))
    }
}

struct DemoHandler {
    intent: IntentName,
    backend: Arc<DemoBackend>,
}

fn required_vm_id(command: &Command) -> Result<u64, HandlerResult> {
    match command.value_of(EntityType::VmId) {
        Some(EntityValue::VmId(id)) => Ok(*id),
        _ => Err(HandlerResult::fail(ErrorKind::InvalidArguments, "no VM id in command")),
    }
}

fn required_container_id(command: &Command) -> Result<u64, HandlerResult> {
    match command.value_of(EntityType::ContainerId) {
        Some(EntityValue::ContainerId(id)) => Ok(*id),
        _ => Err(HandlerResult::fail(ErrorKind::InvalidArguments, "no container id in command")),
    }
}

fn required_service(command: &Command) -> Result<String, HandlerResult> {
    match command.value_of(EntityType::ServiceName) {
        Some(EntityValue::ServiceName(id)) => Ok(id.clone()),
        _ => Err(HandlerResult::fail(ErrorKind::InvalidArguments, "no service name in command")),
    }
}

#[async_trait]
impl CommandHandler for DemoHandler {
    fn intent(&self) -> IntentName {
        self.intent.clone()
    }

    async fn execute(&self, command: &Command) -> anyhow::Result<HandlerResult> {
        let result = match self.intent.as_str() {
            "vm_status" => match required_vm_id(command) {
                Ok(id) => self.backend.vm_status(id),
                Err(result) => result,
            },
            "vm_start" => match required_vm_id(command) {
                Ok(id) => self.backend.vm_set_state(id, PowerState::Running, "Started"),
                Err(result) => result,
            },
            "vm_stop" => match required_vm_id(command) {
                Ok(id) => self.backend.vm_set_state(id, PowerState::Stopped, "Stopped"),
                Err(result) => result,
            },
            "vm_restart" => match required_vm_id(command) {
                Ok(id) => self.backend.vm_restart(id),
                Err(result) => result,
            },
            "vm_delete" => match required_vm_id(command) {
                Ok(id) => self.backend.vm_delete(id),
                Err(result) => result,
            },
            "container_start" => match required_container_id(command) {
                Ok(id) => self.backend.container_set_state(id, PowerState::Running, "Started"),
                Err(result) => result,
            },
            "container_stop" => match required_container_id(command) {
                Ok(id) => self.backend.container_set_state(id, PowerState::Stopped, "Stopped"),
                Err(result) => result,
            },
            "container_delete" => match required_container_id(command) {
                Ok(id) => self.backend.container_delete(id),
                Err(result) => result,
            },
            "service_deploy" => match required_service(command) {
                Ok(id) => {
                    let node = match command.value_of(EntityType::NodeName) {
                        Some(EntityValue::NodeName(node)) => Some(node.clone()),
                        _ => None,
                    };
                    self.backend.service_deploy(&id, node.as_deref())
                }
                Err(result) => result,
            },
            "service_remove" => match required_service(command) {
                Ok(id) => self.backend.service_remove(id.as_str()),
                Err(result) => result,
            },
            "system_status" => self.backend.system_status(),
            "help" => {
                let lines = IntentRegistry::builtin()
                    .descriptors()
                    .iter()
                    .map(|descriptor| {
                        format!("- {}: {}", descriptor.name, descriptor.description)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                self.backend.help(&lines)
            }
            other => anyhow::bail!("demo backend has no operation for `{other}`"),
        };
        Ok(result)
    }
}
