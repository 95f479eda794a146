//! Command registry: one static name→handler table built at startup.
//!
//! Every handler has the same shape, `(fields) -> Response`. The registry
//! is the containment boundary of the agent: an unknown name is a lookup
//! miss, a handler error becomes a failed response, and a handler panic is
//! absorbed by its task — none of them may take the process down.

use crate::capability::{Capabilities, CapabilityError};
use crate::files::{self, FileError};
use crate::logstore::LogStore;
use crate::policy;
use crate::schedule::{BlockState, ScheduleEntry, ScheduleError, ScheduleKind, Scheduler};
use crate::shell::{ShellError, ShellService};
use crate::system::SystemProbe;
use anyhow::{anyhow, Result};
use chrono::NaiveTime;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use warden_proto::{Fields, Response};

pub const UNKNOWN_REQUEST_MESSAGE: &str = "Unknown request.";

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;
type Handler = Arc<dyn Fn(Fields) -> HandlerFuture + Send + Sync>;

#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(Fields) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.handlers
            .insert(name, Arc::new(move |fields| Box::pin(handler(fields))));
    }

    /// Runs the named handler. Never panics and never errors: every failure
    /// mode collapses into a failed `Response`.
    pub async fn dispatch(&self, command: &str, fields: Fields) -> Response {
        let Some(handler) = self.handlers.get(command) else {
            return Response::failure(UNKNOWN_REQUEST_MESSAGE);
        };
        // The spawned task absorbs handler panics; they surface as a
        // JoinError instead of unwinding through the connection.
        match tokio::spawn(handler(fields)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(command, error = %err, "handler failed");
                Response::failure(format!("Error processing command: {err:#}"))
            }
            Err(err) => {
                warn!(command, error = %err, "handler aborted");
                Response::failure("Error processing command: handler aborted")
            }
        }
    }
}

/// Long-lived service objects the handlers close over. Constructed once in
/// `main` and shared by reference; nothing here is a process-wide global.
pub struct Services {
    pub shell: Arc<ShellService>,
    pub scheduler: Arc<Scheduler>,
    pub capabilities: Capabilities,
    pub system: Arc<SystemProbe>,
    pub log_store: Arc<LogStore>,
    pub probe_target: String,
    pub probe_timeout: Duration,
}

pub fn build_registry(services: Services) -> CommandRegistry {
    let mut registry = CommandRegistry::new();

    registry.register("check_connection", |_fields| async {
        Ok(Response::ok("Connected"))
    });

    {
        let target = services.probe_target.clone();
        let deadline = services.probe_timeout;
        registry.register("check_internet", move |_fields| {
            let target = target.clone();
            async move {
                if policy::probe(&target, deadline).await {
                    Ok(Response::ok("Internet is still accessible."))
                } else {
                    Ok(Response::failure("Internet is confirmed to be blocked."))
                }
            }
        });
    }

    {
        let scheduler = Arc::clone(&services.scheduler);
        registry.register("block_internet", move |_fields| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                Ok(match scheduler.force(BlockState::Blocked) {
                    Ok(()) => Response::ok("Internet block settings applied successfully."),
                    Err(err) => Response::failure(format!("Error blocking internet: {err}")),
                })
            }
        });
    }

    {
        let scheduler = Arc::clone(&services.scheduler);
        registry.register("unblock_internet", move |_fields| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                Ok(match scheduler.force(BlockState::Unblocked) {
                    Ok(()) => Response::ok("Internet unblocked successfully."),
                    Err(err) => Response::failure(format!("Error unblocking internet: {err}")),
                })
            }
        });
    }

    {
        let scheduler = Arc::clone(&services.scheduler);
        registry.register("add_schedule", move |fields| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let entry = match parse_schedule_entry(&fields) {
                    Ok(entry) => entry,
                    Err(err) => {
                        return Ok(Response::failure(format!("Error adding schedule: {err}")))
                    }
                };
                Ok(match scheduler.add(entry) {
                    Ok(entries) => Response::ok_with(
                        "Schedule added successfully.",
                        serde_json::to_value(entries)?,
                    ),
                    Err(err) => Response::failure(format!("Error adding schedule: {err}")),
                })
            }
        });
    }

    {
        let scheduler = Arc::clone(&services.scheduler);
        registry.register("remove_schedule", move |fields| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let index = require_u64(&fields, "index")? as usize;
                Ok(match scheduler.remove(index) {
                    Ok(entries) => Response::ok_with(
                        "Schedule removed successfully.",
                        serde_json::to_value(entries)?,
                    ),
                    Err(ScheduleError::InvalidIndex) => {
                        Response::failure("Invalid schedule index.")
                    }
                    Err(err) => Response::failure(format!("Error removing schedule: {err}")),
                })
            }
        });
    }

    {
        let scheduler = Arc::clone(&services.scheduler);
        registry.register("list_schedules", move |_fields| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                Ok(Response::ok_with(
                    "Schedules retrieved successfully.",
                    serde_json::to_value(scheduler.list())?,
                ))
            }
        });
    }

    {
        let shell = Arc::clone(&services.shell);
        registry.register("execute_command", move |fields| {
            let shell = Arc::clone(&shell);
            async move {
                let command = require_str(&fields, "command")?;
                Ok(match shell.execute(&command).await {
                    Ok(output) => Response::ok_with(
                        "Command executed successfully.",
                        json!({ "output": output.trim() }),
                    ),
                    Err(err) => Response::failure(format!("Error executing command: {err}")),
                })
            }
        });
    }

    {
        let shell = Arc::clone(&services.shell);
        registry.register("stop_shell", move |_fields| {
            let shell = Arc::clone(&shell);
            async move {
                Ok(match shell.stop().await {
                    Ok(()) => Response::ok("Shell terminated successfully."),
                    Err(ShellError::NotRunning) => Response::failure("Shell is not running."),
                    Err(err) => Response::failure(format!("Error stopping shell: {err}")),
                })
            }
        });
    }

    {
        let processes = Arc::clone(&services.capabilities.processes);
        registry.register("get_processes", move |_fields| {
            let processes = Arc::clone(&processes);
            async move {
                Ok(match processes.list() {
                    Ok(list) => Response::ok_with(
                        "Processes fetched successfully.",
                        serde_json::to_value(list)?,
                    ),
                    Err(err) => Response::failure(format!("Error fetching processes: {err}")),
                })
            }
        });
    }

    {
        let processes = Arc::clone(&services.capabilities.processes);
        registry.register("kill_process", move |fields| {
            let processes = Arc::clone(&processes);
            async move {
                let pid = require_u64(&fields, "pid")? as u32;
                Ok(match processes.kill(pid) {
                    Ok(()) => Response::ok(format!("Process {pid} terminated successfully.")),
                    Err(err) => {
                        Response::failure(format!("Error terminating process {pid}: {err}"))
                    }
                })
            }
        });
    }

    {
        let host_services = Arc::clone(&services.capabilities.services);
        registry.register("get_services", move |_fields| {
            let host_services = Arc::clone(&host_services);
            async move {
                Ok(match host_services.list() {
                    Ok(list) => Response::ok_with(
                        "Services fetched successfully.",
                        serde_json::to_value(list)?,
                    ),
                    Err(err) => Response::failure(format!("Error fetching services: {err}")),
                })
            }
        });
    }

    {
        let host_services = Arc::clone(&services.capabilities.services);
        registry.register("stop_service", move |fields| {
            let host_services = Arc::clone(&host_services);
            async move {
                let name = require_str(&fields, "service_name")?;
                Ok(match host_services.stop(&name) {
                    Ok(()) => Response::ok(format!("Service '{name}' stopped successfully.")),
                    Err(err) => {
                        Response::failure(format!("Error stopping service '{name}': {err}"))
                    }
                })
            }
        });
    }

    {
        let capture = Arc::clone(&services.capabilities.capture);
        registry.register("list_windows", move |_fields| {
            let capture = Arc::clone(&capture);
            async move {
                Ok(match capture.list_windows() {
                    Ok(windows) => Response::ok_with(
                        "Windows fetched successfully.",
                        serde_json::to_value(windows)?,
                    ),
                    Err(err) => Response::failure(format!("Error fetching windows: {err}")),
                })
            }
        });
    }

    {
        let capture = Arc::clone(&services.capabilities.capture);
        registry.register("capture_window", move |fields| {
            let capture = Arc::clone(&capture);
            async move {
                let window_id = require_u64(&fields, "window_id")?;
                Ok(match capture.capture_window(window_id) {
                    Ok(artifact) => Response::ok_with(
                        "Screenshot captured successfully.",
                        serde_json::to_value(artifact)?,
                    ),
                    Err(err) => Response::failure(format!("Error capturing screenshot: {err}")),
                })
            }
        });
    }

    {
        let keylog = Arc::clone(&services.capabilities.keylog);
        registry.register("start_keylogger", move |_fields| {
            let keylog = Arc::clone(&keylog);
            async move {
                Ok(match keylog.start() {
                    Ok(()) => Response::ok("Keylogger started successfully."),
                    Err(CapabilityError::AlreadyActive) => {
                        Response::failure("Keylogger is already running.")
                    }
                    Err(err) => Response::failure(err.to_string()),
                })
            }
        });
    }

    {
        let keylog = Arc::clone(&services.capabilities.keylog);
        registry.register("stop_keylogger", move |_fields| {
            let keylog = Arc::clone(&keylog);
            async move {
                Ok(match keylog.stop() {
                    Ok(()) => Response::ok("Keylogger stopped and logs cleared."),
                    Err(CapabilityError::NotActive) => {
                        Response::failure("Keylogger is not running.")
                    }
                    Err(err) => Response::failure(err.to_string()),
                })
            }
        });
    }

    {
        let keylog = Arc::clone(&services.capabilities.keylog);
        registry.register("get_keylogs", move |_fields| {
            let keylog = Arc::clone(&keylog);
            async move {
                Ok(match keylog.logs() {
                    Ok(logs) => Response::ok_with(
                        "Key logs fetched successfully.",
                        Value::String(logs),
                    ),
                    Err(err) => Response::failure(err.to_string()),
                })
            }
        });
    }

    {
        let log_store = Arc::clone(&services.log_store);
        registry.register("get_logs", move |_fields| {
            let log_store = Arc::clone(&log_store);
            async move {
                Ok(match log_store.read() {
                    Ok(logs) => Response::ok_with(
                        "Logs retrieved successfully.",
                        Value::String(logs),
                    ),
                    Err(err) => Response::failure(format!("Error retrieving logs: {err}")),
                })
            }
        });
    }

    {
        let log_store = Arc::clone(&services.log_store);
        registry.register("clear_logs", move |_fields| {
            let log_store = Arc::clone(&log_store);
            async move {
                Ok(match log_store.clear() {
                    Ok(()) => Response::ok("Logs cleared successfully."),
                    Err(err) => Response::failure(format!("Error clearing logs: {err}")),
                })
            }
        });
    }

    {
        let system = Arc::clone(&services.system);
        registry.register("get_system_info", move |_fields| {
            let system = Arc::clone(&system);
            async move {
                let location = system.location().await;
                Ok(Response::ok_with(
                    "System information retrieved successfully.",
                    json!({
                        "mac_address": system.mac_address(),
                        "location": location,
                    }),
                ))
            }
        });
    }

    registry.register("list_files", |fields| async move {
        let directory = optional_str(&fields, "directory", ".");
        Ok(match files::list_files(&directory) {
            Ok(entries) => Response::ok_with(
                "Files listed successfully.",
                serde_json::to_value(entries)?,
            ),
            Err(err) => Response::failure(format!("Error listing files: {err}")),
        })
    });

    registry.register("download_file", |fields| async move {
        let path = require_str(&fields, "file_path")?;
        Ok(match files::download_file(&path) {
            Ok(download) => Response::ok_with(
                "File downloaded successfully.",
                serde_json::to_value(download)?,
            ),
            Err(FileError::NotFound) => Response::failure("File does not exist."),
            Err(err) => Response::failure(format!("Error downloading file: {err}")),
        })
    });

    registry
}

fn parse_schedule_entry(fields: &Fields) -> Result<ScheduleEntry> {
    let kind_text = require_str(fields, "schedule_type")?;
    let kind = ScheduleKind::parse(&kind_text)
        .ok_or_else(|| anyhow!("unknown schedule type `{kind_text}`"))?;
    Ok(ScheduleEntry {
        kind,
        selector: require_str(fields, "date_or_day")?,
        start: parse_time(&require_str(fields, "start_time")?)?,
        end: parse_time(&require_str(fields, "end_time")?)?,
    })
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|err| anyhow!("invalid time `{value}`: {err}"))
}

fn require_str(fields: &Fields, key: &str) -> Result<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing field `{key}`"))
}

fn require_u64(fields: &Fields, key: &str) -> Result<u64> {
    fields
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("missing field `{key}`"))
}

fn optional_str(fields: &Fields, key: &str, default: &str) -> String {
    fields
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_command_is_a_lookup_miss() {
        let registry = CommandRegistry::new();
        let response = registry.dispatch("make_coffee", Fields::new()).await;
        assert!(!response.success);
        assert_eq!(response.message, UNKNOWN_REQUEST_MESSAGE);
    }

    #[tokio::test]
    async fn handler_errors_become_failed_responses() {
        let mut registry = CommandRegistry::new();
        registry.register("explode", |_fields| async {
            Err(anyhow!("socket caught fire"))
        });
        let response = registry.dispatch("explode", Fields::new()).await;
        assert!(!response.success);
        assert!(response.message.contains("socket caught fire"));
    }

    #[tokio::test]
    async fn handler_panics_are_contained() {
        let mut registry = CommandRegistry::new();
        registry.register("panic", |_fields| async {
            panic!("handler bug");
        });
        let response = registry.dispatch("panic", Fields::new()).await;
        assert!(!response.success);

        // The registry keeps serving after the panic.
        registry.register("ping", |_fields| async { Ok(Response::ok("pong")) });
        let response = registry.dispatch("ping", Fields::new()).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn missing_field_is_reported_as_diagnostic() {
        let mut registry = CommandRegistry::new();
        registry.register("needs_pid", |fields| async move {
            let pid = require_u64(&fields, "pid")?;
            Ok(Response::ok(format!("{pid}")))
        });
        let response = registry.dispatch("needs_pid", Fields::new()).await;
        assert!(!response.success);
        assert!(response.message.contains("missing field `pid`"));
    }
}
