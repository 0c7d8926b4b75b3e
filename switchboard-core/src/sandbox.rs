//! The worker sandbox: bounded execution of user scripts on pre-request
//! and post-response hooks.
//!
//! Scripts are Rhai. Each execution gets a deep copy of
//! `{request, response, env}` bound as `input`, plus a `log(msg)` sink,
//! and evaluates to a map that may carry `{modified, request, response}`.
//! Execution is capped by wall clock (50 ms) and an operation budget; a
//! script that times out or errors is skipped without affecting the
//! request. A pre-request script that returns a `response`
//! short-circuits the pipeline with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rhai::{Dynamic, Engine, Scope};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SwitchboardError};

/// Wall-clock cap per script execution.
const EXEC_TIMEOUT: Duration = Duration::from_millis(50);
/// Rhai operation budget per execution.
const MAX_OPERATIONS: u64 = 100_000;

/// When a script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTrigger {
    PreRequest,
    PostResponse,
}

/// A registered user script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerScript {
    pub id: String,
    pub trigger: WorkerTrigger,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub code: String,
}

fn default_enabled() -> bool {
    true
}

/// YAML registry file shape.
#[derive(Debug, Deserialize)]
struct WorkersFile {
    #[serde(default)]
    workers: Vec<WorkerScript>,
}

/// Aggregated outcome of a hook chain.
#[derive(Debug, Default, Clone)]
pub struct ChainOutcome {
    /// True when any script modified the request or response.
    pub modified: bool,
    pub request: Option<serde_json::Value>,
    /// For the pre-request chain, a synthetic response that short-circuits
    /// the pipeline.
    pub response: Option<serde_json::Value>,
}

/// Runs registered scripts in `order`.
pub struct WorkerSandbox {
    scripts: RwLock<Vec<WorkerScript>>,
}

impl Default for WorkerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSandbox {
    pub fn new() -> Self {
        Self {
            scripts: RwLock::new(Vec::new()),
        }
    }

    /// Load scripts from the YAML registry at `path`.
    pub async fn load_file(&self, path: &std::path::Path) -> Result<usize> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SwitchboardError::Config(format!("{}: {e}", path.display())))?;
        let file: WorkersFile = serde_yaml::from_str(&contents)
            .map_err(|e| SwitchboardError::Config(format!("{}: {e}", path.display())))?;
        let count = file.workers.len();
        let mut scripts = self.scripts.write().await;
        *scripts = file.workers;
        scripts.sort_by_key(|s| s.order);
        info!(count, path = %path.display(), "Worker scripts loaded");
        Ok(count)
    }

    /// Register one script programmatically.
    pub async fn register(&self, script: WorkerScript) {
        let mut scripts = self.scripts.write().await;
        scripts.retain(|s| s.id != script.id);
        scripts.push(script);
        scripts.sort_by_key(|s| s.order);
    }

    pub async fn script_count(&self) -> usize {
        self.scripts.read().await.len()
    }

    /// Run the chain for `trigger`. Later scripts observe earlier
    /// modifications. A pre-request script returning a response stops the
    /// chain immediately.
    pub async fn run_chain(
        &self,
        trigger: WorkerTrigger,
        request: &serde_json::Value,
        response: Option<&serde_json::Value>,
        env: &HashMap<String, String>,
    ) -> ChainOutcome {
        let scripts: Vec<WorkerScript> = {
            let guard = self.scripts.read().await;
            guard
                .iter()
                .filter(|s| s.enabled && s.trigger == trigger)
                .cloned()
                .collect()
        };

        let mut outcome = ChainOutcome::default();
        let mut current_request = request.clone();
        let mut current_response = response.cloned();

        for script in scripts {
            let input = serde_json::json!({
                "request": current_request,
                "response": current_response,
                "env": env,
            });
            match execute_script(script.clone(), input).await {
                Ok(Some(result)) => {
                    let modified = result
                        .get("modified")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false);
                    if let Some(new_request) = result.get("request") {
                        if !new_request.is_null() {
                            current_request = new_request.clone();
                            outcome.request = Some(current_request.clone());
                            outcome.modified = true;
                        }
                    }
                    if let Some(new_response) = result.get("response") {
                        if !new_response.is_null() {
                            current_response = Some(new_response.clone());
                            outcome.response = Some(new_response.clone());
                            outcome.modified = true;
                            if trigger == WorkerTrigger::PreRequest {
                                // Synthetic response short-circuits the chain.
                                return outcome;
                            }
                        }
                    }
                    if modified {
                        outcome.modified = true;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker = %script.id, error = %e, "Worker script skipped");
                }
            }
        }
        outcome
    }
}

/// Run one script on a blocking thread under the wall-clock and operation
/// budgets. Returns the script's result map, if it produced one.
async fn execute_script(
    script: WorkerScript,
    input: serde_json::Value,
) -> Result<Option<serde_json::Value>> {
    let handle = tokio::task::spawn_blocking(move || -> Result<Option<serde_json::Value>> {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        let deadline = Instant::now() + EXEC_TIMEOUT;
        engine.on_progress(move |_| {
            if Instant::now() > deadline {
                Some("execution budget exhausted".into())
            } else {
                None
            }
        });
        let worker_id: Arc<str> = Arc::from(script.id.as_str());
        engine.register_fn("log", move |message: &str| {
            debug!(worker = %worker_id, "{message}");
        });

        let mut scope = Scope::new();
        let dynamic_input = rhai::serde::to_dynamic(&input)
            .map_err(|e| SwitchboardError::Evaluation(e.to_string()))?;
        scope.push_dynamic("input", dynamic_input);

        let result: Dynamic = engine
            .eval_with_scope(&mut scope, &script.code)
            .map_err(|e| SwitchboardError::Evaluation(e.to_string()))?;
        if result.is_unit() {
            return Ok(None);
        }
        let value: serde_json::Value = rhai::serde::from_dynamic(&result)
            .map_err(|e| SwitchboardError::Evaluation(e.to_string()))?;
        Ok(Some(value))
    });

    // Backstop over the in-engine deadline: the blocking task also races a
    // slightly larger outer timeout.
    match tokio::time::timeout(EXEC_TIMEOUT * 2, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SwitchboardError::Evaluation(join_err.to_string())),
        Err(_) => Err(SwitchboardError::Evaluation(
            "worker execution timed out".to_string(),
        )),
    }
}
