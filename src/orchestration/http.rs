//! Executor that hands tasks to the swarm API's `POST /grind` endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::Task;
use crate::orchestration::executor::{
    ExecutionFailure, ExecutionResult, ExecutionSuccess, Executor,
};
use crate::util::truncate;
use crate::Result;

const ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Serialize)]
struct GrindRequest<'a> {
    task_id: &'a str,
    task: &'a str,
    min_budget: f64,
    max_budget: f64,
    intensity: String,
    timeout: u64,
}

#[derive(Debug, Default, Deserialize)]
struct GrindResponse {
    status: Option<String>,
    result: Option<String>,
    output: Option<String>,
    budget_used: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: String,
    default_min_budget: f64,
    default_max_budget: f64,
    timeout_secs: u64,
}

impl HttpExecutor {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.executor_timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.api_endpoint.trim_end_matches('/').to_string(),
            default_min_budget: config.default_min_budget,
            default_max_budget: config.default_max_budget,
            timeout_secs: config.executor_timeout_secs,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn grind_url(&self) -> String {
        format!("{}/grind", self.endpoint)
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, task: &Task) -> ExecutionResult {
        let (min_budget, max_budget) =
            task.budget_range(self.default_min_budget, self.default_max_budget);
        let instruction = task.instruction();
        let request = GrindRequest {
            task_id: &task.id,
            task: if instruction.is_empty() { task.id.as_str() } else { instruction },
            min_budget,
            max_budget,
            intensity: task.intensity_or_default().to_string(),
            timeout: self.timeout_secs,
        };

        let url = self.grind_url();
        debug!(task_id = %task.id, url = %url, "posting grind request");

        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                return Err(ExecutionFailure::new(
                    "ConnectionError",
                    format!("Cannot connect to {}: {}", self.endpoint, e),
                ))
            }
            Err(e) if e.is_timeout() => {
                return Err(ExecutionFailure::new(
                    "Timeout",
                    format!("No response from {} after {}s", url, self.timeout_secs),
                ))
            }
            Err(e) => return Err(ExecutionFailure::new("RequestError", e.to_string())),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(task_id = %task.id, status = %status, "grind request failed");
            return Err(ExecutionFailure::new(
                "HTTPError",
                format!("{}: {}", status.as_u16(), truncate(body.trim(), ERROR_BODY_CHARS)),
            ));
        }

        let parsed: GrindResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Ok(ExecutionSuccess::new(truncate(body.trim(), ERROR_BODY_CHARS)))
            }
        };

        let summary = parsed.result.unwrap_or_else(|| "completed".to_string());
        if parsed.status.as_deref() == Some("failed") {
            let detail = match parsed.output.filter(|o| !o.trim().is_empty()) {
                Some(output) => format!("{} ({})", summary, truncate(output.trim(), ERROR_BODY_CHARS)),
                None => summary,
            };
            return Err(ExecutionFailure::new("TaskFailed", detail));
        }

        Ok(ExecutionSuccess::new(summary).with_cost(parsed.budget_used))
    }
}
