use super::TransportState;
use crate::models::{AgentTaskResponse, CompletionDetails, JobStatus, ResponseStatus};
use crate::LoomError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

pub const TOOL_SUBMIT_TASK_RESPONSE: &str = "submit-task-response";
pub const TOOL_GET_JOB_RESULT: &str = "get-job-result";
pub const TOOL_VALIDATE_PATH: &str = "validate-path";

/// One line in: `{"id"?, "tool", "params"}`.
#[derive(Debug, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolContent {
    pub text: String,
}

/// One line out: the tool-call envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub is_error: bool,
    pub content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ToolErrorDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorDetails {
    pub code: String,
}

impl ToolResult {
    fn text(text: impl Into<String>) -> Self {
        Self {
            id: None,
            is_error: false,
            content: vec![ToolContent { text: text.into() }],
            error_details: None,
            poll_interval: None,
        }
    }

    fn error(err: &LoomError) -> Self {
        Self {
            id: None,
            is_error: true,
            content: vec![ToolContent {
                text: err.to_string(),
            }],
            error_details: Some(ToolErrorDetails {
                code: err.kind().code().to_string(),
            }),
            poll_interval: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponseParams {
    agent_id: String,
    task_id: String,
    status: ResponseStatus,
    response: String,
    completion_details: Option<CompletionDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetJobResultParams {
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidatePathParams {
    path: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    write: bool,
}

/// Dispatch one tool call; this is the whole stdio/RPC surface.
pub async fn handle_tool_call(state: &TransportState, call: ToolCall) -> ToolResult {
    let mut result = match call.tool.as_str() {
        TOOL_SUBMIT_TASK_RESPONSE => submit_task_response(state, call.params).await,
        TOOL_GET_JOB_RESULT => get_job_result(state, call.params),
        TOOL_VALIDATE_PATH => validate_path(state, call.params),
        other => ToolResult::error(&LoomError::Validation(format!("unknown tool: {other}"))),
    };
    result.id = call.id;
    result
}

async fn submit_task_response(state: &TransportState, params: serde_json::Value) -> ToolResult {
    let params: SubmitResponseParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => return ToolResult::error(&LoomError::Validation(e.to_string())),
    };

    let response = AgentTaskResponse {
        agent_id: params.agent_id,
        task_id: params.task_id.clone(),
        status: params.status,
        response: params.response,
        completion_details: params.completion_details,
        received_at: Utc::now(),
    };

    match state.processor.process(response).await {
        Ok(report) => ToolResult::text(format!(
            "Response for task {} processed; task is now {:?}.",
            params.task_id, report.task_status
        )),
        Err(e) => ToolResult::error(&e),
    }
}

fn get_job_result(state: &TransportState, params: serde_json::Value) -> ToolResult {
    let params: GetJobResultParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => return ToolResult::error(&LoomError::Validation(e.to_string())),
    };

    let outcome = match state.jobs.get_with_rate_limit(&params.job_id) {
        Ok(outcome) => outcome,
        Err(e) => return ToolResult::error(&e),
    };

    if outcome.should_wait {
        let wait_secs = outcome.wait_ms.div_ceil(1000);
        let mut result = ToolResult::text(format!(
            "Please wait {wait_secs} seconds before polling job {} again.",
            params.job_id
        ));
        result.poll_interval = Some(wait_secs);
        return result;
    }

    let Some(job) = outcome.job else {
        return ToolResult::error(&LoomError::NotFound(format!("job {}", params.job_id)));
    };

    match (&job.result, job.status) {
        (Some(result), status) => {
            let body = serde_json::to_string_pretty(result)
                .unwrap_or_else(|_| result.to_string());
            let status_line = match status {
                JobStatus::Completed => "completed",
                JobStatus::Failed => "failed",
                JobStatus::Running => "running",
                JobStatus::Pending => "pending",
            };
            ToolResult::text(format!("{body}\n\nJob status: {status_line}"))
        }
        (None, _) => {
            let mut text = format!(
                "Job {} is {:?}.",
                job.id, job.status
            );
            if let Some(progress) = &job.progress_message {
                text.push_str(&format!(" Progress: {progress}"));
            }
            let mut result = ToolResult::text(text);
            result.poll_interval = Some(outcome.poll_interval_ms.div_ceil(1000).max(1));
            result
        }
    }
}

fn validate_path(state: &TransportState, params: serde_json::Value) -> ToolResult {
    let params: ValidatePathParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => return ToolResult::error(&LoomError::Validation(e.to_string())),
    };

    let session = params.session_id.as_deref().unwrap_or("stdio");
    let mode = if params.write {
        crate::security::AccessMode::Write
    } else {
        crate::security::AccessMode::Read
    };

    match state.security.paths.validate(session, &params.path, mode) {
        Ok(canonical) => {
            ToolResult::text(format!("valid=true canonical={}", canonical.display()))
        }
        // The error text carries only the violation kind, never the path.
        Err(e) => ToolResult::error(&e),
    }
}

/// Line-delimited JSON loop over stdin/stdout.
pub async fn run_stdio(state: TransportState, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    info!("stdio transport listening");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("stdin closed, stdio transport exiting");
                        return;
                    }
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let result = match serde_json::from_str::<ToolCall>(&line) {
                    Ok(call) => handle_tool_call(&state, call).await,
                    Err(e) => ToolResult::error(&LoomError::Validation(format!(
                        "malformed tool call: {e}"
                    ))),
                };

                match serde_json::to_string(&result) {
                    Ok(mut out) => {
                        out.push('\n');
                        if stdout.write_all(out.as_bytes()).await.is_err() {
                            return;
                        }
                        let _ = stdout.flush().await;
                    }
                    Err(e) => warn!("tool result serialization failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("stdio transport stopping");
                    return;
                }
            }
        }
    }
}
