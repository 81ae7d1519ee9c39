//! Tool calls issued by the remote model
//!
//! Each capability implements [`LiveTool`] and is registered with the
//! [`ToolCallDispatcher`]. Dispatch always produces exactly one
//! [`ToolCallResult`] per request, carrying an `error` field when the
//! capability fails, so the model never waits on an unanswered call.

use crate::error::VoiceError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Characters of the serialized response kept when it has to be cut down
const TRUNCATED_SUMMARY_CHARS: usize = 800;

/// Errors a tool implementation can report
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Backend(String),
}

impl From<VoiceError> for ToolError {
    fn from(err: VoiceError) -> Self {
        ToolError::Backend(err.to_string())
    }
}

/// A tool-call request from the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Answer to one [`ToolCallRequest`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    /// Sent to the model as `functionResponses[].response`
    pub response: Value,
    /// Set when the call failed; mirrors `response.error`
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn success(id: &str, name: &str, response: Value) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            response,
            error: None,
        }
    }

    pub fn failure(request: &ToolCallRequest, reason: &str) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            response: json!({ "error": reason }),
            error: Some(reason.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The failure as a crate error, for callers that log or surface it.
    pub fn dispatch_error(&self) -> Option<VoiceError> {
        self.error.as_ref().map(|reason| VoiceError::ToolDispatchFailure {
            tool: self.name.clone(),
            reason: reason.clone(),
        })
    }
}

/// Function declaration advertised in the session setup
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A local capability the model can invoke
#[async_trait::async_trait]
pub trait LiveTool: Send + Sync {
    /// Unique tool identifier
    fn name(&self) -> &str;

    /// Human-readable description shown to the model
    fn description(&self) -> &str;

    /// JSON schema of the arguments
    fn parameters(&self) -> Value;

    /// Execute the tool
    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

/// Routes tool-call requests to registered tools
pub struct ToolCallDispatcher {
    tools: Vec<Arc<dyn LiveTool>>,
    max_response_bytes: usize,
}

impl ToolCallDispatcher {
    pub fn new(max_response_bytes: usize) -> Self {
        Self {
            tools: Vec::new(),
            max_response_bytes,
        }
    }

    /// Register a tool
    pub fn register(&mut self, tool: Arc<dyn LiveTool>) {
        self.tools.push(tool);
    }

    /// Get tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn LiveTool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools
            .iter()
            .map(|t| FunctionDeclaration {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Run one request to completion. Never fails: errors become the
    /// result's `error` field.
    pub async fn dispatch(&self, request: ToolCallRequest) -> ToolCallResult {
        let Some(tool) = self.get(&request.name) else {
            warn!(tool = %request.name, "unknown tool requested");
            return ToolCallResult::failure(&request, &format!("Unknown tool: {}", request.name));
        };

        info!(tool = %request.name, id = %request.id, "🔧 Executing tool");
        let started = Instant::now();
        let outcome = tool.execute(request.args.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                let response = self.cap_response(&request.name, response);
                let error = response.get("error").and_then(Value::as_str).map(str::to_string);
                info!(tool = %request.name, elapsed_ms, ok = error.is_none(), "tool finished");
                ToolCallResult {
                    id: request.id,
                    name: request.name,
                    response,
                    error,
                }
            }
            Err(e) => {
                warn!(tool = %request.name, elapsed_ms, "❌ Tool failed: {}", e);
                ToolCallResult::failure(&request, &format!("Tool call failed: {e}"))
            }
        }
    }

    fn cap_response(&self, tool: &str, response: Value) -> Value {
        let serialized = response.to_string();
        if serialized.len() <= self.max_response_bytes {
            return response;
        }

        warn!(tool, bytes = serialized.len(), "tool response too large, truncating");
        json!({
            "status": response.get("status").cloned().unwrap_or_else(|| json!("complete")),
            "component": response.get("component").cloned().unwrap_or_else(|| json!("")),
            "summary": serialized.chars().take(TRUNCATED_SUMMARY_CHARS).collect::<String>(),
        })
    }
}
