use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tether_core::error::codes;
use tether_core::{
    ActionOutcome, ConnectionState, Credentials, SessionConfig, SessionError, SessionManager,
    SessionStatus, Verdict,
};
use tokio::io::{
    self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod actions;
pub mod bridge;
#[cfg(test)]
mod sidecar;

use actions::{SIGN_LINE_MAX_CHARS, SIGN_MAX_LINES, is_world_action_tool, world_action_from_args};
use bridge::BridgeConnector;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "tether-mcp";
const CHAT_HISTORY_DEFAULT_LIMIT: u64 = 20;
const CHAT_MESSAGE_MAX_CHARS: usize = 256;
const DEFAULT_GAME_PORT: u16 = 25565;
const STATUS_RESOURCE_URI: &str = "tether://session/status";
const CHAT_RESOURCE_URI: &str = "tether://chat/recent";

fn build_tool_call_response(
    tool_name: &str,
    envelope: Value,
    is_error: bool,
    session_warning: Option<&str>,
) -> Value {
    let mut text = tool_text_content(tool_name, &envelope);
    if let Some(warning) = session_warning {
        text = format!("{warning}{text}");
    }

    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

fn needs_live_session(name: &str) -> bool {
    is_world_action_tool(name) || matches!(name, "tether_chat_send" | "tether_claim_lookup")
}

/// Prefix for tools that need a live session while none is available.
fn session_warning(name: &str, status: &SessionStatus) -> Option<String> {
    if !needs_live_session(name) {
        return None;
    }
    match status.state {
        ConnectionState::Connected => None,
        ConnectionState::Connecting => Some(
            "⚠ A connection attempt is in progress. Poll tether_session_status until state=connected.\n\n"
                .to_string(),
        ),
        ConnectionState::Reconnecting => Some(format!(
            "⚠ Session dropped and is reconnecting (attempt {}/{}). Actions fail until it is connected again.\n\n",
            status.reconnect_attempt, status.max_attempts
        )),
        ConnectionState::Disconnected => {
            Some("⚠ No live session. Call tether_connect first.\n\n".to_string())
        }
    }
}

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run a Tether MCP server over stdio
    Serve(McpServeArgs),
    /// Connect once through the bridge, print the session status and disconnect
    Probe(McpProbeArgs),
}

/// Game server credentials. Both host and username are needed to connect.
#[derive(Args, Clone, Debug)]
pub struct ConnectArgs {
    /// Game server host
    #[arg(long, env = "TETHER_HOST")]
    pub host: Option<String>,
    /// Game server port
    #[arg(long, env = "TETHER_PORT", default_value_t = DEFAULT_GAME_PORT)]
    pub port: u16,
    /// Agent identity on the server
    #[arg(long, env = "TETHER_USERNAME")]
    pub username: Option<String>,
    /// Opaque auth token forwarded to the bridge
    #[arg(long, env = "TETHER_AUTH")]
    pub auth: Option<String>,
}

impl ConnectArgs {
    fn credentials(&self) -> Option<Credentials> {
        let host = self.host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
        let username = self
            .username
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())?;
        Some(Credentials {
            host: host.to_string(),
            port: self.port,
            username: username.to_string(),
            auth: self.auth.clone().filter(|a| !a.is_empty()),
        })
    }
}

#[derive(Args, Clone, Debug)]
pub struct McpServeArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Clone, Debug)]
pub struct McpProbeArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

pub async fn run(bridge_addr: &str, bridge_timeout: Duration, command: McpCommands) -> i32 {
    let connector = BridgeConnector::new(bridge_addr, bridge_timeout);
    let config = SessionConfig::from_env();
    match command {
        McpCommands::Serve(args) => {
            let server = McpServer::new(connector, config);
            if let Some(credentials) = args.connect.credentials() {
                server.spawn_auto_connect(credentials);
            }
            match server.serve_stdio().await {
                Ok(()) => 0,
                Err(err) => {
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err,
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    1
                }
            }
        }
        McpCommands::Probe(args) => {
            let Some(credentials) = args.connect.credentials() else {
                let payload = ToolError::new(
                    codes::VALIDATION_FAILED,
                    "probe needs --host and --username (or TETHER_HOST / TETHER_USERNAME)",
                )
                .with_field("host")
                .to_value();
                eprintln!("{}", to_pretty_json(&payload));
                return 1;
            };
            let server = McpServer::new(connector, config);
            server.run_probe(credentials).await
        }
    }
}

struct McpServer {
    session: Arc<SessionManager<BridgeConnector>>,
    bridge_addr: String,
    session_id: String,
}

impl McpServer {
    fn new(connector: BridgeConnector, config: SessionConfig) -> Self {
        let bridge_addr = connector.addr().to_string();
        Self {
            session: SessionManager::new(connector, config),
            bridge_addr,
            session_id: format!("stdio-{}", Uuid::now_v7()),
        }
    }

    fn spawn_auto_connect(&self, credentials: Credentials) {
        let session = Arc::clone(&self.session);
        let endpoint = credentials.endpoint();
        tokio::spawn(async move {
            match session.connect(credentials).await {
                Ok(status) => {
                    info!(endpoint = %endpoint, state = %status.state, "auto-connect finished")
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, code = err.code(), "auto-connect failed")
                }
            }
        });
    }

    async fn run_probe(&self, credentials: Credentials) -> i32 {
        let started = Instant::now();
        let result = self.session.connect(credentials).await;
        let report = match &result {
            Ok(status) => json!({
                "status": "connected",
                "bridge": self.bridge_addr,
                "elapsed_ms": started.elapsed().as_millis() as u64,
                "session": status,
            }),
            Err(err) => json!({
                "status": "failed",
                "bridge": self.bridge_addr,
                "elapsed_ms": started.elapsed().as_millis() as u64,
                "error": ToolError::from(err.clone()).to_value(),
                "session": self.session.status(),
            }),
        };
        println!("{}", to_pretty_json(&report));
        if result.is_ok() {
            self.session.disconnect().await;
            0
        } else {
            2
        }
    }

    async fn serve_stdio(&self) -> Result<(), String> {
        info!(
            server = MCP_SERVER_NAME,
            version = env!("CARGO_PKG_VERSION"),
            bridge = %self.bridge_addr,
            session_id = %self.session_id,
            "mcp server listening on stdio"
        );
        self.serve(BufReader::new(io::stdin()), io::stdout()).await
    }

    async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<(), String>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut writer, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        info!(session_id = %self.session_id, "stdin closed, shutting down");
        self.session.disconnect().await;
        Ok(())
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // A client response; this server never issues requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method);
            None
        }
    }

    fn handle_notification(&self, method: &str) {
        debug!(method, "notification ignored");
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(self.resources_list_payload()),
            "resources/read" => self.handle_resources_read(params),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        let instructions = "Start with tether_session_status. If state is disconnected, call tether_connect with host and username; if it is connecting or reconnecting, poll status instead of connecting again. Mutating tools (tether_place_block, tether_break_block, tether_place_sign, tether_mount, tether_open_container, tether_create_shop) report a verdict: succeeded, denied or failed_unknown. A denied verdict carries the server's refusal text and claim_info when available; do not retry it unchanged. failed_unknown means nothing observable changed and no refusal was seen, so inspect before retrying. Use tether_claim_lookup to check who owns the ground before building, and tether_chat_history to read recent chat and server messages.";
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "resources": {
                    "listChanged": false
                },
                "prompts": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": instructions,
            "sessionStatus": self.session.status()
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = tool_definitions()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    fn resources_list_payload(&self) -> Value {
        let resources: Vec<Value> = resource_definitions()
            .into_iter()
            .map(|res| {
                json!({
                    "uri": res.uri,
                    "name": res.name,
                    "description": res.description,
                    "mimeType": "application/json"
                })
            })
            .collect();
        json!({ "resources": resources })
    }

    fn handle_resources_read(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("resources/read params must be an object"))?;
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("resources/read requires string field 'uri'"))?;

        let body = match uri {
            STATUS_RESOURCE_URI => to_json(&self.session.status()),
            CHAT_RESOURCE_URI => {
                to_json(&self.session.chat_history(CHAT_HISTORY_DEFAULT_LIMIT as usize))
            }
            _ => return Err(RpcError::invalid_params(format!("Unknown resource: {uri}"))),
        }
        .map_err(|err| RpcError::internal(err.message))?;

        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": to_pretty_json(&body)
            }]
        }))
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let warning = session_warning(name, &self.session.status());
        let started = Instant::now();
        let result = self.execute_tool(name, &args).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(data) => {
                debug!(
                    session_id = %self.session_id,
                    tool = name,
                    elapsed_ms,
                    "tool call succeeded"
                );
                build_tool_call_response(
                    name,
                    json!({
                        "status": "success",
                        "phase": "final",
                        "tool": name,
                        "data": data
                    }),
                    false,
                    None,
                )
            }
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    tool = name,
                    elapsed_ms,
                    code = %err.code,
                    message = %err.message,
                    "tool call failed"
                );
                build_tool_call_response(
                    name,
                    json!({
                        "status": "error",
                        "phase": "final",
                        "tool": name,
                        "error": err.to_value()
                    }),
                    true,
                    warning.as_deref(),
                )
            }
        })
    }

    async fn execute_tool(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        match name {
            "tether_session_status" => self.tool_session_status(),
            "tether_connect" => self.tool_connect(args).await,
            "tether_disconnect" => self.tool_disconnect().await,
            "tether_chat_history" => self.tool_chat_history(args),
            "tether_chat_send" => self.tool_chat_send(args).await,
            "tether_claim_lookup" => self.tool_claim_lookup().await,
            _ if is_world_action_tool(name) => self.tool_world_action(name, args).await,
            _ => Err(ToolError::new(
                "unknown_tool",
                format!("Unknown tool '{name}'"),
            )
            .with_docs_hint("Call tools/list for the available tools.")),
        }
    }

    fn tool_session_status(&self) -> Result<Value, ToolError> {
        Ok(json!({
            "session": to_json(&self.session.status())?,
            "bridge": self.bridge_addr,
        }))
    }

    async fn tool_connect(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let host = required_string(args, "host")?;
        let username = required_string(args, "username")?;
        let port = match arg_optional_u64(args, "port")? {
            None => DEFAULT_GAME_PORT,
            Some(port) => u16::try_from(port)
                .ok()
                .filter(|port| *port > 0)
                .ok_or_else(|| {
                    ToolError::new(
                        codes::VALIDATION_FAILED,
                        format!("'port' must be between 1 and 65535, got {port}"),
                    )
                    .with_field("port")
                })?,
        };
        let credentials = Credentials {
            host: host.trim().to_string(),
            port,
            username: username.trim().to_string(),
            auth: arg_optional_string(args, "auth")?,
        };

        let status = self.session.connect(credentials).await?;
        Ok(json!({ "session": to_json(&status)? }))
    }

    async fn tool_disconnect(&self) -> Result<Value, ToolError> {
        let status = self.session.disconnect().await;
        Ok(json!({ "session": to_json(&status)? }))
    }

    fn tool_chat_history(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let capacity = self.session.config().chat_log_capacity as u64;
        let limit = arg_optional_u64(args, "limit")?.unwrap_or(CHAT_HISTORY_DEFAULT_LIMIT);
        if limit == 0 || limit > capacity {
            return Err(ToolError::new(
                codes::VALIDATION_FAILED,
                format!("'limit' must be between 1 and {capacity}"),
            )
            .with_field("limit"));
        }
        let entries = self.session.chat_history(limit as usize);
        Ok(json!({
            "count": entries.len(),
            "entries": to_json(&entries)?,
        }))
    }

    async fn tool_chat_send(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let message = required_string(args, "message")?;
        if message.chars().count() > CHAT_MESSAGE_MAX_CHARS {
            return Err(ToolError::new(
                codes::VALIDATION_FAILED,
                format!("'message' exceeds {CHAT_MESSAGE_MAX_CHARS} characters"),
            )
            .with_field("message"));
        }
        self.session.send_chat(&message).await?;
        Ok(json!({ "sent": message }))
    }

    async fn tool_claim_lookup(&self) -> Result<Value, ToolError> {
        let info = self.session.lookup_claim().await?;
        Ok(json!({ "claim": to_json(&info)? }))
    }

    async fn tool_world_action(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let action = world_action_from_args(name, args)?;
        let outcome = self.session.perform_world_action(action).await?;
        outcome_result(outcome)
    }
}

/// Denied and failed_unknown verdicts surface as tool errors carrying the
/// full outcome in `details`.
fn outcome_result(outcome: ActionOutcome) -> Result<Value, ToolError> {
    let payload = to_json(&outcome)?;
    match &outcome.verdict {
        Verdict::Succeeded => Ok(json!({ "outcome": payload })),
        Verdict::Denied { reason } => Err(ToolError::new(codes::ACTION_DENIED, reason.clone())
            .with_docs_hint(
                "The server refused the action. Check details.claim_info for who may build here and do not retry it unchanged.",
            )
            .with_details(payload)),
        Verdict::FailedUnknown { reason } => {
            Err(ToolError::new(codes::ACTION_FAILED_UNKNOWN, reason.clone())
                .with_docs_hint(
                    "Nothing observable changed and no refusal was seen. Inspect the target or run tether_claim_lookup before retrying.",
                )
                .with_details(payload))
        }
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: Some(json!({ "method": method })),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
    docs_hint: Option<String>,
    details: Option<Value>,
}

impl ToolError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

impl From<SessionError> for ToolError {
    fn from(err: SessionError) -> Self {
        let mut tool_error =
            ToolError::new(err.code(), err.to_string()).with_docs_hint(err.docs_hint());
        match &err {
            SessionError::ConnectionBusy { state } => {
                tool_error = tool_error.with_details(json!({ "state": state }));
            }
            SessionError::AttemptBudgetExhausted { attempts } => {
                tool_error = tool_error.with_details(json!({ "attempts": attempts }));
            }
            _ => {}
        }
        tool_error
    }
}

struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

struct ResourceDefinition {
    uri: &'static str,
    name: &'static str,
    description: &'static str,
}

/// Schema for tools addressed at one block, plus `extra` properties.
fn block_tool_schema(extra: Value, extra_required: &[&str]) -> Value {
    let mut properties = json!({
        "x": { "type": "integer" },
        "y": { "type": "integer" },
        "z": { "type": "integer" }
    });
    if let (Some(properties), Value::Object(extra)) = (properties.as_object_mut(), extra) {
        properties.extend(extra);
    }
    let mut required = vec!["x", "y", "z"];
    required.extend_from_slice(extra_required);
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

fn sign_lines_schema() -> Value {
    json!({
        "lines": {
            "type": "array",
            "items": { "type": "string", "maxLength": SIGN_LINE_MAX_CHARS },
            "minItems": 1,
            "maxItems": SIGN_MAX_LINES
        }
    })
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "tether_session_status",
            description: "Current connection state, reconnect progress and last disconnect reason.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "tether_connect",
            description: "Connect the agent to a game server. Resolves once the agent has spawned or the attempt failed.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "host": { "type": "string" },
                    "port": { "type": "integer", "minimum": 1, "maximum": 65535, "default": DEFAULT_GAME_PORT },
                    "username": { "type": "string" },
                    "auth": { "type": "string", "description": "Opaque auth token forwarded to the bridge" }
                },
                "required": ["host", "username"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "tether_disconnect",
            description: "Disconnect and stop any automatic reconnects.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "tether_chat_history",
            description: "Recent player chat and server messages, oldest first.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "minimum": 1, "default": CHAT_HISTORY_DEFAULT_LIMIT }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "tether_chat_send",
            description: "Send a chat message or slash command as the agent.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "maxLength": CHAT_MESSAGE_MAX_CHARS }
                },
                "required": ["message"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "tether_claim_lookup",
            description: "Ask the server who owns the land the agent stands on.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "tether_place_block",
            description: "Place a block and verify it appeared. Reports succeeded, denied or failed_unknown.",
            input_schema: block_tool_schema(
                json!({ "block": { "type": "string", "description": "Block id, e.g. oak_planks" } }),
                &["block"],
            ),
        },
        ToolDefinition {
            name: "tether_break_block",
            description: "Break a block and verify it is gone. Reports succeeded, denied or failed_unknown.",
            input_schema: block_tool_schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "tether_place_sign",
            description: "Place a sign with up to four lines and verify its text.",
            input_schema: block_tool_schema(sign_lines_schema(), &["lines"]),
        },
        ToolDefinition {
            name: "tether_mount",
            description: "Mount an entity (boat, minecart, horse) and verify the agent is riding it.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "entity_id": { "type": "integer", "minimum": 0 }
                },
                "required": ["entity_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "tether_open_container",
            description: "Open a chest or other container and verify a window opened.",
            input_schema: block_tool_schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "tether_create_shop",
            description: "Create a shop sign. The shop plugin rewrites the sign, so any change counts as success.",
            input_schema: block_tool_schema(sign_lines_schema(), &["lines"]),
        },
    ]
}

fn resource_definitions() -> Vec<ResourceDefinition> {
    vec![
        ResourceDefinition {
            uri: STATUS_RESOURCE_URI,
            name: "Session Status",
            description: "Connection state and reconnect progress",
        },
        ResourceDefinition {
            uri: CHAT_RESOURCE_URI,
            name: "Recent Chat",
            description: "Most recent chat log entries",
        },
    ]
}

fn tool_text_content(_tool: &str, envelope: &Value) -> String {
    // Callers often read only the text block, so the whole envelope is inlined.
    to_pretty_json(envelope)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value)
        .map_err(|err| ToolError::new("internal_error", format!("Failed to encode result: {err}")))
}

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            codes::VALIDATION_FAILED,
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.clone()),
        Value::String(_) => Err(ToolError::new(
            codes::VALIDATION_FAILED,
            format!("'{key}' must not be empty"),
        )
        .with_field(key)),
        _ => Err(
            ToolError::new(codes::VALIDATION_FAILED, format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(
            ToolError::new(codes::VALIDATION_FAILED, format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_u64(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| {
                ToolError::new(
                    codes::VALIDATION_FAILED,
                    format!("'{key}' must be an unsigned integer"),
                )
                .with_field(key)
            })
            .map(Some),
        Some(_) => Err(ToolError::new(
            codes::VALIDATION_FAILED,
            format!("'{key}' must be an unsigned integer"),
        )
        .with_field(key)),
    }
}

fn required_u64(args: &Map<String, Value>, key: &str) -> Result<u64, ToolError> {
    arg_optional_u64(args, key)?.ok_or_else(|| {
        ToolError::new(
            codes::VALIDATION_FAILED,
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })
}

fn required_i32(args: &Map<String, Value>, key: &str) -> Result<i32, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            codes::VALIDATION_FAILED,
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    value
        .as_i64()
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| {
            ToolError::new(
                codes::VALIDATION_FAILED,
                format!("'{key}' must be a 32-bit integer"),
            )
            .with_field(key)
        })
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

async fn read_framed_json<R>(reader: &mut R) -> Result<Option<Value>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" || line == "\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json<W>(writer: &mut W, value: &Value) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::{FakeSidecar, Reply};
    use serde_json::{Value, json};

    fn offline_server() -> McpServer {
        McpServer::new(
            BridgeConnector::new("127.0.0.1:9", Duration::from_millis(200)),
            SessionConfig::default(),
        )
    }

    async fn call_tool(server: &McpServer, name: &str, arguments: Value) -> Value {
        server
            .handle_tools_call(json!({ "name": name, "arguments": arguments }))
            .await
            .expect("tools/call should produce a tool result")
    }

    fn error_code(response: &Value) -> Option<&str> {
        response["structuredContent"]["error"]["error"].as_str()
    }

    #[test]
    fn initialize_instructions_start_with_status_and_explain_verdicts() {
        let server = offline_server();
        let payload = server.initialize_payload();
        let instructions = payload
            .get("instructions")
            .and_then(Value::as_str)
            .expect("initialize payload should include instructions");

        assert!(instructions.starts_with("Start with tether_session_status"));
        assert!(instructions.contains("poll status instead of connecting again"));
        assert!(instructions.contains("succeeded, denied or failed_unknown"));
        assert!(instructions.contains("claim_info"));
        assert_eq!(payload["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(payload["sessionStatus"]["state"], "disconnected");
    }

    #[test]
    fn tools_list_exposes_every_tether_tool() {
        let server = offline_server();
        let payload = server.tools_list_payload();
        let names: Vec<&str> = payload["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "tether_session_status",
                "tether_connect",
                "tether_disconnect",
                "tether_chat_history",
                "tether_chat_send",
                "tether_claim_lookup",
                "tether_place_block",
                "tether_break_block",
                "tether_place_sign",
                "tether_mount",
                "tether_open_container",
                "tether_create_shop",
            ]
        );
        let place_sign = &payload["tools"][8]["inputSchema"];
        assert_eq!(place_sign["required"], json!(["x", "y", "z", "lines"]));
        assert_eq!(place_sign["properties"]["lines"]["maxItems"], 4);
    }

    #[tokio::test]
    async fn jsonrpc_envelope_is_validated() {
        let server = offline_server();

        let wrong_version = server
            .handle_single_message(json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(wrong_version["error"]["code"], -32600);
        assert_eq!(wrong_version["id"], 1);

        let notification = server
            .handle_single_message(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(notification.is_none());

        let unknown = server
            .handle_single_message(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/delete"}))
            .await
            .unwrap();
        assert_eq!(unknown["error"]["code"], -32601);

        let empty_batch = server.handle_incoming_message(json!([])).await;
        assert_eq!(empty_batch.len(), 1);
        assert_eq!(empty_batch[0]["error"]["code"], -32600);

        let batch = server
            .handle_incoming_message(json!([
                {"jsonrpc": "2.0", "id": 3, "method": "ping"},
                {"jsonrpc": "2.0", "method": "notifications/cancelled"}
            ]))
            .await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["result"], json!({}));
    }

    #[tokio::test]
    async fn tools_call_requires_a_name_and_object_arguments() {
        let server = offline_server();
        let err = server.handle_tools_call(json!({})).await.unwrap_err();
        assert_eq!(err.code, -32602);

        let err = server
            .handle_tools_call(json!({"name": "tether_session_status", "arguments": [1]}))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn status_tool_reports_a_disconnected_session() {
        let server = offline_server();
        let response = call_tool(&server, "tether_session_status", Value::Null).await;
        assert!(response.get("isError").is_none());
        let envelope = &response["structuredContent"];
        assert_eq!(envelope["status"], "success");
        assert_eq!(envelope["phase"], "final");
        assert_eq!(envelope["data"]["session"]["state"], "disconnected");
        assert_eq!(envelope["data"]["session"]["reconnect_attempt"], 0);
        assert_eq!(envelope["data"]["bridge"], "127.0.0.1:9");
    }

    #[tokio::test]
    async fn session_tools_fail_without_a_live_session() {
        let server = offline_server();
        let response = call_tool(&server, "tether_chat_send", json!({"message": "hello"})).await;
        assert_eq!(response["isError"], true);
        assert_eq!(error_code(&response), Some("not_connected"));
        let text = response["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("⚠ No live session"));

        let response = call_tool(
            &server,
            "tether_break_block",
            json!({"x": 1, "y": 64, "z": 1}),
        )
        .await;
        assert_eq!(error_code(&response), Some("not_connected"));
        assert_eq!(
            response["structuredContent"]["error"]["docs_hint"],
            "Call tether_connect and wait for state=connected."
        );
    }

    #[tokio::test]
    async fn argument_errors_name_the_field() {
        let server = offline_server();
        let response = call_tool(
            &server,
            "tether_place_block",
            json!({"x": 1, "z": 1, "block": "stone"}),
        )
        .await;
        assert_eq!(error_code(&response), Some("validation_failed"));
        assert_eq!(response["structuredContent"]["error"]["field"], "y");

        let response = call_tool(&server, "tether_chat_history", json!({"limit": 0})).await;
        assert_eq!(response["structuredContent"]["error"]["field"], "limit");

        let response = call_tool(
            &server,
            "tether_connect",
            json!({"host": "mc.example.net", "username": "Tether", "port": 70000}),
        )
        .await;
        assert_eq!(response["structuredContent"]["error"]["field"], "port");

        let response = call_tool(&server, "tether_fly", json!({})).await;
        assert_eq!(error_code(&response), Some("unknown_tool"));
    }

    #[tokio::test]
    async fn unreachable_bridge_fails_the_connect_tool() {
        let server = offline_server();
        let response = call_tool(
            &server,
            "tether_connect",
            json!({"host": "mc.example.net", "username": "Tether"}),
        )
        .await;
        assert_eq!(response["isError"], true);
        assert_eq!(error_code(&response), Some("transport_error"));
        assert_eq!(server.session.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn resources_expose_status_and_chat() {
        let server = offline_server();
        let listed = server.resources_list_payload();
        assert_eq!(listed["resources"].as_array().unwrap().len(), 2);

        let read = server
            .handle_resources_read(json!({"uri": STATUS_RESOURCE_URI}))
            .unwrap();
        let text = read["contents"][0]["text"].as_str().unwrap();
        let status: Value = serde_json::from_str(text).unwrap();
        assert_eq!(status["state"], "disconnected");

        let err = server
            .handle_resources_read(json!({"uri": "tether://nope"}))
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[test]
    fn session_errors_keep_code_and_hint() {
        let err = ToolError::from(SessionError::ConnectionBusy {
            state: ConnectionState::Reconnecting,
        });
        let value = err.to_value();
        assert_eq!(value["error"], "connection_busy");
        assert_eq!(value["details"]["state"], "reconnecting");
        assert!(value["docs_hint"].as_str().unwrap().contains("tether_session_status"));
    }

    #[test]
    fn warning_only_applies_to_session_bound_tools() {
        let server = offline_server();
        let status = server.session.status();
        assert!(session_warning("tether_session_status", &status).is_none());
        assert!(session_warning("tether_place_sign", &status).is_some());

        let mut reconnecting = status.clone();
        reconnecting.state = ConnectionState::Reconnecting;
        reconnecting.reconnect_attempt = 3;
        let warning = session_warning("tether_chat_send", &reconnecting).unwrap();
        assert!(warning.contains("attempt 3/10"));
    }

    #[tokio::test]
    async fn framed_messages_survive_a_round_trip() {
        let (client, server_side) = tokio::io::duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server_side);
        let server = offline_server();
        let serving = tokio::spawn(async move {
            server
                .serve(BufReader::new(server_read), server_write)
                .await
        });

        write_framed_json(
            &mut client_write,
            &json!({"jsonrpc": "2.0", "id": 7, "method": "initialize", "params": {}}),
        )
        .await
        .unwrap();
        let mut reader = BufReader::new(&mut client_read);
        let response = read_framed_json(&mut reader).await.unwrap().unwrap();
        assert_eq!(response["id"], 7);
        assert_eq!(response["result"]["serverInfo"]["name"], MCP_SERVER_NAME);

        drop(reader);
        drop(client_write);
        drop(client_read);
        assert_eq!(serving.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn missing_content_length_is_invalid_data() {
        let mut input: &[u8] = b"Content-Type: application/json\r\n\r\n{}";
        let err = read_framed_json(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let mut empty: &[u8] = b"";
        assert!(read_framed_json(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn denied_placement_reports_the_claim_owner() {
        let sidecar = FakeSidecar::bind().await;
        let addr = sidecar.addr();
        tokio::spawn(async move {
            let conn = sidecar.accept().await;
            conn.serve_with(|request| match request["op"].as_str() {
                Some("connect") => Reply::ok().then(json!({"event": "spawned"})),
                Some("observe") => Reply::with_result(json!({"kind": "grass_block"})),
                Some("perform") => Reply::ok().then(json!({
                    "event": "message",
                    "text": "§cYou don't have permission to build in Alice's claim.",
                    "position": "system"
                })),
                Some("command") => Reply::ok().then(json!({
                    "event": "message",
                    "text": "Owner: Alice",
                    "position": "system"
                })),
                _ => Reply::ok(),
            })
            .await;
        });

        let mut config = SessionConfig::default();
        config.claim.window = Duration::from_millis(300);
        let server = McpServer::new(BridgeConnector::new(addr, Duration::from_secs(2)), config);

        let response = call_tool(
            &server,
            "tether_connect",
            json!({"host": "mc.example.net", "username": "Tether"}),
        )
        .await;
        assert!(response.get("isError").is_none(), "{response}");
        assert_eq!(
            response["structuredContent"]["data"]["session"]["state"],
            "connected"
        );

        let response = call_tool(
            &server,
            "tether_place_block",
            json!({"x": 100, "y": 64, "z": -20, "block": "oak_planks"}),
        )
        .await;
        assert_eq!(response["isError"], true);
        assert_eq!(error_code(&response), Some("action_denied"));
        let details = &response["structuredContent"]["error"]["details"];
        assert_eq!(details["verdict"], "denied");
        assert_eq!(details["action"], "place_block");
        assert_eq!(details["claim_info"]["owner"], "Alice");

        let history = call_tool(&server, "tether_chat_history", json!({"limit": 10})).await;
        let entries = history["structuredContent"]["data"]["entries"]
            .as_array()
            .unwrap();
        assert!(
            entries
                .iter()
                .any(|entry| entry["text"].as_str().unwrap_or("").contains("permission"))
        );
        assert!(entries.iter().all(|entry| entry["sender"] != "Owner"));

        let response = call_tool(&server, "tether_disconnect", json!({})).await;
        assert_eq!(
            response["structuredContent"]["data"]["session"]["state"],
            "disconnected"
        );
    }
}
