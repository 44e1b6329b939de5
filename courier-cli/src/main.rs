//! courier-cli: operator CLI for the Courier HTTP API
//!
//! # Subcommands
//! - `create <agent-id> [--name] [--agent-key] [--backend-url] [--qr-out]`
//! - `status <agent-id> [--qr-out]` status and current pairing code
//! - `detail <agent-id>`            session record plus message counters
//! - `reconnect <agent-id>`
//! - `delete <agent-id>`
//! - `execute <agent-id> <message> [--sender] [--param key=value]...`
//! - `health`                       server health
//!
//! `--json` prints the raw response body instead of a summary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Method;
use serde_json::{json, Map, Value};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";
const API_PREFIX: &str = "/api/v1";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "courier-cli", version, about = "Manage Courier agent sessions")]
struct Cli {
    /// Courier HTTP server URL
    #[arg(long, env = "COURIER_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// API key sent as a bearer token
    #[arg(long, env = "COURIER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Print the raw JSON response
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a session and start pairing
    Create {
        agent_id: String,

        /// Display name used for @-mentions in groups
        #[arg(long)]
        name: Option<String>,

        /// API key the gateway presents to the agent backend
        #[arg(long)]
        agent_key: Option<String>,

        /// Per-agent backend URL (defaults to the server's configured one)
        #[arg(long)]
        backend_url: Option<String>,

        /// Write the pairing QR code PNG to this path
        #[arg(long)]
        qr_out: Option<PathBuf>,
    },

    /// Show session status and the current pairing code
    Status {
        agent_id: String,

        /// Write the pairing QR code PNG to this path
        #[arg(long)]
        qr_out: Option<PathBuf>,
    },

    /// Show the session record with message counters
    Detail { agent_id: String },

    /// Re-attach a session to its device
    Reconnect { agent_id: String },

    /// Delete a session and unpair its device
    Delete { agent_id: String },

    /// Send a message straight to the agent backend
    Execute {
        agent_id: String,
        message: String,

        /// Sender id forwarded as the backend session id
        #[arg(long)]
        sender: Option<String>,

        /// Parameter override, `key=value` (value parsed as JSON when possible)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// Show Courier server health
    Health,
}

// ============================================================================
// Request building
// ============================================================================

/// Parse `key=value`; the value is JSON if it parses, else a plain string.
pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn build_params(raw: &[String]) -> Result<Option<Map<String, Value>>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut params = Map::new();
    for p in raw {
        let (k, v) = parse_param(p)?;
        params.insert(k, v);
    }
    Ok(Some(params))
}

pub fn execute_body(
    agent_id: &str,
    message: &str,
    sender: Option<&str>,
    params: Option<Map<String, Value>>,
) -> Value {
    let mut body = json!({ "agentId": agent_id, "message": message });
    if let Some(sender) = sender {
        body["sender"] = json!(sender);
    }
    if let Some(params) = params {
        body["params"] = Value::Object(params);
    }
    body
}

// ============================================================================
// Output
// ============================================================================

fn field<'a>(v: &'a Value, key: &str) -> &'a str {
    v[key].as_str().filter(|s| !s.is_empty()).unwrap_or("-")
}

/// Human-readable summary of a session payload (create/status/reconnect).
pub fn session_summary(data: &Value) -> String {
    let mut lines = vec![
        format!("Agent:        {}", field(data, "agentId")),
        format!("Status:       {}", field(data, "status")),
    ];
    if data.get("phoneNumber").is_some() {
        lines.push(format!("Phone:        {}", field(data, "phoneNumber")));
    }
    if data.get("connectedAt").is_some() {
        lines.push(format!("Connected at: {}", field(data, "connectedAt")));
    }
    let generated = data
        .get("lastQrGeneratedAt")
        .or_else(|| data.get("lastGeneratedAt"));
    if let Some(at) = generated.and_then(|v| v.as_str()) {
        lines.push(format!("Code issued:  {}", at));
    }
    let has_code = data["qrCodeBase64"].as_str().map(|s| !s.is_empty()).unwrap_or(false);
    lines.push(format!(
        "Pairing code: {}",
        if has_code { "available (use --qr-out to save)" } else { "none" }
    ));
    lines.join("\n")
}

/// Decode `qrCodeBase64` from a session payload and write it as a PNG.
pub fn write_qr(data: &Value, path: &Path) -> anyhow::Result<bool> {
    let Some(b64) = data["qrCodeBase64"].as_str().filter(|s| !s.is_empty()) else {
        return Ok(false);
    };
    let png = STANDARD.decode(b64)?;
    std::fs::write(path, png)?;
    Ok(true)
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    client: Client,
    server: String,
    api_key: Option<String>,
}

impl Api {
    fn new(server: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.server, path);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send and return the JSON body. Non-2xx responses become errors carrying
    /// the server's `error` text.
    fn send(&self, builder: RequestBuilder) -> anyhow::Result<Value> {
        let resp = builder
            .send()
            .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", self.server, e))?;
        let status = resp.status();
        let body: Value = resp.json().unwrap_or(Value::Null);
        if !status.is_success() {
            let msg = body["error"].as_str().unwrap_or("no error message");
            anyhow::bail!("server returned {}: {}", status, msg);
        }
        Ok(body)
    }

    fn session_get(&self, path: &str, agent_id: &str) -> anyhow::Result<Value> {
        self.send(
            self.request(Method::GET, &format!("{}{}", API_PREFIX, path))
                .query(&[("agentId", agent_id)]),
        )
    }

    fn session_post(&self, method: Method, path: &str, body: Value) -> anyhow::Result<Value> {
        self.send(
            self.request(method, &format!("{}{}", API_PREFIX, path))
                .json(&body),
        )
    }
}

fn print_json(body: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(body)?);
    Ok(())
}

fn print_session(body: &Value, json_output: bool, qr_out: Option<&Path>) -> anyhow::Result<()> {
    if let Some(path) = qr_out {
        if write_qr(&body["data"], path)? {
            eprintln!("QR code written to {}", path.display());
        } else {
            eprintln!("No pairing code available yet");
        }
    }
    if json_output {
        return print_json(body);
    }
    if let Some(msg) = body["message"].as_str() {
        println!("{}", msg);
    }
    println!("{}", session_summary(&body["data"]));
    Ok(())
}

fn do_health(api: &Api, json_output: bool) -> anyhow::Result<()> {
    let body = api.send(api.request(Method::GET, "/health"))?;
    if json_output {
        return print_json(&body);
    }
    println!("Courier server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:        {}", body["version"].as_str().unwrap_or("?"));
    println!("Database:       {}", body["database"].as_str().unwrap_or("?"));
    println!("Connections:    {}", body["connections"].as_u64().unwrap_or(0));
    Ok(())
}

fn do_detail(api: &Api, agent_id: &str, json_output: bool) -> anyhow::Result<()> {
    let body = api.session_get("/sessions/detail", agent_id)?;
    if json_output {
        return print_json(&body);
    }
    let session = &body["data"]["session"];
    let stats = &body["data"]["stats"];
    println!("Agent:     {}", field(session, "agentId"));
    println!("Name:      {}", field(session, "displayName"));
    println!("Owner:     {}", field(session, "ownerUserId"));
    println!("Status:    {}", field(session, "status"));
    println!("Phone:     {}", field(session, "phoneNumber"));
    println!("Backend:   {}", field(session, "backendUrl"));
    println!("Incoming:  {}", stats["incoming"].as_i64().unwrap_or(0));
    println!("Responded: {}", stats["responded"].as_i64().unwrap_or(0));
    Ok(())
}

fn do_execute(api: &Api, body: Value, json_output: bool) -> anyhow::Result<()> {
    let resp = api.session_post(Method::POST, "/agents/execute", body)?;
    if json_output {
        return print_json(&resp);
    }
    let data = &resp["data"];
    let reply = data["response"]["response"]
        .as_str()
        .or_else(|| data["response"]["message"].as_str());
    match reply {
        Some(text) => println!("{}", text),
        None => println!("{}", data["rawResponse"].as_str().unwrap_or("")),
    }
    eprintln!("({} ms)", data["executionTimeMs"].as_i64().unwrap_or(0));
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let api = Api::new(&cli.server, cli.api_key)?;
    let json_output = cli.json;

    match cli.command {
        Commands::Health => do_health(&api, json_output),
        Commands::Create {
            agent_id,
            name,
            agent_key,
            backend_url,
            qr_out,
        } => {
            let body = json!({
                "agentId": agent_id,
                "agentName": name,
                "apiKey": agent_key,
                "backendUrl": backend_url,
            });
            let resp = api.session_post(Method::POST, "/sessions/create", body)?;
            print_session(&resp, json_output, qr_out.as_deref())
        }
        Commands::Status { agent_id, qr_out } => {
            let resp = api.session_get("/sessions/status", &agent_id)?;
            print_session(&resp, json_output, qr_out.as_deref())
        }
        Commands::Detail { agent_id } => do_detail(&api, &agent_id, json_output),
        Commands::Reconnect { agent_id } => {
            let resp = api.session_post(
                Method::POST,
                "/sessions/reconnect",
                json!({ "agentId": agent_id }),
            )?;
            print_session(&resp, json_output, None)
        }
        Commands::Delete { agent_id } => {
            let resp = api.session_post(
                Method::DELETE,
                "/sessions/delete",
                json!({ "agentId": agent_id }),
            )?;
            if json_output {
                return print_json(&resp);
            }
            println!("{}", resp["message"].as_str().unwrap_or("Deleted"));
            Ok(())
        }
        Commands::Execute {
            agent_id,
            message,
            sender,
            params,
        } => {
            let params = build_params(&params).map_err(|e| anyhow::anyhow!(e))?;
            let body = execute_body(&agent_id, &message, sender.as_deref(), params);
            do_execute(&api, body, json_output)
        }
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("courier-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
