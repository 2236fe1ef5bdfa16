//! Master <-> worker request/response protocol.
//!
//! Requests are `POST <path>` with a JSON object of named arguments; responses
//! carry an HTTP status and a JSON body. The master serves them from a
//! single-threaded loopback server, so no two routes ever run concurrently.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tiny_http::{Header, Server as HttpServer};
use tracing::{debug, warn};

use crate::context::MasterLink;
use crate::host::{Host, HostCollection, HostError};
use crate::proxy::{self, ProxyRegistry};

pub const ROUTE_LOAD: &str = "/load";
pub const ROUTE_SAVE: &str = "/save";
pub const ROUTE_PROXY: &str = "/proxy";

const MAX_REQUEST_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("unknown route '{0}'")]
    UnknownRoute(String),

    #[error("unknown proxy function '{0}'")]
    UnknownFunction(String),

    #[error("proxy function '{function}' failed: {message}")]
    Handler { function: String, message: String },

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("rpc transport error: {0}")]
    Transport(String),

    #[error("master answered {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("context is not linked to a master")]
    Detached,
}

impl RpcError {
    fn status(&self) -> u16 {
        match self {
            RpcError::UnknownRoute(_) | RpcError::UnknownFunction(_) | RpcError::Host(_) => 404,
            RpcError::BadPayload(_) => 400,
            _ => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub path: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn not_found(path: &str) -> Self {
        Self::from_error(&RpcError::UnknownRoute(path.to_string()))
    }

    pub fn from_error(err: &RpcError) -> Self {
        Self {
            status: err.status(),
            body: json!({ "error": err.to_string() }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoadArgs {
    host: String,
}

#[derive(Debug, Deserialize)]
struct SaveArgs {
    host: String,
    config: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ProxyArgs {
    host: String,
    function: String,
    #[serde(default)]
    arguments: Value,
}

fn args<T: serde::de::DeserializeOwned>(payload: Map<String, Value>) -> Result<T, RpcError> {
    serde_json::from_value(Value::Object(payload)).map_err(|e| RpcError::BadPayload(e.to_string()))
}

/// Answer one request against the master's canonical hosts.
///
/// Every failure becomes an error response; nothing here can stop the server.
pub fn route(
    hosts: &mut HostCollection,
    proxies: &ProxyRegistry,
    path: &str,
    payload: Map<String, Value>,
) -> Response {
    let result = match path {
        ROUTE_LOAD => args::<LoadArgs>(payload).and_then(|a| {
            let host = hosts.get(&a.host)?;
            serde_json::to_value(host).map_err(|e| RpcError::BadPayload(e.to_string()))
        }),
        ROUTE_SAVE => args::<SaveArgs>(payload).and_then(|a| {
            hosts.get_mut(&a.host)?.config_mut().update(a.config);
            Ok(Value::Bool(true))
        }),
        ROUTE_PROXY => args::<ProxyArgs>(payload)
            .and_then(|a| proxy::invoke(hosts, proxies, &a.host, &a.function, a.arguments)),
        other => Err(RpcError::UnknownRoute(other.to_string())),
    };
    match result {
        Ok(body) => Response::ok(body),
        Err(err) => {
            debug!(path, error = %err, "rpc request failed");
            Response::from_error(&err)
        }
    }
}

/// What the server loop does after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Stop,
}

/// Loopback request/response server driven by a periodic tick.
pub struct Server {
    inner: HttpServer,
    port: u16,
    tick: Duration,
}

impl Server {
    /// Bind 127.0.0.1 on an OS-assigned port.
    pub fn bind_loopback() -> Result<Self> {
        let inner = HttpServer::http("127.0.0.1:0")
            .map_err(|err| anyhow!("failed to bind loopback rpc server: {err}"))?;
        let port = inner
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| anyhow!("rpc server is not bound to an ip address"))?;
        Ok(Self {
            inner,
            port,
            tick: DEFAULT_TICK,
        })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `ticker` returns [`Tick::Stop`].
    ///
    /// `after_listen` runs once with the bound port and produces the state the
    /// ticker works on; that state is handed back when the loop ends. Requests
    /// are answered one at a time by `router`.
    pub fn run<S, L, R, T>(&self, after_listen: L, mut router: R, mut ticker: T) -> Result<S>
    where
        L: FnOnce(u16) -> Result<S>,
        R: FnMut(&str, Map<String, Value>) -> Response,
        T: FnMut(&mut S) -> Result<Tick>,
    {
        let mut state = after_listen(self.port)?;
        loop {
            if ticker(&mut state)? == Tick::Stop {
                break;
            }
            match self.inner.recv_timeout(self.tick) {
                Ok(Some(request)) => serve(request, &mut router),
                Ok(None) => {}
                Err(err) => return Err(anyhow!("rpc server failed to receive: {err}")),
            }
        }
        Ok(state)
    }
}

fn serve<R>(mut request: tiny_http::Request, router: &mut R)
where
    R: FnMut(&str, Map<String, Value>) -> Response,
{
    let path = request.url().to_string();
    let mut body: Vec<u8> = Vec::new();
    let read = request
        .as_reader()
        .take((MAX_REQUEST_BYTES + 1) as u64)
        .read_to_end(&mut body);

    let response = match read {
        Err(err) => Response::from_error(&RpcError::BadPayload(format!(
            "failed to read request body: {err}"
        ))),
        Ok(_) if body.len() > MAX_REQUEST_BYTES => Response {
            status: 413,
            body: json!({ "error": "request payload exceeds 5 MiB limit" }),
        },
        Ok(_) => match parse_payload(&body) {
            Ok(payload) => router(&path, payload),
            Err(err) => Response::from_error(&err),
        },
    };

    let encoded = match serde_json::to_vec(&response.body) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path, error = %err, "failed to encode rpc response");
            return;
        }
    };
    if let Err(err) = request.respond(json_response(response.status, encoded)) {
        warn!(path = %path, error = %err, "failed to send rpc response");
    }
}

fn parse_payload(body: &[u8]) -> Result<Map<String, Value>, RpcError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RpcError::BadPayload(
            "payload must be a JSON object".to_string(),
        )),
        Err(err) => Err(RpcError::BadPayload(format!("invalid JSON payload: {err}"))),
    }
}

fn json_response(code: u16, body: Vec<u8>) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let mut response = tiny_http::Response::from_data(body).with_status_code(code);
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    response
}

/// Worker-side client for the master's rpc server.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    base: String,
}

impl RpcClient {
    pub fn connect(port: u16) -> Result<Self> {
        // Loopback only; proxy settings from the environment must not apply.
        let client = Client::builder()
            .no_proxy()
            .build()
            .context("failed to build rpc client")?;
        Ok(Self {
            client,
            base: format!("http://127.0.0.1:{port}"),
        })
    }

    pub fn call(&self, request: &Request) -> Result<Value, RpcError> {
        let url = format!("{}{}", self.base, request.path);
        let response = self
            .client
            .post(url)
            .json(&request.payload)
            .send()
            .map_err(|err| RpcError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .map_err(|err| RpcError::Transport(format!("invalid JSON response: {err}")))?;
        if status == 200 {
            return Ok(body);
        }
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("no error message")
            .to_string();
        Err(RpcError::Remote { status, message })
    }

    fn call_with(&self, path: &str, payload: Value) -> Result<Value, RpcError> {
        let payload = match payload {
            Value::Object(map) => map,
            _ => return Err(RpcError::BadPayload("payload must be an object".to_string())),
        };
        self.call(&Request {
            path: path.to_string(),
            payload,
        })
    }
}

impl MasterLink for RpcClient {
    fn load(&mut self, alias: &str) -> Result<Host, RpcError> {
        let body = self.call_with(ROUTE_LOAD, json!({ "host": alias }))?;
        serde_json::from_value(body).map_err(|e| RpcError::BadPayload(e.to_string()))
    }

    fn save(&mut self, alias: &str, config: Map<String, Value>) -> Result<(), RpcError> {
        self.call_with(ROUTE_SAVE, json!({ "host": alias, "config": config }))?;
        Ok(())
    }

    fn proxy(&mut self, alias: &str, function: &str, arguments: Value) -> Result<Value, RpcError> {
        self.call_with(
            ROUTE_PROXY,
            json!({ "host": alias, "function": function, "arguments": arguments }),
        )
    }
}
