// REST API for report consumers
//
// Every route sits behind HTTP Basic auth checked against the configured user
// table. Results are JSON objects carrying a ResultCode / ResultMessage pair;
// report replies from clients are passed through as the client sent them.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use repcol_core::protocol::{format_body, Params};
use repcol_core::{BridgeError, LifecycleManager, ServerConfig, SessionInfo};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// Result codes understood by existing report consumers
pub const RESULT_OK: i32 = 0;
pub const RESULT_OFFLINE: i32 = 200;
pub const RESULT_BUSY: i32 = 201;
pub const RESULT_FAILED: i32 = 204;
pub const RESULT_BAD_REQUEST: i32 = 400;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultResponse {
    pub result_code: i32,
    pub result_message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientListResponse {
    pub result_code: i32,
    pub result_message: String,
    pub clients: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientStatResponse {
    pub result_code: i32,
    pub result_message: String,
    pub client: SessionInfo,
}

// Server implementation

pub struct ApiContext {
    pub manager: Arc<LifecycleManager>,
    pub users: BTreeMap<String, String>,
    pub realm: String,
    pub request_timeout: Duration,
}

impl ApiContext {
    pub fn new(manager: Arc<LifecycleManager>, config: &ServerConfig) -> Self {
        Self {
            manager,
            users: config.http_users.clone(),
            realm: config.http_realm.clone(),
            request_timeout: config.request_timeout(),
        }
    }
}

fn json_response<T: Serialize>(value: &T) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(value)?))?)
}

fn result_response(code: i32, message: impl Into<String>) -> Result<Response<Body>> {
    json_response(&ResultResponse {
        result_code: code,
        result_message: message.into(),
    })
}

/// Check the `Authorization: Basic` header against the user table
fn is_authorized(req: &Request<Body>, users: &BTreeMap<String, String>) -> bool {
    let Some(header) = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };

    match credentials.split_once(':') {
        Some((user, password)) => users.get(user).map_or(false, |p| p == password),
        None => false,
    }
}

fn unauthorized(realm: &str) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(WWW_AUTHENTICATE, format!("Basic realm=\"{}\"", realm))
        .body(Body::from("Unauthorized"))?)
}

fn not_found() -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not found"))?)
}

fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

pub async fn handle_request(
    req: Request<Body>,
    ctx: Arc<ApiContext>,
) -> Result<Response<Body>, Infallible> {
    let response = if !is_authorized(&req, &ctx.users) {
        debug!("Rejected unauthenticated {} {}", req.method(), req.uri().path());
        unauthorized(&ctx.realm)
    } else {
        let path = req.uri().path().trim_end_matches('/').to_string();
        match (req.method(), path.as_str()) {
            (&Method::GET, "/server/clientlist") => handle_client_list(ctx),
            (&Method::GET, "/server/clientstat") => handle_client_stat(req, ctx),
            (&Method::GET | &Method::POST, p) if p.starts_with("/report/") => {
                let name = p["/report/".len()..].to_string();
                handle_report(req, ctx, name).await
            }
            _ => not_found(),
        }
    };

    Ok(response.unwrap_or_else(|e| {
        let mut response = Response::new(Body::from(format!("Error: {}", e)));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    }))
}

fn handle_client_list(ctx: Arc<ApiContext>) -> Result<Response<Body>> {
    json_response(&ClientListResponse {
        result_code: RESULT_OK,
        result_message: "OK".to_string(),
        clients: ctx.manager.client_list(),
    })
}

fn handle_client_stat(req: Request<Body>, ctx: Arc<ApiContext>) -> Result<Response<Body>> {
    let query = query_params(&req);
    let client = query
        .get("id")
        .filter(|id| !id.is_empty())
        .and_then(|id| ctx.manager.client_stat(id));

    match client {
        Some(client) => json_response(&ClientStatResponse {
            result_code: RESULT_OK,
            result_message: "OK".to_string(),
            client,
        }),
        None => result_response(RESULT_OFFLINE, "Client is offline"),
    }
}

/// Key/value request body sent to the client for a report.
///
/// The HTTP body travels base64-encoded in `PRM` so that line breaks in it
/// cannot split the key/value body.
fn report_payload(name: &str, query: &HashMap<String, String>, body: &[u8]) -> String {
    let mut params = Params::new().with("TT", "Test").with("RPT", name);
    for (param, key) in [("u", "U"), ("p", "P")] {
        if let Some(value) = query.get(param) {
            params.push(key, value.as_str());
        }
    }
    if !body.is_empty() {
        params.push("PRM", STANDARD.encode(body));
    }
    format_body(&params)
}

async fn handle_report(req: Request<Body>, ctx: Arc<ApiContext>, name: String) -> Result<Response<Body>> {
    if name.is_empty() || name.contains('/') {
        return result_response(RESULT_BAD_REQUEST, "Invalid report name");
    }

    let query = query_params(&req);
    let Some(identity) = query.get("id").filter(|id| !id.is_empty()).cloned() else {
        return result_response(RESULT_BAD_REQUEST, "Missing id");
    };

    let body_bytes = hyper::body::to_bytes(req.into_body())
        .await
        .context("Failed to read request body")?;
    let payload = report_payload(&name, &query, &body_bytes);

    info!("Report {} requested from {}", name, identity);
    match ctx
        .manager
        .send_request(&identity, &payload, ctx.request_timeout)
        .await
    {
        Ok(reply) => {
            let content_type = if serde_json::from_str::<serde_json::Value>(&reply).is_ok() {
                "application/json"
            } else {
                "text/plain; charset=utf-8"
            };
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type)
                .body(Body::from(reply))?)
        }
        Err(BridgeError::ClientBusy(_)) => result_response(RESULT_BUSY, "Client is busy"),
        Err(BridgeError::ClientNotFound(_)) => result_response(RESULT_OFFLINE, "Client is offline"),
        Err(e) => {
            warn!("Report {} from {} failed: {}", name, identity, e);
            result_response(RESULT_FAILED, e.to_string())
        }
    }
}

pub async fn start_api_server(addr: SocketAddr, ctx: ApiContext) -> Result<()> {
    if ctx.users.is_empty() {
        warn!("No HTTP users configured; every API request will be refused");
    }
    let ctx = Arc::new(ctx);

    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_request(req, ctx.clone()))) }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind HTTP API on {}", addr))?
        .serve(make_svc);

    info!("REST API listening on {}", addr);

    server.await.context("API server error")?;

    Ok(())
}
