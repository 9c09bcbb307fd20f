//! Admin API routing.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::AdminState;
use crate::config::parse_duration;
use crate::queue::{ManagedQueueEntry, QueueError};

type AdminResponse = Response<Full<Bytes>>;

/// Route label, status and body of a handled request.
struct Reply {
    route: &'static str,
    response: AdminResponse,
}

pub(super) async fn handle(req: Request<Incoming>, state: &AdminState) -> AdminResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query());

    let Reply { route, response } = dispatch(&method, &path, &query, state).await;
    let status = response.status();
    state.metrics.record_admin_request(route, status.as_u16());
    debug!(%method, path = %path, status = status.as_u16(), "admin request");
    response
}

async fn dispatch(
    method: &Method,
    path: &str,
    query: &HashMap<String, String>,
    state: &AdminState,
) -> Reply {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => reply("/health", health(state)),
        (&Method::GET, ["metrics"]) => reply("/metrics", metrics(state)),
        (&Method::GET, ["queues"]) => reply("/queues", json_response(StatusCode::OK, &state.queues.summaries())),
        (&Method::POST, ["queues", "flush-all"]) => reply("/queues/flush-all", flush_all(state, query).await),
        (_, ["queues", "flush-all"]) => {
            reply("method_not_allowed", error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"))
        }
        (&Method::GET, ["queues", qid]) => reply(
            "/queues/{qid}",
            with_queue(state, qid, |entry| json_response(StatusCode::OK, &entry.summary())),
        ),
        (&Method::POST, ["queues", qid, action]) => queue_action(state, qid, action, query).await,
        (&Method::POST, ["manager", action]) => manager_action(state, action),
        (_, ["health"] | ["metrics"] | ["queues"] | ["queues", _]) => {
            reply("method_not_allowed", error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"))
        }
        _ => reply("not_found", error_response(StatusCode::NOT_FOUND, "not found")),
    }
}

fn reply(route: &'static str, response: AdminResponse) -> Reply {
    Reply { route, response }
}

fn health(state: &AdminState) -> AdminResponse {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "state": state.manager.state().as_str(),
            "timestamp": now.as_secs(),
            "version": crate::VERSION,
            "queues": state.queues.managed_queues().len(),
            "running_servers": state.manager.running_servers(),
        }),
    )
}

fn metrics(state: &AdminState) -> AdminResponse {
    state.metrics.refresh(&state.queues.summaries());
    match state.metrics.export() {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn flush_all(state: &AdminState, query: &HashMap<String, String>) -> AdminResponse {
    let timeout = match duration_param(query, "timeout") {
        Ok(timeout) => timeout,
        Err(response) => return response,
    };
    match state.queues.flush_all(timeout).await {
        Ok(()) => json_response(StatusCode::OK, &json!({ "flushed": true })),
        Err(QueueError::NonEmptyQueues(names)) => json_response(
            StatusCode::GATEWAY_TIMEOUT,
            &json!({ "flushed": false, "non_empty": names }),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn queue_action(
    state: &AdminState,
    qid: &str,
    action: &str,
    query: &HashMap<String, String>,
) -> Reply {
    let entry = match lookup(state, qid) {
        Ok(entry) => entry,
        Err(response) => return reply("/queues/{qid}/action", response),
    };
    let pool = entry.pool();

    match action {
        "pause" => {
            pool.pause();
            info!(qid = entry.qid, queue = %entry.name, "queue paused through admin api");
            reply("/queues/{qid}/pause", json_response(StatusCode::OK, &json!({ "paused": true })))
        }
        "resume" => {
            pool.resume();
            info!(qid = entry.qid, queue = %entry.name, "queue resumed through admin api");
            reply("/queues/{qid}/resume", json_response(StatusCode::OK, &json!({ "paused": false })))
        }
        "flush" => reply("/queues/{qid}/flush", flush(&entry, query).await),
        "add-workers" => reply("/queues/{qid}/add-workers", add_workers(&entry, query)),
        "cancel-workers" => reply("/queues/{qid}/cancel-workers", cancel_workers(&entry, query)),
        "settings" => reply("/queues/{qid}/settings", settings(&entry, query)),
        _ => reply("not_found", error_response(StatusCode::NOT_FOUND, "unknown queue action")),
    }
}

async fn flush(entry: &ManagedQueueEntry, query: &HashMap<String, String>) -> AdminResponse {
    let timeout = match duration_param(query, "timeout") {
        Ok(timeout) => timeout,
        Err(response) => return response,
    };
    match entry.managed().flush(timeout).await {
        Ok(()) => json_response(StatusCode::OK, &json!({ "flushed": true })),
        Err(e @ QueueError::FlushTimeout(_)) => error_response(StatusCode::GATEWAY_TIMEOUT, &e.to_string()),
        Err(e) if e.is_terminated() => error_response(StatusCode::CONFLICT, &e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn add_workers(entry: &ManagedQueueEntry, query: &HashMap<String, String>) -> AdminResponse {
    let number = match query.get("number").map(|v| v.trim().parse::<usize>()) {
        Some(Ok(number)) if number > 0 => number,
        _ => return error_response(StatusCode::BAD_REQUEST, "number must be a positive integer"),
    };
    let timeout = match duration_param(query, "timeout") {
        Ok(timeout) => timeout,
        Err(response) => return response,
    };

    let pool = entry.pool();
    pool.add_workers(number, timeout);
    info!(qid = entry.qid, queue = %entry.name, number, "workers added through admin api");
    json_response(
        StatusCode::OK,
        &json!({
            "workers": pool.number_of_workers(),
            "groups": pool.worker_groups(),
        }),
    )
}

fn cancel_workers(entry: &ManagedQueueEntry, query: &HashMap<String, String>) -> AdminResponse {
    let pid = match query.get("pid").map(|v| v.trim().parse::<u64>()) {
        Some(Ok(pid)) => pid,
        _ => return error_response(StatusCode::BAD_REQUEST, "pid must be an integer"),
    };
    if entry.pool().cancel_workers(pid) {
        info!(qid = entry.qid, queue = %entry.name, pid, "workers cancelled through admin api");
        json_response(StatusCode::OK, &json!({ "cancelled": pid }))
    } else {
        error_response(StatusCode::NOT_FOUND, "no such worker group")
    }
}

fn settings(entry: &ManagedQueueEntry, query: &HashMap<String, String>) -> AdminResponse {
    let pool = entry.pool();

    let max_workers = match query.get("max_workers").map(|v| v.trim()) {
        None => pool.max_number_of_workers(),
        Some("-1") | Some("unlimited") => None,
        Some(v) => match v.parse::<usize>() {
            Ok(max) => Some(max),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid max_workers"),
        },
    };
    let boost_workers = match query.get("boost_workers").map(|v| v.trim().parse::<usize>()) {
        None => pool.boost_workers(),
        Some(Ok(boost)) => boost,
        Some(Err(_)) => return error_response(StatusCode::BAD_REQUEST, "invalid boost_workers"),
    };
    let boost_timeout = match duration_param(query, "boost_timeout") {
        Ok(Some(timeout)) => timeout,
        Ok(None) if query.contains_key("boost_timeout") => Duration::ZERO,
        Ok(None) => pool.boost_timeout(),
        Err(response) => return response,
    };

    pool.set_pool_settings(max_workers, boost_workers, boost_timeout);
    info!(
        qid = entry.qid,
        queue = %entry.name,
        ?max_workers,
        boost_workers,
        boost_timeout_ms = boost_timeout.as_millis() as u64,
        "pool settings changed through admin api"
    );
    json_response(StatusCode::OK, &entry.summary())
}

fn manager_action(state: &AdminState, action: &str) -> Reply {
    let manager = &state.manager;
    let (route, accepted) = match action {
        "shutdown" => {
            warn!("shutdown requested through admin api");
            manager.do_graceful_shutdown();
            ("/manager/shutdown", "shutdown")
        }
        "restart" => {
            warn!("restart requested through admin api");
            manager.do_graceful_restart();
            ("/manager/restart", "restart")
        }
        "hammer" => {
            warn!("hammer requested through admin api");
            manager.do_immediate_hammer();
            ("/manager/hammer", "hammer")
        }
        _ => return reply("not_found", error_response(StatusCode::NOT_FOUND, "unknown manager action")),
    };
    reply(route, json_response(StatusCode::ACCEPTED, &json!({ "accepted": accepted })))
}

fn lookup(state: &AdminState, qid: &str) -> Result<ManagedQueueEntry, AdminResponse> {
    let qid: u64 = qid
        .parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "qid must be an integer"))?;
    state
        .queues
        .get(qid)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "no such queue"))
}

fn with_queue<F>(state: &AdminState, qid: &str, f: F) -> AdminResponse
where
    F: FnOnce(&ManagedQueueEntry) -> AdminResponse,
{
    match lookup(state, qid) {
        Ok(entry) => f(&entry),
        Err(response) => response,
    }
}

/// Optional duration parameter; "off" and "0" read as `None`.
fn duration_param(query: &HashMap<String, String>, key: &str) -> Result<Option<Duration>, AdminResponse> {
    match query.get(key) {
        None => Ok(None),
        Some(v) => parse_duration(v)
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("invalid {}: {}", key, e))),
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(key), decode(value))
        })
        .collect()
}

fn decode(s: &str) -> String {
    percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> AdminResponse {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> AdminResponse {
    json_response(status, &json!({ "error": message }))
}
