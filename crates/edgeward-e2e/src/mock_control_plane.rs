//! Mock control plane for E2E tests
//!
//! Speaks the subset of the Caddy admin API the real client uses: `POST /load` stores the
//! submitted document, and the `GET /config/...` endpoints read back from it. Failures and
//! a control plane that never confirms can be configured per test.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::net::TcpListener;

/// A recorded admin API request for test assertions
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Body parsed as JSON
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Debug)]
struct State {
    requests: Vec<RecordedRequest>,
    /// Last successfully loaded document
    loaded: Option<Value>,
    /// Status returned by `/load`
    load_status: StatusCode,
    load_error: String,
    /// When set, reads report no TLS policies at all
    hide_policies: bool,
}

/// A mock Caddy admin API listening on loopback
pub struct MockControlPlane {
    addr: SocketAddr,
    state: Arc<RwLock<State>>,
}

impl MockControlPlane {
    /// Start the mock on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock control plane");
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(RwLock::new(State {
            requests: Vec::new(),
            loaded: None,
            load_status: StatusCode::OK,
            load_error: String::new(),
            hide_policies: false,
        }));

        let state_clone = state.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let state = state_clone.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, &state).await) }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    /// Admin API base URL for the client
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Make `/load` fail with the given status and error message
    pub fn fail_loads(&self, status: StatusCode, error: impl Into<String>) {
        let mut state = self.state.write();
        state.load_status = status;
        state.load_error = error.into();
    }

    /// Never report any TLS policy, so certificates never confirm
    pub fn hide_policies(&self, hide: bool) {
        self.state.write().hide_policies = hide;
    }

    /// Install a document as if it had been loaded earlier
    pub fn preload(&self, document: Value) {
        self.state.write().loaded = Some(document);
    }

    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.state.read().requests.clone()
    }

    /// Requests to `/load`, in order
    pub fn loads(&self) -> Vec<RecordedRequest> {
        self.get_requests()
            .into_iter()
            .filter(|r| r.method == "POST" && r.path == "/load")
            .collect()
    }

    /// Currently loaded document
    pub fn loaded(&self) -> Option<Value> {
        self.state.read().loaded.clone()
    }
}

async fn handle(req: Request<Incoming>, state: &RwLock<State>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    let mut state = state.write();
    state.requests.push(RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        body: body.clone(),
    });

    match (method, path.as_str()) {
        (Method::POST, "/load") => {
            if !state.load_status.is_success() {
                let error = serde_json::json!({ "error": state.load_error }).to_string();
                return respond(state.load_status, error);
            }
            match serde_json::from_slice::<Value>(&body) {
                Ok(document) => {
                    state.loaded = Some(document);
                    respond(StatusCode::OK, String::new())
                }
                Err(e) => respond(
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({ "error": e.to_string() }).to_string(),
                ),
            }
        }
        (Method::GET, "/config/apps/tls/automation/policies") => {
            let policies = if state.hide_policies {
                Value::Null
            } else {
                state
                    .loaded
                    .as_ref()
                    .and_then(|doc| doc.pointer("/apps/tls/automation/policies"))
                    .cloned()
                    .unwrap_or(Value::Null)
            };
            respond(StatusCode::OK, policies.to_string())
        }
        (Method::GET, "/config/") => {
            let mut document = state.loaded.clone().unwrap_or(Value::Null);
            if state.hide_policies {
                if let Some(apps) = document.get_mut("apps").and_then(Value::as_object_mut) {
                    apps.remove("tls");
                }
            }
            respond(StatusCode::OK, document.to_string())
        }
        _ => respond(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "unknown endpoint" }).to_string(),
        ),
    }
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

