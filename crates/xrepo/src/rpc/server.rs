//! The proxy's client-facing server.
//!
//! Each connection gets its own [`Session`]. A reader task decodes frames and
//! queues requests for a single worker, which handles them strictly in
//! receipt order and writes responses in that same order. `$/cancelRequest`
//! is handled by the reader as soon as it arrives, so it can cancel a request
//! that is queued or already running.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::codec::{read_frame, write_message};
use crate::error::{INVALID_REQUEST, PARSE_ERROR, ProxyError};
use crate::protocol::{InitializeParams, PositionParams, WireLocation};
use crate::session::{Session, SessionServices};

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

enum Work {
    Request {
        id: Value,
        method: String,
        params: Value,
        cancel: CancellationToken,
    },
    /// A response composed by the reader, written in queue order.
    Reply(Value),
}

/// Accept connections on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Currently never fails; accept errors are logged and skipped.
pub async fn serve(
    listener: TcpListener,
    services: Arc<SessionServices>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening for clients");
    }

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Client connected");
                    let services = Arc::clone(&services);
                    tokio::spawn(async move {
                        let (read, write) = stream.into_split();
                        serve_connection(read, write, services).await;
                        debug!(%peer, "Client disconnected");
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
        }
    }

    info!("Stopped accepting clients");
    Ok(())
}

/// Serve one client over `reader`/`writer` until it exits or disconnects.
pub async fn serve_connection<R, W>(reader: R, writer: W, services: Arc<SessionServices>)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let worker = tokio::spawn(run_worker(
        rx,
        writer,
        Session::new(services),
        Arc::clone(&in_flight),
    ));

    let mut reader = BufReader::new(reader);
    loop {
        let body = match read_frame(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Client stream failed");
                break;
            }
        };

        let message: Value = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Unparseable message");
                let reply = error_response(
                    &Value::Null,
                    PARSE_ERROR,
                    &format!("parse error: {e}"),
                    "parse_error",
                    false,
                );
                if tx.send(Work::Reply(reply)).is_err() {
                    break;
                }
                continue;
            }
        };

        let id = message.get("id").cloned();
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let work = match (id, method) {
            (Some(id), _) if !valid_id(&id) => Some(Work::Reply(invalid_request(
                &Value::Null,
                "id must be a number or string",
            ))),
            (id, None) if !message.is_object() => Some(Work::Reply(invalid_request(
                &id.unwrap_or(Value::Null),
                "message must be an object",
            ))),
            (Some(id), None) => {
                if message.get("result").is_some() || message.get("error").is_some() {
                    trace!(%id, "Ignoring response from client");
                    None
                } else {
                    Some(Work::Reply(invalid_request(&id, "missing method")))
                }
            }
            (None, None) => Some(Work::Reply(invalid_request(&Value::Null, "missing method"))),
            (None, Some(method)) => {
                match method.as_str() {
                    "$/cancelRequest" => cancel_request(&in_flight, &params),
                    "exit" => break,
                    _ => trace!(method = %method, "Ignoring notification"),
                }
                None
            }
            (Some(id), Some(method)) => match track(&in_flight, &id) {
                Some(cancel) => {
                    trace!(%id, method = %method, "Queued request");
                    Some(Work::Request {
                        id,
                        method,
                        params,
                        cancel,
                    })
                }
                None => {
                    debug!(%id, method = %method, "Duplicate request id");
                    Some(Work::Reply(invalid_request(&id, "duplicate request id")))
                }
            },
        };

        if let Some(work) = work {
            if tx.send(work).is_err() {
                break;
            }
        }
    }

    drop(tx);
    for token in in_flight.lock().values() {
        token.cancel();
    }
    if let Err(e) = worker.await {
        warn!(error = %e, "Connection worker failed");
    }
}

/// Register a cancellation token for `id`, or `None` if a request with the
/// same id is still in flight.
fn track(in_flight: &InFlight, id: &Value) -> Option<CancellationToken> {
    let mut in_flight = in_flight.lock();
    let key = id_key(id);
    if in_flight.contains_key(&key) {
        return None;
    }
    let cancel = CancellationToken::new();
    in_flight.insert(key, cancel.clone());
    Some(cancel)
}

fn cancel_request(in_flight: &InFlight, params: &Value) {
    let Some(id) = params.get("id") else {
        return;
    };
    match in_flight.lock().get(&id_key(id)) {
        Some(token) => {
            debug!(%id, "Cancelling request");
            token.cancel();
        }
        None => trace!(%id, "Cancel for unknown or finished request"),
    }
}

async fn run_worker<W>(
    mut rx: mpsc::UnboundedReceiver<Work>,
    mut writer: W,
    mut session: Session,
    in_flight: InFlight,
) where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(work) = rx.recv().await {
        let response = match work {
            Work::Reply(reply) => reply,
            Work::Request {
                id,
                method,
                params,
                cancel,
            } => {
                let result = if cancel.is_cancelled() {
                    Err(ProxyError::Cancelled)
                } else {
                    dispatch(&mut session, &method, params, &cancel).await
                };
                in_flight.lock().remove(&id_key(&id));
                match result {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Err(e) => {
                        debug!(
                            %id,
                            method = %method,
                            kind = e.kind(),
                            error = %e,
                            "Request failed"
                        );
                        error_response(&id, e.code(), &e.to_string(), e.kind(), e.is_retryable())
                    }
                }
            }
        };

        if let Err(e) = write_message(&mut writer, &response).await {
            warn!(error = %e, "Failed to write response");
            break;
        }
    }
    session.close();
}

async fn dispatch(
    session: &mut Session,
    method: &str,
    params: Value,
    cancel: &CancellationToken,
) -> Result<Value, ProxyError> {
    match method {
        "initialize" => {
            let params: InitializeParams = parse_params(params)?;
            to_value(&session.initialize(params, cancel).await?)
        }
        "textDocument/definition" => {
            session.ensure_ready()?;
            let params: PositionParams = parse_params(params)?;
            let locations = session.definition(&params, cancel).await?;
            let wire = locations
                .iter()
                .map(WireLocation::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            to_value(&wire)
        }
        "textDocument/hover" => {
            session.ensure_ready()?;
            let params: PositionParams = parse_params(params)?;
            to_value(&session.hover(&params, cancel).await?)
        }
        "shutdown" => {
            session.close();
            Ok(Value::Null)
        }
        _ => Err(ProxyError::MethodNotFound(method.to_string())),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ProxyError> {
    serde_json::from_value(params)
        .map_err(|e| ProxyError::InvalidInput(format!("invalid params: {e}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ProxyError> {
    serde_json::to_value(value)
        .map_err(|e| ProxyError::TransientCommunication(format!("failed to encode result: {e}")))
}

fn valid_id(id: &Value) -> bool {
    id.is_number() || id.is_string() || id.is_null()
}

fn id_key(id: &Value) -> String {
    id.to_string()
}

fn invalid_request(id: &Value, message: &str) -> Value {
    error_response(id, INVALID_REQUEST, message, "invalid_request", false)
}

fn error_response(id: &Value, code: i64, message: &str, kind: &str, retryable: bool) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
            "data": { "kind": kind, "retryable": retryable },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_kind_and_retryability() {
        let err = ProxyError::BackendUnavailable("go:git://x/y".to_string());
        let response = error_response(
            &json!(4),
            err.code(),
            &err.to_string(),
            err.kind(),
            err.is_retryable(),
        );

        assert_eq!(response["id"], 4);
        assert_eq!(response["error"]["code"], -32005);
        assert_eq!(response["error"]["data"]["kind"], "backend_unavailable");
        assert_eq!(response["error"]["data"]["retryable"], true);
    }

    #[test]
    fn numeric_and_string_ids_are_distinct_keys() {
        assert_ne!(id_key(&json!(1)), id_key(&json!("1")));
        assert!(valid_id(&json!("abc")));
        assert!(!valid_id(&json!({"x": 1})));
    }

    #[test]
    fn in_flight_id_cannot_be_reused_until_finished() {
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let first = track(&in_flight, &json!(9)).unwrap();

        assert!(track(&in_flight, &json!(9)).is_none());
        cancel_request(&in_flight, &json!({"id": 9}));
        assert!(first.is_cancelled());

        in_flight.lock().remove(&id_key(&json!(9)));
        assert!(track(&in_flight, &json!(9)).is_some());
    }
}
