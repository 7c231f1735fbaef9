//! The control API (component G): a small HTTP/JSON server exposing the
//! fault registry for inspection and mutation while the filesystem is
//! mounted.
//!
//! Grounded on the wire format fixed by this engine's design (no behavioral
//! reference taken from `core/rest_api.py`, which calls into a `Configuration`
//! shape its own test suite disagrees with). Built directly on
//! `tiny_http::Server` rather than a web framework: the resource surface is
//! one path with four methods, a plain method+path match is the whole
//! router.

use std::io::{self, Cursor, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde_json::{json, Value};
use tiny_http::{Header, Method, Response, Server};
use uuid::Uuid;

use crate::configuration::Configuration;
use crate::error::ControlApiError;
use crate::fault::Fault;

/// Bind the listener and hand back a detached background thread serving it.
/// Binding happens on the caller's thread so a port-in-use failure surfaces
/// before anything is spawned; the returned handle is meant to be dropped,
/// not joined — shutdown happens by process exit, the HTTP thread is never
/// asked to stop cleanly (see SPEC_FULL.md §5).
pub fn spawn(config: Arc<Configuration>, port: u16) -> io::Result<JoinHandle<()>> {
    let server = Server::http(("0.0.0.0", port))
        .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, e.to_string()))?;
    Ok(thread::spawn(move || serve_forever(&server, &config)))
}

fn serve_forever(server: &Server, config: &Configuration) {
    for request in server.incoming_requests() {
        if let Err(e) = handle(request, config) {
            log::error!("control api: {e}");
        }
    }
}

enum Route {
    ListFaults,
    GetFault(String),
    AddFault,
    PostWithIdRejected,
    RemoveFault(String),
    NotFound,
}

fn route_for(method: &Method, path: &str) -> Route {
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    match (method, segments.as_slice()) {
        (Method::Get, ["faults"]) => Route::ListFaults,
        (Method::Get, ["faults", id]) => Route::GetFault((*id).to_string()),
        (Method::Post, ["faults"]) => Route::AddFault,
        (Method::Post, ["faults", _id]) => Route::PostWithIdRejected,
        (Method::Delete, ["faults", id]) => Route::RemoveFault((*id).to_string()),
        _ => Route::NotFound,
    }
}

fn handle(mut request: tiny_http::Request, config: &Configuration) -> io::Result<()> {
    let route = route_for(request.method(), request.url());
    let response = match route {
        Route::ListFaults => json_response(200, json!({ "faults_ids": config.all_ids() })),
        Route::GetFault(id) => match config.get(&id) {
            Some(fault) => json_response(200, json!({ "fault_id": id, "fault": fault.to_dict() })),
            None => error_response(&ControlApiError::NotFound(id)),
        },
        Route::RemoveFault(id) => match config.remove(&id) {
            Some(_) => json_response(200, json!({ "fault_id": id })),
            None => error_response(&ControlApiError::NotFound(id)),
        },
        Route::AddFault => {
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body)?;
            match add_fault(config, &body) {
                Ok(id) => json_response(200, json!({ "fault_id": id })),
                Err(e) => error_response(&e),
            }
        }
        Route::PostWithIdRejected => error_response(&ControlApiError::MalformedBody(
            "POST does not take an id in the URL; faults are always assigned a fresh one".into(),
        )),
        Route::NotFound => json_response(404, json!({ "error": "not found" })),
    };
    request.respond(response)
}

/// Parse and insert a fault dict. Distinguishes an unrecognized
/// `fault_type` from every other way a body can fail to become a `Fault`,
/// so the diagnostic says what was actually wrong.
fn add_fault(config: &Configuration, body: &str) -> Result<String, ControlApiError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ControlApiError::MalformedBody(e.to_string()))?;
    let fault = match Fault::from_dict(&value) {
        Some(fault) => fault,
        None => {
            return Err(match value.get("fault_type").and_then(Value::as_str) {
                Some(t) if t != "LatencyFault" && t != "ErrorFault" => {
                    ControlApiError::UnknownFaultType(t.to_string())
                }
                _ => ControlApiError::MalformedBody("missing or invalid fault fields".into()),
            });
        }
    };
    let id = Uuid::new_v4().to_string();
    config.add(id.clone(), fault)?;
    Ok(id)
}

fn json_response(status: u16, value: Value) -> Response<Cursor<Vec<u8>>> {
    let body = serde_json::to_vec(&value).unwrap_or_default();
    let content_type = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("static header is valid");
    Response::from_data(body)
        .with_status_code(status)
        .with_header(content_type)
}

fn error_response(err: &ControlApiError) -> Response<Cursor<Vec<u8>>> {
    json_response(err.status_code(), json!({ "error": err.to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;

    #[test]
    fn router_matches_every_documented_route() {
        assert!(matches!(route_for(&Method::Get, "/faults"), Route::ListFaults));
        assert!(matches!(
            route_for(&Method::Get, "/faults/abc"),
            Route::GetFault(id) if id == "abc"
        ));
        assert!(matches!(route_for(&Method::Post, "/faults"), Route::AddFault));
        assert!(matches!(
            route_for(&Method::Post, "/faults/abc"),
            Route::PostWithIdRejected
        ));
        assert!(matches!(
            route_for(&Method::Delete, "/faults/abc"),
            Route::RemoveFault(id) if id == "abc"
        ));
        assert!(matches!(route_for(&Method::Get, "/nope"), Route::NotFound));
    }

    #[test]
    fn add_fault_rejects_invalid_json_as_malformed() {
        let config = Configuration::new();
        let err = add_fault(&config, "not json").unwrap_err();
        assert!(matches!(err, ControlApiError::MalformedBody(_)));
    }

    #[test]
    fn add_fault_reports_an_unknown_fault_type_distinctly() {
        let config = Configuration::new();
        let body = r#"{"fault_type":"NetworkPartitionFault","sys_call":"write","probability":10}"#;
        let err = add_fault(&config, body).unwrap_err();
        assert!(matches!(err, ControlApiError::UnknownFaultType(t) if t == "NetworkPartitionFault"));
    }

    #[test]
    fn add_fault_accepts_a_well_formed_dict_and_assigns_an_id() {
        let config = Configuration::new();
        let body = r#"{"fault_type":"ErrorFault","sys_call":"write","probability":10,"error_no":28}"#;
        let id = add_fault(&config, body).expect("valid fault");
        assert!(config.get(&id).is_some());
    }

    #[test]
    fn add_fault_surfaces_a_probability_budget_violation() {
        let config = Configuration::new();
        let body = r#"{"fault_type":"ErrorFault","sys_call":"write","probability":100,"error_no":28}"#;
        add_fault(&config, body).expect("first insert succeeds");
        let second = add_fault(&config, body).unwrap_err();
        assert!(matches!(second, ControlApiError::ProbabilityBudgetExceeded { .. }));
    }

    /// End-to-end smoke test against a real socket on an ephemeral port,
    /// exercising the full method+path router and JSON envelope rather than
    /// `add_fault` in isolation.
    #[test]
    fn serves_the_full_faults_lifecycle_over_a_real_socket() {
        let config = Arc::new(Configuration::new());
        let server = Server::http("127.0.0.1:0").expect("bind ephemeral port");
        let addr = match server.server_addr().to_ip() {
            Some(addr) => addr,
            None => return,
        };
        let worker_config = config.clone();
        let worker = thread::spawn(move || serve_forever(&server, &worker_config));

        let list_before = http_request(addr.port(), "GET", "/faults", None);
        assert!(list_before.contains("\"faults_ids\":[]"));

        let created = http_request(
            addr.port(),
            "POST",
            "/faults",
            Some(r#"{"fault_type":"ErrorFault","sys_call":"write","probability":10,"error_no":28}"#),
        );
        assert!(created.contains("\"fault_id\""));

        drop(worker);
    }

    /// Sends one raw HTTP/1.0 request over a fresh connection and returns
    /// the response body. `server.incoming_requests()` keeps iterating on
    /// its background thread for the lifetime of the test process; this
    /// helper doesn't attempt a clean shutdown of that loop.
    fn http_request(port: u16, method: &str, path: &str, body: Option<&str>) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.0\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).expect("write request");
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            if line == "\r\n" {
                break;
            }
        }
        let mut rest = String::new();
        let _ = reader.read_to_string(&mut rest);
        rest
    }
}
