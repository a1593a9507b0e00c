//! Integration tests for the `payplan serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port,
//! makes HTTP requests, and verifies the envelopes it returns.

use std::io::Read;
use std::net::TcpStream;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

/// Atomic port counter to avoid port conflicts between parallel tests.
/// Base port is derived from process ID so parallel `cargo test --workspace` runs
/// (which spawn separate test binaries) don't collide on the same port range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Helper: start the payplan serve process on the given port.
fn start_server(port: u16, plans: &[&std::path::Path]) -> Child {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_payplan"));
    cmd.env_remove("PAYPLAN_CONFIG")
        .env("PAYPLAN_WORKERS", "2")
        .env("PAYPLAN_LOG", "warn");
    cmd.arg("serve").arg("--port").arg(port.to_string());
    for p in plans {
        cmd.arg(p);
    }
    // Redirect stdout/stderr to avoid blocking
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let child = cmd.spawn().expect("failed to start payplan serve");
    // Wait for server to be ready by polling the port
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            return child;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    child
}

fn stop(mut child: Child) {
    child.kill().ok();
    child.wait().ok();
}

/// Helper: send one request and return (status, headers, body).
fn http_request(port: u16, method: &str, path: &str, body: Option<&str>) -> (u16, String, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\nOrigin: http://example.test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        body.len(),
        body
    );
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);

    parse_http_response_full(&response)
}

/// Helper: send a request and parse the JSON body.
fn call(port: u16, method: &str, path: &str, body: Option<Value>) -> (u16, Value) {
    let text = body.map(|b| b.to_string());
    let (status, _, body) = http_request(port, method, path, text.as_deref());
    let json = serde_json::from_str(&body)
        .unwrap_or_else(|e| panic!("invalid JSON from {} {}: {} ({})", method, path, e, body));
    (status, json)
}

/// Extract a header value from raw headers string.
fn extract_header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    let name_lower = name.to_lowercase();
    for line in headers.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().to_lowercase() == name_lower {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Parse an HTTP response into (status_code, headers_string, body).
fn parse_http_response_full(response: &str) -> (u16, String, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status_line = headers.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    // Handle chunked transfer encoding
    let body = if headers.contains("Transfer-Encoding: chunked") {
        decode_chunked(&body)
    } else {
        body
    };

    (status, headers, body)
}

/// Decode chunked transfer encoding.
fn decode_chunked(data: &str) -> String {
    let mut result = String::new();
    let mut remaining = data;

    while let Some(line_end) = remaining.find("\r\n") {
        let size = match usize::from_str_radix(remaining[..line_end].trim(), 16) {
            Ok(s) => s,
            Err(_) => break,
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > remaining.len() {
            result.push_str(&remaining[chunk_start..]);
            break;
        }
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = if chunk_end + 2 <= remaining.len() {
            &remaining[chunk_end + 2..]
        } else {
            ""
        };
    }

    result
}

fn draft_plan(id: &str) -> Value {
    json!({
        "id": id,
        "name": "Team bonus",
        "inputs": [
            {"name": "salary", "type": "numeric"},
            {"name": "score", "type": "numeric"}
        ]
    })
}

fn employees() -> Value {
    json!([
        {"employee_ref": "B2", "salary": "80000", "score": "0"},
        {"employee_ref": "A1", "salary": "50000", "score": "2"}
    ])
}

/// Create a plan with two steps and approve it.
fn approved_plan(port: u16, id: &str) {
    let (status, _) = call(port, "POST", "/plans", Some(draft_plan(id)));
    assert_eq!(status, 201);
    for (name, expression) in [("base", "salary * 0.1"), ("per_point", "base / score")] {
        let (status, body) = call(
            port,
            "POST",
            &format!("/plans/{}/steps", id),
            Some(json!({"name": name, "expression": expression, "outputs": [name]})),
        );
        assert_eq!(status, 201, "create step: {}", body);
    }
    let (status, body) = call(port, "POST", &format!("/plans/{}/approve", id), None);
    assert_eq!(status, 200, "approve: {}", body);
    assert_eq!(body["data"]["status"], "approved");
}

// ──────────────────────────────────────────────
// Health and routing
// ──────────────────────────────────────────────

#[test]
fn health_returns_200_with_version() {
    let port = next_port();
    let child = start_server(port, &[]);

    let (status, body) = call(port, "GET", "/health", None);
    stop(child);

    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert!(body.get("version").is_some(), "version field must be present");
    let modes = body["precision_modes"].as_array().expect("precision modes");
    assert!(modes.iter().any(|m| m == "standard"));
}

#[test]
fn unknown_route_returns_not_found_envelope() {
    let port = next_port();
    let child = start_server(port, &[]);

    let (status, body) = call(port, "GET", "/nonexistent", None);
    stop(child);

    assert_eq!(status, 404);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "not_found");
}

#[test]
fn cors_header_is_present() {
    let port = next_port();
    let child = start_server(port, &[]);

    let (status, headers, _) = http_request(port, "GET", "/health", None);
    stop(child);

    assert_eq!(status, 200);
    assert_eq!(
        extract_header(&headers, "access-control-allow-origin"),
        Some("*")
    );
}

// ──────────────────────────────────────────────
// Plans
// ──────────────────────────────────────────────

#[test]
fn preloaded_plan_is_served() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("plan.json");
    std::fs::write(&path, draft_plan("preloaded").to_string()).unwrap();

    let port = next_port();
    let child = start_server(port, &[path.as_path()]);

    let (status, body) = call(port, "GET", "/plans/preloaded", None);
    stop(child);

    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["id"], "preloaded");
    assert_eq!(body["data"]["status"], "draft");
}

#[test]
fn duplicate_plan_is_a_state_error() {
    let port = next_port();
    let child = start_server(port, &[]);

    let (first, _) = call(port, "POST", "/plans", Some(draft_plan("p1")));
    let (second, body) = call(port, "POST", "/plans", Some(draft_plan("p1")));
    stop(child);

    assert_eq!(first, 201);
    assert_eq!(second, 409);
    assert_eq!(body["error"], "state_error");
}

#[test]
fn malformed_body_is_a_bad_request() {
    let port = next_port();
    let child = start_server(port, &[]);

    let (status, _, body) = http_request(port, "POST", "/plans", Some("{\"id\": "));
    stop(child);

    assert_eq!(status, 400);
    let json: Value = serde_json::from_str(&body).expect("valid JSON");
    assert_eq!(json["error"], "bad_request");
}

#[test]
fn validate_expression_reports_offending_token() {
    let port = next_port();
    let child = start_server(port, &[]);

    call(port, "POST", "/plans", Some(draft_plan("p1")));
    let (status, body) = call(
        port,
        "POST",
        "/plans/p1/validate",
        Some(json!({"expression": "salary * bonusRate"})),
    );
    stop(child);

    assert_eq!(status, 200);
    assert_eq!(body["data"]["valid"], false);
    assert_eq!(body["data"]["error"]["token"], "bonusRate");
}

#[test]
fn invalid_step_is_rejected_with_validation_error() {
    let port = next_port();
    let child = start_server(port, &[]);

    call(port, "POST", "/plans", Some(draft_plan("p1")));
    let (status, body) = call(
        port,
        "POST",
        "/plans/p1/steps",
        Some(json!({"name": "bad", "expression": "salary * (", "outputs": ["bad"]})),
    );
    let (_, plan) = call(port, "GET", "/plans/p1", None);
    stop(child);

    assert_eq!(status, 422);
    assert_eq!(body["error"], "validation_error");
    assert!(body.get("details").is_some());
    assert_eq!(plan["data"]["steps"].as_array().unwrap().len(), 0);
}

#[test]
fn step_edits_follow_the_lifecycle() {
    let port = next_port();
    let child = start_server(port, &[]);

    call(port, "POST", "/plans", Some(draft_plan("p1")));
    let (_, created) = call(
        port,
        "POST",
        "/plans/p1/steps",
        Some(json!({"name": "base", "expression": "salary * 0.1", "outputs": ["base"]})),
    );
    let step_id = created["data"]["step_id"].as_str().unwrap().to_string();

    let (patched, body) = call(
        port,
        "PATCH",
        &format!("/steps/{}", step_id),
        Some(json!({"expression": "salary * 0.15"})),
    );
    assert_eq!(patched, 200, "patch: {}", body);
    assert_eq!(body["data"]["expression"], "salary * 0.15");

    call(port, "POST", "/plans/p1/approve", None);
    let (deleted, body) = call(port, "DELETE", &format!("/steps/{}", step_id), None);
    let (lock_unconfirmed, _) = call(port, "POST", "/plans/p1/lock", None);
    let (locked, lock_body) = call(
        port,
        "POST",
        "/plans/p1/lock",
        Some(json!({"confirm": true, "notes": "signed off"})),
    );
    let (archived, archive_body) = call(port, "POST", "/plans/p1/archive", None);
    stop(child);

    assert_eq!(deleted, 409);
    assert_eq!(body["error"], "state_error");
    assert_eq!(lock_unconfirmed, 409);
    assert_eq!(locked, 200);
    assert_eq!(lock_body["data"]["status"], "locked");
    assert_eq!(archived, 200);
    assert_eq!(archive_body["data"]["status"], "archived");
}

// ──────────────────────────────────────────────
// Runs
// ──────────────────────────────────────────────

#[test]
fn run_tape_and_hash_round_trip() {
    let port = next_port();
    let child = start_server(port, &[]);
    approved_plan(port, "p1");

    let (status, run) = call(
        port,
        "POST",
        "/plans/p1/runs",
        Some(json!({"batch_ref": "2026-q3", "employees": employees()})),
    );
    assert_eq!(status, 201, "execute: {}", run);
    let run_id = run["data"]["run_id"].as_str().unwrap().to_string();
    assert_eq!(run["data"]["status"], "completed");
    assert_eq!(run["data"]["batch_ref"], "2026-q3");
    assert_eq!(run["data"]["failed"], 1);

    let (_, tape) = call(port, "GET", &format!("/plans/p1/runs/{}/tape", run_id), None);
    let (_, only_a1) = call(
        port,
        "GET",
        &format!("/plans/p1/runs/{}/tape?employee_ref=A1", run_id),
        None,
    );
    let (_, hash) = call(port, "GET", &format!("/runs/{}/hash", run_id), None);
    let (_, runs) = call(port, "GET", "/plans/p1/runs", None);
    let (cancel, _) = call(port, "POST", &format!("/runs/{}/cancel", run_id), None);
    stop(child);

    let grouped = tape["data"]["calculation_tape"].as_object().unwrap();
    let refs: Vec<&String> = grouped.keys().collect();
    assert_eq!(refs, ["A1", "B2"]);
    assert_eq!(grouped["B2"].as_array().unwrap().len(), 0);
    assert_eq!(tape["data"]["total_steps"], 2);
    assert_eq!(only_a1["data"]["calculation_tape"]["A1"][1]["value"]["value"], "2500.00");

    assert_eq!(hash["data"]["snapshot_hash"], run["data"]["snapshot_hash"]);
    assert_eq!(runs["data"].as_array().unwrap().len(), 1);
    assert_eq!(cancel, 409);
}

#[test]
fn strict_run_returns_evaluation_error() {
    let port = next_port();
    let child = start_server(port, &[]);
    approved_plan(port, "p1");

    let (status, body) = call(
        port,
        "POST",
        "/plans/p1/runs",
        Some(json!({"mode": "strict", "employees": employees()})),
    );
    stop(child);

    assert_eq!(status, 422);
    assert_eq!(body["error"], "evaluation_error");
    assert_eq!(body["details"]["failures"][0]["employee_ref"], "B2");
}

#[test]
fn draft_plan_cannot_run() {
    let port = next_port();
    let child = start_server(port, &[]);

    call(port, "POST", "/plans", Some(draft_plan("p1")));
    let (status, body) = call(
        port,
        "POST",
        "/plans/p1/runs",
        Some(json!({"employees": employees()})),
    );
    stop(child);

    assert_eq!(status, 409);
    assert_eq!(body["error"], "state_error");
}

#[test]
fn verify_detects_changed_precision() {
    let port = next_port();
    let child = start_server(port, &[]);
    approved_plan(port, "p1");

    let (_, run) = call(
        port,
        "POST",
        "/plans/p1/runs",
        Some(json!({"employees": employees()})),
    );
    let expected = run["data"]["snapshot_hash"].clone();
    let (same_status, same) = call(
        port,
        "POST",
        "/plans/p1/verify",
        Some(json!({"expected_hash": expected})),
    );
    let (_, other) = call(
        port,
        "POST",
        "/plans/p1/verify",
        Some(json!({"expected_hash": expected, "precision_mode": "high"})),
    );
    stop(child);

    assert_eq!(same_status, 200);
    assert_eq!(same["data"]["is_reproducible"], true);
    assert_eq!(other["data"]["is_reproducible"], false);
    let fields: Vec<&str> = other["data"]["differences"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["field"].as_str())
        .collect();
    assert!(fields.contains(&"precision.name"));
}

#[test]
fn unknown_run_is_not_found() {
    let port = next_port();
    let child = start_server(port, &[]);

    let (hash, hash_body) = call(port, "GET", "/runs/run-missing/hash", None);
    let (cancel, _) = call(port, "POST", "/runs/run-missing/cancel", None);
    stop(child);

    assert_eq!(hash, 404);
    assert_eq!(hash_body["error"], "not_found");
    assert_eq!(cancel, 404);
}
