//! The client-facing HTTP listener (SPEC_FULL.md §4.8/§6): a minimal
//! hand-rolled HTTP/1.1 parser for exactly the three client operations this
//! store supports --
//!
//!   POST   /            body is a raw `SET`/`DELETE` command line
//!   GET    /?key=<key>
//!   DELETE /?key=<key>
//!
//! -- plus the leader-forwarding HTTP client used when a non-leader node
//! redirects a write to the node it believes is leader. Grounded on the
//! original `server.go`'s `handleConn`/`http.Post` pair: no generic web
//! framework is pulled in for a three-route, plain-text surface.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use log::warn;

use crate::server::{ClientWriteOutcome, Server};

pub fn serve(listener: TcpListener, server: Arc<Server>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let server = Arc::clone(&server);
                thread::spawn(move || handle_connection(stream, server));
            }
            Err(e) => warn!("client listener accept error: {e}"),
        }
    }
}

struct Request {
    method: String,
    path: String,
    query: std::collections::HashMap<String, String>,
    body: String,
}

fn handle_connection(mut stream: TcpStream, server: Arc<Server>) {
    let request = match read_request(&stream) {
        Ok(request) => request,
        Err(_) => {
            write_response(&mut stream, 400, "bad request");
            return;
        }
    };

    let (status, body) = route(&server, &request);
    write_response(&mut stream, status, &body);
}

fn route(server: &Server, request: &Request) -> (u16, String) {
    match request.method.as_str() {
        "GET" => {
            let key = request.query.get("key").cloned().unwrap_or_default();
            match server.client_get(&key) {
                Ok(value) => (200, format!("Value for key ({key}) is: {value}")),
                Err(e) => (404, e.to_string()),
            }
        }
        "DELETE" => {
            let key = request.query.get("key").cloned().unwrap_or_default();
            dispatch_write(server, &format!("DELETE {key}"), request)
        }
        "POST" => dispatch_write(server, request.body.trim(), request),
        _ => (400, "unsupported method".to_string()),
    }
}

fn dispatch_write(server: &Server, command: &str, request: &Request) -> (u16, String) {
    match server.client_write(command) {
        ClientWriteOutcome::Applied => (200, "operation successful".to_string()),
        ClientWriteOutcome::Rejected(e) => (400, e.to_string()),
        ClientWriteOutcome::NotLeader(Some(leader_id)) => match server.peer_client_addr(&leader_id) {
            Some(addr) => forward(addr, request),
            None => (503, "no known leader, retry another node".to_string()),
        },
        ClientWriteOutcome::NotLeader(None) => (503, "no known leader, retry another node".to_string()),
        ClientWriteOutcome::NotCommitted => (503, "write not committed, retry".to_string()),
    }
}

/// Forwards the client's request verbatim to the node believed to be
/// leader, returning whatever it replies (SPEC_FULL.md §4.8's leader
/// forward path, grounded on `server.go`'s `http.Post`/`client.Do` calls).
fn forward(addr: SocketAddr, request: &Request) -> (u16, String) {
    let target = match request.method.as_str() {
        "GET" | "DELETE" => format!("{}?key={}", request.path, request.query.get("key").cloned().unwrap_or_default()),
        _ => request.path.clone(),
    };
    match forward_http(addr, &request.method, &target, &request.body) {
        Ok((status, body)) => (status, body),
        Err(_) => (502, "error redirecting request".to_string()),
    }
}

fn forward_http(addr: SocketAddr, method: &str, target: &str, body: &str) -> std::io::Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr)?;
    let request = format!(
        "{method} {target} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes())?;
    let response = read_response(&stream)?;
    Ok(response)
}

fn read_request(stream: &TcpStream) -> std::io::Result<Request> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let full_path = parts.next().unwrap_or("/").to_string();

    let mut content_length = 0usize;
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line)? == 0 {
            break;
        }
        let header_line = header_line.trim_end();
        if header_line.is_empty() {
            break;
        }
        if let Some((name, value)) = header_line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body)?;
    }
    let body = String::from_utf8_lossy(&body).to_string();

    let (path, query_string) = full_path.split_once('?').unwrap_or((full_path.as_str(), ""));
    let query = parse_query(query_string);

    Ok(Request {
        method,
        path: path.to_string(),
        query,
        body,
    })
}

fn parse_query(query_string: &str) -> std::collections::HashMap<String, String> {
    let mut query = std::collections::HashMap::new();
    for pair in query_string.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        query.insert(urldecode(key), urldecode(value));
    }
    query
}

fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

fn read_response(stream: &TcpStream) -> std::io::Result<(u16, String)> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut status_line = String::new();
    reader.read_line(&mut status_line)?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(502);

    let mut content_length = 0usize;
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line)? == 0 {
            break;
        }
        let header_line = header_line.trim_end();
        if header_line.is_empty() {
            break;
        }
        if let Some((name, value)) = header_line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = String::new();
    if content_length > 0 {
        let mut buf = vec![0u8; content_length];
        reader.read_exact(&mut buf)?;
        body = String::from_utf8_lossy(&buf).to_string();
    } else {
        reader.read_to_string(&mut body).ok();
    }
    Ok((status, body))
}

fn write_response(stream: &mut TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}
