// src/http.rs
//
// Minimal hand-rolled HTTP/1.1 server for the adapter's control surface.
// Accept loop follows the same shape as the TCP listener; route table and
// the form-urlencoded POST /api/config body match the original firmware's
// http_server.c. No HTTP framework in this codebase's stack to pull in, so
// the parser here is hand-rolled rather than adding a new dependency for a
// deliberately small surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::{self, AdapterConfig, CanBitrate};
use crate::runtime::Runtime;
use crate::tlog;

const ACCEPT_POLL: Duration = Duration::from_millis(500);
const MAX_REQUEST_BYTES: usize = 8192;

mod assets {
    pub const INDEX_HTML: &str = "<!doctype html><html><body>socketcand-bridge</body></html>";
    pub const FAVICON_SVG: &str = "<svg xmlns='http://www.w3.org/2000/svg'/>";
    pub const SCRIPT_JS: &str = "// placeholder UI script";
    pub const ALPINE_JS: &str = "// placeholder alpine.js vendor stub";
}

struct Request {
    method: String,
    path: String,
    body: String,
}

fn parse_request(raw: &str) -> Option<Request> {
    let mut lines = raw.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_ascii_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let header_block_end = raw.find("\r\n\r\n").map(|i| i + 4);
    let body = header_block_end
        .and_then(|i| raw.get(i..))
        .unwrap_or("")
        .trim_end_matches('\0')
        .to_string();

    Some(Request { method, path, body })
}

/// Decodes one `application/x-www-form-urlencoded` component: `+` becomes a
/// space and `%XX` becomes the byte it encodes. Invalid `%` escapes are
/// passed through literally rather than rejected, matching how browsers and
/// the original firmware's form parser tolerate malformed input.
fn urldecode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_form_urlencoded(body: &str) -> std::collections::HashMap<String, String> {
    body.split('&')
        .filter_map(|pair| {
            let mut it = pair.splitn(2, '=');
            let key = it.next()?;
            let value = it.next().unwrap_or("");
            Some((urldecode(key), urldecode(value)))
        })
        .collect()
}

fn http_response(status: u16, reason: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

async fn handle_connection(mut stream: TcpStream, runtime: Arc<Runtime>) {
    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    let n = match stream.read(&mut buf).await {
        Ok(n) => n,
        Err(e) => {
            tlog!("[http] read error: {e}");
            return;
        }
    };
    let raw = String::from_utf8_lossy(&buf[..n]);

    let response = match parse_request(&raw) {
        Some(req) => route(req, &runtime).await,
        None => http_response(400, "Bad Request", "text/plain", "malformed request"),
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        tlog!("[http] write error: {e}");
    }
}

async fn route(req: Request, runtime: &Runtime) -> String {
    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/") => http_response(200, "OK", "text/html", assets::INDEX_HTML),
        ("GET", "/favicon.svg") => http_response(200, "OK", "image/svg+xml", assets::FAVICON_SVG),
        ("GET", "/script.js") => http_response(200, "OK", "text/javascript", assets::SCRIPT_JS),
        ("GET", "/alpine.js") => http_response(200, "OK", "text/javascript", assets::ALPINE_JS),
        ("GET", "/api/status") => {
            let doc = runtime.status.snapshot().await;
            http_response(200, "OK", "application/json", &doc.to_string())
        }
        ("GET", "/api/config") => {
            let doc = serde_json::to_string(&*runtime.config.read().await).unwrap_or_default();
            http_response(200, "OK", "application/json", &doc)
        }
        ("POST", "/api/config") => handle_post_config(&req.body, runtime).await,
        _ => http_response(404, "Not Found", "text/plain", "not found"),
    }
}

async fn handle_post_config(body: &str, runtime: &Runtime) -> String {
    let fields = parse_form_urlencoded(body);
    let mut new_config = runtime.config.read().await.clone();

    if let Some(raw) = fields.get("can_bitrate") {
        match raw.parse::<u32>().ok().and_then(CanBitrate::from_bits_per_second) {
            Some(bitrate) => new_config.can_bitrate = bitrate,
            None => return http_response(400, "Bad Request", "text/plain", "invalid can_bitrate"),
        }
    }
    if let Some(raw) = fields.get("cyphal_node_id") {
        match raw.parse::<u8>() {
            Ok(id) if id <= 127 => new_config.cyphal_node_id = id,
            _ => return http_response(400, "Bad Request", "text/plain", "invalid cyphal_node_id"),
        }
    }
    if let Some(raw) = fields.get("cyphal_enabled") {
        new_config.cyphal_enabled = raw.eq_ignore_ascii_case("true");
    }
    if let Some(raw) = fields.get("hostname") {
        new_config.hostname = raw.clone();
    }

    if let Err(e) = config::save_config(&new_config) {
        tlog!("[http] failed to persist config: {e}");
        return http_response(500, "Internal Server Error", "text/plain", "failed to save config");
    }

    *runtime.config.write().await = new_config;
    // No process restart: CAN bitrate takes effect on the next driver
    // (re)start, Cyphal fields are hot-applied already above.
    http_response(
        200,
        "OK",
        "text/plain",
        "configuration updated; bitrate changes apply on next bus restart",
    )
}

/// Accepts HTTP connections on `addr`, one request per connection, until
/// `shutdown` fires.
pub async fn run_http_server(
    addr: SocketAddr,
    runtime: Arc<Runtime>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tlog!("[http] listening on {addr}");

    loop {
        tokio::select! {
            accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()) => {
                match accepted {
                    Ok(Ok((stream, peer))) => {
                        let runtime = runtime.clone();
                        tokio::spawn(async move {
                            tlog!("[http] connection from {peer}");
                            handle_connection(stream, runtime).await;
                        });
                    }
                    Ok(Err(e)) => tlog!("[http] accept error: {e}"),
                    Err(_) => {}
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_request_line() {
        let req = parse_request("GET /api/status HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/status");
        assert_eq!(req.body, "");
    }

    #[test]
    fn parses_post_body() {
        let req = parse_request(
            "POST /api/config HTTP/1.1\r\nContent-Length: 20\r\n\r\ncan_bitrate=250000&x=1",
        )
        .unwrap();
        assert_eq!(req.method, "POST");
        let fields = parse_form_urlencoded(&req.body);
        assert_eq!(fields.get("can_bitrate").unwrap(), "250000");
        assert_eq!(fields.get("x").unwrap(), "1");
    }

    #[test]
    fn decodes_percent_and_plus_in_form_values() {
        let fields = parse_form_urlencoded("hostname=my+device&label=lab%20rig");
        assert_eq!(fields.get("hostname").unwrap(), "my device");
        assert_eq!(fields.get("label").unwrap(), "lab rig");
    }

    #[test]
    fn rejects_malformed_request_line() {
        assert!(parse_request("").is_none());
    }

    #[test]
    fn response_has_content_length() {
        let resp = http_response(200, "OK", "text/plain", "hello");
        assert!(resp.contains("Content-Length: 5"));
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
    }
}
