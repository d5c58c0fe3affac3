//! HTTP server for the query builder UI
//! Minimal HTTP/1.1 handling on tokio; one request per connection.

use query_builder::cancel::CancellationToken;
use query_builder::config::EngineConfig;
use query_builder::logging::init_tracing;
use query_builder::service::{FragmentQueryRequest, QueryBuilderService, ViewQueryRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const QUERY_EDITOR_ROLE: &str = "query_editor";

#[derive(Debug, Default, PartialEq, Eq)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn content_length(&self) -> usize {
        self.headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn is_query_editor(&self) -> bool {
        self.headers
            .get("x-user-role")
            .map(|role| role.eq_ignore_ascii_case(QUERY_EDITOR_ROLE))
            .unwrap_or(false)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let config = EngineConfig::from_env()?;
    let service = Arc::new(QueryBuilderService::from_config(&config).await?);

    info!("🚀 Query builder API listening on http://{}", config.bind_addr);
    info!(
        "{} active fragments, {} catalog views",
        service.active_fragments().len(),
        service.views().len()
    );

    let listener = TcpListener::bind(&config.bind_addr).await?;
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("📥 New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, service.clone()));
    }
}

async fn handle_connection(stream: TcpStream, service: Arc<QueryBuilderService>) {
    let (mut reader, mut writer) = stream.into_split();

    let request = match read_request(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(message) => {
            let response = create_response(400, &error_body(&message));
            let _ = writer.write_all(response.as_bytes()).await;
            return;
        }
    };
    info!("🔍 Request: {} {}", request.method, request.path);

    // Anything the client sends after the body is ignored; EOF means it left.
    let cancel = CancellationToken::new();
    let disconnect = cancel.clone();
    let watcher = tokio::spawn(async move {
        let mut probe = [0u8; 256];
        loop {
            match reader.read(&mut probe).await {
                Ok(0) | Err(_) => {
                    disconnect.cancel();
                    break;
                }
                Ok(_) => continue,
            }
        }
    });

    let response = handle_request(&request, &service, &cancel).await;
    watcher.abort();

    if cancel.is_cancelled() {
        info!("Client disconnected before {} {} completed", request.method, request.path);
        return;
    }
    if let Err(e) = writer.write_all(response.as_bytes()).await {
        warn!("Failed to write response: {}", e);
    }
}

/// Read the head, then exactly `Content-Length` body bytes
async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<HttpRequest>, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_subsequence(&buffer, b"\r\n\r\n") {
            break pos;
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err("Request headers too large".to_string());
        }
        let read = reader.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err("Connection closed mid-request".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut request = parse_head(&head).ok_or_else(|| "Malformed request line".to_string())?;

    let length = request.content_length();
    if length > MAX_BODY_BYTES {
        return Err("Request body too large".to_string());
    }
    let mut body = buffer[head_end + 4..].to_vec();
    while body.len() < length {
        let read = reader.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if read == 0 {
            return Err("Connection closed before the full body arrived".to_string());
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(length);
    request.body = body;

    Ok(Some(request))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_head(head: &str) -> Option<HttpRequest> {
    let mut lines = head.lines();
    let mut parts = lines.next()?.split_whitespace();
    let method = parts.next()?.to_uppercase();
    let target = parts.next()?;

    // Drop query parameters; normalize trailing slash except for root
    let path = target.split('?').next().unwrap_or(target).trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
        .collect();

    Some(HttpRequest {
        method,
        path: path.to_string(),
        headers,
        body: Vec::new(),
    })
}

async fn handle_request(
    request: &HttpRequest,
    service: &QueryBuilderService,
    cancel: &CancellationToken,
) -> String {
    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => create_response(204, ""),
        ("GET", "/api/health") => {
            let registry = service.registry().snapshot();
            let body = serde_json::json!({
                "status": "ok",
                "service": "school-query-builder",
                "registryVersion": registry.version(),
                "fragments": registry.active().count(),
                "views": service.views().len(),
            });
            create_response(200, &body.to_string())
        }
        ("GET", "/api/fragments") => {
            let body = serde_json::json!({ "fragments": service.active_fragments() });
            create_response(200, &body.to_string())
        }
        ("GET", "/api/views") => {
            let body = serde_json::json!({ "views": service.views() });
            create_response(200, &body.to_string())
        }
        ("POST", "/api/query/generate") => {
            let payload: FragmentQueryRequest = match serde_json::from_slice(&request.body) {
                Ok(payload) => payload,
                Err(e) => return create_response(400, &error_body(&format!("Invalid request body: {}", e))),
            };
            let (status, response) = service.respond_fragment(&payload, cancel).await;
            let response = if request.is_query_editor() {
                response
            } else {
                response.without_debug_info()
            };
            json_response(status, &response)
        }
        ("POST", "/api/query/generate-view") => {
            let payload: ViewQueryRequest = match serde_json::from_slice(&request.body) {
                Ok(payload) => payload,
                Err(e) => return create_response(400, &error_body(&format!("Invalid request body: {}", e))),
            };
            let (status, response) = service.respond_view(&payload, cancel).await;
            let response = if request.is_query_editor() {
                response
            } else {
                response.without_debug_info()
            };
            json_response(status, &response)
        }
        _ => create_response(404, &error_body("Not found")),
    }
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "success": false, "error": message }).to_string()
}

fn json_response<T: serde::Serialize>(status: u16, body: &T) -> String {
    match serde_json::to_string(body) {
        Ok(json) => create_response(status, &json),
        Err(e) => create_response(500, &error_body(&format!("Failed to serialize response: {}", e))),
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        422 => "Unprocessable Entity",
        499 => "Client Closed Request",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

fn create_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type, X-User-Role\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text(status),
        body.len(),
        body
    )
}
