use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::ChromeError;

/// Browser version information returned by `/json/version`.
#[derive(Debug, Deserialize)]
pub struct BrowserVersion {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: String,
}

/// A debuggable page target from `/json/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct PageTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: Option<String>,
}

/// Query Chrome's `/json/version` endpoint.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on connection failure or
/// `ChromeError::ParseError` if the response cannot be deserialized.
pub async fn query_version(host: &str, port: u16) -> Result<BrowserVersion, ChromeError> {
    let body = http_get(host, port, "/json/version").await?;
    serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Query Chrome's `/json/list` endpoint for debuggable targets.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on connection failure or
/// `ChromeError::ParseError` if the response cannot be deserialized.
pub async fn query_targets(host: &str, port: u16) -> Result<Vec<PageTarget>, ChromeError> {
    let body = http_get(host, port, "/json/list").await?;
    serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Poll `/json/list` until a page-type target with a debugger URL appears.
///
/// # Errors
///
/// Returns `ChromeError::NoPageTarget` if none appears within the timeout.
pub async fn wait_for_page_target(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<PageTarget, ChromeError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(targets) = query_targets(host, port).await {
            if let Some(page) = targets
                .into_iter()
                .find(|t| t.target_type == "page" && t.ws_debugger_url.is_some())
            {
                return Ok(page);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ChromeError::NoPageTarget);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Minimal HTTP/1.1 GET against Chrome's debug endpoint.
///
/// Chrome's endpoint closes the connection after the response, so the body
/// is everything after the header terminator once EOF is reached.
async fn http_get(host: &str, port: u16, path: &str) -> Result<String, ChromeError> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ChromeError::HttpError(format!("connect {host}:{port}: {e}")))?;

    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ChromeError::HttpError(format!("write: {e}")))?;

    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ChromeError::HttpError(format!("read: {e}")))?;

    parse_http_response(&buf)
}

/// Split a raw HTTP response into status check + body.
fn parse_http_response(buf: &[u8]) -> Result<String, ChromeError> {
    let header_end = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| ChromeError::HttpError("malformed HTTP response".into()))?;

    let headers = std::str::from_utf8(&buf[..header_end])
        .map_err(|e| ChromeError::HttpError(format!("invalid UTF-8 in headers: {e}")))?;
    let status_line = headers
        .lines()
        .next()
        .ok_or_else(|| ChromeError::HttpError("empty response".into()))?;
    if !status_line.contains(" 200 ") {
        return Err(ChromeError::HttpError(format!(
            "unexpected HTTP status: {status_line}"
        )));
    }

    String::from_utf8(buf[header_end + 4..].to_vec())
        .map_err(|e| ChromeError::HttpError(format!("invalid UTF-8 in body: {e}")))
}
