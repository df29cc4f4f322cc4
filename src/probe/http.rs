//! HTTP probe implementation.

use std::error::Error as StdError;
use std::io;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderName, CONTENT_TYPE, SERVER};
use reqwest::{Method, Response, StatusCode};

use super::{normalize_url, ProbeError, ProbeRequest, ProbeResult};
use crate::db::{CheckMetadata, CheckStatus};

pub(crate) const MAX_REDIRECTS: usize = 10;

/// Run an HTTP probe. Latency covers the request up to the response headers; the
/// body is never read.
pub async fn run_http_probe(client: &reqwest::Client, request: &ProbeRequest) -> ProbeResult {
    let url = normalize_url(&request.url);
    let timeout = request.timeout;
    let timeout_ms = timeout.as_millis() as i64;
    let mut metadata = CheckMetadata {
        is_https: url.to_ascii_lowercase().starts_with("https://"),
        ..Default::default()
    };

    let start = Instant::now();
    let outcome = tokio::time::timeout(timeout, send(client, &url, request)).await;
    let elapsed = start.elapsed();

    let (response, used_fallback) = match outcome {
        Err(_) => return ProbeResult::failed(ProbeError::Timeout(timeout), timeout_ms, metadata),
        Ok(Err(ProbeError::Timeout(d))) => {
            return ProbeResult::failed(ProbeError::Timeout(d), timeout_ms, metadata)
        }
        Ok(Err(e)) => return ProbeResult::failed(e, elapsed.as_millis() as i64, metadata),
        Ok(Ok(r)) => r,
    };

    if elapsed >= timeout {
        return ProbeResult::failed(ProbeError::Timeout(timeout), timeout_ms, metadata);
    }

    let status = response.status().as_u16();
    metadata.server = header_value(&response, SERVER);
    metadata.content_type = header_value(&response, CONTENT_TYPE);
    if metadata.is_https {
        // A completed handshake is all the TLS validation done here
        metadata.ssl_valid = Some(true);
    }
    metadata
        .additional
        .insert("final_url".to_string(), response.url().to_string());
    if used_fallback {
        metadata
            .additional
            .insert("method_fallback".to_string(), "GET".to_string());
    }

    let up = request.expect.matches(status);
    ProbeResult {
        status: if up { CheckStatus::Up } else { CheckStatus::Down },
        response_time_ms: elapsed.as_millis() as i64,
        status_code: Some(status),
        error: None,
        error_message: if up { None } else { Some(format!("HTTP {}", status)) },
        metadata,
    }
}

/// Send the request. Bare targets get HEAD, retried once as GET when the server
/// rejects HEAD.
async fn send(
    client: &reqwest::Client,
    url: &str,
    request: &ProbeRequest,
) -> Result<(Response, bool), ProbeError> {
    let timeout = request.timeout;

    if let Some(method) = &request.method {
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ProbeError::Config(format!("invalid HTTP method {:?}", method)))?;

        let mut builder = client.request(method, url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_error(&e, timeout))?;
        return Ok((response, false));
    }

    let response = client
        .head(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify_error(&e, timeout))?;

    if matches!(
        response.status(),
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    ) {
        drop(response);
        let response = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_error(&e, timeout))?;
        return Ok((response, true));
    }

    Ok((response, false))
}

fn header_value(response: &Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Map a client error onto the probe taxonomy.
pub fn classify_error(err: &reqwest::Error, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::Timeout(timeout);
    }
    if err.is_builder() {
        return ProbeError::Config(error_chain(err));
    }
    classify_chain(err, timeout)
}

/// Inspect an error and its sources. Priority: timeout, DNS, refused, generic.
pub(crate) fn classify_chain(err: &(dyn StdError + 'static), timeout: Duration) -> ProbeError {
    let mut timed_out = false;
    let mut dns = false;
    let mut refused = false;

    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::TimedOut => timed_out = true,
                io::ErrorKind::ConnectionRefused => refused = true,
                _ => {}
            }
        }

        let msg = e.to_string().to_ascii_lowercase();
        if msg.contains("dns error")
            || msg.contains("failed to lookup address")
            || msg.contains("name or service not known")
            || msg.contains("nodename nor servname")
            || msg.contains("no such host")
        {
            dns = true;
        }
        if msg.contains("connection refused") {
            refused = true;
        }

        current = e.source();
    }

    let chain = error_chain(err);
    if timed_out {
        ProbeError::Timeout(timeout)
    } else if dns {
        ProbeError::Dns(chain)
    } else if refused {
        ProbeError::ConnectionRefused(chain)
    } else {
        ProbeError::Network(chain)
    }
}

/// Join an error and its sources, skipping messages already contained in the
/// previous one.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let msg = e.to_string();
        if !parts.last().is_some_and(|prev| prev.contains(&msg)) {
            parts.push(msg);
        }
        current = e.source();
    }
    parts.join(": ")
}
