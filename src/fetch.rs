//! Upstream image fetching.
//!
//! Implements the defensive fetch path:
//! 1. Redirects are chased manually, re-validating every hop
//! 2. HTTP status and Content-Type verification
//! 3. Content-Length pre-flight size limit
//! 4. Streaming size enforcement (the declared length is never trusted)
//! 5. One deadline over the whole call, redirects and body included

use std::collections::HashSet;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use mime::Mime;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, USER_AGENT};
use reqwest::{redirect, Client, StatusCode};
use url::Url;

use crate::error::{ErrorCode, ProxyError};
use crate::validate::validate_url;

pub const FETCH_USER_AGENT: &str = concat!("imagevault/", env!("CARGO_PKG_VERSION"));
pub const MAX_REDIRECTS: usize = 5;

pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: String,
    pub original_size: u64,
}

/// Builds the shared upstream client. Automatic redirect following is
/// disabled: every `Location` must pass the same validation gates as the
/// original URL before it is followed.
///
/// Panics if the TLS backend cannot be initialised, the same contract as
/// `reqwest::Client::new`.
pub fn build_client() -> Client {
    Client::builder()
        .redirect(redirect::Policy::none())
        .build()
        .expect("failed to construct the upstream HTTP client")
}

/// Fetches `url`, returning the body bytes and normalised content type.
///
/// `timeout_ms` bounds the entire call: DNS, connect, TLS, the redirect
/// chain, and the body read. `max_size_bytes` bounds the body, enforced both
/// on the declared `Content-Length` and on the running streamed total.
pub async fn fetch_image(
    client: &Client,
    url: &str,
    timeout_ms: u64,
    max_size_bytes: usize,
    allowed_hosts: &HashSet<String>,
) -> Result<FetchedImage, ProxyError> {
    tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        fetch_with_redirects(client, url, max_size_bytes, allowed_hosts),
    )
    .await
    .map_err(|_| {
        ProxyError::new(
            504,
            ErrorCode::UpstreamTimeout,
            format!("upstream fetch exceeded {timeout_ms}ms"),
        )
    })?
}

async fn fetch_with_redirects(
    client: &Client,
    url: &str,
    max_size_bytes: usize,
    allowed_hosts: &HashSet<String>,
) -> Result<FetchedImage, ProxyError> {
    let mut current = url.to_string();

    for _hop in 0..=MAX_REDIRECTS {
        let resp = client
            .get(&current)
            .header(USER_AGENT, FETCH_USER_AGENT)
            .header(ACCEPT, "image/*")
            .send()
            .await
            .map_err(|e| {
                ProxyError::new(502, ErrorCode::FetchFailed, format!("upstream request failed: {e}"))
            })?;

        let status = resp.status();
        if is_followable_redirect(status) {
            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    ProxyError::new(
                        502,
                        ErrorCode::InvalidRedirect,
                        "redirect without a usable Location header",
                    )
                })?;
            let base = Url::parse(&current).map_err(|_| {
                ProxyError::new(502, ErrorCode::InvalidRedirect, "redirect from unparseable url")
            })?;
            let resolved = base.join(location).map_err(|_| {
                ProxyError::new(
                    502,
                    ErrorCode::InvalidRedirect,
                    "redirect Location is not resolvable",
                )
            })?;
            validate_url(resolved.as_str(), allowed_hosts).map_err(|e| {
                ProxyError::new(
                    403,
                    ErrorCode::RedirectBlocked,
                    format!("redirect target rejected: {}", e.message),
                )
            })?;
            tracing::debug!(from = %current, to = %resolved, "following upstream redirect");
            current = resolved.into();
            continue;
        }

        return read_response(resp, max_size_bytes).await;
    }

    Err(ProxyError::new(
        502,
        ErrorCode::TooManyRedirects,
        format!("more than {MAX_REDIRECTS} redirects"),
    ))
}

fn is_followable_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

async fn read_response(
    resp: reqwest::Response,
    max_size_bytes: usize,
) -> Result<FetchedImage, ProxyError> {
    let status = resp.status();
    if !status.is_success() {
        // Upstream 403 means an expired or invalid signature; relaying it
        // verbatim would leak authentication detail, so it degrades to 502.
        let mapped = if status.as_u16() == 403 { 502 } else { status.as_u16() };
        return Err(ProxyError::new(
            mapped,
            ErrorCode::UpstreamError,
            format!("upstream returned status {}", status.as_u16()),
        ));
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(normalise_content_type)
        .unwrap_or_default();
    let is_image = content_type
        .parse::<Mime>()
        .map(|m| m.type_() == mime::IMAGE)
        .unwrap_or(false);
    if !is_image {
        return Err(ProxyError::new(
            400,
            ErrorCode::InvalidContentType,
            format!("upstream content type is not an image: {content_type:?}"),
        ));
    }

    // Pre-flight: a declared length over the limit fails before any body
    // bytes are read.
    if let Some(declared) = resp.content_length() {
        if declared as usize > max_size_bytes {
            return Err(too_large(max_size_bytes));
        }
    }

    let mut buf = BytesMut::with_capacity(8192);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await.transpose().map_err(|e| {
        ProxyError::new(502, ErrorCode::FetchFailed, format!("upstream body read failed: {e}"))
    })? {
        if buf.len() + chunk.len() > max_size_bytes {
            return Err(too_large(max_size_bytes));
        }
        buf.extend_from_slice(&chunk);
    }

    if buf.is_empty() {
        return Err(ProxyError::new(
            502,
            ErrorCode::EmptyBody,
            "upstream returned an empty body",
        ));
    }

    let original_size = buf.len() as u64;
    Ok(FetchedImage {
        bytes: buf.freeze(),
        content_type,
        original_size,
    })
}

fn too_large(max_size_bytes: usize) -> ProxyError {
    ProxyError::new(
        413,
        ErrorCode::ImageTooLarge,
        format!("upstream body exceeds {max_size_bytes} bytes"),
    )
}

/// Strips parameters and lowercases, e.g. `image/JPEG; charset=x` becomes
/// `image/jpeg`.
pub fn normalise_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
