use crate::error::LinkError;
use axum::http::StatusCode;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use std::env;
use std::error::Error;
use url::Url;

const MAX_ALIAS_LENGTH: usize = 20;

pub fn internal_error<E>(err: E) -> (StatusCode, String)
where
    E: Error,
{
    tracing::error!("{}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// Runs a registry transaction off the async workers; the file store does blocking io.
pub async fn blocking<T, F>(task: F) -> Result<T, (StatusCode, String)>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(internal_error)
}

pub fn link_error(err: LinkError) -> (StatusCode, String) {
    let status = match err {
        LinkError::InvalidUrl(_) | LinkError::InvalidAlias(_) => StatusCode::BAD_REQUEST,
        LinkError::AliasTaken(_) => StatusCode::CONFLICT,
        LinkError::IdSpaceExhausted(_) | LinkError::Persistence(_) => {
            tracing::error!("{}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

pub fn get_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("Environment variable {} is required", name))
}

pub fn get_env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn is_web_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host().is_some()
}

// `localhost:3000/path` parses with "localhost" as its scheme and a port-like path.
fn is_host_and_port(url: &Url) -> bool {
    let port = url.path().split('/').next().unwrap_or_default();
    url.cannot_be_a_base() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
}

// Catches mistyped web schemes such as `https//host`.
fn has_web_scheme_prefix(text: &str) -> bool {
    ["https", "http"].iter().any(|scheme| {
        text.get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
            && matches!(text.as_bytes().get(scheme.len()), Some(b':' | b'/'))
    })
}

/// Parses `text` as an http(s) URL. Input without any scheme is retried with
/// `https://` prepended; input naming another scheme is rejected.
pub fn normalize_url(text: &str) -> Result<String, LinkError> {
    let text = text.trim();
    let invalid = || LinkError::InvalidUrl(text.to_string());
    let needs_scheme = match Url::parse(text) {
        Ok(url) if is_web_url(&url) => return Ok(url.to_string()),
        Ok(url) => is_host_and_port(&url),
        Err(_) => !text.contains("://") && !has_web_scheme_prefix(text),
    };
    if !needs_scheme {
        return Err(invalid());
    }
    Url::parse(&format!("https://{text}"))
        .ok()
        .filter(is_web_url)
        .map(|url| url.to_string())
        .ok_or_else(invalid)
}

pub fn sanitize_alias(alias: &str) -> String {
    alias
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .take(MAX_ALIAS_LENGTH)
        .collect()
}

pub fn generate_id(length: usize) -> String {
    let mut random_bytes = vec![0u8; (length * 6).div_ceil(8)];
    rand::thread_rng().fill(&mut random_bytes[..]);
    let mut id = BASE64_URL_SAFE_NO_PAD.encode(random_bytes);
    id.truncate(length);
    id
}
