//! Request-target and authority helpers.

use url::Url;

use crate::codec::RequestHead;
use crate::error::UpstreamError;

/// Default port for the scheme implied by the listener.
pub fn default_port(tls: bool) -> u16 {
    if tls {
        443
    } else {
        80
    }
}

/// True for absolute-form request targets (`http://host/path`).
pub fn is_absolute_form(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

/// Splits an authority string into host and port.
///
/// Understands bracketed IPv6 literals; a missing port yields `fallback`.
pub fn parse_host_port(authority: &str, fallback: u16) -> Result<(String, u16), UpstreamError> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(UpstreamError::InvalidTarget("empty authority".to_string()));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| {
            UpstreamError::InvalidTarget(format!("unterminated IPv6 literal: {authority}"))
        })?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host.to_string(), fallback));
        }
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| {
                UpstreamError::InvalidTarget(format!("bad port in authority: {authority}"))
            })?;
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(UpstreamError::InvalidTarget(format!(
                    "missing host in authority: {authority}"
                )));
            }
            let port = port.parse().map_err(|_| {
                UpstreamError::InvalidTarget(format!("bad port in authority: {authority}"))
            })?;
            Ok((host.to_string(), port))
        }
        // No port, or an unbracketed IPv6 literal.
        _ => Ok((authority.to_string(), fallback)),
    }
}

/// Builds the URL string that filtering runs against.
///
/// Origin-form targets are joined with the Host header under the scheme
/// implied by the listener; absolute-form targets are used verbatim.
pub fn filter_url(host: &str, target: &str, tls: bool) -> String {
    if is_absolute_form(target) {
        return target.to_string();
    }
    let scheme = if tls { "https" } else { "http" };
    format!("{scheme}://{host}{target}")
}

/// Rewrites an absolute-form target to origin form for the upstream
/// request line. Origin-form targets pass through untouched.
pub fn origin_form(target: &str) -> Result<String, UpstreamError> {
    if !is_absolute_form(target) {
        return Ok(target.to_string());
    }
    let parsed = Url::parse(target)
        .map_err(|err| UpstreamError::InvalidTarget(format!("{target}: {err}")))?;
    let mut path = parsed.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(path)
}

/// Resolves the upstream host and port for a request.
///
/// Absolute-form targets carry their own authority; otherwise the Host
/// header decides, with the listener's scheme supplying the port.
pub fn upstream_authority(head: &RequestHead, tls: bool) -> Result<(String, u16), UpstreamError> {
    if is_absolute_form(&head.target) {
        let parsed = Url::parse(&head.target)
            .map_err(|err| UpstreamError::InvalidTarget(format!("{}: {err}", head.target)))?;
        let host = parsed.host_str().ok_or_else(|| {
            UpstreamError::InvalidTarget(format!("no host in target: {}", head.target))
        })?;
        let port = parsed
            .port()
            .unwrap_or_else(|| default_port(parsed.scheme() == "https"));
        return Ok((host.to_string(), port));
    }

    let host = head.host().ok_or_else(|| {
        UpstreamError::InvalidTarget("request carries no Host header".to_string())
    })?;
    parse_host_port(&host, default_port(tls))
}
