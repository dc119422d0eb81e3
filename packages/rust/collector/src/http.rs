//! Shared HTTP plumbing for collectors: client construction and SSRF checks.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;
use url::Url;

use intelhub_shared::{IntelHubError, Result};

/// User-Agent string for collector requests.
const USER_AGENT: &str = concat!("intelhub/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client used by all collectors.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
        .map_err(|e| IntelHubError::Network(format!("failed to build HTTP client: {e}")))
}

/// GET `url` and return the body bytes of a successful response.
pub(crate) async fn fetch_bytes(client: &Client, url: &Url, allow_localhost: bool) -> Result<Vec<u8>> {
    if !allow_localhost && is_ssrf_target(url) {
        return Err(IntelHubError::Network(format!(
            "{url}: blocked by SSRF protection"
        )));
    }

    debug!(%url, "fetching");
    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| IntelHubError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(IntelHubError::Network(format!("{url}: HTTP {status}")));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| IntelHubError::Network(format!("{url}: body read failed: {e}")))?;
    Ok(bytes.to_vec())
}

/// Parse configured URL strings, rejecting anything that is not http(s).
pub(crate) fn parse_urls(raw: &[String]) -> Result<Vec<Url>> {
    raw.iter()
        .map(|s| {
            let url = Url::parse(s)
                .map_err(|e| IntelHubError::config(format!("invalid collector URL '{s}': {e}")))?;
            match url.scheme() {
                "http" | "https" => Ok(url),
                other => Err(IntelHubError::config(format!(
                    "collector URL '{s}' has unsupported scheme '{other}'"
                ))),
            }
        })
        .collect()
}

/// Check if a URL targets a potentially dangerous resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
