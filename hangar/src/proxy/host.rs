//! Host header parsing

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::HangarError;

/// Labels that always belong to the main application
pub const RESERVED_LABELS: [&str; 6] = ["www", "api", "app", "admin", "dashboard", "auth"];

static SUBDOMAIN_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").ok());

pub fn is_reserved(label: &str) -> bool {
    RESERVED_LABELS.contains(&label)
}

/// Tenant label of a host header, if it names one.
///
/// `acme.localhost` and `acme.example.com` yield `acme`; bare domains,
/// IP addresses and reserved labels yield `None`.
pub fn extract_subdomain(host: &str) -> Option<String> {
    let host = host.trim().to_lowercase();
    let host = strip_port(&host).trim_end_matches('.');
    if host.is_empty() || host.parse::<std::net::Ipv4Addr>().is_ok() {
        return None;
    }

    let labels: Vec<&str> = host.split('.').collect();
    let is_localhost = labels.last() == Some(&"localhost");
    let enough = if is_localhost {
        labels.len() >= 2
    } else {
        labels.len() >= 3
    };
    if !enough {
        return None;
    }

    let label = labels[0];
    if label.is_empty() || is_reserved(label) {
        return None;
    }
    Some(label.to_string())
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // bracketed IPv6 literal never carries a tenant label
        return "";
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Check a requested subdomain before a deployment is created.
pub fn validate_subdomain(subdomain: &str) -> Result<(), HangarError> {
    let valid = SUBDOMAIN_PATTERN
        .as_ref()
        .map(|re| re.is_match(subdomain))
        .unwrap_or(false);
    if !valid {
        return Err(HangarError::ValidationError(format!(
            "Subdomain '{}' must be 1-63 lowercase letters, digits or hyphens, \
             and may not start or end with a hyphen",
            subdomain
        )));
    }
    if is_reserved(subdomain) {
        return Err(HangarError::ValidationError(format!(
            "Subdomain '{}' is reserved",
            subdomain
        )));
    }
    Ok(())
}
