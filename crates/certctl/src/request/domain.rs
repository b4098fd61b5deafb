//! Root domain extraction and wildcard name pairs.

use certctl_common::{CertError, CertResult};

/// Public suffixes with two labels that are common enough to special-case.
const SECOND_LEVEL_SUFFIXES: &[&str] = &[
    "com.cn", "net.cn", "org.cn", "gov.cn", "co.uk", "org.uk", "ac.uk", "co.jp", "ne.jp", "or.jp",
    "com.au", "net.au", "org.au", "co.kr", "or.kr", "com.hk", "org.hk", "com.tw", "org.tw",
];

/// Reduce user input (a URL, host, or wildcard name) to its registrable
/// root domain.
///
/// `https://www.example.co.uk:8443/path` becomes `example.co.uk`.
pub fn root_domain(input: &str) -> CertResult<String> {
    let invalid = |reason: &str| CertError::InvalidSubject {
        name: input.to_string(),
        reason: reason.to_string(),
    };

    let mut host = input.trim().to_ascii_lowercase();
    for scheme in ["http://", "https://"] {
        if let Some(rest) = host.strip_prefix(scheme) {
            host = rest.to_string();
        }
    }
    if let Some(rest) = host.strip_prefix("*.") {
        host = rest.to_string();
    }
    if let Some(idx) = host.find('/') {
        host.truncate(idx);
    }
    if let Some(idx) = host.find(':') {
        host.truncate(idx);
    }
    let host = host.trim_end_matches('.');

    if host.is_empty() {
        return Err(invalid("no host name found"));
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid("expected a domain with at least two labels"));
    }

    let last_two = labels[labels.len() - 2..].join(".");
    if SECOND_LEVEL_SUFFIXES.contains(&last_two.as_str()) {
        if labels.len() < 3 {
            return Err(invalid("name is a public suffix"));
        }
        return Ok(labels[labels.len() - 3..].join("."));
    }

    Ok(last_two)
}

/// The root domain and its wildcard: `[example.com, *.example.com]`.
pub fn wildcard_pair(input: &str) -> CertResult<[String; 2]> {
    let root = root_domain(input)?;
    let wildcard = format!("*.{}", root);
    Ok([root, wildcard])
}
