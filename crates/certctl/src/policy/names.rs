//! DNS name syntax.

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Lowercase, trim and drop a trailing root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Check a normalized DNS name.
///
/// Accepts letter-digit-hyphen labels and a single `*` as the whole
/// leftmost label. IP literals and single-label names are rejected.
pub fn validate_dns_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name exceeds {} characters", MAX_NAME_LEN));
    }

    let labels: Vec<&str> = name.split('.').collect();
    let (wildcard, rest) = match labels.split_first() {
        Some((&"*", rest)) => (true, rest),
        _ => (false, labels.as_slice()),
    };

    if rest.len() < 2 {
        return Err(if wildcard {
            "wildcard must cover a registrable domain, not a top-level domain".to_string()
        } else {
            "name must have at least two labels".to_string()
        });
    }

    for label in rest {
        validate_label(label)?;
    }

    let tld = rest[rest.len() - 1];
    if tld.chars().all(|c| c.is_ascii_digit()) {
        return Err("IP addresses are not valid certificate names".to_string());
    }

    Ok(())
}

fn validate_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("name contains an empty label".to_string());
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(format!("label '{}' exceeds {} characters", label, MAX_LABEL_LEN));
    }
    if label.contains('*') {
        return Err("wildcard is only allowed as the whole leftmost label".to_string());
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(format!("label '{}' contains invalid characters", label));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(format!("label '{}' starts or ends with a hyphen", label));
    }
    Ok(())
}
