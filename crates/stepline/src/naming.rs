//! Name validation for Step Functions entities
//!
//! Activity names and worker names share the same rules on the service side:
//! 1-80 characters, no whitespace, no brackets or wildcards, none of a set of
//! special characters, and no control characters.

use uuid::Uuid;

/// Maximum length of a Step Functions name
pub const MAX_NAME_LEN: usize = 80;

const FORBIDDEN: &[char] = &[
    '<', '>', '{', '}', '[', ']', '?', '*', '"', '#', '%', '\\', '^', '|', '~', '`', '$', '&',
    ',', ';', ':', '/',
];

/// Name validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,

    #[error("name '{name}' is {len} characters long, maximum is {MAX_NAME_LEN}")]
    TooLong { name: String, len: usize },

    #[error("name '{name}' contains invalid character {ch:?}")]
    InvalidCharacter { name: String, ch: char },
}

/// Check a name against the Step Functions naming rules
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }

    let len = name.chars().count();
    if len > MAX_NAME_LEN {
        return Err(NameError::TooLong {
            name: name.to_string(),
            len,
        });
    }

    if let Some(ch) = name.chars().find(|c| is_forbidden(*c)) {
        return Err(NameError::InvalidCharacter {
            name: name.to_string(),
            ch,
        });
    }

    Ok(())
}

fn is_forbidden(c: char) -> bool {
    c.is_whitespace()
        || FORBIDDEN.contains(&c)
        || matches!(c as u32, 0x00..=0x1f | 0x7f..=0x9f)
}

/// Default worker identity: `{host}-{8 random hex chars}`
///
/// The host part is truncated so the result always fits in [`MAX_NAME_LEN`],
/// and characters the service would reject are replaced with `-`.
pub fn default_worker_name() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    worker_name_for_host(&host, suffix)
}

fn worker_name_for_host(host: &str, suffix: &str) -> String {
    let max_host = MAX_NAME_LEN - suffix.len() - 1;
    let host: String = host
        .chars()
        .map(|c| if is_forbidden(c) { '-' } else { c })
        .take(max_host)
        .collect();
    if host.is_empty() {
        suffix.to_string()
    } else {
        format!("{}-{}", host, suffix)
    }
}
