use regex::Regex;
use std::sync::OnceLock;

use crate::error::ValidationError;

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$")
            .expect("hostname regex")
    })
}

/// Нормализует и проверяет доменное имя.
///
/// Убирает схему, путь и префикс `www.`, приводит к нижнему регистру.
///
/// # Examples
/// ```rust
/// assert_eq!(domain::validate("https://WWW.Example.com/")?, "example.com");
/// ```
pub fn validate(input: &str) -> Result<String, ValidationError> {
    let mut domain = input.trim().to_lowercase();

    for scheme in ["http://", "https://"] {
        if let Some(rest) = domain.strip_prefix(scheme) {
            domain = rest.to_string();
        }
    }
    if let Some(idx) = domain.find('/') {
        domain.truncate(idx);
    }
    if let Some(rest) = domain.strip_prefix("www.") {
        domain = rest.to_string();
    }

    if domain.len() > 253 || !hostname_regex().is_match(&domain) {
        return Err(ValidationError::InvalidDomain(input.trim().to_string()));
    }

    Ok(domain)
}

/// Slug домена: нижний регистр, точки заменены дефисами
pub fn slug(domain: &str) -> String {
    domain.to_lowercase().replace('.', "-")
}

/// Алиас `www.` выдается только для доменов второго уровня
pub fn www_alias(domain: &str) -> Option<String> {
    if domain.split('.').count() == 2 {
        Some(format!("www.{}", domain))
    } else {
        None
    }
}
