//! Shared argument validation for the tool handlers

use std::sync::OnceLock;

use regex::Regex;

use crate::errors::AppError;
use crate::upstream::pagination::Paginator;

/// Ids are interpolated into upstream paths, so only URL-safe ids pass.
fn resource_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid id pattern"))
}

pub fn normalize_filter(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn normalize_resource_id(field: &'static str, value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if !resource_id_pattern().is_match(trimmed) {
        return Err(AppError::bad_request(
            "invalid_id",
            format!("{field} must be 1-128 characters of letters, digits, '-' or '_'"),
        ));
    }
    Ok(trimmed.to_string())
}

pub fn normalize_optional_id(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<String>, AppError> {
    normalize_filter(value)
        .map(|value| normalize_resource_id(field, &value))
        .transpose()
}

/// Narrows the configured paginator by the caller's `page_size` and
/// `max_pages`, which may only lower the configured limits.
pub fn paginator_for(
    configured: Paginator,
    page_size: Option<u32>,
    max_pages: Option<u32>,
) -> Result<Paginator, AppError> {
    let page_size = match page_size {
        None => configured.page_size,
        Some(value) if (1..=configured.page_size).contains(&value) => value,
        Some(_) => {
            return Err(AppError::bad_request(
                "invalid_page_size",
                format!("page_size must be between 1 and {}", configured.page_size),
            ))
        }
    };

    let max_pages = match max_pages {
        None => configured.max_pages,
        Some(value) if value >= 1 && value as usize <= configured.max_pages => value as usize,
        Some(_) => {
            return Err(AppError::bad_request(
                "invalid_max_pages",
                format!("max_pages must be between 1 and {}", configured.max_pages),
            ))
        }
    };

    Ok(Paginator::new(max_pages, page_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_filters_are_dropped() {
        assert_eq!(normalize_filter(Some("  ".to_string())), None);
        assert_eq!(
            normalize_filter(Some(" spring ".to_string())),
            Some("spring".to_string())
        );
    }

    #[test]
    fn ids_with_path_characters_are_rejected() {
        assert!(normalize_resource_id("campaign_id", "019a-b_C").is_ok());
        assert!(normalize_resource_id("campaign_id", "../accounts").is_err());
        assert!(normalize_resource_id("campaign_id", "").is_err());
        assert_eq!(normalize_optional_id("list_id", None).expect("none"), None);
    }

    #[test]
    fn paging_overrides_stay_within_configuration() {
        let configured = Paginator::new(50, 100);

        assert_eq!(
            paginator_for(configured, None, None).expect("defaults"),
            configured
        );
        assert_eq!(
            paginator_for(configured, Some(25), Some(4)).expect("narrowed"),
            Paginator::new(4, 25)
        );
        assert!(paginator_for(configured, Some(0), None).is_err());
        assert!(paginator_for(configured, Some(101), None).is_err());
        assert!(paginator_for(configured, None, Some(51)).is_err());
    }
}
