//! Deterministic names for generated objects.

use crate::crds::RepoItem;

pub const APP_NAME: &str = "gitbackup";

/// Used when a repo item name sanitizes to nothing.
pub const FALLBACK_NAME: &str = "invalid-name";

const MAX_NAME_LEN: usize = 253;

pub fn repository_config_name(owner: &str) -> String {
    [APP_NAME, "repository", owner, "gitconfig"].join("-")
}

pub fn collection_config_name(owner: &str) -> String {
    [APP_NAME, "collection", owner, "gitconfig"].join("-")
}

pub fn cronjob_name(owner: &str) -> String {
    format!("{APP_NAME}-{owner}")
}

/// `<collection>-<item name>`, where the item name falls back to the last
/// path segment of `src`.
pub fn repo_item_name(collection: &str, item: &RepoItem) -> String {
    let name = match &item.name {
        Some(name) => name.clone(),
        None => sanitize(last_path_segment(&item.src), FALLBACK_NAME),
    };
    format!("{collection}-{name}")
}

fn last_path_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// Converts `s` into an RFC 1123 subdomain, or `fallback` if nothing usable
/// remains.
pub fn sanitize(s: &str, fallback: &str) -> String {
    let filtered: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' { '-' } else { c })
        .filter(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        .collect();

    let trimmed = trim_separators(&filtered);
    if trimmed.is_empty() {
        return fallback.to_owned();
    }

    // ASCII only at this point, so byte slicing is on char boundaries.
    let truncated = trimmed.get(..MAX_NAME_LEN).unwrap_or(trimmed);
    trim_separators(truncated).to_owned()
}

fn trim_separators(s: &str) -> &str {
    s.trim_matches(|c| c == '.' || c == '-')
}
