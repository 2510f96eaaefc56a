//! Slug allocation for articles
//!
//! Slugs are derived from the article title (or the topic-based fallback
//! title), normalized to a URL-safe form that keeps Unicode letters, and
//! made unique with a sequential `-1`, `-2`, ... probe against the store.
//! The probe is a pre-check only: the unique index on `articles.slug` is the
//! authority and a racing insert surfaces as [`AppError::DuplicateSlug`].

use crate::db::ArticleStore;
use crate::errors::{AppError, Result};

/// Used when normalization leaves nothing behind
pub const FALLBACK_SLUG: &str = "article";

/// Normalize arbitrary text into a slug.
///
/// Lowercases, turns whitespace runs into a single hyphen, drops everything
/// that is not a letter, digit or hyphen, and removes one trailing hyphen.
/// Returns an empty string when nothing survives.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut in_whitespace = false;

    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                slug.push('-');
                in_whitespace = true;
            }
            continue;
        }
        in_whitespace = false;

        if ch == '-' || ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
        }
    }

    if slug.ends_with('-') {
        slug.pop();
    }

    slug
}

/// Like [`slugify`], but never empty.
pub fn base_slug(text: &str) -> String {
    let slug = slugify(text);
    if slug.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        slug
    }
}

/// Find the first free slug: `base`, then `base-1`, `base-2`, ...
pub async fn allocate_slug(store: &dyn ArticleStore, text: &str) -> Result<String> {
    let base = base_slug(text);

    if !store.slug_exists(&base).await? {
        return Ok(base);
    }

    let mut counter: u64 = 1;
    loop {
        let candidate = format!("{}-{}", base, counter);
        if !store.slug_exists(&candidate).await? {
            tracing::debug!(base = %base, slug = %candidate, "Allocated suffixed slug");
            return Ok(candidate);
        }
        counter += 1;
    }
}

/// Normalize a caller-chosen slug without suffixing it.
pub fn explicit_slug(requested: &str) -> Result<String> {
    let slug = slugify(requested);
    if slug.is_empty() {
        return Err(AppError::Validation {
            message: "Slug must contain at least one letter or digit".to_string(),
            field: Some("slug".to_string()),
        });
    }
    Ok(slug)
}
