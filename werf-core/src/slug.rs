//! Deterministic, bounded-length, path-safe slugs.
//!
//! Mount host paths embed user-provided mountpoints; the slug keeps them
//! filesystem-safe while staying collision-resistant via a digest suffix.

use crate::digest::sha256_hex;

/// Default maximum slug length.
pub const DEFAULT_SLUG_MAX_SIZE: usize = 42;

const SLUG_HASH_SIZE: usize = 10;

/// Transform `input` into a path-safe slug no longer than `max_size`.
///
/// When the slugified form differs from the input, or would overflow
/// `max_size`, the slug is truncated and suffixed with the first
/// [`SLUG_HASH_SIZE`] hex chars of the input's SHA-256 so distinct inputs
/// keep distinct slugs.
pub fn limited_slug(input: &str, max_size: usize) -> String {
    let slug = slugify(input);

    if slug == input && slug.len() <= max_size {
        return slug;
    }

    let hash = &sha256_hex(input.as_bytes())[..SLUG_HASH_SIZE];

    // Room for "<slug>-<hash>"
    let keep = max_size.saturating_sub(SLUG_HASH_SIZE + 1);
    let truncated = slug.chars().take(keep).collect::<String>();
    let truncated = truncated.trim_end_matches('-');

    if truncated.is_empty() {
        hash.to_string()
    } else {
        format!("{}-{}", truncated, hash)
    }
}

fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_dash = false;

    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            prev_dash = false;
        } else if !prev_dash && !out.is_empty() {
            out.push('-');
            prev_dash = true;
        }
    }

    out.trim_end_matches('-').to_string()
}
