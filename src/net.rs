//! Network existence probe for candidate package repositories.

/// HEAD the URL and report whether the file is there.
///
/// Only 200 and 206 count; redirects that land anywhere else, auth walls,
/// and transport errors all read as "missing" so callers fall back to
/// their legacy repository path.
pub fn remote_file_exists(url: &str) -> bool {
    match ureq::head(url).call() {
        Ok(resp) => matches!(resp.status().as_u16(), 200 | 206),
        Err(_) => false,
    }
}
