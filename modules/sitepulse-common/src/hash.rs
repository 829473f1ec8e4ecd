use sha2::{Digest, Sha256};

/// SHA-256 of a URL's loc, hex-encoded. Immutable identity of a UrlEntry
/// within a project.
pub fn loc_hash(loc: &str) -> String {
    hex::encode(Sha256::digest(loc.as_bytes()))
}

/// Content hash of a sitemap: SHA-256 over the sorted, newline-joined
/// child locs. Changes iff the set of children changed.
pub fn content_hash<S: AsRef<str>>(locs: &[S]) -> String {
    let mut sorted: Vec<&str> = locs.iter().map(|s| s.as_ref()).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for loc in sorted {
        hasher.update(loc.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
