use sha2::{Digest, Sha256};

use crate::config::DedupStrategy;

/// Computes the content-addressing fingerprint of a request.
///
/// The same `(url, cookie, strategy)` triple always maps to the same hash,
/// independent of request order or process restarts. Under
/// [`DedupStrategy::FilenameOnly`] the hash input is the final path segment
/// with any query suffix stripped, so equivalent CDN URLs differing only in
/// host or signed query share one cache entry.
#[must_use]
pub(crate) fn compute_file_hash(url: &str, cookie: &str, strategy: DedupStrategy) -> String {
    let mut input = match strategy {
        DedupStrategy::FilenameOnly => extract_filename(url).to_owned(),
        DedupStrategy::FullUrl => url.to_owned(),
    };

    if !cookie.is_empty() {
        input.push('|');
        input.push_str(cookie);
    }

    let digest = Sha256::digest(input.as_bytes());
    format!("{digest:x}")
}

/// Returns the last path segment with any `?` query suffix stripped.
/// Besides display and logging, this is the hash input under
/// [`DedupStrategy::FilenameOnly`], so the stripping rule is part of the
/// fingerprint contract.
#[must_use]
pub(crate) fn extract_filename(path_or_url: &str) -> &str {
    let segment = match path_or_url.rsplit_once('/') {
        Some((_head, tail)) => tail,
        None => path_or_url,
    };

    match segment.split_once('?') {
        Some((head, _query)) => head,
        None => segment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_extraction() {
        assert_eq!(
            extract_filename("https://cdn.example.com/a/b/video.mp4"),
            "video.mp4"
        );
        assert_eq!(
            extract_filename("https://cdn.example.com/a/video.mp4?token=abc"),
            "video.mp4"
        );
        assert_eq!(extract_filename("video.mp4"), "video.mp4");

        /* only the query suffix is stripped, a fragment stays */
        assert_eq!(
            extract_filename("https://cdn.example.com/a/video.mp4#frag"),
            "video.mp4#frag"
        );

        /* the split is on the raw string, so a slash inside the query
         * shifts the segment */
        assert_eq!(
            extract_filename("https://cdn.example.com/a/video.mp4?path=/x/y"),
            "y"
        );

        /* path ends in a slash */
        assert_eq!(extract_filename("https://cdn.example.com/a/"), "");
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = compute_file_hash(
            "https://cdn.example.com/v.mp4",
            "session=1",
            DedupStrategy::FullUrl,
        );
        let b = compute_file_hash(
            "https://cdn.example.com/v.mp4",
            "session=1",
            DedupStrategy::FullUrl,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn filename_only_ignores_path_prefix() {
        let a = compute_file_hash(
            "https://edge1.cdn.test/path/one/file.bin?sig=x",
            "",
            DedupStrategy::FilenameOnly,
        );
        let b = compute_file_hash(
            "https://edge2.cdn.test/other/file.bin?sig=y",
            "",
            DedupStrategy::FilenameOnly,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn full_url_is_prefix_sensitive() {
        let a = compute_file_hash(
            "https://edge1.cdn.test/path/one/file.bin",
            "",
            DedupStrategy::FullUrl,
        );
        let b = compute_file_hash(
            "https://edge2.cdn.test/other/file.bin",
            "",
            DedupStrategy::FullUrl,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn cookie_participates_in_hash() {
        let plain = compute_file_hash("https://c.test/f.bin", "", DedupStrategy::FullUrl);
        let cookied = compute_file_hash("https://c.test/f.bin", "auth=1", DedupStrategy::FullUrl);
        assert_ne!(plain, cookied);

        /* known SHA-256 of "f.bin|auth=1" input composition */
        let by_name = compute_file_hash(
            "https://c.test/dir/f.bin",
            "auth=1",
            DedupStrategy::FilenameOnly,
        );
        let by_name_other_dir =
            compute_file_hash("https://d.test/f.bin", "auth=1", DedupStrategy::FilenameOnly);
        assert_eq!(by_name, by_name_other_dir);
    }
}
