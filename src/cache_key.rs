//! Content-addressed cache keys.
//!
//! A key is `sha256_hex(base_url) + "/" + variant_suffix(options)`. The hash
//! prefix identifies the source image independent of its volatile signing
//! parameters; the suffix identifies one transform variant. Every variant of
//! an image shares the prefix, which makes the prefix the unit of purge.

use sha2::{Digest, Sha256};

use crate::transform::params::{OutputFormat, TransformOptions};

pub fn hash_base_url(base_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_url.as_bytes());
    hex::encode(hasher.finalize())
}

/// The shared prefix of every variant of `base_url`.
pub fn cache_prefix(base_url: &str) -> String {
    let mut prefix = hash_base_url(base_url);
    prefix.push('/');
    prefix
}

pub fn cache_key(base_url: &str, options: &TransformOptions) -> String {
    let mut key = cache_prefix(base_url);
    key.push_str(&variant_suffix(options));
    key
}

/// Concatenates the non-empty directives in fixed order. An empty option set
/// collapses to `original`.
pub fn variant_suffix(options: &TransformOptions) -> String {
    let options = options.clone().normalise();
    let mut parts: Vec<String> = Vec::new();
    if let Some(w) = options.width {
        parts.push(format!("w{w}"));
    }
    if let Some(h) = options.height {
        parts.push(format!("h{h}"));
    }
    match options.format {
        Some(OutputFormat::Original) | None => {}
        Some(fmt) => parts.push(format!("f{fmt}")),
    }
    if let Some(q) = options.quality {
        parts.push(format!("q{q}"));
    }
    if let Some(fit) = options.fit {
        parts.push(format!("fit{fit}"));
    }
    if parts.is_empty() {
        "original".to_string()
    } else {
        parts.join("_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::params::FitMode;

    const URL: &str = "https://prod-files-secure.s3.us-west-2.amazonaws.com/ws/blk/cat.png";

    #[test]
    fn empty_options_map_to_original() {
        let key = cache_key(URL, &TransformOptions::default());
        assert!(key.ends_with("/original"));
        assert_eq!(key.len(), 64 + 1 + "original".len());
    }

    #[test]
    fn suffix_preserves_directive_order() {
        let opts = TransformOptions {
            width: Some(400),
            height: Some(300),
            format: Some(OutputFormat::Webp),
            quality: Some(80),
            fit: Some(FitMode::Cover),
        };
        assert_eq!(variant_suffix(&opts), "w400_h300_fwebp_q80_fitcover");

        let sparse = TransformOptions {
            height: Some(128),
            quality: Some(90),
            ..Default::default()
        };
        assert_eq!(variant_suffix(&sparse), "h128_q90");
    }

    #[test]
    fn format_original_is_equivalent_to_absent() {
        let explicit = TransformOptions {
            width: Some(200),
            format: Some(OutputFormat::Original),
            ..Default::default()
        };
        let implicit = TransformOptions {
            width: Some(200),
            ..Default::default()
        };
        assert_eq!(cache_key(URL, &explicit), cache_key(URL, &implicit));
    }

    #[test]
    fn same_inputs_same_key() {
        let opts = TransformOptions {
            width: Some(640),
            format: Some(OutputFormat::Avif),
            ..Default::default()
        };
        assert_eq!(cache_key(URL, &opts), cache_key(URL, &opts));
    }

    #[test]
    fn every_variant_shares_the_purge_prefix() {
        let prefix = cache_prefix(URL);
        for opts in [
            TransformOptions::default(),
            TransformOptions {
                width: Some(10),
                ..Default::default()
            },
            TransformOptions {
                format: Some(OutputFormat::Jpeg),
                quality: Some(50),
                ..Default::default()
            },
        ] {
            assert!(cache_key(URL, &opts).starts_with(&prefix));
        }
    }

    #[test]
    fn different_base_urls_do_not_collide() {
        let other = "https://prod-files-secure.s3.us-west-2.amazonaws.com/ws/blk/dog.png";
        assert_ne!(cache_prefix(URL), cache_prefix(other));
    }
}
