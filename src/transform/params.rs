use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const MIN_DIMENSION: u32 = 1;
pub const MAX_DIMENSION: u32 = 10_000;
pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;
pub const DEFAULT_QUALITY: u8 = 80;

/// Requested output encoding. `Original` is a directive to keep the decoded
/// format and normalises away for cache-key purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Webp,
    Avif,
    Png,
    Jpeg,
    Original,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Avif => "avif",
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Original => "original",
        };
        f.write_str(s)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "webp" => Ok(OutputFormat::Webp),
            "avif" => Ok(OutputFormat::Avif),
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "original" => Ok(OutputFormat::Original),
            other => Err(format!("invalid format: {other}")),
        }
    }
}

/// How a resize maps the source onto the requested box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    Cover,
    Contain,
    Fill,
    Inside,
    Outside,
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FitMode::Cover => "cover",
            FitMode::Contain => "contain",
            FitMode::Fill => "fill",
            FitMode::Inside => "inside",
            FitMode::Outside => "outside",
        };
        f.write_str(s)
    }
}

impl FromStr for FitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cover" => Ok(FitMode::Cover),
            "contain" => Ok(FitMode::Contain),
            "fill" => Ok(FitMode::Fill),
            "inside" => Ok(FitMode::Inside),
            "outside" => Ok(FitMode::Outside),
            other => Err(format!("invalid fit mode: {other}")),
        }
    }
}

/// Transform directives extracted from query parameters. Every field is
/// optional; absence means "no directive".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<OutputFormat>,
    pub quality: Option<u8>,
    pub fit: Option<FitMode>,
}

impl TransformOptions {
    /// Lenient extraction from the request query: out-of-range, non-numeric
    /// or unknown values are dropped as if absent.
    pub fn from_query(params: &HashMap<String, String>) -> Self {
        let dimension = |name: &str| {
            params
                .get(name)
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| (MIN_DIMENSION..=MAX_DIMENSION).contains(v))
        };
        Self {
            width: dimension("w"),
            height: dimension("h"),
            format: params.get("fmt").and_then(|v| v.parse().ok()),
            quality: params
                .get("q")
                .and_then(|v| v.parse::<u8>().ok())
                .filter(|v| (MIN_QUALITY..=MAX_QUALITY).contains(v)),
            fit: params.get("fit").and_then(|v| v.parse().ok()),
        }
    }

    /// Removes `format=original`, so equivalent option sets compare (and
    /// hash) identically.
    pub fn normalise(mut self) -> Self {
        if self.format == Some(OutputFormat::Original) {
            self.format = None;
        }
        self
    }

    /// Applies `Accept`-header content negotiation. An explicit format
    /// directive always wins; otherwise a client advertising AVIF or WebP
    /// support gets that format.
    pub fn negotiated(mut self, accept: Option<&str>) -> Self {
        if self.format.is_some() {
            return self;
        }
        if let Some(accept) = accept {
            if accept.contains("image/avif") {
                self.format = Some(OutputFormat::Avif);
            } else if accept.contains("image/webp") {
                self.format = Some(OutputFormat::Webp);
            }
        }
        self
    }

    /// True when there is nothing for the optimizer to do.
    pub fn is_noop(&self) -> bool {
        let n = self.clone().normalise();
        n.width.is_none()
            && n.height.is_none()
            && n.format.is_none()
            && n.quality.is_none()
            && n.fit.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_well_formed_directives() {
        let opts = TransformOptions::from_query(&query(&[
            ("w", "400"),
            ("h", "300"),
            ("fmt", "webp"),
            ("q", "75"),
            ("fit", "cover"),
        ]));
        assert_eq!(opts.width, Some(400));
        assert_eq!(opts.height, Some(300));
        assert_eq!(opts.format, Some(OutputFormat::Webp));
        assert_eq!(opts.quality, Some(75));
        assert_eq!(opts.fit, Some(FitMode::Cover));
    }

    #[test]
    fn invalid_values_are_silently_dropped() {
        for (k, v) in [
            ("w", "0"),
            ("w", "-1"),
            ("w", "10001"),
            ("w", "abc"),
            ("h", "1e3"),
            ("q", "0"),
            ("q", "101"),
            ("fmt", "xyz"),
            ("fit", "stretch"),
        ] {
            let opts = TransformOptions::from_query(&query(&[(k, v)]));
            assert_eq!(opts, TransformOptions::default(), "{k}={v} should be dropped");
        }
    }

    #[test]
    fn boundary_values_are_kept() {
        let opts =
            TransformOptions::from_query(&query(&[("w", "1"), ("h", "10000"), ("q", "100")]));
        assert_eq!(opts.width, Some(1));
        assert_eq!(opts.height, Some(10000));
        assert_eq!(opts.quality, Some(100));
    }

    #[test]
    fn format_original_normalises_to_absent() {
        let opts = TransformOptions {
            format: Some(OutputFormat::Original),
            ..Default::default()
        };
        assert!(opts.is_noop());
        assert_eq!(opts.normalise(), TransformOptions::default());
    }

    #[test]
    fn negotiation_prefers_avif_then_webp() {
        let base = TransformOptions::default();
        let avif = base.clone().negotiated(Some("image/avif,image/webp,*/*"));
        assert_eq!(avif.format, Some(OutputFormat::Avif));
        let webp = base.clone().negotiated(Some("image/webp,*/*"));
        assert_eq!(webp.format, Some(OutputFormat::Webp));
        let none = base.negotiated(Some("image/png,*/*"));
        assert_eq!(none.format, None);
    }

    #[test]
    fn explicit_format_overrides_negotiation() {
        let opts = TransformOptions {
            format: Some(OutputFormat::Jpeg),
            ..Default::default()
        };
        let negotiated = opts.negotiated(Some("image/avif"));
        assert_eq!(negotiated.format, Some(OutputFormat::Jpeg));
    }
}
