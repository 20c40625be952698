// Kabeuchi Engine — Protocol Version Negotiation
// Builds the ordered variant list and decides whether a rejected attempt is
// a version problem (try the next variant) or a real rejection (stop).

use crate::atoms::constants::{
    API_VERSION_PROBLEMS, API_VERSION_SUBJECTS, FALLBACK_API_VERSIONS, NEGOTIATION_MARKERS,
    V1_PREVIEW_API_VERSION,
};
use crate::atoms::types::{ProtocolVariant, UrlShape};

/// The fixed fallback sequence tried after the preferred version.
pub fn fallback_variants() -> Vec<ProtocolVariant> {
    FALLBACK_API_VERSIONS
        .iter()
        .map(|v| ProtocolVariant::responses(*v))
        .chain(std::iter::once(ProtocolVariant::new(
            UrlShape::V1Responses,
            V1_PREVIEW_API_VERSION,
        )))
        .collect()
}

/// Preferred variant first, then `fallbacks`, de-duplicated.
pub fn build_variants(preferred: &str, fallbacks: &[ProtocolVariant]) -> Vec<ProtocolVariant> {
    let preferred = preferred.trim();
    let head = (!preferred.is_empty()).then(|| ProtocolVariant::responses(preferred));
    dedup_variants(head.into_iter().chain(fallbacks.iter().cloned()))
}

/// Drop repeats (shape + case-insensitive version), keeping first-seen order.
pub fn dedup_variants(variants: impl IntoIterator<Item = ProtocolVariant>) -> Vec<ProtocolVariant> {
    let mut seen = std::collections::HashSet::new();
    variants
        .into_iter()
        .filter(|v| !v.version.trim().is_empty())
        .filter(|v| seen.insert(v.dedup_key()))
        .collect()
}

/// True when a failure body says the api-version was missing or unsupported.
pub fn is_negotiation_failure(body: &str) -> bool {
    let lower = body.to_lowercase();
    if NEGOTIATION_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    API_VERSION_SUBJECTS.iter().any(|s| lower.contains(s))
        && API_VERSION_PROBLEMS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_version_goes_first() {
        let variants = build_variants("2024-12-01-preview", &fallback_variants());
        assert_eq!(variants[0], ProtocolVariant::responses("2024-12-01-preview"));
        assert_eq!(variants.len(), fallback_variants().len() + 1);
    }

    #[test]
    fn preferred_duplicate_of_fallback_is_collapsed_case_insensitively() {
        let variants = build_variants("2025-05-15-PREVIEW", &fallback_variants());
        assert_eq!(variants.len(), fallback_variants().len());
        assert_eq!(variants[0].version, "2025-05-15-PREVIEW");
        let dupes = variants
            .iter()
            .filter(|v| v.version.eq_ignore_ascii_case("2025-05-15-preview"))
            .count();
        assert_eq!(dupes, 1);
    }

    #[test]
    fn blank_preferred_is_ignored() {
        assert_eq!(build_variants("  ", &fallback_variants()), fallback_variants());
    }

    #[test]
    fn same_version_on_different_shapes_is_kept() {
        let variants = dedup_variants(vec![
            ProtocolVariant::responses("preview"),
            ProtocolVariant::new(UrlShape::V1Responses, "preview"),
        ]);
        assert_eq!(variants.len(), 2);
    }

    #[test]
    fn fallbacks_end_with_v1_shape() {
        let fallbacks = fallback_variants();
        assert_eq!(fallbacks.last().map(|v| v.shape), Some(UrlShape::V1Responses));
    }

    #[test]
    fn detects_version_errors() {
        assert!(is_negotiation_failure(
            r#"{"error":{"code":"BadRequest","message":"API version not supported"}}"#
        ));
        assert!(is_negotiation_failure("Missing required query parameter 'api-version'"));
        assert!(is_negotiation_failure("The requested API-Version is not supported."));
        assert!(is_negotiation_failure("missing version parameter"));
    }

    #[test]
    fn detects_version_errors_with_quoted_value() {
        assert!(is_negotiation_failure(
            r#"{"error":{"code":"BadRequest","message":"The api-version '2099-01-01-preview' is not supported."}}"#
        ));
        assert!(is_negotiation_failure(
            r#"{"error":{"code":"InvalidApiVersionParameter","message":"The api-version 'x' is invalid."}}"#
        ));
        assert!(is_negotiation_failure("Unknown code. The API version '2024-01-01' is unsupported for this resource"));
    }

    #[test]
    fn other_errors_are_terminal() {
        assert!(!is_negotiation_failure(r#"{"error":{"code":"PermissionDenied"}}"#));
        assert!(!is_negotiation_failure("Agent 'kabeuchi' not found"));
        assert!(!is_negotiation_failure(r#"{"error":{"code":"InvalidInput","message":"input is invalid"}}"#));
        assert!(!is_negotiation_failure(""));
    }
}
