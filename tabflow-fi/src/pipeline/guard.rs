//! Referer-domain allowlisting for importer-scoped requests

use url::Url;

use crate::error::ApiError;
use crate::models::Importer;

/// Check that `referer` is allowed to act on behalf of `importer`
///
/// An importer without allowed domains accepts any origin. Otherwise the
/// referer must parse as a URL whose hostname is one of the allowed domains
/// or a subdomain of one (case-insensitive).
pub fn authorize_origin(importer: &Importer, referer: Option<&str>) -> Result<(), ApiError> {
    if importer.allowed_domains.is_empty() {
        return Ok(());
    }

    let host = referer
        .filter(|r| !r.trim().is_empty())
        .and_then(|r| Url::parse(r.trim()).ok())
        .and_then(|u| u.host_str().map(str::to_lowercase));

    let Some(host) = host else {
        tracing::info!(
            importer_id = %importer.id,
            referer = referer.unwrap_or(""),
            "Access denied: missing or unparseable referer"
        );
        return Err(ApiError::AccessDenied(
            "Unable to determine the request origin".to_string(),
        ));
    };

    let allowed = importer
        .allowed_domains
        .iter()
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .any(|d| host_matches(&host, &d));

    if allowed {
        Ok(())
    } else {
        tracing::info!(
            importer_id = %importer.id,
            host = %host,
            allowed_domains = ?importer.allowed_domains,
            "Access denied: origin not in allowed domains"
        );
        Err(ApiError::AccessDenied(format!(
            "Uploads are not allowed from {}",
            host
        )))
    }
}

/// `host` is `domain` or lies under it on a label boundary
fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
