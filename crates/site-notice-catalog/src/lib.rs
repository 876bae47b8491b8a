use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use site_notice_core::Catalog;

/// A validated catalog plus the identity of the deployment it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadedCatalog {
    pub catalog: Catalog,
    /// SHA-256 over the canonical catalog JSON; identifies one deployed
    /// catalog version. Stable ids across reloads of the same version are
    /// the author's obligation, surfaced by this value.
    pub fingerprint: String,
    pub origin: String,
}

/// Outcome of the one-shot catalog retrieval. `Unavailable` keeps the
/// selector returning nothing indefinitely, without error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CatalogState {
    Ready(LoadedCatalog),
    Unavailable { reason: String },
}

impl CatalogState {
    #[must_use]
    pub fn catalog(&self) -> Option<&Catalog> {
        match self {
            Self::Ready(loaded) => Some(&loaded.catalog),
            Self::Unavailable { .. } => None,
        }
    }
}

/// Compute the deployed-version fingerprint of a catalog.
///
/// # Errors
/// Returns an error when the catalog cannot be re-serialized.
pub fn catalog_fingerprint(catalog: &Catalog) -> Result<String> {
    let canonical =
        serde_json::to_string(catalog).context("failed to serialize catalog for fingerprint")?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Load and validate a catalog from a JSON file (an ordered array of
/// messages).
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_catalog_file(path: &Path) -> Result<LoadedCatalog> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog file {}", path.display()))?;
    let catalog = serde_json::from_str::<Catalog>(&body)
        .with_context(|| format!("failed to parse catalog file {}", path.display()))?;
    loaded(catalog, path.display().to_string())
}

/// Fetch and validate a catalog from a remote JSON endpoint. Blocking,
/// called once at session start; the result is an immutable snapshot.
///
/// # Errors
/// Returns an error when the request fails or the body cannot be parsed
/// or validated.
pub fn fetch_catalog(url: &str) -> Result<LoadedCatalog> {
    let body = ureq::get(url)
        .call()
        .with_context(|| format!("failed to fetch catalog from {url}"))?
        .into_string()
        .with_context(|| format!("failed to read catalog body from {url}"))?;
    let catalog = serde_json::from_str::<Catalog>(&body)
        .with_context(|| format!("failed to parse catalog body from {url}"))?;
    loaded(catalog, url.to_string())
}

fn loaded(catalog: Catalog, origin: String) -> Result<LoadedCatalog> {
    catalog
        .validate()
        .map_err(|err| anyhow!("invalid catalog from {origin}: {err}"))?;
    let fingerprint = catalog_fingerprint(&catalog)?;
    Ok(LoadedCatalog { catalog, fingerprint, origin })
}

/// Where the catalog comes from. An explicit file takes precedence over a
/// remote URL, mirroring the in-process-catalog-over-remote fallback of
/// the surrounding application.
#[derive(Debug, Clone, Default)]
pub struct CatalogSource {
    file: Option<PathBuf>,
    url: Option<String>,
}

impl CatalogSource {
    #[must_use]
    pub fn new(file: Option<PathBuf>, url: Option<String>) -> Self {
        Self { file, url }
    }

    /// Resolve the source exactly once. Consumes the source so the snapshot
    /// cannot be re-fetched later in the session; failures degrade to
    /// [`CatalogState::Unavailable`] rather than an error.
    #[must_use]
    pub fn resolve(self) -> CatalogState {
        let attempt = match (self.file, self.url) {
            (Some(path), _) => load_catalog_file(&path),
            (None, Some(url)) => fetch_catalog(&url),
            (None, None) => Err(anyhow!("no catalog source configured")),
        };

        match attempt {
            Ok(loaded) => CatalogState::Ready(loaded),
            Err(err) => CatalogState::Unavailable { reason: format!("{err:#}") },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    const CATALOG_JSON: &str = r#"[
        {
            "id": "2026_maintenance_window",
            "content": { "kind": "text", "value": "Scheduled maintenance this weekend." },
            "date_end": "2026-12-31T00:00:00Z"
        },
        {
            "id": "2026_new_docs",
            "content": { "kind": "markup", "value": "<a href=\"/docs\">New docs</a> are live." },
            "date_start": "2026-01-01T00:00:00Z",
            "date_end": "2027-06-30T00:00:00Z"
        }
    ]"#;

    fn write_temp_catalog(name: &str, body: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        let path = std::env::temp_dir().join(format!("site-notice-catalog-{name}-{now}.json"));
        fs::write(&path, body)
            .unwrap_or_else(|err| panic!("failed to write catalog fixture {}: {err}", path.display()));
        path
    }

    #[test]
    fn loads_and_fingerprints_a_catalog_file() {
        let path = write_temp_catalog("ok", CATALOG_JSON);

        let loaded = match load_catalog_file(&path) {
            Ok(loaded) => loaded,
            Err(err) => panic!("catalog should load: {err}"),
        };
        assert_eq!(loaded.catalog.len(), 2);
        assert_eq!(loaded.catalog.messages[0].id.as_str(), "2026_maintenance_window");
        assert_eq!(loaded.origin, path.display().to_string());

        // Same content, same deployed-version identity.
        let reloaded = match load_catalog_file(&path) {
            Ok(loaded) => loaded,
            Err(err) => panic!("catalog should reload: {err}"),
        };
        assert_eq!(loaded.fingerprint, reloaded.fingerprint);
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let path_a = write_temp_catalog("fp-a", CATALOG_JSON);
        let path_b = write_temp_catalog(
            "fp-b",
            &CATALOG_JSON.replace("Scheduled maintenance", "Emergency maintenance"),
        );

        let a = match load_catalog_file(&path_a) {
            Ok(loaded) => loaded,
            Err(err) => panic!("catalog should load: {err}"),
        };
        let b = match load_catalog_file(&path_b) {
            Ok(loaded) => loaded,
            Err(err) => panic!("catalog should load: {err}"),
        };
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn rejects_malformed_json() {
        let path = write_temp_catalog("broken", "[{");
        let err = match load_catalog_file(&path) {
            Ok(_) => panic!("malformed catalog should not load"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("failed to parse catalog file"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let duplicated = CATALOG_JSON.replace("2026_new_docs", "2026_maintenance_window");
        let path = write_temp_catalog("dup", &duplicated);
        let err = match load_catalog_file(&path) {
            Ok(_) => panic!("duplicate ids should not load"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("MUST be unique"));
    }

    #[test]
    fn source_prefers_file_over_url() {
        let path = write_temp_catalog("precedence", CATALOG_JSON);
        let source =
            CatalogSource::new(Some(path), Some("http://127.0.0.1:1/catalog.json".to_string()));

        match source.resolve() {
            CatalogState::Ready(loaded) => assert_eq!(loaded.catalog.len(), 2),
            CatalogState::Unavailable { reason } => {
                panic!("file-backed source should resolve: {reason}")
            }
        }
    }

    #[test]
    fn unconfigured_source_degrades_to_unavailable() {
        match CatalogSource::new(None, None).resolve() {
            CatalogState::Ready(_) => panic!("empty source should not resolve"),
            CatalogState::Unavailable { reason } => {
                assert!(reason.contains("no catalog source configured"));
            }
        }
    }

    #[test]
    fn unreadable_file_degrades_to_unavailable() {
        let missing = std::env::temp_dir().join("site-notice-catalog-definitely-missing.json");
        match CatalogSource::new(Some(missing), None).resolve() {
            CatalogState::Ready(_) => panic!("missing file should not resolve"),
            CatalogState::Unavailable { reason } => {
                assert!(reason.contains("failed to read catalog file"));
            }
        }
    }
}
