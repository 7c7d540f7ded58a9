/// Registry backed by a package catalog compiled into the binary
///
/// Search is plain case-insensitive term matching: a term found in a
/// package name counts twice, a term found in its description once.

use async_trait::async_trait;

use crate::registry::{IntegrationManifest, IntegrationSearchResult, RegistryClient, RegistryError};

const CATALOG: &str = include_str!("packages.json");

/// In-memory registry over the bundled package list
pub struct BundledRegistry {
    packages: Vec<IntegrationManifest>,
}

impl BundledRegistry {
    /// Load the catalog shipped with the binary
    pub fn new() -> Result<Self, RegistryError> {
        Self::from_json(CATALOG)
    }

    /// Load a catalog from a JSON array of manifests
    ///
    /// Manifests without an id get `name@version`.
    pub fn from_json(raw: &str) -> Result<Self, RegistryError> {
        let mut packages: Vec<IntegrationManifest> = serde_json::from_str(raw)?;
        for package in &mut packages {
            if package.id.is_empty() {
                package.id = format!("{}@{}", package.name, package.version);
            }
        }

        tracing::debug!("Loaded {} registry packages", packages.len());
        Ok(Self { packages })
    }

    pub fn packages(&self) -> &[IntegrationManifest] {
        &self.packages
    }

    fn score(package: &IntegrationManifest, terms: &[String]) -> usize {
        let name = package.name.to_lowercase();
        let description = package.description.to_lowercase();

        terms
            .iter()
            .map(|term| {
                let mut hits = 0;
                if name.contains(term.as_str()) {
                    hits += 2;
                }
                if description.contains(term.as_str()) {
                    hits += 1;
                }
                hits
            })
            .sum()
    }
}

/// Lowercase the query and split it into individual words
fn normalize_terms(terms: &[String]) -> Vec<String> {
    terms
        .iter()
        .flat_map(|term| term.split_whitespace())
        .map(|term| term.to_lowercase())
        .collect()
}

#[async_trait]
impl RegistryClient for BundledRegistry {
    async fn manifest(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<IntegrationManifest, RegistryError> {
        self.packages
            .iter()
            .find(|p| p.name == name && version.map_or(true, |v| p.version == v))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
                version: version.map(str::to_string),
            })
    }

    async fn search(&self, terms: &[String]) -> Result<Vec<IntegrationSearchResult>, RegistryError> {
        let terms = normalize_terms(terms);

        let mut hits: Vec<(usize, &IntegrationManifest)> = if terms.is_empty() {
            self.packages.iter().map(|p| (0, p)).collect()
        } else {
            self.packages
                .iter()
                .map(|p| (Self::score(p, &terms), p))
                .filter(|(score, _)| *score > 0)
                .collect()
        };

        hits.sort_by(|(a_score, a), (b_score, b)| {
            b_score.cmp(a_score).then_with(|| a.name.cmp(&b.name))
        });

        Ok(hits.into_iter().map(|(_, p)| p.into()).collect())
    }
}
