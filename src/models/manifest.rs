use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

use super::metadata::is_sha256_hex;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Config files that always live next to the tokenizer.
pub const AUXILIARY_FILES: [&str; 4] = [
    "config.json",
    "generation_config.json",
    "special_tokens_map.json",
    "tokenizer_config.json",
];

/// One model's deployable artifact set, as published next to the shards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sequence_len: Option<u32>,
    pub tokenizer_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onnx: Option<OnnxGraph>,
    #[serde(default)]
    pub shards: Vec<ShardEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardEntry {
    pub url: String,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Single-file optimized graph, optionally with its weights split out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnnxGraph {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

fn default_schema_version() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

impl Manifest {
    /// Parses and validates a manifest body.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let mut manifest: Manifest = serde_json::from_slice(bytes)?;
        manifest.normalize_digests();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Digests compare as lowercase hex; publishers sometimes emit uppercase.
    pub fn normalize_digests(&mut self) {
        for shard in &mut self.shards {
            shard.sha256 = shard.sha256.trim().to_ascii_lowercase();
        }
        if let Some(graph) = &mut self.onnx {
            for digest in [&mut graph.sha256, &mut graph.external_sha256]
                .into_iter()
                .flatten()
            {
                *digest = digest.trim().to_ascii_lowercase();
            }
        }
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.schema_version > MANIFEST_SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedSchema {
                found: self.schema_version,
                supported: MANIFEST_SCHEMA_VERSION,
            });
        }
        if self.model_id.trim().is_empty() {
            return Err(ManifestError::MissingField("model_id"));
        }
        if self.tokenizer_url.trim().is_empty() {
            return Err(ManifestError::MissingField("tokenizer_url"));
        }
        if parent_of(&self.tokenizer_url).is_none() {
            return Err(ManifestError::TokenizerWithoutParent(
                self.tokenizer_url.clone(),
            ));
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if shard.url.trim().is_empty() {
                return Err(ManifestError::MissingField("shards[].url"));
            }
            if !is_sha256_hex(&shard.sha256) {
                return Err(ManifestError::InvalidDigest {
                    url: shard.url.clone(),
                    digest: shard.sha256.clone(),
                });
            }
            if !seen.insert(shard.url.as_str()) {
                return Err(ManifestError::DuplicateShard(shard.url.clone()));
            }
        }

        if let Some(graph) = &self.onnx {
            if graph.model.trim().is_empty() {
                return Err(ManifestError::MissingField("onnx.model"));
            }
        }
        Ok(())
    }

    /// Tokenizer first, then the fixed config files from the same directory.
    #[must_use]
    pub fn auxiliary_urls(&self) -> Vec<String> {
        let mut urls = vec![self.tokenizer_url.clone()];
        if let Some(base) = parent_of(&self.tokenizer_url) {
            urls.extend(AUXILIARY_FILES.iter().map(|name| format!("{base}{name}")));
        }
        urls
    }

    #[must_use]
    pub fn has_graph(&self) -> bool {
        self.onnx.is_some()
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.model_id)
    }
}

/// Directory part of a URL including the trailing slash, query and fragment dropped.
#[must_use]
pub fn parent_of(url: &str) -> Option<&str> {
    let path = strip_query(url);
    let (dir, file) = path.rsplit_once('/')?;
    if file.is_empty() || dir.is_empty() || dir.ends_with(':') || dir.ends_with(":/") {
        return None;
    }
    Some(&path[..dir.len() + 1])
}

#[must_use]
pub fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn sample_json() -> String {
        format!(
            r#"{{
                "model_id": "phi-3-mini-4k-instruct",
                "display_name": "Phi-3 Mini 4K Instruct (INT4)",
                "version": "2025-07-23",
                "license": "mit",
                "max_sequence_len": 4096,
                "tokenizer_url": "https://cdn.example/phi/tokenizer.json",
                "tokenizer_config": "ignored.json",
                "shards": [
                    {{ "url": "https://cdn.example/phi/model-00001.safetensors", "sha256": "{DIGEST}" }}
                ]
            }}"#
        )
    }

    #[test]
    fn parses_generator_output_and_ignores_unknown_fields() {
        let manifest = Manifest::from_json(sample_json().as_bytes()).unwrap();
        assert_eq!(manifest.schema_version, MANIFEST_SCHEMA_VERSION);
        assert_eq!(manifest.model_id, "phi-3-mini-4k-instruct");
        assert_eq!(manifest.max_sequence_len, Some(4096));
        assert_eq!(manifest.shards.len(), 1);
        assert!(!manifest.has_graph());
        assert_eq!(manifest.label(), "Phi-3 Mini 4K Instruct (INT4)");
    }

    #[test]
    fn auxiliary_files_share_the_tokenizer_directory() {
        let manifest = Manifest::from_json(sample_json().as_bytes()).unwrap();
        assert_eq!(
            manifest.auxiliary_urls(),
            vec![
                "https://cdn.example/phi/tokenizer.json",
                "https://cdn.example/phi/config.json",
                "https://cdn.example/phi/generation_config.json",
                "https://cdn.example/phi/special_tokens_map.json",
                "https://cdn.example/phi/tokenizer_config.json",
            ]
        );
    }

    #[test]
    fn parent_drops_query_and_requires_a_filename() {
        assert_eq!(
            parent_of("https://cdn.example/a/tokenizer.json?sig=1"),
            Some("https://cdn.example/a/")
        );
        assert_eq!(parent_of("https://cdn.example/a/"), None);
        assert_eq!(parent_of("tokenizer.json"), None);
        assert_eq!(parent_of("https://tokenizer.json"), None);
    }

    #[test]
    fn rejects_newer_schema() {
        let json = sample_json().replacen('{', r#"{ "schema_version": 9,"#, 1);
        let error = Manifest::from_json(json.as_bytes()).unwrap_err();
        assert!(matches!(
            error,
            ManifestError::UnsupportedSchema { found: 9, .. }
        ));
    }

    #[test]
    fn rejects_malformed_digest_and_duplicate_shards() {
        let mut manifest = Manifest::from_json(sample_json().as_bytes()).unwrap();
        manifest.shards[0].sha256 = "a1".into();
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::InvalidDigest { .. })
        ));

        manifest.shards[0].sha256 = DIGEST.into();
        let duplicate = manifest.shards[0].clone();
        manifest.shards.push(duplicate);
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::DuplicateShard(_))
        ));
    }

    #[test]
    fn rejects_missing_model_id() {
        let mut manifest = Manifest::from_json(sample_json().as_bytes()).unwrap();
        manifest.model_id = " ".into();
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::MissingField("model_id"))
        ));
    }

    #[test]
    fn uppercase_digests_are_lowercased_on_load() {
        let json = sample_json().replace(DIGEST, &DIGEST.to_uppercase());
        let manifest = Manifest::from_json(json.as_bytes()).unwrap();
        assert_eq!(manifest.shards[0].sha256, DIGEST);
    }

    #[test]
    fn graph_digests_are_normalized_too() {
        let mut manifest = Manifest::from_json(sample_json().as_bytes()).unwrap();
        manifest.onnx = Some(OnnxGraph {
            model: "https://cdn.example/phi/onnx/model.onnx".into(),
            external_data: Some("https://cdn.example/phi/onnx/model.onnx_data".into()),
            sha256: Some(format!(" {} ", DIGEST.to_uppercase())),
            external_sha256: Some(DIGEST.to_uppercase()),
            quantization: None,
            size: None,
        });
        manifest.normalize_digests();
        let graph = manifest.onnx.unwrap();
        assert_eq!(graph.sha256.as_deref(), Some(DIGEST));
        assert_eq!(graph.external_sha256.as_deref(), Some(DIGEST));
    }
}
