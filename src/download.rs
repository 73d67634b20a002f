//! Fetching model weights from the model hub.
//!
//! Run at build time, before the container image is assembled.

use crate::config::DownloadConfig;
use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Environment variables consulted for a hub token, in order.
pub const TOKEN_ENV: [&str; 2] = ["HUGGINGFACE_HUB_TOKEN", "HF_TOKEN"];

/// What [`download_model`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// A valid file was already present.
    AlreadyPresent { path: PathBuf, size: u64 },
    Downloaded { path: PathBuf, size: u64 },
}

/// Resolve the token from the CLI flag or the environment.
pub fn resolve_token(flag: Option<String>) -> Option<String> {
    flag.filter(|t| !t.trim().is_empty()).or_else(|| {
        TOKEN_ENV
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|t| !t.trim().is_empty())
    })
}

/// Hub URL of the configured weight file.
pub fn file_url(config: &DownloadConfig) -> String {
    format!(
        "{}/{}/resolve/{}/{}",
        config.hub_url.trim_end_matches('/'),
        config.repo_id,
        config.revision,
        config.filename
    )
}

/// Size of an existing file that passes the size threshold.
fn existing_size(path: &Path, min_size: u64) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .map(|m| m.len())
        .filter(|&size| size > min_size)
}

/// Download the configured weight file unless a valid copy already exists.
pub async fn download_model(
    config: &DownloadConfig,
    token: Option<&str>,
) -> Result<DownloadOutcome> {
    let path = config.model_dir.join(&config.filename);
    if let Some(size) = existing_size(&path, config.min_size_bytes) {
        return Ok(DownloadOutcome::AlreadyPresent { path, size });
    }

    tokio::fs::create_dir_all(&config.model_dir)
        .await
        .with_context(|| {
            format!("Failed to create model directory: {}", config.model_dir.display())
        })?;

    let url = file_url(config);
    println!("Downloading {} from {}...", config.filename, config.repo_id);

    let client = Client::new();
    let mut request = client.get(&url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to connect to {}", config.hub_url))?;

    match response.status() {
        status if status.is_success() => {}
        StatusCode::UNAUTHORIZED => {
            return Err(anyhow!(
                "Authentication failed. Set HUGGINGFACE_HUB_TOKEN to a token with 'Read' permissions \
                 (https://huggingface.co/settings/tokens)"
            ))
        }
        StatusCode::FORBIDDEN => {
            return Err(anyhow!(
                "Access denied. You may need to accept the model's license at https://huggingface.co/{}",
                config.repo_id
            ))
        }
        StatusCode::NOT_FOUND => {
            return Err(anyhow!(
                "Repository {} or file {} not found",
                config.repo_id,
                config.filename
            ))
        }
        status => {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Download failed: {} - {}", status, body));
        }
    }

    let total = response.content_length();
    let partial = path.with_extension("part");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("Failed to create {}", partial.display()))?;

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    let mut last_pct = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Download interrupted")?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if let Some(total) = total.filter(|&t| t > 0) {
            let pct = written * 100 / total;
            if last_pct != Some(pct) {
                print!(
                    "\rdownloading: {}% ({}/{})",
                    pct,
                    format_size(written),
                    format_size(total)
                );
                std::io::Write::flush(&mut std::io::stdout())?;
                last_pct = Some(pct);
            }
        }
    }
    file.flush().await?;
    drop(file);
    if last_pct.is_some() {
        println!();
    }

    if written <= config.min_size_bytes {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(anyhow!("Downloaded file seems too small: {} bytes", written));
    }

    tokio::fs::rename(&partial, &path)
        .await
        .with_context(|| format!("Failed to move download into place: {}", path.display()))?;

    Ok(DownloadOutcome::Downloaded { path, size: written })
}

/// Format bytes to human-readable size.
pub fn format_size(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;

    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockReply, MockServer};
    use tempfile::TempDir;

    fn config_for(server: &MockServer, dir: &TempDir) -> DownloadConfig {
        DownloadConfig {
            hub_url: server.base_url(),
            model_dir: dir.path().join("BitNet-b1.58-2B-4T"),
            min_size_bytes: 1024,
            ..DownloadConfig::default()
        }
    }

    #[test]
    fn test_file_url() {
        let config = DownloadConfig::default();
        assert_eq!(
            file_url(&config),
            "https://huggingface.co/microsoft/bitnet-b1.58-2B-4T-gguf/resolve/main/ggml-model-i2_s.gguf"
        );
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(750 * 1024 * 1024), "750.0MB");
        assert_eq!(format_size(2 * 1024 * 1024 * 1024), "2.0GB");
    }

    #[test]
    fn test_flag_token_wins() {
        assert_eq!(resolve_token(Some("hf_abc".into())), Some("hf_abc".to_string()));
    }

    #[tokio::test]
    async fn test_download_writes_file_with_token() {
        let server = MockServer::start(|_| MockReply::bytes(200, vec![7u8; 4096])).await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&server, &dir);

        let outcome = download_model(&config, Some("hf_secret")).await.unwrap();

        let path = config.model_dir.join(&config.filename);
        assert_eq!(outcome, DownloadOutcome::Downloaded { path: path.clone(), size: 4096 });
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        let request_path = "/microsoft/bitnet-b1.58-2B-4T-gguf/resolve/main/ggml-model-i2_s.gguf";
        assert_eq!(
            server.headers(request_path)[0].get("authorization").map(String::as_str),
            Some("Bearer hf_secret")
        );

        let again = download_model(&config, None).await.unwrap();
        assert!(matches!(again, DownloadOutcome::AlreadyPresent { size: 4096, .. }));
        assert_eq!(server.hits(request_path), 1);
    }

    #[tokio::test]
    async fn test_download_rejects_small_file() {
        let server = MockServer::start(|_| MockReply::bytes(200, vec![1u8; 10])).await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&server, &dir);

        let err = download_model(&config, None).await.unwrap_err();

        assert!(err.to_string().contains("too small"));
        assert!(!config.model_dir.join(&config.filename).exists());
    }

    #[tokio::test]
    async fn test_download_unauthorized() {
        let server = MockServer::start(|_| MockReply::json(401, "{}")).await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&server, &dir);

        let err = download_model(&config, None).await.unwrap_err();

        assert!(err.to_string().contains("Authentication failed"));
    }

    #[tokio::test]
    async fn test_download_gated_model() {
        let server = MockServer::start(|_| MockReply::json(403, "{}")).await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&server, &dir);

        let err = download_model(&config, None).await.unwrap_err();

        assert!(err.to_string().contains("accept the model's license"));
    }
}
