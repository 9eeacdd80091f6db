//! Dynamic tool server installation.
//!
//! `install` takes a source, either a git URL or a local path, materializes it
//! under the install root, installs its dependencies per project type, and
//! registers it with the registry. Static registration at startup covers
//! the common case; this is the runtime extension path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ToolError;
use crate::orchestrator::project::{detect_project_type, install_commands};
use crate::orchestrator::registry::ToolRegistry;

/// Where a server source comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// `https://` or `git@` URL to clone.
    Git(String),
    /// Existing local directory, used in place.
    LocalPath(PathBuf),
}

impl InstallSource {
    /// Classify a raw source string.
    pub fn parse(raw: &str) -> Result<Self, ToolError> {
        if raw.starts_with("git@") {
            return Ok(InstallSource::Git(raw.to_string()));
        }
        if let Ok(url) = url::Url::parse(raw) {
            return match url.scheme() {
                "https" => Ok(InstallSource::Git(raw.to_string())),
                "file" => Ok(InstallSource::LocalPath(PathBuf::from(url.path()))),
                scheme => Err(ToolError::InstallFailed {
                    source_ref: raw.to_string(),
                    reason: format!("unsupported scheme '{scheme}' (https, git@, or a local path)"),
                }),
            };
        }
        Ok(InstallSource::LocalPath(PathBuf::from(raw)))
    }

    /// Server id derived from the source name.
    pub fn server_id(&self) -> Option<String> {
        let stem = match self {
            InstallSource::Git(url) => url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .map(|s| s.trim_end_matches(".git").to_string()),
            InstallSource::LocalPath(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string()),
        };
        stem.filter(|s| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
    }
}

/// Install a server source and register it. Returns the new server id.
pub async fn install(
    registry: &Arc<ToolRegistry>,
    install_root: &Path,
    source: &str,
) -> Result<String, ToolError> {
    let parsed = InstallSource::parse(source)?;
    let server_id = parsed
        .server_id()
        .ok_or_else(|| ToolError::InstallFailed {
            source_ref: source.to_string(),
            reason: "cannot derive a server id from the source name".to_string(),
        })?;

    let dir = match &parsed {
        InstallSource::LocalPath(path) => {
            if !path.is_dir() {
                return Err(ToolError::InstallFailed {
                    source_ref: source.to_string(),
                    reason: "local path does not exist".to_string(),
                });
            }
            path.clone()
        }
        InstallSource::Git(url) => {
            let target = install_root.join(&server_id);
            if target.exists() {
                return Err(ToolError::InstallFailed {
                    source_ref: source.to_string(),
                    reason: format!("install target '{}' already exists", target.display()),
                });
            }
            tokio::fs::create_dir_all(install_root)
                .await
                .map_err(|e| ToolError::InstallFailed {
                    source_ref: source.to_string(),
                    reason: e.to_string(),
                })?;
            run_step(
                source,
                install_root,
                &["git", "clone", "--depth", "1", url, &server_id],
            )
            .await?;
            target
        }
    };

    let project_type = detect_project_type(&dir)?;
    for command in install_commands(project_type) {
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        run_step(source, &dir, &args).await?;
    }

    registry.register_from_dir(&dir, Some(server_id.clone())).await?;
    Ok(server_id)
}

async fn run_step(source: &str, dir: &Path, command: &[&str]) -> Result<(), ToolError> {
    let Some((program, args)) = command.split_first() else {
        return Err(ToolError::InstallFailed {
            source_ref: source.to_string(),
            reason: "empty install command".to_string(),
        });
    };
    tracing::info!("install step: {} (in {})", command.join(" "), dir.display());

    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| ToolError::InstallFailed {
            source_ref: source.to_string(),
            reason: format!("{program}: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::InstallFailed {
            source_ref: source.to_string(),
            reason: format!(
                "'{}' exited with {}: {}",
                command.join(" "),
                output.status,
                stderr.chars().take(500).collect::<String>()
            ),
        });
    }
    Ok(())
}
