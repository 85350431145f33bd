use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::backend::StorageBackend;
use crate::config::StorageConfig;
use crate::error::StorageError;

/// Maps logical names onto the configured base location and public URL.
#[derive(Debug, Clone)]
pub struct PathResolver {
    location: PathBuf,
    base_url: Option<String>,
}

/// Lexically normalize a path: drop `.`, fold `..` into its parent.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl PathResolver {
    pub fn new(config: &StorageConfig) -> Self {
        let location = std::path::absolute(&config.location)
            .unwrap_or_else(|_| config.location.clone());
        Self {
            location: normalize(&location),
            base_url: config.base_url.clone(),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Absolute path of `name` under the base location.
    ///
    /// Pure and deterministic: no backend access. Fails when the normalized
    /// result leaves the base location.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        let joined = normalize(&self.location.join(name));
        if !joined.starts_with(&self.location) {
            return Err(StorageError::InvalidPath(format!(
                "{} is located outside of {}",
                name,
                self.location.display()
            )));
        }
        Ok(joined)
    }

    /// The `attempt`-th alternative for `name`: `dir/stem_{attempt}.ext`.
    pub fn candidate_name(name: &str, attempt: u32) -> String {
        let (dir, file) = match name.rfind('/') {
            Some(idx) => name.split_at(idx + 1),
            None => ("", name),
        };
        let (stem, ext) = match file.rfind('.') {
            Some(idx) if idx > 0 => file.split_at(idx),
            _ => (file, ""),
        };
        format!("{}{}_{}{}", dir, stem, attempt, ext)
    }

    /// First alternative of `name` the backend does not have.
    ///
    /// Every candidate is checked, so a name seen to exist is never returned.
    pub async fn available_name(
        &self,
        backend: &dyn StorageBackend,
        name: &str,
        max_attempts: u32,
    ) -> Result<String, StorageError> {
        for attempt in 1..=max_attempts {
            let candidate = Self::candidate_name(name, attempt);
            if !backend.exists(&self.resolve(&candidate)?).await? {
                debug!("Available name for {} is {}", name, candidate);
                return Ok(candidate);
            }
        }
        Err(StorageError::TooManyCollisions(format!(
            "no free name for {} after {} attempts",
            name, max_attempts
        )))
    }

    /// Public URL of a stored name.
    pub fn to_url(&self, name: &str) -> Result<String, StorageError> {
        let base_url = self.base_url.as_deref().ok_or_else(|| {
            StorageError::NotPubliclyAccessible(format!("{} is not accessible via a URL", name))
        })?;
        let name = name.replace('\\', "/");
        let encoded = name
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!("{}{}", base_url, encoded))
    }

    /// Filesystem-friendly form of a name: trimmed, spaces to `_`, anything
    /// but alphanumerics, `-`, `_` and `.` dropped.
    pub fn valid_name(name: &str) -> String {
        name.trim()
            .replace(' ', "_")
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
            .collect()
    }
}
