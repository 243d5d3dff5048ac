//! Named text resources (shader sources) from disk or the binary.

use crate::error::EngineError;
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const RESOURCE_PATH_ENV: &str = "AFTERGLOW_RESOURCE_PATH";

const EMBEDDED: &[(&str, &str)] = &[
    ("fft.wgsl", include_str!("../backend/shaders/fft.wgsl")),
    ("display.wgsl", include_str!("../backend/shaders/display.wgsl")),
    ("sdf.wgsl", include_str!("../render/shaders/sdf.wgsl")),
    ("spectrum.wgsl", include_str!("../render/shaders/spectrum.wgsl")),
    ("cmap_bicubic.wgsl", include_str!("../render/shaders/cmap_bicubic.wgsl")),
    ("cmap_simple.wgsl", include_str!("../render/shaders/cmap_simple.wgsl")),
];

/// Looks a name up in each search directory in order, then in the embedded table.
#[derive(Debug, Clone)]
pub struct ResourceLoader {
    search: Vec<PathBuf>,
    embedded: bool,
}

impl Default for ResourceLoader {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ResourceLoader {
    /// Working directory, then `AFTERGLOW_RESOURCE_PATH`, then embedded sources.
    pub fn from_env() -> Self {
        let mut search = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            search.push(cwd);
        }
        if let Some(dir) = std::env::var_os(RESOURCE_PATH_ENV) {
            search.push(PathBuf::from(dir));
        }
        Self {
            search,
            embedded: true,
        }
    }

    pub fn embedded_only() -> Self {
        Self {
            search: Vec::new(),
            embedded: true,
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search.push(dir.into());
        self
    }

    pub fn without_embedded(mut self) -> Self {
        self.embedded = false;
        self
    }

    pub fn get(&self, name: &str) -> Result<Cow<'static, [u8]>, EngineError> {
        if name.is_empty() || Path::new(name).components().count() != 1 {
            return Err(EngineError::ResourceMissing(name.to_string()));
        }
        for dir in &self.search {
            let path = dir.join(name);
            if let Ok(bytes) = fs::read(&path) {
                debug!("[resource] {name} from {}", path.display());
                return Ok(Cow::Owned(bytes));
            }
        }
        if self.embedded
            && let Some((_, source)) = EMBEDDED.iter().find(|(key, _)| *key == name)
        {
            return Ok(Cow::Borrowed(source.as_bytes()));
        }
        Err(EngineError::ResourceMissing(name.to_string()))
    }

    pub fn get_text(&self, name: &str) -> Result<String, EngineError> {
        let bytes = self.get(name)?;
        String::from_utf8(bytes.into_owned())
            .map_err(|_| EngineError::ResourceMissing(format!("{name} (not UTF-8)")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_sources_resolve() {
        let loader = ResourceLoader::embedded_only();
        for (name, _) in EMBEDDED {
            assert!(!loader.get_text(name).unwrap().is_empty(), "{name}");
        }
    }

    #[test]
    fn directory_overrides_embedded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fft.wgsl"), "// local").unwrap();
        let loader = ResourceLoader::embedded_only().with_dir(dir.path());
        assert_eq!(loader.get_text("fft.wgsl").unwrap(), "// local");
        assert!(loader.get_text("display.wgsl").unwrap().contains("fn display"));
    }

    #[test]
    fn missing_resource_is_reported() {
        let loader = ResourceLoader::embedded_only().without_embedded();
        assert_eq!(
            loader.get("fft.wgsl").unwrap_err(),
            EngineError::ResourceMissing("fft.wgsl".into())
        );
        assert!(ResourceLoader::embedded_only().get("../fft.wgsl").is_err());
        assert!(ResourceLoader::embedded_only().get("nope.wgsl").is_err());
    }
}
