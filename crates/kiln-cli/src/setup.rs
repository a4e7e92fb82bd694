//! Shared engine setup for CLI commands.

use std::path::Path;
use std::sync::Arc;

use kiln_core::{Engine, EngineConfig, JsonlRecordStore, KilnDirs, Language};

/// Load configuration from `--config`, `KILN_CONFIG` and the environment.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    Ok(EngineConfig::load(path)?)
}

/// Build an engine with the Docker backends. Records go to the state
/// directory so CLI runs show up in the server's metrics.
pub fn local_engine(config: EngineConfig) -> anyhow::Result<Engine> {
    let dirs = KilnDirs::from_state_dir(&config.state_dir)?;
    let records = Arc::new(JsonlRecordStore::new(dirs.records_file()));

    Ok(Engine::builder(config)
        .docker_backends(dirs.scratch_dir.clone())
        .record_store(records)
        .build())
}

/// Language for a source file: explicit flag first, then the extension.
///
/// An unknown extension is passed through as-is so the engine reports it as
/// an unsupported language.
pub fn language_for(path: &Path, explicit: Option<&str>) -> String {
    if let Some(language) = explicit {
        return language.to_string();
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match Language::from_extension(ext) {
        Some(language) => language.as_str().to_string(),
        None => ext.to_string(),
    }
}

/// Read a source file.
pub fn read_source(path: &Path) -> anyhow::Result<String> {
    if !path.exists() {
        anyhow::bail!("Source file not found: {}", path.display());
    }
    Ok(std::fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_for() {
        assert_eq!(language_for(Path::new("f.py"), None), "python");
        assert_eq!(language_for(Path::new("f.js"), None), "javascript");
        assert_eq!(language_for(Path::new("f.rb"), None), "rb");
        assert_eq!(language_for(Path::new("f.txt"), Some("python")), "python");
    }
}
