//! Loading module bytes from a plugin's source location

use anyhow::{bail, Context};
use proxy_wasm_api::WasmSource;

/// Fetches the raw bytes of a module
pub trait BytesLoader: Send + Sync {
    fn load(&self, source: WasmSource<'_>) -> anyhow::Result<Vec<u8>>;
}

/// Reads path sources from the local filesystem
///
/// URL sources are rejected; fetching remote modules is the embedder's job.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl BytesLoader for FileLoader {
    fn load(&self, source: WasmSource<'_>) -> anyhow::Result<Vec<u8>> {
        match source {
            WasmSource::Path(path) => {
                std::fs::read(path).with_context(|| format!("Failed to read file {}", path))
            }
            WasmSource::Url(url) => bail!("url sources are not supported: {}", url),
        }
    }
}
