use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CloakError, CloakResult};

/// Largest plaintext chunk the frame format accepts (64 MiB).
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Default plaintext chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Top-level configuration (loaded from cloak.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloakConfig {
    pub engine: EngineConfig,
    pub kdf: KdfConfig,
    pub log: LogConfig,
}

/// Text encoding used for serialized ciphertext (encrypted names)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameEncoding {
    #[default]
    Base64,
    Hex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker thread count and fan-out bound (0 = cpu_count)
    pub max_threads: usize,
    /// Plaintext bytes per chunk frame
    pub chunk_size: usize,
    /// Encrypted metadata document path
    pub store_path: PathBuf,
    /// Where folders are staged before encryption (default: OS temp dir)
    pub scratch_dir: Option<PathBuf>,
    pub name_encoding: NameEncoding,
    /// Accept caller-supplied `extraProps` on registration
    pub allow_extra_props: bool,
    /// Optional per-chunk diagnostic log
    pub chunk_log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_threads: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            store_path: PathBuf::from("~/.local/share/cloak/store.db"),
            scratch_dir: None,
            name_encoding: NameEncoding::Base64,
            allow_extra_props: false,
            chunk_log: None,
        }
    }
}

impl EngineConfig {
    /// Resolve `max_threads = 0` to the number of available CPUs.
    pub fn effective_threads(&self) -> usize {
        if self.max_threads > 0 {
            return self.max_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn validate(&self) -> CloakResult<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(CloakError::Config(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {}",
                self.chunk_size
            )));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(CloakError::Config("store_path must not be empty".into()));
        }
        Ok(())
    }
}

/// Argon2id passphrase hashing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl CloakConfig {
    pub fn from_toml(text: &str) -> CloakResult<Self> {
        toml::from_str(text).map_err(|e| CloakError::Config(e.to_string()))
    }

    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> CloakResult<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found (using defaults)");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| CloakError::io(path, e))?;
        Self::from_toml(&text)
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
