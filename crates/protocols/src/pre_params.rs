//! Pre-computed Parameters Management
//!
//! Engines may need expensive per-process material before a session can
//! start. It is loaded from disk when a file exists, otherwise generated once
//! on a blocking thread and saved for the next start. Concurrent sessions
//! share one generation attempt.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{EventType, LogEvent, PartyId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::encoding::{base64_bytes, unix_secs};
use crate::engine::EngineFactory;

#[derive(Debug, Error)]
pub enum PreParamsError {
    #[error("pre-params not available within {0:?}")]
    Timeout(Duration),

    #[error("pre-params generation failed: {0}")]
    Generation(String),

    #[error("pre-params file error: {0}")]
    Io(String),

    #[error("pre-params file is corrupt: {0}")]
    Corrupt(String),
}

/// Opaque pre-params material shared by all sessions of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreParams(Arc<Vec<u8>>);

impl PreParams {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// On-disk form of the pre-params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPreParams {
    /// Version for future compatibility
    pub version: u32,
    /// Party this was generated for
    pub party: PartyId,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Timestamp when generated (Unix seconds)
    pub generated_at: u64,
}

impl StoredPreParams {
    pub const CURRENT_VERSION: u32 = 1;
}

/// Load pre-params from disk.
pub fn load_pre_params(path: &Path) -> Result<StoredPreParams, PreParamsError> {
    info!("Loading pre-params from {:?}", path);

    let data = fs::read_to_string(path)
        .map_err(|e| PreParamsError::Io(format!("Failed to read pre-params file: {}", e)))?;

    let stored: StoredPreParams = serde_json::from_str(&data)
        .map_err(|e| PreParamsError::Corrupt(format!("Failed to parse pre-params file: {}", e)))?;

    if stored.version != StoredPreParams::CURRENT_VERSION {
        warn!(
            "Pre-params file version mismatch: got {}, expected {}",
            stored.version,
            StoredPreParams::CURRENT_VERSION
        );
    }

    info!(
        "Loaded pre-params for party {} ({} bytes, generated at {})",
        stored.party.short(),
        stored.data.len(),
        stored.generated_at
    );

    Ok(stored)
}

/// Save pre-params to disk.
pub fn save_pre_params(path: &Path, stored: &StoredPreParams) -> Result<(), PreParamsError> {
    info!("Saving pre-params to {:?}", path);

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PreParamsError::Io(format!("Failed to create directory: {}", e)))?;
    }

    let data = serde_json::to_string_pretty(stored)
        .map_err(|e| PreParamsError::Io(format!("Failed to serialize pre-params: {}", e)))?;

    fs::write(path, &data)
        .map_err(|e| PreParamsError::Io(format!("Failed to write pre-params file: {}", e)))?;

    info!("Pre-params saved successfully ({} bytes)", data.len());
    Ok(())
}

/// Process-wide pre-params cache.
pub struct PreParamsProvider {
    party: PartyId,
    path: Option<PathBuf>,
    engines: Arc<dyn EngineFactory>,
    /// Bound on a single generation attempt.
    generation_timeout: Duration,
    cell: OnceCell<PreParams>,
}

impl PreParamsProvider {
    pub fn new(
        party: PartyId,
        path: Option<PathBuf>,
        engines: Arc<dyn EngineFactory>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            party,
            path,
            engines,
            generation_timeout,
            cell: OnceCell::new(),
        }
    }

    /// Provider that already holds its material.
    pub fn ready(party: PartyId, engines: Arc<dyn EngineFactory>, bytes: Vec<u8>) -> Self {
        Self {
            party,
            path: None,
            engines,
            generation_timeout: Duration::ZERO,
            cell: OnceCell::new_with(Some(PreParams::new(bytes))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }

    /// Get the pre-params, loading or generating them on first use.
    ///
    /// A failed attempt leaves the cache empty so a later call retries.
    pub async fn get(&self) -> Result<PreParams, PreParamsError> {
        self.cell
            .get_or_try_init(|| self.initialize())
            .await
            .cloned()
    }

    async fn initialize(&self) -> Result<PreParams, PreParamsError> {
        if let Some(path) = &self.path {
            if path.exists() {
                match load_pre_params(path) {
                    Ok(stored) if stored.party == self.party && !stored.data.is_empty() => {
                        LogEvent::new(EventType::PreParamsReady)
                            .with_party(self.party.as_str())
                            .with_context("source", "file")
                            .emit();
                        return Ok(PreParams::new(stored.data));
                    }
                    Ok(stored) => {
                        warn!(
                            "Pre-params file belongs to party {}, regenerating",
                            stored.party.short()
                        );
                    }
                    Err(e) => warn!("Failed to load existing pre-params: {}", e),
                }
            } else {
                info!("No existing pre-params file found");
            }
        }

        let bytes = self.generate().await?;

        if let Some(path) = &self.path {
            let stored = StoredPreParams {
                version: StoredPreParams::CURRENT_VERSION,
                party: self.party.clone(),
                data: bytes.clone(),
                generated_at: unix_secs(),
            };
            if let Err(e) = save_pre_params(path, &stored) {
                // We still have them in memory
                error!("Failed to save pre-params to disk: {}", e);
            }
        }

        Ok(PreParams::new(bytes))
    }

    async fn generate(&self) -> Result<Vec<u8>, PreParamsError> {
        info!("========================================");
        info!("  GENERATING PRE-PARAMS");
        info!("========================================");

        let start = Instant::now();
        let engines = Arc::clone(&self.engines);
        let task = tokio::task::spawn_blocking(move || engines.generate_pre_params());

        let result = match tokio::time::timeout(self.generation_timeout, task).await {
            Err(_) => Err(PreParamsError::Timeout(self.generation_timeout)),
            Ok(Err(join)) => Err(PreParamsError::Generation(join.to_string())),
            Ok(Ok(Err(e))) => Err(PreParamsError::Generation(e.to_string())),
            Ok(Ok(Ok(bytes))) => Ok(bytes),
        };

        match &result {
            Ok(bytes) => {
                info!(
                    "Pre-params generated in {:.2}s ({} bytes)",
                    start.elapsed().as_secs_f64(),
                    bytes.len()
                );
                LogEvent::new(EventType::PreParamsReady)
                    .with_party(self.party.as_str())
                    .with_context("source", "generated")
                    .with_duration(start.elapsed())
                    .emit();
            }
            Err(e) => {
                LogEvent::new(EventType::PreParamsFailed)
                    .with_party(self.party.as_str())
                    .with_error(e.to_string())
                    .emit();
            }
        }
        result
    }

    /// Start loading in the background so the first session does not wait.
    pub fn spawn_warm_up(self: &Arc<Self>) -> JoinHandle<()> {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = provider.get().await {
                warn!("Pre-params warm-up failed: {}", e);
            }
        })
    }
}
