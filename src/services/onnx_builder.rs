// Shared ONNX Runtime session construction and pooling for every model adapter

use anyhow::{Context, Result};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

/// Intra-op threads per session.
///
/// Sessions are pooled and requests run on their own blocking workers, so each
/// session gets a share of the cores rather than all of them.
fn intra_op_threads(pool_size: usize) -> usize {
    let total_cores = num_cpus::get();
    let per_session = (total_cores / pool_size.max(1)).max(1);

    #[cfg(target_os = "windows")]
    let per_session = std::cmp::min(6, per_session);

    debug!("CPU threads: {} total cores, {} per session", total_cores, per_session);
    per_session
}

/// Build one session, trying the compiled-in accelerators before falling back to CPU.
///
/// Returns (backend_name, Session).
pub fn build_session_with_acceleration(
    model_bytes: &[u8],
    model_name: &str,
    threads: usize,
) -> Result<(String, Session)> {
    #[cfg(feature = "tensorrt")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([TensorRTExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("✓ Using TensorRT acceleration for {}", model_name);
            return Ok(("TensorRT".to_string(), session));
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CUDAExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("✓ Using CUDA acceleration for {}", model_name);
            return Ok(("CUDA".to_string(), session));
        }
    }

    let session = Session::builder()
        .context(format!("Failed to create ONNX session builder for {}", model_name))?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .context(format!("Failed to configure CPU execution provider for {}", model_name))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context(format!("Failed to set graph optimization level for {}", model_name))?
        .with_intra_threads(threads)
        .context(format!("Failed to configure intra-op threads for {}", model_name))?
        .with_inter_threads(1)
        .context(format!("Failed to configure inter-op threads for {}", model_name))?
        .commit_from_memory(model_bytes)
        .context(format!(
            "Failed to load {} ONNX model ({:.1} MB). Check that the file is a valid ONNX export \
            and matches the ONNX Runtime opset",
            model_name,
            model_bytes.len() as f64 / 1_048_576.0
        ))?;

    if cfg!(any(feature = "cuda", feature = "tensorrt")) {
        warn!("⚠️  GPU provider unavailable, using CPU inference for {}", model_name);
    }
    Ok(("CPU".to_string(), session))
}

/// Blocking pool of sessions for one model.
///
/// `acquire` parks the calling worker until a session is free; the returned
/// guard hands the session back on drop.
pub struct SessionPool {
    name: String,
    backend: String,
    sessions: Mutex<VecDeque<Session>>,
    available: Condvar,
}

impl SessionPool {
    /// Read the model from disk and build `size` sessions.
    pub fn from_file(path: &Path, model_name: &str, size: usize) -> Result<Self> {
        let model_bytes = std::fs::read(path)
            .with_context(|| format!("Failed to load {} model from {}", model_name, path.display()))?;
        info!(
            "Loading {} model from {} ({:.1} MB)",
            model_name,
            path.display(),
            model_bytes.len() as f64 / 1_048_576.0
        );
        Self::from_bytes(&model_bytes, model_name, size)
    }

    pub fn from_bytes(model_bytes: &[u8], model_name: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let threads = intra_op_threads(size);
        let mut sessions = VecDeque::with_capacity(size);
        let mut backend = String::new();

        for i in 0..size {
            debug!("Creating {} session {} of {}", model_name, i + 1, size);
            let (device, session) = build_session_with_acceleration(model_bytes, model_name, threads)?;
            backend = device;
            sessions.push_back(session);
        }

        info!("✓ {}: {} ({} sessions)", model_name, backend, size);

        Ok(Self {
            name: model_name.to_string(),
            backend,
            sessions: Mutex::new(sessions),
            available: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Custom metadata entry embedded in the model file by its exporter.
    pub fn metadata_entry(&self, key: &str) -> Result<Option<String>> {
        let session = self.acquire();
        let metadata = session
            .metadata()
            .with_context(|| format!("Failed to read {} model metadata", self.name))?;
        Ok(metadata.custom(key)?)
    }

    /// Block until a session is free.
    pub fn acquire(&self) -> PooledSession<'_> {
        let mut sessions = self.sessions.lock();
        loop {
            if let Some(session) = sessions.pop_front() {
                return PooledSession {
                    pool: self,
                    session: Some(session),
                };
            }
            self.available.wait(&mut sessions);
        }
    }

    fn release(&self, session: Session) {
        self.sessions.lock().push_back(session);
        self.available.notify_one();
    }
}

/// Session checked out of a [`SessionPool`].
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Option<Session>,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        // Only taken in Drop
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}
