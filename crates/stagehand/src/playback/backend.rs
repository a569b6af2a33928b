//! The media backend capability seam.
//!
//! A backend opens one instance per (asset, output) pair; the playback
//! channel owns the instance exclusively and drives its whole lifecycle.
//! The stub backend records every call so tests can assert lifecycle
//! ordering and exclusivity without any media stack installed.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{OutputDevice, PlaybackError};

#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn open(
        &self,
        asset_path: &Path,
        output: &OutputDevice,
    ) -> Result<Box<dyn BackendInstance>, PlaybackError>;
}

#[async_trait]
pub trait BackendInstance: Send {
    async fn play(&mut self) -> Result<(), PlaybackError>;
    async fn stop(&mut self) -> Result<(), PlaybackError>;
    async fn pause(&mut self) -> Result<(), PlaybackError>;
    async fn resume(&mut self) -> Result<(), PlaybackError>;
    async fn seek(&mut self, position_ms: u64) -> Result<(), PlaybackError>;
    async fn set_volume(&mut self, volume: f64) -> Result<(), PlaybackError>;
    async fn set_loop(&mut self, looped: bool) -> Result<(), PlaybackError>;
    async fn close(&mut self) -> Result<(), PlaybackError>;
}

/// Lifecycle counters shared by a stub backend and its instances.
#[derive(Default)]
pub struct StubStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    max_live: AtomicUsize,
    operations: Mutex<Vec<String>>,
    volumes: Mutex<Vec<f64>>,
}

impl StubStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.opened() - self.closed()
    }

    /// High-water mark of simultaneously live instances.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    pub fn volume_calls(&self) -> usize {
        self.volumes.lock().unwrap().len()
    }

    pub fn first_volume(&self) -> f64 {
        self.volumes.lock().unwrap().first().copied().unwrap_or(-1.0)
    }

    pub fn last_volume(&self) -> f64 {
        self.volumes.lock().unwrap().last().copied().unwrap_or(-1.0)
    }

    fn record(&self, operation: String) {
        self.operations.lock().unwrap().push(operation);
    }

    fn note_open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.opened() - self.closed();
        self.max_live.fetch_max(live, Ordering::SeqCst);
    }
}

/// In-memory backend used by tests and as the default when no media stack
/// is configured.
#[derive(Default)]
pub struct StubBackend {
    stats: Arc<StubStats>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<StubStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl MediaBackend for StubBackend {
    async fn open(
        &self,
        asset_path: &Path,
        output: &OutputDevice,
    ) -> Result<Box<dyn BackendInstance>, PlaybackError> {
        self.stats.note_open();
        self.stats.record(format!(
            "open({}, {})",
            asset_path.file_name().and_then(|n| n.to_str()).unwrap_or("?"),
            output.id
        ));
        Ok(Box::new(StubInstance {
            stats: self.stats.clone(),
            closed: false,
        }))
    }
}

struct StubInstance {
    stats: Arc<StubStats>,
    closed: bool,
}

#[async_trait]
impl BackendInstance for StubInstance {
    async fn play(&mut self) -> Result<(), PlaybackError> {
        self.stats.record("play".to_string());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PlaybackError> {
        self.stats.record("stop".to_string());
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), PlaybackError> {
        self.stats.record("pause".to_string());
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), PlaybackError> {
        self.stats.record("resume".to_string());
        Ok(())
    }

    async fn seek(&mut self, position_ms: u64) -> Result<(), PlaybackError> {
        self.stats.record(format!("seek({})", position_ms));
        Ok(())
    }

    async fn set_volume(&mut self, volume: f64) -> Result<(), PlaybackError> {
        self.stats.record(format!("set_volume({})", volume));
        self.stats.volumes.lock().unwrap().push(volume);
        Ok(())
    }

    async fn set_loop(&mut self, looped: bool) -> Result<(), PlaybackError> {
        self.stats.record(format!("set_loop({})", looped));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PlaybackError> {
        if !self.closed {
            self.closed = true;
            self.stats.record("close".to_string());
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for StubInstance {
    fn drop(&mut self) {
        // Leaked instances count as closed so live() reflects reality.
        if !self.closed {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
