//! Delivery of accepted files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::info;

/// Where an accepted file's payload goes. Only invoked after the receiver
/// explicitly accepts, never for unsolicited transfers.
pub trait OutputSink: Send {
    fn deliver(&mut self, name: &str, payload: &Bytes) -> io::Result<()>;
}

/// Writes accepted files into a directory, flattening any path components
/// the sender put into the name.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl OutputSink for DirectorySink {
    fn deliver(&mut self, name: &str, payload: &Bytes) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let file_name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_owned());
        let path = self.dir.join(file_name);
        std::fs::write(&path, payload)?;
        info!(bytes = payload.len(), path = %path.display(), "file delivered");
        Ok(())
    }
}

/// Collects accepted files in memory. Useful in tests and embedders that
/// hand the payload straight to a UI.
#[derive(Clone, Default)]
pub struct MemorySink {
    files: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<(String, Bytes)> {
        self.files.lock().clone()
    }
}

impl OutputSink for MemorySink {
    fn deliver(&mut self, name: &str, payload: &Bytes) -> io::Result<()> {
        self.files.lock().push((name.to_owned(), payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_sink_flattens_names() {
        let dir = std::env::temp_dir().join("dropsync_sink_test");
        let _ = std::fs::remove_dir_all(&dir);
        let mut sink = DirectorySink::new(&dir);
        sink.deliver("../../etc/evil.txt", &Bytes::from_static(b"x"))
            .unwrap();
        assert!(dir.join("evil.txt").exists());
        assert!(!dir.join("..").join("..").join("etc").join("evil.txt").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn memory_sink_collects() {
        let mut sink = MemorySink::new();
        sink.deliver("a.txt", &Bytes::from_static(b"hi")).unwrap();
        let files = sink.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "a.txt");
        assert_eq!(&files[0].1[..], b"hi");
    }
}
