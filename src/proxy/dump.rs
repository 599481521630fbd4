//! Diagnostic dumps of intercepted payloads
//!
//! Raw bodies are written to `<dir>/<name>-<timestamp>.json` off the response
//! path. Failures are logged and never reach the client.

use crate::proxy::types::DumpName;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct DiagnosticDump {
    dir: PathBuf,
    enabled: HashSet<String>,
}

impl DiagnosticDump {
    /// `enabled` holds the names whose `application.dump.<name>` flag is set
    pub fn new(dir: impl Into<PathBuf>, enabled: impl IntoIterator<Item = String>) -> Self {
        Self {
            dir: dir.into(),
            enabled: enabled.into_iter().collect(),
        }
    }

    /// Dump nothing
    pub fn disabled() -> Self {
        Self::new(PathBuf::new(), std::iter::empty())
    }

    pub fn is_enabled(&self, name: &DumpName) -> bool {
        self.enabled.contains(name.as_str())
    }

    pub fn file_name(name: &DumpName, at: DateTime<Utc>) -> String {
        format!("{name}-{}.json", at.format("%Y%m%dT%H%M%S%.9fZ"))
    }

    /// Write `raw` in the background when dumping is enabled for `name`
    ///
    /// Returns the write task so callers that care (tests) can await it.
    pub fn dump(&self, name: &DumpName, raw: Bytes) -> Option<JoinHandle<()>> {
        if !self.is_enabled(name) {
            return None;
        }

        let path = self.dir.join(Self::file_name(name, Utc::now()));
        let dir = self.dir.clone();
        Some(tokio::spawn(async move {
            let result = async {
                tokio::fs::create_dir_all(&dir).await?;
                tokio::fs::write(&path, &raw).await
            }
            .await;

            match result {
                Ok(()) => debug!(path = %path.display(), bytes = raw.len(), "Wrote dump"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write dump"),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn name() -> DumpName {
        DumpName::try_new("get_battle_init_data").unwrap()
    }

    #[test]
    fn test_file_name_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            DiagnosticDump::file_name(&name(), at),
            "get_battle_init_data-20240301T123005.000000000Z.json"
        );
    }

    #[tokio::test]
    async fn test_disabled_name_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dump = DiagnosticDump::new(dir.path(), vec!["get_party".to_string()]);

        assert!(dump.dump(&name(), Bytes::from_static(b"{}")).is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_enabled_name_writes_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dump");
        let dump = DiagnosticDump::new(&target, vec!["get_battle_init_data".to_string()]);

        dump.dump(&name(), Bytes::from_static(b"{\"battle\":1}"))
            .unwrap()
            .await
            .unwrap();

        let files: Vec<_> = std::fs::read_dir(&target)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let file_name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("get_battle_init_data-"));
        assert!(file_name.ends_with(".json"));
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"{\"battle\":1}");
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the directory should be
        let blocker = dir.path().join("dump");
        std::fs::write(&blocker, b"").unwrap();
        let dump = DiagnosticDump::new(&blocker, vec!["get_battle_init_data".to_string()]);

        let task = dump.dump(&name(), Bytes::from_static(b"{}")).unwrap();
        assert!(task.await.is_ok());
    }
}
