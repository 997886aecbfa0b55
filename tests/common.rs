#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cluster_journal::{Journal, JournalConfig, JournalRecord, RecordConsumer, Result};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn sqlite_url(path: &Path) -> String {
    format!("sqlite:{}", path.display())
}

/// Configuration with no reconnect delay, so failure tests do not sleep.
pub fn test_config(node_id: &str, path: &Path) -> JournalConfig {
    let mut config = JournalConfig::new(node_id, sqlite_url(path));
    config.reconnect_delay_ms = 0;
    config.lock_wait_ms = 30_000;
    config
}

pub fn open_node(node_id: &str, path: &Path) -> Journal {
    Journal::open(test_config(node_id, path)).expect("open journal")
}

/// `(revision, payload)` of every record above `after`.
pub fn revisions_and_payloads(journal: &Journal, after: i64) -> Vec<(i64, Vec<u8>)> {
    journal
        .records(after)
        .expect("create iterator")
        .map(|r| {
            let r = r.expect("read record");
            (r.revision, r.payload)
        })
        .collect()
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Consumer that records what it was handed and can be told to fail.
pub struct CollectingConsumer {
    id: String,
    pub records: Mutex<Vec<JournalRecord>>,
    pub checkpoints: Mutex<Vec<i64>>,
    pub fail_on: Mutex<Option<Vec<u8>>>,
}

impl CollectingConsumer {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            records: Mutex::new(Vec::new()),
            checkpoints: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        })
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.payload.clone())
            .collect()
    }
}

impl RecordConsumer for CollectingConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn consume(&self, record: &JournalRecord) -> Result<()> {
        if self.fail_on.lock().unwrap().as_deref() == Some(record.payload.as_slice()) {
            return Err(cluster_journal::Error::Consumer {
                consumer_id: self.id.clone(),
                message: "refused record".to_string(),
            });
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn set_revision(&self, revision: i64) {
        self.checkpoints.lock().unwrap().push(revision);
    }
}
