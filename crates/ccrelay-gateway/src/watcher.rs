//! Hot reload for `config.json` and `apikey.json`.
//!
//! The parent directory is watched rather than the files themselves, so
//! delete-and-recreate (how most editors save) never detaches the
//! observer. Events debounce over a 100 ms window because a single save
//! typically produces several filesystem events.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use ccrelay_core::config::{ApiKeyRecord, RelayConfig};

const DEBOUNCE: Duration = Duration::from_millis(100);

pub struct ConfigWatcher {
    pub models: watch::Receiver<BTreeMap<String, String>>,
    pub api_key: watch::Receiver<Option<String>>,
    // kept alive for the lifetime of the server; dropping it detaches the
    // filesystem observer
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn spawn(dir: PathBuf) -> notify::Result<Self> {
        let initial_models = RelayConfig::load(&dir)
            .map(|c| c.model_mapping)
            .unwrap_or_default();
        let initial_key = ApiKeyRecord::load(&dir)
            .ok()
            .flatten()
            .map(|record| record.key);

        let (models_tx, models_rx) = watch::channel(initial_models);
        let (key_tx, key_rx) = watch::channel(initial_key);
        let (fs_tx, mut fs_rx) = mpsc::channel::<()>(16);

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    // coalesced on the receiving side; a full channel just
                    // means a reload is already pending
                    let _ = fs_tx.try_send(());
                }
            })?;
        let _ = std::fs::create_dir_all(&dir);
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tokio::spawn(async move {
            while fs_rx.recv().await.is_some() {
                // drain the burst of events a single save produces
                loop {
                    match tokio::time::timeout(DEBOUNCE, fs_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                match RelayConfig::load(&dir) {
                    Ok(config) => {
                        let changed = models_tx.send_if_modified(|current| {
                            if *current != config.model_mapping {
                                *current = config.model_mapping.clone();
                                true
                            } else {
                                false
                            }
                        });
                        if changed {
                            info!("model mapping reloaded");
                        }
                    }
                    Err(e) => warn!(error = %e, "config reload failed, keeping cached value"),
                }

                match ApiKeyRecord::load(&dir) {
                    Ok(record) => {
                        let key = record.map(|r| r.key);
                        let changed = key_tx.send_if_modified(|current| {
                            if *current != key {
                                *current = key.clone();
                                true
                            } else {
                                false
                            }
                        });
                        if changed {
                            info!("local API key reloaded");
                        }
                    }
                    Err(e) => warn!(error = %e, "apikey reload failed, keeping cached value"),
                }
            }
        });

        Ok(Self {
            models: models_rx,
            api_key: key_rx,
            _watcher: watcher,
        })
    }
}
