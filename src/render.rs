use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::error::{ClientError, ImageFetchError, PanelFetchError};
use crate::grafana::GrafanaClient;
use crate::models::{Panel, TimeRange};

/// Concurrent renders against Grafana. Bounds load on the renderer; not a
/// throughput knob.
pub const WORKERS: usize = 5;

pub fn image_path(dir: &Path, panel_id: i64) -> PathBuf {
    dir.join(format!("image{panel_id}.png"))
}

/// Outcome of one fetch run, merged from every worker.
#[derive(Debug, Default)]
pub struct FetchSummary {
    pub written: usize,
    pub errors: Vec<PanelFetchError>,
}

impl FetchSummary {
    fn merge(&mut self, other: FetchSummary) {
        self.written += other.written;
        self.errors.extend(other.errors);
    }

    /// Any failed panel fails the run.
    pub fn into_result(self) -> Result<usize, ImageFetchError> {
        if self.errors.is_empty() {
            Ok(self.written)
        } else {
            Err(ImageFetchError { errors: self.errors })
        }
    }
}

/// Fetch one PNG per panel into `dir` (as `image<id>.png`) using a fixed
/// pool of workers draining a pre-filled queue. Waits for every worker
/// before returning; failures are collected, never retried.
pub async fn fetch_all(
    client: Arc<dyn GrafanaClient>,
    panels: &[Panel],
    dash_name: &str,
    time: &TimeRange,
    dir: &Path,
) -> FetchSummary {
    let (tx, rx) = mpsc::channel(panels.len().max(1));
    for panel in panels {
        if tx.send(panel.clone()).await.is_err() {
            break;
        }
    }
    drop(tx);

    let queue = Arc::new(Mutex::new(rx));
    let mut workers = JoinSet::new();
    for worker in 0..WORKERS {
        let job = Worker {
            id: worker,
            client: client.clone(),
            queue: queue.clone(),
            dash_name: dash_name.to_string(),
            time: time.clone(),
            dir: dir.to_path_buf(),
        };
        workers.spawn(job.run());
    }

    let mut summary = FetchSummary::default();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(local) => summary.merge(local),
            Err(e) => {
                tracing::error!("image worker aborted: {e}");
                summary.errors.push(PanelFetchError {
                    panel_id: 0,
                    message: format!("image worker aborted: {e}"),
                });
            }
        }
    }
    summary.errors.sort_by_key(|e| e.panel_id);

    tracing::info!(
        "fetched {} of {} panel images for {dash_name} ({} failed)",
        summary.written,
        panels.len(),
        summary.errors.len()
    );
    summary
}

struct Worker {
    id: usize,
    client: Arc<dyn GrafanaClient>,
    queue: Arc<Mutex<mpsc::Receiver<Panel>>>,
    dash_name: String,
    time: TimeRange,
    dir: PathBuf,
}

impl Worker {
    async fn run(self) -> FetchSummary {
        let mut local = FetchSummary::default();
        loop {
            let next = self.queue.lock().await.recv().await;
            let Some(panel) = next else {
                break;
            };

            match self.fetch(&panel).await {
                Ok(bytes) => {
                    tracing::debug!("worker {}: panel {} written ({bytes} bytes)", self.id, panel.id);
                    local.written += 1;
                }
                Err(e) => {
                    tracing::error!("Error creating image for panel {}: {e}", panel.id);
                    local.errors.push(PanelFetchError {
                        panel_id: panel.id,
                        message: e.to_string(),
                    });
                }
            }
        }
        local
    }

    async fn fetch(&self, panel: &Panel) -> Result<u64, ClientError> {
        let path = image_path(&self.dir, panel.id);
        let mut file = tokio::fs::File::create(&path).await?;
        let result = match self
            .client
            .get_panel_png(panel, &self.dash_name, &self.time, &mut file)
            .await
        {
            // tokio completes the last write in the background unless flushed
            Ok(bytes) => file.flush().await.map(|()| bytes).map_err(ClientError::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!("removing partial image {}: {e}", path.display());
            }
        }
        result
    }
}
