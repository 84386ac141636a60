use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::assemble::write_pdf;
use crate::config::LayoutConfig;
use crate::error::{AssemblyError, ReportError};
use crate::expand::{next_iteration, populate};
use crate::grafana::{GrafanaClient, TemplateResolver};
use crate::models::dashboard::join_variable_values;
use crate::models::{Dashboard, DashboardPayload, RenderContext, TimeRange};
use crate::render::fetch_all;

/// What the caller asked for, already pulled out of the HTTP request.
#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    pub dash_name: String,
    pub time_range: TimeRange,
    pub api_token: Option<String>,
    /// Request bindings keyed `var-<name>`.
    pub variables: BTreeMap<String, Vec<String>>,
}

/// Scratch directory for one report, removed when dropped.
#[derive(Debug)]
struct WorkDir {
    path: PathBuf,
    removed: bool,
}

impl WorkDir {
    async fn create(root: &Path) -> io::Result<Self> {
        let path = root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(path.join("images")).await?;
        tracing::debug!("created work dir {}", path.display());
        Ok(Self { path, removed: false })
    }

    fn images(&self) -> PathBuf {
        self.path.join("images")
    }

    /// Remove the directory without blocking the runtime.
    async fn cleanup(&mut self) {
        if !self.removed {
            self.removed = true;
            self.log_removal(tokio::fs::remove_dir_all(&self.path).await);
        }
    }

    fn log_removal(&self, result: io::Result<()>) {
        match result {
            Ok(()) => tracing::debug!("removed work dir {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!("error removing work dir {}: {e}", self.path.display()),
        }
    }
}

// Last resort for artifacts dropped without `cleanup`.
impl Drop for WorkDir {
    fn drop(&mut self) {
        if !self.removed {
            self.removed = true;
            self.log_removal(std::fs::remove_dir_all(&self.path));
        }
    }
}

/// A finished report. The document and its images live until [`clean`] is
/// called or the artifact is dropped.
///
/// [`clean`]: ReportArtifact::clean
#[derive(Debug)]
pub struct ReportArtifact {
    path: PathBuf,
    work: WorkDir,
}

impl ReportArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn open(&self) -> io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }

    pub async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    pub async fn clean(mut self) {
        self.work.cleanup().await;
    }
}

/// Runs the report pipeline for one dashboard: fetch, expand, render panel
/// images, lay out the document.
pub struct ReportGenerator {
    base_url: String,
    client: Arc<dyn GrafanaClient>,
    resolver: Arc<dyn TemplateResolver>,
    layout: Arc<LayoutConfig>,
    tmp_root: PathBuf,
}

impl ReportGenerator {
    pub fn new(
        base_url: &str,
        client: Arc<dyn GrafanaClient>,
        resolver: Arc<dyn TemplateResolver>,
        layout: Arc<LayoutConfig>,
        tmp_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_url: base_url.to_string(),
            client,
            resolver,
            layout,
            tmp_root: tmp_root.into(),
        }
    }

    pub async fn generate(&self, req: &ReportRequest) -> Result<ReportArtifact, ReportError> {
        let name = req.dash_name.clone();

        let body = self
            .client
            .get_dashboard(&name)
            .await
            .map_err(|source| ReportError::DashboardFetch { dashboard: name.clone(), source })?;
        let payload = DashboardPayload::from_slice(&body)
            .map_err(|source| ReportError::DashboardDecode { dashboard: name.clone(), source })?;

        let ctx = RenderContext {
            base_url: self.base_url.clone(),
            api_token: req.api_token.clone(),
            time_range: req.time_range.clone(),
            iteration: next_iteration(),
        };
        let dash = populate(
            payload,
            ctx,
            join_variable_values(&req.variables),
            self.resolver.as_ref(),
        )
        .await;

        let mut work = WorkDir::create(&self.tmp_root).await.map_err(ReportError::Workspace)?;
        let path = work.path.join("report.pdf");
        if let Err(e) = self.render_into(dash, &name, &req.time_range, &work.images(), &path).await {
            work.cleanup().await;
            return Err(e);
        }

        tracing::info!("report for {name} ready at {}", path.display());
        Ok(ReportArtifact { path, work })
    }

    async fn render_into(
        &self,
        dash: Dashboard,
        name: &str,
        time: &TimeRange,
        images: &Path,
        out: &Path,
    ) -> Result<(), ReportError> {
        fetch_all(self.client.clone(), &dash.panels, name, time, images)
            .await
            .into_result()
            .map_err(|source| ReportError::ImageFetch { dashboard: name.to_string(), source })?;

        let layout = self.layout.clone();
        let (images, out) = (images.to_path_buf(), out.to_path_buf());
        tokio::task::spawn_blocking(move || write_pdf(&dash, &images, &layout, &out))
            .await
            .map_err(|e| AssemblyError::Write(io::Error::other(e)))
            .and_then(std::convert::identity)
            .map_err(|source| ReportError::Assembly { dashboard: name.to_string(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::grafana::StaticResolver;
    use crate::models::Panel;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::io::Cursor;
    use std::sync::Mutex;
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    const DASHBOARD: &str = r#"{
        "dashboard": {
            "title": "TiKV",
            "templating": {"list": [{"name": "host", "query": "label_values(up, host)"}]},
            "rows": [
                {"title": "Host $host", "repeat": "host", "showTitle": true,
                 "panels": [{"id": 1, "type": "graph", "title": "CPU"}, {"id": 2, "type": "singlestat", "title": "Up"}]},
                {"title": "Summary", "panels": [{"id": 3, "type": "graph", "title": "QPS"}]}
            ]
        },
        "meta": {"slug": "tikv"}
    }"#;

    fn png() -> Vec<u8> {
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(4, 2, image::Rgb([10, 20, 30])))
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    struct FakeGrafana {
        dashboard: Option<&'static str>,
        failing: HashSet<i64>,
        rendered: Mutex<Vec<Panel>>,
    }

    impl FakeGrafana {
        fn new(dashboard: Option<&'static str>, failing: &[i64]) -> Arc<Self> {
            Arc::new(Self {
                dashboard,
                failing: failing.iter().copied().collect(),
                rendered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GrafanaClient for FakeGrafana {
        async fn get_dashboard(&self, dash_name: &str) -> Result<Vec<u8>, ClientError> {
            match self.dashboard {
                Some(body) => Ok(body.as_bytes().to_vec()),
                None => Err(ClientError::Status {
                    url: format!("http://grafana/api/dashboards/db/{dash_name}"),
                    status: 404,
                }),
            }
        }

        async fn get_panel_png(
            &self,
            panel: &Panel,
            _dash_name: &str,
            _time: &TimeRange,
            sink: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<u64, ClientError> {
            self.rendered.lock().unwrap().push(panel.clone());
            if self.failing.contains(&panel.id) {
                return Err(ClientError::Status { url: "http://grafana/render".into(), status: 500 });
            }
            let body = png();
            sink.write_all(&body).await?;
            Ok(body.len() as u64)
        }
    }

    fn generator(client: Arc<FakeGrafana>, tmp: &Path) -> ReportGenerator {
        let resolver = StaticResolver::new(HashMap::from([(
            "host".to_string(),
            vec!["tikv-2".to_string(), "tikv-1".to_string()],
        )]));
        ReportGenerator::new(
            "http://grafana:3000",
            client,
            Arc::new(resolver),
            Arc::new(LayoutConfig::default()),
            tmp,
        )
    }

    fn request() -> ReportRequest {
        ReportRequest {
            dash_name: "tikv".into(),
            time_range: TimeRange::new("now-6h", "now"),
            ..Default::default()
        }
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_generate_renders_expanded_dashboard() {
        let tmp = tempfile::tempdir().unwrap();
        let client = FakeGrafana::new(Some(DASHBOARD), &[]);
        let artifact = generator(client.clone(), tmp.path()).generate(&request()).await.unwrap();

        let rendered = client.rendered.lock().unwrap().clone();
        assert_eq!(rendered.len(), 5);
        let mut ids: Vec<i64> = rendered.iter().map(|p| p.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        let scoped: HashSet<String> = rendered
            .iter()
            .filter_map(|p| p.scoped_vars.get("host").map(|v| v.value.clone()))
            .collect();
        assert_eq!(scoped, HashSet::from(["tikv-1".to_string(), "tikv-2".to_string()]));

        let bytes = artifact.read().await.unwrap();
        assert!(bytes.starts_with(b"%PDF-1.4"));
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches("/Subtype /Image").count(), 5);
        assert!(text.contains("(Dashboard: TiKV)"));

        let path = artifact.path().to_path_buf();
        assert!(path.exists());
        artifact.clean().await;
        assert!(!path.exists());
        assert_eq!(entries(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_dropping_artifact_removes_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = generator(FakeGrafana::new(Some(DASHBOARD), &[]), tmp.path())
            .generate(&request())
            .await
            .unwrap();
        assert_eq!(entries(tmp.path()), 1);
        drop(artifact);
        assert_eq!(entries(tmp.path()), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_clean_tolerates_missing_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = generator(FakeGrafana::new(Some(DASHBOARD), &[]), tmp.path())
            .generate(&request())
            .await
            .unwrap();
        let work = artifact.path().parent().unwrap().to_path_buf();
        std::fs::remove_dir_all(&work).unwrap();
        artifact.clean().await;
        assert!(!work.exists());
        assert_eq!(entries(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_dashboard_fetch_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let err = generator(FakeGrafana::new(None, &[]), tmp.path())
            .generate(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::DashboardFetch { ref dashboard, .. } if dashboard == "tikv"));
        assert_eq!(entries(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_undecodable_dashboard() {
        let tmp = tempfile::tempdir().unwrap();
        let err = generator(FakeGrafana::new(Some("<html>login</html>"), &[]), tmp.path())
            .generate(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::DashboardDecode { .. }));
    }

    #[tokio::test]
    async fn test_image_failure_aborts_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let client = FakeGrafana::new(Some(DASHBOARD), &[3]);
        let err = generator(client.clone(), tmp.path()).generate(&request()).await.unwrap_err();

        match err {
            ReportError::ImageFetch { source, .. } => {
                assert_eq!(source.errors.len(), 1);
                assert_eq!(source.errors[0].panel_id, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        // the pool drains before failing
        assert_eq!(client.rendered.lock().unwrap().len(), 5);
        assert_eq!(entries(tmp.path()), 0);
    }
}
