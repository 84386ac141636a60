use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ClientError;
use crate::models::{Panel, TimeRange};

/// Which Grafana HTTP API generation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFlavor {
    /// Dashboards addressed by slug (`/api/dashboards/db/<slug>`).
    #[default]
    V4,
    /// Dashboards addressed by uid (`/api/dashboards/uid/<uid>`).
    V5,
}

/// The parts of Grafana a report needs: dashboard JSON and panel images.
#[async_trait]
pub trait GrafanaClient: Send + Sync {
    async fn get_dashboard(&self, dash_name: &str) -> Result<Vec<u8>, ClientError>;

    /// Stream the rendered PNG for `panel` into `sink`, returning bytes written.
    async fn get_panel_png(
        &self,
        panel: &Panel,
        dash_name: &str,
        time: &TimeRange,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, ClientError>;
}

#[derive(Clone)]
pub struct HttpGrafanaClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    variables: BTreeMap<String, Vec<String>>,
    flavor: ApiFlavor,
    render_timeout: Duration,
}

impl HttpGrafanaClient {
    pub fn new(
        http: reqwest::Client,
        flavor: ApiFlavor,
        base_url: &str,
        api_token: Option<String>,
        variables: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            variables,
            flavor,
            render_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn dashboard_url(&self, dash_name: &str) -> String {
        let dash = urlencoding::encode(dash_name);
        match self.flavor {
            ApiFlavor::V4 => format!("{}/api/dashboards/db/{dash}", self.base_url),
            ApiFlavor::V5 => format!("{}/api/dashboards/uid/{dash}", self.base_url),
        }
    }

    pub fn panel_url(&self, panel: &Panel, dash_name: &str, time: &TimeRange) -> String {
        let dash = urlencoding::encode(dash_name);
        let path = match self.flavor {
            ApiFlavor::V4 => format!("{}/render/dashboard-solo/db/{dash}", self.base_url),
            ApiFlavor::V5 => format!("{}/render/d-solo/{dash}/_", self.base_url),
        };

        let (width, height) = if panel.is_single_stat() { (300, 150) } else { (1000, 500) };
        let mut params: Vec<(String, String)> = vec![
            ("theme".into(), "light".into()),
            ("panelId".into(), panel.id.to_string()),
            ("from".into(), time.from.clone()),
            ("to".into(), time.to.clone()),
            ("width".into(), width.to_string()),
            ("height".into(), height.to_string()),
        ];

        // A panel's own scoped value replaces any request binding of the same name.
        for (key, values) in &self.variables {
            let scoped = key
                .strip_prefix("var-")
                .is_some_and(|name| panel.scoped_vars.contains_key(name));
            if !scoped {
                params.extend(values.iter().map(|v| (key.clone(), v.clone())));
            }
        }
        for (name, var) in &panel.scoped_vars {
            params.push((format!("var-{name}"), var.value.clone()));
        }

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{path}?{query}")
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<reqwest::Response, ClientError> {
        let mut req = self.http.get(url).timeout(timeout);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|source| ClientError::Request {
            url: url.to_string(),
            source,
        })?;
        if !resp.status().is_success() {
            return Err(ClientError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl GrafanaClient for HttpGrafanaClient {
    async fn get_dashboard(&self, dash_name: &str) -> Result<Vec<u8>, ClientError> {
        let url = self.dashboard_url(dash_name);
        tracing::info!("fetching dashboard from {url}");
        let resp = self.get(&url, Duration::from_secs(60)).await?;
        let body = resp
            .bytes()
            .await
            .map_err(|source| ClientError::Request { url, source })?;
        Ok(body.to_vec())
    }

    async fn get_panel_png(
        &self,
        panel: &Panel,
        dash_name: &str,
        time: &TimeRange,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, ClientError> {
        let url = self.panel_url(panel, dash_name, time);
        let mut resp = self.get(&url, self.render_timeout).await?;

        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|source| ClientError::Request { url: url.clone(), source })?
        {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        Ok(written)
    }
}
