use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::ResolveError;
use crate::models::TemplatingVariable;

static LABEL_VALUES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"label_values\((\w+),\s*(\w+)\)\s*$").expect("static regex")
});

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Grafana's "select all" values (`$__all` in current URLs, `All` in older
/// share links); never concrete values.
const ALL_SENTINELS: [&str; 2] = ["$__all", "All"];

/// Source of the concrete values a templating variable expands to.
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    /// Values for `var`, sorted and deduplicated.
    async fn resolve(&self, var: &TemplatingVariable) -> Result<Vec<String>, ResolveError>;
}

/// Split `label_values(<metric>, <label>)` into `(metric, label)`.
pub fn parse_label_values(query: &str) -> Result<(&str, &str), ResolveError> {
    let caps = LABEL_VALUES
        .captures(query)
        .ok_or_else(|| ResolveError::MalformedQuery(query.to_string()))?;
    match (caps.get(1), caps.get(2)) {
        (Some(metric), Some(label)) => Ok((metric.as_str(), label.as_str())),
        _ => Err(ResolveError::MalformedQuery(query.to_string())),
    }
}

fn sorted_unique(values: impl IntoIterator<Item = String>) -> Vec<String> {
    values.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

// ── Prometheus series API through the Grafana datasource proxy ──

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    status: String,
    #[serde(default)]
    data: Vec<BTreeMap<String, serde_json::Value>>,
}

/// Resolves variables by asking the series endpoint which label values exist
/// in the report's time range.
#[derive(Clone)]
pub struct PromLabelResolver {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    start: i64,
    end: i64,
}

impl PromLabelResolver {
    pub fn new(http: reqwest::Client, base_url: &str, api_token: Option<String>, start: i64, end: i64) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            start,
            end,
        }
    }

    fn series_url(&self, metric: &str) -> String {
        format!(
            "{}/api/datasources/proxy/1/api/v1/series?match[]={}&start={}&end={}",
            self.base_url,
            urlencoding::encode(metric),
            self.start,
            self.end,
        )
    }
}

#[async_trait]
impl TemplateResolver for PromLabelResolver {
    async fn resolve(&self, var: &TemplatingVariable) -> Result<Vec<String>, ResolveError> {
        let (metric, label) = parse_label_values(var.query.as_str())?;
        let url = self.series_url(metric);
        tracing::info!("request metric at {url}");

        let mut req = self.http.get(&url).timeout(RESOLVE_TIMEOUT);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ResolveError::Upstream(format!("executing metric request for {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ResolveError::Upstream(format!("{url} responded with status {status}")));
        }
        let body: SeriesResponse = resp
            .json()
            .await
            .map_err(|e| ResolveError::Upstream(format!("decoding metric response from {url}: {e}")))?;
        if body.status != "success" {
            return Err(ResolveError::Upstream(format!(
                "{url} returned status {:?}",
                body.status
            )));
        }

        Ok(sorted_unique(body.data.into_iter().filter_map(|mut series| {
            match series.remove(label) {
                Some(serde_json::Value::String(s)) => Some(s),
                _ => None,
            }
        })))
    }
}

// ── Fixed bindings ──

/// Variable values supplied up front (request bindings, config, tests).
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    values: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    pub fn new(values: HashMap<String, Vec<String>>) -> Self {
        Self { values }
    }

    /// Build from request bindings keyed `var-<name>`; other keys are ignored.
    pub fn from_bindings(bindings: &BTreeMap<String, Vec<String>>) -> Self {
        let values = bindings
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("var-").map(|name| (name.to_string(), v.clone())))
            .collect();
        Self { values }
    }

    pub fn lookup(&self, name: &str) -> Option<Vec<String>> {
        let values = self.values.get(name)?;
        if values.is_empty() || values.iter().any(|v| ALL_SENTINELS.contains(&v.as_str())) {
            return None;
        }
        Some(sorted_unique(values.iter().cloned()))
    }
}

#[async_trait]
impl TemplateResolver for StaticResolver {
    async fn resolve(&self, var: &TemplatingVariable) -> Result<Vec<String>, ResolveError> {
        Ok(self.lookup(&var.name).unwrap_or_default())
    }
}

/// Request bindings win; anything unbound (or bound to "All") goes upstream.
pub struct BindingsResolver<R> {
    bindings: StaticResolver,
    upstream: R,
}

impl<R: TemplateResolver> BindingsResolver<R> {
    pub fn new(bindings: StaticResolver, upstream: R) -> Self {
        Self { bindings, upstream }
    }
}

#[async_trait]
impl<R: TemplateResolver> TemplateResolver for BindingsResolver<R> {
    async fn resolve(&self, var: &TemplatingVariable) -> Result<Vec<String>, ResolveError> {
        match self.bindings.lookup(&var.name) {
            Some(values) => {
                tracing::debug!("variable {} bound by request to {values:?}", var.name);
                Ok(values)
            }
            None => self.upstream.resolve(var).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::Query, http::HeaderMap, routing::get};
    use serde_json::{Value, json};

    #[test]
    fn test_parse_label_values() {
        assert_eq!(parse_label_values("label_values(up, job)").unwrap(), ("up", "job"));
        assert_eq!(
            parse_label_values("label_values(tidb_server_uptime,instance)").unwrap(),
            ("tidb_server_uptime", "instance")
        );
    }

    #[test]
    fn test_parse_label_values_malformed() {
        for q in ["label_values(bad_format)", "up", "", "label_values(up, job) + 1"] {
            assert!(
                matches!(parse_label_values(q), Err(ResolveError::MalformedQuery(_))),
                "{q} should be rejected"
            );
        }
    }

    #[test]
    fn test_sorted_unique() {
        let out = sorted_unique(["b", "a", "b"].map(String::from));
        assert_eq!(out, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_static_resolver_from_bindings() {
        let bindings = BTreeMap::from([
            ("var-host".to_string(), vec!["b".to_string(), "a".to_string(), "b".to_string()]),
            ("var-all".to_string(), vec!["$__all".to_string()]),
            ("var-job".to_string(), vec!["All".to_string()]),
            ("from".to_string(), vec!["now-1h".to_string()]),
        ]);
        let r = StaticResolver::from_bindings(&bindings);
        let host = TemplatingVariable::new("host", "");
        assert_eq!(r.resolve(&host).await.unwrap(), vec!["a", "b"]);
        assert_eq!(r.lookup("all"), None);
        assert_eq!(r.lookup("job"), None);
        assert_eq!(r.lookup("from"), None);
    }

    #[tokio::test]
    async fn test_bindings_resolver_falls_through() {
        let upstream = StaticResolver::new(HashMap::from([
            ("job".to_string(), vec!["tikv".to_string()]),
            ("host".to_string(), vec!["upstream".to_string()]),
        ]));
        let bindings = StaticResolver::new(HashMap::from([("host".to_string(), vec!["req".to_string()])]));
        let r = BindingsResolver::new(bindings, upstream);
        assert_eq!(r.resolve(&TemplatingVariable::new("host", "")).await.unwrap(), vec!["req"]);
        assert_eq!(r.resolve(&TemplatingVariable::new("job", "")).await.unwrap(), vec!["tikv"]);
    }

    // ── HTTP behaviour against a local series endpoint ──

    async fn serve(body: Value) -> String {
        let app = Router::new().route(
            "/api/datasources/proxy/1/api/v1/series",
            get(move |Query(q): Query<Vec<(String, String)>>, headers: HeaderMap| {
                let body = body.clone();
                async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|h| h.to_str().ok())
                        == Some("Bearer secret");
                    let matched = q.iter().any(|(k, v)| k == "match[]" && v == "up");
                    if authorized && matched {
                        Json(body)
                    } else {
                        Json(json!({"status": "error", "data": []}))
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_prom_resolver_collects_sorted_labels() {
        let base = serve(json!({
            "status": "success",
            "data": [
                {"__name__": "up", "job": "tikv"},
                {"__name__": "up", "job": "pd"},
                {"__name__": "up", "job": "tikv"},
                {"__name__": "up", "job": 5},
                {"__name__": "up"}
            ]
        }))
        .await;
        let r = PromLabelResolver::new(reqwest::Client::new(), &base, Some("secret".into()), 0, 60);
        let values = r.resolve(&TemplatingVariable::new("job", "label_values(up, job)")).await.unwrap();
        assert_eq!(values, vec!["pd", "tikv"]);
    }

    #[tokio::test]
    async fn test_prom_resolver_rejects_error_status() {
        let base = serve(json!({"status": "success", "data": []})).await;
        let r = PromLabelResolver::new(reqwest::Client::new(), &base, None, 0, 60);
        let err = r.resolve(&TemplatingVariable::new("job", "label_values(up, job)")).await.unwrap_err();
        assert!(matches!(err, ResolveError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_prom_resolver_rejects_unexpected_shape() {
        let base = serve(json!({"status": "success", "data": {"job": "tikv"}})).await;
        let r = PromLabelResolver::new(reqwest::Client::new(), &base, Some("secret".into()), 0, 60);
        let err = r.resolve(&TemplatingVariable::new("job", "label_values(up, job)")).await.unwrap_err();
        assert!(matches!(err, ResolveError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_prom_resolver_malformed_query_skips_request() {
        let r = PromLabelResolver::new(reqwest::Client::new(), "http://127.0.0.1:9", None, 0, 60);
        let err = r.resolve(&TemplatingVariable::new("job", "label_values(bad_format)")).await.unwrap_err();
        assert!(matches!(err, ResolveError::MalformedQuery(_)));
    }
}
