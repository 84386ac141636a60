use axum::{
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::AppState;
use crate::error::{ClientError, ReportError};
use crate::grafana::{ApiFlavor, BindingsResolver, HttpGrafanaClient, PromLabelResolver, StaticResolver};
use crate::models::TimeRange;
use crate::report::{ReportGenerator, ReportRequest};

/// `GET /api/report/{dash}`: dashboard addressed the configured way (slug by default).
pub async fn report(
    State(state): State<AppState>,
    Path(dash): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let flavor = state.config.grafana.api_flavor;
    render(state, flavor, dash, params).await
}

/// `GET /api/v5/report/{dash}`: dashboard addressed by uid.
pub async fn report_v5(
    State(state): State<AppState>,
    Path(dash): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    render(state, ApiFlavor::V5, dash, params).await
}

fn parse_request(dash_name: String, params: Vec<(String, String)>) -> ReportRequest {
    let mut from = String::new();
    let mut to = String::new();
    let mut api_token = None;
    let mut variables: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (key, value) in params {
        match key.as_str() {
            "from" => from = value,
            "to" => to = value,
            "apitoken" if !value.is_empty() => api_token = Some(value),
            k if k.starts_with("var-") => variables.entry(key).or_default().push(value),
            _ => {}
        }
    }

    ReportRequest {
        dash_name,
        time_range: TimeRange::new(&from, &to),
        api_token,
        variables,
    }
}

fn status_for(err: &ReportError) -> StatusCode {
    match err {
        ReportError::DashboardFetch {
            source: ClientError::Status { status: 404, .. },
            ..
        } => StatusCode::NOT_FOUND,
        ReportError::DashboardFetch { .. }
        | ReportError::DashboardDecode { .. }
        | ReportError::ImageFetch { .. } => StatusCode::BAD_GATEWAY,
        ReportError::Workspace(_) | ReportError::Assembly { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn render(
    state: AppState,
    flavor: ApiFlavor,
    dash: String,
    params: Vec<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let req = parse_request(dash, params);
    let grafana = &state.config.grafana;
    tracing::info!("report requested for {} ({flavor:?}, {})", req.dash_name, req.time_range);

    let client = HttpGrafanaClient::new(
        state.http.clone(),
        flavor,
        &grafana.base_url,
        req.api_token.clone(),
        req.variables.clone(),
    )
    .with_render_timeout(Duration::from_secs(grafana.render_timeout_secs));

    let labels = PromLabelResolver::new(
        state.http.clone(),
        &grafana.base_url,
        req.api_token.clone(),
        req.time_range.from_unix(),
        req.time_range.to_unix(),
    );
    let resolver = BindingsResolver::new(StaticResolver::from_bindings(&req.variables), labels);

    let generator = ReportGenerator::new(
        &grafana.base_url,
        Arc::new(client),
        Arc::new(resolver),
        Arc::new(state.config.layout.clone()),
        &state.tmp_root,
    );

    let artifact = generator.generate(&req).await.map_err(|e| {
        tracing::error!("report for {} failed: {e}", req.dash_name);
        (status_for(&e), e.to_string())
    })?;

    let read = artifact.read().await;
    if let Err(e) = &read {
        tracing::error!("reading report {}: {e}", artifact.path().display());
    }
    artifact.clean().await;
    let body = read.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("reading report: {e}")))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, format!("inline; filename=\"{}.pdf\"", req.dash_name)),
        ],
        body,
    ))
}
