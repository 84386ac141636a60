use std::fmt;
use std::path::PathBuf;

/// Failure to turn a templating variable into its list of values.
#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("malformed template query {0:?}, expected label_values(<metric>, <label>)")]
    MalformedQuery(String),

    #[error("label resolver upstream error: {0}")]
    Upstream(String),
}

/// Failure talking to the Grafana HTTP API.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("writing response body: {0}")]
    Io(#[from] std::io::Error),
}

/// One panel whose image could not be fetched or written.
#[derive(thiserror::Error, Debug)]
#[error("panel {panel_id}: {message}")]
pub struct PanelFetchError {
    pub panel_id: i64,
    pub message: String,
}

/// Every panel failure collected from a single fetch run.
#[derive(Debug)]
pub struct ImageFetchError {
    pub errors: Vec<PanelFetchError>,
}

impl fmt::Display for ImageFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} panel image(s) failed", self.errors.len())?;
        for e in &self.errors {
            write!(f, "; {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ImageFetchError {}

#[derive(thiserror::Error, Debug)]
pub enum AssemblyError {
    #[error("decoding image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("unsupported font family {0:?}")]
    Font(String),

    #[error("writing document: {0}")]
    Write(#[from] std::io::Error),
}

/// Error surfaced by report generation, tagged with the failing stage.
#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("error fetching dashboard {dashboard}: {source}")]
    DashboardFetch {
        dashboard: String,
        #[source]
        source: ClientError,
    },

    #[error("error decoding dashboard {dashboard}: {source}")]
    DashboardDecode {
        dashboard: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error preparing work directory: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("error rendering panel images for {dashboard}: {source}")]
    ImageFetch {
        dashboard: String,
        #[source]
        source: ImageFetchError,
    },

    #[error("error assembling document for {dashboard}: {source}")]
    Assembly {
        dashboard: String,
        #[source]
        source: AssemblyError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_fetch_error_lists_every_panel() {
        let err = ImageFetchError {
            errors: vec![
                PanelFetchError { panel_id: 3, message: "timeout".into() },
                PanelFetchError { panel_id: 7, message: "status 500".into() },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 panel image(s) failed"));
        assert!(text.contains("panel 3: timeout"));
        assert!(text.contains("panel 7: status 500"));
    }

    #[test]
    fn test_report_error_names_stage() {
        let err = ReportError::ImageFetch {
            dashboard: "tidb".into(),
            source: ImageFetchError { errors: vec![] },
        };
        assert!(err.to_string().starts_with("error rendering panel images for tidb"));
    }
}
