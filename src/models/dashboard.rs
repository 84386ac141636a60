use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::time_range::TimeRange;

/// The value a template variable took for one panel (or row) instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopedVar {
    #[serde(default, deserialize_with = "string_or_list")]
    pub text: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub value: String,
}

impl ScopedVar {
    pub fn new(value: &str) -> Self {
        Self {
            text: value.to_string(),
            value: value.to_string(),
        }
    }
}

/// Multi-value selections arrive as arrays; they are flattened to `a, b`.
fn string_or_list<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(s)) => s,
        Some(OneOrMany::Many(v)) => v.join(", "),
        None => String::new(),
    })
}

pub type ScopedVars = BTreeMap<String, ScopedVar>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Panel {
    #[serde(default)]
    pub id: i64,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub row_title: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scoped_vars: ScopedVars,
    /// Children of a collapsed row pseudo-panel (current schema only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub panels: Vec<Panel>,
}

impl Panel {
    pub fn is_single_stat(&self) -> bool {
        self.kind == "singlestat"
    }

    pub fn is_row(&self) -> bool {
        self.kind == "row"
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub show_title: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<String>,
    #[serde(default)]
    pub repeat_iteration: i64,
    #[serde(default)]
    pub repeat_row_id: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scoped_vars: ScopedVars,
    #[serde(default)]
    pub panels: Vec<Panel>,
    /// Title before `$var` substitution, so re-expansion starts from it.
    #[serde(skip)]
    pub title_template: Option<String>,
}

impl Row {
    pub fn is_visible(&self) -> bool {
        self.show_title
    }

    /// Name of the repeat variable, ignoring the empty string Grafana
    /// sometimes saves in place of `null`.
    pub fn repeat_var(&self) -> Option<&str> {
        self.repeat.as_deref().filter(|r| !r.is_empty())
    }

    pub fn is_clone(&self) -> bool {
        self.repeat_row_id != 0
    }

    /// The value this row was expanded for, if any.
    pub fn bound_value(&self, var: &str) -> Option<&str> {
        self.scoped_vars
            .get(var)
            .or_else(|| self.panels.first().and_then(|p| p.scoped_vars.get(var)))
            .map(|sv| sv.value.as_str())
    }

    pub fn stamp_row_title(&mut self) {
        for panel in &mut self.panels {
            panel.row_title.clone_from(&self.title);
        }
    }

    /// Retitle the row and bind every panel to `var = value`.
    pub fn bind(&mut self, title: &str, var: &str, value: &str) {
        self.title = title.to_string();
        self.scoped_vars = BTreeMap::from([(var.to_string(), ScopedVar::new(value))]);
        for panel in &mut self.panels {
            panel.row_title = title.to_string();
            panel.scoped_vars = self.scoped_vars.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatasourceRef {
    Name(String),
    Ref {
        #[serde(default)]
        uid: Option<String>,
        #[serde(default, rename = "type")]
        kind: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum VariableQuery {
    Text(String),
    Object { query: String },
}

impl Default for VariableQuery {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl VariableQuery {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(q) | Self::Object { query: q } => q,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct TemplatingVariable {
    pub name: String,
    #[serde(default)]
    pub datasource: Option<DatasourceRef>,
    #[serde(default)]
    pub query: VariableQuery,
}

impl TemplatingVariable {
    pub fn new(name: &str, query: &str) -> Self {
        Self {
            name: name.to_string(),
            datasource: None,
            query: VariableQuery::Text(query.to_string()),
        }
    }
}

/// Everything a render call needs besides the dashboard JSON itself.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub base_url: String,
    pub api_token: Option<String>,
    pub time_range: TimeRange,
    pub iteration: i64,
}

/// Dashboard as returned by `GET /api/dashboards/...`.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardPayload {
    pub dashboard: DashboardJson,
    #[serde(default)]
    pub meta: DashboardMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DashboardMeta {
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DashboardJson {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub templating: HashMap<String, Vec<TemplatingVariable>>,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub panels: Vec<Panel>,
}

impl DashboardPayload {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Legacy dashboards carry rows; current ones a flat panel list.
    pub fn has_rows(&self) -> bool {
        !self.dashboard.rows.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Dashboard {
    pub title: String,
    pub templating: HashMap<String, Vec<TemplatingVariable>>,
    pub rows: Vec<Row>,
    pub panels: Vec<Panel>,
    pub variable_values: String,
    #[serde(skip)]
    pub ctx: RenderContext,
}

impl Dashboard {
    /// The templating variables Grafana keeps under `templating.list`.
    pub fn variables(&self) -> &[TemplatingVariable] {
        self.templating.get("list").map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iteration(&self) -> i64 {
        self.ctx.iteration
    }

    pub fn max_panel_id(&self) -> i64 {
        self.rows
            .iter()
            .flat_map(|r| &r.panels)
            .map(|p| p.id)
            .max()
            .unwrap_or(0)
    }

    /// Rebuild the flat panel list from the rows, in row order.
    pub fn flatten_rows(&mut self) {
        self.panels = self.rows.iter().flat_map(|r| r.panels.iter().cloned()).collect();
    }
}

/// Join request variable bindings (`var-host=a&var-host=b`) for display.
pub fn join_variable_values(bindings: &BTreeMap<String, Vec<String>>) -> String {
    bindings
        .values()
        .map(|v| v.join(", "))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_legacy_payload() {
        let json = r#"{
            "dashboard": {
                "title": "TiDB",
                "templating": {"list": [
                    {"name": "instance", "datasource": "prom", "query": "label_values(up, instance)"},
                    {"name": "job", "datasource": {"uid": "abc", "type": "prometheus"}, "query": {"query": "label_values(up, job)"}}
                ]},
                "rows": [
                    {"title": "Server $instance", "repeat": "instance", "showTitle": true,
                     "panels": [{"id": 1, "type": "graph", "title": "QPS"}]},
                    {"title": "Clone", "repeat": null, "repeatRowId": 1, "repeatIteration": 1520000000000,
                     "panels": [{"id": 2, "type": "singlestat", "scopedVars": {"instance": {"text": "b", "value": ["b", "c"]}}}]}
                ]
            },
            "meta": {"slug": "tidb"}
        }"#;
        let payload = DashboardPayload::from_slice(json.as_bytes()).unwrap();
        assert!(payload.has_rows());
        assert_eq!(payload.meta.slug, "tidb");

        let body = &payload.dashboard;
        assert_eq!(body.templating["list"][1].query.as_str(), "label_values(up, job)");
        assert_eq!(
            body.templating["list"][0].datasource,
            Some(DatasourceRef::Name("prom".into()))
        );
        assert_eq!(body.rows[0].repeat_var(), Some("instance"));
        assert!(body.rows[0].is_visible());
        assert!(body.rows[1].is_clone());
        assert!(body.rows[1].panels[0].is_single_stat());
        assert_eq!(body.rows[1].bound_value("instance"), Some("b, c"));
    }

    #[test]
    fn test_decode_current_payload() {
        let json = r#"{"dashboard": {"title": "x", "panels": [
            {"id": 1, "type": "row", "title": "Overview"},
            {"id": 2, "type": "graph"}
        ]}}"#;
        let payload = DashboardPayload::from_slice(json.as_bytes()).unwrap();
        assert!(!payload.has_rows());
        assert!(payload.dashboard.panels[0].is_row());
    }

    #[test]
    fn test_bind_sets_titles_and_scope() {
        let mut row = Row {
            title: "Host $host".into(),
            panels: vec![Panel { id: 1, ..Default::default() }, Panel { id: 2, ..Default::default() }],
            ..Default::default()
        };
        row.bind("Host a", "host", "a");
        assert_eq!(row.title, "Host a");
        for p in &row.panels {
            assert_eq!(p.row_title, "Host a");
            assert_eq!(p.scoped_vars.len(), 1);
            assert_eq!(p.scoped_vars["host"], ScopedVar::new("a"));
        }
        assert_eq!(row.bound_value("host"), Some("a"));
    }

    #[test]
    fn test_join_variable_values() {
        let bindings = BTreeMap::from([
            ("var-db".to_string(), vec!["tidb".to_string()]),
            ("var-host".to_string(), vec!["a".to_string(), "b".to_string()]),
        ]);
        assert_eq!(join_variable_values(&bindings), "tidb, a, b");
    }
}
