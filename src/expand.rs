//! Repeat-row expansion.
//!
//! A row with `repeat: "<var>"` is expanded into one row per value of that
//! templating variable. The source row becomes the first instance; every
//! further value gets a clone that points back at its source through
//! `repeatRowId` and records the render iteration that last wanted it in
//! `repeatIteration`. Clones left over from earlier iterations are reused
//! when possible (keeping their panel ids) and dropped otherwise.

use regex::{Captures, Regex};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::grafana::TemplateResolver;
use crate::models::{Dashboard, DashboardPayload, Panel, RenderContext, Row};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\w+)").expect("static regex"));

static LAST_ITERATION: AtomicI64 = AtomicI64::new(0);

/// A fresh iteration id: wall-clock millis, bumped past the previous id when
/// two renders start within the same millisecond.
pub fn next_iteration() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let prev = LAST_ITERATION
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or_else(|last| last);
    now.max(prev + 1)
}

/// Build the render-ready dashboard: legacy payloads (with `rows`) are
/// expanded, current ones are projected to their non-row panels.
pub async fn populate(
    payload: DashboardPayload,
    ctx: RenderContext,
    variable_values: String,
    resolver: &dyn TemplateResolver,
) -> Dashboard {
    let has_rows = payload.has_rows();
    let body = payload.dashboard;
    let mut dash = Dashboard {
        title: body.title,
        templating: body.templating,
        rows: Vec::new(),
        panels: Vec::new(),
        variable_values,
        ctx,
    };

    if has_rows {
        dash.rows = body.rows;
        expand(&mut dash, resolver).await;
    } else {
        dash.panels = project_panels(body.panels);
    }

    tracing::info!(
        "populated dashboard {:?}: {} rows, {} panels",
        dash.title,
        dash.rows.len(),
        dash.panels.len()
    );
    dash
}

/// Flatten a current-schema panel list: row pseudo-panels are dropped, the
/// children of collapsed rows are pulled up, and every panel learns the
/// title of the row it sits under.
pub fn project_panels(panels: Vec<Panel>) -> Vec<Panel> {
    let mut out = Vec::with_capacity(panels.len());
    let mut row_title = String::new();

    for mut panel in panels {
        if panel.is_row() {
            row_title = panel.title;
            for mut child in panel.panels.into_iter().filter(|c| !c.is_row()) {
                child.row_title.clone_from(&row_title);
                out.push(child);
            }
            continue;
        }
        panel.row_title.clone_from(&row_title);
        out.push(panel);
    }
    out
}

/// Replace `$<var>` placeholders naming `var` with `value`; other
/// placeholders are left alone.
pub fn substitute_title(title: &str, var: &str, value: &str) -> String {
    PLACEHOLDER
        .replace_all(title, |caps: &Captures| {
            if &caps[1] == var {
                value.to_string()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Expand repeat rows in place and rebuild `dash.panels`.
///
/// Rows are walked once, left to right, and appended to a new list: sources
/// are followed by their instances in value order, clones claimed by a
/// source are moved next to it, and unclaimed clones from another iteration
/// are dropped where they stood. Running this twice with the same iteration
/// and the same values yields the same rows.
pub async fn expand(dash: &mut Dashboard, resolver: &dyn TemplateResolver) {
    let iteration = dash.iteration();
    let mut next_id = dash.max_panel_id();
    let mut pending: Vec<Option<Row>> = std::mem::take(&mut dash.rows).into_iter().map(Some).collect();
    let mut rows: Vec<Row> = Vec::with_capacity(pending.len());
    let variables = dash.variables();

    for idx in 0..pending.len() {
        let Some(mut row) = pending[idx].take() else {
            // already moved next to its source
            continue;
        };

        let Some(var_name) = row.repeat_var().map(str::to_string) else {
            if row.is_clone() && row.repeat_iteration != iteration {
                tracing::debug!(
                    "removing stale clone {:?} of row {} (iteration {})",
                    row.title,
                    row.repeat_row_id,
                    row.repeat_iteration
                );
                continue;
            }
            row.stamp_row_title();
            rows.push(row);
            continue;
        };

        let Some(variable) = variables.iter().find(|v| v.name == var_name) else {
            tracing::debug!("repeat variable {var_name} not in templating list, row {:?} not expanded", row.title);
            rows.push(row);
            continue;
        };

        let source_id = rows.len() as i64 + 1;
        let resolved = resolver.resolve(variable).await;
        let rest = &mut pending[idx + 1..];
        match resolved {
            Ok(values) => {
                let stamp = CloneStamp { source_id, iteration };
                rows.extend(repeat_row(row, &var_name, &values, &stamp, rest, &mut next_id));
            }
            Err(e) => {
                tracing::error!(
                    "getting templating variable {var_name} value error: {e}; row {:?} and its clones left unchanged",
                    row.title
                );
                rows.push(row);
                rows.extend(confirm_clones(rest, &var_name, source_id, iteration));
            }
        }
    }

    dash.rows = rows;
    dash.flatten_rows();
}

struct CloneStamp {
    source_id: i64,
    iteration: i64,
}

/// Indices in `rest` of the clones a source owns: the unbroken run of clone
/// rows right after it, restricted to those bound to `var`. Source positions
/// shift when earlier rows gain or lose clones, so `repeatRowId` alone can
/// point at another row's clones.
fn owned_clones(rest: &[Option<Row>], var: &str) -> Vec<usize> {
    rest.iter()
        .map_while(|slot| slot.as_ref().filter(|r| r.is_clone() && r.repeat_var().is_none()))
        .enumerate()
        .filter(|(_, r)| r.bound_value(var).is_some())
        .map(|(i, _)| i)
        .collect()
}

/// Turn `source` into one row per value: the source itself for the first
/// value, then reused or freshly allocated clones for the rest.
fn repeat_row(
    mut source: Row,
    var: &str,
    values: &[String],
    stamp: &CloneStamp,
    rest: &mut [Option<Row>],
    next_id: &mut i64,
) -> Vec<Row> {
    let Some((first, others)) = values.split_first() else {
        return vec![source];
    };

    let template = source
        .title_template
        .get_or_insert_with(|| source.title.clone())
        .clone();
    source.bind(&substitute_title(&template, var, first), var, first);

    let slots = claim_clones(rest, var, others, stamp.iteration);
    let mut expanded = Vec::with_capacity(values.len());
    let mut clones = Vec::with_capacity(others.len());

    for (value, slot) in others.iter().zip(slots) {
        let title = substitute_title(&template, var, value);
        let mut clone = match slot.and_then(|i| rest[i].take()) {
            Some(existing) => existing,
            None => {
                let mut fresh = source.clone();
                fresh.id = 0;
                for panel in &mut fresh.panels {
                    *next_id += 1;
                    panel.id = *next_id;
                }
                fresh
            }
        };
        clone.repeat = None;
        clone.repeat_row_id = stamp.source_id;
        clone.repeat_iteration = stamp.iteration;
        clone.title_template = Some(template.clone());
        clone.bind(&title, var, value);
        clones.push(clone);
    }

    expanded.push(source);
    expanded.extend(clones);
    expanded
}

/// Pick an existing clone of this source for each value, if there is one.
/// A clone already bound to the same value is preferred so that surviving
/// values keep their rows; remaining values take any owned clone left over
/// from an earlier iteration.
fn claim_clones(rest: &[Option<Row>], var: &str, values: &[String], iteration: i64) -> Vec<Option<usize>> {
    let candidates = owned_clones(rest, var);
    let mut taken = vec![false; rest.len()];
    let mut slots: Vec<Option<usize>> = vec![None; values.len()];

    for (slot, value) in slots.iter_mut().zip(values) {
        *slot = candidates.iter().copied().find(|&i| {
            !taken[i] && rest[i].as_ref().and_then(|r| r.bound_value(var)) == Some(value.as_str())
        });
        if let Some(i) = *slot {
            taken[i] = true;
        }
    }

    for slot in slots.iter_mut().filter(|s| s.is_none()) {
        *slot = candidates.iter().copied().find(|&i| {
            !taken[i] && rest[i].as_ref().is_some_and(|r| r.repeat_iteration != iteration)
        });
        if let Some(i) = *slot {
            taken[i] = true;
        }
    }

    slots
}

/// Keep the existing clones of a source whose values could not be resolved.
fn confirm_clones(rest: &mut [Option<Row>], var: &str, source_id: i64, iteration: i64) -> Vec<Row> {
    owned_clones(rest, var)
        .into_iter()
        .filter_map(|i| rest[i].take())
        .map(|mut row| {
            row.repeat_row_id = source_id;
            row.repeat_iteration = iteration;
            row.stamp_row_title();
            row
        })
        .collect()
}
