pub mod dashboard;
pub mod time_range;

pub use dashboard::{
    Dashboard, DashboardPayload, Panel, RenderContext, Row, ScopedVar, TemplatingVariable,
};
pub use time_range::TimeRange;
