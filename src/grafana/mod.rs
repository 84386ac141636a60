pub mod client;
pub mod resolver;

pub use client::{ApiFlavor, GrafanaClient, HttpGrafanaClient};
pub use resolver::{BindingsResolver, PromLabelResolver, StaticResolver, TemplateResolver};
