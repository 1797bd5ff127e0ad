//! Built-in demo apps, served when no other catalog is supplied.

use tracing::info;

use crate::app::{as_number, AppCatalog, AppContext};
use crate::widgets::{button, dropdown, number, parent_visibility, tabs, WidgetGraph};

pub fn builtin_catalog() -> AppCatalog {
    AppCatalog::new()
        .register("counter", counter_app)
        .register("tabs", tabs_app)
}

/// A number input with an increment button, and a button that toggles a
/// collapsible section.
fn counter_app(_ctx: &AppContext) -> anyhow::Result<WidgetGraph> {
    let mut graph = WidgetGraph::new();
    graph
        .insert("number_input", number("Number Input", 2.0))
        .insert("button", button("Increment"))
        .insert("tab_button", button("Tab 1"))
        .insert("tab1", parent_visibility(true));

    graph.observe("button", "clicked", |_, fx| {
        let next = as_number(fx.get("number_input", "value")) + 1.0;
        fx.set("number_input", "value", next);
    })?;
    graph.observe("tab_button", "clicked", |_, fx| {
        let visible = fx
            .get("tab1", "visible")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        fx.set("tab1", "visible", !visible);
    })?;
    Ok(graph)
}

/// Tabs switching between two sections, a counter and a dropdown.
fn tabs_app(ctx: &AppContext) -> anyhow::Result<WidgetGraph> {
    let mut graph = WidgetGraph::new();
    graph
        .insert("tabs", tabs(&["Basic", "Map"]))
        .insert("tab_show_basic", parent_visibility(true))
        .insert("tab_show_map", parent_visibility(false))
        .insert("counter", number("Counter:", 0.0))
        .insert("increment_counter", button("Increment Counter"))
        .insert("selection_widget", dropdown("Select Value", &["1", "2", "3"]));

    graph.observe("tabs", "active_tab", |change, fx| {
        let active = change.new.as_str().unwrap_or_default();
        fx.set("tab_show_basic", "visible", active == "Basic");
        fx.set("tab_show_map", "visible", active == "Map");
    })?;
    graph.observe("increment_counter", "clicked", |_, fx| {
        let next = as_number(fx.get("counter", "value")) + 1.0;
        fx.set("counter", "value", next);
    })?;
    let session_id = ctx.session_id.clone();
    graph.observe("selection_widget", "value", move |change, _| {
        info!(session_id = %session_id, "selected value: {}", change.new);
    })?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn ctx(module: &str) -> AppContext {
        AppContext {
            session_id: "demo".to_string(),
            base_dir: PathBuf::from("."),
            module_path: module.to_string(),
            template: "index.html".to_string(),
        }
    }

    fn build(module: &str) -> WidgetGraph {
        let catalog = builtin_catalog();
        let factory = catalog.get(module).unwrap();
        factory(&ctx(module)).unwrap()
    }

    #[test]
    fn test_catalog_names() {
        assert_eq!(builtin_catalog().names(), ["counter", "tabs"]);
    }

    #[test]
    fn test_counter_increments_and_toggles() {
        let mut graph = build("counter");
        assert_eq!(graph.get("number_input", "value"), Some(&json!(2.0)));
        graph.set("button", "clicked", true).unwrap();
        graph.set("button", "clicked", true).unwrap();
        assert_eq!(graph.get("number_input", "value"), Some(&json!(4.0)));

        graph.set("tab_button", "clicked", true).unwrap();
        assert_eq!(graph.get("tab1", "visible"), Some(&json!(false)));
        graph.set("tab_button", "clicked", true).unwrap();
        assert_eq!(graph.get("tab1", "visible"), Some(&json!(true)));
    }

    #[test]
    fn test_tabs_switch_sections() {
        let mut graph = build("tabs");
        assert_eq!(graph.widget_ids()[0], "tabs");
        graph.set("tabs", "active_tab", "Map").unwrap();
        assert_eq!(graph.get("tab_show_basic", "visible"), Some(&json!(false)));
        assert_eq!(graph.get("tab_show_map", "visible"), Some(&json!(true)));

        graph.set("selection_widget", "value", "3").unwrap();
        assert_eq!(graph.get("selection_widget", "value"), Some(&json!("3")));
    }
}
