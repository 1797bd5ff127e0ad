//! Widget graph owned by one execution context.
//!
//! Observers are registered explicitly per `(widget_id, property)` when the
//! graph is built; setting a property fires the observers registered for it.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::warn;

use crate::error::{Error, Result};
use crate::messages::WidgetConfig;

/// Upper bound on cascaded sets triggered by a single change.
const MAX_CASCADE: usize = 1024;

#[derive(Debug, Clone)]
pub struct Trait {
    pub value: Value,
    pub default: Value,
    /// Mirrored to the browser.
    pub sync: bool,
    /// Action pulse: fires observers on every set, is never echoed and
    /// falls back to its default afterwards.
    pub fire_once: bool,
}

/// Static description of one property, served by the describe API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraitDescription {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub default: Value,
    /// Not mirrored to the browser, so clients cannot set it.
    pub read_only: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub traits: BTreeMap<String, TraitDescription>,
}

#[derive(Debug, Clone)]
pub struct Widget {
    pub kind: String,
    /// ES module source or URL the browser loads to render the widget.
    pub module_url: String,
    traits: BTreeMap<String, Trait>,
}

impl Widget {
    pub fn new(kind: impl Into<String>, module_url: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            module_url: module_url.into(),
            traits: BTreeMap::new(),
        }
    }

    /// Add a synchronized property.
    pub fn with(mut self, name: impl Into<String>, default: impl Serialize) -> Self {
        self.insert_trait(name.into(), to_value(default), true, false);
        self
    }

    /// Add a property that stays on the server.
    pub fn with_private(mut self, name: impl Into<String>, default: impl Serialize) -> Self {
        self.insert_trait(name.into(), to_value(default), false, false);
        self
    }

    /// Add a fire-once action property such as a button's `clicked`.
    pub fn with_action(mut self, name: impl Into<String>) -> Self {
        self.insert_trait(name.into(), Value::Bool(false), true, true);
        self
    }

    fn insert_trait(&mut self, name: String, default: Value, sync: bool, fire_once: bool) {
        self.traits.insert(
            name,
            Trait {
                value: default.clone(),
                default,
                sync,
                fire_once,
            },
        );
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.traits.get(property).map(|t| &t.value)
    }

    pub fn traits(&self) -> impl Iterator<Item = (&str, &Trait)> {
        self.traits.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn describe(&self) -> WidgetDescription {
        let traits = self
            .traits
            .iter()
            .map(|(name, t)| {
                let kind = if t.fire_once {
                    "action"
                } else {
                    value_type(&t.default)
                };
                let described = TraitDescription {
                    kind,
                    default: t.default.clone(),
                    read_only: !t.sync,
                    description: None,
                };
                (name.clone(), described)
            })
            .collect();
        WidgetDescription {
            kind: self.kind.clone(),
            traits,
        }
    }

    pub fn config(&self) -> WidgetConfig {
        let defaults = self
            .traits
            .iter()
            .filter(|(_, t)| t.sync && !t.fire_once)
            .map(|(k, t)| (k.clone(), t.value.clone()))
            .collect();
        WidgetConfig {
            module_url: self.module_url.clone(),
            defaults,
        }
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Property equality, with numbers compared by value so `5` equals `5.0`.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// A property change delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub widget_id: String,
    pub property: String,
    pub old: Value,
    pub new: Value,
    /// Client connection that requested the change, if it came from one.
    pub origin: Option<String>,
}

struct PendingSet {
    widget_id: String,
    property: String,
    value: Value,
    origin: Option<String>,
}

/// Read access to the graph plus a queue for follow-up changes, handed to
/// observers while a change is being dispatched.
pub struct Effects<'a> {
    widgets: &'a HashMap<String, Widget>,
    queued: Vec<PendingSet>,
}

impl Effects<'_> {
    pub fn get(&self, widget_id: &str, property: &str) -> Option<&Value> {
        self.widgets.get(widget_id)?.get(property)
    }

    /// Queue a change; applied after the current observers have run.
    pub fn set(&mut self, widget_id: &str, property: &str, value: impl Serialize) {
        self.queued.push(PendingSet {
            widget_id: widget_id.to_string(),
            property: property.to_string(),
            value: to_value(value),
            origin: None,
        });
    }
}

pub type Observer = Box<dyn FnMut(&Change, &mut Effects<'_>)>;

#[derive(Default)]
pub struct WidgetGraph {
    order: Vec<String>,
    widgets: HashMap<String, Widget>,
    observers: HashMap<(String, String), Vec<Observer>>,
    pending: VecDeque<PendingSet>,
}

impl WidgetGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a widget, replacing any widget with the same id.
    pub fn insert(&mut self, id: impl Into<String>, widget: Widget) -> &mut Self {
        let id = id.into();
        if self.widgets.insert(id.clone(), widget).is_none() {
            self.order.push(id);
        }
        self
    }

    pub fn widget_ids(&self) -> &[String] {
        &self.order
    }

    pub fn widget(&self, id: &str) -> Option<&Widget> {
        self.widgets.get(id)
    }

    pub fn get(&self, widget_id: &str, property: &str) -> Option<&Value> {
        self.widgets.get(widget_id)?.get(property)
    }

    pub fn describe(&self) -> BTreeMap<String, WidgetDescription> {
        self.order
            .iter()
            .filter_map(|id| Some((id.clone(), self.widgets.get(id)?.describe())))
            .collect()
    }

    pub fn configs(&self) -> BTreeMap<String, WidgetConfig> {
        self.order
            .iter()
            .filter_map(|id| Some((id.clone(), self.widgets.get(id)?.config())))
            .collect()
    }

    /// Every `(widget_id, property, fire_once)` mirrored to the browser.
    pub fn synced_properties(&self) -> Vec<(String, String, bool)> {
        self.order
            .iter()
            .filter_map(|id| self.widgets.get(id).map(|w| (id, w)))
            .flat_map(|(id, w)| {
                w.traits()
                    .filter(|(_, t)| t.sync)
                    .map(|(name, t)| (id.clone(), name.to_string(), t.fire_once))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn observe<F>(&mut self, widget_id: &str, property: &str, observer: F) -> Result<()>
    where
        F: FnMut(&Change, &mut Effects<'_>) + 'static,
    {
        self.check_target(widget_id, property)?;
        self.observers
            .entry((widget_id.to_string(), property.to_string()))
            .or_default()
            .push(Box::new(observer));
        Ok(())
    }

    pub fn set(&mut self, widget_id: &str, property: &str, value: impl Serialize) -> Result<()> {
        self.set_from(None, widget_id, property, to_value(value))
    }

    /// Apply a change on behalf of `origin` and run every observer it
    /// triggers, including cascaded changes.
    pub fn set_from(
        &mut self,
        origin: Option<&str>,
        widget_id: &str,
        property: &str,
        value: Value,
    ) -> Result<()> {
        self.check_target(widget_id, property)?;
        self.pending.push_back(PendingSet {
            widget_id: widget_id.to_string(),
            property: property.to_string(),
            value,
            origin: origin.map(str::to_string),
        });
        self.drain();
        Ok(())
    }

    fn check_target(&self, widget_id: &str, property: &str) -> Result<()> {
        match self.widgets.get(widget_id) {
            Some(w) if w.traits.contains_key(property) => Ok(()),
            _ => Err(Error::UnknownTarget {
                widget_id: widget_id.to_string(),
                property: property.to_string(),
            }),
        }
    }

    fn drain(&mut self) {
        let mut steps = 0;
        while let Some(set) = self.pending.pop_front() {
            steps += 1;
            if steps > MAX_CASCADE {
                warn!(
                    widget_id = %set.widget_id,
                    property = %set.property,
                    "cascade limit reached, dropping remaining changes"
                );
                self.pending.clear();
                break;
            }

            let Some(tr) = self
                .widgets
                .get_mut(&set.widget_id)
                .and_then(|w| w.traits.get_mut(&set.property))
            else {
                warn!(widget_id = %set.widget_id, property = %set.property, "unknown property in cascade");
                continue;
            };
            if !tr.fire_once && same_value(&tr.value, &set.value) {
                continue;
            }
            let old = if tr.fire_once {
                tr.default.clone()
            } else {
                std::mem::replace(&mut tr.value, set.value.clone())
            };

            let change = Change {
                widget_id: set.widget_id,
                property: set.property,
                old,
                new: set.value,
                origin: set.origin,
            };
            let key = (change.widget_id.clone(), change.property.clone());
            let Some(mut observers) = self.observers.remove(&key) else {
                continue;
            };
            let mut effects = Effects {
                widgets: &self.widgets,
                queued: Vec::new(),
            };
            for observer in observers.iter_mut() {
                observer(&change, &mut effects);
            }
            let queued = effects.queued;
            self.observers.insert(key, observers);
            self.pending.extend(queued);
        }
    }
}

// Built-in widgets. The ES modules are minimal renderers; real widget
// libraries supply their own `module_url`.

const NUMBER_ESM: &str = r#"function render({ model, el }) {
  const input = document.createElement("input");
  input.type = "number";
  input.value = model.get("value");
  input.onchange = () => { model.set("value", Number(input.value)); model.save_changes(); };
  model.on("change:value", () => { input.value = model.get("value"); });
  const label = document.createElement("label");
  label.textContent = model.get("label");
  el.append(label, input);
}
export default { render };"#;

const BUTTON_ESM: &str = r#"function render({ model, el }) {
  const btn = document.createElement("button");
  btn.textContent = model.get("label");
  btn.onclick = () => { model.set("clicked", true); model.save_changes(); };
  el.append(btn);
}
export default { render };"#;

const DROPDOWN_ESM: &str = r#"function render({ model, el }) {
  const select = document.createElement("select");
  for (const opt of model.get("options")) {
    const o = document.createElement("option");
    o.value = o.textContent = opt;
    select.append(o);
  }
  select.value = model.get("value");
  select.onchange = () => { model.set("value", select.value); model.save_changes(); };
  model.on("change:value", () => { select.value = model.get("value"); });
  el.append(select);
}
export default { render };"#;

const TABS_ESM: &str = r#"function render({ model, el }) {
  for (const tab of model.get("tabs")) {
    const b = document.createElement("button");
    b.textContent = tab;
    b.onclick = () => { model.set("active_tab", tab); model.save_changes(); };
    el.append(b);
  }
}
export default { render };"#;

const PARENT_VISIBILITY_ESM: &str = r#"function render({ model, el }) {
  const parent = el.parentElement;
  el.style.display = "none";
  const apply = () => {
    if (!parent) return;
    parent.style.display = model.get("visible") ? model.get("display") : "none";
  };
  apply();
  model.on("change:visible", apply);
  model.on("change:display", apply);
}
export default { render };"#;

pub fn number(label: &str, default: f64) -> Widget {
    Widget::new("Number", NUMBER_ESM)
        .with("label", label)
        .with("value", default)
}

pub fn button(label: &str) -> Widget {
    Widget::new("Button", BUTTON_ESM)
        .with("label", label)
        .with_action("clicked")
}

pub fn dropdown(label: &str, options: &[&str]) -> Widget {
    Widget::new("DropDown", DROPDOWN_ESM)
        .with("label", label)
        .with("options", options)
        .with("value", options.first().copied().unwrap_or_default())
}

pub fn tabs(names: &[&str]) -> Widget {
    Widget::new("Tabs", TABS_ESM)
        .with("tabs", names)
        .with("active_tab", names.first().copied().unwrap_or_default())
}

/// Shows or hides the element that contains it.
pub fn parent_visibility(visible: bool) -> Widget {
    Widget::new("ParentVisibility", PARENT_VISIBILITY_ESM)
        .with("visible", visible)
        .with("display", "block")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn counter_graph() -> WidgetGraph {
        let mut graph = WidgetGraph::new();
        graph.insert("counter", number("Counter", 0.0));
        graph.insert("increment", button("Increment"));
        graph
            .observe("increment", "clicked", |_, fx| {
                let current = fx.get("counter", "value").and_then(Value::as_f64).unwrap_or(0.0);
                fx.set("counter", "value", current + 1.0);
            })
            .unwrap();
        graph
    }

    fn record(graph: &mut WidgetGraph, widget_id: &str, property: &str) -> Rc<RefCell<Vec<Change>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        graph
            .observe(widget_id, property, move |change, _| sink.borrow_mut().push(change.clone()))
            .unwrap();
        seen
    }

    #[test]
    fn test_insert_preserves_order() {
        let graph = counter_graph();
        assert_eq!(graph.widget_ids(), ["counter", "increment"]);
        assert_eq!(graph.widget("increment").unwrap().kind, "Button");
    }

    #[test]
    fn test_observer_fires_on_change_only() {
        let mut graph = counter_graph();
        let seen = record(&mut graph, "counter", "value");
        graph.set("counter", "value", 5.0).unwrap();
        graph.set("counter", "value", 5.0).unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old, json!(0.0));
        assert_eq!(seen[0].new, json!(5.0));
        assert_eq!(seen[0].origin, None);
    }

    #[test]
    fn test_integer_equal_to_float_is_not_a_change() {
        let mut graph = counter_graph();
        graph.set("counter", "value", 5.0).unwrap();
        let seen = record(&mut graph, "counter", "value");
        graph.set_from(Some("c1"), "counter", "value", json!(5)).unwrap();
        assert!(seen.borrow().is_empty());
        assert_eq!(graph.get("counter", "value"), Some(&json!(5.0)));

        graph.set_from(Some("c1"), "counter", "value", json!(6)).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert!(!same_value(&json!(1), &json!("1")));
    }

    #[test]
    fn test_describe_lists_traits_with_types() {
        let mut graph = counter_graph();
        graph.insert("secret", Widget::new("Hidden", "").with_private("token", "abc"));
        let described = graph.describe();
        assert_eq!(described.keys().collect::<Vec<_>>(), ["counter", "increment", "secret"]);

        let counter = &described["counter"].traits["value"];
        assert_eq!(counter.kind, "number");
        assert_eq!(counter.default, json!(0.0));
        assert!(!counter.read_only);
        assert_eq!(described["increment"].kind, "Button");
        assert_eq!(described["increment"].traits["clicked"].kind, "action");
        assert!(described["secret"].traits["token"].read_only);

        let raw = serde_json::to_value(&described["counter"]).unwrap();
        assert_eq!(raw["traits"]["value"]["type"], "number");
    }

    #[test]
    fn test_action_fires_every_time_and_resets() {
        let mut graph = counter_graph();
        graph.set("increment", "clicked", true).unwrap();
        graph.set("increment", "clicked", true).unwrap();
        assert_eq!(graph.get("counter", "value"), Some(&json!(2.0)));
        assert_eq!(graph.get("increment", "clicked"), Some(&json!(false)));
    }

    #[test]
    fn test_cascade_keeps_origin_on_direct_change_only() {
        let mut graph = counter_graph();
        let clicks = record(&mut graph, "increment", "clicked");
        let values = record(&mut graph, "counter", "value");
        graph
            .set_from(Some("c1"), "increment", "clicked", json!(true))
            .unwrap();
        assert_eq!(clicks.borrow()[0].origin.as_deref(), Some("c1"));
        assert_eq!(values.borrow()[0].origin, None);
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let mut graph = counter_graph();
        assert!(matches!(
            graph.set("missing", "value", 1),
            Err(Error::UnknownTarget { .. })
        ));
        assert!(graph.set("counter", "missing", 1).is_err());
        assert!(graph.observe("counter", "nope", |_, _| {}).is_err());
    }

    #[test]
    fn test_runaway_cascade_is_bounded() {
        let mut graph = WidgetGraph::new();
        graph.insert("n", number("n", 0.0));
        graph
            .observe("n", "value", |change, fx| {
                let v = change.new.as_f64().unwrap_or(0.0);
                fx.set("n", "value", v + 1.0);
            })
            .unwrap();
        graph.set("n", "value", 1.0).unwrap();
        let v = graph.get("n", "value").and_then(Value::as_f64).unwrap();
        assert!(v <= (MAX_CASCADE + 1) as f64);
    }

    #[test]
    fn test_configs_skip_actions_and_private_traits() {
        let mut graph = counter_graph();
        graph.insert("secret", Widget::new("Hidden", "").with_private("token", "abc"));
        let configs = graph.configs();
        assert_eq!(configs["counter"].defaults["value"], json!(0.0));
        assert!(!configs["increment"].defaults.contains_key("clicked"));
        assert!(configs["secret"].defaults.is_empty());

        let synced = graph.synced_properties();
        assert!(synced.contains(&("increment".to_string(), "clicked".to_string(), true)));
        assert!(!synced.iter().any(|(w, _, _)| w == "secret"));
    }

    #[test]
    fn test_numeric_array_property() {
        let mut graph = WidgetGraph::new();
        graph.insert("chart", Widget::new("Chart", "").with("series", Vec::<i64>::new()));
        graph.set("chart", "series", vec![1, 2, 3]).unwrap();
        assert_eq!(graph.get("chart", "series"), Some(&json!([1, 2, 3])));
    }
}
