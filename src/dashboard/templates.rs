use askama::Template;
use axum::response::Html;
use regex::Regex;
use std::sync::LazyLock;

use crate::app::LaunchSpec;
use crate::error::{Error, Result};
use crate::utils::html_escape;

const CLIENT_SCRIPT: &str = r#"<script type="module" src="/numerous.js"></script>"#;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap());

// ── Askama Templates ─────────────────────────────────────────────────

#[derive(Template)]
#[template(path = "error.html")]
pub struct ErrorTemplate<'a> {
    pub title: &'a str,
    pub dev: bool,
    pub error_type: &'a str,
    pub message: &'a str,
    pub traceback: &'a str,
}

/// Error page shown when a session cannot be started. Details are only
/// included in development mode.
pub fn render_error(err: &Error, dev: bool) -> Html<String> {
    let (message, traceback) = match err {
        Error::AppProcess {
            message, traceback, ..
        } => (message.clone(), traceback.as_str()),
        other => (other.to_string(), ""),
    };
    let template = ErrorTemplate {
        title: "Application error",
        dev,
        error_type: err.kind(),
        message: &message,
        traceback,
    };
    Html(template.render().unwrap_or_else(|e| {
        format!("<h1>Template error: {}</h1>", html_escape(&e.to_string()))
    }))
}

// ── App page rendering ───────────────────────────────────────────────

/// Renders the user's page template for a session.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, launch: &LaunchSpec, widget_ids: &[String]) -> Result<String>;
}

/// Loads `{base_dir}/{template}` from disk on every request, so template
/// edits show up without a restart.
pub struct FileTemplateRenderer;

impl TemplateRenderer for FileTemplateRenderer {
    fn render(&self, launch: &LaunchSpec, widget_ids: &[String]) -> Result<String> {
        let path = launch.base_dir.join(&launch.template);
        let source = std::fs::read_to_string(&path)
            .map_err(|e| Error::Template(format!("{}: {e}", path.display())))?;
        Ok(fill_template(&source, widget_ids, &launch.module_path))
    }
}

/// Substitute `{{ widget_id }}` with the widget's container and `{{ title }}`
/// with `title`, then make sure the client runtime is loaded. Unknown
/// placeholders render empty.
pub fn fill_template(source: &str, widget_ids: &[String], title: &str) -> String {
    let page = PLACEHOLDER_RE.replace_all(source, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        if widget_ids.iter().any(|id| id == name) {
            format!(r#"<div id="{}"></div>"#, html_escape(name))
        } else if name == "title" {
            html_escape(title)
        } else {
            String::new()
        }
    });
    inject_client_script(&page)
}

/// Distinct placeholder names in `source`, in order of first use.
pub fn template_variables(source: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER_RE.captures_iter(source) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn inject_client_script(page: &str) -> String {
    if page.contains("/numerous.js") {
        return page.to_string();
    }
    match page.rfind("</body>") {
        Some(pos) => format!("{}{}\n{}", &page[..pos], CLIENT_SCRIPT, &page[pos..]),
        None => format!("{page}\n{CLIENT_SCRIPT}\n"),
    }
}
