//! Scheduler manifest rendering.
//!
//! Templates are JSON text with `{{name}}` placeholders. Values are
//! substituted verbatim, so string values must be quoted in the template
//! (`"image": "{{image}}"`) and numbers left bare (`"cpu": {{cpu}}`).

use regex::{Captures, Regex};
use slipway_state::TaskDefinition;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown placeholder(s): {}", .0.join(", "))]
    UnknownPlaceholders(Vec<String>),

    #[error("rendered manifest is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("placeholder pattern: {0}")]
    Pattern(String),
}

/// Template used when `[task] manifest_template` is not set.
pub const DEFAULT_TEMPLATE: &str = r#"{
  "family": "{{service}}",
  "containers": [
    {
      "name": "{{service}}",
      "image": "{{image}}",
      "cpu": {{cpu}},
      "memory": {{memory}},
      "portMappings": [{ "containerPort": {{port}} }],
      "labels": { "slipway.version": "{{version}}" }
    }
  ]
}"#;

/// Render `template` for a task definition and parse the result.
pub fn render_manifest(
    template: &str,
    service: &str,
    task: &TaskDefinition,
) -> Result<serde_json::Value, RenderError> {
    let placeholder_re = Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
        .map_err(|e| RenderError::Pattern(e.to_string()))?;
    let mut unknown = Vec::new();
    let rendered = placeholder_re.replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        match name {
            "image" => task.image.clone(),
            "version" => task.version.clone(),
            "cpu" => task.cpu.to_string(),
            "memory" => task.memory_mib.to_string(),
            "port" => task.container_port.to_string(),
            "service" => service.to_string(),
            other => {
                if !unknown.iter().any(|u| u == other) {
                    unknown.push(other.to_string());
                }
                String::new()
            }
        }
    });

    if !unknown.is_empty() {
        return Err(RenderError::UnknownPlaceholders(unknown));
    }
    serde_json::from_str(&rendered).map_err(|e| RenderError::InvalidJson(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskDefinition {
        TaskDefinition {
            image: "registry.example.com/team/api:v2".to_string(),
            version: "v2".to_string(),
            cpu: 512,
            memory_mib: 1024,
            container_port: 8080,
            manifest: serde_json::Value::Null,
        }
    }

    #[test]
    fn default_template_renders() {
        let manifest = render_manifest(DEFAULT_TEMPLATE, "api", &task()).unwrap();
        let container = &manifest["containers"][0];
        assert_eq!(manifest["family"], "api");
        assert_eq!(container["image"], "registry.example.com/team/api:v2");
        assert_eq!(container["cpu"], 512);
        assert_eq!(container["memory"], 1024);
        assert_eq!(container["portMappings"][0]["containerPort"], 8080);
        assert_eq!(container["labels"]["slipway.version"], "v2");
    }

    #[test]
    fn whitespace_inside_braces_is_allowed() {
        let manifest = render_manifest(r#"{"v": "{{ version }}"}"#, "api", &task()).unwrap();
        assert_eq!(manifest["v"], "v2");
    }

    #[test]
    fn unknown_placeholders_are_reported_once() {
        let err = render_manifest(r#"{"a": "{{region}}", "b": "{{region}}", "c": "{{zone}}"}"#, "api", &task())
            .unwrap_err();
        assert_eq!(
            err,
            RenderError::UnknownPlaceholders(vec!["region".to_string(), "zone".to_string()])
        );
    }

    #[test]
    fn invalid_json_is_rejected() {
        // Unquoted string value.
        let err = render_manifest(r#"{"image": {{image}}}"#, "api", &task()).unwrap_err();
        assert!(matches!(err, RenderError::InvalidJson(_)));
    }
}
