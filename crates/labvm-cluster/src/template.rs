//! Deployment manifest template.
//!
//! The template is a Tera document whose only variable is `vm_name`. It may
//! use the variable several times (name, labels, selector). Rendering is a
//! pure function of the workload name.

use std::error::Error as _;
use std::path::Path;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::Deployment;
use tera::{Context as TeraContext, Tera};

use crate::error::TemplateError;

/// Bundled template, used when no template file is configured.
pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/vm-deployment.yaml.tera");

/// Template variable substituted with the workload name.
pub const NAME_VARIABLE: &str = "vm_name";

const TEMPLATE_NAME: &str = "deployment.yaml";

/// A compiled manifest template.
#[derive(Debug, Clone)]
pub struct ManifestTemplate {
    tera: Tera,
}

impl ManifestTemplate {
    /// Load and compile the template file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let source = std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&source)
    }

    /// Compile a template from source.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        if !references_name(source) {
            return Err(TemplateError::MissingPlaceholder);
        }
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, source)
            .map_err(|e| TemplateError::Compile(error_chain(&e)))?;
        Ok(Self { tera })
    }

    /// The bundled template.
    pub fn bundled() -> Result<Self, TemplateError> {
        Self::parse(DEFAULT_TEMPLATE)
    }

    /// Substitute `name` and return the manifest text.
    pub fn render_yaml(&self, name: &str) -> Result<String, TemplateError> {
        let mut context = TeraContext::new();
        context.insert(NAME_VARIABLE, name);
        self.tera
            .render(TEMPLATE_NAME, &context)
            .map_err(|e| TemplateError::Render(error_chain(&e)))
    }

    /// Substitute `name` and parse the result into a Deployment.
    ///
    /// The Deployment must be named `name`: the name is the only link
    /// between a queued operation and the cluster resource.
    pub fn render(&self, name: &str) -> Result<Deployment, TemplateError> {
        let yaml = self.render_yaml(name)?;
        let deployment: Deployment =
            serde_yaml_ng::from_str(&yaml).map_err(|e| TemplateError::Parse(e.to_string()))?;

        match deployment.metadata.name.as_deref() {
            Some(found) if found == name => Ok(deployment),
            found => Err(TemplateError::NameMismatch {
                expected: name.to_string(),
                found: found.map(str::to_string),
            }),
        }
    }
}

impl FromStr for ManifestTemplate {
    type Err = TemplateError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::parse(source)
    }
}

/// Whether some `{{ ... }}` expression in `source` starts with `vm_name`.
fn references_name(source: &str) -> bool {
    source.split("{{").skip(1).any(|segment| {
        segment
            .split("}}")
            .next()
            .map(|expr| {
                let expr = expr.trim_start_matches('-').trim_start();
                expr.strip_prefix(NAME_VARIABLE).is_some_and(|rest| {
                    rest.chars()
                        .next()
                        .is_none_or(|c| !(c.is_alphanumeric() || c == '_'))
                })
            })
            .unwrap_or(false)
    })
}

/// Tera's top-level message hides the cause; flatten the source chain.
fn error_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_template_renders_named_deployment() {
        let template = ManifestTemplate::bundled().unwrap();
        let deployment = template.render("vm-abc").unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("vm-abc"));
        let spec = deployment.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some("vm-abc"));
        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(pod_labels.get("app").map(String::as_str), Some("vm-abc"));
    }

    #[test]
    fn rendering_is_pure() {
        let template = ManifestTemplate::bundled().unwrap();
        assert_eq!(
            template.render_yaml("vm-1").unwrap(),
            template.render_yaml("vm-1").unwrap()
        );
        assert_ne!(
            template.render_yaml("vm-1").unwrap(),
            template.render_yaml("vm-2").unwrap()
        );
    }

    #[test]
    fn from_str_compiles() {
        let template: ManifestTemplate = DEFAULT_TEMPLATE.parse().unwrap();
        assert!(template.render("vm-str").is_ok());
    }

    #[test]
    fn template_without_placeholder_is_rejected() {
        let err = ManifestTemplate::parse("apiVersion: apps/v1\nkind: Deployment\n").unwrap_err();
        assert!(matches!(err, TemplateError::MissingPlaceholder));
    }

    #[test]
    fn similarly_named_variable_is_not_the_placeholder() {
        assert!(!references_name("name: {{ vm_name_suffix }}"));
        assert!(references_name("name: {{vm_name}}"));
        assert!(references_name("name: {{- vm_name | lower }}"));
    }

    #[test]
    fn unclosed_tag_fails_to_compile() {
        let err = ManifestTemplate::parse("name: {{ vm_name }}\n{% if %}").unwrap_err();
        assert!(matches!(err, TemplateError::Compile(_)));
    }

    #[test]
    fn unknown_variable_fails_to_render() {
        let template =
            ManifestTemplate::parse("metadata:\n  name: {{ vm_name }}-{{ student }}\n").unwrap();
        let err = template.render("vm-abc").unwrap_err();
        assert!(matches!(err, TemplateError::Render(_)));
    }

    #[test]
    fn non_deployment_document_fails_to_parse() {
        let template = ManifestTemplate::parse(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: {{ vm_name }}\n",
        )
        .unwrap();
        assert!(matches!(
            template.render("vm-abc").unwrap_err(),
            TemplateError::Parse(_)
        ));
    }

    #[test]
    fn broken_yaml_fails_to_parse() {
        let template = ManifestTemplate::parse("metadata: [ {{ vm_name }}\n").unwrap();
        assert!(matches!(
            template.render("vm-abc").unwrap_err(),
            TemplateError::Parse(_)
        ));
    }

    #[test]
    fn manifest_named_differently_is_rejected() {
        let template = ManifestTemplate::parse(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: fixed\n  labels:\n    app: {{ vm_name }}\n",
        )
        .unwrap();
        let err = template.render("vm-abc").unwrap_err();
        assert!(matches!(
            err,
            TemplateError::NameMismatch { ref found, .. } if found.as_deref() == Some("fixed")
        ));
    }

    #[test]
    fn from_file_reads_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.yaml.tera");
        std::fs::write(&path, DEFAULT_TEMPLATE).unwrap();
        let template = ManifestTemplate::from_file(&path).unwrap();
        assert!(template.render("vm-file").is_ok());
    }

    #[test]
    fn from_missing_file_is_io_error() {
        let err = ManifestTemplate::from_file(Path::new("/nonexistent/vm.yaml.tera")).unwrap_err();
        assert!(matches!(err, TemplateError::Io { .. }));
    }
}
