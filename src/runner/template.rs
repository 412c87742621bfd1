//! Template rendering for task bodies
//!
//! Tasks with `template: true` have `{{ .Path }}` expressions in their body,
//! `cwd` and `with` values substituted before execution, once per host.

use crate::error::{TemplateError, TemplateResult};
use crate::runner::env::InheritedEnv;
use crate::runner::task::{Host, TaskDefinition};
use regex::Regex;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

const DEFAULT_SSH_PORT: u16 = 22;

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("valid regex"))
}

/// Values visible to `{{ }}` expressions
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub task: &'a TaskDefinition,
    pub host: Option<&'a Host>,
    pub context: Option<&'a str>,
    pub inherited: &'a InheritedEnv,
}

impl<'a> TemplateContext<'a> {
    pub fn new(task: &'a TaskDefinition, inherited: &'a InheritedEnv) -> Self {
        TemplateContext {
            task,
            host: None,
            context: None,
            inherited,
        }
    }

    pub fn with_host(mut self, host: Option<&'a Host>) -> Self {
        self.host = host;
        self
    }

    pub fn with_context(mut self, context: Option<&'a str>) -> Self {
        self.context = context;
        self
    }

    fn lookup(&self, expression: &str) -> TemplateResult<String> {
        let path = expression
            .strip_prefix('.')
            .ok_or_else(|| TemplateError::InvalidSyntax(format!("'{}' must start with '.'", expression)))?;
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| !valid_segment(s)) {
            return Err(TemplateError::InvalidSyntax(format!(
                "malformed reference '{}'",
                expression
            )));
        }

        let unresolved = || TemplateError::Unresolved(expression.to_string());

        match segments.as_slice() {
            ["Host", field] => {
                let host = self.host.ok_or_else(unresolved)?;
                match *field {
                    "Name" => Ok(host.name.clone()),
                    "Address" => Ok(host.address.clone()),
                    "User" => host.user.clone().ok_or_else(unresolved),
                    "Port" => Ok(host.port.unwrap_or(DEFAULT_SSH_PORT).to_string()),
                    "Tags" => Ok(host.tags.join(",")),
                    _ => Err(unresolved()),
                }
            }
            ["Context"] => self.context.map(str::to_string).ok_or_else(unresolved),
            ["Task", "Name"] => Ok(self.task.name.clone()),
            ["Env", key] => self
                .inherited
                .get(key)
                .map(str::to_string)
                .or_else(|| env::var(key).ok())
                .ok_or_else(unresolved),
            ["Outputs", task, key @ ..] if !key.is_empty() => self
                .inherited
                .output(task, &key.join("."))
                .map(str::to_string)
                .ok_or_else(unresolved),
            ["With", key] => self.task.with.get(*key).cloned().ok_or_else(unresolved),
            _ => Err(unresolved()),
        }
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Render every `{{ .Path }}` expression in `text`
pub fn render(text: &str, ctx: &TemplateContext) -> TemplateResult<String> {
    let mut rendered = String::with_capacity(text.len());
    let mut last = 0;

    for caps in expression_pattern().captures_iter(text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let literal = &text[last..whole.start()];
        check_literal(literal)?;
        rendered.push_str(literal);

        let expression = inner.as_str().trim();
        if expression.is_empty() {
            return Err(TemplateError::InvalidSyntax("empty expression".to_string()));
        }
        rendered.push_str(&ctx.lookup(expression)?);
        last = whole.end();
    }

    let tail = &text[last..];
    check_literal(tail)?;
    rendered.push_str(tail);
    Ok(rendered)
}

fn check_literal(literal: &str) -> TemplateResult<()> {
    if literal.contains("{{") {
        return Err(TemplateError::InvalidSyntax("unterminated '{{'".to_string()));
    }
    Ok(())
}

/// The parts of a task that templates may change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTask {
    pub body: String,
    pub working_dir: PathBuf,
    pub with: BTreeMap<String, String>,
}

impl RenderedTask {
    /// Render the task for one host, or copy it unchanged when templating is off
    pub fn render(ctx: &TemplateContext) -> TemplateResult<Self> {
        let task = ctx.task;
        if !task.template {
            return Ok(RenderedTask {
                body: task.body.clone(),
                working_dir: task.working_dir.clone(),
                with: task.with.clone(),
            });
        }

        let with = task
            .with
            .iter()
            .map(|(key, value)| Ok((key.clone(), render(value, ctx)?)))
            .collect::<TemplateResult<_>>()?;

        Ok(RenderedTask {
            body: render(&task.body, ctx)?,
            working_dir: PathBuf::from(render(&task.working_dir.to_string_lossy(), ctx)?),
            with,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::runner::env::{ChannelData, Exported};
    use std::path::Path;

    fn task(body: &str, with: &[(&str, &str)]) -> TaskDefinition {
        let config = TaskConfig {
            run: body.to_string(),
            template: true,
            with: with
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        TaskDefinition::from_config("deploy", &config, Path::new("/srv"), &["sh".into(), "-c".into()])
            .unwrap()
    }

    fn host() -> Host {
        Host {
            name: "web1".to_string(),
            address: "10.0.0.5".to_string(),
            user: Some("ops".to_string()),
            port: None,
            tags: vec!["web".to_string(), "eu".to_string()],
        }
    }

    fn inherited() -> InheritedEnv {
        let data = ChannelData {
            env: vec![("RELEASE".to_string(), "42".to_string())],
            path: vec![],
            outputs: vec![("version".to_string(), "1.2.3".to_string())],
        };
        let build = Exported::from_node("build", &InheritedEnv::default(), data);
        InheritedEnv::merge([("build", &build)])
    }

    #[test]
    fn test_render_host_fields() {
        let task = task("ssh {{ .Host.User }}@{{.Host.Address}}:{{ .Host.Port }} [{{ .Host.Tags }}]", &[]);
        let host = host();
        let env = InheritedEnv::default();
        let ctx = TemplateContext::new(&task, &env).with_host(Some(&host));
        assert_eq!(
            render(&task.body, &ctx).unwrap(),
            "ssh ops@10.0.0.5:22 [web,eu]"
        );
    }

    #[test]
    fn test_render_context_task_env_outputs_with() {
        let task = task(
            "{{ .Task.Name }} {{ .Context }} {{ .Env.RELEASE }} {{ .Outputs.build.version }} {{ .With.region }}",
            &[("region", "eu-west-1")],
        );
        let env = inherited();
        let ctx = TemplateContext::new(&task, &env).with_context(Some("prod"));
        assert_eq!(
            render(&task.body, &ctx).unwrap(),
            "deploy prod 42 1.2.3 eu-west-1"
        );
    }

    #[test]
    fn test_unresolved_references() {
        let task = task("", &[]);
        let env = InheritedEnv::default();
        let ctx = TemplateContext::new(&task, &env);

        for text in [
            "{{ .Host.Name }}",
            "{{ .Context }}",
            "{{ .Outputs.build.version }}",
            "{{ .With.missing }}",
            "{{ .Nope }}",
            "{{ .Env.RUNBOOK_TEMPLATE_SURELY_UNSET }}",
        ] {
            assert!(
                matches!(render(text, &ctx), Err(TemplateError::Unresolved(_))),
                "{} should be unresolved",
                text
            );
        }
    }

    #[test]
    fn test_invalid_syntax() {
        let task = task("", &[]);
        let env = InheritedEnv::default();
        let ctx = TemplateContext::new(&task, &env);

        for text in ["echo {{ .Task.Name", "{{ }}", "{{ Task.Name }}", "{{ .Task..Name }}"] {
            assert!(
                matches!(render(text, &ctx), Err(TemplateError::InvalidSyntax(_))),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_plain_text_passes_through() {
        let task = task("", &[]);
        let env = InheritedEnv::default();
        let ctx = TemplateContext::new(&task, &env);
        assert_eq!(render("echo ${HOME} }}", &ctx).unwrap(), "echo ${HOME} }}");
    }

    #[test]
    fn test_rendered_task_covers_with_and_cwd() {
        let mut task = task("cd {{ .With.dir }}", &[("dir", "/opt/{{ .Host.Name }}")]);
        task.working_dir = PathBuf::from("/srv/{{ .Host.Name }}");
        let host = host();
        let env = InheritedEnv::default();
        let ctx = TemplateContext::new(&task, &env).with_host(Some(&host));

        let rendered = RenderedTask::render(&ctx).unwrap();
        assert_eq!(rendered.working_dir, PathBuf::from("/srv/web1"));
        assert_eq!(rendered.with["dir"], "/opt/web1");
        // .With reads the declared value, not the rendered one
        assert_eq!(rendered.body, "cd /opt/{{ .Host.Name }}");
    }

    #[test]
    fn test_templating_off_keeps_body() {
        let mut task = task("echo {{ .Anything", &[]);
        task.template = false;
        let env = InheritedEnv::default();
        let rendered = RenderedTask::render(&TemplateContext::new(&task, &env)).unwrap();
        assert_eq!(rendered.body, "echo {{ .Anything");
    }
}
