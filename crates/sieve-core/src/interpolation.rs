//! `${{ ... }}` template rendering for concurrency groups and step scripts.

use crate::trigger::TriggerEvent;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("valid interpolation regex"));

/// Context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Event and pipeline variables: `workflow`, `ref`, `event`, ...
    pub variables: HashMap<String, String>,
    /// Pipeline/job/step env, reachable as `env.NAME`.
    pub env: HashMap<String, String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables describing a pipeline invocation.
    ///
    /// - `workflow`: pipeline name
    /// - `ref`: PR head branch, or the pushed ref
    /// - `event`: `push` or `pull_request`
    /// - `head_branch`, `base_branch`, `target_branch`
    pub fn for_event(workflow: &str, event: &TriggerEvent) -> Self {
        let mut variables = HashMap::new();
        variables.insert("workflow".to_string(), workflow.to_string());
        variables.insert("ref".to_string(), event.concurrency_ref().to_string());
        variables.insert("event".to_string(), event.kind.to_string());
        variables.insert("target_branch".to_string(), event.target_branch().to_string());
        if let Some(head) = &event.head_branch {
            variables.insert("head_branch".to_string(), head.clone());
        }
        if let Some(base) = &event.base_branch {
            variables.insert("base_branch".to_string(), base.clone());
        }
        Self {
            variables,
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, env: &HashMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Interpolate `${{ name }}` and `${{ env.NAME }}` in a string.
    /// Unknown names render empty.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self.env.get(var_name).cloned().unwrap_or_default();
        }
        self.variables.get(expr).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::ChangeSet;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_group_for_push() {
        let event = TriggerEvent::push("refs/heads/main", ChangeSet::default());
        let ctx = InterpolationContext::for_event("ci", &event);
        assert_eq!(
            ctx.interpolate("${{ workflow }}-${{ ref }}"),
            "ci-main"
        );
    }

    #[test]
    fn test_pull_request_ref_is_head_branch() {
        let event = TriggerEvent::pull_request("feature/login", "main", ChangeSet::default());
        let ctx = InterpolationContext::for_event("ci", &event);
        assert_eq!(ctx.interpolate("${{workflow}}-${{ref}}"), "ci-feature/login");
        assert_eq!(
            ctx.interpolate("${{ event }} into ${{ base_branch }}"),
            "pull_request into main"
        );
    }

    #[test]
    fn test_env_and_unknown() {
        let mut env = HashMap::new();
        env.insert("DATABASE_URL".to_string(), "postgres://localhost".to_string());
        let ctx = InterpolationContext::new().with_env(&env);
        assert_eq!(
            ctx.interpolate("url=${{ env.DATABASE_URL }} x=${{ nope }}"),
            "url=postgres://localhost x="
        );
    }

    #[test]
    fn test_plain_text_untouched() {
        let ctx = InterpolationContext::new();
        assert_eq!(ctx.interpolate("echo $HOME ${PATH}"), "echo $HOME ${PATH}");
    }
}
