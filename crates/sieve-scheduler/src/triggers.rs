//! Trigger matching and evaluation.

use sieve_core::Result;
use sieve_core::glob::GlobPattern;
use sieve_core::pipeline::{BranchFilter, TriggerConfig};
use sieve_core::trigger::{EventKind, TriggerEvent};

#[derive(Debug, Clone)]
struct CompiledFilter {
    branches: Vec<GlobPattern>,
    branches_ignore: Vec<GlobPattern>,
}

impl CompiledFilter {
    fn new(filter: &BranchFilter) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<GlobPattern>> {
            patterns.iter().map(|p| GlobPattern::branch(p)).collect()
        };
        Ok(Self {
            branches: compile(&filter.branches)?,
            branches_ignore: compile(&filter.branches_ignore)?,
        })
    }

    fn matches(&self, branch: &str) -> bool {
        let included = self.branches.is_empty() || self.branches.iter().any(|g| g.matches(branch));
        included && !self.branches_ignore.iter().any(|g| g.matches(branch))
    }
}

#[derive(Debug, Clone)]
struct CompiledTriggers {
    push: Option<CompiledFilter>,
    pull_request: Option<CompiledFilter>,
}

/// Matcher for determining if a pipeline should be triggered.
#[derive(Debug, Clone, Default)]
pub struct TriggerMatcher {
    /// `None` triggers on every event.
    config: Option<CompiledTriggers>,
}

impl TriggerMatcher {
    pub fn new(config: Option<&TriggerConfig>) -> Result<Self> {
        let config = config
            .map(|c| -> Result<_> {
                Ok(CompiledTriggers {
                    push: c.push.as_ref().map(CompiledFilter::new).transpose()?,
                    pull_request: c.pull_request.as_ref().map(CompiledFilter::new).transpose()?,
                })
            })
            .transpose()?;
        Ok(Self { config })
    }

    /// Check if the pipeline should run for an event. Pushes match on the
    /// pushed branch, pull requests on the branch they target.
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        let Some(config) = &self.config else {
            return true;
        };
        let filter = match event.kind {
            EventKind::Push => &config.push,
            EventKind::PullRequest => &config.pull_request,
        };
        filter
            .as_ref()
            .is_some_and(|f| f.matches(event.target_branch()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_core::trigger::ChangeSet;

    fn config() -> TriggerConfig {
        TriggerConfig {
            push: Some(BranchFilter {
                branches: vec!["main".into(), "release/*".into()],
                branches_ignore: vec!["release/old".into()],
            }),
            pull_request: Some(BranchFilter::default()),
        }
    }

    #[test]
    fn test_no_config_triggers_everything() {
        let matcher = TriggerMatcher::new(None).unwrap();
        assert!(matcher.matches(&TriggerEvent::push("anything", ChangeSet::default())));
    }

    #[test]
    fn test_push_branch_filter() {
        let matcher = TriggerMatcher::new(Some(&config())).unwrap();
        assert!(matcher.matches(&TriggerEvent::push("refs/heads/main", ChangeSet::default())));
        assert!(matcher.matches(&TriggerEvent::push("release/v2", ChangeSet::default())));
        assert!(!matcher.matches(&TriggerEvent::push("release/old", ChangeSet::default())));
        assert!(!matcher.matches(&TriggerEvent::push("feature/x", ChangeSet::default())));
    }

    #[test]
    fn test_pull_request_with_empty_branches_matches_all() {
        let matcher = TriggerMatcher::new(Some(&config())).unwrap();
        let event = TriggerEvent::pull_request("feature/x", "develop", ChangeSet::default());
        assert!(matcher.matches(&event));
    }

    #[test]
    fn test_unconfigured_kind_does_not_trigger() {
        let config = TriggerConfig {
            push: Some(BranchFilter::default()),
            pull_request: None,
        };
        let matcher = TriggerMatcher::new(Some(&config)).unwrap();
        let event = TriggerEvent::pull_request("feature/x", "main", ChangeSet::default());
        assert!(!matcher.matches(&event));
    }
}
