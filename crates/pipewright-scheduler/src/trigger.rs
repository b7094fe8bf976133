//! Trigger rule matching.

use glob_match::glob_match;
use pipewright_core::pipeline::Trigger;
use pipewright_core::{EventKind, TriggerEvent};

static MANUAL_ONLY: Trigger = Trigger::Manual;

/// Decides whether an event starts a pipeline.
pub struct TriggerMatcher;

impl TriggerMatcher {
    /// The first rule matching the event. A pipeline without rules only runs on manual dispatch.
    pub fn matching_rule<'a>(triggers: &'a [Trigger], event: &TriggerEvent) -> Option<&'a Trigger> {
        if triggers.is_empty() {
            return Self::matches(&MANUAL_ONLY, event).then_some(&MANUAL_ONLY);
        }
        triggers.iter().find(|t| Self::matches(t, event))
    }

    pub fn matches(trigger: &Trigger, event: &TriggerEvent) -> bool {
        match (trigger, &event.kind) {
            (Trigger::Push { branches, paths }, EventKind::Push { branch }) => {
                Self::filter_matches(branches.as_deref(), strip_ref(branch))
                    && Self::paths_match(paths.as_deref(), event.changed_paths.as_deref())
            }
            (Trigger::PullRequest { branches }, EventKind::PullRequest { base, .. }) => {
                Self::filter_matches(branches.as_deref(), strip_ref(base))
            }
            (Trigger::Tag { pattern }, EventKind::Tag { name }) => {
                let name = name.strip_prefix("refs/tags/").unwrap_or(name);
                pattern.as_deref().is_none_or(|p| glob_match(p, name))
            }
            (Trigger::Manual, EventKind::Manual { .. }) => true,
            _ => false,
        }
    }

    /// Glob filter with `!pattern` negations; the last matching pattern decides.
    /// `None` matches everything.
    pub fn filter_matches(patterns: Option<&[String]>, value: &str) -> bool {
        let Some(patterns) = patterns else {
            return true;
        };

        let only_negations = patterns.iter().all(|p| p.starts_with('!'));
        let mut matched = only_negations;
        for pattern in patterns {
            match pattern.strip_prefix('!') {
                Some(negated) => {
                    if glob_match(negated, value) {
                        matched = false;
                    }
                }
                None => {
                    if glob_match(pattern, value) {
                        matched = true;
                    }
                }
            }
        }
        matched
    }

    fn paths_match(patterns: Option<&[String]>, changed: Option<&[String]>) -> bool {
        match (patterns, changed) {
            (None, _) => true,
            // Without path information the filter cannot exclude the event.
            (Some(_), None) => true,
            (Some(patterns), Some(changed)) => changed
                .iter()
                .any(|path| Self::filter_matches(Some(patterns), path)),
        }
    }
}

fn strip_ref(name: &str) -> &str {
    name.strip_prefix("refs/heads/").unwrap_or(name)
}
