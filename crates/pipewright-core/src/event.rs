//! Repository events that may start a workflow.

use serde::{Deserialize, Serialize};

/// An incoming repository event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,
    /// Who caused the event, if known.
    pub actor: Option<String>,
    /// Commit the event refers to.
    pub sha: Option<String>,
    /// Files touched by the event. `None` when the event carries no path information.
    pub changed_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Commits pushed to a branch.
    Push { branch: String },
    /// A pull request opened or updated against `base`.
    PullRequest {
        base: String,
        head: Option<String>,
        number: Option<u64>,
    },
    /// A tag pushed to the repository.
    Tag { name: String },
    /// A run requested by hand, optionally for a specific ref.
    Manual { git_ref: Option<String> },
}

impl TriggerEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            actor: None,
            sha: None,
            changed_paths: None,
        }
    }

    pub fn push(branch: impl Into<String>) -> Self {
        Self::new(EventKind::Push {
            branch: branch.into(),
        })
    }

    pub fn pull_request(base: impl Into<String>) -> Self {
        Self::new(EventKind::PullRequest {
            base: base.into(),
            head: None,
            number: None,
        })
    }

    pub fn tag(name: impl Into<String>) -> Self {
        Self::new(EventKind::Tag { name: name.into() })
    }

    pub fn manual() -> Self {
        Self::new(EventKind::Manual { git_ref: None })
    }

    pub fn with_changed_paths(mut self, paths: Vec<String>) -> Self {
        self.changed_paths = Some(paths);
        self
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    /// Event name as used in workflow `on` nodes.
    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::Push { .. } => "push",
            EventKind::PullRequest { .. } => "pull_request",
            EventKind::Tag { .. } => "tag",
            EventKind::Manual { .. } => "manual",
        }
    }

    /// The ref the run builds: pushed branch, PR head (or base), tag, or manual ref.
    pub fn git_ref(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Push { branch } => Some(branch),
            EventKind::PullRequest { base, head, .. } => Some(head.as_deref().unwrap_or(base)),
            EventKind::Tag { name } => Some(name),
            EventKind::Manual { git_ref } => git_ref.as_deref(),
        }
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EventKind::Push { branch } => write!(f, "push to '{}'", branch),
            EventKind::PullRequest { base, number, .. } => match number {
                Some(n) => write!(f, "pull request #{} into '{}'", n, base),
                None => write!(f, "pull request into '{}'", base),
            },
            EventKind::Tag { name } => write!(f, "tag '{}'", name),
            EventKind::Manual { git_ref: Some(r) } => write!(f, "manual dispatch on '{}'", r),
            EventKind::Manual { git_ref: None } => write!(f, "manual dispatch"),
        }
    }
}
