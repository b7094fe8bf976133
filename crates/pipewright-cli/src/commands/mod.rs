//! CLI command implementations.

pub mod plan;
pub mod run;

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use pipewright_config::VariableContext;
use pipewright_config::pipeline::load_pipeline;
use pipewright_core::pipeline::Pipeline;
use pipewright_core::{EventKind, TriggerEvent};
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EventType {
    Push,
    #[value(name = "pull_request", alias = "pull-request")]
    PullRequest,
    Tag,
    Manual,
}

/// The repository event to dispatch.
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Kind of event
    #[arg(long, value_enum, default_value_t = EventType::Manual)]
    pub event: EventType,

    /// Branch pushed to, or the pull request's base branch (defaults to the current git branch)
    #[arg(long, env = "PIPEWRIGHT_BRANCH")]
    pub branch: Option<String>,

    /// Pull request head branch
    #[arg(long)]
    pub head: Option<String>,

    /// Pull request number
    #[arg(long)]
    pub number: Option<u64>,

    /// Tag name for tag events
    #[arg(long)]
    pub tag: Option<String>,

    /// Commit the event refers to
    #[arg(long, env = "PIPEWRIGHT_COMMIT_SHA")]
    pub sha: Option<String>,

    /// Who triggered the event
    #[arg(long)]
    pub actor: Option<String>,

    /// Files touched by the event (repeatable); used by push `paths` filters
    #[arg(long = "changed-path")]
    pub changed_paths: Vec<String>,
}

impl EventArgs {
    /// Build the event, taking missing branch and commit details from the git context.
    pub fn to_event(&self, git: &VariableContext) -> Result<TriggerEvent> {
        let branch = || -> Result<String> {
            match &self.branch {
                Some(branch) => Ok(branch.clone()),
                None if !git.git.branch.is_empty() => Ok(git.git.branch.clone()),
                None => bail!("--branch is required outside a git checkout"),
            }
        };

        let kind = match self.event {
            EventType::Push => EventKind::Push { branch: branch()? },
            EventType::PullRequest => EventKind::PullRequest {
                base: branch()?,
                head: self.head.clone(),
                number: self.number,
            },
            EventType::Tag => match (&self.tag, &git.git.tag) {
                (Some(tag), _) | (None, Some(tag)) => EventKind::Tag { name: tag.clone() },
                (None, None) => bail!("--tag is required for tag events"),
            },
            EventType::Manual => EventKind::Manual {
                git_ref: self.branch.clone().or_else(|| {
                    (!git.git.branch.is_empty()).then(|| git.git.branch.clone())
                }),
            },
        };

        let mut event = TriggerEvent::new(kind);
        event.actor = self.actor.clone();
        event.sha = self
            .sha
            .clone()
            .or_else(|| (!git.git.sha.is_empty()).then(|| git.git.sha.clone()));
        if !self.changed_paths.is_empty() {
            event.changed_paths = Some(self.changed_paths.clone());
        }
        Ok(event)
    }
}

/// Load a workflow file with a readable error.
pub fn load_workflow(path: &str) -> Result<Pipeline> {
    load_pipeline(Path::new(path)).with_context(|| format!("Failed to load workflow: {}", path))
}

/// Repository root for a workflow: the git top level containing the workflow
/// file, or the current directory outside a git checkout.
pub fn repo_root(path: &str) -> Result<PathBuf> {
    let dir = Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let toplevel = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|t| !t.is_empty());

    let root = match toplevel {
        Some(toplevel) => PathBuf::from(toplevel),
        None => std::env::current_dir().context("Failed to read the current directory")?,
    };
    root.canonicalize()
        .with_context(|| format!("Failed to resolve repository root: {}", root.display()))
}

/// Variables for a repository checkout: git details plus the process environment.
pub fn repo_context(dir: &Path) -> VariableContext {
    let mut ctx = VariableContext::from_git_repo(&dir.to_string_lossy());
    ctx.populate_env();
    ctx
}

pub fn validate(path: &str) -> Result<()> {
    let pipeline = load_workflow(path)?;
    let runs = pipewright_scheduler::expand_matrix(pipeline.matrix.as_ref()).len();
    println!(
        "Workflow '{}' is valid: {} trigger rule(s), {} run(s), {} step(s)",
        pipeline.name,
        pipeline.triggers.len(),
        runs,
        pipeline.steps.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_config::VariableContextBuilder;

    fn args(event: EventType) -> EventArgs {
        EventArgs {
            event,
            branch: None,
            head: None,
            number: None,
            tag: None,
            sha: None,
            actor: None,
            changed_paths: Vec::new(),
        }
    }

    #[test]
    fn test_push_defaults_to_current_branch() {
        let git = VariableContextBuilder::new()
            .with_git_branch("main")
            .with_git_sha("0123456789abcdef")
            .build();

        let event = args(EventType::Push).to_event(&git).unwrap();
        assert_eq!(
            event.kind,
            EventKind::Push {
                branch: "main".to_string()
            }
        );
        assert_eq!(event.sha.as_deref(), Some("0123456789abcdef"));
        assert!(event.changed_paths.is_none());
    }

    #[test]
    fn test_pull_request_and_overrides() {
        let git = VariableContext::new();
        let mut pr = args(EventType::PullRequest);
        pr.branch = Some("main".to_string());
        pr.head = Some("feature/acopf".to_string());
        pr.number = Some(42);
        pr.changed_paths = vec!["egret/models/acopf.py".to_string()];

        let event = pr.to_event(&git).unwrap();
        assert_eq!(
            event.kind,
            EventKind::PullRequest {
                base: "main".to_string(),
                head: Some("feature/acopf".to_string()),
                number: Some(42),
            }
        );
        assert_eq!(event.changed_paths.unwrap().len(), 1);
    }

    #[test]
    fn test_missing_branch_outside_git() {
        let git = VariableContext::new();
        assert!(args(EventType::Push).to_event(&git).is_err());
        assert!(args(EventType::Tag).to_event(&git).is_err());
        assert_eq!(
            args(EventType::Manual).to_event(&git).unwrap().kind,
            EventKind::Manual { git_ref: None }
        );
    }

    #[test]
    fn test_repo_root_is_git_toplevel() {
        let repo = tempfile::tempdir().unwrap();
        let workflows = repo.path().join("workflows");
        std::fs::create_dir(&workflows).unwrap();
        let workflow = workflows.join("egret.kdl");
        std::fs::write(&workflow, "pipeline \"egret\"\n").unwrap();

        let init = Command::new("git")
            .args(["init", "-q"])
            .current_dir(repo.path())
            .status();
        if !matches!(init, Ok(status) if status.success()) {
            return;
        }

        let root = repo_root(&workflow.to_string_lossy()).unwrap();
        assert_eq!(root, repo.path().canonicalize().unwrap());
    }

    #[test]
    fn test_repo_root_outside_git_is_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = dir.path().join("egret.kdl");

        let root = repo_root(&workflow.to_string_lossy()).unwrap();
        assert_eq!(root, std::env::current_dir().unwrap().canonicalize().unwrap());
    }

    #[test]
    fn test_validate_reference_workflow() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../workflows/egret.kdl");
        validate(path).unwrap();
        assert!(validate("does-not-exist.kdl").is_err());
    }
}
