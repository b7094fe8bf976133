//! Variable interpolation for workflow configurations.
//!
//! Supports variables like:
//! - `${matrix.python-version}` - Value of a matrix axis for the current run
//! - `${git.sha}` - Full git commit SHA
//! - `${git.short_sha}` - Short (7 char) git commit SHA
//! - `${git.branch}` - Current branch name
//! - `${git.ref}` - Git ref (branch or tag)
//! - `${event.name}` - Triggering event (push, pull_request, tag, manual)
//! - `${event.ref}` - Ref named by the event
//! - `${pipeline.name}` - Pipeline name
//! - `${run.id}` - Run ID
//! - `${run.number}` - Position of the run in the matrix (1-based)
//! - `${run.workspace}` - Workspace path
//! - `${step.name}` - Current step name
//! - `${env.VAR_NAME}` - Environment variable
//! - `${date}` / `${datetime}` / `${timestamp}`
//!
//! Unknown variables are left untouched, so shell `${VAR}` expansions survive.

use pipewright_core::TriggerEvent;
use pipewright_core::pipeline::MatrixEntry;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub event: EventContext,
    pub pipeline: PipelineContext,
    pub run: RunContext,
    pub step: StepContext,
    /// Matrix values of the current run
    pub matrix: HashMap<String, String>,
    /// Environment variables
    pub env: HashMap<String, String>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub tag: Option<String>,
    pub ref_name: String,
    pub message: String,
    pub author: String,
}

/// Triggering event context.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub name: String,
    pub ref_name: String,
    pub actor: String,
}

/// Pipeline context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub name: String,
}

/// Run context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub number: u32,
    pub workspace: String,
}

/// Step context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub name: String,
    pub index: usize,
}

// Matches ${name} and ${namespace.key}; keys may contain dashes (matrix axes).
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_-]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with git information populated from a repository path.
    pub fn from_git_repo(repo_path: &str) -> Self {
        let mut ctx = Self::new();
        ctx.populate_git_from_repo(repo_path);
        ctx
    }

    /// Populate git context by running git commands in a repo path.
    pub fn populate_git_from_repo(&mut self, repo_path: &str) {
        use std::process::Command;

        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(repo_path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        };

        if let Some(sha) = run_git(&["rev-parse", "HEAD"]) {
            self.git.short_sha = sha.chars().take(7).collect();
            self.git.sha = sha;
        }

        if let Some(branch) = run_git(&["rev-parse", "--abbrev-ref", "HEAD"]) {
            if branch != "HEAD" {
                self.git.ref_name = branch.clone();
                self.git.branch = branch;
            }
        }

        if let Some(tag) = run_git(&["describe", "--tags", "--exact-match", "HEAD"]) {
            self.git.ref_name = tag.clone();
            self.git.tag = Some(tag);
        }

        if let Some(message) = run_git(&["log", "-1", "--format=%s"]) {
            self.git.message = message;
        }

        if let Some(author) = run_git(&["log", "-1", "--format=%an"]) {
            self.git.author = author;
        }
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Record the triggering event.
    pub fn set_event(&mut self, event: &TriggerEvent) {
        self.event.name = event.name().to_string();
        self.event.ref_name = event.git_ref().unwrap_or_default().to_string();
        self.event.actor = event.actor.clone().unwrap_or_default();
        if let Some(sha) = &event.sha {
            self.git.short_sha = sha.chars().take(7).collect();
            self.git.sha = sha.clone();
        }
    }

    /// Replace the matrix values with those of a run's entry.
    pub fn set_matrix(&mut self, entry: &MatrixEntry) {
        self.matrix = entry.values.iter().cloned().collect();
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["matrix", key] => self.matrix.get(*key).cloned(),

            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "tag"] => self.git.tag.clone(),
            ["git", "ref"] => Some(self.git.ref_name.clone()),
            ["git", "message"] => Some(self.git.message.clone()),
            ["git", "author"] => Some(self.git.author.clone()),

            ["event", "name"] => Some(self.event.name.clone()),
            ["event", "ref"] => Some(self.event.ref_name.clone()),
            ["event", "actor"] => Some(self.event.actor.clone()),

            ["pipeline", "name"] => Some(self.pipeline.name.clone()),

            ["run", "id"] => Some(self.run.id.clone()),
            ["run", "number"] => Some(self.run.number.to_string()),
            ["run", "workspace"] => Some(self.run.workspace.clone()),

            ["step", "name"] => Some(self.step.name.clone()),
            ["step", "index"] => Some(self.step.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    pub fn interpolate_opt(&self, input: &Option<String>) -> Option<String> {
        input.as_deref().map(|s| self.interpolate(s))
    }

    /// Matrix variables referenced in a string that the current entry does not define.
    pub fn unresolved_matrix_refs(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .filter_map(|caps| {
                let var_name = &caps[1];
                let key = var_name.strip_prefix("matrix.")?;
                (!self.matrix.contains_key(key)).then(|| var_name.to_string())
            })
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        if self.ctx.git.ref_name.is_empty() {
            self.ctx.git.ref_name = branch.clone();
        }
        self.ctx.git.branch = branch;
        self
    }

    pub fn with_event(mut self, event: &TriggerEvent) -> Self {
        self.ctx.set_event(event);
        self
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.ctx.pipeline.name = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>, number: u32) -> Self {
        self.ctx.run.id = id.into();
        self.ctx.run.number = number;
        self
    }

    pub fn with_step(mut self, name: impl Into<String>, index: usize) -> Self {
        self.ctx.step.name = name.into();
        self.ctx.step.index = index;
        self
    }

    pub fn with_matrix(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.matrix.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_interpolation() {
        let ctx = VariableContextBuilder::new()
            .with_matrix("python-version", "3.9")
            .with_matrix("pyomo-version", "6.4.0")
            .build();

        let result = ctx.interpolate(
            "pip install git+https://github.com/Pyomo/pyomo.git@${matrix.pyomo-version} # py${matrix.python-version}",
        );
        assert_eq!(
            result,
            "pip install git+https://github.com/Pyomo/pyomo.git@6.4.0 # py3.9"
        );
    }

    #[test]
    fn test_set_matrix_from_entry() {
        let mut entry = MatrixEntry::default();
        entry.set("os", "ubuntu-latest");

        let mut ctx = VariableContext::new();
        ctx.set_matrix(&entry);
        assert_eq!(ctx.interpolate("${matrix.os}"), "ubuntu-latest");
        assert_eq!(ctx.unresolved_matrix_refs("${matrix.os} ${matrix.arch}"), vec!["matrix.arch"]);
    }

    #[test]
    fn test_short_sha() {
        let ctx = VariableContextBuilder::new()
            .with_git_sha("abc1234567890def")
            .build();

        assert_eq!(ctx.interpolate("Short: ${git.short_sha}"), "Short: abc1234");
    }

    #[test]
    fn test_event_variables() {
        let event = TriggerEvent::push("main").with_sha("0123456789abcdef");
        let ctx = VariableContextBuilder::new().with_event(&event).build();

        assert_eq!(
            ctx.interpolate("${event.name} ${event.ref} ${git.short_sha}"),
            "push main 0123456"
        );
    }

    #[test]
    fn test_env_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("MY_VAR", "hello")
            .with_env("ANOTHER", "world")
            .build();

        assert_eq!(ctx.interpolate("${env.MY_VAR} ${env.ANOTHER}!"), "hello world!");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        assert_eq!(ctx.interpolate("Unknown: ${unknown.var}"), "Unknown: ${unknown.var}");
        // Plain shell expansions are left for the shell.
        assert_eq!(ctx.interpolate("echo ${HOME}"), "echo ${HOME}");
    }

    #[test]
    fn test_pipeline_run_and_step_context() {
        let ctx = VariableContextBuilder::new()
            .with_pipeline("egret-tests")
            .with_run("run-456", 2)
            .with_step("install-solver", 3)
            .build();

        let result =
            ctx.interpolate("Pipeline ${pipeline.name} run #${run.number} step ${step.name}");
        assert_eq!(result, "Pipeline egret-tests run #2 step install-solver");
    }

    #[test]
    fn test_interpolate_vec_and_map() {
        let ctx = VariableContextBuilder::new()
            .with_git_branch("develop")
            .build();

        let results = ctx.interpolate_vec(&["echo ${git.branch}".to_string()]);
        assert_eq!(results[0], "echo develop");

        let mut env = HashMap::new();
        env.insert("REF".to_string(), "${git.ref}".to_string());
        assert_eq!(ctx.interpolate_map(&env)["REF"], "develop");
    }

    #[test]
    fn test_nested_braces() {
        let ctx = VariableContextBuilder::new().with_git_sha("abc123").build();

        let result = ctx.interpolate(r#"{"sha": "${git.sha}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }
}
