//! Dry run: trigger decision and matrix without executing anything.

use super::{EventArgs, load_workflow, repo_context, repo_root};
use anyhow::Result;
use pipewright_config::RunnerConfig;
use pipewright_core::pipeline::{Pipeline, Step, Trigger};
use pipewright_core::TriggerEvent;
use pipewright_scheduler::{TriggerMatcher, expand_matrix};

pub fn plan(path: &str, args: &EventArgs) -> Result<()> {
    let pipeline = load_workflow(path)?;
    let ctx = repo_context(&repo_root(path)?);
    let event = args.to_event(&ctx)?;

    print!("{}", render(&pipeline, &event, &RunnerConfig::default()));
    Ok(())
}

fn render(pipeline: &Pipeline, event: &TriggerEvent, runner: &RunnerConfig) -> String {
    let mut out = format!("Workflow: {}\nEvent: {}\n", pipeline.name, event);

    let Some(rule) = TriggerMatcher::matching_rule(&pipeline.triggers, event) else {
        out.push_str("No trigger rule matches; no runs would start.\n");
        return out;
    };
    out.push_str(&format!("Matched rule: {}\n", describe_trigger(rule)));

    let entries = expand_matrix(pipeline.matrix.as_ref());
    out.push_str(&format!("Runs: {}\n", entries.len()));
    for (index, entry) in entries.iter().enumerate() {
        match entry.get("os") {
            Some(os) => out.push_str(&format!(
                "  {}. {} [image {}]\n",
                index + 1,
                entry.label(),
                runner.image_for(os)
            )),
            None => out.push_str(&format!("  {}. {}\n", index + 1, entry.label())),
        }
    }

    out.push_str("Steps:\n");
    for (index, step) in pipeline.steps.iter().enumerate() {
        out.push_str(&format!("  {}. {}\n", index + 1, describe_step(step)));
    }
    out
}

fn describe_trigger(trigger: &Trigger) -> String {
    let list = |values: &Option<Vec<String>>| match values {
        Some(values) => values.join(", "),
        None => "*".to_string(),
    };
    match trigger {
        Trigger::Push { branches, paths } => match paths {
            Some(_) => format!("push to [{}] touching [{}]", list(branches), list(paths)),
            None => format!("push to [{}]", list(branches)),
        },
        Trigger::PullRequest { branches } => format!("pull request into [{}]", list(branches)),
        Trigger::Tag { pattern } => format!("tag {}", pattern.as_deref().unwrap_or("*")),
        Trigger::Manual => "manual dispatch".to_string(),
    }
}

fn describe_step(step: &Step) -> String {
    let mut line = format!("{} ({})", step.name, step.action.kind());
    if step.continue_on_error {
        line.push_str(" continue-on-error");
    }
    if let Some(timeout) = step.timeout {
        line.push_str(&format!(" timeout {}m", timeout.as_secs() / 60));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_config::pipeline::parse_pipeline;

    const WORKFLOW: &str = r##"
        pipeline "egret-tests"
        on "push" branches="main"
        on "manual"
        matrix {
            os "ubuntu-latest"
            python-version "3.9" "3.10"
        }
        step "checkout" uses="checkout"
        step "info" continue-on-error=#true {
            run "python --version"
        }
        step "tests" timeout-minutes=30 {
            run "pytest"
        }
    "##;

    #[test]
    fn test_render_triggered() {
        let pipeline = parse_pipeline(WORKFLOW).unwrap();
        let out = render(&pipeline, &TriggerEvent::push("main"), &RunnerConfig::default());

        assert!(out.contains("Matched rule: push to [main]"));
        assert!(out.contains("Runs: 2"));
        assert!(out.contains("1. (ubuntu-latest, 3.9) [image ubuntu:24.04]"));
        assert!(out.contains("2. info (run) continue-on-error"));
        assert!(out.contains("3. tests (run) timeout 30m"));
    }

    #[test]
    fn test_render_not_triggered() {
        let pipeline = parse_pipeline(WORKFLOW).unwrap();
        let out = render(&pipeline, &TriggerEvent::push("develop"), &RunnerConfig::default());

        assert!(out.contains("No trigger rule matches"));
        assert!(!out.contains("Steps:"));
    }
}
