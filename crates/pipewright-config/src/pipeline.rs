//! Workflow configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use pipewright_core::pipeline::{
    CheckoutSpec, MatrixAxis, MatrixConfig, Pipeline, Step, StepAction, Trigger,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Read and parse a workflow file.
pub fn load_pipeline(path: &Path) -> ConfigResult<Pipeline> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline(&content)
}

/// Parse a workflow configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut triggers = Vec::new();
    let mut matrix = None;
    let mut steps: Vec<Step> = Vec::new();
    let mut env = HashMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "on" => {
                triggers.push(parse_trigger(node)?);
            }
            "matrix" => {
                if matrix.is_some() {
                    return Err(ConfigError::Duplicate("matrix".to_string()));
                }
                matrix = Some(parse_matrix(node)?);
            }
            "step" => {
                let step = parse_step(node)?;
                if steps.iter().any(|s| s.name == step.name) {
                    return Err(ConfigError::Duplicate(format!("step '{}'", step.name)));
                }
                steps.push(step);
            }
            "env" => {
                env = parse_env(node);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    if steps.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "steps for pipeline '{}'",
            name
        )));
    }

    Ok(Pipeline {
        name,
        triggers,
        matrix,
        env,
        steps,
    })
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<Trigger> {
    let trigger_type = get_first_string_arg(node).unwrap_or_default();

    match trigger_type.as_str() {
        "push" => Ok(Trigger::Push {
            branches: non_empty(get_string_list_prop(node, "branches")),
            paths: non_empty(get_string_list_prop(node, "paths")),
        }),
        "pull_request" | "pull-request" => Ok(Trigger::PullRequest {
            branches: non_empty(get_string_list_prop(node, "branches")),
        }),
        "tag" => Ok(Trigger::Tag {
            pattern: get_string_prop(node, "pattern"),
        }),
        "manual" | "workflow_dispatch" => Ok(Trigger::Manual),
        "" => Err(ConfigError::MissingField("trigger type".to_string())),
        _ => Err(ConfigError::InvalidValue {
            field: "trigger type".to_string(),
            message: format!("unknown trigger type: {}", trigger_type),
        }),
    }
}

fn parse_matrix(node: &KdlNode) -> ConfigResult<MatrixConfig> {
    let mut config = MatrixConfig {
        max_parallel: get_usize_prop(node, "max-parallel")?,
        ..Default::default()
    };

    if config.max_parallel == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: "max-parallel".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "include" => config.include.push(get_string_props(child)),
                "exclude" => config.exclude.push(get_string_props(child)),
                axis => {
                    if config.axes.iter().any(|a| a.name == axis) {
                        return Err(ConfigError::Duplicate(format!("matrix axis '{}'", axis)));
                    }
                    let values = get_all_string_args(child);
                    if values.is_empty() {
                        return Err(ConfigError::InvalidValue {
                            field: format!("matrix axis '{}'", axis),
                            message: "needs at least one value".to_string(),
                        });
                    }
                    config.axes.push(MatrixAxis {
                        name: axis.to_string(),
                        values,
                    });
                }
            }
        }
    }

    for combination in config.include.iter().chain(config.exclude.iter()) {
        if combination.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "matrix include/exclude".to_string(),
                message: "needs at least one key=value property".to_string(),
            });
        }
    }

    Ok(config)
}

fn parse_step(node: &KdlNode) -> ConfigResult<Step> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("step name".to_string()))?;

    let continue_on_error = get_bool_prop(node, "continue-on-error").unwrap_or(false);
    let working_dir = get_string_prop(node, "working-directory");

    let timeout = match get_usize_prop(node, "timeout-minutes")? {
        Some(0) => {
            return Err(ConfigError::InvalidValue {
                field: format!("timeout-minutes for step '{}'", name),
                message: "must be at least 1".to_string(),
            });
        }
        Some(minutes) => {
            let secs = u64::try_from(minutes)
                .ok()
                .and_then(|m| m.checked_mul(60))
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: format!("timeout-minutes for step '{}'", name),
                    message: format!("{} minutes is too large", minutes),
                })?;
            Some(Duration::from_secs(secs))
        }
        None => None,
    };

    let mut commands = Vec::new();
    let mut env = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "env" => {
                    env = parse_env(child);
                }
                _ => {}
            }
        }
    }

    let action = match get_string_prop(node, "uses") {
        Some(uses) => {
            if !commands.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("step '{}'", name),
                    message: "a step cannot have both `uses` and `run`".to_string(),
                });
            }
            parse_action(&name, &uses, node)?
        }
        None => {
            if commands.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "run or uses for step '{}'",
                    name
                )));
            }
            StepAction::Run { commands }
        }
    };

    Ok(Step {
        name,
        action,
        env,
        working_dir,
        continue_on_error,
        timeout,
    })
}

fn parse_action(step: &str, uses: &str, node: &KdlNode) -> ConfigResult<StepAction> {
    match uses {
        "checkout" => Ok(StepAction::Checkout(CheckoutSpec {
            repository: get_string_prop(node, "repository"),
            git_ref: get_string_prop(node, "ref"),
            depth: get_usize_prop(node, "depth")?
                .map(|d| {
                    u32::try_from(d).map_err(|_| ConfigError::InvalidValue {
                        field: format!("depth for step '{}'", step),
                        message: format!("{} is too large", d),
                    })
                })
                .transpose()?,
            path: get_string_prop(node, "path"),
        })),
        "setup-python" => {
            let version = get_string_prop(node, "python-version").ok_or_else(|| {
                ConfigError::MissingField(format!("python-version for step '{}'", step))
            })?;
            Ok(StepAction::SetupPython {
                version,
                interpreter: get_string_prop(node, "interpreter"),
            })
        }
        _ => Err(ConfigError::InvalidValue {
            field: format!("uses for step '{}'", step),
            message: format!("unknown action: {}", uses),
        }),
    }
}

fn parse_env(node: &KdlNode) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() { None } else { Some(values) }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

/// All `key="value"` properties of a node, in order. Later duplicates replace earlier ones.
fn get_string_props(node: &KdlNode) -> Vec<(String, String)> {
    let mut props: Vec<(String, String)> = Vec::new();
    let mut seen = HashSet::new();
    for entry in node.entries().iter().rev() {
        if let (Some(name), Some(value)) = (entry.name(), entry.value().as_string()) {
            if seen.insert(name.value().to_string()) {
                props.push((name.value().to_string(), value.to_string()));
            }
        }
    }
    props.reverse();
    props
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_usize_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<usize>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| usize::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.to_string(),
                message: format!("expected a non-negative integer, got {:?}", value),
            }),
    }
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated attributes like branches="main" branches="develop"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: on "push" { branches "main" "release/*" }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_pipeline() {
        let kdl = r#"
            pipeline "test-pipeline"

            step "build" {
                run "make"
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.name, "test-pipeline");
        assert!(pipeline.triggers.is_empty());
        assert!(pipeline.matrix.is_none());
        assert_eq!(pipeline.steps.len(), 1);
        assert_eq!(
            pipeline.steps[0].action,
            StepAction::Run {
                commands: vec!["make".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_triggers() {
        let kdl = r#"
            pipeline "triggers"

            on "push" branches="main" paths="src/**"
            on "pull_request" {
                branches "main" "release/*"
            }
            on "tag" pattern="v*"
            on "manual"

            step "noop" {
                run "true"
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(
            pipeline.triggers,
            vec![
                Trigger::Push {
                    branches: Some(vec!["main".to_string()]),
                    paths: Some(vec!["src/**".to_string()]),
                },
                Trigger::PullRequest {
                    branches: Some(vec!["main".to_string(), "release/*".to_string()]),
                },
                Trigger::Tag {
                    pattern: Some("v*".to_string())
                },
                Trigger::Manual,
            ]
        );
    }

    #[test]
    fn test_unknown_trigger_rejected() {
        let kdl = r#"
            pipeline "bad"
            on "schedule" cron="0 0 * * *"
            step "noop" {
                run "true"
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_parse_matrix() {
        let kdl = r#"
            pipeline "matrix"

            matrix max-parallel=2 {
                os "ubuntu-latest" "macos-latest"
                python-version "3.9" "3.10"
                exclude os="macos-latest" python-version="3.9"
                include os="ubuntu-latest" python-version="3.11" experimental="yes"
            }

            step "noop" {
                run "true"
            }
        "#;

        let matrix = parse_pipeline(kdl).unwrap().matrix.unwrap();
        assert_eq!(matrix.max_parallel, Some(2));
        assert_eq!(matrix.axes.len(), 2);
        assert_eq!(matrix.axes[0].name, "os");
        assert_eq!(matrix.axes[1].values, vec!["3.9", "3.10"]);
        assert_eq!(
            matrix.exclude[0],
            vec![
                ("os".to_string(), "macos-latest".to_string()),
                ("python-version".to_string(), "3.9".to_string()),
            ]
        );
        assert_eq!(matrix.include[0].len(), 3);
    }

    #[test]
    fn test_matrix_axis_needs_values() {
        let kdl = r#"
            pipeline "matrix"
            matrix {
                os
            }
            step "noop" {
                run "true"
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_parse_step_actions_and_options() {
        let kdl = r##"
            pipeline "actions"

            env {
                PYTHONUNBUFFERED "1"
            }

            step "checkout" uses="checkout"
            step "downstream" uses="checkout" repository="https://example.com/prescient.git" depth=1 path="prescient"
            step "python" uses="setup-python" python-version="${matrix.python-version}"
            step "info" continue-on-error=#true {
                run "python --version"
                run "pip list"
            }
            step "tests" timeout-minutes=30 working-directory="prescient" {
                env {
                    PYTEST_ADDOPTS "-v"
                }
                run "pytest tests/test_simulator.py"
            }
        "##;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.env.get("PYTHONUNBUFFERED").unwrap(), "1");
        assert_eq!(pipeline.steps.len(), 5);

        assert_eq!(
            pipeline.steps[0].action,
            StepAction::Checkout(CheckoutSpec::default())
        );
        assert_eq!(
            pipeline.steps[1].action,
            StepAction::Checkout(CheckoutSpec {
                repository: Some("https://example.com/prescient.git".to_string()),
                git_ref: None,
                depth: Some(1),
                path: Some("prescient".to_string()),
            })
        );
        assert_eq!(
            pipeline.steps[2].action,
            StepAction::SetupPython {
                version: "${matrix.python-version}".to_string(),
                interpreter: None,
            }
        );

        let info = &pipeline.steps[3];
        assert!(info.continue_on_error);
        assert_eq!(info.action.kind(), "run");

        let tests = &pipeline.steps[4];
        assert_eq!(tests.timeout, Some(Duration::from_secs(30 * 60)));
        assert_eq!(tests.working_dir.as_deref(), Some("prescient"));
        assert_eq!(tests.env.get("PYTEST_ADDOPTS").unwrap(), "-v");
        assert!(!tests.continue_on_error);
    }

    #[test]
    fn test_step_needs_run_or_uses() {
        let kdl = r#"
            pipeline "empty-step"
            step "nothing"
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_step_cannot_mix_uses_and_run() {
        let kdl = r#"
            pipeline "mixed"
            step "both" uses="checkout" {
                run "ls"
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let kdl = r#"
            pipeline "bad-action"
            step "cache" uses="cache"
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_duplicate_step_names() {
        let kdl = r#"
            pipeline "dupes"
            step "test" {
                run "true"
            }
            step "test" {
                run "false"
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_missing_name_and_steps() {
        let no_name = r#"
            step "build" {
                run "make"
            }
        "#;
        assert!(matches!(
            parse_pipeline(no_name).unwrap_err(),
            ConfigError::MissingField(_)
        ));

        let no_steps = r#"pipeline "empty""#;
        assert!(matches!(
            parse_pipeline(no_steps).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let kdl = r#"
            pipeline "timeouts"
            step "slow" timeout-minutes=0 {
                run "sleep 1"
            }
        "#;

        assert!(parse_pipeline(kdl).is_err());
    }

    #[test]
    fn test_oversized_numbers_rejected() {
        let timeout = r#"
            pipeline "timeouts"
            step "slow" timeout-minutes=9223372036854775807 {
                run "sleep 1"
            }
        "#;
        assert!(matches!(
            parse_pipeline(timeout).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));

        let depth = r#"
            pipeline "deep"
            step "checkout" uses="checkout" repository="https://example.com/r.git" depth=4294967296
        "#;
        match parse_pipeline(depth).unwrap_err() {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, "depth for step 'checkout'"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_load_pipeline_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipewright.kdl");
        std::fs::write(&path, "pipeline \"from-file\"\nstep \"a\" {\n    run \"true\"\n}\n").unwrap();

        let pipeline = load_pipeline(&path).unwrap();
        assert_eq!(pipeline.name, "from-file");

        let missing = load_pipeline(&dir.path().join("missing.kdl"));
        assert!(matches!(missing.unwrap_err(), ConfigError::Io(_)));
    }
}
