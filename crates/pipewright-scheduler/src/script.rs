//! Turns step actions into shell commands.

use pipewright_config::VariableContext;
use pipewright_core::executor::Workspace;
use pipewright_core::pipeline::{CheckoutSpec, StepAction};
use pipewright_core::{Error, Result};

/// Directory of the virtual environment created by `setup-python`.
pub(crate) fn venv_path(workspace: &Workspace) -> String {
    format!("{}/.venv", workspace.path)
}

/// Build the command executing a step in the workspace.
///
/// Everything runs through `sh -e -c`, so the first failing command fails the
/// step. `venv` is the virtual environment activated by an earlier
/// `setup-python` step, if any.
pub(crate) fn step_command(
    action: &StepAction,
    ctx: &VariableContext,
    workspace: &Workspace,
    venv: Option<&str>,
) -> Result<Vec<String>> {
    let body = match action {
        StepAction::Run { commands } => {
            check_matrix_refs(ctx, commands.iter().map(String::as_str))?;
            ctx.interpolate_vec(commands).join("\n")
        }
        StepAction::Checkout(spec) => checkout_script(spec, ctx, workspace)?,
        StepAction::SetupPython {
            version,
            interpreter,
        } => {
            check_matrix_refs(
                ctx,
                [Some(version.as_str()), interpreter.as_deref()]
                    .into_iter()
                    .flatten(),
            )?;
            let version = ctx.interpolate(version);
            let interpreter = ctx.interpolate_opt(interpreter);
            setup_python_script(&version, interpreter.as_deref(), &venv_path(workspace))
        }
    };

    let script = match venv {
        Some(venv) => format!(
            "export VIRTUAL_ENV={}\nexport PATH=\"$VIRTUAL_ENV/bin:$PATH\"\n{}",
            quote(venv),
            body
        ),
        None => body,
    };

    Ok(vec!["sh".to_string(), "-e".to_string(), "-c".to_string(), script])
}

fn checkout_script(spec: &CheckoutSpec, ctx: &VariableContext, workspace: &Workspace) -> Result<String> {
    check_matrix_refs(
        ctx,
        [&spec.repository, &spec.git_ref, &spec.path]
            .into_iter()
            .filter_map(|v| v.as_deref()),
    )?;

    let dest = match ctx.interpolate_opt(&spec.path) {
        Some(path) if path.starts_with('/') => path,
        Some(path) => format!("{}/{}", workspace.path, path),
        None => workspace.path.clone(),
    };

    let Some(repository) = ctx.interpolate_opt(&spec.repository) else {
        let source = workspace.source_path.as_deref().ok_or_else(|| {
            Error::InvalidInput("checkout without repository needs a source directory".to_string())
        })?;
        return Ok(format!(
            "mkdir -p {dest}\ncp -R {src}/. {dest}/",
            dest = quote(&dest),
            src = quote(source)
        ));
    };

    let mut clone = vec!["git".to_string(), "clone".to_string()];
    if let Some(depth) = spec.depth {
        clone.push(format!("--depth={}", depth));
    }
    if let Some(git_ref) = ctx.interpolate_opt(&spec.git_ref) {
        clone.push("--branch".to_string());
        clone.push(quote(&git_ref));
    }
    clone.push(quote(&repository));
    clone.push(quote(&dest));
    Ok(clone.join(" "))
}

fn setup_python_script(version: &str, interpreter: Option<&str>, venv: &str) -> String {
    let locate = match interpreter {
        Some(interpreter) => format!("PY={}", quote(interpreter)),
        None => {
            let exact = format!("python{}", version);
            // Accept a generic python3 only when its version starts with the requested one.
            format!(
                "if command -v {exact} >/dev/null 2>&1; then\n  PY={exact}\n\
                 elif command -v python3 >/dev/null 2>&1 && python3 -c {check} {version}; then\n  PY=python3\n\
                 else\n  echo {missing} >&2\n  exit 1\nfi",
                exact = quote(&exact),
                check = quote(
                    "import platform, sys; sys.exit(0 if (platform.python_version() + '.').startswith(sys.argv[1] + '.') else 1)"
                ),
                version = quote(version),
                missing = quote(&format!("python {} not found", version)),
            )
        }
    };

    format!(
        "{locate}\n\"$PY\" -m venv {venv}\n{python} --version",
        locate = locate,
        venv = quote(venv),
        python = quote(&format!("{}/bin/python", venv)),
    )
}

/// Fail when any input names a `${matrix.x}` the current entry does not define.
pub(crate) fn check_matrix_refs<'a>(
    ctx: &VariableContext,
    inputs: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let missing: Vec<String> = inputs
        .into_iter()
        .flat_map(|input| ctx.unresolved_matrix_refs(input))
        .map(|name| format!("${{{}}}", name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "undefined matrix values: {}",
            missing.join(", ")
        )))
    }
}

/// Quote a value for `sh` using single quotes.
pub(crate) fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
