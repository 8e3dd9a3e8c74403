//! How a step's process is started.
//!
//! Every step runs as `<executable> <index> <parameters-json>` in the
//! pipeline directory. A [`StepRunner`] decides what actually gets spawned
//! for that invocation: the file itself, an interpreter, or a wrapper
//! command rendered from a template.

use crate::errors::{ConduitError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;

/// Name of the runner used when a step does not pick one.
pub const DEFAULT_RUNNER: &str = "local";

/// One step invocation.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Resolved executable file.
    pub executable: &'a Path,
    /// Position of the step in its pipeline.
    pub index: usize,
    /// Step parameters as a JSON document.
    pub parameters: &'a str,
    /// Pipeline directory, used as the working directory.
    pub cwd: &'a Path,
}

/// Builds the command for a step.
pub trait StepRunner: Send + Sync + fmt::Debug {
    /// Registry name.
    fn name(&self) -> &str;

    /// The command to spawn. Stdio wiring is left to the caller.
    fn command(&self, invocation: &Invocation<'_>) -> Command;
}

fn default_interpreters() -> HashMap<String, String> {
    HashMap::from([
        ("py".to_string(), "python3".to_string()),
        ("sh".to_string(), "sh".to_string()),
    ])
}

/// Program and arguments for a direct invocation.
fn local_argv(interpreters: &HashMap<String, String>, invocation: &Invocation<'_>) -> Vec<String> {
    let mut argv = Vec::with_capacity(4);
    let interpreter = invocation
        .executable
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| interpreters.get(ext));
    if let Some(interpreter) = interpreter {
        argv.push(interpreter.clone());
    }
    argv.push(invocation.executable.display().to_string());
    argv.push(invocation.index.to_string());
    argv.push(invocation.parameters.to_string());
    argv
}

/// Runs steps directly on this machine.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    name: String,
    interpreters: HashMap<String, String>,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new(DEFAULT_RUNNER, HashMap::new())
    }
}

impl LocalRunner {
    /// Creates a runner; `interpreters` extends the built-in extension map.
    pub fn new(name: impl Into<String>, interpreters: HashMap<String, String>) -> Self {
        let mut all = default_interpreters();
        all.extend(interpreters);
        Self {
            name: name.into(),
            interpreters: all,
        }
    }
}

impl StepRunner for LocalRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, invocation: &Invocation<'_>) -> Command {
        let argv = local_argv(&self.interpreters, invocation);
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).current_dir(invocation.cwd);
        command
    }
}

/// Runs steps through a shell template such as
/// `docker run --rm -v {abspath}:/step img {cmd}`.
///
/// Placeholders: `{cmd}` is the local command line (shell quoted),
/// `{path}` the executable relative to the pipeline directory, and
/// `{abspath}` its absolute path.
#[derive(Debug, Clone)]
pub struct WrappedRunner {
    name: String,
    template: String,
    interpreters: HashMap<String, String>,
}

impl WrappedRunner {
    /// Creates a wrapping runner.
    pub fn new(
        name: impl Into<String>,
        template: impl Into<String>,
        interpreters: HashMap<String, String>,
    ) -> Self {
        let mut all = default_interpreters();
        all.extend(interpreters);
        Self {
            name: name.into(),
            template: template.into(),
            interpreters: all,
        }
    }

    /// The shell line for `invocation`.
    pub fn render(&self, invocation: &Invocation<'_>) -> String {
        let cmd = local_argv(&self.interpreters, invocation)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        let relative = invocation
            .executable
            .strip_prefix(invocation.cwd)
            .unwrap_or(invocation.executable);
        self.template
            .replace("{cmd}", &cmd)
            .replace("{path}", &shell_quote(&relative.display().to_string()))
            .replace("{abspath}", &shell_quote(&invocation.executable.display().to_string()))
    }
}

impl StepRunner for WrappedRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, invocation: &Invocation<'_>) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(self.render(invocation))
            .current_dir(invocation.cwd);
        command
    }
}

/// Quotes `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RunnerDef {
    Local {
        #[serde(default)]
        interpreters: HashMap<String, String>,
    },
    Wrapped {
        wrapper: String,
        #[serde(default)]
        interpreters: HashMap<String, String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RunnerConfig {
    #[serde(default)]
    runners: HashMap<String, RunnerDef>,
}

/// Named runners available to steps.
#[derive(Debug, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn StepRunner>>,
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        let mut runners: HashMap<String, Arc<dyn StepRunner>> = HashMap::new();
        runners.insert(DEFAULT_RUNNER.to_string(), Arc::new(LocalRunner::default()));
        Self { runners }
    }
}

impl RunnerRegistry {
    /// Loads runners from a YAML file, or only `local` if the file is absent.
    ///
    /// ```yaml
    /// runners:
    ///   docker:
    ///     kind: wrapped
    ///     wrapper: "docker run --rm -v {abspath}:{abspath} steps {cmd}"
    /// ```
    pub fn load(path: &Path) -> Result<Self> {
        let mut registry = Self::default();
        if !path.is_file() {
            return Ok(registry);
        }
        let config: RunnerConfig = serde_yaml::from_str(&fs::read_to_string(path)?)?;
        for (name, def) in config.runners {
            let runner: Arc<dyn StepRunner> = match def {
                RunnerDef::Local { interpreters } => Arc::new(LocalRunner::new(&name, interpreters)),
                RunnerDef::Wrapped {
                    wrapper,
                    interpreters,
                } => Arc::new(WrappedRunner::new(&name, wrapper, interpreters)),
            };
            tracing::debug!(runner = %name, file = %path.display(), "Registered runner");
            registry.register(runner);
        }
        Ok(registry)
    }

    /// Adds or replaces a runner.
    pub fn register(&mut self, runner: Arc<dyn StepRunner>) {
        self.runners.insert(runner.name().to_string(), runner);
    }

    /// The runner called `name`, or the default one.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn StepRunner>> {
        let name = name.unwrap_or(DEFAULT_RUNNER);
        self.runners
            .get(name)
            .cloned()
            .ok_or_else(|| ConduitError::UnknownRunner(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn invocation<'a>(exe: &'a Path, cwd: &'a Path) -> Invocation<'a> {
        Invocation {
            executable: exe,
            index: 2,
            parameters: r#"{"a":"it's"}"#,
            cwd,
        }
    }

    #[test]
    fn test_local_argv_picks_interpreter_by_extension() {
        let interpreters = default_interpreters();
        let cwd = Path::new("/pipes");

        let py = PathBuf::from("/pipes/load.py");
        let argv = local_argv(&interpreters, &invocation(&py, cwd));
        assert_eq!(argv, vec!["python3", "/pipes/load.py", "2", r#"{"a":"it's"}"#]);

        let bin = PathBuf::from("/pipes/load");
        let argv = local_argv(&interpreters, &invocation(&bin, cwd));
        assert_eq!(argv[0], "/pipes/load");
    }

    #[test]
    fn test_wrapped_runner_renders_placeholders() {
        let runner = WrappedRunner::new("docker", "run {path} {abspath} -- {cmd}", HashMap::new());
        let exe = PathBuf::from("/pipes/steps/load.sh");
        let line = runner.render(&invocation(&exe, Path::new("/pipes")));

        assert_eq!(
            line,
            r#"run steps/load.sh /pipes/steps/load.sh -- sh /pipes/steps/load.sh 2 '{"a":"it'\''s"}'"#
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain/path.sh"), "plain/path.sh");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
    }

    #[test]
    fn test_registry_loads_config() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("runners.yaml");
        fs::write(
            &file,
            "runners:\n  py2:\n    kind: local\n    interpreters: {py: python2}\n  box:\n    kind: wrapped\n    wrapper: 'box {cmd}'\n",
        )
        .unwrap();

        let registry = RunnerRegistry::load(&file).unwrap();
        assert_eq!(registry.names(), vec!["box", "local", "py2"]);
        assert_eq!(registry.get(None).unwrap().name(), "local");
        assert_eq!(registry.get(Some("box")).unwrap().name(), "box");
        assert!(matches!(
            registry.get(Some("nope")),
            Err(ConduitError::UnknownRunner(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_registry_without_config() {
        let registry = RunnerRegistry::load(Path::new("/nonexistent/runners.yaml")).unwrap();
        assert_eq!(registry.names(), vec!["local"]);
    }
}
