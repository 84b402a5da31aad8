//! Invocation of external programs.
//!
//! Every transformation of font data is delegated to some external tool.
//! This module only builds argument lists and runs processes; what the
//! tools do with their inputs is opaque to the build graph.

#[cfg(test)]
pub(crate) mod fake;

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ToolError;

/// An external program and its fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ToolSpec")]
pub struct Tool {
    pub program: String,
    pub args: Vec<String>,
}

/// Accepts both `"otfccbuild"` and `{ "program": "node", "args": [..] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ToolSpec {
    Program(String),
    Full {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl From<ToolSpec> for Tool {
    fn from(spec: ToolSpec) -> Self {
        match spec {
            ToolSpec::Program(program) => Tool {
                program,
                args: Vec::new(),
            },
            ToolSpec::Full { program, args } => Tool { program, args },
        }
    }
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Starts an invocation with the fixed arguments already in place.
    pub fn invoke(&self) -> Invocation {
        Invocation {
            program: self.program.clone(),
            args: self.args.clone(),
            cwd: None,
        }
    }
}

/// Value of a single entry of an [`Options`] map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Value(String),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Flag(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Value(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Value(value)
    }
}

impl From<&String> for OptionValue {
    fn from(value: &String) -> Self {
        OptionValue::Value(value.clone())
    }
}

impl From<&Utf8Path> for OptionValue {
    fn from(value: &Utf8Path) -> Self {
        OptionValue::Value(value.to_string())
    }
}

impl From<&Utf8PathBuf> for OptionValue {
    fn from(value: &Utf8PathBuf) -> Self {
        OptionValue::Value(value.to_string())
    }
}

impl From<usize> for OptionValue {
    fn from(value: usize) -> Self {
        OptionValue::Value(value.to_string())
    }
}

/// Structured options, translated into command line flags in insertion
/// order.
///
/// * `false` is omitted entirely,
/// * `true` becomes a bare flag,
/// * anything else becomes the flag followed by the value.
///
/// One-character keys use a single dash (`-o`), longer keys two (`--mono`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(String, OptionValue)>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    /// Appends every entry of `other`.
    pub fn extend(mut self, other: &Options) -> Self {
        self.0.extend(other.0.iter().cloned());
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.0.len() * 2);

        for (key, value) in &self.0 {
            let flag = if key.chars().count() == 1 {
                format!("-{key}")
            } else {
                format!("--{key}")
            };

            match value {
                OptionValue::Flag(false) => {}
                OptionValue::Flag(true) => args.push(flag),
                OptionValue::Value(value) => {
                    args.push(flag);
                    args.push(value.clone());
                }
            }
        }

        args
    }
}

/// A fully assembled command: program, argument list and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<Utf8PathBuf>,
}

impl Invocation {
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_string()));
        self
    }

    pub fn options(mut self, options: &Options) -> Self {
        self.args.extend(options.to_args());
        self
    }

    /// Runs the program inside `dir`, for tools that want relative paths.
    pub fn cwd(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn command_line(&self) -> String {
        let mut line = quote(&self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(arg));
        }
        line
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '"', '\'']) {
        arg.to_string()
    } else {
        format!("{arg:?}")
    }
}

/// Runs invocations. The build context holds one of these; tests swap in a
/// recording fake.
pub trait Executor: Send + Sync {
    fn execute(&self, invocation: &Invocation) -> Result<(), ToolError>;
}

/// Spawns real processes and waits for them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn execute(&self, invocation: &Invocation) -> Result<(), ToolError> {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);

        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }

        let output = command.output().map_err(|source| ToolError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                command: invocation.command_line(),
                status: output.status.to_string(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!("{}: {}", invocation.program, stderr.trim());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_translation() {
        let options = Options::new().set("mono", true).set("o", "x");
        assert_eq!(options.to_args(), vec!["--mono", "-o", "x"]);
    }

    #[test]
    fn test_false_is_omitted() {
        let options = Options::new().set("term", false);
        assert!(options.to_args().is_empty());
    }

    #[test]
    fn test_values_are_stringified() {
        let options = Options::new().set("jobs", 8usize).set("h", "cache.gz");
        assert_eq!(options.to_args(), vec!["--jobs", "8", "-h", "cache.gz"]);
    }

    #[test]
    fn test_invocation_keeps_fixed_args_first() {
        let tool = Tool {
            program: "node".into(),
            args: vec!["--max-old-space-size=8192".into()],
        };

        let invocation = tool
            .invoke()
            .arg("make/pass1/index.js")
            .options(&Options::new().set("italize", true));

        assert_eq!(
            invocation.args,
            vec!["--max-old-space-size=8192", "make/pass1/index.js", "--italize"]
        );
        assert_eq!(
            invocation.command_line(),
            "node --max-old-space-size=8192 make/pass1/index.js --italize"
        );
    }

    #[test]
    fn test_tool_from_plain_string() {
        let tool: Tool = serde_json::from_str(r#""otfccdump""#).unwrap();
        assert_eq!(tool, Tool::new("otfccdump"));

        let tool: Tool = serde_json::from_str(r#"{ "program": "python3", "args": ["-m", "otf2ttf"] }"#).unwrap();
        assert_eq!(tool.args, vec!["-m", "otf2ttf"]);
    }

    #[test]
    fn test_system_executor_reports_failure() {
        let invocation = Tool::new("sh").invoke().args(["-c", "echo broken >&2; exit 3"]);
        match SystemExecutor.execute(&invocation) {
            Err(ToolError::Failed { stderr, .. }) => assert_eq!(stderr.trim(), "broken"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_system_executor_missing_program() {
        let invocation = Tool::new("fontgraph-no-such-program").invoke();
        assert!(matches!(
            SystemExecutor.execute(&invocation),
            Err(ToolError::Spawn { .. })
        ));
    }
}
