use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ToolError;
use crate::tool::{Executor, Invocation};

/// One recorded invocation with logical start and end ticks.
#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub invocation: Invocation,
    pub start: usize,
    pub end: usize,
    pub failed: bool,
}

impl Record {
    pub fn program(&self) -> &str {
        &self.invocation.program
    }

    /// First argument after the fixed ones, the sub-command of the hinter
    /// or the recipe of the recipe runner.
    pub fn verb(&self) -> Option<&str> {
        self.invocation.args.first().map(String::as_str)
    }

    pub fn mentions(&self, needle: &str) -> bool {
        self.invocation.args.iter().any(|arg| arg.contains(needle))
    }
}

type Effect = Box<dyn Fn(&Invocation) -> std::io::Result<()> + Send + Sync>;
type Failure = Box<dyn Fn(&Invocation) -> bool + Send + Sync>;

/// Stand-in for every external tool.
///
/// By default each invocation creates the files it names: any non-flag
/// argument with an extension that resolves below one of the output roots
/// and does not exist yet is written with a small deterministic payload.
pub(crate) struct FakeExecutor {
    roots: Vec<Utf8PathBuf>,
    clock: AtomicUsize,
    log: Mutex<Vec<Record>>,
    effects: Vec<(String, Effect)>,
    failures: Vec<Failure>,
    delay: Duration,
}

impl FakeExecutor {
    pub fn new(root: &Utf8Path) -> Self {
        let root = camino::absolute_utf8(root).unwrap();
        Self {
            roots: vec![root.join("build"), root.join("out")],
            clock: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            effects: Vec::new(),
            failures: Vec::new(),
            delay: Duration::from_millis(1),
        }
    }

    /// Replaces the default file creation for `program`.
    pub fn with_effect<F>(mut self, program: &str, effect: F) -> Self
    where
        F: Fn(&Invocation) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.effects.push((program.to_string(), Box::new(effect)));
        self
    }

    /// Makes every invocation matching `predicate` exit non-zero.
    pub fn fail_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Invocation) -> bool + Send + Sync + 'static,
    {
        self.failures.push(Box::new(predicate));
        self
    }

    pub fn records(&self) -> Vec<Record> {
        let mut records = self.log.lock().unwrap().clone();
        records.sort_by_key(|r| r.start);
        records
    }

    pub fn count(&self, program: &str, verb: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| r.program() == program && r.verb() == Some(verb))
            .count()
    }

    fn touch(&self, invocation: &Invocation) -> std::io::Result<()> {
        for arg in &invocation.args {
            if arg.starts_with('-') {
                continue;
            }

            let path = Utf8Path::new(arg);
            if path.extension().is_none() {
                continue;
            }

            let path = match (&invocation.cwd, path.is_relative()) {
                (Some(cwd), true) => normalize(&cwd.join(path)),
                _ => path.to_path_buf(),
            };

            if path.exists() || !self.roots.iter().any(|root| path.starts_with(root)) {
                continue;
            }

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, format!("{}\n", invocation.program))?;
        }

        Ok(())
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, invocation: &Invocation) -> Result<(), ToolError> {
        let start = self.clock.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);

        let failed = self.failures.iter().any(|f| f(invocation));

        let result = if failed {
            Err(ToolError::Failed {
                command: invocation.command_line(),
                status: "exit status: 1".into(),
                stdout: String::new(),
                stderr: "injected failure\n".into(),
            })
        } else {
            let effect = self
                .effects
                .iter()
                .find(|(program, _)| *program == invocation.program)
                .map(|(_, effect)| effect);

            let outcome = match effect {
                Some(effect) => effect(invocation),
                None => self.touch(invocation),
            };

            outcome.map_err(|source| ToolError::Spawn {
                program: invocation.program.clone(),
                source,
            })
        };

        let end = self.clock.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(Record {
            invocation: invocation.clone(),
            start,
            end,
            failed,
        });

        result
    }
}

/// Resolves `..` components without touching the filesystem.
fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            camino::Utf8Component::ParentDir => {
                out.pop();
            }
            camino::Utf8Component::CurDir => {}
            other => out.push(other.as_str()),
        }
    }
    out
}
