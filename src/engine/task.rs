use std::cell::RefCell;
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{BuildConfig, Toolchain};
use crate::context::{Context, Layout};
use crate::engine::{Artifact, Dependencies, Handle, TaskKey, Target};
use crate::error::ToolError;
use crate::tool::Invocation;

/// The type-erased action stored in every graph node.
pub(crate) trait Recipe: Send + Sync {
    fn dependencies(&self) -> Vec<Handle>;

    fn execute(&self, context: &TaskContext, inputs: &[Artifact]) -> anyhow::Result<()>;
}

pub(crate) struct TaskNode<D, F> {
    pub dependencies: D,
    pub callback: F,
}

impl<D, F> Recipe for TaskNode<D, F>
where
    D: Dependencies + Send + Sync,
    F: for<'a> Fn(&TaskContext<'_>, D::Output<'a>) -> anyhow::Result<()> + Send + Sync,
{
    fn dependencies(&self) -> Vec<Handle> {
        self.dependencies.dependencies()
    }

    fn execute(&self, context: &TaskContext, inputs: &[Artifact]) -> anyhow::Result<()> {
        let inputs = self.dependencies.resolve(inputs);
        (self.callback)(context, inputs)
    }
}

/// The context passed to every task action.
///
/// Gives access to the build context, the task's own target and a scratch
/// list of temporary files. Temporaries are removed once the action has
/// succeeded; after a failure they stay on disk for inspection.
pub struct TaskContext<'a> {
    /// The build context shared by all tasks of the run.
    pub env: &'a Context,
    pub key: &'a TaskKey,
    pub target: &'a Target,
    pub(crate) scratch: RefCell<Vec<Utf8PathBuf>>,
    pub(crate) span: tracing::Span,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(env: &'a Context, key: &'a TaskKey, target: &'a Target, span: tracing::Span) -> Self {
        Self {
            env,
            key,
            target,
            scratch: RefCell::new(Vec::new()),
            span,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        self.env.config()
    }

    pub fn layout(&self) -> &Layout {
        &self.env.layout
    }

    pub fn tools(&self) -> &Toolchain {
        &self.env.config().toolchain
    }

    /// The file this task has to produce.
    pub fn out(&self) -> anyhow::Result<&Utf8Path> {
        self.target
            .path()
            .ok_or_else(|| anyhow::anyhow!("task '{}' does not produce a file", self.key))
    }

    /// Registers a temporary path, file or directory, to be removed after
    /// the action succeeds.
    pub fn temp(&self, path: impl Into<Utf8PathBuf>) -> Utf8PathBuf {
        let path = path.into();
        self.scratch.borrow_mut().push(path.clone());
        path
    }

    /// Runs an external program on behalf of this task.
    pub fn run(&self, invocation: Invocation) -> Result<(), ToolError> {
        let _enter = self.span.enter();
        tracing::debug!(task = %self.key, "{}", invocation.command_line());
        self.env.executor.execute(&invocation)
    }

    pub(crate) fn cleanup(&self) {
        for path in self.scratch.borrow_mut().drain(..) {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };

            match result {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => tracing::warn!("couldn't remove temporary '{}': {}", path, err),
            }
        }
    }
}
