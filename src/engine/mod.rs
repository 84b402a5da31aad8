mod journal;
mod registry;
mod report;
mod runner;
mod task;

use std::fmt::{Debug, Display};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;

use crate::core::{ArcStr, Hash32};

pub use crate::engine::journal::{Journal, JournalEntry};
pub use crate::engine::registry::{Declared, Plan, Registry, TaskDef};
pub use crate::engine::report::{Report, TaskExecution};
pub use crate::engine::runner::run;
pub use crate::engine::task::TaskContext;

/// Identity of one unit of work: a stage name plus its parameter tuple.
///
/// Two keys are equal when the stage and every parameter are equal. The
/// registry holds at most one task per key, which is what makes requesting
/// the same work from many places collapse into a single execution.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    stage: &'static str,
    params: Vec<ArcStr>,
}

impl TaskKey {
    pub fn new<I, S>(stage: &'static str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            stage,
            params: params.into_iter().map(|p| ArcStr::from(p.as_ref())).collect(),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(AsRef::as_ref)
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.stage)?;

        let mut iter = self.params.iter();
        if let Some(first) = iter.next() {
            write!(f, "::{first}")?;
            for param in iter {
                write!(f, "-{param}")?;
            }
        }

        Ok(())
    }
}

impl Debug for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskKey({self})")
    }
}

/// What a task leaves behind once it has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A file owned exclusively by the task.
    File(Utf8PathBuf),
    /// No file of its own, only the completion of the action (and
    /// possibly some declared side products).
    Phony,
}

impl Target {
    pub fn path(&self) -> Option<&Utf8Path> {
        match self {
            Target::File(path) => Some(path),
            Target::Phony => None,
        }
    }
}

/// A lightweight, copyable reference to a task in the build graph.
///
/// Handles are only ever handed out by the registry, one per [`TaskKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) index: NodeIndex,
}

impl Handle {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self { index }
    }

    /// Returns the underlying `NodeIndex` of the task in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

/// The completed result of a task as seen by its dependents.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub key: TaskKey,
    pub target: Target,
    pub fingerprint: Hash32,
}

impl Artifact {
    /// Path of the produced file; fails for phony tasks.
    pub fn file(&self) -> anyhow::Result<&Utf8Path> {
        self.target
            .path()
            .ok_or_else(|| anyhow::anyhow!("task '{}' does not produce a file", self.key))
    }
}

/// A collection of [`Handle`]s usable as the dependencies of a task.
///
/// Implemented for a single handle, tuples of handles and `Vec<Handle>`.
/// The action of the task receives the upstream artifacts in the same
/// shape, so a task declared with `(a, b)` is called with `(&A, &B)`.
pub trait Dependencies {
    /// The resolved shape handed to the task action.
    type Output<'a>;

    /// The handles in declaration order.
    fn dependencies(&self) -> Vec<Handle>;

    /// Reshapes the artifacts, given in declaration order.
    ///
    /// # Panics
    /// Panics when fewer artifacts than handles are supplied, which would be
    /// a logic error in the runner.
    fn resolve<'a>(&self, inputs: &'a [Artifact]) -> Self::Output<'a>;
}

impl Dependencies for () {
    type Output<'a> = ();

    fn dependencies(&self) -> Vec<Handle> {
        vec![]
    }

    fn resolve<'a>(&self, _: &'a [Artifact]) -> Self::Output<'a> {}
}

impl Dependencies for Handle {
    type Output<'a> = &'a Artifact;

    fn dependencies(&self) -> Vec<Handle> {
        vec![*self]
    }

    fn resolve<'a>(&self, inputs: &'a [Artifact]) -> Self::Output<'a> {
        &inputs[0]
    }
}

impl Dependencies for Vec<Handle> {
    type Output<'a> = Vec<&'a Artifact>;

    fn dependencies(&self) -> Vec<Handle> {
        self.clone()
    }

    fn resolve<'a>(&self, inputs: &'a [Artifact]) -> Self::Output<'a> {
        inputs[..self.len()].iter().collect()
    }
}

macro_rules! handle_of {
    ($D:ident) => {
        Handle
    };
}

macro_rules! artifact_of {
    ($lt:lifetime, $D:ident) => {
        &$lt Artifact
    };
}

macro_rules! impl_deps {
    ($($D:ident),*) => {
        #[allow(non_snake_case)]
        impl Dependencies for ($(handle_of!($D),)*) {
            type Output<'a> = ($(artifact_of!('a, $D),)*);

            fn dependencies(&self) -> Vec<Handle> {
                let ($($D,)*) = self;
                vec![$(*$D,)*]
            }

            fn resolve<'a>(&self, inputs: &'a [Artifact]) -> Self::Output<'a> {
                let ($($D,)*) = self;
                let mut iter = inputs.iter();
                ($({
                    let _ = $D;
                    iter.next().expect("missing dependency output")
                },)*)
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);
