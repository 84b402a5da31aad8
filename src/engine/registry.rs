use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::engine::task::{Recipe, TaskContext, TaskNode};
use crate::engine::{Dependencies, Handle, TaskKey, Target};
use crate::error::BuildError;

/// A task as stored in the graph.
pub(crate) struct Task {
    pub key: TaskKey,
    pub target: Target,
    pub sources: Vec<Utf8PathBuf>,
    pub products: Vec<Utf8PathBuf>,
    pub salt: Vec<String>,
    pub dependencies: Vec<Handle>,
    pub recipe: Arc<dyn Recipe>,
}

/// The keyed task registry.
///
/// Maps every [`TaskKey`] to exactly one node of a petgraph graph. Tasks are
/// declared pull-style: the declaration of a task requests its upstream
/// tasks first, so the graph only ever contains what the requested targets
/// transitively need.
///
/// Requesting a key that is already registered returns the existing
/// [`Handle`]; this is the deduplication that gives every unit of work
/// at-most-once execution within a run.
#[derive(Default)]
pub struct Registry {
    pub(crate) graph: Graph<Task, ()>,
    keys: HashMap<TaskKey, NodeIndex>,
    pending: HashSet<TaskKey>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &TaskKey) -> Option<Handle> {
        self.keys.get(key).copied().map(Handle::new)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn key(&self, handle: Handle) -> &TaskKey {
        &self.graph[handle.index].key
    }

    pub fn target(&self, handle: Handle) -> &Target {
        &self.graph[handle.index].target
    }

    /// Direct upstream handles of a task, in declaration order.
    pub fn dependencies(&self, handle: Handle) -> &[Handle] {
        &self.graph[handle.index].dependencies
    }

    /// Marks a key as being declared, rejecting a key that is requested
    /// while its own declaration is still in progress.
    pub(crate) fn enter(&mut self, key: &TaskKey) -> Result<(), BuildError> {
        if self.pending.insert(key.clone()) {
            Ok(())
        } else {
            Err(BuildError::Cycle(key.clone()))
        }
    }

    pub(crate) fn insert(&mut self, key: TaskKey, declared: Declared) -> Handle {
        self.pending.remove(&key);

        let Declared {
            target,
            sources,
            products,
            salt,
            recipe,
        } = declared;

        let dependencies = recipe.dependencies();
        let index = self.graph.add_node(Task {
            key: key.clone(),
            target,
            sources,
            products,
            salt,
            dependencies: dependencies.clone(),
            recipe,
        });

        for dependency in dependencies {
            self.graph.add_edge(dependency.index, index, ());
        }

        self.keys.insert(key, index);
        Handle::new(index)
    }
}

/// Something that owns a [`Registry`] and declares tasks into it.
///
/// The pipeline implements this so that task declarations can call back
/// into other parametric constructors while the registry is borrowed
/// through `self`.
pub trait Plan: Sized {
    type Error: From<BuildError>;

    fn registry(&mut self) -> &mut Registry;

    /// Returns the handle registered for `key`, declaring it with `declare`
    /// first if the key is new.
    fn ensure<F>(&mut self, key: TaskKey, declare: F) -> Result<Handle, Self::Error>
    where
        F: FnOnce(&mut Self) -> Result<Declared, Self::Error>,
    {
        if let Some(handle) = self.registry().lookup(&key) {
            return Ok(handle);
        }

        self.registry().enter(&key)?;
        match declare(self) {
            Ok(declared) => Ok(self.registry().insert(key, declared)),
            Err(err) => {
                self.registry().pending.remove(&key);
                Err(err)
            }
        }
    }
}

impl Plan for Registry {
    type Error = BuildError;

    fn registry(&mut self) -> &mut Registry {
        self
    }
}

/// A fully described task, ready to be inserted under its key.
pub struct Declared {
    target: Target,
    sources: Vec<Utf8PathBuf>,
    products: Vec<Utf8PathBuf>,
    salt: Vec<String>,
    recipe: Arc<dyn Recipe>,
}

/// Builder for a task declaration.
///
/// ```rust,no_run
/// # use fontgraph::engine::{Declared, TaskDef};
/// # fn declare(out: camino::Utf8PathBuf, input: fontgraph::engine::Handle) -> Declared {
/// TaskDef::file(out)
///     .depends_on(input)
///     .run(|task, input| {
///         std::fs::copy(input.file()?, task.out()?)?;
///         Ok(())
///     })
/// # }
/// ```
pub struct TaskDef<D = ()> {
    target: Target,
    sources: Vec<Utf8PathBuf>,
    products: Vec<Utf8PathBuf>,
    salt: Vec<String>,
    dependencies: D,
}

impl TaskDef<()> {
    /// A task producing the file at `path`.
    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        Self::new(Target::File(path.into()))
    }

    /// A task without a file of its own.
    pub fn phony() -> Self {
        Self::new(Target::Phony)
    }

    fn new(target: Target) -> Self {
        Self {
            target,
            sources: Vec::new(),
            products: Vec::new(),
            salt: Vec::new(),
            dependencies: (),
        }
    }
}

impl<D> TaskDef<D> {
    pub fn depends_on<E>(self, dependencies: E) -> TaskDef<E>
    where
        E: Dependencies,
    {
        TaskDef {
            target: self.target,
            sources: self.sources,
            products: self.products,
            salt: self.salt,
            dependencies,
        }
    }

    /// A file that must exist before the task runs. Its content is part of
    /// the input fingerprint.
    pub fn source(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.sources.push(path.into());
        self
    }

    /// A side file written by the action besides its target.
    pub fn product(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.products.push(path.into());
        self
    }

    pub fn products(mut self, paths: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        self.products.extend(paths);
        self
    }

    /// Extra value folded into the input fingerprint, for configuration the
    /// action reads that is not already part of the key.
    pub fn salt(mut self, value: impl ToString) -> Self {
        self.salt.push(value.to_string());
        self
    }

    pub fn run<F>(self, callback: F) -> Declared
    where
        D: Dependencies + Send + Sync + 'static,
        F: for<'a> Fn(&TaskContext<'_>, D::Output<'a>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Declared {
            target: self.target,
            sources: self.sources,
            products: self.products,
            salt: self.salt,
            recipe: Arc::new(TaskNode {
                dependencies: self.dependencies,
                callback,
            }),
        }
    }
}

impl std::fmt::Display for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.key.to_string().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(registry: &mut Registry, name: &str) -> Handle {
        registry
            .ensure(TaskKey::new("noop", [name]), |_| {
                Ok(TaskDef::phony().run(|_, ()| Ok(())))
            })
            .unwrap()
    }

    #[test]
    fn test_same_key_same_handle() {
        let mut registry = Registry::new();
        let a = noop(&mut registry, "a");
        let b = noop(&mut registry, "a");
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_edges_follow_dependencies() {
        let mut registry = Registry::new();
        let a = noop(&mut registry, "a");
        let b = noop(&mut registry, "b");

        let c = registry
            .ensure(TaskKey::new("join", ["c"]), |_| {
                Ok(TaskDef::phony().depends_on((a, b)).run(|_, (_, _)| Ok(())))
            })
            .unwrap();

        assert_eq!(registry.dependencies(c), &[a, b]);
        assert_eq!(registry.graph.edge_count(), 2);
        assert_eq!(registry.key(c).to_string(), "join::c");
    }

    #[test]
    fn test_self_request_is_a_cycle() {
        let mut registry = Registry::new();
        let key = TaskKey::new("loop", ["x"]);

        let result = registry.ensure(key.clone(), |registry| {
            let inner = registry.ensure(key.clone(), |_| Ok(TaskDef::phony().run(|_, ()| Ok(()))))?;
            Ok(TaskDef::phony().depends_on(inner).run(|_, _| Ok(())))
        });

        assert!(matches!(result, Err(BuildError::Cycle(k)) if k == key));
    }

    #[test]
    fn test_failed_declaration_can_be_retried() {
        let mut registry = Registry::new();
        let key = TaskKey::new("latin", ["inter", "regular"]);

        let result = registry.ensure(key.clone(), |_| {
            Err(BuildError::MissingSource("sources/inter/inter-regular.ttf".into()))
        });
        assert!(matches!(result, Err(BuildError::MissingSource(_))));
        assert!(registry.is_empty());

        let handle = registry
            .ensure(key.clone(), |_| Ok(TaskDef::phony().run(|_, ()| Ok(()))))
            .unwrap();
        assert_eq!(registry.key(handle), &key);
    }

    #[test]
    fn test_display_renders_mermaid() {
        let mut registry = Registry::new();
        let a = noop(&mut registry, "a");
        registry
            .ensure(TaskKey::new("top", ["b"]), |_| {
                Ok(TaskDef::phony().depends_on(a).run(|_, _| Ok(())))
            })
            .unwrap();

        let text = registry.to_string();
        assert!(text.starts_with("graph LR"));
        assert!(text.contains("\"noop::a\""));
        assert!(text.contains("0 --> 1"));
    }
}
