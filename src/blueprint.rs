use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::core::Environment;
use crate::engine::{
    Category, ErrorSink, FnTask, Handle, Outcome, Report, Runnable, Task, TaskContext,
};
use crate::error::ConfigError;

/// The blueprint of an asset build.
///
/// `Blueprint` is used to define the task graph. You register leaf tasks and
/// group them into sequential and parallel composites using their
/// [`Handle`]s. Once configured, [`Blueprint::finish`] validates the graph and
/// turns it into a [`Website`] which can be run any number of times.
///
/// # Example
///
/// ```rust,no_run
/// use tsumugi::{Blueprint, Environment, ErrorSink, Outcome};
///
/// let mut config = Blueprint::new();
/// let a = config.task("a", |_| Ok(Outcome::default())).unwrap();
/// let b = config.task("b", |_| Ok(Outcome::default())).unwrap();
/// let root = config.parallel("all", [a, b]).unwrap();
///
/// let site = config.finish(Environment::default()).unwrap();
/// let report = site.run(root, &ErrorSink::new());
/// assert!(report.succeeded);
/// ```
#[derive(Default)]
pub struct Blueprint {
    graph: Graph<Task, usize>,
    names: HashMap<String, NodeIndex>,
}

impl Blueprint {
    /// Creates a new, empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a leaf task.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        runnable: impl Runnable + 'static,
    ) -> Result<Handle, ConfigError> {
        let name = name.into();
        self.add(Task::Leaf {
            name,
            runnable: Arc::new(runnable),
        })
    }

    /// Adds a leaf task backed by a closure.
    pub fn task<F>(&mut self, name: impl Into<String>, callback: F) -> Result<Handle, ConfigError>
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<Outcome> + Send + Sync + 'static,
    {
        self.register(
            name,
            FnTask {
                callback,
                category: Category::Other,
            },
        )
    }

    /// Adds a composite which runs `children` one after another.
    pub fn sequential(
        &mut self,
        name: impl Into<String>,
        children: impl IntoIterator<Item = Handle>,
    ) -> Result<Handle, ConfigError> {
        let handle = self.add(Task::Sequential { name: name.into() })?;
        for child in children {
            self.attach(handle, child)?;
        }
        Ok(handle)
    }

    /// Adds a composite which runs all `children` concurrently.
    pub fn parallel(
        &mut self,
        name: impl Into<String>,
        children: impl IntoIterator<Item = Handle>,
    ) -> Result<Handle, ConfigError> {
        let handle = self.add(Task::Parallel { name: name.into() })?;
        for child in children {
            self.attach(handle, child)?;
        }
        Ok(handle)
    }

    /// Appends `child` to the children of the composite `parent`.
    ///
    /// Fails without modifying the graph if `parent` is a leaf or if `parent`
    /// is already reachable from `child`.
    pub fn attach(&mut self, parent: Handle, child: Handle) -> Result<(), ConfigError> {
        if !self.graph[parent.0].is_composite() {
            return Err(ConfigError::NotComposite(self.name(parent).to_owned()));
        }

        if petgraph::algo::has_path_connecting(&self.graph, child.0, parent.0, None) {
            return Err(ConfigError::Cycle {
                parent: self.name(parent).to_owned(),
                child: self.name(child).to_owned(),
            });
        }

        let position = self.graph.edges_directed(parent.0, Direction::Outgoing).count();
        self.graph.add_edge(parent.0, child.0, position);

        Ok(())
    }

    /// Finds a registered task by name.
    pub fn lookup(&self, name: &str) -> Option<Handle> {
        self.names.get(name).copied().map(Handle)
    }

    pub fn name(&self, handle: Handle) -> &str {
        self.graph[handle.0].name()
    }

    /// Validates the graph and freezes it.
    ///
    /// Tasks which may run concurrently (branches of a parallel composite)
    /// must not plan to write the same output path.
    pub fn finish(self, env: Environment) -> Result<Website, ConfigError> {
        let site = Website {
            graph: self.graph,
            names: self.names,
            env,
        };

        for index in site.graph.node_indices() {
            if let Task::Parallel { .. } = site.graph[index] {
                let branches = children(&site.graph, index)
                    .into_iter()
                    .map(Handle)
                    .collect();
                site.check_disjoint(branches)?;
            }
        }

        Ok(site)
    }

    fn add(&mut self, task: Task) -> Result<Handle, ConfigError> {
        if self.names.contains_key(task.name()) {
            return Err(ConfigError::DuplicateTask(task.name().to_owned()));
        }

        let name = task.name().to_owned();
        let index = self.graph.add_node(task);
        self.names.insert(name, index);

        Ok(Handle(index))
    }
}

/// Children of a composite in the order they were attached.
pub(crate) fn children(graph: &Graph<Task, usize>, index: NodeIndex) -> Vec<NodeIndex> {
    let mut edges: Vec<_> = graph
        .edges_directed(index, Direction::Outgoing)
        .map(|edge| (*edge.weight(), edge.target()))
        .collect();
    edges.sort();
    edges.into_iter().map(|(_, target)| target).collect()
}

/// A validated, immutable task graph.
///
/// A [`Website`] is created from a [`Blueprint`] and is the primary interface
/// for executing tasks. It is shared between the one-shot driver and the
/// watcher, which runs individual tasks out of it.
pub struct Website {
    pub(crate) graph: Graph<Task, usize>,
    pub(crate) names: HashMap<String, NodeIndex>,
    pub(crate) env: Environment,
}

impl Website {
    pub fn design() -> Blueprint {
        Blueprint::default()
    }

    /// Runs `root` to completion, recording diagnostics into `sink`.
    pub fn run(&self, root: Handle, sink: &ErrorSink) -> Report {
        crate::engine::runner::run(self, root, sink)
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn lookup(&self, name: &str) -> Option<Handle> {
        self.names.get(name).copied().map(Handle)
    }

    pub fn name(&self, handle: Handle) -> &str {
        self.graph[handle.0].name()
    }

    /// Leaves reachable from `handle`, each listed once.
    pub(crate) fn leaves(&self, handle: Handle) -> BTreeSet<NodeIndex> {
        let mut acc = BTreeSet::new();
        let mut dfs = petgraph::visit::Dfs::new(&self.graph, handle.0);
        while let Some(index) = dfs.next(&self.graph) {
            if let Task::Leaf { .. } = self.graph[index] {
                acc.insert(index);
            }
        }
        acc
    }

    /// Rejects two groups which plan to write the same path.
    ///
    /// Each group is a task which may run at the same time as the others; the
    /// leaves inside one group are allowed to overlap because the group itself
    /// orders them.
    pub(crate) fn check_disjoint(&self, groups: Vec<Handle>) -> Result<(), ConfigError> {
        let mut owners: HashMap<Utf8PathBuf, (usize, NodeIndex)> = HashMap::new();

        for (group, handle) in groups.into_iter().enumerate() {
            for leaf in self.leaves(handle) {
                let Task::Leaf { name, runnable } = &self.graph[leaf] else {
                    continue;
                };

                let planned = runnable
                    .plan(&self.env)
                    .map_err(|err| ConfigError::Plan(name.clone(), Box::new(err)))?;

                for path in planned {
                    match owners.get(&path) {
                        Some(&(other_group, other)) if other_group != group && other != leaf => {
                            return Err(ConfigError::OutputCollision {
                                path,
                                first: self.graph[other].name().to_owned(),
                                second: name.clone(),
                            });
                        }
                        Some(_) => {}
                        None => {
                            owners.insert(path, (group, leaf));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Category used for reload notifications of a task: a leaf's own
    /// category, or the shared category of all leaves of a composite.
    pub fn category(&self, handle: Handle) -> Category {
        let categories: BTreeSet<Category> = self
            .leaves(handle)
            .into_iter()
            .filter_map(|leaf| match &self.graph[leaf] {
                Task::Leaf { runnable, .. } => Some(runnable.category()),
                _ => None,
            })
            .collect();

        match categories.into_iter().collect::<Vec<_>>().as_slice() {
            [only] => *only,
            _ => Category::Other,
        }
    }
}

impl std::fmt::Display for Website {
    /// Renders the task graph as a Mermaid diagram.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name().replace('"', "\\\"");
            match task {
                Task::Leaf { .. } => writeln!(f, "    {}[\"{}\"]", index.index(), name)?,
                _ => writeln!(f, "    {}{{\"{} ({})\"}}", index.index(), name, task.kind())?,
            }
        }

        for index in self.graph.node_indices() {
            for (position, child) in children(&self.graph, index).into_iter().enumerate() {
                writeln!(
                    f,
                    "    {} -- \"{}\" --> {}",
                    index.index(),
                    position,
                    child.index()
                )?;
            }
        }

        Ok(())
    }
}
