//! Storage-deduplicating memory reporter

use crate::{diff, graph, render, LiveObjects, NamedTensor, Node, ObjectId, ReportSnapshot};
use memlab_env::DeviceMemory;
use std::collections::HashSet;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReporterOptions {
    /// With a root, also enumerate live tensors the walk did not reach.
    pub include_unreachable: bool,
    /// List groups present in both snapshots of a diff.
    pub show_unchanged: bool,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        Self {
            include_unreachable: true,
            show_unchanged: false,
        }
    }
}

/// Reports which live tensors hold which device bytes, aliasing made explicit.
///
/// # Example
/// ```ignore
/// let reporter = MemReporter::new(allocator.clone()).with_live_objects(registry.clone());
/// let before = reporter.collect(Some(&model.as_node()));
/// train_step(&model)?;
/// let after = reporter.collect(Some(&model.as_node()));
/// println!("{}", reporter.diff(&before, &after));
/// ```
pub struct MemReporter {
    memory: Rc<dyn DeviceMemory>,
    live: Option<Rc<dyn LiveObjects>>,
    options: ReporterOptions,
}

impl MemReporter {
    pub fn new(memory: Rc<dyn DeviceMemory>) -> Self {
        Self {
            memory,
            live: None,
            options: ReporterOptions::default(),
        }
    }

    pub fn with_live_objects(mut self, live: Rc<dyn LiveObjects>) -> Self {
        self.live = Some(live);
        self
    }

    pub fn with_options(mut self, options: ReporterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ReporterOptions {
        &self.options
    }

    /// Collect every tensor reachable from `root`, or every live tensor
    /// when `root` is `None`.
    ///
    /// Structural names win over the synthetic `TensorN` names given to
    /// tensors only found by enumeration.
    pub fn collect(&self, root: Option<&Node>) -> ReportSnapshot {
        let mut visited: HashSet<ObjectId> = HashSet::new();
        let mut found = match root {
            Some(root) => graph::walk(root, &mut visited),
            None => Vec::new(),
        };

        if root.is_none() || self.options.include_unreachable {
            match &self.live {
                Some(live) => {
                    let mut next = 0;
                    for tensor in live.live_tensors() {
                        if !visited.insert(ObjectId::of(&tensor)) {
                            continue;
                        }
                        found.push(NamedTensor {
                            name: format!("Tensor{next}"),
                            tensor,
                            structural: false,
                        });
                        next += 1;
                    }
                }
                None if root.is_none() => {
                    tracing::warn!("no root and no live-object source, snapshot is empty");
                }
                None => {}
            }
        }

        ReportSnapshot::build(found, &*self.memory)
    }

    pub fn render(&self, snapshot: &ReportSnapshot, verbose: bool) -> String {
        render::render(snapshot, verbose)
    }

    pub fn diff(&self, before: &ReportSnapshot, after: &ReportSnapshot) -> String {
        render::render_diff(
            &diff::diff(before, after),
            self.options.show_unchanged,
            &*self.memory,
        )
    }
}
