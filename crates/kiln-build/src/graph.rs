//! Stage dependency graph.
//!
//! Turns a parsed [`Descriptor`] into a validated DAG of stages. An edge
//! `a -> b` means stage `a` needs stage `b` to finish first, either because
//! `a` is built `FROM b` or because it copies files `--from=b`.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::fmt::Write as _;

use kiln_common::{KilnError, KilnResult};

use crate::descriptor::Descriptor;
use crate::instruction::Instruction;

/// Index of a stage in declaration order.
pub type StageId = usize;

/// Where a stage's filesystem starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageBase {
    /// `FROM scratch`: an empty filesystem.
    Scratch,
    /// An external image reference. Not pulled; identifies the chain root.
    Image(String),
    /// Another stage of the same descriptor.
    Stage(StageId),
}

/// A validated build stage.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Declaration index.
    pub id: StageId,
    /// Display name: the alias, or the index when unaliased.
    pub name: String,
    /// `AS` alias.
    pub alias: Option<String>,
    /// Line of the `FROM` instruction.
    pub line: usize,
    /// Base filesystem.
    pub base: StageBase,
    /// Instructions after `FROM`, in order.
    pub instructions: Vec<Instruction>,
}

/// Validated, acyclic stage graph.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<Stage>,
    dependencies: Vec<BTreeSet<StageId>>,
    dependents: Vec<BTreeSet<StageId>>,
    order: Vec<StageId>,
}

impl StageGraph {
    /// Resolve references and validate the graph.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::UnknownStageReference`] when `COPY --from`
    /// names no stage, or [`KilnError::Cycle`] when references loop.
    pub fn build(descriptor: Descriptor) -> KilnResult<Self> {
        let aliases: Vec<Option<String>> = descriptor
            .stages
            .iter()
            .map(|block| block.alias.clone())
            .collect();
        let lookup = |reference: &str| resolve_reference(&aliases, reference);

        let mut stages = Vec::with_capacity(descriptor.stages.len());
        let mut dependencies = Vec::with_capacity(descriptor.stages.len());

        for (id, block) in descriptor.stages.into_iter().enumerate() {
            let name = block.alias.clone().unwrap_or_else(|| id.to_string());
            let mut deps = BTreeSet::new();

            let base = if block.base.eq_ignore_ascii_case("scratch") {
                StageBase::Scratch
            } else if let Some(base) = aliases
                .iter()
                .position(|a| a.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(&block.base)))
            {
                deps.insert(base);
                StageBase::Stage(base)
            } else {
                StageBase::Image(block.base.clone())
            };

            for source in block.instructions.iter().filter_map(Instruction::copy_source) {
                let dep = lookup(source).ok_or_else(|| KilnError::UnknownStageReference {
                    stage: name.clone(),
                    reference: source.to_string(),
                })?;
                deps.insert(dep);
            }

            stages.push(Stage {
                id,
                name,
                alias: block.alias,
                line: block.line,
                base,
                instructions: block.instructions,
            });
            dependencies.push(deps);
        }

        let mut dependents = vec![BTreeSet::new(); stages.len()];
        for (id, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].insert(id);
            }
        }

        let mut graph = Self {
            stages,
            dependencies,
            dependents,
            order: Vec::new(),
        };
        graph.order = graph.topological_order()?;

        tracing::debug!(
            stages = graph.stages.len(),
            order = ?graph.order,
            "Resolved stage graph"
        );
        Ok(graph)
    }

    /// Kahn's algorithm; ready stages are taken lowest index first so the
    /// order only depends on the input.
    fn topological_order(&self) -> KilnResult<Vec<StageId>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BinaryHeap<Reverse<StageId>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for &dependent in &self.dependents[id] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() == self.stages.len() {
            return Ok(order);
        }

        let remaining: BTreeSet<StageId> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| id)
            .collect();
        Err(KilnError::Cycle {
            stages: self.find_cycle(&remaining),
        })
    }

    /// Walk dependencies inside the unsorted remainder until a stage repeats.
    /// Every remaining stage has at least one remaining dependency, so the
    /// walk always closes.
    fn find_cycle(&self, remaining: &BTreeSet<StageId>) -> Vec<String> {
        let Some(&start) = remaining.iter().next() else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(&next) = self.dependencies[current]
                .iter()
                .find(|dep| remaining.contains(dep))
            else {
                break;
            };
            if let Some(pos) = path.iter().position(|&id| id == next) {
                path.drain(..pos);
                path.push(next);
                break;
            }
            path.push(next);
            current = next;
        }

        path.into_iter()
            .map(|id| self.stages[id].name.clone())
            .collect()
    }

    /// All stages in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stage by id.
    #[must_use]
    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id]
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Topological build order.
    #[must_use]
    pub fn order(&self) -> &[StageId] {
        &self.order
    }

    /// Stages `id` needs.
    #[must_use]
    pub fn dependencies(&self, id: StageId) -> &BTreeSet<StageId> {
        &self.dependencies[id]
    }

    /// Stages that need `id`.
    #[must_use]
    pub fn dependents(&self, id: StageId) -> &BTreeSet<StageId> {
        &self.dependents[id]
    }

    /// Resolve a stage reference by alias (case-insensitive) or index.
    #[must_use]
    pub fn lookup(&self, reference: &str) -> Option<StageId> {
        let aliases: Vec<Option<String>> =
            self.stages.iter().map(|stage| stage.alias.clone()).collect();
        resolve_reference(&aliases, reference)
    }

    /// The requested build target, or the last stage.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::UnknownTarget`] if `target` names no stage.
    pub fn resolve_target(&self, target: Option<&str>) -> KilnResult<StageId> {
        match target {
            Some(name) => self.lookup(name).ok_or_else(|| KilnError::UnknownTarget {
                target: name.to_string(),
            }),
            None => self
                .stages
                .len()
                .checked_sub(1)
                .ok_or_else(|| KilnError::Internal {
                    message: "stage graph is empty".to_string(),
                }),
        }
    }

    /// `target` and everything it transitively needs, in build order.
    #[must_use]
    pub fn closure(&self, target: StageId) -> Vec<StageId> {
        let mut needed = BTreeSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if needed.insert(id) {
                stack.extend(self.dependencies[id].iter().copied());
            }
        }
        self.order
            .iter()
            .copied()
            .filter(|id| needed.contains(id))
            .collect()
    }

    /// Human-readable listing in build order.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (position, &id) in self.order.iter().enumerate() {
            let stage = &self.stages[id];
            let base = match &stage.base {
                StageBase::Scratch => "scratch".to_string(),
                StageBase::Image(reference) => reference.clone(),
                StageBase::Stage(base) => format!("stage {}", self.stages[*base].name),
            };
            let layers = stage
                .instructions
                .iter()
                .filter(|i| i.is_filesystem())
                .count();
            let _ = write!(
                out,
                "{}. {} from {base}: {} instructions, {layers} layers",
                position + 1,
                stage.name,
                stage.instructions.len(),
            );
            let deps = &self.dependencies[id];
            if !deps.is_empty() {
                let names: Vec<&str> = deps.iter().map(|d| self.stages[*d].name.as_str()).collect();
                let _ = write!(out, " (needs {})", names.join(", "));
            }
            out.push('\n');
        }
        out
    }
}

fn resolve_reference(aliases: &[Option<String>], reference: &str) -> Option<StageId> {
    aliases
        .iter()
        .position(|alias| {
            alias
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(reference))
        })
        .or_else(|| {
            reference
                .parse::<StageId>()
                .ok()
                .filter(|index| *index < aliases.len())
        })
}
