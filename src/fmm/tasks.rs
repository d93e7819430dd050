//! A task graph with declared data access, executed on the rayon pool.
//!
//! Tasks name the block-level pieces they read and write; edges are derived
//! from read-after-write, write-after-read and write-after-write conflicts
//! in submission order. Execution spawns a task onto the worker pool as soon
//! as its last predecessor completes, so independent passes overlap freely
//! while conflicting ones are serialized.
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A block-level piece of tree data named in a task's access sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataRef {
    /// Multipole expansions of one block.
    Multipole {
        /// Level of the block.
        level: usize,
        /// Block index within the level.
        block: usize,
    },

    /// Local expansions of one block.
    Local {
        /// Level of the block.
        level: usize,
        /// Block index within the level.
        block: usize,
    },

    /// Particle data of one leaf-level block.
    Particles {
        /// Block index.
        block: usize,
    },

    /// Completion marker of all multipole-to-local work at one level.
    M2lEpoch {
        /// Level the marker closes.
        level: usize,
    },
}

type TaskBody<'a> = Box<dyn FnOnce() + Send + 'a>;

/// A dependency graph of tasks over declared read and write sets.
#[derive(Default)]
pub struct TaskGraph<'a> {
    bodies: Vec<Option<TaskBody<'a>>>,
    successors: Vec<Vec<usize>>,
    indegree: Vec<usize>,
    last_writer: HashMap<DataRef, usize>,
    readers_since_write: HashMap<DataRef, Vec<usize>>,
    n_edges: usize,
}

impl<'a> TaskGraph<'a> {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of submitted tasks.
    pub fn n_tasks(&self) -> usize {
        self.bodies.len()
    }

    /// Number of dependency edges.
    pub fn n_edges(&self) -> usize {
        self.n_edges
    }

    /// Submit a task, recording conflicts against earlier submissions.
    ///
    /// Returns the task's id. A task depends on the last writer of every
    /// piece it reads, and on the last writer of and all readers since that
    /// write for every piece it writes.
    pub fn add_task(
        &mut self,
        reads: &[DataRef],
        writes: &[DataRef],
        body: impl FnOnce() + Send + 'a,
    ) -> usize {
        let id = self.bodies.len();
        let mut predecessors = BTreeSet::new();

        for data in reads {
            if let Some(&writer) = self.last_writer.get(data) {
                predecessors.insert(writer);
            }
        }
        for data in writes {
            if let Some(&writer) = self.last_writer.get(data) {
                predecessors.insert(writer);
            }
            if let Some(readers) = self.readers_since_write.get(data) {
                predecessors.extend(readers.iter().copied());
            }
        }
        predecessors.remove(&id);

        self.bodies.push(Some(Box::new(body)));
        self.successors.push(Vec::new());
        self.indegree.push(predecessors.len());
        self.n_edges += predecessors.len();
        for predecessor in predecessors {
            self.successors[predecessor].push(id);
        }

        for data in reads {
            self.readers_since_write
                .entry(*data)
                .or_default()
                .push(id);
        }
        for data in writes {
            self.last_writer.insert(*data, id);
            self.readers_since_write.insert(*data, Vec::new());
        }

        id
    }

    /// Run every task on the rayon pool, respecting all edges.
    ///
    /// Tasks whose predecessors have completed are spawned immediately;
    /// completion of a task decrements the indegree of its successors and
    /// spawns those that become ready.
    pub fn execute(mut self) {
        let n_tasks = self.bodies.len();
        let state = ExecutionState {
            bodies: self
                .bodies
                .drain(..)
                .map(Mutex::new)
                .collect(),
            successors: std::mem::take(&mut self.successors),
            indegree: self.indegree.iter().map(|&d| AtomicUsize::new(d)).collect(),
        };

        rayon::scope(|scope| {
            let state = &state;
            for id in 0..n_tasks {
                if state.indegree[id].load(Ordering::Acquire) == 0 {
                    scope.spawn(move |scope| run_task(state, scope, id));
                }
            }
        });

        debug_assert!(
            state
                .bodies
                .iter()
                .all(|body| body.lock().unwrap().is_none()),
            "task graph contains a dependency cycle"
        );
    }
}

struct ExecutionState<'a> {
    bodies: Vec<Mutex<Option<TaskBody<'a>>>>,
    successors: Vec<Vec<usize>>,
    indegree: Vec<AtomicUsize>,
}

fn run_task<'a: 'scope, 'scope>(
    state: &'scope ExecutionState<'a>,
    scope: &rayon::Scope<'scope>,
    id: usize,
) {
    let body = state.bodies[id].lock().unwrap().take();
    if let Some(body) = body {
        body();
    }
    for &successor in &state.successors[id] {
        if state.indegree[successor].fetch_sub(1, Ordering::AcqRel) == 1 {
            scope.spawn(move |scope| run_task(state, scope, successor));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn recorded_order(build: impl FnOnce(&mut TaskGraph, &Arc<Mutex<Vec<usize>>>)) -> Vec<usize> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        build(&mut graph, &log);
        graph.execute();
        Arc::try_unwrap(log).unwrap().into_inner().unwrap()
    }

    fn record(log: &Arc<Mutex<Vec<usize>>>, id: usize) -> impl FnOnce() + Send {
        let log = Arc::clone(log);
        move || log.lock().unwrap().push(id)
    }

    fn position(order: &[usize], id: usize) -> usize {
        order.iter().position(|&x| x == id).unwrap()
    }

    const A: DataRef = DataRef::Multipole { level: 3, block: 0 };
    const B: DataRef = DataRef::Multipole { level: 3, block: 1 };
    const C: DataRef = DataRef::Local { level: 3, block: 0 };

    #[test]
    fn test_read_after_write() {
        let order = recorded_order(|graph, log| {
            graph.add_task(&[], &[A], record(log, 0));
            graph.add_task(&[A], &[C], record(log, 1));
            graph.add_task(&[C], &[], record(log, 2));
            assert_eq!(graph.n_tasks(), 3);
            assert_eq!(graph.n_edges(), 2);
        });
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_write_after_read() {
        let order = recorded_order(|graph, log| {
            graph.add_task(&[], &[A], record(log, 0));
            graph.add_task(&[A], &[], record(log, 1));
            graph.add_task(&[A], &[], record(log, 2));
            graph.add_task(&[], &[A], record(log, 3));
        });
        assert_eq!(order.len(), 4);
        assert!(position(&order, 3) > position(&order, 1));
        assert!(position(&order, 3) > position(&order, 2));
    }

    #[test]
    fn test_write_after_write() {
        let order = recorded_order(|graph, log| {
            graph.add_task(&[], &[A], record(log, 0));
            graph.add_task(&[], &[A], record(log, 1));
            graph.add_task(&[A], &[], record(log, 2));
        });
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_independent_tasks_all_run() {
        let order = recorded_order(|graph, log| {
            for i in 0..64 {
                let data = DataRef::Particles { block: i };
                graph.add_task(&[], &[data], record(log, i));
            }
            assert_eq!(graph.n_edges(), 0);
        });
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_diamond() {
        let order = recorded_order(|graph, log| {
            graph.add_task(&[], &[A], record(log, 0));
            graph.add_task(&[A], &[B], record(log, 1));
            graph.add_task(&[A], &[C], record(log, 2));
            graph.add_task(&[B, C], &[], record(log, 3));
        });
        assert_eq!(position(&order, 0), 0);
        assert_eq!(position(&order, 3), 3);
    }

    #[test]
    fn test_epoch_ordering() {
        let epoch_2 = DataRef::M2lEpoch { level: 2 };
        let epoch_3 = DataRef::M2lEpoch { level: 3 };
        let order = recorded_order(|graph, log| {
            // Level 2 transfer work, epoch close, then level 3 work.
            graph.add_task(&[epoch_2], &[C], record(log, 0));
            graph.add_task(&[epoch_2], &[C], record(log, 1));
            graph.add_task(&[], &[epoch_2, epoch_3], record(log, 2));
            graph.add_task(&[epoch_3], &[C], record(log, 3));
        });
        assert!(position(&order, 2) > position(&order, 0));
        assert!(position(&order, 2) > position(&order, 1));
        assert!(position(&order, 3) > position(&order, 2));
    }
}
