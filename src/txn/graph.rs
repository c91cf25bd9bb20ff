//! Task DAG bookkeeping for one transaction.
//!
//! The graph records every staged task, tracks how many predecessors and
//! children each one still waits for, and hands batches of work to the
//! driver in [`transaction`](super::transaction). Creation order doubles as
//! a topological order: a task can only name already-released tasks as
//! predecessors, and children are created from a running parent body.

use super::task::{CommitFn, ExecFn, RevertFn, TaskId, TaskOutcome, TaskState, ValidateFn};

pub(crate) struct TaskNode {
    exec: Option<ExecFn>,
    revert: Option<RevertFn>,
    commit: Option<CommitFn>,
    validate: Option<ValidateFn>,
    state: TaskState,
    succs: Vec<TaskId>,
    parent: Option<TaskId>,
    pending_preds: usize,
    pending_children: usize,
    body_done: bool,
    body_cancelled: bool,
}

impl TaskNode {
    fn terminated(&self) -> bool {
        matches!(self.state, TaskState::Executed | TaskState::Cancelled)
    }
}

pub(crate) struct TaskGraph {
    nodes: Vec<TaskNode>,
    running: usize,
    unfinished: usize,
}

impl TaskGraph {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            running: 0,
            unfinished: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Stages a new task. Predecessors that already terminated count as
    /// satisfied immediately.
    pub(crate) fn add(
        &mut self,
        exec: ExecFn,
        revert: Option<RevertFn>,
        commit: Option<CommitFn>,
        validate: Option<ValidateFn>,
        deps: Vec<TaskId>,
        parent: Option<TaskId>,
    ) -> TaskId {
        let id = self.nodes.len();
        let mut pending_preds = 0;
        for &dep in &deps {
            if !self.nodes[dep].terminated() {
                self.nodes[dep].succs.push(id);
                pending_preds += 1;
            }
        }
        if let Some(parent) = parent {
            self.nodes[parent].pending_children += 1;
        }
        self.nodes.push(TaskNode {
            exec: Some(exec),
            revert,
            commit,
            validate,
            state: TaskState::New,
            succs: Vec::new(),
            parent,
            pending_preds,
            pending_children: 0,
            body_done: false,
            body_cancelled: false,
        });
        self.unfinished += 1;
        id
    }

    /// Moves every eligible task into EXECUTE and hands back its body.
    pub(crate) fn take_ready(&mut self) -> Vec<(TaskId, ExecFn)> {
        let mut batch = Vec::new();
        for id in 0..self.nodes.len() {
            let node = &mut self.nodes[id];
            if node.state != TaskState::New || node.pending_preds != 0 {
                continue;
            }
            let Some(exec) = node.exec.take() else {
                continue;
            };
            node.state = TaskState::Executing;
            self.running += 1;
            batch.push((id, exec));
        }
        batch
    }

    fn has_ready(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.state == TaskState::New && n.pending_preds == 0)
    }

    /// True when nothing is running and nothing can be scheduled.
    pub(crate) fn idle(&self) -> bool {
        self.running == 0 && !self.has_ready()
    }

    /// Records that a task's body returned; terminates it (and possibly a
    /// chain of waiting parents) once all its children have terminated.
    pub(crate) fn complete_body(&mut self, id: TaskId, outcome: TaskOutcome) {
        let node = &mut self.nodes[id];
        node.body_done = true;
        node.body_cancelled = outcome == TaskOutcome::Cancelled;
        self.running -= 1;
        if node.pending_children == 0 {
            self.finish(id);
        }
    }

    fn finish(&mut self, id: TaskId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let (succs, parent) = {
                let node = &mut self.nodes[id];
                if node.terminated() {
                    continue;
                }
                node.state = if node.body_cancelled {
                    TaskState::Cancelled
                } else {
                    TaskState::Executed
                };
                (node.succs.clone(), node.parent)
            };
            self.unfinished -= 1;
            for succ in succs {
                self.nodes[succ].pending_preds -= 1;
            }
            if let Some(parent) = parent {
                let node = &mut self.nodes[parent];
                node.pending_children -= 1;
                if node.body_done && node.pending_children == 0 && !node.terminated() {
                    stack.push(parent);
                }
            }
        }
    }

    /// Revert hooks of executed tasks, in reverse creation order (successors
    /// before predecessors, children before parents). Cancelled tasks are
    /// skipped.
    pub(crate) fn revert_batch(&mut self) -> Vec<RevertFn> {
        let mut batch = Vec::new();
        for node in self.nodes.iter_mut().rev() {
            if node.state != TaskState::Executed {
                continue;
            }
            node.state = TaskState::Reverted;
            if let Some(revert) = node.revert.take() {
                batch.push(revert);
            }
        }
        batch
    }

    /// Commit hooks of executed tasks, in creation order.
    pub(crate) fn commit_batch(&mut self) -> Vec<CommitFn> {
        let mut batch = Vec::new();
        for node in self.nodes.iter_mut() {
            if node.state != TaskState::Executed {
                continue;
            }
            node.state = TaskState::Committed;
            if let Some(commit) = node.commit.take() {
                batch.push(commit);
            }
        }
        batch
    }

    /// Validate hooks of executed tasks, in creation order.
    pub(crate) fn validate_batch(&mut self) -> Vec<ValidateFn> {
        let mut batch = Vec::new();
        for node in self.nodes.iter_mut() {
            if node.state == TaskState::Executed {
                if let Some(validate) = node.validate.take() {
                    batch.push(validate);
                }
            }
        }
        batch
    }

    /// Drops every task; used by transaction restart after the revert pass.
    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.running = 0;
        self.unfinished = 0;
    }
}
