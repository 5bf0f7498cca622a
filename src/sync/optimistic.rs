//! Two-phase local mutations: applied to the in-memory list right away, then
//! either confirmed by the store or rolled back.

use crate::models::{Task, TaskId};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Change {
    Toggle { id: TaskId, previous: bool },
    Delete { task: Task },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    AppliedLocally,
    Confirmed,
    RolledBack,
}

#[derive(Debug)]
pub struct Optimistic {
    change: Change,
    stage: Stage,
}

impl Optimistic {
    /// Flips the task's status in place. `None` if the id is not in the list.
    pub fn toggle(tasks: &mut [Task], id: &TaskId) -> Option<Self> {
        let task = tasks.iter_mut().find(|task| &task.id == id)?;
        let previous = task.status;
        task.status = !previous;
        Some(Optimistic {
            change: Change::Toggle {
                id: id.clone(),
                previous,
            },
            stage: Stage::AppliedLocally,
        })
    }

    /// Removes the task from the list. `None` if the id is not in the list.
    pub fn delete(tasks: &mut Vec<Task>, id: &TaskId) -> Option<Self> {
        let index = tasks.iter().position(|task| &task.id == id)?;
        let task = tasks.remove(index);
        Some(Optimistic {
            change: Change::Delete { task },
            stage: Stage::AppliedLocally,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Status to submit for a toggle. `None` for deletions.
    pub fn target_status(&self) -> Option<bool> {
        match &self.change {
            Change::Toggle { previous, .. } => Some(!previous),
            Change::Delete { .. } => None,
        }
    }

    pub fn confirm(&mut self) {
        if self.stage == Stage::AppliedLocally {
            self.stage = Stage::Confirmed;
        }
    }

    /// Restores the pre-mutation value. A deleted task is appended at the end
    /// unless a snapshot already brought it back.
    pub fn roll_back(&mut self, tasks: &mut Vec<Task>) {
        if self.stage != Stage::AppliedLocally {
            return;
        }
        match &self.change {
            Change::Toggle { id, previous } => {
                if let Some(task) = tasks.iter_mut().find(|task| &task.id == id) {
                    task.status = *previous;
                }
            }
            Change::Delete { task } => {
                if !tasks.iter().any(|t| t.id == task.id) {
                    tasks.push(task.clone());
                }
            }
        }
        self.stage = Stage::RolledBack;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: bool) -> Task {
        Task {
            id: TaskId::new(id),
            description: format!("task {}", id),
            status,
            created_at: None,
            due_date: None,
            modified_at: None,
        }
    }

    #[test]
    fn test_toggle_applies_and_rolls_back() {
        let mut tasks = vec![task("a", false), task("b", true)];
        let mut op = Optimistic::toggle(&mut tasks, &TaskId::new("a")).unwrap();
        assert!(tasks[0].status);
        assert_eq!(op.stage(), Stage::AppliedLocally);

        op.roll_back(&mut tasks);
        assert!(!tasks[0].status);
        assert_eq!(op.stage(), Stage::RolledBack);
    }

    #[test]
    fn test_toggle_unknown_id() {
        let mut tasks = vec![task("a", false)];
        assert!(Optimistic::toggle(&mut tasks, &TaskId::new("zz")).is_none());
        assert!(!tasks[0].status);
    }

    #[test]
    fn test_confirmed_change_cannot_roll_back() {
        let mut tasks = vec![task("a", false)];
        let mut op = Optimistic::toggle(&mut tasks, &TaskId::new("a")).unwrap();
        op.confirm();
        op.roll_back(&mut tasks);
        assert!(tasks[0].status);
        assert_eq!(op.stage(), Stage::Confirmed);
    }

    #[test]
    fn test_delete_rollback_appends() {
        let mut tasks = vec![task("a", false), task("b", false), task("c", false)];
        let mut op = Optimistic::delete(&mut tasks, &TaskId::new("a")).unwrap();
        assert_eq!(tasks.len(), 2);

        op.roll_back(&mut tasks);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_delete_rollback_skips_task_already_restored() {
        let mut tasks = vec![task("a", false)];
        let mut op = Optimistic::delete(&mut tasks, &TaskId::new("a")).unwrap();
        tasks.push(task("a", false));

        op.roll_back(&mut tasks);
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_rollback_runs_once() {
        let mut tasks = vec![task("a", false)];
        let mut op = Optimistic::delete(&mut tasks, &TaskId::new("a")).unwrap();
        op.roll_back(&mut tasks);
        op.roll_back(&mut tasks);
        assert_eq!(tasks.len(), 1);
    }
}
