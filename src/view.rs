//! Render-ready projections of the task list. Nothing here touches the store.

use crate::models::Task;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOption {
    CreatedAsc,
    #[default]
    CreatedDesc,
    DueAsc,
    DueDesc,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown sort option `{0}` (expected createdAsc, createdDesc, dueAsc or dueDesc)")]
pub struct ParseSortError(String);

impl SortOption {
    /// Menu order.
    pub const ALL: [SortOption; 4] = [
        SortOption::CreatedDesc,
        SortOption::CreatedAsc,
        SortOption::DueAsc,
        SortOption::DueDesc,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SortOption::CreatedDesc => "Newest first",
            SortOption::CreatedAsc => "Oldest first",
            SortOption::DueAsc => "Due date (earliest)",
            SortOption::DueDesc => "Due date (latest)",
        }
    }

    pub fn next(self) -> SortOption {
        let index = SortOption::ALL
            .iter()
            .position(|option| *option == self)
            .unwrap_or(0);
        SortOption::ALL[(index + 1) % SortOption::ALL.len()]
    }

    fn key(self, task: &Task) -> Option<DateTime<Utc>> {
        match self {
            SortOption::CreatedAsc | SortOption::CreatedDesc => task.created_at,
            SortOption::DueAsc | SortOption::DueDesc => task.due_date,
        }
    }

    fn ascending(self) -> bool {
        matches!(self, SortOption::CreatedAsc | SortOption::DueAsc)
    }

    /// Orders two tasks. A task without the sort key goes after one that has
    /// it in both directions.
    pub fn compare(self, a: &Task, b: &Task) -> Ordering {
        match (self.key(a), self.key(b)) {
            (Some(a), Some(b)) if self.ascending() => a.cmp(&b),
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl fmt::Display for SortOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SortOption {
    type Err = ParseSortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "createdAsc" => Ok(SortOption::CreatedAsc),
            "createdDesc" => Ok(SortOption::CreatedDesc),
            "dueAsc" => Ok(SortOption::DueAsc),
            "dueDesc" => Ok(SortOption::DueDesc),
            other => Err(ParseSortError(other.to_string())),
        }
    }
}

/// Stable sort, so equal keys keep their order.
pub fn sort(tasks: &[Task], option: SortOption) -> Vec<&Task> {
    let mut sorted: Vec<&Task> = tasks.iter().collect();
    sorted.sort_by(|a, b| option.compare(a, b));
    sorted
}

/// Splits into (active, completed), each keeping the input order.
pub fn partition<'a, I>(tasks: I) -> (Vec<&'a Task>, Vec<&'a Task>)
where
    I: IntoIterator<Item = &'a Task>,
{
    tasks.into_iter().partition(|task| !task.status)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TaskView<'a> {
    pub active: Vec<&'a Task>,
    pub completed: Vec<&'a Task>,
}

pub fn compose(tasks: &[Task], option: SortOption) -> TaskView<'_> {
    let (active, completed) = partition(sort(tasks, option));
    TaskView { active, completed }
}

pub fn is_overdue(task: &Task, now: DateTime<Utc>) -> bool {
    !task.status && task.due_date.is_some_and(|due| due < now)
}

pub const NO_DATE: &str = "No date";

/// `Oct 17, 2026` or `Oct 17, 2026, 02:30 PM` in local time.
pub fn format_display_date(timestamp: Option<DateTime<Utc>>, include_time: bool) -> String {
    format_display_date_in(timestamp, include_time, &Local)
}

pub fn format_display_date_in<Tz>(
    timestamp: Option<DateTime<Utc>>,
    include_time: bool,
    tz: &Tz,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let Some(timestamp) = timestamp else {
        return NO_DATE.to_string();
    };
    let local = timestamp.with_timezone(tz);
    if include_time {
        local.format("%b %-d, %Y, %I:%M %p").to_string()
    } else {
        local.format("%b %-d, %Y").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskId;
    use chrono::FixedOffset;
    use proptest::prelude::*;
    use rstest::rstest;

    fn at(seconds: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(seconds, 0).unwrap())
    }

    fn task(id: &str, created: Option<i64>, due: Option<i64>, status: bool) -> Task {
        Task {
            id: TaskId::new(id),
            description: id.to_string(),
            status,
            created_at: created.and_then(at),
            due_date: due.and_then(at),
            modified_at: None,
        }
    }

    fn ids(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|t| t.id.to_string()).collect()
    }

    #[rstest]
    #[case(SortOption::DueAsc, &["three", "five", "none"])]
    #[case(SortOption::DueDesc, &["five", "three", "none"])]
    fn test_missing_due_sorts_last(#[case] option: SortOption, #[case] expected: &[&str]) {
        let tasks = vec![
            task("none", Some(1), None, false),
            task("five", Some(2), Some(5), false),
            task("three", Some(3), Some(3), false),
        ];
        assert_eq!(ids(&sort(&tasks, option)), expected);
    }

    #[rstest]
    #[case(SortOption::CreatedAsc, &["old", "new", "unknown"])]
    #[case(SortOption::CreatedDesc, &["new", "old", "unknown"])]
    fn test_sort_by_created(#[case] option: SortOption, #[case] expected: &[&str]) {
        let tasks = vec![
            task("unknown", None, None, false),
            task("old", Some(10), None, false),
            task("new", Some(20), None, false),
        ];
        assert_eq!(ids(&sort(&tasks, option)), expected);
    }

    #[test]
    fn test_sort_is_stable_for_equal_keys() {
        let tasks = vec![
            task("a", Some(5), None, false),
            task("b", None, None, false),
            task("c", Some(5), None, false),
            task("d", None, None, false),
        ];
        assert_eq!(
            ids(&sort(&tasks, SortOption::CreatedDesc)),
            vec!["a", "c", "b", "d"]
        );
    }

    #[test]
    fn test_compose_sorts_then_partitions() {
        let tasks = vec![
            task("done-old", Some(1), None, true),
            task("open-old", Some(2), None, false),
            task("done-new", Some(3), None, true),
            task("open-new", Some(4), None, false),
        ];
        let view = compose(&tasks, SortOption::CreatedDesc);
        assert_eq!(ids(&view.active), vec!["open-new", "open-old"]);
        assert_eq!(ids(&view.completed), vec!["done-new", "done-old"]);
    }

    #[test]
    fn test_sort_option_cycle_and_parse() {
        assert_eq!(SortOption::default(), SortOption::CreatedDesc);
        assert_eq!(SortOption::CreatedDesc.next(), SortOption::CreatedAsc);
        assert_eq!(SortOption::DueDesc.next(), SortOption::CreatedDesc);
        assert_eq!("dueAsc".parse::<SortOption>(), Ok(SortOption::DueAsc));
        assert!("sideways".parse::<SortOption>().is_err());
        assert_eq!(SortOption::DueAsc.to_string(), "Due date (earliest)");
    }

    #[test]
    fn test_overdue_only_for_open_tasks_past_due() {
        let now = at(100).unwrap();
        assert!(is_overdue(&task("a", None, Some(99), false), now));
        assert!(!is_overdue(&task("b", None, Some(99), true), now));
        assert!(!is_overdue(&task("c", None, Some(100), false), now));
        assert!(!is_overdue(&task("d", None, None, false), now));
    }

    #[test]
    fn test_format_display_date() {
        let ts = Some(Utc.with_ymd_and_hms(2026, 10, 17, 14, 5, 0).unwrap());
        assert_eq!(format_display_date_in(ts, false, &Utc), "Oct 17, 2026");
        assert_eq!(
            format_display_date_in(ts, true, &Utc),
            "Oct 17, 2026, 02:05 PM"
        );
        let minus_five = FixedOffset::west_opt(5 * 3600).unwrap();
        assert_eq!(
            format_display_date_in(ts, true, &minus_five),
            "Oct 17, 2026, 09:05 AM"
        );
        assert_eq!(format_display_date_in(None, true, &Utc), NO_DATE);
    }

    proptest! {
        #[test]
        fn prop_partition_is_complete_and_disjoint(statuses in prop::collection::vec(any::<bool>(), 0..40)) {
            let tasks: Vec<Task> = statuses
                .iter()
                .enumerate()
                .map(|(i, status)| task(&i.to_string(), None, None, *status))
                .collect();
            let (active, completed) = partition(&tasks);

            prop_assert_eq!(active.len() + completed.len(), tasks.len());
            prop_assert!(active.iter().all(|t| !t.status));
            prop_assert!(completed.iter().all(|t| t.status));
            prop_assert!(active.iter().all(|a| !completed.iter().any(|c| c.id == a.id)));

            let mut rejoined: Vec<&str> = active.iter().chain(completed.iter()).map(|t| t.id.as_str()).collect();
            let mut original: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
            rejoined.sort_unstable();
            original.sort_unstable();
            prop_assert_eq!(rejoined, original);
        }
    }
}
