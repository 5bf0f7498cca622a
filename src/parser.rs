use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, PartialEq)]
pub struct ParsedTask {
    pub description: String,
    pub due: Option<NaiveDateTime>,
    pub include_time: bool,
}

fn due_re() -> &'static Regex {
    static DUE: OnceLock<Regex> = OnceLock::new();
    DUE.get_or_init(|| {
        Regex::new(r"@(today|tomorrow|\d{4}-\d{2}-\d{2})(?:[T ](\d{1,2}:\d{2}))?\s*")
            .expect("due date pattern is valid")
    })
}

fn spaces_re() -> &'static Regex {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    SPACES.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

/// Pulls `@date` / `@date HH:MM` tokens out of a quick-add line. The first
/// token that names a real date wins; every token is stripped from the
/// description.
pub fn parse_task_input(input: &str, today: NaiveDate) -> ParsedTask {
    let mut due = None;
    let mut include_time = false;

    // Due date
    for caps in due_re().captures_iter(input) {
        if due.is_some() {
            break;
        }
        let date = match caps.get(1).map(|m| m.as_str()) {
            Some("today") => Some(today),
            Some("tomorrow") => today.checked_add_days(Days::new(1)),
            Some(text) => NaiveDate::parse_from_str(text, "%Y-%m-%d").ok(),
            None => None,
        };
        let Some(date) = date else {
            continue;
        };
        // An unreadable time keeps the date.
        match caps
            .get(2)
            .and_then(|time| NaiveTime::parse_from_str(time.as_str(), "%H:%M").ok())
        {
            Some(time) => {
                due = Some(date.and_time(time));
                include_time = true;
            }
            None => due = date.and_hms_opt(0, 0, 0),
        }
    }

    let description = due_re().replace_all(input, "").to_string();

    let description = spaces_re()
        .replace_all(&description, " ")
        .trim()
        .to_string();

    ParsedTask {
        description,
        due,
        include_time,
    }
}
