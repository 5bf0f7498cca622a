use crate::app::{ActiveInput, App, InputMode, Screen};
use crate::models::Task;
use crate::view::{format_display_date, is_overdue};
use chrono::{Local, Timelike, Utc};
use crossterm::event::{self, Event as CEvent, KeyEventKind};
use ratatui::{
    backend::Backend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::time::Duration;

fn centered_rect_absolute(width: u16, height: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length((r.height.saturating_sub(height)) / 2),
                Constraint::Length(height),
                Constraint::Length((r.height.saturating_sub(height) + 1) / 2),
            ]
            .as_ref(),
        )
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints(
            [
                Constraint::Length((r.width.saturating_sub(width)) / 2),
                Constraint::Length(width),
                Constraint::Length((r.width.saturating_sub(width) + 1) / 2),
            ]
            .as_ref(),
        )
        .split(popup_layout[1])[1]
}

fn key_hint(key: &'static str, action: &'static str) -> [Span<'static>; 2] {
    [
        Span::styled(key, Style::default().fg(Color::Red)),
        Span::raw(action),
    ]
}

fn get_legend(screen: Screen, input_mode: InputMode) -> Text<'static> {
    let hints: Vec<[Span<'static>; 2]> = match (screen, input_mode) {
        (Screen::Auth, _) => vec![
            key_hint(" Tab ", ": Switch Field "),
            key_hint(" Enter ", ": Submit "),
            key_hint(" Ctrl-t ", ": Sign In / Sign Up "),
            key_hint(" Esc ", ": Quit "),
        ],
        (Screen::Tasks, InputMode::Normal) => vec![
            key_hint(" q ", ": Quit "),
            key_hint(" j ", ": Down "),
            key_hint(" k ", ": Up "),
            key_hint(" a ", ": Add Task "),
            key_hint(" e ", ": Edit "),
            key_hint(" Space ", ": Toggle Done "),
            key_hint(" d ", ": Delete "),
            key_hint(" s ", ": Sort "),
            key_hint(" c ", ": Show/Hide Completed "),
            key_hint(" r ", ": Resubscribe "),
            key_hint(" L ", ": Sign Out "),
        ],
        (Screen::Tasks, InputMode::Adding) | (Screen::Tasks, InputMode::Editing) => vec![
            key_hint(" Enter ", ": Submit "),
            key_hint(" Esc ", ": Cancel "),
        ],
    };
    Text::from(Line::from(hints.into_iter().flatten().collect::<Vec<_>>()))
}

// Dates picked without a time are stored at local midnight.
fn due_label(task: &Task) -> Option<String> {
    let due = task.due_date?;
    let include_time = due.with_timezone(&Local).num_seconds_from_midnight() != 0;
    Some(format_display_date(Some(due), include_time))
}

fn task_item(task: &Task) -> ListItem<'static> {
    let mut title = Vec::new();
    if task.status {
        title.push(Span::styled("DONE ", Style::default().fg(Color::Green)));
        title.push(Span::styled(
            task.description.clone(),
            Style::default().add_modifier(Modifier::CROSSED_OUT),
        ));
    } else {
        title.push(Span::raw(task.description.clone()));
    }

    let mut meta = Vec::new();
    if let Some(due) = due_label(task) {
        let style = if is_overdue(task, Utc::now()) {
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::Yellow)
        };
        meta.push(Span::styled(format!("   Due {} ", due), style));
    }
    meta.push(Span::styled(
        format!(" Created {}", format_display_date(task.created_at, true)),
        Style::default().fg(Color::DarkGray),
    ));
    if task.modified_at.is_some() {
        meta.push(Span::styled(
            format!("  Edited {}", format_display_date(task.modified_at, true)),
            Style::default().fg(Color::DarkGray),
        ));
    }

    ListItem::new(vec![Line::from(title), Line::from(meta)])
}

fn task_list(tasks: &[Task], title: String, empty: &'static str) -> List<'static> {
    let block = Block::default().borders(Borders::ALL).title(title);
    if tasks.is_empty() {
        return List::new(vec![ListItem::new(empty)]).block(block);
    }
    List::new(tasks.iter().map(task_item).collect::<Vec<_>>())
        .block(block)
        .highlight_style(
            Style::default()
                .fg(Color::Green)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol(">> ")
}

fn draw_auth(f: &mut Frame, app: &App, area: Rect) {
    let session = app.session.state();
    let title = if app.auth.is_login {
        "Sign In"
    } else {
        "Create Account"
    };
    let popup_area = centered_rect_absolute(60u16.min(area.width), 11u16.min(area.height), area);

    let field_style = |input: ActiveInput| {
        if app.auth.active_input == input {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default().fg(Color::White)
        }
    };
    let masked = "*".repeat(app.auth.password.chars().count());

    let mut lines = vec![
        Line::from(vec![
            Span::styled("Email:    ", Style::default().add_modifier(Modifier::BOLD)),
            Span::styled(app.auth.email.clone(), field_style(ActiveInput::Email)),
        ]),
        Line::from(vec![
            Span::styled("Password: ", Style::default().add_modifier(Modifier::BOLD)),
            Span::styled(masked, field_style(ActiveInput::Password)),
        ]),
        Line::from(""),
    ];
    if session.is_loading {
        lines.push(Line::from(Span::styled(
            "Loading...",
            Style::default().fg(Color::Cyan),
        )));
    }
    if let Some(error) = &session.last_error {
        lines.push(Line::from(Span::styled(
            error.clone(),
            Style::default().fg(Color::Red),
        )));
    }
    if let Some(notice) = &app.notice {
        lines.push(Line::from(Span::styled(
            notice.clone(),
            Style::default().fg(Color::Yellow),
        )));
    }

    let form = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .style(Style::default().fg(Color::Green)),
        )
        .wrap(Wrap { trim: true });
    f.render_widget(Clear, popup_area);
    f.render_widget(form, popup_area);
}

fn draw_tasks(f: &mut Frame, app: &App, area: Rect) {
    let state = app.store.state();
    let visible = app.visible_tasks();
    let active_len = visible.iter().filter(|task| !task.status).count();
    let (active, completed) = visible.split_at(active_len);

    let mut banner: Vec<Line> = Vec::new();
    if let Some(error) = &state.last_error {
        banner.push(Line::from(Span::styled(
            error.clone(),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )));
    }
    if let Some(notice) = &app.notice {
        banner.push(Line::from(Span::styled(
            notice.clone(),
            Style::default().fg(Color::Yellow),
        )));
    }

    let completed_height = if app.show_completed {
        completed_pane_height(completed.len(), area.height)
    } else {
        0
    };
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(1),
                Constraint::Length(banner.len() as u16),
                Constraint::Min(3),
                Constraint::Length(completed_height),
            ]
            .as_ref(),
        )
        .split(area);

    // Header
    let email = app
        .session
        .current_user()
        .map(|identity| identity.email)
        .unwrap_or_default();
    let header = Line::from(vec![
        Span::styled(email, Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(format!(
            "  {} active  Sort: {}  {:?}",
            active.len(),
            app.sort,
            state.phase
        )),
    ]);
    f.render_widget(Paragraph::new(header), chunks[0]);
    f.render_widget(Paragraph::new(banner).wrap(Wrap { trim: true }), chunks[1]);

    // Split the selection between the two lists
    let selected = app.state.selected();
    let mut active_state = ListState::default();
    let mut completed_state = ListState::default();
    match selected {
        Some(i) if i < active.len() => active_state.select(Some(i)),
        Some(i) => completed_state.select(Some(i - active.len())),
        None => {}
    }

    let active_widget = task_list(active, format!("Tasks ({})", active.len()), "No active tasks");
    f.render_stateful_widget(active_widget, chunks[2], &mut active_state);

    if app.show_completed {
        let completed_widget = task_list(
            completed,
            format!("Completed ({})", completed.len()),
            "Nothing completed yet",
        );
        f.render_stateful_widget(completed_widget, chunks[3], &mut completed_state);
    }
}

fn draw_input_popup(f: &mut Frame, title: &str, text: &str, area: Rect) {
    let popup_width = (area.width * 60 / 100).saturating_sub(2).max(1);
    let lines_required = calculate_wrapped_lines(text, popup_width);
    let required_height = std::cmp::max(lines_required as u16, 1);
    let popup_height = std::cmp::min(required_height + 2, area.height.saturating_sub(2));

    let popup_area = centered_rect_absolute(popup_width + 2, popup_height, area);

    let popup_block = Block::default()
        .title(title.to_string())
        .borders(Borders::ALL)
        .style(Style::default().fg(Color::Green));

    let input = Paragraph::new(text.to_string())
        .style(Style::default().fg(Color::White))
        .block(popup_block)
        .wrap(Wrap { trim: false });

    f.render_widget(Clear, popup_area);
    f.render_widget(input, popup_area);
}

fn draw(f: &mut Frame, app: &App) {
    let size = f.area();

    // Split the main layout into body and footer
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(0)
        .constraints([Constraint::Min(0), Constraint::Length(2)].as_ref())
        .split(size);

    let body_chunk = chunks[0];
    let footer_chunk = chunks[1];
    let screen = app.screen();

    match screen {
        Screen::Auth => draw_auth(f, app, body_chunk),
        Screen::Tasks => {
            draw_tasks(f, app, body_chunk);
            match app.input_mode {
                InputMode::Normal => {}
                InputMode::Adding => draw_input_popup(
                    f,
                    "New Task (@YYYY-MM-DD, @today, @tomorrow, optional HH:MM)",
                    &app.new_task_input,
                    body_chunk,
                ),
                InputMode::Editing => {
                    draw_input_popup(f, "Edit Task", &app.edit_buffer, body_chunk)
                }
            }
        }
    }

    // Render the legend in the footer
    let legend = Paragraph::new(get_legend(screen, app.input_mode))
        .style(Style::default().fg(Color::White))
        .alignment(Alignment::Left)
        .wrap(Wrap { trim: true });

    f.render_widget(legend, footer_chunk);
}

pub async fn run_app<B: Backend>(terminal: &mut Terminal<B>, mut app: App) -> io::Result<()> {
    loop {
        app.tick();
        terminal.draw(|f| draw(f, &app))?;

        // Handle input
        if event::poll(Duration::from_millis(100))? {
            if let CEvent::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let should_quit = app.handle_input(key)?;
                if should_quit {
                    return Ok(());
                }
            }
        }
        // Let spawned mutations and the feed make progress between frames.
        tokio::task::yield_now().await;
    }
}

/// Two rows per task plus borders, capped at half the screen.
fn completed_pane_height(count: usize, available: u16) -> u16 {
    u16::try_from(count.max(1))
        .unwrap_or(u16::MAX)
        .saturating_mul(2)
        .saturating_add(2)
        .min(available / 2)
}

fn calculate_wrapped_lines(text: &str, max_width: u16) -> usize {
    let max_width = max_width.max(1) as usize;
    let mut line_count = 0;
    for line in text.lines() {
        let line_width = line.chars().count();
        line_count += line_width.div_ceil(max_width);
    }
    line_count
}
