use crate::models::{Task, TaskId};
use crate::parser::parse_task_input;
use crate::session::Session;
use crate::sync::TaskStore;
use crate::view::{compose, SortOption};
use chrono::Local;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::widgets::ListState;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub struct App {
    pub session: Arc<Session>,
    pub store: TaskStore,
    pub state: ListState,
    pub input_mode: InputMode,
    pub auth: AuthForm,
    pub new_task_input: String,
    pub editing: Option<TaskId>,
    pub edit_buffer: String,
    pub sort: SortOption,
    pub show_completed: bool,
    /// One-line hint for the user, cleared by the next key press.
    pub notice: Option<String>,
    // Quick-add text whose create failed, waiting to be reopened.
    unsaved_tx: mpsc::UnboundedSender<String>,
    unsaved_rx: mpsc::UnboundedReceiver<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Screen {
    Auth,
    Tasks,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Adding,
    Editing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveInput {
    Email,
    Password,
}

pub struct AuthForm {
    pub email: String,
    pub password: String,
    pub active_input: ActiveInput,
    /// Sign in when true, create an account when false.
    pub is_login: bool,
}

impl Default for AuthForm {
    fn default() -> Self {
        AuthForm {
            email: String::new(),
            password: String::new(),
            active_input: ActiveInput::Email,
            is_login: true,
        }
    }
}

impl AuthForm {
    fn field(&mut self) -> &mut String {
        match self.active_input {
            ActiveInput::Email => &mut self.email,
            ActiveInput::Password => &mut self.password,
        }
    }

    fn switch_field(&mut self) {
        self.active_input = match self.active_input {
            ActiveInput::Email => ActiveInput::Password,
            ActiveInput::Password => ActiveInput::Email,
        };
    }
}

impl App {
    pub fn new(
        session: Arc<Session>,
        store: TaskStore,
        sort: SortOption,
        show_completed: bool,
    ) -> App {
        let (unsaved_tx, unsaved_rx) = mpsc::unbounded_channel();
        App {
            session,
            store,
            state: ListState::default(),
            input_mode: InputMode::Normal,
            auth: AuthForm::default(),
            new_task_input: String::new(),
            editing: None,
            edit_buffer: String::new(),
            sort,
            show_completed,
            notice: None,
            unsaved_tx,
            unsaved_rx,
        }
    }

    pub fn screen(&self) -> Screen {
        if self.session.current_user().is_some() {
            Screen::Tasks
        } else {
            Screen::Auth
        }
    }

    /// Active tasks then (if shown) completed ones, in the chosen sort. This
    /// is the order the selection indexes into.
    pub fn visible_tasks(&self) -> Vec<Task> {
        let tasks = self.store.tasks();
        let view = compose(&tasks, self.sort);
        let mut visible: Vec<Task> = view.active.into_iter().cloned().collect();
        if self.show_completed {
            visible.extend(view.completed.into_iter().cloned());
        }
        visible
    }

    pub fn selected_task(&self) -> Option<Task> {
        let index = self.state.selected()?;
        self.visible_tasks().into_iter().nth(index)
    }

    /// Runs once per frame, before drawing.
    pub fn tick(&mut self) {
        if self.screen() == Screen::Tasks && !self.auth.password.is_empty() {
            self.auth.password.clear();
        }
        if self.input_mode == InputMode::Normal {
            if let Ok(text) = self.unsaved_rx.try_recv() {
                self.new_task_input = text;
                self.input_mode = InputMode::Adding;
            }
        }
        let len = self.visible_tasks().len();
        self.clamp_selection(len);
    }

    fn clamp_selection(&mut self, len: usize) {
        let selected = match (len, self.state.selected()) {
            (0, _) => None,
            (_, None) => Some(0),
            (len, Some(i)) => Some(i.min(len - 1)),
        };
        self.state.select(selected);
    }

    pub fn next(&mut self) {
        let len = self.visible_tasks().len();
        if len == 0 {
            self.state.select(None);
            return;
        }
        let i = match self.state.selected() {
            Some(i) => {
                if i >= len - 1 {
                    0
                } else {
                    i + 1
                }
            }
            None => 0,
        };
        self.state.select(Some(i));
    }

    pub fn previous(&mut self) {
        let len = self.visible_tasks().len();
        if len == 0 {
            self.state.select(None);
            return;
        }
        let i = match self.state.selected() {
            Some(i) => {
                if i == 0 {
                    len - 1
                } else {
                    i - 1
                }
            }
            None => 0,
        };
        self.state.select(Some(i));
    }

    pub fn handle_input(&mut self, key: KeyEvent) -> io::Result<bool> {
        self.notice = None;
        match self.screen() {
            Screen::Auth => Ok(self.handle_auth_input(key)),
            Screen::Tasks => Ok(self.handle_task_input(key)),
        }
    }

    fn handle_auth_input(&mut self, key: KeyEvent) -> bool {
        if self.session.state().is_loading {
            return key.code == KeyCode::Esc;
        }
        match key.code {
            KeyCode::Esc => return true,
            KeyCode::Tab | KeyCode::BackTab => self.auth.switch_field(),
            KeyCode::Char('t') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.auth.is_login = !self.auth.is_login;
            }
            KeyCode::Enter => self.submit_auth(),
            KeyCode::Char(c) => self.auth.field().push(c),
            KeyCode::Backspace => {
                self.auth.field().pop();
            }
            _ => {}
        }
        false
    }

    fn submit_auth(&mut self) {
        let email = self.auth.email.trim().to_string();
        let password = self.auth.password.clone();
        if email.is_empty() || password.is_empty() {
            self.notice = Some("Please enter an email and password.".to_string());
            return;
        }

        let session = Arc::clone(&self.session);
        let is_login = self.auth.is_login;
        tokio::spawn(async move {
            let result = if is_login {
                session.sign_in(&email, &password).await
            } else {
                session.sign_up(&email, &password).await
            };
            if let Err(err) = result {
                debug!(%err, "auth attempt failed");
            }
        });
    }

    fn handle_task_input(&mut self, key: KeyEvent) -> bool {
        match self.input_mode {
            InputMode::Normal => match key.code {
                KeyCode::Char('q') => return true,
                KeyCode::Char('j') | KeyCode::Down => self.next(),
                KeyCode::Char('k') | KeyCode::Up => self.previous(),
                KeyCode::Char('a') => {
                    self.input_mode = InputMode::Adding;
                    self.new_task_input.clear();
                }
                KeyCode::Char('e') => self.start_editing(),
                KeyCode::Char(' ') => {
                    if let Some(task) = self.selected_task() {
                        let store = self.store.clone();
                        tokio::spawn(async move {
                            if let Err(err) = store.toggle_status(&task.id).await {
                                debug!(%err, "toggle failed");
                            }
                        });
                    }
                }
                KeyCode::Char('d') => {
                    if let Some(task) = self.selected_task() {
                        let store = self.store.clone();
                        tokio::spawn(async move {
                            if let Err(err) = store.delete_task(&task.id).await {
                                debug!(%err, "delete failed");
                            }
                        });
                    }
                }
                KeyCode::Char('s') => {
                    self.sort = self.sort.next();
                    self.notice = Some(format!("Sorted by: {}", self.sort));
                }
                KeyCode::Char('c') => self.show_completed = !self.show_completed,
                KeyCode::Char('r') => {
                    let store = self.store.clone();
                    tokio::spawn(async move { store.reconnect().await });
                }
                KeyCode::Char('L') => {
                    self.auth = AuthForm::default();
                    self.state.select(None);
                    let session = Arc::clone(&self.session);
                    tokio::spawn(async move {
                        if let Err(err) = session.sign_out().await {
                            debug!(%err, "sign out failed");
                        }
                    });
                }
                _ => {}
            },

            InputMode::Adding => match key.code {
                KeyCode::Enter => {
                    let parsed = parse_task_input(&self.new_task_input, Local::now().date_naive());
                    if parsed.description.is_empty() {
                        self.notice = Some("Task description cannot be empty.".to_string());
                    } else {
                        let store = self.store.clone();
                        let unsaved = self.unsaved_tx.clone();
                        let text = std::mem::take(&mut self.new_task_input);
                        tokio::spawn(async move {
                            if let Err(err) = store
                                .add_task(&parsed.description, parsed.due, parsed.include_time)
                                .await
                            {
                                debug!(%err, "add failed, returning input");
                                let _ = unsaved.send(text);
                            }
                        });
                        self.input_mode = InputMode::Normal;
                    }
                }
                KeyCode::Char(c) => self.new_task_input.push(c),
                KeyCode::Backspace => {
                    self.new_task_input.pop();
                }
                KeyCode::Esc => {
                    self.new_task_input.clear();
                    self.input_mode = InputMode::Normal;
                }
                _ => {}
            },

            InputMode::Editing => match key.code {
                KeyCode::Enter => {
                    if self.edit_buffer.trim().is_empty() {
                        self.notice = Some("Task description cannot be empty.".to_string());
                    } else if let Some(id) = self.editing.take() {
                        let store = self.store.clone();
                        let text = std::mem::take(&mut self.edit_buffer);
                        tokio::spawn(async move {
                            if let Err(err) = store.update_description(&id, &text).await {
                                debug!(%err, "edit failed");
                            }
                        });
                        self.input_mode = InputMode::Normal;
                    }
                }
                KeyCode::Char(c) => self.edit_buffer.push(c),
                KeyCode::Backspace => {
                    self.edit_buffer.pop();
                }
                KeyCode::Esc => self.stop_editing(),
                _ => {}
            },
        }
        false
    }

    fn start_editing(&mut self) {
        match self.selected_task() {
            Some(task) if task.status => {
                self.notice = Some("Completed tasks cannot be edited.".to_string());
            }
            Some(task) => {
                self.edit_buffer = task.description;
                self.editing = Some(task.id);
                self.input_mode = InputMode::Editing;
            }
            None => {}
        }
    }

    fn stop_editing(&mut self) {
        self.editing = None;
        self.edit_buffer.clear();
        self.input_mode = InputMode::Normal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAuth, MemoryStore, Operation};
    use crate::session::IdentityProvider;
    use crate::sync::TaskListState;
    use std::time::Duration;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            app.handle_input(key(KeyCode::Char(c))).unwrap();
        }
    }

    async fn until(app: &App, pred: impl FnMut(&TaskListState) -> bool) -> TaskListState {
        let mut changes = app.store.watch();
        let state = tokio::time::timeout(Duration::from_secs(2), changes.wait_for(pred))
            .await
            .expect("timed out waiting for store state")
            .expect("store dropped")
            .clone();
        state
    }

    async fn signed_in_app() -> (App, MemoryStore) {
        let auth = Arc::new(MemoryAuth::new());
        auth.sign_up("u@example.com", "pw123456").await.unwrap();
        let session = Arc::new(Session::new(auth));
        let backend = MemoryStore::new();
        let store = TaskStore::new(Arc::new(backend.clone()));

        let mut sessions = session.watch();
        tokio::time::timeout(
            Duration::from_secs(1),
            sessions.wait_for(|s| s.current_user.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        store.sync_identity(session.current_user()).await;

        (
            App::new(session, store, SortOption::CreatedDesc, true),
            backend,
        )
    }

    #[tokio::test]
    async fn test_navigation_on_empty_list() {
        let (mut app, _) = signed_in_app().await;
        app.next();
        app.previous();
        app.tick();
        assert_eq!(app.state.selected(), None);
        assert!(app.selected_task().is_none());
    }

    #[tokio::test]
    async fn test_auth_form_requires_both_fields() {
        let session = Arc::new(Session::new(Arc::new(MemoryAuth::new())));
        let store = TaskStore::new(Arc::new(MemoryStore::new()));
        let mut app = App::new(session, store, SortOption::default(), true);
        let mut sessions = app.session.watch();
        sessions.wait_for(|s| !s.is_loading).await.unwrap();

        assert_eq!(app.screen(), Screen::Auth);
        type_text(&mut app, "u@example.com");
        app.handle_input(key(KeyCode::Enter)).unwrap();
        assert_eq!(
            app.notice.as_deref(),
            Some("Please enter an email and password.")
        );

        app.handle_input(key(KeyCode::Tab)).unwrap();
        type_text(&mut app, "pw");
        assert_eq!(app.auth.email, "u@example.com");
        assert_eq!(app.auth.password, "pw");

        app.handle_input(KeyEvent::new(KeyCode::Char('t'), KeyModifiers::CONTROL))
            .unwrap();
        assert!(!app.auth.is_login);
    }

    #[tokio::test]
    async fn test_failed_add_reopens_input() {
        let (mut app, backend) = signed_in_app().await;
        backend.fail_next(Operation::CreateTask, "quota exceeded");

        app.handle_input(key(KeyCode::Char('a'))).unwrap();
        type_text(&mut app, "Pay rent @2026-11-01");
        app.handle_input(key(KeyCode::Enter)).unwrap();
        assert_eq!(app.input_mode, InputMode::Normal);

        let state = until(&app, |s| s.last_error.is_some()).await;
        assert!(state.tasks.is_empty());

        for _ in 0..100 {
            app.tick();
            if app.input_mode == InputMode::Adding {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(app.input_mode, InputMode::Adding);
        assert_eq!(app.new_task_input, "Pay rent @2026-11-01");
    }

    #[tokio::test]
    async fn test_add_toggle_delete_through_keys() {
        let (mut app, backend) = signed_in_app().await;
        let user = app.session.current_user().unwrap().uid;

        app.handle_input(key(KeyCode::Char('a'))).unwrap();
        assert_eq!(app.input_mode, InputMode::Adding);
        type_text(&mut app, "Buy milk @2026-10-20");
        app.handle_input(key(KeyCode::Enter)).unwrap();
        assert_eq!(app.input_mode, InputMode::Normal);

        let state = until(&app, |s| s.tasks.len() == 1).await;
        assert_eq!(state.tasks[0].description, "Buy milk");
        assert!(state.tasks[0].due_date.is_some());

        app.tick();
        app.handle_input(key(KeyCode::Char(' '))).unwrap();
        until(&app, |s| s.tasks.first().is_some_and(|t| t.status)).await;

        // Completed tasks stay selectable while shown, but cannot be edited.
        app.tick();
        app.handle_input(key(KeyCode::Char('e'))).unwrap();
        assert_eq!(app.input_mode, InputMode::Normal);
        assert!(app.notice.is_some());

        app.handle_input(key(KeyCode::Char('d'))).unwrap();
        until(&app, |s| s.tasks.is_empty()).await;
        assert!(backend.tasks(&user).is_empty());
    }

    #[tokio::test]
    async fn test_edit_and_blank_add() {
        let (mut app, backend) = signed_in_app().await;
        app.store.add_task("Draft", None, false).await.unwrap();
        until(&app, |s| s.tasks.len() == 1).await;
        app.tick();

        app.handle_input(key(KeyCode::Char('e'))).unwrap();
        assert_eq!(app.input_mode, InputMode::Editing);
        assert_eq!(app.edit_buffer, "Draft");
        type_text(&mut app, " v2");
        app.handle_input(key(KeyCode::Enter)).unwrap();
        until(&app, |s| s.tasks[0].description == "Draft v2").await;

        app.handle_input(key(KeyCode::Char('a'))).unwrap();
        type_text(&mut app, "  @today ");
        app.handle_input(key(KeyCode::Enter)).unwrap();
        assert_eq!(app.input_mode, InputMode::Adding);
        assert_eq!(
            app.notice.as_deref(),
            Some("Task description cannot be empty.")
        );
        let user = app.store.identity().unwrap().uid;
        assert_eq!(backend.tasks(&user).len(), 1);
    }

    #[tokio::test]
    async fn test_hiding_completed_shrinks_selection() {
        let (mut app, _) = signed_in_app().await;
        let id = app.store.add_task("one", None, false).await.unwrap().unwrap();
        app.store.add_task("two", None, false).await.unwrap();
        until(&app, |s| s.tasks.len() == 2).await;
        app.store.toggle_status(&id).await.unwrap();

        app.tick();
        app.next();
        assert_eq!(app.state.selected(), Some(1));
        assert_eq!(app.visible_tasks().len(), 2);

        app.handle_input(key(KeyCode::Char('c'))).unwrap();
        app.tick();
        assert_eq!(app.visible_tasks().len(), 1);
        assert_eq!(app.state.selected(), Some(0));
    }
}
