use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use reqwest::Client;
use std::io;
use std::sync::Arc;
use tasksync::api::{FirebaseAuth, FirestoreStore};
use tasksync::app::App;
use tasksync::config::{Backend, Config};
use tasksync::logging;
use tasksync::memory::{MemoryAuth, MemoryStore};
use tasksync::session::{IdentityProvider, Session};
use tasksync::store::DocumentStore;
use tasksync::sync::TaskStore;
use tasksync::ui::run_app;
use tracing::info;

fn backends(
    config: &Config,
) -> Result<(Arc<dyn IdentityProvider>, Arc<dyn DocumentStore>), Box<dyn std::error::Error>> {
    match config.backend {
        Backend::Memory => Ok((
            Arc::new(MemoryAuth::new()),
            Arc::new(MemoryStore::with_latency(config.memory_latency())),
        )),
        Backend::Firebase => {
            let settings = config.firebase_settings()?;
            let client = Client::new();
            let auth = FirebaseAuth::new(client.clone(), settings.api_key);
            let store = FirestoreStore::new(
                client,
                &settings.project_id,
                auth.identity_changes(),
                settings.poll_interval,
            );
            Ok((Arc::new(auth), Arc::new(store)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env, config file and environment overrides
    let config = Config::load()?;
    logging::init(&config.log_file(), &config.log.level)?;
    info!(backend = ?config.backend, "starting tasksync");

    let (provider, backend) = backends(&config)?;
    let session = Arc::new(Session::new(provider));
    let store = TaskStore::new(backend);
    let follower = store.follow(session.watch());

    // Setup terminal UI
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    terminal.hide_cursor()?;

    let app = App::new(
        Arc::clone(&session),
        store.clone(),
        config.ui.default_sort,
        config.ui.show_completed,
    );

    let res = run_app(&mut terminal, app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    follower.abort();
    store.disconnect();
    info!("stopped tasksync");

    if let Err(err) = res {
        eprintln!("Error: {:?}", err);
    }

    Ok(())
}
