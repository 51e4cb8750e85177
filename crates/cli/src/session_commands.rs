use std::path::Path;

use {anyhow::Result, clap::Subcommand, wagate_whatsapp::SessionStore};

#[derive(Subcommand)]
pub enum SessionAction {
    /// Show whether a paired session is stored.
    Status,
    /// Delete stored credentials so the next start pairs from scratch.
    Clear,
}

pub fn handle_session(action: SessionAction, session_dir: &Path) -> Result<()> {
    let store = SessionStore::open(session_dir)?;
    match action {
        SessionAction::Status => {
            println!("{}", status(&store, session_dir));
            Ok(())
        },
        SessionAction::Clear => {
            store.clear()?;
            println!("Session cleared: {}", session_dir.display());
            Ok(())
        },
    }
}

fn status(store: &SessionStore, session_dir: &Path) -> String {
    if !store.has_session() {
        return format!("{}: not paired", session_dir.display());
    }
    let creds = store.load();
    format!(
        "{}: paired (protocol {}, {} bytes)",
        session_dir.display(),
        creds.version,
        creds.blob.len()
    )
}
