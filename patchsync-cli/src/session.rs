//! Interactive client: stdin commands in, document edits out.
//!
//! Stdin lines and connection events are handled one at a time by a single
//! task, so the engine never needs a lock.

use std::error::Error;

use patchsync_collab::{
    ClientConfig, EngineUpdate, OriginToken, SyncClient, SyncEngine, SyncError, Transport,
};
use patchsync_core::{History, PatchOp};
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::command::{DemoCommand, HELP};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no node to remove, add one first or name it")]
    NoTarget,
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// The engine plus what the command line remembers between commands.
pub struct Session<T: Transport> {
    engine: SyncEngine<T>,
    last_added: Option<String>,
}

impl<T: Transport> Session<T> {
    pub fn new(engine: SyncEngine<T>) -> Self {
        Self {
            engine,
            last_added: None,
        }
    }

    pub fn engine(&self) -> &SyncEngine<T> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SyncEngine<T> {
        &mut self.engine
    }

    pub fn last_added(&self) -> Option<&str> {
        self.last_added.as_deref()
    }

    /// Turn an editing command into a local edit. Commands that do not edit
    /// the document return `Ok(None)`, as do undo/redo with nothing to do.
    pub fn edit(&mut self, command: DemoCommand) -> Result<Option<OriginToken>, SessionError> {
        let token = match command {
            DemoCommand::Add { id, name, x } => {
                let id = id.unwrap_or_else(|| rand::thread_rng().gen_range(0..1000).to_string());
                let mut batch = Vec::with_capacity(2);
                if !self.engine.document().contains("/nodes") {
                    batch.push(PatchOp::add("/nodes", json!({})));
                }
                batch.push(PatchOp::add(
                    format!("/nodes/{id}"),
                    json!({
                        "x": x.unwrap_or(1),
                        "name": name.unwrap_or_else(|| "bla".to_string()),
                    }),
                ));
                let token = self.engine.perform_local_batch(batch)?;
                self.last_added = Some(id);
                Some(token)
            }
            DemoCommand::Remove(id) => {
                let id = id
                    .or_else(|| self.last_added.clone())
                    .ok_or(SessionError::NoTarget)?;
                let token = self.engine.perform_local_edit(PatchOp::remove(node_path(&id)))?;
                if self.last_added.as_deref() == Some(id.as_str()) {
                    self.last_added = None;
                }
                Some(token)
            }
            DemoCommand::Rename { id, name } => Some(
                self.engine
                    .perform_local_edit(PatchOp::replace(format!("{}/name", node_path(&id)), json!(name)))?,
            ),
            DemoCommand::Move { id, x } => Some(
                self.engine
                    .perform_local_edit(PatchOp::replace(format!("{}/x", node_path(&id)), json!(x)))?,
            ),
            DemoCommand::Clear => {
                let op = if self.engine.document().contains("/nodes") {
                    PatchOp::replace("/nodes", json!({}))
                } else {
                    PatchOp::add("/nodes", json!({}))
                };
                Some(self.engine.perform_local_edit(op)?)
            }
            DemoCommand::Undo => self.engine.undo()?,
            DemoCommand::Redo => self.engine.redo()?,
            _ => None,
        };
        Ok(token)
    }

    /// The op that `undo` or `redo` would send next.
    pub fn describe_step(&self, command: &DemoCommand) -> Option<String> {
        let history = self.engine.history();
        let entry = match command {
            DemoCommand::Undo => history.peek_undo()?,
            DemoCommand::Redo => history.peek_redo()?,
            _ => return None,
        };
        let op = match command {
            DemoCommand::Undo => &entry.inverse,
            _ => &entry.forward,
        };
        Some(format!("{} {}", op.kind(), op.path()))
    }

    fn print_document(&self) -> Result<(), serde_json::Error> {
        println!("{}", serde_json::to_string_pretty(self.engine.document())?);
        Ok(())
    }

    fn print_pending(&self) -> Result<(), serde_json::Error> {
        if self.engine.pending().is_empty() {
            println!("nothing pending");
        }
        for entry in self.engine.pending().iter() {
            println!("{} {}", entry.token, serde_json::to_string(&entry.batch)?);
        }
        Ok(())
    }
}

fn node_path(id: &str) -> String {
    format!("/nodes/{}", patchsync_core::pointer::escape(id))
}

fn report(update: &EngineUpdate) {
    match update {
        EngineUpdate::Confirmed(token) => println!("confirmed {token}"),
        EngineUpdate::RemoteApplied { token, dropped } => {
            println!("applied {token}");
            for token in dropped {
                println!("dropped {token}: no longer applies");
            }
        }
        EngineUpdate::SnapshotLoaded { replayed, dropped } => {
            println!("snapshot loaded, {replayed} pending batch(es) kept, {} dropped", dropped.len());
        }
        EngineUpdate::Replayed(count) => println!("resent {count} pending batch(es)"),
        EngineUpdate::RolledBack { token, dropped } => {
            println!("server refused {token}, rolled back");
            for token in dropped {
                println!("dropped {token}: no longer applies");
            }
        }
        EngineUpdate::Disconnected => println!("disconnected"),
        EngineUpdate::Unchanged => {}
    }
}

/// Connect to `url` and process commands until `quit` or end of input.
/// At most `history_limit` undo steps are kept.
pub async fn run(url: String, history_limit: usize) -> Result<(), Box<dyn Error + Send + Sync>> {
    let (transport, mut events, handle) = SyncClient::spawn(ClientConfig::new(url.clone()));
    let engine = SyncEngine::new(transport).with_history(History::with_limit(history_limit));
    let mut session = Session::new(engine);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    log::info!("Client {} connecting to {url}", session.engine().client_id());
    println!("{HELP}");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match DemoCommand::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(DemoCommand::Quit)) => break,
                    Ok(Some(DemoCommand::Connect)) => handle.start(),
                    Ok(Some(DemoCommand::Disconnect)) => handle.stop(),
                    Ok(Some(DemoCommand::Show)) => session.print_document()?,
                    Ok(Some(DemoCommand::Pending)) => session.print_pending()?,
                    Ok(Some(DemoCommand::Help)) => println!("{HELP}"),
                    Ok(Some(command)) => {
                        if let Some(step) = session.describe_step(&command) {
                            println!("{step}");
                        }
                        match session.edit(command) {
                            Ok(Some(token)) if session.engine().is_connected() => println!("sent {token}"),
                            Ok(Some(token)) => println!("queued {token} until reconnected"),
                            Ok(None) => println!("nothing to do"),
                            Err(e) => eprintln!("{e}"),
                        }
                    }
                    Err(e) => eprintln!("{e}"),
                }
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                match session.engine_mut().handle_event(event) {
                    Ok(update) => report(&update),
                    Err(e) => log::error!("{e}"),
                }
            }
        }
    }

    handle.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchsync_collab::ChannelTransport;

    fn session() -> Session<ChannelTransport> {
        let (transport, _outbox) = ChannelTransport::new();
        Session::new(SyncEngine::new(transport))
    }

    #[test]
    fn test_add_defaults() {
        let mut s = session();
        s.edit(DemoCommand::Add { id: Some("42".into()), name: None, x: None })
            .unwrap()
            .unwrap();
        let node = s.engine().document().node("42").unwrap();
        assert_eq!(node.name.as_deref(), Some("bla"));
        assert_eq!(node.x, Some(1));
        assert_eq!(s.last_added(), Some("42"));
    }

    #[test]
    fn test_add_random_id_creates_nodes() {
        let mut s = session();
        s.engine_mut().seed(patchsync_core::Document::from_value(json!({})));
        s.edit(DemoCommand::Add { id: None, name: Some("n".into()), x: Some(3) })
            .unwrap();
        let id = s.last_added().unwrap().to_string();
        assert!(id.parse::<u32>().unwrap() < 1000);
        assert_eq!(s.engine().document().node_count(), 1);
        assert_eq!(s.engine().pending().len(), 1);
        assert_eq!(s.engine().history().undo_len(), 2);
    }

    #[test]
    fn test_remove_defaults_to_last_added() {
        let mut s = session();
        assert!(matches!(s.edit(DemoCommand::Remove(None)), Err(SessionError::NoTarget)));

        s.edit(DemoCommand::Add { id: Some("7".into()), name: None, x: None })
            .unwrap();
        s.edit(DemoCommand::Remove(None)).unwrap();
        assert!(!s.engine().document().contains("/nodes/7"));
        assert_eq!(s.last_added(), None);
    }

    #[test]
    fn test_rename_move_and_clear() {
        let mut s = session();
        s.edit(DemoCommand::Add { id: Some("1".into()), name: None, x: None })
            .unwrap();
        s.edit(DemoCommand::Rename { id: "1".into(), name: "new name!".into() })
            .unwrap();
        s.edit(DemoCommand::Move { id: "1".into(), x: 9 }).unwrap();
        let node = s.engine().document().node("1").unwrap();
        assert_eq!(node.name.as_deref(), Some("new name!"));
        assert_eq!(node.x, Some(9));

        s.edit(DemoCommand::Clear).unwrap();
        assert_eq!(s.engine().document().node_count(), 0);
    }

    #[test]
    fn test_rename_and_move_replace_existing_fields() {
        let mut s = session();
        s.edit(DemoCommand::Add { id: Some("1".into()), name: None, x: None })
            .unwrap();
        let rename = s
            .edit(DemoCommand::Rename { id: "1".into(), name: "n".into() })
            .unwrap()
            .unwrap();
        let moved = s.edit(DemoCommand::Move { id: "1".into(), x: 4 }).unwrap().unwrap();
        assert_eq!(
            s.engine().pending().get(&rename).unwrap().batch,
            vec![PatchOp::replace("/nodes/1/name", json!("n"))]
        );
        assert_eq!(
            s.engine().pending().get(&moved).unwrap().batch,
            vec![PatchOp::replace("/nodes/1/x", json!(4))]
        );
    }

    #[test]
    fn test_move_node_without_x_fails() {
        let mut s = session();
        s.engine_mut()
            .seed(patchsync_core::Document::from_value(json!({"nodes": {"1": {"name": "a"}}})));
        let err = s.edit(DemoCommand::Move { id: "1".into(), x: 2 }).unwrap_err();
        assert!(matches!(err, SessionError::Sync(SyncError::LocalApply(_))));
    }

    #[test]
    fn test_describe_step_shows_next_undo_and_redo() {
        let mut s = session();
        assert_eq!(s.describe_step(&DemoCommand::Undo), None);
        s.edit(DemoCommand::Add { id: Some("1".into()), name: None, x: None })
            .unwrap();
        s.edit(DemoCommand::Move { id: "1".into(), x: 5 }).unwrap();
        assert_eq!(
            s.describe_step(&DemoCommand::Undo).as_deref(),
            Some("replace /nodes/1/x")
        );
        s.edit(DemoCommand::Undo).unwrap();
        assert_eq!(
            s.describe_step(&DemoCommand::Redo).as_deref(),
            Some("replace /nodes/1/x")
        );
        assert_eq!(s.describe_step(&DemoCommand::Show), None);
    }

    #[test]
    fn test_history_limit_bounds_undo() {
        let (transport, _outbox) = ChannelTransport::new();
        let mut s = Session::new(SyncEngine::new(transport).with_history(History::with_limit(2)));
        s.edit(DemoCommand::Add { id: Some("1".into()), name: None, x: None })
            .unwrap();
        for x in 2..6 {
            s.edit(DemoCommand::Move { id: "1".into(), x }).unwrap();
        }
        assert_eq!(s.engine().history().undo_len(), 2);
    }

    #[test]
    fn test_rename_missing_node_fails() {
        let mut s = session();
        let err = s
            .edit(DemoCommand::Rename { id: "404".into(), name: "x".into() })
            .unwrap_err();
        assert!(matches!(err, SessionError::Sync(SyncError::LocalApply(_))));
        assert!(s.engine().pending().is_empty());
    }

    #[test]
    fn test_undo_redo_through_session() {
        let mut s = session();
        let before = s.engine().document().clone();
        s.edit(DemoCommand::Add { id: Some("1".into()), name: None, x: None })
            .unwrap();
        let after = s.engine().document().clone();

        assert!(s.edit(DemoCommand::Undo).unwrap().is_some());
        assert_eq!(s.engine().document(), &before);
        assert!(s.edit(DemoCommand::Redo).unwrap().is_some());
        assert_eq!(s.engine().document(), &after);
        assert!(s.edit(DemoCommand::Redo).unwrap().is_none());
    }

    #[test]
    fn test_non_edit_commands_do_nothing() {
        let mut s = session();
        assert!(s.edit(DemoCommand::Show).unwrap().is_none());
        assert!(s.engine().pending().is_empty());
    }
}
