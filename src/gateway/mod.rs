//! Websocket gateway.
//!
//! Each socket gets a [`Connection`] handle (an id plus an unbounded outbound
//! queue) and a [`Session`] that remembers which participant it speaks for.
//! Inbound frames go through [`dispatch`], which parses the envelope and
//! routes it to the [`Registry`]; replies and broadcasts travel back through
//! the outbound queues.

pub mod protocol;
pub mod server;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::lobby::{LobbyError, ParticipantId, Registry};

use protocol::{ClientMessage, ServerMessage};

pub use server::{serve, AppState};

pub type ConnectionId = u64;

/// What the socket writer should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    Close,
}

/// Sending half of one socket
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message; `false` once the socket writer is gone
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    pub fn close(&self) {
        if self.tx.send(Outbound::Close).is_err() {
            debug!("Connection {} already closed", self.id);
        }
    }
}

/// Per-socket dispatch state
#[derive(Debug)]
pub struct Session {
    pub connection: Connection,
    pub participant: Option<ParticipantId>,
}

impl Session {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            participant: None,
        }
    }
}

/// Handle one inbound text frame to completion
pub fn dispatch(registry: &mut Registry, session: &mut Session, text: &str) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Rejected frame on connection {}: {}", session.connection.id(), e);
            session
                .connection
                .send(ServerMessage::error(e.code(), e.to_string()));
            return;
        }
    };
    debug!("Connection {} sent {:?}", session.connection.id(), message);

    if let ClientMessage::Hello(hello) = message {
        // switching identity on a live socket releases the previous one
        // the same way a dropped socket would
        if let Some(previous) = session.participant.take() {
            let conn_id = session.connection.id();
            if hello.player_id.as_deref() != Some(previous.as_str())
                && registry.is_attached(&previous, conn_id)
            {
                debug!("Connection {} switches away from {}", conn_id, previous);
                registry.disconnect(&previous, conn_id);
            }
        }
        let pid = registry.attach(&session.connection, hello);
        session.participant = Some(pid);
        return;
    }

    // a socket whose participant reattached elsewhere no longer speaks for it
    let pid = match &session.participant {
        Some(pid) if registry.is_attached(pid, session.connection.id()) => pid.clone(),
        _ => {
            reply_error(session, &LobbyError::NotIdentified);
            return;
        }
    };

    let result = match message {
        ClientMessage::Create(req) => registry.create_lobby(&pid, req.color).map(|_| ()),
        ClientMessage::Join(req) => registry.join_lobby(&pid, &req.game_id),
        ClientMessage::Move(req) => registry.submit_move(&pid, &req.game_id, &req.mv),
        ClientMessage::Resign(req) => registry.resign(&pid, &req.game_id),
        ClientMessage::Leave(req) => registry.leave(&pid, req.game_id.as_deref()),
        ClientMessage::Pong => {
            registry.record_pong(&pid);
            Ok(())
        }
        ClientMessage::Hello(_) => Ok(()),
    };

    if let Err(e) = result {
        reply_error(session, &e);
    }
}

fn reply_error(session: &Session, error: &LobbyError) {
    debug!("Connection {} error: {}", session.connection.id(), error);
    session
        .connection
        .send(ServerMessage::error(error.code(), error.to_string()));
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        gateway::protocol::ErrorCode, identity::AnonymousOnly, storage::MemoryGameStore,
    };

    fn registry() -> Registry {
        let (registry, _expired) = Registry::new(
            Arc::new(MemoryGameStore::new()),
            Arc::new(AnonymousOnly),
            Duration::from_secs(60),
        );
        registry
    }

    fn session(id: ConnectionId) -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(Connection::new(id, tx)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(message) = item {
                out.push(message);
            }
        }
        out
    }

    fn error_code(messages: &[ServerMessage]) -> Option<ErrorCode> {
        messages.iter().find_map(|m| match m {
            ServerMessage::Error(e) => Some(e.code),
            _ => None,
        })
    }

    #[tokio::test]
    async fn requires_hello_before_anything_else() {
        let mut registry = registry();
        let (mut s, mut rx) = session(1);

        dispatch(&mut registry, &mut s, r#"{"type":"create"}"#);
        assert_eq!(error_code(&drain(&mut rx)), Some(ErrorCode::NotIdentified));
        assert_eq!(registry.lobby_count(), 0);

        dispatch(&mut registry, &mut s, r#"{"type":"hello","name":"Ann"}"#);
        let replies = drain(&mut rx);
        assert!(matches!(&replies[0], ServerMessage::Hello(h) if h.name.as_deref() == Some("Ann")));

        dispatch(&mut registry, &mut s, r#"{"type":"create","color":"white"}"#);
        assert!(matches!(&drain(&mut rx)[0], ServerMessage::Created(_)));
        assert_eq!(registry.lobby_count(), 1);
    }

    #[tokio::test]
    async fn malformed_frames_change_nothing() {
        let mut registry = registry();
        let (mut s, mut rx) = session(1);
        dispatch(&mut registry, &mut s, r#"{"type":"hello"}"#);
        drain(&mut rx);

        dispatch(&mut registry, &mut s, "{{{");
        assert_eq!(error_code(&drain(&mut rx)), Some(ErrorCode::InvalidPayload));

        dispatch(&mut registry, &mut s, r#"{"type":"teleport"}"#);
        assert_eq!(error_code(&drain(&mut rx)), Some(ErrorCode::UnknownType));

        dispatch(&mut registry, &mut s, r#"{"type":"join"}"#);
        assert_eq!(error_code(&drain(&mut rx)), Some(ErrorCode::InvalidPayload));

        assert_eq!(registry.lobby_count(), 0);
        assert_eq!(registry.participant_count(), 1);
    }

    #[tokio::test]
    async fn full_game_over_the_wire() {
        let mut registry = registry();
        let (mut host, mut host_rx) = session(1);
        let (mut guest, mut guest_rx) = session(2);

        dispatch(&mut registry, &mut host, r#"{"type":"hello"}"#);
        dispatch(&mut registry, &mut guest, r#"{"type":"hello"}"#);
        dispatch(&mut registry, &mut host, r#"{"type":"create","color":"white"}"#);
        let game_id = match &drain(&mut host_rx)[..] {
            [ServerMessage::Hello(_), ServerMessage::Created(c)] => c.game_id.clone(),
            other => panic!("unexpected {other:?}"),
        };
        drain(&mut guest_rx);

        let join = format!(r#"{{"type":"join","gameId":"{}"}}"#, game_id.to_lowercase());
        dispatch(&mut registry, &mut guest, &join);
        assert!(matches!(&drain(&mut host_rx)[0], ServerMessage::Start(s) if s.color == crate::chess::Side::White));
        assert!(matches!(&drain(&mut guest_rx)[0], ServerMessage::Start(s) if s.color == crate::chess::Side::Black));

        let mv = |m: &str| format!(r#"{{"type":"move","gameId":"{game_id}","move":"{m}"}}"#);

        // guest is black, so this is out of turn
        dispatch(&mut registry, &mut guest, &mv("e7e5"));
        assert_eq!(error_code(&drain(&mut guest_rx)), Some(ErrorCode::NotYourTurn));

        for (who, m) in [(1, "f2f3"), (2, "e7e5"), (1, "g2g4"), (2, "Qh4#")] {
            let s = if who == 1 { &mut host } else { &mut guest };
            dispatch(&mut registry, s, &mv(m));
        }

        let host_msgs = drain(&mut host_rx);
        match host_msgs.last() {
            Some(ServerMessage::GameOver(over)) => {
                assert_eq!(over.result, crate::lobby::Outcome::Black);
                assert_eq!(over.reason, crate::lobby::EndReason::Checkmate);
            }
            other => panic!("expected game over, got {other:?}"),
        }
        drain(&mut guest_rx);

        dispatch(&mut registry, &mut host, &format!(r#"{{"type":"resign","gameId":"{game_id}"}}"#));
        assert_eq!(error_code(&drain(&mut host_rx)), Some(ErrorCode::GameNotFound));
    }

    #[tokio::test]
    async fn second_hello_releases_the_seated_identity() {
        let mut registry = registry();
        let (mut host, mut host_rx) = session(1);
        let (mut guest, mut guest_rx) = session(2);
        dispatch(&mut registry, &mut host, r#"{"type":"hello"}"#);
        dispatch(&mut registry, &mut guest, r#"{"type":"hello"}"#);
        let seated = host.participant.clone().unwrap();

        dispatch(&mut registry, &mut host, r#"{"type":"create","color":"white"}"#);
        let game_id = registry.participant(&seated).unwrap().game_id.clone().unwrap();
        dispatch(
            &mut registry,
            &mut guest,
            &format!(r#"{{"type":"join","gameId":"{game_id}"}}"#),
        );
        drain(&mut host_rx);
        drain(&mut guest_rx);

        // same id again keeps the seat and starts nothing
        dispatch(
            &mut registry,
            &mut host,
            &format!(r#"{{"type":"hello","playerId":"{seated}"}}"#),
        );
        assert_eq!(host.participant.as_deref(), Some(seated.as_str()));
        assert!(!registry.has_pending_timer(&seated));
        drain(&mut host_rx);

        dispatch(&mut registry, &mut host, r#"{"type":"hello"}"#);
        let fresh = host.participant.clone().unwrap();
        assert_ne!(fresh, seated);
        assert!(registry.is_attached(&fresh, 1));

        let old = registry.participant(&seated).unwrap();
        assert!(!old.is_connected());
        assert_eq!(old.game_id.as_deref(), Some(game_id.as_str()));
        assert!(registry.has_pending_timer(&seated));
        assert!(drain(&mut guest_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::OpponentDisconnect(d) if d.game_id == game_id)));

        // closing the socket now only concerns the fresh identity
        assert!(registry.disconnect(&fresh, 1).is_none());
        assert!(registry.has_pending_timer(&seated));
    }

    #[tokio::test]
    async fn superseded_socket_loses_its_identity() {
        let mut registry = registry();
        let (mut first, mut first_rx) = session(1);
        dispatch(&mut registry, &mut first, r#"{"type":"hello"}"#);
        let pid = first.participant.clone().unwrap();
        drain(&mut first_rx);

        let (mut second, _second_rx) = session(2);
        dispatch(
            &mut registry,
            &mut second,
            &format!(r#"{{"type":"hello","playerId":"{pid}"}}"#),
        );
        assert_eq!(second.participant.as_deref(), Some(pid.as_str()));
        assert!(matches!(first_rx.try_recv(), Ok(Outbound::Close)));

        dispatch(&mut registry, &mut first, r#"{"type":"create"}"#);
        assert_eq!(error_code(&drain(&mut first_rx)), Some(ErrorCode::NotIdentified));
        assert_eq!(registry.lobby_count(), 0);
    }
}
