use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use log::{debug, info, warn};
use rand::{distributions::Uniform, Rng};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    chess::Side,
    gateway::{
        protocol::{
            CreatedPayload, GameOverPayload, HelloPayload, HelloRequest, LeftPayload,
            MovePayload, OpponentDisconnectPayload, PlayerInfo, ResumePayload, ServerMessage,
            StartPayload,
        },
        Connection, ConnectionId,
    },
    identity::IdentityVerifier,
    storage::{CompletedGame, GameStore, SeatRecord},
};

use super::{
    error::{LobbyError, LobbyResult},
    timers::{GraceTicket, GraceTimers},
    types::{
        EndReason, GameId, GameResult, Lobby, LobbyStatus, MoveRecord, Participant,
        ParticipantId, GAME_ID_LEN,
    },
};

const GAME_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// In-memory directory of participants and lobbies.
///
/// Every operation runs to completion, broadcasts included, before the next
/// one starts; the owner serializes access (the gateway keeps it behind a
/// single mutex). Guard failures return an error and leave state untouched.
pub struct Registry {
    participants: HashMap<ParticipantId, Participant>,
    lobbies: HashMap<GameId, Lobby>,
    timers: GraceTimers,
    store: Arc<dyn GameStore>,
    identity: Arc<dyn IdentityVerifier>,
    disconnect_grace: Duration,
}

impl Registry {
    /// The returned receiver yields disconnect timers as they expire; feed
    /// each ticket back through [`Registry::expire_grace`].
    pub fn new(
        store: Arc<dyn GameStore>,
        identity: Arc<dyn IdentityVerifier>,
        disconnect_grace: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<GraceTicket>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let registry = Self {
            participants: HashMap::new(),
            lobbies: HashMap::new(),
            timers: GraceTimers::new(expired_tx),
            store,
            identity,
            disconnect_grace,
        };
        (registry, expired_rx)
    }

    // ===== Queries =====

    pub fn participant(&self, pid: &str) -> Option<&Participant> {
        self.participants.get(pid)
    }

    pub fn lobby(&self, game_id: &str) -> Option<&Lobby> {
        self.lobbies.get(&normalize_game_id(game_id))
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn lobby_count(&self) -> usize {
        self.lobbies.len()
    }

    pub fn has_pending_timer(&self, pid: &str) -> bool {
        self.timers.is_pending(pid)
    }

    /// Whether `connection` is the live connection of `pid`
    pub fn is_attached(&self, pid: &str, connection: ConnectionId) -> bool {
        self.participants
            .get(pid)
            .and_then(|p| p.connection.as_ref())
            .is_some_and(|c| c.id() == connection)
    }

    // ===== Identification =====

    /// Bind a connection to a participant, creating one unless `hello`
    /// names a known id. A reattaching participant gets its lobby snapshot.
    pub fn attach(&mut self, connection: &Connection, hello: HelloRequest) -> ParticipantId {
        let now = Instant::now();
        let account = hello
            .token
            .as_deref()
            .and_then(|token| self.identity.verify(token));

        let known = hello
            .player_id
            .filter(|pid| self.participants.contains_key(pid));

        let pid = match known {
            Some(pid) => {
                self.timers.cancel(&pid);
                if let Some(participant) = self.participants.get_mut(&pid) {
                    if let Some(old) = participant.connection.replace(connection.clone()) {
                        if old.id() != connection.id() {
                            debug!("Closing superseded connection {} of {}", old.id(), pid);
                            old.close();
                        }
                    }
                    participant.disconnected_at = None;
                    participant.ping_sent_at = None;
                    participant.last_seen = now;
                }
                info!("Participant {} reattached on connection {}", pid, connection.id());
                pid
            }
            None => {
                let pid = Uuid::new_v4().to_string();
                self.participants
                    .insert(pid.clone(), Participant::new(pid.clone(), connection.clone(), now));
                info!("Participant {} attached on connection {}", pid, connection.id());
                pid
            }
        };

        let Some(participant) = self.participants.get_mut(&pid) else {
            return pid;
        };
        if hello.name.is_some() {
            participant.name = hello.name;
        }
        if account.is_some() {
            participant.account_id = account;
        }

        let hello = ServerMessage::Hello(HelloPayload {
            player_id: pid.clone(),
            name: participant.name.clone(),
            authenticated: participant.account_id.is_some(),
        });
        connection.send(hello);

        if let Some(snapshot) = self.resume_snapshot(&pid) {
            connection.send(snapshot);
        }
        pid
    }

    fn resume_snapshot(&self, pid: &str) -> Option<ServerMessage> {
        let participant = self.participants.get(pid)?;
        let lobby = self.lobbies.get(participant.game_id.as_ref()?)?;
        Some(ServerMessage::Resume(ResumePayload {
            game_id: lobby.id.clone(),
            fen: lobby.position.fen(),
            color: participant.side?,
            turn: lobby.position.side_to_move(),
            moves: lobby.moves.clone(),
            status: lobby.status,
            result: lobby.result.map(|r| r.result),
            reason: lobby.result.map(|r| r.reason),
        }))
    }

    pub fn record_pong(&mut self, pid: &str) {
        if let Some(participant) = self.participants.get_mut(pid) {
            participant.ping_sent_at = None;
            participant.last_seen = Instant::now();
        }
    }

    // ===== Lobby lifecycle =====

    pub fn create_lobby(&mut self, pid: &str, color: Option<Side>) -> LobbyResult<GameId> {
        let participant = self.participants.get(pid).ok_or(LobbyError::NotIdentified)?;
        if let Some(game_id) = &participant.game_id {
            return Err(LobbyError::AlreadyInGame(game_id.clone()));
        }

        let side = color.unwrap_or_else(|| {
            if rand::random::<bool>() {
                Side::White
            } else {
                Side::Black
            }
        });
        let game_id = self.fresh_game_id();
        self.lobbies.insert(
            game_id.clone(),
            Lobby::new(game_id.clone(), pid.to_string(), side),
        );

        if let Some(participant) = self.participants.get_mut(pid) {
            participant.game_id = Some(game_id.clone());
            participant.side = Some(side);
        }
        info!("Lobby {} created by {} playing {}", game_id, pid, side);

        self.send(
            pid,
            ServerMessage::Created(CreatedPayload {
                game_id: game_id.clone(),
                color: side,
            }),
        );
        Ok(game_id)
    }

    fn fresh_game_id(&self) -> GameId {
        let mut rng = rand::thread_rng();
        let letters = Uniform::from(0..GAME_ID_ALPHABET.len());
        loop {
            let id: String = (0..GAME_ID_LEN)
                .map(|_| GAME_ID_ALPHABET[rng.sample(letters)] as char)
                .collect();
            if !self.lobbies.contains_key(&id) {
                return id;
            }
            debug!("Lobby id {} collided, regenerating", id);
        }
    }

    pub fn join_lobby(&mut self, pid: &str, game_id: &str) -> LobbyResult<()> {
        let game_id = normalize_game_id(game_id);
        let participant = self.participants.get(pid).ok_or(LobbyError::NotIdentified)?;
        if let Some(current) = &participant.game_id {
            return Err(LobbyError::AlreadyInGame(current.clone()));
        }
        let lobby = self
            .lobbies
            .get_mut(&game_id)
            .ok_or_else(|| LobbyError::GameNotFound(game_id.clone()))?;
        if lobby.status != LobbyStatus::Waiting || lobby.guest.is_some() {
            return Err(LobbyError::LobbyFull(game_id));
        }

        lobby.activate(pid.to_string());
        let guest_side = lobby.host_side.opposite();
        if let Some(participant) = self.participants.get_mut(pid) {
            participant.game_id = Some(game_id.clone());
            participant.side = Some(guest_side);
        }
        info!("{} joined lobby {} as {}; game started", pid, game_id, guest_side);

        self.broadcast_start(&game_id);
        Ok(())
    }

    fn broadcast_start(&self, game_id: &str) {
        let Some(lobby) = self.lobbies.get(game_id) else {
            return;
        };
        let info = |side: Side| {
            let id = lobby.seat(side).cloned().unwrap_or_default();
            let name = self.participants.get(&id).and_then(|p| p.name.clone());
            PlayerInfo { id, name }
        };
        let (white, black) = (info(Side::White), info(Side::Black));

        for pid in lobby.seated() {
            let Some(color) = lobby.side_of(&pid) else {
                continue;
            };
            self.send(
                &pid,
                ServerMessage::Start(StartPayload {
                    game_id: lobby.id.clone(),
                    fen: lobby.position.fen(),
                    turn: lobby.position.side_to_move(),
                    color,
                    white: white.clone(),
                    black: black.clone(),
                }),
            );
        }
    }

    // ===== Play =====

    pub fn submit_move(&mut self, pid: &str, game_id: &str, mv: &str) -> LobbyResult<()> {
        let game_id = normalize_game_id(game_id);
        if !self.participants.contains_key(pid) {
            return Err(LobbyError::NotIdentified);
        }
        let lobby = self
            .lobbies
            .get_mut(&game_id)
            .ok_or_else(|| LobbyError::GameNotFound(game_id.clone()))?;
        let side = lobby
            .side_of(pid)
            .ok_or_else(|| LobbyError::NotInGame(game_id.clone()))?;
        if lobby.status != LobbyStatus::Active {
            return Err(LobbyError::GameNotActive(game_id));
        }
        if side != lobby.position.side_to_move() {
            return Err(LobbyError::NotYourTurn);
        }

        let applied = lobby.position.apply_move(mv)?;
        // checkmate is read after the move and credited to the side that moved
        let status = lobby.position.terminal_status();
        let turn = lobby.position.side_to_move();

        lobby.moves.push(MoveRecord {
            mover: pid.to_string(),
            side: applied.mover,
            san: applied.san.clone(),
            uci: applied.uci.clone(),
            fen: applied.fen_after.clone(),
            at: Utc::now(),
        });
        debug!("{} played {} in {}", pid, applied.san, game_id);

        let update = ServerMessage::Move(MovePayload {
            game_id: game_id.clone(),
            san: applied.san,
            uci: applied.uci,
            by: applied.mover,
            fen: applied.fen_after,
            turn,
        });
        for seated in lobby.seated() {
            self.send(&seated, update.clone());
        }

        if let Some(result) = GameResult::from_terminal(status, applied.mover) {
            self.finalize(&game_id, result);
        }
        Ok(())
    }

    pub fn resign(&mut self, pid: &str, game_id: &str) -> LobbyResult<()> {
        let game_id = normalize_game_id(game_id);
        let side = self.active_side(pid, &game_id)?;
        info!("{} resigned {}", pid, game_id);
        self.finalize(&game_id, GameResult::forfeit(side, EndReason::Resign));
        Ok(())
    }

    /// Seat check shared by resign: known participant, existing lobby,
    /// seated, in progress
    fn active_side(&self, pid: &str, game_id: &str) -> LobbyResult<Side> {
        if !self.participants.contains_key(pid) {
            return Err(LobbyError::NotIdentified);
        }
        let lobby = self
            .lobbies
            .get(game_id)
            .ok_or_else(|| LobbyError::GameNotFound(game_id.to_string()))?;
        let side = lobby
            .side_of(pid)
            .ok_or_else(|| LobbyError::NotInGame(game_id.to_string()))?;
        if lobby.status != LobbyStatus::Active {
            return Err(LobbyError::GameNotActive(game_id.to_string()));
        }
        Ok(side)
    }

    /// Leave the named lobby, or the current one. An active game is lost;
    /// a waiting lobby is simply closed.
    pub fn leave(&mut self, pid: &str, game_id: Option<&str>) -> LobbyResult<()> {
        let participant = self.participants.get(pid).ok_or(LobbyError::NotIdentified)?;
        let game_id = match game_id {
            Some(id) => normalize_game_id(id),
            None => participant
                .game_id
                .clone()
                .ok_or_else(|| LobbyError::NotInGame(String::new()))?,
        };

        self.vacate(pid, &game_id)?;
        self.send(pid, ServerMessage::Left(LeftPayload { game_id }));
        Ok(())
    }

    fn vacate(&mut self, pid: &str, game_id: &str) -> LobbyResult<()> {
        let lobby = self
            .lobbies
            .get(game_id)
            .ok_or_else(|| LobbyError::GameNotFound(game_id.to_string()))?;
        let side = lobby
            .side_of(pid)
            .ok_or_else(|| LobbyError::NotInGame(game_id.to_string()))?;
        let status = lobby.status;

        match status {
            LobbyStatus::Active => {
                info!("{} left active game {}", pid, game_id);
                self.finalize(game_id, GameResult::forfeit(side, EndReason::Left));
            }
            LobbyStatus::Waiting | LobbyStatus::Completed => {
                info!("{} closed lobby {}", pid, game_id);
                self.remove_lobby(game_id);
            }
        }
        Ok(())
    }

    /// Drop a lobby that never finished, clearing its seats
    fn remove_lobby(&mut self, game_id: &str) {
        let Some(lobby) = self.lobbies.remove(game_id) else {
            return;
        };
        for pid in lobby.seated() {
            self.timers.cancel(&pid);
            if let Some(participant) = self.participants.get_mut(&pid) {
                participant.clear_seat();
            }
        }
    }

    /// End a game: record the result, tell both seats, release them and
    /// drop the lobby. A lobby that is gone or already completed is left
    /// alone.
    fn finalize(&mut self, game_id: &str, result: GameResult) {
        let Some(lobby) = self.lobbies.get_mut(game_id) else {
            debug!("Finalize of unknown lobby {} ignored", game_id);
            return;
        };
        if lobby.status == LobbyStatus::Completed {
            return;
        }
        lobby.status = LobbyStatus::Completed;
        lobby.result = Some(result);
        lobby.ended_at = Some(Utc::now());
        info!(
            "Game {} over: {:?} by {:?}",
            game_id, result.result, result.reason
        );

        let over = ServerMessage::GameOver(GameOverPayload {
            game_id: game_id.to_string(),
            result: result.result,
            reason: result.reason,
        });
        let seated = lobby.seated();
        for pid in &seated {
            self.send(pid, over.clone());
        }

        self.persist(game_id);

        for pid in &seated {
            self.timers.cancel(pid);
            if let Some(participant) = self.participants.get_mut(pid) {
                participant.clear_seat();
            }
        }
        self.lobbies.remove(game_id);
    }

    fn persist(&self, game_id: &str) {
        let Some(lobby) = self.lobbies.get(game_id) else {
            return;
        };
        let (Some(result), Some(ended_at)) = (lobby.result, lobby.ended_at) else {
            return;
        };
        let seat = |side: Side| {
            let pid = lobby.seat(side).cloned().unwrap_or_default();
            let participant = self.participants.get(&pid);
            SeatRecord {
                account_id: participant.and_then(|p| p.account_id.clone()),
                name: participant.and_then(|p| p.name.clone()),
                participant_id: pid,
            }
        };
        let record = CompletedGame {
            id: lobby.id.clone(),
            white: seat(Side::White),
            black: seat(Side::Black),
            moves: lobby.moves.iter().map(|m| m.san.clone()).collect(),
            final_fen: lobby.position.fen(),
            result: result.result,
            reason: result.reason,
            started_at: lobby.started_at,
            ended_at,
        };

        for account in [&record.white.account_id, &record.black.account_id]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.store.save(account, &record) {
                warn!("Failed to store game {} for {}: {}", record.id, account, e);
            }
        }
    }

    // ===== Connection loss =====

    /// The live connection of `pid` went away. Returns the grace ticket
    /// when a lobby seat is now on hold. A connection that was already
    /// superseded by a reattachment is ignored.
    pub fn disconnect(&mut self, pid: &str, connection: ConnectionId) -> Option<GraceTicket> {
        if !self.is_attached(pid, connection) {
            debug!("Ignoring disconnect of stale connection {} for {}", connection, pid);
            return None;
        }
        let participant = self.participants.get_mut(pid)?;
        participant.connection = None;
        participant.ping_sent_at = None;
        participant.disconnected_at = Some(Instant::now());
        info!("Participant {} disconnected", pid);

        let game_id = participant.game_id.clone()?;
        let lobby = self.lobbies.get(&game_id)?;
        if lobby.status == LobbyStatus::Active {
            if let Some(opponent) = lobby.opponent_of(pid) {
                self.send(
                    opponent,
                    ServerMessage::OpponentDisconnect(OpponentDisconnectPayload {
                        game_id: game_id.clone(),
                        grace_ms: u64::try_from(self.disconnect_grace.as_millis())
                            .unwrap_or(u64::MAX),
                    }),
                );
            }
        }
        Some(self.timers.schedule(pid, self.disconnect_grace))
    }

    /// A disconnect timer fired. Stale tickets and participants who came
    /// back in the meantime are ignored.
    pub fn expire_grace(&mut self, ticket: &GraceTicket) {
        if !self.timers.claim(ticket) {
            return;
        }
        let Some(participant) = self.participants.get(&ticket.participant) else {
            return;
        };
        if participant.is_connected() {
            return;
        }
        let Some(game_id) = participant.game_id.clone() else {
            return;
        };

        info!("Grace period of {} expired in {}", ticket.participant, game_id);
        if let Err(e) = self.vacate(&ticket.participant, &game_id) {
            debug!("Nothing to vacate for {}: {}", ticket.participant, e);
        }
    }

    // ===== Sweeps =====

    /// Close connections whose previous ping went unanswered for `pong_grace`
    /// and ping everyone else. Returns how many connections were closed.
    pub fn liveness_sweep(&mut self, now: Instant, pong_grace: Duration) -> usize {
        let mut closed = 0;
        for participant in self.participants.values_mut() {
            let Some(connection) = &participant.connection else {
                continue;
            };
            match participant.ping_sent_at {
                Some(sent) if now.saturating_duration_since(sent) >= pong_grace => {
                    warn!("Participant {} missed a ping, closing connection", participant.id);
                    connection.close();
                    closed += 1;
                }
                Some(_) => {}
                None => {
                    if connection.send(ServerMessage::Ping) {
                        participant.ping_sent_at = Some(now);
                    }
                }
            }
        }
        closed
    }

    /// Forget participants that have been disconnected and seatless for
    /// longer than `retention`. Returns how many were removed.
    pub fn evict_idle(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.participants.len();
        self.participants.retain(|pid, participant| {
            let idle = participant.connection.is_none()
                && participant.game_id.is_none()
                && participant
                    .disconnected_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= retention);
            if idle {
                debug!("Evicting idle participant {}", pid);
            }
            !idle
        });
        let evicted = before - self.participants.len();
        if evicted > 0 {
            info!("Evicted {} idle participants", evicted);
        }
        evicted
    }

    fn send(&self, pid: &str, message: ServerMessage) {
        match self.participants.get(pid).and_then(|p| p.connection.as_ref()) {
            Some(connection) => {
                if !connection.send(message) {
                    debug!("Connection of {} is gone, message dropped", pid);
                }
            }
            None => debug!("Participant {} offline, message dropped", pid),
        }
    }
}

/// Codes are shared by humans, so accept any case and stray whitespace
fn normalize_game_id(game_id: &str) -> GameId {
    game_id.trim().to_ascii_uppercase()
}
