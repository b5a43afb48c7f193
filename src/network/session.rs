//! Session State Machine
//!
//! Drives one game room end to end: loads the ledger, reconciles against
//! the chain oracle, authenticates the peer, keeps both ledgers in
//! agreement as `TURN`/`SYNC` messages arrive, and escalates to the
//! partial-exit path when the peer goes quiet.
//!
//! The session is single-threaded-cooperative: one event loop reacting to
//! exactly one external event at a time (message, command, timer), each
//! reaction run to completion. Timers are deadlines that get reset, never
//! stacked.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::felt::FieldElement;
use crate::core::signature::{IdentityProof, KeyPair};
use crate::game::input::{Action, PlayerIndex};
use crate::game::state::{checkpoint_builder, GameState};
use crate::ledger::checkpoint::{Checkpoint, SignedTurn};
use crate::ledger::store::KvStore;
use crate::ledger::{room_storage_key, Ledger, LedgerError};
use crate::network::chain::{ChainOracle, OracleError, RoomRoster};
use crate::network::protocol::{Envelope, NetMessage, SyncPayload};
use crate::network::transport::{PeerTransport, TransportEvent};

/// Consensus failures tolerated before recommending an on-chain dispute.
pub const MAX_DIVERGENCES: u32 = 3;

/// Session failures that abort the session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unrecoverable; the caller must do a full reset.
    #[error("fatal session failure: {0}")]
    Fatal(String),
    /// A reconstructed checkpoint's hash did not match the peer's.
    #[error("consensus divergence at turn {0}")]
    ConsensusDivergence(u64),
    /// Chain oracle failed while it was required.
    #[error(transparent)]
    Oracle(#[from] OracleError),
    /// Ledger failure outside normal recovery paths.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Session status ladder.
///
/// Monotonic except for regressions to `ConnectingWithPlayers` on peer
/// disconnect and to `Syncing` when a divergence is detected mid-play.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
pub enum SessionStatus {
    /// Unrecoverable failure; awaiting full reset.
    Error = -1,
    /// Loading ledger and reconciling against the chain.
    StartingSetup = 0,
    /// Waiting for the peer to join and authenticate.
    ConnectingWithPlayers = 1,
    /// Reconciling checkpoints and turns with the peer.
    Syncing = 2,
    /// Turns are flowing.
    Playing = 3,
    /// A player reached the winning score.
    Finished = 4,
}

/// The authenticated peer, established once per session by the handshake.
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    /// The peer's account address.
    pub address: FieldElement,
    /// The peer's off-chain public key.
    pub stark_key: FieldElement,
    /// Whether the identity proof verified.
    pub verified: bool,
}

/// Signals surfaced to the controller layer.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The status ladder moved.
    StatusChanged(SessionStatus),
    /// The partial-exit timeout elapsed; the carried checkpoint is the
    /// best settlement candidate. Submission is the chain collaborator's
    /// job.
    PartialExitReady {
        /// Last adopted checkpoint.
        checkpoint: Checkpoint,
    },
    /// Repeated consensus failures; an on-chain dispute is advisable.
    DisputeRecommended {
        /// Turn number of the contested checkpoint.
        turn: u64,
    },
    /// The game reached its terminal state.
    Finished {
        /// The winning player.
        winner: PlayerIndex,
    },
}

/// Imperative entry points from the controller layer.
#[derive(Clone, Copy, Debug)]
pub enum SessionCommand {
    /// Buffer the local input for the next local turn.
    SubmitInput(Action),
    /// Stop the session loop.
    Teardown,
}

/// Session configuration.
#[derive(Clone)]
pub struct SessionConfig {
    /// The game room's contract address.
    pub room_address: FieldElement,
    /// Which roster slot the local player occupies.
    pub local_player: PlayerIndex,
    /// The local off-chain signing keys.
    pub keypair: KeyPair,
    /// Quiet-peer window before the partial-exit signal fires.
    pub partial_exit_timeout: Duration,
    /// Pacing between local turns.
    pub turn_interval: Duration,
    /// Extra pause after a scoring turn, before the next serve.
    pub post_score_pause: Duration,
    /// Grace before sending `SYNC` after a completed handshake.
    pub sync_send_delay: Duration,
    /// Grace between a matching `SYNC_OK` and entering `Playing`.
    pub play_promote_delay: Duration,
    /// Re-announce interval for the identity handshake.
    pub handshake_retry: Duration,
}

impl SessionConfig {
    /// Config with production timing defaults.
    pub fn new(room_address: FieldElement, local_player: PlayerIndex, keypair: KeyPair) -> Self {
        Self {
            room_address,
            local_player,
            keypair,
            partial_exit_timeout: Duration::from_secs(60),
            turn_interval: Duration::from_millis(100),
            post_score_pause: Duration::from_millis(1500),
            sync_send_delay: Duration::from_millis(1000),
            play_promote_delay: Duration::from_millis(500),
            handshake_retry: Duration::from_secs(5),
        }
    }
}

/// Handle exposed to UI/controller code.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    /// Current status.
    pub status: watch::Receiver<SessionStatus>,
    /// Current renderable game state.
    pub state: watch::Receiver<GameState>,
    /// Last adopted checkpoint (signatures included, for display).
    pub checkpoint: watch::Receiver<Option<Checkpoint>>,
    /// Last appended turn (signature included, for display).
    pub last_turn: watch::Receiver<Option<SignedTurn>>,
    /// Outbound session signals.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionHandle {
    /// Buffer the local input for the next local turn.
    pub fn submit_input(&self, action: Action) {
        let _ = self.commands.send(SessionCommand::SubmitInput(action));
    }

    /// Stop the session loop.
    pub fn teardown(&self) {
        let _ = self.commands.send(SessionCommand::Teardown);
    }
}

/// One game room's session context.
///
/// Owns the ledger, the peer identity and the collaborator handles; no
/// global state anywhere.
pub struct Session {
    config: SessionConfig,
    status: SessionStatus,
    ledger: Ledger,
    roster: RoomRoster,
    peer: Option<PeerIdentity>,
    peer_online: bool,
    pending_checkpoint: Option<Checkpoint>,
    pending_action: Action,
    divergences: u32,

    oracle: Box<dyn ChainOracle>,
    transport: Box<dyn PeerTransport>,

    commands: mpsc::UnboundedReceiver<SessionCommand>,
    status_tx: watch::Sender<SessionStatus>,
    state_tx: watch::Sender<GameState>,
    checkpoint_tx: watch::Sender<Option<Checkpoint>>,
    turn_tx: watch::Sender<Option<SignedTurn>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,

    // Timer deadlines. Recomputed in place — reset, never stacked.
    exit_deadline: Option<Instant>,
    sync_send_at: Option<Instant>,
    promote_at: Option<Instant>,
    next_turn_at: Option<Instant>,
    handshake_retry_at: Option<Instant>,
}

impl Session {
    /// Load storage, reconcile against the chain oracle and prepare the
    /// session in `ConnectingWithPlayers`.
    ///
    /// Fails with [`SessionError::Fatal`] when neither storage nor the
    /// chain yields a usable checkpoint.
    pub fn start(
        config: SessionConfig,
        oracle: Box<dyn ChainOracle>,
        transport: Box<dyn PeerTransport>,
        store: Box<dyn KvStore>,
    ) -> Result<(Self, SessionHandle), SessionError> {
        info!("session: starting setup for room {}", config.room_address);

        let roster = oracle.room_roster()?;
        let local = roster.player(config.local_player);
        if local.stark_key != config.keypair.public_key() {
            return Err(SessionError::Fatal(
                "local key does not match the room roster".into(),
            ));
        }

        let storage_key = room_storage_key(&config.room_address, &local.address);
        let (stored, turns) = Ledger::recover(store.as_ref(), &storage_key, &roster.keys())?;
        if let Some(ref cp) = stored {
            info!("session: recovered stored checkpoint at turn {}", cp.turn());
        }

        // The chain always wins when strictly newer.
        let chain = match oracle.authoritative_state() {
            Ok(state) => state.map(Checkpoint::from_chain),
            Err(err) => {
                warn!("session: oracle unavailable during setup: {err}");
                None
            }
        };

        let checkpoint = match (stored, chain) {
            (Some(stored), Some(chain)) if chain.turn() > stored.turn() => {
                info!("session: chain checkpoint at turn {} wins", chain.turn());
                chain
            }
            (Some(stored), _) => stored,
            (None, Some(chain)) => chain,
            (None, None) => {
                return Err(SessionError::Fatal("no checkpoint found".into()));
            }
        };

        let ledger = Ledger::open(checkpoint, turns, store, storage_key)?;
        info!(
            "session: ledger ready, checkpoint turn {}, current turn {}",
            ledger.checkpoint().turn(),
            ledger.current_turn()
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::StartingSetup);
        let (state_tx, state_rx) = watch::channel(*ledger.current_state());
        let (checkpoint_tx, checkpoint_rx) = watch::channel(Some(ledger.checkpoint().clone()));
        let (turn_tx, turn_rx) = watch::channel(ledger.turns().last().copied());

        let partial_exit = config.partial_exit_timeout;
        let mut session = Self {
            config,
            status: SessionStatus::StartingSetup,
            ledger,
            roster,
            peer: None,
            peer_online: false,
            pending_checkpoint: None,
            pending_action: Action::NoMove,
            divergences: 0,
            oracle,
            transport,
            commands: commands_rx,
            status_tx,
            state_tx,
            checkpoint_tx,
            turn_tx,
            event_tx,
            exit_deadline: None,
            sync_send_at: None,
            promote_at: None,
            next_turn_at: None,
            handshake_retry_at: None,
        };

        session.set_status(SessionStatus::ConnectingWithPlayers);
        session.exit_deadline = Some(Instant::now() + partial_exit);

        let handle = SessionHandle {
            commands: commands_tx,
            status: status_rx,
            state: state_rx,
            checkpoint: checkpoint_rx,
            last_turn: turn_rx,
            events: event_rx,
        };

        Ok((session, handle))
    }

    /// Run the session loop until teardown or a fatal failure.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(), SessionError> {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        None | Some(SessionCommand::Teardown) => {
                            info!("session: teardown");
                            return Ok(());
                        }
                        Some(SessionCommand::SubmitInput(action)) => {
                            self.pending_action = action;
                        }
                    }
                }

                event = events.recv() => {
                    match event {
                        None => {
                            info!("session: transport closed");
                            return Ok(());
                        }
                        Some(event) => self.handle_transport_event(event),
                    }
                }

                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.handle_timers(Instant::now());
                }
            }

            if self.status == SessionStatus::Error {
                return Err(SessionError::Fatal("session entered error state".into()));
            }
        }
    }

    // =========================================================================
    // EVENT DISPATCH
    // =========================================================================

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerJoined => {
                debug!("session: peer joined");
                self.peer_online = true;
                if self.status == SessionStatus::ConnectingWithPlayers {
                    self.send_identity();
                    self.handshake_retry_at = Some(Instant::now() + self.config.handshake_retry);
                }
            }
            TransportEvent::PeerLeft => {
                info!("session: peer left");
                self.peer_online = false;
                self.peer = None;
                self.sync_send_at = None;
                self.promote_at = None;
                self.next_turn_at = None;
                self.handshake_retry_at = None;
                if self.status > SessionStatus::ConnectingWithPlayers
                    && self.status < SessionStatus::Finished
                {
                    self.set_status(SessionStatus::ConnectingWithPlayers);
                }
                self.exit_deadline = Some(Instant::now() + self.config.partial_exit_timeout);
            }
            TransportEvent::Message(bytes) => match Envelope::from_bytes(&bytes) {
                Ok(message) => self.handle_message(message),
                Err(err) => warn!("session: dropping message: {err}"),
            },
        }
    }

    fn handle_message(&mut self, message: NetMessage) {
        match message {
            NetMessage::Id(proof) => self.handle_id(proof),
            NetMessage::Sync(payload) => self.handle_sync(payload),
            NetMessage::Turn(turn) => self.handle_turn(turn),
            NetMessage::SyncRequest => self.handle_sync_request(),
            NetMessage::SyncOk { turn } => self.handle_sync_ok(turn),
        }
    }

    fn handle_timers(&mut self, now: Instant) {
        if take_expired(&mut self.exit_deadline, now) {
            info!("session: partial-exit timeout elapsed");
            self.emit(SessionEvent::PartialExitReady {
                checkpoint: self.ledger.checkpoint().clone(),
            });
        }

        if take_expired(&mut self.handshake_retry_at, now) {
            if self.status == SessionStatus::ConnectingWithPlayers && self.peer_online {
                self.send_identity();
                self.handshake_retry_at = Some(now + self.config.handshake_retry);
            }
        }

        if take_expired(&mut self.sync_send_at, now) {
            self.send_full_sync();
        }

        if take_expired(&mut self.promote_at, now) {
            if self.status == SessionStatus::Syncing {
                self.set_status(SessionStatus::Playing);
                if self.is_local_turn() {
                    self.next_turn_at = Some(now + self.config.turn_interval);
                }
            }
        }

        if take_expired(&mut self.next_turn_at, now) {
            if self.status == SessionStatus::Playing && self.is_local_turn() {
                self.play_turn();
            }
        }
    }

    // =========================================================================
    // HANDSHAKE
    // =========================================================================

    fn send_identity(&mut self) {
        let address = self.roster.player(self.config.local_player).address;
        match IdentityProof::build(address, now_ms(), &self.config.keypair) {
            Ok(proof) => self.send_message(NetMessage::Id(proof)),
            Err(err) => warn!("session: failed to build identity proof: {err}"),
        }
    }

    fn handle_id(&mut self, proof: IdentityProof) {
        if self.status != SessionStatus::ConnectingWithPlayers || self.peer.is_some() {
            debug!("session: ignoring ID message in status {:?}", self.status);
            return;
        }

        let opponent = self.roster.player(self.config.local_player.opponent());
        if let Err(err) = proof.verify(&opponent.address, &opponent.stark_key, now_ms()) {
            warn!("session: rejecting peer identity: {err}");
            return;
        }

        info!("session: peer {} authenticated", proof.address);
        self.peer = Some(PeerIdentity {
            address: proof.address,
            stark_key: proof.stark_key,
            verified: true,
        });
        self.peer_online = true;

        // The exit countdown only runs while the peer is absent.
        self.exit_deadline = None;
        self.handshake_retry_at = None;

        self.set_status(SessionStatus::Syncing);

        // Re-announce in case our first ID predated the peer's arrival,
        // then share our state after a short grace.
        self.send_identity();
        self.sync_send_at = Some(Instant::now() + self.config.sync_send_delay);
    }

    // =========================================================================
    // SYNC RECONCILIATION
    // =========================================================================

    fn handle_sync(&mut self, payload: SyncPayload) {
        if self.status < SessionStatus::Syncing || self.peer.is_none() {
            debug!("session: ignoring SYNC in status {:?}", self.status);
            return;
        }

        let received = payload.checkpoint;
        if !received.verify_hash() {
            warn!("session: SYNC checkpoint hash mismatch, dropping");
            return;
        }

        let roster_keys = self.roster.keys();
        let valid_slots = match received.valid_signature_slots(&roster_keys) {
            Ok(slots) => slots,
            Err(err) => {
                warn!("session: SYNC checkpoint signature invalid: {err}");
                return;
            }
        };

        // A checkpoint not signed by its sender is rejected outright.
        let sender_slot = self.config.local_player.opponent().slot();
        if !received.on_chain && !valid_slots.contains(&sender_slot) {
            warn!("session: SYNC checkpoint not signed by sender, dropping");
            return;
        }

        let local_turn = self.ledger.checkpoint().turn();
        let current_turn = self.ledger.current_turn();
        let received_turn = received.turn();
        let fully_signed = valid_slots.len() == 2;

        debug!(
            "session: SYNC received turn {} (local checkpoint {}, head {})",
            received_turn, local_turn, current_turn
        );

        if received.on_chain {
            // Case I: the chain is the authority; re-fetch rather than
            // trust the peer's copy.
            if received_turn >= local_turn {
                self.refresh_from_oracle();
                if self.ledger.checkpoint().turn() < received_turn {
                    self.send_message(NetMessage::SyncRequest);
                }
            }
        } else if fully_signed {
            if received_turn > local_turn {
                // Case II: already mutually agreed; adopt unconditionally.
                self.adopt(received);
            } else if received_turn == local_turn
                && received.hash == self.ledger.checkpoint().hash
            {
                // Same snapshot; refresh signatures (ours may be unsigned
                // if it came from the chain).
                self.adopt(received);
            } else if received_turn == local_turn {
                self.consensus_failure(received_turn);
            }
            // Older fully-signed checkpoints are stale; nothing to do.
        } else if received_turn <= local_turn {
            // Case III: the peer is behind; answer with our state.
            self.send_full_sync();
        } else if received_turn <= current_turn {
            // Case IV: rebuild the same target locally and compare.
            match self.ledger.build_checkpoint_at(
                received_turn,
                &self.config.keypair,
                self.config.local_player,
            ) {
                Ok(mut rebuilt) if rebuilt.hash == received.hash => {
                    rebuilt.merge_signatures(&received);
                    info!("session: co-signed checkpoint at turn {}", received_turn);
                    self.adopt(rebuilt);
                    self.send_full_sync();
                }
                Ok(_) => self.consensus_failure(received_turn),
                Err(err) => {
                    warn!("session: failed to rebuild checkpoint: {err}");
                    self.send_message(NetMessage::SyncRequest);
                }
            }
        } else {
            // Case V: we are missing turns and cannot verify.
            self.send_message(NetMessage::SyncRequest);
        }

        self.intake_turns(payload.turns);

        self.send_message(NetMessage::SyncOk {
            turn: self.ledger.current_turn(),
        });
        self.publish_state();
    }

    fn handle_sync_request(&mut self) {
        if self.status < SessionStatus::Syncing || self.peer.is_none() {
            return;
        }
        debug!("session: peer requested full state");
        self.send_full_sync();
    }

    fn handle_sync_ok(&mut self, peer_turn: u64) {
        if self.status != SessionStatus::Syncing {
            return;
        }

        let current = self.ledger.current_turn();
        if peer_turn == current {
            // Acknowledge exactly once so the peer promotes too; a second
            // matching SYNC_OK just keeps the pending promotion.
            if self.promote_at.is_none() {
                debug!("session: sync agreed at turn {}", current);
                self.promote_at = Some(Instant::now() + self.config.play_promote_delay);
                self.send_message(NetMessage::SyncOk { turn: current });
            }
        } else if peer_turn < current {
            // Peer is behind; share our state so they catch up.
            self.send_full_sync();
        } else {
            self.send_message(NetMessage::SyncRequest);
        }
    }

    fn refresh_from_oracle(&mut self) {
        match self.oracle.authoritative_state() {
            Ok(Some(state)) => {
                let checkpoint = Checkpoint::from_chain(state);
                info!(
                    "session: oracle returned state at turn {}",
                    checkpoint.turn()
                );
                self.adopt(checkpoint);
            }
            Ok(None) => debug!("session: oracle has no state yet"),
            Err(err) => warn!("session: oracle unavailable: {err}"),
        }
    }

    fn adopt(&mut self, checkpoint: Checkpoint) {
        let turn = checkpoint.turn();
        match self.ledger.adopt_checkpoint(checkpoint) {
            Ok(true) => {
                self.divergences = 0;
                if self
                    .pending_checkpoint
                    .as_ref()
                    .map(|p| p.turn() <= turn)
                    .unwrap_or(false)
                {
                    self.pending_checkpoint = None;
                }
                let _ = self.checkpoint_tx.send(Some(self.ledger.checkpoint().clone()));
                self.publish_state();
            }
            Ok(false) => debug!("session: stale checkpoint at turn {} ignored", turn),
            Err(err) => warn!("session: failed to adopt checkpoint: {err}"),
        }
    }

    fn consensus_failure(&mut self, turn: u64) {
        self.divergences += 1;
        let err = SessionError::ConsensusDivergence(turn);
        warn!(
            "session: {err} ({}/{})",
            self.divergences, MAX_DIVERGENCES
        );

        if self.divergences >= MAX_DIVERGENCES {
            self.emit(SessionEvent::DisputeRecommended { turn });
        }

        if self.status == SessionStatus::Playing {
            self.set_status(SessionStatus::Syncing);
            self.next_turn_at = None;
        }
        self.send_message(NetMessage::SyncRequest);
    }

    // =========================================================================
    // TURN FLOW
    // =========================================================================

    fn is_local_turn(&self) -> bool {
        self.ledger.current_state().acting_player() == self.config.local_player
    }

    fn play_turn(&mut self) {
        let state = *self.ledger.current_state();
        if let Some(winner) = state.winner() {
            self.finish(winner, true);
            return;
        }

        let turn_number = state.turn;
        let action = self.pending_action;
        let signed = match SignedTurn::create(turn_number, action, &self.config.keypair) {
            Ok(signed) => signed,
            Err(err) => {
                warn!("session: failed to sign turn {}: {err}", turn_number);
                return;
            }
        };

        let score_before = state.score_0 + state.score_1;
        match self.ledger.append_turn(signed) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!("session: local turn {} rejected: {err}", turn_number);
                return;
            }
        }

        self.send_message(NetMessage::Turn(signed));
        self.publish_state();

        let next = *self.ledger.current_state();
        let scored = next.score_0 + next.score_1 > score_before;
        if scored {
            info!(
                "session: score {} - {} at turn {}",
                next.score_0, next.score_1, next.turn
            );
        }

        if let Some(winner) = next.winner() {
            self.finish(winner, true);
            return;
        }

        self.maybe_build_checkpoint(next.turn);

        // The opponent acts next; our timer re-arms when their turn lands.
        self.next_turn_at = None;
    }

    fn handle_turn(&mut self, turn: SignedTurn) {
        if self.status < SessionStatus::Syncing || self.peer.is_none() {
            debug!("session: ignoring TURN in status {:?}", self.status);
            return;
        }

        if let Err(err) = turn.verify(&self.roster.keys()) {
            warn!("session: rejecting turn {}: {err}", turn.turn);
            return;
        }

        let before = *self.ledger.current_state();
        match self.ledger.append_turn(turn) {
            Ok(true) => {}
            Ok(false) => return,
            Err(LedgerError::NonSequentialTurn { got, expected }) => {
                warn!(
                    "session: turn gap (got {}, expected {}), requesting sync",
                    got, expected
                );
                if self.status == SessionStatus::Playing {
                    self.set_status(SessionStatus::Syncing);
                    self.next_turn_at = None;
                }
                self.send_message(NetMessage::SyncRequest);
                return;
            }
            Err(err) => {
                warn!("session: turn {} rejected: {err}", turn.turn);
                return;
            }
        }

        self.publish_state();

        let next = *self.ledger.current_state();
        if let Some(winner) = next.winner() {
            self.finish(winner, false);
            return;
        }

        self.maybe_build_checkpoint(next.turn);

        if self.status == SessionStatus::Playing && self.is_local_turn() {
            let scored = next.score_0 + next.score_1 > before.score_0 + before.score_1;
            let delay = if scored {
                self.config.turn_interval + self.config.post_score_pause
            } else {
                self.config.turn_interval
            };
            self.next_turn_at = Some(Instant::now() + delay);
        }
    }

    // =========================================================================
    // CHECKPOINT POLICY
    // =========================================================================

    /// Build and broadcast a partial checkpoint when this turn is our
    /// trigger point in the alternating checkpoint cycle.
    fn maybe_build_checkpoint(&mut self, turn: u64) {
        if self.status < SessionStatus::Syncing {
            return;
        }
        if checkpoint_builder(turn) != Some(self.config.local_player) {
            return;
        }
        if self.ledger.checkpoint().turn() >= turn {
            return;
        }

        match self
            .ledger
            .build_checkpoint_at(turn, &self.config.keypair, self.config.local_player)
        {
            Ok(checkpoint) => {
                info!("session: built partial checkpoint at turn {}", turn);
                self.send_message(NetMessage::Sync(SyncPayload {
                    checkpoint: checkpoint.clone(),
                    turns: self.ledger.turns().to_vec(),
                }));
                self.pending_checkpoint = Some(checkpoint);
            }
            Err(err) => warn!("session: checkpoint build failed at turn {}: {err}", turn),
        }
    }

    fn finish(&mut self, winner: PlayerIndex, local_acted: bool) {
        if self.status == SessionStatus::Finished {
            return;
        }
        info!("session: game finished, winner player {}", winner.slot());
        self.set_status(SessionStatus::Finished);
        self.next_turn_at = None;
        self.emit(SessionEvent::Finished { winner });

        // The side that applied the terminal turn offers the settlement
        // checkpoint; the peer co-signs it through the normal SYNC path.
        if local_acted {
            let terminal = self.ledger.current_turn();
            match self.ledger.build_checkpoint_at(
                terminal,
                &self.config.keypair,
                self.config.local_player,
            ) {
                Ok(checkpoint) => {
                    self.send_message(NetMessage::Sync(SyncPayload {
                        checkpoint: checkpoint.clone(),
                        turns: self.ledger.turns().to_vec(),
                    }));
                    self.pending_checkpoint = Some(checkpoint);
                }
                Err(err) => warn!("session: final checkpoint build failed: {err}"),
            }
        }
    }

    // =========================================================================
    // PLUMBING
    // =========================================================================

    fn intake_turns(&mut self, mut turns: Vec<SignedTurn>) {
        turns.sort_by_key(|t| t.turn);
        let roster_keys = self.roster.keys();

        for turn in turns {
            if let Err(err) = turn.verify(&roster_keys) {
                warn!("session: dropping attached turn {}: {err}", turn.turn);
                continue;
            }
            match self.ledger.append_turn(turn) {
                Ok(_) => {}
                Err(LedgerError::NonSequentialTurn { got, expected }) => {
                    debug!(
                        "session: attached turns gap (got {}, expected {})",
                        got, expected
                    );
                    break;
                }
                Err(err) => {
                    warn!("session: attached turn {} rejected: {err}", turn.turn);
                    break;
                }
            }
        }
    }

    fn send_full_sync(&mut self) {
        self.send_message(NetMessage::Sync(SyncPayload {
            checkpoint: self.ledger.checkpoint().clone(),
            turns: self.ledger.turns().to_vec(),
        }));
    }

    fn send_message(&self, message: NetMessage) {
        let envelope = Envelope::new(message);
        match envelope.to_bytes() {
            Ok(bytes) => {
                if let Err(err) = self.transport.send(bytes) {
                    warn!("session: transport send failed: {err}");
                }
            }
            Err(err) => warn!("session: failed to encode message: {err}"),
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        info!("session: status {:?} -> {:?}", self.status, status);
        self.status = status;
        let _ = self.status_tx.send(status);
        self.emit(SessionEvent::StatusChanged(status));
    }

    fn publish_state(&self) {
        let _ = self.state_tx.send(*self.ledger.current_state());
        let _ = self.turn_tx.send(self.ledger.turns().last().copied());
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.exit_deadline,
            self.sync_send_at,
            self.promote_at,
            self.next_turn_at,
            self.handshake_retry_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// Current wall-clock time in Unix milliseconds.
fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Sleep until the deadline, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Clear and report a deadline that has passed.
fn take_expired(deadline: &mut Option<Instant>, now: Instant) -> bool {
    if deadline.map(|d| d <= now).unwrap_or(false) {
        *deadline = None;
        true
    } else {
        false
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::game::state::GameState;
    use crate::game::tick::transition;
    use crate::ledger::store::MemoryStore;
    use crate::network::chain::{MockOracle, RoomPlayer};
    use crate::network::transport::TransportError;

    /// Transport stub recording every outbound message.
    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RecordingTransport {
        fn messages(&self) -> Vec<NetMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|bytes| Envelope::from_bytes(bytes).unwrap())
                .collect()
        }
    }

    impl PeerTransport for RecordingTransport {
        fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(bytes);
            Ok(())
        }
    }

    struct Fixture {
        session: Session,
        transport: RecordingTransport,
        oracle: MockOracle,
        k0: KeyPair,
        k1: KeyPair,
    }

    fn fixture(local: PlayerIndex) -> Fixture {
        let k0 = KeyPair::from_private(FieldElement::from(1111u64));
        let k1 = KeyPair::from_private(FieldElement::from(2222u64));
        let roster = RoomRoster {
            players: [
                RoomPlayer {
                    address: FieldElement::from(0xa0u64),
                    stark_key: k0.public_key(),
                },
                RoomPlayer {
                    address: FieldElement::from(0xa1u64),
                    stark_key: k1.public_key(),
                },
            ],
        };

        let oracle = MockOracle::new(roster);
        oracle.set_state(Some(GameState::initial()));

        let keypair = match local {
            PlayerIndex::Zero => k0.clone(),
            PlayerIndex::One => k1.clone(),
        };
        let config = SessionConfig::new(FieldElement::from(0xbeefu64), local, keypair);

        let transport = RecordingTransport::default();
        let (session, _handle) = Session::start(
            config,
            Box::new(oracle.clone()),
            Box::new(transport.clone()),
            Box::new(MemoryStore::new()),
        )
        .unwrap();

        Fixture {
            session,
            transport,
            oracle,
            k0,
            k1,
        }
    }

    /// Drive the handshake so the session trusts the opponent.
    fn authenticate_peer(fix: &mut Fixture) {
        let (opponent_key, opponent_address) = match fix.session.config.local_player {
            PlayerIndex::Zero => (fix.k1.clone(), FieldElement::from(0xa1u64)),
            PlayerIndex::One => (fix.k0.clone(), FieldElement::from(0xa0u64)),
        };
        let proof = IdentityProof::build(opponent_address, now_ms(), &opponent_key).unwrap();
        fix.session.handle_id(proof);
        assert_eq!(fix.session.status, SessionStatus::Syncing);
    }

    /// Signed NoMove turns from `start` (inclusive) for `count` turns.
    fn signed_turns(start: u64, count: u64, k0: &KeyPair, k1: &KeyPair) -> Vec<SignedTurn> {
        (start..start + count)
            .map(|t| {
                let keypair = if t % 2 == 0 { k0 } else { k1 };
                SignedTurn::create(t, Action::NoMove, keypair).unwrap()
            })
            .collect()
    }

    /// State after folding `n` NoMove turns from the initial state.
    fn state_after(n: u64) -> GameState {
        let mut state = GameState::initial();
        for _ in 0..n {
            state = transition(&state, Action::NoMove).unwrap();
        }
        state
    }

    #[tokio::test]
    async fn test_startup_enters_connecting() {
        let fix = fixture(PlayerIndex::Zero);
        assert_eq!(fix.session.status, SessionStatus::ConnectingWithPlayers);
        assert!(fix.session.exit_deadline.is_some());
    }

    #[tokio::test]
    async fn test_startup_without_any_state_is_fatal() {
        let k0 = KeyPair::from_private(FieldElement::from(1111u64));
        let k1 = KeyPair::from_private(FieldElement::from(2222u64));
        let roster = RoomRoster {
            players: [
                RoomPlayer {
                    address: FieldElement::from(0xa0u64),
                    stark_key: k0.public_key(),
                },
                RoomPlayer {
                    address: FieldElement::from(0xa1u64),
                    stark_key: k1.public_key(),
                },
            ],
        };
        let oracle = MockOracle::new(roster);
        // No stored data, no chain state.
        let config =
            SessionConfig::new(FieldElement::from(0xbeefu64), PlayerIndex::Zero, k0);

        let result = Session::start(
            config,
            Box::new(oracle),
            Box::new(RecordingTransport::default()),
            Box::new(MemoryStore::new()),
        );
        assert!(matches!(result, Err(SessionError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_handshake_accepts_valid_identity() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        let peer = fix.session.peer.as_ref().unwrap();
        assert!(peer.verified);
        assert_eq!(peer.stark_key, fix.k1.public_key());
        // Exit countdown cancelled, sync send scheduled.
        assert!(fix.session.exit_deadline.is_none());
        assert!(fix.session.sync_send_at.is_some());
    }

    #[tokio::test]
    async fn test_handshake_rejects_stale_timestamp() {
        let mut fix = fixture(PlayerIndex::Zero);

        let proof = IdentityProof::build(
            FieldElement::from(0xa1u64),
            now_ms() - 15_000,
            &fix.k1,
        )
        .unwrap();
        fix.session.handle_id(proof);

        assert_eq!(fix.session.status, SessionStatus::ConnectingWithPlayers);
        assert!(fix.session.peer.is_none());
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_address() {
        let mut fix = fixture(PlayerIndex::Zero);

        let proof =
            IdentityProof::build(FieldElement::from(0xdeadu64), now_ms(), &fix.k1).unwrap();
        fix.session.handle_id(proof);

        assert!(fix.session.peer.is_none());
    }

    #[tokio::test]
    async fn test_sync_case_two_adopts_fully_signed() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        // Peer offers a dual-signed checkpoint five turns ahead.
        let mut checkpoint =
            Checkpoint::signed_local(state_after(5), &fix.k1, PlayerIndex::One).unwrap();
        checkpoint.co_sign(&fix.k0, PlayerIndex::Zero).unwrap();

        fix.session.handle_sync(SyncPayload {
            checkpoint,
            turns: Vec::new(),
        });

        assert_eq!(fix.session.ledger.checkpoint().turn(), 5);
        assert_eq!(fix.session.ledger.current_turn(), 5);
    }

    #[tokio::test]
    async fn test_sync_case_three_replies_with_local_state() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        // Advance the local ledger past the peer.
        for turn in signed_turns(0, 4, &fix.k0, &fix.k1) {
            fix.session.ledger.append_turn(turn).unwrap();
        }
        // Adopt a local checkpoint at turn 2 so L = 2.
        let local_cp = fix
            .session
            .ledger
            .build_checkpoint_at(2, &fix.k0, PlayerIndex::Zero)
            .unwrap();
        fix.session.ledger.adopt_checkpoint(local_cp).unwrap();

        // Peer sends a partial checkpoint at turn 1 (behind us).
        let stale =
            Checkpoint::signed_local(state_after(1), &fix.k1, PlayerIndex::One).unwrap();
        fix.session.handle_sync(SyncPayload {
            checkpoint: stale,
            turns: Vec::new(),
        });

        let messages = fix.transport.messages();
        assert!(messages
            .iter()
            .any(|m| matches!(m, NetMessage::Sync(p) if p.checkpoint.turn() == 2)));
        // Checkpoint unchanged.
        assert_eq!(fix.session.ledger.checkpoint().turn(), 2);
    }

    #[tokio::test]
    async fn test_sync_case_four_cosigns_matching_rebuild() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        for turn in signed_turns(0, 4, &fix.k0, &fix.k1) {
            fix.session.ledger.append_turn(turn).unwrap();
        }

        // Peer built the checkpoint at turn 3 from the same history.
        let partial =
            Checkpoint::signed_local(state_after(3), &fix.k1, PlayerIndex::One).unwrap();
        fix.session.handle_sync(SyncPayload {
            checkpoint: partial,
            turns: Vec::new(),
        });

        let adopted = fix.session.ledger.checkpoint();
        assert_eq!(adopted.turn(), 3);
        assert!(adopted.is_fully_signed(&fix.session.roster.keys()));

        // The completed checkpoint went back out to the peer.
        let messages = fix.transport.messages();
        assert!(messages
            .iter()
            .any(|m| matches!(m, NetMessage::Sync(p) if p.checkpoint.turn() == 3)));
    }

    #[tokio::test]
    async fn test_sync_case_four_divergence_requests_full_state() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        for turn in signed_turns(0, 4, &fix.k0, &fix.k1) {
            fix.session.ledger.append_turn(turn).unwrap();
        }

        // Peer's checkpoint at turn 3 snapshots a different history.
        let mut divergent_state = state_after(3);
        divergent_state.score_1 = 1;
        let divergent = Checkpoint {
            hash: divergent_state.hash(),
            data: divergent_state,
            on_chain: false,
            signatures: [
                None,
                Some(fix.k1.sign(&divergent_state.hash()).unwrap()),
            ],
        };

        fix.session.handle_sync(SyncPayload {
            checkpoint: divergent,
            turns: Vec::new(),
        });

        // Not adopted; full-state request sent; divergence counted.
        assert_eq!(fix.session.ledger.checkpoint().turn(), 0);
        assert_eq!(fix.session.divergences, 1);
        assert!(fix
            .transport
            .messages()
            .iter()
            .any(|m| matches!(m, NetMessage::SyncRequest)));
    }

    #[tokio::test]
    async fn test_repeated_divergence_recommends_dispute() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        for _ in 0..MAX_DIVERGENCES {
            fix.session.consensus_failure(9);
        }
        assert_eq!(fix.session.divergences, MAX_DIVERGENCES);
    }

    #[tokio::test]
    async fn test_sync_case_five_requests_missing_turns() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        // Peer's partial checkpoint is ahead of everything we have.
        let ahead =
            Checkpoint::signed_local(state_after(8), &fix.k1, PlayerIndex::One).unwrap();
        fix.session.handle_sync(SyncPayload {
            checkpoint: ahead,
            turns: Vec::new(),
        });

        assert_eq!(fix.session.ledger.checkpoint().turn(), 0);
        assert!(fix
            .transport
            .messages()
            .iter()
            .any(|m| matches!(m, NetMessage::SyncRequest)));
    }

    #[tokio::test]
    async fn test_sync_rejects_checkpoint_unsigned_by_sender() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        // Signed only by us (slot 0); the sender (slot 1) never signed it.
        let unsigned_by_sender =
            Checkpoint::signed_local(state_after(5), &fix.k0, PlayerIndex::Zero).unwrap();
        fix.session.handle_sync(SyncPayload {
            checkpoint: unsigned_by_sender,
            turns: Vec::new(),
        });

        assert_eq!(fix.session.ledger.checkpoint().turn(), 0);
    }

    #[tokio::test]
    async fn test_sync_attached_turns_are_applied() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        let checkpoint = {
            let mut cp =
                Checkpoint::signed_local(GameState::initial(), &fix.k1, PlayerIndex::One)
                    .unwrap();
            cp.co_sign(&fix.k0, PlayerIndex::Zero).unwrap();
            cp
        };
        let turns = signed_turns(0, 3, &fix.k0, &fix.k1);

        fix.session.handle_sync(SyncPayload { checkpoint, turns });

        assert_eq!(fix.session.ledger.current_turn(), 3);
        // The SYNC_OK reply carries the new head turn.
        assert!(fix
            .transport
            .messages()
            .iter()
            .any(|m| matches!(m, NetMessage::SyncOk { turn: 3 })));
    }

    #[tokio::test]
    async fn test_turn_intake_and_reply_scheduling() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);
        fix.session.set_status(SessionStatus::Playing);

        // Local player 0 acts at turn 0.
        fix.session.play_turn();
        assert_eq!(fix.session.ledger.current_turn(), 1);

        // Opponent's turn 1 arrives; our turn 2 gets scheduled.
        let theirs = SignedTurn::create(1, Action::MoveDown, &fix.k1).unwrap();
        fix.session.handle_turn(theirs);

        assert_eq!(fix.session.ledger.current_turn(), 2);
        assert!(fix.session.next_turn_at.is_some());
    }

    #[tokio::test]
    async fn test_turn_with_bad_signature_dropped() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);
        fix.session.set_status(SessionStatus::Playing);

        // Turn 0 signed by player 1: wrong parity signer.
        let forged = SignedTurn::create(0, Action::MoveUp, &fix.k1).unwrap();
        fix.session.handle_turn(forged);

        assert_eq!(fix.session.ledger.current_turn(), 0);
    }

    #[tokio::test]
    async fn test_turn_gap_triggers_sync_request() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);
        fix.session.set_status(SessionStatus::Playing);

        let gap = SignedTurn::create(5, Action::NoMove, &fix.k1).unwrap();
        fix.session.handle_turn(gap);

        assert_eq!(fix.session.status, SessionStatus::Syncing);
        assert!(fix
            .transport
            .messages()
            .iter()
            .any(|m| matches!(m, NetMessage::SyncRequest)));
    }

    #[tokio::test]
    async fn test_sync_ok_match_promotes_after_grace() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        fix.session.handle_sync_ok(0);
        assert!(fix.session.promote_at.is_some());

        // Grace elapsed: promoted to Playing, local player 0 to act.
        let later = Instant::now() + Duration::from_secs(60);
        fix.session.handle_timers(later);
        assert_eq!(fix.session.status, SessionStatus::Playing);
        assert!(fix.session.next_turn_at.is_some());
    }

    #[tokio::test]
    async fn test_sync_ok_mismatch_shares_state() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        for turn in signed_turns(0, 2, &fix.k0, &fix.k1) {
            fix.session.ledger.append_turn(turn).unwrap();
        }

        fix.session.handle_sync_ok(0);
        assert!(fix.session.promote_at.is_none());
        assert!(fix
            .transport
            .messages()
            .iter()
            .any(|m| matches!(m, NetMessage::Sync(_))));
    }

    #[tokio::test]
    async fn test_partial_exit_signal_fires_once() {
        let mut fix = fixture(PlayerIndex::Zero);
        assert!(fix.session.exit_deadline.is_some());

        let later = Instant::now() + Duration::from_secs(120);
        fix.session.handle_timers(later);
        assert!(fix.session.exit_deadline.is_none());
    }

    #[tokio::test]
    async fn test_peer_leave_regresses_and_restarts_timer() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);
        fix.session.set_status(SessionStatus::Playing);

        fix.session.handle_transport_event(TransportEvent::PeerLeft);

        assert_eq!(fix.session.status, SessionStatus::ConnectingWithPlayers);
        assert!(fix.session.peer.is_none());
        assert!(fix.session.exit_deadline.is_some());
        assert!(fix.session.next_turn_at.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_policy_triggers_for_responsible_player() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);
        fix.session.set_status(SessionStatus::Playing);

        // Feed turns up to the first trigger point.
        for turn in signed_turns(0, crate::game::state::CHECKPOINT_OVERSHOOT, &fix.k0, &fix.k1)
        {
            fix.session.ledger.append_turn(turn).unwrap();
        }

        fix.session
            .maybe_build_checkpoint(crate::game::state::CHECKPOINT_OVERSHOOT);

        let pending = fix.session.pending_checkpoint.as_ref().unwrap();
        assert_eq!(pending.turn(), crate::game::state::CHECKPOINT_OVERSHOOT);
        assert!(pending.has_signature(0));
        assert!(!pending.has_signature(1));
    }

    #[tokio::test]
    async fn test_oracle_case_one_refetches_authoritative_state() {
        let mut fix = fixture(PlayerIndex::Zero);
        authenticate_peer(&mut fix);

        // The chain has moved ahead of us.
        fix.oracle.set_state(Some(state_after(6)));

        let claimed = Checkpoint::from_chain(state_after(6));
        fix.session.handle_sync(SyncPayload {
            checkpoint: claimed,
            turns: Vec::new(),
        });

        // We trusted the oracle, not the peer's copy.
        assert_eq!(fix.session.ledger.checkpoint().turn(), 6);
        assert!(fix.session.ledger.checkpoint().on_chain);
    }
}
