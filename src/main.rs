//! Pong Channel Node
//!
//! Demo binary: wires two sessions over the in-memory transport with a
//! mock chain oracle and plays a full match to the winning score,
//! checkpointing along the way.

use std::time::Duration;

use anyhow::Context;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pong_channel::game::state::WINNING_SCORE;
use pong_channel::ledger::MemoryStore;
use pong_channel::network::chain::{MockOracle, RoomPlayer, RoomRoster};
use pong_channel::network::session::SessionEvent;
use pong_channel::network::transport::{memory_pair, TransportEvent};
use pong_channel::{
    Action, FieldElement, GameState, KeyPair, PlayerIndex, Session, SessionConfig, SessionHandle,
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("Pong Channel Node v{}", VERSION);
    info!("Winning score: {}", WINNING_SCORE);

    demo_match().await
}

/// Play a full off-chain match between two in-process sessions.
async fn demo_match() -> anyhow::Result<()> {
    info!("=== Starting Demo Match ===");

    let key_0 = KeyPair::from_private(FieldElement::from(0x1234_5678u64));
    let key_1 = KeyPair::from_private(FieldElement::from(0x8765_4321u64));

    let roster = RoomRoster {
        players: [
            RoomPlayer {
                address: FieldElement::from_hex("0xa11ce")?,
                stark_key: key_0.public_key(),
            },
            RoomPlayer {
                address: FieldElement::from_hex("0xb0b")?,
                stark_key: key_1.public_key(),
            },
        ],
    };

    let room_address = FieldElement::from_hex("0x900d900d")?;
    let oracle = MockOracle::new(roster);
    oracle.set_state(Some(GameState::initial()));

    let (peer_0, peer_1) = memory_pair();

    let (session_0, handle_0) = Session::start(
        demo_config(room_address, PlayerIndex::Zero, key_0),
        Box::new(oracle.clone()),
        Box::new(peer_0.transport),
        Box::new(MemoryStore::new()),
    )?;
    let (session_1, handle_1) = Session::start(
        demo_config(room_address, PlayerIndex::One, key_1),
        Box::new(oracle.clone()),
        Box::new(peer_1.transport),
        Box::new(MemoryStore::new()),
    )?;

    // Both peers "join" the room.
    peer_0.injector.send(TransportEvent::PeerJoined)?;
    peer_1.injector.send(TransportEvent::PeerJoined)?;

    let run_0 = tokio::spawn(session_0.run(peer_0.events));
    let run_1 = tokio::spawn(session_1.run(peer_1.events));

    let winner = drive_match(handle_0, handle_1).await?;

    match winner {
        Some(winner) => info!("Match finished, winner: player {}", winner.slot()),
        None => info!("Match did not finish within the demo window"),
    }

    let _ = run_0.await?;
    let _ = run_1.await?;

    info!("=== Demo Complete ===");
    Ok(())
}

/// Session config with demo-friendly (fast) timings.
fn demo_config(
    room_address: FieldElement,
    player: PlayerIndex,
    keypair: KeyPair,
) -> SessionConfig {
    let mut config = SessionConfig::new(room_address, player, keypair);
    config.turn_interval = Duration::from_millis(2);
    config.post_score_pause = Duration::from_millis(20);
    config.sync_send_delay = Duration::from_millis(30);
    config.play_promote_delay = Duration::from_millis(10);
    config
}

/// Poll both sessions until the game finishes, feeding light paddle
/// jitter so the input path is exercised.
async fn drive_match(
    mut handle_0: SessionHandle,
    mut handle_1: SessionHandle,
) -> anyhow::Result<Option<PlayerIndex>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let mut winner = None;

    while winner.is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;

        for handle in [&mut handle_0, &mut handle_1] {
            while let Ok(event) = handle.events.try_recv() {
                match event {
                    SessionEvent::StatusChanged(status) => {
                        info!("status -> {:?}", status);
                    }
                    SessionEvent::Finished { winner: w } => winner = Some(w),
                    SessionEvent::PartialExitReady { checkpoint } => {
                        info!("partial exit available at turn {}", checkpoint.turn());
                    }
                    SessionEvent::DisputeRecommended { turn } => {
                        info!("dispute recommended at turn {}", turn);
                    }
                }
            }
        }

        let state_0 = *handle_0.state.borrow();
        handle_0.submit_input(jitter(&state_0));
        let state_1 = *handle_1.state.borrow();
        handle_1.submit_input(jitter(&state_1));
    }

    let final_0 = *handle_0.state.borrow();
    let final_1 = *handle_1.state.borrow();
    info!(
        "final score {} - {} at turn {}",
        final_0.score_0, final_0.score_1, final_0.turn
    );
    info!("session 0 state hash: {}", final_0.hash());
    info!("session 1 state hash: {}", final_1.hash());
    if final_0.hash() == final_1.hash() {
        info!("CONSENSUS VERIFIED: both sessions agree");
    } else {
        info!("sessions still reconciling (turn {} vs {})", final_0.turn, final_1.turn);
    }

    if let Some(checkpoint) = handle_0.checkpoint.borrow().as_ref() {
        info!(
            "last adopted checkpoint: turn {}, signatures: [{}, {}]",
            checkpoint.turn(),
            checkpoint.has_signature(0),
            checkpoint.has_signature(1),
        );
    }

    handle_0.teardown();
    handle_1.teardown();

    Ok(winner)
}

/// Small deterministic paddle wobble keyed on the turn counter.
fn jitter(state: &GameState) -> Action {
    match (state.turn / 8) % 4 {
        0 => Action::MoveUp,
        2 => Action::MoveDown,
        _ => Action::NoMove,
    }
}
