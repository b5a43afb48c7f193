//! Deterministic Turn Transition
//!
//! The pure state-advance function both peers and the on-chain contract
//! evaluate. Integer-only arithmetic, no randomness beyond the
//! turn-keyed serve rule, no side effects: identical inputs must yield
//! identical results on every platform.

use crate::game::input::{Action, PlayerIndex};
use crate::game::state::{
    Ball, GameState, Paddle, FIELD_HEIGHT, FIELD_WIDTH, MAX_BALL_SPEED_Y, MIN_BALL_SPEED_Y,
    SERVE_SPEED_X,
};

/// Advance the game by exactly one turn.
///
/// `action` is the input of the acting player (`state.turn mod 2`); the
/// other paddle holds still. Returns `None` when the state is already
/// terminal (a player has reached the winning score) — the turn counter
/// never advances past a finished game.
pub fn transition(state: &GameState, action: Action) -> Option<GameState> {
    // 1. Win check precedes all motion.
    if state.winner().is_some() {
        return None;
    }

    let mut next = *state;

    // 2. Pending serve: derive speed and direction from the turn number.
    if next.ball.awaiting_serve() {
        serve_ball(&mut next.ball, next.turn);
    }

    // 3. The acting player's paddle moves.
    match next.acting_player() {
        PlayerIndex::Zero => move_paddle(&mut next.paddle_0, action),
        PlayerIndex::One => move_paddle(&mut next.paddle_1, action),
    }

    // 4. Ball motion: walls, paddle bounce, scoring.
    move_ball(&mut next);

    // 5. The turn counter is the sole clock.
    next.turn += 1;

    Some(next)
}

/// Fold `transition` over an action sequence, stopping at a terminal state.
pub fn replay(start: GameState, actions: &[Action]) -> GameState {
    let mut state = start;
    for action in actions {
        match transition(&state, *action) {
            Some(next) => state = next,
            None => break,
        }
    }
    state
}

/// Turn-keyed serve rule.
///
/// Deliberately low-entropy: the on-chain contract cannot evaluate an
/// unpredictable RNG, so both sides derive the serve from the turn number
/// alone.
fn serve_ball(ball: &mut Ball, turn: u64) {
    ball.speed_x = SERVE_SPEED_X;
    ball.speed_y = MIN_BALL_SPEED_Y + (turn * 7) % (MAX_BALL_SPEED_Y - MIN_BALL_SPEED_Y);
    ball.moving_left = turn % 2 == 1;
    ball.moving_up = (turn / 2) % 2 == 1;
}

/// Apply one action to a paddle, clamped to the field.
fn move_paddle(paddle: &mut Paddle, action: Action) {
    match action {
        Action::MoveUp => {
            paddle.y = paddle.y.saturating_sub(paddle.speed).max(paddle.min_y());
            paddle.moving_up = true;
        }
        Action::MoveDown => {
            paddle.y = (paddle.y + paddle.speed).min(paddle.max_y());
            paddle.moving_up = false;
        }
        Action::NoMove => {}
    }
}

/// Does the paddle's vertical extent cover the ball's center line?
fn paddle_covers(paddle: &Paddle, ball_y: u64, ball_size: u64) -> bool {
    let reach = paddle.size / 2 + ball_size / 2;
    ball_y.abs_diff(paddle.y) <= reach
}

/// Paddle bounce: flip horizontal direction and recompute vertical speed
/// from the hit offset (closer to paddle center, flatter return).
fn bounce(ball: &mut Ball, paddle: &Paddle) {
    let offset = ball.y as i64 - paddle.y as i64;
    let half = (paddle.size / 2) as u64;
    let magnitude = offset.unsigned_abs().min(half);

    ball.speed_y = (MAX_BALL_SPEED_Y * magnitude / half).max(MIN_BALL_SPEED_Y);
    if offset != 0 {
        ball.moving_up = offset < 0;
    }
    ball.moving_left = !ball.moving_left;
}

/// Score against the side that missed and re-serve from field center.
fn score_and_reserve(state: &mut GameState, scorer: PlayerIndex) {
    match scorer {
        PlayerIndex::Zero => state.score_0 += 1,
        PlayerIndex::One => state.score_1 += 1,
    }
    state.ball = Ball::centered();
    serve_ball(&mut state.ball, state.turn);
}

/// Move the ball one step: vertical wall reflection, then horizontal
/// travel ending in a paddle bounce or a score.
fn move_ball(state: &mut GameState) {
    let radius = (state.ball.size / 2) as i64;

    // Vertical motion with reflection off top/bottom bounds. Speeds are
    // far below the field extent, so one reflection always suffices.
    let lo = radius;
    let hi = (FIELD_HEIGHT as i64) - radius;
    let mut y = state.ball.y as i64;
    let dy = state.ball.speed_y as i64;
    if state.ball.moving_up {
        y -= dy;
        if y < lo {
            y = lo + (lo - y);
            state.ball.moving_up = false;
        }
    } else {
        y += dy;
        if y > hi {
            y = hi - (y - hi);
            state.ball.moving_up = true;
        }
    }
    state.ball.y = y.clamp(lo, hi) as u64;

    // Horizontal motion towards the facing paddle.
    let left_plane = radius;
    let right_plane = (FIELD_WIDTH as i64) - radius;
    let mut x = state.ball.x as i64;
    let dx = state.ball.speed_x as i64;

    if state.ball.moving_left {
        x -= dx;
        if x <= left_plane {
            if paddle_covers(&state.paddle_0, state.ball.y, state.ball.size) {
                state.ball.x = left_plane as u64;
                let paddle = state.paddle_0;
                bounce(&mut state.ball, &paddle);
            } else {
                score_and_reserve(state, PlayerIndex::One);
            }
        } else {
            state.ball.x = x as u64;
        }
    } else {
        x += dx;
        if x >= right_plane {
            if paddle_covers(&state.paddle_1, state.ball.y, state.ball.size) {
                state.ball.x = right_plane as u64;
                let paddle = state.paddle_1;
                bounce(&mut state.ball, &paddle);
            } else {
                score_and_reserve(state, PlayerIndex::Zero);
            }
        } else {
            state.ball.x = x as u64;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
