use std::time::Duration;

use shakmaty::Color;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::board::{BoardError, GameBoard};
use crate::config::TwitchConfig;
use crate::lichess::{GameEvent, GameEventStream, LichessApiError, LichessClient};
use crate::registry::ChannelRegistry;
use crate::twitch::{TwitchError, TwitchSession};
use crate::votes::{tally_votes, MoveCandidate, RoundOutcome};

const TERMINAL_STATUSES: [&str; 4] = ["resign", "aborted", "mate", "draw"];
const MAX_EMPTY_ROUNDS: u32 = 3;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Lichess(#[from] LichessApiError),
    #[error(transparent)]
    Twitch(#[from] TwitchError),
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error("game stream desynchronized: server reports {reported} half-moves, session applied {applied}")]
    Desync { reported: usize, applied: usize },
    #[error("game event stream ended before a terminal status")]
    StreamEnded,
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub game_id: String,
    pub channel: String,
    pub vote_seconds: u64,
    /// Lichess account the bot plays as; decides color from gameFull.
    pub bot_account: String,
    /// Tag prefixed to chat announcements, usually the Twitch nickname.
    pub bot_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Configured,
    AwaitingOpponent,
    PollOpen,
    Resolving,
    MoveSubmitted,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveResolution {
    Moved,
    Resigned,
    Abandoned,
}

/// What one closed poll round means for the session.
#[derive(Debug, PartialEq, Eq)]
enum RoundDecision {
    Retry,
    Abandon,
    Resign,
    Submit {
        uci: String,
        votes: usize,
        tie_broken: bool,
    },
}

/// One session per accepted challenge: owns the board, the applied-move
/// counter, and the vote rounds for a single game bound to a single channel.
pub struct GameSession {
    game_id: String,
    channel: String,
    vote_seconds: u64,
    bot_account: String,
    bot_tag: String,
    board: GameBoard,
    color: Option<Color>,
    moves_applied: usize,
    phase: SessionPhase,
}

/// Accept the challenge and drive the game to completion. Errors are
/// reported to the spawner for logging; cleanup (best-effort abort/resign,
/// chat drain cancellation, channel claim release) happens on every path.
pub async fn run(
    lichess: LichessClient,
    registry: ChannelRegistry,
    twitch_cfg: TwitchConfig,
    params: SessionParams,
) -> Result<(), SessionError> {
    lichess.accept_challenge(&params.game_id).await?;

    let result = run_accepted(&lichess, &registry, &twitch_cfg, &params).await;
    if result.is_err() {
        cancel_or_resign(&lichess, &params.game_id).await;
    }
    result
}

async fn run_accepted(
    lichess: &LichessClient,
    registry: &ChannelRegistry,
    twitch_cfg: &TwitchConfig,
    params: &SessionParams,
) -> Result<(), SessionError> {
    let mut events = lichess.stream_game(&params.game_id).await?;
    let mut session = GameSession::new(params.clone());

    let Some(claim) = registry.claim(&params.channel) else {
        info!(
            game_id = %params.game_id,
            channel = %params.channel,
            "channel already has an active session; cancelling challenge"
        );
        if let Err(err) = lichess
            .post_game_chat(
                &params.game_id,
                &format!("A game for channel {} is already running", params.channel),
            )
            .await
        {
            warn!(game_id = %params.game_id, error = %err, "failed to notify challenger");
        }
        cancel_or_resign(lichess, &params.game_id).await;
        return Ok(());
    };

    let mut twitch = TwitchSession::connect(twitch_cfg, claim.channel()).await?;
    twitch
        .send_message(&format!(
            "[{}] Connected to lichess game https://lichess.org/{}",
            params.bot_tag, params.game_id
        ))
        .await?;

    let outcome = session.drive(lichess, &mut events, &mut twitch).await;
    twitch.shutdown();
    // The channel claim is released as the very last action before exit.
    drop(claim);
    outcome
}

/// Abort first (only valid before both sides moved), fall back to resigning.
/// Cleanup failures never mask the primary outcome, but they are logged.
pub async fn cancel_or_resign(lichess: &LichessClient, game_id: &str) {
    if let Err(abort_err) = lichess.abort_game(game_id).await {
        debug!(game_id, error = %abort_err, "abort failed; attempting resign");
        if let Err(resign_err) = lichess.resign_game(game_id).await {
            warn!(game_id, error = %resign_err, "abort and resign both failed during cleanup");
        }
    }
}

impl GameSession {
    fn new(params: SessionParams) -> Self {
        Self {
            game_id: params.game_id,
            channel: params.channel.to_ascii_lowercase(),
            vote_seconds: params.vote_seconds,
            bot_account: params.bot_account,
            bot_tag: params.bot_tag,
            board: GameBoard::new(),
            color: None,
            moves_applied: 0,
            phase: SessionPhase::Configured,
        }
    }

    fn advance(&mut self, phase: SessionPhase) {
        debug!(
            game_id = %self.game_id,
            from = ?self.phase,
            to = ?phase,
            "session phase change"
        );
        self.phase = phase;
    }

    async fn drive(
        &mut self,
        lichess: &LichessClient,
        events: &mut GameEventStream,
        twitch: &mut TwitchSession,
    ) -> Result<(), SessionError> {
        loop {
            let Some(event) = events.next_event().await? else {
                return Err(SessionError::StreamEnded);
            };
            match event {
                GameEvent::GameFull(full) => {
                    let white_is_bot = full
                        .white
                        .id
                        .as_deref()
                        .map(|id| id.eq_ignore_ascii_case(&self.bot_account))
                        .unwrap_or(false);
                    let color = if white_is_bot {
                        Color::White
                    } else {
                        Color::Black
                    };
                    self.color = Some(color);
                    info!(
                        game_id = %self.game_id,
                        channel = %self.channel,
                        color = ?color,
                        "game configured"
                    );
                    if white_is_bot {
                        // Bot moves first; open a round with no prior move.
                        match self.resolve_move(lichess, twitch, None).await? {
                            MoveResolution::Moved => self.advance(SessionPhase::AwaitingOpponent),
                            MoveResolution::Resigned | MoveResolution::Abandoned => {
                                return self.finish(twitch).await;
                            }
                        }
                    } else {
                        self.advance(SessionPhase::AwaitingOpponent);
                    }
                }
                GameEvent::GameState(state) => {
                    if TERMINAL_STATUSES.contains(&state.status.as_str()) {
                        info!(
                            game_id = %self.game_id,
                            status = %state.status,
                            "game reached terminal status"
                        );
                        return self.finish(twitch).await;
                    }
                    let Some(color) = self.color else {
                        debug!(game_id = %self.game_id, "gameState before color assignment; skipping");
                        continue;
                    };
                    let moves: Vec<&str> = state.moves.split_whitespace().collect();
                    if !bot_to_move(color, moves.len()) {
                        // Echo of our own submitted move.
                        continue;
                    }
                    let Some(&last) = moves.last() else {
                        // Empty list with the bot to move is the first-move
                        // case, already handled from gameFull.
                        continue;
                    };
                    check_sync(moves.len(), self.moves_applied)?;
                    let opponent_move = self.board.apply_uci(last)?;
                    self.moves_applied += 1;
                    match self
                        .resolve_move(lichess, twitch, Some(&opponent_move.san))
                        .await?
                    {
                        MoveResolution::Moved => self.advance(SessionPhase::AwaitingOpponent),
                        MoveResolution::Resigned | MoveResolution::Abandoned => {
                            return self.finish(twitch).await;
                        }
                    }
                }
                GameEvent::GameFinish { game_id } => {
                    info!(game_id = %game_id, "gameFinish received");
                    return self.finish(twitch).await;
                }
            }
        }
    }

    /// One call per bot move: repeated vote rounds until a winner emerges,
    /// the chat resigns, or three consecutive rounds stay empty.
    async fn resolve_move(
        &mut self,
        lichess: &LichessClient,
        twitch: &mut TwitchSession,
        last_move_san: Option<&str>,
    ) -> Result<MoveResolution, SessionError> {
        let mut empty_rounds = 0;
        loop {
            self.advance(SessionPhase::PollOpen);
            let open_message = match last_move_san {
                Some(san) => format!(
                    "Player did {san} === POLL OPEN === Write your move, poll closes in {} seconds",
                    self.vote_seconds
                ),
                None => format!(
                    "=== POLL OPEN === Write your move, poll closes in {} seconds",
                    self.vote_seconds
                ),
            };
            twitch.send_message(&open_message).await?;
            twitch.discard_pending();

            let messages = twitch
                .collect_for(Duration::from_secs(self.vote_seconds))
                .await;
            self.advance(SessionPhase::Resolving);

            match decide_round(tally_votes(&messages, &self.board), empty_rounds) {
                RoundDecision::Retry => {
                    twitch
                        .send_message("No legal move was proposed, poll starts again.")
                        .await?;
                    empty_rounds += 1;
                }
                RoundDecision::Abandon => {
                    twitch
                        .send_message("No legal move was proposed, poll starts again.")
                        .await?;
                    twitch
                        .send_message("Poll was not successful multiple times, canceling game.")
                        .await?;
                    cancel_or_resign(lichess, &self.game_id).await;
                    return Ok(MoveResolution::Abandoned);
                }
                RoundDecision::Resign => {
                    twitch
                        .send_message("=== POLL CLOSED === Chat voted to resign.")
                        .await?;
                    if let Err(err) = lichess.resign_game(&self.game_id).await {
                        warn!(game_id = %self.game_id, error = %err, "resign request failed");
                    }
                    return Ok(MoveResolution::Resigned);
                }
                RoundDecision::Submit {
                    uci,
                    votes,
                    tie_broken,
                } => {
                    // Tallied candidates already survived a legality trial;
                    // a failure here means the board invariant is broken.
                    let applied = self.board.apply_uci(&uci)?;
                    self.moves_applied += 1;
                    let closed_message = if tie_broken {
                        format!(
                            "=== POLL CLOSED === Move {} won with {} votes (randomly chosen between same votes).",
                            applied.san, votes
                        )
                    } else {
                        format!(
                            "=== POLL CLOSED === Move {} won with {} votes.",
                            applied.san, votes
                        )
                    };
                    twitch.send_message(&closed_message).await?;
                    lichess.submit_move(&self.game_id, &applied.uci).await?;
                    self.advance(SessionPhase::MoveSubmitted);
                    info!(
                        game_id = %self.game_id,
                        mv = %applied.uci,
                        votes,
                        tie_broken,
                        "move submitted"
                    );
                    return Ok(MoveResolution::Moved);
                }
            }
        }
    }

    async fn finish(&mut self, twitch: &mut TwitchSession) -> Result<(), SessionError> {
        self.advance(SessionPhase::Finished);
        if let Err(err) = twitch
            .send_message(&format!("[{}] Game over, disconnecting.", self.bot_tag))
            .await
        {
            warn!(channel = %self.channel, error = %err, "failed to announce disconnect");
        }
        Ok(())
    }
}

/// Even half-move count means White moves next.
fn bot_to_move(bot_color: Color, half_moves: usize) -> bool {
    let white_to_move = half_moves % 2 == 0;
    white_to_move == (bot_color == Color::White)
}

/// Cross-check the remote move-list length against the owned counter
/// instead of trusting parity alone. Exactly one new half-move is the only
/// state the session may act on.
fn check_sync(reported: usize, applied: usize) -> Result<(), SessionError> {
    if reported == applied + 1 {
        Ok(())
    } else {
        Err(SessionError::Desync { reported, applied })
    }
}

/// Map a closed round's tally onto the session's next step. `empty_rounds`
/// counts the consecutive empty rounds already behind us; the round being
/// decided is the `empty_rounds + 1`-th failure when the tally is empty.
fn decide_round(outcome: Option<RoundOutcome>, empty_rounds: u32) -> RoundDecision {
    let Some(outcome) = outcome else {
        if empty_rounds + 1 >= MAX_EMPTY_ROUNDS {
            return RoundDecision::Abandon;
        }
        return RoundDecision::Retry;
    };
    match outcome.winner {
        MoveCandidate::Resign => RoundDecision::Resign,
        MoveCandidate::Move(uci) => RoundDecision::Submit {
            uci,
            votes: outcome.votes,
            tie_broken: outcome.tie_broken,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SessionParams {
        SessionParams {
            game_id: "abcd1234".to_string(),
            channel: "TuxMania".to_string(),
            vote_seconds: 30,
            bot_account: "chatmate".to_string(),
            bot_tag: "chatmate".to_string(),
        }
    }

    #[test]
    fn parity_decides_whose_turn_it_is() {
        assert!(bot_to_move(Color::White, 0));
        assert!(!bot_to_move(Color::Black, 0));
        assert!(bot_to_move(Color::Black, 1));
        assert!(!bot_to_move(Color::White, 1));
        assert!(bot_to_move(Color::White, 2));
    }

    #[test]
    fn new_sessions_start_configured_with_a_lowercased_channel() {
        let session = GameSession::new(params());
        assert_eq!(session.channel, "tuxmania");
        assert_eq!(session.phase, SessionPhase::Configured);
        assert_eq!(session.moves_applied, 0);
        assert!(session.color.is_none());
    }

    #[test]
    fn sync_check_accepts_exactly_one_new_half_move() {
        assert!(check_sync(1, 0).is_ok());
        assert!(check_sync(5, 4).is_ok());
    }

    #[test]
    fn sync_check_raises_desync_on_missed_events() {
        assert!(matches!(
            check_sync(3, 0),
            Err(SessionError::Desync {
                reported: 3,
                applied: 0
            })
        ));
    }

    #[test]
    fn sync_check_raises_desync_on_replayed_events() {
        // An opponent-move event delivered again after the bot already
        // replied reports fewer half-moves than the session applied.
        assert!(matches!(
            check_sync(2, 3),
            Err(SessionError::Desync {
                reported: 2,
                applied: 3
            })
        ));
    }

    #[test]
    fn duplicate_echo_of_our_own_move_is_filtered_by_parity() {
        // After the bot (White) submits its first move the echoed list has
        // one half-move; both the echo and any duplicate of it fail the
        // turn check before the sync check runs.
        assert!(!bot_to_move(Color::White, 1));
        assert!(!bot_to_move(Color::Black, 2));
    }

    #[test]
    fn three_consecutive_empty_rounds_abandon_the_game() {
        let mut empty_rounds = 0;
        for _ in 0..MAX_EMPTY_ROUNDS - 1 {
            assert_eq!(decide_round(None, empty_rounds), RoundDecision::Retry);
            empty_rounds += 1;
        }
        assert_eq!(decide_round(None, empty_rounds), RoundDecision::Abandon);
    }

    #[test]
    fn a_winning_move_is_submitted_with_its_tally() {
        let outcome = RoundOutcome {
            winner: MoveCandidate::Move("e2e4".to_string()),
            votes: 3,
            tie_broken: false,
        };
        assert_eq!(
            decide_round(Some(outcome), 2),
            RoundDecision::Submit {
                uci: "e2e4".to_string(),
                votes: 3,
                tie_broken: false,
            }
        );
    }

    #[test]
    fn a_resign_vote_resigns_regardless_of_prior_empty_rounds() {
        let outcome = RoundOutcome {
            winner: MoveCandidate::Resign,
            votes: 2,
            tie_broken: true,
        };
        assert_eq!(decide_round(Some(outcome), 2), RoundDecision::Resign);
    }

    #[test]
    fn terminal_statuses_match_the_remote_vocabulary() {
        for status in ["resign", "aborted", "mate", "draw"] {
            assert!(TERMINAL_STATUSES.contains(&status));
        }
        assert!(!TERMINAL_STATUSES.contains(&"started"));
    }
}
