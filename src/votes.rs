use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::board::GameBoard;
use crate::twitch::ChatMessage;

// One-directional translation of German piece letters to their English
// equivalents, applied at every matching character position so letters in
// disambiguated notation ("Sbd7") are covered too.
fn translate_piece_letter(ch: char) -> char {
    match ch {
        'S' => 'N',
        'L' => 'B',
        'D' => 'Q',
        'T' => 'R',
        other => other,
    }
}

pub fn normalize_notation(raw: &str) -> String {
    raw.trim_end_matches(['\r', '\n'])
        .chars()
        .map(translate_piece_letter)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MoveCandidate {
    /// Canonical square-to-square form.
    Move(String),
    Resign,
}

/// Normalize one raw chat line into a candidate. Square-to-square form is
/// tried first, then short algebraic notation against the current position
/// (never mutating it), then the literal word "resign". The resign check
/// runs against the raw line so the piece-letter table cannot mangle it.
/// Anything else is dropped silently.
pub fn parse_candidate(raw: &str, board: &GameBoard) -> Option<MoveCandidate> {
    let normalized = normalize_notation(raw);
    if let Ok(uci) = GameBoard::parse_uci(&normalized) {
        return Some(MoveCandidate::Move(uci.to_string()));
    }
    if let Ok(chess_move) = board.parse_san(&normalized) {
        return Some(MoveCandidate::Move(GameBoard::uci_string(&chess_move)));
    }
    if raw.trim().eq_ignore_ascii_case("resign") {
        return Some(MoveCandidate::Resign);
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub winner: MoveCandidate,
    pub votes: usize,
    pub tie_broken: bool,
}

/// Tally one round's messages against the board state at round-open time.
/// Only the most recent valid message per user counts; move candidates must
/// survive a legality trial on a board copy. Ties at the maximum count are
/// broken uniformly at random and flagged.
pub fn tally_votes(messages: &[ChatMessage], board: &GameBoard) -> Option<RoundOutcome> {
    let mut ballots: HashMap<&str, MoveCandidate> = HashMap::new();
    for message in messages {
        let Some(candidate) = parse_candidate(&message.text, board) else {
            continue;
        };
        if let MoveCandidate::Move(uci) = &candidate {
            if board.trial().apply_uci(uci).is_err() {
                continue;
            }
        }
        ballots.insert(message.username.as_str(), candidate);
    }

    let mut counts: HashMap<MoveCandidate, usize> = HashMap::new();
    for candidate in ballots.into_values() {
        *counts.entry(candidate).or_insert(0) += 1;
    }

    let top = counts.values().copied().max()?;
    let leaders: Vec<MoveCandidate> = counts
        .into_iter()
        .filter(|(_, count)| *count == top)
        .map(|(candidate, _)| candidate)
        .collect();
    let tie_broken = leaders.len() > 1;
    let winner = leaders.choose(&mut rand::thread_rng())?.clone();

    Some(RoundOutcome {
        winner,
        votes: top,
        tie_broken,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(username: &str, text: &str) -> ChatMessage {
        ChatMessage {
            username: username.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn translates_localized_piece_letters_at_every_position() {
        assert_eq!(normalize_notation("Sf3"), "Nf3");
        assert_eq!(normalize_notation("Lc4"), "Bc4");
        assert_eq!(normalize_notation("Dh5"), "Qh5");
        assert_eq!(normalize_notation("Tad1"), "Rad1");
        assert_eq!(normalize_notation("SLDT"), "NBQR");
        assert_eq!(normalize_notation("e2e4\r\n"), "e2e4");
    }

    #[test]
    fn parses_square_to_square_san_and_resign() {
        let board = GameBoard::new();
        assert_eq!(
            parse_candidate("e2e4", &board),
            Some(MoveCandidate::Move("e2e4".to_string()))
        );
        assert_eq!(
            parse_candidate("e4", &board),
            Some(MoveCandidate::Move("e2e4".to_string()))
        );
        assert_eq!(
            parse_candidate("Nf3", &board),
            Some(MoveCandidate::Move("g1f3".to_string()))
        );
        assert_eq!(
            parse_candidate("Sf3", &board),
            Some(MoveCandidate::Move("g1f3".to_string()))
        );
        assert_eq!(parse_candidate("resign", &board), Some(MoveCandidate::Resign));
        assert_eq!(parse_candidate("RESIGN", &board), Some(MoveCandidate::Resign));
        assert_eq!(parse_candidate("kibitzing", &board), None);
    }

    #[test]
    fn parsing_is_idempotent() {
        let board = GameBoard::new();
        assert_eq!(
            parse_candidate("Nf3", &board),
            parse_candidate("Nf3", &board)
        );
        assert_eq!(
            parse_candidate("not a move", &board),
            parse_candidate("not a move", &board)
        );
    }

    #[test]
    fn majority_wins_without_tie_break() {
        let board = GameBoard::new();
        let messages = vec![
            msg("alice", "e4"),
            msg("bob", "e4"),
            msg("carol", "Nf3"),
        ];
        let outcome = tally_votes(&messages, &board).unwrap();
        assert_eq!(outcome.winner, MoveCandidate::Move("e2e4".to_string()));
        assert_eq!(outcome.votes, 2);
        assert!(!outcome.tie_broken);
    }

    #[test]
    fn only_the_last_vote_per_user_counts() {
        let board = GameBoard::new();
        // alice's first vote for e4 is overwritten by d4; bob stays on e4.
        let messages = vec![msg("alice", "e4"), msg("alice", "d4"), msg("bob", "e4")];
        let outcome = tally_votes(&messages, &board).unwrap();
        assert_eq!(outcome.votes, 1);
        assert!(outcome.tie_broken);
        let tied = [
            MoveCandidate::Move("e2e4".to_string()),
            MoveCandidate::Move("d2d4".to_string()),
        ];
        assert!(tied.contains(&outcome.winner));
    }

    #[test]
    fn tie_break_always_picks_a_member_of_the_tied_set() {
        let board = GameBoard::new();
        let messages = vec![msg("alice", "e4"), msg("bob", "d4")];
        let tied = [
            MoveCandidate::Move("e2e4".to_string()),
            MoveCandidate::Move("d2d4".to_string()),
        ];
        let mut seen_e4 = false;
        let mut seen_d4 = false;
        for _ in 0..200 {
            let outcome = tally_votes(&messages, &board).unwrap();
            assert!(outcome.tie_broken);
            assert_eq!(outcome.votes, 1);
            assert!(tied.contains(&outcome.winner));
            seen_e4 |= outcome.winner == tied[0];
            seen_d4 |= outcome.winner == tied[1];
        }
        assert!(seen_e4 && seen_d4);
    }

    #[test]
    fn illegal_moves_never_become_tallied_candidates() {
        let board = GameBoard::new();
        // Parseable square-to-square form, but the queen is blocked.
        let messages = vec![msg("alice", "d1h5")];
        assert!(tally_votes(&messages, &board).is_none());
    }

    #[test]
    fn uci_and_san_votes_for_the_same_move_are_merged() {
        let board = GameBoard::new();
        let messages = vec![msg("alice", "e2e4"), msg("bob", "e4")];
        let outcome = tally_votes(&messages, &board).unwrap();
        assert_eq!(outcome.winner, MoveCandidate::Move("e2e4".to_string()));
        assert_eq!(outcome.votes, 2);
        assert!(!outcome.tie_broken);
    }

    #[test]
    fn empty_round_has_no_winner() {
        let board = GameBoard::new();
        assert!(tally_votes(&[], &board).is_none());
        let noise = vec![msg("alice", "hello"), msg("bob", "gg")];
        assert!(tally_votes(&noise, &board).is_none());
    }

    #[test]
    fn resign_can_win_a_round() {
        let board = GameBoard::new();
        let messages = vec![
            msg("alice", "resign"),
            msg("bob", "resign"),
            msg("carol", "e4"),
        ];
        let outcome = tally_votes(&messages, &board).unwrap();
        assert_eq!(outcome.winner, MoveCandidate::Resign);
        assert_eq!(outcome.votes, 2);
    }
}
