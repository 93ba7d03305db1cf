use std::env;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

const DEFAULT_LICHESS_BASE_URL: &str = "https://lichess.org";

#[derive(Debug, Error)]
pub enum LichessApiError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("lichess api error ({status}): {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid lichess response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct LichessClient {
    base_url: String,
    api_token: String,
    http: reqwest::Client,
}

impl LichessClient {
    pub fn new(api_token: String) -> Self {
        Self {
            base_url: base_url_from_env(),
            api_token,
            http: reqwest::Client::new(),
        }
    }

    pub async fn accept_challenge(&self, challenge_id: &str) -> Result<(), LichessApiError> {
        self.post(&format!("/api/challenge/{challenge_id}/accept"))
            .await
    }

    pub async fn decline_challenge(&self, challenge_id: &str) -> Result<(), LichessApiError> {
        self.post(&format!("/api/challenge/{challenge_id}/decline"))
            .await
    }

    pub async fn abort_game(&self, game_id: &str) -> Result<(), LichessApiError> {
        self.post(&format!("/api/bot/game/{game_id}/abort")).await
    }

    pub async fn resign_game(&self, game_id: &str) -> Result<(), LichessApiError> {
        self.post(&format!("/api/bot/game/{game_id}/resign")).await
    }

    pub async fn submit_move(&self, game_id: &str, uci: &str) -> Result<(), LichessApiError> {
        self.post(&format!("/api/bot/game/{game_id}/move/{uci}"))
            .await
    }

    pub async fn post_game_chat(&self, game_id: &str, text: &str) -> Result<(), LichessApiError> {
        let response = self
            .http
            .post(format!("{}/api/bot/game/{game_id}/chat", self.base_url))
            .header("Authorization", self.auth_header_value())
            .form(&[("room", "player"), ("text", text)])
            .send()
            .await?;
        check_status(response).await
    }

    pub async fn ongoing_game_ids(&self) -> Result<Vec<String>, LichessApiError> {
        let response = self
            .http
            .get(format!("{}/api/account/playing", self.base_url))
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LichessApiError::Api { status, body });
        }
        let payload: NowPlayingResponse = serde_json::from_str(&body).map_err(|err| {
            LichessApiError::InvalidResponse(format!(
                "failed to decode ongoing games response: {err}; body={body}"
            ))
        })?;
        Ok(payload
            .now_playing
            .into_iter()
            .map(|game| game.game_id)
            .collect())
    }

    /// Open the per-game event stream (gameFull / gameState / gameFinish).
    pub async fn stream_game(&self, game_id: &str) -> Result<GameEventStream, LichessApiError> {
        let url = format!("{}/api/bot/game/stream/{game_id}", self.base_url);
        let response = self.get_stream_response(&url).await?;
        Ok(GameEventStream {
            lines: NdjsonLines::new(response),
        })
    }

    /// Open the account-wide event stream that carries incoming challenges.
    pub async fn stream_lobby(&self) -> Result<LobbyEventStream, LichessApiError> {
        let url = format!("{}/api/stream/event", self.base_url);
        let response = self.get_stream_response(&url).await?;
        Ok(LobbyEventStream {
            lines: NdjsonLines::new(response),
        })
    }

    async fn post(&self, path: &str) -> Result<(), LichessApiError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        check_status(response).await
    }

    async fn get_stream_response(&self, url: &str) -> Result<reqwest::Response, LichessApiError> {
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await?;
            Err(LichessApiError::Api { status, body })
        }
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.api_token)
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), LichessApiError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        let body = response.text().await?;
        Err(LichessApiError::Api { status, body })
    }
}

fn base_url_from_env() -> String {
    env::var("LICHESS_BASE_URL")
        .unwrap_or_else(|_| DEFAULT_LICHESS_BASE_URL.to_string())
        .trim()
        .trim_end_matches('/')
        .to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlayerInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameFullEvent {
    #[serde(default)]
    pub white: PlayerInfo,
    #[serde(default)]
    pub black: PlayerInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameStateEvent {
    pub status: String,
    #[serde(default)]
    pub moves: String,
}

#[derive(Debug, Clone)]
pub enum GameEvent {
    GameFull(GameFullEvent),
    GameState(GameStateEvent),
    GameFinish { game_id: String },
}

#[derive(Debug, Clone)]
pub enum LobbyEvent {
    Challenge {
        id: String,
        challenger_id: Option<String>,
    },
}

pub struct GameEventStream {
    lines: NdjsonLines,
}

impl GameEventStream {
    pub async fn next_event(&mut self) -> Result<Option<GameEvent>, LichessApiError> {
        while let Some(line) = self.lines.next_line().await? {
            let value: JsonValue = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(err) => {
                    warn!(error = %err, "skipping unparseable game stream record");
                    continue;
                }
            };
            if let Some(event) = parse_game_event(&value) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

pub struct LobbyEventStream {
    lines: NdjsonLines,
}

impl LobbyEventStream {
    pub async fn next_event(&mut self) -> Result<Option<LobbyEvent>, LichessApiError> {
        while let Some(line) = self.lines.next_line().await? {
            let value: JsonValue = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(err) => {
                    warn!(error = %err, "skipping unparseable lobby stream record");
                    continue;
                }
            };
            if let Some(event) = parse_lobby_event(&value) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

fn parse_game_event(value: &JsonValue) -> Option<GameEvent> {
    match value.get("type").and_then(JsonValue::as_str) {
        Some("gameFull") => match serde_json::from_value(value.clone()) {
            Ok(event) => Some(GameEvent::GameFull(event)),
            Err(err) => {
                warn!(error = %err, "ignoring malformed gameFull payload");
                None
            }
        },
        Some("gameState") => match serde_json::from_value(value.clone()) {
            Ok(event) => Some(GameEvent::GameState(event)),
            Err(err) => {
                warn!(error = %err, "ignoring malformed gameState payload");
                None
            }
        },
        Some("gameFinish") => value
            .pointer("/game/id")
            .and_then(JsonValue::as_str)
            .map(|game_id| GameEvent::GameFinish {
                game_id: game_id.to_string(),
            }),
        // Unknown discriminants (chatLine, opponentGone, ...) are not ours.
        _ => None,
    }
}

fn parse_lobby_event(value: &JsonValue) -> Option<LobbyEvent> {
    match value.get("type").and_then(JsonValue::as_str) {
        Some("challenge") => {
            let id = value
                .pointer("/challenge/id")
                .and_then(JsonValue::as_str)?
                .to_string();
            let challenger_id = value
                .pointer("/challenge/challenger/id")
                .and_then(JsonValue::as_str)
                .map(ToOwned::to_owned);
            Some(LobbyEvent::Challenge { id, challenger_id })
        }
        _ => None,
    }
}

/// Newline-delimited JSON framing over a byte stream. Blank lines are the
/// server's keep-alive heartbeats and are skipped.
struct NdjsonLines {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: String,
}

impl NdjsonLines {
    fn new(response: reqwest::Response) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            buffer: String::new(),
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>, LichessApiError> {
        loop {
            if let Some(newline_index) = self.buffer.find('\n') {
                let line = self.buffer[..newline_index].trim().to_string();
                self.buffer.drain(..=newline_index);
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }
            match self.stream.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(LichessApiError::Http)?;
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                None => {
                    let rest = self.buffer.trim().to_string();
                    self.buffer.clear();
                    if rest.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(rest));
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct NowPlayingResponse {
    #[serde(rename = "nowPlaying")]
    now_playing: Vec<NowPlayingGame>,
}

#[derive(Debug, Deserialize)]
struct NowPlayingGame {
    #[serde(rename = "gameId")]
    game_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_game_full_events() {
        let value = json!({
            "type": "gameFull",
            "white": {"id": "chatmate", "rating": 1500},
            "black": {"id": "opponent"},
            "state": {"type": "gameState", "moves": "", "status": "started"}
        });
        match parse_game_event(&value) {
            Some(GameEvent::GameFull(event)) => {
                assert_eq!(event.white.id.as_deref(), Some("chatmate"));
                assert_eq!(event.black.id.as_deref(), Some("opponent"));
            }
            other => panic!("expected gameFull, got {other:?}"),
        }
    }

    #[test]
    fn decodes_game_state_events() {
        let value = json!({
            "type": "gameState",
            "moves": "e2e4 e7e5",
            "status": "started",
            "wtime": 300000
        });
        match parse_game_event(&value) {
            Some(GameEvent::GameState(event)) => {
                assert_eq!(event.moves, "e2e4 e7e5");
                assert_eq!(event.status, "started");
            }
            other => panic!("expected gameState, got {other:?}"),
        }
    }

    #[test]
    fn decodes_game_finish_events() {
        let value = json!({"type": "gameFinish", "game": {"id": "abcd1234"}});
        match parse_game_event(&value) {
            Some(GameEvent::GameFinish { game_id }) => assert_eq!(game_id, "abcd1234"),
            other => panic!("expected gameFinish, got {other:?}"),
        }
    }

    #[test]
    fn ignores_unknown_discriminants() {
        assert!(parse_game_event(&json!({"type": "chatLine", "text": "hi"})).is_none());
        assert!(parse_game_event(&json!({"moves": "e2e4"})).is_none());
    }

    #[test]
    fn decodes_challenge_events() {
        let value = json!({
            "type": "challenge",
            "challenge": {
                "id": "abcd1234",
                "challenger": {"id": "tuxmania"},
                "timeControl": {"increment": 3}
            }
        });
        match parse_lobby_event(&value) {
            Some(LobbyEvent::Challenge { id, challenger_id }) => {
                assert_eq!(id, "abcd1234");
                assert_eq!(challenger_id.as_deref(), Some("tuxmania"));
            }
            None => panic!("expected challenge event"),
        }
    }

    #[test]
    fn ignores_non_challenge_lobby_events() {
        assert!(parse_lobby_event(&json!({"type": "gameStart", "game": {"id": "x"}})).is_none());
    }
}
