mod board;
mod config;
mod lichess;
mod registry;
mod session;
mod twitch;
mod votes;

use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use config::{Config, VOTE_SECONDS_RANGE};
use lichess::{LichessApiError, LichessClient, LobbyEvent};
use registry::ChannelRegistry;
use session::SessionParams;

const INTAKE_RESTART_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "configuration failed");
            std::process::exit(1);
        }
    };
    let client = LichessClient::new(cfg.lichess_token.clone());
    let registry = ChannelRegistry::new();

    abort_leftover_games(&client).await;

    // Any failure inside intake restarts it from scratch; running sessions
    // keep their registry claims and are unaffected.
    loop {
        match run_intake(&client, &registry, &cfg).await {
            Ok(()) => warn!("challenge stream ended; reconnecting"),
            Err(err) => error!(error = %err, "challenge intake failed; restarting"),
        }
        sleep(INTAKE_RESTART_DELAY).await;
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chatmate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Games left over from a previous run have no session to drive them.
async fn abort_leftover_games(client: &LichessClient) {
    match client.ongoing_game_ids().await {
        Ok(game_ids) => {
            for game_id in game_ids {
                info!(game_id = %game_id, "cleaning up game left over from a previous run");
                session::cancel_or_resign(client, &game_id).await;
            }
        }
        Err(err) => warn!(error = %err, "could not list ongoing games at startup"),
    }
}

async fn run_intake(
    client: &LichessClient,
    registry: &ChannelRegistry,
    cfg: &Config,
) -> Result<(), LichessApiError> {
    let mut events = client.stream_lobby().await?;
    info!("listening for challenges");
    while let Some(event) = events.next_event().await? {
        let LobbyEvent::Challenge { id, challenger_id } = event;
        handle_challenge(client, registry, cfg, id, challenger_id).await;
    }
    Ok(())
}

async fn handle_challenge(
    client: &LichessClient,
    registry: &ChannelRegistry,
    cfg: &Config,
    challenge_id: String,
    challenger_id: Option<String>,
) {
    let Some(challenger) = challenger_id else {
        info!(challenge_id = %challenge_id, "declining challenge without a challenger id");
        decline(client, &challenge_id).await;
        return;
    };
    let Some(grant) = cfg.whitelist.grant_for(&challenger) else {
        info!(
            challenge_id = %challenge_id,
            challenger = %challenger,
            "declining challenge from unlisted account"
        );
        decline(client, &challenge_id).await;
        return;
    };
    let vote_seconds = grant.vote_seconds.unwrap_or(cfg.vote_seconds);
    if !VOTE_SECONDS_RANGE.contains(&vote_seconds) {
        warn!(
            challenge_id = %challenge_id,
            challenger = %challenger,
            vote_seconds,
            "vote window out of range; declining"
        );
        decline(client, &challenge_id).await;
        return;
    }

    let params = SessionParams {
        game_id: challenge_id,
        channel: grant.channel.clone(),
        vote_seconds,
        bot_account: cfg.lichess_account.clone(),
        bot_tag: cfg.twitch.nickname.clone(),
    };
    info!(
        game_id = %params.game_id,
        channel = %params.channel,
        challenger = %challenger,
        "accepting challenge"
    );

    // One independent task per game session; its errors stay contained.
    let client = client.clone();
    let registry = registry.clone();
    let twitch_cfg = cfg.twitch.clone();
    tokio::spawn(async move {
        let game_id = params.game_id.clone();
        if let Err(err) = session::run(client, registry, twitch_cfg, params).await {
            error!(game_id = %game_id, error = %err, "game session ended with error");
        }
    });
}

async fn decline(client: &LichessClient, challenge_id: &str) {
    if let Err(err) = client.decline_challenge(challenge_id).await {
        warn!(challenge_id = %challenge_id, error = %err, "failed to decline challenge");
    }
}
