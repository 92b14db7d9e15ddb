//! `GET /post/feed/posted`: pushes the caller's recomputed feed over a WebSocket.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use kinfeed_api_types::UserId;
use tracing::{debug, info, trace, warn};

use crate::feed::LiveUpdateMultiplexer;

use super::{AuthenticatedUser, HttpState};

pub async fn live_feed(
    ws: WebSocketUpgrade,
    State(state): State<HttpState>,
    user: AuthenticatedUser,
) -> Response {
    let live = state.live.clone();
    ws.on_upgrade(move |socket| stream_updates(socket, live, user.id()))
}

async fn stream_updates(socket: WebSocket, live: LiveUpdateMultiplexer, user: UserId) {
    let mut subscription = match live.subscribe(user).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(user_id = %user, error = %err, "Failed to open live subscription");
            return;
        }
    };
    let subscription_id = subscription.id;

    let (mut ws_write, mut ws_read) = socket.split();
    info!(user_id = %user, %subscription_id, "Live feed connected");

    let mut read_task = tokio::spawn(async move {
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(data)) => {
                    trace!(len = data.len(), "Live feed ping received");
                }
                Err(err) => {
                    debug!(error = %err, "Live feed read error");
                    break;
                }
                _ => {}
            }
        }
    });

    loop {
        tokio::select! {
            update = subscription.receiver.recv() => {
                let Some(update) = update else {
                    debug!(user_id = %user, %subscription_id, "Live subscription closed");
                    break;
                };
                match serde_json::to_string(&update.posts) {
                    Ok(json) => {
                        if let Err(err) = ws_write.send(Message::Text(json.into())).await {
                            debug!(error = %err, "Live feed write error");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(user_id = %user, error = %err, "Failed to serialize feed update");
                    }
                }
            }
            _ = &mut read_task => {
                debug!(user_id = %user, %subscription_id, "Live feed client disconnected");
                break;
            }
        }
    }

    read_task.abort();
    if let Err(err) = live.unsubscribe(user, subscription_id).await {
        debug!(user_id = %user, error = %err, "Live unsubscribe after close");
    }
    info!(user_id = %user, %subscription_id, "Live feed disconnected");
}
