//! Feed-relevant domain events and their wire envelope.
//!
//! On the wire an event is `{"kind": <string>, "payload": <object>}`. Decoding
//! reads the envelope first and only then the payload for the named kind, so
//! an unknown kind is reported as such rather than as a shape mismatch.

use std::fmt;

use kinfeed_api_types::{Post, PostId, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    InvalidateAll,
    FriendAdded { user_id: UserId, friend_id: UserId },
    FriendRemoved { user_id: UserId, friend_id: UserId },
    PostCreated { user_id: UserId, post: Post },
    PostUpdated { user_id: UserId, post: Post },
    PostDeleted { user_id: UserId, post_id: PostId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    InvalidateAll,
    AddFriend,
    DeleteFriend,
    CreatePost,
    UpdatePost,
    DeletePost,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::InvalidateAll,
        EventKind::AddFriend,
        EventKind::DeleteFriend,
        EventKind::CreatePost,
        EventKind::UpdatePost,
        EventKind::DeletePost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::InvalidateAll => "InvalidateAll",
            EventKind::AddFriend => "AddFriend",
            EventKind::DeleteFriend => "DeleteFriend",
            EventKind::CreatePost => "CreatePost",
            EventKind::UpdatePost => "UpdatePost",
            EventKind::DeletePost => "DeletePost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event envelope: {0}")]
    Malformed(String),
    #[error("unknown event kind `{0}`")]
    UnknownKind(String),
    #[error("invalid payload for `{kind}`: {message}")]
    Payload { kind: EventKind, message: String },
    #[error("failed to encode `{kind}` event: {message}")]
    Encode { kind: EventKind, message: String },
}

#[derive(Deserialize)]
struct RawEnvelope {
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Serialize)]
struct Envelope<'a, P> {
    kind: &'static str,
    payload: &'a P,
}

#[derive(Serialize, Deserialize)]
struct EmptyPayload {}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendPayload {
    user_id: UserId,
    friend_id: UserId,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostPayload {
    user_id: UserId,
    post: Post,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostDeletedPayload {
    user_id: UserId,
    post_id: PostId,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::InvalidateAll => EventKind::InvalidateAll,
            DomainEvent::FriendAdded { .. } => EventKind::AddFriend,
            DomainEvent::FriendRemoved { .. } => EventKind::DeleteFriend,
            DomainEvent::PostCreated { .. } => EventKind::CreatePost,
            DomainEvent::PostUpdated { .. } => EventKind::UpdatePost,
            DomainEvent::PostDeleted { .. } => EventKind::DeletePost,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        let kind = self.kind();
        let encoded = match self {
            DomainEvent::InvalidateAll => wrap(kind, &EmptyPayload {}),
            DomainEvent::FriendAdded { user_id, friend_id }
            | DomainEvent::FriendRemoved { user_id, friend_id } => wrap(
                kind,
                &FriendPayload {
                    user_id: *user_id,
                    friend_id: *friend_id,
                },
            ),
            DomainEvent::PostCreated { user_id, post } | DomainEvent::PostUpdated { user_id, post } => {
                wrap(
                    kind,
                    &PostPayload {
                        user_id: *user_id,
                        post: post.clone(),
                    },
                )
            }
            DomainEvent::PostDeleted { user_id, post_id } => wrap(
                kind,
                &PostDeletedPayload {
                    user_id: *user_id,
                    post_id: *post_id,
                },
            ),
        };
        encoded.map_err(|err| EventError::Encode {
            kind,
            message: err.to_string(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let raw: RawEnvelope =
            serde_json::from_slice(bytes).map_err(|err| EventError::Malformed(err.to_string()))?;
        let kind = EventKind::parse(&raw.kind).ok_or(EventError::UnknownKind(raw.kind))?;

        let event = match kind {
            EventKind::InvalidateAll => DomainEvent::InvalidateAll,
            EventKind::AddFriend => {
                let p: FriendPayload = payload(kind, raw.payload)?;
                DomainEvent::FriendAdded {
                    user_id: p.user_id,
                    friend_id: p.friend_id,
                }
            }
            EventKind::DeleteFriend => {
                let p: FriendPayload = payload(kind, raw.payload)?;
                DomainEvent::FriendRemoved {
                    user_id: p.user_id,
                    friend_id: p.friend_id,
                }
            }
            EventKind::CreatePost => {
                let p: PostPayload = payload(kind, raw.payload)?;
                DomainEvent::PostCreated {
                    user_id: p.user_id,
                    post: p.post,
                }
            }
            EventKind::UpdatePost => {
                let p: PostPayload = payload(kind, raw.payload)?;
                DomainEvent::PostUpdated {
                    user_id: p.user_id,
                    post: p.post,
                }
            }
            EventKind::DeletePost => {
                let p: PostDeletedPayload = payload(kind, raw.payload)?;
                DomainEvent::PostDeleted {
                    user_id: p.user_id,
                    post_id: p.post_id,
                }
            }
        };
        Ok(event)
    }
}

fn wrap<P: Serialize>(kind: EventKind, payload: &P) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&Envelope {
        kind: kind.as_str(),
        payload,
    })
}

fn payload<P: DeserializeOwned>(kind: EventKind, value: Value) -> Result<P, EventError> {
    serde_json::from_value(value).map_err(|err| EventError::Payload {
        kind,
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::OffsetDateTime;

    use super::*;

    #[test]
    fn friend_event_wire_shape() {
        let user_id = UserId::new();
        let friend_id = UserId::new();
        let bytes = DomainEvent::FriendAdded { user_id, friend_id }
            .encode()
            .expect("encode");

        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(
            value,
            json!({
                "kind": "AddFriend",
                "payload": {"userId": user_id.to_string(), "friendId": friend_id.to_string()}
            })
        );
    }

    #[test]
    fn invalidate_all_has_empty_payload() {
        let bytes = DomainEvent::InvalidateAll.encode().expect("encode");
        assert_eq!(bytes, br#"{"kind":"InvalidateAll","payload":{}}"#);
        assert_eq!(
            DomainEvent::decode(br#"{"kind":"InvalidateAll"}"#).expect("decode"),
            DomainEvent::InvalidateAll
        );
    }

    #[test]
    fn post_event_survives_the_wire() {
        let user_id = UserId::new();
        let event = DomainEvent::PostUpdated {
            user_id,
            post: Post {
                id: PostId::new(),
                author_user_id: user_id,
                text: "edited".to_string(),
                created_at: OffsetDateTime::UNIX_EPOCH,
                updated_at: OffsetDateTime::UNIX_EPOCH,
            },
        };
        let bytes = event.encode().expect("encode");
        assert_eq!(DomainEvent::decode(&bytes).expect("decode"), event);
    }

    #[test]
    fn unknown_kind_is_reported_by_name() {
        let err = DomainEvent::decode(br#"{"kind":"Reshare","payload":{}}"#)
            .expect_err("unknown kind");
        assert!(matches!(err, EventError::UnknownKind(ref kind) if kind == "Reshare"));
    }

    #[test]
    fn payload_mismatch_names_the_kind() {
        let err = DomainEvent::decode(br#"{"kind":"DeletePost","payload":{"userId":"x"}}"#)
            .expect_err("bad payload");
        assert!(matches!(
            err,
            EventError::Payload {
                kind: EventKind::DeletePost,
                ..
            }
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = DomainEvent::decode(b"\x00\x01").expect_err("garbage");
        assert!(matches!(err, EventError::Malformed(_)));
    }
}
