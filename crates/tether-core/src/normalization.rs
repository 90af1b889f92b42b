use chrono::DateTime;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::{
    error::{BackendError, ErrorCategory, MutationFailure},
    types::{
        ChangeEvent, ChangeKind, Entity, EntityPayload, NotificationType, SYSTEM_AUTHOR,
        SwipeDirection, SyncEvent, Table,
    },
};

/// A backend row that could not be turned into an [`Entity`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowDecodeError {
    #[error("{table:?} row has an unexpected shape: {reason}")]
    Shape { table: Table, reason: String },
    #[error("{table:?} row has invalid created_at '{value}'")]
    Timestamp { table: Table, value: String },
}

impl RowDecodeError {
    pub fn table(&self) -> Table {
        match self {
            Self::Shape { table, .. } | Self::Timestamp { table, .. } => *table,
        }
    }
}

impl From<RowDecodeError> for BackendError {
    fn from(err: RowDecodeError) -> Self {
        BackendError::new(ErrorCategory::Serialization, "row_decode_failed", err.to_string())
    }
}

/// Swipe ids are bigints; everything else is a uuid string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RowId {
    Text(String),
    Number(i64),
}

impl RowId {
    fn into_string(self) -> String {
        match self {
            Self::Text(id) => id,
            Self::Number(id) => id.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct MessageRow {
    id: RowId,
    conversation_id: String,
    sender_id: String,
    text: String,
    created_at: String,
}

#[derive(Deserialize)]
struct SwipeRow {
    id: RowId,
    swiper_id: String,
    swiped_id: String,
    direction: SwipeDirection,
    created_at: String,
}

#[derive(Deserialize)]
struct TripRow {
    id: RowId,
    slots: u32,
    created_at: String,
}

#[derive(Deserialize)]
struct NotificationRow {
    id: RowId,
    user_id: String,
    message: String,
    #[serde(rename = "type")]
    notification_type: NotificationType,
    #[serde(default)]
    source_entity_id: Option<String>,
    #[serde(default)]
    is_read: bool,
    created_at: String,
}

/// Decode one backend row into a typed entity.
pub fn decode_row(table: Table, row: &Value) -> Result<Entity, RowDecodeError> {
    match table {
        Table::Messages => {
            let row: MessageRow = parse(table, row)?;
            Ok(Entity {
                id: row.id.into_string(),
                author_id: row.sender_id,
                created_at_ms: parse_timestamp(table, &row.created_at)?,
                payload: EntityPayload::Message {
                    conversation_id: row.conversation_id,
                    text: row.text,
                },
            })
        }
        Table::Swipes => {
            let row: SwipeRow = parse(table, row)?;
            Ok(Entity {
                id: row.id.into_string(),
                author_id: row.swiper_id,
                created_at_ms: parse_timestamp(table, &row.created_at)?,
                payload: EntityPayload::Like {
                    swiped_id: row.swiped_id,
                    direction: row.direction,
                },
            })
        }
        Table::Trips => {
            let row: TripRow = parse(table, row)?;
            Ok(Entity {
                id: row.id.into_string(),
                author_id: SYSTEM_AUTHOR.to_owned(),
                created_at_ms: parse_timestamp(table, &row.created_at)?,
                payload: EntityPayload::TripSlotUpdate { slots: row.slots },
            })
        }
        Table::Notifications => {
            let row: NotificationRow = parse(table, row)?;
            Ok(Entity {
                id: row.id.into_string(),
                author_id: row.user_id,
                created_at_ms: parse_timestamp(table, &row.created_at)?,
                payload: EntityPayload::Notification {
                    message: row.message,
                    notification_type: row.notification_type,
                    source_entity_id: row.source_entity_id,
                    is_read: row.is_read,
                },
            })
        }
    }
}

/// Decode a change-feed delivery.
pub fn decode_change(kind: ChangeKind, table: Table, row: &Value) -> Result<ChangeEvent, RowDecodeError> {
    Ok(ChangeEvent {
        kind,
        entity: decode_row(table, row)?,
    })
}

/// Build the insert body for a payload written by `author_id`.
pub fn encode_insert(author_id: &str, payload: &EntityPayload) -> Value {
    match payload {
        EntityPayload::Message {
            conversation_id,
            text,
        } => json!({
            "conversation_id": conversation_id,
            "sender_id": author_id,
            "text": text,
        }),
        EntityPayload::Like {
            swiped_id,
            direction,
        } => json!({
            "swiper_id": author_id,
            "swiped_id": swiped_id,
            "direction": direction,
        }),
        EntityPayload::TripSlotUpdate { slots } => json!({ "slots": slots }),
        EntityPayload::Notification {
            message,
            notification_type,
            source_entity_id,
            is_read,
        } => json!({
            "user_id": author_id,
            "message": message,
            "type": notification_type,
            "source_entity_id": source_entity_id,
            "is_read": is_read,
        }),
    }
}

/// Convert an error into a `FatalError` runtime event.
pub fn normalize_fatal_error(error: BackendError, recoverable: bool) -> SyncEvent {
    SyncEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

/// Structural event for a failed mutation, if the owning view must act on it.
pub fn normalize_mutation_failure(failure: &MutationFailure) -> Option<SyncEvent> {
    match failure {
        MutationFailure::Unauthorized(err) => Some(SyncEvent::SessionInvalid {
            code: err.code.clone(),
        }),
        MutationFailure::NetworkFailure(_) | MutationFailure::ValidationRejected(_) => None,
    }
}

/// Text shown when a mutation on `table` is rolled back.
pub fn mutation_failure_notice(table: Table) -> &'static str {
    match table {
        Table::Messages => "Failed to send message",
        Table::Swipes => "Failed to record like",
        Table::Trips => "Failed to book trip",
        Table::Notifications => "Failed to update notification",
    }
}

/// Text shown when a history page for `table` fails to load.
pub fn page_failure_notice(table: Table, page_index: u32) -> &'static str {
    match (table, page_index) {
        (Table::Messages, 0) => "Failed to load conversation",
        (Table::Messages, _) => "Failed to load older messages",
        (Table::Swipes, _) => "Failed to load likes",
        (Table::Trips, _) => "Failed to load trips",
        (Table::Notifications, _) => "Failed to load notifications",
    }
}

fn parse<'a, T: Deserialize<'a>>(table: Table, row: &'a Value) -> Result<T, RowDecodeError> {
    T::deserialize(row).map_err(|err| RowDecodeError::Shape {
        table,
        reason: err.to_string(),
    })
}

fn parse_timestamp(table: Table, value: &str) -> Result<u64, RowDecodeError> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .and_then(|at| u64::try_from(at.timestamp_millis()).ok())
        .ok_or_else(|| RowDecodeError::Timestamp {
            table,
            value: value.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_rows() {
        let row = json!({
            "id": "srv1",
            "conversation_id": "c1",
            "sender_id": "u1",
            "text": "hi",
            "created_at": "2024-03-01T10:00:00.250+00:00",
        });
        let entity = decode_row(Table::Messages, &row).expect("message row decodes");
        assert_eq!(entity.id, "srv1");
        assert_eq!(entity.author_id, "u1");
        assert_eq!(entity.created_at_ms, 1_709_287_200_250);
        assert_eq!(entity.payload.text(), Some("hi"));
    }

    #[test]
    fn decodes_numeric_swipe_ids() {
        let row = json!({
            "id": 42,
            "swiper_id": "u9",
            "swiped_id": "u1",
            "direction": "right",
            "created_at": "2024-03-01T10:00:00Z",
        });
        let entity = decode_row(Table::Swipes, &row).expect("swipe row decodes");
        assert_eq!(entity.id, "42");
        assert_eq!(entity.author_id, "u9");
        assert_eq!(
            entity.payload,
            EntityPayload::Like {
                swiped_id: "u1".into(),
                direction: SwipeDirection::Right,
            }
        );
    }

    #[test]
    fn decodes_notifications_with_defaults() {
        let row = json!({
            "id": "n1",
            "user_id": "u1",
            "message": "You have a new match!",
            "type": "new_match",
            "created_at": "2024-03-01T10:00:00Z",
        });
        let entity = decode_row(Table::Notifications, &row).expect("notification row decodes");
        assert_eq!(
            entity.payload,
            EntityPayload::Notification {
                message: "You have a new match!".into(),
                notification_type: NotificationType::NewMatch,
                source_entity_id: None,
                is_read: false,
            }
        );
    }

    #[test]
    fn trips_are_authored_by_system() {
        let row = json!({ "id": "trip-1", "slots": 3, "created_at": "2024-03-01T10:00:00Z" });
        let entity = decode_row(Table::Trips, &row).expect("trip row decodes");
        assert_eq!(entity.author_id, SYSTEM_AUTHOR);
        assert_eq!(entity.payload, EntityPayload::TripSlotUpdate { slots: 3 });
    }

    #[test]
    fn rejects_rows_missing_fields() {
        let row = json!({ "id": "srv1", "conversation_id": "c1", "created_at": "2024-03-01T10:00:00Z" });
        let err = decode_row(Table::Messages, &row).expect_err("text is required");
        assert!(matches!(err, RowDecodeError::Shape { table: Table::Messages, .. }));
    }

    #[test]
    fn rejects_bad_timestamps() {
        let row = json!({ "id": "trip-1", "slots": 3, "created_at": "yesterday" });
        let err = decode_row(Table::Trips, &row).expect_err("timestamp must be rfc3339");
        assert_eq!(
            err,
            RowDecodeError::Timestamp {
                table: Table::Trips,
                value: "yesterday".into()
            }
        );
        assert_eq!(BackendError::from(err).category, ErrorCategory::Serialization);
    }

    #[test]
    fn insert_bodies_carry_author_columns() {
        let body = encode_insert(
            "u1",
            &EntityPayload::Message {
                conversation_id: "c1".into(),
                text: "hi".into(),
            },
        );
        assert_eq!(body, json!({ "conversation_id": "c1", "sender_id": "u1", "text": "hi" }));

        let like = encode_insert(
            "u1",
            &EntityPayload::Like {
                swiped_id: "u2".into(),
                direction: SwipeDirection::Right,
            },
        );
        assert_eq!(like["swiper_id"], "u1");
        assert_eq!(like["direction"], "right");
    }

    #[test]
    fn only_unauthorized_failures_surface_structurally() {
        let event = normalize_mutation_failure(&MutationFailure::from(BackendError::unauthorized(
            "expired",
        )));
        assert_eq!(
            event,
            Some(SyncEvent::SessionInvalid {
                code: "unauthorized".into()
            })
        );
        assert!(
            normalize_mutation_failure(&MutationFailure::from(BackendError::network("offline")))
                .is_none()
        );
    }

    #[test]
    fn maps_errors_to_fatal_events() {
        let event = normalize_fatal_error(BackendError::network("offline"), true);
        assert_eq!(
            event,
            SyncEvent::FatalError {
                code: "network_failure".into(),
                message: "offline".into(),
                recoverable: true,
            }
        );
    }

    #[test]
    fn page_notices_distinguish_first_page() {
        assert_eq!(page_failure_notice(Table::Messages, 0), "Failed to load conversation");
        assert_eq!(page_failure_notice(Table::Messages, 3), "Failed to load older messages");
    }
}
