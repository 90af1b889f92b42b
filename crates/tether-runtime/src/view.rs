use tether_core::{
    CollectionOrder, CollectionScope, Entity, EntityPayload, ResourceFilter, SwipeDirection, Table,
};
use tether_platform::Severity;

/// Which server collection a runtime keeps in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewSpec {
    /// Messages of one conversation, oldest first.
    Conversation { conversation_id: String },
    /// Right swipes received by `user_id`, newest first.
    Likes { user_id: String },
    /// Trip inventory; only slot-count updates are live.
    Trips,
    /// In-app notifications addressed to `user_id`, newest first.
    Notifications { user_id: String },
}

impl ViewSpec {
    pub fn scope(&self) -> CollectionScope {
        match self {
            Self::Conversation { conversation_id } => {
                CollectionScope::eq(Table::Messages, "conversation_id", conversation_id)
            }
            Self::Likes { user_id } => CollectionScope::eq(Table::Swipes, "swiped_id", user_id),
            Self::Trips => CollectionScope::table(Table::Trips),
            Self::Notifications { user_id } => {
                CollectionScope::eq(Table::Notifications, "user_id", user_id)
            }
        }
    }

    pub fn filter(&self) -> ResourceFilter {
        match self {
            Self::Trips => ResourceFilter::updates(self.scope()),
            _ => ResourceFilter::inserts(self.scope()),
        }
    }

    pub fn order(&self) -> CollectionOrder {
        match self {
            Self::Conversation { .. } => CollectionOrder::Chronological,
            Self::Likes { .. } | Self::Trips | Self::Notifications { .. } => {
                CollectionOrder::NewestFirst
            }
        }
    }

    /// Extra predicate applied to live and history entities.
    pub fn entity_filter(&self) -> Option<fn(&Entity) -> bool> {
        match self {
            Self::Likes { .. } => Some(is_like),
            _ => None,
        }
    }

    pub fn accepts(&self, entity: &Entity) -> bool {
        self.entity_filter().is_none_or(|accept| accept(entity))
    }

    /// User-facing notice for a newly merged live entity.
    pub fn live_notice(&self, entity: &Entity, own_user_id: Option<&str>) -> Option<(String, Severity)> {
        match (self, &entity.payload) {
            (Self::Conversation { .. }, EntityPayload::Message { .. })
                if own_user_id != Some(entity.author_id.as_str()) =>
            {
                Some(("New message".to_owned(), Severity::Info))
            }
            (Self::Likes { .. }, EntityPayload::Like { .. }) => {
                Some(("Someone just liked you".to_owned(), Severity::Success))
            }
            (Self::Notifications { .. }, EntityPayload::Notification { message, .. }) => {
                Some((message.clone(), Severity::Info))
            }
            _ => None,
        }
    }

    /// Unread counter shown for this view.
    pub fn unread_count<'a>(&self, entities: impl Iterator<Item = &'a Entity>) -> usize {
        match self {
            Self::Notifications { .. } => entities
                .filter(|entity| {
                    matches!(entity.payload, EntityPayload::Notification { is_read: false, .. })
                })
                .count(),
            _ => 0,
        }
    }
}

fn is_like(entity: &Entity) -> bool {
    matches!(
        entity.payload,
        EntityPayload::Like {
            direction: SwipeDirection::Right,
            ..
        }
    )
}
