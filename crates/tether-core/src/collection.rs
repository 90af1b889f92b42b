use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::{debug, trace};

use crate::types::{CollectionItem, CollectionOrder, Entity, MergeOutcome, TentativeEntity};

/// Errors that can occur while reconciling tentative items.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollectionError {
    #[error("collection already holds an item with id '{0}'")]
    DuplicateId(String),
    #[error("no pending item with temporary id '{0}'")]
    UnknownTentative(String),
    #[error("temporary id '{temp_id}' was already confirmed as '{server_id}'")]
    AlreadyConfirmed { temp_id: String, server_id: String },
}

/// Result of [`SyncedCollection::confirm_tentative`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The server entity now occupies `position`.
    Replaced { position: usize },
    /// A realtime echo confirmed the entity before the commit returned.
    AlreadySettled { position: Option<usize> },
}

/// Ordered, id-deduplicated collection shared by live merges, optimistic
/// mutations and history pages.
///
/// Temporary ids are remembered as aliases of their server ids once settled,
/// so late results for either identifier resolve to the same row.
#[derive(Debug, Clone)]
pub struct SyncedCollection {
    items: Vec<CollectionItem>,
    order: CollectionOrder,
    aliases: HashMap<String, String>,
}

impl SyncedCollection {
    pub fn new(order: CollectionOrder) -> Self {
        Self {
            items: Vec::new(),
            order,
            aliases: HashMap::new(),
        }
    }

    pub fn order(&self) -> CollectionOrder {
        self.order
    }

    /// Current items in display order.
    pub fn items(&self) -> &[CollectionItem] {
        &self.items
    }

    pub fn snapshot(&self) -> Vec<CollectionItem> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&CollectionItem> {
        self.items.iter().find(|item| item.id() == self.resolve(id))
    }

    pub fn pending_count(&self) -> usize {
        self.items.iter().filter(|item| item.pending).count()
    }

    /// Server id for a settled temporary id, or `id` itself.
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map(String::as_str).unwrap_or(id)
    }

    /// Insert a pending placeholder at the live end.
    pub fn insert_tentative(&mut self, tentative: TentativeEntity) -> Result<usize, CollectionError> {
        if self.contains(&tentative.temp_id) || self.aliases.contains_key(&tentative.temp_id) {
            return Err(CollectionError::DuplicateId(tentative.temp_id));
        }
        let position = self.insert_live(tentative.into_item());
        Ok(position)
    }

    /// Merge a confirmed entity pushed by the change feed.
    ///
    /// An entity authored by `own_user_id` whose payload equals a pending
    /// item is treated as the echo of that write and confirms it in place.
    pub fn merge_live(&mut self, entity: Entity, own_user_id: Option<&str>) -> MergeOutcome {
        if self.contains(&entity.id) {
            trace!(id = %entity.id, "live entity already present");
            return MergeOutcome::Duplicate;
        }

        if own_user_id == Some(entity.author_id.as_str())
            && let Some(position) = self.pending_twin(&entity)
        {
            let temp_id = self.items[position].id().to_owned();
            debug!(%temp_id, server_id = %entity.id, "echo confirmed pending item");
            self.aliases.insert(temp_id.clone(), entity.id.clone());
            self.items[position] = CollectionItem::confirmed(entity);
            return MergeOutcome::AdoptedTentative { temp_id };
        }

        self.insert_live(CollectionItem::confirmed(entity));
        MergeOutcome::Inserted
    }

    /// Replace an existing entity with a newer server version.
    pub fn apply_update(&mut self, entity: Entity) -> MergeOutcome {
        let Some(position) = self.position(&entity.id) else {
            trace!(id = %entity.id, "update for unknown entity ignored");
            return MergeOutcome::Ignored;
        };
        if self.items[position].entity == entity {
            return MergeOutcome::Duplicate;
        }
        self.items[position] = CollectionItem::confirmed(entity);
        MergeOutcome::Updated
    }

    /// Merge one history page given oldest-first. Returns the number of new items.
    pub fn merge_history(&mut self, page_oldest_first: Vec<Entity>) -> usize {
        let mut seen: HashSet<String> = self.items.iter().map(|it| it.id().to_owned()).collect();
        let fresh: Vec<Entity> = page_oldest_first
            .into_iter()
            .filter(|entity| seen.insert(entity.id.clone()))
            .collect();
        let inserted = fresh.len();

        match self.order {
            CollectionOrder::Chronological => {
                // Newest of the page first, so equal timestamps keep page order.
                // Pending stamps come from the local clock, so only confirmed
                // items place history, and history always lands before pending.
                for entity in fresh.into_iter().rev() {
                    let mut at = self
                        .items
                        .iter()
                        .position(|it| {
                            !it.pending && it.entity.created_at_ms >= entity.created_at_ms
                        })
                        .unwrap_or_else(|| {
                            self.items
                                .iter()
                                .rposition(|it| !it.pending)
                                .map_or(0, |last| last + 1)
                        });
                    while at > 0 && self.items[at - 1].pending {
                        at -= 1;
                    }
                    self.items.insert(at, CollectionItem::confirmed(entity));
                }
            }
            CollectionOrder::NewestFirst => {
                self.items
                    .extend(fresh.into_iter().rev().map(CollectionItem::confirmed));
            }
        }

        inserted
    }

    /// Swap a pending item for its server-confirmed entity, keeping its position.
    pub fn confirm_tentative(
        &mut self,
        temp_id: &str,
        entity: Entity,
    ) -> Result<ConfirmOutcome, CollectionError> {
        if let Some(adopted) = self.aliases.get(temp_id).cloned() {
            if adopted == entity.id || self.contains(&entity.id) {
                return Ok(ConfirmOutcome::AlreadySettled {
                    position: self.position(&entity.id),
                });
            }
            // An echo of an identical twin was adopted under this temp id.
            let position = match self.pending_twin(&entity) {
                Some(position) => {
                    let twin_id = self.items[position].id().to_owned();
                    self.aliases.insert(twin_id, entity.id.clone());
                    self.items[position] = CollectionItem::confirmed(entity);
                    position
                }
                None => self.insert_live(CollectionItem::confirmed(entity)),
            };
            return Ok(ConfirmOutcome::Replaced { position });
        }

        let Some(mut position) = self
            .items
            .iter()
            .position(|it| it.pending && it.id() == temp_id)
        else {
            if self.contains(&entity.id) {
                return Ok(ConfirmOutcome::AlreadySettled {
                    position: self.position(&entity.id),
                });
            }
            return Err(CollectionError::UnknownTentative(temp_id.to_owned()));
        };

        if let Some(duplicate) = self.position(&entity.id) {
            debug!(%temp_id, server_id = %entity.id, "dropping echo appended before confirmation");
            self.items.remove(duplicate);
            if duplicate < position {
                position -= 1;
            }
        }

        self.aliases.insert(temp_id.to_owned(), entity.id.clone());
        self.items[position] = CollectionItem::confirmed(entity);
        Ok(ConfirmOutcome::Replaced { position })
    }

    /// Remove a pending item after its commit failed.
    pub fn remove_tentative(&mut self, temp_id: &str) -> Result<CollectionItem, CollectionError> {
        if let Some(server_id) = self.aliases.get(temp_id) {
            return Err(CollectionError::AlreadyConfirmed {
                temp_id: temp_id.to_owned(),
                server_id: server_id.clone(),
            });
        }
        let position = self
            .items
            .iter()
            .position(|it| it.pending && it.id() == temp_id)
            .ok_or_else(|| CollectionError::UnknownTentative(temp_id.to_owned()))?;
        Ok(self.items.remove(position))
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.aliases.clear();
    }

    fn pending_twin(&self, entity: &Entity) -> Option<usize> {
        self.items.iter().position(|it| {
            it.pending && it.entity.author_id == entity.author_id && it.entity.payload == entity.payload
        })
    }

    fn insert_live(&mut self, item: CollectionItem) -> usize {
        match self.order {
            CollectionOrder::Chronological => {
                self.items.push(item);
                self.items.len() - 1
            }
            CollectionOrder::NewestFirst => {
                self.items.insert(0, item);
                0
            }
        }
    }
}
