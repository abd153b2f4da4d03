//! In-memory repository implementations with the same conditional-update
//! semantics as the SQL ones, for fast orchestrator tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use leadflow_core::domain::lead::{LeadConversation, LeadId, LeadState};
use leadflow_core::domain::message::{
    DeliveryStatus, IdempotencyKey, MessageId, MessageTransition, ScheduledMessage,
};

use super::{
    ConversationRepository, EventDedupRepository, MessageRepository, RepositoryError,
};

#[derive(Default)]
pub struct InMemoryConversationRepository {
    conversations: RwLock<HashMap<String, LeadConversation>>,
}

#[async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find(&self, id: &LeadId) -> Result<Option<LeadConversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(&id.0).cloned())
    }

    async fn insert(&self, conversation: LeadConversation) -> Result<bool, RepositoryError> {
        let mut conversations = self.conversations.write().await;
        if conversations.contains_key(&conversation.lead_id.0) {
            return Ok(false);
        }
        conversations.insert(conversation.lead_id.0.clone(), conversation);
        Ok(true)
    }

    async fn update(
        &self,
        conversation: LeadConversation,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut conversations = self.conversations.write().await;
        match conversations.get(&conversation.lead_id.0) {
            Some(stored) if stored.version == expected_version => {
                conversations.insert(conversation.lead_id.0.clone(), conversation);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_nurture_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        let mut due: Vec<LeadConversation> = conversations
            .values()
            .filter(|conversation| {
                conversation.state == LeadState::Nurture
                    && conversation.followup_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|conversation| conversation.followup_at);
        Ok(due)
    }

    async fn list_initial_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        let mut old: Vec<LeadConversation> = conversations
            .values()
            .filter(|conversation| {
                conversation.state == LeadState::Initial && conversation.created_at <= cutoff
            })
            .cloned()
            .collect();
        old.sort_by_key(|conversation| conversation.created_at);
        Ok(old)
    }

    async fn list_stale_handoffs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        let mut stale: Vec<LeadConversation> = conversations
            .values()
            .filter(|conversation| {
                conversation.state == LeadState::HandedOff
                    && conversation.stale_alerted_at.is_none()
                    && conversation.updated_at <= cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|conversation| conversation.updated_at);
        Ok(stale)
    }

    async fn list_awaiting_reply(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        let mut waiting: Vec<LeadConversation> = conversations
            .values()
            .filter(|conversation| {
                matches!(conversation.state, LeadState::Qualifying | LeadState::Scheduling)
                    && conversation.last_outbound_at.is_some_and(|sent| {
                        sent <= cutoff
                            && conversation
                                .last_inbound_at
                                .map_or(true, |replied| replied < sent)
                    })
            })
            .cloned()
            .collect();
        waiting.sort_by_key(|conversation| conversation.last_outbound_at);
        Ok(waiting)
    }
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: RwLock<HashMap<String, ScheduledMessage>>,
    transitions: RwLock<Vec<MessageTransition>>,
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn find(&self, id: &MessageId) -> Result<Option<ScheduledMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.get(&id.0).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ScheduledMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.values().find(|message| message.idempotency_key == *key).cloned())
    }

    async fn insert_if_absent(
        &self,
        message: ScheduledMessage,
    ) -> Result<MessageId, RepositoryError> {
        let mut messages = self.messages.write().await;
        if let Some(existing) =
            messages.values().find(|stored| stored.idempotency_key == message.idempotency_key)
        {
            return Ok(existing.id.clone());
        }
        let id = message.id.clone();
        messages.insert(message.id.0.clone(), message);
        Ok(id)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        let sending_leads: HashSet<&str> = messages
            .values()
            .filter(|message| message.status == DeliveryStatus::Sending)
            .map(|message| message.lead_id.0.as_str())
            .collect();

        let mut due: Vec<ScheduledMessage> = messages
            .values()
            .filter(|message| {
                message.status == DeliveryStatus::Pending
                    && message.earliest_send_at <= now
                    && !sending_leads.contains(message.lead_id.0.as_str())
            })
            .cloned()
            .collect();
        due.sort_by_key(|message| (message.earliest_send_at, message.created_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        let mut expired: Vec<ScheduledMessage> = messages
            .values()
            .filter(|message| {
                message.status == DeliveryStatus::Sending
                    && message.lease_expires_at.is_some_and(|expires| expires <= now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|message| message.lease_expires_at);
        Ok(expired)
    }

    async fn list_open_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        let mut open: Vec<ScheduledMessage> = messages
            .values()
            .filter(|message| {
                message.lead_id == *lead_id
                    && matches!(message.status, DeliveryStatus::Pending | DeliveryStatus::Sending)
            })
            .cloned()
            .collect();
        open.sort_by_key(|message| message.created_at);
        Ok(open)
    }

    async fn update(
        &self,
        message: ScheduledMessage,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut messages = self.messages.write().await;
        match messages.get(&message.id.0) {
            Some(stored) if stored.version == expected_version => {
                messages.insert(message.id.0.clone(), message);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_sending(
        &self,
        message: ScheduledMessage,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut messages = self.messages.write().await;

        let sibling_sending = messages.values().any(|stored| {
            stored.lead_id == message.lead_id
                && stored.status == DeliveryStatus::Sending
                && stored.id != message.id
        });
        if sibling_sending {
            return Ok(false);
        }

        match messages.get(&message.id.0) {
            Some(stored)
                if stored.version == expected_version
                    && stored.status == DeliveryStatus::Pending =>
            {
                messages.insert(message.id.0.clone(), message);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_open_for_lead(
        &self,
        lead_id: &LeadId,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut messages = self.messages.write().await;
        let mut cancelled = 0u64;
        for message in messages.values_mut() {
            if message.lead_id == *lead_id
                && matches!(message.status, DeliveryStatus::Pending | DeliveryStatus::Sending)
            {
                message.status = DeliveryStatus::Cancelled;
                message.lease_expires_at = None;
                message.claimed_by = None;
                message.version += 1;
                message.updated_at = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn has_any_for_lead(&self, lead_id: &LeadId) -> Result<bool, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.values().any(|message| message.lead_id == *lead_id))
    }

    async fn append_transition(
        &self,
        transition: MessageTransition,
    ) -> Result<(), RepositoryError> {
        let mut transitions = self.transitions.write().await;
        transitions.push(transition);
        Ok(())
    }

    async fn list_transitions(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<MessageTransition>, RepositoryError> {
        let transitions = self.transitions.read().await;
        let mut matching: Vec<MessageTransition> = transitions
            .iter()
            .filter(|transition| transition.message_id == *message_id)
            .cloned()
            .collect();
        matching.sort_by_key(|transition| transition.version);
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryEventDedupRepository {
    seen: RwLock<HashSet<(String, String)>>,
}

#[async_trait]
impl EventDedupRepository for InMemoryEventDedupRepository {
    async fn record(
        &self,
        lead_id: &LeadId,
        external_id: &str,
        _now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut seen = self.seen.write().await;
        Ok(seen.insert((lead_id.0.clone(), external_id.to_string())))
    }
}
