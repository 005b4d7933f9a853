//! In-memory entity cache.
//!
//! The cache is written only by the packet dispatcher task (and REST success
//! callbacks running on the same logical path), so writes are never
//! concurrent. Reads from other tasks go through the shared handle and are
//! eventually consistent: ordering between a REST response and a concurrently
//! arriving gateway packet for the same entity is not guaranteed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::model::{
    Channel, Guild, Member, Message, Presence, Relationship, Role, Snowflake, User, VoiceState,
};

/// Entity kind selector for the generic collaborator lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntityKind {
    User,
    Guild,
    Channel,
    Message,
}

#[derive(Debug, Default)]
pub struct CacheInner {
    pub current_user: Option<User>,
    pub users: HashMap<Snowflake, User>,
    pub guilds: HashMap<Snowflake, Guild>,
    pub channels: HashMap<Snowflake, Channel>,
    pub messages: HashMap<Snowflake, Message>,
    pub relationships: HashMap<Snowflake, Relationship>,
    /// Keyed by (guild id, user id).
    pub members: HashMap<(Snowflake, Snowflake), Member>,
    /// Keyed by (guild id, role id).
    pub roles: HashMap<(Snowflake, Snowflake), Role>,
    /// Keyed by (guild id if any, user id). Friend presences have no guild.
    pub presences: HashMap<(Option<Snowflake>, Snowflake), Presence>,
    /// Keyed by (guild id, user id).
    pub voice_states: HashMap<(Snowflake, Snowflake), VoiceState>,
}

/// Shared cache handle. Cloning is cheap.
#[derive(Clone, Debug, Default)]
pub struct Cache {
    inner: Arc<RwLock<CacheInner>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|err| err.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|err| err.into_inner())
    }

    pub fn current_user(&self) -> Option<User> {
        self.read().current_user.clone()
    }

    pub fn user(&self, id: Snowflake) -> Option<User> {
        self.read().users.get(&id).cloned()
    }

    pub fn guild(&self, id: Snowflake) -> Option<Guild> {
        self.read().guilds.get(&id).cloned()
    }

    pub fn channel(&self, id: Snowflake) -> Option<Channel> {
        self.read().channels.get(&id).cloned()
    }

    pub fn message(&self, id: Snowflake) -> Option<Message> {
        self.read().messages.get(&id).cloned()
    }

    pub fn member(&self, guild_id: Snowflake, user_id: Snowflake) -> Option<Member> {
        self.read().members.get(&(guild_id, user_id)).cloned()
    }

    pub fn role(&self, guild_id: Snowflake, role_id: Snowflake) -> Option<Role> {
        self.read().roles.get(&(guild_id, role_id)).cloned()
    }

    pub fn presence(&self, guild_id: Option<Snowflake>, user_id: Snowflake) -> Option<Presence> {
        self.read().presences.get(&(guild_id, user_id)).cloned()
    }

    pub fn voice_state(&self, guild_id: Snowflake, user_id: Snowflake) -> Option<VoiceState> {
        self.read().voice_states.get(&(guild_id, user_id)).cloned()
    }

    pub fn guild_count(&self) -> usize {
        self.read().guilds.len()
    }

    pub fn member_count(&self, guild_id: Snowflake) -> usize {
        self.read()
            .members
            .keys()
            .filter(|(gid, _)| *gid == guild_id)
            .count()
    }

    /// Private (direct and group) channel ids.
    pub fn private_channels(&self) -> Vec<Snowflake> {
        self.read()
            .channels
            .values()
            .filter(|channel| channel.is_private())
            .map(|channel| channel.id)
            .collect()
    }

    /// Generic lookup used by the external manager layer. Returns the entity
    /// serialized as JSON so managers stay decoupled from the model types.
    pub fn get(&self, kind: EntityKind, id: Snowflake) -> Option<Value> {
        let inner = self.read();
        match kind {
            EntityKind::User => inner.users.get(&id).and_then(to_value),
            EntityKind::Guild => inner.guilds.get(&id).and_then(to_value),
            EntityKind::Channel => inner.channels.get(&id).and_then(to_value),
            EntityKind::Message => inner.messages.get(&id).and_then(to_value),
        }
    }
}

fn to_value<T: serde::Serialize>(entity: &T) -> Option<Value> {
    serde_json::to_value(entity).ok()
}
