//! Inbound packet interpretation and cache synchronization.
//!
//! [`PacketDispatcher::run`] consumes the gateway notice stream on a single
//! task and is the only writer to the cache, so handlers never race each
//! other. Every dispatch packet is surfaced raw first, then interpreted into a
//! cache mutation plus a typed [`Event`].
//!
//! Readiness is counter-gated: after the initial state payload the dispatcher
//! may still owe per-guild syncs and member-chunk fetches, and `Event::Ready`
//! fires only once both reach zero. Chunk aggregation uses a restartable
//! quiet-period timer rather than a hard deadline.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::cache::{Cache, CacheInner};
use crate::events::Event;
use crate::gateway::socket::{GatewayNotice, GatewaySender};
use crate::model::{
    Channel, Guild, Member, Message, Presence, Relationship, Role, Snowflake, User, VoiceState,
};

/// How long a typing indicator stays live without a refresh.
const TYPING_EXPIRY: Duration = Duration::from_secs(10);
/// Quiet period after the last member chunk before readiness stops waiting.
const CHUNK_QUIET_PERIOD: Duration = Duration::from_secs(5);
/// Members per chunk page; a short page marks a guild's final chunk.
const CHUNK_PAGE: usize = 1000;

/// Voice connection coordinates pushed by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct VoiceEndpoint {
    pub guild_id: Snowflake,
    pub endpoint: String,
    pub token: Option<String>,
}

#[derive(Debug)]
enum TimerEvent {
    TypingExpired {
        channel_id: Snowflake,
        user_id: Snowflake,
        generation: u64,
    },
    ChunkQuietElapsed {
        generation: u64,
    },
}

pub struct PacketDispatcher {
    cache: Cache,
    gateway: GatewaySender,
    events: mpsc::UnboundedSender<Event>,
    bot: bool,

    saw_initial_state: bool,
    ready_sent: bool,
    pending_syncs: usize,
    pending_chunk_guilds: HashSet<Snowflake>,
    chunk_timer_generation: u64,

    typing: HashMap<(Snowflake, Snowflake), u64>,
    next_generation: u64,

    voice_tx: watch::Sender<Option<VoiceEndpoint>>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: Option<mpsc::UnboundedReceiver<TimerEvent>>,
}

impl PacketDispatcher {
    pub fn new(
        cache: Cache,
        gateway: GatewaySender,
        events: mpsc::UnboundedSender<Event>,
        bot: bool,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (voice_tx, _) = watch::channel(None);
        Self {
            cache,
            gateway,
            events,
            bot,
            saw_initial_state: false,
            ready_sent: false,
            pending_syncs: 0,
            pending_chunk_guilds: HashSet::new(),
            chunk_timer_generation: 0,
            typing: HashMap::new(),
            next_generation: 0,
            voice_tx,
            timer_tx,
            timer_rx: Some(timer_rx),
        }
    }

    /// Watch handle for voice endpoint announcements.
    pub fn voice_endpoints(&self) -> watch::Receiver<Option<VoiceEndpoint>> {
        self.voice_tx.subscribe()
    }

    /// Consumes gateway notices until the channel closes.
    pub async fn run(mut self, mut notices: mpsc::UnboundedReceiver<GatewayNotice>) {
        let mut timers = match self.timer_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            tokio::select! {
                notice = notices.recv() => match notice {
                    Some(notice) => self.handle_notice(notice),
                    None => break,
                },
                timer = timers.recv() => {
                    if let Some(timer) = timer {
                        self.handle_timer(timer);
                    }
                }
            }
        }
    }

    fn handle_notice(&mut self, notice: GatewayNotice) {
        match notice {
            GatewayNotice::Dispatch { kind, payload } => {
                self.emit(Event::Raw {
                    kind: kind.clone(),
                    payload: payload.clone(),
                });
                self.handle_dispatch(&kind, payload);
            }
            GatewayNotice::Disconnected => self.emit(Event::Disconnected),
            GatewayNotice::Warn(message) => self.emit(Event::Warn(message)),
            GatewayNotice::Fatal(message) => self.emit(Event::Error(message)),
        }
    }

    fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::TypingExpired {
                channel_id,
                user_id,
                generation,
            } => {
                let key = (channel_id, user_id);
                if self.typing.get(&key) == Some(&generation) {
                    self.typing.remove(&key);
                    self.emit(Event::TypingStop {
                        channel_id,
                        user_id,
                    });
                }
            }
            TimerEvent::ChunkQuietElapsed { generation } => {
                if generation != self.chunk_timer_generation
                    || self.pending_chunk_guilds.is_empty()
                {
                    return;
                }
                self.warn(format!(
                    "gave up waiting for member chunks from {} guild(s)",
                    self.pending_chunk_guilds.len()
                ));
                self.pending_chunk_guilds.clear();
                self.maybe_ready();
            }
        }
    }

    fn handle_dispatch(&mut self, kind: &str, payload: Value) {
        match kind {
            "READY" => self.handle_initial_state(payload),
            "RESUMED" => self.emit(Event::Resumed),
            "GUILD_SYNC" => self.handle_guild_sync(payload),
            "GUILD_MEMBERS_CHUNK" => self.handle_members_chunk(payload),

            "MESSAGE_CREATE" => self.handle_message_create(payload),
            "MESSAGE_UPDATE" => self.handle_message_update(payload),
            "MESSAGE_DELETE" => self.handle_message_delete(payload),
            "MESSAGE_DELETE_BULK" => {
                // Removes the ids, then falls through into the update path.
                let bulk = match self.decode::<BulkDeletePayload>(kind, &payload) {
                    Some(bulk) => bulk,
                    None => return,
                };
                {
                    let mut inner = self.cache.write();
                    for id in &bulk.ids {
                        inner.messages.remove(id);
                    }
                }
                self.emit(Event::MessageDeleteBulk {
                    channel_id: bulk.channel_id,
                    ids: bulk.ids,
                });
                self.handle_message_update(payload);
            }

            "CHANNEL_CREATE" => self.handle_channel_create(payload),
            "CHANNEL_UPDATE" => self.handle_channel_update(payload),
            "CHANNEL_DELETE" => self.handle_channel_delete(payload),

            "GUILD_CREATE" => self.handle_guild_create(payload),
            "GUILD_UPDATE" => self.handle_guild_update(payload),
            "GUILD_DELETE" => self.handle_guild_delete(payload),

            "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => self.handle_role_upsert(kind, payload),
            "GUILD_ROLE_DELETE" => self.handle_role_delete(payload),

            "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" => self.handle_member_upsert(kind, payload),
            "GUILD_MEMBER_REMOVE" => self.handle_member_remove(payload),

            "GUILD_BAN_ADD" | "GUILD_BAN_REMOVE" => self.handle_ban(kind, payload),

            "PRESENCE_UPDATE" => self.handle_presence(payload),
            "USER_UPDATE" => self.handle_user_update(payload),

            "RELATIONSHIP_ADD" => self.handle_relationship_add(payload),
            "RELATIONSHIP_REMOVE" => self.handle_relationship_remove(payload),

            "TYPING_START" => self.handle_typing_start(payload),

            "VOICE_STATE_UPDATE" => self.handle_voice_state(payload),
            "VOICE_SERVER_UPDATE" => self.handle_voice_server(payload),

            other => {
                debug!(event = "dispatch_unhandled", kind = other);
                self.emit(Event::Debug(format!("unhandled dispatch {other}")));
            }
        }
    }

    // ---- initial state and readiness ------------------------------------

    fn handle_initial_state(&mut self, payload: Value) {
        let ready = match self.decode::<InitialStatePayload>("READY", &payload) {
            Some(ready) => ready,
            None => return,
        };

        {
            let mut inner = self.cache.write();
            if let Some(user) = &ready.user {
                inner.current_user = Some(user.clone());
                inner.users.insert(user.id, user.clone());
            }
            for channel in &ready.private_channels {
                inner.channels.insert(channel.id, channel.clone());
            }
            for relationship in &ready.relationships {
                inner.users
                    .insert(relationship.user.id, relationship.user.clone());
                inner
                    .relationships
                    .insert(relationship.id, relationship.clone());
            }
            for guild in &ready.guilds {
                apply_guild_content(&mut inner, guild);
                inner.guilds.insert(guild.id, guild.clone());
            }
        }

        // A fresh identify replays full state; re-gate readiness.
        self.saw_initial_state = true;
        self.ready_sent = false;
        self.pending_syncs = 0;
        self.pending_chunk_guilds.clear();

        for guild in &ready.guilds {
            if guild.unavailable {
                continue;
            }
            if !self.bot && self.gateway.guild_sync(&[guild.id]).is_ok() {
                self.pending_syncs += 1;
            }
            if guild.large && self.gateway.request_guild_members(guild.id).is_ok() {
                self.pending_chunk_guilds.insert(guild.id);
            }
        }

        debug!(
            event = "initial_state",
            guilds = ready.guilds.len(),
            pending_syncs = self.pending_syncs,
            pending_chunks = self.pending_chunk_guilds.len(),
        );

        if !self.pending_chunk_guilds.is_empty() {
            self.arm_chunk_timer();
        }
        self.maybe_ready();
    }

    fn handle_guild_sync(&mut self, payload: Value) {
        if let Some(guild) = self.decode::<Guild>("GUILD_SYNC", &payload) {
            let mut inner = self.cache.write();
            apply_guild_content(&mut inner, &guild);
        }
        self.pending_syncs = self.pending_syncs.saturating_sub(1);
        self.maybe_ready();
    }

    fn handle_members_chunk(&mut self, payload: Value) {
        let chunk = match self.decode::<MembersChunkPayload>("GUILD_MEMBERS_CHUNK", &payload) {
            Some(chunk) => chunk,
            None => return,
        };
        {
            let mut inner = self.cache.write();
            for member in &chunk.members {
                inner.users.insert(member.user.id, member.user.clone());
                inner
                    .members
                    .insert((chunk.guild_id, member.user.id), member.clone());
            }
        }
        // A short page is the guild's final chunk.
        if chunk.members.len() < CHUNK_PAGE {
            self.pending_chunk_guilds.remove(&chunk.guild_id);
        }
        if !self.pending_chunk_guilds.is_empty() {
            self.arm_chunk_timer();
        }
        self.maybe_ready();
    }

    fn arm_chunk_timer(&mut self) {
        self.chunk_timer_generation += 1;
        let generation = self.chunk_timer_generation;
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CHUNK_QUIET_PERIOD).await;
            let _ = tx.send(TimerEvent::ChunkQuietElapsed { generation });
        });
    }

    fn maybe_ready(&mut self) {
        if self.ready_sent
            || !self.saw_initial_state
            || self.pending_syncs > 0
            || !self.pending_chunk_guilds.is_empty()
        {
            return;
        }
        self.ready_sent = true;
        self.emit(Event::Ready);
    }

    // ---- messages -------------------------------------------------------

    fn handle_message_create(&mut self, payload: Value) {
        let message = match self.decode::<Message>("MESSAGE_CREATE", &payload) {
            Some(message) => message,
            None => return,
        };
        {
            let mut inner = self.cache.write();
            if !inner.channels.contains_key(&message.channel_id) {
                drop(inner);
                self.warn(format!(
                    "message {} references uncached channel {}, skipped",
                    message.id, message.channel_id
                ));
                return;
            }
            if let Some(author) = &message.author {
                inner.users.insert(author.id, author.clone());
            }
            // Applying a create twice updates in place, it never duplicates.
            inner.messages.insert(message.id, message.clone());
        }
        self.emit(Event::MessageCreate { message });
    }

    fn handle_message_update(&mut self, payload: Value) {
        let new = match self.decode::<Message>("MESSAGE_UPDATE", &payload) {
            Some(message) => message,
            None => return,
        };
        let old = {
            let mut inner = self.cache.write();
            if !inner.channels.contains_key(&new.channel_id) {
                drop(inner);
                self.warn(format!(
                    "message {} references uncached channel {}, skipped",
                    new.id, new.channel_id
                ));
                return;
            }
            inner.messages.insert(new.id, new.clone())
        };
        self.emit(Event::MessageUpdate { old, new });
    }

    fn handle_message_delete(&mut self, payload: Value) {
        let delete = match self.decode::<MessageDeletePayload>("MESSAGE_DELETE", &payload) {
            Some(delete) => delete,
            None => return,
        };
        let removed = self.cache.write().messages.remove(&delete.id);
        self.emit(Event::MessageDelete {
            id: delete.id,
            channel_id: delete.channel_id,
            message: removed,
        });
    }

    // ---- channels -------------------------------------------------------

    fn handle_channel_create(&mut self, payload: Value) {
        let channel = match self.decode::<Channel>("CHANNEL_CREATE", &payload) {
            Some(channel) => channel,
            None => return,
        };
        if !self.guild_parent_cached(channel.guild_id, "channel", channel.id) {
            return;
        }
        self.cache.write().channels.insert(channel.id, channel.clone());
        self.emit(Event::ChannelCreate { channel });
    }

    fn handle_channel_update(&mut self, payload: Value) {
        let new = match self.decode::<Channel>("CHANNEL_UPDATE", &payload) {
            Some(channel) => channel,
            None => return,
        };
        if !self.guild_parent_cached(new.guild_id, "channel", new.id) {
            return;
        }
        let old = self.cache.write().channels.insert(new.id, new.clone());
        self.emit(Event::ChannelUpdate { old, new });
    }

    fn handle_channel_delete(&mut self, payload: Value) {
        let channel = match self.decode::<Channel>("CHANNEL_DELETE", &payload) {
            Some(channel) => channel,
            None => return,
        };
        {
            let mut inner = self.cache.write();
            inner.channels.remove(&channel.id);
            inner
                .messages
                .retain(|_, message| message.channel_id != channel.id);
        }
        self.emit(Event::ChannelDelete { channel });
    }

    // ---- guilds ---------------------------------------------------------

    fn handle_guild_create(&mut self, payload: Value) {
        let guild = match self.decode::<Guild>("GUILD_CREATE", &payload) {
            Some(guild) => guild,
            None => return,
        };
        {
            let mut inner = self.cache.write();
            apply_guild_content(&mut inner, &guild);
            inner.guilds.insert(guild.id, guild.clone());
        }
        if guild.large
            && !guild.unavailable
            && self.gateway.request_guild_members(guild.id).is_ok()
            && !self.ready_sent
        {
            self.pending_chunk_guilds.insert(guild.id);
            self.arm_chunk_timer();
        }
        self.emit(Event::GuildCreate { guild });
    }

    fn handle_guild_update(&mut self, payload: Value) {
        let new = match self.decode::<Guild>("GUILD_UPDATE", &payload) {
            Some(guild) => guild,
            None => return,
        };
        let old = self.cache.write().guilds.insert(new.id, new.clone());
        self.emit(Event::GuildUpdate { old, new });
    }

    fn handle_guild_delete(&mut self, payload: Value) {
        let guild = match self.decode::<Guild>("GUILD_DELETE", &payload) {
            Some(guild) => guild,
            None => return,
        };
        let removed = {
            let mut inner = self.cache.write();
            let removed = inner.guilds.remove(&guild.id);
            inner.channels.retain(|_, c| c.guild_id != Some(guild.id));
            inner.members.retain(|(gid, _), _| *gid != guild.id);
            inner.roles.retain(|(gid, _), _| *gid != guild.id);
            inner
                .presences
                .retain(|(gid, _), _| *gid != Some(guild.id));
            inner.voice_states.retain(|(gid, _), _| *gid != guild.id);
            removed
        };
        self.emit(Event::GuildDelete {
            id: guild.id,
            guild: removed,
        });
    }

    // ---- roles and members ----------------------------------------------

    fn handle_role_upsert(&mut self, kind: &str, payload: Value) {
        let event = match self.decode::<RolePayload>(kind, &payload) {
            Some(event) => event,
            None => return,
        };
        if !self.guild_parent_cached(Some(event.guild_id), "role", event.role.id) {
            return;
        }
        let old = self
            .cache
            .write()
            .roles
            .insert((event.guild_id, event.role.id), event.role.clone());
        if kind == "GUILD_ROLE_CREATE" {
            self.emit(Event::GuildRoleCreate {
                guild_id: event.guild_id,
                role: event.role,
            });
        } else {
            self.emit(Event::GuildRoleUpdate {
                guild_id: event.guild_id,
                old,
                new: event.role,
            });
        }
    }

    fn handle_role_delete(&mut self, payload: Value) {
        let event = match self.decode::<RoleDeletePayload>("GUILD_ROLE_DELETE", &payload) {
            Some(event) => event,
            None => return,
        };
        let removed = self
            .cache
            .write()
            .roles
            .remove(&(event.guild_id, event.role_id));
        self.emit(Event::GuildRoleDelete {
            guild_id: event.guild_id,
            role: removed,
        });
    }

    fn handle_member_upsert(&mut self, kind: &str, payload: Value) {
        let event = match self.decode::<MemberPayload>(kind, &payload) {
            Some(event) => event,
            None => return,
        };
        if !self.guild_parent_cached(Some(event.guild_id), "member", event.member.user.id) {
            return;
        }
        let old = {
            let mut inner = self.cache.write();
            inner
                .users
                .insert(event.member.user.id, event.member.user.clone());
            inner
                .members
                .insert((event.guild_id, event.member.user.id), event.member.clone())
        };
        if kind == "GUILD_MEMBER_ADD" {
            self.emit(Event::GuildMemberAdd {
                guild_id: event.guild_id,
                member: event.member,
            });
        } else {
            self.emit(Event::GuildMemberUpdate {
                guild_id: event.guild_id,
                old,
                new: event.member,
            });
        }
    }

    fn handle_member_remove(&mut self, payload: Value) {
        let event = match self.decode::<UserPayload>("GUILD_MEMBER_REMOVE", &payload) {
            Some(event) => event,
            None => return,
        };
        let removed = self
            .cache
            .write()
            .members
            .remove(&(event.guild_id, event.user.id));
        self.emit(Event::GuildMemberRemove {
            guild_id: event.guild_id,
            user_id: event.user.id,
            member: removed,
        });
    }

    fn handle_ban(&mut self, kind: &str, payload: Value) {
        let event = match self.decode::<UserPayload>(kind, &payload) {
            Some(event) => event,
            None => return,
        };
        if kind == "GUILD_BAN_ADD" {
            self.emit(Event::GuildBanAdd {
                guild_id: event.guild_id,
                user: event.user,
            });
        } else {
            self.emit(Event::GuildBanRemove {
                guild_id: event.guild_id,
                user: event.user,
            });
        }
    }

    // ---- presence, users, relationships ---------------------------------

    fn handle_presence(&mut self, payload: Value) {
        let event = match self.decode::<PresencePayload>("PRESENCE_UPDATE", &payload) {
            Some(event) => event,
            None => return,
        };
        if let Some(guild_id) = event.guild_id {
            if !self.guild_parent_cached(Some(guild_id), "presence", event.presence.user.id) {
                return;
            }
        }
        let old = self
            .cache
            .write()
            .presences
            .insert((event.guild_id, event.presence.user.id), event.presence.clone());
        self.emit(Event::PresenceUpdate {
            guild_id: event.guild_id,
            old,
            new: event.presence,
        });
    }

    fn handle_user_update(&mut self, payload: Value) {
        let new = match self.decode::<User>("USER_UPDATE", &payload) {
            Some(user) => user,
            None => return,
        };
        let old = {
            let mut inner = self.cache.write();
            let old = inner.current_user.replace(new.clone());
            inner.users.insert(new.id, new.clone());
            old
        };
        self.emit(Event::UserUpdate { old, new });
    }

    fn handle_relationship_add(&mut self, payload: Value) {
        if let Some(relationship) = self.decode::<Relationship>("RELATIONSHIP_ADD", &payload) {
            let mut inner = self.cache.write();
            inner
                .users
                .insert(relationship.user.id, relationship.user.clone());
            inner.relationships.insert(relationship.id, relationship);
        }
    }

    fn handle_relationship_remove(&mut self, payload: Value) {
        if let Some(relationship) = self.decode::<Relationship>("RELATIONSHIP_REMOVE", &payload) {
            self.cache.write().relationships.remove(&relationship.id);
        }
    }

    // ---- typing ---------------------------------------------------------

    fn handle_typing_start(&mut self, payload: Value) {
        let typing = match self.decode::<TypingPayload>("TYPING_START", &payload) {
            Some(typing) => typing,
            None => return,
        };
        self.emit(Event::TypingStart {
            channel_id: typing.channel_id,
            user_id: typing.user_id,
        });

        // The platform never sends a stop packet; a local expiry timer
        // synthesizes it. A repeat start re-arms the timer.
        self.next_generation += 1;
        let generation = self.next_generation;
        self.typing
            .insert((typing.channel_id, typing.user_id), generation);
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TYPING_EXPIRY).await;
            let _ = tx.send(TimerEvent::TypingExpired {
                channel_id: typing.channel_id,
                user_id: typing.user_id,
                generation,
            });
        });
    }

    // ---- voice ----------------------------------------------------------

    fn handle_voice_state(&mut self, payload: Value) {
        let event = match self.decode::<VoiceStatePayload>("VOICE_STATE_UPDATE", &payload) {
            Some(event) => event,
            None => return,
        };
        let old = match event.guild_id {
            Some(guild_id) => {
                let key = (guild_id, event.state.user_id);
                let mut inner = self.cache.write();
                if event.state.channel_id.is_some() {
                    inner.voice_states.insert(key, event.state.clone())
                } else {
                    inner.voice_states.remove(&key)
                }
            }
            // Private calls carry no guild; nothing to key the cache on.
            None => None,
        };
        self.emit(Event::VoiceStateUpdate {
            guild_id: event.guild_id,
            old,
            new: event.state,
        });
    }

    fn handle_voice_server(&mut self, payload: Value) {
        let event = match self.decode::<VoiceServerPayload>("VOICE_SERVER_UPDATE", &payload) {
            Some(event) => event,
            None => return,
        };
        if let Some(endpoint) = event.endpoint.clone() {
            let _ = self.voice_tx.send(Some(VoiceEndpoint {
                guild_id: event.guild_id,
                endpoint,
                token: event.token.clone(),
            }));
        }
        self.emit(Event::VoiceServerUpdate {
            guild_id: event.guild_id,
            endpoint: event.endpoint,
            token: event.token,
        });
    }

    // ---- helpers --------------------------------------------------------

    /// Checks the parent guild is cached before mutating a child entity.
    fn guild_parent_cached(
        &self,
        guild_id: Option<Snowflake>,
        entity: &str,
        id: Snowflake,
    ) -> bool {
        let Some(guild_id) = guild_id else {
            return true;
        };
        let cached = self.cache.guild(guild_id).is_some();
        if !cached {
            self.warn(format!(
                "{entity} {id} references uncached guild {guild_id}, skipped"
            ));
        }
        cached
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, kind: &str, payload: &Value) -> Option<T> {
        match serde_json::from_value(payload.clone()) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(event = "dispatch_decode_failed", kind, error = %err);
                self.warn(format!("dropped malformed {kind} payload: {err}"));
                None
            }
        }
    }

    fn warn(&self, message: String) {
        warn!(event = "dispatch_warn", message = %message);
        self.emit(Event::Warn(message));
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

/// Distributes a guild payload's nested collections into the per-kind maps.
fn apply_guild_content(inner: &mut CacheInner, guild: &Guild) {
    for channel in &guild.channels {
        let mut channel = channel.clone();
        channel.guild_id = Some(guild.id);
        inner.channels.insert(channel.id, channel);
    }
    for member in &guild.members {
        inner.users.insert(member.user.id, member.user.clone());
        inner
            .members
            .insert((guild.id, member.user.id), member.clone());
    }
    for role in &guild.roles {
        inner.roles.insert((guild.id, role.id), role.clone());
    }
    for presence in &guild.presences {
        inner
            .presences
            .insert((Some(guild.id), presence.user.id), presence.clone());
    }
    for state in &guild.voice_states {
        inner
            .voice_states
            .insert((guild.id, state.user_id), state.clone());
    }
}

// ---- payload shapes -----------------------------------------------------

#[derive(Deserialize)]
struct InitialStatePayload {
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    guilds: Vec<Guild>,
    #[serde(default)]
    private_channels: Vec<Channel>,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Deserialize)]
struct MembersChunkPayload {
    guild_id: Snowflake,
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Deserialize)]
struct MessageDeletePayload {
    id: Snowflake,
    #[serde(default)]
    channel_id: Option<Snowflake>,
}

#[derive(Deserialize)]
struct BulkDeletePayload {
    ids: Vec<Snowflake>,
    #[serde(default)]
    channel_id: Option<Snowflake>,
}

#[derive(Deserialize)]
struct RolePayload {
    guild_id: Snowflake,
    role: Role,
}

#[derive(Deserialize)]
struct RoleDeletePayload {
    guild_id: Snowflake,
    role_id: Snowflake,
}

#[derive(Deserialize)]
struct MemberPayload {
    guild_id: Snowflake,
    #[serde(flatten)]
    member: Member,
}

#[derive(Deserialize)]
struct UserPayload {
    guild_id: Snowflake,
    user: User,
}

#[derive(Deserialize)]
struct PresencePayload {
    #[serde(default)]
    guild_id: Option<Snowflake>,
    #[serde(flatten)]
    presence: Presence,
}

#[derive(Deserialize)]
struct TypingPayload {
    channel_id: Snowflake,
    user_id: Snowflake,
}

#[derive(Deserialize)]
struct VoiceStatePayload {
    #[serde(default)]
    guild_id: Option<Snowflake>,
    #[serde(flatten)]
    state: VoiceState,
}

#[derive(Deserialize)]
struct VoiceServerPayload {
    guild_id: Snowflake,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::Instant;

    use crate::gateway::socket::GatewayCommand;
    use crate::gateway::proto::{OP_GUILD_SYNC, OP_REQUEST_GUILD_MEMBERS};

    use super::*;

    struct Harness {
        notices: mpsc::UnboundedSender<GatewayNotice>,
        events: mpsc::UnboundedReceiver<Event>,
        commands: mpsc::UnboundedReceiver<GatewayCommand>,
        cache: Cache,
        voice: watch::Receiver<Option<VoiceEndpoint>>,
    }

    impl Harness {
        fn spawn(bot: bool) -> Self {
            let cache = Cache::new();
            let (gateway, commands) = GatewaySender::detached();
            let (event_tx, events) = mpsc::unbounded_channel();
            let dispatcher = PacketDispatcher::new(cache.clone(), gateway, event_tx, bot);
            let voice = dispatcher.voice_endpoints();
            let (notice_tx, notice_rx) = mpsc::unbounded_channel();
            tokio::spawn(dispatcher.run(notice_rx));
            Self {
                notices: notice_tx,
                events,
                commands,
                cache,
                voice,
            }
        }

        fn dispatch(&self, kind: &str, payload: Value) {
            self.notices
                .send(GatewayNotice::Dispatch {
                    kind: kind.to_string(),
                    payload,
                })
                .expect("dispatcher alive");
        }

        /// Next event matching the predicate, skipping everything else.
        async fn expect<F>(&mut self, what: &str, mut pred: F) -> Event
        where
            F: FnMut(&Event) -> bool,
        {
            let deadline = Duration::from_secs(30);
            tokio::time::timeout(deadline, async {
                loop {
                    let event = self.events.recv().await.expect("events open");
                    if pred(&event) {
                        return event;
                    }
                }
            })
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        }

        async fn expect_no_ready(&mut self, within: Duration) {
            let outcome = tokio::time::timeout(within, async {
                loop {
                    let event = self.events.recv().await.expect("events open");
                    if matches!(event, Event::Ready) {
                        return;
                    }
                }
            })
            .await;
            assert!(outcome.is_err(), "ready fired too early");
        }

        fn sent_command_ops(&mut self) -> Vec<u8> {
            let mut ops = Vec::new();
            loop {
                match self.commands.try_recv() {
                    Ok(GatewayCommand::Send(packet)) => ops.push(packet.op),
                    Ok(GatewayCommand::Shutdown) => {}
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => return ops,
                }
            }
        }
    }

    fn private_channel(id: u64) -> Value {
        json!({ "id": id.to_string(), "type": 1 })
    }

    fn message(id: u64, channel_id: u64, content: &str) -> Value {
        json!({
            "id": id.to_string(),
            "channel_id": channel_id.to_string(),
            "content": content,
            "author": { "id": "900", "username": "ana" },
        })
    }

    #[tokio::test(start_paused = true)]
    async fn ready_waits_for_every_guild_sync() {
        let mut harness = Harness::spawn(false);
        harness.dispatch(
            "READY",
            json!({
                "user": { "id": "1", "username": "me" },
                "guilds": [{ "id": "10" }, { "id": "20" }],
            }),
        );
        harness.expect_no_ready(Duration::from_secs(1)).await;

        tokio::task::yield_now().await;
        assert_eq!(harness.sent_command_ops(), vec![OP_GUILD_SYNC, OP_GUILD_SYNC]);

        harness.dispatch("GUILD_SYNC", json!({ "id": "10" }));
        harness.expect_no_ready(Duration::from_secs(1)).await;

        harness.dispatch("GUILD_SYNC", json!({ "id": "20" }));
        harness
            .expect("ready", |event| matches!(event, Event::Ready))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn bot_sessions_skip_guild_syncs() {
        let mut harness = Harness::spawn(true);
        harness.dispatch(
            "READY",
            json!({
                "user": { "id": "1", "username": "bot", "bot": true },
                "guilds": [{ "id": "10" }],
            }),
        );
        harness
            .expect("ready", |event| matches!(event, Event::Ready))
            .await;
        assert!(harness.sent_command_ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_quiet_period_unblocks_readiness() {
        let mut harness = Harness::spawn(true);
        let start = Instant::now();
        harness.dispatch(
            "READY",
            json!({
                "user": { "id": "1", "username": "bot", "bot": true },
                "guilds": [{ "id": "10", "large": true }],
            }),
        );

        tokio::task::yield_now().await;
        assert_eq!(harness.sent_command_ops(), vec![OP_REQUEST_GUILD_MEMBERS]);

        // No chunk ever arrives; the quiet period gives up with a warning.
        harness
            .expect("chunk warn", |event| matches!(event, Event::Warn(_)))
            .await;
        harness
            .expect("ready", |event| matches!(event, Event::Ready))
            .await;
        assert!(Instant::now().duration_since(start) >= CHUNK_QUIET_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn final_chunk_completes_readiness() {
        let mut harness = Harness::spawn(true);
        harness.dispatch(
            "READY",
            json!({
                "user": { "id": "1", "username": "bot", "bot": true },
                "guilds": [{ "id": "10", "large": true }],
            }),
        );
        harness.dispatch(
            "GUILD_MEMBERS_CHUNK",
            json!({
                "guild_id": "10",
                "members": [{ "user": { "id": "5", "username": "mia" } }],
            }),
        );
        harness
            .expect("ready", |event| matches!(event, Event::Ready))
            .await;
        assert!(harness.cache.member(Snowflake(10), Snowflake(5)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_create_updates_in_place() {
        let mut harness = Harness::spawn(true);
        harness.dispatch("CHANNEL_CREATE", private_channel(5));
        harness.dispatch("MESSAGE_CREATE", message(9, 5, "first"));
        harness.dispatch("MESSAGE_CREATE", message(9, 5, "second"));

        harness
            .expect("second create", |event| {
                matches!(
                    event,
                    Event::MessageCreate { message } if message.content.as_deref() == Some("second")
                )
            })
            .await;

        let cached = harness.cache.message(Snowflake(9)).expect("cached message");
        assert_eq!(cached.content.as_deref(), Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn uncached_channel_parent_is_warned_and_skipped() {
        let mut harness = Harness::spawn(true);
        harness.dispatch("MESSAGE_CREATE", message(9, 99, "orphan"));

        harness
            .expect("warn", |event| {
                matches!(event, Event::Warn(text) if text.contains("uncached channel"))
            })
            .await;
        assert!(harness.cache.message(Snowflake(9)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_delete_removes_ids_then_runs_the_update_path() {
        let mut harness = Harness::spawn(true);
        harness.dispatch("CHANNEL_CREATE", private_channel(5));
        harness.dispatch("MESSAGE_CREATE", message(9, 5, "a"));
        harness.dispatch("MESSAGE_CREATE", message(10, 5, "b"));
        harness.dispatch(
            "MESSAGE_DELETE_BULK",
            json!({ "channel_id": "5", "ids": ["9", "10"] }),
        );

        let event = harness
            .expect("bulk delete", |event| {
                matches!(event, Event::MessageDeleteBulk { .. })
            })
            .await;
        match event {
            Event::MessageDeleteBulk { channel_id, ids } => {
                assert_eq!(channel_id, Some(Snowflake(5)));
                assert_eq!(ids, vec![Snowflake(9), Snowflake(10)]);
            }
            _ => unreachable!(),
        }

        // The bulk payload then runs through the update path, where it fails
        // to decode as a message and is warn-dropped.
        harness
            .expect("fallthrough warn", |event| {
                matches!(event, Event::Warn(text) if text.contains("MESSAGE_UPDATE"))
            })
            .await;

        assert!(harness.cache.message(Snowflake(9)).is_none());
        assert!(harness.cache.message(Snowflake(10)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_expires_into_a_synthesized_stop() {
        let mut harness = Harness::spawn(true);
        let start = Instant::now();
        harness.dispatch("TYPING_START", json!({ "channel_id": "5", "user_id": "7" }));

        harness
            .expect("typing start", |event| {
                matches!(event, Event::TypingStart { .. })
            })
            .await;
        let stop = harness
            .expect("typing stop", |event| {
                matches!(event, Event::TypingStop { .. })
            })
            .await;
        match stop {
            Event::TypingStop {
                channel_id,
                user_id,
            } => {
                assert_eq!(channel_id, Snowflake(5));
                assert_eq!(user_id, Snowflake(7));
            }
            _ => unreachable!(),
        }
        assert!(Instant::now().duration_since(start) >= TYPING_EXPIRY);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_typing_restarts_the_expiry() {
        let mut harness = Harness::spawn(true);
        let start = Instant::now();
        let payload = json!({ "channel_id": "5", "user_id": "7" });
        harness.dispatch("TYPING_START", payload.clone());
        harness
            .expect("first start", |event| {
                matches!(event, Event::TypingStart { .. })
            })
            .await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        harness.dispatch("TYPING_START", payload);
        harness
            .expect("second start", |event| {
                matches!(event, Event::TypingStart { .. })
            })
            .await;

        harness
            .expect("typing stop", |event| {
                matches!(event, Event::TypingStop { .. })
            })
            .await;
        // The refresh pushed expiry past the original deadline.
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn voice_server_update_publishes_the_endpoint() {
        let mut harness = Harness::spawn(true);
        harness.dispatch(
            "VOICE_SERVER_UPDATE",
            json!({ "guild_id": "10", "endpoint": "voice.quill.chat:443", "token": "vt" }),
        );
        harness
            .expect("voice server", |event| {
                matches!(event, Event::VoiceServerUpdate { .. })
            })
            .await;

        let endpoint = harness.voice.borrow().clone().expect("endpoint published");
        assert_eq!(endpoint.guild_id, Snowflake(10));
        assert_eq!(endpoint.endpoint, "voice.quill.chat:443");
        assert_eq!(endpoint.token.as_deref(), Some("vt"));
    }

    #[tokio::test(start_paused = true)]
    async fn guild_delete_drops_children() {
        let mut harness = Harness::spawn(true);
        harness.dispatch(
            "GUILD_CREATE",
            json!({
                "id": "10",
                "name": "den",
                "channels": [{ "id": "5", "type": 0 }],
                "members": [{ "user": { "id": "7", "username": "kit" } }],
                "roles": [{ "id": "3", "name": "mod" }],
            }),
        );
        harness
            .expect("guild create", |event| {
                matches!(event, Event::GuildCreate { .. })
            })
            .await;
        assert!(harness.cache.channel(Snowflake(5)).is_some());

        harness.dispatch("GUILD_DELETE", json!({ "id": "10" }));
        harness
            .expect("guild delete", |event| {
                matches!(event, Event::GuildDelete { .. })
            })
            .await;

        assert!(harness.cache.guild(Snowflake(10)).is_none());
        assert!(harness.cache.channel(Snowflake(5)).is_none());
        assert!(harness.cache.member(Snowflake(10), Snowflake(7)).is_none());
        assert!(harness.cache.role(Snowflake(10), Snowflake(3)).is_none());
    }
}
