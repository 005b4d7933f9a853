//! Client-level events emitted by the packet dispatcher.
//!
//! Update and delete variants carry the old/new entity pair where the cache
//! held a prior copy. `Warn` and `Debug` surface non-fatal anomalies so the
//! host opts in to visibility instead of catching thrown errors.

use serde_json::Value;

use crate::model::{
    Channel, Guild, Member, Message, Presence, Role, Snowflake, User, VoiceState,
};

#[derive(Clone, Debug)]
pub enum Event {
    /// Initial state replay completed, including pending guild syncs and
    /// member-chunk fetches. The client is fully ready.
    Ready,
    /// An existing session was resumed without full state replay.
    Resumed,
    /// The gateway connection dropped. A reconnect may follow unless the
    /// client logged out or hit a fatal close code.
    Disconnected,
    /// Non-fatal anomaly, e.g. a dropped malformed packet or an entity whose
    /// parent is not cached.
    Warn(String),
    /// Diagnostic chatter.
    Debug(String),
    /// Unrecoverable failure notice, e.g. a fatal gateway close code.
    Error(String),
    /// Raw decoded dispatch packet, before any cache interpretation.
    Raw { kind: String, payload: Value },

    MessageCreate {
        message: Message,
    },
    MessageUpdate {
        old: Option<Message>,
        new: Message,
    },
    MessageDelete {
        id: Snowflake,
        channel_id: Option<Snowflake>,
        message: Option<Message>,
    },
    MessageDeleteBulk {
        channel_id: Option<Snowflake>,
        ids: Vec<Snowflake>,
    },

    ChannelCreate {
        channel: Channel,
    },
    ChannelUpdate {
        old: Option<Channel>,
        new: Channel,
    },
    ChannelDelete {
        channel: Channel,
    },

    GuildCreate {
        guild: Guild,
    },
    GuildUpdate {
        old: Option<Guild>,
        new: Guild,
    },
    GuildDelete {
        id: Snowflake,
        guild: Option<Guild>,
    },

    GuildRoleCreate {
        guild_id: Snowflake,
        role: Role,
    },
    GuildRoleUpdate {
        guild_id: Snowflake,
        old: Option<Role>,
        new: Role,
    },
    GuildRoleDelete {
        guild_id: Snowflake,
        role: Option<Role>,
    },

    GuildMemberAdd {
        guild_id: Snowflake,
        member: Member,
    },
    GuildMemberUpdate {
        guild_id: Snowflake,
        old: Option<Member>,
        new: Member,
    },
    GuildMemberRemove {
        guild_id: Snowflake,
        user_id: Snowflake,
        member: Option<Member>,
    },

    GuildBanAdd {
        guild_id: Snowflake,
        user: User,
    },
    GuildBanRemove {
        guild_id: Snowflake,
        user: User,
    },

    PresenceUpdate {
        guild_id: Option<Snowflake>,
        old: Option<Presence>,
        new: Presence,
    },
    UserUpdate {
        old: Option<User>,
        new: User,
    },

    /// A user started typing in a channel.
    TypingStart {
        channel_id: Snowflake,
        user_id: Snowflake,
    },
    /// Synthesized when the local typing expiry elapses; the platform sends
    /// no explicit stop packet.
    TypingStop {
        channel_id: Snowflake,
        user_id: Snowflake,
    },

    VoiceStateUpdate {
        guild_id: Option<Snowflake>,
        old: Option<VoiceState>,
        new: VoiceState,
    },
    VoiceServerUpdate {
        guild_id: Snowflake,
        endpoint: Option<String>,
        token: Option<String>,
    },
}

impl Event {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Ready => "ready",
            Event::Resumed => "resumed",
            Event::Disconnected => "disconnected",
            Event::Warn(_) => "warn",
            Event::Debug(_) => "debug",
            Event::Error(_) => "error",
            Event::Raw { .. } => "raw",
            Event::MessageCreate { .. } => "message_create",
            Event::MessageUpdate { .. } => "message_update",
            Event::MessageDelete { .. } => "message_delete",
            Event::MessageDeleteBulk { .. } => "message_delete_bulk",
            Event::ChannelCreate { .. } => "channel_create",
            Event::ChannelUpdate { .. } => "channel_update",
            Event::ChannelDelete { .. } => "channel_delete",
            Event::GuildCreate { .. } => "guild_create",
            Event::GuildUpdate { .. } => "guild_update",
            Event::GuildDelete { .. } => "guild_delete",
            Event::GuildRoleCreate { .. } => "guild_role_create",
            Event::GuildRoleUpdate { .. } => "guild_role_update",
            Event::GuildRoleDelete { .. } => "guild_role_delete",
            Event::GuildMemberAdd { .. } => "guild_member_add",
            Event::GuildMemberUpdate { .. } => "guild_member_update",
            Event::GuildMemberRemove { .. } => "guild_member_remove",
            Event::GuildBanAdd { .. } => "guild_ban_add",
            Event::GuildBanRemove { .. } => "guild_ban_remove",
            Event::PresenceUpdate { .. } => "presence_update",
            Event::UserUpdate { .. } => "user_update",
            Event::TypingStart { .. } => "typing_start",
            Event::TypingStop { .. } => "typing_stop",
            Event::VoiceStateUpdate { .. } => "voice_state_update",
            Event::VoiceServerUpdate { .. } => "voice_server_update",
        }
    }
}
