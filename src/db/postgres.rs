use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::db::manager::Pool;
use crate::db::schema::{
    ghosts, message_mappings, portals, puppets, reaction_mappings, user_logins,
};

use super::{
    DatabaseError,
    models::{GhostRecord, LoginRecord, MessageMapping, PortalRecord, PuppetRecord, ReactionMapping},
};

fn query_error(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ghosts)]
struct DbGhost {
    id: i64,
    matrix_user_id: String,
    mm_username: String,
    mm_user_id: Option<String>,
    metadata: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbGhost> for GhostRecord {
    fn from(value: DbGhost) -> Self {
        Self {
            id: value.id,
            matrix_user_id: value.matrix_user_id,
            mm_username: value.mm_username,
            mm_user_id: value.mm_user_id,
            metadata: value.metadata,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = ghosts)]
struct GhostRow<'a> {
    matrix_user_id: &'a str,
    mm_username: &'a str,
    mm_user_id: Option<&'a str>,
    metadata: &'a str,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = puppets)]
struct DbPuppet {
    id: i64,
    mm_user_id: String,
    matrix_user_id: String,
    display_name: Option<String>,
    avatar_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbPuppet> for PuppetRecord {
    fn from(value: DbPuppet) -> Self {
        Self {
            id: value.id,
            mm_user_id: value.mm_user_id,
            matrix_user_id: value.matrix_user_id,
            display_name: value.display_name,
            avatar_id: value.avatar_id,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = puppets)]
struct NewPuppet<'a> {
    mm_user_id: &'a str,
    matrix_user_id: &'a str,
    display_name: Option<&'a str>,
    avatar_id: Option<&'a str>,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = puppets, treat_none_as_null = true)]
struct UpdatePuppet<'a> {
    matrix_user_id: &'a str,
    display_name: Option<&'a str>,
    avatar_id: Option<&'a str>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = portals)]
struct DbPortal {
    id: i64,
    conversation_id: String,
    receiver: String,
    kind: String,
    matrix_room_id: Option<String>,
    parent_id: Option<String>,
    name: Option<String>,
    topic: Option<String>,
    relay_login_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbPortal> for PortalRecord {
    fn from(value: DbPortal) -> Self {
        Self {
            id: value.id,
            conversation_id: value.conversation_id,
            receiver: value.receiver,
            kind: value.kind,
            matrix_room_id: value.matrix_room_id,
            parent_id: value.parent_id,
            name: value.name,
            topic: value.topic,
            relay_login_id: value.relay_login_id,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = portals)]
struct NewPortal<'a> {
    conversation_id: &'a str,
    receiver: &'a str,
    kind: &'a str,
    matrix_room_id: Option<&'a str>,
    parent_id: Option<&'a str>,
    name: Option<&'a str>,
    topic: Option<&'a str>,
    relay_login_id: Option<&'a str>,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = portals, treat_none_as_null = true)]
struct UpdatePortal<'a> {
    matrix_room_id: Option<&'a str>,
    parent_id: Option<&'a str>,
    name: Option<&'a str>,
    topic: Option<&'a str>,
    relay_login_id: Option<&'a str>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = user_logins)]
struct DbLogin {
    id: String,
    matrix_user_id: String,
    metadata: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbLogin> for LoginRecord {
    fn from(value: DbLogin) -> Self {
        Self {
            id: value.id,
            matrix_user_id: value.matrix_user_id,
            metadata: value.metadata,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = user_logins)]
struct NewLogin<'a> {
    id: &'a str,
    matrix_user_id: &'a str,
    metadata: &'a str,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = message_mappings)]
struct DbMessageMapping {
    id: i64,
    mm_post_id: String,
    part_index: i32,
    mm_channel_id: String,
    matrix_room_id: String,
    matrix_event_id: String,
    created_at: DateTime<Utc>,
}

impl From<DbMessageMapping> for MessageMapping {
    fn from(value: DbMessageMapping) -> Self {
        Self {
            id: value.id,
            mm_post_id: value.mm_post_id,
            part_index: value.part_index,
            mm_channel_id: value.mm_channel_id,
            matrix_room_id: value.matrix_room_id,
            matrix_event_id: value.matrix_event_id,
            created_at: value.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = message_mappings)]
struct NewMessageMapping<'a> {
    mm_post_id: &'a str,
    part_index: i32,
    mm_channel_id: &'a str,
    matrix_room_id: &'a str,
    matrix_event_id: &'a str,
    created_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = reaction_mappings)]
struct DbReactionMapping {
    id: i64,
    mm_post_id: String,
    mm_user_id: String,
    emoji_name: String,
    matrix_room_id: String,
    matrix_event_id: String,
    created_at: DateTime<Utc>,
}

impl From<DbReactionMapping> for ReactionMapping {
    fn from(value: DbReactionMapping) -> Self {
        Self {
            id: value.id,
            mm_post_id: value.mm_post_id,
            mm_user_id: value.mm_user_id,
            emoji_name: value.emoji_name,
            matrix_room_id: value.matrix_room_id,
            matrix_event_id: value.matrix_event_id,
            created_at: value.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = reaction_mappings)]
struct NewReactionMapping<'a> {
    mm_post_id: &'a str,
    mm_user_id: &'a str,
    emoji_name: &'a str,
    matrix_room_id: &'a str,
    matrix_event_id: &'a str,
    created_at: &'a DateTime<Utc>,
}

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct PostgresUserStore {
    pool: Pool,
}

impl PostgresUserStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::UserStore for PostgresUserStore {
    async fn get_ghost(&self, matrix_id: &str) -> Result<Option<GhostRecord>, DatabaseError> {
        let matrix_id = matrix_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::ghosts::dsl::*;
            ghosts
                .filter(matrix_user_id.eq(matrix_id))
                .select(DbGhost::as_select())
                .first::<DbGhost>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn get_ghost_by_mm_id(&self, mm_id: &str) -> Result<Option<GhostRecord>, DatabaseError> {
        let mm_id = mm_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::ghosts::dsl::*;
            ghosts
                .filter(mm_user_id.eq(mm_id))
                .select(DbGhost::as_select())
                .first::<DbGhost>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn upsert_ghost(&self, ghost: &GhostRecord) -> Result<(), DatabaseError> {
        let ghost = ghost.clone();
        with_connection(self.pool.clone(), move |conn| {
            let row = GhostRow {
                matrix_user_id: &ghost.matrix_user_id,
                mm_username: &ghost.mm_username,
                mm_user_id: ghost.mm_user_id.as_deref(),
                metadata: &ghost.metadata,
                created_at: &ghost.created_at,
                updated_at: &ghost.updated_at,
            };
            diesel::insert_into(ghosts::table)
                .values(&row)
                .on_conflict(ghosts::matrix_user_id)
                .do_update()
                .set((
                    ghosts::mm_username.eq(row.mm_username),
                    ghosts::mm_user_id.eq(row.mm_user_id),
                    ghosts::metadata.eq(row.metadata),
                    ghosts::updated_at.eq(row.updated_at),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn get_puppet(&self, mm_id: &str) -> Result<Option<PuppetRecord>, DatabaseError> {
        let mm_id = mm_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::puppets::dsl::*;
            puppets
                .filter(mm_user_id.eq(mm_id))
                .select(DbPuppet::as_select())
                .first::<DbPuppet>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn get_puppet_by_matrix_id(
        &self,
        matrix_id: &str,
    ) -> Result<Option<PuppetRecord>, DatabaseError> {
        let matrix_id = matrix_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::puppets::dsl::*;
            puppets
                .filter(matrix_user_id.eq(matrix_id))
                .select(DbPuppet::as_select())
                .first::<DbPuppet>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn upsert_puppet(&self, puppet: &PuppetRecord) -> Result<(), DatabaseError> {
        let puppet = puppet.clone();
        with_connection(self.pool.clone(), move |conn| {
            let new_puppet = NewPuppet {
                mm_user_id: &puppet.mm_user_id,
                matrix_user_id: &puppet.matrix_user_id,
                display_name: puppet.display_name.as_deref(),
                avatar_id: puppet.avatar_id.as_deref(),
                created_at: &puppet.created_at,
                updated_at: &puppet.updated_at,
            };
            let changes = UpdatePuppet {
                matrix_user_id: &puppet.matrix_user_id,
                display_name: puppet.display_name.as_deref(),
                avatar_id: puppet.avatar_id.as_deref(),
                updated_at: &puppet.updated_at,
            };
            diesel::insert_into(puppets::table)
                .values(&new_puppet)
                .on_conflict(puppets::mm_user_id)
                .do_update()
                .set(&changes)
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }
}

pub struct PostgresRoomStore {
    pool: Pool,
}

impl PostgresRoomStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::RoomStore for PostgresRoomStore {
    async fn get_portal(
        &self,
        conversation: &str,
        receiver_id: &str,
    ) -> Result<Option<PortalRecord>, DatabaseError> {
        let conversation = conversation.to_string();
        let receiver_id = receiver_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::portals::dsl::*;
            portals
                .filter(conversation_id.eq(conversation))
                .filter(receiver.eq(receiver_id))
                .select(DbPortal::as_select())
                .first::<DbPortal>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn get_portal_by_room(
        &self,
        room_id: &str,
    ) -> Result<Option<PortalRecord>, DatabaseError> {
        let room_id = room_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::portals::dsl::*;
            portals
                .filter(matrix_room_id.eq(room_id))
                .select(DbPortal::as_select())
                .first::<DbPortal>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn upsert_portal(&self, portal: &PortalRecord) -> Result<(), DatabaseError> {
        let portal = portal.clone();
        with_connection(self.pool.clone(), move |conn| {
            let existing = portals::table
                .filter(portals::conversation_id.eq(&portal.conversation_id))
                .filter(portals::receiver.eq(&portal.receiver))
                .select(DbPortal::as_select())
                .first::<DbPortal>(conn)
                .optional()
                .map_err(query_error)?;

            match existing {
                Some(existing) if existing.kind != portal.kind => Err(DatabaseError::Conflict(
                    format!(
                        "portal {} is {} and cannot become {}",
                        portal.conversation_id, existing.kind, portal.kind
                    ),
                )),
                Some(existing) => {
                    let changes = UpdatePortal {
                        matrix_room_id: portal.matrix_room_id.as_deref(),
                        parent_id: portal.parent_id.as_deref(),
                        name: portal.name.as_deref(),
                        topic: portal.topic.as_deref(),
                        relay_login_id: portal.relay_login_id.as_deref(),
                        updated_at: &portal.updated_at,
                    };
                    diesel::update(portals::table.filter(portals::id.eq(existing.id)))
                        .set(changes)
                        .execute(conn)
                        .map(|_| ())
                        .map_err(query_error)
                }
                None => {
                    let new_portal = NewPortal {
                        conversation_id: &portal.conversation_id,
                        receiver: &portal.receiver,
                        kind: &portal.kind,
                        matrix_room_id: portal.matrix_room_id.as_deref(),
                        parent_id: portal.parent_id.as_deref(),
                        name: portal.name.as_deref(),
                        topic: portal.topic.as_deref(),
                        relay_login_id: portal.relay_login_id.as_deref(),
                        created_at: &portal.created_at,
                        updated_at: &portal.updated_at,
                    };
                    diesel::insert_into(portals::table)
                        .values(&new_portal)
                        .execute(conn)
                        .map(|_| ())
                        .map_err(query_error)
                }
            }
        })
        .await
    }

    async fn list_portals(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PortalRecord>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::portals::dsl::*;
            portals
                .order(id.desc())
                .limit(limit)
                .offset(offset)
                .select(DbPortal::as_select())
                .load::<DbPortal>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_error)
        })
        .await
    }

    async fn count_portals(&self) -> Result<i64, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            portals::table.count().get_result(conn).map_err(query_error)
        })
        .await
    }
}

pub struct PostgresLoginStore {
    pool: Pool,
}

impl PostgresLoginStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::LoginStore for PostgresLoginStore {
    async fn get_login(&self, login_id: &str) -> Result<Option<LoginRecord>, DatabaseError> {
        let login_id = login_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::user_logins::dsl::*;
            user_logins
                .filter(id.eq(login_id))
                .select(DbLogin::as_select())
                .first::<DbLogin>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn list_logins(&self) -> Result<Vec<LoginRecord>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::user_logins::dsl::*;
            user_logins
                .order(created_at.asc())
                .select(DbLogin::as_select())
                .load::<DbLogin>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_error)
        })
        .await
    }

    async fn upsert_login(&self, login: &LoginRecord) -> Result<(), DatabaseError> {
        let login = login.clone();
        with_connection(self.pool.clone(), move |conn| {
            let new_login = NewLogin {
                id: &login.id,
                matrix_user_id: &login.matrix_user_id,
                metadata: &login.metadata,
                created_at: &login.created_at,
                updated_at: &login.updated_at,
            };
            diesel::insert_into(user_logins::table)
                .values(&new_login)
                .on_conflict(user_logins::id)
                .do_update()
                .set((
                    user_logins::matrix_user_id.eq(&login.matrix_user_id),
                    user_logins::metadata.eq(&login.metadata),
                    user_logins::updated_at.eq(&login.updated_at),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn delete_login(&self, login_id: &str) -> Result<(), DatabaseError> {
        let login_id = login_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            diesel::delete(user_logins::table.filter(user_logins::id.eq(login_id)))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }
}

pub struct PostgresMessageStore {
    pool: Pool,
}

impl PostgresMessageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::MessageStore for PostgresMessageStore {
    async fn get_by_mm_post_id(&self, post_id: &str) -> Result<Vec<MessageMapping>, DatabaseError> {
        let post_id = post_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::message_mappings::dsl::*;
            message_mappings
                .filter(mm_post_id.eq(post_id))
                .order(part_index.asc())
                .select(DbMessageMapping::as_select())
                .load::<DbMessageMapping>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_error)
        })
        .await
    }

    async fn get_by_matrix_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError> {
        let event_id = event_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::message_mappings::dsl::*;
            message_mappings
                .filter(matrix_event_id.eq(event_id))
                .select(DbMessageMapping::as_select())
                .first::<DbMessageMapping>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn upsert_message_mapping(&self, mapping: &MessageMapping) -> Result<(), DatabaseError> {
        let mapping = mapping.clone();
        with_connection(self.pool.clone(), move |conn| {
            let new_mapping = NewMessageMapping {
                mm_post_id: &mapping.mm_post_id,
                part_index: mapping.part_index,
                mm_channel_id: &mapping.mm_channel_id,
                matrix_room_id: &mapping.matrix_room_id,
                matrix_event_id: &mapping.matrix_event_id,
                created_at: &mapping.created_at,
            };
            diesel::insert_into(message_mappings::table)
                .values(&new_mapping)
                .on_conflict((message_mappings::mm_post_id, message_mappings::part_index))
                .do_update()
                .set((
                    message_mappings::matrix_room_id.eq(&mapping.matrix_room_id),
                    message_mappings::matrix_event_id.eq(&mapping.matrix_event_id),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn delete_by_mm_post_id(&self, post_id: &str) -> Result<(), DatabaseError> {
        let post_id = post_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            diesel::delete(message_mappings::table.filter(message_mappings::mm_post_id.eq(post_id)))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn get_reaction(
        &self,
        post_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError> {
        let (post_id, user_id, emoji) = (post_id.to_string(), user_id.to_string(), emoji.to_string());
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::reaction_mappings::dsl::*;
            reaction_mappings
                .filter(mm_post_id.eq(post_id))
                .filter(mm_user_id.eq(user_id))
                .filter(emoji_name.eq(emoji))
                .select(DbReactionMapping::as_select())
                .first::<DbReactionMapping>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn get_reaction_by_matrix_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError> {
        let event_id = event_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::reaction_mappings::dsl::*;
            reaction_mappings
                .filter(matrix_event_id.eq(event_id))
                .select(DbReactionMapping::as_select())
                .first::<DbReactionMapping>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn upsert_reaction(&self, mapping: &ReactionMapping) -> Result<(), DatabaseError> {
        let mapping = mapping.clone();
        with_connection(self.pool.clone(), move |conn| {
            let new_mapping = NewReactionMapping {
                mm_post_id: &mapping.mm_post_id,
                mm_user_id: &mapping.mm_user_id,
                emoji_name: &mapping.emoji_name,
                matrix_room_id: &mapping.matrix_room_id,
                matrix_event_id: &mapping.matrix_event_id,
                created_at: &mapping.created_at,
            };
            diesel::insert_into(reaction_mappings::table)
                .values(&new_mapping)
                .on_conflict((
                    reaction_mappings::mm_post_id,
                    reaction_mappings::mm_user_id,
                    reaction_mappings::emoji_name,
                ))
                .do_update()
                .set((
                    reaction_mappings::matrix_room_id.eq(&mapping.matrix_room_id),
                    reaction_mappings::matrix_event_id.eq(&mapping.matrix_event_id),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn delete_reaction(
        &self,
        post_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), DatabaseError> {
        let (post_id, user_id, emoji) = (post_id.to_string(), user_id.to_string(), emoji.to_string());
        with_connection(self.pool.clone(), move |conn| {
            diesel::delete(
                reaction_mappings::table
                    .filter(reaction_mappings::mm_post_id.eq(post_id))
                    .filter(reaction_mappings::mm_user_id.eq(user_id))
                    .filter(reaction_mappings::emoji_name.eq(emoji)),
            )
            .execute(conn)
            .map(|_| ())
            .map_err(query_error)
        })
        .await
    }
}
