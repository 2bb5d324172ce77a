use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use crate::db::schema_sqlite::{
    ghosts, message_mappings, portals, puppets, reaction_mappings, user_logins,
};

use super::{
    DatabaseError,
    models::{GhostRecord, LoginRecord, MessageMapping, PortalRecord, PuppetRecord, ReactionMapping},
};

// SQLite has no native timestamp type; datetimes are stored as RFC 3339 text.
fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

fn query_error(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ghosts)]
struct DbGhost {
    id: i32,
    matrix_user_id: String,
    mm_username: String,
    mm_user_id: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl DbGhost {
    fn to_record(&self) -> Result<GhostRecord, DatabaseError> {
        Ok(GhostRecord {
            id: self.id as i64,
            matrix_user_id: self.matrix_user_id.clone(),
            mm_username: self.mm_username.clone(),
            mm_user_id: self.mm_user_id.clone(),
            metadata: self.metadata.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = ghosts)]
struct NewGhost<'a> {
    matrix_user_id: &'a str,
    mm_username: &'a str,
    mm_user_id: Option<&'a str>,
    metadata: &'a str,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = puppets)]
struct DbPuppet {
    id: i32,
    mm_user_id: String,
    matrix_user_id: String,
    display_name: Option<String>,
    avatar_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DbPuppet {
    fn to_record(&self) -> Result<PuppetRecord, DatabaseError> {
        Ok(PuppetRecord {
            id: self.id as i64,
            mm_user_id: self.mm_user_id.clone(),
            matrix_user_id: self.matrix_user_id.clone(),
            display_name: self.display_name.clone(),
            avatar_id: self.avatar_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = puppets)]
struct NewPuppet<'a> {
    mm_user_id: &'a str,
    matrix_user_id: &'a str,
    display_name: Option<&'a str>,
    avatar_id: Option<&'a str>,
    created_at: String,
    updated_at: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = puppets, treat_none_as_null = true)]
struct UpdatePuppet<'a> {
    matrix_user_id: &'a str,
    display_name: Option<&'a str>,
    avatar_id: Option<&'a str>,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = portals)]
struct DbPortal {
    id: i32,
    conversation_id: String,
    receiver: String,
    kind: String,
    matrix_room_id: Option<String>,
    parent_id: Option<String>,
    name: Option<String>,
    topic: Option<String>,
    relay_login_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DbPortal {
    fn to_record(&self) -> Result<PortalRecord, DatabaseError> {
        Ok(PortalRecord {
            id: self.id as i64,
            conversation_id: self.conversation_id.clone(),
            receiver: self.receiver.clone(),
            kind: self.kind.clone(),
            matrix_room_id: self.matrix_room_id.clone(),
            parent_id: self.parent_id.clone(),
            name: self.name.clone(),
            topic: self.topic.clone(),
            relay_login_id: self.relay_login_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
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
    created_at: String,
    updated_at: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = portals, treat_none_as_null = true)]
struct UpdatePortal<'a> {
    matrix_room_id: Option<&'a str>,
    parent_id: Option<&'a str>,
    name: Option<&'a str>,
    topic: Option<&'a str>,
    relay_login_id: Option<&'a str>,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = user_logins)]
struct DbLogin {
    id: String,
    matrix_user_id: String,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl DbLogin {
    fn to_record(&self) -> Result<LoginRecord, DatabaseError> {
        Ok(LoginRecord {
            id: self.id.clone(),
            matrix_user_id: self.matrix_user_id.clone(),
            metadata: self.metadata.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = user_logins)]
struct NewLogin<'a> {
    id: &'a str,
    matrix_user_id: &'a str,
    metadata: &'a str,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = message_mappings)]
struct DbMessageMapping {
    id: i32,
    mm_post_id: String,
    part_index: i32,
    mm_channel_id: String,
    matrix_room_id: String,
    matrix_event_id: String,
    created_at: String,
}

impl DbMessageMapping {
    fn to_record(&self) -> Result<MessageMapping, DatabaseError> {
        Ok(MessageMapping {
            id: self.id as i64,
            mm_post_id: self.mm_post_id.clone(),
            part_index: self.part_index,
            mm_channel_id: self.mm_channel_id.clone(),
            matrix_room_id: self.matrix_room_id.clone(),
            matrix_event_id: self.matrix_event_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
        })
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
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = reaction_mappings)]
struct DbReactionMapping {
    id: i32,
    mm_post_id: String,
    mm_user_id: String,
    emoji_name: String,
    matrix_room_id: String,
    matrix_event_id: String,
    created_at: String,
}

impl DbReactionMapping {
    fn to_record(&self) -> Result<ReactionMapping, DatabaseError> {
        Ok(ReactionMapping {
            id: self.id as i64,
            mm_post_id: self.mm_post_id.clone(),
            mm_user_id: self.mm_user_id.clone(),
            emoji_name: self.emoji_name.clone(),
            matrix_room_id: self.matrix_room_id.clone(),
            matrix_event_id: self.matrix_event_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
        })
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
    created_at: String,
}

pub(crate) fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))
}

async fn with_connection<T, F>(db_path: Arc<String>, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = establish_connection(&db_path)?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct SqliteUserStore {
    db_path: Arc<String>,
}

impl SqliteUserStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::UserStore for SqliteUserStore {
    async fn get_ghost(&self, matrix_id: &str) -> Result<Option<GhostRecord>, DatabaseError> {
        let matrix_id = matrix_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::ghosts::dsl::*;
            ghosts
                .filter(matrix_user_id.eq(matrix_id))
                .select(DbGhost::as_select())
                .first::<DbGhost>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn get_ghost_by_mm_id(&self, mm_id: &str) -> Result<Option<GhostRecord>, DatabaseError> {
        let mm_id = mm_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::ghosts::dsl::*;
            ghosts
                .filter(mm_user_id.eq(mm_id))
                .select(DbGhost::as_select())
                .first::<DbGhost>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn upsert_ghost(&self, ghost: &GhostRecord) -> Result<(), DatabaseError> {
        let ghost = ghost.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let updated = datetime_to_string(&ghost.updated_at);
            let new_ghost = NewGhost {
                matrix_user_id: &ghost.matrix_user_id,
                mm_username: &ghost.mm_username,
                mm_user_id: ghost.mm_user_id.as_deref(),
                metadata: &ghost.metadata,
                created_at: datetime_to_string(&ghost.created_at),
                updated_at: updated.clone(),
            };
            diesel::insert_into(ghosts::table)
                .values(&new_ghost)
                .on_conflict(ghosts::matrix_user_id)
                .do_update()
                .set((
                    ghosts::mm_username.eq(&ghost.mm_username),
                    ghosts::mm_user_id.eq(ghost.mm_user_id.as_deref()),
                    ghosts::metadata.eq(&ghost.metadata),
                    ghosts::updated_at.eq(updated),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn get_puppet(&self, mm_id: &str) -> Result<Option<PuppetRecord>, DatabaseError> {
        let mm_id = mm_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::puppets::dsl::*;
            puppets
                .filter(mm_user_id.eq(mm_id))
                .select(DbPuppet::as_select())
                .first::<DbPuppet>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn get_puppet_by_matrix_id(
        &self,
        matrix_id: &str,
    ) -> Result<Option<PuppetRecord>, DatabaseError> {
        let matrix_id = matrix_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::puppets::dsl::*;
            puppets
                .filter(matrix_user_id.eq(matrix_id))
                .select(DbPuppet::as_select())
                .first::<DbPuppet>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn upsert_puppet(&self, puppet: &PuppetRecord) -> Result<(), DatabaseError> {
        let puppet = puppet.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let new_puppet = NewPuppet {
                mm_user_id: &puppet.mm_user_id,
                matrix_user_id: &puppet.matrix_user_id,
                display_name: puppet.display_name.as_deref(),
                avatar_id: puppet.avatar_id.as_deref(),
                created_at: datetime_to_string(&puppet.created_at),
                updated_at: datetime_to_string(&puppet.updated_at),
            };
            let changes = UpdatePuppet {
                matrix_user_id: &puppet.matrix_user_id,
                display_name: puppet.display_name.as_deref(),
                avatar_id: puppet.avatar_id.as_deref(),
                updated_at: datetime_to_string(&puppet.updated_at),
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

pub struct SqliteRoomStore {
    db_path: Arc<String>,
}

impl SqliteRoomStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::RoomStore for SqliteRoomStore {
    async fn get_portal(
        &self,
        conversation: &str,
        receiver_id: &str,
    ) -> Result<Option<PortalRecord>, DatabaseError> {
        let conversation = conversation.to_string();
        let receiver_id = receiver_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::portals::dsl::*;
            portals
                .filter(conversation_id.eq(conversation))
                .filter(receiver.eq(receiver_id))
                .select(DbPortal::as_select())
                .first::<DbPortal>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn get_portal_by_room(
        &self,
        room_id: &str,
    ) -> Result<Option<PortalRecord>, DatabaseError> {
        let room_id = room_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::portals::dsl::*;
            portals
                .filter(matrix_room_id.eq(room_id))
                .select(DbPortal::as_select())
                .first::<DbPortal>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn upsert_portal(&self, portal: &PortalRecord) -> Result<(), DatabaseError> {
        let portal = portal.clone();
        with_connection(self.db_path.clone(), move |conn| {
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
                        updated_at: datetime_to_string(&portal.updated_at),
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
                        created_at: datetime_to_string(&portal.created_at),
                        updated_at: datetime_to_string(&portal.updated_at),
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
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::portals::dsl::*;
            let rows = portals
                .order(id.desc())
                .limit(limit)
                .offset(offset)
                .select(DbPortal::as_select())
                .load::<DbPortal>(conn)
                .map_err(query_error)?;
            rows.iter().map(DbPortal::to_record).collect()
        })
        .await
    }

    async fn count_portals(&self) -> Result<i64, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            portals::table.count().get_result(conn).map_err(query_error)
        })
        .await
    }
}

pub struct SqliteLoginStore {
    db_path: Arc<String>,
}

impl SqliteLoginStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::LoginStore for SqliteLoginStore {
    async fn get_login(&self, login_id: &str) -> Result<Option<LoginRecord>, DatabaseError> {
        let login_id = login_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::user_logins::dsl::*;
            user_logins
                .filter(id.eq(login_id))
                .select(DbLogin::as_select())
                .first::<DbLogin>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn list_logins(&self) -> Result<Vec<LoginRecord>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::user_logins::dsl::*;
            let rows = user_logins
                .order(created_at.asc())
                .select(DbLogin::as_select())
                .load::<DbLogin>(conn)
                .map_err(query_error)?;
            rows.iter().map(DbLogin::to_record).collect()
        })
        .await
    }

    async fn upsert_login(&self, login: &LoginRecord) -> Result<(), DatabaseError> {
        let login = login.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let updated = datetime_to_string(&login.updated_at);
            let new_login = NewLogin {
                id: &login.id,
                matrix_user_id: &login.matrix_user_id,
                metadata: &login.metadata,
                created_at: datetime_to_string(&login.created_at),
                updated_at: updated.clone(),
            };
            diesel::insert_into(user_logins::table)
                .values(&new_login)
                .on_conflict(user_logins::id)
                .do_update()
                .set((
                    user_logins::matrix_user_id.eq(&login.matrix_user_id),
                    user_logins::metadata.eq(&login.metadata),
                    user_logins::updated_at.eq(updated),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn delete_login(&self, login_id: &str) -> Result<(), DatabaseError> {
        let login_id = login_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            diesel::delete(user_logins::table.filter(user_logins::id.eq(login_id)))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }
}

pub struct SqliteMessageStore {
    db_path: Arc<String>,
}

impl SqliteMessageStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::MessageStore for SqliteMessageStore {
    async fn get_by_mm_post_id(&self, post_id: &str) -> Result<Vec<MessageMapping>, DatabaseError> {
        let post_id = post_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::message_mappings::dsl::*;
            let rows = message_mappings
                .filter(mm_post_id.eq(post_id))
                .order(part_index.asc())
                .select(DbMessageMapping::as_select())
                .load::<DbMessageMapping>(conn)
                .map_err(query_error)?;
            rows.iter().map(DbMessageMapping::to_record).collect()
        })
        .await
    }

    async fn get_by_matrix_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError> {
        let event_id = event_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::message_mappings::dsl::*;
            message_mappings
                .filter(matrix_event_id.eq(event_id))
                .select(DbMessageMapping::as_select())
                .first::<DbMessageMapping>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn upsert_message_mapping(&self, mapping: &MessageMapping) -> Result<(), DatabaseError> {
        let mapping = mapping.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let new_mapping = NewMessageMapping {
                mm_post_id: &mapping.mm_post_id,
                part_index: mapping.part_index,
                mm_channel_id: &mapping.mm_channel_id,
                matrix_room_id: &mapping.matrix_room_id,
                matrix_event_id: &mapping.matrix_event_id,
                created_at: datetime_to_string(&mapping.created_at),
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
        with_connection(self.db_path.clone(), move |conn| {
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
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::reaction_mappings::dsl::*;
            reaction_mappings
                .filter(mm_post_id.eq(post_id))
                .filter(mm_user_id.eq(user_id))
                .filter(emoji_name.eq(emoji))
                .select(DbReactionMapping::as_select())
                .first::<DbReactionMapping>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn get_reaction_by_matrix_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError> {
        let event_id = event_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::reaction_mappings::dsl::*;
            reaction_mappings
                .filter(matrix_event_id.eq(event_id))
                .select(DbReactionMapping::as_select())
                .first::<DbReactionMapping>(conn)
                .optional()
                .map_err(query_error)?
                .map(|row| row.to_record())
                .transpose()
        })
        .await
    }

    async fn upsert_reaction(&self, mapping: &ReactionMapping) -> Result<(), DatabaseError> {
        let mapping = mapping.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let new_mapping = NewReactionMapping {
                mm_post_id: &mapping.mm_post_id,
                mm_user_id: &mapping.mm_user_id,
                emoji_name: &mapping.emoji_name,
                matrix_room_id: &mapping.matrix_room_id,
                matrix_event_id: &mapping.matrix_event_id,
                created_at: datetime_to_string(&mapping.created_at),
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
        with_connection(self.db_path.clone(), move |conn| {
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
