use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{DatabaseError, LoginStore, MessageStore, RoomStore, UserStore};
use std::sync::Arc;

#[cfg(feature = "postgres")]
use crate::db::postgres::{
    PostgresLoginStore, PostgresMessageStore, PostgresRoomStore, PostgresUserStore,
};
#[cfg(feature = "postgres")]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteLoginStore, SqliteMessageStore, SqliteRoomStore, SqliteUserStore, establish_connection,
};

const POSTGRES_MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ghosts (
        id BIGSERIAL PRIMARY KEY,
        matrix_user_id TEXT NOT NULL UNIQUE,
        mm_username TEXT NOT NULL,
        mm_user_id TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS puppets (
        id BIGSERIAL PRIMARY KEY,
        mm_user_id TEXT NOT NULL UNIQUE,
        matrix_user_id TEXT NOT NULL,
        display_name TEXT,
        avatar_id TEXT,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS portals (
        id BIGSERIAL PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        receiver TEXT NOT NULL DEFAULT '',
        kind TEXT NOT NULL,
        matrix_room_id TEXT,
        parent_id TEXT,
        name TEXT,
        topic TEXT,
        relay_login_id TEXT,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        UNIQUE (conversation_id, receiver)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_logins (
        id TEXT PRIMARY KEY,
        matrix_user_id TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_mappings (
        id BIGSERIAL PRIMARY KEY,
        mm_post_id TEXT NOT NULL,
        part_index INTEGER NOT NULL DEFAULT 0,
        mm_channel_id TEXT NOT NULL,
        matrix_room_id TEXT NOT NULL,
        matrix_event_id TEXT NOT NULL,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        UNIQUE (mm_post_id, part_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reaction_mappings (
        id BIGSERIAL PRIMARY KEY,
        mm_post_id TEXT NOT NULL,
        mm_user_id TEXT NOT NULL,
        emoji_name TEXT NOT NULL,
        matrix_room_id TEXT NOT NULL,
        matrix_event_id TEXT NOT NULL,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        UNIQUE (mm_post_id, mm_user_id, emoji_name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ghosts_mm_user_id ON ghosts(mm_user_id)",
    "CREATE INDEX IF NOT EXISTS idx_puppets_matrix_user_id ON puppets(matrix_user_id)",
    "CREATE INDEX IF NOT EXISTS idx_portals_matrix_room_id ON portals(matrix_room_id)",
    "CREATE INDEX IF NOT EXISTS idx_message_mappings_matrix_event ON message_mappings(matrix_event_id)",
    "CREATE INDEX IF NOT EXISTS idx_reaction_mappings_matrix_event ON reaction_mappings(matrix_event_id)",
];

const SQLITE_MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ghosts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        matrix_user_id TEXT NOT NULL UNIQUE,
        mm_username TEXT NOT NULL,
        mm_user_id TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS puppets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mm_user_id TEXT NOT NULL UNIQUE,
        matrix_user_id TEXT NOT NULL,
        display_name TEXT,
        avatar_id TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS portals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        receiver TEXT NOT NULL DEFAULT '',
        kind TEXT NOT NULL,
        matrix_room_id TEXT,
        parent_id TEXT,
        name TEXT,
        topic TEXT,
        relay_login_id TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (conversation_id, receiver)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_logins (
        id TEXT PRIMARY KEY NOT NULL,
        matrix_user_id TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mm_post_id TEXT NOT NULL,
        part_index INTEGER NOT NULL DEFAULT 0,
        mm_channel_id TEXT NOT NULL,
        matrix_room_id TEXT NOT NULL,
        matrix_event_id TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (mm_post_id, part_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reaction_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mm_post_id TEXT NOT NULL,
        mm_user_id TEXT NOT NULL,
        emoji_name TEXT NOT NULL,
        matrix_room_id TEXT NOT NULL,
        matrix_event_id TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (mm_post_id, mm_user_id, emoji_name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ghosts_mm_user_id ON ghosts(mm_user_id)",
    "CREATE INDEX IF NOT EXISTS idx_puppets_matrix_user_id ON puppets(matrix_user_id)",
    "CREATE INDEX IF NOT EXISTS idx_portals_matrix_room_id ON portals(matrix_room_id)",
    "CREATE INDEX IF NOT EXISTS idx_message_mappings_matrix_event ON message_mappings(matrix_event_id)",
    "CREATE INDEX IF NOT EXISTS idx_reaction_mappings_matrix_event ON reaction_mappings(matrix_event_id)",
];

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    user_store: Arc<dyn UserStore>,
    room_store: Arc<dyn RoomStore>,
    login_store: Arc<dyn LoginStore>,
    message_store: Arc<dyn MessageStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let manager = ConnectionManager::<PgConnection>::new(config.connection_string());
                let pool = r2d2::Pool::builder()
                    .max_size(config.max_connections().unwrap_or(10))
                    .min_idle(Some(config.min_connections().unwrap_or(1)))
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                Ok(Self {
                    user_store: Arc::new(PostgresUserStore::new(pool.clone())),
                    room_store: Arc::new(PostgresRoomStore::new(pool.clone())),
                    login_store: Arc::new(PostgresLoginStore::new(pool.clone())),
                    message_store: Arc::new(PostgresMessageStore::new(pool.clone())),
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite database path is missing".to_string())
                })?;
                let shared = Arc::new(path.clone());

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path),
                    user_store: Arc::new(SqliteUserStore::new(shared.clone())),
                    room_store: Arc::new(SqliteRoomStore::new(shared.clone())),
                    login_store: Arc::new(SqliteLoginStore::new(shared.clone())),
                    message_store: Arc::new(SqliteMessageStore::new(shared)),
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.clone().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool is not initialized".to_string())
                })?;
                Self::migrate_postgres(pool).await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.clone().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path is not initialized".to_string())
                })?;
                Self::migrate_sqlite(path).await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: Pool) -> Result<(), DatabaseError> {
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            for statement in POSTGRES_MIGRATIONS {
                diesel::sql_query(*statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: String) -> Result<(), DatabaseError> {
        use diesel::RunQueryDsl;

        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&path)?;

            for statement in SQLITE_MIGRATIONS {
                diesel::sql_query(*statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn user_store(&self) -> Arc<dyn UserStore> {
        self.user_store.clone()
    }

    pub fn room_store(&self) -> Arc<dyn RoomStore> {
        self.room_store.clone()
    }

    pub fn login_store(&self) -> Arc<dyn LoginStore> {
        self.login_store.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.message_store.clone()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}
