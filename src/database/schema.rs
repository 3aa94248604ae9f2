/// Table definitions for posts, users and communities
pub struct DatabaseSchema;

impl DatabaseSchema {
    pub fn create_users_table_sql() -> &'static str {
        "
        CREATE TABLE IF NOT EXISTS users (
            user_id BIGINT PRIMARY KEY,
            username VARCHAR(64) UNIQUE NOT NULL,
            password VARCHAR(128) NOT NULL,
            create_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "
    }

    pub fn create_community_table_sql() -> &'static str {
        "
        CREATE TABLE IF NOT EXISTS community (
            community_id BIGINT PRIMARY KEY,
            community_name VARCHAR(128) UNIQUE NOT NULL,
            introduction TEXT NOT NULL DEFAULT '',
            create_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "
    }

    pub fn create_post_table_sql() -> &'static str {
        "
        CREATE TABLE IF NOT EXISTS post (
            post_id BIGINT PRIMARY KEY,
            title VARCHAR(128) NOT NULL,
            content TEXT NOT NULL,
            author_id BIGINT NOT NULL,
            community_id BIGINT NOT NULL,
            status INTEGER NOT NULL DEFAULT 1,
            create_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "
    }

    pub fn create_indexes_sql() -> Vec<&'static str> {
        vec![
            "CREATE INDEX IF NOT EXISTS idx_post_create_time ON post(create_time DESC)",
            "CREATE INDEX IF NOT EXISTS idx_post_author_id ON post(author_id)",
            "CREATE INDEX IF NOT EXISTS idx_post_community_id ON post(community_id)",
        ]
    }
}

/// Ordered migration scripts
pub struct Migrations;

impl Migrations {
    pub fn get_all_migrations() -> Vec<Migration> {
        vec![
            Migration {
                version: 1,
                name: "create_users_table",
                up_sql: DatabaseSchema::create_users_table_sql(),
                down_sql: "DROP TABLE IF EXISTS users CASCADE",
            },
            Migration {
                version: 2,
                name: "create_community_table",
                up_sql: DatabaseSchema::create_community_table_sql(),
                down_sql: "DROP TABLE IF EXISTS community CASCADE",
            },
            Migration {
                version: 3,
                name: "create_post_table",
                up_sql: DatabaseSchema::create_post_table_sql(),
                down_sql: "DROP TABLE IF EXISTS post CASCADE",
            },
        ]
    }
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}
