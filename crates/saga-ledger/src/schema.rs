// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedded DDL for both supported backends.
//!
//! One statement per array element; the dense-ordinal trigger and the
//! unique indexes are the database-side last line of defense for the
//! ledger invariants. Migrations tooling is an external collaborator;
//! this module only bootstraps development and test databases.

/// SQLite development schema.
pub const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS campaigns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE TABLE IF NOT EXISTS scenes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        channel_id INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS characters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transcripts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scene_id INTEGER NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
        author TEXT NOT NULL,
        content TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        scene_id INTEGER REFERENCES scenes(id) ON DELETE CASCADE,
        replay_ordinal INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        event_schema_version INTEGER NOT NULL,
        world_time INTEGER NOT NULL,
        wall_time_utc BIGINT NOT NULL,
        prev_event_hash BLOB NOT NULL,
        payload_hash BLOB NOT NULL,
        idempotency_key BLOB NOT NULL,
        actor_id TEXT,
        plan_id TEXT,
        execution_request_id TEXT,
        approved_by TEXT,
        payload TEXT NOT NULL,
        migrator_applied_from INTEGER
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_events_campaign_replay
        ON events(campaign_id, replay_ordinal)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_events_campaign_idempotency
        ON events(campaign_id, idempotency_key)",
    "CREATE INDEX IF NOT EXISTS ix_events_request
        ON events(campaign_id, execution_request_id)",
    "CREATE TRIGGER IF NOT EXISTS trg_events_dense_ordinal
     BEFORE INSERT ON events
     FOR EACH ROW
     WHEN NEW.replay_ordinal <> (
        SELECT COALESCE(MAX(replay_ordinal), -1) + 1
        FROM events WHERE campaign_id = NEW.campaign_id
     )
     BEGIN
        SELECT RAISE(ABORT, 'replay_ordinal gap');
     END",
    "CREATE TABLE IF NOT EXISTS pending_actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        scene_id INTEGER NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
        channel_id INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        request_id TEXT NOT NULL,
        chain TEXT NOT NULL,
        mechanics TEXT NOT NULL,
        narration TEXT NOT NULL,
        player_tx_id INTEGER REFERENCES transcripts(id),
        bot_tx_id INTEGER REFERENCES transcripts(id),
        status TEXT NOT NULL DEFAULT 'pending',
        created_at BIGINT NOT NULL,
        expires_at BIGINT NOT NULL,
        dedup_hash TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_pending_scene_user_dedup
        ON pending_actions(scene_id, user_id, dedup_hash)
        WHERE dedup_hash IS NOT NULL AND status = 'pending'",
    "CREATE TABLE IF NOT EXISTS import_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        package_id TEXT NOT NULL,
        manifest_hash TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
];

/// Postgres production schema.
pub const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS campaigns (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS scenes (
        id BIGSERIAL PRIMARY KEY,
        campaign_id BIGINT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        channel_id BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS characters (
        id BIGSERIAL PRIMARY KEY,
        campaign_id BIGINT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transcripts (
        id BIGSERIAL PRIMARY KEY,
        scene_id BIGINT NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
        author TEXT NOT NULL,
        content TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        campaign_id BIGINT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        scene_id BIGINT REFERENCES scenes(id) ON DELETE CASCADE,
        replay_ordinal BIGINT NOT NULL,
        event_type TEXT NOT NULL,
        event_schema_version INT NOT NULL,
        world_time BIGINT NOT NULL,
        wall_time_utc BIGINT NOT NULL,
        prev_event_hash BYTEA NOT NULL,
        payload_hash BYTEA NOT NULL,
        idempotency_key BYTEA NOT NULL,
        actor_id TEXT,
        plan_id TEXT,
        execution_request_id TEXT,
        approved_by TEXT,
        payload TEXT NOT NULL,
        migrator_applied_from INT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_events_campaign_replay
        ON events(campaign_id, replay_ordinal)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_events_campaign_idempotency
        ON events(campaign_id, idempotency_key)",
    "CREATE INDEX IF NOT EXISTS ix_events_request
        ON events(campaign_id, execution_request_id)",
    "CREATE OR REPLACE FUNCTION events_enforce_dense_ordinal() RETURNS trigger AS $$
     DECLARE expected BIGINT;
     BEGIN
        SELECT COALESCE(MAX(replay_ordinal), -1) + 1 INTO expected
        FROM events WHERE campaign_id = NEW.campaign_id;
        IF NEW.replay_ordinal <> expected THEN
            RAISE EXCEPTION 'replay_ordinal gap: got %, expected %',
                NEW.replay_ordinal, expected;
        END IF;
        RETURN NEW;
     END $$ LANGUAGE plpgsql",
    "DROP TRIGGER IF EXISTS trg_events_dense_ordinal ON events",
    "CREATE TRIGGER trg_events_dense_ordinal
        BEFORE INSERT ON events
        FOR EACH ROW EXECUTE FUNCTION events_enforce_dense_ordinal()",
    "CREATE TABLE IF NOT EXISTS pending_actions (
        id BIGSERIAL PRIMARY KEY,
        campaign_id BIGINT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        scene_id BIGINT NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
        channel_id BIGINT NOT NULL,
        user_id TEXT NOT NULL,
        request_id TEXT NOT NULL,
        chain TEXT NOT NULL,
        mechanics TEXT NOT NULL,
        narration TEXT NOT NULL,
        player_tx_id BIGINT REFERENCES transcripts(id),
        bot_tx_id BIGINT REFERENCES transcripts(id),
        status TEXT NOT NULL DEFAULT 'pending',
        created_at BIGINT NOT NULL,
        expires_at BIGINT NOT NULL,
        dedup_hash TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_pending_scene_user_dedup
        ON pending_actions(scene_id, user_id, dedup_hash)
        WHERE dedup_hash IS NOT NULL AND status = 'pending'",
    "CREATE TABLE IF NOT EXISTS import_logs (
        id BIGSERIAL PRIMARY KEY,
        campaign_id BIGINT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        package_id TEXT NOT NULL,
        manifest_hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
];
