/// Schema for the local mirror, the mutation queue and the response cache.
pub const SCHEMA: &str = r#"
-- Mirrored rows, one table for every entity kind
CREATE TABLE IF NOT EXISTS records (
    tbl TEXT NOT NULL,
    id TEXT NOT NULL,
    fields TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (tbl, id)
);

CREATE INDEX IF NOT EXISTS idx_records_updated
    ON records(tbl, updated_at);

-- Ordered log of writes not yet acknowledged by the remote
CREATE TABLE IF NOT EXISTS mutation_queue (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    tbl TEXT NOT NULL,
    record_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_record
    ON mutation_queue(tbl, record_id, sequence);

-- Cached network responses, namespaced by deployment generation
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    cache_class TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (generation, cache_class, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(generation, cache_class, stored_at);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
