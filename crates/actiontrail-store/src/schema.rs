/// SQL DDL for the action store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS actions (
    id TEXT PRIMARY KEY,
    company_id TEXT,
    client_id TEXT,
    app TEXT,
    environment TEXT,
    action_type TEXT NOT NULL,
    verb TEXT NOT NULL,
    object TEXT,
    timestamp TEXT,
    trace_ids TEXT NOT NULL DEFAULT '[]',
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS action_changes (
    action_id TEXT NOT NULL REFERENCES actions(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    model TEXT NOT NULL,
    operation TEXT NOT NULL,
    record_id TEXT,
    PRIMARY KEY (action_id, position)
);

CREATE INDEX IF NOT EXISTS idx_actions_company ON actions(company_id);
CREATE INDEX IF NOT EXISTS idx_actions_type_verb ON actions(action_type, verb);
CREATE INDEX IF NOT EXISTS idx_actions_timestamp ON actions(timestamp);
CREATE INDEX IF NOT EXISTS idx_changes_model ON action_changes(model, record_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
