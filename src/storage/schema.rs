//! Database schema definitions and migrations

/// SQL to create the markers table
pub const CREATE_MARKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS markers (
    id TEXT PRIMARY KEY,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT
)
"#;

/// SQL to create the images table.
/// Images are owned by exactly one marker and go away with it.
pub const CREATE_IMAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    id TEXT PRIMARY KEY,
    marker_id TEXT NOT NULL,
    uri TEXT NOT NULL,
    name TEXT NOT NULL,
    date_added TEXT NOT NULL,
    size INTEGER,
    type TEXT,
    FOREIGN KEY (marker_id) REFERENCES markers (id) ON DELETE CASCADE
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_images_marker_id ON images(marker_id)",
    "CREATE INDEX IF NOT EXISTS idx_markers_created_at ON markers(created_at)",
];

/// A versioned set of schema statements, applied at most once and atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub statements: Vec<String>,
}

impl Migration {
    pub fn new<I, S>(version: u32, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version,
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }
}

/// v1: markers + images with cascade and indexes
pub fn initial_migration() -> Migration {
    let mut stmts = vec![CREATE_MARKERS_TABLE, CREATE_IMAGES_TABLE];
    stmts.extend(CREATE_INDEXES.iter().copied());
    Migration::new(1, stmts)
}

/// All known migrations, ascending by version
pub fn all_migrations() -> Vec<Migration> {
    vec![initial_migration()]
}

/// Latest schema version this build knows about
pub fn latest_version() -> u32 {
    all_migrations().iter().map(|m| m.version).max().unwrap_or(0)
}
