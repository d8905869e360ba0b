/// Bumped whenever the table layout changes. Stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA: &str = r#"
-- Images: every photo the indexer has encountered
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    relative_path TEXT NOT NULL UNIQUE,  -- Path relative to the indexed root
    absolute_path TEXT NOT NULL,
    modified_at TEXT,                    -- File mtime when last seen (RFC 3339)
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Clusters: identity groups, recreated on every clustering pass
CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY,
    label TEXT NOT NULL
);

-- Faces: detected faces with bounding boxes and embeddings
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL,
    bbox_x1 INTEGER NOT NULL,
    bbox_y1 INTEGER NOT NULL,
    bbox_x2 INTEGER NOT NULL,
    bbox_y2 INTEGER NOT NULL,
    embedding BLOB NOT NULL,      -- float32 array stored as little-endian bytes
    embedding_dim INTEGER NOT NULL,
    cluster_id INTEGER,           -- NULL for unclustered faces (noise)
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE,
    FOREIGN KEY (cluster_id) REFERENCES clusters(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_image ON faces(image_id);
CREATE INDEX IF NOT EXISTS idx_faces_cluster ON faces(cluster_id);
"#;
