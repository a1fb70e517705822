//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`, which also
//! makes every multi-statement method atomic with respect to other callers.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::store::{
    AclPermissions, BucketAclRecord, BucketRecord, BucketTagRecord, CredentialRecord, Grantee,
    MetadataStore, ObjectAclRecord, ObjectRecord, ObjectStatistics, ObjectTagRecord, StoreFuture,
    UploadPartRecord, UploadRecord, UserGroup, UserRecord, VersionInsert,
};

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

const USER_COLUMNS: &str = "guid, name, email, created_utc";

const CREDENTIAL_COLUMNS: &str =
    "guid, user_guid, description, access_key, secret_key, is_base64, created_utc";

const BUCKET_COLUMNS: &str = "guid, name, owner_guid, region, storage_type, disk_directory, \
     enable_versioning, enable_public_read, enable_public_write, created_utc";

const OBJECT_COLUMNS: &str = "id, guid, bucket_guid, owner_guid, author_guid, key, content_type, \
     content_length, version, etag, md5, blob_filename, is_folder, delete_marker, \
     created_utc, last_update_utc, last_access_utc, expiration_utc";

const ACL_FLAG_COLUMNS: &str =
    "permit_read, permit_write, permit_read_acp, permit_write_acp, full_control";

const UPLOAD_COLUMNS: &str = "guid, bucket_guid, owner_guid, author_guid, key, content_type, \
     created_utc, last_access_utc, expiration_utc";

const PART_COLUMNS: &str = "guid, bucket_guid, owner_guid, upload_guid, part_number, \
     part_length, md5, sha1, sha256, created_utc";

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// This is idempotent -- safe to call on every startup (crash-only design).
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                guid        TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                email       TEXT NOT NULL UNIQUE,
                created_utc TEXT NOT NULL
            );

            -- Credentials deliberately carry no foreign key: a credential may
            -- outlive its user and must then resolve to UserNotFound.
            CREATE TABLE IF NOT EXISTS credential (
                guid        TEXT PRIMARY KEY,
                user_guid   TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                access_key  TEXT NOT NULL UNIQUE,
                secret_key  TEXT NOT NULL,
                is_base64   INTEGER NOT NULL DEFAULT 0,
                created_utc TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_credential_user
                ON credential(user_guid);

            CREATE TABLE IF NOT EXISTS buckets (
                guid                TEXT PRIMARY KEY,
                name                TEXT NOT NULL UNIQUE,
                owner_guid          TEXT NOT NULL,
                region              TEXT NOT NULL DEFAULT 'us-west-1',
                storage_type        TEXT NOT NULL DEFAULT 'Disk',
                disk_directory      TEXT NOT NULL,
                enable_versioning   INTEGER NOT NULL DEFAULT 0,
                enable_public_read  INTEGER NOT NULL DEFAULT 0,
                enable_public_write INTEGER NOT NULL DEFAULT 0,
                created_utc         TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS objects (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                guid            TEXT NOT NULL UNIQUE,
                bucket_guid     TEXT NOT NULL,
                owner_guid      TEXT NOT NULL,
                author_guid     TEXT NOT NULL,
                key             TEXT NOT NULL,
                content_type    TEXT NOT NULL DEFAULT 'application/octet-stream',
                content_length  INTEGER NOT NULL,
                version         INTEGER NOT NULL,
                etag            TEXT NOT NULL,
                md5             TEXT NOT NULL,
                blob_filename   TEXT NOT NULL,
                is_folder       INTEGER NOT NULL DEFAULT 0,
                delete_marker   INTEGER NOT NULL DEFAULT 0,
                created_utc     TEXT NOT NULL,
                last_update_utc TEXT NOT NULL,
                last_access_utc TEXT NOT NULL,
                expiration_utc  TEXT,

                UNIQUE (bucket_guid, key, version),
                FOREIGN KEY (bucket_guid) REFERENCES buckets(guid) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_objects_bucket_id
                ON objects(bucket_guid, id);
            CREATE INDEX IF NOT EXISTS idx_objects_bucket_key
                ON objects(bucket_guid, key, version);

            CREATE TABLE IF NOT EXISTS buckettags (
                guid        TEXT PRIMARY KEY,
                bucket_guid TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL DEFAULT '',

                FOREIGN KEY (bucket_guid) REFERENCES buckets(guid) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_buckettags_bucket
                ON buckettags(bucket_guid);

            CREATE TABLE IF NOT EXISTS objecttags (
                guid        TEXT PRIMARY KEY,
                bucket_guid TEXT NOT NULL,
                object_guid TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL DEFAULT '',

                FOREIGN KEY (object_guid) REFERENCES objects(guid) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_objecttags_object
                ON objecttags(object_guid);

            CREATE TABLE IF NOT EXISTS bucketacls (
                guid                TEXT PRIMARY KEY,
                bucket_guid         TEXT NOT NULL,
                user_guid           TEXT,
                user_group          TEXT,
                issued_by_user_guid TEXT NOT NULL,
                permit_read         INTEGER NOT NULL DEFAULT 0,
                permit_write        INTEGER NOT NULL DEFAULT 0,
                permit_read_acp     INTEGER NOT NULL DEFAULT 0,
                permit_write_acp    INTEGER NOT NULL DEFAULT 0,
                full_control        INTEGER NOT NULL DEFAULT 0,
                created_utc         TEXT NOT NULL,

                FOREIGN KEY (bucket_guid) REFERENCES buckets(guid) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_bucketacls_bucket
                ON bucketacls(bucket_guid);

            CREATE TABLE IF NOT EXISTS objectacls (
                guid                TEXT PRIMARY KEY,
                bucket_guid         TEXT NOT NULL,
                object_guid         TEXT NOT NULL,
                user_guid           TEXT,
                user_group          TEXT,
                issued_by_user_guid TEXT NOT NULL,
                permit_read         INTEGER NOT NULL DEFAULT 0,
                permit_write        INTEGER NOT NULL DEFAULT 0,
                permit_read_acp     INTEGER NOT NULL DEFAULT 0,
                permit_write_acp    INTEGER NOT NULL DEFAULT 0,
                full_control        INTEGER NOT NULL DEFAULT 0,
                created_utc         TEXT NOT NULL,

                FOREIGN KEY (object_guid) REFERENCES objects(guid) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_objectacls_object
                ON objectacls(object_guid);

            CREATE TABLE IF NOT EXISTS uploads (
                guid            TEXT PRIMARY KEY,
                bucket_guid     TEXT NOT NULL,
                owner_guid      TEXT NOT NULL,
                author_guid     TEXT NOT NULL,
                key             TEXT NOT NULL,
                content_type    TEXT NOT NULL DEFAULT 'application/octet-stream',
                created_utc     TEXT NOT NULL,
                last_access_utc TEXT NOT NULL,
                expiration_utc  TEXT NOT NULL,

                FOREIGN KEY (bucket_guid) REFERENCES buckets(guid) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_uploads_bucket
                ON uploads(bucket_guid);
            CREATE INDEX IF NOT EXISTS idx_uploads_expiration
                ON uploads(expiration_utc);

            CREATE TABLE IF NOT EXISTS uploadparts (
                guid        TEXT PRIMARY KEY,
                bucket_guid TEXT NOT NULL,
                owner_guid  TEXT NOT NULL,
                upload_guid TEXT NOT NULL,
                part_number INTEGER NOT NULL,
                part_length INTEGER NOT NULL,
                md5         TEXT NOT NULL,
                sha1        TEXT NOT NULL,
                sha256      TEXT NOT NULL,
                created_utc TEXT NOT NULL,

                UNIQUE (upload_guid, part_number),
                FOREIGN KEY (upload_guid) REFERENCES uploads(guid) ON DELETE CASCADE
            );
            ",
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.map_or(true, |v| v < SCHEMA_VERSION) {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, Utc::now()],
            )?;
        }

        Ok(())
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

fn conversion_error(idx: usize, err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        guid: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        created_utc: row.get(3)?,
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<CredentialRecord> {
    Ok(CredentialRecord {
        guid: row.get(0)?,
        user_guid: row.get(1)?,
        description: row.get(2)?,
        access_key: row.get(3)?,
        secret_key: row.get(4)?,
        is_base64: row.get(5)?,
        created_utc: row.get(6)?,
    })
}

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<BucketRecord> {
    let storage_type: String = row.get(4)?;
    Ok(BucketRecord {
        guid: row.get(0)?,
        name: row.get(1)?,
        owner_guid: row.get(2)?,
        region: row.get(3)?,
        storage_type: storage_type
            .parse()
            .map_err(|e| conversion_error(4, e))?,
        disk_directory: row.get(5)?,
        enable_versioning: row.get(6)?,
        enable_public_read: row.get(7)?,
        enable_public_write: row.get(8)?,
        created_utc: row.get(9)?,
    })
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let content_length: i64 = row.get(7)?;
    Ok(ObjectRecord {
        id: row.get(0)?,
        guid: row.get(1)?,
        bucket_guid: row.get(2)?,
        owner_guid: row.get(3)?,
        author_guid: row.get(4)?,
        key: row.get(5)?,
        content_type: row.get(6)?,
        content_length: content_length as u64,
        version: row.get(8)?,
        etag: row.get(9)?,
        md5: row.get(10)?,
        blob_filename: row.get(11)?,
        is_folder: row.get(12)?,
        delete_marker: row.get(13)?,
        created_utc: row.get(14)?,
        last_update_utc: row.get(15)?,
        last_access_utc: row.get(16)?,
        expiration_utc: row.get(17)?,
    })
}

fn insert_object_row(conn: &Connection, record: &ObjectRecord) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO objects
            (guid, bucket_guid, owner_guid, author_guid, key, content_type,
             content_length, version, etag, md5, blob_filename, is_folder,
             delete_marker, created_utc, last_update_utc, last_access_utc, expiration_utc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            record.guid,
            record.bucket_guid,
            record.owner_guid,
            record.author_guid,
            record.key,
            record.content_type,
            record.content_length as i64,
            record.version,
            record.etag,
            record.md5,
            record.blob_filename,
            record.is_folder,
            record.delete_marker,
            record.created_utc,
            record.last_update_utc,
            record.last_access_utc,
            record.expiration_utc,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn tag_pair_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<(String, String)> {
    Ok((row.get(offset)?, row.get(offset + 1)?))
}

fn grantee_from_row(row: &Row<'_>, user_idx: usize) -> rusqlite::Result<Grantee> {
    let group_idx = user_idx + 1;
    let user_guid: Option<String> = row.get(user_idx)?;
    let user_group: Option<String> = row.get(group_idx)?;
    match (user_guid, user_group) {
        (_, Some(group)) => group
            .parse::<UserGroup>()
            .map(Grantee::Group)
            .map_err(|e| conversion_error(group_idx, e)),
        (Some(guid), None) => Ok(Grantee::User(guid)),
        (None, None) => Err(conversion_error(
            user_idx,
            anyhow::anyhow!("ACL row carries neither user nor group"),
        )),
    }
}

fn permissions_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<AclPermissions> {
    Ok(AclPermissions {
        permit_read: row.get(offset)?,
        permit_write: row.get(offset + 1)?,
        permit_read_acp: row.get(offset + 2)?,
        permit_write_acp: row.get(offset + 3)?,
        full_control: row.get(offset + 4)?,
    })
}

/// Columns: guid, bucket_guid, user_guid, user_group, issued_by, flags x5, created_utc.
fn bucket_acl_from_row(row: &Row<'_>) -> rusqlite::Result<BucketAclRecord> {
    Ok(BucketAclRecord {
        guid: row.get(0)?,
        bucket_guid: row.get(1)?,
        grantee: grantee_from_row(row, 2)?,
        issued_by_user_guid: row.get(4)?,
        permissions: permissions_from_row(row, 5)?,
        created_utc: row.get(10)?,
    })
}

/// Columns: guid, bucket_guid, object_guid, user_guid, user_group, issued_by, flags x5, created_utc.
fn object_acl_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectAclRecord> {
    Ok(ObjectAclRecord {
        guid: row.get(0)?,
        bucket_guid: row.get(1)?,
        object_guid: row.get(2)?,
        grantee: grantee_from_row(row, 3)?,
        issued_by_user_guid: row.get(5)?,
        permissions: permissions_from_row(row, 6)?,
        created_utc: row.get(11)?,
    })
}

fn upload_from_row(row: &Row<'_>) -> rusqlite::Result<UploadRecord> {
    Ok(UploadRecord {
        guid: row.get(0)?,
        bucket_guid: row.get(1)?,
        owner_guid: row.get(2)?,
        author_guid: row.get(3)?,
        key: row.get(4)?,
        content_type: row.get(5)?,
        created_utc: row.get(6)?,
        last_access_utc: row.get(7)?,
        expiration_utc: row.get(8)?,
    })
}

fn part_from_row(row: &Row<'_>) -> rusqlite::Result<UploadPartRecord> {
    let part_length: i64 = row.get(5)?;
    Ok(UploadPartRecord {
        guid: row.get(0)?,
        bucket_guid: row.get(1)?,
        owner_guid: row.get(2)?,
        upload_guid: row.get(3)?,
        part_number: row.get(4)?,
        part_length: part_length as u64,
        md5: row.get(6)?,
        sha1: row.get(7)?,
        sha256: row.get(8)?,
        created_utc: row.get(9)?,
    })
}

// ── MetadataStore implementation ───────────────────────────────────

impl MetadataStore for SqliteMetadataStore {
    // ── Users ───────────────────────────────────────────────────────

    fn insert_user(&self, record: UserRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO users (guid, name, email, created_utc) VALUES (?1, ?2, ?3, ?4)",
                params![record.guid, record.name, record.email, record.created_utc],
            )?;
            Ok(())
        })
    }

    fn get_user(&self, guid: &str) -> StoreFuture<'_, Option<UserRecord>> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE guid = ?1"),
                    params![guid],
                    user_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn get_user_by_email(&self, email: &str) -> StoreFuture<'_, Option<UserRecord>> {
        let email = email.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                    params![email],
                    user_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn list_users(&self) -> StoreFuture<'_, Vec<UserRecord>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt =
                conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY name"))?;
            let users = stmt
                .query_map([], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(users)
        })
    }

    fn delete_user(&self, guid: &str) -> StoreFuture<'_, ()> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute("DELETE FROM users WHERE guid = ?1", params![guid])?;
            Ok(())
        })
    }

    // ── Credentials ─────────────────────────────────────────────────

    fn insert_credential(&self, record: CredentialRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO credential
                    (guid, user_guid, description, access_key, secret_key, is_base64, created_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.guid,
                    record.user_guid,
                    record.description,
                    record.access_key,
                    record.secret_key,
                    record.is_base64,
                    record.created_utc,
                ],
            )?;
            Ok(())
        })
    }

    fn get_credential(&self, access_key: &str) -> StoreFuture<'_, Option<CredentialRecord>> {
        let access_key = access_key.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {CREDENTIAL_COLUMNS} FROM credential WHERE access_key = ?1"),
                    params![access_key],
                    credential_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn get_credential_by_guid(&self, guid: &str) -> StoreFuture<'_, Option<CredentialRecord>> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {CREDENTIAL_COLUMNS} FROM credential WHERE guid = ?1"),
                    params![guid],
                    credential_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn list_credentials(
        &self,
        user_guid: Option<&str>,
    ) -> StoreFuture<'_, Vec<CredentialRecord>> {
        let user_guid = user_guid.map(|s| s.to_string());
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credential
                 WHERE (?1 IS NULL OR user_guid = ?1)
                 ORDER BY created_utc"
            ))?;
            let creds = stmt
                .query_map(params![user_guid], credential_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(creds)
        })
    }

    fn delete_credential(&self, guid: &str) -> StoreFuture<'_, ()> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute("DELETE FROM credential WHERE guid = ?1", params![guid])?;
            Ok(())
        })
    }

    // ── Buckets ─────────────────────────────────────────────────────

    fn insert_bucket(&self, record: BucketRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                &format!(
                    "INSERT INTO buckets ({BUCKET_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    record.guid,
                    record.name,
                    record.owner_guid,
                    record.region,
                    record.storage_type.as_str(),
                    record.disk_directory,
                    record.enable_versioning,
                    record.enable_public_read,
                    record.enable_public_write,
                    record.created_utc,
                ],
            )?;
            Ok(())
        })
    }

    fn get_bucket(&self, name: &str) -> StoreFuture<'_, Option<BucketRecord>> {
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE name = ?1"),
                    params![name],
                    bucket_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn get_bucket_by_guid(&self, guid: &str) -> StoreFuture<'_, Option<BucketRecord>> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE guid = ?1"),
                    params![guid],
                    bucket_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn list_buckets(&self) -> StoreFuture<'_, Vec<BucketRecord>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt =
                conn.prepare(&format!("SELECT {BUCKET_COLUMNS} FROM buckets ORDER BY name"))?;
            let buckets = stmt
                .query_map([], bucket_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(buckets)
        })
    }

    fn update_bucket(&self, record: BucketRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE buckets SET
                    owner_guid = ?2, region = ?3, storage_type = ?4, disk_directory = ?5,
                    enable_versioning = ?6, enable_public_read = ?7, enable_public_write = ?8
                 WHERE guid = ?1",
                params![
                    record.guid,
                    record.owner_guid,
                    record.region,
                    record.storage_type.as_str(),
                    record.disk_directory,
                    record.enable_versioning,
                    record.enable_public_read,
                    record.enable_public_write,
                ],
            )?;
            Ok(())
        })
    }

    fn delete_bucket(&self, guid: &str) -> StoreFuture<'_, ()> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // Foreign key cascade removes objects, tags, ACLs and uploads.
            conn.execute("DELETE FROM buckets WHERE guid = ?1", params![guid])?;
            Ok(())
        })
    }

    // ── Objects ─────────────────────────────────────────────────────

    fn insert_object(&self, record: ObjectRecord) -> StoreFuture<'_, i64> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            Ok(insert_object_row(&conn, &record)?)
        })
    }

    fn insert_object_version(
        &self,
        mut record: ObjectRecord,
        allow_existing: bool,
    ) -> StoreFuture<'_, VersionInsert> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;

            if !allow_existing {
                let live: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM objects
                     WHERE bucket_guid = ?1 AND key = ?2 AND delete_marker = 0)",
                    params![record.bucket_guid, record.key],
                    |row| row.get(0),
                )?;
                if live {
                    return Ok(VersionInsert::LiveVersionExists);
                }
            }

            record.version = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM objects
                 WHERE bucket_guid = ?1 AND key = ?2",
                params![record.bucket_guid, record.key],
                |row| row.get(0),
            )?;
            let id = insert_object_row(&tx, &record)?;
            tx.commit()?;
            Ok(VersionInsert::Inserted {
                id,
                version: record.version,
            })
        })
    }

    fn update_object(&self, record: ObjectRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE objects SET
                    owner_guid = ?2, author_guid = ?3, content_type = ?4, content_length = ?5,
                    etag = ?6, md5 = ?7, is_folder = ?8, delete_marker = ?9,
                    last_update_utc = ?10, last_access_utc = ?11, expiration_utc = ?12
                 WHERE guid = ?1",
                params![
                    record.guid,
                    record.owner_guid,
                    record.author_guid,
                    record.content_type,
                    record.content_length as i64,
                    record.etag,
                    record.md5,
                    record.is_folder,
                    record.delete_marker,
                    record.last_update_utc,
                    record.last_access_utc,
                    record.expiration_utc,
                ],
            )?;
            Ok(())
        })
    }

    fn delete_object(&self, guid: &str) -> StoreFuture<'_, ()> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // Foreign key cascade removes the version's tags and ACLs.
            conn.execute("DELETE FROM objects WHERE guid = ?1", params![guid])?;
            Ok(())
        })
    }

    fn get_object_by_guid(&self, guid: &str) -> StoreFuture<'_, Option<ObjectRecord>> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE guid = ?1"),
                    params![guid],
                    object_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn get_latest_object(
        &self,
        bucket_guid: &str,
        key: &str,
    ) -> StoreFuture<'_, Option<ObjectRecord>> {
        let bucket_guid = bucket_guid.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!(
                        "SELECT {OBJECT_COLUMNS} FROM objects
                         WHERE bucket_guid = ?1 AND key = ?2 AND delete_marker = 0
                         ORDER BY version DESC
                         LIMIT 1"
                    ),
                    params![bucket_guid, key],
                    object_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn get_object_version(
        &self,
        bucket_guid: &str,
        key: &str,
        version: i64,
    ) -> StoreFuture<'_, Option<ObjectRecord>> {
        let bucket_guid = bucket_guid.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!(
                        "SELECT {OBJECT_COLUMNS} FROM objects
                         WHERE bucket_guid = ?1 AND key = ?2 AND version = ?3"
                    ),
                    params![bucket_guid, key, version],
                    object_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn enumerate_objects(
        &self,
        bucket_guid: &str,
        prefix: &str,
        start_id: i64,
        limit: u32,
        latest_only: bool,
    ) -> StoreFuture<'_, Vec<ObjectRecord>> {
        let bucket_guid = bucket_guid.to_string();
        let prefix = prefix.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // substr() keeps the prefix match case-sensitive, unlike LIKE.
            let mut stmt = conn.prepare(&format!(
                "SELECT {OBJECT_COLUMNS} FROM objects o
                 WHERE o.bucket_guid = ?1
                   AND o.id >= ?2
                   AND substr(o.key, 1, length(?3)) = ?3
                   AND (?5 = 0 OR (
                        o.delete_marker = 0
                        AND o.version = (
                            SELECT MAX(v.version) FROM objects v
                            WHERE v.bucket_guid = o.bucket_guid
                              AND v.key = o.key
                              AND v.delete_marker = 0)))
                 ORDER BY o.id
                 LIMIT ?4"
            ))?;
            let rows = stmt
                .query_map(
                    params![bucket_guid, start_id, prefix, limit, latest_only],
                    object_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn object_statistics(&self, bucket_guid: &str) -> StoreFuture<'_, ObjectStatistics> {
        let bucket_guid = bucket_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let (objects, bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(content_length), 0)
                 FROM objects WHERE bucket_guid = ?1",
                params![bucket_guid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(ObjectStatistics {
                objects: objects as u64,
                bytes: bytes as u64,
            })
        })
    }

    // ── Tags ────────────────────────────────────────────────────────

    fn list_bucket_tags(&self, bucket_guid: &str) -> StoreFuture<'_, Vec<BucketTagRecord>> {
        let bucket_guid = bucket_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT guid, bucket_guid, key, value FROM buckettags
                 WHERE bucket_guid = ?1 ORDER BY rowid",
            )?;
            let tags = stmt
                .query_map(params![bucket_guid], |row| {
                    let (key, value) = tag_pair_from_row(row, 2)?;
                    Ok(BucketTagRecord {
                        guid: row.get(0)?,
                        bucket_guid: row.get(1)?,
                        key,
                        value,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tags)
        })
    }

    fn replace_bucket_tags(
        &self,
        bucket_guid: &str,
        tags: Vec<BucketTagRecord>,
    ) -> StoreFuture<'_, ()> {
        let bucket_guid = bucket_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM buckettags WHERE bucket_guid = ?1",
                params![bucket_guid],
            )?;
            for tag in &tags {
                tx.execute(
                    "INSERT INTO buckettags (guid, bucket_guid, key, value) VALUES (?1, ?2, ?3, ?4)",
                    params![tag.guid, bucket_guid, tag.key, tag.value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn list_object_tags(&self, object_guid: &str) -> StoreFuture<'_, Vec<ObjectTagRecord>> {
        let object_guid = object_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT guid, bucket_guid, object_guid, key, value FROM objecttags
                 WHERE object_guid = ?1 ORDER BY rowid",
            )?;
            let tags = stmt
                .query_map(params![object_guid], |row| {
                    let (key, value) = tag_pair_from_row(row, 3)?;
                    Ok(ObjectTagRecord {
                        guid: row.get(0)?,
                        bucket_guid: row.get(1)?,
                        object_guid: row.get(2)?,
                        key,
                        value,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tags)
        })
    }

    fn replace_object_tags(
        &self,
        object_guid: &str,
        tags: Vec<ObjectTagRecord>,
    ) -> StoreFuture<'_, ()> {
        let object_guid = object_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM objecttags WHERE object_guid = ?1",
                params![object_guid],
            )?;
            for tag in &tags {
                tx.execute(
                    "INSERT INTO objecttags (guid, bucket_guid, object_guid, key, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![tag.guid, tag.bucket_guid, object_guid, tag.key, tag.value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    // ── ACLs ────────────────────────────────────────────────────────

    fn list_bucket_acls(&self, bucket_guid: &str) -> StoreFuture<'_, Vec<BucketAclRecord>> {
        let bucket_guid = bucket_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT guid, bucket_guid, user_guid, user_group, issued_by_user_guid,
                        {ACL_FLAG_COLUMNS}, created_utc
                 FROM bucketacls WHERE bucket_guid = ?1 ORDER BY rowid"
            ))?;
            let acls = stmt
                .query_map(params![bucket_guid], bucket_acl_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(acls)
        })
    }

    fn get_bucket_acl(
        &self,
        bucket_guid: &str,
        grantee: &Grantee,
    ) -> StoreFuture<'_, Option<BucketAclRecord>> {
        let bucket_guid = bucket_guid.to_string();
        let (user_guid, user_group) = grantee.columns();
        let user_guid = user_guid.map(|s| s.to_string());
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!(
                        "SELECT guid, bucket_guid, user_guid, user_group, issued_by_user_guid,
                                {ACL_FLAG_COLUMNS}, created_utc
                         FROM bucketacls
                         WHERE bucket_guid = ?1 AND user_guid IS ?2 AND user_group IS ?3"
                    ),
                    params![bucket_guid, user_guid, user_group],
                    bucket_acl_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn upsert_bucket_acl(&self, record: BucketAclRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let (user_guid, user_group) = record.grantee.columns();
            let p = record.permissions;
            let updated = conn.execute(
                "UPDATE bucketacls SET
                    issued_by_user_guid = ?4, permit_read = ?5, permit_write = ?6,
                    permit_read_acp = ?7, permit_write_acp = ?8, full_control = ?9
                 WHERE bucket_guid = ?1 AND user_guid IS ?2 AND user_group IS ?3",
                params![
                    record.bucket_guid,
                    user_guid,
                    user_group,
                    record.issued_by_user_guid,
                    p.permit_read,
                    p.permit_write,
                    p.permit_read_acp,
                    p.permit_write_acp,
                    p.full_control,
                ],
            )?;
            if updated == 0 {
                conn.execute(
                    &format!(
                        "INSERT INTO bucketacls
                            (guid, bucket_guid, user_guid, user_group, issued_by_user_guid,
                             {ACL_FLAG_COLUMNS}, created_utc)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                    ),
                    params![
                        record.guid,
                        record.bucket_guid,
                        user_guid,
                        user_group,
                        record.issued_by_user_guid,
                        p.permit_read,
                        p.permit_write,
                        p.permit_read_acp,
                        p.permit_write_acp,
                        p.full_control,
                        record.created_utc,
                    ],
                )?;
            }
            Ok(())
        })
    }

    fn delete_bucket_acls(&self, bucket_guid: &str) -> StoreFuture<'_, ()> {
        let bucket_guid = bucket_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "DELETE FROM bucketacls WHERE bucket_guid = ?1",
                params![bucket_guid],
            )?;
            Ok(())
        })
    }

    fn list_object_acls(&self, object_guid: &str) -> StoreFuture<'_, Vec<ObjectAclRecord>> {
        let object_guid = object_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT guid, bucket_guid, object_guid, user_guid, user_group, issued_by_user_guid,
                        {ACL_FLAG_COLUMNS}, created_utc
                 FROM objectacls WHERE object_guid = ?1 ORDER BY rowid"
            ))?;
            let acls = stmt
                .query_map(params![object_guid], object_acl_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(acls)
        })
    }

    fn get_object_acl(
        &self,
        object_guid: &str,
        grantee: &Grantee,
    ) -> StoreFuture<'_, Option<ObjectAclRecord>> {
        let object_guid = object_guid.to_string();
        let (user_guid, user_group) = grantee.columns();
        let user_guid = user_guid.map(|s| s.to_string());
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!(
                        "SELECT guid, bucket_guid, object_guid, user_guid, user_group,
                                issued_by_user_guid, {ACL_FLAG_COLUMNS}, created_utc
                         FROM objectacls
                         WHERE object_guid = ?1 AND user_guid IS ?2 AND user_group IS ?3"
                    ),
                    params![object_guid, user_guid, user_group],
                    object_acl_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn upsert_object_acl(&self, record: ObjectAclRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let (user_guid, user_group) = record.grantee.columns();
            let p = record.permissions;
            let updated = conn.execute(
                "UPDATE objectacls SET
                    issued_by_user_guid = ?4, permit_read = ?5, permit_write = ?6,
                    permit_read_acp = ?7, permit_write_acp = ?8, full_control = ?9
                 WHERE object_guid = ?1 AND user_guid IS ?2 AND user_group IS ?3",
                params![
                    record.object_guid,
                    user_guid,
                    user_group,
                    record.issued_by_user_guid,
                    p.permit_read,
                    p.permit_write,
                    p.permit_read_acp,
                    p.permit_write_acp,
                    p.full_control,
                ],
            )?;
            if updated == 0 {
                conn.execute(
                    &format!(
                        "INSERT INTO objectacls
                            (guid, bucket_guid, object_guid, user_guid, user_group,
                             issued_by_user_guid, {ACL_FLAG_COLUMNS}, created_utc)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                    ),
                    params![
                        record.guid,
                        record.bucket_guid,
                        record.object_guid,
                        user_guid,
                        user_group,
                        record.issued_by_user_guid,
                        p.permit_read,
                        p.permit_write,
                        p.permit_read_acp,
                        p.permit_write_acp,
                        p.full_control,
                        record.created_utc,
                    ],
                )?;
            }
            Ok(())
        })
    }

    fn delete_object_acls(&self, object_guid: &str) -> StoreFuture<'_, ()> {
        let object_guid = object_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "DELETE FROM objectacls WHERE object_guid = ?1",
                params![object_guid],
            )?;
            Ok(())
        })
    }

    // ── Multipart uploads ───────────────────────────────────────────

    fn insert_upload(&self, record: UploadRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                &format!(
                    "INSERT INTO uploads ({UPLOAD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    record.guid,
                    record.bucket_guid,
                    record.owner_guid,
                    record.author_guid,
                    record.key,
                    record.content_type,
                    record.created_utc,
                    record.last_access_utc,
                    record.expiration_utc,
                ],
            )?;
            Ok(())
        })
    }

    fn get_upload(&self, guid: &str) -> StoreFuture<'_, Option<UploadRecord>> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE guid = ?1"),
                    params![guid],
                    upload_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn list_uploads(&self, bucket_guid: &str) -> StoreFuture<'_, Vec<UploadRecord>> {
        let bucket_guid = bucket_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {UPLOAD_COLUMNS} FROM uploads
                 WHERE bucket_guid = ?1 ORDER BY key, created_utc"
            ))?;
            let uploads = stmt
                .query_map(params![bucket_guid], upload_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(uploads)
        })
    }

    fn list_expired_uploads(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<UploadRecord>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {UPLOAD_COLUMNS} FROM uploads
                 WHERE expiration_utc < ?1 ORDER BY expiration_utc"
            ))?;
            let uploads = stmt
                .query_map(params![now], upload_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(uploads)
        })
    }

    fn delete_upload(&self, guid: &str) -> StoreFuture<'_, ()> {
        let guid = guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM uploadparts WHERE upload_guid = ?1",
                params![guid],
            )?;
            tx.execute("DELETE FROM uploads WHERE guid = ?1", params![guid])?;
            tx.commit()?;
            Ok(())
        })
    }

    fn put_upload_part(&self, record: UploadPartRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO uploadparts ({PART_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    record.guid,
                    record.bucket_guid,
                    record.owner_guid,
                    record.upload_guid,
                    record.part_number,
                    record.part_length as i64,
                    record.md5,
                    record.sha1,
                    record.sha256,
                    record.created_utc,
                ],
            )?;
            Ok(())
        })
    }

    fn list_upload_parts(&self, upload_guid: &str) -> StoreFuture<'_, Vec<UploadPartRecord>> {
        let upload_guid = upload_guid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {PART_COLUMNS} FROM uploadparts
                 WHERE upload_guid = ?1 ORDER BY part_number"
            ))?;
            let parts = stmt
                .query_map(params![upload_guid], part_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(parts)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::StorageType;

    fn test_store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(":memory:").expect("failed to create in-memory store")
    }

    fn make_bucket(guid: &str, name: &str) -> BucketRecord {
        BucketRecord {
            guid: guid.to_string(),
            name: name.to_string(),
            owner_guid: "owner".to_string(),
            region: "us-west-1".to_string(),
            storage_type: StorageType::Disk,
            disk_directory: format!("./disk/{name}/objects"),
            enable_versioning: false,
            enable_public_read: false,
            enable_public_write: false,
            created_utc: Utc::now(),
        }
    }

    fn make_object(bucket_guid: &str, guid: &str, key: &str, version: i64) -> ObjectRecord {
        let now = Utc::now();
        ObjectRecord {
            id: 0,
            guid: guid.to_string(),
            bucket_guid: bucket_guid.to_string(),
            owner_guid: "owner".to_string(),
            author_guid: "owner".to_string(),
            key: key.to_string(),
            content_type: "text/plain".to_string(),
            content_length: 5,
            version,
            etag: "etag".to_string(),
            md5: "md5".to_string(),
            blob_filename: guid.to_string(),
            is_folder: false,
            delete_marker: false,
            created_utc: now,
            last_update_utc: now,
            last_access_utc: now,
            expiration_utc: None,
        }
    }

    fn make_bucket_acl(guid: &str, grantee: Grantee, perms: AclPermissions) -> BucketAclRecord {
        BucketAclRecord {
            guid: guid.to_string(),
            bucket_guid: "b1".to_string(),
            grantee,
            issued_by_user_guid: "owner".to_string(),
            permissions: perms,
            created_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_schema_idempotent() {
        let store = test_store();
        store.init_db().expect("second init_db failed");
        store.init_db().expect("third init_db failed");
    }

    #[tokio::test]
    async fn test_bucket_roundtrip_and_update() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();

        let mut b = store.get_bucket("alpha").await.unwrap().unwrap();
        assert_eq!(b.guid, "b1");
        assert!(!b.enable_public_read);

        b.enable_public_read = true;
        b.enable_versioning = true;
        store.update_bucket(b).await.unwrap();

        let b = store.get_bucket_by_guid("b1").await.unwrap().unwrap();
        assert!(b.enable_public_read);
        assert!(b.enable_versioning);
        assert!(store.get_bucket("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_bucket_name_rejected() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();
        assert!(store.insert_bucket(make_bucket("b2", "alpha")).await.is_err());
    }

    #[tokio::test]
    async fn test_latest_object_skips_delete_markers() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();
        store.insert_object(make_object("b1", "o1", "a.txt", 1)).await.unwrap();
        let mut v2 = make_object("b1", "o2", "a.txt", 2);
        v2.delete_marker = true;
        store.insert_object(v2).await.unwrap();

        let latest = store.get_latest_object("b1", "a.txt").await.unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert!(store.get_latest_object("b1", "b.txt").await.unwrap().is_none());

        let exact = store.get_object_version("b1", "a.txt", 2).await.unwrap().unwrap();
        assert!(exact.delete_marker);
    }

    #[tokio::test]
    async fn test_insert_object_version_assigns_next_version() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();

        let first = store
            .insert_object_version(make_object("b1", "o1", "a.txt", 0), false)
            .await
            .unwrap();
        assert!(matches!(first, VersionInsert::Inserted { version: 1, .. }));

        let refused = store
            .insert_object_version(make_object("b1", "o2", "a.txt", 0), false)
            .await
            .unwrap();
        assert_eq!(refused, VersionInsert::LiveVersionExists);
        assert!(store.get_object_by_guid("o2").await.unwrap().is_none());

        let second = store
            .insert_object_version(make_object("b1", "o3", "a.txt", 0), true)
            .await
            .unwrap();
        assert!(matches!(second, VersionInsert::Inserted { version: 2, .. }));

        // A delete marker still holds its number, and is not a live version.
        let mut marker = store.get_object_by_guid("o3").await.unwrap().unwrap();
        marker.delete_marker = true;
        store.update_object(marker).await.unwrap();
        let mut v1 = store.get_object_by_guid("o1").await.unwrap().unwrap();
        v1.delete_marker = true;
        store.update_object(v1).await.unwrap();
        let third = store
            .insert_object_version(make_object("b1", "o4", "a.txt", 0), false)
            .await
            .unwrap();
        assert!(matches!(third, VersionInsert::Inserted { version: 3, .. }));
    }

    #[tokio::test]
    async fn test_enumerate_latest_only() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();
        store.insert_object(make_object("b1", "o1", "a.txt", 1)).await.unwrap();
        store.insert_object(make_object("b1", "o2", "b.txt", 1)).await.unwrap();
        store.insert_object(make_object("b1", "o3", "a.txt", 2)).await.unwrap();
        store.insert_object(make_object("b1", "o4", "A.txt", 1)).await.unwrap();

        let all = store.enumerate_objects("b1", "", 0, 100, false).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let latest = store.enumerate_objects("b1", "", 0, 100, true).await.unwrap();
        let guids: Vec<_> = latest.iter().map(|o| o.guid.as_str()).collect();
        assert_eq!(guids, vec!["o2", "o3", "o4"]);

        let prefixed = store.enumerate_objects("b1", "a", 0, 100, true).await.unwrap();
        assert_eq!(prefixed.len(), 1);
        assert_eq!(prefixed[0].guid, "o3");
    }

    #[tokio::test]
    async fn test_object_statistics() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();
        let stats = store.object_statistics("b1").await.unwrap();
        assert_eq!(stats, ObjectStatistics::default());

        store.insert_object(make_object("b1", "o1", "a", 1)).await.unwrap();
        store.insert_object(make_object("b1", "o2", "b", 1)).await.unwrap();
        let stats = store.object_statistics("b1").await.unwrap();
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.bytes, 10);
    }

    #[tokio::test]
    async fn test_bucket_acl_upsert_keeps_one_row() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();

        let grantee = Grantee::User("u1".to_string());
        store
            .upsert_bucket_acl(make_bucket_acl("a1", grantee.clone(), AclPermissions::read()))
            .await
            .unwrap();
        store
            .upsert_bucket_acl(make_bucket_acl(
                "a2",
                grantee.clone(),
                AclPermissions::full_control(),
            ))
            .await
            .unwrap();

        let acls = store.list_bucket_acls("b1").await.unwrap();
        assert_eq!(acls.len(), 1);
        assert!(acls[0].permissions.full_control);
        assert_eq!(acls[0].guid, "a1");

        let group = Grantee::Group(UserGroup::AllUsers);
        assert!(store.get_bucket_acl("b1", &group).await.unwrap().is_none());
        store
            .upsert_bucket_acl(make_bucket_acl("a3", group.clone(), AclPermissions::read()))
            .await
            .unwrap();
        let found = store.get_bucket_acl("b1", &group).await.unwrap().unwrap();
        assert_eq!(found.grantee, group);
        assert_eq!(store.list_bucket_acls("b1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_bucket_tags() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();
        let tag = |guid: &str, k: &str| BucketTagRecord {
            guid: guid.to_string(),
            bucket_guid: "b1".to_string(),
            key: k.to_string(),
            value: "v".to_string(),
        };

        store
            .replace_bucket_tags("b1", vec![tag("t1", "a"), tag("t2", "b")])
            .await
            .unwrap();
        store.replace_bucket_tags("b1", vec![tag("t3", "c")]).await.unwrap();

        let tags = store.list_bucket_tags("b1").await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].key, "c");
    }

    #[tokio::test]
    async fn test_delete_object_cascades_tags_and_acls() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();
        store.insert_object(make_object("b1", "o1", "a", 1)).await.unwrap();
        store
            .replace_object_tags(
                "o1",
                vec![ObjectTagRecord {
                    guid: "t1".to_string(),
                    bucket_guid: "b1".to_string(),
                    object_guid: "o1".to_string(),
                    key: "k".to_string(),
                    value: "v".to_string(),
                }],
            )
            .await
            .unwrap();
        store
            .upsert_object_acl(ObjectAclRecord {
                guid: "a1".to_string(),
                bucket_guid: "b1".to_string(),
                object_guid: "o1".to_string(),
                grantee: Grantee::Group(UserGroup::AuthenticatedUsers),
                issued_by_user_guid: "owner".to_string(),
                permissions: AclPermissions::read(),
                created_utc: Utc::now(),
            })
            .await
            .unwrap();

        store.delete_object("o1").await.unwrap();
        assert!(store.get_object_by_guid("o1").await.unwrap().is_none());
        assert!(store.list_object_tags("o1").await.unwrap().is_empty());
        assert!(store.list_object_acls("o1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_uploads_and_parts() {
        let store = test_store();
        store.insert_bucket(make_bucket("b1", "alpha")).await.unwrap();
        let now = Utc::now();
        let upload = |guid: &str, expires: DateTime<Utc>| UploadRecord {
            guid: guid.to_string(),
            bucket_guid: "b1".to_string(),
            owner_guid: "owner".to_string(),
            author_guid: "owner".to_string(),
            key: "big.bin".to_string(),
            content_type: "application/octet-stream".to_string(),
            created_utc: now,
            last_access_utc: now,
            expiration_utc: expires,
        };
        store
            .insert_upload(upload("old", now - chrono::Duration::days(1)))
            .await
            .unwrap();
        store
            .insert_upload(upload("new", now + chrono::Duration::days(7)))
            .await
            .unwrap();

        let part = |guid: &str, n: u32| UploadPartRecord {
            guid: guid.to_string(),
            bucket_guid: "b1".to_string(),
            owner_guid: "owner".to_string(),
            upload_guid: "old".to_string(),
            part_number: n,
            part_length: 3,
            md5: String::new(),
            sha1: String::new(),
            sha256: String::new(),
            created_utc: now,
        };
        store.put_upload_part(part("p2", 2)).await.unwrap();
        store.put_upload_part(part("p1", 1)).await.unwrap();
        store.put_upload_part(part("p1b", 1)).await.unwrap();

        let parts = store.list_upload_parts("old").await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[0].guid, "p1b");

        let expired = store.list_expired_uploads(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].guid, "old");

        store.delete_upload("old").await.unwrap();
        assert!(store.get_upload("old").await.unwrap().is_none());
        assert!(store.list_upload_parts("old").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credentials_by_user() {
        let store = test_store();
        let cred = |guid: &str, user: &str, ak: &str| CredentialRecord {
            guid: guid.to_string(),
            user_guid: user.to_string(),
            description: String::new(),
            access_key: ak.to_string(),
            secret_key: "secret".to_string(),
            is_base64: false,
            created_utc: Utc::now(),
        };
        store.insert_credential(cred("c1", "u1", "ak1")).await.unwrap();
        store.insert_credential(cred("c2", "u2", "ak2")).await.unwrap();
        assert!(store.insert_credential(cred("c3", "u2", "ak1")).await.is_err());

        assert_eq!(store.list_credentials(None).await.unwrap().len(), 2);
        let mine = store.list_credentials(Some("u2")).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].access_key, "ak2");
        assert_eq!(
            store.get_credential("ak1").await.unwrap().unwrap().user_guid,
            "u1"
        );
    }
}
