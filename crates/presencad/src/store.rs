//! SQLite persistence for profiles, check-ins, and class schedules.
//!
//! Sample and centroid blobs are encrypted with AES-256-GCM before they hit
//! disk; a per-installation 32-byte key is generated at first use and stored
//! at `{db_dir}/.key` (mode 0600). Check-in writes go through
//! `INSERT OR IGNORE` on the deterministic primary key, which makes the
//! check-then-create atomic within this database.

use chrono::{DateTime, SecondsFormat, Utc};
use presenca_core::attendance::{
    AttendanceStore, CheckInRecord, CheckInSource, ClassWindow,
};
use presenca_core::enroll::{BiometricUpdate, ProfileStore};
use presenca_core::{Embedding, FaceProfile, EMBEDDING_DIM};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("invalid timestamp in database: {0}")]
    InvalidTimestamp(String),
    #[error("invalid check-in source in database: {0}")]
    InvalidSource(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// Metadata about an enrolled profile (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileInfo {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub samples: usize,
}

/// SQLite-backed store for the kiosk daemon.
#[derive(Clone)]
pub struct KioskStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl KioskStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key.
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/presenca"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS profiles (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     active INTEGER NOT NULL DEFAULT 1,
                     centroid BLOB,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS profile_samples (
                     profile_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                     seq INTEGER NOT NULL,
                     embedding BLOB NOT NULL,
                     PRIMARY KEY (profile_id, seq)
                 );
                 CREATE TABLE IF NOT EXISTS checkins (
                     id TEXT PRIMARY KEY,
                     subject_id TEXT NOT NULL,
                     class_id TEXT,
                     source TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_checkins_subject_time
                     ON checkins(subject_id, created_at);
                 CREATE TABLE IF NOT EXISTS classes (
                     id TEXT PRIMARY KEY,
                     starts_at TEXT NOT NULL,
                     ends_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Create a new profile. Returns the generated UUID.
    pub async fn create_profile(&self, name: &str) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let name = name.to_string();
        let created_at = ts_to_sql(Utc::now());
        let id_clone = id.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO profiles (id, name, active, created_at) VALUES (?1, ?2, 1, ?3)",
                    rusqlite::params![id_clone, name, created_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// List profile metadata (no embeddings).
    pub async fn list_profiles(&self) -> Result<Vec<ProfileInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT p.id, p.name, p.active,
                            (SELECT COUNT(*) FROM profile_samples s WHERE s.profile_id = p.id)
                     FROM profiles p ORDER BY p.id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ProfileInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        active: row.get::<_, i64>(2)? != 0,
                        samples: row.get::<_, i64>(3)? as usize,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Flip a profile's active flag. Inactive profiles stay enrolled but
    /// drop out of matching.
    pub async fn set_profile_active(&self, profile_id: &str, active: bool) -> Result<bool, StoreError> {
        let profile_id = profile_id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE profiles SET active = ?2 WHERE id = ?1",
                    rusqlite::params![profile_id, active as i64],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_profiles(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Insert or replace a class schedule row.
    pub async fn set_class_window(&self, window: &ClassWindow) -> Result<(), StoreError> {
        let id = window.id.clone();
        let starts_at = ts_to_sql(window.starts_at);
        let ends_at = ts_to_sql(window.ends_at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO classes (id, starts_at, ends_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET starts_at = ?2, ends_at = ?3",
                    rusqlite::params![id, starts_at, ends_at],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────

    /// Encrypt embedding values. Output: 12-byte random nonce || ciphertext
    /// || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding(&plaintext)
    }
}

impl ProfileStore for KioskStore {
    type Error = StoreError;

    /// Load all profiles with decrypted biometrics, ordered by id.
    async fn load_profiles(&self) -> Result<Vec<FaceProfile>, StoreError> {
        type ProfileRow = (String, String, i64, Option<Vec<u8>>);
        type SampleRow = (String, Vec<u8>);

        let (profile_rows, sample_rows): (Vec<ProfileRow>, Vec<SampleRow>) = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, active, centroid FROM profiles ORDER BY id",
                )?;
                let profiles = stmt
                    .query_map([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut stmt = conn.prepare(
                    "SELECT profile_id, embedding FROM profile_samples
                     ORDER BY profile_id, seq",
                )?;
                let samples = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok((profiles, samples))
            })
            .await?;

        // Decrypt outside the blocking closure.
        let mut profiles = Vec::with_capacity(profile_rows.len());
        for (id, name, active, centroid_blob) in profile_rows {
            let centroid = match centroid_blob {
                Some(blob) => Some(Embedding::new(self.decrypt_embedding(&blob)?)),
                None => None,
            };
            let mut samples = Vec::new();
            for (profile_id, blob) in &sample_rows {
                if *profile_id == id {
                    samples.push(Embedding::new(self.decrypt_embedding(blob)?));
                }
            }
            profiles.push(FaceProfile {
                id,
                name,
                active: active != 0,
                samples,
                centroid,
            });
        }
        Ok(profiles)
    }

    /// Apply a biometric update in one transaction: previous samples and
    /// centroid are always replaced wholesale, never partially.
    async fn apply_biometrics(
        &self,
        profile_id: &str,
        update: BiometricUpdate,
    ) -> Result<(), StoreError> {
        let profile_id = profile_id.to_string();

        // Encrypt before entering the SQLite closure.
        let payload = match update {
            BiometricUpdate::Set { samples, centroid } => {
                let mut blobs = Vec::with_capacity(samples.len());
                for sample in &samples {
                    blobs.push(self.encrypt_embedding(&sample.values)?);
                }
                Some((blobs, self.encrypt_embedding(&centroid.values)?))
            }
            BiometricUpdate::Clear => None,
        };

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM profile_samples WHERE profile_id = ?1",
                    [&profile_id],
                )?;
                match payload {
                    Some((blobs, centroid_blob)) => {
                        for (seq, blob) in blobs.iter().enumerate() {
                            tx.execute(
                                "INSERT INTO profile_samples (profile_id, seq, embedding)
                                 VALUES (?1, ?2, ?3)",
                                rusqlite::params![profile_id, seq as i64, blob],
                            )?;
                        }
                        tx.execute(
                            "UPDATE profiles SET centroid = ?2 WHERE id = ?1",
                            rusqlite::params![profile_id, centroid_blob],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "UPDATE profiles SET centroid = NULL WHERE id = ?1",
                            [&profile_id],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }
}

impl AttendanceStore for KioskStore {
    type Error = StoreError;

    async fn find_recent(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CheckInRecord>, StoreError> {
        let subject_id = subject_id.to_string();
        let since = ts_to_sql(since);

        let row: Option<(String, String, Option<String>, String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, subject_id, class_id, source, created_at FROM checkins
                     WHERE subject_id = ?1 AND created_at >= ?2
                     ORDER BY created_at DESC LIMIT 1",
                )?;
                let mut rows = stmt.query_map(rusqlite::params![subject_id, since], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?;
                Ok(rows.next().transpose()?)
            })
            .await?;

        row.map(record_from_row).transpose()
    }

    async fn create_if_absent(&self, record: &CheckInRecord) -> Result<bool, StoreError> {
        let id = record.id.clone();
        let subject_id = record.subject_id.clone();
        let class_id = record.class_id.clone();
        let source = record.source.as_str();
        let created_at = ts_to_sql(record.created_at);

        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "INSERT OR IGNORE INTO checkins (id, subject_id, class_id, source, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, subject_id, class_id, source, created_at],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn class_window(&self, class_id: &str) -> Result<Option<ClassWindow>, StoreError> {
        let class_id = class_id.to_string();

        let row: Option<(String, String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT id, starts_at, ends_at FROM classes WHERE id = ?1")?;
                let mut rows = stmt.query_map([&class_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                Ok(rows.next().transpose()?)
            })
            .await?;

        row.map(|(id, starts_at, ends_at)| {
            Ok(ClassWindow {
                id,
                starts_at: ts_from_sql(&starts_at)?,
                ends_at: ts_from_sql(&ends_at)?,
            })
        })
        .transpose()
    }
}

// ── Key management ────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one
/// (mode 0600, owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────

/// Fixed-width UTC timestamps, so lexicographic order in SQL matches
/// chronological order.
fn ts_to_sql(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(s.to_string()))
}

fn record_from_row(
    (id, subject_id, class_id, source, created_at): (
        String,
        String,
        Option<String>,
        String,
        String,
    ),
) -> Result<CheckInRecord, StoreError> {
    let source = CheckInSource::parse(&source)
        .ok_or_else(|| StoreError::InvalidSource(source.clone()))?;
    Ok(CheckInRecord {
        id,
        subject_id,
        class_id,
        source,
        created_at: ts_from_sql(&created_at)?,
    })
}

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(EMBEDDING_DIM);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }

    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use presenca_core::centroid;

    async fn memory_store() -> KioskStore {
        KioskStore::open(Path::new(":memory:")).await.unwrap()
    }

    fn embedding(fill: f32) -> Embedding {
        Embedding::new((0..EMBEDDING_DIM).map(|i| fill + i as f32 / 1000.0).collect())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 11, 18, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_profile_biometrics_round_trip() {
        let store = memory_store().await;
        let id = store.create_profile("Ana").await.unwrap();

        let samples = vec![embedding(0.1), embedding(0.2), embedding(0.3)];
        let center = centroid(&samples).unwrap();
        store
            .apply_biometrics(
                &id,
                BiometricUpdate::Set {
                    samples: samples.clone(),
                    centroid: center.clone(),
                },
            )
            .await
            .unwrap();

        let profiles = store.load_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        let profile = &profiles[0];
        assert_eq!(profile.id, id);
        assert_eq!(profile.name, "Ana");
        assert!(profile.active);
        assert_eq!(profile.samples, samples);
        assert_eq!(profile.centroid.as_ref(), Some(&center));
        assert!(profile.match_eligible());
    }

    #[tokio::test]
    async fn test_clear_removes_samples_and_centroid() {
        let store = memory_store().await;
        let id = store.create_profile("Ana").await.unwrap();

        let samples = vec![embedding(0.1), embedding(0.2), embedding(0.3)];
        let center = centroid(&samples).unwrap();
        store
            .apply_biometrics(&id, BiometricUpdate::Set { samples, centroid: center })
            .await
            .unwrap();
        store
            .apply_biometrics(&id, BiometricUpdate::Clear)
            .await
            .unwrap();

        let profiles = store.load_profiles().await.unwrap();
        assert!(profiles[0].samples.is_empty());
        assert!(profiles[0].centroid.is_none());
        assert!(!profiles[0].match_eligible());
    }

    #[tokio::test]
    async fn test_reenrollment_replaces_wholesale() {
        let store = memory_store().await;
        let id = store.create_profile("Ana").await.unwrap();

        let first = vec![embedding(0.1), embedding(0.2), embedding(0.3), embedding(0.4)];
        store
            .apply_biometrics(
                &id,
                BiometricUpdate::Set {
                    centroid: centroid(&first).unwrap(),
                    samples: first,
                },
            )
            .await
            .unwrap();

        let second = vec![embedding(5.0), embedding(6.0), embedding(7.0)];
        let second_center = centroid(&second).unwrap();
        store
            .apply_biometrics(
                &id,
                BiometricUpdate::Set {
                    samples: second.clone(),
                    centroid: second_center.clone(),
                },
            )
            .await
            .unwrap();

        let profiles = store.load_profiles().await.unwrap();
        // No stale samples from the first enrollment survive.
        assert_eq!(profiles[0].samples, second);
        assert_eq!(profiles[0].centroid.as_ref(), Some(&second_center));
    }

    #[tokio::test]
    async fn test_profile_listing_and_active_flag() {
        let store = memory_store().await;
        let a = store.create_profile("Ana").await.unwrap();
        store.create_profile("Bruno").await.unwrap();
        assert_eq!(store.count_profiles().await.unwrap(), 2);

        assert!(store.set_profile_active(&a, false).await.unwrap());
        assert!(!store.set_profile_active("ghost", false).await.unwrap());

        let infos = store.list_profiles().await.unwrap();
        assert_eq!(infos.len(), 2);
        let ana = infos.iter().find(|p| p.id == a).unwrap();
        assert!(!ana.active);
        assert_eq!(ana.samples, 0);

        let profiles = store.load_profiles().await.unwrap();
        let ana = profiles.iter().find(|p| p.id == a).unwrap();
        assert!(!ana.active);
    }

    #[tokio::test]
    async fn test_create_if_absent_is_idempotent() {
        let store = memory_store().await;
        let record = CheckInRecord {
            id: "c1_s1_20240311".into(),
            subject_id: "s1".into(),
            class_id: Some("c1".into()),
            source: CheckInSource::Face,
            created_at: t0(),
        };

        assert!(store.create_if_absent(&record).await.unwrap());
        assert!(!store.create_if_absent(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_recent_window_and_subject_scoping() {
        let store = memory_store().await;
        let record = CheckInRecord {
            id: "s1_20240311_180000".into(),
            subject_id: "s1".into(),
            class_id: None,
            source: CheckInSource::Face,
            created_at: t0(),
        };
        store.create_if_absent(&record).await.unwrap();

        let hit = store
            .find_recent("s1", t0() - Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(hit.unwrap().id, record.id);

        let miss = store
            .find_recent("s1", t0() + Duration::seconds(1))
            .await
            .unwrap();
        assert!(miss.is_none());

        let other = store
            .find_recent("s2", t0() - Duration::seconds(30))
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_find_recent_returns_latest() {
        let store = memory_store().await;
        for (i, offset) in [0i64, 10, 20].iter().enumerate() {
            let at = t0() + Duration::seconds(*offset);
            let record = CheckInRecord {
                id: format!("s1_2024_{i}"),
                subject_id: "s1".into(),
                class_id: None,
                source: CheckInSource::Face,
                created_at: at,
            };
            store.create_if_absent(&record).await.unwrap();
        }

        let hit = store.find_recent("s1", t0()).await.unwrap().unwrap();
        assert_eq!(hit.id, "s1_2024_2");
        assert_eq!(hit.created_at, t0() + Duration::seconds(20));
    }

    #[tokio::test]
    async fn test_class_window_round_trip() {
        let store = memory_store().await;
        assert!(store.class_window("c1").await.unwrap().is_none());

        let window = ClassWindow {
            id: "c1".into(),
            starts_at: t0(),
            ends_at: t0() + Duration::hours(1),
        };
        store.set_class_window(&window).await.unwrap();

        let loaded = store.class_window("c1").await.unwrap().unwrap();
        assert_eq!(loaded.starts_at, window.starts_at);
        assert_eq!(loaded.ends_at, window.ends_at);
    }

    #[tokio::test]
    async fn test_wrong_key_fails_decryption() {
        let conn = Connection::open(Path::new(":memory:")).await.unwrap();
        let store1 = KioskStore {
            conn: conn.clone(),
            enc_key: [1u8; 32],
        };
        let store2 = KioskStore {
            conn,
            enc_key: [2u8; 32],
        };

        let blob = store1.encrypt_embedding(&embedding(0.5).values).unwrap();
        assert!(store2.decrypt_embedding(&blob).is_err());
        assert!(store1.decrypt_embedding(&blob).is_ok());
    }

    #[tokio::test]
    async fn test_encrypt_rejects_bad_embeddings() {
        let store = memory_store().await;
        let err = store.encrypt_embedding(&vec![0.5f32; 64]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingDim(64)));

        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[7] = f32::NAN;
        let err = store.encrypt_embedding(&values).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingValue));
    }

    #[tokio::test]
    async fn test_embedding_byte_fidelity() {
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[0] = 0.0;
        values[1] = -0.0;
        values[2] = 1.0;
        values[3] = -1.0;
        values[4] = f32::MIN_POSITIVE;
        values[5] = std::f32::consts::PI;

        let bytes = embedding_to_bytes(&values);
        let recovered = bytes_to_embedding(&bytes).unwrap();
        for (orig, rec) in values.iter().zip(recovered.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits(), "mismatch: {orig} vs {rec}");
        }
    }
}
