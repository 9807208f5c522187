use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use super::ledger::{
    Challenge, ChallengeType, FindingOverride, FindingRecord, LedgerAction, LedgerEvent,
    Resolution,
};
use crate::review::traits::Severity;

/// How long a writer waits for another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a conditional [`ChallengeStore::append_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    Committed { seq: i64 },
    /// The challenge already has `logged` events; nothing was written.
    Stale { logged: i64 },
}

// ── SQLite store ────────────────────────────────────────────────

/// Durable backing for the challenge ledger.
///
/// `challenge_events` is append-only and authoritative; `challenge_tally`
/// is a snapshot rewritten in the same transaction as each event.
pub struct ChallengeStore {
    conn: Mutex<Connection>,
}

impl ChallengeStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger dir: {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open ledger DB: {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store   = MEMORY;",
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS findings (
                id            TEXT PRIMARY KEY,
                file          TEXT NOT NULL,
                line          INTEGER NOT NULL,
                severity      TEXT NOT NULL,
                category      TEXT NOT NULL DEFAULT '',
                title         TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS finding_aliases (
                alias         TEXT PRIMARY KEY,
                finding_id    TEXT NOT NULL REFERENCES findings(id)
            );
            CREATE TABLE IF NOT EXISTS challenges (
                id             TEXT PRIMARY KEY,
                finding_id     TEXT NOT NULL REFERENCES findings(id),
                challenger     TEXT NOT NULL,
                challenge_type TEXT NOT NULL,
                argument       TEXT NOT NULL DEFAULT '',
                proposed       TEXT,
                quorum         INTEGER NOT NULL,
                created_at     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS challenge_events (
                seq           INTEGER PRIMARY KEY AUTOINCREMENT,
                challenge_id  TEXT NOT NULL REFERENCES challenges(id),
                kind          TEXT NOT NULL,
                actor         TEXT NOT NULL DEFAULT '',
                payload       TEXT NOT NULL,
                at            TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS challenge_tally (
                challenge_id  TEXT PRIMARY KEY REFERENCES challenges(id),
                tally         INTEGER NOT NULL,
                resolution    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_challenges_finding ON challenges(finding_id);
            CREATE INDEX IF NOT EXISTS idx_events_challenge ON challenge_events(challenge_id, seq);",
        )?;
        Ok(())
    }

    pub fn upsert_findings(&self, findings: &[FindingRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO findings (id, file, line, severity, category, title)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    file = excluded.file, line = excluded.line, severity = excluded.severity,
                    category = excluded.category, title = excluded.title",
            )?;
            let mut alias_stmt = tx.prepare(
                "INSERT OR IGNORE INTO finding_aliases (alias, finding_id) VALUES (?1, ?2)",
            )?;
            for f in findings {
                stmt.execute(params![
                    f.id,
                    f.file,
                    f.line,
                    f.severity.id(),
                    f.category,
                    f.title
                ])?;
                alias_stmt.execute(params![f.id, f.id])?;
                for alias in &f.aliases {
                    alias_stmt.execute(params![alias, f.id])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_findings(&self) -> Result<Vec<FindingRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, file, line, severity, category, title FROM findings ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut aliases: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut alias_stmt = conn.prepare("SELECT alias, finding_id FROM finding_aliases")?;
        let alias_rows = alias_stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in alias_rows {
            let (alias, finding_id) = row?;
            aliases.entry(finding_id).or_default().insert(alias);
        }

        let mut out = Vec::new();
        for row in rows {
            let (id, file, line, severity, category, title) = row?;
            let severity = Severity::from_id(&severity)
                .with_context(|| format!("Unknown severity {severity:?} for finding {id}"))?;
            out.push(FindingRecord {
                aliases: aliases.remove(&id).unwrap_or_default(),
                id,
                file,
                line,
                severity,
                category,
                title,
            });
        }
        Ok(out)
    }

    /// Insert a freshly opened challenge together with its zero snapshot.
    pub fn insert_challenge(&self, challenge: &Challenge) -> Result<()> {
        let proposed = challenge
            .proposed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO challenges
                (id, finding_id, challenger, challenge_type, argument, proposed, quorum, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                challenge.id,
                challenge.finding_id,
                challenge.challenger,
                challenge.challenge_type.id(),
                challenge.argument,
                proposed,
                challenge.quorum,
                challenge.created_at.to_rfc3339(),
            ],
        )?;
        upsert_tally(
            &tx,
            &challenge.id,
            challenge.tally,
            challenge.resolution,
            challenge.created_at,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Challenges as they were when opened; events bring them up to date.
    pub fn load_challenges(&self) -> Result<Vec<Challenge>> {
        let conn = self.conn.lock();
        query_challenges(&conn, None)
    }

    pub fn load_challenge(&self, challenge_id: &str) -> Result<Option<Challenge>> {
        let conn = self.conn.lock();
        Ok(query_challenges(&conn, Some(challenge_id))?.into_iter().next())
    }

    /// Append an event and rewrite the challenge's snapshot atomically,
    /// provided the log still holds exactly `expected` events for the
    /// challenge. The check and the write share one immediate transaction,
    /// so appends from separate processes are serialized.
    pub fn append_event(
        &self,
        event: &LedgerEvent,
        expected: i64,
        tally: i64,
        resolution: Resolution,
    ) -> Result<Append> {
        let payload = serde_json::to_string(&event.action)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let logged = count_events(&tx, &event.challenge_id)?;
        if logged != expected {
            return Ok(Append::Stale { logged });
        }
        tx.execute(
            "INSERT INTO challenge_events (challenge_id, kind, actor, payload, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.challenge_id,
                event.action.kind(),
                event.action.actor(),
                payload,
                event.at.to_rfc3339(),
            ],
        )?;
        let seq = tx.last_insert_rowid();
        upsert_tally(&tx, &event.challenge_id, tally, resolution, event.at)?;
        tx.commit()?;
        Ok(Append::Committed { seq })
    }

    /// Every event in append order.
    pub fn load_events(&self) -> Result<Vec<LedgerEvent>> {
        let conn = self.conn.lock();
        query_events(&conn, None)
    }

    pub fn load_events_for(&self, challenge_id: &str) -> Result<Vec<LedgerEvent>> {
        let conn = self.conn.lock();
        query_events(&conn, Some(challenge_id))
    }

    pub fn load_tallies(&self) -> Result<HashMap<String, (i64, Resolution)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT challenge_id, tally, resolution FROM challenge_tally")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (id, tally, resolution) = row?;
            // An unreadable snapshot is treated as missing; replay rewrites it.
            if let Some(resolution) = Resolution::from_id(&resolution) {
                out.insert(id, (tally, resolution));
            }
        }
        Ok(out)
    }

    pub fn write_tally(&self, challenge_id: &str, tally: i64, resolution: Resolution) -> Result<()> {
        let conn = self.conn.lock();
        upsert_tally(&conn, challenge_id, tally, resolution, Utc::now())
    }

    pub fn event_count(&self, challenge_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        count_events(&conn, challenge_id)
    }
}

fn count_events(conn: &Connection, challenge_id: &str) -> Result<i64> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM challenge_events WHERE challenge_id = ?1",
            params![challenge_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    Ok(count)
}

fn query_challenges(conn: &Connection, only: Option<&str>) -> Result<Vec<Challenge>> {
    let mut stmt = conn.prepare(
        "SELECT id, finding_id, challenger, challenge_type, argument, proposed, quorum, created_at
         FROM challenges WHERE ?1 IS NULL OR id = ?1 ORDER BY created_at, id",
    )?;
    let rows = stmt.query_map(params![only], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, u32>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, finding_id, challenger, kind, argument, proposed, quorum, created_at) = row?;
        let challenge_type = ChallengeType::from_id(&kind)
            .with_context(|| format!("Unknown challenge type {kind:?} for {id}"))?;
        let proposed: Option<FindingOverride> = proposed
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("Corrupt proposed override for {id}"))?;
        out.push(Challenge {
            created_at: parse_timestamp(&created_at)?,
            id,
            finding_id,
            challenger,
            challenge_type,
            argument,
            proposed,
            quorum,
            votes: BTreeMap::new(),
            tally: 0,
            resolution: Resolution::Open,
            modification: None,
            resolved_by: None,
            resolved_at: None,
        });
    }
    Ok(out)
}

fn query_events(conn: &Connection, only: Option<&str>) -> Result<Vec<LedgerEvent>> {
    let mut stmt = conn.prepare(
        "SELECT seq, challenge_id, payload, at FROM challenge_events
         WHERE ?1 IS NULL OR challenge_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![only], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (seq, challenge_id, payload, at) = row?;
        let action: LedgerAction = serde_json::from_str(&payload)
            .with_context(|| format!("Corrupt ledger event #{seq}"))?;
        out.push(LedgerEvent {
            challenge_id,
            at: parse_timestamp(&at)?,
            action,
        });
    }
    Ok(out)
}

fn upsert_tally(
    conn: &Connection,
    challenge_id: &str,
    tally: i64,
    resolution: Resolution,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO challenge_tally (challenge_id, tally, resolution, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(challenge_id) DO UPDATE SET
            tally = excluded.tally, resolution = excluded.resolution, updated_at = excluded.updated_at",
        params![challenge_id, tally, resolution.id(), at.to_rfc3339()],
    )?;
    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ledger::Vote;
    use tempfile::TempDir;

    fn record(id: &str) -> FindingRecord {
        FindingRecord {
            id: id.into(),
            file: "src/lib.rs".into(),
            line: 3,
            severity: Severity::Medium,
            category: "bug".into(),
            title: "Off by one".into(),
            aliases: BTreeSet::from([id.to_string()]),
        }
    }

    fn challenge(id: &str, finding_id: &str) -> Challenge {
        Challenge {
            id: id.into(),
            finding_id: finding_id.into(),
            challenger: "bob".into(),
            challenge_type: ChallengeType::SeverityDispute,
            argument: "Only reachable in tests".into(),
            proposed: Some(FindingOverride {
                severity: Some(Severity::Low),
                category: None,
            }),
            quorum: 3,
            votes: BTreeMap::new(),
            tally: 0,
            resolution: Resolution::Open,
            modification: None,
            resolved_by: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    fn test_store(tmp: &TempDir) -> ChallengeStore {
        ChallengeStore::open(&tmp.path().join("ledger").join("challenges.db")).unwrap()
    }

    #[test]
    fn findings_round_trip_and_upsert() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        store.upsert_findings(&[record("a"), record("b")]).unwrap();

        let mut changed = record("a");
        changed.severity = Severity::Critical;
        store.upsert_findings(&[changed]).unwrap();

        let loaded = store.load_findings().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].severity, Severity::Critical);
    }

    #[test]
    fn alias_stays_with_first_owner() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let mut first = record("a");
        first.aliases.insert("shared".into());
        let mut second = record("b");
        second.aliases.insert("shared".into());
        store.upsert_findings(&[first, second]).unwrap();

        let loaded = store.load_findings().unwrap();
        assert!(loaded[0].aliases.contains("shared"));
        assert_eq!(loaded[1].aliases, BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn append_refuses_stale_expectation() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        store.upsert_findings(&[record("f")]).unwrap();
        store.insert_challenge(&challenge("c1", "f")).unwrap();

        let vote = |voter: &str| LedgerEvent {
            challenge_id: "c1".into(),
            at: Utc::now(),
            action: LedgerAction::Vote {
                voter: voter.into(),
                vote: Vote::Support,
            },
        };
        store.append_event(&vote("v1"), 0, 1, Resolution::Open).unwrap();

        let stale = store.append_event(&vote("v2"), 0, 1, Resolution::Open).unwrap();
        assert_eq!(stale, Append::Stale { logged: 1 });
        assert_eq!(store.event_count("c1").unwrap(), 1);
        assert_eq!(
            store.load_tallies().unwrap().get("c1"),
            Some(&(1, Resolution::Open))
        );

        let ok = store.append_event(&vote("v2"), 1, 2, Resolution::Open).unwrap();
        assert!(matches!(ok, Append::Committed { .. }));
        assert_eq!(store.load_events_for("c1").unwrap().len(), 2);
        assert!(store.load_challenge("c1").unwrap().is_some());
        assert!(store.load_challenge("missing").unwrap().is_none());
    }

    #[test]
    fn challenge_and_events_persist() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        store.upsert_findings(&[record("f")]).unwrap();
        let c = challenge("c1", "f");
        store.insert_challenge(&c).unwrap();

        let event = LedgerEvent {
            challenge_id: "c1".into(),
            at: Utc::now(),
            action: LedgerAction::Vote {
                voter: "v1".into(),
                vote: Vote::Support,
            },
        };
        let appended = store.append_event(&event, 0, 1, Resolution::Open).unwrap();
        assert!(matches!(appended, Append::Committed { seq } if seq > 0));

        let loaded = store.load_challenges().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].proposed, c.proposed);
        assert_eq!(loaded[0].resolution, Resolution::Open);

        let events = store.load_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, event.action);
        assert_eq!(store.event_count("c1").unwrap(), 1);
        assert_eq!(
            store.load_tallies().unwrap().get("c1"),
            Some(&(1, Resolution::Open))
        );
    }

    #[test]
    fn challenge_requires_registered_finding() {
        let store = ChallengeStore::open_in_memory().unwrap();
        assert!(store.insert_challenge(&challenge("c1", "missing")).is_err());
        assert!(store.load_challenges().unwrap().is_empty());
    }
}
