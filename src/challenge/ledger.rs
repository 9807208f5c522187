use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::store::{Append, ChallengeStore};
use crate::consensus::dedup::{CanonicalFinding, FindingStatus};
use crate::review::traits::Severity;

/// Net votes that resolve a challenge unless configured otherwise.
pub const DEFAULT_QUORUM: u32 = 3;

/// Hours an open challenge waits for quorum before defaulting to upheld.
pub const DEFAULT_VOTING_WINDOW_HOURS: i64 = 72;

// ── Challenge vocabulary ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    FalsePositive,
    SeverityDispute,
    AlternativeSolution,
    ContextMissing,
}

impl ChallengeType {
    pub const ALL: &'static [ChallengeType] = &[
        ChallengeType::FalsePositive,
        ChallengeType::SeverityDispute,
        ChallengeType::AlternativeSolution,
        ChallengeType::ContextMissing,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::FalsePositive => "false_positive",
            Self::SeverityDispute => "severity_dispute",
            Self::AlternativeSolution => "alternative_solution",
            Self::ContextMissing => "context_missing",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.iter().copied().find(|t| t.id() == id)
    }
}

/// Lifecycle of a challenge. `Open` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Open,
    Upheld,
    Overturned,
    Modified,
}

impl Resolution {
    pub const ALL: &'static [Resolution] = &[
        Resolution::Open,
        Resolution::Upheld,
        Resolution::Overturned,
        Resolution::Modified,
    ];

    pub fn is_terminal(self) -> bool {
        self != Self::Open
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Upheld => "upheld",
            Self::Overturned => "overturned",
            Self::Modified => "modified",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|r| r.id() == id)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// A vote for (`Support`) or against (`Oppose`) the challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Support,
    Oppose,
}

impl Vote {
    pub fn weight(self) -> i64 {
        match self {
            Self::Support => 1,
            Self::Oppose => -1,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "support" | "up" | "+1" | "+" => Some(Self::Support),
            "oppose" | "down" | "-1" | "-" => Some(Self::Oppose),
            _ => None,
        }
    }
}

/// Severity and/or category replacement recorded by a `Modified` resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FindingOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl FindingOverride {
    pub fn is_empty(&self) -> bool {
        self.severity.is_none() && self.category.as_deref().is_none_or(|c| c.trim().is_empty())
    }
}

// ── Challenge record ─────────────────────────────────────────────

/// A dispute raised against one canonical finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub finding_id: String,
    pub challenger: String,
    pub challenge_type: ChallengeType,
    pub argument: String,
    /// The challenger's proposed change, used when a resolver picks `Modified`.
    pub proposed: Option<FindingOverride>,
    /// Net tally that resolves the challenge, fixed when it is opened.
    pub quorum: u32,
    /// Current vote per voter.
    pub votes: BTreeMap<String, Vote>,
    pub tally: i64,
    pub resolution: Resolution,
    pub modification: Option<FindingOverride>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Request to open a challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChallenge {
    pub finding_id: String,
    pub challenger: String,
    pub challenge_type: ChallengeType,
    pub argument: String,
    pub proposed: Option<FindingOverride>,
}

/// What happened to a challenge. Every mutation after creation is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerAction {
    Vote {
        voter: String,
        vote: Vote,
    },
    Resolve {
        resolver: String,
        resolution: Resolution,
        #[serde(default)]
        modification: Option<FindingOverride>,
    },
    /// The voting window closed without quorum.
    Expire,
}

impl LedgerAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vote { .. } => "vote",
            Self::Resolve { .. } => "resolve",
            Self::Expire => "expire",
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            Self::Vote { voter, .. } => voter,
            Self::Resolve { resolver, .. } => resolver,
            Self::Expire => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub challenge_id: String,
    pub at: DateTime<Utc>,
    pub action: LedgerAction,
}

impl Challenge {
    /// Apply one event. On error the challenge is left untouched.
    pub fn apply(&mut self, event: &LedgerEvent) -> Result<(), LedgerError> {
        if self.resolution.is_terminal() {
            return Err(LedgerError::ChallengeClosed {
                challenge_id: self.id.clone(),
                resolution: self.resolution,
            });
        }

        match &event.action {
            LedgerAction::Vote { voter, vote } => {
                if self.votes.get(voter) == Some(vote) {
                    return Err(LedgerError::DuplicateVote {
                        challenge_id: self.id.clone(),
                        voter: voter.clone(),
                    });
                }
                self.votes.insert(voter.clone(), *vote);
                self.tally = self.votes.values().map(|v| v.weight()).sum();

                let quorum = i64::from(self.quorum.max(1));
                if self.tally >= quorum {
                    self.close(Resolution::Overturned, None, None, event.at);
                } else if self.tally <= -quorum {
                    self.close(Resolution::Upheld, None, None, event.at);
                }
            }
            LedgerAction::Resolve {
                resolver,
                resolution,
                modification,
            } => {
                if !resolution.is_terminal() {
                    return Err(LedgerError::InvalidResolution(*resolution));
                }
                let modification = if *resolution == Resolution::Modified {
                    let chosen = modification
                        .clone()
                        .or_else(|| self.proposed.clone())
                        .filter(|m| !m.is_empty());
                    match chosen {
                        Some(m) => Some(m),
                        None => {
                            return Err(LedgerError::MissingModification {
                                challenge_id: self.id.clone(),
                            })
                        }
                    }
                } else {
                    None
                };
                self.close(*resolution, modification, Some(resolver.clone()), event.at);
            }
            LedgerAction::Expire => {
                self.close(Resolution::Upheld, None, None, event.at);
            }
        }
        Ok(())
    }

    fn close(
        &mut self,
        resolution: Resolution,
        modification: Option<FindingOverride>,
        resolved_by: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.resolution = resolution;
        self.modification = modification;
        self.resolved_by = resolved_by;
        self.resolved_at = Some(at);
    }
}

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("challenge {0} not found")]
    ChallengeNotFound(String),

    #[error("finding {0} is not registered with the ledger")]
    FindingNotFound(String),

    #[error("{voter} already cast the same vote on challenge {challenge_id}")]
    DuplicateVote { challenge_id: String, voter: String },

    #[error("challenge {challenge_id} is already {resolution}")]
    ChallengeClosed {
        challenge_id: String,
        resolution: Resolution,
    },

    #[error("{0} is not a designated resolver")]
    Unauthorized(String),

    #[error("challenge {challenge_id} cannot be modified without a severity or category override")]
    MissingModification { challenge_id: String },

    #[error("{0} is not a terminal resolution")]
    InvalidResolution(Resolution),

    #[error("invalid challenge: {0}")]
    InvalidChallenge(String),

    #[error("challenge {0} kept changing in other processes; try again")]
    Contended(String),

    #[error("ledger store failure: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for LedgerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(err)
    }
}

// ── Ledger ───────────────────────────────────────────────────────

/// Store writes lost to another process before one lands.
const MAX_STALE_APPENDS: usize = 8;

/// What the ledger remembers about a challengeable finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingRecord {
    pub id: String,
    pub file: String,
    pub line: u32,
    pub severity: Severity,
    pub category: String,
    pub title: String,
    /// Other ids the same issue was computed under. Always includes `id`.
    #[serde(default)]
    pub aliases: BTreeSet<String>,
}

impl From<&CanonicalFinding> for FindingRecord {
    fn from(f: &CanonicalFinding) -> Self {
        let mut aliases = f.aliases.clone();
        aliases.insert(f.id.clone());
        Self {
            id: f.id.clone(),
            file: f.file.clone(),
            line: f.line,
            severity: f.severity,
            category: f.category.clone(),
            title: f.title.clone(),
            aliases,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSettings {
    pub quorum: u32,
    pub voting_window: Duration,
    /// Identities allowed to force a resolution.
    pub resolvers: BTreeSet<String>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            quorum: DEFAULT_QUORUM,
            voting_window: Duration::hours(DEFAULT_VOTING_WINDOW_HOURS),
            resolvers: BTreeSet::new(),
        }
    }
}

/// A challenge and how many of its events the store held when this copy
/// was built. Appends are conditional on that count.
struct Entry {
    challenge: Challenge,
    logged: i64,
}

impl Entry {
    fn fresh(challenge: Challenge) -> Self {
        Self {
            challenge,
            logged: 0,
        }
    }

    /// Apply a stored event. Rejected events still count as logged.
    fn replay(&mut self, event: &LedgerEvent) {
        self.logged += 1;
        if let Err(err) = self.challenge.apply(event) {
            tracing::warn!(challenge = %event.challenge_id, error = %err, "Event rejected during replay");
        }
    }
}

/// Shared store of challenges. Each challenge sits behind its own lock, so
/// votes on different challenges never contend; the maps only take a write
/// lock when a record is added.
///
/// With a store, other processes may append to the same challenge. Every
/// append names the event count it was validated against; when the store
/// has moved on, the challenge is rebuilt from the log and the action is
/// validated again.
pub struct ChallengeLedger {
    settings: LedgerSettings,
    findings: RwLock<HashMap<String, FindingRecord>>,
    /// Alias → id of the finding that first claimed it.
    aliases: RwLock<HashMap<String, String>>,
    challenges: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
    store: Option<ChallengeStore>,
}

impl ChallengeLedger {
    /// A ledger that lives only as long as the process.
    pub fn in_memory(settings: LedgerSettings) -> Self {
        Self {
            settings,
            findings: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            challenges: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Rebuild a durable ledger by replaying the store's event log.
    pub fn open(settings: LedgerSettings, store: ChallengeStore) -> Result<Self, LedgerError> {
        let records = store.load_findings()?;
        let mut aliases: HashMap<String, String> = HashMap::new();
        for record in &records {
            for alias in &record.aliases {
                aliases.insert(alias.clone(), record.id.clone());
            }
        }
        for record in &records {
            aliases
                .entry(record.id.clone())
                .or_insert_with(|| record.id.clone());
        }
        let findings: HashMap<String, FindingRecord> =
            records.into_iter().map(|f| (f.id.clone(), f)).collect();

        let mut entries: HashMap<String, Entry> = store
            .load_challenges()?
            .into_iter()
            .map(|c| (c.id.clone(), Entry::fresh(c)))
            .collect();

        let events = store.load_events()?;
        let replayed = events.len();
        for event in events {
            let Some(entry) = entries.get_mut(&event.challenge_id) else {
                tracing::warn!(challenge = %event.challenge_id, "Event for unknown challenge skipped");
                continue;
            };
            entry.replay(&event);
        }

        let snapshots = store.load_tallies()?;
        for Entry { challenge, .. } in entries.values() {
            let current = (challenge.tally, challenge.resolution);
            if snapshots.get(&challenge.id) != Some(&current) {
                tracing::warn!(
                    challenge = %challenge.id,
                    snapshot = ?snapshots.get(&challenge.id),
                    replayed = ?current,
                    "Tally snapshot disagrees with event log; rewriting from log"
                );
                store.write_tally(&challenge.id, challenge.tally, challenge.resolution)?;
            }
        }

        tracing::info!(
            findings = findings.len(),
            challenges = entries.len(),
            events = replayed,
            "Challenge ledger loaded"
        );

        Ok(Self {
            settings,
            findings: RwLock::new(findings),
            aliases: RwLock::new(aliases),
            challenges: RwLock::new(
                entries
                    .into_iter()
                    .map(|(id, e)| (id, Arc::new(Mutex::new(e))))
                    .collect(),
            ),
            store: Some(store),
        })
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub fn is_resolver(&self, identity: &str) -> bool {
        self.settings.resolvers.contains(identity)
    }

    /// Make findings challengeable. Re-registering an id refreshes its
    /// record; an alias stays with the finding that claimed it first.
    pub fn register_findings(&self, findings: &[CanonicalFinding]) -> Result<(), LedgerError> {
        let records: Vec<FindingRecord> = findings.iter().map(FindingRecord::from).collect();
        if let Some(store) = &self.store {
            store.upsert_findings(&records)?;
        }
        let mut aliases = self.aliases.write();
        let mut registry = self.findings.write();
        for record in records {
            aliases
                .entry(record.id.clone())
                .or_insert_with(|| record.id.clone());
            for alias in &record.aliases {
                aliases
                    .entry(alias.clone())
                    .or_insert_with(|| record.id.clone());
            }
            registry.insert(record.id.clone(), record);
        }
        Ok(())
    }

    /// Ids this run's findings were registered under before, keyed by the
    /// id computed this run. A finding whose reviewers changed since then
    /// still shares an alias with its earlier record and takes that id
    /// back, so challenges raised against it stay attached.
    pub fn known_ids(&self, findings: &[CanonicalFinding]) -> BTreeMap<String, String> {
        let aliases = self.aliases.read();
        let current: BTreeSet<&str> = findings.iter().map(|f| f.id.as_str()).collect();
        let mut taken: BTreeSet<String> = findings
            .iter()
            .filter(|f| aliases.get(&f.id) == Some(&f.id))
            .map(|f| f.id.clone())
            .collect();

        let mut renames = BTreeMap::new();
        for finding in findings {
            if taken.contains(&finding.id) {
                continue;
            }
            let known = finding
                .aliases
                .iter()
                .chain(std::iter::once(&finding.id))
                .filter_map(|alias| aliases.get(alias))
                .filter(|id| !taken.contains(*id) && !current.contains(id.as_str()))
                .min()
                .cloned();
            if let Some(known) = known {
                tracing::debug!(computed = %finding.id, known = %known, "Finding keeps its earlier id");
                taken.insert(known.clone());
                renames.insert(finding.id.clone(), known);
            }
        }
        renames
    }

    pub fn finding(&self, id: &str) -> Option<FindingRecord> {
        self.findings.read().get(id).cloned()
    }

    pub fn open_challenge(
        &self,
        request: NewChallenge,
        now: DateTime<Utc>,
    ) -> Result<Challenge, LedgerError> {
        if request.challenger.trim().is_empty() {
            return Err(LedgerError::InvalidChallenge("challenger is required".into()));
        }
        if !self.findings.read().contains_key(&request.finding_id) {
            return Err(LedgerError::FindingNotFound(request.finding_id));
        }

        let challenge = Challenge {
            id: uuid::Uuid::new_v4().to_string(),
            finding_id: request.finding_id,
            challenger: request.challenger,
            challenge_type: request.challenge_type,
            argument: request.argument,
            proposed: request.proposed.filter(|p| !p.is_empty()),
            quorum: self.settings.quorum.max(1),
            votes: BTreeMap::new(),
            tally: 0,
            resolution: Resolution::Open,
            modification: None,
            resolved_by: None,
            created_at: now,
            resolved_at: None,
        };

        if let Some(store) = &self.store {
            store.insert_challenge(&challenge)?;
        }
        self.challenges.write().insert(
            challenge.id.clone(),
            Arc::new(Mutex::new(Entry::fresh(challenge.clone()))),
        );

        tracing::info!(
            challenge = %challenge.id,
            finding = %challenge.finding_id,
            challenger = %challenge.challenger,
            kind = challenge.challenge_type.id(),
            "Challenge opened"
        );
        Ok(challenge)
    }

    /// Record `voter`'s vote. A different vote replaces their earlier one;
    /// repeating the same vote is rejected.
    pub fn cast_vote(
        &self,
        challenge_id: &str,
        voter: &str,
        vote: Vote,
        now: DateTime<Utc>,
    ) -> Result<Challenge, LedgerError> {
        if voter.trim().is_empty() {
            return Err(LedgerError::InvalidChallenge("voter is required".into()));
        }
        let record = self.record(challenge_id)?;
        let mut entry = record.lock();
        let updated = self.commit(
            &mut entry,
            LedgerEvent {
                challenge_id: challenge_id.to_string(),
                at: now,
                action: LedgerAction::Vote {
                    voter: voter.to_string(),
                    vote,
                },
            },
        )?;
        tracing::info!(
            challenge = %challenge_id,
            voter,
            vote = ?vote,
            tally = updated.tally,
            resolution = %updated.resolution,
            "Vote recorded"
        );
        Ok(updated)
    }

    /// Force a terminal resolution. Only designated resolvers may do this.
    pub fn resolve(
        &self,
        challenge_id: &str,
        resolver: &str,
        resolution: Resolution,
        modification: Option<FindingOverride>,
        now: DateTime<Utc>,
    ) -> Result<Challenge, LedgerError> {
        if !self.is_resolver(resolver) {
            return Err(LedgerError::Unauthorized(resolver.to_string()));
        }
        let record = self.record(challenge_id)?;
        let mut entry = record.lock();
        let updated = self.commit(
            &mut entry,
            LedgerEvent {
                challenge_id: challenge_id.to_string(),
                at: now,
                action: LedgerAction::Resolve {
                    resolver: resolver.to_string(),
                    resolution,
                    modification,
                },
            },
        )?;
        tracing::info!(challenge = %challenge_id, resolver, resolution = %resolution, "Challenge resolved");
        Ok(updated)
    }

    /// Close every open challenge whose voting window has elapsed as upheld.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<Vec<Challenge>, LedgerError> {
        let records: Vec<Arc<Mutex<Entry>>> = self.challenges.read().values().cloned().collect();
        let mut expired = Vec::new();
        for record in records {
            let mut entry = record.lock();
            let current = &entry.challenge;
            if current.resolution.is_terminal()
                || now.signed_duration_since(current.created_at) < self.settings.voting_window
            {
                continue;
            }
            let event = LedgerEvent {
                challenge_id: current.id.clone(),
                at: now,
                action: LedgerAction::Expire,
            };
            match self.commit(&mut entry, event) {
                Ok(challenge) => expired.push(challenge),
                // Closed by another process since this ledger loaded it.
                Err(LedgerError::ChallengeClosed { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        expired.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired challenges defaulted to upheld");
        }
        Ok(expired)
    }

    pub fn get(&self, challenge_id: &str) -> Result<Challenge, LedgerError> {
        Ok(self.record(challenge_id)?.lock().challenge.clone())
    }

    /// Every challenge, oldest first.
    pub fn list(&self) -> Vec<Challenge> {
        self.collect(|_| true)
    }

    /// Challenges raised against any of `finding_ids`, oldest first.
    pub fn challenges_for(&self, finding_ids: &BTreeSet<String>) -> Vec<Challenge> {
        self.collect(|c| finding_ids.contains(&c.finding_id))
    }

    fn collect(&self, keep: impl Fn(&Challenge) -> bool) -> Vec<Challenge> {
        let records: Vec<Arc<Mutex<Entry>>> = self.challenges.read().values().cloned().collect();
        let mut out: Vec<Challenge> = records
            .iter()
            .map(|r| r.lock().challenge.clone())
            .filter(|c| keep(c))
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// The in-memory record, or one loaded from the store when another
    /// process opened the challenge after this ledger was built.
    fn record(&self, challenge_id: &str) -> Result<Arc<Mutex<Entry>>, LedgerError> {
        if let Some(record) = self.challenges.read().get(challenge_id) {
            return Ok(record.clone());
        }
        let missing = || LedgerError::ChallengeNotFound(challenge_id.to_string());
        let store = self.store.as_ref().ok_or_else(missing)?;
        let entry = load_entry(store, challenge_id)?.ok_or_else(missing)?;
        let record = self
            .challenges
            .write()
            .entry(challenge_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(entry)))
            .clone();
        Ok(record)
    }

    /// Validate on a copy, persist the event, then publish the copy. A
    /// rejected or unpersisted event leaves the challenge untouched.
    fn commit(&self, entry: &mut Entry, event: LedgerEvent) -> Result<Challenge, LedgerError> {
        let Some(store) = &self.store else {
            let mut next = entry.challenge.clone();
            next.apply(&event)?;
            entry.challenge = next.clone();
            entry.logged += 1;
            return Ok(next);
        };

        for _ in 0..MAX_STALE_APPENDS {
            let mut next = entry.challenge.clone();
            next.apply(&event)?;
            match store.append_event(&event, entry.logged, next.tally, next.resolution)? {
                Append::Committed { .. } => {
                    entry.challenge = next.clone();
                    entry.logged += 1;
                    return Ok(next);
                }
                Append::Stale { logged } => {
                    tracing::debug!(
                        challenge = %event.challenge_id,
                        expected = entry.logged,
                        logged,
                        "Challenge changed in another process; reloading"
                    );
                    *entry = load_entry(store, &event.challenge_id)?
                        .ok_or_else(|| LedgerError::ChallengeNotFound(event.challenge_id.clone()))?;
                }
            }
        }
        Err(LedgerError::Contended(event.challenge_id))
    }
}

/// Rebuild one challenge from the store's log.
fn load_entry(store: &ChallengeStore, challenge_id: &str) -> Result<Option<Entry>, LedgerError> {
    let Some(challenge) = store.load_challenge(challenge_id)? else {
        return Ok(None);
    };
    let mut entry = Entry::fresh(challenge);
    for event in store.load_events_for(challenge_id)? {
        entry.replay(&event);
    }
    Ok(Some(entry))
}

/// Fold terminal challenge outcomes into the canonical findings.
/// `Overturned` marks a finding inactive, `Modified` applies the override,
/// `Upheld` changes nothing.
pub fn apply_resolutions(findings: &mut [CanonicalFinding], challenges: &[Challenge]) {
    let mut terminal: Vec<&Challenge> = challenges
        .iter()
        .filter(|c| c.resolution.is_terminal())
        .collect();
    terminal.sort_by(|a, b| a.resolved_at.cmp(&b.resolved_at).then_with(|| a.id.cmp(&b.id)));

    for challenge in terminal {
        let Some(finding) = findings.iter_mut().find(|f| f.id == challenge.finding_id) else {
            continue;
        };
        match challenge.resolution {
            Resolution::Overturned => {
                finding.status = FindingStatus::Overturned {
                    challenge_id: challenge.id.clone(),
                };
            }
            Resolution::Modified if finding.is_live() => {
                let Some(change) = &challenge.modification else {
                    continue;
                };
                let (previous_severity, previous_category) = match &finding.status {
                    FindingStatus::Modified {
                        previous_severity,
                        previous_category,
                        ..
                    } => (*previous_severity, previous_category.clone()),
                    _ => (finding.severity, finding.category.clone()),
                };
                if let Some(severity) = change.severity {
                    finding.severity = severity;
                }
                if let Some(category) = change.category.as_deref().filter(|c| !c.trim().is_empty()) {
                    finding.category = category.to_string();
                }
                finding.status = FindingStatus::Modified {
                    challenge_id: challenge.id.clone(),
                    previous_severity,
                    previous_category,
                };
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::normalize::{CategoryClass, MergeKey};
    use tempfile::TempDir;

    fn canonical(id: &str, severity: Severity) -> CanonicalFinding {
        CanonicalFinding {
            id: id.into(),
            aliases: BTreeSet::from([id.to_string()]),
            key: MergeKey {
                file: "src/api.rs".into(),
                bucket: 4,
                class: CategoryClass::Security,
            },
            file: "src/api.rs".into(),
            line: 12,
            severity,
            category: "security".into(),
            title: "Missing auth check".into(),
            description: String::new(),
            suggested_fix: None,
            confidence: 0.9,
            reviewers: BTreeSet::from(["SecurityReviewer".to_string()]),
            sources: Vec::new(),
            disputed: false,
            dissenting: Vec::new(),
            dissent_of: None,
            status: FindingStatus::Active,
        }
    }

    fn settings() -> LedgerSettings {
        LedgerSettings {
            resolvers: BTreeSet::from(["lead".to_string()]),
            ..LedgerSettings::default()
        }
    }

    fn request(finding_id: &str) -> NewChallenge {
        NewChallenge {
            finding_id: finding_id.into(),
            challenger: "alice".into(),
            challenge_type: ChallengeType::FalsePositive,
            argument: "The route is internal only".into(),
            proposed: None,
        }
    }

    fn ledger_with(finding_id: &str) -> ChallengeLedger {
        let ledger = ChallengeLedger::in_memory(settings());
        ledger
            .register_findings(&[canonical(finding_id, Severity::High)])
            .unwrap();
        ledger
    }

    #[test]
    fn unknown_finding_rejected() {
        let ledger = ledger_with("f1");
        let err = ledger.open_challenge(request("nope"), Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::FindingNotFound(_)));
        assert!(ledger.list().is_empty());
    }

    #[test]
    fn quorum_overturns() {
        let ledger = ledger_with("f1");
        let now = Utc::now();
        let c = ledger.open_challenge(request("f1"), now).unwrap();
        ledger.cast_vote(&c.id, "v1", Vote::Support, now).unwrap();
        ledger.cast_vote(&c.id, "v2", Vote::Support, now).unwrap();
        let after = ledger.cast_vote(&c.id, "v3", Vote::Support, now).unwrap();
        assert_eq!(after.tally, 3);
        assert_eq!(after.resolution, Resolution::Overturned);
        assert_eq!(after.resolved_at, Some(now));
    }

    #[test]
    fn negative_quorum_upholds() {
        let ledger = ledger_with("f1");
        let now = Utc::now();
        let c = ledger.open_challenge(request("f1"), now).unwrap();
        for voter in ["a", "b", "c"] {
            ledger.cast_vote(&c.id, voter, Vote::Oppose, now).unwrap();
        }
        assert_eq!(ledger.get(&c.id).unwrap().resolution, Resolution::Upheld);
    }

    #[test]
    fn repeat_vote_rejected_and_changed_vote_replaces() {
        let ledger = ledger_with("f1");
        let now = Utc::now();
        let c = ledger.open_challenge(request("f1"), now).unwrap();
        ledger.cast_vote(&c.id, "v1", Vote::Support, now).unwrap();

        let err = ledger.cast_vote(&c.id, "v1", Vote::Support, now).unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateVote { .. }));
        assert_eq!(ledger.get(&c.id).unwrap().tally, 1);

        let changed = ledger.cast_vote(&c.id, "v1", Vote::Oppose, now).unwrap();
        assert_eq!(changed.tally, -1);
        assert_eq!(changed.votes.len(), 1);
    }

    #[test]
    fn closed_challenge_rejects_votes() {
        let ledger = ledger_with("f1");
        let now = Utc::now();
        let c = ledger.open_challenge(request("f1"), now).unwrap();
        ledger
            .resolve(&c.id, "lead", Resolution::Upheld, None, now)
            .unwrap();
        let err = ledger.cast_vote(&c.id, "v1", Vote::Support, now).unwrap_err();
        assert!(matches!(err, LedgerError::ChallengeClosed { .. }));
    }

    #[test]
    fn override_requires_resolver_role() {
        let ledger = ledger_with("f1");
        let now = Utc::now();
        let c = ledger.open_challenge(request("f1"), now).unwrap();
        let err = ledger
            .resolve(&c.id, "mallory", Resolution::Overturned, None, now)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));
        assert_eq!(ledger.get(&c.id).unwrap().resolution, Resolution::Open);
    }

    #[test]
    fn modified_needs_an_override() {
        let ledger = ledger_with("f1");
        let now = Utc::now();
        let c = ledger.open_challenge(request("f1"), now).unwrap();
        let err = ledger
            .resolve(&c.id, "lead", Resolution::Modified, None, now)
            .unwrap_err();
        assert!(matches!(err, LedgerError::MissingModification { .. }));

        let change = FindingOverride {
            severity: Some(Severity::Low),
            category: None,
        };
        let done = ledger
            .resolve(&c.id, "lead", Resolution::Modified, Some(change.clone()), now)
            .unwrap();
        assert_eq!(done.modification, Some(change));
        assert_eq!(done.resolved_by.as_deref(), Some("lead"));
    }

    #[test]
    fn unknown_challenge_rejected() {
        let ledger = ledger_with("f1");
        let err = ledger
            .cast_vote("missing", "v1", Vote::Support, Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::ChallengeNotFound(_)));
    }

    #[test]
    fn expire_defaults_to_upheld() {
        let ledger = ledger_with("f1");
        let opened = Utc::now();
        let c = ledger.open_challenge(request("f1"), opened).unwrap();
        ledger.cast_vote(&c.id, "v1", Vote::Support, opened).unwrap();

        assert!(ledger.expire(opened + Duration::hours(1)).unwrap().is_empty());
        let expired = ledger.expire(opened + Duration::hours(72)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].resolution, Resolution::Upheld);
    }

    #[test]
    fn concurrent_votes_all_counted() {
        let ledger = ChallengeLedger::in_memory(LedgerSettings {
            quorum: 1000,
            ..settings()
        });
        ledger
            .register_findings(&[canonical("f1", Severity::High)])
            .unwrap();
        let now = Utc::now();
        let c = ledger.open_challenge(request("f1"), now).unwrap();

        std::thread::scope(|scope| {
            for t in 0..8 {
                let ledger = &ledger;
                let id = c.id.clone();
                scope.spawn(move || {
                    for i in 0..25 {
                        ledger
                            .cast_vote(&id, &format!("voter-{t}-{i}"), Vote::Support, now)
                            .unwrap();
                    }
                });
            }
        });

        let after = ledger.get(&c.id).unwrap();
        assert_eq!(after.votes.len(), 200);
        assert_eq!(after.tally, 200);
        assert_eq!(after.resolution, Resolution::Open);
    }

    #[test]
    fn replay_restores_state() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("ledger.db");
        let now = Utc::now();

        let (overturned_id, open_id) = {
            let ledger = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
            ledger
                .register_findings(&[canonical("f1", Severity::High), canonical("f2", Severity::Low)])
                .unwrap();
            let a = ledger.open_challenge(request("f1"), now).unwrap();
            let b = ledger.open_challenge(request("f2"), now).unwrap();
            for voter in ["v1", "v2", "v3"] {
                ledger.cast_vote(&a.id, voter, Vote::Support, now).unwrap();
            }
            ledger.cast_vote(&b.id, "v1", Vote::Oppose, now).unwrap();
            ledger.cast_vote(&b.id, "v1", Vote::Support, now).unwrap();
            (a.id, b.id)
        };

        let reopened = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
        let a = reopened.get(&overturned_id).unwrap();
        assert_eq!(a.resolution, Resolution::Overturned);
        assert_eq!(a.tally, 3);
        let b = reopened.get(&open_id).unwrap();
        assert_eq!(b.resolution, Resolution::Open);
        assert_eq!(b.tally, 1);
        assert_eq!(b.votes.get("v1"), Some(&Vote::Support));
        assert!(reopened.finding("f2").is_some());
    }

    #[test]
    fn replay_wins_over_stale_snapshot() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("ledger.db");
        let now = Utc::now();

        let id = {
            let ledger = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
            ledger
                .register_findings(&[canonical("f1", Severity::High)])
                .unwrap();
            let c = ledger.open_challenge(request("f1"), now).unwrap();
            ledger.cast_vote(&c.id, "v1", Vote::Support, now).unwrap();
            c.id
        };

        let store = ChallengeStore::open(&db).unwrap();
        store.write_tally(&id, 42, Resolution::Overturned).unwrap();
        drop(store);

        let store = ChallengeStore::open(&db).unwrap();
        let reopened = ChallengeLedger::open(settings(), store).unwrap();
        let c = reopened.get(&id).unwrap();
        assert_eq!(c.tally, 1);
        assert_eq!(c.resolution, Resolution::Open);

        let tallies = ChallengeStore::open(&db).unwrap().load_tallies().unwrap();
        assert_eq!(tallies.get(&id), Some(&(1, Resolution::Open)));
    }

    fn seeded_db(tmp: &TempDir, supporters: &[&str]) -> (std::path::PathBuf, String) {
        let db = tmp.path().join("ledger.db");
        let ledger = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
        ledger
            .register_findings(&[canonical("f1", Severity::High)])
            .unwrap();
        let now = Utc::now();
        let c = ledger.open_challenge(request("f1"), now).unwrap();
        for voter in supporters {
            ledger.cast_vote(&c.id, voter, Vote::Support, now).unwrap();
        }
        (db, c.id)
    }

    #[test]
    fn vote_behind_another_process_is_rechecked() {
        let tmp = TempDir::new().unwrap();
        let (db, id) = seeded_db(&tmp, &["v1", "v2"]);
        let a = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
        let b = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
        let now = Utc::now();

        let closed = a.cast_vote(&id, "v3", Vote::Support, now).unwrap();
        assert_eq!(closed.resolution, Resolution::Overturned);

        let err = b.cast_vote(&id, "v4", Vote::Oppose, now).unwrap_err();
        assert!(matches!(err, LedgerError::ChallengeClosed { .. }));
        assert_eq!(b.get(&id).unwrap().tally, 3);

        let store = ChallengeStore::open(&db).unwrap();
        assert_eq!(store.event_count(&id).unwrap(), 3);
        assert_eq!(
            store.load_tallies().unwrap().get(&id),
            Some(&(3, Resolution::Overturned))
        );
    }

    #[test]
    fn interleaved_votes_from_two_processes_both_count() {
        let tmp = TempDir::new().unwrap();
        let (db, id) = seeded_db(&tmp, &["v1", "v2"]);
        let a = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
        let b = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
        let now = Utc::now();

        assert_eq!(a.cast_vote(&id, "v3", Vote::Oppose, now).unwrap().tally, 1);
        let after = b.cast_vote(&id, "v4", Vote::Support, now).unwrap();
        assert_eq!(after.tally, 2);
        assert_eq!(after.votes.len(), 4);

        let reopened = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
        let c = reopened.get(&id).unwrap();
        assert_eq!((c.tally, c.resolution), (2, Resolution::Open));
        let tallies = ChallengeStore::open(&db).unwrap().load_tallies().unwrap();
        assert_eq!(tallies.get(&id), Some(&(2, Resolution::Open)));
    }

    #[test]
    fn challenge_opened_elsewhere_is_found_in_the_store() {
        let tmp = TempDir::new().unwrap();
        let (db, _) = seeded_db(&tmp, &[]);
        let early = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
        let other = ChallengeLedger::open(settings(), ChallengeStore::open(&db).unwrap()).unwrap();
        let now = Utc::now();

        let c = other.open_challenge(request("f1"), now).unwrap();
        let voted = early.cast_vote(&c.id, "v1", Vote::Support, now).unwrap();
        assert_eq!(voted.tally, 1);
        assert_eq!(other.cast_vote(&c.id, "v2", Vote::Support, now).unwrap().tally, 2);
    }

    #[test]
    fn known_ids_follow_aliases_across_reviewer_changes() {
        let ledger = ChallengeLedger::in_memory(settings());
        ledger
            .register_findings(&[canonical("first", Severity::High)])
            .unwrap();

        // A second reviewer joined; the merged issue computed a new id.
        let mut merged = canonical("joined", Severity::High);
        merged.aliases = BTreeSet::from(["first".to_string(), "joined".to_string()]);
        let unrelated = canonical("other", Severity::Low);
        let renames = ledger.known_ids(&[merged.clone(), unrelated]);
        assert_eq!(
            renames,
            BTreeMap::from([("joined".to_string(), "first".to_string())])
        );

        merged.id = "first".into();
        ledger.register_findings(&[merged]).unwrap();

        // Only the newer reviewer still reports it.
        let later = canonical("joined", Severity::High);
        let renames = ledger.known_ids(&[later]);
        assert_eq!(renames.get("joined").map(String::as_str), Some("first"));
    }

    #[test]
    fn known_ids_never_collide_with_this_runs_ids() {
        let ledger = ChallengeLedger::in_memory(settings());
        ledger
            .register_findings(&[canonical("first", Severity::High)])
            .unwrap();

        let mut split = canonical("second", Severity::High);
        split.aliases = BTreeSet::from(["first".to_string(), "second".to_string()]);
        let renames = ledger.known_ids(&[canonical("first", Severity::High), split]);
        assert!(renames.is_empty());
    }

    #[test]
    fn resolutions_fold_into_findings() {
        let mut findings = vec![
            canonical("f1", Severity::Critical),
            canonical("f2", Severity::High),
            canonical("f3", Severity::Medium),
        ];
        let ledger = ChallengeLedger::in_memory(settings());
        ledger.register_findings(&findings).unwrap();
        let now = Utc::now();

        let a = ledger.open_challenge(request("f1"), now).unwrap();
        ledger
            .resolve(&a.id, "lead", Resolution::Overturned, None, now)
            .unwrap();

        let mut modify = request("f2");
        modify.challenge_type = ChallengeType::SeverityDispute;
        modify.proposed = Some(FindingOverride {
            severity: Some(Severity::Low),
            category: Some("style".into()),
        });
        let b = ledger.open_challenge(modify, now).unwrap();
        ledger
            .resolve(&b.id, "lead", Resolution::Modified, None, now)
            .unwrap();

        let c = ledger.open_challenge(request("f3"), now).unwrap();
        ledger.resolve(&c.id, "lead", Resolution::Upheld, None, now).unwrap();

        apply_resolutions(&mut findings, &ledger.list());

        assert!(!findings[0].is_live());
        assert_eq!(findings[1].severity, Severity::Low);
        assert_eq!(findings[1].category, "style");
        assert!(matches!(
            findings[1].status,
            FindingStatus::Modified { previous_severity: Severity::High, .. }
        ));
        assert_eq!(findings[2].status, FindingStatus::Active);
        assert_eq!(findings[2].severity, Severity::Medium);
    }
}
