// Cross-node arbitration of competing block hashes

use crate::consensus::pow::short_id;
use crate::core::{BlockHash, Timestamp};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_UNCLAIMED_TTL: Duration = Duration::from_secs(30);
const MAX_UNCLAIMED_RACES: usize = 4096;

/// A hash proposed for a block id, stamped with its broadcast time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCandidate {
    pub hash: BlockHash,
    pub time_stamp: Timestamp,
}

impl HashCandidate {
    pub fn new(hash: impl Into<BlockHash>, time_stamp: Timestamp) -> Self {
        Self {
            hash: hash.into(),
            time_stamp,
        }
    }
}

/// Resolution handle for one local mining run
///
/// Set once a peer's candidate for the same block id has been accepted.
#[derive(Debug, Clone)]
pub struct MiningSession {
    block_id: String,
    token: u64,
    preempted: Arc<AtomicBool>,
}

impl MiningSession {
    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn is_preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }
}

/// Candidates gathered by one local mining run
struct SessionRace {
    token: u64,
    preempted: Arc<AtomicBool>,
    candidates: Vec<HashCandidate>,
}

/// Everything held for one block id
struct Race {
    /// Peer candidates that arrived before any local session opened
    unclaimed: Vec<HashCandidate>,
    /// Open local sessions, oldest first
    sessions: Vec<SessionRace>,
    last_seen: Instant,
}

impl Race {
    fn new() -> Self {
        Self {
            unclaimed: Vec::new(),
            sessions: Vec::new(),
            last_seen: Instant::now(),
        }
    }

    fn candidate_count(&self) -> usize {
        self.unclaimed.len() + self.sessions.iter().map(|s| s.candidates.len()).sum::<usize>()
    }
}

struct CollectorState {
    races: HashMap<String, Race>,
    /// Ids resolved recently; late candidates for them are dropped
    recently_resolved: VecDeque<String>,
    recent_capacity: usize,
    next_token: u64,
}

impl CollectorState {
    /// Drop sessionless races nobody claimed within `ttl`
    fn sweep_unclaimed(&mut self, ttl: Duration) {
        let before = self.races.len();
        self.races
            .retain(|_, race| !race.sessions.is_empty() || race.last_seen.elapsed() < ttl);
        let swept = before - self.races.len();
        if swept > 0 {
            log::debug!("Discarded {} unclaimed peer race(s)", swept);
        }
    }

    fn unclaimed_races(&self) -> usize {
        self.races.values().filter(|race| race.sessions.is_empty()).count()
    }

    fn mark_resolved(&mut self, block_id: &str) {
        if self.recent_capacity == 0 {
            return;
        }
        if self.recently_resolved.len() == self.recent_capacity {
            self.recently_resolved.pop_front();
        }
        self.recently_resolved.push_back(block_id.to_string());
    }
}

/// Block-id keyed bag of candidates from local and remote miners
///
/// Policy: earliest timestamp wins; ties go to the first inserted.
/// Peer candidates go to the oldest open session for their block id, so
/// two local runs over identical batches never share a winner.
pub struct HashRaceCollector {
    state: Mutex<CollectorState>,
    unclaimed_ttl: Duration,
    max_unclaimed: usize,
}

impl HashRaceCollector {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            state: Mutex::new(CollectorState {
                races: HashMap::new(),
                recently_resolved: VecDeque::with_capacity(recent_capacity),
                recent_capacity,
                next_token: 0,
            }),
            unclaimed_ttl: DEFAULT_UNCLAIMED_TTL,
            max_unclaimed: MAX_UNCLAIMED_RACES,
        }
    }

    /// How long peer candidates wait for a local session to claim them
    pub fn with_unclaimed_ttl(mut self, ttl: Duration) -> Self {
        self.unclaimed_ttl = ttl;
        self
    }

    /// Upper bound on block ids held without a local session
    pub fn with_max_unclaimed(mut self, max: usize) -> Self {
        self.max_unclaimed = max;
        self
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a local mining session for a block id
    ///
    /// The session claims peer candidates that are already waiting and is
    /// preempted at once if there are any.
    pub fn open_session(&self, block_id: &str) -> MiningSession {
        let mut state = self.lock();
        state.sweep_unclaimed(self.unclaimed_ttl);
        state.recently_resolved.retain(|id| id != block_id);

        let token = state.next_token;
        state.next_token += 1;

        let race = state.races.entry(block_id.to_string()).or_insert_with(Race::new);
        race.last_seen = Instant::now();
        let candidates = std::mem::take(&mut race.unclaimed);
        let preempted = Arc::new(AtomicBool::new(!candidates.is_empty()));
        race.sessions.push(SessionRace {
            token,
            preempted: Arc::clone(&preempted),
            candidates,
        });

        MiningSession {
            block_id: block_id.to_string(),
            token,
            preempted,
        }
    }

    /// Record this node's own candidate for its session
    ///
    /// Returns false if the session was already resolved.
    pub fn record_local(&self, session: &MiningSession, candidate: HashCandidate) -> bool {
        let mut state = self.lock();
        let Some(own) = state
            .races
            .get_mut(&session.block_id)
            .and_then(|race| race.sessions.iter_mut().find(|s| s.token == session.token))
        else {
            log::debug!("Dropping candidate {} for closed session on {}", candidate.hash, short_id(&session.block_id));
            return false;
        };
        own.candidates.push(candidate);
        true
    }

    /// Record a candidate announced by a peer; preempts the oldest local session
    pub fn record_external(&self, block_id: &str, candidate: HashCandidate) -> bool {
        let mut state = self.lock();
        state.sweep_unclaimed(self.unclaimed_ttl);

        let has_session = state
            .races
            .get(block_id)
            .is_some_and(|race| !race.sessions.is_empty());

        if !has_session && state.recently_resolved.iter().any(|id| id == block_id) {
            log::debug!("Dropping late candidate {} for resolved block {}", candidate.hash, short_id(block_id));
            return false;
        }

        if !state.races.contains_key(block_id) && state.unclaimed_races() >= self.max_unclaimed {
            log::warn!("Too many unclaimed races, dropping candidate for {}", short_id(block_id));
            return false;
        }

        let race = state.races.entry(block_id.to_string()).or_insert_with(Race::new);
        race.last_seen = Instant::now();
        match race.sessions.first_mut() {
            Some(oldest) => {
                oldest.candidates.push(candidate);
                oldest.preempted.store(true, Ordering::Release);
            }
            None => race.unclaimed.push(candidate),
        }

        true
    }

    /// Pick the winner for a session and purge its candidates
    pub fn resolve(&self, session: &MiningSession) -> Option<HashCandidate> {
        let mut state = self.lock();
        let block_id = session.block_id.as_str();

        let race = state.races.get_mut(block_id)?;
        let index = race.sessions.iter().position(|s| s.token == session.token)?;
        let own = race.sessions.remove(index);

        if race.sessions.is_empty() {
            state.races.remove(block_id);
            state.mark_resolved(block_id);
        }

        let mut winner: Option<HashCandidate> = None;
        for candidate in own.candidates {
            if winner.as_ref().is_none_or(|w| candidate.time_stamp < w.time_stamp) {
                winner = Some(candidate);
            }
        }

        if let Some(w) = &winner {
            log::info!("Race for block {} resolved to {} (t={})", short_id(block_id), w.hash, w.time_stamp);
        }
        winner
    }

    /// Number of candidates currently held for a block id
    pub fn pending(&self, block_id: &str) -> usize {
        self.lock()
            .races
            .get(block_id)
            .map(Race::candidate_count)
            .unwrap_or(0)
    }

    /// Number of block ids with an open race
    pub fn open_races(&self) -> usize {
        self.lock().races.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earliest_timestamp_wins() {
        let collector = HashRaceCollector::new(8);
        let session = collector.open_session("block");
        collector.record_external("block", HashCandidate::new("h1", 100));
        collector.record_local(&session, HashCandidate::new("h2", 50));
        collector.record_external("block", HashCandidate::new("h3", 75));

        let winner = collector.resolve(&session).unwrap();
        assert_eq!(winner.hash, "h2");
    }

    #[test]
    fn test_tie_goes_to_first_inserted() {
        let collector = HashRaceCollector::new(8);
        collector.record_external("block", HashCandidate::new("first", 10));
        collector.record_external("block", HashCandidate::new("second", 10));
        let session = collector.open_session("block");

        assert_eq!(collector.resolve(&session).unwrap().hash, "first");
    }

    #[test]
    fn test_resolve_purges_entry() {
        let collector = HashRaceCollector::new(8);
        let session = collector.open_session("block");
        collector.record_local(&session, HashCandidate::new("h", 1));
        assert_eq!(collector.pending("block"), 1);

        collector.resolve(&session);
        assert_eq!(collector.pending("block"), 0);
        assert_eq!(collector.open_races(), 0);
        assert!(collector.resolve(&session).is_none());
    }

    #[test]
    fn test_late_candidate_dropped() {
        let collector = HashRaceCollector::new(8);
        let session = collector.open_session("block");
        collector.record_local(&session, HashCandidate::new("h", 1));
        collector.resolve(&session);

        assert!(!collector.record_external("block", HashCandidate::new("late", 0)));
        assert!(!collector.record_local(&session, HashCandidate::new("late", 0)));
        assert_eq!(collector.open_races(), 0);
    }

    #[test]
    fn test_recently_resolved_is_bounded() {
        let collector = HashRaceCollector::new(2);
        for id in ["a", "b", "c"] {
            let session = collector.open_session(id);
            collector.record_local(&session, HashCandidate::new("h", 1));
            collector.resolve(&session);
        }

        // "a" was evicted from the recent set and is accepted again
        assert!(collector.record_external("a", HashCandidate::new("h", 1)));
        assert!(!collector.record_external("c", HashCandidate::new("h", 1)));
    }

    #[test]
    fn test_external_candidate_preempts_session() {
        let collector = HashRaceCollector::new(8);
        let session = collector.open_session("block");
        assert!(!session.is_preempted());

        collector.record_local(&session, HashCandidate::new("mine", 1));
        assert!(!session.is_preempted());

        collector.record_external("block", HashCandidate::new("theirs", 2));
        assert!(session.is_preempted());
        assert_eq!(session.block_id(), "block");
    }

    #[test]
    fn test_session_opened_after_external_is_preempted() {
        let collector = HashRaceCollector::new(8);
        collector.record_external("block", HashCandidate::new("theirs", 2));

        let session = collector.open_session("block");
        assert!(session.is_preempted());
        assert_eq!(collector.resolve(&session).unwrap().hash, "theirs");
    }

    #[test]
    fn test_reopening_resolved_block_accepts_candidates() {
        let collector = HashRaceCollector::new(8);
        let first = collector.open_session("block");
        collector.record_local(&first, HashCandidate::new("h", 1));
        collector.resolve(&first);

        let session = collector.open_session("block");
        assert!(!session.is_preempted());
        assert!(collector.record_local(&session, HashCandidate::new("again", 2)));
        assert!(collector.record_external("block", HashCandidate::new("peer", 3)));
    }

    #[test]
    fn test_sessions_are_scoped_per_block() {
        let collector = HashRaceCollector::new(8);
        let a = collector.open_session("a");
        let b = collector.open_session("b");

        collector.record_external("a", HashCandidate::new("h", 1));
        assert!(a.is_preempted());
        assert!(!b.is_preempted());
    }

    #[test]
    fn test_identical_block_ids_resolve_independently() {
        let collector = HashRaceCollector::new(8);
        let first = collector.open_session("same");
        let second = collector.open_session("same");
        assert!(!second.is_preempted());

        collector.record_local(&first, HashCandidate::new("one", 1));
        collector.record_local(&second, HashCandidate::new("two", 2));

        // Peer candidates land on the oldest open session only
        collector.record_external("same", HashCandidate::new("peer", 0));
        assert!(first.is_preempted());
        assert!(!second.is_preempted());

        assert_eq!(collector.resolve(&first).unwrap().hash, "peer");
        assert_eq!(collector.open_races(), 1);
        assert_eq!(collector.resolve(&second).unwrap().hash, "two");
        assert_eq!(collector.open_races(), 0);
    }

    #[test]
    fn test_unclaimed_races_expire() {
        let collector = HashRaceCollector::new(8).with_unclaimed_ttl(Duration::from_millis(500));
        for i in 0..1000 {
            collector.record_external(&format!("foreign-{}", i), HashCandidate::new("h", i));
        }
        assert_eq!(collector.open_races(), 1000);

        std::thread::sleep(Duration::from_millis(600));
        let session = collector.open_session("local");
        assert_eq!(collector.open_races(), 1);

        collector.resolve(&session);
        assert_eq!(collector.open_races(), 0);
    }

    #[test]
    fn test_races_with_sessions_survive_expiry() {
        let collector = HashRaceCollector::new(8).with_unclaimed_ttl(Duration::ZERO);
        let session = collector.open_session("local");
        collector.record_external("local", HashCandidate::new("peer", 1));
        collector.record_external("foreign", HashCandidate::new("h", 1));

        collector.open_session("other");
        assert_eq!(collector.pending("local"), 1);
        assert_eq!(collector.pending("foreign"), 0);
        assert_eq!(collector.resolve(&session).unwrap().hash, "peer");
    }

    #[test]
    fn test_unclaimed_races_are_capped() {
        let collector = HashRaceCollector::new(8).with_max_unclaimed(2);
        assert!(collector.record_external("a", HashCandidate::new("h", 1)));
        assert!(collector.record_external("b", HashCandidate::new("h", 1)));
        assert!(!collector.record_external("c", HashCandidate::new("h", 1)));

        // Known ids still accept candidates
        assert!(collector.record_external("a", HashCandidate::new("h2", 2)));
        assert_eq!(collector.pending("a"), 2);
    }
}
