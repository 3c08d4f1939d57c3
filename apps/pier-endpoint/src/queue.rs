use std::collections::{HashSet, VecDeque};

use pier_proto::{IceCandidate, SessionToken};

/// Upper bound on candidates held for sessions that do not exist yet.
pub const EARLY_CANDIDATE_CAPACITY: usize = 256;

/// Number of superseded tokens remembered for stale-message detection.
pub const RETIRED_TOKEN_CAPACITY: usize = 64;

/// Remote candidates of one negotiation session.
///
/// Until the remote description is applied, candidates are held in arrival
/// order. Afterwards every candidate is handed back for immediate use.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    remote_description_set: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pending(pending: impl IntoIterator<Item = IceCandidate>) -> Self {
        Self {
            pending: pending.into_iter().collect(),
            remote_description_set: false,
        }
    }

    /// Returns the candidate back when it can be applied right away.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Marks the remote description applied and drains everything held so far.
    pub fn mark_remote_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.pending.drain(..).collect()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Candidates that arrived before the offer they belong to.
#[derive(Debug)]
pub struct EarlyCandidates {
    entries: VecDeque<(Option<SessionToken>, IceCandidate)>,
    capacity: usize,
}

impl Default for EarlyCandidates {
    fn default() -> Self {
        Self::with_capacity(EARLY_CANDIDATE_CAPACITY)
    }
}

impl EarlyCandidates {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Holds a candidate, evicting the oldest one when full. Returns whether an
    /// eviction happened.
    pub fn hold(&mut self, token: Option<SessionToken>, candidate: IceCandidate) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            true
        } else {
            false
        };
        self.entries.push_back((token, candidate));
        evicted
    }

    /// Removes and returns every candidate held for `token`, oldest first.
    pub fn take(&mut self, token: Option<&SessionToken>) -> Vec<IceCandidate> {
        let mut taken = Vec::new();
        self.entries.retain(|(held, candidate)| {
            if held.as_ref() == token {
                taken.push(candidate.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn discard(&mut self, token: &SessionToken) {
        self.entries.retain(|(held, _)| held.as_ref() != Some(token));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bounded set of tokens whose sessions were superseded or torn down.
#[derive(Debug)]
pub struct RetiredTokens {
    order: VecDeque<SessionToken>,
    members: HashSet<SessionToken>,
    capacity: usize,
}

impl Default for RetiredTokens {
    fn default() -> Self {
        Self::with_capacity(RETIRED_TOKEN_CAPACITY)
    }
}

impl RetiredTokens {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    pub fn retire(&mut self, token: SessionToken) {
        if self.capacity == 0 || !self.members.insert(token.clone()) {
            return;
        }
        self.order.push_back(token);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, token: &SessionToken) -> bool {
        self.members.contains(token)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
