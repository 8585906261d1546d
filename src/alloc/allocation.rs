//! Allocation records.
//!
//! An allocation is a reservation of one or more targets by a user:
//! `AllocationId → Allocation{user, targets, priority, state, created_at,
//! granted_at, last_keepalive, ended_at, guests}`.

use crate::core::time::Tick;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique allocation identifier. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub u64);

impl AllocationId {
    /// Decode an owner cell value (0 means unowned).
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Encode an owner reference for an owner cell.
    pub fn to_raw(id: Option<Self>) -> u64 {
        id.map(|id| id.0).unwrap_or(0)
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AllocationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Allocation lifecycle state.
///
/// Grants are all-or-nothing, so there is no partial state: a request goes
/// from `Queued` straight to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    /// Accepted, waiting for every requested target.
    Queued,
    /// Every requested target is owned by this allocation.
    Active,
    /// Terminal: released by its user or an admin (or withdrawn while queued).
    Released,
    /// Terminal: queued too long or idle without keepalive.
    #[serde(rename = "timedout")]
    TimedOut,
    /// Terminal: the request named unknown targets.
    Invalid,
}

impl AllocationState {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::TimedOut | Self::Invalid)
    }
}

impl std::fmt::Display for AllocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Active => write!(f, "active"),
            Self::Released => write!(f, "released"),
            Self::TimedOut => write!(f, "timedout"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// Identity of the calling user as resolved by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    /// May release any allocation.
    pub admin: bool,
}

impl Caller {
    /// A regular user.
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user: name.into(),
            admin: false,
        }
    }

    /// A user with administrative capability.
    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            user: name.into(),
            admin: true,
        }
    }
}

/// Acquire request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequest {
    /// Requested target names.
    pub targets: Vec<String>,
    /// Priority; lower wins. Defaults to the configured default.
    #[serde(default)]
    pub priority: Option<u32>,
    /// Queue behind contenders (true) or fail with Busy at once (false).
    #[serde(default = "default_queue")]
    pub queue: bool,
}

fn default_queue() -> bool {
    true
}

impl AcquireRequest {
    /// Queued request with the default priority.
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            priority: None,
            queue: true,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Fail immediately instead of queueing.
    pub fn no_queue(mut self) -> Self {
        self.queue = false;
        self
    }
}

/// Allocation record held by the manager.
#[derive(Debug, Clone)]
pub(crate) struct Allocation {
    pub id: AllocationId,
    pub user: String,
    /// Requested targets, sorted; this is also the claim order.
    pub targets: Vec<String>,
    /// Targets currently owned by this allocation.
    pub granted: Vec<String>,
    pub priority: u32,
    pub state: AllocationState,
    pub created_at: Tick,
    pub granted_at: Option<Tick>,
    pub last_keepalive: Tick,
    pub ended_at: Option<Tick>,
    pub guests: BTreeSet<String>,
    pub reason: Option<String>,
}

impl Allocation {
    pub fn new(
        id: AllocationId,
        user: String,
        targets: Vec<String>,
        priority: u32,
        now: Tick,
    ) -> Self {
        Self {
            id,
            user,
            targets,
            granted: Vec::new(),
            priority,
            state: AllocationState::Queued,
            created_at: now,
            granted_at: None,
            last_keepalive: now,
            ended_at: None,
            guests: BTreeSet::new(),
            reason: None,
        }
    }

    /// Whether the caller may use the allocation's targets.
    pub fn admits(&self, user: &str) -> bool {
        self.user == user || self.guests.contains(user)
    }

    pub fn view(&self, server: &str) -> AllocationView {
        AllocationView {
            id: self.id,
            state: self.state,
            server: server.to_string(),
            user: self.user.clone(),
            priority: self.priority,
            targets: self.targets.clone(),
            granted: self.granted.clone(),
            guests: self.guests.iter().cloned().collect(),
            created_at: self.created_at,
            granted_at: self.granted_at,
            last_keepalive: self.last_keepalive,
            ended_at: self.ended_at,
            reason: self.reason.clone(),
        }
    }
}

/// Listing record for an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationView {
    pub id: AllocationId,
    pub state: AllocationState,
    /// Originating broker server.
    pub server: String,
    pub user: String,
    pub priority: u32,
    pub targets: Vec<String>,
    pub granted: Vec<String>,
    pub guests: Vec<String>,
    pub created_at: Tick,
    pub granted_at: Option<Tick>,
    pub last_keepalive: Tick,
    pub ended_at: Option<Tick>,
    pub reason: Option<String>,
}
