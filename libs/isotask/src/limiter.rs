// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-function concurrency accounting.
//!
//! The limiter is process-local: two processes wrapping the same function
//! each enforce their own limit.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

/// What makes two identities "the same function".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum IdentityKey {
    /// Every value of this type is the same function.
    Type(TypeId),
    /// One wrapper instance, for types that can hold different functions.
    Instance(TypeId, u64),
    /// Chosen by the caller.
    Explicit(&'static str),
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Stable key identifying "the same wrapped function".
///
/// Equality covers the key and the scope. The name is carried for
/// diagnostics only.
#[derive(Clone, Copy, Debug)]
pub struct TaskIdentity {
    key: IdentityKey,
    scope: Option<TypeId>,
    name: &'static str,
}

impl TaskIdentity {
    /// Identity shared by every value of the function (or closure) type `F`.
    pub fn of<F: 'static>() -> Self {
        Self {
            key: IdentityKey::Type(TypeId::of::<F>()),
            scope: None,
            name: type_name::<F>(),
        }
    }

    /// Identity for one particular value of `F`.
    ///
    /// Function items and closures without captures have a type of their
    /// own, so they get [`of`](Self::of). Any other `F` (`fn` pointers, boxed
    /// closures, closures with captures) can hold different functions behind
    /// one type, so each call yields a fresh identity.
    pub fn for_value<F: 'static>(_function: &F) -> Self {
        if std::mem::size_of::<F>() == 0 {
            return Self::of::<F>();
        }
        Self {
            key: IdentityKey::Instance(TypeId::of::<F>(), NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)),
            scope: None,
            name: type_name::<F>(),
        }
    }

    /// Identity fixed by `key`: every identity with the same key and scope is
    /// the same function, whatever callable it was built from.
    pub fn keyed(key: &'static str) -> Self {
        Self {
            key: IdentityKey::Explicit(key),
            scope: None,
            name: key,
        }
    }

    /// Same identity, reported under a friendlier name.
    pub fn named(self, name: &'static str) -> Self {
        Self { name, ..self }
    }

    /// Same identity, counted separately for each scope type `S`.
    pub fn scoped<S: 'static>(self) -> Self {
        Self {
            scope: Some(TypeId::of::<S>()),
            ..self
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TaskIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.scope == other.scope
    }
}

impl Eq for TaskIdentity {}

impl Hash for TaskIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.scope.hash(state);
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Maximum number of simultaneously in-flight invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyLimit {
    /// No limit (default).
    #[default]
    Unbounded,
    /// At most this many invocations in flight.
    AtMost(usize),
}

impl ConcurrencyLimit {
    /// Whether a new invocation may start with `in_flight` already running.
    pub fn admits(&self, in_flight: usize) -> bool {
        match self {
            ConcurrencyLimit::Unbounded => true,
            ConcurrencyLimit::AtMost(max) => in_flight < *max,
        }
    }
}

impl From<Option<usize>> for ConcurrencyLimit {
    fn from(limit: Option<usize>) -> Self {
        limit.map_or(ConcurrencyLimit::Unbounded, ConcurrencyLimit::AtMost)
    }
}

impl fmt::Display for ConcurrencyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyLimit::Unbounded => f.write_str("unbounded"),
            ConcurrencyLimit::AtMost(max) => write!(f, "{}", max),
        }
    }
}

/// Thread-safe in-flight counters keyed by [`TaskIdentity`].
///
/// Cloning is cheap and every clone shares the same table.
#[derive(Clone, Default)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

#[derive(Default)]
struct LimiterInner {
    counts: Mutex<HashMap<TaskIdentity, usize>>,
}

static SHARED_LIMITER: OnceLock<ConcurrencyLimiter> = OnceLock::new();

impl ConcurrencyLimiter {
    /// Create an independent, empty limiter table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide table used by wrappers that were not given one.
    pub fn shared() -> Self {
        SHARED_LIMITER.get_or_init(ConcurrencyLimiter::new).clone()
    }

    /// Admit one more invocation of `identity` if `limit` allows it.
    ///
    /// On admission the count is incremented; on rejection the table is left
    /// untouched.
    pub fn try_admit(&self, identity: TaskIdentity, limit: ConcurrencyLimit) -> bool {
        let mut counts = self.inner.counts.lock();
        let in_flight = counts.get(&identity).copied().unwrap_or(0);

        if !limit.admits(in_flight) {
            tracing::warn!(
                task = %identity,
                in_flight,
                %limit,
                "Concurrency limit reached, rejecting invocation"
            );
            return false;
        }

        counts.insert(identity, in_flight + 1);
        tracing::debug!(task = %identity, in_flight = in_flight + 1, %limit, "Invocation admitted");
        true
    }

    /// Give back one slot for `identity`. Never drops below zero.
    pub fn release(&self, identity: TaskIdentity) {
        let mut counts = self.inner.counts.lock();
        match counts.get_mut(&identity) {
            Some(count) if *count > 0 => {
                *count -= 1;
                tracing::debug!(task = %identity, in_flight = *count, "Invocation slot released");
            }
            _ => {
                tracing::warn!(task = %identity, "Release without an in-flight invocation, ignoring");
            }
        }
    }

    /// Number of identities with an entry in the table.
    pub fn tracked(&self) -> usize {
        self.inner.counts.lock().len()
    }

    /// Number of admitted invocations not yet released.
    pub fn in_flight(&self, identity: TaskIdentity) -> usize {
        self.inner.counts.lock().get(&identity).copied().unwrap_or(0)
    }
}

impl fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("tracked", &self.tracked())
            .finish()
    }
}
