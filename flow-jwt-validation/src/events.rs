use std::{
    collections::BTreeMap,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;

use crate::outcome::ErrorCategory;

/// A closed set of counted event kinds.
pub trait EventCategory: Copy + 'static {
    const ALL: &'static [Self];

    /// Position of this category in [EventCategory::ALL].
    fn index(&self) -> usize;
    fn name(&self) -> &'static str;
}

/// Lock-free tally of events keyed by category.
///
/// `record` is a single relaxed atomic increment on the current table.
/// `reset` swaps in a fresh table, so increments racing with a reset may land
/// in either period but are never torn.
pub struct EventCounter<C: EventCategory> {
    table: ArcSwap<CounterTable>,
    category: PhantomData<C>,
}

struct CounterTable {
    cells: Vec<AtomicU64>,
}

impl CounterTable {
    fn new(size: usize) -> Self {
        Self {
            cells: (0..size).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl<C: EventCategory> EventCounter<C> {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(CounterTable::new(C::ALL.len())),
            category: PhantomData,
        }
    }

    pub fn record(&self, category: C) {
        self.table.load().cells[category.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, category: C) -> u64 {
        self.table.load().cells[category.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Self::read(&self.table.load_full())
    }

    /// Starts a new counting period and returns the totals of the previous one.
    pub fn reset(&self) -> BTreeMap<&'static str, u64> {
        let previous = self
            .table
            .swap(Arc::new(CounterTable::new(C::ALL.len())));
        Self::read(&previous)
    }

    fn read(table: &CounterTable) -> BTreeMap<&'static str, u64> {
        C::ALL
            .iter()
            .map(|category| {
                (
                    category.name(),
                    table.cells[category.index()].load(Ordering::Relaxed),
                )
            })
            .collect()
    }
}

impl<C: EventCategory> Default for EventCounter<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one token validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityEvent {
    Success,
    Rejected(ErrorCategory),
}

impl EventCategory for SecurityEvent {
    const ALL: &'static [Self] = &[
        SecurityEvent::Success,
        SecurityEvent::Rejected(ErrorCategory::MissingToken),
        SecurityEvent::Rejected(ErrorCategory::SizeExceeded),
        SecurityEvent::Rejected(ErrorCategory::Malformed),
        SecurityEvent::Rejected(ErrorCategory::IssuerUnknown),
        SecurityEvent::Rejected(ErrorCategory::SignatureInvalid),
        SecurityEvent::Rejected(ErrorCategory::Expired),
        SecurityEvent::Rejected(ErrorCategory::NotYetValid),
        SecurityEvent::Rejected(ErrorCategory::AudienceMismatch),
        SecurityEvent::Rejected(ErrorCategory::InsufficientScope),
        SecurityEvent::Rejected(ErrorCategory::InsufficientRole),
        SecurityEvent::Rejected(ErrorCategory::IssuerNotAllowed),
        SecurityEvent::Rejected(ErrorCategory::KeysUnavailable),
    ];

    fn index(&self) -> usize {
        match self {
            SecurityEvent::Success => 0,
            SecurityEvent::Rejected(category) => {
                1 + ErrorCategory::ALL
                    .iter()
                    .position(|c| c == category)
                    .unwrap_or_default()
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SecurityEvent::Success => "SUCCESS",
            SecurityEvent::Rejected(category) => category.name(),
        }
    }
}

/// Request-level outcomes of the gateway, counted independently of validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    RouteMatched,
    RouteNotFound,
    Authorized,
    Rejected,
    Proxied,
    UpstreamFailed,
    ManagementServed,
    BodyTooLarge,
}

impl EventCategory for GatewayEvent {
    const ALL: &'static [Self] = &[
        GatewayEvent::RouteMatched,
        GatewayEvent::RouteNotFound,
        GatewayEvent::Authorized,
        GatewayEvent::Rejected,
        GatewayEvent::Proxied,
        GatewayEvent::UpstreamFailed,
        GatewayEvent::ManagementServed,
        GatewayEvent::BodyTooLarge,
    ];

    fn index(&self) -> usize {
        *self as usize
    }

    fn name(&self) -> &'static str {
        match self {
            GatewayEvent::RouteMatched => "ROUTE_MATCHED",
            GatewayEvent::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayEvent::Authorized => "AUTHORIZED",
            GatewayEvent::Rejected => "REJECTED",
            GatewayEvent::Proxied => "PROXIED",
            GatewayEvent::UpstreamFailed => "UPSTREAM_FAILED",
            GatewayEvent::ManagementServed => "MANAGEMENT_SERVED",
            GatewayEvent::BodyTooLarge => "BODY_TOO_LARGE",
        }
    }
}

pub type SecurityEventCounter = EventCounter<SecurityEvent>;
pub type GatewaySecurityEvents = EventCounter<GatewayEvent>;
