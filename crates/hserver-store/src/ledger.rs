//! Ledger Engine: the append-only credit log and its balance invariant.
//!
//! Every balance-affecting write holds the ledger lock and runs inside one
//! `BEGIN IMMEDIATE` transaction, so the balance check and the append cannot
//! interleave with another writer in this process or any other process
//! sharing the database file. A rejected spend appends nothing.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use hserver_core::{ActorId, CaseId, DomainEvent};
use hserver_settings::LedgerSettings;

use crate::errors::{EngineError, Result, is_constraint_violation};
use crate::sqlite::repositories::ledger::{HistoryFilter, LedgerRepo, NewEntry};
use crate::store::Store;
use crate::types::{CreditCategory, HistoryPage, LedgerEntry};

/// Balance compared with the shortage threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowBalance {
    /// Current balance.
    pub balance: i64,
    /// Configured threshold.
    pub threshold: i64,
    /// `balance <= threshold`.
    pub low: bool,
}

/// The credit ledger for one organization.
#[derive(Clone)]
pub struct LedgerEngine {
    store: Arc<Store>,
    settings: LedgerSettings,
}

impl LedgerEngine {
    /// Create a ledger over `store`.
    pub fn new(store: Arc<Store>, settings: LedgerSettings) -> Self {
        Self { store, settings }
    }

    /// Add credit. Fails with `LIMIT_EXCEEDED` only when a ceiling is configured
    /// and the new balance would exceed it.
    #[instrument(skip(self))]
    pub fn allocate(&self, quantity: i64, actor: Option<&ActorId>) -> Result<LedgerEntry> {
        require_positive(quantity)?;
        let ceiling = self.settings.max_balance;
        let (entry, balance) = self.store.with_ledger_write_lock(|| {
            self.store.write(|tx| {
                credit(tx, quantity, CreditCategory::Allocate, actor, None, ceiling)
            })
        })?;
        debug!(entry_id = %entry.id, balance, "credit allocated");
        self.store.publish(&[DomainEvent::CreditAllocated {
            entry_id: entry.id.clone(),
            quantity,
            balance,
        }]);
        Ok(entry)
    }

    /// Consume credit. Fails with `INSUFFICIENT_CREDIT` and appends nothing
    /// if the balance would go negative.
    #[instrument(skip(self))]
    pub fn spend(
        &self,
        quantity: i64,
        actor: Option<&ActorId>,
        subject: Option<&CaseId>,
    ) -> Result<LedgerEntry> {
        require_positive(quantity)?;
        let result = self.store.with_ledger_write_lock(|| {
            self.store
                .write(|tx| debit(tx, quantity, CreditCategory::RusUse, actor, subject))
        });
        let (entry, balance) = match result {
            Ok(ok) => ok,
            Err(err) => {
                if let Some(event) = insufficient_event(&err, actor) {
                    self.store.publish(&[event]);
                }
                return Err(err);
            }
        };
        debug!(entry_id = %entry.id, balance, "credit spent");
        if let Some(event) = shortage_event(balance, self.settings.shortage_threshold) {
            self.store.publish(&[event]);
        }
        Ok(entry)
    }

    /// Return credit for a prior spend.
    ///
    /// With a subject the refund is tied to that case's spend and is safe to
    /// retry: once the spend is fully refunded, the existing refund entry is
    /// returned and nothing is appended. Fails with `INVALID_ARGUMENT` if the
    /// case was never charged or `quantity` exceeds what is still owed.
    /// Without a subject it is a plain credit correction.
    #[instrument(skip(self))]
    pub fn refund(
        &self,
        quantity: i64,
        actor: Option<&ActorId>,
        subject: Option<&CaseId>,
    ) -> Result<LedgerEntry> {
        require_positive(quantity)?;
        let refund = self.store.with_ledger_write_lock(|| {
            self.store.write(|tx| match subject {
                Some(case_id) => refund_in(tx, quantity, actor, case_id),
                None => credit(tx, quantity, CreditCategory::Revoke, actor, None, None)
                    .map(|(entry, _)| Refund::Issued(entry)),
            })
        })?;
        let entry = match refund {
            Refund::Issued(entry) => entry,
            Refund::AlreadyIssued(entry) => {
                debug!(entry_id = %entry.id, "refund already issued");
                return Ok(entry);
            }
        };
        self.store.publish(&[DomainEvent::CreditRefunded {
            entry_id: entry.id.clone(),
            subject: subject.cloned(),
            quantity,
        }]);
        Ok(entry)
    }

    /// Withdraw unused credit. Same check as [`spend`](Self::spend).
    #[instrument(skip(self))]
    pub fn reclaim(&self, quantity: i64, actor: Option<&ActorId>) -> Result<LedgerEntry> {
        require_positive(quantity)?;
        let (entry, balance) = self.store.with_ledger_write_lock(|| {
            self.store
                .write(|tx| debit(tx, quantity, CreditCategory::Reclaim, actor, None))
        })?;
        self.store.publish(&[DomainEvent::CreditReclaimed {
            entry_id: entry.id.clone(),
            quantity,
            balance,
        }]);
        Ok(entry)
    }

    /// Record an audit-only entry. It never counts toward the balance.
    #[instrument(skip(self))]
    pub fn append_audit(
        &self,
        quantity: i64,
        category: CreditCategory,
        actor: Option<&ActorId>,
        subject: Option<&CaseId>,
    ) -> Result<LedgerEntry> {
        if quantity == 0 {
            return Err(EngineError::InvalidArgument("quantity must be non-zero".into()));
        }
        self.store.with_ledger_write_lock(|| {
            self.store.write(|tx| {
                LedgerRepo::append(
                    tx,
                    &NewEntry {
                        quantity,
                        category,
                        committed: false,
                        actor,
                        subject,
                    },
                )
            })
        })
    }

    /// Sum of committed entries.
    pub fn balance(&self) -> Result<i64> {
        self.store.read(LedgerRepo::balance)
    }

    /// Filtered, paged history with running balances.
    pub fn history(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        self.store.read(|conn| LedgerRepo::history(conn, filter))
    }

    /// Entries about one case, oldest first.
    pub fn entries_for(&self, case_id: &CaseId) -> Result<Vec<LedgerEntry>> {
        self.store.read(|conn| LedgerRepo::list_by_subject(conn, case_id))
    }

    /// Balance against the shortage threshold, for the scheduler.
    pub fn low_balance(&self) -> Result<LowBalance> {
        let balance = self.balance()?;
        let threshold = self.settings.shortage_threshold;
        Ok(LowBalance {
            balance,
            threshold,
            low: balance <= threshold,
        })
    }

    /// Shortage threshold in effect.
    pub fn shortage_threshold(&self) -> i64 {
        self.settings.shortage_threshold
    }
}

fn require_positive(quantity: i64) -> Result<()> {
    if quantity <= 0 {
        return Err(EngineError::InvalidArgument(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    Ok(())
}

/// Append a negative committed entry if the balance covers it.
///
/// Must run inside a transaction holding the ledger lock. Returns the entry
/// and the balance after it.
pub(crate) fn debit(
    conn: &Connection,
    quantity: i64,
    category: CreditCategory,
    actor: Option<&ActorId>,
    subject: Option<&CaseId>,
) -> Result<(LedgerEntry, i64)> {
    let balance = LedgerRepo::balance(conn)?;
    if balance - quantity < 0 {
        return Err(EngineError::InsufficientCredit {
            requested: quantity,
            balance,
        });
    }
    let entry = LedgerRepo::append(
        conn,
        &NewEntry {
            quantity: -quantity,
            category,
            committed: true,
            actor,
            subject,
        },
    )
    .map_err(|err| match err {
        // Schema backstop: another writer got in without the in-process lock.
        EngineError::Sqlite(ref e) if is_constraint_violation(e) => EngineError::InsufficientCredit {
            requested: quantity,
            balance,
        },
        other => other,
    })?;
    Ok((entry, balance - quantity))
}

/// Outcome of [`refund_in`].
#[derive(Debug, Clone)]
pub(crate) enum Refund {
    /// A new REVOKE entry was appended.
    Issued(LedgerEntry),
    /// The subject's spend was already covered; this is the latest refund.
    AlreadyIssued(LedgerEntry),
}

impl Refund {
    pub(crate) fn into_entry(self) -> LedgerEntry {
        match self {
            Self::Issued(entry) | Self::AlreadyIssued(entry) => entry,
        }
    }
}

/// Refund against the spend recorded for `subject`.
///
/// Must run inside a transaction holding the ledger lock.
pub(crate) fn refund_in(
    conn: &Connection,
    quantity: i64,
    actor: Option<&ActorId>,
    subject: &CaseId,
) -> Result<Refund> {
    let totals = LedgerRepo::subject_totals(conn, subject)?;
    if totals.spent <= 0 {
        return Err(EngineError::InvalidArgument(format!(
            "no spend recorded for {subject}"
        )));
    }
    let owed = totals.spent - totals.refunded;
    if owed <= 0 {
        if let Some(existing) = LedgerRepo::latest_for_subject(conn, subject, CreditCategory::Revoke)? {
            return Ok(Refund::AlreadyIssued(existing));
        }
    }
    if quantity > owed {
        return Err(EngineError::InvalidArgument(format!(
            "refund of {quantity} exceeds the {owed} still owed for {subject}"
        )));
    }
    let (entry, _) = credit(conn, quantity, CreditCategory::Revoke, actor, Some(subject), None)?;
    Ok(Refund::Issued(entry))
}

/// Append a positive committed entry, enforcing `ceiling` when given.
///
/// Must run inside a transaction holding the ledger lock.
pub(crate) fn credit(
    conn: &Connection,
    quantity: i64,
    category: CreditCategory,
    actor: Option<&ActorId>,
    subject: Option<&CaseId>,
    ceiling: Option<i64>,
) -> Result<(LedgerEntry, i64)> {
    let balance = LedgerRepo::balance(conn)?;
    let after = balance.saturating_add(quantity);
    if let Some(limit) = ceiling {
        if after > limit {
            return Err(EngineError::LimitExceeded {
                requested: quantity,
                balance,
                limit,
            });
        }
    }
    let entry = LedgerRepo::append(
        conn,
        &NewEntry {
            quantity,
            category,
            committed: true,
            actor,
            subject,
        },
    )?;
    Ok((entry, after))
}

/// `CreditShortage` when a spend lands exactly on the threshold.
pub(crate) fn shortage_event(balance_after: i64, threshold: i64) -> Option<DomainEvent> {
    (balance_after == threshold).then_some(DomainEvent::CreditShortage {
        balance: balance_after,
        threshold,
    })
}

/// `CreditInsufficient` for a rejected spend.
pub(crate) fn insufficient_event(err: &EngineError, actor: Option<&ActorId>) -> Option<DomainEvent> {
    match err {
        EngineError::InsufficientCredit { requested, balance } => {
            Some(DomainEvent::CreditInsufficient {
                actor: actor.cloned(),
                requested: *requested,
                balance: *balance,
            })
        }
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::store::tests::setup;
    use assert_matches::assert_matches;
    use hserver_core::CollectingListener;

    fn ledger_with(settings: LedgerSettings) -> (LedgerEngine, Arc<CollectingListener>) {
        let store = Arc::new(setup());
        let events = Arc::new(CollectingListener::new("test"));
        store.events().register(events.clone());
        (LedgerEngine::new(store, settings), events)
    }

    fn ledger() -> (LedgerEngine, Arc<CollectingListener>) {
        ledger_with(LedgerSettings::default())
    }

    #[test]
    fn spend_from_zero_fails_and_appends_nothing() {
        let (ledger, events) = ledger();
        let user = ActorId::from("userX");
        let case = CaseId::from("case_1");

        let err = ledger.spend(1, Some(&user), Some(&case)).unwrap_err();
        assert_matches!(
            err,
            EngineError::InsufficientCredit {
                requested: 1,
                balance: 0
            }
        );
        assert_eq!(ledger.balance().unwrap(), 0);
        assert_eq!(ledger.history(&HistoryFilter::default()).unwrap().total, 0);
        assert_eq!(
            events.events(),
            vec![DomainEvent::CreditInsufficient {
                actor: Some(user),
                requested: 1,
                balance: 0
            }]
        );
    }

    #[test]
    fn allocate_spend_refund() {
        let (ledger, _) = ledger();
        let admin = ActorId::from("admin");
        let case = CaseId::from("case_1");

        ledger.allocate(5, Some(&admin)).unwrap();
        assert_eq!(ledger.balance().unwrap(), 5);

        let spent = ledger.spend(1, Some(&ActorId::from("userX")), Some(&case)).unwrap();
        assert_eq!(spent.quantity, -1);
        assert_eq!(spent.category, CreditCategory::RusUse);
        assert_eq!(ledger.balance().unwrap(), 4);

        let refund = ledger.refund(1, None, Some(&case)).unwrap();
        assert_eq!(refund.quantity, 1);
        assert_eq!(refund.category, CreditCategory::Revoke);
        assert_eq!(refund.subject.as_ref(), Some(&case));
        assert_eq!(ledger.balance().unwrap(), 5);

        assert_eq!(ledger.entries_for(&case).unwrap().len(), 2);
    }

    #[test]
    fn retried_refund_returns_the_first_entry() {
        let (ledger, events) = ledger();
        let case = CaseId::from("case_1");
        ledger.allocate(5, None).unwrap();
        ledger.spend(1, None, Some(&case)).unwrap();

        let first = ledger.refund(1, None, Some(&case)).unwrap();
        events.clear();
        let retried = ledger.refund(1, None, Some(&case)).unwrap();

        assert_eq!(retried, first);
        assert_eq!(ledger.balance().unwrap(), 5);
        let revokes: Vec<_> = ledger
            .entries_for(&case)
            .unwrap()
            .into_iter()
            .filter(|e| e.category == CreditCategory::Revoke)
            .collect();
        assert_eq!(revokes, vec![first]);
        assert!(events.events().is_empty());
    }

    #[test]
    fn refund_requires_a_prior_spend() {
        let (ledger, _) = ledger();
        ledger.allocate(5, None).unwrap();
        let never_spent = CaseId::from("never_spent");

        assert_matches!(
            ledger.refund(1, None, Some(&never_spent)),
            Err(EngineError::InvalidArgument(_))
        );
        // Audit-only spends do not count as charges.
        ledger
            .append_audit(-1, CreditCategory::RusUse, None, Some(&never_spent))
            .unwrap();
        assert_matches!(
            ledger.refund(1, None, Some(&never_spent)),
            Err(EngineError::InvalidArgument(_))
        );
        assert_eq!(ledger.balance().unwrap(), 5);
    }

    #[test]
    fn refund_cannot_exceed_what_is_owed() {
        let (ledger, _) = ledger();
        let case = CaseId::from("case_2");
        ledger.allocate(5, None).unwrap();
        ledger.spend(2, None, Some(&case)).unwrap();

        assert_matches!(
            ledger.refund(3, None, Some(&case)),
            Err(EngineError::InvalidArgument(_))
        );
        ledger.refund(1, None, Some(&case)).unwrap();
        ledger.refund(1, None, Some(&case)).unwrap();
        assert_eq!(ledger.balance().unwrap(), 5);

        // Fully covered now; a further call appends nothing.
        ledger.refund(1, None, Some(&case)).unwrap();
        assert_eq!(ledger.balance().unwrap(), 5);
        assert_eq!(ledger.entries_for(&case).unwrap().len(), 3);
    }

    #[test]
    fn non_positive_quantities_rejected() {
        let (ledger, _) = ledger();
        assert_matches!(ledger.allocate(0, None), Err(EngineError::InvalidArgument(_)));
        assert_matches!(ledger.spend(-1, None, None), Err(EngineError::InvalidArgument(_)));
        assert_matches!(ledger.refund(0, None, None), Err(EngineError::InvalidArgument(_)));
        assert_matches!(ledger.reclaim(-3, None), Err(EngineError::InvalidArgument(_)));
        assert_matches!(
            ledger.append_audit(0, CreditCategory::RusUse, None, None),
            Err(EngineError::InvalidArgument(_))
        );
    }

    #[test]
    fn ceiling_blocks_allocation_only() {
        let (ledger, _) = ledger_with(LedgerSettings {
            max_balance: Some(10),
            ..Default::default()
        });
        ledger.allocate(10, None).unwrap();
        let err = ledger.allocate(1, None).unwrap_err();
        assert_matches!(err, EngineError::LimitExceeded { limit: 10, balance: 10, .. });
        assert_eq!(err.kind(), hserver_core::ErrorKind::LimitExceeded);

        // Refunds are never blocked by the ceiling.
        ledger.refund(1, None, None).unwrap();
        assert_eq!(ledger.balance().unwrap(), 11);
    }

    #[test]
    fn reclaim_checks_balance() {
        let (ledger, events) = ledger();
        ledger.allocate(3, None).unwrap();
        assert_matches!(
            ledger.reclaim(4, None),
            Err(EngineError::InsufficientCredit { requested: 4, balance: 3 })
        );
        let entry = ledger.reclaim(2, Some(&ActorId::from("cloud"))).unwrap();
        assert_eq!(entry.category, CreditCategory::Reclaim);
        assert_eq!(entry.subject, None);
        assert_eq!(ledger.balance().unwrap(), 1);
        assert!(events.names().contains(&"creditReclaimed"));
    }

    #[test]
    fn audit_entries_do_not_count() {
        let (ledger, _) = ledger();
        ledger.allocate(2, None).unwrap();
        let audit = ledger
            .append_audit(-5, CreditCategory::RusUse, None, Some(&CaseId::from("case_x")))
            .unwrap();
        assert!(!audit.committed);
        assert_eq!(ledger.balance().unwrap(), 2);
        let page = ledger
            .history(&HistoryFilter {
                committed: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn shortage_emitted_exactly_at_threshold() {
        let (ledger, events) = ledger_with(LedgerSettings {
            shortage_threshold: 2,
            ..Default::default()
        });
        ledger.allocate(4, None).unwrap();
        ledger.spend(1, None, None).unwrap(); // 3
        ledger.spend(1, None, None).unwrap(); // 2
        ledger.spend(1, None, None).unwrap(); // 1

        let shortages: Vec<_> = events
            .events()
            .into_iter()
            .filter(|e| matches!(e, DomainEvent::CreditShortage { .. }))
            .collect();
        assert_eq!(
            shortages,
            vec![DomainEvent::CreditShortage {
                balance: 2,
                threshold: 2
            }]
        );

        let low = ledger.low_balance().unwrap();
        assert_eq!(low.balance, 1);
        assert!(low.low);
    }

    #[test]
    fn events_follow_commit() {
        let (ledger, events) = ledger();
        let entry = ledger.allocate(5, None).unwrap();
        assert_eq!(
            events.events(),
            vec![DomainEvent::CreditAllocated {
                entry_id: entry.id,
                quantity: 5,
                balance: 5
            }]
        );
    }
}
