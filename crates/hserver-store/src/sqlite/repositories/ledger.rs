//! Ledger repository: the append-only credit log.
//!
//! There is no update or delete here; the schema rejects both. The balance
//! is always derived as `SUM(quantity)` over committed rows.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use hserver_core::{ActorId, CaseId, EntryId};

use crate::errors::Result;
use crate::types::{CreditCategory, HistoryEntry, HistoryPage, LedgerEntry, now};

/// Append and aggregate over `ledger_entries`.
pub struct LedgerRepo;

/// Entry to append.
#[derive(Debug, Clone, Copy)]
pub struct NewEntry<'a> {
    /// Signed units.
    pub quantity: i64,
    /// Category.
    pub category: CreditCategory,
    /// Whether the entry counts toward the balance.
    pub committed: bool,
    /// Who caused it.
    pub actor: Option<&'a ActorId>,
    /// Related case.
    pub subject: Option<&'a CaseId>,
}

/// Committed spend and refund totals for one case, both as positive units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubjectTotals {
    /// Units spent (`RUS_USE`).
    pub spent: i64,
    /// Units refunded (`REVOKE`).
    pub refunded: i64,
}

/// Sort direction for history queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// Filters and paging for [`LedgerRepo::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Only this category.
    pub category: Option<CreditCategory>,
    /// Only entries about this case.
    pub subject: Option<CaseId>,
    /// Only entries caused by this actor.
    pub actor: Option<ActorId>,
    /// Only committed (`Some(true)`) or audit-only (`Some(false)`) entries.
    pub committed: Option<bool>,
    /// Created at or after.
    pub since: Option<DateTime<Utc>>,
    /// Created at or before.
    pub until: Option<DateTime<Utc>>,
    /// Page size; `None` for everything.
    pub limit: Option<u32>,
    /// Entries to skip.
    pub offset: u32,
    /// Order by insertion.
    pub order: SortOrder,
}

const FILTER_SQL: &str = "(?1 IS NULL OR category = ?1)
   AND (?2 IS NULL OR subject_case_id = ?2)
   AND (?3 IS NULL OR actor_id = ?3)
   AND (?4 IS NULL OR committed = ?4)
   AND (?5 IS NULL OR created_at >= ?5)
   AND (?6 IS NULL OR created_at <= ?6)";

impl LedgerRepo {
    /// Append one entry and return it.
    pub fn append(conn: &Connection, entry: &NewEntry<'_>) -> Result<LedgerEntry> {
        let id = EntryId::new();
        let created_at = now();
        let _ = conn.execute(
            "INSERT INTO ledger_entries (id, quantity, category, committed, actor_id, subject_case_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.as_str(),
                entry.quantity,
                entry.category,
                entry.committed,
                entry.actor.map(ActorId::as_str),
                entry.subject.map(CaseId::as_str),
                created_at,
            ],
        )?;
        Ok(LedgerEntry {
            id,
            seq: conn.last_insert_rowid(),
            quantity: entry.quantity,
            category: entry.category,
            committed: entry.committed,
            actor: entry.actor.cloned(),
            subject: entry.subject.cloned(),
            created_at,
        })
    }

    /// Sum of committed quantities.
    pub fn balance(conn: &Connection) -> Result<i64> {
        let balance: i64 = conn.query_row(
            "SELECT COALESCE(SUM(quantity), 0) FROM ledger_entries WHERE committed = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    /// Get an entry by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<LedgerEntry>> {
        let row = conn
            .query_row(
                "SELECT seq, id, quantity, category, committed, actor_id, subject_case_id, created_at
                 FROM ledger_entries WHERE id = ?1",
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All entries about a case, oldest first.
    pub fn list_by_subject(conn: &Connection, case_id: &str) -> Result<Vec<LedgerEntry>> {
        let mut stmt = conn.prepare(
            "SELECT seq, id, quantity, category, committed, actor_id, subject_case_id, created_at
             FROM ledger_entries WHERE subject_case_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![case_id], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Spend and refund totals over committed entries about a case.
    pub fn subject_totals(conn: &Connection, case_id: &str) -> Result<SubjectTotals> {
        let totals = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN category = 'RUS_USE' THEN -quantity ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN category = 'REVOKE' THEN quantity ELSE 0 END), 0)
             FROM ledger_entries
             WHERE committed = 1 AND subject_case_id = ?1",
            params![case_id],
            |row| {
                Ok(SubjectTotals {
                    spent: row.get(0)?,
                    refunded: row.get(1)?,
                })
            },
        )?;
        Ok(totals)
    }

    /// Most recent committed entry of `category` about a case.
    pub fn latest_for_subject(
        conn: &Connection,
        case_id: &str,
        category: CreditCategory,
    ) -> Result<Option<LedgerEntry>> {
        let row = conn
            .query_row(
                "SELECT seq, id, quantity, category, committed, actor_id, subject_case_id, created_at
                 FROM ledger_entries
                 WHERE subject_case_id = ?1 AND category = ?2 AND committed = 1
                 ORDER BY seq DESC LIMIT 1",
                params![case_id, category],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Filtered, paged history with the running committed balance.
    pub fn history(conn: &Connection, filter: &HistoryFilter) -> Result<HistoryPage> {
        let since = filter.since.map(|t| t.to_rfc3339());
        let until = filter.until.map(|t| t.to_rfc3339());
        let subject = filter.subject.as_ref().map(CaseId::as_str);
        let actor = filter.actor.as_ref().map(ActorId::as_str);

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM ledger_entries WHERE {FILTER_SQL}"),
            params![filter.category, subject, actor, filter.committed, since, until],
            |row| row.get(0),
        )?;

        let direction = match filter.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let sql = format!(
            "WITH running AS (
               SELECT seq, id, quantity, category, committed, actor_id, subject_case_id, created_at,
                      SUM(CASE WHEN committed = 1 THEN quantity ELSE 0 END)
                        OVER (ORDER BY seq ROWS UNBOUNDED PRECEDING) AS balance_after
               FROM ledger_entries
             )
             SELECT seq, id, quantity, category, committed, actor_id, subject_case_id, created_at, balance_after
             FROM running
             WHERE {FILTER_SQL}
             ORDER BY seq {direction}
             LIMIT ?7 OFFSET ?8"
        );
        let limit = filter.limit.map_or(-1, i64::from);
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(
                params![
                    filter.category,
                    subject,
                    actor,
                    filter.committed,
                    since,
                    until,
                    limit,
                    filter.offset,
                ],
                |row| {
                    Ok(HistoryEntry {
                        entry: Self::map_row(row)?,
                        balance_after: row.get(8)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(HistoryPage { entries, total })
    }

    /// Count all entries, committed or not.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(count)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
        Ok(LedgerEntry {
            seq: row.get(0)?,
            id: EntryId::from_string(row.get(1)?),
            quantity: row.get(2)?,
            category: row.get(3)?,
            committed: row.get(4)?,
            actor: row.get::<_, Option<String>>(5)?.map(ActorId::from_string),
            subject: row.get::<_, Option<String>>(6)?.map(CaseId::from_string),
            created_at: row.get(7)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn append(conn: &Connection, quantity: i64, category: CreditCategory, committed: bool) -> LedgerEntry {
        LedgerRepo::append(
            conn,
            &NewEntry {
                quantity,
                category,
                committed,
                actor: None,
                subject: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn append_assigns_id_and_seq() {
        let conn = setup();
        let a = append(&conn, 5, CreditCategory::Allocate, true);
        let b = append(&conn, -1, CreditCategory::RusUse, true);
        assert!(a.id.starts_with("led_"));
        assert!(b.seq > a.seq);

        let fetched = LedgerRepo::get_by_id(&conn, &a.id).unwrap().unwrap();
        assert_eq!(fetched, a);
    }

    #[test]
    fn balance_ignores_uncommitted() {
        let conn = setup();
        assert_eq!(LedgerRepo::balance(&conn).unwrap(), 0);
        append(&conn, 5, CreditCategory::Allocate, true);
        append(&conn, 100, CreditCategory::Allocate, false);
        append(&conn, -2, CreditCategory::RusUse, true);
        assert_eq!(LedgerRepo::balance(&conn).unwrap(), 3);
        assert_eq!(LedgerRepo::count(&conn).unwrap(), 3);
    }

    #[test]
    fn actor_and_subject_round_trip() {
        let conn = setup();
        let actor = ActorId::from("user-1");
        let case = CaseId::from("case_1");
        append(&conn, 1, CreditCategory::Allocate, true);
        let spent = LedgerRepo::append(
            &conn,
            &NewEntry {
                quantity: -1,
                category: CreditCategory::RusUse,
                committed: true,
                actor: Some(&actor),
                subject: Some(&case),
            },
        )
        .unwrap();
        assert_eq!(spent.actor.as_ref(), Some(&actor));

        let about_case = LedgerRepo::list_by_subject(&conn, &case).unwrap();
        assert_eq!(about_case, vec![spent]);
    }

    #[test]
    fn subject_totals_split_spend_and_refund() {
        let conn = setup();
        let case = CaseId::from("case_1");
        let about = |quantity: i64, category: CreditCategory, committed: bool| {
            LedgerRepo::append(
                &conn,
                &NewEntry {
                    quantity,
                    category,
                    committed,
                    actor: None,
                    subject: Some(&case),
                },
            )
            .unwrap()
        };
        append(&conn, 5, CreditCategory::Allocate, true);
        assert_eq!(LedgerRepo::subject_totals(&conn, &case).unwrap(), SubjectTotals::default());
        assert!(LedgerRepo::latest_for_subject(&conn, &case, CreditCategory::Revoke).unwrap().is_none());

        about(-2, CreditCategory::RusUse, true);
        about(-9, CreditCategory::RusUse, false);
        let refund = about(1, CreditCategory::Revoke, true);

        assert_eq!(
            LedgerRepo::subject_totals(&conn, &case).unwrap(),
            SubjectTotals { spent: 2, refunded: 1 }
        );
        assert_eq!(
            LedgerRepo::latest_for_subject(&conn, &case, CreditCategory::Revoke).unwrap(),
            Some(refund)
        );
    }

    #[test]
    fn history_running_balance() {
        let conn = setup();
        append(&conn, 5, CreditCategory::Allocate, true);
        append(&conn, 7, CreditCategory::Allocate, false);
        append(&conn, -1, CreditCategory::RusUse, true);
        append(&conn, 1, CreditCategory::Revoke, true);

        let page = LedgerRepo::history(&conn, &HistoryFilter::default()).unwrap();
        assert_eq!(page.total, 4);
        let balances: Vec<i64> = page.entries.iter().map(|e| e.balance_after).collect();
        assert_eq!(balances, vec![5, 5, 4, 5]);
    }

    #[test]
    fn history_filters_and_pages() {
        let conn = setup();
        for _ in 0..5 {
            append(&conn, 2, CreditCategory::Allocate, true);
        }
        append(&conn, -1, CreditCategory::RusUse, true);

        let page = LedgerRepo::history(
            &conn,
            &HistoryFilter {
                category: Some(CreditCategory::Allocate),
                limit: Some(2),
                offset: 1,
                order: SortOrder::Descending,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.entries.len(), 2);
        assert!(page.entries[0].entry.seq > page.entries[1].entry.seq);
        // Running balance is computed over the whole log, not the filtered view.
        assert_eq!(page.entries[0].balance_after, 8);

        let uncommitted = LedgerRepo::history(
            &conn,
            &HistoryFilter {
                committed: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(uncommitted.total, 0);
    }

    #[test]
    fn history_time_window() {
        let conn = setup();
        append(&conn, 1, CreditCategory::Allocate, true);
        let future = Utc::now() + chrono::Duration::hours(1);
        let page = LedgerRepo::history(
            &conn,
            &HistoryFilter {
                since: Some(future),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(page.entries.is_empty());

        let page = LedgerRepo::history(
            &conn,
            &HistoryFilter {
                until: Some(future),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(page.entries.len(), 1);
    }
}
