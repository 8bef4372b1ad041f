//! Row store -- the tabular medium holding URLs, statuses and results.
//!
//! A row has 18 fields in a fixed column order (see [`Column`]). The queue
//! only ever touches the row store through the [`RowStore`] trait, and every
//! multi-cell update goes out as a single statement or transaction so a
//! reader never observes half a row.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::storage::Pool;

/// Identity of a row in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub u32);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Processing status of a row. The string tokens are read by people and
/// downstream tooling, so they must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowStatus {
    Queued,
    Processing,
    Complete,
    Error,
    Stopped,
    ScriptError,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Queued => "Queued",
            RowStatus::Processing => "Processing...",
            RowStatus::Complete => "Complete",
            RowStatus::Error => "Error",
            RowStatus::Stopped => "Stopped",
            RowStatus::ScriptError => "Script Error",
        }
    }

    /// Statuses that mean a run still owns the row.
    pub fn is_pending(&self) -> bool {
        matches!(self, RowStatus::Queued | RowStatus::Processing)
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Queued" => Ok(RowStatus::Queued),
            "Processing..." => Ok(RowStatus::Processing),
            "Complete" => Ok(RowStatus::Complete),
            "Error" => Ok(RowStatus::Error),
            "Stopped" => Ok(RowStatus::Stopped),
            "Script Error" => Ok(RowStatus::ScriptError),
            other => anyhow::bail!("unknown row status '{}'", other),
        }
    }
}

/// Stable column layout, 1-indexed like the sheet it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Column {
    Url = 1,
    Status,
    LastChecked,
    MobilePerf,
    MobileFcp,
    MobileSi,
    MobileLcp,
    MobileTbt,
    MobileCls,
    DesktopPerf,
    DesktopFcp,
    DesktopSi,
    DesktopLcp,
    DesktopTbt,
    DesktopCls,
    MobileIssues,
    DesktopIssues,
    ReportLink,
}

impl Column {
    pub const COUNT: usize = 18;

    pub const ALL: [Column; Column::COUNT] = [
        Column::Url,
        Column::Status,
        Column::LastChecked,
        Column::MobilePerf,
        Column::MobileFcp,
        Column::MobileSi,
        Column::MobileLcp,
        Column::MobileTbt,
        Column::MobileCls,
        Column::DesktopPerf,
        Column::DesktopFcp,
        Column::DesktopSi,
        Column::DesktopLcp,
        Column::DesktopTbt,
        Column::DesktopCls,
        Column::MobileIssues,
        Column::DesktopIssues,
        Column::ReportLink,
    ];

    /// 1-based position.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Header label shown by the CLI.
    pub fn header(self) -> &'static str {
        match self {
            Column::Url => "URL",
            Column::Status => "Status",
            Column::LastChecked => "Last Checked",
            Column::MobilePerf => "Mobile Perf",
            Column::MobileFcp => "Mobile FCP",
            Column::MobileSi => "Mobile SI",
            Column::MobileLcp => "Mobile LCP",
            Column::MobileTbt => "Mobile TBT",
            Column::MobileCls => "Mobile CLS",
            Column::DesktopPerf => "Desktop Perf",
            Column::DesktopFcp => "Desktop FCP",
            Column::DesktopSi => "Desktop SI",
            Column::DesktopLcp => "Desktop LCP",
            Column::DesktopTbt => "Desktop TBT",
            Column::DesktopCls => "Desktop CLS",
            Column::MobileIssues => "Mobile Top Issues",
            Column::DesktopIssues => "Desktop Top Issues",
            Column::ReportLink => "Full Report Link",
        }
    }

    fn sql_name(self) -> &'static str {
        match self {
            Column::Url => "url",
            Column::Status => "status",
            Column::LastChecked => "last_checked",
            Column::MobilePerf => "mobile_perf",
            Column::MobileFcp => "mobile_fcp",
            Column::MobileSi => "mobile_si",
            Column::MobileLcp => "mobile_lcp",
            Column::MobileTbt => "mobile_tbt",
            Column::MobileCls => "mobile_cls",
            Column::DesktopPerf => "desktop_perf",
            Column::DesktopFcp => "desktop_fcp",
            Column::DesktopSi => "desktop_si",
            Column::DesktopLcp => "desktop_lcp",
            Column::DesktopTbt => "desktop_tbt",
            Column::DesktopCls => "desktop_cls",
            Column::MobileIssues => "mobile_issues",
            Column::DesktopIssues => "desktop_issues",
            Column::ReportLink => "report_link",
        }
    }
}

/// One row of the store, all 18 fields as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: RowId,
    pub url: String,
    /// Raw status cell; may be empty or hold text the queue does not own.
    pub status: String,
    pub last_checked: String,
    pub mobile: [String; 6],
    pub desktop: [String; 6],
    pub mobile_issues: String,
    pub desktop_issues: String,
    pub report_link: String,
}

impl RowRecord {
    pub fn status(&self) -> Option<RowStatus> {
        self.status.parse().ok()
    }

    pub fn is_complete(&self) -> bool {
        self.status() == Some(RowStatus::Complete)
    }

    /// A URL the checker accepts: non-empty and http(s).
    pub fn has_checkable_url(&self) -> bool {
        is_checkable_url(&self.url)
    }

    /// Field values in column order.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(Column::COUNT);
        out.push(self.url.as_str());
        out.push(self.status.as_str());
        out.push(self.last_checked.as_str());
        out.extend(self.mobile.iter().map(String::as_str));
        out.extend(self.desktop.iter().map(String::as_str));
        out.push(self.mobile_issues.as_str());
        out.push(self.desktop_issues.as_str());
        out.push(self.report_link.as_str());
        out
    }
}

/// Scheme check applied when building the queue.
pub fn is_checkable_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Access to the tabular medium.
pub trait RowStore: Send + Sync {
    /// Number of data rows (no header row is counted).
    fn row_count(&self) -> Result<usize>;

    /// All rows in store order.
    fn rows(&self) -> Result<Vec<RowRecord>>;

    /// A single row, `None` if it no longer exists.
    fn get(&self, id: RowId) -> Result<Option<RowRecord>>;

    fn set_status(&self, id: RowId, status: RowStatus) -> Result<()>;

    /// Set many statuses in one write.
    fn set_statuses(&self, updates: &[(RowId, RowStatus)]) -> Result<()>;

    /// Write `values` into consecutive columns starting at `start`, as one
    /// write.
    fn set_range(&self, id: RowId, start: Column, values: &[String]) -> Result<()>;

    /// Make prior writes visible to other readers.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn add_url(&self, url: &str) -> Result<RowId>;

    /// Blank Status through ReportLink on every row, keeping the URLs.
    fn clear_results(&self) -> Result<usize>;
}

/// [`RowStore`] backed by the `rows` table.
#[derive(Clone)]
pub struct SqliteRowStore {
    pool: Pool,
}

const SELECT_ROW: &str = "SELECT id, url, status, last_checked,
        mobile_perf, mobile_fcp, mobile_si, mobile_lcp, mobile_tbt, mobile_cls,
        desktop_perf, desktop_fcp, desktop_si, desktop_lcp, desktop_tbt, desktop_cls,
        mobile_issues, desktop_issues, report_link
     FROM rows";

impl SqliteRowStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowRecord> {
        let text = |i: usize| row.get::<_, String>(i);
        Ok(RowRecord {
            id: RowId(row.get(0)?),
            url: text(1)?,
            status: text(2)?,
            last_checked: text(3)?,
            mobile: [text(4)?, text(5)?, text(6)?, text(7)?, text(8)?, text(9)?],
            desktop: [text(10)?, text(11)?, text(12)?, text(13)?, text(14)?, text(15)?],
            mobile_issues: text(16)?,
            desktop_issues: text(17)?,
            report_link: text(18)?,
        })
    }
}

impl RowStore for SqliteRowStore {
    fn row_count(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM rows", [], |row| row.get(0))
            .context("Failed to count rows")?;
        Ok(count as usize)
    }

    fn rows(&self) -> Result<Vec<RowRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{SELECT_ROW} ORDER BY id"))?;
        let rows = stmt
            .query_map([], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read rows")?;
        Ok(rows)
    }

    fn get(&self, id: RowId) -> Result<Option<RowRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{SELECT_ROW} WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id.0], Self::map_row)?;
        rows.next()
            .transpose()
            .with_context(|| format!("Failed to read row {}", id))
    }

    fn set_status(&self, id: RowId, status: RowStatus) -> Result<()> {
        self.set_range(id, Column::Status, &[status.as_str().to_string()])
    }

    fn set_statuses(&self, updates: &[(RowId, RowStatus)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE rows SET status = ?1 WHERE id = ?2")?;
            for (id, status) in updates {
                stmt.execute(params![status.as_str(), id.0])?;
            }
        }
        tx.commit().context("Failed to write status batch")?;
        Ok(())
    }

    fn set_range(&self, id: RowId, start: Column, values: &[String]) -> Result<()> {
        let first = start.index();
        let last = first + values.len();
        if values.is_empty() || last - 1 > Column::COUNT {
            anyhow::bail!(
                "range of {} values starting at column {} exceeds the {} row columns",
                values.len(),
                first,
                Column::COUNT
            );
        }

        let assignments = Column::ALL[first - 1..last - 1]
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} = ?{}", col.sql_name(), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE rows SET {} WHERE id = ?{}",
            assignments,
            values.len() + 1
        );

        let mut bind: Vec<&dyn rusqlite::ToSql> =
            values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        bind.push(&id.0);

        let conn = self.pool.get()?;
        let changed = conn
            .execute(&sql, bind.as_slice())
            .with_context(|| format!("Failed to write row {}", id))?;
        if changed == 0 {
            anyhow::bail!("row {} does not exist", id);
        }
        Ok(())
    }

    fn add_url(&self, url: &str) -> Result<RowId> {
        let conn = self.pool.get()?;
        conn.execute("INSERT INTO rows (url) VALUES (?1)", params![url])
            .context("Failed to insert row")?;
        let id = conn.last_insert_rowid();
        let id = u32::try_from(id).with_context(|| format!("row id {} out of range", id))?;
        Ok(RowId(id))
    }

    fn clear_results(&self) -> Result<usize> {
        let assignments = Column::ALL[Column::Status.index() - 1..]
            .iter()
            .map(|col| format!("{} = ''", col.sql_name()))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.pool.get()?;
        let changed = conn
            .execute(&format!("UPDATE rows SET {}", assignments), [])
            .context("Failed to clear results")?;
        Ok(changed)
    }
}
