//! Folds the legacy ban and wordfilter tables into unified filter rules.
//!
//! Each legacy row becomes exactly one `filters` row, one
//! `filter_conditions` row and one `filter_boards` row per board it is
//! scoped to (none for "all boards"). Every legacy table is copied in its own
//! transaction; a failure rolls back that table only.

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::db::{Row, Session};
use crate::error::{MigrationError, Result};

// ---------------------------------------------------------------------------
// Unified rule model
// ---------------------------------------------------------------------------

/// How a condition's search text is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Substring,
    Regex,
    Exact,
}

impl MatchMode {
    /// Value stored in `filter_conditions.match_mode`.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Substring => 0,
            Self::Regex => 1,
            Self::Exact => 2,
        }
    }
}

/// What a matching filter does to the post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchAction {
    Reject,
    Ban,
    Replace,
    Log,
}

impl MatchAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Ban => "ban",
            Self::Replace => "replace",
            Self::Log => "log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub staff_id: Option<i64>,
    pub staff_note: String,
    pub issued_at: NaiveDateTime,
    pub action: MatchAction,
    pub detail: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCondition {
    pub mode: MatchMode,
    pub search: String,
    pub field: String,
}

/// A filter with its conditions, ready to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedRule {
    pub filter: Filter,
    pub conditions: Vec<FilterCondition>,
}

// ---------------------------------------------------------------------------
// Legacy records
// ---------------------------------------------------------------------------

/// Board scoping as stored by the legacy tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardScope {
    /// `board_id` column; `None` means every board.
    Board(Option<i64>),
    /// Comma-separated directory list of older wordfilters.
    Dirs(Option<String>),
}

/// Columns shared by every legacy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHeader {
    pub scope: BoardScope,
    pub staff_id: Option<i64>,
    pub staff_note: String,
    pub issued_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyRecord {
    FileBan {
        header: LegacyHeader,
        checksum: String,
        fingerprinter: Option<String>,
        ban_ip: bool,
        ban_message: Option<String>,
    },
    FilenameBan {
        header: LegacyHeader,
        filename: String,
        is_regex: bool,
    },
    UsernameBan {
        header: LegacyHeader,
        username: String,
        is_regex: bool,
    },
    Wordfilter {
        header: LegacyHeader,
        search: String,
        is_regex: bool,
        replacement: String,
    },
}

impl LegacyRecord {
    #[must_use]
    pub const fn header(&self) -> &LegacyHeader {
        match self {
            Self::FileBan { header, .. }
            | Self::FilenameBan { header, .. }
            | Self::UsernameBan { header, .. }
            | Self::Wordfilter { header, .. } => header,
        }
    }

    /// The unified rule equivalent to this record. Board scope is resolved
    /// separately.
    #[must_use]
    pub fn to_rule(&self) -> UnifiedRule {
        let header = self.header();
        let (action, detail, cond) = match self {
            Self::FileBan {
                checksum,
                fingerprinter,
                ban_ip,
                ban_message,
                ..
            } => {
                let field = fingerprinter
                    .as_deref()
                    .filter(|f| !f.is_empty())
                    .unwrap_or("checksum");
                let (action, detail) = if *ban_ip {
                    (MatchAction::Ban, ban_message.clone().unwrap_or_default())
                } else {
                    (MatchAction::Reject, String::new())
                };
                (action, detail, condition(MatchMode::Exact, checksum, field))
            }
            Self::FilenameBan {
                filename, is_regex, ..
            } => (
                MatchAction::Reject,
                "File rejected".to_string(),
                condition(exact_or_regex(*is_regex), filename, "filename"),
            ),
            Self::UsernameBan {
                username, is_regex, ..
            } => (
                MatchAction::Reject,
                "Name rejected".to_string(),
                condition(exact_or_regex(*is_regex), username, "name"),
            ),
            Self::Wordfilter {
                search,
                is_regex,
                replacement,
                ..
            } => {
                let mode = if *is_regex {
                    MatchMode::Regex
                } else {
                    MatchMode::Substring
                };
                (MatchAction::Replace, replacement.clone(), condition(mode, search, "body"))
            }
        };
        UnifiedRule {
            filter: Filter {
                staff_id: header.staff_id,
                staff_note: header.staff_note.clone(),
                issued_at: header.issued_at,
                action,
                detail,
                is_active: true,
            },
            conditions: vec![cond],
        }
    }
}

const fn exact_or_regex(is_regex: bool) -> MatchMode {
    if is_regex { MatchMode::Regex } else { MatchMode::Exact }
}

fn condition(mode: MatchMode, search: &str, field: &str) -> FilterCondition {
    FilterCondition {
        mode,
        search: search.to_string(),
        field: field.to_string(),
    }
}

/// Directory names in a legacy board list. Blank entries and `*` (all
/// boards) are dropped.
#[must_use]
pub fn board_dirs(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|dir| !dir.is_empty() && *dir != "*")
        .collect()
}

// ---------------------------------------------------------------------------
// Board lookup
// ---------------------------------------------------------------------------

/// Resolves a board directory to its id.
pub trait BoardResolver {
    /// `Ok(None)` when no board has that directory.
    ///
    /// # Errors
    ///
    /// Lookup failures other than "not found".
    fn board_id(&self, session: &Session<'_>, dir: &str) -> Result<Option<i64>>;
}

/// Looks boards up in the `boards` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlBoardResolver;

impl BoardResolver for SqlBoardResolver {
    fn board_id(&self, session: &Session<'_>, dir: &str) -> Result<Option<i64>> {
        session
            .query_opt("SELECT id FROM DBPREFIXboards WHERE dir = ?", &[dir.into()])?
            .map(|row| row.get_i64(0))
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Transformer
// ---------------------------------------------------------------------------

/// The four legacy rule tables, in transform order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyTable {
    FileBan,
    FilenameBan,
    UsernameBan,
    Wordfilters,
}

impl LegacyTable {
    pub const ALL: [Self; 4] = [
        Self::FileBan,
        Self::FilenameBan,
        Self::UsernameBan,
        Self::Wordfilters,
    ];

    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::FileBan => "DBPREFIXfile_ban",
            Self::FilenameBan => "DBPREFIXfilename_ban",
            Self::UsernameBan => "DBPREFIXusername_ban",
            Self::Wordfilters => "DBPREFIXwordfilters",
        }
    }
}

/// Rows migrated per legacy table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub tables: Vec<(LegacyTable, usize)>,
    /// Wordfilter directories that no longer name a board.
    pub unresolved_dirs: Vec<String>,
}

impl TransformReport {
    #[must_use]
    pub fn filters(&self) -> usize {
        self.tables.iter().map(|(_, n)| n).sum()
    }
}

pub struct LegacyRuleTransformer<'a> {
    session: &'a Session<'a>,
    resolver: &'a dyn BoardResolver,
    drop_legacy_tables: bool,
}

impl<'a> LegacyRuleTransformer<'a> {
    #[must_use]
    pub fn new(session: &'a Session<'a>, resolver: &'a dyn BoardResolver) -> Self {
        Self {
            session,
            resolver,
            drop_legacy_tables: true,
        }
    }

    /// Drop each legacy table in the same batch that copied it.
    #[must_use]
    pub const fn drop_legacy_tables(mut self, drop: bool) -> Self {
        self.drop_legacy_tables = drop;
        self
    }

    /// Transform every legacy table that still exists.
    ///
    /// # Errors
    ///
    /// [`MigrationError::TransformFailure`] naming the table whose batch was
    /// rolled back. Tables before it stay migrated.
    pub fn run(&self) -> Result<TransformReport> {
        let mut report = TransformReport::default();
        for table in LegacyTable::ALL {
            let present = self
                .session
                .probe()
                .table_exists(table.table())
                .map_err(|e| transform_error(self.session, table, e))?;
            if !present {
                debug!(table = table.table(), "legacy table absent, skipping");
                continue;
            }
            let rows = self
                .session
                .transaction(|s| self.transform_table(s, table, &mut report.unresolved_dirs))
                .map_err(|e| transform_error(self.session, table, e))?;
            info!(table = %self.session.table(table.table()), rows, "migrated legacy rules");
            report.tables.push((table, rows));
        }
        Ok(report)
    }

    fn transform_table(
        &self,
        session: &Session<'_>,
        table: LegacyTable,
        unresolved: &mut Vec<String>,
    ) -> Result<usize> {
        let (query, scope_by_id) = self.select_query(table)?;
        let mut rows = 0;
        session.query_each(&query, &[], |row| {
            let record = decode_record(table, &row, scope_by_id)?;
            let boards = self.resolve_boards(session, &record.header().scope, unresolved)?;
            insert_rule(session, &record.to_rule(), &boards)?;
            rows += 1;
            Ok(())
        })?;
        if self.drop_legacy_tables {
            session.exec(&format!("DROP TABLE {}", table.table()), &[])?;
        }
        Ok(rows)
    }

    /// Query for `table`, substituting constants for columns an older
    /// revision of the table lacks. The flag is false when board scope is a
    /// directory list.
    fn select_query(&self, table: LegacyTable) -> Result<(String, bool)> {
        let probe = self.session.probe();
        let query = match table {
            LegacyTable::FileBan => {
                let t = table.table();
                let fingerprinter = if probe.column_exists(t, "fingerprinter")? {
                    "fingerprinter"
                } else {
                    "'checksum' AS fingerprinter"
                };
                let ban_ip = if probe.column_exists(t, "ban_ip")? {
                    "ban_ip"
                } else {
                    "FALSE AS ban_ip"
                };
                let message = if probe.column_exists(t, "ban_ip_message")? {
                    "ban_ip_message"
                } else {
                    "NULL AS ban_ip_message"
                };
                format!(
                    "SELECT board_id, staff_id, staff_note, issued_at, checksum, \
                     {fingerprinter}, {ban_ip}, {message} FROM {t}"
                )
            }
            LegacyTable::FilenameBan => "SELECT board_id, staff_id, staff_note, issued_at, filename, is_regex \
                 FROM DBPREFIXfilename_ban"
                .to_string(),
            LegacyTable::UsernameBan => "SELECT board_id, staff_id, staff_note, issued_at, username, is_regex \
                 FROM DBPREFIXusername_ban"
                .to_string(),
            LegacyTable::Wordfilters => {
                // Newer revisions replaced board_dirs with board_id; when both
                // are present the id column wins.
                let scope = if probe.column_exists(table.table(), "board_id")? {
                    "board_id"
                } else {
                    "board_dirs"
                };
                return Ok((
                    format!(
                        "SELECT {scope}, staff_id, staff_note, issued_at, search, is_regex, change_to \
                         FROM DBPREFIXwordfilters"
                    ),
                    scope == "board_id",
                ));
            }
        };
        Ok((query, true))
    }

    fn resolve_boards(
        &self,
        session: &Session<'_>,
        scope: &BoardScope,
        unresolved: &mut Vec<String>,
    ) -> Result<Vec<i64>> {
        match scope {
            BoardScope::Board(id) => Ok(id.iter().copied().collect()),
            BoardScope::Dirs(None) => Ok(Vec::new()),
            BoardScope::Dirs(Some(list)) => {
                let mut ids = Vec::new();
                for dir in board_dirs(list) {
                    match self.resolver.board_id(session, dir)? {
                        Some(id) => ids.push(id),
                        None => {
                            warn!(dir, "wordfilter names a board that no longer exists, skipping it");
                            unresolved.push(dir.to_string());
                        }
                    }
                }
                Ok(ids)
            }
        }
    }
}

fn transform_error(session: &Session<'_>, table: LegacyTable, source: MigrationError) -> MigrationError {
    if source.is_timeout() {
        return source;
    }
    MigrationError::TransformFailure {
        table: session.table(table.table()),
        source: Box::new(source),
    }
}

fn decode_record(table: LegacyTable, row: &Row, scope_by_id: bool) -> Result<LegacyRecord> {
    let scope = if scope_by_id {
        BoardScope::Board(row.get_opt_i64(0)?)
    } else {
        BoardScope::Dirs(row.get_opt_string(0)?)
    };
    let header = LegacyHeader {
        scope,
        staff_id: row.get_opt_i64(1)?,
        staff_note: row.get_opt_string(2)?.unwrap_or_default(),
        issued_at: row.get_timestamp(3)?,
    };
    Ok(match table {
        LegacyTable::FileBan => LegacyRecord::FileBan {
            header,
            checksum: row.get_string(4)?,
            fingerprinter: row.get_opt_string(5)?,
            ban_ip: row.get_bool(6)?,
            ban_message: row.get_opt_string(7)?,
        },
        LegacyTable::FilenameBan => LegacyRecord::FilenameBan {
            header,
            filename: row.get_string(4)?,
            is_regex: row.get_bool(5)?,
        },
        LegacyTable::UsernameBan => LegacyRecord::UsernameBan {
            header,
            username: row.get_string(4)?,
            is_regex: row.get_bool(5)?,
        },
        LegacyTable::Wordfilters => LegacyRecord::Wordfilter {
            header,
            search: row.get_string(4)?,
            is_regex: row.get_bool(5)?,
            replacement: row.get_opt_string(6)?.unwrap_or_default(),
        },
    })
}

/// Insert one rule and return its filter id.
///
/// The id is read back with `MAX(id)` inside the caller's transaction,
/// which works the same on every dialect.
fn insert_rule(session: &Session<'_>, rule: &UnifiedRule, boards: &[i64]) -> Result<i64> {
    let filter = &rule.filter;
    session.exec(
        "INSERT INTO DBPREFIXfilters(staff_id, staff_note, issued_at, match_action, match_detail, is_active) \
         VALUES(?,?,?,?,?,?)",
        &[
            filter.staff_id.into(),
            filter.staff_note.as_str().into(),
            filter.issued_at.into(),
            filter.action.as_str().into(),
            filter.detail.as_str().into(),
            filter.is_active.into(),
        ],
    )?;
    let filter_id = session.query_i64("SELECT MAX(id) FROM DBPREFIXfilters", &[])?;
    for condition in &rule.conditions {
        session.exec(
            "INSERT INTO DBPREFIXfilter_conditions(filter_id, match_mode, search, field) VALUES(?,?,?,?)",
            &[
                filter_id.into(),
                condition.mode.code().into(),
                condition.search.as_str().into(),
                condition.field.as_str().into(),
            ],
        )?;
    }
    for board in boards {
        session.exec(
            "INSERT INTO DBPREFIXfilter_boards(filter_id, board_id) VALUES(?,?)",
            &[filter_id.into(), (*board).into()],
        )?;
    }
    Ok(filter_id)
}
