//! Rewrites `>>N` post references after post ids were renumbered.
//!
//! Pre-versioning post ids were only unique per board. The rebuild assigns
//! new global ids and records `(board_id, old_id, new_id)` in
//! `post_id_map`. Every reference in a board's raw message text is then
//! pointed at the new id, or replaced by a placeholder when the old post no
//! longer exists.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::db::Session;
use crate::error::{MigrationError, Result};

/// Text substituted for a reference to a post that was not migrated.
pub const UNKNOWN_POST_PLACEHOLDER: &str = "(unknown post id during migration)";

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">>([0-9]+)").expect("reference marker pattern is valid"));

/// Old post id to new post id, for one board.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JumpTable {
    ids: BTreeMap<i64, i64>,
    new_ids: BTreeSet<i64>,
}

impl JumpTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, old_id: i64, new_id: i64) {
        self.ids.insert(old_id, new_id);
        self.new_ids.insert(new_id);
    }

    #[must_use]
    pub fn get(&self, old_id: i64) -> Option<i64> {
        self.ids.get(&old_id).copied()
    }

    /// Whether `id` is already a post id of the rebuilt schema.
    #[must_use]
    pub fn is_new_id(&self, id: i64) -> bool {
        self.new_ids.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<(i64, i64)> for JumpTable {
    fn from_iter<I: IntoIterator<Item = (i64, i64)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (old_id, new_id) in iter {
            table.insert(old_id, new_id);
        }
        table
    }
}

/// Rewrite every standalone `>>N` marker in `text`.
///
/// A marker is standalone when it starts the text or follows whitespace,
/// and ends the text or is followed by whitespace. Only the digits change:
/// known old ids become their new id, ids that are already new are left
/// alone, anything else becomes [`UNKNOWN_POST_PLACEHOLDER`].
#[must_use]
pub fn rewrite_references(text: &str, table: &JumpTable) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in MARKER.captures_iter(text) {
        let (Some(marker), Some(digits)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let before_ok = text[..marker.start()]
            .chars()
            .next_back()
            .is_none_or(char::is_whitespace);
        let after_ok = text[marker.end()..]
            .chars()
            .next()
            .is_none_or(char::is_whitespace);
        if !(before_ok && after_ok) {
            continue;
        }

        let replacement = match digits.as_str().parse::<i64>() {
            Ok(id) if table.is_new_id(id) && table.get(id).is_none() => continue,
            Ok(id) => table.get(id).map(|new_id| new_id.to_string()),
            Err(_) => None,
        };
        out.push_str(&text[last..digits.start()]);
        match replacement {
            Some(new_id) => out.push_str(&new_id),
            None => out.push_str(UNKNOWN_POST_PLACEHOLDER),
        }
        last = digits.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Outcome of rewriting every board.
#[derive(Debug, Default)]
pub struct RewriteReport {
    pub boards: usize,
    pub posts_rewritten: usize,
    /// Boards whose rewrite failed; the run continued past them.
    pub failures: Vec<MigrationError>,
}

/// Load the jump table for `board_id` from `post_id_map`.
///
/// # Errors
///
/// Query or decode failures.
pub fn load_jump_table(session: &Session<'_>, board_id: i64) -> Result<JumpTable> {
    let mut table = JumpTable::new();
    session.query_each(
        "SELECT old_id, new_id FROM DBPREFIXpost_id_map WHERE board_id = ?",
        &[board_id.into()],
        |row| {
            table.insert(row.get_i64(0)?, row.get_i64(1)?);
            Ok(())
        },
    )?;
    Ok(table)
}

/// Rewrite the raw message text of every post on `board_id` in one
/// transaction. Returns the number of posts changed.
///
/// # Errors
///
/// Query, decode or update failures. The board's updates are rolled back.
pub fn rewrite_board(session: &Session<'_>, board_id: i64) -> Result<usize> {
    let table = load_jump_table(session, board_id)?;
    let mut changed = Vec::new();
    session.query_each(
        "SELECT posts.id, posts.message_raw FROM DBPREFIXposts AS posts \
         JOIN DBPREFIXthreads AS threads ON posts.thread_id = threads.id \
         WHERE posts.message_raw LIKE '%>>%' AND threads.board_id = ?",
        &[board_id.into()],
        |row| {
            let id = row.get_i64(0)?;
            let text = row.get_opt_string(1)?.unwrap_or_default();
            let rewritten = rewrite_references(&text, &table);
            if rewritten != text {
                changed.push((id, rewritten));
            }
            Ok(())
        },
    )?;
    if changed.is_empty() {
        return Ok(0);
    }
    session.transaction(|s| {
        for (id, text) in &changed {
            s.exec(
                "UPDATE DBPREFIXposts SET message_raw = ? WHERE id = ?",
                &[text.as_str().into(), (*id).into()],
            )?;
        }
        Ok(())
    })?;
    debug!(board_id, posts = changed.len(), "rewrote post references");
    Ok(changed.len())
}

/// Rewrite references on every board.
///
/// A board that fails is logged and recorded in the report; the remaining
/// boards are still processed. Re-running retries it.
///
/// # Errors
///
/// Listing the boards failed, or the run timed out.
pub fn rewrite_all(session: &Session<'_>) -> Result<RewriteReport> {
    let boards = session
        .query_all("SELECT id FROM DBPREFIXboards ORDER BY id", &[])?
        .iter()
        .map(|row| row.get_i64(0))
        .collect::<Result<Vec<_>>>()?;

    let mut report = RewriteReport::default();
    for board_id in boards {
        report.boards += 1;
        match rewrite_board(session, board_id) {
            Ok(n) => report.posts_rewritten += n,
            Err(e) if e.is_timeout() => return Err(e),
            Err(source) => {
                let err = MigrationError::RewriteFailure {
                    board_id,
                    source: Box::new(source),
                };
                warn!(board_id, error = %err, "cross-reference rewrite failed, continuing");
                report.failures.push(err);
            }
        }
    }
    info!(
        boards = report.boards,
        posts = report.posts_rewritten,
        failed = report.failures.len(),
        "rewrote post references"
    );
    Ok(report)
}
