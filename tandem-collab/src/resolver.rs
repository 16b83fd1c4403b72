//! Turning a conflict into the text that settles it.
//!
//! The contested region is the union of both operations' ranges. On the
//! replica that detected the conflict the local operation is already in
//! the document and the remote one is not, so the region is located by
//! mapping the union through the local operation and everything logged
//! after it. A later operation that touches the region widens it to cover
//! that edit too, and settling the conflict overwrites the whole widened
//! region.

use tandem_core::{replay, ChangeOperation, Edit, Position, TextDocument, TextRange};

use crate::conflict::{Conflict, Resolution};
use crate::error::CollabError;
use crate::oplog::OperationLog;
use crate::room::ConflictPolicy;

/// Where the contested region sits now and what it held before either
/// operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPlan {
    /// Region in the current document, widened over later edits.
    pub region: TextRange,
    /// Text of `region` right now (local operation applied).
    pub current_text: String,
    /// Text of the union before either operation.
    pub pre_text: String,
    /// Start of the union in pre-conflict coordinates.
    pub origin: Position,
}

/// Locate the region for `conflict` in `document`, which is `base` with
/// `log` applied.
///
/// Fails with `StaleOperation` only when the local operation has left the
/// log.
pub fn plan(
    base: &str,
    document: &TextDocument,
    log: &OperationLog,
    conflict: &Conflict,
) -> Result<ResolutionPlan, CollabError> {
    let local = &conflict.local;
    let idx = log
        .position(local.id())
        .ok_or_else(|| CollabError::stale(local.id(), "local operation is not in the log"))?;

    let union = local.range().union(&conflict.remote.range());
    // The start never moves: the local op begins at or after it.
    let applied = TextRange::new(union.start, local.edit().map_position(union.end));

    // Undo the local op on the region as it stood right after it, before
    // any later edit.
    let pre_text = if log.after_index(idx).is_empty() {
        document.slice(applied)?
    } else {
        replay(base, log.through_index(idx))?.slice(applied)?
    };
    let mut scratch = TextDocument::from_text(&pre_text);
    scratch.apply_edit(&Edit::new(
        local.post_range().relative_to(union.start),
        local.replaced(),
    ))?;

    let region = widen_through(applied, log.after_index(idx));
    Ok(ResolutionPlan {
        region,
        current_text: document.slice(region)?,
        pre_text: scratch.text(),
        origin: union.start,
    })
}

/// Carry `region` past `later` operations. One that touches the region
/// pulls it out to cover its own range.
pub fn widen_through<'a, I>(mut region: TextRange, later: I) -> TextRange
where
    I: IntoIterator<Item = &'a ChangeOperation>,
{
    for op in later {
        let edit = op.edit();
        region = if op.range().overlaps(&region) {
            TextRange::new(
                region.start.min(op.range().start),
                edit.map_position(region.end.max(op.range().end)),
            )
        } else {
            edit.map_range(region)
        };
    }
    region
}

/// `pre_text` with `op` applied, `op`'s range taken relative to `origin`.
pub fn apply_relative(
    pre_text: &str,
    origin: Position,
    op: &ChangeOperation,
) -> Result<String, CollabError> {
    let mut scratch = TextDocument::from_text(pre_text);
    scratch.apply_edit(&Edit::new(op.range().relative_to(origin), op.text()))?;
    Ok(scratch.text())
}

/// Text the region should hold once `conflict` is settled by `resolution`.
pub fn resolution_text(
    plan: &ResolutionPlan,
    conflict: &Conflict,
    resolution: Resolution,
    merged_content: Option<&str>,
) -> Result<String, CollabError> {
    match resolution {
        Resolution::Local => apply_relative(&plan.pre_text, plan.origin, &conflict.local),
        Resolution::Remote => apply_relative(&plan.pre_text, plan.origin, &conflict.remote),
        Resolution::Merge => merged_content
            .map(str::to_owned)
            .ok_or(CollabError::MergeContentRequired),
    }
}

/// Resolution a room policy picks for `conflict`, if it picks one.
///
/// Both sides of a conflict see the same pair with local and remote
/// swapped, and every policy here names the same winning operation from
/// either side.
pub fn auto_resolution(policy: ConflictPolicy, conflict: &Conflict) -> Option<Resolution> {
    let local = &conflict.local;
    let remote = &conflict.remote;
    let local_wins = match policy {
        ConflictPolicy::Manual => return None,
        ConflictPolicy::LatestWins => local.precedence() > remote.precedence(),
        ConflictPolicy::EarliestPositionWins => {
            (local.range().start, local.precedence()) < (remote.range().start, remote.precedence())
        }
    };
    Some(if local_wins {
        Resolution::Local
    } else {
        Resolution::Remote
    })
}
