//! Child-row changes recorded while a bulk load is in flight.
//!
//! A load rebuilds the conversation from server rows fetched at some point
//! during the load. Attachment and reaction changes applied locally in the
//! meantime (from the change feed, optimistic writes, or hydration) are
//! recorded here and replayed in order on top of the rebuilt state, so the
//! last add or remove wins regardless of when the server rows were read.

use crate::model::{Attachment, AttachmentId, Reaction, ReactionKey};
use crate::reconciler::Reconciler;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChildChange {
    AttachmentUpsert(Attachment),
    AttachmentDelete(AttachmentId),
    ReactionUpsert(Reaction),
    ReactionDelete(ReactionKey),
}

impl ChildChange {
    pub fn apply(self, rec: &mut Reconciler) {
        match self {
            ChildChange::AttachmentUpsert(a) => {
                rec.upsert_attachment(a);
            }
            ChildChange::AttachmentDelete(id) => {
                rec.remove_attachment(&id);
            }
            ChildChange::ReactionUpsert(r) => {
                rec.upsert_reaction(r);
            }
            ChildChange::ReactionDelete(key) => {
                rec.remove_reaction(&key);
            }
        }
    }
}

/// Records changes only while at least one load is running. Cursors are
/// absolute positions, so overlapping loads each replay from where they
/// began.
#[derive(Debug, Default)]
pub(crate) struct LoadJournal {
    loads: usize,
    offset: usize,
    entries: Vec<ChildChange>,
}

impl LoadJournal {
    /// Start recording for a new load and return its cursor.
    pub fn begin(&mut self) -> usize {
        self.loads += 1;
        self.offset + self.entries.len()
    }

    pub fn is_recording(&self) -> bool {
        self.loads > 0
    }

    pub fn record(&mut self, change: ChildChange) {
        if self.is_recording() {
            self.entries.push(change);
        }
    }

    /// End the load started at `cursor`, returning what was recorded since.
    pub fn finish(&mut self, cursor: usize) -> Vec<ChildChange> {
        let start = cursor.saturating_sub(self.offset).min(self.entries.len());
        let since = self.entries[start..].to_vec();
        self.loads = self.loads.saturating_sub(1);
        if self.loads == 0 {
            self.offset += self.entries.len();
            self.entries.clear();
        }
        since
    }

    pub fn clear(&mut self) {
        self.loads = 0;
        self.offset += self.entries.len();
        self.entries.clear();
    }
}
