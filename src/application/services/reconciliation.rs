use crate::domain::entities::{MutationAction, PendingMutation};
use crate::domain::value_objects::{Document, EntityId};
use std::collections::{HashMap, HashSet};

/// Builds the list to display from the latest authoritative snapshot of a
/// collection and the mutations still pending for it.
///
/// - a pending update or create is overlaid on its authoritative record,
///   payload fields win;
/// - a record with a pending delete is left out;
/// - pending creates without an authoritative record yet are appended in the
///   order they were issued;
/// - a pending update whose record is not in the snapshot is not shown.
///
/// The authoritative order is preserved. Any combination of "pending exists"
/// and "snapshot has the record" is valid input.
pub fn reconcile(
    authoritative: &[Document],
    pending: &HashMap<EntityId, PendingMutation>,
) -> Vec<Document> {
    let mut seen: HashSet<&EntityId> = HashSet::with_capacity(authoritative.len());
    let mut merged = Vec::with_capacity(authoritative.len() + pending.len());

    for document in authoritative {
        seen.insert(&document.id);
        match pending.get(&document.id) {
            Some(mutation) if mutation.action == MutationAction::Delete => {}
            Some(mutation) => merged.push(Document::new(
                document.id.clone(),
                document.data.overlay(&mutation.payload),
            )),
            None => merged.push(document.clone()),
        }
    }

    let mut created: Vec<&PendingMutation> = pending
        .values()
        .filter(|mutation| mutation.action == MutationAction::Create && !seen.contains(&mutation.id))
        .collect();
    created.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.id.cmp(&b.id)));

    merged.extend(
        created
            .into_iter()
            .map(|mutation| Document::new(mutation.id.clone(), mutation.payload.clone())),
    );
    merged
}
