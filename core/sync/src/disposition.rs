//! Reconciliation of a new local mutation with the queued ones for the
//! same record.

use driftsync_common::{MutationEvent, MutationType};

/// Outcome of comparing a candidate event with the queued events of its
/// record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Append the candidate to the outbox.
    SaveCandidate,
    /// Drop the candidate, delete the queued events and purge the record
    /// locally. The mutations cancel out.
    DropCandidateAndDeleteLocal,
    /// Overwrite the oldest queued event with the candidate.
    ReplaceLocalWithCandidate,
    /// Refuse the candidate.
    DropCandidateWithError(String),
}

/// Decide how `candidate` joins the outbox.
///
/// `existing` must hold the record's queued events that are not in
/// process, oldest first.
pub fn disposition(candidate: &MutationEvent, existing: &[MutationEvent]) -> Disposition {
    let Some(first) = existing.first() else {
        return Disposition::SaveCandidate;
    };

    if candidate.condition_json.is_some() {
        return Disposition::SaveCandidate;
    }

    use MutationType::*;
    match (first.mutation_type, candidate.mutation_type) {
        (Create, Update) | (Update, Update) | (Update, Delete) | (Delete, Delete) => {
            Disposition::ReplaceLocalWithCandidate
        }
        (Create, Delete) => Disposition::DropCandidateAndDeleteLocal,
        (_, Create) => Disposition::DropCandidateWithError(format!(
            "duplicate create for {} {}: a {} is already queued",
            candidate.model_name, candidate.model_id, first.mutation_type
        )),
        (Delete, Update) => Disposition::DropCandidateWithError(format!(
            "update after pending delete for {} {}",
            candidate.model_name, candidate.model_id
        )),
    }
}

/// Fold `candidate` into the queued event `existing`.
///
/// The result keeps the identity and `created_at` of `existing`, so it keeps
/// its FIFO slot. A create followed by an update stays a create carrying the
/// newest payload.
pub fn merge(existing: &MutationEvent, candidate: &MutationEvent) -> MutationEvent {
    let mutation_type = match (existing.mutation_type, candidate.mutation_type) {
        (MutationType::Create, MutationType::Update) => MutationType::Create,
        (_, candidate_type) => candidate_type,
    };

    MutationEvent {
        id: existing.id.clone(),
        model_id: existing.model_id.clone(),
        model_name: existing.model_name.clone(),
        json: candidate.json.clone(),
        mutation_type,
        version: candidate.version.or(existing.version),
        condition_json: candidate.condition_json.clone(),
        in_process: false,
        created_at: existing.created_at,
    }
}
