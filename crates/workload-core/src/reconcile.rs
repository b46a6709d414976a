use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{Entity, EntityKey, Record};

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled<E> {
    pub record: Record<E>,
    pub created: bool,
}

/// Upsert-with-history over one entity.
///
/// With no existing record a fresh one is built from `incoming`. Otherwise every tracked field is
/// shadowed, the remaining fields are overwritten, `updated_at` moves into
/// `previously_updated_at`, and the record is reactivated. `run` stamps `last_seen_run` when given.
pub fn reconcile<E: Entity>(
    existing: Option<Record<E>>,
    key: &E::Key,
    incoming: E::Incoming,
    run: Option<Uuid>,
    now: DateTime<Utc>,
) -> Reconciled<E> {
    match existing {
        None => Reconciled {
            record: Record {
                id: Uuid::new_v4(),
                lookup_key: key.to_string(),
                scope: key.scope(),
                is_active: true,
                last_seen_run: run,
                created_at: now,
                updated_at: now,
                previously_updated_at: None,
                fields: E::create(key, incoming),
            },
            created: true,
        },
        Some(mut record) => {
            record.fields.absorb(incoming);
            record.previously_updated_at = Some(record.updated_at);
            record.updated_at = now;
            record.is_active = true;
            if run.is_some() {
                record.last_seen_run = run;
            }
            Reconciled {
                record,
                created: false,
            }
        }
    }
}

/// Mark an existing record as seen by `run` without touching its fields.
pub fn touch<E>(record: &mut Record<E>, run: Uuid) {
    record.last_seen_run = Some(run);
}
