//! One end-to-end reconciliation pass: fetch, reconcile, aggregate, schedule, sweep.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use workload_core::aggregate::{aggregate, grand_total};
use workload_core::feed::{DataShapeError, FeedItem, FeedOpportunity};
use workload_core::schedule::{start_build_date, try_working_days};
use workload_core::{
    ActiveProduct, Client, CustomInput, CustomInputFields, Entity, ExternalId, Item, ItemFields,
    ItemGroup, ItemGroupFields, ItemGroupKey, ItemGroupTotal, ItemGroupTotalFields, ItemKey,
    Opportunity, OpportunityScoped, Owner, Reconciled, RunStatus, RunSummary, TagOwner, Venue,
};
use workload_feed::{FeedBatch, FeedError, SourceFeed};
use workload_storage::{Store, StoreError};

use crate::config::PipelineSettings;

/// Lease name held for the duration of a pass.
pub const PIPELINE_LOCK: &str = "workload-sync";

#[derive(Debug, Error)]
enum OpportunityError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("line items unavailable: {0}")]
    Items(#[from] FeedError),
    #[error(transparent)]
    Shape(#[from] DataShapeError),
}

impl OpportunityError {
    fn is_fatal(&self) -> bool {
        match self {
            OpportunityError::Store(err) => err.is_fatal(),
            OpportunityError::Items(err) => err.is_unauthorized(),
            OpportunityError::Shape(_) => false,
        }
    }
}

#[derive(Debug, Default)]
struct OpportunityOutcome {
    rejected_items: usize,
}

pub struct SyncPipeline<S: Store> {
    store: Arc<S>,
    feed: Arc<dyn SourceFeed>,
    settings: PipelineSettings,
}

impl<S: Store> SyncPipeline<S> {
    pub fn new(store: Arc<S>, feed: Arc<dyn SourceFeed>, settings: PipelineSettings) -> Self {
        Self {
            store,
            feed,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let (_keep_open, shutdown) = watch::channel(false);
        self.run_once_with_shutdown(shutdown).await
    }

    /// Run one pass. `shutdown` flipping to true stops the pass between opportunities; work
    /// already committed stays, and no stale sweep runs.
    pub async fn run_once_with_shutdown(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, feed = self.feed.name());
        self.run_leased(run_id, shutdown).instrument(span).await
    }

    async fn run_leased(
        &self,
        run_id: Uuid,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::new(run_id, Utc::now());

        let acquired = self
            .store
            .acquire_lease(PIPELINE_LOCK, run_id, self.settings.lock_ttl)
            .await
            .context("acquiring pipeline lease")?;
        if !acquired {
            info!("another pass holds the pipeline lease; skipping");
            summary.status = RunStatus::SkippedOverlap;
            summary.finished_at = Utc::now();
            self.store
                .record_run(&summary)
                .await
                .context("recording skipped run")?;
            return Ok(summary);
        }

        let outcome = self.run_locked(run_id, &mut summary, shutdown).await;

        if let Err(err) = self.store.release_lease(PIPELINE_LOCK, run_id).await {
            warn!(error = %err, "failed to release pipeline lease");
        }
        summary.finished_at = Utc::now();

        if let Err(err) = outcome {
            summary.status = RunStatus::Failed;
            if let Err(record_err) = self.store.record_run(&summary).await {
                warn!(error = %record_err, "failed to record failed run");
            }
            return Err(err);
        }

        self.store
            .record_run(&summary)
            .await
            .context("recording run summary")?;
        info!(
            status = %summary.status,
            products = summary.products_processed,
            products_deactivated = summary.products_deactivated,
            opportunities = summary.opportunities_seen,
            reconciled = summary.opportunities_reconciled,
            failed = summary.opportunities_failed,
            deactivated = summary.opportunities_deactivated,
            rejected = summary.records_rejected,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        summary: &mut RunSummary,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let active_ids = self.sync_products(run_id, summary).await?;
        let opportunities = self.fetch_opportunities(summary).await?;
        summary.opportunities_seen = opportunities.len();

        let mut items = self.fetch_items(&opportunities).await;

        for opportunity in opportunities.values() {
            if *shutdown.borrow() {
                info!("shutdown requested; stopping before the remaining opportunities");
                summary.status = RunStatus::Cancelled;
                break;
            }

            let fetched = items
                .remove(&opportunity.id)
                .unwrap_or_else(|| Err(FeedError::Unavailable("items not fetched".into())));
            let span = info_span!("opportunity", id = opportunity.id);
            let result = self
                .sync_opportunity(run_id, opportunity, fetched, &active_ids)
                .instrument(span)
                .await;

            match result {
                Ok(outcome) => {
                    summary.opportunities_reconciled += 1;
                    summary.records_rejected += outcome.rejected_items;
                }
                Err(err) if err.is_fatal() => {
                    return Err(anyhow!(err))
                        .with_context(|| format!("reconciling opportunity {}", opportunity.id));
                }
                Err(err) => {
                    warn!(id = opportunity.id, error = %err, "opportunity skipped");
                    summary.opportunities_failed += 1;
                    if let OpportunityError::Shape(_) = err {
                        summary.records_rejected += 1;
                    }
                    // Keep whatever was stored last time out of this pass's sweep.
                    self.store
                        .touch::<Opportunity>(&ExternalId(opportunity.id), run_id)
                        .await
                        .with_context(|| format!("marking opportunity {} seen", opportunity.id))?;
                }
            }
        }

        if summary.allows_sweep() {
            self.sweep(run_id, summary).await?;
        } else {
            info!(status = %summary.status, "stale sweep skipped");
        }
        Ok(())
    }

    async fn sync_products(&self, run_id: Uuid, summary: &mut RunSummary) -> Result<BTreeSet<i64>> {
        let batch = self
            .feed
            .active_products()
            .await
            .context("fetching active products")?;
        summary.records_rejected += batch.rejected;

        let mut active_ids = BTreeSet::new();
        for product in batch.records {
            if Some(product.id) == self.settings.fetch_excluded_product_id {
                debug!(id = product.id, "excluded product dropped");
                continue;
            }
            match self
                .reconcile_with_retry::<ActiveProduct>(
                    &ExternalId(product.id),
                    product.to_product(),
                    run_id,
                )
                .await
            {
                Ok(_) => {
                    active_ids.insert(product.id);
                    summary.products_processed += 1;
                }
                Err(err) if err.is_fatal() => {
                    return Err(anyhow!(err)).context("reconciling active products");
                }
                Err(err) => warn!(id = product.id, error = %err, "product skipped"),
            }
        }
        Ok(active_ids)
    }

    /// Every pipeline state's opportunities whose booking start falls in the forward window,
    /// de-duplicated by id.
    async fn fetch_opportunities(
        &self,
        summary: &mut RunSummary,
    ) -> Result<BTreeMap<i64, FeedOpportunity>> {
        let now = Utc::now();
        let window_days = self.settings.window_days;
        let horizon = ChronoDuration::try_days(window_days)
            .and_then(|window| now.checked_add_signed(window))
            .ok_or_else(|| anyhow!("window of {window_days} days is out of range"))?;
        let mut out = BTreeMap::new();

        for filter in &self.settings.filters {
            let batch: FeedBatch<FeedOpportunity> = self
                .feed
                .opportunities(filter)
                .await
                .with_context(|| format!("fetching {} opportunities", filter.name))?;
            summary.records_rejected += batch.rejected;

            for opportunity in batch.records {
                let in_window = opportunity
                    .starts_at_utc()
                    .is_some_and(|start| start >= now && start <= horizon);
                if in_window {
                    out.entry(opportunity.id).or_insert(opportunity);
                }
            }
        }
        Ok(out)
    }

    async fn fetch_items(
        &self,
        opportunities: &BTreeMap<i64, FeedOpportunity>,
    ) -> HashMap<i64, Result<FeedBatch<FeedItem>, FeedError>> {
        let feed = self.feed.clone();
        stream::iter(opportunities.keys().copied().collect::<Vec<_>>())
            .map(move |id| {
                let feed = feed.clone();
                async move { (id, feed.opportunity_items(id).await) }
            })
            .buffer_unordered(self.settings.item_fetch_concurrency.max(1))
            .collect()
            .await
    }

    async fn reconcile_with_retry<E: Entity>(
        &self,
        key: &E::Key,
        incoming: E::Incoming,
        run_id: Uuid,
    ) -> Result<Reconciled<E>, StoreError> {
        self.update_with_retry::<E, _>(key, run_id, move |_| incoming.clone())
            .await
    }

    /// Read-modify-write against the stored entity, retried once when another writer of the
    /// same key commits first.
    async fn update_with_retry<E, F>(
        &self,
        key: &E::Key,
        run_id: Uuid,
        merge: F,
    ) -> Result<Reconciled<E>, StoreError>
    where
        E: Entity,
        F: Fn(Option<&E>) -> E::Incoming + Send + Sync,
    {
        match self.store.update::<E, _>(key, Some(run_id), &merge).await {
            Err(err) if err.is_conflict() => {
                debug!(kind = %E::KIND, key = %key, "write conflict; retrying once");
                self.store.update::<E, _>(key, Some(run_id), &merge).await
            }
            other => other,
        }
    }

    async fn sync_tags(&self, owner: TagOwner, names: &[String]) -> Result<(), StoreError> {
        match self.store.sync_tags(&owner, names).await {
            Ok(diff) => {
                if !diff.is_empty() {
                    debug!(kind = %owner.kind, key = %owner.key, added = diff.add.len(), removed = diff.remove.len(), "tags changed");
                }
                Ok(())
            }
            Err(StoreError::InvalidTag(err)) => {
                warn!(kind = %owner.kind, key = %owner.key, error = %err, "tag set left unchanged");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn sync_opportunity(
        &self,
        run_id: Uuid,
        opportunity: &FeedOpportunity,
        fetched: Result<FeedBatch<FeedItem>, FeedError>,
        active_ids: &BTreeSet<i64>,
    ) -> Result<OpportunityOutcome, OpportunityError> {
        let incoming = opportunity.to_incoming()?;
        let batch = fetched?;
        let mut outcome = OpportunityOutcome {
            rejected_items: batch.rejected,
        };
        let opportunity_id = opportunity.id;

        if let Some(owner) = &opportunity.owner {
            self.reconcile_with_retry::<Owner>(&ExternalId(owner.id), owner.to_owner(), run_id)
                .await?;
            self.sync_tags(TagOwner::owner(owner.id), &owner.tag_list)
                .await?;
        }
        if let Some(member) = &opportunity.member {
            self.reconcile_with_retry::<Client>(&ExternalId(member.id), member.to_client(), run_id)
                .await?;
            self.sync_tags(TagOwner::client(member.id), &member.tag_list)
                .await?;
        }
        if let Some(venue) = &opportunity.venue {
            self.reconcile_with_retry::<Venue>(&ExternalId(venue.id), venue.to_venue(), run_id)
                .await?;
        }

        let reconciled = self
            .reconcile_with_retry::<Opportunity>(&ExternalId(opportunity_id), incoming, run_id)
            .await?;
        if reconciled.created {
            info!(id = opportunity_id, "new opportunity");
        }
        self.sync_tags(TagOwner::opportunity(opportunity_id), &opportunity.tag_list)
            .await?;

        let mut lines: Vec<(i64, ItemFields)> = Vec::new();
        for item in &batch.records {
            match item.to_fields() {
                Ok(Some(fields)) => lines.push((item.id, fields)),
                Ok(None) => {}
                Err(err) => {
                    warn!(id = %err.id, reason = %err.reason, "skipping line item");
                    outcome.rejected_items += 1;
                }
            }
        }

        for (line_id, fields) in &lines {
            let key = ItemKey {
                opportunity_id,
                line_id: *line_id,
            };
            self.reconcile_with_retry::<Item>(&key, fields.clone(), run_id)
                .await?;
        }

        let fields: Vec<ItemFields> = lines.into_iter().map(|(_, f)| f).collect();
        let aggregation = aggregate(&fields);
        for (product_id, quantity) in &aggregation.quantity_by_product {
            let key = ItemGroupKey {
                opportunity_id,
                product_id: *product_id,
            };
            let group = ItemGroupFields {
                name: aggregation
                    .name_by_product
                    .get(product_id)
                    .cloned()
                    .unwrap_or_default(),
                item_total: *quantity,
            };
            self.reconcile_with_retry::<ItemGroup>(&key, group, run_id)
                .await?;
        }

        let stale_items = self
            .store
            .deactivate_unseen::<Item>(Some(opportunity_id), run_id)
            .await?;
        let stale_groups = self
            .store
            .deactivate_unseen::<ItemGroup>(Some(opportunity_id), run_id)
            .await?;
        if !stale_items.is_empty() || !stale_groups.is_empty() {
            debug!(
                items = stale_items.len(),
                groups = stale_groups.len(),
                "lines dropped from opportunity"
            );
        }

        let total = grand_total(
            &aggregation.quantity_by_product,
            active_ids,
            self.settings.total_excluded_product_id,
        );
        self.reconcile_with_retry::<ItemGroupTotal>(
            &OpportunityScoped(opportunity_id),
            ItemGroupTotalFields { grand_total: total },
            run_id,
        )
        .await?;

        self.schedule(run_id, opportunity, total).await?;
        Ok(outcome)
    }

    /// Recompute the scheduling figures from the operator's inputs as stored at write time.
    async fn schedule(
        &self,
        run_id: Uuid,
        opportunity: &FeedOpportunity,
        total: f64,
    ) -> Result<(), StoreError> {
        let dispatch = match opportunity.dispatch() {
            Ok(dispatch) => Some(dispatch),
            Err(err) => {
                warn!(id = opportunity.id, error = %err, "dispatch date unavailable");
                None
            }
        };
        let default_carpenters = self.settings.default_carpenters;
        let opportunity_id = opportunity.id;

        self.update_with_retry::<CustomInput, _>(
            &OpportunityScoped(opportunity_id),
            run_id,
            move |current| {
                let fields = current
                    .map(CustomInputFields::from)
                    .unwrap_or_else(|| CustomInputFields::defaults(default_carpenters));
                plan(opportunity_id, fields, dispatch, total)
            },
        )
        .await?;
        Ok(())
    }

    async fn sweep(&self, run_id: Uuid, summary: &mut RunSummary) -> Result<()> {
        let products = self
            .store
            .deactivate_unseen::<ActiveProduct>(None, run_id)
            .await
            .context("sweeping products")?;
        summary.products_deactivated = products.len();

        let stale = self
            .store
            .deactivate_unseen::<Opportunity>(None, run_id)
            .await
            .context("sweeping opportunities")?;
        for key in &stale {
            let Ok(opportunity_id) = key.parse::<i64>() else {
                warn!(key = %key, "unexpected opportunity key");
                continue;
            };
            self.cascade(opportunity_id)
                .await
                .with_context(|| format!("deactivating children of opportunity {opportunity_id}"))?;
        }
        summary.opportunities_deactivated = stale.len();
        if !stale.is_empty() {
            info!(count = stale.len(), "opportunities deactivated");
        }
        Ok(())
    }

    async fn cascade(&self, opportunity_id: i64) -> Result<(), StoreError> {
        self.store
            .deactivate_scope::<ItemGroup>(opportunity_id)
            .await?;
        self.store.deactivate_scope::<Item>(opportunity_id).await?;
        self.store
            .deactivate_scope::<ItemGroupTotal>(opportunity_id)
            .await?;
        Ok(())
    }
}

/// Fill the derived scheduling fields of `fields` from the dispatch slot and the build total.
fn plan(
    opportunity_id: i64,
    mut fields: CustomInputFields,
    dispatch: Option<(NaiveDate, NaiveTime)>,
    total: f64,
) -> CustomInputFields {
    fields.date_out = dispatch.map(|(date, _)| date);
    fields.time_out = dispatch.map(|(_, time)| time);

    let planned_finish = fields.planned_finish_date.is_some();
    let reference = fields.planned_finish_date.or(fields.date_out);
    let computed = try_working_days(Some(total), Some(fields.carpenter_count)).and_then(|days| {
        match reference {
            Some(reference) => {
                start_build_date(days, reference, fields.include_weekends, planned_finish)
                    .map(|start| (days, Some(start)))
            }
            None => Ok((days, None)),
        }
    });
    match computed {
        Ok((days, start)) => {
            fields.working_days = Some(days);
            fields.start_build_date = start;
        }
        Err(err) => {
            warn!(id = opportunity_id, error = %err, "scheduling inputs unusable; defaulting");
            fields.working_days = Some(0.0);
            fields.start_build_date = None;
        }
    }
    fields
}
