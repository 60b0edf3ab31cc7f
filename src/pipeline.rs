use crate::ads::{AdPlatform, GraphApi, PurchaseDetails};
use crate::attribution::{AttributionInput, AttributionResolver};
use crate::automation;
use crate::charge;
use crate::classifier;
use crate::config::{PipelineSettings, TenantConfig, env_u64};
use crate::dispatch;
use crate::fraud;
use crate::gateway::{ChatGateway, HttpChatGateway, MediaPayload};
use crate::idempotency::{self, ClaimStore, GuardDecision, LocalClaims, RedisClaims};
use crate::labels::{self, LabelCache};
use crate::leads::{self, LeadUpdate, Purchase};
use crate::llm::{ProofModel, VisionClient, VisionConfig};
use crate::models::{
    AckStatus, ChargeOutcome, ClassificationResult, DispatchAttempt, FraudCheck, IncomingEvent,
    Lead, PipelineRunLog, StageReport, StageStatus, TriggerOutcome, WebhookAck, WebhookPayload,
};
use crate::notify::{self, SaleFacts};
use crate::outbox::{Outbox, OutboxMessage};
use crate::store::{AdAccount, MemoryStore, Store, SupabaseStore};
use crate::webhook::{self, Intake};
use chrono::Utc;
use eyre::eyre;
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Duration, time::Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Collaborators a pipeline runs against.
pub struct PipelineDeps {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn ChatGateway>,
    pub model: Arc<dyn ProofModel>,
    pub ads: Arc<dyn AdPlatform>,
    pub claims: Arc<dyn ClaimStore>,
    pub outbox: Outbox,
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn Store>,
    gateway: Arc<dyn ChatGateway>,
    model: Arc<dyn ProofModel>,
    ads: Arc<dyn AdPlatform>,
    claims: Arc<dyn ClaimStore>,
    outbox: Outbox,
    resolver: Arc<AttributionResolver>,
    settings: Arc<PipelineSettings>,
    claim_ttl: Duration,
}

/// Mutable state of one invocation; the log is written once at the end.
struct Run {
    log: PipelineRunLog,
    status: AckStatus,
    reason: Option<String>,
    claim_key: Option<String>,
}

impl Run {
    fn stop(&mut self, reason: &str) {
        self.reason = Some(reason.to_string());
    }
}

impl Pipeline {
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        Self {
            store: deps.store,
            gateway: deps.gateway,
            model: deps.model,
            ads: deps.ads,
            claims: deps.claims,
            outbox: deps.outbox,
            resolver: Arc::new(AttributionResolver::new(settings.attribution.clone())),
            claim_ttl: Duration::from_secs(env_u64("IDEMPOTENCY_TTL_SECS", 3600)),
            settings: Arc::new(settings),
        }
    }

    /// Wires the HTTP collaborators from the environment. The chat gateway is
    /// mandatory; the store falls back to memory and claims to the process.
    pub fn from_env() -> eyre::Result<(Self, JoinHandle<()>)> {
        let gateway = HttpChatGateway::from_env()
            .ok_or_else(|| eyre!("CHAT_GATEWAY_URL and CHAT_GATEWAY_KEY must be set"))?;
        let store: Arc<dyn Store> = match SupabaseStore::from_env() {
            Some(store) => Arc::new(store),
            None => {
                warn!(target = "salesignal.pipeline", "SUPABASE_URL not set; using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        let claims: Arc<dyn ClaimStore> = match std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok())
        {
            Some(client) => Arc::new(RedisClaims::new(client)),
            None => Arc::new(LocalClaims::new()),
        };
        let (outbox, worker) = Outbox::from_env();
        let deps = PipelineDeps {
            store,
            gateway: Arc::new(gateway),
            model: Arc::new(VisionClient::new(VisionConfig::from_env())),
            ads: Arc::new(GraphApi::from_env()),
            claims,
            outbox,
        };
        Ok((Self::new(deps, PipelineSettings::from_env()), worker))
    }

    pub async fn handle(
        &self,
        tenant_id: &str,
        payload: WebhookPayload,
    ) -> Result<WebhookAck, PipelineError> {
        match webhook::intake(tenant_id, payload)? {
            Intake::Ignore(reason) => Ok(WebhookAck::ignored(reason)),
            Intake::Process(event) => self.process(event).await,
        }
    }

    pub async fn process(&self, event: IncomingEvent) -> Result<WebhookAck, PipelineError> {
        if !self.model.has_credentials() {
            return Err(PipelineError::internal(
                "classify",
                "no model credentials configured",
            ));
        }
        let tenant = self.tenant_config(&event.tenant_id).await;
        if let Some(reason) = classifier::filter_reason(event.media_kind, &tenant) {
            return Ok(WebhookAck::ignored(reason));
        }

        let mut run = Run {
            log: PipelineRunLog::new(&event),
            status: AckStatus::Processed,
            reason: None,
            claim_key: None,
        };
        info!(
            target = "salesignal.pipeline",
            run_id = %run.log.id,
            tenant = %event.tenant_id,
            instance = %event.instance_id,
            kind = event.media_kind.as_str(),
            "pipeline_started"
        );

        let deadline = self.settings.deadline;
        if tokio::time::timeout(deadline, self.run_stages(&event, &tenant, &mut run))
            .await
            .is_err()
        {
            warn!(target = "salesignal.pipeline", run_id = %run.log.id, "pipeline_deadline_exceeded");
            run.log
                .push_error("deadline", format!("exceeded {}s", deadline.as_secs()));
            run.stop("deadline_exceeded");
        }

        if let Some(key) = run.claim_key.take()
            && !run.log.label_applied
        {
            self.claims.release(&key).await;
        }
        self.write_log(&run.log).await;

        Ok(WebhookAck {
            status: run.status,
            run_id: Some(run.log.id),
            reason: run.reason,
            stages: run.log.stages,
        })
    }

    async fn tenant_config(&self, tenant_id: &str) -> TenantConfig {
        match self.store.tenant_config(tenant_id).await {
            Ok(Some(config)) => config,
            Ok(None) => TenantConfig::default(),
            Err(err) => {
                warn!(target = "salesignal.pipeline", tenant = tenant_id, error = %err, "tenant_config_unavailable");
                TenantConfig::default()
            }
        }
    }

    async fn write_log(&self, log: &PipelineRunLog) {
        match tokio::time::timeout(self.settings.stage_timeout, self.store.append_run_log(log))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(target = "salesignal.pipeline", run_id = %log.id, error = %err, "run_log_write_failed")
            }
            Err(_) => {
                warn!(target = "salesignal.pipeline", run_id = %log.id, "run_log_write_timed_out")
            }
        }
    }

    async fn run_stages(&self, event: &IncomingEvent, tenant: &TenantConfig, run: &mut Run) {
        let limit = self.settings.stage_timeout;

        let media = self
            .capture_stage("fetch_media", limit, &mut run.log, self.fetch_media(event))
            .await
            .flatten();
        let Some(media) = media else {
            run.stop("media_unavailable");
            return;
        };

        let classification = self
            .capture_stage("classify", limit, &mut run.log, async {
                let result = classifier::classify_proof(&*self.model, &media, tenant).await;
                let output = json!({
                    "is_payment_proof": result.is_payment_proof,
                    "confidence": result.confidence,
                    "amount": result.amount,
                    "amount_source": result.amount_source,
                    "reason": result.reason,
                });
                StageOutcome::ok(result, output)
            })
            .await;
        let Some(classification) = classification else {
            run.stop("classification_unavailable");
            return;
        };
        run.log.classification = Some(classification.clone());
        if !classification.is_actionable(tenant.confidence_threshold) {
            run.stop("not_a_payment_proof");
            return;
        }

        let fraud_check = self
            .capture_stage(
                "verify_recipient",
                limit,
                &mut run.log,
                self.verify_recipient(&event.tenant_id, &classification),
            )
            .await
            .flatten();
        match fraud_check {
            None => {
                run.stop("recipient_verification_unavailable");
                return;
            }
            Some(check @ FraudCheck::Mismatch { .. }) => {
                warn!(target = "salesignal.pipeline", run_id = %run.log.id, tenant = %event.tenant_id, "recipient_mismatch_fraud_suspected");
                run.log.fraud_check = Some(check);
                run.status = AckStatus::FraudSuspected;
                run.stop("recipient_mismatch");
                return;
            }
            Some(check) => run.log.fraud_check = Some(check),
        }

        let decision = self
            .capture_stage("idempotency", limit, &mut run.log, async {
                let decision = idempotency::check(
                    &*self.store,
                    &*self.claims,
                    self.claim_ttl,
                    &event.tenant_id,
                    &event.instance_id,
                    &event.sender_phone,
                )
                .await;
                let output = match &decision {
                    GuardDecision::Proceed { .. } => json!({ "already_labeled": false }),
                    GuardDecision::AlreadyLabeled { reason } => {
                        json!({ "already_labeled": true, "reason": reason })
                    }
                };
                StageOutcome::ok(decision, output)
            })
            .await;
        match decision {
            Some(GuardDecision::Proceed { claim_key }) => run.claim_key = Some(claim_key),
            Some(GuardDecision::AlreadyLabeled { .. }) => run.log.already_labeled = true,
            // an unanswered guard counts as labeled so nothing is credited twice
            None => run.log.already_labeled = true,
        }
        let credit = !run.log.already_labeled;

        if credit {
            let label = self
                .capture_stage("apply_label", limit, &mut run.log, async {
                    let cache = LabelCache::new(
                        &*self.store,
                        &*self.gateway,
                        &event.tenant_id,
                        &event.instance_id,
                        &tenant.label_name,
                    );
                    let outcome = labels::apply_paid_label(
                        &cache,
                        &*self.gateway,
                        &event.instance_id,
                        &event.sender_phone,
                    )
                    .await;
                    let output = json!(outcome);
                    if outcome.applied {
                        StageOutcome::ok(outcome, output)
                    } else {
                        let error = outcome.error.clone().unwrap_or_default();
                        StageOutcome::failed(outcome, error, output)
                    }
                })
                .await;
            if let Some(label) = label {
                run.log.label_applied = label.applied;
                run.log.label = Some(label);
            }

            let charge = self
                .capture_stage("charge", limit, &mut run.log, async {
                    let outcome = charge::request_charge(
                        &*self.gateway,
                        &tenant.charge,
                        &event.instance_id,
                        &event.sender_phone,
                        classification.amount,
                    )
                    .await;
                    let output = json!(outcome);
                    match &outcome {
                        ChargeOutcome::Sent { .. } => StageOutcome::ok(outcome, output),
                        ChargeOutcome::Skipped { .. } => {
                            StageOutcome::skipped(outcome, output)
                        }
                        ChargeOutcome::Failed { error } => {
                            let error = error.clone();
                            StageOutcome::failed(outcome, error, output)
                        }
                    }
                })
                .await;
            run.log.charge = charge;
        }

        let existing_lead = self
            .store
            .get_lead(&event.tenant_id, &event.sender_phone)
            .await
            .unwrap_or_else(|err| {
                warn!(target = "salesignal.pipeline", error = %err, "lead_lookup_failed");
                None
            });
        let context = event.context.clone().unwrap_or_default();
        let source_url = context
            .source_url
            .clone()
            .or_else(|| existing_lead.as_ref().and_then(|lead| lead.source_url.clone()));
        let correlation_id = context.correlation_id.clone().or_else(|| {
            existing_lead
                .as_ref()
                .and_then(|lead| lead.correlation_id.clone())
        });

        let attribution = self
            .capture_stage("attribution", limit, &mut run.log, async {
                let input = AttributionInput {
                    tenant_id: &event.tenant_id,
                    phone: &event.sender_phone,
                    source_url: source_url.as_deref(),
                    correlation_id: correlation_id.as_deref(),
                };
                let found = self.resolver.resolve(&*self.store, &*self.store, &input).await;
                let output = json!(found);
                if found.is_empty() {
                    StageOutcome::skipped(found, output)
                } else {
                    StageOutcome::ok(found, output)
                }
            })
            .await
            .unwrap_or_default();
        run.log.attribution = Some(attribution.clone());

        let value = classification
            .amount
            .or(tenant.fallback_purchase_value)
            .unwrap_or(0.0);
        let accounts = self
            .store
            .ad_accounts(&event.tenant_id)
            .await
            .map_err(|err| err.to_string());
        let default_account = accounts
            .as_deref()
            .ok()
            .and_then(leads::sole_selected_account);
        let lead_stage = self
            .capture_stage(
                "update_lead",
                limit,
                &mut run.log,
                self.update_lead(
                    event,
                    existing_lead,
                    default_account,
                    LeadUpdate {
                        purchase: credit.then(|| Purchase {
                            value,
                            at: Utc::now(),
                        }),
                        attribution,
                        correlation_id: correlation_id.clone(),
                        source_url,
                    },
                ),
            )
            .await;
        let lead = lead_stage.map(|(lead, saved)| {
            run.log.lead_updated = saved;
            lead
        });

        if !credit {
            run.stop("already_labeled");
            return;
        }

        let run_id = run.log.id.to_string();
        let details = PurchaseDetails {
            event_id: &run_id,
            phone: &event.sender_phone,
            value,
            currency: &tenant.currency,
            correlation_id: lead
                .as_ref()
                .and_then(|l| l.correlation_id.as_deref())
                .or(correlation_id.as_deref()),
            page_id: lead.as_ref().and_then(|l| l.page_id.as_deref()),
            fbclid: context.fbclid.as_deref(),
        };
        let attempts = self
            .capture_stage(
                "dispatch",
                self.settings.deadline,
                &mut run.log,
                self.dispatch(&event.tenant_id, &accounts, &details),
            )
            .await
            .unwrap_or_default();
        run.log.dispatch_attempts = attempts;

        if !run.log.label_applied {
            return;
        }
        let facts = SaleFacts {
            tenant_id: &event.tenant_id,
            instance_id: &event.instance_id,
            phone: &event.sender_phone,
            value,
        };
        let run_uuid = run.log.id;
        let triggers = self
            .capture_stage(
                "triggers",
                limit,
                &mut run.log,
                self.fire_triggers(run_uuid, tenant, &facts),
            )
            .await;
        if let Some((notification, automation)) = triggers {
            run.log.notification = Some(notification);
            run.log.automation = Some(automation);
        }
    }

    async fn fetch_media(&self, event: &IncomingEvent) -> StageOutcome<Option<MediaPayload>> {
        match self
            .gateway
            .download_media(&event.instance_id, &event.message_id)
            .await
        {
            Ok(mut media) => {
                if media.mime_type == "application/octet-stream"
                    && let Some(declared) = &event.mime_type
                {
                    media.mime_type = declared.clone();
                }
                let output = json!({ "mime_type": media.mime_type, "bytes": media.bytes.len() });
                StageOutcome::ok(Some(media), output)
            }
            Err(err) => {
                let error = err.to_string();
                StageOutcome::failed(None, error.clone(), json!({ "error": error }))
            }
        }
    }

    async fn verify_recipient(
        &self,
        tenant_id: &str,
        classification: &ClassificationResult,
    ) -> StageOutcome<Option<FraudCheck>> {
        match self.store.recipient_registry(tenant_id).await {
            Ok(registry) => {
                let check = fraud::verify(classification, &registry);
                let output = json!(check);
                match &check {
                    FraudCheck::Skipped => StageOutcome::skipped(Some(check), output),
                    FraudCheck::Matched { .. } => StageOutcome::ok(Some(check), output),
                    FraudCheck::Mismatch { .. } => {
                        StageOutcome::failed(Some(check), "recipient mismatch".into(), output)
                    }
                }
            }
            Err(err) => {
                let error = err.to_string();
                StageOutcome::failed(None, error.clone(), json!({ "error": error }))
            }
        }
    }

    async fn update_lead(
        &self,
        event: &IncomingEvent,
        existing: Option<Lead>,
        default_account: Option<&str>,
        update: LeadUpdate,
    ) -> StageOutcome<(Lead, bool)> {
        let had_campaign = existing.as_ref().is_some_and(|lead| lead.campaign_id.is_some());
        let lead = leads::merge(
            existing,
            &event.tenant_id,
            &event.sender_phone,
            update,
            default_account,
        );
        match self.store.save_lead(&lead).await {
            Ok(()) => {
                let output = json!({
                    "campaign_id": lead.campaign_id,
                    "ad_account_id": lead.ad_account_id,
                    "purchase_value": lead.purchase_value,
                    "attribution_kept": had_campaign,
                });
                StageOutcome::ok((lead, true), output)
            }
            Err(err) => {
                let error = err.to_string();
                // dispatch still uses the merged view even though it was not stored
                StageOutcome::failed((lead, false), error.clone(), json!({ "error": error }))
            }
        }
    }

    async fn dispatch(
        &self,
        tenant_id: &str,
        accounts: &Result<Vec<AdAccount>, String>,
        details: &PurchaseDetails<'_>,
    ) -> StageOutcome<Vec<DispatchAttempt>> {
        let limit = self.settings.stage_timeout;
        let mut lookup_errors = Vec::new();
        let mut attempts = match accounts {
            Ok(accounts) => {
                dispatch::report_to_all(
                    &*self.ads,
                    accounts,
                    details,
                    self.settings.dispatch_concurrency,
                    limit,
                )
                .await
            }
            Err(err) => {
                warn!(target = "salesignal.pipeline", error = %err, "ad_accounts_unavailable");
                lookup_errors.push(format!("ad accounts: {err}"));
                Vec::new()
            }
        };
        let pixels = match self.store.registered_pixels(tenant_id).await {
            Ok(pixels) => pixels,
            Err(err) => {
                warn!(target = "salesignal.pipeline", error = %err, "registered_pixels_unavailable");
                lookup_errors.push(format!("registered pixels: {err}"));
                Vec::new()
            }
        };
        if let Some(last) =
            dispatch::optimize_first_success(&*self.ads, &pixels, details, limit).await
        {
            attempts.push(last);
        }

        let succeeded = attempts.iter().filter(|a| a.success).count();
        let output = json!({ "attempts": attempts.len(), "succeeded": succeeded });
        if !lookup_errors.is_empty() {
            StageOutcome::failed(attempts, lookup_errors.join("; "), output)
        } else if attempts.is_empty() {
            StageOutcome::skipped(attempts, output)
        } else {
            StageOutcome::ok(attempts, output)
        }
    }

    async fn fire_triggers(
        &self,
        run_id: uuid::Uuid,
        tenant: &TenantConfig,
        facts: &SaleFacts<'_>,
    ) -> StageOutcome<(TriggerOutcome, TriggerOutcome)> {
        let notification = if tenant.notifications.enabled {
            let templates = self
                .store
                .notification_templates(facts.tenant_id)
                .await
                .unwrap_or_else(|err| {
                    warn!(target = "salesignal.pipeline", error = %err, "templates_unavailable");
                    Vec::new()
                });
            let message = notify::build(&templates, &tenant.notifications, facts);
            self.outbox.send(run_id, OutboxMessage::Notify(message))
        } else {
            TriggerOutcome::Skipped {
                reason: "notifications disabled".into(),
            }
        };

        let mut paused = 0;
        let automation = if !tenant.automation.enabled {
            TriggerOutcome::Skipped {
                reason: "automation disabled".into(),
            }
        } else {
            match automation::prepare_on_sale(
                &*self.store,
                &tenant.automation,
                facts.tenant_id,
                facts.instance_id,
                facts.phone,
            )
            .await
            {
                Ok(plan) if plan.starts.is_empty() => TriggerOutcome::Skipped {
                    reason: "no on_sale flows".into(),
                },
                Ok(plan) => {
                    paused = plan.paused_sessions.len();
                    let outcomes: Vec<TriggerOutcome> = plan
                        .starts
                        .into_iter()
                        .map(|start| self.outbox.send(run_id, OutboxMessage::StartFlow(start)))
                        .collect();
                    outcomes
                        .into_iter()
                        .find(|outcome| *outcome != TriggerOutcome::Queued)
                        .unwrap_or(TriggerOutcome::Queued)
                }
                Err(err) => TriggerOutcome::Failed {
                    error: err.to_string(),
                },
            }
        };

        let output = json!({
            "notification": notification,
            "automation": automation,
            "paused_sessions": paused,
        });
        StageOutcome::ok((notification, automation), output)
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        limit: Duration,
        log: &mut PipelineRunLog,
        fut: Fut,
    ) -> Option<T>
    where
        Fut: Future<Output = StageOutcome<T>>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(limit, fut).await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        match result {
            Ok(outcome) => {
                if let Some(error) = &outcome.error {
                    log.push_error(name, error);
                }
                log.stages
                    .push(StageReport::new(name, outcome.status, elapsed_ms, outcome.output));
                Some(outcome.value)
            }
            Err(_) => {
                let error = format!("timed out after {}ms", limit.as_millis());
                warn!(target = "salesignal.pipeline", stage = name, "stage_timed_out");
                log.push_error(name, &error);
                log.stages.push(StageReport::new(
                    name,
                    StageStatus::Failed,
                    elapsed_ms,
                    json!({ "error": error }),
                ));
                None
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub status: StageStatus,
    pub error: Option<String>,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn ok(value: T, output: Value) -> Self {
        Self {
            value,
            status: StageStatus::Ok,
            error: None,
            output,
        }
    }

    fn skipped(value: T, output: Value) -> Self {
        Self {
            value,
            status: StageStatus::Skipped,
            error: None,
            output,
        }
    }

    fn failed(value: T, error: String, output: Value) -> Self {
        Self {
            value,
            status: StageStatus::Failed,
            error: Some(error),
            output,
        }
    }
}
