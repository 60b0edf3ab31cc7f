use crate::config::AutomationPolicy;
use crate::store::{AutomationFlow, FlowStore, StoreError};
use serde::Serialize;
use tracing::{info, warn};

pub const ON_SALE_TRIGGER: &str = "on_sale";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FlowStart {
    pub tenant_id: String,
    pub instance_id: String,
    pub flow_id: String,
    pub phone: String,
    pub start_node_id: String,
}

#[derive(Debug, Default)]
pub struct SalePlan {
    pub starts: Vec<FlowStart>,
    pub paused_sessions: Vec<String>,
}

fn assigned_to(flow: &AutomationFlow, instance_id: &str) -> bool {
    flow.instance_ids.is_empty() || flow.instance_ids.iter().any(|id| id == instance_id)
}

/// Pauses competing sessions for the contact (per tenant policy) and returns
/// the fresh sessions to start for every matching `on_sale` flow.
pub async fn prepare_on_sale(
    flows: &dyn FlowStore,
    policy: &AutomationPolicy,
    tenant_id: &str,
    instance_id: &str,
    phone: &str,
) -> Result<SalePlan, StoreError> {
    let matching: Vec<AutomationFlow> = flows
        .flows_by_trigger(tenant_id, ON_SALE_TRIGGER)
        .await?
        .into_iter()
        .filter(|flow| flow.active && assigned_to(flow, instance_id))
        .collect();
    if matching.is_empty() {
        return Ok(SalePlan::default());
    }

    let mut plan = SalePlan::default();
    if policy.pause_competing_sessions {
        for session in flows.running_sessions(tenant_id, phone).await? {
            match flows.pause_session(&session.id).await {
                Ok(()) => plan.paused_sessions.push(session.id),
                Err(err) => {
                    warn!(target = "salesignal.automation", session = %session.id, error = %err, "session_pause_failed");
                }
            }
        }
    }

    plan.starts = matching
        .into_iter()
        .map(|flow| FlowStart {
            tenant_id: tenant_id.to_string(),
            instance_id: instance_id.to_string(),
            flow_id: flow.id,
            phone: phone.to_string(),
            start_node_id: flow.start_node_id,
        })
        .collect();
    info!(
        target = "salesignal.automation",
        tenant = tenant_id,
        flows = plan.starts.len(),
        paused = plan.paused_sessions.len(),
        "on_sale_flows_prepared"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FlowSession, MemoryStore, SessionStatus};

    fn flow(id: &str, instances: &[&str]) -> AutomationFlow {
        AutomationFlow {
            id: id.into(),
            tenant_id: "t-1".into(),
            trigger_type: ON_SALE_TRIGGER.into(),
            instance_ids: instances.iter().map(|s| s.to_string()).collect(),
            start_node_id: format!("{id}-start"),
            active: true,
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_flow(flow("thanks", &["inst-1"])).await;
        store.add_flow(flow("upsell", &[])).await;
        store.add_flow(flow("other-store", &["inst-9"])).await;
        store
            .add_session(FlowSession {
                id: "sess-1".into(),
                tenant_id: "t-1".into(),
                flow_id: "followup".into(),
                phone: "5511999990000".into(),
                status: SessionStatus::Running,
            })
            .await;
        store
    }

    #[tokio::test]
    async fn flows_are_filtered_by_instance_and_competitors_paused() {
        let store = seeded().await;
        let plan = prepare_on_sale(
            &store,
            &AutomationPolicy::default(),
            "t-1",
            "inst-1",
            "5511999990000",
        )
        .await
        .unwrap();
        let ids: Vec<&str> = plan.starts.iter().map(|s| s.flow_id.as_str()).collect();
        assert_eq!(ids, vec!["thanks", "upsell"]);
        assert_eq!(plan.starts[0].start_node_id, "thanks-start");
        assert_eq!(plan.paused_sessions, vec!["sess-1".to_string()]);
        assert_eq!(store.sessions().await[0].status, SessionStatus::Paused);
        assert_eq!(store.cancelled_timers().await, vec!["sess-1".to_string()]);
    }

    #[tokio::test]
    async fn policy_can_leave_running_sessions_alone() {
        let store = seeded().await;
        let policy = AutomationPolicy {
            enabled: true,
            pause_competing_sessions: false,
        };
        let plan = prepare_on_sale(&store, &policy, "t-1", "inst-1", "5511999990000")
            .await
            .unwrap();
        assert_eq!(plan.starts.len(), 2);
        assert!(plan.paused_sessions.is_empty());
        assert_eq!(store.sessions().await[0].status, SessionStatus::Running);
    }
}
