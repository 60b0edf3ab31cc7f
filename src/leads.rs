use crate::models::{AttributionMatch, Lead};
use crate::store::AdAccount;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Purchase {
    pub value: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct LeadUpdate {
    /// `None` when the contact was already credited; purchase fields stay put.
    pub purchase: Option<Purchase>,
    pub attribution: AttributionMatch,
    pub correlation_id: Option<String>,
    pub source_url: Option<String>,
}

/// The tenant's default reporting account, only when exactly one is selected.
pub fn sole_selected_account(accounts: &[AdAccount]) -> Option<&str> {
    let mut selected = accounts.iter().filter(|account| account.selected);
    match (selected.next(), selected.next()) {
        (Some(account), None) => Some(account.id.as_str()),
        _ => None,
    }
}

fn keep_first(slot: &mut Option<String>, candidate: Option<String>) {
    if slot.is_none() {
        *slot = candidate;
    }
}

/// Merges this run into the stored lead. Purchase fields are overwritten;
/// attribution fields are only filled while empty.
pub fn merge(
    existing: Option<Lead>,
    tenant_id: &str,
    phone: &str,
    update: LeadUpdate,
    default_account: Option<&str>,
) -> Lead {
    let now = Utc::now();
    let is_new = existing.is_none();
    let mut lead = existing.unwrap_or_else(|| Lead {
        tenant_id: tenant_id.to_string(),
        phone: phone.to_string(),
        first_contact_at: now,
        purchase_sent_at: None,
        purchase_value: 0.0,
        ad_id: None,
        ad_set_id: None,
        campaign_id: None,
        ad_account_id: None,
        page_id: None,
        correlation_id: None,
        source_url: None,
        updated_at: None,
    });

    if let Some(purchase) = update.purchase {
        lead.purchase_value = purchase.value;
        lead.purchase_sent_at = Some(purchase.at);
    }

    let found = update.attribution;
    let account = if is_new && found.ad_account_id.is_none() {
        default_account.map(str::to_string)
    } else {
        found.ad_account_id
    };
    keep_first(&mut lead.ad_id, found.ad_id);
    keep_first(&mut lead.ad_set_id, found.ad_set_id);
    keep_first(&mut lead.campaign_id, found.campaign_id);
    keep_first(&mut lead.ad_account_id, account);
    keep_first(&mut lead.page_id, found.page_id);
    keep_first(&mut lead.correlation_id, update.correlation_id);
    keep_first(&mut lead.source_url, update.source_url);
    lead.updated_at = Some(now);
    lead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttributionStrategyKind;

    fn attribution(campaign: &str) -> AttributionMatch {
        AttributionMatch {
            ad_id: Some(format!("ad-{campaign}")),
            ad_set_id: Some(format!("set-{campaign}")),
            campaign_id: Some(campaign.to_string()),
            ad_account_id: Some("acc-1".into()),
            page_id: None,
            strategy: Some(AttributionStrategyKind::PostIdentifier),
        }
    }

    fn purchase(value: f64) -> Option<Purchase> {
        Some(Purchase {
            value,
            at: Utc::now(),
        })
    }

    #[test]
    fn attribution_is_first_writer_wins() {
        let first = merge(
            None,
            "t-1",
            "5511999990000",
            LeadUpdate {
                purchase: purchase(50.0),
                attribution: attribution("camp-A"),
                ..LeadUpdate::default()
            },
            None,
        );
        let second = merge(
            Some(first.clone()),
            "t-1",
            "5511999990000",
            LeadUpdate {
                purchase: purchase(80.0),
                attribution: attribution("camp-B"),
                correlation_id: Some("ctwa-2".into()),
                ..LeadUpdate::default()
            },
            None,
        );
        assert_eq!(second.campaign_id.as_deref(), Some("camp-A"));
        assert_eq!(second.ad_id.as_deref(), Some("ad-camp-A"));
        assert_eq!(second.purchase_value, 80.0);
        assert_eq!(second.first_contact_at, first.first_contact_at);
        // empty slots still fill in
        assert_eq!(second.correlation_id.as_deref(), Some("ctwa-2"));
    }

    #[test]
    fn new_lead_defaults_to_sole_selected_account() {
        let accounts = vec![
            AdAccount {
                id: "acc-main".into(),
                access_token: "t".into(),
                selected_pixel_id: None,
                conversions_enabled: true,
                selected: true,
            },
            AdAccount {
                id: "acc-other".into(),
                access_token: "t".into(),
                selected_pixel_id: None,
                conversions_enabled: true,
                selected: false,
            },
        ];
        let lead = merge(
            None,
            "t-1",
            "5511999990000",
            LeadUpdate {
                purchase: purchase(10.0),
                ..LeadUpdate::default()
            },
            sole_selected_account(&accounts),
        );
        assert_eq!(lead.ad_account_id.as_deref(), Some("acc-main"));
        assert!(lead.campaign_id.is_none());
    }

    #[test]
    fn ambiguous_selection_has_no_default() {
        let account = |id: &str| AdAccount {
            id: id.into(),
            access_token: "t".into(),
            selected_pixel_id: None,
            conversions_enabled: true,
            selected: true,
        };
        assert_eq!(sole_selected_account(&[account("a"), account("b")]), None);
        assert_eq!(sole_selected_account(&[]), None);
    }

    #[test]
    fn missing_purchase_leaves_value_untouched() {
        let first = merge(
            None,
            "t-1",
            "5511999990000",
            LeadUpdate {
                purchase: purchase(120.0),
                ..LeadUpdate::default()
            },
            None,
        );
        let again = merge(Some(first), "t-1", "5511999990000", LeadUpdate::default(), None);
        assert_eq!(again.purchase_value, 120.0);
        assert!(again.purchase_sent_at.is_some());
    }
}
