use crate::config::ChargeConfig;
use crate::gateway::{ChatGateway, PayeeDetails};
use crate::models::ChargeOutcome;
use tracing::{info, warn};

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Everything a payment request needs, or the reason it cannot be sent.
pub fn prepare(config: &ChargeConfig, classified_amount: Option<f64>) -> Result<(f64, PayeeDetails), String> {
    let amount = config
        .amount
        .or(classified_amount)
        .filter(|amount| *amount > 0.0)
        .ok_or_else(|| "no charge amount configured or extracted".to_string())?;
    let pix_key = present(&config.pix_key).ok_or_else(|| "PIX key not configured".to_string())?;
    let receiver_name =
        present(&config.receiver_name).ok_or_else(|| "receiver name not configured".to_string())?;
    Ok((
        amount,
        PayeeDetails {
            pix_key,
            receiver_name,
            description: present(&config.description),
        },
    ))
}

pub async fn request_charge(
    gateway: &dyn ChatGateway,
    config: &ChargeConfig,
    instance_id: &str,
    phone: &str,
    classified_amount: Option<f64>,
) -> ChargeOutcome {
    if !config.enabled {
        return ChargeOutcome::Skipped {
            reason: "charging disabled".into(),
        };
    }
    let (amount, payee) = match prepare(config, classified_amount) {
        Ok(ready) => ready,
        Err(reason) => {
            info!(target = "salesignal.charge", instance = instance_id, reason = %reason, "charge_skipped");
            return ChargeOutcome::Skipped { reason };
        }
    };
    match gateway
        .request_payment(instance_id, phone, amount, &payee)
        .await
    {
        Ok(()) => ChargeOutcome::Sent { amount },
        Err(err) => {
            warn!(target = "salesignal.charge", instance = instance_id, error = %err, "charge_request_failed");
            ChargeOutcome::Failed {
                error: err.to_string(),
            }
        }
    }
}
