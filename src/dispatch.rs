use crate::ads::{AdPlatform, AdPlatformError, ConversionEvent, EventMode, PurchaseDetails};
use crate::metrics;
use crate::models::{DispatchAttempt, DispatchPath};
use crate::store::{AdAccount, RegisteredPixel};
use futures_util::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream,
};
use std::{future::Future, time::Duration};
use tracing::{debug, info, warn};

async fn bounded<T, Fut>(limit: Duration, fut: Fut) -> Result<T, AdPlatformError>
where
    Fut: Future<Output = Result<T, AdPlatformError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdPlatformError::new(format!(
            "timed out after {}s",
            limit.as_secs()
        ))),
    }
}

fn failed(path: DispatchPath, target: &str, pixel: Option<&str>, err: &AdPlatformError) -> DispatchAttempt {
    DispatchAttempt {
        path,
        target_id: target.to_string(),
        pixel_id: pixel.map(str::to_string),
        success: false,
        events_received: None,
        external_error_code: err.subcode.or(err.code),
        error_message: Some(err.message.clone()),
    }
}

/// Sends the purchase to every conversion-enabled ad account, one attempt per
/// account, at most `concurrency` in flight. Results keep account order.
pub async fn report_to_all(
    platform: &dyn AdPlatform,
    accounts: &[AdAccount],
    details: &PurchaseDetails<'_>,
    concurrency: usize,
    call_timeout: Duration,
) -> Vec<DispatchAttempt> {
    let event = ConversionEvent::purchase(details, EventMode::Website);
    let calls: Vec<BoxFuture<'_, DispatchAttempt>> = accounts
        .iter()
        .filter(|account| account.conversions_enabled)
        .map(|account| report_account(platform, account, &event, call_timeout).boxed())
        .collect();
    let attempts: Vec<DispatchAttempt> = stream::iter(calls)
        .buffered(concurrency.max(1))
        .collect()
        .await;

    for attempt in &attempts {
        metrics::dispatch_result("report_all", attempt.success);
    }
    attempts
}

async fn report_account(
    platform: &dyn AdPlatform,
    account: &AdAccount,
    event: &ConversionEvent,
    call_timeout: Duration,
) -> DispatchAttempt {
    let path = DispatchPath::ReportAll;
    let pixel_id = match account.selected_pixel_id.clone() {
        Some(id) => id,
        None => {
            match bounded(
                call_timeout,
                platform.list_pixels(&account.id, &account.access_token),
            )
            .await
            {
                Ok(pixels) => match pixels.into_iter().next() {
                    Some(pixel) => pixel.id,
                    None => {
                        warn!(target = "salesignal.dispatch", account = %account.id, "no_pixel_for_account");
                        return failed(path, &account.id, None, &AdPlatformError::new("no pixel configured"));
                    }
                },
                Err(err) => {
                    warn!(target = "salesignal.dispatch", account = %account.id, error = %err, "pixel_lookup_failed");
                    return failed(path, &account.id, None, &err);
                }
            }
        }
    };

    match bounded(
        call_timeout,
        platform.send_conversion_event(&pixel_id, &account.access_token, event),
    )
    .await
    {
        Ok(receipt) => {
            info!(target = "salesignal.dispatch", account = %account.id, pixel = %pixel_id, events = receipt.events_received, "conversion_reported");
            DispatchAttempt {
                path,
                target_id: account.id.clone(),
                pixel_id: Some(pixel_id),
                success: true,
                events_received: Some(receipt.events_received),
                external_error_code: None,
                error_message: None,
            }
        }
        Err(err) => {
            warn!(target = "salesignal.dispatch", account = %account.id, pixel = %pixel_id, error = %err, "conversion_report_failed");
            failed(path, &account.id, Some(&pixel_id), &err)
        }
    }
}

fn event_mode(pixel: &RegisteredPixel, details: &PurchaseDetails<'_>) -> EventMode {
    let same_page = match (pixel.page_id.as_deref(), details.page_id) {
        (Some(pixel_page), Some(origin)) => pixel_page == origin,
        _ => false,
    };
    if same_page && details.correlation_id.is_some() {
        EventMode::BusinessMessaging
    } else {
        EventMode::Website
    }
}

/// Tries registered pixels by ascending priority until one accepts the event.
/// Returns the accepting attempt, or the last rejection when none accepted.
pub async fn optimize_first_success(
    platform: &dyn AdPlatform,
    pixels: &[RegisteredPixel],
    details: &PurchaseDetails<'_>,
    call_timeout: Duration,
) -> Option<DispatchAttempt> {
    let mut ordered: Vec<&RegisteredPixel> = pixels.iter().collect();
    ordered.sort_by_key(|pixel| pixel.priority);

    let mut last = None;
    for pixel in ordered {
        let mode = event_mode(pixel, details);
        let event = ConversionEvent::purchase(details, mode);
        match bounded(
            call_timeout,
            platform.send_conversion_event(&pixel.pixel_id, &pixel.access_token, &event),
        )
        .await
        {
            Ok(receipt) => {
                info!(target = "salesignal.dispatch", pixel = %pixel.pixel_id, mode = ?mode, "optimization_event_accepted");
                metrics::dispatch_result("optimize", true);
                return Some(DispatchAttempt {
                    path: DispatchPath::Optimize,
                    target_id: pixel.pixel_id.clone(),
                    pixel_id: Some(pixel.pixel_id.clone()),
                    success: true,
                    events_received: Some(receipt.events_received),
                    external_error_code: None,
                    error_message: None,
                });
            }
            Err(err) => {
                if err.is_page_mismatch() {
                    debug!(target = "salesignal.dispatch", pixel = %pixel.pixel_id, error = %err, "pixel_page_mismatch");
                } else {
                    warn!(target = "salesignal.dispatch", pixel = %pixel.pixel_id, error = %err, "optimization_event_rejected");
                }
                last = Some(failed(
                    DispatchPath::Optimize,
                    &pixel.pixel_id,
                    Some(&pixel.pixel_id),
                    &err,
                ));
            }
        }
    }
    if last.is_some() {
        metrics::dispatch_result("optimize", false);
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAdPlatform;

    fn details() -> PurchaseDetails<'static> {
        PurchaseDetails {
            event_id: "run-1",
            phone: "5511999990000",
            value: 150.0,
            currency: "BRL",
            correlation_id: Some("ctwa-123"),
            page_id: Some("page-1"),
            fbclid: None,
        }
    }

    fn account(id: &str, pixel: Option<&str>) -> AdAccount {
        AdAccount {
            id: id.into(),
            access_token: format!("tok-{id}"),
            selected_pixel_id: pixel.map(str::to_string),
            conversions_enabled: true,
            selected: false,
        }
    }

    fn pixel(id: &str, priority: i32, page: Option<&str>) -> RegisteredPixel {
        RegisteredPixel {
            pixel_id: id.into(),
            access_token: "tok".into(),
            page_id: page.map(str::to_string),
            priority,
        }
    }

    #[tokio::test]
    async fn every_account_gets_an_attempt_even_after_failures() {
        let platform = FakeAdPlatform::default()
            .rejecting("px-a", AdPlatformError::new("Invalid OAuth access token"))
            .failing_pixel_lookup("acc-b", AdPlatformError::new("HTTP 500"))
            .with_pixels("acc-c", &["px-c"]);
        let accounts = vec![
            account("acc-a", Some("px-a")),
            account("acc-b", None),
            account("acc-c", None),
        ];
        let attempts =
            report_to_all(&platform, &accounts, &details(), 2, Duration::from_secs(5)).await;
        assert_eq!(attempts.len(), 3);
        let targets: Vec<&str> = attempts.iter().map(|a| a.target_id.as_str()).collect();
        assert_eq!(targets, vec!["acc-a", "acc-b", "acc-c"]);
        assert_eq!(
            attempts.iter().map(|a| a.success).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(attempts[2].pixel_id.as_deref(), Some("px-c"));
    }

    #[tokio::test]
    async fn report_all_payload_carries_correlation_id() {
        let platform = FakeAdPlatform::default();
        let attempts = report_to_all(
            &platform,
            &[account("acc-a", Some("px-a"))],
            &details(),
            1,
            Duration::from_secs(5),
        )
        .await;
        assert!(attempts[0].success);
        let (_, event) = &platform.events()[0];
        assert_eq!(event.user_data.ctwa_clid.as_deref(), Some("ctwa-123"));
        assert!(event.user_data.fbc.is_none());
    }

    #[tokio::test]
    async fn disabled_accounts_are_not_reported() {
        let platform = FakeAdPlatform::default();
        let mut disabled = account("acc-x", Some("px-x"));
        disabled.conversions_enabled = false;
        let attempts = report_to_all(
            &platform,
            &[disabled],
            &details(),
            4,
            Duration::from_secs(5),
        )
        .await;
        assert!(attempts.is_empty());
        assert!(platform.sent_pixels().is_empty());
    }

    #[tokio::test]
    async fn optimization_stops_at_first_accepting_pixel() {
        let mismatch = AdPlatformError {
            message: "Invalid parameter".into(),
            code: Some(100),
            subcode: Some(2_804_050),
        };
        let platform = FakeAdPlatform::default()
            .rejecting("px-1", mismatch.clone())
            .rejecting("px-2", mismatch);
        let pixels = vec![
            pixel("px-4", 4, None),
            pixel("px-2", 2, Some("page-2")),
            pixel("px-1", 1, Some("page-1")),
            pixel("px-3", 3, None),
        ];
        let attempt =
            optimize_first_success(&platform, &pixels, &details(), Duration::from_secs(5))
                .await
                .expect("attempt");
        assert!(attempt.success);
        assert_eq!(attempt.target_id, "px-3");
        assert_eq!(platform.sent_pixels(), vec!["px-1", "px-2", "px-3"]);

        let modes: Vec<String> = platform
            .events()
            .iter()
            .map(|(_, event)| event.action_source.clone())
            .collect();
        assert_eq!(modes, vec!["business_messaging", "website", "website"]);
    }

    #[tokio::test]
    async fn all_rejections_record_only_the_last_error() {
        let platform = FakeAdPlatform::default()
            .rejecting("px-1", AdPlatformError::new("first"))
            .rejecting("px-2", AdPlatformError::new("second"));
        let pixels = vec![pixel("px-1", 1, None), pixel("px-2", 2, None)];
        let attempt =
            optimize_first_success(&platform, &pixels, &details(), Duration::from_secs(5))
                .await
                .expect("attempt");
        assert!(!attempt.success);
        assert_eq!(attempt.error_message.as_deref(), Some("second"));
    }
}
