use crate::models::{AdContext, AttachmentDescriptor, IncomingEvent, MediaKind, WebhookPayload};
use crate::pipeline::PipelineError;
use reqwest::Url;

const MESSAGE_EVENTS: &[&str] = &["messages.upsert", "messages_upsert"];

#[derive(Debug, PartialEq)]
pub enum Intake {
    Process(IncomingEvent),
    Ignore(&'static str),
}

/// Digits of a WhatsApp JID, e.g. `5511999990000@s.whatsapp.net` -> `5511999990000`.
pub fn normalize_phone(jid: &str) -> String {
    let user = jid.split(['@', ':']).next().unwrap_or_default();
    user.chars().filter(char::is_ascii_digit).collect()
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn click_id(source_url: Option<&str>) -> Option<String> {
    let url = Url::parse(source_url?.trim()).ok()?;
    url.query_pairs()
        .find(|(key, value)| key == "fbclid" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn mime_from_file_name(descriptor: &AttachmentDescriptor) -> Option<String> {
    let name = descriptor.file_name.as_deref()?.to_lowercase();
    let mime = match name.rsplit_once('.')?.1 {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Converts the gateway envelope into a pipeline event. Anything that is not an
/// incoming image or document is ignored; a message without instance or sender
/// is rejected.
pub fn intake(tenant_id: &str, payload: WebhookPayload) -> Result<Intake, PipelineError> {
    let event = payload.event.trim().to_lowercase();
    if !MESSAGE_EVENTS.contains(&event.as_str()) {
        return Ok(Intake::Ignore("not_a_message_event"));
    }
    let Some(data) = payload.data else {
        return Ok(Intake::Ignore("empty_message"));
    };
    if data.key.from_me {
        return Ok(Intake::Ignore("outgoing_message"));
    }
    let content = data.message.unwrap_or_default();
    let (media_kind, descriptor) = match (content.image_message, content.document_message) {
        (Some(image), _) => (MediaKind::Image, image),
        (None, Some(document)) => (MediaKind::Document, document),
        (None, None) => return Ok(Intake::Ignore("no_attachment")),
    };

    let instance_id = non_empty(payload.instance.as_ref())
        .ok_or_else(|| PipelineError::invalid_input("intake", "missing instance"))?;
    let sender_phone = data
        .key
        .remote_jid
        .as_deref()
        .filter(|jid| !jid.ends_with("@g.us"))
        .map(normalize_phone)
        .filter(|phone| !phone.is_empty())
        .ok_or_else(|| PipelineError::invalid_input("intake", "missing sender"))?;

    let context = data.context_info.and_then(|info| {
        let reply = info.external_ad_reply.unwrap_or_default();
        let source_url = non_empty(reply.source_url.as_ref());
        let context = AdContext {
            fbclid: click_id(source_url.as_deref()),
            source_url,
            source_id: non_empty(reply.source_id.as_ref()),
            correlation_id: non_empty(reply.ctwa_clid.as_ref().or(info.ctwa_clid.as_ref())),
        };
        (context != AdContext::default()).then_some(context)
    });

    Ok(Intake::Process(IncomingEvent {
        tenant_id: tenant_id.to_string(),
        instance_id,
        message_id: data.key.id,
        sender_phone,
        media_kind,
        mime_type: descriptor.mimetype.clone().or_else(|| mime_from_file_name(&descriptor)),
        outgoing: false,
        context,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(value).unwrap()
    }

    fn image_delivery() -> serde_json::Value {
        json!({
            "event": "messages.upsert",
            "instance": "loja-centro",
            "data": {
                "key": {"id": "3EB0A1", "remoteJid": "5511999990000@s.whatsapp.net", "fromMe": false},
                "message": {"imageMessage": {"mimetype": "image/jpeg"}},
                "contextInfo": {
                    "externalAdReply": {
                        "sourceUrl": "https://fb.me/3xAmPl3",
                        "sourceId": "120210000000000",
                        "ctwaClid": "ARAkLmN0pQrStUvWxYz0"
                    }
                }
            }
        })
    }

    #[test]
    fn image_message_becomes_event_with_ad_context() {
        let Intake::Process(event) = intake("t-1", payload(image_delivery())).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.instance_id, "loja-centro");
        assert_eq!(event.sender_phone, "5511999990000");
        assert_eq!(event.media_kind, MediaKind::Image);
        assert_eq!(event.mime_type.as_deref(), Some("image/jpeg"));
        let context = event.context.unwrap();
        assert_eq!(context.source_url.as_deref(), Some("https://fb.me/3xAmPl3"));
        assert_eq!(
            context.correlation_id.as_deref(),
            Some("ARAkLmN0pQrStUvWxYz0")
        );
        assert!(context.fbclid.is_none());
    }

    #[test]
    fn landing_url_click_id_is_kept() {
        let mut delivery = image_delivery();
        delivery["data"]["contextInfo"]["externalAdReply"]["sourceUrl"] =
            json!("https://loja.example/oferta?utm_source=fb&fbclid=IwAR0abcDEF");
        let Intake::Process(event) = intake("t-1", payload(delivery)).unwrap() else {
            panic!("expected event");
        };
        let context = event.context.unwrap();
        assert_eq!(context.fbclid.as_deref(), Some("IwAR0abcDEF"));
        assert_eq!(
            context.correlation_id.as_deref(),
            Some("ARAkLmN0pQrStUvWxYz0")
        );
    }

    #[test]
    fn outgoing_and_non_message_events_are_ignored() {
        let mut outgoing = image_delivery();
        outgoing["data"]["key"]["fromMe"] = json!(true);
        assert_eq!(
            intake("t-1", payload(outgoing)).unwrap(),
            Intake::Ignore("outgoing_message")
        );
        assert_eq!(
            intake("t-1", payload(json!({"event": "connection.update"}))).unwrap(),
            Intake::Ignore("not_a_message_event")
        );
        let mut text_only = image_delivery();
        text_only["data"]["message"] = json!({"conversation": "oi"});
        assert_eq!(
            intake("t-1", payload(text_only)).unwrap(),
            Intake::Ignore("no_attachment")
        );
    }

    #[test]
    fn upper_case_event_names_are_accepted() {
        let mut delivery = image_delivery();
        delivery["event"] = json!("MESSAGES_UPSERT");
        assert!(matches!(
            intake("t-1", payload(delivery)).unwrap(),
            Intake::Process(_)
        ));
    }

    #[test]
    fn missing_instance_is_invalid_input() {
        let mut delivery = image_delivery();
        delivery["instance"] = json!(null);
        let err = intake("t-1", payload(delivery)).unwrap_err();
        assert_eq!(err.stage(), "intake");
    }

    #[test]
    fn document_without_mimetype_falls_back_to_file_extension() {
        let mut delivery = image_delivery();
        delivery["data"]["message"] = json!({"documentMessage": {"fileName": "Comprovante.PDF"}});
        let Intake::Process(event) = intake("t-1", payload(delivery)).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.media_kind, MediaKind::Document);
        assert_eq!(event.mime_type.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn jid_normalization() {
        assert_eq!(normalize_phone("5511999990000@s.whatsapp.net"), "5511999990000");
        assert_eq!(normalize_phone("5511999990000:12@s.whatsapp.net"), "5511999990000");
        assert_eq!(normalize_phone("+55 11 99999-0000"), "5511999990000");
    }
}
