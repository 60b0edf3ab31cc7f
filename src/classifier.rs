use crate::config::TenantConfig;
use crate::gateway::MediaPayload;
use crate::llm::{ModelRole, ProofModel};
use crate::models::{AmountSource, ClassificationResult, MediaKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

const CLASSIFY_PROMPT: &str = r#"
You are a fraud-aware payment auditor for Brazilian PIX transfers. Inspect the attached image or
document and decide whether it is a proof of a completed PIX payment (comprovante). Respond with a
single JSON object and nothing else:
{"is_payment_proof": bool, "confidence": 0-100, "amount": number|null, "amount_text": string|null,
 "recipient_name": string|null, "recipient_tax_id": string|null}
`amount` is the transferred total in BRL using a dot as decimal separator. `amount_text` is the
amount exactly as printed. `recipient_*` describe who RECEIVED the money; keep masked digits as shown.
"#;

const VALUE_ONLY_PROMPT: &str = "Return only the total amount transferred in this PIX receipt as a plain number such as 1234.56. No currency symbol, no words. Return 0 if no amount is visible.";

pub const MAX_PLAUSIBLE_AMOUNT: f64 = 1_000_000.0;

static NUMBER_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d.,]*\d|\d").expect("number run regex"));
static CURRENCY_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)R\$\s*(\d[\d.,]*\d|\d)|\b(\d{1,3}(?:\.\d{3})*,\d{2})\b")
        .expect("currency regex")
});

/// Returns the reason a media kind is filtered out for this tenant, if any.
pub fn filter_reason(kind: MediaKind, config: &TenantConfig) -> Option<String> {
    match kind {
        MediaKind::Image if !config.accept_images => Some("images_disabled".into()),
        MediaKind::Document if !config.accept_documents => Some("documents_disabled".into()),
        _ => None,
    }
}

pub fn model_role(media: &MediaPayload) -> ModelRole {
    if media.is_pdf() {
        ModelRole::DocumentProof
    } else {
        ModelRole::ImageProof
    }
}

/// Runs the vision model over the attachment. Never fails: transport or parse
/// problems come back as a non-proof result carrying the reason.
pub async fn classify_proof(
    model: &dyn ProofModel,
    media: &MediaPayload,
    config: &TenantConfig,
) -> ClassificationResult {
    let role = model_role(media);
    let reply = match model.classify(media, CLASSIFY_PROMPT, role).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(target = "salesignal.classifier", error = %err, "classification_call_failed");
            return ClassificationResult::not_a_proof(format!("model_error: {err}"));
        }
    };

    let mut result = parse_classification(&reply.text);
    result.model = Some(reply.model);

    if result.is_payment_proof && result.amount.is_none() && config.value_extraction_followup {
        match model
            .classify(media, VALUE_ONLY_PROMPT, ModelRole::ValueExtraction)
            .await
        {
            Ok(followup) => {
                if let Some(amount) = parse_followup_amount(&followup.text) {
                    result.amount = Some(amount);
                    result.amount_source = Some(AmountSource::FollowupModel);
                }
            }
            Err(err) => {
                debug!(target = "salesignal.classifier", error = %err, "value_followup_failed");
            }
        }
    }
    result
}

/// Parses model output into a result, running the offline amount strategies.
pub fn parse_classification(raw: &str) -> ClassificationResult {
    let Some(Value::Object(fields)) = extract_first_json_object(raw) else {
        return ClassificationResult::not_a_proof("malformed_model_output: no json object");
    };

    let Some(is_proof) = field(&fields, &["is_payment_proof", "is_proof", "comprovante"])
        .and_then(as_bool)
    else {
        return ClassificationResult::not_a_proof("malformed_model_output: missing is_payment_proof");
    };
    let Some(confidence) = field(&fields, &["confidence", "confianca"]).and_then(as_confidence)
    else {
        return ClassificationResult::not_a_proof("malformed_model_output: missing confidence");
    };

    let mut result = ClassificationResult {
        is_payment_proof: is_proof,
        confidence,
        amount_raw_text: field(&fields, &["amount_text", "valor_texto"])
            .and_then(as_text),
        recipient_name: field(&fields, &["recipient_name", "recebedor"]).and_then(as_text),
        recipient_tax_id: field(&fields, &["recipient_tax_id", "recipient_document", "cpf_cnpj"])
            .and_then(as_text),
        ..ClassificationResult::default()
    };

    let ctx = AmountContext {
        fields: &fields,
        raw,
    };
    if let Some((source, amount)) = OFFLINE_AMOUNT_STRATEGIES
        .iter()
        .find_map(|(source, strategy)| strategy(&ctx).map(|amount| (*source, amount)))
    {
        result.amount = Some(amount);
        result.amount_source = Some(source);
    }
    result
}

struct AmountContext<'a> {
    fields: &'a Map<String, Value>,
    raw: &'a str,
}

type AmountStrategy = fn(&AmountContext<'_>) -> Option<f64>;

const OFFLINE_AMOUNT_STRATEGIES: &[(AmountSource, AmountStrategy)] = &[
    (AmountSource::StructuredField, amount_from_structured_field),
    (AmountSource::AmountText, amount_from_amount_text),
    (AmountSource::RawTextScan, amount_from_raw_scan),
];

fn amount_from_structured_field(ctx: &AmountContext<'_>) -> Option<f64> {
    let value = field(ctx.fields, &["amount", "valor"])?;
    let amount = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().or_else(|| parse_brl_amount(s)),
        _ => None,
    }?;
    plausible(amount)
}

fn amount_from_amount_text(ctx: &AmountContext<'_>) -> Option<f64> {
    let text = field(ctx.fields, &["amount_text", "valor_texto"]).and_then(as_text)?;
    parse_brl_amount(&text).and_then(plausible)
}

fn amount_from_raw_scan(ctx: &AmountContext<'_>) -> Option<f64> {
    scan_currency_amounts(ctx.raw)
        .into_iter()
        .filter_map(plausible)
        .fold(None, |best: Option<f64>, value| {
            Some(best.map_or(value, |current| current.max(value)))
        })
}

fn parse_followup_amount(text: &str) -> Option<f64> {
    let trimmed = text.trim().trim_matches('`').trim();
    trimmed
        .parse::<f64>()
        .ok()
        .or_else(|| parse_brl_amount(trimmed))
        .and_then(plausible)
}

fn plausible(amount: f64) -> Option<f64> {
    (amount.is_finite() && amount > 0.0 && amount < MAX_PLAUSIBLE_AMOUNT).then(|| round2(amount))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parses a Brazilian-notation money string: `"R$ 1.234,56"` → `1234.56`.
pub fn parse_brl_amount(text: &str) -> Option<f64> {
    let run = NUMBER_RUN.find(text)?.as_str();
    normalize_separators(run)?.parse::<f64>().ok().map(round2)
}

fn normalize_separators(number: &str) -> Option<String> {
    let last_comma = number.rfind(',');
    let last_dot = number.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(comma), Some(dot)) if comma > dot => number.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => number.replace(',', ""),
        (Some(comma), None) => {
            let decimals = number.len() - comma - 1;
            if number.matches(',').count() == 1 && decimals <= 2 {
                number.replace(',', ".")
            } else {
                number.replace(',', "")
            }
        }
        (None, Some(dot)) => {
            let decimals = number.len() - dot - 1;
            if number.matches('.').count() > 1 || decimals == 3 {
                number.replace('.', "")
            } else {
                number.to_string()
            }
        }
        (None, None) => number.to_string(),
    };
    (!normalized.is_empty() && normalized.chars().any(|c| c.is_ascii_digit()))
        .then_some(normalized)
}

/// Every currency-looking value in free text, in order of appearance.
pub fn scan_currency_amounts(raw: &str) -> Vec<f64> {
    CURRENCY_LIKE
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .filter_map(|m| parse_brl_amount(m.as_str()))
        .collect()
}

/// Finds the first balanced `{...}` block that parses as JSON, skipping prose
/// and markdown fences around it.
pub fn extract_first_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open)
            && let Ok(value) = serde_json::from_str::<Value>(&text[open..=close])
            && value.is_object()
        {
            return Some(value);
        }
        start = open + 1;
    }
    None
}

fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, byte) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn field<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| fields.get(*key))
        .filter(|value| !value.is_null())
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "sim" => Some(true),
            "false" | "no" | "nao" | "não" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_confidence(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    let scaled = if raw > 0.0 && raw < 1.0 { raw * 100.0 } else { raw };
    Some(scaled.round().clamp(0.0, 100.0) as u8)
}

fn as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}
