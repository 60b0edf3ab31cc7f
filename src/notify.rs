use crate::config::NotificationPreferences;
use crate::store::NotificationTemplate;
use rand::seq::IndexedRandom;
use serde::Serialize;

const DEFAULT_TITLE: &str = "Venda aprovada";
const DEFAULT_BODY: &str = "Pagamento de {value} confirmado para {phone}.";
const HIDDEN_VALUE: &str = "R$ ***";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub tenant_id: String,
    pub instance_id: String,
    pub phone: String,
    pub title: String,
    pub body: String,
}

pub struct SaleFacts<'a> {
    pub tenant_id: &'a str,
    pub instance_id: &'a str,
    pub phone: &'a str,
    pub value: f64,
}

/// `R$ 1.234,56`
pub fn format_brl(value: f64) -> String {
    let cents = (value * 100.0).round() as i64;
    let (sign, cents) = if cents < 0 { ("-", -cents) } else { ("", cents) };
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (idx, ch) in whole.chars().enumerate() {
        if idx > 0 && (whole.len() - idx) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    format!("{sign}R$ {grouped},{:02}", cents % 100)
}

fn fill(text: &str, value: &str, facts: &SaleFacts<'_>) -> String {
    text.replace("{value}", value)
        .replace("{phone}", facts.phone)
        .replace("{instance}", facts.instance_id)
}

pub fn render(
    template: &NotificationTemplate,
    prefs: &NotificationPreferences,
    facts: &SaleFacts<'_>,
) -> Notification {
    let value = if prefs.hide_values {
        HIDDEN_VALUE.to_string()
    } else {
        format_brl(facts.value)
    };
    Notification {
        tenant_id: facts.tenant_id.to_string(),
        instance_id: facts.instance_id.to_string(),
        phone: facts.phone.to_string(),
        title: fill(&template.title, &value, facts),
        body: fill(&template.body, &value, facts),
    }
}

/// Picks one active template at random, falling back to the built-in one.
pub fn build(
    templates: &[NotificationTemplate],
    prefs: &NotificationPreferences,
    facts: &SaleFacts<'_>,
) -> Notification {
    let active: Vec<&NotificationTemplate> = templates.iter().filter(|t| t.active).collect();
    match active.choose(&mut rand::rng()) {
        Some(template) => render(template, prefs, facts),
        None => render(
            &NotificationTemplate {
                title: DEFAULT_TITLE.into(),
                body: DEFAULT_BODY.into(),
                active: true,
            },
            prefs,
            facts,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> SaleFacts<'static> {
        SaleFacts {
            tenant_id: "t-1",
            instance_id: "loja-centro",
            phone: "5511999990000",
            value: 1234.56,
        }
    }

    #[test]
    fn brl_formatting_groups_thousands() {
        assert_eq!(format_brl(1234.56), "R$ 1.234,56");
        assert_eq!(format_brl(97.0), "R$ 97,00");
        assert_eq!(format_brl(1_000_000.0), "R$ 1.000.000,00");
        assert_eq!(format_brl(0.5), "R$ 0,50");
    }

    #[test]
    fn placeholders_are_substituted() {
        let template = NotificationTemplate {
            title: "Nova venda {value}".into(),
            body: "{phone} pagou via {instance}".into(),
            active: true,
        };
        let out = render(&template, &NotificationPreferences::default(), &facts());
        assert_eq!(out.title, "Nova venda R$ 1.234,56");
        assert_eq!(out.body, "5511999990000 pagou via loja-centro");
    }

    #[test]
    fn hidden_values_are_redacted_before_substitution() {
        let prefs = NotificationPreferences {
            enabled: true,
            hide_values: true,
        };
        let out = build(&[], &prefs, &facts());
        assert_eq!(out.title, DEFAULT_TITLE);
        assert!(out.body.contains("R$ ***"));
        assert!(!out.body.contains("1.234"));
    }

    #[test]
    fn inactive_templates_are_never_picked() {
        let templates = vec![
            NotificationTemplate {
                title: "off".into(),
                body: "off".into(),
                active: false,
            },
            NotificationTemplate {
                title: "on".into(),
                body: "{value}".into(),
                active: true,
            },
        ];
        for _ in 0..10 {
            let out = build(&templates, &NotificationPreferences::default(), &facts());
            assert_eq!(out.title, "on");
        }
    }
}
