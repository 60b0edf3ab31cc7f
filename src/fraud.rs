use crate::models::{ClassificationResult, FraudCheck, RecipientRegistryEntry};

const MIN_TAX_ID_DIGITS: usize = 6;
const MIN_NAME_TOKEN_LEN: usize = 3;

/// Checks the extracted payee against the tenant's trusted recipients.
/// Matching is lenient since the input is OCR/LLM-derived and often masked.
pub fn verify(
    classification: &ClassificationResult,
    registry: &[RecipientRegistryEntry],
) -> FraudCheck {
    if registry.is_empty() {
        return FraudCheck::Skipped;
    }

    let name = classification.recipient_name.as_deref();
    let tax_id = classification.recipient_tax_id.as_deref();
    let matched = registry.iter().find(|entry| {
        name.is_some_and(|name| name_matches(name, &entry.name))
            || tax_id
                .zip(entry.tax_id.as_deref())
                .is_some_and(|(found, known)| tax_id_matches(found, known))
    });

    match matched {
        Some(entry) => FraudCheck::Matched {
            name: entry.name.clone(),
        },
        None => FraudCheck::Mismatch {
            recipient_name: classification.recipient_name.clone(),
            recipient_tax_id: classification.recipient_tax_id.clone(),
        },
    }
}

pub fn name_matches(extracted: &str, registered: &str) -> bool {
    let extracted = fold(extracted);
    let registered = fold(registered);
    if extracted.is_empty() || registered.is_empty() {
        return false;
    }
    if extracted.contains(&registered) || registered.contains(&extracted) {
        return true;
    }
    extracted
        .split(' ')
        .filter(|token| token.chars().count() >= MIN_NAME_TOKEN_LEN)
        .any(|token| registered.contains(token))
}

/// Compares the visible digit runs of the extracted ID against the registered
/// digits. A mask character ends a run, formatting punctuation does not, so
/// `***.123.456-**` matches `987.123.456-00` but `123.***.456-**` does not.
pub fn tax_id_matches(extracted: &str, registered: &str) -> bool {
    let known = digits(registered);
    if known.len() < MIN_TAX_ID_DIGITS {
        return false;
    }
    visible_runs(extracted)
        .iter()
        .filter(|run| run.len() >= MIN_TAX_ID_DIGITS)
        .any(|run| known.contains(run.as_str()) || run.contains(&known))
}

fn visible_runs(value: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if matches!(c, '.' | '-' | '/' | ' ') {
            continue;
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn fold(value: &str) -> String {
    let mapped: String = value
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            c if c.is_alphanumeric() => c,
            _ => ' ',
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Vec<RecipientRegistryEntry> {
        vec![RecipientRegistryEntry {
            name: "João da Silva Souza ME".into(),
            tax_id: Some("987.123.456-00".into()),
        }]
    }

    fn extracted(name: Option<&str>, tax: Option<&str>) -> ClassificationResult {
        ClassificationResult {
            is_payment_proof: true,
            confidence: 95,
            recipient_name: name.map(str::to_string),
            recipient_tax_id: tax.map(str::to_string),
            ..ClassificationResult::default()
        }
    }

    #[test]
    fn empty_registry_skips_verification() {
        assert_eq!(verify(&extracted(None, None), &[]), FraudCheck::Skipped);
    }

    #[test]
    fn name_tokens_and_accents_match_leniently() {
        assert!(name_matches("JOAO S SILVA", "João da Silva Souza ME"));
        assert!(name_matches("joão da silva souza me ltda", "João da Silva Souza ME"));
        assert!(!name_matches("Ana Lu", "João da Silva Souza ME"));
    }

    #[test]
    fn masked_tax_ids_compare_visible_digits() {
        assert!(tax_id_matches("***.123.456-**", "987.123.456-00"));
        assert!(tax_id_matches("98712345600", "987.123.456-00"));
        assert!(!tax_id_matches("***.123.4**-**", "987.123.456-00"));
        assert!(!tax_id_matches("***.555.666-**", "987.123.456-00"));
        assert!(tax_id_matches("12.345.678/0001-**", "12.345.678/0001-90"));
    }

    #[test]
    fn mask_between_digit_groups_does_not_join_them() {
        assert!(!tax_id_matches("123.***.456-**", "000.123.456-78"));
        assert!(!tax_id_matches("123.***.456-**", "123.999.456-00"));
    }

    #[test]
    fn unknown_payee_is_a_mismatch() {
        let check = verify(
            &extracted(Some("Maria Pereira"), Some("***.555.666-**")),
            &registry(),
        );
        assert!(matches!(check, FraudCheck::Mismatch { .. }));

        let check = verify(&extracted(None, Some("***.123.456-**")), &registry());
        assert_eq!(
            check,
            FraudCheck::Matched {
                name: "João da Silva Souza ME".into()
            }
        );
    }
}
