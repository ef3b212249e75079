//! Evaluation of parsed expectation rules against the findings registry.

use crate::alert::{Alert, AlertPayload, StepRef};
use crate::expression::{ExpectRule, Quantifier, RuleKind};
use crate::registry::{FindingsRegistry, RegistryError};
use tracing::debug;

/// Returns the alert raised by `rule`, or `None` when the rule holds.
pub fn evaluate(
    rule: &ExpectRule,
    registry: &FindingsRegistry,
    step: &StepRef,
) -> Result<Option<Alert>, RegistryError> {
    let payload = match &rule.kind {
        RuleKind::Default {
            quantifier,
            new,
            subject,
        } => {
            let items = if *new {
                registry.get_added_items(subject)?
            } else {
                registry.get(subject)?.to_vec()
            };
            match quantifier {
                Quantifier::No if !items.is_empty() => Some(labelled("extra items", items)),
                Quantifier::Some if items.is_empty() => Some(AlertPayload::new()),
                _ => None,
            }
        }
        RuleKind::Membership {
            quantifier,
            list1,
            list2,
        } => {
            let comparison = registry.get_common_and_missing_items(list1, list2)?;
            match quantifier {
                Quantifier::No if !comparison.common.is_empty() => {
                    Some(labelled("extra items", comparison.common))
                }
                Quantifier::Some if comparison.common.is_empty() => Some(AlertPayload::new()),
                Quantifier::All if !comparison.missing.is_empty() => {
                    Some(labelled("missing items", comparison.missing))
                }
                _ => None,
            }
        }
        RuleKind::Equality {
            negated,
            list1,
            list2,
        } => {
            let forward = registry.get_common_and_missing_items(list1, list2)?;
            if *negated != forward.equal {
                None
            } else {
                let backward = registry.get_common_and_missing_items(list2, list1)?;
                let mut payload = AlertPayload::new();
                if !forward.missing.is_empty() {
                    payload.insert(format!("extra items in {list1}"), forward.missing);
                }
                if !backward.missing.is_empty() {
                    payload.insert(format!("extra items in {list2}"), backward.missing);
                }
                Some(payload)
            }
        }
    };

    let Some(findings) = payload else {
        debug!(step = step.number, rule = %rule.text, "expectation holds");
        return Ok(None);
    };
    debug!(step = step.number, rule = %rule.text, severity = %rule.severity, "expectation violated");
    Ok(Some(Alert {
        violated_rule: rule.text.clone(),
        findings,
        step: step.clone(),
        severity: rule.severity,
    }))
}

fn labelled(label: &str, items: Vec<crate::finding::Record>) -> AlertPayload {
    let mut payload = AlertPayload::new();
    payload.insert(label.to_string(), items);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Severity;
    use crate::expression::parse_expect_rule;
    use crate::finding::{record, Record};
    use crate::state::FindingsMap;
    use serde_json::json;
    use tempfile::TempDir;

    fn step() -> StepRef {
        StepRef {
            number: 1,
            action: "discover Domains and IPs".to_string(),
            name: "dns".to_string(),
        }
    }

    fn list(attr: &str, values: &[&str]) -> Vec<Record> {
        values
            .iter()
            .map(|value| record(&[(attr, json!(value))]))
            .collect()
    }

    fn registry(dir: &TempDir, previous: FindingsMap, current: FindingsMap) -> FindingsRegistry {
        let persist = dir.path().join("cfg.state");
        let resume = dir.path().join("cfg.resume");
        let mut seed = FindingsRegistry::new(&persist, &resume, previous, true).unwrap();
        seed.save_persist().unwrap();
        FindingsRegistry::new(&persist, &resume, current, false).unwrap()
    }

    fn check(reg: &FindingsRegistry, rule: &str) -> Option<Alert> {
        evaluate(&parse_expect_rule(rule).unwrap(), reg, &step()).unwrap()
    }

    #[test]
    fn no_new_items_reports_only_additions() {
        let dir = tempfile::tempdir().unwrap();
        let mut previous = FindingsMap::new();
        previous.insert("IPs".to_string(), list("ip", &["1.1.1.1"]));
        let mut current = FindingsMap::new();
        current.insert("IPs".to_string(), list("ip", &["1.1.1.1", "2.2.2.2"]));
        let reg = registry(&dir, previous, current);

        let alert = check(&reg, "no new IPs, otherwise alert high").unwrap();
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.findings.len(), 1);
        assert_eq!(alert.findings["extra items"], list("ip", &["2.2.2.2"]));
        assert_eq!(alert.step, step());

        assert!(check(&reg, "some new IPs, otherwise alert medium").is_none());
        assert!(check(&reg, "some IPs, otherwise alert medium").is_none());
        assert_eq!(
            check(&reg, "no IPs, otherwise alert informative")
                .unwrap()
                .finding_count(),
            2
        );
    }

    #[test]
    fn all_in_reports_missing_items() {
        let dir = tempfile::tempdir().unwrap();
        let mut current = FindingsMap::new();
        current.insert("Domains".to_string(), list("domain", &["a.com", "b.com"]));
        current.insert("Good-Domains".to_string(), list("domain", &["a.com"]));
        let reg = registry(&dir, FindingsMap::new(), current);

        let alert = check(&reg, "all Domains in Good-Domains, otherwise alert very high").unwrap();
        assert_eq!(alert.severity, Severity::VeryHigh);
        assert_eq!(alert.findings["missing items"], list("domain", &["b.com"]));

        let alert = check(&reg, "no Domains in Good-Domains, otherwise alert high").unwrap();
        assert_eq!(alert.findings["extra items"], list("domain", &["a.com"]));

        assert!(check(&reg, "some Domains in Good-Domains, otherwise alert high").is_none());
        assert!(check(&reg, "all Good-Domains in Domains, otherwise alert high").is_none());
    }

    #[test]
    fn equality_and_its_negation() {
        let dir = tempfile::tempdir().unwrap();
        let mut current = FindingsMap::new();
        current.insert("TLS-Names".to_string(), list("domain", &["a.com", "b.com"]));
        current.insert("Domains".to_string(), list("domain", &["a.com", "c.com"]));
        let reg = registry(&dir, FindingsMap::new(), current);

        assert!(check(&reg, "TLS-Names equals TLS-Names, otherwise alert high").is_none());
        assert!(check(&reg, "TLS-Names not equals TLS-Names, otherwise alert high").is_some());

        let alert = check(&reg, "TLS-Names equals Domains, otherwise alert medium").unwrap();
        assert_eq!(
            alert.findings["extra items in TLS-Names"],
            list("domain", &["b.com"])
        );
        assert_eq!(
            alert.findings["extra items in Domains"],
            list("domain", &["c.com"])
        );
        assert!(check(&reg, "TLS-Names not equals Domains, otherwise alert medium").is_none());
    }

    #[test]
    fn some_rules_alert_with_empty_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut current = FindingsMap::new();
        current.insert("Leaks".to_string(), vec![]);
        current.insert("IPs".to_string(), list("ip", &["1.1.1.1"]));
        let reg = registry(&dir, FindingsMap::new(), current);

        let alert = check(&reg, "some Leaks, otherwise alert informative").unwrap();
        assert!(alert.findings.is_empty());
        let alert = check(&reg, "some Leaks in IPs, otherwise alert informative").unwrap();
        assert!(alert.findings.is_empty());
    }

    #[test]
    fn unknown_subject_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir, FindingsMap::new(), FindingsMap::new());
        let rule = parse_expect_rule("no Ghosts, otherwise alert high").unwrap();
        assert!(matches!(
            evaluate(&rule, &reg, &step()),
            Err(RegistryError::UnknownKey { .. })
        ));
    }
}
