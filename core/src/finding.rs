use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One structured finding entry: attribute name -> value.
pub type Record = BTreeMap<String, Value>;

/// The two lists share no attribute, so they cannot be compared record by record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("records have no common attribute (left: [{}], right: [{}])", left.join(", "), right.join(", "))]
pub struct NoCommonAttributes {
    pub left: Vec<String>,
    pub right: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Comparison {
    /// Projected records of the left list that also occur in the right list.
    pub common: Vec<Record>,
    /// Projected records of the left list that are absent from the right list.
    pub missing: Vec<Record>,
    /// Both projected lists hold the same records and have the same length.
    pub equal: bool,
}

pub fn attribute_names(record: &Record) -> BTreeSet<String> {
    record.keys().cloned().collect()
}

pub fn project(record: &Record, attributes: &BTreeSet<String>) -> Record {
    record
        .iter()
        .filter(|(name, _)| attributes.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

pub fn project_all(records: &[Record], attributes: &BTreeSet<String>) -> Vec<Record> {
    records
        .iter()
        .map(|record| project(record, attributes))
        .collect()
}

/// Appends `records` to `target`, skipping entries already present.
pub fn extend_unique(target: &mut Vec<Record>, records: &[Record]) {
    for record in records {
        if !target.contains(record) {
            target.push(record.clone());
        }
    }
}

/// Records of `items` absent from `other`, first occurrence only.
pub fn difference(items: &[Record], other: &[Record]) -> Vec<Record> {
    let mut out = Vec::new();
    for item in items {
        if !other.contains(item) && !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

pub fn intersection(items: &[Record], other: &[Record]) -> Vec<Record> {
    let mut out = Vec::new();
    for item in items {
        if other.contains(item) && !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Attributes present on the first record of both lists. `Ok(None)` means one
/// of the lists is empty and projection does not matter.
pub fn common_attributes(
    left: &[Record],
    right: &[Record],
) -> Result<Option<BTreeSet<String>>, NoCommonAttributes> {
    let (Some(first_left), Some(first_right)) = (left.first(), right.first()) else {
        return Ok(None);
    };
    let left_names = attribute_names(first_left);
    let right_names = attribute_names(first_right);
    let common: BTreeSet<String> = left_names.intersection(&right_names).cloned().collect();
    if common.is_empty() {
        return Err(NoCommonAttributes {
            left: left_names.into_iter().collect(),
            right: right_names.into_iter().collect(),
        });
    }
    Ok(Some(common))
}

/// Compares two finding lists after projecting both onto their common attributes.
pub fn compare(left: &[Record], right: &[Record]) -> Result<Comparison, NoCommonAttributes> {
    let Some(attributes) = common_attributes(left, right)? else {
        return Ok(Comparison {
            common: Vec::new(),
            missing: difference(left, right),
            equal: left.is_empty() && right.is_empty(),
        });
    };

    let projected_left = project_all(left, &attributes);
    let projected_right = project_all(right, &attributes);

    let common = intersection(&projected_left, &projected_right);
    let missing = difference(&projected_left, &projected_right);
    let equal = projected_left.len() == projected_right.len()
        && missing.is_empty()
        && difference(&projected_right, &projected_left).is_empty();

    Ok(Comparison {
        common,
        missing,
        equal,
    })
}

pub fn value_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::Null) | None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
pub(crate) fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projects_onto_shared_attributes() {
        let domains = vec![
            record(&[("domain", json!("a.com")), ("ip", json!("1.1.1.1"))]),
            record(&[("domain", json!("b.com")), ("ip", json!("2.2.2.2"))]),
        ];
        let good = vec![record(&[("domain", json!("a.com"))])];

        let cmp = compare(&domains, &good).unwrap();
        assert_eq!(cmp.common, vec![record(&[("domain", json!("a.com"))])]);
        assert_eq!(cmp.missing, vec![record(&[("domain", json!("b.com"))])]);
        assert!(!cmp.equal);
    }

    #[test]
    fn equality_is_symmetric_even_when_missing_lists_differ() {
        let a = vec![
            record(&[("ip", json!("1.1.1.1"))]),
            record(&[("ip", json!("2.2.2.2"))]),
        ];
        let b = vec![record(&[("ip", json!("1.1.1.1"))])];
        let ab = compare(&a, &b).unwrap();
        let ba = compare(&b, &a).unwrap();
        assert_eq!(ab.equal, ba.equal);
        assert_eq!(ab.missing.len(), 1);
        assert!(ba.missing.is_empty());

        let same = compare(&a, &a).unwrap();
        assert!(same.equal);
        assert_eq!(same.common.len(), 2);
    }

    #[test]
    fn duplicate_records_change_equality_through_length() {
        let a = vec![
            record(&[("ip", json!("1.1.1.1"))]),
            record(&[("ip", json!("1.1.1.1"))]),
        ];
        let b = vec![record(&[("ip", json!("1.1.1.1"))])];
        assert!(!compare(&a, &b).unwrap().equal);
        assert!(!compare(&b, &a).unwrap().equal);
    }

    #[test]
    fn empty_side_skips_projection() {
        let a = vec![record(&[("ip", json!("1.1.1.1"))])];
        let cmp = compare(&a, &[]).unwrap();
        assert!(cmp.common.is_empty());
        assert_eq!(cmp.missing, a);
        assert!(!cmp.equal);

        let cmp = compare(&[], &a).unwrap();
        assert!(cmp.missing.is_empty());
        assert!(compare(&[], &[]).unwrap().equal);
    }

    #[test]
    fn disjoint_attributes_are_an_error() {
        let a = vec![record(&[("ip", json!("1.1.1.1"))])];
        let b = vec![record(&[("domain", json!("a.com"))])];
        let err = compare(&a, &b).unwrap_err();
        assert_eq!(err.left, vec!["ip"]);
        assert_eq!(err.right, vec!["domain"]);
    }

    #[test]
    fn difference_deduplicates() {
        let a = vec![
            record(&[("ip", json!("2.2.2.2"))]),
            record(&[("ip", json!("2.2.2.2"))]),
            record(&[("ip", json!("1.1.1.1"))]),
        ];
        let b = vec![record(&[("ip", json!("1.1.1.1"))])];
        assert_eq!(difference(&a, &b), vec![record(&[("ip", json!("2.2.2.2"))])]);
    }
}
