//! Failure diagnostics for bulk batches
//!
//! When the service rejects records, the most common cause in practice is a
//! reference field pointing at a record that does not exist yet: the record
//! itself, a sibling created in the same call, or an id that was never part
//! of the run. [`analyze_failures`] classifies those cases and attaches a
//! concrete suggestion to each.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::types::Record;

/// Why a reference field likely caused a record to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReferenceIssueKind {
    /// The record references its own id
    SelfReference,
    /// The record references a sibling created in the same batch
    SameBatchReference,
    /// The record references an id that is not part of this run's input
    MissingReference,
}

impl ReferenceIssueKind {
    /// Remediation hint for this kind of issue
    pub const fn suggestion(self) -> &'static str {
        match self {
            Self::SelfReference => {
                "create the record first, then set the reference in a follow-up update"
            }
            Self::SameBatchReference => {
                "run referrer and referee in separate sequential passes so the target exists first"
            }
            Self::MissingReference => {
                "verify the referenced record exists in the service before rerunning"
            }
        }
    }
}

impl fmt::Display for ReferenceIssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfReference => write!(f, "references itself"),
            Self::SameBatchReference => {
                write!(f, "references a record created in the same batch")
            }
            Self::MissingReference => {
                write!(f, "references a record not present in this run")
            }
        }
    }
}

/// One suspicious reference on a failed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceIssue {
    /// Index of the record this issue belongs to; [`analyze_failures`]
    /// reports it relative to the slice it analyzed
    pub record_index: usize,
    /// Name of the reference field
    pub field: String,
    /// Entity the reference points at
    pub target_entity: String,
    /// Id the reference points at
    pub target_id: String,
    /// Classification of the problem
    pub kind: ReferenceIssueKind,
}

impl ReferenceIssue {
    /// Remediation hint for this issue
    pub const fn suggestion(&self) -> &'static str {
        self.kind.suggestion()
    }
}

impl fmt::Display for ReferenceIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {} field '{}' {} ({}/{}); {}",
            self.record_index,
            self.field,
            self.kind,
            self.target_entity,
            self.target_id,
            self.suggestion()
        )
    }
}

/// Classify the reference fields of failed records in a batch.
///
/// `failed` holds batch-local indices of the rejected records and
/// `input_ids` every id present anywhere in the run's input. References to
/// ids that exist in the input but in a different batch are not flagged;
/// batch completion order is unknown, so they may well be valid.
pub fn analyze_failures(
    batch: &[Record],
    failed: &[usize],
    input_ids: &HashSet<String>,
) -> Vec<ReferenceIssue> {
    let batch_ids: HashSet<&str> = batch.iter().filter_map(|r| r.id.as_deref()).collect();

    let mut issues = Vec::new();
    for &idx in failed {
        let Some(record) = batch.get(idx) else { continue };
        for (field, entity, target) in record.references() {
            let kind = if record.id.as_deref() == Some(target) {
                Some(ReferenceIssueKind::SelfReference)
            } else if batch_ids.contains(target) {
                Some(ReferenceIssueKind::SameBatchReference)
            } else if !input_ids.contains(target) {
                Some(ReferenceIssueKind::MissingReference)
            } else {
                None
            };

            if let Some(kind) = kind {
                issues.push(ReferenceIssue {
                    record_index: idx,
                    field: field.to_string(),
                    target_entity: entity.to_string(),
                    target_id: target.to_string(),
                    kind,
                });
            }
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_self_reference_flagged() {
        let batch = vec![Record::with_id("r1").reference("parent", "item", "r1")];
        let issues = analyze_failures(&batch, &[0], &ids(&["r1"]));

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, ReferenceIssueKind::SelfReference);
        assert_eq!(issues[0].field, "parent");
        assert_eq!(issues[0].target_id, "r1");
    }

    #[test]
    fn test_same_batch_reference_flagged() {
        let batch = vec![
            Record::with_id("r1"),
            Record::with_id("r2").reference("parent", "item", "r1"),
        ];
        let issues = analyze_failures(&batch, &[1], &ids(&["r1", "r2"]));

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, ReferenceIssueKind::SameBatchReference);
        assert_eq!(issues[0].record_index, 1);
    }

    #[test]
    fn test_missing_reference_flagged() {
        let batch = vec![Record::new().reference("owner", "user", "ghost-7")];
        let issues = analyze_failures(&batch, &[0], &ids(&["r1", "r2"]));

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, ReferenceIssueKind::MissingReference);
        assert_eq!(issues[0].target_entity, "user");
        assert_eq!(issues[0].target_id, "ghost-7");
    }

    #[test]
    fn test_cross_batch_reference_not_flagged() {
        // target exists in the run input, just not in this batch
        let batch = vec![Record::new().reference("parent", "item", "elsewhere-1")];
        let issues = analyze_failures(&batch, &[0], &ids(&["elsewhere-1"]));
        assert!(issues.is_empty());
    }

    #[test]
    fn test_only_failed_records_analyzed() {
        let batch = vec![
            Record::new().reference("owner", "user", "ghost-1"),
            Record::new().reference("owner", "user", "ghost-2"),
        ];
        let issues = analyze_failures(&batch, &[1], &HashSet::new());

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].record_index, 1);
        assert_eq!(issues[0].target_id, "ghost-2");
    }

    #[test]
    fn test_display_carries_suggestion() {
        let issue = ReferenceIssue {
            record_index: 3,
            field: "parent".into(),
            target_entity: "item".into(),
            target_id: "x1".into(),
            kind: ReferenceIssueKind::SameBatchReference,
        };
        let rendered = issue.to_string();
        assert!(rendered.contains("record 3"));
        assert!(rendered.contains("same batch"));
        assert!(rendered.contains("separate sequential passes"));
    }
}
