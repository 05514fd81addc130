//! Execution history compression ("golden path").

use std::cmp::Ordering;
use std::collections::HashMap;

use super::types::StepResult;

/// Keep the last result per step id, order ids hierarchically, drop failures.
pub fn golden_path(history: &[StepResult]) -> Vec<StepResult> {
    let mut last: HashMap<&str, &StepResult> = HashMap::new();
    for result in history {
        last.insert(result.step_id.as_str(), result);
    }

    let mut path: Vec<StepResult> = last
        .into_values()
        .filter(|r| r.success)
        .cloned()
        .collect();
    path.sort_by(|a, b| compare_ids(&a.step_id, &b.step_id));
    path
}

/// Compare dotted ids segment by segment, numerically where possible ("2" < "10", "3" < "3.1").
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(id: &str, attempt: u32, success: bool) -> StepResult {
        StepResult {
            step_id: id.to_string(),
            action: format!("step {id}"),
            attempt,
            success,
            output: String::new(),
            error: (!success).then(|| "failed".to_string()),
            error_kind: None,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_last_result_wins() {
        let history = vec![
            result("1", 1, false),
            result("1", 2, true),
            result("2", 1, true),
            result("2", 2, false),
        ];
        let path = golden_path(&history);
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].step_id, "1");
        assert_eq!(path[0].attempt, 2);
    }

    #[test]
    fn test_numeric_segment_order() {
        let history = vec![
            result("10", 1, true),
            result("2", 1, true),
            result("1.2", 1, true),
            result("1.10", 1, true),
            result("1.1", 1, true),
        ];
        let ids: Vec<String> = golden_path(&history).into_iter().map(|r| r.step_id).collect();
        assert_eq!(ids, vec!["1.1", "1.2", "1.10", "2", "10"]);
    }

    #[test]
    fn test_compare_ids_prefix_first() {
        assert_eq!(compare_ids("3", "3.1"), Ordering::Less);
        assert_eq!(compare_ids("3.1", "3.1"), Ordering::Equal);
        assert_eq!(compare_ids("4", "3.9"), Ordering::Greater);
    }
}
