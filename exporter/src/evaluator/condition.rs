//! Row predicates: an OR over sub-conditions, each an AND of field/value
//! equality checks.

use std::collections::HashMap;

const EQU_CONDITION_NAME: &str = "equ";

pub struct Condition {
    sub_conditions: Vec<SubCondition>,
}

struct SubCondition {
    /// Header index and expected value per equality check. A check whose
    /// field is missing from the header can never match.
    checks: Vec<(Option<usize>, String)>,
}

impl Condition {
    pub fn compile(
        metric: &str,
        conditions: &[HashMap<String, HashMap<String, String>>],
        header: &[String],
    ) -> Self {
        let mut sub_conditions = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let Some(equ) = condition.get(EQU_CONDITION_NAME) else {
                tracing::debug!(metric, "condition without an equ block skipped");
                continue;
            };
            let mut checks = Vec::with_capacity(equ.len());
            for (field, value) in equ {
                let index = header.iter().position(|name| name == field);
                if index.is_none() {
                    tracing::debug!(metric, field = %field, "condition field not found in header");
                }
                checks.push((index, value.clone()));
            }
            sub_conditions.push(SubCondition { checks });
        }
        Self { sub_conditions }
    }

    pub fn matches(&self, row: &[String]) -> bool {
        self.sub_conditions.iter().any(|sub| sub.matches(row))
    }
}

impl SubCondition {
    fn matches(&self, row: &[String]) -> bool {
        self.checks.iter().all(|(index, expected)| match index {
            Some(index) => row.get(*index).map(|value| value == expected).unwrap_or(false),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    fn header() -> Vec<String> {
        vec!["level".to_string(), "service".to_string()]
    }

    fn row(level: &str, service: &str) -> Vec<String> {
        vec![level.to_string(), service.to_string()]
    }

    #[test]
    fn and_within_a_condition() {
        let conditions = vec![hashmap! {
            "equ".to_string() => hashmap! {
                "level".to_string() => "ERROR".to_string(),
                "service".to_string() => "billing".to_string(),
            },
        }];
        let condition = Condition::compile("test", &conditions, &header());
        assert!(condition.matches(&row("ERROR", "billing")));
        assert!(!condition.matches(&row("ERROR", "checkout")));
    }

    #[test]
    fn or_between_conditions() {
        let conditions = vec![
            hashmap! {
                "equ".to_string() => hashmap! {"level".to_string() => "ERROR".to_string()},
            },
            hashmap! {
                "equ".to_string() => hashmap! {"level".to_string() => "WARN".to_string()},
            },
        ];
        let condition = Condition::compile("test", &conditions, &header());
        assert!(condition.matches(&row("ERROR", "x")));
        assert!(condition.matches(&row("WARN", "x")));
        assert!(!condition.matches(&row("INFO", "x")));
    }

    #[test]
    fn missing_field_never_matches() {
        let conditions = vec![hashmap! {
            "equ".to_string() => hashmap! {"unknown".to_string() => "x".to_string()},
        }];
        let condition = Condition::compile("test", &conditions, &header());
        assert!(!condition.matches(&row("ERROR", "billing")));
    }
}
