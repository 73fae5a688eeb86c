use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::predicate::{Discount, Predicate};
use crate::db::{PerformanceCheck, PlanStore};

pub const NO_CARTESIAN_PRODUCT: &str = "No CartesianProduct";
pub const NO_EAGER_WITH_PERIODIC_COMMIT: &str = "No EAGER with PERIODIC COMMIT";

/// Operators that force the whole input to be materialized.
const EAGER_OPERATORS: &[&str] = &[
    "NodeLeftOuterHashJoin",
    "NodeRightOuterHashJoin",
    "NodeHashJoin",
    "EagerAggregation",
    "Eager",
    "Distinct",
    "Sort",
    "Top",
    "ValueHashJoin",
];

/// A check as written in the config file, with the predicate as a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDefinition {
    pub name: String,
    pub severity: i32,
    #[serde(default)]
    pub description: String,
    pub predicate: Predicate,
}

impl CheckDefinition {
    pub fn to_check(&self) -> Result<PerformanceCheck> {
        let check = PerformanceCheck {
            name: self.name.clone(),
            severity: self.severity,
            description: self.description.clone(),
            predicate: self.predicate.to_json()?,
            version: 1,
        };
        validate_check(&check)?;
        Ok(check)
    }
}

/// The reference rules every installation starts with.
pub fn built_in_checks() -> Vec<CheckDefinition> {
    vec![
        CheckDefinition {
            name: NO_CARTESIAN_PRODUCT.to_string(),
            severity: 5,
            description: "Cartesian products multiply row counts; connect the patterns or seek both sides by a unique index".to_string(),
            predicate: Predicate {
                statement_contains: None,
                operators: vec!["CartesianProduct".to_string()],
                discount: Some(Discount {
                    operators: vec!["NodeUniqueIndexSeek".to_string()],
                    per_match: 2,
                }),
            },
        },
        CheckDefinition {
            name: NO_EAGER_WITH_PERIODIC_COMMIT.to_string(),
            severity: 4,
            description: "Eager operators load the whole input before committing, defeating USING PERIODIC COMMIT".to_string(),
            predicate: Predicate {
                statement_contains: Some("using periodic commit".to_string()),
                operators: EAGER_OPERATORS.iter().map(|s| s.to_string()).collect(),
                discount: None,
            },
        },
    ]
}

/// Reject checks the rule engine could never evaluate.
pub fn validate_check(check: &PerformanceCheck) -> Result<()> {
    if check.name.trim().is_empty() {
        bail!("Check name must not be empty");
    }
    if !(1..=5).contains(&check.severity) {
        bail!(
            "Check '{}' has severity {}; expected 1 to 5",
            check.name,
            check.severity
        );
    }
    Predicate::parse(&check.predicate)
        .with_context(|| format!("Check '{}' has an invalid predicate", check.name))?;
    Ok(())
}

/// Validate and create `check` unless a check with its name already exists.
pub async fn create_check_if_absent(store: &dyn PlanStore, check: &PerformanceCheck) -> Result<bool> {
    validate_check(check)?;
    store
        .create_check_if_absent(check)
        .await
        .with_context(|| format!("Failed to create check '{}'", check.name))
}

/// Install the built-in checks plus `extra`, never overwriting existing ones.
///
/// Returns how many checks were created.
pub async fn bootstrap_checks(store: &dyn PlanStore, extra: &[CheckDefinition]) -> Result<usize> {
    let mut created = 0;
    for definition in built_in_checks().iter().chain(extra) {
        let check = definition.to_check()?;
        if create_check_if_absent(store, &check).await? {
            info!(check = %check.name, severity = check.severity, "created performance check");
            created += 1;
        }
    }
    Ok(created)
}
