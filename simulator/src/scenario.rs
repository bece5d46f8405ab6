//! Simulation scenarios.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Accounts are referred to by name (`A`, `B`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Pause.
    Wait { millis: u64 },
    /// Record a pending deposit.
    Deposit { account: String, amount: String },
    /// Record a pending withdrawal.
    Withdraw { account: String, amount: String },
    /// Record a pending transfer pair.
    Transfer {
        from: String,
        to: String,
        amount: String,
    },
    /// Capture every pending record the account is a party to.
    Capture { account: String },
    /// Capture the records from the latest deposit, withdrawal or transfer.
    CaptureLast { account: String },
    /// Inject a storage fault.
    InjectFault { fault: FaultType },
    /// Clear every injected fault.
    ClearFaults,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Storage faults that can be injected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FaultType {
    /// Storage cannot be reached.
    StoreUnavailable,
    /// Let `successes` record creations through, then fail one.
    FailCreateAfter { successes: usize },
    /// Fail the next `count` commits with a serialization conflict.
    CommitConflicts { count: usize },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// Settled balance equals.
    BalanceEquals { account: String, amount: String },
    /// The previous step failed with this error code.
    LastFailedWith { code: String },
    /// The previous step succeeded.
    LastSucceeded,
    /// Total balance equals settled deposits minus settled withdrawals, and
    /// every account agrees with its ledger.
    Conserved,
}

fn deposit(account: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Deposit {
        account: account.to_string(),
        amount: amount.to_string(),
    }
}

fn withdraw(account: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Withdraw {
        account: account.to_string(),
        amount: amount.to_string(),
    }
}

fn transfer(from: &str, to: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Transfer {
        from: from.to_string(),
        to: to.to_string(),
        amount: amount.to_string(),
    }
}

fn capture(account: &str) -> ScenarioStep {
    ScenarioStep::Capture {
        account: account.to_string(),
    }
}

fn assert_balance(account: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::BalanceEquals {
            account: account.to_string(),
            amount: amount.to_string(),
        },
    }
}

fn assert_failed(code: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::LastFailedWith {
            code: code.to_string(),
        },
    }
}

fn assert_succeeded() -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::LastSucceeded,
    }
}

fn assert_conserved() -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::Conserved,
    }
}

impl Scenario {
    /// Names of the built-in scenarios.
    pub const BUILT_IN: [&'static str; 5] = [
        "transfer-capture",
        "atomic-transfer",
        "double-capture",
        "conflict-retry",
        "insufficient-funds",
    ];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "transfer-capture" => Ok(Self::transfer_capture()),
            "atomic-transfer" => Ok(Self::atomic_transfer()),
            "double-capture" => Ok(Self::double_capture()),
            "conflict-retry" => Ok(Self::conflict_retry()),
            "insufficient-funds" => Ok(Self::insufficient_funds()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Load a scenario from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Whether any step needs fault injection.
    pub fn injects_faults(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, ScenarioStep::InjectFault { .. }))
    }

    /// Transfer between two funded accounts, settled by one capture.
    fn transfer_capture() -> Self {
        Self {
            name: "transfer-capture".to_string(),
            description: "Pending transfer leaves balances alone until captured".to_string(),
            steps: vec![
                deposit("A", "200"),
                deposit("B", "200"),
                capture("A"),
                capture("B"),
                transfer("A", "B", "100"),
                assert_succeeded(),
                assert_balance("A", "200"),
                assert_balance("B", "200"),
                capture("A"),
                assert_balance("A", "100"),
                assert_balance("B", "300"),
                assert_conserved(),
            ],
        }
    }

    /// Credit-side failure must not leave the debit behind.
    fn atomic_transfer() -> Self {
        Self {
            name: "atomic-transfer".to_string(),
            description: "Failed transfer persists neither record".to_string(),
            steps: vec![
                deposit("A", "200"),
                capture("A"),
                ScenarioStep::InjectFault {
                    fault: FaultType::FailCreateAfter { successes: 1 },
                },
                transfer("A", "B", "50"),
                assert_failed("TRANSACTION_CREATE_FAILED"),
                ScenarioStep::ClearFaults,
                assert_balance("A", "200"),
                transfer("A", "B", "50"),
                assert_succeeded(),
                capture("B"),
                assert_balance("A", "150"),
                assert_balance("B", "50"),
                assert_conserved(),
            ],
        }
    }

    /// Capturing the same record twice applies it once.
    fn double_capture() -> Self {
        Self {
            name: "double-capture".to_string(),
            description: "Second capture of the same ids is rejected".to_string(),
            steps: vec![
                deposit("A", "75"),
                ScenarioStep::CaptureLast {
                    account: "A".to_string(),
                },
                assert_succeeded(),
                ScenarioStep::CaptureLast {
                    account: "A".to_string(),
                },
                assert_failed("TRANSACTION_NOT_FOUND"),
                assert_balance("A", "75"),
                assert_conserved(),
            ],
        }
    }

    /// Transient conflicts are retried; outages are reported.
    fn conflict_retry() -> Self {
        Self {
            name: "conflict-retry".to_string(),
            description: "Serialization conflicts are retried by the engine".to_string(),
            steps: vec![
                deposit("A", "10"),
                ScenarioStep::InjectFault {
                    fault: FaultType::CommitConflicts { count: 2 },
                },
                capture("A"),
                assert_succeeded(),
                assert_balance("A", "10"),
                ScenarioStep::InjectFault {
                    fault: FaultType::StoreUnavailable,
                },
                deposit("A", "5"),
                assert_failed("STORAGE_UNAVAILABLE"),
                ScenarioStep::ClearFaults,
                ScenarioStep::Wait { millis: 10 },
                deposit("A", "5"),
                assert_succeeded(),
                assert_conserved(),
            ],
        }
    }

    /// Withdrawals and transfers are checked against the settled balance.
    fn insufficient_funds() -> Self {
        Self {
            name: "insufficient-funds".to_string(),
            description: "Spending beyond the settled balance is rejected".to_string(),
            steps: vec![
                deposit("A", "50"),
                capture("A"),
                transfer("A", "B", "100"),
                assert_failed("INSUFFICIENT_FUNDS"),
                withdraw("A", "80"),
                assert_failed("INSUFFICIENT_FUNDS"),
                withdraw("A", "30"),
                assert_succeeded(),
                capture("A"),
                assert_balance("A", "20"),
                assert_conserved(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_in_scenarios_load() {
        for name in Scenario::BUILT_IN {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, name);
            assert!(!scenario.steps.is_empty());
        }
        assert!(Scenario::load("nope").is_err());
    }

    #[test]
    fn test_scenario_json_format() {
        let raw = r#"{
            "name": "custom",
            "description": "hand written",
            "steps": [
                { "Deposit": { "account": "A", "amount": "12.5" } },
                { "Capture": { "account": "A" } },
                { "InjectFault": { "fault": { "CommitConflicts": { "count": 1 } } } },
                "ClearFaults",
                { "Assert": { "condition": "Conserved" } }
            ]
        }"#;
        let scenario: Scenario = serde_json::from_str(raw).unwrap();
        assert_eq!(scenario.steps.len(), 5);
        assert!(scenario.injects_faults());
        assert!(!Scenario::load("double-capture").unwrap().injects_faults());
    }
}
