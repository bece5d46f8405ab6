//! Simulation controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context};
use corebank_common::{AccountId, Amount, LedgerError, LedgerResult, TransactionId, UserId};
use corebank_ledger::{LedgerEngine, MemoryLedgerStore, Transaction};
use futures::future::try_join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, FaultType, Scenario, ScenarioStep};

/// A pending record, tracked until captured.
#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    account_id: AccountId,
    recipient_id: AccountId,
    /// Money entering (positive) or leaving (negative) the system once settled.
    external: Decimal,
}

impl PendingEntry {
    fn from_record(txn: &Transaction) -> Self {
        let external = if txn.account_id == txn.recipient_id {
            txn.signed_amount()
        } else {
            Decimal::ZERO
        };

        Self {
            account_id: txn.account_id,
            recipient_id: txn.recipient_id,
            external,
        }
    }

    fn involves(&self, account_id: AccountId) -> bool {
        self.account_id == account_id || self.recipient_id == account_id
    }
}

/// Engine handle plus the bookkeeping needed to check conservation.
#[derive(Clone)]
struct Books {
    engine: Arc<LedgerEngine>,
    pending: Arc<Mutex<HashMap<TransactionId, PendingEntry>>>,
    /// Settled deposits minus settled withdrawals.
    external: Arc<Mutex<Decimal>>,
    metrics: Arc<Mutex<SimulationMetrics>>,
}

impl Books {
    fn new(engine: LedgerEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            pending: Arc::new(Mutex::new(HashMap::new())),
            external: Arc::new(Mutex::new(Decimal::ZERO)),
            metrics: Arc::new(Mutex::new(SimulationMetrics::new())),
        }
    }

    async fn observe<T>(&self, started: Instant, result: &LedgerResult<T>) {
        let mut metrics = self.metrics.lock().await;
        match result {
            Ok(_) => metrics.record_success(started.elapsed().as_millis() as u64),
            Err(err) => metrics.record_error(err),
        }
    }

    async fn track(&self, records: &[&Transaction]) -> Vec<TransactionId> {
        let mut pending = self.pending.lock().await;
        records
            .iter()
            .map(|txn| {
                pending.insert(txn.id, PendingEntry::from_record(txn));
                txn.id
            })
            .collect()
    }

    async fn deposit(
        &self,
        account: AccountId,
        amount: Amount,
    ) -> LedgerResult<Vec<TransactionId>> {
        let started = Instant::now();
        let result = self.engine.deposit(account, amount).await;
        self.observe(started, &result).await;
        let record = result?;
        Ok(self.track(&[&record]).await)
    }

    async fn withdraw(
        &self,
        account: AccountId,
        amount: Amount,
    ) -> LedgerResult<Vec<TransactionId>> {
        let started = Instant::now();
        let result = self.engine.withdrawal(account, amount).await;
        self.observe(started, &result).await;
        let record = result?;
        Ok(self.track(&[&record]).await)
    }

    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<Vec<TransactionId>> {
        let started = Instant::now();
        let result = self.engine.transfer(from, to, amount).await;
        self.observe(started, &result).await;
        let pair = result?;
        Ok(self.track(&[&pair.debit, &pair.credit]).await)
    }

    /// Capture everything pending that `account` is a party to.
    async fn capture_pending(&self, account: AccountId) -> LedgerResult<usize> {
        let ids: Vec<TransactionId> = self
            .pending
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.involves(account))
            .map(|(id, _)| *id)
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }
        self.capture(account, &ids).await
    }

    async fn capture(&self, account: AccountId, ids: &[TransactionId]) -> LedgerResult<usize> {
        let started = Instant::now();
        let result = self.engine.capture_transactions(account, ids).await;
        self.observe(started, &result).await;
        result?;

        let mut pending = self.pending.lock().await;
        let settled: Decimal = ids
            .iter()
            .filter_map(|id| pending.remove(id))
            .map(|entry| entry.external)
            .sum();
        *self.external.lock().await += settled;
        self.metrics.lock().await.record_captured(ids.len());
        Ok(ids.len())
    }
}

fn account_name(index: usize) -> String {
    if index < 26 {
        char::from(b'A' + index as u8).to_string()
    } else {
        format!("A{}", index)
    }
}

fn parse_amount(raw: &str) -> anyhow::Result<Amount> {
    raw.parse::<Amount>()
        .with_context(|| format!("invalid amount {:?}", raw))
}

/// Controls the simulation.
pub struct SimulationController {
    books: Books,
    /// Fault handle; only the in-memory store supports injection.
    faults: Option<MemoryLedgerStore>,
    /// Simulated accounts by name.
    accounts: Vec<(String, AccountId)>,
    /// Records produced by the latest deposit, withdrawal or transfer.
    last_ids: Vec<TransactionId>,
    /// Outcome of the latest ledger step.
    last_error: Option<LedgerError>,
    /// Base seed for the random workload.
    seed: Option<u64>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(engine: LedgerEngine, faults: Option<MemoryLedgerStore>, seed: Option<u64>) -> Self {
        Self {
            books: Books::new(engine),
            faults,
            accounts: Vec::new(),
            last_ids: Vec::new(),
            last_error: None,
            seed,
        }
    }

    /// Open `count` empty accounts (at least two) for one simulated owner.
    pub async fn initialize(&mut self, count: usize) -> anyhow::Result<()> {
        let owner = UserId::new();
        info!(owner_id = %owner, accounts = count.max(2), "Initializing simulation");

        for index in 0..count.max(2) {
            let account = self.books.engine.open_account(owner).await?;
            let name = account_name(index);
            debug!(account = %name, account_id = %account.id, "Opened simulated account");
            self.accounts.push((name, account.id));
        }

        Ok(())
    }

    fn account(&self, name: &str) -> anyhow::Result<AccountId> {
        self.accounts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
            .ok_or_else(|| anyhow!("Unknown account: {}", name))
    }

    fn remember<T>(&mut self, result: LedgerResult<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.last_error = None;
                Some(value)
            }
            Err(err) => {
                warn!(code = err.error_code(), error = %err, "Step failed");
                self.last_error = Some(err);
                None
            }
        }
    }

    /// Run a scenario.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> anyhow::Result<()> {
        info!(scenario = %scenario.name, description = %scenario.description, "Running scenario");

        if scenario.injects_faults() && self.faults.is_none() {
            bail!(
                "Scenario {} injects faults, which needs the in-memory store",
                scenario.name
            );
        }

        for (index, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step)
                .await
                .with_context(|| format!("step {} ({:?})", index + 1, step))?;
        }

        info!(scenario = %scenario.name, "Scenario passed");
        Ok(())
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ScenarioStep::Deposit { account, amount } => {
                let result = self
                    .books
                    .deposit(self.account(account)?, parse_amount(amount)?)
                    .await;
                if let Some(ids) = self.remember(result) {
                    self.last_ids = ids;
                }
            }
            ScenarioStep::Withdraw { account, amount } => {
                let result = self
                    .books
                    .withdraw(self.account(account)?, parse_amount(amount)?)
                    .await;
                if let Some(ids) = self.remember(result) {
                    self.last_ids = ids;
                }
            }
            ScenarioStep::Transfer { from, to, amount } => {
                let result = self
                    .books
                    .transfer(self.account(from)?, self.account(to)?, parse_amount(amount)?)
                    .await;
                if let Some(ids) = self.remember(result) {
                    self.last_ids = ids;
                }
            }
            ScenarioStep::Capture { account } => {
                let result = self.books.capture_pending(self.account(account)?).await;
                self.remember(result);
            }
            ScenarioStep::CaptureLast { account } => {
                let ids = self.last_ids.clone();
                let result = self.books.capture(self.account(account)?, &ids).await;
                self.remember(result);
            }
            ScenarioStep::InjectFault { fault } => {
                let store = self
                    .faults
                    .as_ref()
                    .ok_or_else(|| anyhow!("Fault injection needs the in-memory store"))?;
                info!(fault = ?fault, "Injecting fault");
                match fault {
                    FaultType::StoreUnavailable => store.set_unavailable(true),
                    FaultType::FailCreateAfter { successes } => {
                        store.fail_transaction_create_after(*successes)
                    }
                    FaultType::CommitConflicts { count } => store.force_commit_conflicts(*count),
                }
            }
            ScenarioStep::ClearFaults => {
                if let Some(store) = &self.faults {
                    info!("Clearing faults");
                    store.clear_faults();
                }
            }
            ScenarioStep::Assert { condition } => self.check(condition).await?,
        }

        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::BalanceEquals { account, amount } => {
                let expected = Decimal::from_str_exact(amount)
                    .with_context(|| format!("invalid amount {:?}", amount))?;
                let actual = self.books.engine.account(self.account(account)?).await?.balance;
                ensure!(
                    actual == expected,
                    "Balance of {} is {}, expected {}",
                    account,
                    actual,
                    expected
                );
            }
            AssertCondition::LastFailedWith { code } => match &self.last_error {
                Some(err) if err.error_code() == code => {}
                other => bail!("Expected failure {}, got {:?}", code, other),
            },
            AssertCondition::LastSucceeded => {
                if let Some(err) = &self.last_error {
                    bail!("Expected success, got {}", err);
                }
            }
            AssertCondition::Conserved => self.verify().await?,
        }
        Ok(())
    }

    /// Run a random workload of `operations` spread over `concurrency` tasks.
    pub async fn run(&self, operations: usize, concurrency: usize) -> anyhow::Result<()> {
        let workers = concurrency.max(1);
        let base_seed = self.seed.unwrap_or_else(rand::random);
        let accounts: Arc<Vec<AccountId>> =
            Arc::new(self.accounts.iter().map(|(_, id)| *id).collect());

        info!(operations, workers, seed = base_seed, "Running random workload");

        let handles = (0..workers).map(|worker| {
            let books = self.books.clone();
            let accounts = accounts.clone();
            let share = operations / workers + usize::from(worker < operations % workers);
            let seed = base_seed.wrapping_add(worker as u64);
            tokio::spawn(workload(books, accounts, share, seed))
        });

        for result in try_join_all(handles).await? {
            result?;
        }

        // Settle what is left so the final check covers as much as possible.
        for id in accounts.iter() {
            if let Err(err) = self.books.capture_pending(*id).await {
                warn!(account_id = %id, error = %err, "Final capture left records pending");
            }
        }

        Ok(())
    }

    /// Check conservation across every simulated account.
    pub async fn verify(&self) -> anyhow::Result<()> {
        let mut total = Decimal::ZERO;
        for (name, id) in &self.accounts {
            let balance = self.books.engine.reconcile(*id).await?;
            ensure!(
                balance.is_consistent(),
                "Account {} balance {} does not match its settled records",
                name,
                balance.balance
            );
            ensure!(
                balance.balance >= Decimal::ZERO,
                "Account {} is overdrawn",
                name
            );
            total += balance.balance;
        }

        let external = *self.books.external.lock().await;
        ensure!(
            total == external,
            "Total balance {} differs from settled deposits minus withdrawals {}",
            total,
            external
        );

        info!(total = %total, "Conservation holds");
        Ok(())
    }

    /// Snapshot of the simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.books.metrics.lock().await.clone()
    }
}

async fn workload(
    books: Books,
    accounts: Arc<Vec<AccountId>>,
    operations: usize,
    seed: u64,
) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);

    for _ in 0..operations {
        let account = accounts[rng.gen_range(0..accounts.len())];
        let amount = Amount::from_units(rng.gen_range(1..=500))?;

        // Outcomes land in the metrics; rejections are part of the workload.
        match rng.gen_range(0..100) {
            0..=29 => {
                let _ = books.deposit(account, amount).await;
            }
            30..=44 => {
                let _ = books.withdraw(account, amount).await;
            }
            45..=74 => {
                let to = accounts[rng.gen_range(0..accounts.len())];
                if to != account {
                    let _ = books.transfer(account, to, amount).await;
                }
            }
            _ => {
                let _ = books.capture_pending(account).await;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corebank_ledger::RetryPolicy;

    fn memory_controller(seed: Option<u64>) -> SimulationController {
        let store = MemoryLedgerStore::new();
        let engine = LedgerEngine::new(Arc::new(store.clone())).with_retry_policy(
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        );
        SimulationController::new(engine, Some(store), seed)
    }

    #[tokio::test]
    async fn test_built_in_scenarios_pass() {
        for name in Scenario::BUILT_IN {
            let mut controller = memory_controller(None);
            controller.initialize(2).await.unwrap();
            controller
                .run_scenario(&Scenario::load(name).unwrap())
                .await
                .unwrap_or_else(|err| panic!("{name}: {err:#}"));
        }
    }

    #[tokio::test]
    async fn test_random_workload_conserves_money() {
        let mut controller = memory_controller(Some(7));
        controller.initialize(4).await.unwrap();
        controller.run(300, 4).await.unwrap();
        controller.verify().await.unwrap();

        let metrics = controller.metrics().await;
        assert_eq!(metrics.total_operations, metrics.successful_operations
            + metrics.rejected_operations
            + metrics.conflicted_operations
            + metrics.failed_operations);
        assert!(metrics.successful_operations > 0);
    }

    #[tokio::test]
    async fn test_fault_scenarios_need_memory_store() {
        let store = MemoryLedgerStore::new();
        let mut controller =
            SimulationController::new(LedgerEngine::new(Arc::new(store)), None, None);
        controller.initialize(2).await.unwrap();

        let scenario = Scenario::load("conflict-retry").unwrap();
        assert!(controller.run_scenario(&scenario).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_assertion_is_reported() {
        let mut controller = memory_controller(None);
        controller.initialize(2).await.unwrap();

        let scenario = Scenario {
            name: "wrong".to_string(),
            description: "expects money that was never captured".to_string(),
            steps: vec![
                ScenarioStep::Deposit {
                    account: "A".to_string(),
                    amount: "10".to_string(),
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        account: "A".to_string(),
                        amount: "10".to_string(),
                    },
                },
            ],
        };
        assert!(controller.run_scenario(&scenario).await.is_err());
    }
}
