//! Common test utilities and helpers

use std::fs;
use std::path::{Path, PathBuf};
use tabledger::config::LedgerConfig;
use tabledger::row::RawRow;
use tabledger::{Ledger, LedgerWorkspace, Result};
use tempfile::TempDir;

/// Test fixture manager for creating temporary test environments
pub struct TestFixture {
    pub temp_dir: TempDir,
    pub workspace: LedgerWorkspace,
}

impl TestFixture {
    /// Create a new test fixture with initialized workspace
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let workspace = LedgerWorkspace::create_new(temp_dir.path().to_path_buf(), None)?;

        Ok(Self { temp_dir, workspace })
    }

    /// Create a new test fixture with a custom configuration
    pub fn with_config(config: LedgerConfig) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let workspace = LedgerWorkspace::create_new(temp_dir.path().to_path_buf(), Some(config))?;

        Ok(Self { temp_dir, workspace })
    }

    /// Create a new test fixture without initializing workspace
    pub fn new_empty() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let workspace = LedgerWorkspace::from_root(temp_dir.path().to_path_buf());

        Ok(Self { temp_dir, workspace })
    }

    /// Get the root path of the test fixture
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Open the fixture's ledger
    pub fn ledger(&self) -> Result<Ledger> {
        Ledger::open(&self.workspace)
    }

    /// Create a test CSV file with sample data
    pub fn create_csv(&self, name: &str, data: &[Vec<&str>]) -> Result<PathBuf> {
        let path = self.root().join(name);
        let mut content = String::new();

        for row in data {
            content.push_str(&row.join(","));
            content.push('\n');
        }

        fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a test CSV file with raw string content
    pub fn create_csv_raw(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.root().join(name);
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a test JSON file with sample data
    pub fn create_json(&self, name: &str, data: &serde_json::Value) -> Result<PathBuf> {
        let path = self.root().join(name);
        let content = serde_json::to_string_pretty(data)?;
        fs::write(&path, content)?;
        Ok(path)
    }
}

/// Helper for running CLI commands in tests
pub struct CliTestRunner {
    fixture: TestFixture,
}

impl CliTestRunner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            fixture: TestFixture::new()?,
        })
    }

    /// Runner over a directory that has not been initialized yet
    pub fn new_uninitialized() -> Result<Self> {
        Ok(Self {
            fixture: TestFixture::new_empty()?,
        })
    }

    pub fn fixture(&self) -> &TestFixture {
        &self.fixture
    }

    /// Run a tabledger command and return the result
    pub fn run_command(&self, args: &[&str]) -> Result<()> {
        use clap::Parser;
        use tabledger::cli::Cli;
        use tabledger::commands::execute_command;

        let mut cmd_args = vec!["tabledger"];
        cmd_args.extend(args);

        let cli = Cli::try_parse_from(cmd_args)
            .map_err(|e| tabledger::TabledgerError::invalid_input(e.to_string()))?;

        // Without --workspace the fixture root is the workspace
        let workspace_path = cli.workspace.as_deref().or(Some(self.fixture.root()));
        execute_command(cli.command, workspace_path)
    }

    /// Run a command and expect it to succeed
    pub fn expect_success(&self, args: &[&str]) {
        if let Err(e) = self.run_command(args) {
            panic!("Command {:?} should succeed: {}", args, e);
        }
    }

    /// Run a command and expect it to fail
    pub fn expect_failure(&self, args: &[&str]) -> tabledger::TabledgerError {
        self.run_command(args).expect_err("Command should fail")
    }
}

/// Sample data generators for testing
pub mod sample_data {
    use tabledger::row::RawRow;

    pub const ORDERS_HEADER: &[&str] = &["order_id", "order_date", "region", "payment_method", "revenue"];

    pub fn orders_v1() -> Vec<Vec<&'static str>> {
        vec![
            ORDERS_HEADER.to_vec(),
            vec!["1001", "2024-01-05", "EAST", "card", "120.50"],
            vec!["1002", "2024-01-06", "WEST", "cash", "80.00"],
            vec!["1003", "2024-01-07", "NORTH", "card", "42.10"],
        ]
    }

    /// 1001 revenue changes, 1004 is new, the rest are unchanged
    pub fn orders_v2() -> Vec<Vec<&'static str>> {
        vec![
            ORDERS_HEADER.to_vec(),
            vec!["1001", "2024-01-05", "EAST", "card", "130.00"],
            vec!["1002", "2024-01-06", "WEST", "cash", "80.00"],
            vec!["1003", "2024-01-07", "NORTH", "card", "42.10"],
            vec!["1004", "2024-01-08", "SOUTH", "transfer", "300.00"],
        ]
    }

    /// 1002 moves its protected order date, 1003 changes region
    pub fn orders_with_conflict() -> Vec<Vec<&'static str>> {
        vec![
            ORDERS_HEADER.to_vec(),
            vec!["1002", "2024-02-01", "WEST", "cash", "85.00"],
            vec!["1003", "2024-01-07", "SOUTH", "card", "42.10"],
        ]
    }

    pub fn order(line: u64, id: &str, date: &str, region: &str, revenue: &str) -> RawRow {
        RawRow::new(line)
            .with("order_id", id)
            .with("order_date", date)
            .with("region", region)
            .with("payment_method", "card")
            .with("revenue", revenue)
    }

    /// `count` distinct orders starting at id 1
    pub fn many_orders(count: u64) -> Vec<RawRow> {
        (1..=count)
            .map(|i| {
                RawRow::new(i + 1)
                    .with("order_id", &i.to_string())
                    .with("order_date", "2024-03-01")
                    .with("region", "EAST")
                    .with("payment_method", "card")
                    .with("revenue", &format!("{}.25", i))
            })
            .collect()
    }
}

/// An in-memory ledger over the default entities
pub fn memory_ledger() -> Ledger {
    Ledger::in_memory(LedgerConfig::default()).expect("in-memory ledger")
}

/// Rows of a sample table as raw rows
pub fn raw_rows(data: &[Vec<&str>]) -> Vec<RawRow> {
    let header = &data[0];
    data[1..]
        .iter()
        .enumerate()
        .map(|(i, cells)| {
            header
                .iter()
                .zip(cells)
                .fold(RawRow::new(i as u64 + 2), |row, (h, v)| row.with(h, v))
        })
        .collect()
}

/// Assertion helpers for test validation
pub mod assertions {
    use std::path::Path;
    use tabledger::{Ledger, Result};

    /// Assert that a file exists and is not empty
    pub fn assert_file_exists_and_not_empty(path: &Path) {
        assert!(path.exists(), "File should exist: {}", path.display());
        let metadata = std::fs::metadata(path).expect("Should be able to read file metadata");
        assert!(metadata.len() > 0, "File should not be empty: {}", path.display());
    }

    /// Assert that a directory exists
    pub fn assert_dir_exists(path: &Path) {
        assert!(path.exists(), "Directory should exist: {}", path.display());
        assert!(path.is_dir(), "Path should be a directory: {}", path.display());
    }

    /// Assert that a JSON file contains expected keys
    pub fn assert_json_contains_keys(path: &Path, keys: &[&str]) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let json: serde_json::Value = serde_json::from_str(&content)?;

        for key in keys {
            assert!(json.get(key).is_some(), "JSON should contain key '{}': {}", key, path.display());
        }

        Ok(())
    }

    /// Assert that the ledger passes every consistency check
    pub fn assert_ledger_consistent(ledger: &Ledger) {
        let report = ledger.verify().expect("verification should run");
        assert!(report.is_ok(), "ledger should be consistent: {:?}", report.issues);
    }
}
