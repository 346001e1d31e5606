//! Workspace management for ledger operations

use crate::config::LedgerConfig;
use crate::error::{Result, TabledgerError};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Name of the directory holding a workspace's ledger
pub const LEDGER_DIR: &str = ".tabledger";

const CONFIG_FILE: &str = "config.json";
const DB_FILE: &str = "ledger.duckdb";
const IMAGES_DIR: &str = "images";

/// Manages the .tabledger workspace directory
#[derive(Debug, Clone)]
pub struct LedgerWorkspace {
    /// Project root directory (where .tabledger/ lives)
    pub root: PathBuf,
    /// .tabledger/ directory path
    pub ledger_dir: PathBuf,
    /// .tabledger/images/ directory path
    pub images_dir: PathBuf,
}

impl LedgerWorkspace {
    /// Find an existing workspace at or above `start_dir`
    pub fn find(start_dir: Option<&Path>) -> Result<Self> {
        let current_dir = std::env::current_dir()?;
        let start = start_dir.unwrap_or(&current_dir);

        Self::find_existing(start)?.ok_or_else(|| {
            TabledgerError::workspace(format!(
                "No ledger found at or above {}. Run 'tabledger init' first.",
                start.display()
            ))
        })
    }

    /// Find existing workspace or create a new one
    pub fn find_or_create(start_dir: Option<&Path>) -> Result<Self> {
        let current_dir = std::env::current_dir()?;
        let start = start_dir.unwrap_or(&current_dir);

        if let Some(workspace) = Self::find_existing(start)? {
            return Ok(workspace);
        }
        Self::create_new(start.to_path_buf(), None)
    }

    /// Walk up the directory tree looking for .tabledger
    fn find_existing(start_dir: &Path) -> Result<Option<Self>> {
        let mut current = start_dir;

        loop {
            let ledger_dir = current.join(LEDGER_DIR);
            if ledger_dir.is_dir() {
                return Ok(Some(Self::from_root(current.to_path_buf())));
            }

            // A repository root bounds the search
            if current.join(".git").exists() {
                break;
            }

            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }

        Ok(None)
    }

    /// Create a new workspace in `root`, writing `config` or the default one
    pub fn create_new(root: PathBuf, config: Option<LedgerConfig>) -> Result<Self> {
        let workspace = Self::from_root(root);

        fs::create_dir_all(&workspace.ledger_dir)?;
        fs::create_dir_all(&workspace.images_dir)?;

        workspace.write_config(config.unwrap_or_default(), false)?;
        workspace.ensure_gitignore()?;

        log::info!("Created ledger workspace at: {}", workspace.root.display());
        Ok(workspace)
    }

    pub fn from_root(root: PathBuf) -> Self {
        let ledger_dir = root.join(LEDGER_DIR);
        let images_dir = ledger_dir.join(IMAGES_DIR);

        Self {
            root,
            ledger_dir,
            images_dir,
        }
    }

    pub fn exists(&self) -> bool {
        self.ledger_dir.is_dir() && self.config_path().is_file()
    }

    pub fn config_path(&self) -> PathBuf {
        self.ledger_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.ledger_dir.join(DB_FILE)
    }

    /// Path of a materialized image archive
    pub fn image_path(&self, archive_name: &str) -> PathBuf {
        self.images_dir.join(archive_name)
    }

    pub fn load_config(&self) -> Result<LedgerConfig> {
        if !self.config_path().exists() {
            return Err(TabledgerError::workspace(format!(
                "Missing {}; is {} a ledger workspace?",
                self.config_path().display(),
                self.root.display()
            )));
        }
        LedgerConfig::load(&self.config_path())
    }

    /// Write the configuration, keeping an existing one unless forced
    pub fn write_config(&self, config: LedgerConfig, force: bool) -> Result<()> {
        let config_path = self.config_path();
        if config_path.exists() && !force {
            return Ok(());
        }
        config.save(&config_path)
    }

    /// Ensure .gitignore keeps the database and archives out of version control
    pub fn ensure_gitignore(&self) -> Result<()> {
        let gitignore_path = self.root.join(".gitignore");
        let ledger_ignore = format!(
            "# Ledger database and image archives\n{dir}/{db}*\n{dir}/{images}/\n",
            dir = LEDGER_DIR,
            db = DB_FILE,
            images = IMAGES_DIR
        );
        let marker = format!("{}/{}", LEDGER_DIR, DB_FILE);

        if gitignore_path.exists() {
            let content = fs::read_to_string(&gitignore_path)?;
            if !content.contains(&marker) {
                let new_content = if content.ends_with('\n') {
                    format!("{}\n{}", content, ledger_ignore)
                } else {
                    format!("{}\n\n{}", content, ledger_ignore)
                };
                fs::write(gitignore_path, new_content)?;
                log::info!("Updated .gitignore with ledger entries");
            }
        } else {
            fs::write(gitignore_path, ledger_ignore)?;
            log::info!("Created .gitignore with ledger entries");
        }

        Ok(())
    }

    /// Sizes of the database and the image archives on disk
    pub fn stats(&self) -> Result<WorkspaceStats> {
        let mut stats = WorkspaceStats::default();

        for entry in WalkDir::new(&self.ledger_dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_file() && name.starts_with(DB_FILE) {
                stats.database_size += entry.metadata()?.len();
            }
        }

        if self.images_dir.exists() {
            for entry in WalkDir::new(&self.images_dir) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    stats.archive_count += 1;
                    stats.total_archive_size += entry.metadata()?.len();
                }
            }
        }

        Ok(stats)
    }
}

/// On-disk footprint of a workspace
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct WorkspaceStats {
    pub database_size: u64,
    pub archive_count: usize,
    pub total_archive_size: u64,
}
