use std::path::PathBuf;

use clap::Parser;

use crate::journal::CommitPolicy;

pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;
pub const DEFAULT_POOL_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_JOURNAL_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Engine configuration, passed at open. There is no global mutable
/// state: everything an engine instance needs rides in here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding volumes and journal files.
    pub path: PathBuf,
    /// Page size, power of two.
    pub page_size: usize,
    /// Buffer-pool allotment for this page size, in bytes.
    pub buffer_pool_bytes: usize,
    /// Journal rollover threshold.
    pub journal_file_size: u64,
    pub default_commit_policy: CommitPolicy,
    /// Group-commit batching window.
    pub group_commit_window_ms: u64,
    /// Background checkpoint cadence.
    pub checkpoint_interval_ms: u64,
    /// Background fsync cadence for soft commits.
    pub journal_flush_interval_ms: u64,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Config {
        Config {
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_bytes: DEFAULT_POOL_BYTES,
            journal_file_size: DEFAULT_JOURNAL_FILE_SIZE,
            default_commit_policy: CommitPolicy::default(),
            group_commit_window_ms: 2,
            checkpoint_interval_ms: 60_000,
            journal_flush_interval_ms: 50,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Config {
        self.page_size = page_size;
        self
    }

    pub fn buffer_pool_bytes(mut self, bytes: usize) -> Config {
        self.buffer_pool_bytes = bytes;
        self
    }

    pub fn journal_file_size(mut self, bytes: u64) -> Config {
        self.journal_file_size = bytes;
        self
    }

    pub fn commit_policy(mut self, policy: CommitPolicy) -> Config {
        self.default_commit_policy = policy;
        self
    }

    pub fn group_commit_window_ms(mut self, ms: u64) -> Config {
        self.group_commit_window_ms = ms;
        self
    }

    pub fn checkpoint_interval_ms(mut self, ms: u64) -> Config {
        self.checkpoint_interval_ms = ms;
        self
    }
}

/// Options of the `arbor` inspection binary.
#[derive(Parser)]
pub struct DumpConfig {
    #[clap(help = "Path to the engine directory (volumes + journal)")]
    pub dir: PathBuf,

    #[clap(long, help = "Dump every journal record, not just the summary")]
    pub records: bool,

    #[clap(long, help = "Census the pages of the named volume")]
    pub volume: Option<String>,

    #[clap(default_value_t = DEFAULT_PAGE_SIZE, long, help = "Page size the volumes were created with")]
    pub page_size: usize,
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn test_builder() {
        let config = Config::new("/tmp/x").page_size(4096).buffer_pool_bytes(1 << 20);
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.buffer_pool_bytes, 1 << 20);
        assert_eq!(config.path, std::path::PathBuf::from("/tmp/x"));
    }
}
