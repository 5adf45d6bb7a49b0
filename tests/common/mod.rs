#![allow(dead_code, missing_docs, clippy::unwrap_used)]

pub mod mock_fs;

use std::sync::Arc;

use pathfs::{Bridge, Options};

use mock_fs::MockFs;

/// A bridge over a mock backend holding `(path, ino, is_dir)` rows.
pub fn mock_bridge(rows: &[(&str, u64, bool)]) -> Arc<Bridge<MockFs>> {
    Arc::new(Bridge::new(MockFs::with_entries(rows), Options::default()))
}
