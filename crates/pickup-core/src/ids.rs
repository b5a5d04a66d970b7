//! Record ID generation: `<unix-millis>-<8 hex random>`.

use rand::Rng;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Generates ids that never repeat within the process, even when several
/// are issued in the same millisecond.
#[derive(Debug, Default)]
pub struct IdGenerator {
    /// Millisecond of the last id and the suffixes already issued in it.
    issued: Mutex<(i64, HashSet<u32>)>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        if issued.0 != millis {
            issued.0 = millis;
            issued.1.clear();
        }

        let mut rng = rand::thread_rng();
        let suffix = loop {
            let candidate: u32 = rng.gen();
            if issued.1.insert(candidate) {
                break candidate;
            }
        };
        format!("{millis}-{suffix:08x}")
    }
}
