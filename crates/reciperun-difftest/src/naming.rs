use std::collections::HashMap;

/// Hands out unique names of the form `prefix_N`, counting per prefix.
#[derive(Debug, Clone, Default)]
pub struct NameSequence {
    counters: HashMap<String, u64>,
}

impl NameSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, prefix: &str) -> String {
        let counter = self.counters.entry(prefix.to_string()).or_insert(0);
        let name = format!("{prefix}_{counter}");
        *counter += 1;
        name
    }
}
