use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// FIFO of rendered log lines. Appends and prefix removal are atomic with respect
/// to each other, so records appended during an upload survive its acknowledgement.
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        self.lines.lock().push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Longest head prefix whose cumulative UTF-8 length stays strictly below `budget`.
    pub fn select_batch(&self, budget: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let mut total = 0usize;
        lines
            .iter()
            .take_while(|line| {
                total = total.saturating_add(line.len());
                total < budget
            })
            .cloned()
            .collect()
    }

    /// Removes up to `count` lines from the head; returns how many were removed.
    pub fn remove_front(&self, count: usize) -> usize {
        let mut lines = self.lines.lock();
        let count = count.min(lines.len());
        lines.drain(..count);
        count
    }

    /// Drops everything; returns the number of discarded lines.
    pub fn clear(&self) -> usize {
        let mut lines = self.lines.lock();
        let dropped = lines.len();
        lines.clear();
        dropped
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// One upload attempt's worth of records plus the labels attached to it.
///
/// Wire form: `{"data": [line, ...], "tags": [{"key": "value"}, ...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogBatch {
    #[serde(rename = "data")]
    pub records: Vec<String>,
    #[serde(rename = "tags", serialize_with = "labels_as_tags")]
    pub labels: BTreeMap<String, String>,
}

impl LogBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.records.iter().map(String::len).sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

struct Tag<'a>(&'a str, &'a str);

impl Serialize for Tag<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.0, self.1)?;
        map.end()
    }
}

fn labels_as_tags<S: Serializer>(
    labels: &BTreeMap<String, String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(labels.iter().map(|(k, v)| Tag(k, v)))
}
