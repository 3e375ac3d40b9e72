use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

/// Point-in-time depth of one client's queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDepth {
    pub client: String,
    pub unacked: usize,
    pub reserved: usize,
    pub waiters: usize,
}

/// Anything that can report per-client queue depths to the sampler.
pub trait QueueDepths: Send + Sync {
    fn queue_depths(&self) -> Vec<ClientDepth>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSample {
    pub unacked_message_in_memory_count: u64,
    pub reserved_message_in_memory_count: u64,
    pub pulled_operations_count: u64,
    pub acked_operations_count: u64,
    pub unreserved_operations_count: u64,
    pub dropped_operations_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub publish_operations_count: u64,
    pub clients: BTreeMap<String, ClientSample>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub items_in_memory_history: Vec<Sample>,
    pub items_in_memory_known_clients: Vec<String>,
    pub sample_count: u64,
}

#[derive(Debug, Default)]
struct HistoryState {
    samples: VecDeque<Sample>,
    // first-seen order, never shrinks
    known_clients: Vec<String>,
    sample_count: u64,
}

/// Bounded ring of samples; the oldest sample is dropped once `max_len`
/// is reached.
#[derive(Debug)]
pub struct StatsHistory {
    max_len: usize,
    state: Mutex<HistoryState>,
}

impl StatsHistory {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            state: Mutex::new(HistoryState::default()),
        }
    }

    pub fn push(&self, sample: Sample) {
        let mut state = self.state.lock();

        for client in sample.clients.keys() {
            if !state.known_clients.iter().any(|known| known == client) {
                state.known_clients.push(client.clone());
            }
        }

        while state.samples.len() >= self.max_len {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);
        state.sample_count += 1;
    }

    pub fn sample_count(&self) -> u64 {
        self.state.lock().sample_count
    }

    pub fn report(&self) -> StatsReport {
        let state = self.state.lock();
        StatsReport {
            items_in_memory_history: state.samples.iter().cloned().collect(),
            items_in_memory_known_clients: state.known_clients.clone(),
            sample_count: state.sample_count,
        }
    }
}
