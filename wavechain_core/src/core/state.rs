use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;

/// Maximum number of transitions kept per machine
pub const HISTORY_LIMIT: usize = 100;

/// Processing stage of a node; exactly one is active at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    Idle,
    CollectSignal,
    DriveWavemaker,
    SendData,
    /// Reserved for a dedicated receive stage; no transition leads here
    ReceiveData,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Idle => "IDLE",
            MachineState::CollectSignal => "COLLECT_SIGNAL",
            MachineState::DriveWavemaker => "DRIVE_WAVEMAKER",
            MachineState::SendData => "SEND_DATA",
            MachineState::ReceiveData => "RECEIVE_DATA",
        }
    }

    /// True while a cycle holds the node
    pub fn is_busy(&self) -> bool {
        !matches!(self, MachineState::Idle)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: MachineState,
    pub to: MachineState,
    pub at: Instant,
}

/// Bounded record of recent transitions, oldest dropped first
#[derive(Debug, Default)]
pub struct TransitionHistory {
    entries: VecDeque<Transition>,
}

impl TransitionHistory {
    pub fn record(&mut self, transition: Transition) {
        self.entries.push_back(transition);
        if self.entries.len() > HISTORY_LIMIT {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&Transition> {
        self.entries.back()
    }

    /// Visited states in order, starting with the first recorded origin
    pub fn path(&self) -> Vec<MachineState> {
        let mut path = Vec::with_capacity(self.entries.len() + 1);
        if let Some(first) = self.entries.front() {
            path.push(first.from);
        }
        path.extend(self.entries.iter().map(|t| t.to));
        path
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(MachineState::DriveWavemaker.to_string(), "DRIVE_WAVEMAKER");
        assert_eq!(
            serde_json::to_string(&MachineState::CollectSignal).unwrap(),
            "\"COLLECT_SIGNAL\""
        );
    }

    #[test]
    fn test_history_is_capped() {
        let mut history = TransitionHistory::default();
        let at = Instant::now();
        for n in 0..(HISTORY_LIMIT + 20) {
            let (from, to) = if n % 2 == 0 {
                (MachineState::Idle, MachineState::DriveWavemaker)
            } else {
                (MachineState::DriveWavemaker, MachineState::Idle)
            };
            history.record(Transition { from, to, at });
        }
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.path().len(), HISTORY_LIMIT + 1);
    }
}
