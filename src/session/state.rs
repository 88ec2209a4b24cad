// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unmapped,
    BeginSent,
    BeginRcvd,
    Mapped,
    EndSent,
    EndRcvd,
    Discarding,
}

impl SessionState {
    /// An End has been sent or received, or the session is being torn down.
    pub fn is_ending(&self) -> bool {
        matches!(
            self,
            SessionState::EndSent | SessionState::EndRcvd | SessionState::Discarding
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Okay,
    /// the peer has no room for the delivery right now, try again later
    Busy,
    Error,
}

/// Outcome of one outgoing transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferResult {
    pub outcome: TransferState,
    /// transfer id of the first frame, set when the outcome is `Okay`
    pub delivery_id: Option<u32>,
}

impl TransferResult {
    pub fn okay(delivery_id: u32) -> TransferResult {
        TransferResult {
            outcome: TransferState::Okay,
            delivery_id: Some(delivery_id),
        }
    }
    pub fn busy() -> TransferResult {
        TransferResult {
            outcome: TransferState::Busy,
            delivery_id: None,
        }
    }
    pub fn error() -> TransferResult {
        TransferResult {
            outcome: TransferState::Error,
            delivery_id: None,
        }
    }
}

/// How long a state changing call waits for the peer to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// send and return at once
    NoWait,
    Forever,
    Timeout(Duration),
}

impl WaitMode {
    pub fn is_waiting(&self) -> bool {
        !matches!(self, WaitMode::NoWait)
    }

    /// `None` for an unbounded wait.
    pub fn deadline(&self, start: Instant) -> Option<Instant> {
        match self {
            WaitMode::Timeout(limit) => Some(start + *limit),
            _ => None,
        }
    }
}

/// Result of waiting for a state transition. A timed out wait does not undo
/// the frames already sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    TimedOut,
    NotWaited,
}
