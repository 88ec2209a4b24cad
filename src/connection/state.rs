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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Start,
    /// protocol headers exchanged
    HdrExch,
    OpenSent,
    Opened,
    CloseRcvd,
    CloseSent,
    Discarding,
    End,
}

impl ConnectionState {
    /// Whether sessions may still put frames on the wire.
    pub fn accepts_session_frames(&self) -> bool {
        matches!(
            self,
            ConnectionState::HdrExch
                | ConnectionState::OpenSent
                | ConnectionState::Opened
                | ConnectionState::CloseRcvd
        )
    }
}
