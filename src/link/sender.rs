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

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use super::{LinkCore, LinkEndpoint, LinkOutput, LinkState};
use crate::protocol::{
    Attach, DeliveryState, Detach, Disposition, Flow, Role, Source, Target, Transfer,
};
use crate::service::LinkConfig;
use crate::session::SessionState;
use crate::{AppError, AppResult};

/// Final state of a delivery sent on this link.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// the peer settled the delivery, with the outcome it reported
    Settled(Option<DeliveryState>),
    /// not settled within the send timeout
    Expired,
}

#[derive(Debug)]
struct PendingDelivery {
    delivery_tag: Bytes,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct SenderLink {
    core: LinkCore,
    send_timeout: Option<Duration>,
    next_tag: u64,
    unsettled: HashMap<u32, PendingDelivery>,
    outcomes: HashMap<u32, DeliveryOutcome>,
}

impl SenderLink {
    pub fn new(
        name: String,
        handle: u32,
        source: Option<Source>,
        target: Option<Target>,
        config: &LinkConfig,
    ) -> AppResult<SenderLink> {
        Ok(SenderLink {
            core: LinkCore::new(name, handle, Role::Sender, source, target, config)?,
            send_timeout: config.send_timeout_ms.map(Duration::from_millis),
            next_tag: 0,
            unsettled: HashMap::new(),
            outcomes: HashMap::new(),
        })
    }

    pub fn link_credit(&self) -> u32 {
        self.core.link_credit
    }

    pub fn delivery_count(&self) -> u32 {
        self.core.delivery_count
    }

    pub fn unsettled_count(&self) -> usize {
        self.unsettled.len()
    }

    pub fn outcome(&self, delivery_id: u32) -> Option<&DeliveryOutcome> {
        self.outcomes.get(&delivery_id)
    }

    pub fn take_outcome(&mut self, delivery_id: u32) -> Option<DeliveryOutcome> {
        self.outcomes.remove(&delivery_id)
    }

    /// Builds the transfer for one message. `Ok(None)` means the receiver
    /// has granted no credit.
    pub fn prepare_transfer(&mut self, payload: Bytes, settled: bool) -> AppResult<Option<Transfer>> {
        if self.core.state != LinkState::Attached {
            return Err(AppError::IllegalStateError(format!(
                "link '{}' is not attached: {:?}",
                self.core.name, self.core.state
            )));
        }
        if let Some(limit) = self.core.remote_max_message_size.filter(|limit| *limit > 0) {
            if payload.len() as u64 > limit {
                return Err(AppError::InvalidValue(format!(
                    "message of {} bytes exceeds the peer's limit of {}",
                    payload.len(),
                    limit
                )));
            }
        }
        if self.core.link_credit == 0 {
            return Ok(None);
        }
        let delivery_tag = Bytes::copy_from_slice(&self.next_tag.to_be_bytes());
        self.next_tag = self.next_tag.wrapping_add(1);
        Ok(Some(Transfer {
            handle: self.core.handle,
            delivery_tag: Some(delivery_tag),
            message_format: Some(0),
            settled: Some(settled),
            payload,
            ..Default::default()
        }))
    }

    /// Books a transfer the session has put on the wire.
    pub fn on_transfer_sent(&mut self, delivery_id: u32, transfer: &Transfer, now: Instant) {
        self.core.link_credit = self.core.link_credit.saturating_sub(1);
        self.core.delivery_count = self.core.delivery_count.wrapping_add(1);
        // pre-settled deliveries have no outcome to report
        if transfer.settled != Some(true) {
            self.unsettled.insert(
                delivery_id,
                PendingDelivery {
                    delivery_tag: transfer.delivery_tag.clone().unwrap_or_default(),
                    sent_at: now,
                },
            );
        }
    }

    fn settle(&mut self, delivery_id: u32, state: Option<DeliveryState>) {
        if let Some(pending) = self.unsettled.remove(&delivery_id) {
            debug!(
                "Link '{}' delivery {} (tag {:?}) settled: {:?}",
                self.core.name, delivery_id, pending.delivery_tag, state
            );
            self.outcomes
                .insert(delivery_id, DeliveryOutcome::Settled(state));
        }
    }
}

impl LinkEndpoint for SenderLink {
    fn core(&self) -> &LinkCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut LinkCore {
        &mut self.core
    }

    fn on_session_state_change(&mut self, state: SessionState) -> Vec<LinkOutput> {
        self.core.on_session_state_change(state)
    }

    fn evaluate_status(&mut self, now: Instant) -> Vec<LinkOutput> {
        let Some(timeout) = self.send_timeout else {
            return Vec::new();
        };
        let expired: Vec<u32> = self
            .unsettled
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for delivery_id in expired {
            warn!(
                "Link '{}' delivery {} not settled within {:?}",
                self.core.name, delivery_id, timeout
            );
            self.unsettled.remove(&delivery_id);
            self.outcomes.insert(delivery_id, DeliveryOutcome::Expired);
        }
        Vec::new()
    }

    fn incoming_attach(&mut self, attach: &Attach) -> Vec<LinkOutput> {
        let mut outputs = Vec::new();
        self.core.incoming_attach(attach, &mut outputs);
        outputs
    }

    fn incoming_flow(&mut self, flow: &Flow) -> Vec<LinkOutput> {
        if let Some(credit) = flow.link_credit {
            // credit = delivery-count(rcv) + link-credit(rcv) - delivery-count(snd)
            let receiver_count = flow.delivery_count.unwrap_or(self.core.delivery_count);
            let limit = receiver_count.wrapping_add(credit);
            let available = limit.wrapping_sub(self.core.delivery_count) as i32;
            self.core.link_credit = available.max(0) as u32;
        }
        let mut outputs = Vec::new();
        if flow.drain && self.core.link_credit > 0 {
            // nothing is queued on this side, so draining uses up all credit
            self.core.delivery_count = self
                .core
                .delivery_count
                .wrapping_add(self.core.link_credit);
            self.core.link_credit = 0;
            outputs.push(LinkOutput::Flow(Flow {
                drain: true,
                ..self.core.flow_frame()
            }));
        } else if flow.echo {
            outputs.push(LinkOutput::Flow(self.core.flow_frame()));
        }
        outputs
    }

    fn incoming_transfer(&mut self, transfer: Transfer) -> AppResult<Vec<LinkOutput>> {
        Err(AppError::MalformedProtocol(format!(
            "transfer on handle {} received by sending link '{}'",
            transfer.handle, self.core.name
        )))
    }

    fn incoming_disposition(&mut self, disposition: &Disposition) -> Vec<LinkOutput> {
        if disposition.role != Role::Receiver {
            return Vec::new();
        }
        let covered: Vec<u32> = self
            .unsettled
            .keys()
            .copied()
            .filter(|id| disposition.covers(*id))
            .collect();
        if covered.is_empty() {
            return Vec::new();
        }
        let terminal = disposition
            .state
            .as_ref()
            .map(DeliveryState::is_terminal)
            .unwrap_or(false);
        if !disposition.settled && !terminal {
            return Vec::new();
        }
        for delivery_id in &covered {
            self.settle(*delivery_id, disposition.state.clone());
        }
        if disposition.settled {
            return Vec::new();
        }
        // the receiver settles second, confirm our side
        vec![LinkOutput::Disposition(Disposition {
            role: Role::Sender,
            first: disposition.first,
            last: disposition.last,
            settled: true,
            state: disposition.state.clone(),
            batchable: false,
        })]
    }

    fn incoming_detach(&mut self, detach: &Detach) -> Vec<LinkOutput> {
        self.core.incoming_detach(detach)
    }
}
