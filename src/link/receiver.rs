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

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::{LinkCore, LinkEndpoint, LinkOutput, LinkState};
use crate::protocol::{
    condition, AmqpError, Attach, DeliveryState, Detach, Disposition, Flow, Role, Source, Target,
    Transfer,
};
use crate::service::LinkConfig;
use crate::session::SessionState;
use crate::{AppError, AppResult};

/// A fully reassembled incoming message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub delivery_id: u32,
    pub delivery_tag: Option<Bytes>,
    /// settled by the sender, or by us on auto-accept
    pub settled: bool,
    pub payload: Bytes,
}

#[derive(Debug)]
struct PartialDelivery {
    delivery_id: u32,
    delivery_tag: Option<Bytes>,
    settled: bool,
    payload: BytesMut,
}

#[derive(Debug)]
pub struct ReceiverLink {
    core: LinkCore,
    prefetch: u32,
    auto_accept: bool,
    partial: Option<PartialDelivery>,
    received: VecDeque<ReceivedMessage>,
    /// deliveries waiting for an explicit `settle`
    unsettled: BTreeSet<u32>,
}

impl ReceiverLink {
    pub fn new(
        name: String,
        handle: u32,
        source: Option<Source>,
        target: Option<Target>,
        config: &LinkConfig,
    ) -> AppResult<ReceiverLink> {
        Ok(ReceiverLink {
            core: LinkCore::new(name, handle, Role::Receiver, source, target, config)?,
            prefetch: config.prefetch,
            auto_accept: config.auto_accept,
            partial: None,
            received: VecDeque::new(),
            unsettled: BTreeSet::new(),
        })
    }

    pub fn link_credit(&self) -> u32 {
        self.core.link_credit
    }

    pub fn pop_received(&mut self) -> Option<ReceivedMessage> {
        self.received.pop_front()
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn is_unsettled(&self, delivery_id: u32) -> bool {
        self.unsettled.contains(&delivery_id)
    }

    /// Grants `credit` to the sender, replacing what is left of the current
    /// grant.
    pub fn issue_credit(&mut self, credit: u32) -> AppResult<Vec<LinkOutput>> {
        if self.core.state != LinkState::Attached {
            return Err(AppError::IllegalStateError(format!(
                "link '{}' is not attached: {:?}",
                self.core.name, self.core.state
            )));
        }
        self.core.link_credit = credit;
        Ok(vec![LinkOutput::Flow(self.core.flow_frame())])
    }

    /// Settles a delivery that was not auto-accepted.
    pub fn settle(&mut self, delivery_id: u32, state: DeliveryState) -> AppResult<Vec<LinkOutput>> {
        if !self.unsettled.remove(&delivery_id) {
            return Err(AppError::InvalidValue(format!(
                "delivery {} is not unsettled on link '{}'",
                delivery_id, self.core.name
            )));
        }
        Ok(vec![LinkOutput::Disposition(Disposition {
            role: Role::Receiver,
            first: delivery_id,
            last: None,
            settled: true,
            state: Some(state),
            batchable: false,
        })])
    }

    fn grant_prefetch(&mut self, outputs: &mut Vec<LinkOutput>) {
        if self.prefetch > 0 && self.core.link_credit == 0 {
            self.core.link_credit = self.prefetch;
            outputs.push(LinkOutput::Flow(self.core.flow_frame()));
        }
    }

    fn complete(&mut self, delivery: PartialDelivery, outputs: &mut Vec<LinkOutput>) {
        let mut settled = delivery.settled;
        if !settled {
            if self.auto_accept {
                outputs.push(LinkOutput::Disposition(Disposition {
                    role: Role::Receiver,
                    first: delivery.delivery_id,
                    last: None,
                    settled: true,
                    state: Some(DeliveryState::Accepted),
                    batchable: false,
                }));
                settled = true;
            } else {
                self.unsettled.insert(delivery.delivery_id);
            }
        }
        trace!(
            "Link '{}' received delivery {} ({} bytes)",
            self.core.name,
            delivery.delivery_id,
            delivery.payload.len()
        );
        self.received.push_back(ReceivedMessage {
            delivery_id: delivery.delivery_id,
            delivery_tag: delivery.delivery_tag,
            settled,
            payload: delivery.payload.freeze(),
        });
    }
}

impl LinkEndpoint for ReceiverLink {
    fn core(&self) -> &LinkCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut LinkCore {
        &mut self.core
    }

    fn on_session_state_change(&mut self, state: SessionState) -> Vec<LinkOutput> {
        if matches!(state, SessionState::Discarding | SessionState::Unmapped) {
            self.partial = None;
        }
        self.core.on_session_state_change(state)
    }

    fn evaluate_status(&mut self, _now: Instant) -> Vec<LinkOutput> {
        Vec::new()
    }

    fn incoming_attach(&mut self, attach: &Attach) -> Vec<LinkOutput> {
        let mut outputs = Vec::new();
        if attach.role == Role::Sender {
            self.core.delivery_count = attach.initial_delivery_count.unwrap_or(0);
        }
        if self.core.incoming_attach(attach, &mut outputs) {
            self.core.link_credit = 0;
            self.grant_prefetch(&mut outputs);
        }
        outputs
    }

    fn incoming_flow(&mut self, flow: &Flow) -> Vec<LinkOutput> {
        let mut outputs = Vec::new();
        if let Some(sender_count) = flow.delivery_count {
            // the sender moved its count past ours by draining credit
            let advanced = sender_count.wrapping_sub(self.core.delivery_count);
            if (advanced as i32) > 0 {
                self.core.link_credit = self.core.link_credit.saturating_sub(advanced);
                self.core.delivery_count = sender_count;
            }
        }
        if flow.echo {
            outputs.push(LinkOutput::Flow(self.core.flow_frame()));
        }
        outputs
    }

    fn incoming_transfer(&mut self, transfer: Transfer) -> AppResult<Vec<LinkOutput>> {
        let mut outputs = Vec::new();
        if matches!(self.core.state, LinkState::DetachSent | LinkState::Error) {
            trace!(
                "Link '{}' drops a transfer while detaching",
                self.core.name
            );
            return Ok(outputs);
        }
        let mut delivery = match self.partial.take() {
            Some(partial) => partial,
            None => {
                let delivery_id = transfer.delivery_id.ok_or_else(|| {
                    AppError::MalformedProtocol(format!(
                        "first transfer of a delivery on link '{}' has no delivery id",
                        self.core.name
                    ))
                })?;
                self.core.delivery_count = self.core.delivery_count.wrapping_add(1);
                self.core.link_credit = self.core.link_credit.saturating_sub(1);
                PartialDelivery {
                    delivery_id,
                    delivery_tag: transfer.delivery_tag.clone(),
                    settled: transfer.settled.unwrap_or(false),
                    payload: BytesMut::new(),
                }
            }
        };
        if transfer.aborted {
            debug!(
                "Link '{}' delivery {} aborted by sender",
                self.core.name, delivery.delivery_id
            );
        } else {
            if transfer.settled == Some(true) {
                delivery.settled = true;
            }
            let size = (delivery.payload.len() + transfer.payload.len()) as u64;
            if let Some(limit) = self.core.max_message_size.filter(|limit| *limit > 0) {
                if size > limit {
                    warn!(
                        "Link '{}' delivery {} grew to {} bytes, over the limit of {}",
                        self.core.name, delivery.delivery_id, size, limit
                    );
                    let error = AmqpError::new(
                        condition::MESSAGE_SIZE_EXCEEDED,
                        format!("message exceeds {} bytes", limit),
                    );
                    return Ok(self.core.detach(true, Some(error)));
                }
            }
            delivery.payload.extend_from_slice(&transfer.payload);
            if transfer.more {
                self.partial = Some(delivery);
            } else {
                self.complete(delivery, &mut outputs);
            }
        }
        self.grant_prefetch(&mut outputs);
        Ok(outputs)
    }

    fn incoming_disposition(&mut self, disposition: &Disposition) -> Vec<LinkOutput> {
        if disposition.role == Role::Sender && disposition.settled {
            self.unsettled.retain(|id| !disposition.covers(*id));
        }
        Vec::new()
    }

    fn incoming_detach(&mut self, detach: &Detach) -> Vec<LinkOutput> {
        self.partial = None;
        self.core.incoming_detach(detach)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached_receiver(config: &LinkConfig) -> (ReceiverLink, Vec<LinkOutput>) {
        let mut receiver =
            ReceiverLink::new("in".into(), 2, Some(Source::new("q")), None, config).unwrap();
        receiver.on_session_state_change(SessionState::Mapped);
        let mut peer = receiver.core().attach_frame();
        peer.role = Role::Sender;
        peer.handle = 0;
        peer.initial_delivery_count = Some(0);
        let outputs = receiver.incoming_attach(&peer);
        (receiver, outputs)
    }

    fn transfer(delivery_id: Option<u32>, payload: &'static [u8], more: bool) -> Transfer {
        Transfer {
            handle: 0,
            delivery_id,
            delivery_tag: delivery_id.map(|id| Bytes::copy_from_slice(&id.to_be_bytes())),
            settled: Some(false),
            more,
            payload: Bytes::from_static(payload),
            ..Default::default()
        }
    }

    #[test]
    fn test_prefetch_granted_on_attach() {
        let config = LinkConfig {
            prefetch: 10,
            ..LinkConfig::default()
        };
        let (receiver, outputs) = attached_receiver(&config);
        assert_eq!(receiver.state(), LinkState::Attached);
        match outputs.as_slice() {
            [LinkOutput::Flow(flow)] => {
                assert_eq!(flow.handle, Some(2));
                assert_eq!(flow.link_credit, Some(10));
                assert_eq!(flow.delivery_count, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_multi_frame_delivery_auto_accepted() {
        let (mut receiver, _) = attached_receiver(&LinkConfig::default());
        assert!(receiver
            .incoming_transfer(transfer(Some(3), b"hel", true))
            .unwrap()
            .is_empty());
        assert_eq!(receiver.received_count(), 0);

        let outputs = receiver
            .incoming_transfer(transfer(None, b"lo", false))
            .unwrap();
        assert!(matches!(
            outputs.as_slice(),
            [LinkOutput::Disposition(d)] if d.first == 3 && d.settled
                && d.state == Some(DeliveryState::Accepted)
        ));
        let message = receiver.pop_received().unwrap();
        assert_eq!(message.delivery_id, 3);
        assert_eq!(message.payload, Bytes::from_static(b"hello"));
        assert!(message.settled);
        assert_eq!(receiver.link_credit(), 299);
    }

    #[test]
    fn test_aborted_delivery_dropped() {
        let (mut receiver, _) = attached_receiver(&LinkConfig::default());
        receiver
            .incoming_transfer(transfer(Some(1), b"part", true))
            .unwrap();
        let mut abort = transfer(None, b"", false);
        abort.aborted = true;
        assert!(receiver.incoming_transfer(abort).unwrap().is_empty());
        assert!(receiver.pop_received().is_none());

        receiver
            .incoming_transfer(transfer(Some(2), b"next", false))
            .unwrap();
        assert_eq!(receiver.pop_received().unwrap().delivery_id, 2);
    }

    #[test]
    fn test_credit_refilled_when_exhausted() {
        let config = LinkConfig {
            prefetch: 2,
            ..LinkConfig::default()
        };
        let (mut receiver, _) = attached_receiver(&config);
        receiver
            .incoming_transfer(transfer(Some(0), b"a", false))
            .unwrap();
        let outputs = receiver
            .incoming_transfer(transfer(Some(1), b"b", false))
            .unwrap();
        let flow = outputs.iter().find_map(|o| match o {
            LinkOutput::Flow(flow) => Some(flow),
            _ => None,
        });
        let flow = flow.expect("credit refill");
        assert_eq!(flow.link_credit, Some(2));
        assert_eq!(flow.delivery_count, Some(2));
    }

    #[test]
    fn test_manual_settlement() {
        let config = LinkConfig {
            auto_accept: false,
            ..LinkConfig::default()
        };
        let (mut receiver, _) = attached_receiver(&config);
        let outputs = receiver
            .incoming_transfer(transfer(Some(8), b"x", false))
            .unwrap();
        assert!(outputs.is_empty());
        assert!(receiver.is_unsettled(8));
        assert!(!receiver.pop_received().unwrap().settled);

        let outputs = receiver
            .settle(8, DeliveryState::Rejected { error: None })
            .unwrap();
        assert!(matches!(outputs.as_slice(), [LinkOutput::Disposition(d)] if d.first == 8));
        assert!(receiver.settle(8, DeliveryState::Accepted).is_err());
    }

    #[test]
    fn test_issue_credit() {
        let (mut receiver, _) = attached_receiver(&LinkConfig::default());
        let outputs = receiver.issue_credit(5).unwrap();
        assert!(matches!(outputs.as_slice(), [LinkOutput::Flow(f)] if f.link_credit == Some(5)));

        let mut detached =
            ReceiverLink::new("x".into(), 1, None, None, &LinkConfig::default()).unwrap();
        assert!(detached.issue_credit(5).is_err());
    }

    #[test]
    fn test_sender_drain_consumes_credit() {
        let config = LinkConfig {
            prefetch: 0,
            ..LinkConfig::default()
        };
        let (mut receiver, _) = attached_receiver(&config);
        receiver.issue_credit(4).unwrap();
        receiver.incoming_flow(&Flow {
            handle: Some(0),
            delivery_count: Some(4),
            link_credit: Some(0),
            drain: true,
            ..Default::default()
        });
        assert_eq!(receiver.link_credit(), 0);
    }

    #[test]
    fn test_oversized_delivery_detaches_link() {
        let config = LinkConfig {
            max_message_size: Some(6),
            ..LinkConfig::default()
        };
        let (mut receiver, _) = attached_receiver(&config);
        assert!(receiver
            .incoming_transfer(transfer(Some(0), b"abcd", true))
            .unwrap()
            .is_empty());

        let outputs = receiver
            .incoming_transfer(transfer(None, b"efgh", true))
            .unwrap();
        let [LinkOutput::Detach(detach)] = outputs.as_slice() else {
            panic!("expected a detach, got {:?}", outputs);
        };
        assert!(detach.closed);
        assert_eq!(
            detach.error.as_ref().map(|e| e.condition.as_str()),
            Some(condition::MESSAGE_SIZE_EXCEEDED)
        );
        assert_eq!(receiver.state(), LinkState::Error);

        // the rest of the delivery is dropped
        assert!(receiver
            .incoming_transfer(transfer(None, b"ij", false))
            .unwrap()
            .is_empty());
        assert!(receiver.pop_received().is_none());
    }

    #[test]
    fn test_message_at_size_limit_delivered() {
        let config = LinkConfig {
            max_message_size: Some(5),
            ..LinkConfig::default()
        };
        let (mut receiver, _) = attached_receiver(&config);
        receiver
            .incoming_transfer(transfer(Some(0), b"hel", true))
            .unwrap();
        receiver
            .incoming_transfer(transfer(None, b"lo", false))
            .unwrap();
        assert_eq!(
            receiver.pop_received().unwrap().payload,
            Bytes::from_static(b"hello")
        );
    }

    #[test]
    fn test_first_transfer_needs_delivery_id() {
        let (mut receiver, _) = attached_receiver(&LinkConfig::default());
        assert!(matches!(
            receiver.incoming_transfer(transfer(None, b"x", false)),
            Err(AppError::MalformedProtocol(_))
        ));
    }
}
