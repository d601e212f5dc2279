//! Test doubles for driving actors without a runtime.

use dqr_common::ActorId;

use crate::messages::{FailureNotice, FinalResponse, Message, Outbox};

/// Outbox that records every message in send order.
#[derive(Debug, Default)]
pub struct RecordingOutbox {
    pub sent: Vec<(ActorId, Message)>,
}

impl Outbox for RecordingOutbox {
    fn send(&mut self, to: ActorId, message: Message) {
        self.sent.push((to, message));
    }
}

impl RecordingOutbox {
    pub fn messages_to(&self, to: ActorId) -> Vec<Message> {
        self.sent
            .iter()
            .filter(|(dest, _)| *dest == to)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn failures(&self, to: ActorId) -> Vec<FailureNotice> {
        self.messages_to(to)
            .into_iter()
            .filter_map(|m| match m {
                Message::Failure(notice) => Some(notice),
                _ => None,
            })
            .collect()
    }

    pub fn final_responses(&self, to: ActorId) -> Vec<FinalResponse> {
        self.messages_to(to)
            .into_iter()
            .filter_map(|m| match m {
                Message::FinalResponse(response) => Some(response),
                _ => None,
            })
            .collect()
    }
}
