//! Transport operations run off the per-peer lock.
//!
//! Each session owns one worker task that executes queued operations
//! strictly in submission order and posts a [`Completion`] back into the
//! peer inbox. Multi-step operations are a flat chain of named steps; the
//! first failing step ends the chain and is reported with its name.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::candidate::IceCandidate;
use crate::error::TransportError;
use crate::identity::PeerId;
use crate::session::SessionInput;
use crate::transport::{DataChannel, PeerTransport, SdpKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationStep {
    CreateOffer,
    ApplyRemoteOffer,
    CreateAnswer,
    ApplyRemoteAnswer,
    AddCandidate,
    OpenChannel,
}

impl NegotiationStep {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationStep::CreateOffer => "create_offer",
            NegotiationStep::ApplyRemoteOffer => "apply_remote_offer",
            NegotiationStep::CreateAnswer => "create_answer",
            NegotiationStep::ApplyRemoteAnswer => "apply_remote_answer",
            NegotiationStep::AddCandidate => "add_candidate",
            NegotiationStep::OpenChannel => "open_channel",
        }
    }

    /// Failures of these steps leave the candidate or channel path broken
    /// but the negotiated transport intact.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            NegotiationStep::AddCandidate | NegotiationStep::OpenChannel
        )
    }
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum TransportOp {
    CreateOffer,
    AcceptOffer(String),
    AcceptAnswer(String),
    AddCandidate(IceCandidate),
    OpenChannel(String),
}

pub enum OpOutcome {
    OfferReady(String),
    AnswerReady(String),
    AnswerApplied,
    CandidateAdded(IceCandidate),
    ChannelOpened(Arc<dyn DataChannel>),
}

impl fmt::Debug for OpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpOutcome::OfferReady(_) => f.write_str("OfferReady"),
            OpOutcome::AnswerReady(_) => f.write_str("AnswerReady"),
            OpOutcome::AnswerApplied => f.write_str("AnswerApplied"),
            OpOutcome::CandidateAdded(candidate) => {
                f.debug_tuple("CandidateAdded").field(candidate).finish()
            }
            OpOutcome::ChannelOpened(channel) => {
                f.debug_tuple("ChannelOpened").field(&channel.label()).finish()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: NegotiationStep,
    pub error: TransportError,
}

#[derive(Debug)]
pub struct Completion {
    pub generation: u64,
    pub result: Result<OpOutcome, StepFailure>,
}

pub(crate) struct NegotiationWorker {
    ops: mpsc::UnboundedSender<TransportOp>,
    handle: JoinHandle<()>,
}

impl NegotiationWorker {
    pub(crate) fn spawn(
        peer: PeerId,
        generation: u64,
        transport: Arc<dyn PeerTransport>,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        let (ops, mut queue) = mpsc::unbounded_channel::<TransportOp>();
        let handle = tokio::spawn(async move {
            while let Some(op) = queue.recv().await {
                debug!(target = "signaling.negotiation", peer = %peer, generation, op = op_name(&op), "running transport op");
                let result = run(transport.as_ref(), op).await;
                if inbox
                    .send(SessionInput::Completion(Completion { generation, result }))
                    .is_err()
                {
                    break;
                }
            }
        });
        Self { ops, handle }
    }

    /// Returns false once the worker is gone.
    pub(crate) fn submit(&self, op: TransportOp) -> bool {
        self.ops.send(op).is_ok()
    }
}

impl Drop for NegotiationWorker {
    fn drop(&mut self) {
        // cancels whatever operation is in flight
        self.handle.abort();
    }
}

fn op_name(op: &TransportOp) -> &'static str {
    match op {
        TransportOp::CreateOffer => "create_offer",
        TransportOp::AcceptOffer(_) => "accept_offer",
        TransportOp::AcceptAnswer(_) => "accept_answer",
        TransportOp::AddCandidate(_) => "add_candidate",
        TransportOp::OpenChannel(_) => "open_channel",
    }
}

fn failed(step: NegotiationStep) -> impl FnOnce(TransportError) -> StepFailure {
    move |error| StepFailure { step, error }
}

async fn run(transport: &dyn PeerTransport, op: TransportOp) -> Result<OpOutcome, StepFailure> {
    match op {
        TransportOp::CreateOffer => {
            let offer = transport
                .create_offer()
                .await
                .map_err(failed(NegotiationStep::CreateOffer))?;
            Ok(OpOutcome::OfferReady(offer))
        }
        TransportOp::AcceptOffer(sdp) => {
            transport
                .set_remote_description(SdpKind::Offer, &sdp)
                .await
                .map_err(failed(NegotiationStep::ApplyRemoteOffer))?;
            let answer = transport
                .create_answer()
                .await
                .map_err(failed(NegotiationStep::CreateAnswer))?;
            Ok(OpOutcome::AnswerReady(answer))
        }
        TransportOp::AcceptAnswer(sdp) => {
            transport
                .set_remote_description(SdpKind::Answer, &sdp)
                .await
                .map_err(failed(NegotiationStep::ApplyRemoteAnswer))?;
            Ok(OpOutcome::AnswerApplied)
        }
        TransportOp::AddCandidate(candidate) => {
            transport
                .add_ice_candidate(&candidate)
                .await
                .map_err(failed(NegotiationStep::AddCandidate))?;
            Ok(OpOutcome::CandidateAdded(candidate))
        }
        TransportOp::OpenChannel(label) => {
            let channel = transport
                .open_data_channel(&label)
                .await
                .map_err(failed(NegotiationStep::OpenChannel))?;
            Ok(OpOutcome::ChannelOpened(channel))
        }
    }
}
