//! Request/response handler for the directed pull protocol

use crate::buffer::PayloadBuffer;
use crate::ports::{read_height, Committer, Gossip, PullBody, PullMessage};
use ledger_gossip_core::wire::{validate_ascending, validate_range};
use ledger_gossip_core::{ChannelId, GossipMessage, PeerId, PullRequest, PullResponse};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Serves peers' pull requests and buffers the responses to our own
pub struct PullHandler {
    channel: ChannelId,
    committer: Arc<dyn Committer>,
    gossip: Arc<dyn Gossip>,
    buffer: Arc<PayloadBuffer>,
    batch_size: u64,
}

impl PullHandler {
    pub fn new(
        channel: ChannelId,
        committer: Arc<dyn Committer>,
        gossip: Arc<dyn Gossip>,
        buffer: Arc<PayloadBuffer>,
        batch_size: u64,
    ) -> Self {
        Self {
            channel,
            committer,
            gossip,
            buffer,
            batch_size,
        }
    }

    pub async fn run(self, mut stream: mpsc::Receiver<PullMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = stream.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => {
                        debug!("Pull stream of {} closed", self.channel);
                        break;
                    }
                },
            }
        }
    }

    pub async fn handle(&self, message: PullMessage) {
        match message.body {
            PullBody::Request(request) => {
                if let Some(response) = self.serve(&request).await {
                    debug!(
                        "Sending {} blocks of {} to {}",
                        response.payloads.len(),
                        self.channel,
                        message.from
                    );
                    self.gossip
                        .send(GossipMessage::PullResponse(response), &[message.from]);
                }
            }
            PullBody::Response(response) => {
                self.accept(message.from, response);
            }
        }
    }

    /// Build the response to a pull request from the local ledger.
    ///
    /// The range is clipped to `batch_size` entries and to the committed
    /// height. Returns `None` if there is nothing to send.
    pub async fn serve(&self, request: &PullRequest) -> Option<PullResponse> {
        if request.channel != self.channel {
            warn!(
                "Pull request for {} delivered to {}",
                request.channel, self.channel
            );
            return None;
        }
        if let Err(e) = validate_range(request) {
            warn!("Ignoring pull request on {}: {}", self.channel, e);
            return None;
        }

        let height = match read_height(&self.committer).await {
            Ok(height) => height,
            Err(e) => {
                warn!("Cannot serve pull on {}: {}", self.channel, e);
                return None;
            }
        };
        if request.from_seq >= height {
            debug!(
                "Nothing to serve on {} from {} (height {})",
                self.channel, request.from_seq, height
            );
            return None;
        }

        let from = request.from_seq;
        let to = request
            .to_seq
            .min(from.saturating_add(self.batch_size.saturating_sub(1)))
            .min(height - 1);

        let committer = self.committer.clone();
        let payloads =
            match tokio::task::spawn_blocking(move || committer.payloads_in_range(from, to)).await {
                Ok(Ok(payloads)) => payloads,
                Ok(Err(e)) => {
                    warn!("Reading blocks {}..={} of {} failed: {}", from, to, self.channel, e);
                    return None;
                }
                Err(e) => {
                    warn!("Ledger read task of {} failed: {}", self.channel, e);
                    return None;
                }
            };

        if payloads.is_empty() {
            return None;
        }
        Some(PullResponse {
            channel: self.channel.clone(),
            payloads,
        })
    }

    /// Push every payload of a pull response, returning how many were buffered
    pub fn accept(&self, from: PeerId, response: PullResponse) -> usize {
        if response.channel != self.channel {
            warn!(
                "Pull response for {} from {} delivered to {}",
                response.channel, from, self.channel
            );
            return 0;
        }
        if !validate_ascending(&response.payloads) {
            debug!("Pull response from {} is not in ascending order", from);
        }

        let total = response.payloads.len();
        let mut accepted = 0;
        for payload in response.payloads {
            let seq_num = payload.seq_num;
            match self.buffer.push(payload) {
                Ok(_) => accepted += 1,
                Err(e) => debug!("Ignoring pulled block {} on {}: {}", seq_num, self.channel, e),
            }
        }

        debug!(
            "Buffered {}/{} pulled blocks of {} from {}",
            accepted, total, self.channel, from
        );
        accepted
    }
}
