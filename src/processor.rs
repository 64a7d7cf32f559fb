// The write-transfer state machine, free of any socket handling.
//
// The connection handler feeds every datagram received from the transfer's peer into
// WriteProcessor::process_packet and carries out the ResultAction it gets back. Keeping the
// state machine sans-io lets every protocol decision be tested without a network.

use crate::request::Request;
use crate::tftp::{self, CodecError, ErrorCode};
use crate::validate;

/// Where a write transfer stands.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    /// ACK 0 has gone out and no DATA has been accepted yet.
    AwaitingFirstData,
    /// Blocks before the contained number have been stored.
    AwaitingData(u16),
    Complete,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// The peer stopped answering.
    TimedOut,
    /// The peer sent an ERROR packet.
    Cancelled { code: u16, message: String },
    /// The peer sent something that is not an acceptable DATA packet.
    IllegalPacket(validate::ValidationError),
}

/// Represents an action that the caller of WriteProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(tftp::Packet),

    /// Caller should send the final packet; the received bytes are ready to be handed off.
    Finish(tftp::Packet),
}

#[derive(Debug)]
pub struct WriteProcessor {
    file_name: String,
    curr_block: u16,
    received: Vec<u8>,
    state: TransferState,
}

impl WriteProcessor {
    pub fn new(request: &Request) -> WriteProcessor {
        WriteProcessor {
            file_name: request.file_name().to_string(),
            curr_block: 1,
            received: Vec::new(),
            state: TransferState::AwaitingFirstData,
        }
    }

    /// The packet that opens the transfer.
    pub fn first_packet(&self) -> tftp::Packet {
        tftp::Packet::Ack { block: 0 }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// The block number the next in-order DATA packet must carry.
    pub fn expected_block(&self) -> u16 {
        self.curr_block
    }

    pub fn received(&self) -> &[u8] {
        &self.received
    }

    pub fn is_complete(&self) -> bool {
        self.state == TransferState::Complete
    }

    /// Hands over the assembled bytes once the transfer is complete.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self.state {
            TransferState::Complete => Some(self.received),
            _ => None,
        }
    }

    /// Records that the peer never answered.
    pub fn time_out(&mut self) {
        self.state = TransferState::Aborted(AbortReason::TimedOut);
    }

    /// Given an incoming datagram from the transfer's peer, processes it and describes the
    /// action the caller should take.
    ///
    /// An `Err` means the codec disagreed with the validator about a packet, which is a bug.
    pub fn process_packet(&mut self, buf: &[u8]) -> Result<ResultAction, CodecError> {
        if let Err(reason) = validate::verify_data(buf, self.curr_block) {
            if validate::verify_error(buf).is_ok() {
                let code = tftp::decode_error_code(buf)?;
                let message = tftp::decode_error_message(buf)?;
                let log = format!("Client sent error packet: code: {code}, message: '{message}'");
                self.state = TransferState::Aborted(AbortReason::Cancelled { code, message });
                return Ok(ResultAction::CloseConnection(Some(log)));
            }

            self.state = TransferState::Aborted(AbortReason::IllegalPacket(reason));
            return Ok(ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: ErrorCode::Illegal,
                message: format!(
                    "{} could not be transferred because of the following error: {reason} \
                    (server expected a DATA packet with block#: {})",
                    self.file_name, self.curr_block
                ),
            }));
        }

        let block = tftp::decode_block_number(buf)?;
        let data = tftp::decode_data(buf)?;
        let last = data.len() < tftp::DATA_BUFFER_SIZE;

        // Anything behind the expected block is a retransmission: acknowledge it again, but
        // store nothing and keep waiting for the same block.
        if validate::check_in_order(buf, self.curr_block) {
            self.received.extend_from_slice(data);
            self.curr_block = self.curr_block.wrapping_add(1);
            self.state = TransferState::AwaitingData(self.curr_block);
        }

        let ack = tftp::Packet::Ack { block };
        if last {
            self.state = TransferState::Complete;
            Ok(ResultAction::Finish(ack))
        } else {
            Ok(ResultAction::SendPacketAndAwait(ack))
        }
    }
}
