use crate::storage::{DataSink, DataSource};
use crate::tftp;

/// The block-sequencing half of a transfer. It decides what to send next but never touches a
/// socket or a timer; `session::Session` does that.
#[derive(Debug)]
pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

impl PacketProcessor {
    pub fn for_reading(source: Box<dyn DataSource>) -> PacketProcessor {
        PacketProcessor::Read(ReadProcessor::new(source))
    }

    pub fn for_writing(sink: Box<dyn DataSink>) -> PacketProcessor {
        PacketProcessor::Write(WriteProcessor::new(sink))
    }

    /// The packet that answers the request: DATA block 1 for a read, ACK block 0 for a write.
    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.send_next_block().await,
            PacketProcessor::Write(_) => ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 }),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet).await,
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet, keep it for retransmission, and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should send the final packet of a completed transfer and stay around long enough
    /// to send it again if the peer repeats itself.
    SendPacketAndLinger(tftp::Packet),

    /// Caller should send the last packet again, without restarting its timer.
    ResendLast,

    /// Caller should keep waiting for a packet, without restarting its timer.
    RetryRecv,

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(tftp::Packet),
}

fn peer_error(code: &tftp::ErrorCode, message: &str) -> ResultAction {
    ResultAction::CloseConnection(Some(format!(
        "Client sent error packet: code: {:?}, message: '{}'",
        code, message
    )))
}

fn illegal(message: String) -> ResultAction {
    ResultAction::TerminateWithPacket(tftp::Packet::Error { code: tftp::ErrorCode::Illegal, message })
}

#[derive(Debug)]
pub struct ReadProcessor {
    source: Box<dyn DataSource>,
    /// The block number of the DATA packet most recently sent, 0 before the first one.
    curr_block: u16,
    awaiting_final_ack: bool,
}

impl ReadProcessor {
    fn new(source: Box<dyn DataSource>) -> ReadProcessor {
        ReadProcessor {
            source,
            curr_block: 0,
            awaiting_final_ack: false,
        }
    }

    async fn send_next_block(&mut self) -> ResultAction {
        match self.source.read_block().await {
            Ok(data) => {
                self.curr_block = self.curr_block.wrapping_add(1);
                if data.len() < tftp::DATA_BUFFER_SIZE {
                    self.awaiting_final_ack = true;
                }
                ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: self.curr_block, data })
            }
            Err(e) => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: e.kind().into(),
                message: format!("Failed to read from file: {}", e),
            }),
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } if block == self.curr_block => {
                if self.awaiting_final_ack {
                    return ResultAction::CloseConnection(None);
                }
                self.send_next_block().await
            }
            // Duplicated or delayed acks for blocks that were already acknowledged.
            tftp::Packet::Ack { .. } => ResultAction::RetryRecv,
            tftp::Packet::Error { code, message } => peer_error(code, message),
            _ => illegal(format!(
                "Expected to receive an Ack packet, but got {:?} instead",
                packet.op_code()
            )),
        }
    }
}

#[derive(Debug)]
pub struct WriteProcessor {
    sink: Box<dyn DataSink>,
    /// The block number most recently acknowledged, starting at 0 for the request itself.
    curr_block: u16,
    finished: bool,
}

impl WriteProcessor {
    fn new(sink: Box<dyn DataSink>) -> WriteProcessor {
        WriteProcessor { sink, curr_block: 0, finished: false }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } if !self.finished && *block == self.curr_block.wrapping_add(1) => {
                if let Err(e) = self.sink.append(data).await {
                    return ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: e.kind().into(),
                        message: format!("Error writing to file: {}", e),
                    });
                }
                self.curr_block = *block;
                let ack = tftp::Packet::Ack { block: self.curr_block };

                if data.len() == tftp::DATA_BUFFER_SIZE {
                    return ResultAction::SendPacketAndAwait(ack);
                }

                self.finished = true;
                match self.sink.finalize().await {
                    Ok(()) => ResultAction::SendPacketAndLinger(ack),
                    Err(e) => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: e.kind().into(),
                        message: format!("Error finishing file: {}", e),
                    }),
                }
            }
            // A block we already have (its ack got lost) or one we cannot take yet: repeat the last
            // ack so the sender knows where we are, and write nothing.
            tftp::Packet::Data { .. } => ResultAction::ResendLast,
            tftp::Packet::Error { code, message } => peer_error(code, message),
            _ => illegal(format!(
                "Expected to receive a Data packet, but got {:?} instead",
                packet.op_code()
            )),
        }
    }
}
