use std::{mem, time::Duration};

use bytes::BytesMut;

use crate::{
    capture::{Destination, Sink},
    error::{Error, Result},
    link::SerialLink,
    log::{BlockHeader, HEADER_SIZE},
    options::Options,
    utils::crc8::Crc8,
};

use super::{
    framer::Reassembly,
    next_seq,
    packet::{read_packet, Packet},
    EndReason, TransferCursor, TransferReport, ACK, NACK,
};

#[derive(Debug)]
pub enum ReceiverState {
    WaitAnnounce,
    WaitHeader {
        region: BytesMut,
        progress: Reassembly,
    },
    ReceivePayload {
        header: BlockHeader,
        progress: Reassembly,
    },
    End(EndReason),
    /// A transition failed; the error was returned from `step`.
    Aborted,
}

impl ReceiverState {
    fn wait_header() -> Self {
        ReceiverState::WaitHeader {
            region: BytesMut::with_capacity(HEADER_SIZE),
            progress: Reassembly::new(HEADER_SIZE),
        }
    }
}

enum Incoming {
    Packet(Packet),
    /// Damaged unit, already NACKed.
    Damaged,
    Silence,
}

/// What to do with an intact packet after sequence checks.
enum Verdict {
    /// Next unit in order.
    Accept(Packet),
    /// Already answered, state unchanged.
    Skip,
    /// The sender's end-of-transfer marker, already acknowledged.
    End,
}

/// Capture side of a transfer. Checks every unit, answers ACK or NACK, and
/// appends validated payload to the destination opened for the session.
pub struct Receiver<L, K: Sink> {
    link: L,
    sink: K,
    dest: Option<K::Dest>,
    crc: Crc8,
    options: Options,

    state: ReceiverState,
    cursor: TransferCursor,
    session_id: Option<u8>,
    expected_seq: u16,
    // Seq of the last accepted unit, re-ACKed if it shows up again.
    last_seq: Option<u16>,

    blocks: u32,
    bytes: u64,
    nacks: u32,
}

impl<L: SerialLink, K: Sink> Receiver<L, K> {
    pub fn new(link: L, sink: K, options: &Options) -> Self {
        Self {
            link,
            sink,
            dest: None,
            crc: Crc8::default(),
            options: options.clone(),
            state: ReceiverState::WaitAnnounce,
            cursor: TransferCursor::default(),
            session_id: None,
            expected_seq: 0,
            last_seq: None,
            blocks: 0,
            bytes: 0,
            nacks: 0,
        }
    }

    pub fn state(&self) -> &ReceiverState {
        &self.state
    }

    pub fn cursor(&self) -> &TransferCursor {
        &self.cursor
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ReceiverState::End(_))
    }

    /// Destination of the announced session, if any.
    pub fn destination(&self) -> Option<&K::Dest> {
        self.dest.as_ref()
    }

    /// Perform one transition. After an error the receiver stays `Aborted`
    /// and the destination is left unfinished.
    pub fn step(&mut self) -> Result<()> {
        let state = mem::replace(&mut self.state, ReceiverState::Aborted);
        self.state = self.transition(state)?;
        Ok(())
    }

    /// Drive the transfer to its end and hand back the finished destination.
    pub fn run(mut self) -> Result<(TransferReport, K::Dest)> {
        loop {
            if let ReceiverState::End(end) = self.state {
                let report = self.report(end)?;
                let dest = self
                    .dest
                    .take()
                    .ok_or_else(|| Error::Protocol("no destination opened".into()))?;
                return Ok((report, dest));
            }
            self.step()?;
        }
    }

    pub fn report(&self, end: EndReason) -> Result<TransferReport> {
        Ok(TransferReport {
            session_id: self.session()?,
            blocks: self.blocks,
            bytes: self.bytes,
            retries: self.nacks,
            end,
        })
    }

    fn transition(&mut self, state: ReceiverState) -> Result<ReceiverState> {
        match state {
            ReceiverState::WaitAnnounce => self.wait_announce(),

            ReceiverState::WaitHeader {
                mut region,
                mut progress,
            } => {
                let at_boundary = progress.received() == 0;
                let timeout = if at_boundary {
                    self.options.idle_timeout()
                } else {
                    self.options.sender_window()
                };

                let packet = match self.receive(Some(timeout))? {
                    Incoming::Packet(packet) => packet,
                    Incoming::Damaged => return Ok(ReceiverState::WaitHeader { region, progress }),
                    Incoming::Silence if at_boundary => {
                        tracing::debug!(
                            "Line idle for {:?} after block {}",
                            timeout,
                            self.blocks
                        );
                        return self.end(EndReason::IdleTimeout);
                    }
                    Incoming::Silence => {
                        return Err(Error::LinkTimeout(format!(
                            "sender silent for {:?} inside header of block {}",
                            timeout, self.cursor.expected_block
                        )))
                    }
                };

                let packet = match self.screen(packet, at_boundary)? {
                    Verdict::Accept(packet) => packet,
                    Verdict::Skip => return Ok(ReceiverState::WaitHeader { region, progress }),
                    Verdict::End => return self.end(EndReason::EndMarker),
                };

                progress.accept(packet.data.len())?;
                region.extend_from_slice(&packet.data);
                if !progress.is_complete() {
                    self.ack(packet.seq)?;
                    return Ok(ReceiverState::WaitHeader { region, progress });
                }

                let header = self.validate_header(&region)?;
                self.ack(packet.seq)?;
                tracing::debug!(
                    "Receive block {}, payload: {}",
                    header.block_number,
                    header.payload_length
                );

                self.cursor.bytes_in_block = 0;
                if header.payload_length == 0 {
                    return Ok(self.finish_block(&header));
                }
                Ok(ReceiverState::ReceivePayload {
                    header,
                    progress: Reassembly::new(header.payload_length as usize),
                })
            }

            ReceiverState::ReceivePayload {
                header,
                mut progress,
            } => {
                let timeout = self.options.sender_window();
                let packet = match self.receive(Some(timeout))? {
                    Incoming::Packet(packet) => packet,
                    Incoming::Damaged => {
                        return Ok(ReceiverState::ReceivePayload { header, progress })
                    }
                    Incoming::Silence => {
                        return Err(Error::LinkTimeout(format!(
                            "sender silent for {:?} inside block {}, {} of {} bytes received",
                            timeout,
                            header.block_number,
                            progress.received(),
                            progress.expected()
                        )))
                    }
                };

                // `screen` refuses the end marker away from a block boundary.
                let packet = match self.screen(packet, false)? {
                    Verdict::Accept(packet) => packet,
                    Verdict::Skip | Verdict::End => {
                        return Ok(ReceiverState::ReceivePayload { header, progress })
                    }
                };

                let len = packet.data.len();
                progress.check(len)?;
                self.destination_mut()?.append(&packet.data)?;
                progress.accept(len)?;
                self.bytes += len as u64;
                self.cursor.bytes_in_block += len;
                self.ack(packet.seq)?;

                if progress.is_complete() {
                    Ok(self.finish_block(&header))
                } else {
                    Ok(ReceiverState::ReceivePayload { header, progress })
                }
            }

            ReceiverState::End(end) => Ok(ReceiverState::End(end)),

            ReceiverState::Aborted => Err(Error::Protocol("receiver already aborted".into())),
        }
    }

    fn wait_announce(&mut self) -> Result<ReceiverState> {
        let timeout = self.options.announce_timeout();
        let packet = match self.receive(timeout)? {
            Incoming::Packet(packet) => packet,
            Incoming::Damaged => return Ok(ReceiverState::WaitAnnounce),
            Incoming::Silence => {
                return Err(Error::LinkTimeout(match timeout {
                    Some(t) => format!("no announcement within {:?}", t),
                    None => "link closed before announcement".into(),
                }))
            }
        };

        let session_id = match (packet.is_announce(), packet.session_id()) {
            (true, Some(id)) => id,
            _ => {
                tracing::debug!("Seq {:#06x} before announcement", packet.seq);
                self.nack()?;
                return Ok(ReceiverState::WaitAnnounce);
            }
        };

        let dest = self.sink.open(session_id)?;
        self.dest = Some(dest);
        self.session_id = Some(session_id);
        tracing::info!("Session {} announced", session_id);

        self.cursor.retries_for_unit = 0;
        self.link.send(&[ACK])?;
        Ok(ReceiverState::wait_header())
    }

    /// Read the next unit. Damaged units are answered here: the rest of the
    /// unit is drained and a NACK sent.
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Incoming> {
        match read_packet(
            &mut self.link,
            &self.crc,
            self.options.chunk_size(),
            timeout,
            self.options.byte_timeout(),
        ) {
            Ok(packet) => Ok(Incoming::Packet(packet)),
            Err(Error::LinkTimeout(_)) => Ok(Incoming::Silence),
            Err(Error::LinkCorruption(reason)) => {
                let dropped = self.link.drain(self.options.byte_timeout())?;
                tracing::debug!("Damaged unit, {}, {} trailing bytes dropped", reason, dropped);
                self.nack()?;
                Ok(Incoming::Damaged)
            }
            Err(e) => Err(e),
        }
    }

    fn screen(&mut self, packet: Packet, at_boundary: bool) -> Result<Verdict> {
        let session_id = self.session()?;

        if packet.is_announce() {
            if packet.session_id() == Some(session_id) {
                tracing::debug!("Repeated announcement, ACK again");
                self.link.send(&[ACK])?;
            } else {
                tracing::warn!("Announcement for another session: {:?}", packet.data);
                self.nack()?;
            }
            return Ok(Verdict::Skip);
        }

        if packet.is_end() {
            if packet.session_id() != Some(session_id) {
                tracing::warn!("End marker for another session: {:?}", packet.data);
                self.nack()?;
                return Ok(Verdict::Skip);
            }
            if !at_boundary {
                return Err(Error::Protocol(format!(
                    "end marker inside block {}",
                    self.cursor.expected_block
                )));
            }
            self.link.send(&[ACK])?;
            return Ok(Verdict::End);
        }

        if Some(packet.seq) == self.last_seq {
            tracing::debug!("Seq {} repeated, ACK lost, ACK again", packet.seq);
            self.link.send(&[ACK])?;
            return Ok(Verdict::Skip);
        }

        if packet.seq != self.expected_seq {
            tracing::warn!(
                "Seq {} out of order, expected {}",
                packet.seq,
                self.expected_seq
            );
            self.nack()?;
            return Ok(Verdict::Skip);
        }

        Ok(Verdict::Accept(packet))
    }

    fn validate_header(&self, region: &[u8]) -> Result<BlockHeader> {
        let session_id = self.session()?;
        let expected = self.cursor.expected_block;

        let header = BlockHeader::decode(region, &self.crc).ok_or_else(|| {
            Error::Protocol(format!("header of block {} fails its crc", expected))
        })?;
        if !header.continues(session_id, expected) {
            return Err(Error::Protocol(format!(
                "header of session {} block {} where session {} block {} was due",
                header.session_id, header.block_number, session_id, expected
            )));
        }
        if header.payload_length as usize > self.options.max_payload() {
            return Err(Error::OversizedPayload {
                block: header.block_number,
                len: header.payload_length as usize,
                max: self.options.max_payload(),
            });
        }
        Ok(header)
    }

    fn finish_block(&mut self, header: &BlockHeader) -> ReceiverState {
        self.blocks += 1;
        self.cursor.bytes_in_block = 0;
        // Block 0xFFFF is the last a session can number; anything after it is
        // rejected by `validate_header`.
        self.cursor.expected_block = header.block_number.wrapping_add(1);
        tracing::trace!("Block {} complete", header.block_number);
        ReceiverState::wait_header()
    }

    fn end(&mut self, end: EndReason) -> Result<ReceiverState> {
        self.destination_mut()?.finish()?;
        tracing::info!(
            "Transfer of session {:?} ended, {} blocks, {} bytes, {} NACKs: {}",
            self.session_id,
            self.blocks,
            self.bytes,
            self.nacks,
            end
        );
        Ok(ReceiverState::End(end))
    }

    fn ack(&mut self, seq: u16) -> Result<()> {
        self.last_seq = Some(seq);
        self.expected_seq = next_seq(seq);
        self.cursor.retries_for_unit = 0;
        self.link.send(&[ACK])
    }

    fn nack(&mut self) -> Result<()> {
        self.nacks += 1;
        self.cursor.retries_for_unit += 1;
        self.link.send(&[NACK])
    }

    fn destination_mut(&mut self) -> Result<&mut K::Dest> {
        self.dest
            .as_mut()
            .ok_or_else(|| Error::Protocol("no destination opened".into()))
    }

    fn session(&self) -> Result<u8> {
        self.session_id
            .ok_or_else(|| Error::Protocol("session not announced yet".into()))
    }
}
