use std::{mem, time::Duration};

use bytes::Bytes;

use crate::{
    error::{Error, Result},
    link::SerialLink,
    log::{reader::BlockReader, BlockHeader},
    options::Options,
    storage::LogStorage,
    utils::crc8::Crc8,
};

use super::{
    framer::Chunker, next_seq, packet::Packet, EndReason, TransferCursor, TransferReport, Unit,
    ACK, NACK,
};

#[derive(Debug)]
pub enum SenderState {
    Announce,
    ReadHeader,
    SendHeader {
        header: BlockHeader,
        payload: Bytes,
        chunks: Chunker,
    },
    SendPayload {
        header: BlockHeader,
        chunks: Chunker,
    },
    SendEnd(EndReason),
    Done(EndReason),
    /// A transition failed; the error was returned from `step`.
    Aborted,
}

/// Controller side of a transfer. Reads the log block by block and pushes it
/// over the link one acknowledged packet at a time.
pub struct Sender<L, S> {
    link: L,
    reader: BlockReader<S>,
    crc: Crc8,
    options: Options,

    state: SenderState,
    cursor: TransferCursor,
    session_id: Option<u8>,
    // Seq of the next block packet.
    seq: u16,

    blocks: u32,
    bytes: u64,
    retries: u32,
}

impl<L: SerialLink, S: LogStorage> Sender<L, S> {
    pub fn new(link: L, storage: S, options: &Options) -> Self {
        Self {
            link,
            reader: BlockReader::new(storage, options),
            crc: Crc8::default(),
            options: options.clone(),
            state: SenderState::Announce,
            cursor: TransferCursor::default(),
            session_id: None,
            seq: 0,
            blocks: 0,
            bytes: 0,
            retries: 0,
        }
    }

    pub fn state(&self) -> &SenderState {
        &self.state
    }

    pub fn cursor(&self) -> &TransferCursor {
        &self.cursor
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, SenderState::Done(_))
    }

    /// Perform one transition. After an error the sender stays `Aborted`.
    pub fn step(&mut self) -> Result<()> {
        let state = mem::replace(&mut self.state, SenderState::Aborted);
        self.state = self.transition(state)?;
        Ok(())
    }

    /// Drive the transfer to its end.
    pub fn run(mut self) -> Result<TransferReport> {
        loop {
            if let SenderState::Done(end) = self.state {
                return self.report(end);
            }
            self.step()?;
        }
    }

    pub fn report(&self, end: EndReason) -> Result<TransferReport> {
        Ok(TransferReport {
            session_id: self.session()?,
            blocks: self.blocks,
            bytes: self.bytes,
            retries: self.retries,
            end,
        })
    }

    pub fn into_inner(self) -> (L, S) {
        (self.link, self.reader.into_inner())
    }

    fn transition(&mut self, state: SenderState) -> Result<SenderState> {
        match state {
            SenderState::Announce => {
                let session_id = self.reader.read_session_id()?;
                tracing::info!("Announce session {}", session_id);
                self.deliver(Packet::announce(session_id), Unit::Announcement)?;
                self.session_id = Some(session_id);
                Ok(SenderState::ReadHeader)
            }

            SenderState::ReadHeader => self.read_block(),

            SenderState::SendHeader {
                header,
                payload,
                mut chunks,
            } => {
                let unit = Unit::Header {
                    block: header.block_number,
                    offset: chunks.offset(),
                };
                self.deliver(Packet::new(self.seq, chunks.current()), unit)?;
                self.seq = next_seq(self.seq);
                chunks.advance();

                if !chunks.is_done() {
                    return Ok(SenderState::SendHeader {
                        header,
                        payload,
                        chunks,
                    });
                }
                if payload.is_empty() {
                    return self.finish_block(&header);
                }
                Ok(SenderState::SendPayload {
                    header,
                    chunks: Chunker::new(payload, self.options.chunk_size()),
                })
            }

            SenderState::SendPayload { header, mut chunks } => {
                let unit = Unit::Payload {
                    block: header.block_number,
                    offset: chunks.offset(),
                };
                self.deliver(Packet::new(self.seq, chunks.current()), unit)?;
                self.seq = next_seq(self.seq);
                self.cursor.bytes_in_block += chunks.advance();

                if chunks.is_done() {
                    self.finish_block(&header)
                } else {
                    Ok(SenderState::SendPayload { header, chunks })
                }
            }

            SenderState::SendEnd(end) => {
                let session_id = self.session()?;
                // Every block is already acknowledged. A receiver that missed
                // the marker ends on its idle timeout instead.
                if let Err(e) = self.deliver(Packet::end(session_id), Unit::EndMarker) {
                    tracing::warn!("End marker not acknowledged: {}", e);
                }
                tracing::info!(
                    "Transfer of session {} done, {} blocks, {} bytes, {} resends: {}",
                    session_id,
                    self.blocks,
                    self.bytes,
                    self.retries,
                    end
                );
                Ok(SenderState::Done(end))
            }

            SenderState::Done(end) => Ok(SenderState::Done(end)),

            SenderState::Aborted => Err(Error::Protocol("sender already aborted".into())),
        }
    }

    fn read_block(&mut self) -> Result<SenderState> {
        let session_id = self.session()?;
        let expected = self.cursor.expected_block;

        if self.reader.at_end() {
            return self.end_of_log(EndReason::StorageExhausted);
        }
        let header = match self.reader.next_header(&self.crc)? {
            Some(header) => header,
            None => return self.end_of_log(EndReason::NoHeader),
        };
        if header.session_id != session_id {
            return self.end_of_log(EndReason::SessionMismatch {
                found: header.session_id,
            });
        }
        if header.block_number != expected {
            return self.end_of_log(EndReason::BlockGap {
                expected,
                found: header.block_number,
            });
        }

        // Rejects an oversized length before the payload is read.
        let payload = self.reader.next_payload(&header)?;
        tracing::debug!(
            "Send block {}, payload: {}, chunks: {}",
            header.block_number,
            payload.len(),
            self.options.chunk_count(payload.len())
        );

        self.cursor.bytes_in_block = 0;
        let region = Bytes::copy_from_slice(&header.encode(&self.crc));
        Ok(SenderState::SendHeader {
            header,
            payload,
            chunks: Chunker::new(region, self.options.chunk_size()),
        })
    }

    fn finish_block(&mut self, header: &BlockHeader) -> Result<SenderState> {
        self.blocks += 1;
        self.bytes += header.payload_length as u64;
        tracing::trace!("Block {} acknowledged", header.block_number);

        match header.block_number.checked_add(1) {
            Some(next) => {
                self.cursor.expected_block = next;
                self.cursor.bytes_in_block = 0;
                Ok(SenderState::ReadHeader)
            }
            None => self.end_of_log(EndReason::BlockNumbersExhausted),
        }
    }

    fn end_of_log(&mut self, end: EndReason) -> Result<SenderState> {
        tracing::info!(
            "End of log at block {}: {}",
            self.cursor.expected_block,
            end
        );
        if self.options.end_marker() {
            Ok(SenderState::SendEnd(end))
        } else {
            Ok(SenderState::Done(end))
        }
    }

    /// Send `packet` until it is acknowledged, at most `retry_limit` resends.
    fn deliver(&mut self, packet: Packet, unit: Unit) -> Result<()> {
        let raw = packet.encode(&self.crc);
        let attempts = self.options.retry_limit().saturating_add(1);
        self.cursor.retries_for_unit = 0;

        for attempt in 0..attempts {
            if attempt > 0 {
                self.cursor.retries_for_unit = attempt;
                self.retries += 1;
                tracing::debug!("Resend {}, attempt {} of {}", unit, attempt + 1, attempts);
            }

            // A late reply to an earlier attempt must not answer this one.
            let stale = self.link.drain(Duration::ZERO)?;
            if stale > 0 {
                tracing::trace!("Dropped {} stale bytes before {}", stale, unit);
            }

            self.link.send(&raw)?;
            match self.link.recv_byte(Some(self.options.ack_timeout()))? {
                Some(ACK) => return Ok(()),
                Some(NACK) => tracing::debug!("NACK for {}", unit),
                Some(other) => {
                    tracing::debug!("Reply {:#04x} for {}, taken as NACK", other, unit)
                }
                None => tracing::debug!(
                    "No reply for {} within {:?}",
                    unit,
                    self.options.ack_timeout()
                ),
            }
        }

        tracing::warn!("Giving up on {} after {} attempts", unit, attempts);
        Err(Error::RetryExhausted { unit, attempts })
    }

    fn session(&self) -> Result<u8> {
        self.session_id
            .ok_or_else(|| Error::Protocol("session not announced yet".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use bytes::Bytes;

    use crate::{
        link::{channel::ChannelLink, SerialLink},
        log::{writer::LogWriter, BlockHeader},
        options::{Options, OptionsBuilder},
        protocol::{packet::read_packet, ACK, END_SEQ, NACK},
        storage::{LogStorageMut, MemStorage},
        utils::crc8::Crc8,
    };

    use super::*;

    fn test_options() -> Options {
        OptionsBuilder::new()
            .block_size(128)
            .chunk_size(32)
            .retry_limit(2)
            .ack_timeout(Duration::from_millis(60))
            .byte_timeout(Duration::from_millis(5))
            .idle_timeout(Duration::from_millis(200))
            .build()
            .expect("valid options")
    }

    fn image(options: &Options, session_id: u8, blocks: &[&[u8]]) -> anyhow::Result<MemStorage> {
        let mut writer = LogWriter::new(MemStorage::new(16 * options.block_size()), options);
        writer.start_session(session_id)?;
        for block in blocks {
            writer.append(block)?;
        }
        Ok(writer.into_inner())
    }

    /// Answer every packet with `reply` until the link goes quiet, returning
    /// what was received.
    fn answer_all(mut link: ChannelLink, reply: u8) -> Vec<Packet> {
        let crc = Crc8::default();
        let mut seen = Vec::new();
        while let Ok(packet) = read_packet(
            &mut link,
            &crc,
            255,
            Some(Duration::from_millis(300)),
            Duration::from_millis(5),
        ) {
            seen.push(packet);
            if link.send(&[reply]).is_err() {
                break;
            }
        }
        seen
    }

    #[test]
    fn silent_peer_exhausts_retries() -> anyhow::Result<()> {
        let options = test_options();
        let (a, mut b) = ChannelLink::pair();
        let mut sender = Sender::new(a, image(&options, 1, &[b"x"])?, &options);

        let err = sender.step().unwrap_err();
        assert!(
            matches!(
                err,
                Error::RetryExhausted {
                    unit: Unit::Announcement,
                    attempts: 3
                }
            ),
            "{err}"
        );
        assert!(matches!(sender.state(), SenderState::Aborted));
        assert_eq!(sender.cursor().retries_for_unit, 2);
        assert!(sender.step().is_err());

        let crc = Crc8::default();
        let mut count = 0;
        while let Ok(packet) = read_packet(
            &mut b,
            &crc,
            255,
            Some(Duration::ZERO),
            Duration::from_millis(5),
        ) {
            assert_eq!(packet, Packet::announce(1));
            count += 1;
        }
        assert_eq!(count, 3);
        Ok(())
    }

    #[test]
    fn nack_every_time_exhausts_retries() -> anyhow::Result<()> {
        let options = test_options();
        let (a, b) = ChannelLink::pair();
        let sender = Sender::new(a, image(&options, 1, &[b"x"])?, &options);

        let (res, seen) = thread::scope(|s| {
            let peer = s.spawn(move || answer_all(b, NACK));
            let res = sender.run();
            (res, peer.join())
        });
        let seen = seen.map_err(|_| anyhow::anyhow!("peer panicked"))?;

        assert!(matches!(
            res,
            Err(Error::RetryExhausted {
                unit: Unit::Announcement,
                attempts: 3
            })
        ));
        assert_eq!(seen.len(), 3);
        Ok(())
    }

    #[test]
    fn steps_through_states() -> anyhow::Result<()> {
        let options = test_options();
        let (a, b) = ChannelLink::pair();
        let payload = vec![7u8; 40];
        let mut sender = Sender::new(a, image(&options, 9, &[&payload])?, &options);

        let seen = thread::scope(|s| -> anyhow::Result<Vec<Packet>> {
            let peer = s.spawn(move || answer_all(b, ACK));

            assert!(matches!(sender.state(), SenderState::Announce));
            sender.step()?;
            assert!(matches!(sender.state(), SenderState::ReadHeader));
            sender.step()?;
            assert!(matches!(sender.state(), SenderState::SendHeader { .. }));
            sender.step()?;
            assert!(matches!(sender.state(), SenderState::SendPayload { .. }));
            sender.step()?;
            assert_eq!(sender.cursor().bytes_in_block, 32);
            assert!(matches!(sender.state(), SenderState::SendPayload { .. }));
            sender.step()?;
            assert!(matches!(sender.state(), SenderState::ReadHeader));
            assert_eq!(sender.cursor().expected_block, 1);
            sender.step()?;
            assert!(matches!(
                sender.state(),
                SenderState::SendEnd(EndReason::NoHeader)
            ));
            sender.step()?;
            assert!(sender.is_done());

            let report = sender.report(EndReason::NoHeader)?;
            assert_eq!(report.blocks, 1);
            assert_eq!(report.bytes, 40);
            assert_eq!(report.retries, 0);

            drop(sender);
            peer.join().map_err(|_| anyhow::anyhow!("peer panicked"))
        })?;

        let seqs = seen.iter().map(|p| p.seq).collect::<Vec<_>>();
        assert_eq!(seqs, vec![0xFFFF, 0, 1, 2, END_SEQ]);
        assert_eq!(seen[1].data.len(), 6);
        assert_eq!(
            BlockHeader::decode(&seen[1].data, &Crc8::default()),
            Some(BlockHeader::new(9, 0, 40))
        );
        assert_eq!(seen[2].data, Bytes::from(vec![7u8; 32]));
        assert_eq!(seen[3].data, Bytes::from(vec![7u8; 8]));
        Ok(())
    }

    #[test]
    fn oversized_header_aborts_before_sending_it() -> anyhow::Result<()> {
        let options = test_options();
        let crc = Crc8::default();
        let mut storage = MemStorage::new(4 * options.block_size());
        storage.write_at(0, &[4])?;
        let header = BlockHeader::new(4, 0, options.max_payload() as u16 + 1);
        storage.write_at(options.block_address(0), &header.encode(&crc))?;

        let (a, b) = ChannelLink::pair();
        let sender = Sender::new(a, storage, &options);
        let (res, seen) = thread::scope(|s| {
            let peer = s.spawn(move || answer_all(b, ACK));
            let res = sender.run();
            (res, peer.join())
        });
        let seen = seen.map_err(|_| anyhow::anyhow!("peer panicked"))?;

        assert!(matches!(res, Err(Error::OversizedPayload { block: 0, .. })));
        assert_eq!(seen, vec![Packet::announce(4)]);
        Ok(())
    }

    #[test]
    fn end_reasons_from_source() -> anyhow::Result<()> {
        let options = OptionsBuilder::new()
            .block_size(128)
            .chunk_size(32)
            .end_marker(false)
            .ack_timeout(Duration::from_millis(60))
            .byte_timeout(Duration::from_millis(5))
            .idle_timeout(Duration::from_millis(200))
            .build()?;
        let crc = Crc8::default();

        let run = |storage: MemStorage| -> anyhow::Result<TransferReport> {
            let (a, b) = ChannelLink::pair();
            let sender = Sender::new(a, storage, &options);
            thread::scope(|s| {
                s.spawn(move || answer_all(b, ACK));
                Ok(sender.run()?)
            })
        };

        // Older session left behind block 1.
        let mut storage = image(&options, 3, &[b"old-a", b"old-b"])?;
        let mut writer = LogWriter::new(storage, &options);
        writer.start_session(4)?;
        writer.append(b"new")?;
        storage = writer.into_inner();
        let report = run(storage)?;
        assert_eq!(report.end, EndReason::SessionMismatch { found: 3 });
        assert_eq!(report.blocks, 1);

        // Block 1 slot holds a header numbered 5.
        let mut storage = image(&options, 6, &[b"a"])?;
        storage.write_at(
            options.block_address(1),
            &BlockHeader::new(6, 5, 0).encode(&crc),
        )?;
        assert_eq!(
            run(storage)?.end,
            EndReason::BlockGap {
                expected: 1,
                found: 5
            }
        );

        // Exactly three block slots after the session id.
        let mut writer = LogWriter::new(MemStorage::new(4 * options.block_size()), &options);
        writer.start_session(2)?;
        writer.append(&vec![1u8; 3 * options.max_payload()])?;
        let report = run(writer.into_inner())?;
        assert_eq!(report.end, EndReason::StorageExhausted);
        assert_eq!(report.blocks, 3);
        Ok(())
    }
}
