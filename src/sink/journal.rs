//! On-disk journal for undelivered events.
//!
//! One self-describing record per line:
//! `sequence|kind|first_attempt|attempts|hex(body)|crc32hex`, with the
//! CRC-32 over everything before its own separator. Appends go to the end
//! of the file; draining rewrites the file with whatever is still
//! undelivered.
//!
//! A checksum mismatch on the final record is a torn write from a crash
//! mid-append and is truncated away on open. A mismatch anywhere else
//! means the file itself is damaged and the agent refuses to start.

use crate::error::SinkError;
use crate::types::{EventKind, QueuedEvent};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const JOURNAL_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub struct Journal {
    path: PathBuf,
    file: File,
    bytes: u64,
    max_bytes: u64,
}

fn record_line(event: &QueuedEvent) -> String {
    let head = format!(
        "{}|{}|{}|{}|{}",
        event.sequence,
        event.kind.as_str(),
        event.first_attempt,
        event.attempts,
        hex::encode(&event.body)
    );
    let crc = JOURNAL_CRC.checksum(head.as_bytes());
    format!("{head}|{crc:08x}")
}

fn parse_line(line: &str) -> Option<QueuedEvent> {
    let (head, crc_hex) = line.rsplit_once('|')?;
    let crc = u32::from_str_radix(crc_hex, 16).ok()?;
    if JOURNAL_CRC.checksum(head.as_bytes()) != crc {
        return None;
    }
    let mut parts = head.split('|');
    let sequence = parts.next()?.parse().ok()?;
    let kind = EventKind::parse(parts.next()?)?;
    let first_attempt = parts.next()?.parse().ok()?;
    let attempts = parts.next()?.parse().ok()?;
    let body = hex::decode(parts.next()?).ok()?;
    Some(QueuedEvent {
        sequence,
        kind,
        body,
        first_attempt,
        attempts,
    })
}

impl Journal {
    /// Open (or create) the journal and load every surviving record in
    /// file order.
    pub fn open(path: &Path, max_bytes: u64) -> Result<(Self, Vec<QueuedEvent>), SinkError> {
        let mut records = Vec::new();

        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
            for (index, line) in lines.iter().enumerate() {
                if line.is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Some(record) => records.push(record),
                    None if index == lines.len() - 1 => {
                        warn!(line = index + 1, "truncating torn journal record");
                    }
                    None => return Err(SinkError::JournalCorrupt { line: index + 1 }),
                }
            }
        }

        // Rewrite what we loaded so a truncated tail never survives.
        let mut journal = Journal {
            path: path.to_path_buf(),
            file: OpenOptions::new().create(true).append(true).open(path)?,
            bytes: 0,
            max_bytes,
        };
        journal.rewrite(&records)?;

        if !records.is_empty() {
            info!(records = records.len(), path = %path.display(), "journal backlog loaded");
        }
        Ok((journal, records))
    }

    /// Append one record, refusing past the byte cap.
    pub fn append(&mut self, event: &QueuedEvent) -> Result<(), SinkError> {
        let mut line = record_line(event);
        line.push('\n');
        if self.bytes + line.len() as u64 > self.max_bytes {
            return Err(SinkError::JournalFull {
                bytes: self.bytes,
                cap: self.max_bytes,
            });
        }
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        self.bytes += line.len() as u64;
        Ok(())
    }

    /// Replace the journal contents with `remaining`, via a temp file and
    /// rename so a crash leaves either the old file or the new one.
    pub fn rewrite(&mut self, remaining: &[QueuedEvent]) -> Result<(), SinkError> {
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)?;
        let mut bytes = 0u64;
        for event in remaining {
            let mut line = record_line(event);
            line.push('\n');
            tmp.write_all(line.as_bytes())?;
            bytes += line.len() as u64;
        }
        tmp.sync_data()?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.bytes = bytes;
        Ok(())
    }

    pub fn usage(&self) -> (u64, u64) {
        (self.bytes, self.max_bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentEvent;

    fn event(sequence: u64) -> QueuedEvent {
        QueuedEvent::from_event(
            sequence,
            &AgentEvent::EgmException {
                code: 0x11,
                name: "slot_door_open".to_string(),
                observed_at: 1700000000 + sequence,
            },
        )
    }

    #[test]
    fn record_line_round_trips() {
        let original = event(42);
        let parsed = parse_line(&record_line(&original)).expect("valid line");
        assert_eq!(parsed, original);
    }

    #[test]
    fn backlog_survives_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        let (mut journal, backlog) = Journal::open(&path, 1 << 20).unwrap();
        assert!(backlog.is_empty());
        for sequence in 0..10 {
            journal.append(&event(sequence)).unwrap();
        }
        drop(journal);

        let (_journal, backlog) = Journal::open(&path, 1 << 20).unwrap();
        let sequences: Vec<u64> = backlog.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        let (mut journal, _) = Journal::open(&path, 1 << 20).unwrap();
        journal.append(&event(1)).unwrap();
        journal.append(&event(2)).unwrap();
        drop(journal);

        // Chop bytes off the final record, as a crash mid-append would.
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &contents[..contents.len() - 7]).unwrap();

        let (_journal, backlog) = Journal::open(&path, 1 << 20).unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].sequence, 1);
    }

    #[test]
    fn mid_file_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        let (mut journal, _) = Journal::open(&path, 1 << 20).unwrap();
        journal.append(&event(1)).unwrap();
        journal.append(&event(2)).unwrap();
        drop(journal);

        // Damage the first record's kind field; checksum no longer matches.
        let contents = std::fs::read_to_string(&path).unwrap();
        let mangled = contents.replacen("egm_event", "egm_evenX", 1);
        std::fs::write(&path, mangled).unwrap();

        match Journal::open(&path, 1 << 20) {
            Err(SinkError::JournalCorrupt { line: 1 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn append_past_cap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        let (mut journal, _) = Journal::open(&path, 200).unwrap();
        let mut rejected = false;
        for sequence in 0..10 {
            match journal.append(&event(sequence)) {
                Ok(()) => {}
                Err(SinkError::JournalFull { .. }) => {
                    rejected = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(rejected, "cap was never enforced");
    }

    #[test]
    fn rewrite_drops_delivered_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        let (mut journal, _) = Journal::open(&path, 1 << 20).unwrap();
        let events: Vec<QueuedEvent> = (0..5).map(event).collect();
        for e in &events {
            journal.append(e).unwrap();
        }
        journal.rewrite(&events[3..]).unwrap();
        drop(journal);

        let (journal, backlog) = Journal::open(&path, 1 << 20).unwrap();
        let sequences: Vec<u64> = backlog.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
        assert!(!journal.is_empty());
    }
}
