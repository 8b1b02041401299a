//! End-to-end body comparison per stream.
//!
//! Workers hand in what the requester wrote and read; the responder ledger
//! holds what the peer read and wrote. For every completed stream both
//! directions must match byte for byte, and the stream's counters must
//! agree with the body lengths. Streams that did not complete are counted,
//! never checked: their tallies are partial.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use bytes::Bytes;
use muxgate_core::{CloseReason, ConnectionId, Error, StreamId, StreamSummary};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::responder::ResponderLedger;

/// What the requester wrote and read on one stream.
#[derive(Debug, Clone)]
pub struct RequesterRecord {
    pub summary: StreamSummary,
    pub sent: Bytes,
    pub received: Bytes,
}

/// Which comparison failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MismatchKind {
    /// Requester sent != responder read.
    RequestBody,
    /// Responder sent != requester read.
    ResponseBody,
    /// `bytes_sent` / `bytes_received` disagree with the body lengths.
    CounterDrift,
    /// Completed on the requester side, but the responder has no record.
    MissingResponderRecord,
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RequestBody => "request body",
            Self::ResponseBody => "response body",
            Self::CounterDrift => "counter drift",
            Self::MissingResponderRecord => "missing responder record",
        })
    }
}

/// One integrity failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BodyMismatch {
    pub connection: ConnectionId,
    pub stream: StreamId,
    pub kind: MismatchKind,
    pub expected_len: u64,
    pub actual_len: u64,
    pub expected_sha256: String,
    pub actual_sha256: String,
}

impl BodyMismatch {
    fn new(summary: &StreamSummary, kind: MismatchKind, expected: &[u8], actual: &[u8]) -> Self {
        Self {
            connection: summary.connection,
            stream: summary.stream,
            kind,
            expected_len: expected.len() as u64,
            actual_len: actual.len() as u64,
            expected_sha256: fingerprint(expected),
            actual_sha256: fingerprint(actual),
        }
    }

    fn counters(summary: &StreamSummary, expected: u64, actual: u64) -> Self {
        Self {
            connection: summary.connection,
            stream: summary.stream,
            kind: MismatchKind::CounterDrift,
            expected_len: expected,
            actual_len: actual,
            expected_sha256: String::new(),
            actual_sha256: String::new(),
        }
    }

    pub fn into_error(self) -> Error {
        Error::BodyMismatch {
            connection: self.connection,
            stream: self.stream,
            detail: format!(
                "{}: expected {} bytes, got {}",
                self.kind, self.expected_len, self.actual_len
            ),
        }
    }
}

/// Hex sha-256 of a body.
pub fn fingerprint(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    /// Streams recorded by the requester side.
    pub streams: usize,
    pub completed: usize,
    pub incomplete: usize,
    /// Incomplete streams by close reason.
    pub incomplete_by_reason: Vec<(CloseReason, usize)>,
    pub mismatches: Vec<BodyMismatch>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// The first mismatch as an error.
    pub fn ensure_clean(&self) -> Result<(), Error> {
        match self.mismatches.first() {
            Some(mismatch) => Err(mismatch.clone().into_error()),
            None => Ok(()),
        }
    }
}

/// Collects requester-side records and checks them against the ledger.
pub struct IntegrityVerifier {
    ledger: ResponderLedger,
    records: Mutex<HashMap<(ConnectionId, StreamId), RequesterRecord>>,
}

impl IntegrityVerifier {
    pub fn new(ledger: ResponderLedger) -> Self {
        Self {
            ledger,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, record: RequesterRecord) {
        let key = (record.summary.connection, record.summary.stream);
        self.records.lock().expect("verifier lock").insert(key, record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("verifier lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check one record. Incomplete streams yield no mismatches.
    pub fn check(&self, record: &RequesterRecord) -> Vec<BodyMismatch> {
        let summary = &record.summary;
        if summary.close_reason != Some(CloseReason::Completed) {
            return Vec::new();
        }
        let mut mismatches = Vec::new();
        if summary.bytes_sent != record.sent.len() as u64 {
            mismatches.push(BodyMismatch::counters(
                summary,
                record.sent.len() as u64,
                summary.bytes_sent,
            ));
        }
        if summary.bytes_received != record.received.len() as u64 {
            mismatches.push(BodyMismatch::counters(
                summary,
                record.received.len() as u64,
                summary.bytes_received,
            ));
        }
        match self.ledger.get(summary.connection, summary.stream) {
            Some(peer) => {
                if peer.read != record.sent {
                    mismatches.push(BodyMismatch::new(
                        summary,
                        MismatchKind::RequestBody,
                        &record.sent,
                        &peer.read,
                    ));
                }
                if peer.sent != record.received {
                    mismatches.push(BodyMismatch::new(
                        summary,
                        MismatchKind::ResponseBody,
                        &peer.sent,
                        &record.received,
                    ));
                }
            }
            None => mismatches.push(BodyMismatch::new(
                summary,
                MismatchKind::MissingResponderRecord,
                &record.sent,
                &[],
            )),
        }
        mismatches
    }

    pub fn verify(&self) -> VerificationReport {
        let records = self.records.lock().expect("verifier lock");
        let mut report = VerificationReport {
            streams: records.len(),
            ..VerificationReport::default()
        };
        let mut incomplete: HashMap<CloseReason, usize> = HashMap::new();

        let mut keys: Vec<_> = records.keys().copied().collect();
        keys.sort();
        for key in keys {
            let record = &records[&key];
            match record.summary.close_reason {
                Some(CloseReason::Completed) => {
                    report.completed += 1;
                    report.mismatches.extend(self.check(record));
                }
                other => {
                    report.incomplete += 1;
                    *incomplete
                        .entry(other.unwrap_or(CloseReason::Cancelled))
                        .or_default() += 1;
                }
            }
        }

        let mut by_reason: Vec<_> = incomplete.into_iter().collect();
        by_reason.sort();
        report.incomplete_by_reason = by_reason;

        for mismatch in &report.mismatches {
            error!(
                connection = %mismatch.connection,
                stream = %mismatch.stream,
                kind = %mismatch.kind,
                expected_len = mismatch.expected_len,
                actual_len = mismatch.actual_len,
                "body mismatch"
            );
        }
        debug!(
            streams = report.streams,
            completed = report.completed,
            incomplete = report.incomplete,
            mismatches = report.mismatches.len(),
            "verification finished"
        );
        report
    }
}
