//! Bounded-retry token challenge.
//!
//! A recognized candidate is corroborated by reading an RFID token whose
//! stored text must equal the candidate's label. Each attempt acquires the
//! reader for exactly one read and releases it on every exit path; a read
//! fault or timeout consumes an attempt just like a mismatch.

use crate::attendance::{AttendanceRecord, AttendanceSink};
use crate::shutdown::Shutdown;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Tag serial number as reported by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(TokenId)
    }
}

/// One successful physical read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRead {
    pub id: TokenId,
    /// Raw stored text; tags pad it with trailing whitespace.
    pub text: String,
}

impl TokenRead {
    /// Exact, case-sensitive comparison against the trimmed token text.
    pub fn matches(&self, candidate: &str) -> bool {
        self.text.trim() == candidate
    }
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("no token presented within {0:?}")]
    Timeout(Duration),
    #[error("reader unavailable: {0}")]
    Unavailable(String),
    #[error("reader fault: {0}")]
    Device(String),
    #[error("malformed reader output: {0:?}")]
    Malformed(String),
    #[error("read cancelled by shutdown")]
    Cancelled,
    #[error("reader I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("token text is {len} bytes, tag holds at most {max}")]
    TooLong { len: usize, max: usize },
    #[error("no token presented within {0:?}")]
    Timeout(Duration),
    #[error("reader rejected write: {0}")]
    Rejected(String),
    #[error("reader unavailable: {0}")]
    Unavailable(String),
    #[error("malformed reader output: {0:?}")]
    Malformed(String),
    #[error("write cancelled by shutdown")]
    Cancelled,
    #[error("reader I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A physical token reader.
///
/// `read` and `write` may lazily acquire the device; `release` must return
/// it to an idle, re-initializable state. Callers wrap each operation in a
/// [`ReaderGuard`] so release happens after every single operation.
pub trait TokenReader {
    /// Block until a token is presented, `timeout` elapses, or shutdown.
    /// `None` waits indefinitely.
    fn read(&mut self, timeout: Option<Duration>) -> Result<TokenRead, ReadError>;

    /// Store `text` on the next presented token and return its id.
    fn write(&mut self, text: &str, timeout: Option<Duration>) -> Result<TokenId, WriteError>;

    fn release(&mut self);
}

impl<R: TokenReader + ?Sized> TokenReader for Box<R> {
    fn read(&mut self, timeout: Option<Duration>) -> Result<TokenRead, ReadError> {
        (**self).read(timeout)
    }

    fn write(&mut self, text: &str, timeout: Option<Duration>) -> Result<TokenId, WriteError> {
        (**self).write(text, timeout)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Scoped exclusive use of a reader. Releases the device when dropped.
pub struct ReaderGuard<'a, R: TokenReader + ?Sized> {
    reader: &'a mut R,
}

impl<'a, R: TokenReader + ?Sized> ReaderGuard<'a, R> {
    pub fn new(reader: &'a mut R) -> Self {
        Self { reader }
    }
}

impl<R: TokenReader + ?Sized> Deref for ReaderGuard<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.reader
    }
}

impl<R: TokenReader + ?Sized> DerefMut for ReaderGuard<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        self.reader
    }
}

impl<R: TokenReader + ?Sized> Drop for ReaderGuard<'_, R> {
    fn drop(&mut self) {
        self.reader.release();
    }
}

/// Retry policy for one verification session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next read.
    pub retry_delay: Duration,
    /// Per-attempt read timeout; `None` blocks until a tag is presented.
    pub read_timeout: Option<Duration>,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
        }
    }
}

/// Terminal result of a verification session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Token text matched; attendance was handed to the sink.
    Accepted(TokenId),
    /// Every attempt failed. Expected outcome, not an error.
    Exhausted,
    /// Operator shutdown interrupted the session. Nothing was recorded.
    Cancelled,
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }
}

/// Attempt bookkeeping for one candidate.
#[derive(Debug, Clone)]
pub struct VerificationSession {
    candidate: String,
    attempts_used: u32,
    max_attempts: u32,
}

impl VerificationSession {
    pub fn new(candidate: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            candidate: candidate.into(),
            attempts_used: 0,
            max_attempts,
        }
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts_used >= self.max_attempts
    }

    /// Count one failed attempt. Returns `true` while attempts remain.
    fn consume_attempt(&mut self) -> bool {
        if self.attempts_used < self.max_attempts {
            self.attempts_used += 1;
        }
        !self.is_exhausted()
    }
}

/// Drives the token challenge for admitted candidates.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    policy: VerifyPolicy,
    shutdown: Shutdown,
}

impl TokenVerifier {
    pub fn new(policy: VerifyPolicy, shutdown: Shutdown) -> Self {
        Self { policy, shutdown }
    }

    pub fn policy(&self) -> &VerifyPolicy {
        &self.policy
    }

    /// Run one session to a terminal outcome.
    ///
    /// On `Accepted` exactly one record is handed to `sink`. A sink failure is
    /// logged and does not change the outcome.
    pub fn verify<R, S>(&self, candidate: &str, reader: &mut R, sink: &mut S) -> Outcome
    where
        R: TokenReader + ?Sized,
        S: AttendanceSink + ?Sized,
    {
        let mut session = VerificationSession::new(candidate, self.policy.max_attempts);

        loop {
            if session.is_exhausted() {
                return self.exhausted(&session);
            }
            if self.shutdown.is_triggered() {
                tracing::info!(label = candidate, "verification cancelled");
                return Outcome::Cancelled;
            }

            let attempt = session.attempts_used() + 1;
            tracing::info!(
                label = candidate,
                attempt,
                max_attempts = self.policy.max_attempts,
                "hold RFID tag near the reader"
            );

            let result = {
                let mut guard = ReaderGuard::new(&mut *reader);
                guard.read(self.policy.read_timeout)
            };

            match result {
                Ok(read) if read.matches(candidate) => {
                    let record = AttendanceRecord::new(candidate, read.id, Local::now());
                    match sink.record(record) {
                        Ok(()) => {
                            tracing::info!(label = candidate, token_id = %read.id, attempt, "attendance recorded")
                        }
                        Err(e) => tracing::error!(
                            label = candidate,
                            token_id = %read.id,
                            error = %e,
                            "attendance accepted but could not be persisted"
                        ),
                    }
                    return Outcome::Accepted(read.id);
                }
                Ok(read) => {
                    tracing::warn!(
                        label = candidate,
                        token_id = %read.id,
                        token_text = read.text.trim(),
                        attempt,
                        "token does not match candidate"
                    );
                }
                Err(ReadError::Cancelled) => {
                    tracing::info!(label = candidate, attempt, "verification cancelled during read");
                    return Outcome::Cancelled;
                }
                Err(e) => {
                    tracing::warn!(label = candidate, attempt, error = %e, "token read failed");
                }
            }

            if !session.consume_attempt() {
                return self.exhausted(&session);
            }

            if self.shutdown.wait_timeout(self.policy.retry_delay) {
                tracing::info!(label = candidate, "verification cancelled between attempts");
                return Outcome::Cancelled;
            }
        }
    }

    fn exhausted(&self, session: &VerificationSession) -> Outcome {
        tracing::warn!(
            label = session.candidate(),
            attempts = session.attempts_used(),
            "attendance not recorded: maximum attempts reached"
        );
        Outcome::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::PersistError;
    use std::collections::VecDeque;

    /// Replays a fixed script of read results and checks acquire/release pairing.
    #[derive(Default)]
    struct ScriptedReader {
        script: VecDeque<Result<TokenRead, ReadError>>,
        reads: usize,
        releases: usize,
        held: bool,
    }

    impl ScriptedReader {
        fn new(script: Vec<Result<TokenRead, ReadError>>) -> Self {
            Self {
                script: script.into(),
                ..Default::default()
            }
        }
    }

    impl TokenReader for ScriptedReader {
        fn read(&mut self, _timeout: Option<Duration>) -> Result<TokenRead, ReadError> {
            assert!(!self.held, "device read while still held from previous attempt");
            self.held = true;
            self.reads += 1;
            self.script
                .pop_front()
                .unwrap_or(Err(ReadError::Timeout(Duration::ZERO)))
        }

        fn write(&mut self, _text: &str, _timeout: Option<Duration>) -> Result<TokenId, WriteError> {
            Err(WriteError::Rejected("scripted reader is read-only".into()))
        }

        fn release(&mut self) {
            self.held = false;
            self.releases += 1;
        }
    }

    #[derive(Default)]
    struct MemorySink {
        records: Vec<AttendanceRecord>,
    }

    impl AttendanceSink for MemorySink {
        fn record(&mut self, record: AttendanceRecord) -> Result<(), PersistError> {
            self.records.push(record);
            Ok(())
        }
    }

    struct FailingSink {
        calls: usize,
    }

    impl AttendanceSink for FailingSink {
        fn record(&mut self, _record: AttendanceRecord) -> Result<(), PersistError> {
            self.calls += 1;
            Err(PersistError::Backend("disk full".into()))
        }
    }

    fn tag(id: u64, text: &str) -> Result<TokenRead, ReadError> {
        Ok(TokenRead {
            id: TokenId(id),
            text: text.into(),
        })
    }

    fn fast_policy() -> VerifyPolicy {
        VerifyPolicy {
            max_attempts: 3,
            retry_delay: Duration::ZERO,
            read_timeout: Some(Duration::from_millis(10)),
        }
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(fast_policy(), Shutdown::new())
    }

    #[test]
    fn test_accepts_on_first_attempt() {
        let mut reader = ScriptedReader::new(vec![tag(1001, "Alice")]);
        let mut sink = MemorySink::default();

        let outcome = verifier().verify("Alice", &mut reader, &mut sink);

        assert_eq!(outcome, Outcome::Accepted(TokenId(1001)));
        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].label, "Alice");
        assert_eq!(sink.records[0].token_id, TokenId(1001));
        assert_eq!(reader.reads, 1);
        assert_eq!(reader.releases, 1);
    }

    #[test]
    fn test_exhausts_after_three_mismatches() {
        let mut reader =
            ScriptedReader::new(vec![tag(1002, "Bob"), tag(1002, "Bob"), tag(1002, "Bob")]);
        let mut sink = MemorySink::default();

        let outcome = verifier().verify("Alice", &mut reader, &mut sink);

        assert_eq!(outcome, Outcome::Exhausted);
        assert!(sink.records.is_empty());
        assert_eq!(reader.reads, 3);
        assert_eq!(reader.releases, 3);
    }

    #[test]
    fn test_accepts_on_last_attempt() {
        let mut reader =
            ScriptedReader::new(vec![tag(7, "Bob"), tag(7, "alice"), tag(8, "Alice")]);
        let mut sink = MemorySink::default();

        let outcome = verifier().verify("Alice", &mut reader, &mut sink);

        assert_eq!(outcome, Outcome::Accepted(TokenId(8)));
        assert_eq!(sink.records.len(), 1);
        assert_eq!(reader.reads, 3);
    }

    #[test]
    fn test_match_after_budget_is_ignored() {
        let mut reader = ScriptedReader::new(vec![
            tag(1, "Bob"),
            tag(1, "Bob"),
            tag(1, "Bob"),
            tag(2, "Alice"),
        ]);
        let mut sink = MemorySink::default();

        assert_eq!(verifier().verify("Alice", &mut reader, &mut sink), Outcome::Exhausted);
        assert_eq!(reader.reads, 3);
        assert!(sink.records.is_empty());
    }

    #[test]
    fn test_token_text_is_trimmed() {
        let mut reader = ScriptedReader::new(vec![tag(5, "  Alice      \n")]);
        let mut sink = MemorySink::default();
        assert!(verifier().verify("Alice", &mut reader, &mut sink).is_accepted());
    }

    #[test]
    fn test_comparison_is_case_sensitive() {
        let mut reader =
            ScriptedReader::new(vec![tag(5, "ALICE"), tag(5, "alice"), tag(5, "Alice ")]);
        let mut sink = MemorySink::default();
        assert_eq!(
            verifier().verify("Alice", &mut reader, &mut sink),
            Outcome::Accepted(TokenId(5))
        );
        assert_eq!(reader.reads, 3);
    }

    #[test]
    fn test_device_faults_consume_attempts() {
        let mut reader = ScriptedReader::new(vec![
            Err(ReadError::Device("crc error".into())),
            Err(ReadError::Timeout(Duration::from_millis(10))),
            tag(9, "Alice"),
        ]);
        let mut sink = MemorySink::default();

        let outcome = verifier().verify("Alice", &mut reader, &mut sink);

        assert_eq!(outcome, Outcome::Accepted(TokenId(9)));
        assert_eq!(reader.reads, 3);
        assert_eq!(reader.releases, 3);
    }

    #[test]
    fn test_only_faults_exhaust() {
        let mut reader = ScriptedReader::new(vec![
            Err(ReadError::Unavailable("no such device".into())),
            Err(ReadError::Unavailable("no such device".into())),
            Err(ReadError::Unavailable("no such device".into())),
        ]);
        let mut sink = MemorySink::default();
        assert_eq!(verifier().verify("Alice", &mut reader, &mut sink), Outcome::Exhausted);
        assert_eq!(reader.releases, 3);
    }

    #[test]
    fn test_sink_failure_still_accepts_once() {
        let mut reader = ScriptedReader::new(vec![tag(1001, "Alice")]);
        let mut sink = FailingSink { calls: 0 };

        let outcome = verifier().verify("Alice", &mut reader, &mut sink);

        assert_eq!(outcome, Outcome::Accepted(TokenId(1001)));
        assert_eq!(sink.calls, 1);
    }

    #[test]
    fn test_cancelled_read_records_nothing() {
        let mut reader = ScriptedReader::new(vec![tag(1, "Bob"), Err(ReadError::Cancelled)]);
        let mut sink = MemorySink::default();

        let outcome = verifier().verify("Alice", &mut reader, &mut sink);

        assert_eq!(outcome, Outcome::Cancelled);
        assert!(sink.records.is_empty());
        assert_eq!(reader.releases, reader.reads);
    }

    #[test]
    fn test_shutdown_before_start_cancels_without_reading() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let v = TokenVerifier::new(fast_policy(), shutdown);
        let mut reader = ScriptedReader::new(vec![tag(1, "Alice")]);
        let mut sink = MemorySink::default();

        assert_eq!(v.verify("Alice", &mut reader, &mut sink), Outcome::Cancelled);
        assert_eq!(reader.reads, 0);
        assert!(sink.records.is_empty());
    }

    #[test]
    fn test_shutdown_during_retry_delay() {
        let shutdown = Shutdown::new();
        let policy = VerifyPolicy {
            retry_delay: Duration::from_secs(30),
            ..fast_policy()
        };
        let v = TokenVerifier::new(policy, shutdown.clone());
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            shutdown.trigger();
        });

        let mut reader = ScriptedReader::new(vec![tag(1, "Bob"), tag(2, "Alice")]);
        let mut sink = MemorySink::default();
        let outcome = v.verify("Alice", &mut reader, &mut sink);
        trigger.join().unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(reader.reads, 1);
        assert!(sink.records.is_empty());
    }

    #[test]
    fn test_zero_attempt_budget_exhausts_immediately() {
        let v = TokenVerifier::new(
            VerifyPolicy {
                max_attempts: 0,
                ..fast_policy()
            },
            Shutdown::new(),
        );
        let mut reader = ScriptedReader::new(vec![tag(1, "Alice")]);
        let mut sink = MemorySink::default();
        assert_eq!(v.verify("Alice", &mut reader, &mut sink), Outcome::Exhausted);
        assert_eq!(reader.reads, 0);
    }

    #[test]
    fn test_session_attempts_are_bounded() {
        let mut s = VerificationSession::new("Alice", 2);
        assert!(s.consume_attempt());
        assert!(!s.consume_attempt());
        assert!(!s.consume_attempt());
        assert_eq!(s.attempts_used(), 2);
        assert_eq!(s.candidate(), "Alice");
    }

    #[test]
    fn test_token_id_parse() {
        assert_eq!(" 584190 ".parse::<TokenId>().unwrap(), TokenId(584190));
        assert!("abc".parse::<TokenId>().is_err());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let mut reader = ScriptedReader::new(vec![tag(1, "Alice")]);
        {
            let mut guard = ReaderGuard::new(&mut reader);
            let _ = guard.read(None);
        }
        assert_eq!(reader.releases, 1);
        assert!(!reader.held);
    }
}
