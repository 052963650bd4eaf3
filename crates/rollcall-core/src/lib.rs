//! rollcall-core — Two-factor attendance decisions.
//!
//! Resolves detected faces against a gallery of reference encodings,
//! debounces repeat candidates, and corroborates each new candidate by
//! reading an RFID token whose stored text must equal the candidate's label.

pub mod attendance;
pub mod debounce;
pub mod resolver;
pub mod shutdown;
pub mod store;
pub mod types;
pub mod verifier;

pub use attendance::{AttendanceRecord, AttendanceSink, PersistError};
pub use debounce::{ConfirmPolicy, SessionDebouncer};
pub use resolver::{CandidateResolver, LinearIndex, MatchIndex, MatchRule, MatchTally};
pub use shutdown::Shutdown;
pub use store::{EncodingStore, ReferenceEncoding, StoreError};
pub use types::{BoundingBox, DetectedFace, Embedding, Identity};
pub use verifier::{
    Outcome, ReadError, ReaderGuard, TokenId, TokenRead, TokenReader, TokenVerifier,
    VerifyPolicy, WriteError,
};
