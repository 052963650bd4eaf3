//! Frame type and the JSON-lines feed produced by the external face detector.
//!
//! Each line is one frame:
//! `{"sequence": 1, "width": 500, "height": 375, "faces": [{"bbox": {...}, "encoding": [...]}]}`.
//! Pixel data is optional and opaque to the decision loop.

use rollcall_core::DetectedFace;
use serde::Deserialize;
use std::io::BufRead;

/// One frame with the faces the detector found in it.
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Raw pixels, if the detector forwards them.
    #[serde(default)]
    pub pixels: Vec<u8>,
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame source I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame on line {line}: {source}")]
    Malformed {
        line: u64,
        #[source]
        source: serde_json::Error,
    },
}

impl FrameError {
    /// A malformed frame can be skipped; an I/O failure ends the stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Malformed { .. })
    }
}

/// Supplier of frames. `Ok(None)` marks end of stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError>;
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        (**self).next_frame()
    }
}

/// Reads one JSON frame per line from any buffered reader (stdin, FIFO, file).
pub struct JsonLinesSource<R> {
    reader: R,
    line_no: u64,
    buf: String,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> FrameSource for JsonLinesSource<R> {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            self.buf.clear();
            if self.reader.read_line(&mut self.buf)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }

            let frame = serde_json::from_str::<Frame>(line).map_err(|source| {
                FrameError::Malformed {
                    line: self.line_no,
                    source,
                }
            })?;
            return Ok(Some(frame));
        }
    }
}
