//! Analyzer boundary.
//!
//! The ML engine that turns a frame into a detection result is an external
//! collaborator; each pool slot owns one [`FrameAnalyzer`] instance built by
//! the shared [`AnalyzerFactory`], so model state is never shared between
//! workers. The built-in `stats` backend probes the JPEG header without any
//! inference runtime, which keeps the server runnable (and the pipeline
//! testable) with no models installed.

use serde_json::{Value, json};
use thiserror::Error;

use crate::config::{AnalysisConfig, AnalyzerBackend};

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("analysis backend failure: {0}")]
    Backend(String),
}

/// One analysis engine instance, owned by a single worker slot. `analyze`
/// runs on the slot's thread and may block.
pub trait FrameAnalyzer: Send {
    fn analyze(&mut self, frame: &[u8]) -> Result<Value, AnalyzerError>;
}

pub trait AnalyzerFactory: Send + Sync {
    fn create(&self) -> Box<dyn FrameAnalyzer>;
}

pub fn factory_for(config: &AnalysisConfig) -> std::sync::Arc<dyn AnalyzerFactory> {
    match config.backend {
        AnalyzerBackend::Stats => std::sync::Arc::new(FrameStatsFactory),
    }
}

pub struct FrameStatsFactory;

impl AnalyzerFactory for FrameStatsFactory {
    fn create(&self) -> Box<dyn FrameAnalyzer> {
        Box::new(FrameStatsAnalyzer { frames_seen: 0 })
    }
}

/// Reads frame dimensions out of the JPEG start-of-frame segment.
pub struct FrameStatsAnalyzer {
    frames_seen: u64,
}

impl FrameAnalyzer for FrameStatsAnalyzer {
    fn analyze(&mut self, frame: &[u8]) -> Result<Value, AnalyzerError> {
        let (width, height) = jpeg_dimensions(frame)
            .ok_or_else(|| AnalyzerError::MalformedFrame("no JPEG start-of-frame".into()))?;
        self.frames_seen += 1;
        Ok(json!({
            "width": width,
            "height": height,
            "sizeBytes": frame.len(),
            "frameIndex": self.frames_seen,
        }))
    }
}

/// Walks JPEG segments looking for a SOFn marker carrying the image size.
fn jpeg_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        // standalone markers have no length field
        if (0xD0..=0xD9).contains(&marker) || marker == 0x01 {
            pos += 2;
            continue;
        }
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        if len < 2 {
            return None;
        }
        let is_sof = matches!(marker, 0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF);
        if is_sof {
            if pos + 9 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]);
            let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]);
            return Some((width, height));
        }
        pos += 2 + len;
    }
    None
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Minimal JPEG-shaped frame with a SOF0 segment carrying `w` x `h`.
    pub fn fake_jpeg(w: u16, h: u16) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xD8];
        frame.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        frame.extend_from_slice(&h.to_be_bytes());
        frame.extend_from_slice(&w.to_be_bytes());
        frame.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::fake_jpeg;
    use super::*;

    #[test]
    fn reports_dimensions_and_frame_index() {
        let mut analyzer = FrameStatsFactory.create();
        let frame = fake_jpeg(320, 240);

        let first = analyzer.analyze(&frame).unwrap();
        assert_eq!(first["width"], 320);
        assert_eq!(first["height"], 240);
        assert_eq!(first["frameIndex"], 1);

        let second = analyzer.analyze(&frame).unwrap();
        assert_eq!(second["frameIndex"], 2);
    }

    #[test]
    fn rejects_non_jpeg_payloads() {
        let mut analyzer = FrameStatsFactory.create();
        assert!(matches!(
            analyzer.analyze(b"not a jpeg"),
            Err(AnalyzerError::MalformedFrame(_))
        ));
    }
}
