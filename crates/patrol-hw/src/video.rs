//! Video file playback through ffmpeg.
//!
//! Metadata comes from `ffprobe`. Sequential playback streams raw RGB24 from
//! an `ffmpeg` child process; seeking restarts the decoder at the target
//! offset. Batch mode extracts every frame to PNG in a temporary directory.

use crate::frame::{position_of, Frame};
use crate::source::{DecodedFrames, FrameSource, SourceError};
use serde::Deserialize;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

/// Fallback when the container does not report a usable frame rate.
const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: Option<u64>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Query stream geometry, rate and length.
pub fn probe(path: &Path) -> Result<VideoInfo, SourceError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames:format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| SourceError::Open(format!("ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(SourceError::Open(format!(
            "ffprobe {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    parse_probe(&output.stdout)
}

fn parse_probe(json: &[u8]) -> Result<VideoInfo, SourceError> {
    let parsed: ProbeOutput = serde_json::from_slice(json)
        .map_err(|e| SourceError::Open(format!("ffprobe output: {e}")))?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::Open("no video stream".into()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(SourceError::Open("video stream has no dimensions".into())),
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(DEFAULT_FPS);

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|&n| n > 0)
        .or_else(|| {
            parsed
                .format
                .and_then(|f| f.duration)
                .and_then(|d| d.parse::<f64>().ok())
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| (d * fps).round() as u64)
        });

    Ok(VideoInfo {
        width,
        height,
        fps,
        frame_count,
    })
}

/// Parse an ffprobe rational like `30000/1001`.
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.parse::<f64>().ok()?, d.parse::<f64>().ok()?),
        None => (rate.parse::<f64>().ok()?, 1.0),
    };
    let fps = num / den;
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// A running ffmpeg rawvideo pipe.
///
/// stderr is drained on its own thread so a chatty decoder never blocks on a
/// full pipe; the text is only looked at when the process fails.
struct Decoder {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
}

impl Decoder {
    fn spawn(mut cmd: Command) -> Result<Self, SourceError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SourceError::Open(format!("ffmpeg: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Open("ffmpeg stdout unavailable".into()))?;
        let stderr = child.stderr.take().and_then(|mut pipe| {
            std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || {
                    let mut text = String::new();
                    let _ = pipe.read_to_string(&mut text);
                    text
                })
                .ok()
        });

        Ok(Self { child, stdout, stderr })
    }

    /// Read one frame of `len` bytes.
    ///
    /// `Ok(None)` only when the stream ends and ffmpeg exited cleanly. A
    /// non-zero exit is a decode error carrying ffmpeg's stderr.
    fn read_frame(&mut self, len: usize) -> Result<Option<Vec<u8>>, SourceError> {
        let mut buf = vec![0u8; len];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => Ok(Some(buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                let status = self.child.wait()?;
                if status.success() {
                    return Ok(None);
                }
                let stderr = self
                    .stderr
                    .take()
                    .and_then(|h| h.join().ok())
                    .unwrap_or_default();
                Err(SourceError::Decode(format!(
                    "ffmpeg exited with {status}: {}",
                    stderr.trim()
                )))
            }
            Err(e) => Err(SourceError::Decode(e.to_string())),
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct VideoFile {
    path: PathBuf,
    info: VideoInfo,
    looping: bool,
    decoder: Option<Decoder>,
    position: u64,
}

impl VideoFile {
    /// Open a video file. With `looping`, the file stands in for a live feed:
    /// the consumer rewinds it at end of stream instead of stopping.
    pub fn open(path: &Path, looping: bool) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::NotFound(path.display().to_string()));
        }
        let info = probe(path)?;
        tracing::info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.fps,
            frames = ?info.frame_count,
            looping,
            "opened video file"
        );
        Ok(Self {
            path: path.to_path_buf(),
            info,
            looping,
            decoder: None,
            position: 0,
        })
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn spawn_decoder(&self) -> Result<Decoder, SourceError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-v", "error", "-nostdin"]);
        if self.position > 0 {
            let offset = position_of(self.position, self.info.fps).as_secs_f64();
            cmd.arg("-ss").arg(format!("{offset:.3}"));
        }
        cmd.arg("-i")
            .arg(&self.path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"]);
        let decoder = Decoder::spawn(cmd)?;

        tracing::debug!(path = %self.path.display(), start = self.position, "spawned decoder");
        Ok(decoder)
    }
}

impl FrameSource for VideoFile {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut decoder = match self.decoder.take() {
            Some(d) => d,
            None => self.spawn_decoder()?,
        };

        let len = Frame::rgb_len(self.info.width, self.info.height);
        let read = decoder
            .read_frame(len)
            .map_err(|e| match e {
                SourceError::Decode(message) => {
                    SourceError::Decode(format!("{}: {message}", self.path.display()))
                }
                other => other,
            })?;
        match read {
            Some(buf) => {
                let frame = Frame::new(
                    buf,
                    self.info.width,
                    self.info.height,
                    self.position,
                    position_of(self.position, self.info.fps),
                );
                self.position += 1;
                self.decoder = Some(decoder);
                Ok(Some(frame))
            }
            None => {
                if self.info.frame_count.is_none() {
                    self.info.frame_count = Some(self.position);
                }
                Ok(None)
            }
        }
    }

    fn seek(&mut self, index: u64) -> Result<(), SourceError> {
        if let Some(count) = self.info.frame_count {
            if index > count {
                return Err(SourceError::SeekOutOfRange { index, count });
            }
        }
        self.decoder = None;
        self.position = index;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn frame_count(&self) -> Option<u64> {
        self.info.frame_count
    }

    fn fps(&self) -> f64 {
        self.info.fps
    }

    fn is_live(&self) -> bool {
        self.looping
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn decode_all(&mut self) -> Result<DecodedFrames, SourceError> {
        let storage = tempfile::Builder::new().prefix("patrol-frames-").tempdir()?;
        let pattern = storage.path().join("%08d.png");

        tracing::info!(path = %self.path.display(), dir = %storage.path().display(), "extracting frames");
        let output = Command::new("ffmpeg")
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(&self.path)
            .args(["-vsync", "0"])
            .arg(&pattern)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SourceError::Open(format!("ffmpeg: {e}")))?;
        if !output.status.success() {
            return Err(SourceError::Decode(format!(
                "frame extraction failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(storage.path())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|e| e == "png"))
            .collect();
        paths.sort();

        tracing::info!(frames = paths.len(), "frames extracted");
        Ok(DecodedFrames::stored(storage, paths, self.info.fps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Decoder {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        Decoder::spawn(cmd).unwrap()
    }

    #[test]
    fn test_decoder_clean_exit_ends_stream() {
        let mut decoder = shell("printf abcdef");
        assert_eq!(decoder.read_frame(3).unwrap().as_deref(), Some(&b"abc"[..]));
        assert_eq!(decoder.read_frame(3).unwrap().as_deref(), Some(&b"def"[..]));
        assert_eq!(decoder.read_frame(3).unwrap(), None);
    }

    #[test]
    fn test_decoder_failure_is_decode_error() {
        let mut decoder = shell("printf abc; echo 'corrupt macroblock' >&2; exit 1");
        assert!(decoder.read_frame(3).unwrap().is_some());
        match decoder.read_frame(3) {
            Err(SourceError::Decode(message)) => {
                assert!(message.contains("corrupt macroblock"), "got {message}")
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("garbage"), None);
    }

    #[test]
    fn test_parse_probe_with_frame_count() {
        let json = br#"{"programs":[],"streams":[{"width":1280,"height":720,
            "r_frame_rate":"25/1","avg_frame_rate":"25/1","nb_frames":"250"}],
            "format":{"duration":"10.000000"}}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(
            info,
            VideoInfo {
                width: 1280,
                height: 720,
                fps: 25.0,
                frame_count: Some(250)
            }
        );
    }

    #[test]
    fn test_parse_probe_falls_back_to_duration_and_default_fps() {
        let json = br#"{"streams":[{"width":640,"height":480,"avg_frame_rate":"0/0"}],
            "format":{"duration":"4.0"}}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.fps, DEFAULT_FPS);
        assert_eq!(info.frame_count, Some(120));
    }

    #[test]
    fn test_parse_probe_without_stream() {
        assert!(parse_probe(br#"{"streams":[]}"#).is_err());
        assert!(parse_probe(br#"{"streams":[{"width":0,"height":0}]}"#).is_err());
    }
}
