//! Media acquisition: live microphone capture with a silent synthetic
//! fallback, so a broken or missing headset never blocks a call.
//!
//! `acquire()` cannot fail. Capture problems degrade to the synthetic
//! stream and a [`MediaWarning`] the UI shows as a persistent notice; the
//! call proceeds in listen-only mode.

use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[cfg(feature = "audio")]
use super::audio::{AudioCapture, CaptureError};

/// Samples per frame: 20 ms of mono PCM at 8000 Hz.
pub const FRAME_SAMPLES: usize = 160;

/// Frame cadence shared by live capture and the synthetic source.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(feature = "audio"), allow(dead_code))]
pub enum MediaKind {
    Live,
    SilentSynthetic,
}

/// Why a call is running on the silent fallback. Non-blocking: shown to the
/// operator as a warning, never raised as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(not(feature = "audio"), allow(dead_code))]
pub enum MediaWarning {
    PermissionDenied(String),
    NoDevice,
    DeviceBusy(String),
    Unsupported(String),
}

impl fmt::Display for MediaWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaWarning::PermissionDenied(_) => {
                f.write_str("microphone access denied, calls are listen-only")
            }
            MediaWarning::NoDevice => f.write_str("no microphone found, calls are listen-only"),
            MediaWarning::DeviceBusy(_) => {
                f.write_str("microphone is busy, calls are listen-only")
            }
            MediaWarning::Unsupported(detail) => {
                write!(f, "audio capture unavailable ({detail}), calls are listen-only")
            }
        }
    }
}

/// Call audio source. Exclusively owned by the current call; stopped on
/// every path that reaches Terminated.
pub struct MediaStream {
    kind: MediaKind,
    frames: mpsc::Receiver<Vec<i16>>,
    muted: bool,
    stopped: bool,
    #[cfg(feature = "audio")]
    _capture: Option<AudioCapture>,
    synth: Option<JoinHandle<()>>,
}

impl MediaStream {
    /// Synthetic source: zeroed 20 ms frames at the capture cadence.
    pub fn silent() -> Self {
        let (tx, rx) = mpsc::channel::<Vec<i16>>(4);
        let synth = tokio::spawn(async move {
            let mut tick = interval(FRAME_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if tx.send(vec![0i16; FRAME_SAMPLES]).await.is_err() {
                    break;
                }
            }
        });
        MediaStream {
            kind: MediaKind::SilentSynthetic,
            frames: rx,
            muted: false,
            stopped: false,
            #[cfg(feature = "audio")]
            _capture: None,
            synth: Some(synth),
        }
    }

    #[cfg(feature = "audio")]
    fn live(capture: AudioCapture, frames: mpsc::Receiver<Vec<i16>>) -> Self {
        MediaStream {
            kind: MediaKind::Live,
            frames,
            muted: false,
            stopped: false,
            _capture: Some(capture),
            synth: None,
        }
    }

    #[cfg(test)]
    fn from_channel(kind: MediaKind, frames: mpsc::Receiver<Vec<i16>>) -> Self {
        MediaStream {
            kind,
            frames,
            muted: false,
            stopped: false,
            #[cfg(feature = "audio")]
            _capture: None,
            synth: None,
        }
    }

    /// True when no real microphone audio is being captured.
    pub fn is_listen_only(&self) -> bool {
        self.kind == MediaKind::SilentSynthetic
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// While muted, delivered frames are replaced with silence; the source
    /// keeps running so unmute is instant.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Next 20 ms frame, zeroed while muted. Returns None once stopped or
    /// when the source has gone away.
    pub async fn next_frame(&mut self) -> Option<Vec<i16>> {
        if self.stopped {
            return None;
        }
        let frame = self.frames.recv().await?;
        if self.muted {
            Some(vec![0i16; frame.len()])
        } else {
            Some(frame)
        }
    }

    /// Releases the capture device or synthetic task. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(handle) = self.synth.take() {
            handle.abort();
        }
        #[cfg(feature = "audio")]
        {
            self._capture = None;
        }
        self.frames.close();
        tracing::debug!("Media stream stopped ({:?})", self.kind);
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of media acquisition: the stream that will carry the call plus
/// an optional reason it is not a live microphone.
pub struct Acquisition {
    pub stream: MediaStream,
    pub warning: Option<MediaWarning>,
}

/// Acquires call audio. Never fails: every capture problem degrades to the
/// silent synthetic stream with a warning for the operator.
pub fn acquire() -> Acquisition {
    match try_live() {
        Ok(stream) => Acquisition {
            stream,
            warning: None,
        },
        Err(warning) => {
            tracing::warn!("Microphone unavailable, using silent stream: {}", warning);
            Acquisition {
                stream: MediaStream::silent(),
                warning: Some(warning),
            }
        }
    }
}

#[cfg(feature = "audio")]
fn try_live() -> Result<MediaStream, MediaWarning> {
    match AudioCapture::start() {
        Ok((capture, frames)) => Ok(MediaStream::live(capture, frames)),
        Err(CaptureError::PermissionDenied(d)) => Err(MediaWarning::PermissionDenied(d)),
        Err(CaptureError::NoDevice) => Err(MediaWarning::NoDevice),
        Err(CaptureError::DeviceBusy(d)) => Err(MediaWarning::DeviceBusy(d)),
        Err(CaptureError::Unsupported(d)) => Err(MediaWarning::Unsupported(d)),
    }
}

#[cfg(not(feature = "audio"))]
fn try_live() -> Result<MediaStream, MediaWarning> {
    Err(MediaWarning::Unsupported(
        "built without the audio feature".to_string(),
    ))
}
