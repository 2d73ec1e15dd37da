//! Microphone capture using cpal.
//!
//! Opens the default input device at 8000 Hz mono i16 and delivers
//! 160-sample (20 ms) frames. Devices that cannot run at 8 kHz are captured
//! at their native rate and resampled with linear interpolation.
//!
//! Compiled only with the `audio` feature; without it, media.rs always
//! selects the silent synthetic stream.

use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};
use thiserror::Error;
use tokio::sync::mpsc;

/// Target sample rate for the media plane (PCMU native rate).
const TARGET_RATE: u32 = 8000;

/// Why capture could not start. Each variant maps onto one operator-facing
/// media warning.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("no audio input device found")]
    NoDevice,
    #[error("audio input device busy: {0}")]
    DeviceBusy(String),
    #[error("audio input unsupported: {0}")]
    Unsupported(String),
}

/// Downsample or upsample with simple linear interpolation.
///
/// Both rates must be > 0. Returns a new buffer at the target rate.
pub fn resample(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    if out_len == 0 {
        return vec![];
    }
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let s0 = samples[idx.min(samples.len() - 1)] as f64;
        let s1 = samples[(idx + 1).min(samples.len() - 1)] as f64;
        let val = s0 + frac * (s1 - s0);
        out.push(val.round() as i16);
    }
    out
}

/// Live microphone capture. The cpal Stream lives on a dedicated OS thread
/// so the handle is Send and can be held across await points; dropping the
/// handle releases the device.
pub struct AudioCapture {
    _keep_alive: std_mpsc::Sender<()>,
}

impl AudioCapture {
    /// Opens the default input device. The receiver yields `Vec<i16>`
    /// frames of 160 samples (20 ms at 8000 Hz).
    pub fn start() -> Result<(Self, mpsc::Receiver<Vec<i16>>), CaptureError> {
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<i16>>(50);
        // Keeps the stream-owning thread alive; dropping the sender ends it.
        let (keep_tx, keep_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), CaptureError>>();

        thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_input_device() {
                Some(d) => d,
                None => {
                    let _ = ready_tx.send(Err(CaptureError::NoDevice));
                    return;
                }
            };

            let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
            tracing::info!("Audio input device: {}", dev_name);

            let (config, device_rate) = match pick_config(&device) {
                Some(c) => c,
                None => {
                    let _ = ready_tx.send(Err(CaptureError::Unsupported(format!(
                        "no mono i16 input config on {dev_name}"
                    ))));
                    return;
                }
            };

            let frame_device_samples = (device_rate as usize * 20) / 1000;
            let need_resample = device_rate != TARGET_RATE;
            let mut acc: Vec<i16> = Vec::with_capacity(frame_device_samples * 2);

            let stream = match device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    acc.extend_from_slice(data);
                    while acc.len() >= frame_device_samples {
                        let chunk: Vec<i16> = acc.drain(..frame_device_samples).collect();
                        let frame = if need_resample {
                            resample(&chunk, device_rate, TARGET_RATE)
                        } else {
                            chunk
                        };
                        let _ = frame_tx.try_send(frame);
                    }
                },
                move |err| {
                    tracing::warn!("Audio input stream error: {}", err);
                },
                None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(classify_build_error(&e)));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let err = match &e {
                    cpal::PlayStreamError::DeviceNotAvailable => CaptureError::NoDevice,
                    other => classify_backend_message(&other.to_string()),
                };
                let _ = ready_tx.send(Err(err));
                return;
            }

            tracing::info!(
                "Audio capture started (device {}Hz, target {}Hz)",
                device_rate,
                TARGET_RATE
            );
            let _ = ready_tx.send(Ok(()));

            // Park this thread; the stream stays alive until keep_rx drops.
            let _ = keep_rx.recv();
            drop(stream);
        });

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => Ok((
                AudioCapture {
                    _keep_alive: keep_tx,
                },
                frame_rx,
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::DeviceBusy(
                "audio backend did not start within 2s".to_string(),
            )),
        }
    }
}

fn classify_build_error(err: &cpal::BuildStreamError) -> CaptureError {
    use cpal::BuildStreamError;
    match err {
        BuildStreamError::DeviceNotAvailable => CaptureError::NoDevice,
        BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
            CaptureError::Unsupported(err.to_string())
        }
        other => classify_backend_message(&other.to_string()),
    }
}

/// Backend-specific failures only carry prose; match the usual phrasings of
/// ALSA, PulseAudio and CoreAudio.
fn classify_backend_message(text: &str) -> CaptureError {
    let lower = text.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        CaptureError::PermissionDenied(text.to_string())
    } else if lower.contains("busy") || lower.contains("in use") {
        CaptureError::DeviceBusy(text.to_string())
    } else {
        CaptureError::Unsupported(text.to_string())
    }
}

/// Pick a mono i16 input config, preferring 8000 Hz but falling back to the
/// device's maximum rate.
fn pick_config(device: &Device) -> Option<(StreamConfig, u32)> {
    let configs: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_input_configs().ok()?.collect();

    for range in &configs {
        if range.channels() == 1
            && range.sample_format() == SampleFormat::I16
            && range.min_sample_rate().0 <= TARGET_RATE
            && range.max_sample_rate().0 >= TARGET_RATE
        {
            return Some((
                StreamConfig {
                    channels: 1,
                    sample_rate: SampleRate(TARGET_RATE),
                    buffer_size: cpal::BufferSize::Default,
                },
                TARGET_RATE,
            ));
        }
    }

    for range in &configs {
        if range.channels() == 1 && range.sample_format() == SampleFormat::I16 {
            let rate = range.max_sample_rate().0;
            return Some((
                StreamConfig {
                    channels: 1,
                    sample_rate: SampleRate(rate),
                    buffer_size: cpal::BufferSize::Default,
                },
                rate,
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let samples = vec![1i16, 2, 3, 4];
        assert_eq!(resample(&samples, 8000, 8000), samples);
        assert!(resample(&[], 48000, 8000).is_empty());
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<i16> = (0..320).map(|i| i as i16).collect();
        let out = resample(&samples, 16000, 8000);
        assert_eq!(out.len(), 160);
        // Linear interpolation keeps endpoints in range and monotonic input
        // monotonic.
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_resample_doubles_length() {
        let samples: Vec<i16> = (0..160).map(|i| i as i16).collect();
        let out = resample(&samples, 8000, 16000);
        assert_eq!(out.len(), 320);
    }

    #[test]
    fn test_classify_backend_message() {
        assert!(matches!(
            classify_backend_message("ALSA: Permission denied"),
            CaptureError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_backend_message("Device or resource busy"),
            CaptureError::DeviceBusy(_)
        ));
        assert!(matches!(
            classify_backend_message("something exotic"),
            CaptureError::Unsupported(_)
        ));
    }
}
