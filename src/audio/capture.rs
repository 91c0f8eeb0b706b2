//! # Microphone Capture Pipeline
//!
//! Opens the default input device through cpal and turns whatever format the
//! device delivers into fixed-size mono PCM16 frames at the configured
//! target rate:
//!
//! device buffer → mono downmix → clamp [-1,1] → linear resample →
//! PCM16 quantize → frame assembler → frame channel
//!
//! cpal streams are not `Send`, so the stream lives on its own OS thread for
//! its entire lifetime. Startup errors travel back over a one-shot
//! rendezvous; frames travel out over an unbounded tokio channel.

use crate::audio::frame::{self, AudioFrame, FrameAssembler};
use crate::config::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// How long to wait for the capture thread to report stream startup.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to a running capture. Dropping it stops capture.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capture, flush the partial tail frame, and join the thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start capturing from the default input device.
///
/// Device acquisition failures (no device, permission denied, unsupported
/// format) surface as [`VoiceError::MediaAccess`]. These are user-actionable
/// and are never fed into the reconnection machinery.
pub fn start_capture(
    config: &AudioConfig,
    frames_tx: UnboundedSender<AudioFrame>,
) -> VoiceResult<CaptureHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let (startup_tx, startup_rx) = std_mpsc::channel::<VoiceResult<()>>();

    let target_rate = config.sample_rate;
    let frame_samples = config.frame_samples();
    let thread_stop = Arc::clone(&stop);

    let thread = thread::Builder::new()
        .name("voice-capture".to_string())
        .spawn(move || {
            capture_thread(target_rate, frame_samples, frames_tx, thread_stop, startup_tx);
        })
        .map_err(|e| VoiceError::MediaAccess(format!("failed to spawn capture thread: {}", e)))?;

    // Wait for the stream to actually open before reporting success.
    match startup_rx.recv_timeout(STARTUP_TIMEOUT) {
        Ok(Ok(())) => {
            info!(sample_rate = target_rate, frame_samples, "Microphone capture started");
            Ok(CaptureHandle {
                stop,
                thread: Some(thread),
            })
        }
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            stop.store(true, Ordering::SeqCst);
            Err(VoiceError::MediaAccess(
                "timed out waiting for the capture device to open".to_string(),
            ))
        }
    }
}

fn capture_thread(
    target_rate: u32,
    frame_samples: usize,
    frames_tx: UnboundedSender<AudioFrame>,
    stop: Arc<AtomicBool>,
    startup_tx: std_mpsc::Sender<VoiceResult<()>>,
) {
    let host = cpal::default_host();
    let device = match host.default_input_device() {
        Some(device) => device,
        None => {
            let _ = startup_tx.send(Err(VoiceError::MediaAccess(
                "no input audio device available".to_string(),
            )));
            return;
        }
    };

    let device_config = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = startup_tx.send(Err(VoiceError::MediaAccess(format!(
                "failed to query input device config: {}",
                e
            ))));
            return;
        }
    };

    let device_rate = device_config.sample_rate().0;
    let channels = device_config.channels();
    debug!(
        device_rate,
        channels,
        format = ?device_config.sample_format(),
        "Opening input stream"
    );

    let assembler = Arc::new(Mutex::new(FrameAssembler::new(frame_samples)));
    let cb_assembler = Arc::clone(&assembler);
    let cb_tx = frames_tx.clone();
    let err_fn = |e| error!(error = %e, "Input stream error");

    // Convert one device buffer into frames and ship them.
    let process = move |floats: &[f32]| {
        let mono = frame::downmix_mono(floats, channels);
        let resampled = frame::resample_linear(&mono, device_rate, target_rate);
        let pcm = frame::f32_to_pcm16(&resampled);
        if let Ok(mut assembler) = cb_assembler.lock() {
            for frame in assembler.push(&pcm) {
                if cb_tx.send(frame).is_err() {
                    return;
                }
            }
        }
    };

    let stream = match device_config.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &device_config.into(),
            move |data: &[f32], _| process(data),
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &device_config.into(),
            move |data: &[i16], _| {
                let floats = frame::pcm16_to_f32(data);
                process(&floats);
            },
            err_fn,
            None,
        ),
        other => {
            let _ = startup_tx.send(Err(VoiceError::MediaAccess(format!(
                "unsupported input sample format: {:?}",
                other
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = startup_tx.send(Err(VoiceError::MediaAccess(format!(
                "failed to open input stream: {}",
                e
            ))));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = startup_tx.send(Err(VoiceError::MediaAccess(format!(
            "failed to start input stream: {}",
            e
        ))));
        return;
    }

    let _ = startup_tx.send(Ok(()));

    // Hold the stream alive until asked to stop.
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
    }
    drop(stream);

    // Ship the partial tail so the end of the utterance is not lost.
    if let Ok(mut assembler) = assembler.lock() {
        if let Some(tail) = assembler.flush() {
            let _ = frames_tx.send(tail);
        }
    }
    debug!("Capture thread exited");
}
