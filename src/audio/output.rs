//! cpal output sink
//!
//! Owns the output stream on a dedicated thread and renders scheduled
//! fragments at exact frame positions. The number of frames rendered is the
//! audio clock the playback scheduler works against.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::clock::{AudioClock, FrameClock};
use crate::audio::device::get_output_device;
use crate::audio::playback::{AudioSink, PlaybackEvent, PlaybackNotifier};
use crate::audio::queue::AudioFragment;
use crate::codec::audio::DecodedAudio;
use crate::error::AudioError;

/// Fragment converted to the device format, waiting for its start frame
struct ScheduledPlayback {
    sequence: u64,
    start_frame: u64,
    /// Interleaved in device channel layout and rate
    samples: Vec<f32>,
    position: usize,
}

enum OutputCommand {
    Play(ScheduledPlayback),
    CancelAll,
}

/// Audio output on the default (or a named) device
pub struct AudioOutput {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    commands: Sender<OutputCommand>,
    error_rx: Receiver<AudioError>,
    clock: FrameClock,
    channels: u16,
}

impl AudioOutput {
    /// Open the output stream and start the clock
    pub fn open(device_id: Option<&str>, notifier: PlaybackNotifier) -> Result<Self, AudioError> {
        let device = get_output_device(device_id)?;
        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = config.channels;
        let clock = FrameClock::new(config.sample_rate.0);

        let running = Arc::new(AtomicBool::new(true));
        let (command_tx, command_rx) = unbounded::<OutputCommand>();
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running_for_loop = running.clone();
        let callback_clock = clock.clone();

        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let mut renderer = Renderer {
                    commands: command_rx,
                    pending: VecDeque::new(),
                    current: None,
                    clock: callback_clock,
                    channels: channels as usize,
                    notifier,
                };

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.render(data),
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::StreamError("Output thread exited".to_string()));
            }
        }

        tracing::info!(
            "Audio output started: {} Hz, {} channels",
            clock.sample_rate(),
            channels
        );

        Ok(Self {
            running,
            thread_handle: Some(handle),
            commands: command_tx,
            error_rx,
            clock,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Check for stream errors reported by the backend
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    /// Stop the output stream
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl AudioSink for AudioOutput {
    fn clock(&self) -> Arc<dyn AudioClock> {
        Arc::new(self.clock.clone())
    }

    fn schedule(&mut self, fragment: AudioFragment, start_at: Duration) -> Result<(), AudioError> {
        if let Some(err) = self.check_errors() {
            return Err(err);
        }

        let samples = convert_format(&fragment.audio, self.clock.sample_rate(), self.channels);
        let playback = ScheduledPlayback {
            sequence: fragment.sequence,
            start_frame: self.clock.frame_at(start_at),
            samples,
            position: 0,
        };

        self.commands
            .send(OutputCommand::Play(playback))
            .map_err(|_| AudioError::StreamError("Output stream stopped".to_string()))
    }

    fn cancel_all(&mut self) {
        let _ = self.commands.send(OutputCommand::CancelAll);
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the output callback
struct Renderer {
    commands: Receiver<OutputCommand>,
    pending: VecDeque<ScheduledPlayback>,
    current: Option<ScheduledPlayback>,
    clock: FrameClock,
    channels: usize,
    notifier: PlaybackNotifier,
}

impl Renderer {
    fn render(&mut self, data: &mut [f32]) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                OutputCommand::Play(playback) => self.pending.push_back(playback),
                OutputCommand::CancelAll => {
                    self.pending.clear();
                    self.current = None;
                }
            }
        }

        let base = self.clock.frames();
        let mut frames = 0u64;

        for (i, frame) in data.chunks_mut(self.channels).enumerate() {
            let now = base + i as u64;
            frames += 1;

            if self.current.is_none()
                && self.pending.front().map(|p| p.start_frame <= now).unwrap_or(false)
            {
                self.current = self.pending.pop_front();
            }

            let Some(playing) = self.current.as_mut() else {
                frame.fill(0.0);
                continue;
            };

            let start = playing.position * self.channels;
            match playing.samples.get(start..start + self.channels) {
                Some(samples) => frame.copy_from_slice(samples),
                None => frame.fill(0.0),
            }
            playing.position += 1;

            if playing.position * self.channels >= playing.samples.len() {
                let _ = self.notifier.send(PlaybackEvent::Finished {
                    sequence: playing.sequence,
                });
                self.current = None;
            }
        }

        self.clock.advance(frames);
    }
}

/// Resample (linear) and remap channels to the device layout
fn convert_format(audio: &DecodedAudio, rate: u32, channels: u16) -> Vec<f32> {
    let in_channels = audio.channels.max(1) as usize;
    let out_channels = channels.max(1) as usize;
    let in_frames = audio.frames();
    if in_frames == 0 {
        return Vec::new();
    }

    let ratio = audio.sample_rate as f64 / rate as f64;
    let out_frames = ((in_frames as f64) / ratio).round().max(1.0) as usize;
    let mut out = Vec::with_capacity(out_frames * out_channels);

    for i in 0..out_frames {
        let pos = i as f64 * ratio;
        let idx = (pos.floor() as usize).min(in_frames - 1);
        let next = (idx + 1).min(in_frames - 1);
        let frac = (pos - idx as f64) as f32;

        for ch in 0..out_channels {
            let src = if in_channels == 1 { 0 } else { ch % in_channels };
            let a = audio.samples[idx * in_channels + src];
            let b = audio.samples[next * in_channels + src];
            out.push(a + (b - a) * frac);
        }
    }

    out
}
