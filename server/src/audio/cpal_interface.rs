//! Real audio device backed by `cpal`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use tracing::{error, info};

use super::{AudioCallback, AudioInterface};

pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

pub struct CpalInterface {
    host: Host,
    device: Device,
    sample_rate: u32,
    buffer_size: usize,
    output_ports: usize,
    stream: Option<Stream>,
    callback: Arc<Mutex<Option<AudioCallback>>>,
    sample_clock: Arc<AtomicU64>,
    scratch: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl CpalInterface {
    pub fn new(sample_rate: u32, buffer_size: usize, output_ports: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device"))?;
        Ok(Self {
            host,
            device,
            sample_rate,
            buffer_size,
            output_ports,
            stream: None,
            callback: Arc::new(Mutex::new(None)),
            sample_clock: Arc::new(AtomicU64::new(0)),
            scratch: Arc::new(Mutex::new(vec![Vec::new(); output_ports])),
        })
    }

    pub fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        let mut devices = Vec::new();
        let default_name = self.host.default_output_device().and_then(|d| d.name().ok());
        if let Ok(outputs) = self.host.output_devices() {
            for device in outputs {
                if let Ok(name) = device.name() {
                    let is_default = default_name.as_ref() == Some(&name);
                    devices.push(AudioDeviceInfo {
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                    });
                }
            }
        }
        devices
    }
}

impl AudioInterface for CpalInterface {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn output_ports(&self) -> usize {
        self.output_ports
    }

    fn set_callback(&mut self, callback: AudioCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn start(&mut self) -> Result<()> {
        let config = StreamConfig {
            channels: self.output_ports as u16,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.buffer_size as u32),
        };

        let channels = self.output_ports;
        let callback = self.callback.clone();
        let sample_clock = self.sample_clock.clone();
        let scratch = self.scratch.clone();
        let frames_per_block = self.buffer_size;

        let stream = self.device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                let mut buffers = scratch.lock();
                for port in buffers.iter_mut() {
                    port.clear();
                    port.resize(frames, 0.0);
                }

                let block_start = sample_clock.fetch_add(frames as u64, Ordering::Relaxed);

                if let Some(cb) = callback.lock().as_mut() {
                    cb(&mut buffers, block_start);
                }

                for frame in 0..frames {
                    for (ch, port) in buffers.iter().enumerate() {
                        let idx = frame * channels + ch;
                        if idx < data.len() {
                            data[idx] = port.get(frame).copied().unwrap_or(0.0);
                        }
                    }
                }
                let _ = frames_per_block;
            },
            |err| error!("output stream error: {err}"),
            None,
        )?;

        stream.play()?;
        self.stream = Some(stream);
        info!(
            "cpal audio interface started: {} Hz, {} frames/block, {} outputs",
            self.sample_rate, self.buffer_size, self.output_ports
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }

    fn current_sample_time(&self) -> u64 {
        self.sample_clock.load(Ordering::Relaxed)
    }
}

#[allow(dead_code)]
fn assert_sample_format_supported(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::F32)
}
