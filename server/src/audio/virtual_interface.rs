//! In-process audio driver with no real device. Used by tests and by the
//! binary when run headless (no `--device` flag and no output hardware);
//! ticks a background thread at the configured block rate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;

use super::{AudioCallback, AudioInterface};

pub struct VirtualInterface {
    sample_rate: u32,
    buffer_size: usize,
    output_ports: usize,
    callback: Arc<Mutex<Option<AudioCallback>>>,
    sample_clock: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl VirtualInterface {
    pub fn new(sample_rate: u32, buffer_size: usize, output_ports: usize) -> Self {
        Self {
            sample_rate,
            buffer_size,
            output_ports,
            callback: Arc::new(Mutex::new(None)),
            sample_clock: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Drive exactly one block synchronously, for deterministic tests.
    pub fn tick(&self) {
        let mut buffers = vec![vec![0.0f32; self.buffer_size]; self.output_ports];
        let block_start = self.sample_clock.fetch_add(self.buffer_size as u64, Ordering::Relaxed);
        if let Some(cb) = self.callback.lock().as_mut() {
            cb(&mut buffers, block_start);
        }
    }
}

impl AudioInterface for VirtualInterface {
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
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = self.running.clone();
        let callback = self.callback.clone();
        let sample_clock = self.sample_clock.clone();
        let buffer_size = self.buffer_size;
        let output_ports = self.output_ports;
        let block_period =
            Duration::from_secs_f64(buffer_size as f64 / self.sample_rate as f64);

        self.worker = Some(std::thread::spawn(move || {
            let mut buffers = vec![vec![0.0f32; buffer_size]; output_ports];
            while running.load(Ordering::Relaxed) {
                let block_start = sample_clock.fetch_add(buffer_size as u64, Ordering::Relaxed);
                if let Some(cb) = callback.lock().as_mut() {
                    cb(&mut buffers, block_start);
                }
                std::thread::sleep(block_period);
            }
        }));

        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn current_sample_time(&self) -> u64 {
        self.sample_clock.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tick_advances_clock_and_invokes_callback() {
        let mut iface = VirtualInterface::new(48_000, 64, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        iface.set_callback(Box::new(move |buffers, _block_start| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            buffers[0][0] = 1.0;
        }));

        iface.tick();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(iface.current_sample_time(), 64);

        iface.tick();
        assert_eq!(iface.current_sample_time(), 128);
    }
}
