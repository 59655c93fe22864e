//! Tears a stream down when its I/O worker fails.
//!
//! The worker cannot reach the device; the supervisor can. It waits for the
//! worker's failure notice or for the controller to stop the stream,
//! whichever comes first. On failure it closes the device and tells the
//! listener, so a failed stream stops even if nobody polls the controller.

use crate::driver::AudioDriver;
use crate::error::Result;
use crate::options::{StreamListener, StreamToken};
use crate::shared::StreamShared;
use crossbeam_channel::{bounded, select, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// The driver, shared between the controller and the supervisor.
pub(crate) type SharedDriver = Arc<Mutex<Box<dyn AudioDriver>>>;

pub(crate) struct StreamSupervisor {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StreamSupervisor {
    pub fn spawn(
        token: StreamToken,
        shared: Arc<StreamShared>,
        driver: SharedDriver,
        listener: Option<Arc<dyn StreamListener>>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let failures = shared.failures();

        let handle = thread::Builder::new()
            .name("duplex-supervisor".into())
            .spawn(move || {
                select! {
                    recv(failures) -> notice => {
                        if notice.is_err() {
                            return;
                        }
                        tracing::error!("I/O worker failed, closing stream {}", token.0);
                        shared.stopping.set(true);
                        driver.lock().close();
                        shared.torn_down.set(true);
                        if let Some(listener) = listener {
                            listener.on_stream_failed(token);
                        }
                    }
                    recv(shutdown_rx) -> _ => {}
                }
            })?;

        Ok(Self {
            shutdown: shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Stop watching. Returns once the supervisor thread has exited, so a
    /// teardown it started has finished.
    pub fn stop(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{CallbackIo, DeviceProcess, DeviceRequest};
    use crate::error::Error;
    use crate::simulated::{SimulatedConfig, SimulatedDevice, SimulatedDriver};
    use std::time::{Duration, Instant};

    struct Silence;

    impl DeviceProcess for Silence {
        fn process(&mut self, _io: &mut CallbackIo<'_>) {}
    }

    #[derive(Default)]
    struct Failures(Mutex<Vec<StreamToken>>);

    impl StreamListener for Failures {
        fn on_stream_failed(&self, token: StreamToken) {
            self.0.lock().push(token);
        }
    }

    fn open_driver() -> (SharedDriver, SimulatedDevice) {
        let (driver, device) = SimulatedDriver::new(SimulatedConfig::default());
        let driver: SharedDriver = Arc::new(Mutex::new(Box::new(driver)));
        let request = DeviceRequest {
            sample_rate: 44100.0,
            input_channels: 0,
            output_channels: 2,
            block_frames: None,
        };
        driver.lock().open(&request, Box::new(Silence)).unwrap();
        (driver, device)
    }

    #[test]
    fn test_failure_closes_device_and_notifies() {
        let (driver, device) = open_driver();
        let shared = Arc::new(StreamShared::new(0.0, 0, 2));
        let failures = Arc::new(Failures::default());
        let mut supervisor = StreamSupervisor::spawn(
            StreamToken(7),
            Arc::clone(&shared),
            Arc::clone(&driver),
            Some(failures.clone()),
        )
        .unwrap();
        assert!(device.is_open());

        shared.fail(Error::Storage("disk full".into()));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !shared.torn_down.get() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(shared.torn_down.get());
        assert!(!device.is_open());
        supervisor.stop();
        assert_eq!(*failures.0.lock(), vec![StreamToken(7)]);
    }

    #[test]
    fn test_stop_leaves_healthy_stream_alone() {
        let (driver, device) = open_driver();
        let shared = Arc::new(StreamShared::new(0.0, 0, 2));
        let mut supervisor =
            StreamSupervisor::spawn(StreamToken(1), Arc::clone(&shared), driver, None).unwrap();
        supervisor.stop();
        assert!(device.is_open());
        assert!(!shared.torn_down.get());
    }
}
