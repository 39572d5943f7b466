//! Device listener actor
//!
//! Bridges a push-style [`CaptureDevice`](crate::device::CaptureDevice) into
//! the session's mailbox. While bound, every non-empty data event becomes one
//! [`Event::Chunk`]. Stopping the device forwards everything it emitted, final
//! flush included, and then confirms with [`Event::DeviceStopped`]. The device
//! is held here from `SetDevice` until the listener is destroyed, at which
//! point it is unsubscribed and handed back. Device calls run on the blocking
//! pool.
//!
//! ```text
//! Device thread (sync)            Listener task                Session task
//! ┌──────────────┐  DeviceData  ┌──────────────────┐  Chunk  ┌────────────┐
//! │ data events  │─────────────▶│ filter empty     │────────▶│ reduce()   │
//! └──────────────┘              │ Set/Start/Stop   │◀────────│ supervisor │
//!                               └──────────────────┘ commands└────────────┘
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::artifact::DataChunk;
use crate::device::{DeviceData, DeviceHandle};
use crate::state_machine::{Event, SessionMailbox};

/// Messages the listener accepts.
#[derive(Debug)]
pub enum ListenerCommand {
    /// Take over the device and start forwarding its data.
    SetDevice(DeviceHandle),
    StartDevice,
    StopDevice,
}

/// Handle to a running listener, held by the session's supervisor.
pub struct ListenerHandle {
    tx: mpsc::UnboundedSender<ListenerCommand>,
    join: JoinHandle<Option<DeviceHandle>>,
}

impl ListenerHandle {
    pub fn send(&self, command: ListenerCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Close the mailbox, let the listener finish queued commands and tear
    /// down, and take the device back.
    pub async fn destroy(self) -> Option<DeviceHandle> {
        let ListenerHandle { tx, join } = self;
        drop(tx);
        match join.await {
            Ok(device) => device,
            Err(e) => {
                log::error!("Listener task failed: {}", e);
                None
            }
        }
    }
}

pub fn spawn_listener(session: SessionMailbox, slice: Duration) -> ListenerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = DeviceListener {
        session,
        slice,
        device: None,
        data_rx: None,
        forwarded: 0,
        dropped_empty: 0,
    };
    let join = tokio::spawn(listener.run(rx));
    ListenerHandle { tx, join }
}

struct DeviceListener {
    session: SessionMailbox,
    slice: Duration,
    device: Option<DeviceHandle>,
    data_rx: Option<mpsc::UnboundedReceiver<DeviceData>>,
    forwarded: u64,
    dropped_empty: u64,
}

impl DeviceListener {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ListenerCommand>,
    ) -> Option<DeviceHandle> {
        log::debug!("Listener: started (slice {:?})", self.slice);

        loop {
            tokio::select! {
                // data already emitted goes out before the next command
                biased;
                Some(data) = next_data(&mut self.data_rx) => self.forward(data),
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        self.teardown().await
    }

    async fn handle(&mut self, command: ListenerCommand) {
        match command {
            ListenerCommand::SetDevice(mut device) => {
                if let Some(old) = self.device.take() {
                    log::warn!("Listener: replacing bound device {:?}", old);
                    drop(self.release(old).await);
                }
                let (tx, rx) = mpsc::unbounded_channel();
                device.subscribe(tx);
                log::info!("Listener: bound to {}", device.name());
                self.data_rx = Some(rx);
                self.device = Some(device);
            }
            ListenerCommand::StartDevice => {
                let Some(device) = self.device.take() else {
                    log::warn!("Listener: start requested with no device bound");
                    return;
                };
                let slice = self.slice;
                if let Some((device, result)) =
                    off_runtime(device, move |device| device.start(slice)).await
                {
                    match result {
                        Ok(()) => log::info!("Listener: {} started", device.name()),
                        Err(e) => {
                            log::error!("Listener: failed to start {}: {}", device.name(), e)
                        }
                    }
                    self.device = Some(device);
                }
            }
            ListenerCommand::StopDevice => {
                if let Some(device) = self.device.take() {
                    self.device = stop(device).await;
                }
                // the final flush is already in the channel
                self.drain();
                if self.session.send(Event::DeviceStopped).is_err() {
                    log::debug!("Listener: session gone before device stop was confirmed");
                }
            }
        }
    }

    fn forward(&mut self, data: DeviceData) {
        if data.is_empty() {
            self.dropped_empty += 1;
            return;
        }

        let chunk = DataChunk::new(data.payload);
        if self.session.send(Event::Chunk { chunk }).is_err() {
            log::debug!("Listener: session gone, dropping chunk");
            return;
        }
        self.forwarded += 1;
    }

    fn drain(&mut self) {
        let mut pending = Vec::new();
        if let Some(rx) = self.data_rx.as_mut() {
            while let Ok(data) = rx.try_recv() {
                pending.push(data);
            }
        }
        for data in pending {
            self.forward(data);
        }
    }

    async fn teardown(mut self) -> Option<DeviceHandle> {
        let device = self.device.take()?;
        let device = self.release(device).await?;
        log::info!(
            "Listener: unbound from {} ({} chunks forwarded, {} empty dropped)",
            device.name(),
            self.forwarded,
            self.dropped_empty
        );
        Some(device)
    }

    /// Stop the device if needed, unsubscribe, and forward whatever it
    /// emitted on the way out.
    async fn release(&mut self, device: DeviceHandle) -> Option<DeviceHandle> {
        let mut device = if device.is_running() {
            stop(device).await?
        } else {
            device
        };
        device.unsubscribe();
        self.drain();
        self.data_rx = None;
        Some(device)
    }
}

async fn stop(device: DeviceHandle) -> Option<DeviceHandle> {
    let (device, result) = off_runtime(device, |device| device.stop()).await?;
    if let Err(e) = result {
        log::error!("Listener: failed to stop {}: {}", device.name(), e);
    }
    Some(device)
}

/// Run a device call on the blocking pool and take the device back. Real
/// devices join capture threads on start and stop.
async fn off_runtime<T, F>(mut device: DeviceHandle, call: F) -> Option<(DeviceHandle, T)>
where
    F: FnOnce(&mut DeviceHandle) -> T + Send + 'static,
    T: Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        let out = call(&mut device);
        (device, out)
    })
    .await;
    match joined {
        Ok(done) => Some(done),
        Err(e) => {
            log::error!("Listener: device call panicked, device lost: {}", e);
            None
        }
    }
}

async fn next_data(rx: &mut Option<mpsc::UnboundedReceiver<DeviceData>>) -> Option<DeviceData> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::{MemoryBackend, MemoryProbe};
    use crate::device::CaptureBackend;
    use crate::format::CaptureFormat;

    async fn bound_listener() -> (
        ListenerHandle,
        MemoryProbe,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let backend = MemoryBackend::new(["audio/ogg"]);
        let probe = backend.probe();
        let device = backend
            .acquire(&CaptureFormat::new("audio/ogg").unwrap())
            .await
            .unwrap();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let listener = spawn_listener(session_tx, Duration::from_millis(1000));
        listener.send(ListenerCommand::SetDevice(device));
        listener.send(ListenerCommand::StartDevice);
        wait_until(|| probe.is_running()).await;
        (listener, probe, session_rx)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn chunk_bytes(event: Event) -> Vec<u8> {
        match event {
            Event::Chunk { chunk } => chunk.as_bytes().to_vec(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn start_uses_configured_slice() {
        let (listener, probe, _rx) = bound_listener().await;
        assert_eq!(probe.slice(), Some(Duration::from_millis(1000)));
        assert!(probe.is_subscribed());
        listener.destroy().await;
    }

    #[tokio::test]
    async fn forwards_non_empty_data_in_order() {
        let (listener, probe, mut rx) = bound_listener().await;

        probe.emit(vec![1]);
        probe.emit(Vec::new());
        probe.emit(vec![2, 2]);

        assert_eq!(chunk_bytes(rx.recv().await.unwrap()), vec![1]);
        assert_eq!(chunk_bytes(rx.recv().await.unwrap()), vec![2, 2]);

        listener.destroy().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_forwards_final_flush() {
        let (listener, probe, mut rx) = bound_listener().await;

        probe.set_final_flush(vec![7, 7, 7]);
        listener.send(ListenerCommand::StopDevice);

        assert_eq!(chunk_bytes(rx.recv().await.unwrap()), vec![7, 7, 7]);
        assert!(matches!(rx.recv().await, Some(Event::DeviceStopped)));
        assert!(!probe.is_running());
        assert_eq!(probe.stop_count(), 1);
        listener.destroy().await;
    }

    #[tokio::test]
    async fn data_queued_before_stop_precedes_confirmation() {
        let (listener, probe, mut rx) = bound_listener().await;

        probe.emit(vec![1]);
        probe.emit(vec![2]);
        probe.set_final_flush(vec![3]);
        listener.send(ListenerCommand::StopDevice);

        for expected in [vec![1], vec![2], vec![3]] {
            assert_eq!(chunk_bytes(rx.recv().await.unwrap()), expected);
        }
        assert!(matches!(rx.recv().await, Some(Event::DeviceStopped)));
        listener.destroy().await;
    }

    #[tokio::test]
    async fn stop_without_device_still_confirms() {
        let (session_tx, mut rx) = mpsc::unbounded_channel();
        let listener = spawn_listener(session_tx, Duration::from_millis(1000));
        listener.send(ListenerCommand::StopDevice);
        assert!(matches!(rx.recv().await, Some(Event::DeviceStopped)));
        assert!(listener.destroy().await.is_none());
    }

    #[tokio::test]
    async fn destroy_unsubscribes_and_returns_device() {
        let (listener, probe, _rx) = bound_listener().await;

        let device = listener.destroy().await.expect("device handed back");
        assert!(!probe.is_subscribed());
        assert!(!probe.is_running());
        assert_eq!(probe.released_count(), 0);

        drop(device);
        assert_eq!(probe.released_count(), 1);
        assert!(!probe.emit(vec![1]));
    }

    #[tokio::test]
    async fn destroy_without_device_returns_none() {
        let (session_tx, _rx) = mpsc::unbounded_channel();
        let listener = spawn_listener(session_tx, Duration::from_millis(1000));
        listener.send(ListenerCommand::StartDevice);
        assert!(listener.destroy().await.is_none());
    }
}
