//! Effect runner for a recording session
//!
//! The [`Supervisor`] executes the effects produced by the state machine. It
//! owns the session's children in a role-indexed arena and is the only place
//! where they are created or destroyed. Everything it learns asynchronously
//! (device acquisition, chunks, replies) comes back through the session
//! mailbox as an [`Event`].

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::accumulator::{spawn_accumulator, AccumulatorCommand, AccumulatorHandle};
use crate::device::{CaptureBackend, DeviceHandle};
use crate::format::CaptureFormat;
use crate::listener::{spawn_listener, ListenerCommand, ListenerHandle};
use crate::settings::SessionConfig;
use crate::state_machine::{Effect, Event, SessionMailbox};

/// The session's children, by role.
#[derive(Default)]
struct Children {
    listener: Option<ListenerHandle>,
    accumulator: Option<AccumulatorHandle>,
}

pub struct Supervisor {
    backend: Arc<dyn CaptureBackend>,
    config: SessionConfig,
    mailbox: SessionMailbox,
    children: Children,
    acquisition: Option<JoinHandle<()>>,
    /// Device held by the session while no listener has it.
    device: Option<DeviceHandle>,
}

impl Supervisor {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        config: SessionConfig,
        mailbox: SessionMailbox,
    ) -> Self {
        Self {
            backend,
            config,
            mailbox,
            children: Children::default(),
            acquisition: None,
            device: None,
        }
    }

    #[cfg(test)]
    fn has_listener(&self) -> bool {
        self.children.listener.is_some()
    }

    #[cfg(test)]
    fn has_accumulator(&self) -> bool {
        self.children.accumulator.is_some()
    }

    /// Execute one effect. `Publish` belongs to the session loop and is
    /// ignored here.
    pub async fn run(&mut self, effect: Effect) {
        match effect {
            Effect::AcquireDevice { format } => self.acquire(format),

            Effect::SpawnListener => {
                if let Some(old) = self.children.listener.take() {
                    log::warn!("Supervisor: replacing live listener");
                    self.release(old.destroy().await);
                }
                self.children.listener =
                    Some(spawn_listener(self.mailbox.clone(), self.config.time_slice));
            }

            Effect::BindDevice { device } => match &self.children.listener {
                Some(listener) => {
                    log::debug!("Supervisor: delegating {:?} to listener", device);
                    listener.send(ListenerCommand::SetDevice(device));
                }
                None => {
                    log::warn!("Supervisor: no listener to bind {:?}, holding it", device);
                    self.device = Some(device);
                }
            },

            Effect::SpawnAccumulator { id, format } => {
                if let Some(old) = self.children.accumulator.take() {
                    log::debug!("Supervisor: destroying accumulator {}", old.id());
                    old.destroy().await;
                }
                self.children.accumulator = Some(spawn_accumulator(
                    id,
                    format,
                    self.config.max_length,
                    self.mailbox.clone(),
                ));
            }

            Effect::StartDevice => {
                self.tell_listener(ListenerCommand::StartDevice);
            }
            Effect::StopDevice => {
                if !self.tell_listener(ListenerCommand::StopDevice) {
                    // nothing left to flush
                    let _ = self.mailbox.send(Event::DeviceStopped);
                }
            }

            Effect::PushChunk { chunk } => self.tell_accumulator(AccumulatorCommand::Push {
                chunk,
                reply_to: self.mailbox.clone(),
            }),
            Effect::StopAccumulator => self.tell_accumulator(AccumulatorCommand::Stop),
            Effect::ClearAccumulator => self.tell_accumulator(AccumulatorCommand::Clear),

            Effect::TeardownChildren => self.teardown().await,

            Effect::Publish => {}
        }
    }

    /// Destroy the children in order: listener first, then release the
    /// device it hands back, then the accumulator.
    pub async fn teardown(&mut self) {
        if let Some(acquisition) = self.acquisition.take() {
            if !acquisition.is_finished() {
                log::debug!("Supervisor: abandoning pending device acquisition");
            }
            acquisition.abort();
        }

        if let Some(listener) = self.children.listener.take() {
            let device = listener.destroy().await;
            self.release(device);
        }
        let held = self.device.take();
        self.release(held);

        if let Some(accumulator) = self.children.accumulator.take() {
            accumulator.destroy().await;
        }
    }

    fn acquire(&mut self, format: CaptureFormat) {
        let backend = Arc::clone(&self.backend);
        let mailbox = self.mailbox.clone();

        log::info!("Supervisor: acquiring device for {}", format);
        self.acquisition = Some(tokio::spawn(async move {
            let event = match backend.acquire(&format).await {
                Ok(device) => Event::DeviceReady { device },
                Err(e) => {
                    log::error!("Device acquisition failed: {}", e);
                    Event::DeviceFailed { err: e.to_string() }
                }
            };
            // a closed mailbox drops the device with the event
            let _ = mailbox.send(event);
        }));
    }

    fn release(&mut self, device: Option<DeviceHandle>) {
        if let Some(device) = device {
            log::info!("Supervisor: releasing {}", device.name());
            drop(device);
        }
    }

    fn tell_listener(&self, command: ListenerCommand) -> bool {
        match &self.children.listener {
            Some(listener) => {
                let sent = listener.send(command);
                if !sent {
                    log::warn!("Supervisor: listener mailbox closed");
                }
                sent
            }
            None => {
                log::debug!("Supervisor: no listener for {:?}", command);
                false
            }
        }
    }

    fn tell_accumulator(&self, command: AccumulatorCommand) {
        match &self.children.accumulator {
            Some(accumulator) => {
                if !accumulator.send(command) {
                    // already completed and gone
                    log::debug!("Supervisor: accumulator {} has finished", accumulator.id());
                }
            }
            None => log::debug!("Supervisor: no accumulator for {:?}", command),
        }
    }
}
