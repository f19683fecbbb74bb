#![allow(dead_code)]

use btbattery_lib::transport::{BleTransport, GattProfile};
use btbattery_lib::TransportError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
pub struct Script {
    /// Every frame written, in order
    pub writes: Vec<Vec<u8>>,
    /// Fragments delivered on the next waits
    pub pending: VecDeque<Vec<u8>>,
    /// Connect attempts that fail before one succeeds
    pub connect_failures: u32,
    pub connects: u32,
    pub connected: bool,
    /// The next wait reports a dropped link
    pub drop_link: bool,
    /// Writes issued while notifications were still undelivered
    pub overlapping_writes: u32,
    pub profile: Option<GattProfile>,
    pub responder: Option<Responder>,
}

/// In-memory transport answering writes through a responder closure.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn with_responder(
        responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    ) -> Self {
        let transport = Self::default();
        transport.script().responder = Some(Box::new(responder));
        transport
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Queues a frame as 20 byte notifications.
    pub fn notify(&self, frame: &[u8]) {
        self.script()
            .pending
            .extend(frame.chunks(20).map(<[u8]>::to_vec));
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.script().writes.clone()
    }
}

/// Splits a frame the way a 20 byte MTU does.
pub fn fragments(frame: &[u8]) -> Vec<Vec<u8>> {
    frame.chunks(20).map(<[u8]>::to_vec).collect()
}

impl BleTransport for ScriptedTransport {
    async fn connect(&mut self, _address: &str, profile: &GattProfile) -> Result<(), TransportError> {
        let mut script = self.script();
        if script.connect_failures > 0 {
            script.connect_failures -= 1;
            return Err(TransportError::Connect("scripted failure".into()));
        }
        script.connects += 1;
        script.connected = true;
        script.profile = Some(*profile);
        script.pending.clear();
        Ok(())
    }

    async fn write(&mut self, data: &[u8], _with_response: bool) -> Result<(), TransportError> {
        let mut script = self.script();
        if !script.connected {
            return Err(TransportError::NotConnected);
        }
        if !script.pending.is_empty() {
            script.overlapping_writes += 1;
        }
        script.writes.push(data.to_vec());
        if let Some(mut responder) = script.responder.take() {
            let replies = responder(data);
            script.pending.extend(replies);
            script.responder = Some(responder);
        }
        Ok(())
    }

    async fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        {
            let mut script = self.script();
            if script.drop_link {
                script.drop_link = false;
                script.connected = false;
                return Err(TransportError::Disconnected);
            }
            if !script.connected {
                return Err(TransportError::NotConnected);
            }
            if let Some(fragment) = script.pending.pop_front() {
                return Ok(Some(fragment));
            }
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.script().connected = false;
        Ok(())
    }
}
