//! TNC command client.
//!
//! A receive loop on its own thread decodes KISS frames into [`Telemetry`]
//! and forwards them to the observer; the caller's thread sends commands
//! over the same transport. There is no request correlation on the wire:
//! [`TncClient::request`] waits for the first reply the caller's predicate
//! accepts.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{LinkConfig, UploadConfig};
use crate::events::{TncEvent, TncObserver};
use crate::payload::FirmwareImage;
use crate::protocol::constants::API_VERSION_1_0;
use crate::protocol::{self, Command, Decoder, Packet, Telemetry};
use crate::retry::RetryPolicy;
use crate::session::{FirmwareLoader, LoaderError};
use crate::transport::{Transport, TransportError};

/// Bytes requested per receive-loop read.
const READ_CHUNK: usize = 160;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("No reply to {command}")]
    NoReply { command: String },

    #[error("Setting not applied: expected {expected:?}, device reports {actual:?}")]
    Mismatch { expected: Telemetry, actual: Telemetry },

    #[error("Not connected")]
    NotConnected,

    #[error("Another request is already waiting for a reply")]
    Busy,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Upload error: {0}")]
    Upload(#[from] LoaderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// KISS parameters that can be set and read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KissParameter {
    TxDelay,
    Persistence,
    SlotTime,
    TxTail,
    Duplex,
}

impl KissParameter {
    pub fn set_command(self, value: u8) -> Command {
        match self {
            KissParameter::TxDelay => Command::SetTxDelay(value),
            KissParameter::Persistence => Command::SetPersistence(value),
            KissParameter::SlotTime => Command::SetSlotTime(value),
            KissParameter::TxTail => Command::SetTxTail(value),
            KissParameter::Duplex => Command::SetDuplex(value != 0),
        }
    }

    pub fn query_command(self) -> Command {
        match self {
            KissParameter::TxDelay => Command::GetTxDelay,
            KissParameter::Persistence => Command::GetPersistence,
            KissParameter::SlotTime => Command::GetSlotTime,
            KissParameter::TxTail => Command::GetTxTail,
            KissParameter::Duplex => Command::GetDuplex,
        }
    }

    /// Reply the device sends once `value` is applied.
    pub fn expected_reply(self, value: u8) -> Telemetry {
        match self {
            KissParameter::TxDelay => Telemetry::TxDelay(value),
            KissParameter::Persistence => Telemetry::Persistence(value),
            KissParameter::SlotTime => Telemetry::SlotTime(value),
            KissParameter::TxTail => Telemetry::TxTail(value),
            KissParameter::Duplex => Telemetry::Duplex(value != 0),
        }
    }
}

/// State shared with the receive loop.
struct Shared<T, O> {
    transport: Arc<T>,
    observer: Arc<O>,
    /// API version last reported by the device.
    api_version: AtomicU16,
    connected: AtomicBool,
    pending: Mutex<Option<mpsc::Sender<Telemetry>>>,
}

impl<T: Transport, O: TncObserver> Shared<T, O> {
    fn write_command(&self, command: &Command) -> Result<(), TransportError> {
        let payload = command.to_bytes(self.api_version.load(Ordering::Acquire));
        let frame = protocol::encode(&payload);
        trace!(command = ?command, len = frame.len(), "Sending command");
        self.transport.write(&frame)?;
        Ok(())
    }

    fn dispatch(&self, packet: Packet) {
        if packet.is_log() {
            let text = String::from_utf8_lossy(&packet.data).into_owned();
            self.observer.on_event(&TncEvent::Notice(text));
            return;
        }

        let api_version = self.api_version.load(Ordering::Acquire);
        let telemetry = match Telemetry::decode(&packet, api_version) {
            Ok(Some(t)) => t,
            Ok(None) => {
                trace!(
                    packet_type = packet.packet_type,
                    sub_type = ?packet.sub_type,
                    "Ignoring unknown packet"
                );
                return;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed packet");
                return;
            }
        };

        if let Telemetry::ApiVersion(v) = &telemetry {
            debug!(api_version = %format!("0x{:04X}", v), "Device API version");
            self.api_version.store(*v, Ordering::Release);
        }

        if let Some(tx) = self.pending.lock().unwrap().as_ref() {
            let _ = tx.send(telemetry.clone());
        }
        self.observer.on_event(&TncEvent::Telemetry(telemetry));
    }
}

fn receive_loop<T: Transport, O: TncObserver>(
    shared: Arc<Shared<T, O>>,
    stop: Arc<AtomicBool>,
    read_timeout: Duration,
) {
    let mut decoder = Decoder::new();
    debug!("Receive loop started");

    while !stop.load(Ordering::Acquire) {
        match shared.transport.read(READ_CHUNK, read_timeout) {
            Ok(bytes) => {
                for packet in decoder.feed(&bytes) {
                    shared.dispatch(packet);
                }
            }
            Err(TransportError::Disconnected) => {
                info!("Transport closed");
                if shared.connected.swap(false, Ordering::AcqRel) {
                    shared.observer.on_event(&TncEvent::Disconnected);
                }
                break;
            }
            Err(e) => {
                error!(error = %e, "Receive failed");
                shared.observer.on_event(&TncEvent::Error {
                    message: e.to_string(),
                });
                break;
            }
        }
    }

    debug!(
        malformed_escapes = decoder.malformed_escapes(),
        "Receive loop stopped"
    );
}

/// Connection to a TNC.
pub struct TncClient<T: Transport + 'static, O: TncObserver + 'static> {
    shared: Arc<Shared<T, O>>,
    config: LinkConfig,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static, O: TncObserver + 'static> TncClient<T, O> {
    /// Start the receive loop and bring the TNC into streaming mode.
    #[instrument(skip_all)]
    pub fn connect(transport: T, config: LinkConfig, observer: Arc<O>) -> Result<Self, ClientError> {
        Self::connect_shared(Arc::new(transport), config, observer)
    }

    /// Like [`TncClient::connect`] for a transport the caller keeps a handle to.
    pub fn connect_shared(
        transport: Arc<T>,
        config: LinkConfig,
        observer: Arc<O>,
    ) -> Result<Self, ClientError> {
        let shared = Arc::new(Shared {
            transport,
            observer,
            api_version: AtomicU16::new(API_VERSION_1_0),
            connected: AtomicBool::new(true),
            pending: Mutex::new(None),
        });
        let mut client = Self {
            shared,
            config,
            stop: Arc::new(AtomicBool::new(true)),
            receiver: None,
        };

        client.start_loop()?;
        client.shared.observer.on_event(&TncEvent::Connected);
        info!("TNC connected");

        let settle = client.config.settle_delay();
        client.send(&Command::PttOff)?;
        thread::sleep(settle);
        client.send(&Command::GetAllValues)?;
        thread::sleep(settle);
        client.send(&Command::StreamVolume)?;

        Ok(client)
    }

    fn start_loop(&mut self) -> Result<(), ClientError> {
        if self.receiver.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let loop_stop = Arc::clone(&stop);
        let read_timeout = self.config.read_timeout();
        let handle = thread::Builder::new()
            .name("tnc-rx".to_string())
            .spawn(move || receive_loop(shared, loop_stop, read_timeout))?;
        self.stop = stop;
        self.receiver = Some(handle);
        Ok(())
    }

    fn stop_loop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!("Receive loop panicked");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// True while the receive loop is running.
    pub fn is_receiving(&self) -> bool {
        self.receiver.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// API version the device reported, 1.0 until it says otherwise.
    pub fn api_version(&self) -> u16 {
        self.shared.api_version.load(Ordering::Acquire)
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    /// Send one command without waiting for a reply.
    pub fn send(&self, command: &Command) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.shared.write_command(command)?;
        Ok(())
    }

    /// Send `command` and wait for a reply accepted by `accept`.
    ///
    /// The command is resent on each retry.
    pub fn request<F>(
        &self,
        command: &Command,
        accept: F,
        retry: RetryPolicy,
    ) -> Result<Telemetry, ClientError>
    where
        F: Fn(&Telemetry) -> bool,
    {
        if !self.is_receiving() {
            return Err(ClientError::NotConnected);
        }

        let (tx, rx) = mpsc::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.is_some() {
                return Err(ClientError::Busy);
            }
            *pending = Some(tx);
        }

        let result = retry.run("request", |_| {
            self.send(command)?;
            let deadline = Instant::now() + retry.timeout();
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok(reply) if accept(&reply) => return Ok(reply),
                    Ok(_) => continue,
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                        return Err(ClientError::NoReply {
                            command: format!("{command:?}"),
                        });
                    }
                }
            }
        });

        *self.shared.pending.lock().unwrap() = None;
        result
    }

    /// Apply a setting and confirm the device echoes `expected`.
    pub fn set_confirmed(
        &self,
        set: &Command,
        query: &Command,
        expected: Telemetry,
    ) -> Result<(), ClientError> {
        self.send(set)?;
        let kind = mem::discriminant(&expected);
        let actual = self.request(query, |t| mem::discriminant(t) == kind, self.config.request)?;
        if actual != expected {
            return Err(ClientError::Mismatch { expected, actual });
        }
        info!(setting = ?expected, "Setting confirmed");
        Ok(())
    }

    pub fn set_kiss_parameter(&self, parameter: KissParameter, value: u8) -> Result<(), ClientError> {
        self.set_confirmed(
            &parameter.set_command(value),
            &parameter.query_command(),
            parameter.expected_reply(value),
        )
    }

    /// Stop the receive loop, keeping the transport.
    pub fn suspend(&mut self) {
        if self.receiver.is_none() {
            return;
        }
        if let Err(e) = self.send(&Command::PollVolume) {
            debug!(error = %e, "Could not stop volume streaming");
        }
        self.stop_loop();
        debug!("Receive loop suspended");
    }

    /// Restart the receive loop and refresh all values.
    pub fn resume(&mut self) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.start_loop()?;
        self.send(&Command::GetAllValues)?;
        self.send(&Command::StreamVolume)?;
        debug!("Receive loop resumed");
        Ok(())
    }

    /// Suspend telemetry and run a firmware upload on a worker thread.
    ///
    /// The device must already be in its bootloader. Call [`resume`] once
    /// the returned handle has been joined and the TNC has rebooted.
    ///
    /// [`resume`]: TncClient::resume
    pub fn upload_firmware<P: TncObserver + 'static>(
        &mut self,
        firmware: FirmwareImage,
        config: UploadConfig,
        observer: Arc<P>,
    ) -> Result<JoinHandle<Result<(), LoaderError>>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.suspend();
        let loader = FirmwareLoader::with_observer(
            Arc::clone(&self.shared.transport),
            firmware,
            config,
            observer,
        );
        Ok(loader.spawn()?)
    }

    /// Stop streaming, stop the receive loop and report the disconnect.
    ///
    /// Safe to call more than once.
    pub fn disconnect(&mut self) {
        let was_connected = self.shared.connected.load(Ordering::Acquire);
        if was_connected && self.receiver.is_some() {
            if let Err(e) = self.shared.write_command(&Command::PollVolume) {
                debug!(error = %e, "Could not stop volume streaming");
            }
        }
        self.stop_loop();
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            self.shared.observer.on_event(&TncEvent::Disconnected);
            info!("TNC disconnected");
        }
    }
}

impl<T: Transport + 'static, O: TncObserver + 'static> Drop for TncClient<T, O> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;
    use crate::protocol::constants::*;
    use crate::protocol::encode;
    use crate::transport::MockTransport;

    type Client = TncClient<MockTransport, RecordingObserver>;

    fn fast_link() -> LinkConfig {
        LinkConfig {
            read_timeout_ms: 10,
            settle_delay_ms: 0,
            request: RetryPolicy::new(3, 100, 0),
        }
    }

    fn connect() -> (Client, Arc<MockTransport>, Arc<RecordingObserver>) {
        let mock = Arc::new(MockTransport::new());
        let observer = Arc::new(RecordingObserver::new());
        let client = TncClient::connect_shared(mock.clone(), fast_link(), observer.clone()).unwrap();
        (client, mock, observer)
    }

    fn frame(command: &Command) -> Vec<u8> {
        encode(&command.to_bytes(API_VERSION_1_0))
    }

    fn wait_for(observer: &RecordingObserver, predicate: impl Fn(&TncEvent) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if observer.count(&predicate) > 0 {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_connect_sequence() {
        let (client, mock, observer) = connect();
        assert!(client.is_connected());
        assert!(client.is_receiving());

        let writes = mock.get_writes();
        assert_eq!(
            writes,
            vec![
                frame(&Command::PttOff),
                frame(&Command::GetAllValues),
                frame(&Command::StreamVolume),
            ]
        );
        assert_eq!(observer.events()[0], TncEvent::Connected);
    }

    #[test]
    fn test_telemetry_dispatch() {
        let (_client, mock, observer) = connect();
        mock.queue_bytes(&encode(&[PACKET_HARDWARE, RSP_BATTERY_LEVEL, 0x0F, 0xA0]));

        assert!(wait_for(&observer, |e| *e
            == TncEvent::Telemetry(Telemetry::BatteryLevel(4000))));
    }

    #[test]
    fn test_unknown_subtype_ignored() {
        let (_client, mock, observer) = connect();
        mock.queue_bytes(&encode(&[PACKET_HARDWARE, 0x99, 0x01]));
        mock.queue_bytes(&encode(&[PACKET_HARDWARE, RSP_TX_DELAY, 30]));

        assert!(wait_for(&observer, |e| matches!(e, TncEvent::Telemetry(_))));
        assert_eq!(observer.telemetry(), vec![Telemetry::TxDelay(30)]);
    }

    #[test]
    fn test_log_packet_becomes_notice() {
        let (_client, mock, observer) = connect();
        let mut payload = vec![PACKET_LOG];
        payload.extend_from_slice(b"battery low");
        mock.queue_bytes(&encode(&payload));

        assert!(wait_for(&observer, |e| *e
            == TncEvent::Notice("battery low".to_string())));
        assert!(observer.telemetry().is_empty());
    }

    #[test]
    fn test_api_version_changes_decoding() {
        let (client, mock, observer) = connect();
        mock.queue_bytes(&encode(&[PACKET_HARDWARE, RSP_API_VERSION, 0x02, 0x00]));
        assert!(wait_for(&observer, |e| matches!(
            e,
            TncEvent::Telemetry(Telemetry::ApiVersion(_))
        )));
        assert_eq!(client.api_version(), API_VERSION_2_0);

        mock.queue_bytes(&encode(&[PACKET_HARDWARE, RSP_TX_VOLUME, 0x01, 0x00]));
        assert!(wait_for(&observer, |e| *e
            == TncEvent::Telemetry(Telemetry::TxVolume(256))));

        mock.clear_writes();
        client.send(&Command::SetOutputVolume(300)).unwrap();
        assert_eq!(
            mock.get_writes(),
            vec![encode(&[PACKET_HARDWARE, CMD_SET_OUTPUT_VOLUME, 0x01, 0x2C])]
        );
    }

    #[test]
    fn test_streamed_input_levels_write_nothing() {
        let (_client, mock, observer) = connect();
        mock.clear_writes();
        for level in [0x28, 0x29, 0x2A, 0x2B, 0x2C] {
            mock.queue_bytes(&encode(&[PACKET_HARDWARE, RSP_INPUT_LEVEL, level]));
        }

        assert!(wait_for(&observer, |e| matches!(
            e,
            TncEvent::Telemetry(Telemetry::InputLevel(0x2C))
        )));
        let levels = observer.count(|e| matches!(e, TncEvent::Telemetry(Telemetry::InputLevel(_))));
        assert_eq!(levels, 5);
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_set_confirmed() {
        let (client, mock, _observer) = connect();
        mock.reply_to(
            &frame(&Command::GetTxDelay),
            &encode(&[PACKET_HARDWARE, RSP_TX_DELAY, 50]),
        );

        client.set_kiss_parameter(KissParameter::TxDelay, 50).unwrap();
        let writes = mock.get_writes();
        assert!(writes.contains(&frame(&Command::SetTxDelay(50))));
    }

    #[test]
    fn test_set_confirmed_mismatch() {
        let (client, mock, _observer) = connect();
        mock.reply_to(
            &frame(&Command::GetPersistence),
            &encode(&[PACKET_HARDWARE, RSP_PERSISTENCE, 63]),
        );

        let err = client
            .set_kiss_parameter(KissParameter::Persistence, 200)
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Mismatch {
                actual: Telemetry::Persistence(63),
                ..
            }
        ));
    }

    #[test]
    fn test_request_retries_then_gives_up() {
        let (client, mock, _observer) = connect();
        mock.clear_writes();

        let err = client
            .request(
                &Command::GetFirmwareVersion,
                |t| matches!(t, Telemetry::FirmwareVersion(_)),
                RetryPolicy::new(3, 20, 0),
            )
            .unwrap_err();
        assert!(matches!(err, ClientError::NoReply { .. }));

        let queries = mock
            .get_writes()
            .iter()
            .filter(|w| **w == frame(&Command::GetFirmwareVersion))
            .count();
        assert_eq!(queries, 3);
    }

    #[test]
    fn test_transport_disconnect_reported_once() {
        let (mut client, mock, observer) = connect();
        mock.disconnect();

        assert!(wait_for(&observer, |e| *e == TncEvent::Disconnected));
        client.disconnect();
        drop(client);
        assert_eq!(observer.count(|e| *e == TncEvent::Disconnected), 1);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut client, mock, observer) = connect();
        mock.clear_writes();

        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
        assert!(!client.is_receiving());
        assert_eq!(mock.get_writes(), vec![frame(&Command::PollVolume)]);
        assert!(matches!(
            client.send(&Command::GetAllValues),
            Err(ClientError::NotConnected)
        ));

        drop(client);
        assert_eq!(observer.count(|e| *e == TncEvent::Disconnected), 1);
    }

    #[test]
    fn test_suspend_and_resume() {
        let (mut client, mock, observer) = connect();
        client.suspend();
        assert!(!client.is_receiving());
        assert!(client.is_connected());

        mock.queue_bytes(&encode(&[PACKET_HARDWARE, RSP_SLOT_TIME, 10]));
        thread::sleep(Duration::from_millis(30));
        assert!(observer.telemetry().is_empty());

        client.resume().unwrap();
        assert!(wait_for(&observer, |e| *e
            == TncEvent::Telemetry(Telemetry::SlotTime(10))));
    }

    #[test]
    fn test_upload_firmware_reports_failure() {
        let (mut client, _mock, _observer) = connect();
        let upload_observer = Arc::new(RecordingObserver::new());
        let firmware = FirmwareImage::from_hex_str(":0400000001020304F2\n:00000001FF\n").unwrap();
        let config = UploadConfig {
            signature_retry: RetryPolicy::new(2, 10, 0),
            reboot_delay_ms: 0,
            ..UploadConfig::default()
        };

        let handle = client
            .upload_firmware(firmware, config, upload_observer.clone())
            .unwrap();
        assert!(!client.is_receiving());

        let result = handle.join().unwrap();
        assert!(matches!(
            result,
            Err(LoaderError::Bootloader(crate::bootloader::BootloaderError::UnknownBootloader(_)))
        ));
        assert_eq!(
            upload_observer.count(|e| matches!(e, TncEvent::UploadFailed { .. })),
            1
        );
    }
}
