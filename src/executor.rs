use std::sync::Arc;

use log::debug;

use crate::bridge::Outcome;
use crate::call::PendingOperation;
use crate::config::ClientConfig;
use crate::converter::{RawResult, RequestBody};
use crate::device::GattDevice;
use crate::errors::{Error, ErrorKind};
use crate::events::{ConnectionState, EventMultiplexer};
use crate::model::{OperationKind, OperationRequest};

/// Runs one request against the device session
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub(crate) trait Execute {
    async fn execute(&self, request: &OperationRequest, operation: &PendingOperation) -> Result<RawResult, Error>;
}

/// Drives discovery when needed, triggers the hardware operation and waits for its completion event
pub(crate) struct OperationExecutor<D> {
    device: Arc<D>,
    events: Arc<EventMultiplexer<D>>,
    config: ClientConfig,
}

impl<D> OperationExecutor<D> where D: GattDevice + Send + Sync + 'static {
    pub(crate) fn new(device: Arc<D>, events: Arc<EventMultiplexer<D>>, config: ClientConfig) -> Self {
        Self {device, events, config}
    }

    async fn ensure_ready(&self, operation: &PendingOperation) -> Result<(), Error> {
        // Registering first makes sure a discovery finishing right after the state check is seen
        let registration = self.events.register_discovery();
        match self.events.state() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Disconnected =>
                return Err(Error::new(ErrorKind::NotConnected, "connect() has to be called before executing calls")),
            ConnectionState::ConnectedUndiscovered => self.events.request_discovery().await?,
            ConnectionState::Connecting => {}
        }
        let bridge = registration.bridge().clone();
        operation.attach(bridge.clone());
        let outcome = bridge.wait(self.config.discovery_timeout).await;
        operation.detach();
        match outcome {
            Outcome::Complete(result) => result,
            Outcome::TimedOut => Err(Error::new(ErrorKind::Timeout, &format!(
                "services were not discovered within {:?}", self.config.discovery_timeout))),
            Outcome::Canceled => Err(Error::canceled()),
        }
    }

    fn locate(&self, request: &OperationRequest) -> Result<(), Error> {
        let service = request.service();
        let characteristic = request.characteristic();
        if !self.device.has_service(service) {
            return Err(Error::new(ErrorKind::ServiceNotFound, &format!("service({service}) not found")));
        }
        if !self.device.has_characteristic(service, characteristic) {
            return Err(Error::new(ErrorKind::CharacteristicNotFound,
                &format!("characteristic({characteristic}) not found on service({service})")));
        }
        Ok(())
    }

    async fn trigger(&self, request: &OperationRequest) -> Result<(), Error> {
        let service = request.service();
        let characteristic = request.characteristic();
        // Notifications are enabled for every kind, reads and writes included
        let enabled = self.device.set_notification(service, characteristic, true).await;
        let result = match request.kind() {
            kind if kind.requires_notification() => enabled,
            OperationKind::Write => match enabled {
                Ok(()) => {
                    let value = request.body().map(RequestBody::bytes).unwrap_or_default();
                    self.device.write_characteristic(service, characteristic, value).await
                }
                Err(error) => Err(error),
            },
            _ => match enabled {
                Ok(()) => self.device.read_characteristic(service, characteristic).await,
                Err(error) => Err(error),
            },
        };
        result.map_err(|error| Error::new(ErrorKind::TriggerRejected,
            &format!("{} on characteristic({characteristic}) failed: {error}", request.kind())))
    }
}

#[async_trait::async_trait]
impl<D> Execute for OperationExecutor<D> where D: GattDevice + Send + Sync + 'static {
    async fn execute(&self, request: &OperationRequest, operation: &PendingOperation) -> Result<RawResult, Error> {
        if operation.is_canceled() {
            return Err(Error::canceled());
        }
        self.ensure_ready(operation).await?;
        self.locate(request)?;

        let registration = self.events.register(request.characteristic(), request.kind());
        let bridge = registration.bridge().clone();
        operation.attach(bridge.clone());
        if operation.is_canceled() {
            operation.detach();
            return Err(Error::canceled());
        }
        debug!("Triggering {request}");
        if let Err(error) = self.trigger(request).await {
            operation.detach();
            return Err(error);
        }
        let timeout = request.timeout().unwrap_or(self.config.operation_timeout);
        let outcome = bridge.wait(timeout).await;
        operation.detach();
        drop(registration);

        match outcome {
            Outcome::Complete(Ok(Some(bytes))) => {
                debug!("{request} completed with {} bytes", bytes.len());
                Ok(RawResult::new(bytes))
            }
            Outcome::Complete(Ok(None)) => Err(Error::new(ErrorKind::InconsistentState, &format!(
                "characteristic({}) is null. Try resetting your bluetooth adapter", request.characteristic()))),
            Outcome::Complete(Err(error)) => Err(error),
            Outcome::TimedOut => Err(Error::new(ErrorKind::Timeout, &format!("{request} got no response within {timeout:?}"))),
            Outcome::Canceled => Err(Error::canceled()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::{GattEvent, GattStatus, MockGattDevice};
    use crate::events::EventSink;
    use crate::model::{parse_uuid, RequestFactory};
    use mockall::predicate::{always, eq};
    use mockall::Sequence;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn start(device: MockGattDevice, receiver: UnboundedReceiver<GattEvent>, state: ConnectionState)
            -> OperationExecutor<MockGattDevice> {
        let device = Arc::new(device);
        let events = Arc::new(EventMultiplexer::new(device.clone()));
        events.set_state(state);
        tokio::spawn(events.clone().run(receiver));
        OperationExecutor::new(device, events, ClientConfig {operation_timeout: TIMEOUT, discovery_timeout: TIMEOUT})
    }

    fn discovered(device: &mut MockGattDevice) {
        device.expect_has_service().return_const(true);
        device.expect_has_characteristic().return_const(true);
    }

    fn request(kind: OperationKind, body: Option<RequestBody>) -> OperationRequest {
        RequestFactory::new(
            parse_uuid("180d").expect("Unable to parse service"),
            parse_uuid("2a38").expect("Unable to parse characteristic"),
            kind,
        ).create(body, None).expect("Unable to create request")
    }

    fn enabling(device: &mut MockGattDevice) {
        device.expect_set_notification()
            .with(always(), eq(parse_uuid("2a38").expect("Unable to parse characteristic")), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));
    }

    fn reading(device: &mut MockGattDevice, sink: &EventSink, status: GattStatus, value: Option<Vec<u8>>) {
        enabling(device);
        let sink = sink.clone();
        device.expect_read_characteristic()
            .times(1)
            .returning(move |_, characteristic| {
                sink.send(GattEvent::CharacteristicRead {status, characteristic, value: value.clone()});
                Ok(())
            });
    }

    #[tokio::test]
    async fn read_returns_payload() {
        let (sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        reading(&mut device, &sink, GattStatus::SUCCESS, Some(vec![0x01]));
        let executor = start(device, receiver, ConnectionState::Ready);
        let raw = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect("Unable to execute read");
        assert_eq!(raw.bytes(), &[0x01]);
    }

    #[tokio::test]
    async fn empty_payload_is_a_result() {
        let (sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        reading(&mut device, &sink, GattStatus::SUCCESS, Some(vec![]));
        let executor = start(device, receiver, ConnectionState::Ready);
        let raw = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect("Unable to execute read");
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn missing_value_is_inconsistent_state() {
        let (sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        reading(&mut device, &sink, GattStatus::SUCCESS, None);
        let executor = start(device, receiver, ConnectionState::Ready);
        let error = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect_err("Read without value should fail");
        assert_eq!(error.kind(), ErrorKind::InconsistentState);
        assert!(error.message().contains("Try resetting your bluetooth adapter"));
    }

    #[tokio::test]
    async fn failure_status_is_protocol_error() {
        let (sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        reading(&mut device, &sink, GattStatus::READ_NOT_PERMITTED, None);
        let executor = start(device, receiver, ConnectionState::Ready);
        let error = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect_err("Rejected read should fail");
        assert_eq!(error.kind(), ErrorKind::Protocol(GattStatus::READ_NOT_PERMITTED));
    }

    #[tokio::test]
    async fn missing_service_and_characteristic() {
        let (_sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        device.expect_has_service().return_const(false);
        device.expect_read_characteristic().times(0);
        let executor = start(device, receiver, ConnectionState::Ready);
        let error = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect_err("Missing service should fail");
        assert_eq!(error.kind(), ErrorKind::ServiceNotFound);

        let (_sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        device.expect_has_service().return_const(true);
        device.expect_has_characteristic().return_const(false);
        device.expect_read_characteristic().times(0);
        let executor = start(device, receiver, ConnectionState::Ready);
        let error = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect_err("Missing characteristic should fail");
        assert_eq!(error.kind(), ErrorKind::CharacteristicNotFound);
        assert!(error.message().contains("not found on service(0000180d-0000-1000-8000-00805f9b34fb)"));
    }

    #[tokio::test]
    async fn rejected_trigger_fails_immediately() {
        let (_sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        enabling(&mut device);
        device.expect_read_characteristic()
            .times(1)
            .returning(|_, _| Err(Error::new(ErrorKind::Device, "busy")));
        let executor = start(device, receiver, ConnectionState::Ready);
        let started = std::time::Instant::now();
        let error = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect_err("Rejected trigger should fail");
        assert_eq!(error.kind(), ErrorKind::TriggerRejected);
        assert!(started.elapsed() < TIMEOUT);
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (_sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        enabling(&mut device);
        device.expect_read_characteristic().times(1).returning(|_, _| Ok(()));
        let executor = start(device, receiver, ConnectionState::Ready);
        let started = std::time::Instant::now();
        let error = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect_err("Silent device should time out");
        assert!(error.is_timeout());
        assert!(started.elapsed() >= TIMEOUT);
    }

    #[tokio::test]
    async fn write_sends_body() {
        let (sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        enabling(&mut device);
        let written = Arc::new(Mutex::new(vec![]));
        let recorder = written.clone();
        device.expect_write_characteristic()
            .times(1)
            .returning(move |_, characteristic, value| {
                *recorder.lock().expect("Unable to lock recorder") = value.to_vec();
                sink.send(GattEvent::CharacteristicWrite {
                    status: GattStatus::SUCCESS,
                    characteristic,
                    value: Some(value.to_vec()),
                });
                Ok(())
            });
        let executor = start(device, receiver, ConnectionState::Ready);
        let body = RequestBody::new("application/octet-stream", vec![1, 2]);
        let raw = executor.execute(&request(OperationKind::Write, Some(body)), &PendingOperation::default()).await
            .expect("Unable to execute write");
        assert_eq!(raw.bytes(), &[1, 2]);
        assert_eq!(*written.lock().expect("Unable to lock recorder"), vec![1, 2]);
    }

    #[tokio::test]
    async fn read_enables_notifications_before_triggering() {
        let (sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        let mut sequence = Sequence::new();
        device.expect_set_notification()
            .with(always(), always(), eq(true))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(()));
        device.expect_read_characteristic()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(move |_, characteristic| {
                sink.send(GattEvent::CharacteristicRead {status: GattStatus::SUCCESS, characteristic, value: Some(vec![0x02])});
                Ok(())
            });
        let executor = start(device, receiver, ConnectionState::Ready);
        let raw = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect("Unable to execute read");
        assert_eq!(raw.bytes(), &[0x02]);
    }

    #[tokio::test]
    async fn write_is_not_sent_when_notifications_cannot_be_enabled() {
        let (_sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        device.expect_set_notification()
            .times(1)
            .returning(|_, _, _| Err(Error::new(ErrorKind::Device, "busy")));
        device.expect_write_characteristic().times(0);
        let executor = start(device, receiver, ConnectionState::Ready);
        let body = RequestBody::new("application/octet-stream", vec![1]);
        let error = executor.execute(&request(OperationKind::Write, Some(body)), &PendingOperation::default()).await
            .expect_err("Write should fail when notifications cannot be enabled");
        assert_eq!(error.kind(), ErrorKind::TriggerRejected);
        assert!(error.message().contains("busy"));
    }

    #[tokio::test]
    async fn notify_enables_notifications_and_waits_for_change() {
        let (sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        device.expect_read_characteristic().times(0);
        device.expect_set_notification()
            .times(1)
            .returning(move |_, characteristic, enable| {
                assert!(enable);
                sink.send(GattEvent::CharacteristicChanged {characteristic, value: vec![0x06, 0x48]});
                Ok(())
            });
        let executor = start(device, receiver, ConnectionState::Ready);
        let raw = executor.execute(&request(OperationKind::Notify, None), &PendingOperation::default()).await
            .expect("Unable to execute notify");
        assert_eq!(raw.bytes(), &[0x06, 0x48]);
    }

    #[tokio::test]
    async fn not_connected() {
        let (_sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        device.expect_read_characteristic().times(0);
        let executor = start(device, receiver, ConnectionState::Disconnected);
        let error = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect_err("Disconnected session should fail");
        assert_eq!(error.kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn undiscovered_session_discovers_first() {
        let (sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        discovered(&mut device);
        let discovery_sink = sink.clone();
        device.expect_discover_services()
            .times(1)
            .returning(move || {
                discovery_sink.send(GattEvent::ServicesDiscovered {status: GattStatus::SUCCESS});
                Ok(())
            });
        reading(&mut device, &sink, GattStatus::SUCCESS, Some(vec![7]));
        let executor = start(device, receiver, ConnectionState::ConnectedUndiscovered);
        let raw = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect("Unable to execute read");
        assert_eq!(raw.bytes(), &[7]);
        assert_eq!(executor.events.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn discovery_that_cannot_start_fails() {
        let (_sink, receiver) = EventSink::channel();
        let mut device = MockGattDevice::new();
        device.expect_discover_services()
            .times(1)
            .returning(|| Err(Error::new(ErrorKind::Device, "busy")));
        device.expect_read_characteristic().times(0);
        let executor = start(device, receiver, ConnectionState::ConnectedUndiscovered);
        let error = executor.execute(&request(OperationKind::Read, None), &PendingOperation::default()).await
            .expect_err("Discovery failure should fail the call");
        assert_eq!(error.kind(), ErrorKind::TriggerRejected);
        assert!(error.message().contains("discover services failed"));
    }
}
