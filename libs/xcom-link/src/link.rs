//! Public link handle
//!
//! [`XcomLink`] is a cheap clone handle over one engine. Every request
//! operation resolves addresses and encodes values before anything reaches
//! the engine, so caller-input errors never cost a transmission.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use xcom_protocol::constants::MULTI_INFO_OBJECT_ID;
use xcom_protocol::{
    values, AddressBook, AggregationType, Datapoint, DatapointCatalog, DeviceInstance,
    DeviceMessage, Frame, MultiInfoItem, MultiInfoRequest, MultiInfoResponse, ObjectType,
    PropertyId, Result, ServiceId, XcomError, XcomMessageSet, XcomValue,
};

use crate::config::LinkConfig;
use crate::connection;
use crate::diagnostics::LinkDiagnostics;
use crate::engine::{self, Command, EngineHandle};
use crate::menu::MenuWalk;
use crate::transaction::TransactionId;

const UNSOLICITED_CAPACITY: usize = 256;

/// Per-call overrides of the configured timeout and retry budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl RequestOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// One value of a multi-info response
#[derive(Debug, Clone, PartialEq)]
pub struct InfoReading {
    pub nr: u16,
    pub aggregation: AggregationType,
    pub value: XcomValue,
}

/// Decoded multi-info response
#[derive(Debug, Clone, PartialEq)]
pub struct InfoReadings {
    /// Installation flags (see `xcom_protocol::multi_info::flags`)
    pub flags: u32,
    /// Installation clock, seconds since 1970 local time
    pub datetime: u32,
    pub values: Vec<InfoReading>,
}

struct Inner {
    config: LinkConfig,
    book: Arc<AddressBook>,
    catalog: Arc<dyn DatapointCatalog>,
    next_id: AtomicU64,
    engine: Mutex<Option<EngineHandle>>,
    /// Held across connection setup so concurrent starts open one socket
    starting: tokio::sync::Mutex<()>,
    messages: RwLock<Option<Arc<XcomMessageSet>>>,
    unsolicited: broadcast::Sender<Frame>,
}

/// Handle to one Xcom gateway link
#[derive(Clone)]
pub struct XcomLink {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for XcomLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XcomLink")
            .field("endpoint", &self.inner.config.endpoint())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Sends `Cancel` if the awaiting caller goes away before its reply
struct CancelOnDrop {
    id: TransactionId,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.commands = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            debug!("Caller dropped #{}", self.id);
            let _ = commands.send(Command::Cancel(self.id));
        }
    }
}

impl XcomLink {
    /// Build a link using the address book described by `config`
    pub fn new(config: LinkConfig, catalog: Arc<dyn DatapointCatalog>) -> Result<Self> {
        config.validate()?;
        let book = config.address_book()?;
        Ok(Self::with_address_book(config, Arc::new(book), catalog))
    }

    /// Build a link with an externally prepared address book
    pub fn with_address_book(
        config: LinkConfig,
        book: Arc<AddressBook>,
        catalog: Arc<dyn DatapointCatalog>,
    ) -> Self {
        let (unsolicited, _) = broadcast::channel(UNSOLICITED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                book,
                catalog,
                next_id: AtomicU64::new(1),
                engine: Mutex::new(None),
                starting: tokio::sync::Mutex::new(()),
                messages: RwLock::new(None),
                unsolicited,
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.inner.book
    }

    pub fn catalog(&self) -> &Arc<dyn DatapointCatalog> {
        &self.inner.catalog
    }

    /// Message texts used for device message logging and [`Self::message_text`]
    ///
    /// Takes effect for engines started afterwards.
    pub fn set_messages(&self, messages: Arc<XcomMessageSet>) {
        *self.inner.messages.write() = Some(messages);
    }

    /// Text of a device message, or a placeholder when no text is known
    pub fn message_text(&self, message: &DeviceMessage) -> String {
        match self.inner.messages.read().as_deref() {
            Some(set) => message.text(set),
            None => message.text(&XcomMessageSet::default()),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the connection and start the engine
    ///
    /// A no-op while the link is connected.
    pub async fn start(&self) -> Result<()> {
        let _starting = self.inner.starting.lock().await;
        if self.is_connected() {
            debug!("Link already started");
            return Ok(());
        }
        let stream = connection::open(&self.inner.config).await?;
        self.attach(stream);
        Ok(())
    }

    /// Start the engine on an already open stream
    pub fn start_with_stream(&self, stream: TcpStream) {
        self.attach(stream);
    }

    fn attach(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let handle = engine::spawn(
            stream,
            self.inner.config.duplicate_policy,
            self.inner.config.read_buffer_size,
            self.inner.unsolicited.clone(),
            self.inner.messages.read().clone(),
        );

        let previous = self.inner.engine.lock().replace(handle);
        if let Some(old) = previous {
            // the old engine already lost its connection; let it wind down
            let (ack, _) = oneshot::channel();
            let _ = old.commands.send(Command::Shutdown(ack));
        }
        info!("Link started: {}", peer);
    }

    /// Close the connection; pending requests fail with ConnectionClosed
    pub async fn stop(&self) -> Result<()> {
        let Some(handle) = self.inner.engine.lock().take() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = handle.task.await {
            warn!("Engine task ended abnormally: {}", e);
        }
        info!("Link stopped");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .engine
            .lock()
            .as_ref()
            .is_some_and(|h| h.connected.load(Ordering::SeqCst))
    }

    /// Frames no pending request claimed (broadcasts, device messages, late answers)
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.inner.unsolicited.subscribe()
    }

    /// Snapshot of the engine's counters
    pub async fn diagnostics(&self) -> Result<LinkDiagnostics> {
        let commands = self.commands()?;
        let (tx, rx) = oneshot::channel();
        commands
            .send(Command::Diagnostics(tx))
            .map_err(|_| XcomError::ConnectionClosed)?;
        rx.await.map_err(|_| XcomError::ConnectionClosed)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Read the live value of `dp` from `instance`
    pub async fn request_value(
        &self,
        dp: &Datapoint,
        instance: &DeviceInstance,
        opts: RequestOptions,
    ) -> Result<XcomValue> {
        if dp.format.is_valueless() {
            return Err(XcomError::type_mismatch(format!(
                "datapoint {} of format {} carries no value",
                dp.nr, dp.format
            )));
        }
        let dst = self.target(dp, instance)?;
        let request = Frame::read_request(
            self.inner.config.source_address,
            dst,
            dp.object_type(),
            dp.nr,
            dp.value_property(),
        );

        let response = self.transact(request, opts).await?;
        values::decode(dp, &response.payload)
    }

    /// Write `value` to the RAM copy of parameter `dp` on `instance`
    ///
    /// Success means the device acknowledged the write. The value is volatile
    /// and does not survive a device restart.
    pub async fn update_value(
        &self,
        dp: &Datapoint,
        value: &XcomValue,
        instance: &DeviceInstance,
        opts: RequestOptions,
    ) -> Result<()> {
        if dp.is_info() {
            return Err(XcomError::ReadOnly(dp.nr));
        }
        let dst = self.target(dp, instance)?;
        let payload = values::encode(dp, value)?;
        let request = Frame::write_request(self.inner.config.source_address, dst, dp.nr, payload);

        let response = self.transact(request, opts).await?;
        debug!("Write {} -> {} acknowledged ({:?})", dp.nr, instance, response.service);
        Ok(())
    }

    /// Read datapoint `nr` from the device named by `code` (`XT1`, `BSP`)
    pub async fn request_value_nr(
        &self,
        nr: u16,
        code: &str,
        opts: RequestOptions,
    ) -> Result<XcomValue> {
        let (dp, instance) = self.lookup(nr, code)?;
        self.request_value(&dp, &instance, opts).await
    }

    /// Write datapoint `nr` on the device named by `code`
    pub async fn update_value_nr(
        &self,
        nr: u16,
        value: &XcomValue,
        code: &str,
        opts: RequestOptions,
    ) -> Result<()> {
        let (dp, instance) = self.lookup(nr, code)?;
        self.update_value(&dp, value, &instance, opts).await
    }

    /// Read up to 76 infos in one multi-info exchange
    pub async fn request_infos(
        &self,
        items: &[(Arc<Datapoint>, AggregationType)],
        opts: RequestOptions,
    ) -> Result<InfoReadings> {
        if let Some((dp, _)) = items.iter().find(|(dp, _)| !dp.is_info()) {
            return Err(XcomError::invalid_request(format!(
                "multi-info only carries infos, {} is {}",
                dp.nr, dp.level
            )));
        }
        let request = MultiInfoRequest::new(
            items
                .iter()
                .map(|(dp, aggregation)| MultiInfoItem {
                    nr: dp.nr,
                    aggregation: *aggregation,
                })
                .collect(),
        )?;

        let frame = Frame::request(
            ServiceId::Read,
            self.inner.config.source_address,
            self.inner.config.multi_info_address,
            ObjectType::MultiInfo,
            MULTI_INFO_OBJECT_ID,
            PropertyId::MultiInfo,
            request.pack(),
        );
        let response = self.transact(frame, opts).await?;
        let response = MultiInfoResponse::unpack(&response.payload)?;

        let mut readings = Vec::with_capacity(response.items.len());
        for item in &response.items {
            let Some((dp, _)) = items.iter().find(|(dp, _)| dp.nr == item.nr) else {
                warn!("Multi-info answered unrequested info {}", item.nr);
                continue;
            };
            readings.push(InfoReading {
                nr: item.nr,
                aggregation: item.aggregation,
                value: values::cast_float(dp, item.value)?,
            });
        }

        Ok(InfoReadings {
            flags: response.flags,
            datetime: response.datetime,
            values: readings,
        })
    }

    /// Multi-info read addressed by info number and device code
    ///
    /// `XT3` reads device 3 of the Xtenders, the bare family code `XT` the
    /// master's value.
    pub async fn request_infos_by_code(
        &self,
        items: &[(u16, &str)],
        opts: RequestOptions,
    ) -> Result<InfoReadings> {
        let resolved = items
            .iter()
            .map(|(nr, code)| -> Result<(Arc<Datapoint>, AggregationType)> {
                let (fam, aggregation) = self.inner.book.aggregation_target(code)?;
                let dp = self.inner.catalog.datapoint(*nr, Some(fam.nr_family()))?;
                Ok((dp, aggregation))
            })
            .collect::<Result<Vec<_>>>()?;
        self.request_infos(&resolved, opts).await
    }

    /// Check that `instance` knows datapoint `dp`
    ///
    /// Fails with the device's error when it does not.
    pub async fn probe(
        &self,
        dp: &Datapoint,
        instance: &DeviceInstance,
        opts: RequestOptions,
    ) -> Result<()> {
        let dst = self.target(dp, instance)?;
        let request = Frame::read_request(
            self.inner.config.source_address,
            dst,
            dp.object_type(),
            dp.nr,
            dp.presence_property(),
        );
        self.transact(request, opts).await.map(|_| ())
    }

    /// Lazy walk of the menu tree below `root` as the device reports it
    ///
    /// Live reads go to the first instance of `family`.
    pub fn get_menu(&self, root: u16, family: &str) -> Result<MenuWalk> {
        let fam = self.inner.book.family(family)?;
        let instance = DeviceInstance::new(fam.id.clone(), 1);
        Ok(MenuWalk::new(
            self.clone(),
            root,
            fam.nr_family().to_string(),
            instance,
        ))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn commands(&self) -> Result<mpsc::UnboundedSender<Command>> {
        self.inner
            .engine
            .lock()
            .as_ref()
            .map(|h| h.commands.clone())
            .ok_or(XcomError::ConnectionClosed)
    }

    /// Wire address for `dp` on `instance`, checking family compatibility
    fn target(&self, dp: &Datapoint, instance: &DeviceInstance) -> Result<u16> {
        let fam = self.inner.book.family(&instance.family)?;
        if !fam.accepts_datapoint_family(&dp.family) {
            return Err(XcomError::FamilyMismatch {
                nr: dp.nr,
                datapoint_family: dp.family.clone(),
                target_family: fam.id.clone(),
            });
        }
        self.inner.book.resolve(instance)
    }

    fn lookup(&self, nr: u16, code: &str) -> Result<(Arc<Datapoint>, DeviceInstance)> {
        let instance = self.inner.book.parse_code(code)?;
        let fam = self.inner.book.family(&instance.family)?;
        let dp = self.inner.catalog.datapoint(nr, Some(fam.nr_family()))?;
        Ok((dp, instance))
    }

    /// Submit one request and wait for its outcome
    async fn transact(&self, request: Frame, opts: RequestOptions) -> Result<Frame> {
        let commands = self.commands()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        commands
            .send(Command::Submit {
                id,
                request,
                timeout: opts.timeout.unwrap_or_else(|| self.inner.config.request_timeout()),
                retries: opts.retries.unwrap_or(self.inner.config.request_retries),
                reply: reply_tx,
            })
            .map_err(|_| XcomError::ConnectionClosed)?;

        let mut guard = CancelOnDrop {
            id,
            commands: Some(commands),
        };
        let outcome = match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(XcomError::ConnectionClosed),
        };
        guard.disarm();
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use xcom_protocol::{XcomDataset, XcomFormat, XcomLevel};

    fn link() -> XcomLink {
        let catalog = XcomDataset::new(vec![
            Datapoint::new("xt", 3023, XcomLevel::Info, XcomFormat::Float),
            Datapoint::new("xt", 1107, XcomLevel::Basic, XcomFormat::Float),
            Datapoint::new("bsp", 7000, XcomLevel::Info, XcomFormat::Float),
            Datapoint::new("xt", 1100, XcomLevel::Basic, XcomFormat::Menu),
        ]);
        XcomLink::new(LinkConfig::default(), Arc::new(catalog)).unwrap()
    }

    #[tokio::test]
    async fn test_not_started_is_connection_closed() {
        let link = link();
        assert!(!link.is_connected());
        let err = link
            .request_value_nr(3023, "XT1", RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, XcomError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_caller_errors_before_sending() {
        let link = link();
        let opts = RequestOptions::default();

        let err = link.request_value_nr(3023, "XT10", opts).await.unwrap_err();
        assert!(matches!(err, XcomError::AddressOutOfRange { .. }));

        let err = link.request_value_nr(4242, "XT1", opts).await.unwrap_err();
        assert!(matches!(err, XcomError::UnknownDatapoint { .. }));

        let bsp = link.catalog().datapoint(7000, Some("bsp")).unwrap();
        let err = link
            .request_value(&bsp, &DeviceInstance::new("xt", 1), opts)
            .await
            .unwrap_err();
        assert!(matches!(err, XcomError::FamilyMismatch { .. }));

        let info = link.catalog().datapoint(3023, Some("xt")).unwrap();
        let err = link
            .update_value(&info, &XcomValue::Float(1.0), &DeviceInstance::new("xt", 1), opts)
            .await
            .unwrap_err();
        assert_eq!(err, XcomError::ReadOnly(3023));

        let menu = link.catalog().datapoint(1100, Some("xt")).unwrap();
        let err = link
            .request_value(&menu, &DeviceInstance::new("xt", 1), opts)
            .await
            .unwrap_err();
        assert!(matches!(err, XcomError::TypeMismatch(_)));
    }

    #[tokio::test]
    async fn test_phase_family_accepts_xt_datapoints() {
        let link = link();
        let dp = link.catalog().datapoint(1107, Some("xt")).unwrap();
        assert_eq!(link.target(&dp, &DeviceInstance::new("l2", 1)).unwrap(), 192);
    }

    #[tokio::test]
    async fn test_multi_info_rejects_parameters() {
        let link = link();
        let param = link.catalog().datapoint(1107, Some("xt")).unwrap();
        let err = link
            .request_infos(&[(param, AggregationType::Master)], RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, XcomError::InvalidRequest(_)));

        let err = link
            .request_infos(&[], RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, XcomError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_multi_info_by_code_resolves_before_sending() {
        let link = link();
        let opts = RequestOptions::default();

        let err = link.request_infos_by_code(&[(3023, "XT10")], opts).await.unwrap_err();
        assert!(matches!(err, XcomError::AddressOutOfRange { .. }));

        let err = link.request_infos_by_code(&[(4242, "XT")], opts).await.unwrap_err();
        assert!(matches!(err, XcomError::UnknownDatapoint { .. }));

        // resolved, then refused by the stopped link
        let err = link
            .request_infos_by_code(&[(3023, "XT"), (7000, "BSP")], opts)
            .await
            .unwrap_err();
        assert_eq!(err, XcomError::ConnectionClosed);
    }

    #[test]
    fn test_message_text_falls_back_to_number() {
        let link = link();
        let msg = DeviceMessage {
            pending: 0,
            message_id: 24,
            src: 101,
            timestamp: 0,
            value: [0; 4],
        };
        assert_eq!(link.message_text(&msg), "(24): unknown message");

        link.set_messages(Arc::new(XcomMessageSet::new(vec![xcom_protocol::MessageDef {
            level: XcomLevel::ViewOnly,
            nr: 24,
            text: "Input transfer relay opened".into(),
        }])));
        assert_eq!(link.message_text(&msg), "Input transfer relay opened");
    }

    #[test]
    fn test_get_menu_unknown_family() {
        let link = link();
        assert!(matches!(
            link.get_menu(0, "nope").unwrap_err(),
            XcomError::UnknownFamily(_)
        ));
    }
}
