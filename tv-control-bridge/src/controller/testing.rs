//! In-memory stand-ins for the bridge and the rendering-control client.

use crate::bridge::{AppLauncher, AppList, AppListCallback, Bridge, BridgeError, ReauthCallback};
use crate::upnp::{
    EventHandler, NotifyServer, NotifySink, RenderingControl, UpnpDevice, UpnpError, UpnpFactory,
};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct FakeBridge {
    on: AtomicBool,
    fail_is_on: AtomicBool,
    launches_apps: bool,
    is_on_calls: AtomicUsize,
    power_off_calls: AtomicUsize,
    app_list_requests: AtomicUsize,
    sent: Mutex<Vec<Vec<String>>>,
    launched: Mutex<Vec<String>>,
    on_app_list_request: Mutex<Option<Hook>>,
    on_power_off: Mutex<Option<Hook>>,
    reauth: Mutex<Option<ReauthCallback>>,
    app_list: Mutex<Option<AppListCallback>>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_launcher() -> Self {
        Self {
            launches_apps: true,
            ..Self::default()
        }
    }

    pub fn set_on(&self, on: bool) {
        self.on.store(on, Ordering::SeqCst);
    }

    pub fn fail_is_on(&self) {
        self.fail_is_on.store(true, Ordering::SeqCst);
    }

    pub fn is_on_calls(&self) -> usize {
        self.is_on_calls.load(Ordering::SeqCst)
    }

    pub fn power_off_calls(&self) -> usize {
        self.power_off_calls.load(Ordering::SeqCst)
    }

    pub fn app_list_requests(&self) -> usize {
        self.app_list_requests.load(Ordering::SeqCst)
    }

    pub fn sent_keys(&self) -> Vec<Vec<String>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    /// Runs `answer` synchronously inside every app-list request.
    pub fn answer_app_list_with(&self, answer: impl Fn() + Send + Sync + 'static) {
        *self.on_app_list_request.lock().unwrap() = Some(Box::new(answer));
    }

    /// Runs `hook` while a power-off request is in flight.
    pub fn during_power_off(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_power_off.lock().unwrap() = Some(Box::new(hook));
    }

    /// Delivers a list through whatever callback the controller registered.
    pub fn push_app_list(&self, apps: AppList) {
        let callback = self.app_list.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(apps);
        }
    }

    pub fn trigger_reauth(&self) {
        let callback = self.reauth.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    async fn is_on(&self) -> Result<bool, BridgeError> {
        self.is_on_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_is_on.load(Ordering::SeqCst) {
            return Err(BridgeError::Timeout("fake".to_string()));
        }
        Ok(self.on.load(Ordering::SeqCst))
    }

    async fn power_off(&self) -> Result<(), BridgeError> {
        self.power_off_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_power_off.lock().unwrap().as_ref() {
            hook();
        }
        Ok(())
    }

    async fn send_keys(&self, keys: &[String]) -> Result<(), BridgeError> {
        self.sent.lock().unwrap().push(keys.to_vec());
        Ok(())
    }

    async fn request_app_list(&self) -> Result<(), BridgeError> {
        self.app_list_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(answer) = self.on_app_list_request.lock().unwrap().as_ref() {
            answer();
        }
        Ok(())
    }

    fn app_launcher(&self) -> Option<&dyn AppLauncher> {
        self.launches_apps.then_some(self as &dyn AppLauncher)
    }

    fn register_reauth_callback(&self, callback: ReauthCallback) {
        *self.reauth.lock().unwrap() = Some(callback);
    }

    fn register_app_list_callback(&self, callback: AppListCallback) {
        *self.app_list.lock().unwrap() = Some(callback);
    }
}

#[async_trait]
impl AppLauncher for FakeBridge {
    async fn launch_app(&self, app_id: &str) -> Result<(), BridgeError> {
        self.launched.lock().unwrap().push(app_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CreateOutcome {
    Ok,
    Unreachable,
    Invalid,
}

#[derive(Debug, Clone, Copy)]
pub enum SubscribeOutcome {
    Ok,
    Rejected,
    Fail,
}

type OrderLog = Arc<Mutex<Vec<&'static str>>>;

pub struct FakeUpnpFactory {
    create: Mutex<CreateOutcome>,
    subscribe: Mutex<SubscribeOutcome>,
    create_delay: Mutex<Duration>,
    creates: AtomicUsize,
    last_source: Mutex<Option<IpAddr>>,
    servers: Mutex<Vec<Arc<ServerProbe>>>,
    devices: Mutex<Vec<Arc<FakeRenderingControl>>>,
    order: OrderLog,
}

impl FakeUpnpFactory {
    pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 5);

    pub fn new() -> Self {
        Self {
            create: Mutex::new(CreateOutcome::Ok),
            subscribe: Mutex::new(SubscribeOutcome::Ok),
            create_delay: Mutex::new(Duration::ZERO),
            creates: AtomicUsize::new(0),
            last_source: Mutex::new(None),
            servers: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            order: Arc::default(),
        }
    }

    pub fn set_create(&self, outcome: CreateOutcome) {
        *self.create.lock().unwrap() = outcome;
    }

    pub fn set_subscribe(&self, outcome: SubscribeOutcome) {
        *self.subscribe.lock().unwrap() = outcome;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn device(&self, index: usize) -> Arc<FakeRenderingControl> {
        self.devices.lock().unwrap()[index].clone()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub fn server(&self, index: usize) -> Arc<ServerProbe> {
        self.servers.lock().unwrap()[index].clone()
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().unwrap().len()
    }

    pub fn last_source_ip(&self) -> Option<IpAddr> {
        *self.last_source.lock().unwrap()
    }

    pub fn order(&self) -> Vec<&'static str> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpnpFactory for FakeUpnpFactory {
    async fn create_device(&self, location: &str) -> Result<UpnpDevice, UpnpError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = *self.create.lock().unwrap();
        match outcome {
            CreateOutcome::Ok => Ok(UpnpDevice {
                location: location.to_string(),
                friendly_name: Some("Living Room".to_string()),
                service_type: "urn:schemas-upnp-org:service:RenderingControl:1".to_string(),
                control_url: format!("{location}/control"),
                event_sub_url: format!("{location}/event"),
            }),
            CreateOutcome::Unreachable => Err(UpnpError::Connection {
                url: location.to_string(),
                message: "connection refused".to_string(),
            }),
            CreateOutcome::Invalid => Err(UpnpError::InvalidDescription(
                "no rendering control service".to_string(),
            )),
        }
    }

    async fn local_ip(&self, _location: &str) -> Option<IpAddr> {
        Some(IpAddr::V4(Self::LOCAL_IP))
    }

    fn notify_server(&self, source: SocketAddr) -> Box<dyn NotifyServer> {
        *self.last_source.lock().unwrap() = Some(source.ip());
        let probe = Arc::new(ServerProbe::default());
        self.servers.lock().unwrap().push(probe.clone());
        Box::new(FakeNotifyServer {
            probe,
            sink: Arc::default(),
            order: self.order.clone(),
        })
    }

    fn rendering_control(
        &self,
        _device: UpnpDevice,
        _server: &dyn NotifyServer,
    ) -> Arc<dyn RenderingControl> {
        let device = Arc::new(FakeRenderingControl {
            handler: Mutex::new(None),
            subscribe: *self.subscribe.lock().unwrap(),
            volume: Mutex::new(None),
            muted: Mutex::new(None),
            unsubscribes: AtomicUsize::new(0),
            volume_sets: Mutex::new(Vec::new()),
            reject_volume: AtomicBool::new(false),
            order: self.order.clone(),
        });
        self.devices.lock().unwrap().push(device.clone());
        device
    }
}

#[derive(Default)]
pub struct ServerProbe {
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ServerProbe {
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct FakeNotifyServer {
    probe: Arc<ServerProbe>,
    sink: Arc<NotifySink>,
    order: OrderLog,
}

#[async_trait]
impl NotifyServer for FakeNotifyServer {
    async fn start_server(&mut self) -> Result<(), UpnpError> {
        self.order.lock().unwrap().push("start_server");
        self.probe.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_server(&mut self) {
        self.order.lock().unwrap().push("stop_server");
        self.probe.stopped.store(true, Ordering::SeqCst);
    }

    fn callback_url(&self) -> Option<String> {
        self.probe
            .started()
            .then(|| format!("http://{}:8058/notify", FakeUpnpFactory::LOCAL_IP))
    }

    fn sink(&self) -> Arc<NotifySink> {
        self.sink.clone()
    }
}

pub struct FakeRenderingControl {
    handler: Mutex<Option<EventHandler>>,
    subscribe: SubscribeOutcome,
    volume: Mutex<Option<f32>>,
    muted: Mutex<Option<bool>>,
    unsubscribes: AtomicUsize,
    volume_sets: Mutex<Vec<f32>>,
    reject_volume: AtomicBool,
    order: OrderLog,
}

impl FakeRenderingControl {
    /// Updates the device-side values and fires the event handler, as a
    /// NOTIFY from the TV would.
    pub fn push(&self, volume: Option<f32>, muted: Option<bool>) {
        if volume.is_some() {
            *self.volume.lock().unwrap() = volume;
        }
        if muted.is_some() {
            *self.muted.lock().unwrap() = muted;
        }
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn volume_sets(&self) -> Vec<f32> {
        self.volume_sets.lock().unwrap().clone()
    }

    pub fn reject_volume(&self) {
        self.reject_volume.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RenderingControl for FakeRenderingControl {
    fn set_on_event(&self, handler: Option<EventHandler>) {
        if handler.is_none() {
            self.order.lock().unwrap().push("detach");
        }
        *self.handler.lock().unwrap() = handler;
    }

    async fn subscribe_services(&self, _auto_resubscribe: bool) -> Result<(), UpnpError> {
        self.order.lock().unwrap().push("subscribe");
        match self.subscribe {
            SubscribeOutcome::Ok => Ok(()),
            SubscribeOutcome::Rejected => Err(UpnpError::Response {
                url: "http://tv/event".to_string(),
                status: 412,
            }),
            SubscribeOutcome::Fail => Err(UpnpError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "malformed SID",
            ))),
        }
    }

    async fn unsubscribe_services(&self) -> Result<(), UpnpError> {
        self.order.lock().unwrap().push("unsubscribe");
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_volume_level(&self, volume: f32) -> Result<(), UpnpError> {
        if self.reject_volume.load(Ordering::SeqCst) {
            return Err(UpnpError::ActionResponse {
                action: "SetVolume",
                status: 501,
            });
        }
        self.volume_sets.lock().unwrap().push(volume);
        *self.volume.lock().unwrap() = Some(volume);
        Ok(())
    }

    fn volume_level(&self) -> Option<f32> {
        *self.volume.lock().unwrap()
    }

    fn is_volume_muted(&self) -> Option<bool> {
        *self.muted.lock().unwrap()
    }
}
