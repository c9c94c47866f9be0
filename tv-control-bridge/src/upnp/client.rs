use super::notify::AxumNotifyServer;
use super::xml::{parse_device_description, parse_last_change, set_volume_envelope};
use super::{
    EventHandler, NotifyServer, NotifySink, RenderingControl, UpnpDevice, UpnpError, UpnpFactory,
};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, Method, Url};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIPTION_TIMEOUT_SECS: u64 = 1800;
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(30);
const MAX_VOLUME: f32 = 100.0;

/// Builds rendering-control handles that talk GENA and SOAP over HTTP.
#[derive(Clone)]
pub struct HttpUpnpFactory {
    http: Client,
}

impl HttpUpnpFactory {
    pub fn new() -> Result<Self, UpnpError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl UpnpFactory for HttpUpnpFactory {
    async fn create_device(&self, location: &str) -> Result<UpnpDevice, UpnpError> {
        let resp = self
            .http
            .get(location)
            .send()
            .await
            .map_err(|err| classify_send(location, err))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpnpError::Response {
                url: location.to_string(),
                status: status.as_u16(),
            });
        }
        let body = resp.text().await?;
        parse_device_description(location, &body)
    }

    async fn local_ip(&self, location: &str) -> Option<IpAddr> {
        let url = Url::parse(location).ok()?;
        let host = url.host_str()?.trim_matches(|c| c == '[' || c == ']').to_string();
        let port = url.port_or_known_default()?;
        let remote: IpAddr = host.parse().ok()?;
        let bind: SocketAddr = if remote.is_ipv6() {
            "[::]:0".parse().ok()?
        } else {
            "0.0.0.0:0".parse().ok()?
        };
        // Connecting a UDP socket sends nothing; it only asks the OS which
        // interface routes to the TV.
        let socket = UdpSocket::bind(bind).await.ok()?;
        socket.connect((remote, port)).await.ok()?;
        socket.local_addr().ok().map(|addr| addr.ip())
    }

    fn notify_server(&self, source: SocketAddr) -> Box<dyn NotifyServer> {
        Box::new(AxumNotifyServer::new(source))
    }

    fn rendering_control(
        &self,
        device: UpnpDevice,
        server: &dyn NotifyServer,
    ) -> Arc<dyn RenderingControl> {
        Arc::new(DmrRenderingControl::new(
            self.http.clone(),
            device,
            server.callback_url(),
            &server.sink(),
        ))
    }
}

#[derive(Debug, Default)]
struct RenderingState {
    volume: Option<u32>,
    muted: Option<bool>,
}

/// Rendering-control service of one TV. Volume and mute are whatever the
/// last pushed event said; nothing here polls the device.
pub struct DmrRenderingControl {
    http: Client,
    device: UpnpDevice,
    callback_url: Option<String>,
    state: Arc<Mutex<RenderingState>>,
    on_event: Arc<Mutex<Option<EventHandler>>>,
    sid: Arc<Mutex<Option<String>>>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl DmrRenderingControl {
    pub fn new(
        http: Client,
        device: UpnpDevice,
        callback_url: Option<String>,
        sink: &NotifySink,
    ) -> Self {
        let state = Arc::new(Mutex::new(RenderingState::default()));
        let on_event: Arc<Mutex<Option<EventHandler>>> = Arc::new(Mutex::new(None));

        let event_state = state.clone();
        let event_handler = on_event.clone();
        sink.set_consumer(Some(Arc::new(move |body: &str| {
            let update = parse_last_change(body);
            {
                let mut s = event_state.lock().unwrap_or_else(|e| e.into_inner());
                if update.volume.is_some() {
                    s.volume = update.volume;
                }
                if update.muted.is_some() {
                    s.muted = update.muted;
                }
            }
            let handler = event_handler
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(handler) = handler {
                handler();
            }
        })));

        Self {
            http,
            device,
            callback_url,
            state,
            on_event,
            sid: Arc::new(Mutex::new(None)),
            renewal: Mutex::new(None),
        }
    }

    fn stop_renewal(&self) {
        if let Some(task) = self
            .renewal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    fn spawn_renewal(&self, callback: String, initial: Duration) {
        let http = self.http.clone();
        let url = self.device.event_sub_url.clone();
        let sid_slot = self.sid.clone();
        let task = tokio::spawn(async move {
            let mut timeout = initial;
            loop {
                tokio::time::sleep(renew_after(timeout)).await;
                let current = sid_slot.lock().unwrap_or_else(|e| e.into_inner()).clone();
                let Some(current) = current else {
                    break;
                };
                let renewed = match gena_subscribe(&http, &url, Subscription::Renew(&current)).await {
                    Ok(renewed) => Ok(renewed),
                    Err(err) => {
                        tracing::debug!(error = %err, "subscription renewal failed, subscribing again");
                        gena_subscribe(&http, &url, Subscription::New(&callback)).await
                    }
                };
                match renewed {
                    Ok((sid, granted)) => {
                        *sid_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(sid);
                        timeout = granted;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, url = %url, "could not keep event subscription alive");
                        timeout = MIN_RENEW_INTERVAL * 2;
                    }
                }
            }
        });
        *self.renewal.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }
}

impl Drop for DmrRenderingControl {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

#[async_trait]
impl RenderingControl for DmrRenderingControl {
    fn set_on_event(&self, handler: Option<EventHandler>) {
        *self.on_event.lock().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    async fn subscribe_services(&self, auto_resubscribe: bool) -> Result<(), UpnpError> {
        let callback = self.callback_url.clone().ok_or_else(|| {
            UpnpError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "notify server is not running",
            ))
        })?;
        let (sid, granted) = gena_subscribe(
            &self.http,
            &self.device.event_sub_url,
            Subscription::New(&callback),
        )
        .await?;
        tracing::debug!(sid = %sid, timeout_s = granted.as_secs(), "subscribed to rendering control");
        *self.sid.lock().unwrap_or_else(|e| e.into_inner()) = Some(sid);
        if auto_resubscribe {
            self.stop_renewal();
            self.spawn_renewal(callback, granted);
        }
        Ok(())
    }

    async fn unsubscribe_services(&self) -> Result<(), UpnpError> {
        self.stop_renewal();
        let sid = self.sid.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(sid) = sid else {
            return Ok(());
        };
        let url = &self.device.event_sub_url;
        let resp = self
            .http
            .request(gena_method("UNSUBSCRIBE")?, url)
            .header("SID", sid)
            .send()
            .await
            .map_err(|err| classify_send(url, err))?;
        if !resp.status().is_success() {
            return Err(UpnpError::Response {
                url: url.clone(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn set_volume_level(&self, volume: f32) -> Result<(), UpnpError> {
        let desired = (volume.clamp(0.0, 1.0) * MAX_VOLUME).round() as u32;
        let url = &self.device.control_url;
        let resp = self
            .http
            .post(url)
            .header(CONTENT_TYPE, r#"text/xml; charset="utf-8""#)
            .header(
                "SOAPACTION",
                format!("\"{}#SetVolume\"", self.device.service_type),
            )
            .body(set_volume_envelope(&self.device.service_type, desired))
            .send()
            .await
            .map_err(|err| classify_send(url, err))?;
        if !resp.status().is_success() {
            return Err(UpnpError::ActionResponse {
                action: "SetVolume",
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    fn volume_level(&self) -> Option<f32> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .volume
            .map(|v| (v as f32 / MAX_VOLUME).clamp(0.0, 1.0))
    }

    fn is_volume_muted(&self) -> Option<bool> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).muted
    }
}

enum Subscription<'a> {
    New(&'a str),
    Renew(&'a str),
}

async fn gena_subscribe(
    http: &Client,
    url: &str,
    subscription: Subscription<'_>,
) -> Result<(String, Duration), UpnpError> {
    let mut req = http
        .request(gena_method("SUBSCRIBE")?, url)
        .header("TIMEOUT", format!("Second-{SUBSCRIPTION_TIMEOUT_SECS}"));
    req = match subscription {
        Subscription::New(callback) => req
            .header("CALLBACK", format!("<{callback}>"))
            .header("NT", "upnp:event"),
        Subscription::Renew(sid) => req.header("SID", sid),
    };

    let resp = req.send().await.map_err(|err| classify_send(url, err))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(UpnpError::Response {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let sid = resp
        .headers()
        .get("SID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| UpnpError::InvalidDescription("subscription response without SID".to_string()))?;
    let granted = resp
        .headers()
        .get("TIMEOUT")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_timeout)
        .unwrap_or(Duration::from_secs(SUBSCRIPTION_TIMEOUT_SECS));
    Ok((sid, granted))
}

fn gena_method(name: &'static str) -> Result<Method, UpnpError> {
    Method::from_bytes(name.as_bytes()).map_err(|err| {
        UpnpError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
    })
}

fn parse_timeout(value: &str) -> Option<Duration> {
    value
        .trim()
        .strip_prefix("Second-")
        .and_then(|secs| secs.parse().ok())
        .map(Duration::from_secs)
}

fn renew_after(granted: Duration) -> Duration {
    (granted / 2).max(MIN_RENEW_INTERVAL)
}

fn classify_send(url: &str, err: reqwest::Error) -> UpnpError {
    if err.is_connect() || err.is_timeout() {
        UpnpError::Connection {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        UpnpError::Http(err)
    }
}
