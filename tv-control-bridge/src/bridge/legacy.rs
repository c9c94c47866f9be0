//! Key-injection transport spoken by pre-2014 TVs on TCP port 55000.
//!
//! Every frame is `0x00` followed by two length-prefixed strings: an empty
//! application name and the payload. Strings carry a little-endian `u16`
//! length; text fields inside the payload are base64 encoded.

use super::{AppListCallback, Bridge, BridgeError, ReauthCallback, KEY_POWEROFF};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_PORT: u16 = 55000;

const ACCESS_GRANTED: [u8; 4] = [0x64, 0x00, 0x01, 0x00];
const ACCESS_DENIED: [u8; 4] = [0x64, 0x00, 0x00, 0x00];
const WAITING_FOR_USER: u8 = 0x0a;
const AUTH_CANCELLED: u8 = 0x65;

/// How this client introduces itself during the handshake. The TV shows
/// `name` in its "allow device" prompt.
#[derive(Debug, Clone)]
pub struct LegacyIdentity {
    pub name: String,
    pub description: String,
    pub id: String,
}

pub struct LegacyBridge {
    host: String,
    port: u16,
    identity: LegacyIdentity,
    timeout: Duration,
    reauth_callback: Mutex<Option<ReauthCallback>>,
}

#[derive(Debug, PartialEq, Eq)]
enum AuthResponse {
    Granted,
    Denied,
    Waiting,
    Unknown,
}

impl LegacyBridge {
    pub fn new(host: impl Into<String>, port: u16, identity: LegacyIdentity, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            identity,
            timeout,
            reauth_callback: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream, BridgeError> {
        let mut stream = self
            .bounded(TcpStream::connect((self.host.as_str(), self.port)))
            .await?
            .map_err(|source| self.connection_error(source))?;

        let packet = auth_packet(&self.identity);
        self.bounded(stream.write_all(&packet))
            .await?
            .map_err(|source| self.connection_error(source))?;

        loop {
            let response = self.read_response(&mut stream).await?;
            match classify_auth(&response) {
                AuthResponse::Granted => return Ok(stream),
                AuthResponse::Denied => return Err(BridgeError::AccessDenied),
                AuthResponse::Waiting => {
                    tracing::info!(host = %self.host, "waiting for the TV to allow this device");
                }
                AuthResponse::Unknown => {
                    return Err(BridgeError::Protocol(format!("{response:02x?}")));
                }
            }
        }
    }

    async fn read_response(&self, stream: &mut TcpStream) -> Result<Vec<u8>, BridgeError> {
        let mut header = [0u8; 3];
        self.read_exact(stream, &mut header).await?;
        let tv_name_len = u16::from_le_bytes([header[1], header[2]]) as usize;
        let mut tv_name = vec![0u8; tv_name_len];
        self.read_exact(stream, &mut tv_name).await?;

        let mut len = [0u8; 2];
        self.read_exact(stream, &mut len).await?;
        let mut response = vec![0u8; u16::from_le_bytes(len) as usize];
        self.read_exact(stream, &mut response).await?;
        Ok(response)
    }

    async fn read_exact(&self, stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), BridgeError> {
        self.bounded(stream.read_exact(buf))
            .await?
            .map(|_| ())
            .map_err(|source| self.connection_error(source))
    }

    async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output, BridgeError> {
        timeout(self.timeout, fut)
            .await
            .map_err(|_| BridgeError::Timeout(self.host.clone()))
    }

    fn connection_error(&self, source: std::io::Error) -> BridgeError {
        BridgeError::Connection {
            host: self.host.clone(),
            source,
        }
    }

    fn notify_access_denied(&self) {
        let callback = self
            .reauth_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    async fn deliver_keys(&self, keys: &[String]) -> Result<(), BridgeError> {
        let mut stream = self.connect().await?;
        for key in keys {
            self.bounded(stream.write_all(&key_packet(key)))
                .await?
                .map_err(|source| self.connection_error(source))?;
            let response = self.read_response(&mut stream).await?;
            if classify_auth(&response) == AuthResponse::Denied {
                return Err(BridgeError::AccessDenied);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Bridge for LegacyBridge {
    async fn is_on(&self) -> Result<bool, BridgeError> {
        match self.connect().await {
            Ok(_) => Ok(true),
            Err(BridgeError::AccessDenied) => {
                tracing::debug!(host = %self.host, "access denied while checking power state");
                self.notify_access_denied();
                Ok(false)
            }
            Err(BridgeError::Connection { .. }) | Err(BridgeError::Timeout(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn power_off(&self) -> Result<(), BridgeError> {
        self.send_keys(&[KEY_POWEROFF.to_string()]).await
    }

    async fn send_keys(&self, keys: &[String]) -> Result<(), BridgeError> {
        let result = self.deliver_keys(keys).await;
        if matches!(result, Err(BridgeError::AccessDenied)) {
            self.notify_access_denied();
        }
        result
    }

    async fn request_app_list(&self) -> Result<(), BridgeError> {
        // This transport has no application list.
        Ok(())
    }

    fn register_reauth_callback(&self, callback: ReauthCallback) {
        *self.reauth_callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    fn register_app_list_callback(&self, _callback: AppListCallback) {}
}

fn encode_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
}

fn encode_text(out: &mut Vec<u8>, text: &str) {
    encode_string(out, general_purpose::STANDARD.encode(text).as_bytes());
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x00];
    encode_string(&mut packet, b"");
    encode_string(&mut packet, payload);
    packet
}

fn auth_packet(identity: &LegacyIdentity) -> Vec<u8> {
    let mut payload = vec![0x64, 0x00];
    encode_text(&mut payload, &identity.description);
    encode_text(&mut payload, &identity.id);
    encode_text(&mut payload, &identity.name);
    frame(&payload)
}

fn key_packet(key: &str) -> Vec<u8> {
    let mut payload = vec![0x00, 0x00, 0x00];
    encode_text(&mut payload, key);
    frame(&payload)
}

fn classify_auth(response: &[u8]) -> AuthResponse {
    if response == ACCESS_GRANTED {
        AuthResponse::Granted
    } else if response == ACCESS_DENIED || response.first() == Some(&AUTH_CANCELLED) {
        AuthResponse::Denied
    } else if response.first() == Some(&WAITING_FOR_USER) {
        AuthResponse::Waiting
    } else {
        AuthResponse::Unknown
    }
}
