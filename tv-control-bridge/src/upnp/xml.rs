//! Just enough XML handling for device descriptions, GENA event bodies and
//! SOAP requests. TVs emit small, flat documents, so this scans text rather
//! than building a tree.

use super::{UpnpDevice, UpnpError};
use reqwest::Url;

const RENDERING_CONTROL: &str = "RenderingControl";

/// Volume and mute values carried by one event, on the Master channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenderingUpdate {
    pub volume: Option<u32>,
    pub muted: Option<bool>,
}

pub fn parse_device_description(location: &str, xml: &str) -> Result<UpnpDevice, UpnpError> {
    let base = element_text(xml, "URLBase")
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(location);
    let base = Url::parse(base).map_err(|err| UpnpError::InvalidDescription(err.to_string()))?;

    let service = blocks(xml, "service")
        .into_iter()
        .find(|block| {
            element_text(block, "serviceType")
                .map(|t| t.contains(RENDERING_CONTROL))
                .unwrap_or(false)
        })
        .ok_or_else(|| UpnpError::InvalidDescription("no RenderingControl service".to_string()))?;

    let field = |tag: &str| -> Result<String, UpnpError> {
        element_text(service, tag)
            .map(|v| v.trim().to_string())
            .ok_or_else(|| UpnpError::InvalidDescription(format!("service is missing {tag}")))
    };
    let resolve = |path: String| -> Result<String, UpnpError> {
        base.join(&path)
            .map(|u| u.to_string())
            .map_err(|err| UpnpError::InvalidDescription(err.to_string()))
    };

    Ok(UpnpDevice {
        location: location.to_string(),
        friendly_name: element_text(xml, "friendlyName").map(|n| unescape(n.trim())),
        service_type: field("serviceType")?,
        control_url: resolve(field("controlURL")?)?,
        event_sub_url: resolve(field("eventSubURL")?)?,
    })
}

/// Extracts Master-channel `Volume` and `Mute` from a GENA property set whose
/// `LastChange` variable holds an escaped event document.
pub fn parse_last_change(body: &str) -> RenderingUpdate {
    let Some(last_change) = element_text(body, "LastChange") else {
        return RenderingUpdate::default();
    };
    let event = unescape(last_change);

    let mut update = RenderingUpdate::default();
    for attrs in empty_elements(&event, "Volume") {
        if is_master(attrs) {
            update.volume = attribute(attrs, "val").and_then(|v| v.parse().ok());
        }
    }
    for attrs in empty_elements(&event, "Mute") {
        if is_master(attrs) {
            update.muted = attribute(attrs, "val").and_then(|v| match v {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            });
        }
    }
    update
}

pub fn set_volume_envelope(service_type: &str, volume: u32) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">"#,
            r#"<s:Body><u:SetVolume xmlns:u="{}">"#,
            "<InstanceID>0</InstanceID><Channel>Master</Channel>",
            "<DesiredVolume>{}</DesiredVolume>",
            "</u:SetVolume></s:Body></s:Envelope>"
        ),
        service_type, volume
    )
}

fn is_master(attrs: &str) -> bool {
    attribute(attrs, "channel").map_or(true, |c| c == "Master")
}

fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let start = open_tag_end(xml, tag, 0)?;
    let close = format!("</{tag}>");
    let len = xml[start..].find(&close)?;
    Some(&xml[start..start + len])
}

fn blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(start) = open_tag_end(xml, tag, pos) {
        let Some(len) = xml[start..].find(&close) else {
            break;
        };
        out.push(&xml[start..start + len]);
        pos = start + len + close.len();
    }
    out
}

/// Byte offset just past the `>` of the next `<tag>` or `<tag ...>` at or
/// after `from`.
fn open_tag_end(xml: &str, tag: &str, from: usize) -> Option<usize> {
    let needle = format!("<{tag}");
    let mut pos = from;
    while let Some(found) = xml[pos..].find(&needle) {
        let after = pos + found + needle.len();
        match xml[after..].chars().next() {
            Some('>') => return Some(after + 1),
            Some(c) if c.is_whitespace() => {
                let end = xml[after..].find('>')?;
                return Some(after + end + 1);
            }
            _ => pos = after,
        }
    }
    None
}

/// Attribute sections of every `<tag .../>` element.
fn empty_elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let needle = format!("<{tag} ");
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(found) = xml[pos..].find(&needle) {
        let start = pos + found + needle.len();
        let Some(end) = xml[start..].find('>') else {
            break;
        };
        out.push(xml[start..start + end].trim_end_matches('/'));
        pos = start + end;
    }
    out
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=\"");
    let mut pos = 0;
    while let Some(found) = attrs[pos..].find(&needle) {
        let at = pos + found;
        let boundary = at == 0 || attrs[..at].ends_with(char::is_whitespace);
        let start = at + needle.len();
        let end = attrs[start..].find('"')?;
        if boundary {
            return Some(&attrs[start..start + end]);
        }
        pos = start + end;
    }
    None
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
